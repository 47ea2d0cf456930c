pub mod cache;
pub mod headers;
pub mod http;
pub mod listener;
pub mod request;
mod resolver;
pub mod upstream;
pub mod worker;

use std::net::{SocketAddr, TcpListener};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{error, info};

use crate::settings::Settings;
use cache::CacheRegistry;
use upstream::UpstreamConnector;
use worker::Worker;

#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub registry: CacheRegistry,
    pub connector: Arc<dyn UpstreamConnector>,
}

impl AppContext {
    pub fn new(
        settings: Arc<Settings>,
        registry: CacheRegistry,
        connector: Arc<dyn UpstreamConnector>,
    ) -> Self {
        Self {
            settings,
            registry,
            connector,
        }
    }
}

/// A bound proxy that has not started serving yet.
pub struct ProxyServer {
    app: AppContext,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ProxyServer {
    pub fn bind(app: AppContext) -> Result<Self> {
        let bind_addr = app.settings.listen;
        let listener = TcpListener::bind(bind_addr)
            .with_context(|| format!("failed to bind listener on {}", bind_addr))?;
        let local_addr = listener.local_addr().unwrap_or(bind_addr);
        Ok(Self {
            app,
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> CacheRegistry {
        self.app.registry.clone()
    }

    /// Start the workers and the accept loop, then block until one of them
    /// stops. Any stop is an error.
    pub fn run(self) -> Result<()> {
        let Self { app, listener, .. } = self;
        let (exit_tx, exit_rx) = crossbeam_channel::unbounded::<(String, Result<()>)>();

        let mut handles = Vec::with_capacity(app.settings.workers);
        for id in 0..app.settings.workers {
            let (worker, handle) = Worker::new(id, app.clone())?;
            handles.push(handle);
            spawn_supervised(format!("worker-{id}"), exit_tx.clone(), move || worker.run())?;
        }
        spawn_supervised("listener".to_string(), exit_tx.clone(), move || {
            listener::accept_loop(listener, handles)
        })?;
        drop(exit_tx);

        match exit_rx.recv() {
            Ok((name, Ok(()))) => bail!("{name} thread exited unexpectedly"),
            Ok((name, Err(err))) => {
                error!(thread = %name, error = ?err, "fatal proxy error");
                Err(err.context(format!("{name} thread failed")))
            }
            Err(_) => bail!("all proxy threads exited"),
        }
    }
}

fn spawn_supervised<F>(
    name: String,
    exit_tx: crossbeam_channel::Sender<(String, Result<()>)>,
    body: F,
) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let label = name.clone();
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let result = catch_unwind(AssertUnwindSafe(body))
                .unwrap_or_else(|_| Err(anyhow!("{name} thread panicked")));
            let _ = exit_tx.send((name, result));
        })
        .with_context(|| format!("failed to spawn {label} thread"))?;
    Ok(())
}

pub fn run(app: AppContext) -> Result<()> {
    let server = ProxyServer::bind(app)?;
    info!(address = %server.local_addr(), "proxy bound");
    server.run()
}
