#![allow(dead_code, unused_imports)]

mod http_utils;
mod logging;
mod proxy_client;
mod upstream;

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use anyhow::Result;

use fanout_proxy::{
    cli::LogFormat,
    proxy::{AppContext, ProxyServer, cache::CacheRegistry, upstream::TcpConnector},
    settings::Settings,
};

pub use http_utils::*;
pub use logging::LogCapture;
pub use proxy_client::ProxyClient;
pub use upstream::{MockUpstream, UpstreamScript};

pub fn default_test_settings() -> Settings {
    let mut settings = Settings::with_listen(SocketAddr::from(([127, 0, 0, 1], 0)));
    settings.workers = 2;
    settings.log = LogFormat::Text;
    settings.upstream_connect_timeout = 1;
    settings.upstream_io_timeout = 2;
    settings
}

/// A proxy serving on an ephemeral port from background threads.
///
/// The threads run until the test process exits.
pub struct ProxyHarness {
    pub addr: SocketAddr,
    pub registry: CacheRegistry,
}

impl ProxyHarness {
    pub fn spawn() -> Result<Self> {
        Self::spawn_with(|_| {})
    }

    pub fn spawn_with(configure: impl FnOnce(&mut Settings)) -> Result<Self> {
        let mut settings = default_test_settings();
        configure(&mut settings);
        settings.validate()?;

        let connector = Arc::new(TcpConnector);
        let app = AppContext::new(Arc::new(settings), CacheRegistry::new(), connector);
        let server = ProxyServer::bind(app)?;
        let addr = server.local_addr();
        let registry = server.registry();
        thread::Builder::new()
            .name("proxy-harness".to_string())
            .spawn(move || {
                if let Err(err) = server.run() {
                    eprintln!("proxy harness stopped: {err:?}");
                }
            })?;
        Ok(Self { addr, registry })
    }

    pub async fn client(&self) -> Result<ProxyClient> {
        ProxyClient::connect(self.addr).await
    }

    /// Issue one request on a fresh connection and read until the proxy closes it.
    pub async fn fetch(&self, request: &str) -> Result<Vec<u8>> {
        let mut client = self.client().await?;
        client.send(request).await?;
        client.read_to_end().await
    }
}

pub fn get_request(upstream: SocketAddr, path: &str) -> String {
    format!("GET http://{upstream}{path} HTTP/1.1\r\nHost: {upstream}\r\nAccept: */*\r\n\r\n")
}

pub fn get_key(upstream: SocketAddr, path: &str) -> String {
    format!("GET::http://{upstream}{path}")
}
