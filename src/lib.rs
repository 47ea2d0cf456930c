pub mod cli;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod settings;

use std::sync::Arc;

use anyhow::Result;

use crate::{
    proxy::{cache::CacheRegistry, upstream::TcpConnector},
    settings::Settings,
};

pub fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    if let Some(addr) = settings.metrics_listen {
        let bound = metrics::spawn_server(addr, "/metrics".to_string())?;
        tracing::info!(address = %bound, "metrics endpoint started");
    }

    let connector = Arc::new(TcpConnector);
    let app = proxy::AppContext::new(settings, CacheRegistry::new(), connector);
    proxy::run(app)
}
