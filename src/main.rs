//! Pingora Instrument Server
//!
//! Loads configuration, sets up logging, and starts the instrumenting proxy.

use anyhow::{anyhow, Context};
use pingora::prelude::*;
use pingora::proxy::http_proxy_service;
use pingora_instrument::{
    CommandInstrumenter, InstrumentConfig, InstrumentMiddleware, InstrumentProxy, MetricsEndpoint,
};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Main entry point
///
/// # Usage
/// ```bash
/// # Start with default config (pingora_instrument.yaml)
/// pingora-instrument
///
/// # Start with custom config
/// pingora-instrument /path/to/config.yaml
/// ```
fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting Pingora Instrument Server");

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "pingora_instrument.yaml".to_string());

    info!("Loading configuration from: {}", config_path);

    let config = InstrumentConfig::from_file(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path))?;

    info!("Configuration loaded successfully");
    info!("  - Listen address: {}", config.listen_address);
    info!("  - Upstream address: {}", config.upstream_address);
    info!("  - JavaScript content type: {}", config.javascript_content_type);
    info!("  - HTML content type: {}", config.html_content_type);

    let command = config
        .instrumenter_command
        .as_deref()
        .ok_or_else(|| anyhow!("instrumenter_command is required to run the server"))?;
    let instrumenter = Arc::new(CommandInstrumenter::from_command_line(command)?);
    info!("  - Instrumenter: {:?}", command);

    let listen_address = config.listen_address.clone();
    let metrics_endpoint = config.metrics_endpoint.clone();

    let middleware = InstrumentMiddleware::new(Arc::new(config), instrumenter)?;

    if let Some(endpoint) = metrics_endpoint.filter(|endpoint| endpoint.enabled) {
        let addr: SocketAddr = endpoint.address.parse()?;
        let metrics = middleware.metrics_arc();

        // The proxy server owns its runtimes; the endpoint gets its own
        std::thread::Builder::new()
            .name("metrics-endpoint".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("Failed to start metrics runtime: {}", e);
                        return;
                    }
                };
                if let Err(e) = runtime.block_on(MetricsEndpoint::new(metrics, addr).start()) {
                    error!("Metrics endpoint error: {}", e);
                }
            })?;
    } else {
        warn!("Metrics endpoint disabled");
    }

    let proxy = InstrumentProxy::new(middleware);

    let mut server = Server::new(None).map_err(|e| anyhow!("failed to create server: {}", e))?;
    server.bootstrap();

    let mut proxy_service = http_proxy_service(&server.configuration, proxy);
    proxy_service.add_tcp(&listen_address);

    info!("Instrumenting proxy listening on http://{}", listen_address);

    server.add_service(proxy_service);
    server.run_forever()
}
