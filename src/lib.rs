//! Pingora Instrument
//!
//! Response-rewriting middleware that instruments the JavaScript an HTTP
//! server sends to browsers, plus a Pingora reverse proxy that applies it in
//! front of any upstream.
//!
//! # Overview
//!
//! Every response the middleware sees is buffered in full and marked
//! uncacheable. On finalize the body is classified by its Content-Type:
//!
//! - **JavaScript** bodies are passed through the external instrumenter.
//! - **HTML** bodies have each inline `<script>` body instrumented in place,
//!   with line numbers preserved, and get a bootstrap script prepended.
//! - **Everything else** is forwarded unchanged.
//!
//! Instrumenter results are memoized in a process-wide digest cache keyed by
//! the options and the source text.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use pingora_instrument::{CommandInstrumenter, InstrumentConfig, InstrumentMiddleware};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = InstrumentConfig::from_file("pingora_instrument.yaml")?;
//! let instrumenter = CommandInstrumenter::new("node", vec!["instrument.js".to_string()]);
//! let middleware = InstrumentMiddleware::new(Arc::new(config), Arc::new(instrumenter))?;
//!
//! let stats = middleware.metrics().get_stats();
//! println!("Responses: {}", stats.total_responses);
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`InstrumentMiddleware`]: entry point; installs interception on a response
//! - [`InterceptedResponse`]: buffers writes and rewrites on finalize
//! - [`HtmlRewriter`]: instruments inline scripts and injects the preamble
//! - [`scan_script_regions`]: finds inline script bodies
//! - [`InstrumentationGateway`]: cached access to the [`Instrumenter`]
//! - [`MemoryDigestCache`]: SHA-256 keyed memo of instrumenter output
//! - [`InstrumentProxy`]: Pingora `ProxyHttp` integration
//!
//! # Configuration
//!
//! ```yaml
//! upstream_address: "127.0.0.1:8080"
//! listen_address: "0.0.0.0:6188"
//! javascript_content_type: "application/javascript"
//! html_content_type: "text/html"
//! instrumenter_command: ["node", "instrument.js"]
//! transform:
//!   include_prefix: false
//! metrics_endpoint:
//!   enabled: true
//!   address: "127.0.0.1:9090"
//! ```

pub mod command;
pub mod config;
pub mod digest_cache;
pub mod error;
pub mod gateway;
pub mod instrument_proxy;
pub mod interceptor;
pub mod metrics;
pub mod metrics_endpoint;
pub mod middleware;
pub mod models;
pub mod options;
pub mod rewriter;
pub mod scanner;

// Re-export commonly used types
pub use command::CommandInstrumenter;
pub use config::{InstrumentConfig, MetricsEndpointConfig};
pub use digest_cache::{CacheStats, DigestCache, Fingerprint, MemoryDigestCache};
pub use error::{InstrumentError, Result};
pub use gateway::{InstrumentationGateway, Instrumenter};
pub use instrument_proxy::{InstrumentContext, InstrumentProxy};
pub use interceptor::{BufferedChunks, InterceptedResponse, PendingResponse, ResponseSink};
pub use metrics::{InstrumentMetrics, MetricsSnapshot};
pub use metrics_endpoint::MetricsEndpoint;
pub use middleware::InstrumentMiddleware;
pub use models::{ContentKind, ScriptRegion};
pub use options::{unescape_path, TransformOptions};
pub use rewriter::HtmlRewriter;
pub use scanner::scan_script_regions;
