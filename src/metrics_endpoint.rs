//! Metrics HTTP Endpoint
//!
//! Serves the middleware counters in Prometheus text format on a separate
//! port, next to a trivial health check.

use crate::metrics::{InstrumentMetrics, MetricsSnapshot};
use http::header::{HeaderValue, CONTENT_TYPE};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Metrics endpoint server
pub struct MetricsEndpoint {
    metrics: Arc<InstrumentMetrics>,
    addr: SocketAddr,
}

impl MetricsEndpoint {
    /// Create a new metrics endpoint
    ///
    /// # Arguments
    /// * `metrics` - Shared metrics collector
    /// * `addr` - Address to bind the HTTP server to
    pub fn new(metrics: Arc<InstrumentMetrics>, addr: SocketAddr) -> Self {
        Self { metrics, addr }
    }

    /// Start the metrics endpoint server
    ///
    /// Serves `/metrics`, `/health` and `/` until the process exits.
    pub async fn start(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Metrics endpoint listening on http://{}", self.addr);
        info!("Metrics available at http://{}/metrics", self.addr);

        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let metrics = Arc::clone(&self.metrics);

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let metrics = Arc::clone(&metrics);
                    async move { handle_request(req, metrics).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving connection: {:?}", err);
                }
            });
        }
    }
}

/// Handle incoming HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<InstrumentMetrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(route(req.uri().path(), &metrics))
}

fn route(path: &str, metrics: &InstrumentMetrics) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(&metrics.get_stats()),
        ),
        "/health" => text_response(
            StatusCode::OK,
            "application/json",
            r#"{"status":"healthy"}"#.to_string(),
        ),
        "/" => text_response(
            StatusCode::OK,
            "text/plain; charset=utf-8",
            "pingora-instrument metrics\n\n/metrics  Prometheus format metrics\n/health   Health check\n"
                .to_string(),
        ),
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "404 Not Found".to_string()),
    }
}

fn text_response(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Append one metric with its HELP and TYPE lines
fn push_metric(output: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("# HELP {} {}\n", name, help));
    output.push_str(&format!("# TYPE {} {}\n", name, kind));
    output.push_str(&format!("{} {}\n\n", name, value));
}

/// Format metrics in Prometheus exposition format
fn format_prometheus_metrics(snapshot: &MetricsSnapshot) -> String {
    let mut output = String::new();

    // Response metrics
    push_metric(
        &mut output,
        "pingora_instrument_responses_total",
        "counter",
        "Total number of responses finalized",
        snapshot.total_responses,
    );
    push_metric(
        &mut output,
        "pingora_instrument_javascript_responses_total",
        "counter",
        "Responses rewritten as JavaScript",
        snapshot.javascript_responses,
    );
    push_metric(
        &mut output,
        "pingora_instrument_html_responses_total",
        "counter",
        "Responses rewritten as HTML",
        snapshot.html_responses,
    );
    push_metric(
        &mut output,
        "pingora_instrument_passthrough_responses_total",
        "counter",
        "Responses forwarded without rewriting",
        snapshot.passthrough_responses,
    );
    push_metric(
        &mut output,
        "pingora_instrument_scripts_rewritten_total",
        "counter",
        "Inline script regions instrumented",
        snapshot.scripts_rewritten,
    );

    // Instrumenter metrics
    push_metric(
        &mut output,
        "pingora_instrument_cache_hits_total",
        "counter",
        "Instrumenter results served from the digest cache",
        snapshot.gateway_cache_hits,
    );
    push_metric(
        &mut output,
        "pingora_instrument_cache_misses_total",
        "counter",
        "Instrumenter invocations",
        snapshot.gateway_cache_misses,
    );
    push_metric(
        &mut output,
        "pingora_instrument_cache_hit_rate",
        "gauge",
        "Digest cache hit rate percentage",
        format!("{:.2}", snapshot.cache_hit_rate()),
    );
    push_metric(
        &mut output,
        "pingora_instrument_transform_failures_total",
        "counter",
        "Instrumenter failures",
        snapshot.transform_failures,
    );

    // Byte metrics
    push_metric(
        &mut output,
        "pingora_instrument_bytes_buffered_total",
        "counter",
        "Body bytes written by handlers",
        snapshot.bytes_buffered,
    );
    push_metric(
        &mut output,
        "pingora_instrument_bytes_emitted_total",
        "counter",
        "Body bytes transmitted after rewriting",
        snapshot.bytes_emitted,
    );

    // Latency metrics (in milliseconds)
    push_metric(
        &mut output,
        "pingora_instrument_transform_duration_ms_avg",
        "gauge",
        "Average instrumenter invocation time in milliseconds",
        format!("{:.2}", snapshot.avg_transform_duration_ms()),
    );
    push_metric(
        &mut output,
        "pingora_instrument_finalize_duration_ms_avg",
        "gauge",
        "Average finalize time in milliseconds",
        format!("{:.2}", snapshot.avg_finalize_duration_ms()),
    );

    output
}
