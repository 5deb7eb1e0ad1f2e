//! Middleware entry point
//!
//! [`InstrumentMiddleware`] ties the configuration, the instrumentation
//! gateway and the HTML rewriter together. It is cheap to clone and meant to
//! be built once per process; each response gets its own
//! [`InterceptedResponse`] via [`InstrumentMiddleware::install`].

use crate::config::InstrumentConfig;
use crate::digest_cache::{DigestCache, MemoryDigestCache};
use crate::error::Result;
use crate::gateway::{InstrumentationGateway, Instrumenter};
use crate::interceptor::{InterceptedResponse, PendingResponse, ResponseSink};
use crate::metrics::InstrumentMetrics;
use crate::models::ContentKind;
use crate::options::TransformOptions;
use crate::rewriter::HtmlRewriter;
use bytes::Bytes;
use http::HeaderValue;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Response-instrumenting middleware
#[derive(Clone)]
pub struct InstrumentMiddleware {
    config: Arc<InstrumentConfig>,
    cache_control: HeaderValue,
    gateway: InstrumentationGateway,
    rewriter: HtmlRewriter,
    metrics: Arc<InstrumentMetrics>,
}

impl InstrumentMiddleware {
    /// Create a middleware with a fresh in-memory digest cache
    ///
    /// # Arguments
    /// * `config` - Validated middleware configuration
    /// * `instrumenter` - The external code-instrumentation transform
    pub fn new(config: Arc<InstrumentConfig>, instrumenter: Arc<dyn Instrumenter>) -> Result<Self> {
        Self::with_cache(
            config,
            instrumenter,
            Arc::new(MemoryDigestCache::new()),
            Arc::new(InstrumentMetrics::new()),
        )
    }

    /// Create a middleware sharing an existing cache and metrics collector
    pub fn with_cache(
        config: Arc<InstrumentConfig>,
        instrumenter: Arc<dyn Instrumenter>,
        cache: Arc<dyn DigestCache>,
        metrics: Arc<InstrumentMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        let cache_control = config.cache_control_value()?;
        let gateway = InstrumentationGateway::new(instrumenter, cache, Arc::clone(&metrics));
        let rewriter = HtmlRewriter::new(gateway.clone());

        info!(
            "Instrumentation middleware ready: javascript={:?}, html={:?}",
            config.javascript_content_type, config.html_content_type
        );

        Ok(InstrumentMiddleware {
            config,
            cache_control,
            gateway,
            rewriter,
            metrics,
        })
    }

    /// Get a reference to the configuration
    pub fn config(&self) -> &InstrumentConfig {
        &self.config
    }

    /// Get a reference to the metrics collector
    pub fn metrics(&self) -> &InstrumentMetrics {
        &self.metrics
    }

    /// Get a cloned Arc to the metrics collector
    pub fn metrics_arc(&self) -> Arc<InstrumentMetrics> {
        Arc::clone(&self.metrics)
    }

    /// The instrumentation gateway shared by both content paths
    pub fn gateway(&self) -> &InstrumentationGateway {
        &self.gateway
    }

    /// Cache-Control value set on every intercepted response
    pub fn cache_control(&self) -> &HeaderValue {
        &self.cache_control
    }

    /// Start intercepting a response
    ///
    /// Sets Cache-Control on `sink` immediately and returns the buffering
    /// wrapper the handler should write into instead.
    pub fn install<S: ResponseSink>(&self, request_path: &str, sink: S) -> InterceptedResponse<S> {
        InterceptedResponse::new(self.clone(), request_path, sink)
    }

    /// Decide the content path for a declared content type
    pub fn classify(&self, content_type: Option<&str>) -> ContentKind {
        ContentKind::classify(
            content_type,
            &self.config.javascript_content_type,
            &self.config.html_content_type,
        )
    }

    /// Options for the response to `request_path`
    ///
    /// Explicitly configured options override the request-derived `path` and
    /// the `include_prefix = false` default.
    pub fn options_for(&self, request_path: &str) -> TransformOptions {
        TransformOptions::merge(&TransformOptions::for_request(request_path), &self.config.transform)
    }

    /// Produce the chunks to transmit for a finished response
    ///
    /// Passthrough responses return their chunks unchanged. JavaScript and
    /// HTML responses are concatenated, rewritten, and returned as a single
    /// chunk. An instrumenter failure is returned as-is and no body is
    /// produced.
    pub fn finish(&self, kind: ContentKind, pending: PendingResponse) -> Result<Vec<Bytes>> {
        let (request_path, chunks) = pending.into_parts();
        debug!(
            "Finalizing {} response for path={} ({} chunks, {} bytes)",
            kind.as_str(),
            request_path,
            chunks.len(),
            chunks.total_bytes()
        );

        let output = match kind {
            ContentKind::Passthrough => chunks.into_chunks(),
            ContentKind::JavaScript | ContentKind::Html => {
                let body = chunks.concat();
                let options = self.options_for(&request_path);
                vec![self.transform_body(kind, &body, &options)?]
            }
        };

        self.metrics.record_response(kind);
        Ok(output)
    }

    /// Rewrite a complete body according to `kind`
    pub fn transform_body(
        &self,
        kind: ContentKind,
        body: &[u8],
        options: &TransformOptions,
    ) -> Result<Bytes> {
        let source = decode_body(body, options.path_or_default());

        let rewritten = match kind {
            ContentKind::JavaScript => {
                let instrumented = self.gateway.instrument(&source, options)?;
                Bytes::copy_from_slice(instrumented.as_bytes())
            }
            ContentKind::Html => Bytes::from(self.rewriter.rewrite(&source, options)?),
            ContentKind::Passthrough => Bytes::copy_from_slice(body),
        };

        debug!(
            "Rewrote {} body for path={}: {} -> {} bytes",
            kind.as_str(),
            options.path_or_default(),
            body.len(),
            rewritten.len()
        );
        Ok(rewritten)
    }
}

/// Decode a response body as UTF-8, replacing invalid sequences
fn decode_body<'a>(body: &'a [u8], path: &str) -> Cow<'a, str> {
    let text = String::from_utf8_lossy(body);
    if let Cow::Owned(_) = text {
        warn!(
            "Response body for path={} is not valid UTF-8; invalid bytes replaced",
            path
        );
    }
    text
}
