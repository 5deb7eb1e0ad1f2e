//! Instrumenting reverse proxy built on Pingora
//!
//! [`InstrumentProxy`] puts the middleware in front of an upstream server.
//! JavaScript and HTML responses are held back chunk by chunk and released as
//! one rewritten chunk at end of stream; everything else streams through
//! untouched.
//!
//! ```text
//! Client <──── single rewritten chunk ────┐
//!                                          │
//!                                    ┌─────┴─────┐
//!                                    │   Proxy   │  buffer + instrument
//!                                    └─────┬─────┘
//!                                          │ identity-encoded body
//!                                          ↓
//!                                   Upstream Server
//! ```

use crate::error::InstrumentError;
use crate::interceptor::PendingResponse;
use crate::middleware::InstrumentMiddleware;
use crate::models::ContentKind;
use crate::InstrumentConfig;
use async_trait::async_trait;
use bytes::Bytes;
use pingora::http::ResponseHeader;
use pingora::prelude::*;
use pingora_proxy::{ProxyHttp, Session};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Reverse proxy applying the instrumentation middleware to every response
pub struct InstrumentProxy {
    middleware: InstrumentMiddleware,
}

/// Per-request state
#[derive(Debug, Default)]
pub struct InstrumentContext {
    /// Raw request path and query
    url: String,

    /// Content path decided from the upstream Content-Type
    kind: Option<ContentKind>,

    /// Buffered body of a transformed response
    pending: Option<PendingResponse>,

    /// Bytes received from upstream
    bytes_received: u64,

    /// Bytes handed to the client
    bytes_sent: u64,

    /// Whether the instrumenter failed for this response
    transform_failed: bool,
}

impl InstrumentProxy {
    /// Create a new InstrumentProxy
    pub fn new(middleware: InstrumentMiddleware) -> Self {
        info!("Creating InstrumentProxy");
        info!("  Upstream: {}", middleware.config().upstream_address);
        info!("  Cache-Control: {}", middleware.config().cache_control);

        InstrumentProxy { middleware }
    }

    /// Get a reference to the middleware
    pub fn middleware(&self) -> &InstrumentMiddleware {
        &self.middleware
    }

    /// Get a reference to the configuration
    pub fn config(&self) -> &InstrumentConfig {
        self.middleware.config()
    }

    /// Apply the middleware's header changes to an upstream response
    ///
    /// Returns the content path chosen for the body. Responses that carry no
    /// body (1xx, 204, 304 and replies to HEAD) are always passed through.
    /// A rewritten response loses its Content-Length; Pingora then frames it
    /// itself.
    pub fn prepare_response_headers(
        &self,
        request_method: &http::Method,
        upstream_response: &mut ResponseHeader,
    ) -> Result<ContentKind> {
        upstream_response
            .insert_header(http::header::CACHE_CONTROL, self.middleware.cache_control().clone())
            .map_err(|e| {
                warn!("Failed to insert Cache-Control header: {}", e);
                Error::new(ErrorType::InternalError)
            })?;

        if !response_has_body(request_method, upstream_response.status) {
            debug!(
                "No body expected for {} response with status {}",
                request_method, upstream_response.status
            );
            return Ok(ContentKind::Passthrough);
        }

        let content_type = upstream_response
            .headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok());
        let kind = self.middleware.classify(content_type);

        if kind.is_transformed() {
            upstream_response.remove_header(&http::header::CONTENT_LENGTH);
        }

        Ok(kind)
    }
}

/// Whether a response to `method` with `status` can carry a body
pub fn response_has_body(method: &http::Method, status: http::StatusCode) -> bool {
    !(*method == http::Method::HEAD
        || status.is_informational()
        || status == http::StatusCode::NO_CONTENT
        || status == http::StatusCode::NOT_MODIFIED)
}

#[async_trait]
impl ProxyHttp for InstrumentProxy {
    type CTX = InstrumentContext;

    fn new_ctx(&self) -> Self::CTX {
        InstrumentContext::default()
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let (host, port) = self.config().upstream_host_port();
        debug!("Upstream peer configured: {}:{}", host, port);

        let peer = Box::new(HttpPeer::new((host.as_str(), port), false, host.clone()));
        Ok(peer)
    }

    /// Record the request path and ask upstream for an identity-encoded body
    async fn upstream_request_filter(
        &self,
        session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let uri = &session.req_header().uri;
        let url = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| uri.path().to_string());

        info!("Processing request: {} {}", session.req_header().method, url);
        ctx.set_url(url);

        // Rewriting needs the plain body
        upstream_request.remove_header(&http::header::ACCEPT_ENCODING);

        Ok(())
    }

    fn upstream_response_filter(
        &self,
        session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let method = session.req_header().method.clone();
        let kind = self.prepare_response_headers(&method, upstream_response)?;
        ctx.start_response(kind);

        debug!(
            "Response for {}: status={}, content path={}",
            ctx.url(),
            upstream_response.status,
            kind.as_str()
        );
        Ok(())
    }

    /// Hold back transformed bodies until end of stream
    fn response_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<Option<std::time::Duration>> {
        // A cache miss runs the instrumenter synchronously on this thread
        ctx.filter_body(&self.middleware, body, end_of_stream)
            .map_err(|e| {
                error!("Aborting response for {}: {}", ctx.url(), e);
                Error::explain(ErrorType::HTTPStatus(e.to_http_status()), e.to_string())
            })?;
        Ok(None)
    }

    async fn logging(&self, _session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX)
    where
        Self::CTX: Send + Sync,
    {
        if let Some(error) = e {
            error!("Request completed with error for {}: {}", ctx.url(), error);
            error!("  Transform failed: {}", ctx.is_transform_failed());
            error!("  Bytes received: {}", ctx.bytes_received());
        } else {
            info!(
                "Request completed for {}: path={}, received={} bytes, sent={} bytes",
                ctx.url(),
                ctx.kind().map_or("none", |kind| kind.as_str()),
                ctx.bytes_received(),
                ctx.bytes_sent()
            );
        }
    }
}

impl InstrumentContext {
    /// Create a new InstrumentContext
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the request URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Set the request URL
    pub fn set_url(&mut self, url: String) {
        self.url = url;
    }

    /// Content path of the current response, once headers arrived
    pub fn kind(&self) -> Option<ContentKind> {
        self.kind
    }

    /// Bytes received from upstream so far
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Bytes handed to the client so far
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Whether the instrumenter failed
    pub fn is_transform_failed(&self) -> bool {
        self.transform_failed
    }

    /// Bytes currently held back
    pub fn buffered_bytes(&self) -> usize {
        self.pending
            .as_ref()
            .map_or(0, |pending| pending.chunks().total_bytes())
    }

    /// Begin a response of the given kind
    pub fn start_response(&mut self, kind: ContentKind) {
        self.kind = Some(kind);
        self.pending = kind
            .is_transformed()
            .then(|| PendingResponse::new(self.url.clone()));
    }

    /// Process one body callback
    ///
    /// For transformed kinds every chunk is taken out of `body`; at end of
    /// stream `body` is replaced by the rewritten document. Passthrough
    /// chunks are left in place.
    pub fn filter_body(
        &mut self,
        middleware: &InstrumentMiddleware,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
    ) -> crate::Result<()> {
        let kind = self.kind.unwrap_or(ContentKind::Passthrough);
        let metrics = middleware.metrics();

        if let Some(data) = body.as_ref() {
            self.bytes_received += data.len() as u64;
        }

        if !kind.is_transformed() {
            if let Some(data) = body.as_ref() {
                self.bytes_sent += data.len() as u64;
            }
            if end_of_stream {
                metrics.record_response(kind);
            }
            return Ok(());
        }

        let start = Instant::now();
        if let Some(data) = body.take() {
            let pending = self
                .pending
                .as_mut()
                .ok_or(InstrumentError::ResponseFinalized)?;
            if !data.is_empty() {
                metrics.record_bytes_buffered(data.len() as u64);
                pending.push(data);
            }
        }

        if !end_of_stream {
            return Ok(());
        }

        let pending = self
            .pending
            .take()
            .ok_or(InstrumentError::ResponseFinalized)?;

        let output = middleware.finish(kind, pending).map_err(|e| {
            self.transform_failed = true;
            e
        })?;

        let document = match output.as_slice() {
            [single] => single.clone(),
            chunks => Bytes::from(chunks.concat()),
        };
        self.bytes_sent += document.len() as u64;
        metrics.record_bytes_emitted(document.len() as u64);
        metrics.record_finalize_duration(start.elapsed());
        *body = Some(document);

        Ok(())
    }
}
