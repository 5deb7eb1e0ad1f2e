//! Response interception: buffer every write, rewrite on finalize
//!
//! [`InterceptedResponse`] decorates any [`ResponseSink`]. The handler writes
//! into it exactly as it would into the real sink; nothing reaches the
//! transport until `finalize`, when the buffered body is classified,
//! rewritten if it is JavaScript or HTML, and flushed through the wrapped
//! sink.

use crate::error::{InstrumentError, Result};
use crate::middleware::InstrumentMiddleware;
use bytes::{Bytes, BytesMut};
use http::header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE};
use http::HeaderMap;
use std::time::Instant;
use tracing::debug;

/// A response being written to a client
///
/// The handler may call `write` any number of times followed by exactly one
/// `finalize`. Headers can be changed until the first byte is transmitted.
pub trait ResponseSink {
    /// Response headers
    fn headers(&self) -> &HeaderMap;

    /// Mutable response headers
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Transmit one body chunk
    fn write(&mut self, chunk: Bytes) -> Result<()>;

    /// Complete the response, optionally with a last chunk
    fn finalize(&mut self, chunk: Option<Bytes>) -> Result<()>;
}

/// Ordered sequence of body chunks written so far
#[derive(Debug, Clone, Default)]
pub struct BufferedChunks {
    chunks: Vec<Bytes>,
    total_bytes: usize,
}

impl BufferedChunks {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk
    pub fn push(&mut self, chunk: Bytes) {
        self.total_bytes += chunk.len();
        self.chunks.push(chunk);
    }

    /// Number of chunks
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether no chunk was written
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total buffered bytes
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Buffered chunks in write order
    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    /// Concatenate every chunk into one contiguous body
    pub fn concat(&self) -> Bytes {
        match self.chunks.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            chunks => {
                let mut body = BytesMut::with_capacity(self.total_bytes);
                for chunk in chunks {
                    body.extend_from_slice(chunk);
                }
                body.freeze()
            }
        }
    }

    /// Take the chunks out, in write order
    pub fn into_chunks(self) -> Vec<Bytes> {
        self.chunks
    }
}

/// Per-response buffering state
///
/// Created when the middleware is installed on a response and consumed
/// exactly once when the response is finalized.
#[derive(Debug, Clone)]
pub struct PendingResponse {
    request_path: String,
    chunks: BufferedChunks,
}

impl PendingResponse {
    /// Create buffering state for the request at `request_path`
    pub fn new(request_path: impl Into<String>) -> Self {
        PendingResponse {
            request_path: request_path.into(),
            chunks: BufferedChunks::new(),
        }
    }

    /// Raw request path (before unescaping)
    pub fn request_path(&self) -> &str {
        &self.request_path
    }

    /// Buffer a chunk
    pub fn push(&mut self, chunk: Bytes) {
        self.chunks.push(chunk);
    }

    /// Chunks buffered so far
    pub fn chunks(&self) -> &BufferedChunks {
        &self.chunks
    }

    /// Split into request path and chunks
    pub fn into_parts(self) -> (String, BufferedChunks) {
        (self.request_path, self.chunks)
    }
}

/// A [`ResponseSink`] that buffers the body and rewrites it on finalize
///
/// Header operations go straight to the wrapped sink, so the handler sees
/// the same header state it would without interception.
pub struct InterceptedResponse<S: ResponseSink> {
    inner: S,
    middleware: InstrumentMiddleware,
    pending: Option<PendingResponse>,
}

impl<S: ResponseSink> InterceptedResponse<S> {
    /// Wrap `inner`, disabling client caching of the response
    pub(crate) fn new(middleware: InstrumentMiddleware, request_path: &str, mut inner: S) -> Self {
        inner
            .headers_mut()
            .insert(CACHE_CONTROL, middleware.cache_control().clone());

        debug!("Installed response interception for path={}", request_path);

        InterceptedResponse {
            inner,
            middleware,
            pending: Some(PendingResponse::new(request_path)),
        }
    }

    /// Whether finalize already ran
    pub fn is_finalized(&self) -> bool {
        self.pending.is_none()
    }

    /// Bytes buffered so far
    pub fn buffered_bytes(&self) -> usize {
        self.pending
            .as_ref()
            .map_or(0, |pending| pending.chunks().total_bytes())
    }

    /// The wrapped sink
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Unwrap, returning the wrapped sink
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: ResponseSink> ResponseSink for InterceptedResponse<S> {
    fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    fn write(&mut self, chunk: Bytes) -> Result<()> {
        let pending = self
            .pending
            .as_mut()
            .ok_or(InstrumentError::ResponseFinalized)?;

        self.middleware
            .metrics()
            .record_bytes_buffered(chunk.len() as u64);
        pending.push(chunk);
        Ok(())
    }

    fn finalize(&mut self, chunk: Option<Bytes>) -> Result<()> {
        let start = Instant::now();
        let mut pending = self
            .pending
            .take()
            .ok_or(InstrumentError::ResponseFinalized)?;

        if let Some(chunk) = chunk.filter(|c| !c.is_empty()) {
            self.middleware
                .metrics()
                .record_bytes_buffered(chunk.len() as u64);
            pending.push(chunk);
        }

        let content_type = self
            .inner
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let kind = self.middleware.classify(content_type.as_deref());

        let output = self.middleware.finish(kind, pending)?;

        if kind.is_transformed() {
            self.inner.headers_mut().remove(CONTENT_LENGTH);
        }

        for chunk in output {
            self.middleware
                .metrics()
                .record_bytes_emitted(chunk.len() as u64);
            self.inner.write(chunk)?;
        }
        self.inner.finalize(None)?;

        self.middleware
            .metrics()
            .record_finalize_duration(start.elapsed());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffered_chunks_concat() {
        let mut chunks = BufferedChunks::new();
        assert_eq!(chunks.concat(), Bytes::new());

        chunks.push(Bytes::from("abc"));
        assert_eq!(chunks.concat(), Bytes::from("abc"));

        chunks.push(Bytes::from("def"));
        chunks.push(Bytes::from("g"));
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.total_bytes(), 7);
        assert_eq!(chunks.concat(), Bytes::from("abcdefg"));
    }

    #[test]
    fn test_buffered_chunks_order() {
        let mut chunks = BufferedChunks::new();
        chunks.push(Bytes::from("1"));
        chunks.push(Bytes::from("2"));
        assert_eq!(
            chunks.into_chunks(),
            vec![Bytes::from("1"), Bytes::from("2")]
        );
    }

    #[test]
    fn test_pending_response_parts() {
        let mut pending = PendingResponse::new("/a%20b.js");
        pending.push(Bytes::from("x"));

        assert_eq!(pending.request_path(), "/a%20b.js");
        let (path, chunks) = pending.into_parts();
        assert_eq!(path, "/a%20b.js");
        assert_eq!(chunks.total_bytes(), 1);
    }
}
