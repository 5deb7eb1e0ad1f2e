//! Gateway to the external instrumenter
//!
//! Both rewriting paths call the instrumenter through [`InstrumentationGateway`],
//! which memoizes results in a shared [`DigestCache`].

use crate::digest_cache::{DigestCache, Fingerprint};
use crate::error::Result;
use crate::metrics::InstrumentMetrics;
use crate::options::TransformOptions;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

/// The code-instrumentation collaborator supplied by the host
///
/// Both operations must be synchronous and pure with respect to their
/// arguments: the gateway caches `instrument` output forever.
pub trait Instrumenter: Send + Sync {
    /// Instrument a piece of JavaScript source
    fn instrument(&self, source: &str, options: &TransformOptions) -> Result<String>;

    /// Bootstrap code that must run before any instrumented script
    fn instrumentation_prefix(&self, options: &TransformOptions) -> Result<String>;
}

/// Cached access to an [`Instrumenter`]
#[derive(Clone)]
pub struct InstrumentationGateway {
    instrumenter: Arc<dyn Instrumenter>,
    cache: Arc<dyn DigestCache>,
    metrics: Arc<InstrumentMetrics>,
}

impl InstrumentationGateway {
    /// Create a new gateway
    ///
    /// # Arguments
    /// * `instrumenter` - The external transform
    /// * `cache` - Process-wide digest cache, shared by every response
    /// * `metrics` - Shared metrics collector
    pub fn new(
        instrumenter: Arc<dyn Instrumenter>,
        cache: Arc<dyn DigestCache>,
        metrics: Arc<InstrumentMetrics>,
    ) -> Self {
        InstrumentationGateway {
            instrumenter,
            cache,
            metrics,
        }
    }

    /// Instrument `source`, consulting the digest cache first
    ///
    /// On a hit the stored output is returned without calling the
    /// instrumenter. On a miss the instrumenter runs and its output is stored.
    /// Failures are never cached and propagate to the caller.
    pub fn instrument(&self, source: &str, options: &TransformOptions) -> Result<Arc<str>> {
        let fingerprint = Fingerprint::compute(options, source)?;

        if let Some(cached) = self.cache.get(&fingerprint) {
            self.metrics.record_cache_hit();
            return Ok(cached);
        }
        self.metrics.record_cache_miss();

        debug!(
            "Instrumenting {} bytes for path={}",
            source.len(),
            options.path_or_default()
        );

        let start = Instant::now();
        let result = self.instrumenter.instrument(source, options);
        self.metrics.record_transform_duration(start.elapsed());

        let output: Arc<str> = match result {
            Ok(output) => Arc::from(output),
            Err(e) => {
                self.metrics.record_transform_failure();
                error!(
                    "Instrumenter failed for path={}: {}",
                    options.path_or_default(),
                    e
                );
                return Err(e);
            }
        };

        self.cache.put(fingerprint, Arc::clone(&output));
        Ok(output)
    }

    /// Shared metrics collector
    pub fn metrics(&self) -> &InstrumentMetrics {
        &self.metrics
    }

    /// Bootstrap code injected once at the top of every HTML document
    pub fn instrumentation_prefix(&self, options: &TransformOptions) -> Result<String> {
        self.instrumenter
            .instrumentation_prefix(options)
            .map_err(|e| {
                self.metrics.record_transform_failure();
                error!(
                    "Instrumentation prefix failed for path={}: {}",
                    options.path_or_default(),
                    e
                );
                e
            })
    }
}
