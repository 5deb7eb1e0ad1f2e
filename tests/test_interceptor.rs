// Integration tests for response interception through the public API
//
// A recording sink stands in for the real transport so every header change
// and every transmitted chunk can be inspected after finalize.

use bytes::Bytes;
use http::header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue};
use pingora_instrument::config::NO_CACHE_DIRECTIVES;
use pingora_instrument::{
    InstrumentConfig, InstrumentError, InstrumentMiddleware, Instrumenter, ResponseSink, Result,
    TransformOptions,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Transport double that records everything it is asked to send
#[derive(Default)]
struct RecordingSink {
    headers: HeaderMap,
    written: Vec<Bytes>,
    finalized: usize,
}

impl RecordingSink {
    fn with_content_type(content_type: &str) -> Self {
        let mut sink = RecordingSink::default();
        sink.headers
            .insert(CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
        sink
    }

    fn body(&self) -> String {
        let bytes: Vec<u8> = self.written.iter().flat_map(|c| c.iter().copied()).collect();
        String::from_utf8(bytes).unwrap()
    }
}

impl ResponseSink for RecordingSink {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.written.push(chunk);
        Ok(())
    }

    fn finalize(&mut self, chunk: Option<Bytes>) -> Result<()> {
        if let Some(chunk) = chunk {
            self.written.push(chunk);
        }
        self.finalized += 1;
        Ok(())
    }
}

/// Instrumenter that tags its input and records every call
struct TaggingInstrumenter {
    sources: Mutex<Vec<String>>,
    options: Mutex<Vec<TransformOptions>>,
    prefix_calls: AtomicUsize,
}

impl TaggingInstrumenter {
    fn new() -> Arc<Self> {
        Arc::new(TaggingInstrumenter {
            sources: Mutex::new(Vec::new()),
            options: Mutex::new(Vec::new()),
            prefix_calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.sources.lock().unwrap().len()
    }
}

impl Instrumenter for TaggingInstrumenter {
    fn instrument(&self, source: &str, options: &TransformOptions) -> Result<String> {
        self.sources.lock().unwrap().push(source.to_string());
        self.options.lock().unwrap().push(options.clone());
        Ok(format!("INSTR({})", source.trim_start()))
    }

    fn instrumentation_prefix(&self, _options: &TransformOptions) -> Result<String> {
        self.prefix_calls.fetch_add(1, Ordering::SeqCst);
        Ok("PRE".to_string())
    }
}

struct FailingInstrumenter;

impl Instrumenter for FailingInstrumenter {
    fn instrument(&self, _source: &str, options: &TransformOptions) -> Result<String> {
        Err(InstrumentError::transform(options.path_or_default(), "unexpected token"))
    }

    fn instrumentation_prefix(&self, _options: &TransformOptions) -> Result<String> {
        Ok("PRE".to_string())
    }
}

fn middleware(instrumenter: Arc<dyn Instrumenter>) -> InstrumentMiddleware {
    InstrumentMiddleware::new(Arc::new(InstrumentConfig::default()), instrumenter).unwrap()
}

#[test]
fn test_html_single_script() {
    let instrumenter = TaggingInstrumenter::new();
    let middleware = middleware(instrumenter.clone());
    let mut response = middleware.install("/", RecordingSink::with_content_type("text/html"));

    response
        .write(Bytes::from("<div>x</div><script>var a=1;</script>"))
        .unwrap();
    response.finalize(None).unwrap();

    let sink = response.into_inner();
    assert_eq!(
        sink.body(),
        "<script>\nPRE\n</script>\n<div>x</div><script>INSTR(var a=1;)</script>"
    );
    assert_eq!(sink.finalized, 1);

    let sources = instrumenter.sources.lock().unwrap();
    assert_eq!(sources[0], format!("{}var a=1;", " ".repeat(20)));
}

#[test]
fn test_html_nested_open_tag_single_region() {
    let instrumenter = TaggingInstrumenter::new();
    let middleware = middleware(instrumenter.clone());
    let mut response = middleware.install("/", RecordingSink::with_content_type("text/html"));

    response.write(Bytes::from("<script>a<script>b</script>")).unwrap();
    response.finalize(None).unwrap();

    assert_eq!(instrumenter.calls(), 1);
    assert_eq!(
        response.get_ref().body(),
        "<script>\nPRE\n</script>\n<script>INSTR(a<script>b)</script>"
    );
}

#[test]
fn test_passthrough_is_byte_identical() {
    let instrumenter = TaggingInstrumenter::new();
    let middleware = middleware(instrumenter.clone());
    let mut sink = RecordingSink::with_content_type("image/png");
    sink.headers.insert(CONTENT_LENGTH, HeaderValue::from_static("6"));
    let mut response = middleware.install("/logo.png", sink);

    response.write(Bytes::from_static(b"\x89PN")).unwrap();
    response.write(Bytes::from_static(b"G\r\n")).unwrap();
    response.finalize(None).unwrap();

    let sink = response.into_inner();
    assert_eq!(
        sink.written,
        vec![Bytes::from_static(b"\x89PN"), Bytes::from_static(b"G\r\n")]
    );
    assert_eq!(sink.headers.get(CONTENT_LENGTH).unwrap(), "6");
    assert_eq!(sink.headers.get(CACHE_CONTROL).unwrap(), NO_CACHE_DIRECTIVES);
    assert_eq!(instrumenter.calls(), 0);
}

#[test]
fn test_missing_content_type_passes_through() {
    let middleware = middleware(TaggingInstrumenter::new());
    let mut response = middleware.install("/", RecordingSink::default());

    response.write(Bytes::from("<script>x</script>")).unwrap();
    response.finalize(None).unwrap();

    assert_eq!(response.get_ref().body(), "<script>x</script>");
}

#[test]
fn test_javascript_chunks_concatenated_and_length_removed() {
    let instrumenter = TaggingInstrumenter::new();
    let middleware = middleware(instrumenter.clone());
    let mut sink = RecordingSink::with_content_type("application/javascript; charset=utf-8");
    sink.headers.insert(CONTENT_LENGTH, HeaderValue::from_static("10"));
    let mut response = middleware.install("/static/app%20main.js", sink);

    response.write(Bytes::from("var a")).unwrap();
    response.finalize(Some(Bytes::from(" = 1;"))).unwrap();

    let sink = response.into_inner();
    assert_eq!(sink.written, vec![Bytes::from("INSTR(var a = 1;)")]);
    assert!(sink.headers.get(CONTENT_LENGTH).is_none());

    let options = instrumenter.options.lock().unwrap();
    assert_eq!(options[0].path.as_deref(), Some("/static/app main.js"));
    assert_eq!(options[0].include_prefix, Some(false));
    assert_eq!(instrumenter.prefix_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_cache_control_set_at_install() {
    let middleware = middleware(TaggingInstrumenter::new());
    let response = middleware.install("/", RecordingSink::with_content_type("text/html"));

    assert_eq!(
        response.headers().get(CACHE_CONTROL).unwrap(),
        NO_CACHE_DIRECTIVES
    );
    assert!(response.get_ref().written.is_empty());
}

#[test]
fn test_nothing_transmitted_before_finalize() {
    let middleware = middleware(TaggingInstrumenter::new());
    let mut response = middleware.install("/", RecordingSink::with_content_type("text/plain"));

    response.write(Bytes::from("a")).unwrap();
    response.write(Bytes::from("b")).unwrap();

    assert!(response.get_ref().written.is_empty());
    assert_eq!(response.buffered_bytes(), 2);
    assert!(!response.is_finalized());
}

#[test]
fn test_write_after_finalize_rejected() {
    let middleware = middleware(TaggingInstrumenter::new());
    let mut response = middleware.install("/", RecordingSink::with_content_type("text/plain"));

    response.finalize(None).unwrap();
    assert!(response.is_finalized());

    assert!(matches!(
        response.write(Bytes::from("late")),
        Err(InstrumentError::ResponseFinalized)
    ));
    assert!(matches!(
        response.finalize(None),
        Err(InstrumentError::ResponseFinalized)
    ));
    assert_eq!(response.get_ref().finalized, 1);
}

#[test]
fn test_transform_failure_transmits_nothing() {
    let middleware = middleware(Arc::new(FailingInstrumenter));
    let mut response =
        middleware.install("/broken.js", RecordingSink::with_content_type("application/javascript"));

    response.write(Bytes::from("var = ;")).unwrap();
    let err = response.finalize(None).unwrap_err();

    assert!(err.is_transform_failure());
    let sink = response.into_inner();
    assert!(sink.written.is_empty());
    assert_eq!(sink.finalized, 0);
    assert_eq!(middleware.metrics().get_stats().transform_failures, 1);
}

#[test]
fn test_repeated_script_served_from_cache() {
    let instrumenter = TaggingInstrumenter::new();
    let middleware = middleware(instrumenter.clone());

    for _ in 0..3 {
        let mut response =
            middleware.install("/lib.js", RecordingSink::with_content_type("application/javascript"));
        response.write(Bytes::from("lib()")).unwrap();
        response.finalize(None).unwrap();
        assert_eq!(response.get_ref().body(), "INSTR(lib())");
    }

    assert_eq!(instrumenter.calls(), 1);
    let stats = middleware.metrics().get_stats();
    assert_eq!(stats.gateway_cache_hits, 2);
    assert_eq!(stats.javascript_responses, 3);
}

#[test]
fn test_empty_html_gets_preamble() {
    let middleware = middleware(TaggingInstrumenter::new());
    let mut response = middleware.install("/", RecordingSink::with_content_type("text/html"));

    response.finalize(None).unwrap();

    assert_eq!(response.get_ref().body(), "<script>\nPRE\n</script>\n");
}
