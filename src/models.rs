//! Core data models for the instrumentation middleware

use serde::{Deserialize, Serialize};

/// Extent of one script body inside an HTML document
///
/// Offsets are byte positions into the *original* document and exclude the
/// surrounding `<script ...>` and `</script` tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScriptRegion {
    /// First byte of the script body (inclusive)
    pub start: usize,
    /// End of the script body (exclusive)
    pub end: usize,
}

impl ScriptRegion {
    /// Length of the script body in bytes
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the script body is empty (`<script></script>`)
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Which rewriting path applies to a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentKind {
    /// Whole body is JavaScript, instrumented in one call
    JavaScript,
    /// HTML document whose inline scripts are instrumented
    Html,
    /// Anything else, forwarded byte-for-byte
    Passthrough,
}

impl ContentKind {
    /// Classify a declared content type by substring match
    ///
    /// Matching is case-sensitive and the JavaScript pattern is checked first.
    /// A missing content type is passed through.
    pub fn classify(content_type: Option<&str>, javascript_pattern: &str, html_pattern: &str) -> Self {
        match content_type {
            Some(ct) if ct.contains(javascript_pattern) => ContentKind::JavaScript,
            Some(ct) if ct.contains(html_pattern) => ContentKind::Html,
            _ => ContentKind::Passthrough,
        }
    }

    /// Whether the body is rewritten (and Content-Length therefore dropped)
    pub fn is_transformed(&self) -> bool {
        !matches!(self, ContentKind::Passthrough)
    }

    /// Short label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::JavaScript => "javascript",
            ContentKind::Html => "html",
            ContentKind::Passthrough => "passthrough",
        }
    }
}
