//! Locates inline `<script>` bodies in an HTML document
//!
//! This is a regex heuristic, not an HTML parser. It accepts any
//! `<script ...>` opening tag (case-insensitive, attributes allowed) and ends
//! the body at the first `</script` that follows, even one inside a string
//! literal or comment. Markup that defeats the heuristic is rewritten on a
//! best-effort basis.

use crate::models::ScriptRegion;
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

static SCRIPT_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<\s*script[^>]*>").expect("valid script-open pattern"));

static SCRIPT_CLOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<\s*/\s*script").expect("valid script-close pattern"));

/// Find every terminated inline script body in `html`
///
/// Regions come back in increasing `start` order and never overlap. An
/// opening tag whose body would start before the end of the previously
/// accepted region is ignored, and so is an opening tag with no closing tag
/// after it.
pub fn scan_script_regions(html: &str) -> Vec<ScriptRegion> {
    let mut regions = Vec::new();
    let mut watermark = 0usize;

    for open in SCRIPT_OPEN.find_iter(html) {
        let body_start = open.end();
        if body_start < watermark {
            debug!(
                "Skipping script tag at {}: inside region ending at {}",
                open.start(),
                watermark
            );
            continue;
        }

        let Some(close) = SCRIPT_CLOSE.find(&html[body_start..]) else {
            debug!("Unterminated script tag at {}, leaving it untouched", open.start());
            continue;
        };

        let region = ScriptRegion {
            start: body_start,
            end: body_start + close.start(),
        };
        watermark = region.end;
        regions.push(region);
    }

    debug!("Found {} script regions in {} bytes of HTML", regions.len(), html.len());
    regions
}
