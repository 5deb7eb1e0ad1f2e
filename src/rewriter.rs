//! HTML rewriting: instruments every inline script and injects the preamble

use crate::error::Result;
use crate::gateway::InstrumentationGateway;
use crate::options::TransformOptions;
use crate::scanner::scan_script_regions;
use tracing::debug;

/// Rewrites HTML documents through an [`InstrumentationGateway`]
#[derive(Clone)]
pub struct HtmlRewriter {
    gateway: InstrumentationGateway,
}

impl HtmlRewriter {
    /// Create a new HtmlRewriter
    pub fn new(gateway: InstrumentationGateway) -> Self {
        HtmlRewriter { gateway }
    }

    /// Instrument every inline script of `html` and prepend the preamble
    ///
    /// Each script body is handed to the instrumenter prefixed with the
    /// preceding markup blanked out by [`line_preserving_padding`], so line
    /// numbers the instrumenter records match the original document.
    /// Regions are replaced last-to-first, which keeps the offsets of the
    /// regions still to be processed valid.
    ///
    /// # Returns
    /// * `Ok(String)` - `preamble + rewritten document`
    /// * `Err(InstrumentError)` - the instrumenter failed; nothing is emitted
    pub fn rewrite(&self, html: &str, options: &TransformOptions) -> Result<String> {
        let regions = scan_script_regions(html);
        let mut document = html.to_string();

        for region in regions.iter().rev() {
            let mut source = line_preserving_padding(&html[..region.start]);
            source.push_str(&html[region.start..region.end]);

            let instrumented = self.gateway.instrument(&source, options)?;
            document.replace_range(region.start..region.end, &instrumented);

            debug!(
                "Rewrote script region {}..{} ({} -> {} bytes)",
                region.start,
                region.end,
                region.len(),
                instrumented.len()
            );
        }

        self.gateway
            .metrics()
            .record_scripts_rewritten(regions.len() as u64);

        let prefix = self.gateway.instrumentation_prefix(options)?;
        let preamble = build_preamble(&prefix);

        let mut output = String::with_capacity(preamble.len() + document.len());
        output.push_str(&preamble);
        output.push_str(&document);
        Ok(output)
    }
}

/// Replace every character except `\n` with spaces
///
/// Each character becomes one space per UTF-16 code unit, so an astral
/// character yields two. Columns therefore match what a JavaScript engine
/// reports for the original document.
pub fn line_preserving_padding(text: &str) -> String {
    let mut padding = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '\n' {
            padding.push('\n');
        } else {
            for _ in 0..c.len_utf16() {
                padding.push(' ');
            }
        }
    }
    padding
}

/// Script block carrying the instrumenter bootstrap code
pub fn build_preamble(prefix: &str) -> String {
    format!("<script>\n{}\n</script>\n", prefix)
}
