// Property: the source handed to the instrumenter for an inline script keeps
// the script body on the same line and column it had in the document.

use pingora_instrument::{
    scan_script_regions, HtmlRewriter, InstrumentMetrics, InstrumentationGateway, Instrumenter,
    MemoryDigestCache, Result, TransformOptions,
};
use proptest::prelude::*;
use std::sync::{Arc, Mutex};

struct RecordingInstrumenter {
    seen: Mutex<Vec<String>>,
}

impl Instrumenter for RecordingInstrumenter {
    fn instrument(&self, source: &str, _options: &TransformOptions) -> Result<String> {
        self.seen.lock().unwrap().push(source.to_string());
        Ok("X".to_string())
    }

    fn instrumentation_prefix(&self, _options: &TransformOptions) -> Result<String> {
        Ok(String::new())
    }
}

fn markup_strategy() -> impl Strategy<Value = String> {
    "[a-zé😀<>/ \n\t\r]{0,40}".prop_filter("no script tags", |s| !s.to_lowercase().contains("script"))
}

fn body_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9 ;=()\n'\"ü]{0,40}"
}

fn document_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec((markup_strategy(), body_strategy()), 1..5).prop_map(|parts| {
        let mut html = String::new();
        for (markup, body) in parts {
            html.push_str(&markup);
            html.push_str("<script>");
            html.push_str(&body);
            html.push_str("</script>");
        }
        html
    })
}

/// (line, column) of `offset`, counting columns in UTF-16 code units
fn position(text: &str, offset: usize) -> (usize, usize) {
    let before = &text[..offset];
    let line = before.matches('\n').count();
    let column = before.rsplit('\n').next().map_or(0, |l| l.encode_utf16().count());
    (line, column)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_line_preservation(html in document_strategy()) {
        let instrumenter = Arc::new(RecordingInstrumenter { seen: Mutex::new(Vec::new()) });
        // Fresh cache per case so identical bodies still reach the instrumenter
        let gateway = InstrumentationGateway::new(
            instrumenter.clone(),
            Arc::new(MemoryDigestCache::new()),
            Arc::new(InstrumentMetrics::new()),
        );
        let rewriter = HtmlRewriter::new(gateway);

        rewriter.rewrite(&html, &TransformOptions::default()).unwrap();

        let regions = scan_script_regions(&html);
        let mut seen = instrumenter.seen.lock().unwrap().clone();
        // Regions are processed last to first
        seen.reverse();

        // Identical sources are deduplicated by the cache
        prop_assert!(seen.len() <= regions.len());
        let unique_sources: std::collections::HashSet<_> = seen.iter().collect();
        prop_assert_eq!(unique_sources.len(), seen.len());

        for region in &regions {
            let body = &html[region.start..region.end];
            let padding_units = html[..region.start].encode_utf16().count();
            let expected_prefix: String = html[..region.start]
                .chars()
                .map(|c| if c == '\n' { "\n".to_string() } else { " ".repeat(c.len_utf16()) })
                .collect();
            let source = format!("{}{}", expected_prefix, body);

            prop_assert!(seen.contains(&source));
            prop_assert_eq!(
                source.encode_utf16().count(),
                padding_units + body.encode_utf16().count()
            );
            prop_assert_eq!(position(&source, expected_prefix.len()), position(&html, region.start));
        }
    }
}
