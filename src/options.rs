//! Options forwarded to the external instrumentation transform

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Options handed to the instrumenter for one response
///
/// `path` and `include_prefix` are the two keys the middleware itself sets;
/// every other key is carried in `extra` and forwarded verbatim. A field that
/// is `None` (or a JSON `null` in `extra`) counts as absent when merging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformOptions {
    /// Decoded request path of the response being instrumented
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Whether the instrumenter should emit its bootstrap prefix inline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_prefix: Option<bool>,

    /// Any other instrumenter options
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TransformOptions {
    /// Per-request base options derived from the request URL
    ///
    /// The preamble is injected once per HTML document, so inline regions
    /// default to `include_prefix = false`.
    pub fn for_request(request_url: &str) -> Self {
        TransformOptions {
            path: Some(unescape_path(request_url)),
            include_prefix: Some(false),
            extra: Map::new(),
        }
    }

    /// Merge `overrides` on top of `base`
    ///
    /// Only explicitly-set override fields replace base values.
    pub fn merge(base: &TransformOptions, overrides: &TransformOptions) -> TransformOptions {
        let mut merged = base.clone();

        if let Some(path) = &overrides.path {
            merged.path = Some(path.clone());
        }
        if let Some(include_prefix) = overrides.include_prefix {
            merged.include_prefix = Some(include_prefix);
        }
        for (key, value) in &overrides.extra {
            if !value.is_null() {
                merged.extra.insert(key.clone(), value.clone());
            }
        }

        merged
    }

    /// Set an extra option, builder style
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// The request path, or an empty string when unset
    pub fn path_or_default(&self) -> &str {
        self.path.as_deref().unwrap_or("")
    }

    /// Deterministic JSON serialization used for fingerprinting
    ///
    /// Keys are sorted and absent fields are omitted, so two option sets that
    /// compare equal always serialize identically. The output never contains
    /// a raw NUL byte: JSON escapes every control character inside strings.
    pub fn canonical_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.sorted_entries())?)
    }

    fn sorted_entries(&self) -> BTreeMap<String, Value> {
        let mut entries: BTreeMap<String, Value> = self
            .extra
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        if let Some(path) = &self.path {
            entries.insert("path".to_string(), Value::String(path.clone()));
        }
        if let Some(include_prefix) = self.include_prefix {
            entries.insert("include_prefix".to_string(), Value::Bool(include_prefix));
        }

        entries
    }
}

/// Decode `%XX` and `%uXXXX` escapes in a request URL
///
/// `%XX` decodes to the code point `U+00XX` and `%uXXXX` to the UTF-16 code
/// unit `XXXX`. Malformed escapes are kept verbatim; unpaired surrogates
/// become U+FFFD. Decoding never fails.
pub fn unescape_path(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut units: Vec<u16> = Vec::with_capacity(input.len());
    let mut i = 0usize;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            if bytes.get(i + 1) == Some(&b'u') {
                if let Some(unit) = hex_unit(bytes, i + 2, 4) {
                    units.push(unit);
                    i += 6;
                    continue;
                }
            }
            if let Some(unit) = hex_unit(bytes, i + 1, 2) {
                units.push(unit);
                i += 3;
                continue;
            }
        }

        // Escapes are ASCII, so `i` is always on a char boundary here.
        match input[i..].chars().next() {
            Some(ch) => {
                let mut buf = [0u16; 2];
                units.extend_from_slice(ch.encode_utf16(&mut buf));
                i += ch.len_utf8();
            }
            None => break,
        }
    }

    String::from_utf16_lossy(&units)
}

fn hex_unit(bytes: &[u8], from: usize, digits: usize) -> Option<u16> {
    let raw = bytes.get(from..from + digits)?;
    if !raw.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let text = std::str::from_utf8(raw).ok()?;
    u16::from_str_radix(text, 16).ok()
}
