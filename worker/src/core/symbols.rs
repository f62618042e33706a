//! Declaration-name extraction for tool-call telemetry.
//!
//! This is a line-oriented regex scan, not a parser. It only feeds summaries.

use std::sync::LazyLock;

use regex::Regex;

static DECLARATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^\s*(?:export\s+)?(?:default\s+)?(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?(?:abstract\s+)?(?:function\*?|fn|class|struct|enum|trait|interface|type|def|const|let)\s+([A-Za-z_$][A-Za-z0-9_$]*)",
    )
    .expect("valid declaration regex")
});

/// Return declared names in source order, without duplicates.
pub fn extract_symbols(source: &str, limit: usize) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in DECLARATION_RE.captures_iter(source) {
        let name = &caps[1];
        if names.iter().any(|existing| existing == name) {
            continue;
        }
        names.push(name.to_string());
        if names.len() >= limit {
            break;
        }
    }
    names
}
