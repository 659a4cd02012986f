//! Report text helpers.

use crate::fingerprint::Fingerprint;

pub const DEFAULT_SNIPPET_LINES: usize = 3;

/// Path of the crash page for `fingerprint`.
pub fn crash_uri(fingerprint: Fingerprint) -> String {
    format!("/crashes?fingerprint={}", fingerprint)
}

/// First `lines` non-blank lines of a report, followed by `...`.
pub fn snippetize(text: &str, lines: usize) -> Option<String> {
    if text.is_empty() {
        return None;
    }
    let head: String = text
        .split_inclusive('\n')
        .filter(|line| !line.trim().is_empty())
        .take(lines)
        .collect();
    Some(format!("{}...", head))
}

/// Splits a comma separated label list, dropping blanks.
pub fn parse_labels(csv: Option<&str>) -> Vec<String> {
    csv.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .map(String::from)
            .collect()
    })
    .unwrap_or_default()
}
