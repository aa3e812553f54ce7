//! Block-page detection.
//!
//! Pages that answer with an access-denied notice, a captcha or a rate-limit
//! wall mean the site has noticed the automation. The engine disarms itself
//! when it sees one and waits for the operator to re-arm.

use std::sync::OnceLock;

use regex::Regex;

/// Label and pattern for each kind of block page.
const PATTERNS: &[(&str, &str)] = &[
    ("access denied", r"(?i)access\s+denied"),
    ("too many requests", r"(?i)too\s+many\s+requests"),
    ("rate limit", r"(?i)rate\s+limit"),
    ("robot check", r"(?i)\brobot\b"),
    ("captcha", r"(?i)captcha"),
    ("blocked", r"(?i)blocked"),
    ("unusual activity", r"(?i)unusual\s+activity"),
];

fn patterns() -> &'static [(&'static str, Regex)] {
    static RE: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    RE.get_or_init(|| {
        PATTERNS
            .iter()
            .map(|(label, pattern)| {
                (*label, Regex::new(pattern).expect("safety pattern is valid"))
            })
            .collect()
    })
}

/// The first block-page pattern found in `text`, by label.
pub fn detect_block_page(text: &str) -> Option<&'static str> {
    if text.is_empty() {
        return None;
    }
    patterns()
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(label, _)| *label)
}
