//! `@username` extraction from comment bodies.
//!
//! This is a plain token scan, not markdown parsing: `@alice` inside a code
//! span still counts as a mention. Names are ASCII word characters only.

use regex::Regex;

lazy_static::lazy_static! {
    static ref MENTION: Regex = Regex::new(r"@([A-Za-z0-9_]+)").expect("mention regex is valid");
}

/// Returns the mentioned usernames in order of first appearance, without duplicates
pub fn extract_mentions(content: &str) -> Vec<String> {
    let mut res: Vec<String> = Vec::new();
    for cap in MENTION.captures_iter(content) {
        let name = &cap[1];
        if !res.iter().any(|n| n == name) {
            res.push(String::from(name));
        }
    }
    res
}
