// Page lookup inside serialized XFDF annotation markup.
//
// XFDF stores the page as a 0-based `page="N"` attribute; the rest of the
// workspace uses 1-based page numbers.

use std::sync::OnceLock;

use regex::Regex;

fn page_attribute() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"\bpage="(\d+)""#).expect("page pattern is valid"))
}

/// 1-based page number of the first `page="N"` attribute, if any.
pub fn page_number(xfdf: &str) -> Option<u32> {
    let captures = page_attribute().captures(xfdf)?;
    let zero_based: u32 = captures.get(1)?.as_str().parse().ok()?;
    zero_based.checked_add(1)
}
