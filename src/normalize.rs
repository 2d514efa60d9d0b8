// src/normalize.rs
use once_cell::sync::OnceCell;
use regex::Regex;

/// Normalize text: decode HTML entities, strip tags, collapse whitespace,
/// normalize smart quotes, cap length. Used for both fingerprinting and
/// Stage A keyword matching so the two always agree on what the text "is".
pub fn normalize_text(s: &str) -> String {
    let decoded = html_escape::decode_html_entities(s);

    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").unwrap());
    let stripped = re_tags.replace_all(&decoded, "");

    // Providers disagree on curly quotes vs guillemets vs ASCII; fold them
    // so fingerprints and keyword matches agree across sources.
    let quoted = stripped
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").unwrap());
    let collapsed = re_ws.replace_all(&quoted, " ");
    let trimmed = collapsed.trim();

    // Feed bodies can be arbitrarily long; nothing downstream needs more
    // than the head.
    if trimmed.chars().count() > 2000 {
        trimmed.chars().take(2000).collect()
    } else {
        trimmed.to_string()
    }
}
