// src/keywords.rs
//! Keyword matching shared by every checker.
//!
//! Matching is a case-insensitive substring test. Keywords are tried in their
//! configured order and the first hit wins, so the order users write them in
//! is the tie-break.

/// Returns the first keyword (in configured order) contained in `text`.
pub fn find_keyword<'a>(text: &str, keywords: &'a [String]) -> Option<&'a str> {
    if keywords.is_empty() || text.is_empty() {
        return None;
    }
    let haystack = text.to_lowercase();
    keywords
        .iter()
        .filter(|k| !k.is_empty())
        .find(|k| haystack.contains(&k.to_lowercase()))
        .map(String::as_str)
}

/// Matches an item by title first, then by body. A title hit always wins.
pub fn match_item<'a>(title: &str, body: &str, keywords: &'a [String]) -> Option<&'a str> {
    find_keyword(title, keywords).or_else(|| find_keyword(body, keywords))
}

/// Trim, drop empties and dedup (case-insensitively) while keeping first-seen order.
pub fn clean_keywords<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for it in items {
        let t = it.as_ref().trim();
        if t.is_empty() {
            continue;
        }
        if out.iter().any(|k| k.eq_ignore_ascii_case(t)) {
            continue;
        }
        out.push(t.to_string());
    }
    out
}

/// Parses a comma separated list as typed into a chat command.
pub fn parse_keyword_list(raw: &str) -> Vec<String> {
    clean_keywords(raw.split(','))
}
