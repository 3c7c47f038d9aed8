//! Secret redaction for operator-facing text.
//!
//! Anything the bridge sends to the remote transport passes through here so
//! that agent output containing credentials never leaves the machine intact.

use std::borrow::Cow;

const REDACTED: &str = "[REDACTED]";

fn is_secret_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '+' | '/' | '=')
}

fn token_end(input: &str, from: usize) -> usize {
    let mut end = from;
    for (i, c) in input[from..].char_indices() {
        if is_secret_char(c) {
            end = from + i + c.len_utf8();
        } else {
            break;
        }
    }
    end
}

fn scrub_after_marker(scrubbed: &mut String, marker: &str) {
    let mut search_from = 0;
    loop {
        let Some(rel) = scrubbed[search_from..].find(marker) else {
            break;
        };

        let start = search_from + rel;
        let content_start = start + marker.len();
        let end = token_end(scrubbed, content_start);

        // Skip bare markers without a token value.
        if end == content_start {
            search_from = content_start;
            continue;
        }

        scrubbed.replace_range(start..end, REDACTED);
        search_from = start + REDACTED.len();
    }
}

const PREFIX_PATTERNS: [&str; 6] = ["sk-", "ghp_", "github_pat_", "xoxb-", "glpat-", "AIza"];

/// Scrub well-known token shapes: provider key prefixes and chat bot tokens
/// of the form `123456789:35-char-suffix`.
pub fn scrub_secret_patterns(input: &str) -> Cow<'_, str> {
    let has_bot_token = find_bot_token(input, 0).is_some();
    if !has_bot_token && !PREFIX_PATTERNS.iter().any(|p| input.contains(p)) {
        return Cow::Borrowed(input);
    }

    let mut scrubbed = input.to_string();
    for pattern in PREFIX_PATTERNS {
        scrub_after_marker(&mut scrubbed, pattern);
    }
    let mut from = 0;
    while let Some((start, end)) = find_bot_token(&scrubbed, from) {
        scrubbed.replace_range(start..end, REDACTED);
        from = start + REDACTED.len();
    }
    Cow::Owned(scrubbed)
}

/// Redact `keyword=value` and `keyword: value` forms for each configured
/// keyword (case-insensitive match on the keyword).
pub fn redact_keywords(input: &str, keywords: &[String]) -> String {
    let mut out = input.to_string();
    for keyword in keywords {
        let kw = keyword.to_ascii_lowercase();
        for sep in ["=", ": ", ":"] {
            let marker = format!("{kw}{sep}");
            let mut search_from = 0;
            loop {
                // ASCII shadow keeps byte offsets aligned with `out`.
                let shadow = out.to_ascii_lowercase();
                let Some(rel) = shadow.get(search_from..).and_then(|s| s.find(&marker)) else {
                    break;
                };
                let start = search_from + rel;
                let content_start = start + marker.len();
                let end = token_end(&out, content_start);
                if end == content_start {
                    search_from = content_start;
                    continue;
                }
                out.replace_range(content_start..end, REDACTED);
                search_from = content_start + REDACTED.len();
            }
        }
    }
    out
}

/// Bot tokens: 9-10 digits, a colon, then 30-50 chars of `[A-Za-z0-9_-]`.
fn find_bot_token(input: &str, from: usize) -> Option<(usize, usize)> {
    let bytes = input.as_bytes();
    for (rel, _) in input[from..].match_indices(':') {
        let colon = from + rel;

        let mut digits_start = colon;
        while digits_start > 0 && bytes[digits_start - 1].is_ascii_digit() {
            digits_start -= 1;
        }
        let digit_count = colon - digits_start;
        if !(9..=10).contains(&digit_count) {
            continue;
        }
        // Preceding char must not extend the digit run into a longer number.
        if digits_start > 0 && bytes[digits_start - 1].is_ascii_alphanumeric() {
            continue;
        }

        let mut suffix_end = colon + 1;
        while suffix_end < bytes.len()
            && (bytes[suffix_end].is_ascii_alphanumeric() || matches!(bytes[suffix_end], b'_' | b'-'))
        {
            suffix_end += 1;
        }
        let suffix_len = suffix_end - colon - 1;
        if (30..=50).contains(&suffix_len) {
            return Some((digits_start, suffix_end));
        }
    }
    None
}
