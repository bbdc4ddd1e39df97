use crate::constants::{TITLE_ELLIPSIS, TITLE_MAX_CHARS};

/// Safely returns a prefix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Derives a conversation title from the first user turn's text: the text
/// itself when it fits, otherwise the first `TITLE_MAX_CHARS` characters
/// followed by an ellipsis.
pub fn derive_title(text: &str) -> String {
    match text.char_indices().nth(TITLE_MAX_CHARS) {
        Some((idx, _)) => format!("{}{}", &text[..idx], TITLE_ELLIPSIS),
        None => text.to_string(),
    }
}
