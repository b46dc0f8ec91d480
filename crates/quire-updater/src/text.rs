//! Character-position helpers.
//!
//! All positions in ops and ranges count Unicode scalar values. Slicing
//! clamps out-of-range bounds to the string, so callers can compare the
//! result against expected text instead of checking bounds first.

use std::borrow::Cow;

/// Number of characters in `s`.
pub(crate) fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn byte_offset(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map_or(s.len(), |(offset, _)| offset)
}

/// Characters `[start, end)` of `s`, clamped to its length.
pub(crate) fn slice(s: &str, start: usize, end: usize) -> &str {
    if start >= end {
        return "";
    }
    let from = byte_offset(s, start);
    let to = from + byte_offset(&s[from..], end - start);
    &s[from..to]
}

/// Characters from `start` to the end of `s`.
pub(crate) fn slice_from(s: &str, start: usize) -> &str {
    &s[byte_offset(s, start)..]
}

/// `s` with `insert` placed before character `at` (clamped).
pub(crate) fn splice(s: &str, at: usize, insert: &str) -> String {
    let offset = byte_offset(s, at);
    let mut out = String::with_capacity(s.len() + insert.len());
    out.push_str(&s[..offset]);
    out.push_str(insert);
    out.push_str(&s[offset..]);
    out
}

/// `s` without characters `[at, at + len)` (clamped).
pub(crate) fn remove(s: &str, at: usize, len: usize) -> String {
    let from = byte_offset(s, at);
    let to = from + byte_offset(&s[from..], len);
    let mut out = String::with_capacity(s.len());
    out.push_str(&s[..from]);
    out.push_str(&s[to..]);
    out
}

/// Joins document lines into the text the ops address.
pub(crate) fn join_lines(lines: &[String]) -> String {
    lines.join("\n")
}

/// Splits document text back into lines.
pub(crate) fn split_lines(text: &str) -> Vec<String> {
    text.split('\n').map(str::to_string).collect()
}

/// Character length of the joined document text.
pub(crate) fn doc_length(lines: &[String]) -> usize {
    lines.iter().map(|line| char_len(line)).sum::<usize>() + lines.len().saturating_sub(1)
}

/// Replaces every character outside the Basic Multilingual Plane with two
/// U+FFFD characters.
///
/// Editing clients count positions in UTF-16 code units; after this
/// replacement each character is exactly one code unit, so client positions
/// and character positions agree.
pub(crate) fn sanitize(text: &str) -> Cow<'_, str> {
    if text.chars().all(|c| u32::from(c) <= 0xFFFF) {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len() + 4);
    for c in text.chars() {
        if u32::from(c) > 0xFFFF {
            out.push_str("\u{FFFD}\u{FFFD}");
        } else {
            out.push(c);
        }
    }
    Cow::Owned(out)
}

/// Precomputed character offsets for O(1) slicing of a large text.
pub(crate) struct CharIndex<'a> {
    text: &'a str,
    offsets: Vec<usize>,
}

impl<'a> CharIndex<'a> {
    pub(crate) fn new(text: &'a str) -> Self {
        let offsets = text
            .char_indices()
            .map(|(offset, _)| offset)
            .chain(std::iter::once(text.len()))
            .collect();
        Self { text, offsets }
    }

    /// Number of characters.
    pub(crate) fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Characters `[start, start + len)`, clamped.
    pub(crate) fn slice(&self, start: usize, len: usize) -> &'a str {
        let total = self.len();
        let from = start.min(total);
        let to = start.saturating_add(len).min(total);
        &self.text[self.offsets[from]..self.offsets[to]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slicing_counts_characters() {
        let s = "héllo wörld";
        assert_eq!(slice(s, 1, 5), "éllo");
        assert_eq!(slice(s, 6, 100), "wörld");
        assert_eq!(slice(s, 20, 30), "");
        assert_eq!(slice_from(s, 7), "örld");
    }

    #[test]
    fn splice_and_remove() {
        assert_eq!(splice("héllo", 2, "XY"), "héXYllo");
        assert_eq!(splice("abc", 10, "d"), "abcd");
        assert_eq!(remove("héllo", 1, 2), "hlo");
    }

    #[test]
    fn lines_round_trip() {
        let lines = vec!["a".to_string(), String::new(), "bc".to_string()];
        let text = join_lines(&lines);
        assert_eq!(text, "a\n\nbc");
        assert_eq!(split_lines(&text), lines);
        assert_eq!(doc_length(&lines), 5);
    }

    #[test]
    fn sanitize_replaces_astral_characters() {
        assert!(matches!(sanitize("plain é"), Cow::Borrowed(_)));
        assert_eq!(sanitize("a\u{1D400}b"), "a\u{FFFD}\u{FFFD}b");
    }

    #[test]
    fn char_index_slices_like_slice() {
        let text = "0123456789abcdefg";
        let index = CharIndex::new(text);
        assert_eq!(index.len(), 17);
        assert_eq!(index.slice(10, 5), "abcde");
        assert_eq!(index.slice(15, 10), "fg");
        assert_eq!(index.slice(30, 1), "");
    }
}
