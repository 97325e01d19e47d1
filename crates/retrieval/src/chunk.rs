//! Overlapping-window text chunking.

/// Split `text` into windows of `size` characters advancing by
/// `size − overlap` (minimum step of one). Boundaries are character
/// boundaries, so multi-byte text never splits mid-codepoint.
pub fn chunk(text: &str, size: usize, overlap: usize) -> Vec<String> {
    if text.is_empty() || size == 0 {
        return Vec::new();
    }
    let chars: Vec<char> = text.chars().collect();
    let step = size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        start += step;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk("", 256, 32).is_empty());
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = chunk("hello", 256, 32);
        assert_eq!(chunks, vec!["hello"]);
    }

    #[test]
    fn windows_overlap_by_the_configured_amount() {
        let text: String = ('a'..='z').collect();
        let chunks = chunk(&text, 10, 4);
        assert_eq!(chunks[0], "abcdefghij");
        assert_eq!(chunks[1], "ghijklmnop");
        // Every consecutive pair shares the 4-char overlap.
        assert!(chunks[1].starts_with(&chunks[0][6..]));
    }

    #[test]
    fn overlap_ge_size_still_advances() {
        let chunks = chunk("abcdef", 2, 5);
        // step floors at 1, so the walk terminates.
        assert_eq!(chunks.len(), 6);
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let text = "héllø wörld €uro";
        let chunks = chunk(text, 4, 1);
        let rejoined: String = chunks.first().cloned().unwrap_or_default();
        assert_eq!(rejoined.chars().count(), 4);
    }
}
