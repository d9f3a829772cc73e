//! Splits long content into bounded, order-preserving chunks.
//!
//! Lengths are counted in chars. A cut prefers, in order, a paragraph
//! break, a sentence end, then any whitespace, but only inside the latter
//! half of the window; otherwise it falls back to a hard cut.

/// Default chunk size in chars.
pub const DEFAULT_CHUNK_CHARS: usize = 8000;

/// Split `text` into chunks of at most `max_chars` chars.
///
/// Chunks are trimmed and whitespace-only chunks are dropped.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let hard_end = (start + max_chars).min(chars.len());
        let end = if hard_end == chars.len() {
            hard_end
        } else {
            find_cut(&chars, start, hard_end, max_chars)
        };

        let chunk: String = chars[start..end].iter().collect();
        let trimmed = chunk.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }
        start = end;
    }
    chunks
}

/// Best cut position in `(start + max/2, hard_end]`.
fn find_cut(chars: &[char], start: usize, hard_end: usize, max_chars: usize) -> usize {
    let floor = start + max_chars / 2;

    // Cut positions are exclusive ends, scanned from the back.
    let candidates = || (floor + 1..=hard_end).rev();

    let paragraph = candidates().find(|&cut| {
        cut >= 2 && cut - 2 >= start && chars[cut - 1] == '\n' && chars[cut - 2] == '\n'
    });
    if let Some(cut) = paragraph {
        return cut;
    }

    let sentence = candidates().find(|&cut| {
        is_sentence_end(chars[cut - 1]) && chars.get(cut).is_none_or(|c| c.is_whitespace())
    });
    if let Some(cut) = sentence {
        return cut;
    }

    candidates()
        .find(|&cut| chars[cut - 1].is_whitespace())
        .unwrap_or(hard_end)
}

pub(crate) fn is_sentence_end(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '。' | '！' | '？')
}
