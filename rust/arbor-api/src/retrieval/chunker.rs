//! Greedy fixed-window text splitter for attachment ingestion.
//!
//! Windows are measured in characters. The splitter prefers to break at a
//! paragraph or sentence boundary when one falls in roughly the last 60%
//! of the window, and hard-cuts at the window edge otherwise. Consecutive
//! chunks overlap so no sentence is stranded at a cut point.

/// Splitter configuration.
#[derive(Debug, Clone, Copy)]
pub struct ChunkerConfig {
    /// Window size in characters.
    pub window: usize,
    /// Overlap between consecutive chunks, in characters.
    pub overlap: usize,
}

/// Default window size.
pub const DEFAULT_WINDOW: usize = 2_400;
/// Default overlap.
pub const DEFAULT_OVERLAP: usize = 240;

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            overlap: DEFAULT_OVERLAP,
        }
    }
}

/// Split `text` into overlapping windows.
///
/// Every chunk is at most `window` chars; every chunk after the first
/// starts no later than `overlap` chars before the previous chunk's end.
pub fn split_text(text: &str, config: &ChunkerConfig) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    let window = config.window.max(1);
    // Overlap must leave forward progress.
    let overlap = config.overlap.min(window.saturating_sub(1));

    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        let hard_end = (start + window).min(chars.len());
        let end = if hard_end < chars.len() {
            preferred_break(&chars, start, hard_end, window).unwrap_or(hard_end)
        } else {
            hard_end
        };

        chunks.push(chars[start..end].iter().collect());

        if end >= chars.len() {
            break;
        }
        start = end.saturating_sub(overlap);
    }

    chunks
}

/// Look for a paragraph or sentence boundary in roughly the last 60% of
/// the window, scanning backwards from the hard cut. Returns the index
/// one past the boundary, or `None` when no boundary qualifies.
fn preferred_break(chars: &[char], start: usize, hard_end: usize, window: usize) -> Option<usize> {
    let floor = start + (window * 2) / 5;

    // Paragraph break first: blank line.
    let mut idx = hard_end;
    while idx > floor + 1 {
        if chars[idx - 1] == '\n' && chars[idx - 2] == '\n' {
            return Some(idx);
        }
        idx -= 1;
    }

    // Sentence boundary: terminator followed by whitespace, or a newline.
    let mut idx = hard_end;
    while idx > floor + 1 {
        let prev = chars[idx - 2];
        let cur = chars[idx - 1];
        if cur == '\n' {
            return Some(idx);
        }
        if matches!(prev, '.' | '!' | '?') && cur.is_whitespace() {
            return Some(idx);
        }
        idx -= 1;
    }

    None
}

/// Rough token estimate used for chunk accounting.
pub fn approx_token_count(text: &str) -> u32 {
    u32::try_from(text.chars().count().div_ceil(4)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_thousand_chars_yield_three_overlapping_chunks() {
        let text = "a".repeat(5_000);
        let config = ChunkerConfig::default();
        let chunks = split_text(&text, &config);

        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 2_400));

        // Hard cuts at 2400/4560, restarts 240 back: 2400, 2400, 680.
        let lengths: Vec<usize> = chunks.iter().map(|c| c.chars().count()).collect();
        assert_eq!(lengths, vec![2_400, 2_400, 680]);
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = split_text("hello world", &ChunkerConfig::default());
        assert_eq!(chunks, vec!["hello world".to_string()]);
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(split_text("", &ChunkerConfig::default()).is_empty());
    }

    #[test]
    fn prefers_paragraph_boundary_in_tail_of_window() {
        // Paragraph break at 80 chars, inside the last 60% of a 100-char window.
        let text = format!("{}\n\n{}", "a".repeat(78), "b".repeat(200));
        let config = ChunkerConfig {
            window: 100,
            overlap: 10,
        };
        let chunks = split_text(&text, &config);
        assert!(chunks[0].ends_with("\n\n"));
        assert_eq!(chunks[0].chars().count(), 80);
    }

    #[test]
    fn prefers_sentence_boundary_over_hard_cut() {
        let text = format!("{}. {}", "a".repeat(70), "b".repeat(200));
        let config = ChunkerConfig {
            window: 100,
            overlap: 10,
        };
        let chunks = split_text(&text, &config);
        // Cut lands just after ". ", not at the 100-char edge.
        assert_eq!(chunks[0].chars().count(), 72);
        assert!(chunks[0].ends_with(". "));
    }

    #[test]
    fn hard_cut_when_no_boundary_in_tail() {
        let text = "a".repeat(250);
        let config = ChunkerConfig {
            window: 100,
            overlap: 10,
        };
        let chunks = split_text(&text, &config);
        assert_eq!(chunks[0].chars().count(), 100);
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(approx_token_count(""), 0);
        assert_eq!(approx_token_count("abcd"), 1);
        assert_eq!(approx_token_count("abcde"), 2);
    }
}
