//! Chunking strategies
//!
//! All slicing is in characters, not bytes, so multi-byte input never splits
//! a code point. `fixed` guarantees: every input character appears in at
//! least one chunk, and adjacent chunks share exactly `overlap` characters
//! (the final chunk may be shorter).

use crate::types::ChunkStrategy;

/// Split `text` with the given strategy.
pub fn chunk_text(
    text: &str,
    strategy: ChunkStrategy,
    chunk_size: usize,
    overlap: usize,
) -> Vec<String> {
    match strategy {
        ChunkStrategy::Fixed => chunk_fixed(text, chunk_size, overlap),
        ChunkStrategy::SlidingWindow => chunk_sliding_window(text, chunk_size),
        ChunkStrategy::PerEntity => chunk_per_entity(text),
        ChunkStrategy::Semantic => chunk_semantic(text, chunk_size, overlap),
    }
}

/// Deterministic character slicing with overlap.
pub fn chunk_fixed(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    assert!(overlap < chunk_size, "overlap must be smaller than chunk size");
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }

    let step = chunk_size - overlap;
    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + chunk_size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

/// Fixed window with a step of 80% of the window size.
pub fn chunk_sliding_window(text: &str, window: usize) -> Vec<String> {
    let overlap = window - ((window as f64 * 0.8) as usize).max(1);
    chunk_fixed(text, window, overlap.min(window - 1))
}

/// One chunk per non-blank line.
pub fn chunk_per_entity(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Boundary-preferring splitter.
///
/// Within each window the split lands on the last sentence-ending
/// punctuation or markdown heading boundary; a window with no boundary
/// degrades to a fixed-size cut.
pub fn chunk_semantic(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let window_end = (start + chunk_size).min(chars.len());
        if window_end == chars.len() {
            chunks.push(chars[start..].iter().collect());
            break;
        }

        let cut = find_boundary(&chars, start, window_end).unwrap_or(window_end);
        chunks.push(chars[start..cut].iter().collect());
        // Fall back to fixed stepping when the boundary made no progress.
        start = if cut > start {
            cut
        } else {
            start + chunk_size.saturating_sub(overlap).max(1)
        };
    }
    chunks.retain(|c: &String| !c.trim().is_empty());
    chunks
}

/// Last boundary inside `[start, end)`: sentence-ending punctuation followed
/// by whitespace, a blank line, or a markdown heading start.
fn find_boundary(chars: &[char], start: usize, end: usize) -> Option<usize> {
    let mut best = None;
    let mut i = start;
    while i + 1 < end {
        let c = chars[i];
        let next = chars[i + 1];
        let is_sentence_end =
            matches!(c, '.' | '!' | '?') && next.is_whitespace();
        let is_blank_line = c == '\n' && next == '\n';
        let is_heading = c == '\n' && next == '#';
        if is_sentence_end || is_blank_line || is_heading {
            best = Some(i + 1);
        }
        i += 1;
    }
    // A boundary at the very start would produce an empty chunk.
    best.filter(|&b| b > start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_covers_every_character() {
        let text = "abcdefghijklmnopqrstuvwxyz";
        let chunks = chunk_fixed(text, 8, 3);

        let mut covered = vec![false; text.len()];
        let step = 8 - 3;
        for (i, chunk) in chunks.iter().enumerate() {
            let start = i * step;
            for (j, c) in chunk.chars().enumerate() {
                assert_eq!(text.chars().nth(start + j).unwrap(), c);
                covered[start + j] = true;
            }
        }
        assert!(covered.iter().all(|&c| c));
    }

    #[test]
    fn fixed_adjacent_chunks_share_exact_overlap() {
        let text = "abcdefghijklmnopqrstuvwxyz0123456789";
        let overlap = 4;
        let chunks = chunk_fixed(text, 10, overlap);
        for pair in chunks.windows(2) {
            let prev: Vec<char> = pair[0].chars().collect();
            let next: Vec<char> = pair[1].chars().collect();
            let tail: String = prev[prev.len() - overlap..].iter().collect();
            let head: String = next[..overlap.min(next.len())].iter().collect();
            if next.len() >= overlap {
                assert_eq!(tail, head);
            }
        }
    }

    #[test]
    fn fixed_last_chunk_may_be_short() {
        let chunks = chunk_fixed("abcdefghij", 5, 2);
        // starts at 0, 3, 6: "abcde", "defgh", "ghij"
        assert_eq!(chunks, vec!["abcde", "defgh", "ghij"]);
    }

    #[test]
    fn fixed_short_input_is_single_chunk() {
        assert_eq!(chunk_fixed("abc", 10, 2), vec!["abc"]);
        assert!(chunk_fixed("", 10, 2).is_empty());
    }

    #[test]
    fn fixed_handles_multibyte_characters() {
        let text = "héllo wörld, ça va très bien aujourd'hui";
        let chunks = chunk_fixed(text, 10, 2);
        let rejoined: String = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| {
                if i == 0 {
                    c.clone()
                } else {
                    c.chars().skip(2).collect()
                }
            })
            .collect();
        assert_eq!(rejoined, text);
    }

    #[test]
    #[should_panic]
    fn fixed_rejects_overlap_ge_size() {
        chunk_fixed("abc", 5, 5);
    }

    #[test]
    fn sliding_window_uses_eighty_percent_step() {
        let text = "a".repeat(100);
        let chunks = chunk_sliding_window(&text, 10);
        // Step 8: starts 0, 8, 16, … last window reaches the end.
        assert_eq!(chunks[0].len(), 10);
        assert!(chunks.len() >= 12);
    }

    #[test]
    fn per_entity_splits_lines_and_drops_blanks() {
        let text = "alpha\n\n  beta  \n\ngamma\n";
        assert_eq!(chunk_per_entity(text), vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn semantic_prefers_sentence_boundaries() {
        let text = "First sentence here. Second sentence is longer. Third one closes.";
        let chunks = chunk_semantic(text, 30, 5);
        assert!(chunks.len() >= 2);
        assert!(chunks[0].trim_end().ends_with('.'));
    }

    #[test]
    fn semantic_splits_on_headings() {
        let text = "# Intro\nSome intro text here.\n## Details\nMore detailed text follows here.";
        let chunks = chunk_semantic(text, 40, 5);
        assert!(chunks.iter().any(|c| c.starts_with('#')));
    }

    #[test]
    fn semantic_falls_back_to_fixed_without_boundaries() {
        let text = "x".repeat(95);
        let chunks = chunk_semantic(&text, 30, 5);
        assert!(chunks.len() > 1);
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, 95);
    }

    #[test]
    fn strategy_dispatch() {
        let text = "one\ntwo\nthree";
        assert_eq!(
            chunk_text(text, ChunkStrategy::PerEntity, 100, 10).len(),
            3
        );
        assert_eq!(chunk_text(text, ChunkStrategy::Fixed, 100, 10).len(), 1);
    }
}
