//! Structure-aware document chunker with a character-window fallback.
//!
//! Splits prose into [`Chunk`]s that target a token budget while keeping
//! headings and sentences intact. Every chunk is an exact byte slice of the
//! input, so stored chunks can be mapped back to the source text.
//!
//! # Algorithm
//!
//! 1. Segment the text on Markdown headings, paragraph breaks, and sentence
//!    terminators (`.`, `!`, `?` followed by whitespace).
//! 2. Greedily merge segments into windows of about `target_tokens`. A
//!    window may grow past the target while it is still below `min_tokens`,
//!    and may overshoot `max_tokens` by a small slack when the next segment
//!    is tiny. Headings start a new window once the current one is viable.
//! 3. Segments that alone exceed `max_tokens` are cut with character windows.
//! 4. If grouping leaves a non-final window below `min_tokens`, the whole
//!    document is re-chunked with character windows and flagged `degraded`.
//!
//! Character windows are about 4 characters per token. Their overlap is
//! clamped to 10–15% of the window, and the last window always ends exactly
//! at the end of the input.
//!
//! # Example
//!
//! ```rust
//! use rag_harness_core::chunk::chunk_document;
//! use rag_harness_core::models::ChunkMethod;
//!
//! let chunks = chunk_document("# Title\n\nSentence one. Sentence two.", 50, 10, 80, 0.1);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].metadata.method, ChunkMethod::Semantic);
//! ```

use crate::models::{CaptionItem, Chunk, ChunkMetadata, ChunkMethod};

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Lower and upper clamp for character-window overlap.
const MIN_OVERLAP_RATIO: f32 = 0.10;
const MAX_OVERLAP_RATIO: f32 = 0.15;

/// Upper bound for the optional caption summary chunk.
const MAX_SUMMARY_TOKENS: usize = 512;

/// Estimate the token count of `text`.
///
/// Averages the whitespace word count with `chars / 4`. The result is
/// deterministic and independent of any embedding backend.
pub fn estimate_tokens(text: &str) -> usize {
    let words = text.split_whitespace().count() as f64;
    let quarter_chars = text.chars().count() as f64 / CHARS_PER_TOKEN as f64;
    ((words + quarter_chars) / 2.0).round() as usize
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    start: usize,
    end: usize,
    heading: bool,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    start: usize,
    end: usize,
    method: ChunkMethod,
}

/// Split prose into bounded chunks. See the module docs for the algorithm.
///
/// Whitespace-only input yields no chunks. Out-of-range parameters are
/// normalized (`min <= target <= max`, `max >= 1`) rather than rejected.
pub fn chunk_document(
    text: &str,
    target_tokens: usize,
    min_tokens: usize,
    max_tokens: usize,
    overlap_ratio: f32,
) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let max_tokens = max_tokens.max(1);
    let min_tokens = min_tokens.min(max_tokens);
    let target_tokens = target_tokens.clamp(min_tokens.max(1), max_tokens);
    let slack = (max_tokens / 10).max(4);

    let segments = segment(text);
    let mut windows: Vec<Window> = Vec::new();
    let mut current: Option<(usize, usize)> = None;

    for seg in &segments {
        let seg_tokens = estimate_tokens(&text[seg.start..seg.end]);

        if seg_tokens > max_tokens {
            if let Some((s, e)) = current.take() {
                windows.push(semantic(s, e));
            }
            for (s, e) in char_windows(text, seg.start, seg.end, target_tokens, max_tokens, overlap_ratio) {
                windows.push(Window {
                    start: s,
                    end: e,
                    method: ChunkMethod::CharacterFallback,
                });
            }
            continue;
        }

        let Some((s, e)) = current else {
            current = Some((seg.start, seg.end));
            continue;
        };

        let current_tokens = estimate_tokens(&text[s..e]);
        let merged_tokens = estimate_tokens(&text[s..seg.end]);

        let extend = if seg.heading && current_tokens >= min_tokens {
            false
        } else if merged_tokens <= target_tokens {
            true
        } else if current_tokens < min_tokens && merged_tokens <= max_tokens {
            true
        } else {
            seg_tokens <= slack && merged_tokens <= max_tokens + slack
        };

        if extend {
            current = Some((s, seg.end));
        } else {
            windows.push(semantic(s, e));
            current = Some((seg.start, seg.end));
        }
    }
    if let Some((s, e)) = current {
        windows.push(semantic(s, e));
    }

    merge_undersized_tail(text, &mut windows, min_tokens, max_tokens + slack);

    let grouping_failed = windows
        .iter()
        .take(windows.len().saturating_sub(1))
        .any(|w| w.method == ChunkMethod::Semantic && estimate_tokens(&text[w.start..w.end]) < min_tokens);

    if grouping_failed {
        let ranges = char_windows(text, 0, text.len(), target_tokens, max_tokens, overlap_ratio);
        return build_chunks(
            text,
            ranges.into_iter().map(|(start, end)| Window {
                start,
                end,
                method: ChunkMethod::CharacterFallback,
            }),
            min_tokens,
            max_tokens,
        );
    }

    build_chunks(text, windows.into_iter(), min_tokens, max_tokens)
}

/// Chunk a list of captions: one chunk per non-empty caption, optionally
/// preceded by a summary chunk that joins them.
pub fn chunk_captions(items: &[CaptionItem], include_summary: bool) -> Vec<Chunk> {
    let captions: Vec<&CaptionItem> = items
        .iter()
        .filter(|item| !item.caption.trim().is_empty())
        .collect();

    let mut chunks = Vec::with_capacity(captions.len() + 1);

    if include_summary && !captions.is_empty() {
        let mut summary = String::new();
        for item in &captions {
            let candidate = if summary.is_empty() {
                item.caption.trim().to_string()
            } else {
                format!("{}\n{}", summary, item.caption.trim())
            };
            if !summary.is_empty() && estimate_tokens(&candidate) > MAX_SUMMARY_TOKENS {
                break;
            }
            summary = candidate;
        }
        chunks.push(Chunk {
            chunk_index: 0,
            token_estimate: estimate_tokens(&summary),
            text: summary,
            metadata: ChunkMetadata::new(ChunkMethod::Caption),
        });
    }

    for item in captions {
        let text = item.caption.trim().to_string();
        let mut metadata = ChunkMetadata::new(ChunkMethod::Caption);
        metadata.caption_id = Some(item.id.clone());
        chunks.push(Chunk {
            chunk_index: chunks.len(),
            token_estimate: estimate_tokens(&text),
            text,
            metadata,
        });
    }

    chunks
}

/// Cut `text[start..end]` into overlapping character windows.
///
/// Windows aim at `target_tokens * 4` bytes and shrink until their estimate
/// fits `max_tokens`. They prefer to end on whitespace in their last fifth.
/// The returned ranges start at `start`, end at `end`, and always advance.
pub fn char_windows(
    text: &str,
    start: usize,
    end: usize,
    target_tokens: usize,
    max_tokens: usize,
    overlap_ratio: f32,
) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    if start >= end {
        return out;
    }

    let window = target_tokens.max(1) * CHARS_PER_TOKEN;
    let ratio = overlap_ratio.clamp(MIN_OVERLAP_RATIO, MAX_OVERLAP_RATIO);
    let mut pos = start;

    loop {
        let mut w_end = floor_boundary(text, (pos + window).min(end));
        if w_end <= pos {
            w_end = ceil_boundary(text, pos + 1).min(end);
        }

        while estimate_tokens(&text[pos..w_end]) > max_tokens && w_end - pos > CHARS_PER_TOKEN {
            let shrunk = floor_boundary(text, pos + (w_end - pos) * 9 / 10);
            if shrunk <= pos {
                break;
            }
            w_end = shrunk;
        }

        if w_end < end {
            let break_from = floor_boundary(text, pos + (w_end - pos) * 4 / 5);
            if let Some((idx, ch)) = text[break_from..w_end]
                .char_indices()
                .rev()
                .find(|(_, c)| c.is_whitespace())
            {
                let candidate = break_from + idx + ch.len_utf8();
                if candidate > pos {
                    w_end = candidate;
                }
            }
            // Absorb a sliver of a tail rather than emitting a near-duplicate window.
            if end - w_end < (w_end - pos) / 10 {
                w_end = end;
            }
        }

        out.push((pos, w_end));
        if w_end >= end {
            break;
        }

        let span = w_end - pos;
        let overlap = ((span as f32) * ratio) as usize;
        let mut next = floor_boundary(text, w_end - overlap.min(span - 1));
        if next <= pos {
            next = w_end;
        }
        pos = next;
    }

    out
}

fn semantic(start: usize, end: usize) -> Window {
    Window {
        start,
        end,
        method: ChunkMethod::Semantic,
    }
}

fn merge_undersized_tail(text: &str, windows: &mut Vec<Window>, min_tokens: usize, ceiling: usize) {
    if windows.len() < 2 {
        return;
    }
    let last = windows[windows.len() - 1];
    let prev = windows[windows.len() - 2];
    if last.method != ChunkMethod::Semantic || prev.method != ChunkMethod::Semantic {
        return;
    }
    if estimate_tokens(&text[last.start..last.end]) >= min_tokens {
        return;
    }
    if estimate_tokens(&text[prev.start..last.end]) <= ceiling {
        windows.pop();
        if let Some(p) = windows.last_mut() {
            p.end = last.end;
        }
    }
}

fn build_chunks(
    text: &str,
    windows: impl Iterator<Item = Window>,
    min_tokens: usize,
    max_tokens: usize,
) -> Vec<Chunk> {
    windows
        .enumerate()
        .map(|(i, w)| {
            let slice = &text[w.start..w.end];
            let token_estimate = estimate_tokens(slice);
            let mut metadata = ChunkMetadata::new(w.method);
            metadata.degraded = w.method == ChunkMethod::CharacterFallback;
            metadata.overshoot = token_estimate < min_tokens || token_estimate > max_tokens;
            metadata.byte_start = Some(w.start);
            metadata.byte_end = Some(w.end);
            Chunk {
                chunk_index: i,
                text: slice.to_string(),
                token_estimate,
                metadata,
            }
        })
        .collect()
}

fn segment(text: &str) -> Vec<Segment> {
    let bytes = text.as_bytes();
    let len = bytes.len();
    let mut cuts = vec![0, len];
    let mut heading_starts = Vec::new();

    let mut line_start = 0;
    for line in text.split_inclusive('\n') {
        let line_end = line_start + line.len();
        if is_heading(line) {
            cuts.push(line_start);
            cuts.push(line_end);
            heading_starts.push(line_start);
        }
        line_start = line_end;
    }

    let mut i = 0;
    while i < len {
        let b = bytes[i];
        let sentence_end = matches!(b, b'.' | b'!' | b'?') && i + 1 < len && bytes[i + 1].is_ascii_whitespace();
        let paragraph_break = b == b'\n' && i + 1 < len && bytes[i + 1] == b'\n';
        if sentence_end || paragraph_break {
            let mut j = i + 1;
            while j < len && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            cuts.push(j);
            i = j;
            continue;
        }
        i += 1;
    }

    cuts.sort_unstable();
    cuts.dedup();

    let mut segments: Vec<Segment> = Vec::new();
    for pair in cuts.windows(2) {
        let (start, end) = (pair[0], pair[1]);
        if start == end {
            continue;
        }
        let blank = text[start..end].trim().is_empty();
        match segments.last_mut() {
            Some(prev) if blank => prev.end = end,
            _ => segments.push(Segment {
                start,
                end,
                heading: heading_starts.contains(&start),
            }),
        }
    }

    // Leading whitespace folds into the first real segment.
    if segments.len() > 1 && text[segments[0].start..segments[0].end].trim().is_empty() {
        let first = segments.remove(0);
        segments[0].start = first.start;
    }
    segments
}

fn is_heading(line: &str) -> bool {
    let trimmed = line.trim_start();
    let hashes = trimmed.bytes().take_while(|b| *b == b'#').count();
    if hashes == 0 || hashes > 6 {
        return false;
    }
    match trimmed.as_bytes().get(hashes) {
        None => true,
        Some(b) => b.is_ascii_whitespace(),
    }
}

pub(crate) fn floor_boundary(text: &str, mut idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

pub(crate) fn ceil_boundary(text: &str, mut idx: usize) -> usize {
    while idx < text.len() && !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx.min(text.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_covers(text: &str, chunks: &[Chunk]) {
        assert!(!chunks.is_empty());
        let mut covered = 0;
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i, "indices must be contiguous");
            let start = c.metadata.byte_start.unwrap();
            let end = c.metadata.byte_end.unwrap();
            assert!(start <= covered, "gap before chunk {}", i);
            assert!(end > covered, "chunk {} adds nothing", i);
            assert_eq!(&text[start..end], c.text);
            covered = end;
        }
        assert_eq!(covered, text.len());
    }

    fn prose(paragraphs: usize) -> String {
        (0..paragraphs)
            .map(|p| {
                format!(
                    "## Section {}\n\nThe harness indexes paragraph {} for retrieval. It keeps sentences whole where it can. \
                     Chunk boundaries follow headings first and sentences second.\n\n",
                    p, p
                )
            })
            .collect()
    }

    #[test]
    fn test_estimate_tokens_blend() {
        assert_eq!(estimate_tokens(""), 0);
        // 2 words, 11 chars -> (2 + 2.75) / 2 = 2.375
        assert_eq!(estimate_tokens("hello world"), 2);
        assert_eq!(estimate_tokens("hello world"), estimate_tokens("hello world"));
    }

    #[test]
    fn test_small_document_is_semantic() {
        let chunks = chunk_document("# Title\n\nSentence one. Sentence two.", 50, 10, 80, 0.1);
        assert!(!chunks.is_empty());
        assert_eq!(chunks[0].metadata.method, ChunkMethod::Semantic);
        assert!(!chunks[0].metadata.degraded);
    }

    #[test]
    fn test_empty_document() {
        assert!(chunk_document("", 50, 10, 80, 0.1).is_empty());
        assert!(chunk_document("  \n\n ", 50, 10, 80, 0.1).is_empty());
    }

    #[test]
    fn test_semantic_chunks_cover_text() {
        let text = prose(12);
        let chunks = chunk_document(&text, 60, 20, 100, 0.1);
        assert!(chunks.len() > 1);
        assert_covers(&text, &chunks);
        for c in &chunks {
            assert_eq!(c.metadata.method, ChunkMethod::Semantic);
        }
    }

    #[test]
    fn test_token_bounds_hold_unless_flagged() {
        let text = prose(20);
        let chunks = chunk_document(&text, 60, 20, 100, 0.1);
        for c in &chunks {
            let in_range = (20..=100).contains(&c.token_estimate);
            assert!(in_range || c.metadata.overshoot, "chunk {} out of range unflagged", c.chunk_index);
        }
        for c in &chunks[..chunks.len() - 1] {
            assert!(c.token_estimate >= 20, "non-final chunk {} below min", c.chunk_index);
        }
    }

    #[test]
    fn test_headings_start_new_chunks() {
        let text = prose(6);
        let chunks = chunk_document(&text, 40, 10, 80, 0.1);
        let starting_with_heading = chunks.iter().filter(|c| c.text.starts_with("## Section")).count();
        assert!(starting_with_heading >= 3);
    }

    #[test]
    fn test_unstructured_text_falls_back_to_char_windows() {
        let text = "lorem ipsum dolor sit amet ".repeat(200);
        let chunks = chunk_document(&text, 50, 20, 80, 0.5);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert_eq!(c.metadata.method, ChunkMethod::CharacterFallback);
            assert!(c.metadata.degraded);
            assert!(c.token_estimate <= 80);
        }
        let last = chunks.last().unwrap();
        assert_eq!(last.metadata.byte_end, Some(text.len()));
    }

    #[test]
    fn test_char_windows_overlap_is_clamped() {
        let text = "abcd ".repeat(400);
        let ranges = char_windows(&text, 0, text.len(), 50, 80, 0.9);
        assert!(ranges.len() > 2);
        for pair in ranges.windows(2) {
            let (s0, e0) = pair[0];
            let (s1, _) = pair[1];
            assert!(s1 > s0, "windows must advance");
            let overlap = e0 - s1;
            let span = e0 - s0;
            assert!(overlap as f32 <= span as f32 * 0.15 + 1.0);
        }
        assert_eq!(ranges.last().unwrap().1, text.len());
        let ends_at_tail = ranges.iter().filter(|(_, e)| *e == text.len()).count();
        assert_eq!(ends_at_tail, 1);
    }

    #[test]
    fn test_char_windows_multibyte_safe() {
        let text = "日本語のテキスト。".repeat(120);
        let ranges = char_windows(&text, 0, text.len(), 20, 40, 0.1);
        for (s, e) in &ranges {
            assert!(text.is_char_boundary(*s));
            assert!(text.is_char_boundary(*e));
        }
        assert_eq!(ranges.last().unwrap().1, text.len());
    }

    #[test]
    fn test_oversized_sentence_is_split_locally() {
        let huge = "word ".repeat(600);
        let text = format!("# Intro\n\nShort opener here. {}\n\n# Outro\n\nDone now.", huge);
        let chunks = chunk_document(&text, 60, 5, 100, 0.1);
        assert!(chunks.iter().any(|c| c.metadata.method == ChunkMethod::CharacterFallback));
        assert_eq!(chunks.last().unwrap().metadata.byte_end, Some(text.len()));
    }

    #[test]
    fn test_caption_chunks() {
        let items = vec![
            CaptionItem {
                id: "img-1".into(),
                caption: "A red bicycle leaning on a wall".into(),
            },
            CaptionItem {
                id: "img-2".into(),
                caption: "   ".into(),
            },
            CaptionItem {
                id: "img-3".into(),
                caption: "Sunset over a harbor".into(),
            },
        ];
        let plain = chunk_captions(&items, false);
        assert_eq!(plain.len(), 2);
        assert_eq!(plain[1].metadata.caption_id.as_deref(), Some("img-3"));

        let summarized = chunk_captions(&items, true);
        assert_eq!(summarized.len(), 3);
        assert!(summarized[0].metadata.caption_id.is_none());
        assert!(summarized[0].text.contains("bicycle") && summarized[0].text.contains("harbor"));
        assert_eq!(summarized[2].chunk_index, 2);
    }
}
