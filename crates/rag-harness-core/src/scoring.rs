//! Hybrid scoring and highlight extraction.
//!
//! # Hybrid Scoring
//!
//! ```text
//! score = w_vec × (1 − cosine_distance) + w_text × text_rank
//! ```
//!
//! `text_rank` comes from a [`TextRanker`]. The formula stays fixed whichever
//! ranker is plugged in, so swapping [`ZeroRanker`] for
//! [`TermOverlapRanker`] never changes the query contract. Final scores are
//! clamped to `[0, 1]` and sorted by score (desc), then chunk id (asc).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::embedding::score_from_distance;
use crate::models::ScoredChunk;

/// Maximum characters kept per highlight.
pub const MAX_HIGHLIGHT_CHARS: usize = 240;

/// Weights for the hybrid score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HybridWeights {
    pub w_vec: f64,
    pub w_text: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            w_vec: 0.8,
            w_text: 0.2,
        }
    }
}

/// Lexical relevance of `text` for `query`, in `[0, 1]`.
pub trait TextRanker: Send + Sync {
    fn name(&self) -> &'static str;
    fn rank(&self, query: &str, text: &str) -> f64;
}

/// Ranker that contributes nothing. Scores are then pure vector similarity
/// scaled by `w_vec`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroRanker;

impl TextRanker for ZeroRanker {
    fn name(&self) -> &'static str {
        "zero"
    }

    fn rank(&self, _query: &str, _text: &str) -> f64 {
        0.0
    }
}

/// Fraction of distinct query terms that occur in the text.
#[derive(Debug, Clone, Copy, Default)]
pub struct TermOverlapRanker;

impl TextRanker for TermOverlapRanker {
    fn name(&self) -> &'static str {
        "term_overlap"
    }

    fn rank(&self, query: &str, text: &str) -> f64 {
        let terms = terms(query);
        if terms.is_empty() {
            return 0.0;
        }
        let haystack = terms_of(text);
        let hits = terms.iter().filter(|t| haystack.contains(*t)).count();
        hits as f64 / terms.len() as f64
    }
}

/// Build a ranker from its configured name. Unknown names yield `None`.
pub fn ranker_by_name(name: &str) -> Option<Box<dyn TextRanker>> {
    match name {
        "zero" => Some(Box::new(ZeroRanker)),
        "term_overlap" => Some(Box::new(TermOverlapRanker)),
        _ => None,
    }
}

/// Combine a cosine distance and a text rank.
pub fn hybrid_score(distance: f32, text_rank: f64, weights: HybridWeights) -> f64 {
    let vec_score = score_from_distance(distance);
    let rank = text_rank.clamp(0.0, 1.0);
    (weights.w_vec * vec_score + weights.w_text * rank).clamp(0.0, 1.0)
}

/// Score `hits` in place against `query` and sort them best first.
pub fn rerank(hits: &mut Vec<ScoredChunk>, query: &str, ranker: &dyn TextRanker, weights: HybridWeights) {
    for hit in hits.iter_mut() {
        let rank = ranker.rank(query, &hit.chunk.text);
        hit.score = hybrid_score(hit.distance, rank, weights);
    }
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
}

/// Pick up to `max` sentences of `text` that mention a query term.
///
/// Falls back to the leading sentence when nothing matches, so a hit always
/// carries at least one highlight when its text is non-empty.
pub fn extract_highlights(text: &str, query: &str, max: usize) -> Vec<String> {
    let sentences = split_sentences(text);
    if sentences.is_empty() || max == 0 {
        return Vec::new();
    }
    let wanted = terms(query);
    let mut out: Vec<String> = sentences
        .iter()
        .filter(|s| {
            let have = terms_of(s);
            wanted.iter().any(|t| have.contains(t))
        })
        .take(max)
        .map(|s| clip(s))
        .collect();
    if out.is_empty() {
        out.push(clip(sentences[0]));
    }
    out
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        let end_of_sentence = matches!(b, b'.' | b'!' | b'?')
            && bytes.get(i + 1).map(|n| n.is_ascii_whitespace()).unwrap_or(true);
        if end_of_sentence || *b == b'\n' {
            let s = text[start..=i].trim();
            if !s.is_empty() {
                out.push(s);
            }
            start = i + 1;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

fn clip(s: &str) -> String {
    if s.chars().count() <= MAX_HIGHLIGHT_CHARS {
        return s.to_string();
    }
    let mut out: String = s.chars().take(MAX_HIGHLIGHT_CHARS).collect();
    out.push('…');
    out
}

fn terms(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_lowercase())
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

fn terms_of(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}
