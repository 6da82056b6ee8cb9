//! Text normalization and lightweight lexical similarity.
//!
//! Used by fingerprinting (whitespace/case normalization), by the collection
//! merge step (near-duplicate detection), and to score source items that
//! arrive without a relevance signal.
//!
//! # Near-duplicate similarity
//!
//! Two texts are compared as sets of normalized tokens (lowercase,
//! alphanumeric runs). Similarity is the Jaccard index `|A ∩ B| / |A ∪ B|`.
//! Punctuation and casing never contribute, so `"Road closed!"` and
//! `"road closed"` score `1.0`.

use std::collections::{HashMap, HashSet};

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by", "is",
    "was", "are", "were", "be", "been", "being", "have", "has", "had", "do", "does", "did", "will",
    "would", "could", "should", "may", "might", "must", "can", "this", "that", "these", "those",
    "i", "you", "he", "she", "it", "we", "they", "my", "your", "his", "her", "its", "our", "their",
];

/// Collapse whitespace runs to a single space, trim, and lowercase.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Lowercase alphanumeric tokens, in order of appearance.
pub fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
        .collect()
}

/// Jaccard index over token sets. Two empty texts are identical (`1.0`).
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let set_a: HashSet<String> = tokens(a).into_iter().collect();
    let set_b: HashSet<String> = tokens(b).into_iter().collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

/// Most frequent non-stopword tokens longer than three characters.
///
/// Ties keep first-appearance order so the result is deterministic.
pub fn extract_keywords(text: &str, max_keywords: usize) -> Vec<String> {
    let mut freq: HashMap<String, (usize, usize)> = HashMap::new();
    for (pos, tok) in tokens(text).into_iter().enumerate() {
        if tok.chars().count() <= 3 || STOPWORDS.contains(&tok.as_str()) {
            continue;
        }
        freq.entry(tok).or_insert((0, pos)).0 += 1;
    }
    let mut ranked: Vec<(String, usize, usize)> =
        freq.into_iter().map(|(t, (n, pos))| (t, n, pos)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked
        .into_iter()
        .take(max_keywords)
        .map(|(t, _, _)| t)
        .collect()
}

/// Fraction of `keywords` present in `text`, in `[0.0, 1.0]`.
pub fn keyword_relevance(text: &str, keywords: &[String]) -> f64 {
    if keywords.is_empty() {
        return 0.0;
    }
    let lower = text.to_lowercase();
    let matches = keywords
        .iter()
        .filter(|k| lower.contains(k.to_lowercase().as_str()))
        .count();
    (matches as f64 / keywords.len() as f64).min(1.0)
}
