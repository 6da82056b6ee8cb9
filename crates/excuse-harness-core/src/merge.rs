//! Merge, deduplication, and filtering of collected reference material.
//!
//! # Merge Algorithm
//!
//! 1. Items are visited in arrival order (batch order, then item order).
//! 2. Items without a relevance signal are scored by keyword overlap with
//!    the topic.
//! 3. Each item is compared with every item kept so far using
//!    [`jaccard_similarity`] over `title + body`. At or above the threshold
//!    the two are near-duplicates and only one survives: the more recent
//!    `published_at`, then the higher source trust weight, then the one
//!    seen first.
//! 4. Survivors are sorted by relevance (desc), `published_at` (desc), then
//!    arrival order.

use std::cmp::Ordering;

use crate::models::SourceItem;
use crate::text::{extract_keywords, jaccard_similarity, keyword_relevance};

/// Items returned by one source, tagged with that source's trust weight.
#[derive(Debug, Clone)]
pub struct SourceBatch {
    pub source: String,
    pub trust_weight: f64,
    pub items: Vec<SourceItem>,
}

struct Kept {
    item: SourceItem,
    trust: f64,
    seq: usize,
    text: String,
}

fn dedup_text(item: &SourceItem) -> String {
    format!("{} {}", item.title, item.body)
}

/// Returns true if `challenger` should replace `incumbent`.
fn prefers(challenger: &SourceItem, challenger_trust: f64, incumbent: &Kept) -> bool {
    match challenger.published_at.cmp(&incumbent.item.published_at) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => challenger_trust > incumbent.trust,
    }
}

/// Merge batches into one deduplicated, relevance-ordered list.
pub fn merge_batches(batches: Vec<SourceBatch>, topic: &str, threshold: f64) -> Vec<SourceItem> {
    let keywords = extract_keywords(topic, 8);
    let mut kept: Vec<Kept> = Vec::new();
    let mut seq = 0usize;

    for batch in batches {
        for mut item in batch.items {
            if item.relevance <= 0.0 {
                item.relevance = keyword_relevance(&dedup_text(&item), &keywords);
            }
            item.relevance = item.relevance.clamp(0.0, 1.0);
            let text = dedup_text(&item);

            let duplicate = kept
                .iter()
                .position(|k| jaccard_similarity(&k.text, &text) >= threshold);

            match duplicate {
                Some(idx) => {
                    if prefers(&item, batch.trust_weight, &kept[idx]) {
                        let slot = &mut kept[idx];
                        slot.item = item;
                        slot.trust = batch.trust_weight;
                        slot.text = text;
                    }
                }
                None => kept.push(Kept {
                    item,
                    trust: batch.trust_weight,
                    seq,
                    text,
                }),
            }
            seq += 1;
        }
    }

    kept.sort_by(|a, b| {
        b.item
            .relevance
            .partial_cmp(&a.item.relevance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.item.published_at.cmp(&a.item.published_at))
            .then_with(|| a.seq.cmp(&b.seq))
    });

    kept.into_iter().map(|k| k.item).collect()
}

/// Drop items below `relevance_floor` and cap to `max_items`, preserving order.
pub fn filter_for_generation(
    items: &[SourceItem],
    relevance_floor: f64,
    max_items: usize,
) -> Vec<SourceItem> {
    items
        .iter()
        .filter(|i| i.relevance >= relevance_floor)
        .take(max_items)
        .cloned()
        .collect()
}
