//! Bag-of-words cosine similarity.
//!
//! Used to decide whether a new description diverges from the current head
//! and to rank retrieval candidates. Deliberately cheap: no stemming, no
//! embeddings.

use std::collections::HashMap;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on",
    "or", "that", "the", "this", "to", "was", "with",
];

/// Term counts of lower-cased alphanumeric tokens, stop words removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TermVector {
    counts: HashMap<String, f64>,
    norm: f64,
}

impl TermVector {
    pub fn new(text: &str) -> Self {
        let mut counts: HashMap<String, f64> = HashMap::new();
        for token in tokenize(text) {
            *counts.entry(token).or_default() += 1.0;
        }
        let norm = counts.values().map(|c| c * c).sum::<f64>().sqrt();
        Self { counts, norm }
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Cosine similarity in [0, 1]; zero when either side has no terms.
    pub fn cosine(&self, other: &TermVector) -> f64 {
        if self.norm == 0.0 || other.norm == 0.0 {
            return 0.0;
        }
        let (small, large) = if self.counts.len() <= other.counts.len() {
            (self, other)
        } else {
            (other, self)
        };
        let dot: f64 = small
            .counts
            .iter()
            .filter_map(|(term, a)| large.counts.get(term).map(|b| a * b))
            .sum();
        (dot / (self.norm * other.norm)).clamp(0.0, 1.0)
    }
}

/// Cosine similarity between two texts.
pub fn text_similarity(a: &str, b: &str) -> f64 {
    TermVector::new(a).cosine(&TermVector::new(b))
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
}
