//! Token-set similarity between stories.

use std::collections::HashSet;

/// Tokens shorter than this many characters are ignored.
pub const MIN_TOKEN_CHARS: usize = 3;

/// Token set of `title + " " + description`.
///
/// Lowercased; every non-alphanumeric character acts as a separator;
/// tokens shorter than [`MIN_TOKEN_CHARS`] are dropped.
#[must_use]
pub fn tokenize(title: &str, description: &str) -> HashSet<String> {
    format!("{title} {description}")
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().count() >= MIN_TOKEN_CHARS)
        .map(str::to_string)
        .collect()
}

/// Jaccard index `|A ∩ B| / |A ∪ B|`; `0.0` when either set is empty.
#[must_use]
pub fn jaccard<T: Eq + std::hash::Hash>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union_size = a.len() + b.len() - intersection;
    #[allow(clippy::cast_precision_loss)]
    let score = intersection as f64 / union_size as f64;
    score
}

/// Similarity score between two stories.
#[must_use]
pub fn story_similarity(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    jaccard(a, b)
}
