use tracing::debug;

use crate::retriever::SearchResult;

/// Keeps results scoring at least `ratio` times the best score in the batch.
///
/// A batch whose best score is negative has a threshold above every score
/// and comes back empty.
pub fn filter_results(results: Vec<SearchResult>, ratio: f64) -> Vec<SearchResult> {
    let Some(max_score) = results
        .iter()
        .map(|r| r.hybrid_score)
        .reduce(f64::max)
    else {
        return results;
    };
    let threshold = ratio * max_score;
    let kept: Vec<SearchResult> = results
        .into_iter()
        .filter(|r| r.hybrid_score >= threshold)
        .collect();
    debug!(kept = kept.len(), threshold, "filtered search results");
    kept
}
