//! Nearest-rank percentiles over a bounded sample window.

use serde::{Deserialize, Serialize};

/// Nearest-rank percentile of an ascending-sorted slice.
///
/// The rank is `ceil(p / 100 * n)`, clamped to `1..=n`. Returns `None` for
/// an empty slice.
pub fn nearest_rank(sorted: &[f64], percentile: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let rank = ((percentile / 100.0) * n as f64).ceil() as usize;
    let rank = rank.clamp(1, n);
    sorted.get(rank - 1).copied()
}

/// Latency distribution computed from one drained sample window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
    pub sample_count: usize,
}

impl LatencySummary {
    /// Sort the samples and compute the summary. `None` when empty.
    pub fn from_samples(mut samples: Vec<f64>) -> Option<Self> {
        samples.retain(|s| s.is_finite());
        if samples.is_empty() {
            return None;
        }
        samples.sort_by(f64::total_cmp);

        Some(Self {
            p50: nearest_rank(&samples, 50.0)?,
            p95: nearest_rank(&samples, 95.0)?,
            p99: nearest_rank(&samples, 99.0)?,
            min: *samples.first()?,
            max: *samples.last()?,
            sample_count: samples.len(),
        })
    }
}
