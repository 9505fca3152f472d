//! Fixed-bucket latency histogram.
//!
//! Buckets are upper bounds in milliseconds. An implicit `+Inf` bucket
//! catches everything above the last bound. Counts are exposed cumulatively
//! (Prometheus `le` semantics) while running min/max/sum/count are tracked
//! alongside.

use serde::{Deserialize, Serialize};

/// Bucket upper bounds in milliseconds (the `+Inf` bucket is implicit).
pub const LATENCY_BUCKETS_MS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

const BUCKET_COUNT: usize = LATENCY_BUCKETS_MS.len() + 1;

/// Latency histogram for one port.
#[derive(Debug, Clone, Default)]
pub struct LatencyHistogram {
    /// Per-bucket (non-cumulative) counts; the last slot is `+Inf`.
    counts: [u64; BUCKET_COUNT],
    count: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observation. Negative and NaN values are clamped to zero.
    pub fn observe(&mut self, value_ms: f64) {
        let value = if value_ms.is_finite() && value_ms > 0.0 {
            value_ms
        } else {
            0.0
        };

        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(BUCKET_COUNT - 1);
        self.counts[idx] += 1;

        self.count += 1;
        self.sum += value;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn min(&self) -> Option<f64> {
        self.min
    }

    pub fn max(&self) -> Option<f64> {
        self.max
    }

    /// Cumulative counts as `(upper_bound, count)` pairs, ending with `+Inf`.
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut running = 0u64;
        LATENCY_BUCKETS_MS
            .iter()
            .copied()
            .chain(std::iter::once(f64::INFINITY))
            .zip(self.counts.iter())
            .map(|(bound, count)| {
                running += count;
                (bound, running)
            })
            .collect()
    }

    /// Serializable view of the histogram.
    pub fn summary(&self) -> HistogramSummary {
        HistogramSummary {
            buckets: self
                .cumulative()
                .into_iter()
                .map(|(bound, count)| BucketCount {
                    le: format_bound(bound),
                    count,
                })
                .collect(),
            count: self.count,
            sum: self.sum,
            min: self.min,
            max: self.max,
        }
    }
}

/// Format a bucket bound the way Prometheus labels expect it.
pub fn format_bound(bound: f64) -> String {
    if bound.is_infinite() {
        "+Inf".to_string()
    } else {
        format!("{bound}")
    }
}

/// One cumulative bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketCount {
    pub le: String,
    pub count: u64,
}

/// Histogram view used by `/status` and the Prometheus exporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub buckets: Vec<BucketCount>,
    pub count: u64,
    pub sum: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_histogram() {
        let hist = LatencyHistogram::new();
        assert_eq!(hist.count(), 0);
        assert!(hist.min().is_none());
        assert!(hist.cumulative().iter().all(|(_, c)| *c == 0));
    }

    #[test]
    fn test_observe_places_values_in_buckets() {
        let mut hist = LatencyHistogram::new();
        hist.observe(0.4);
        hist.observe(3.0);
        hist.observe(5.0);
        hist.observe(7_500.0);

        let cumulative = hist.cumulative();
        assert_eq!(cumulative.len(), LATENCY_BUCKETS_MS.len() + 1);
        assert_eq!(cumulative[0], (1.0, 1));
        assert_eq!(cumulative[1], (5.0, 3));
        assert_eq!(cumulative[10], (5000.0, 3));
        assert_eq!(cumulative[11].1, 4);
        assert!(cumulative[11].0.is_infinite());

        assert_eq!(hist.count(), 4);
        assert_eq!(hist.min(), Some(0.4));
        assert_eq!(hist.max(), Some(7_500.0));
        assert!((hist.sum() - 7_508.4).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_values_clamped_to_zero() {
        let mut hist = LatencyHistogram::new();
        hist.observe(-3.0);
        hist.observe(f64::NAN);
        assert_eq!(hist.count(), 2);
        assert_eq!(hist.max(), Some(0.0));
        assert_eq!(hist.cumulative()[0].1, 2);
    }

    #[test]
    fn test_summary_labels() {
        let mut hist = LatencyHistogram::new();
        hist.observe(12.0);
        let summary = hist.summary();
        assert_eq!(summary.buckets.first().map(|b| b.le.as_str()), Some("1"));
        assert_eq!(summary.buckets.last().map(|b| b.le.as_str()), Some("+Inf"));
        assert_eq!(summary.buckets.last().map(|b| b.count), Some(1));
    }
}
