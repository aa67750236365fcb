//! Time-of-day metric baselines.
//!
//! A baseline is kept per (metric, UTC hour bucket) so nightly quiet periods
//! do not flag daytime traffic as anomalous. Entries expire; the caller
//! recomputes on miss.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Sample statistics for one metric in one time-of-day bucket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub mean: f64,
    /// Sample standard deviation (n-1).
    pub stddev: f64,
    pub window_start: i64,
    pub window_end: i64,
    pub expires_at: i64,
}

/// Mean and sample standard deviation. Fewer than two samples yield zero
/// spread.
pub fn compute_stats(samples: &[f64]) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    if samples.len() < 2 {
        return (mean, 0.0);
    }
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, variance.sqrt())
}

/// UTC hour bucket (0..24) for a nanosecond timestamp.
pub fn hour_bucket(timestamp_ns: i64) -> u8 {
    Utc.timestamp_nanos(timestamp_ns).hour() as u8
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
struct BaselineKey {
    metric: String,
    bucket: u8,
}

pub struct BaselineCache {
    entries: Mutex<HashMap<BaselineKey, Baseline>>,
}

impl BaselineCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// A live (unexpired) baseline for the metric at the given time.
    pub fn get(&self, metric: &str, timestamp_ns: i64) -> Option<Baseline> {
        let key = BaselineKey {
            metric: metric.to_string(),
            bucket: hour_bucket(timestamp_ns),
        };
        let entries = self.entries.lock().expect("baseline cache poisoned");
        entries
            .get(&key)
            .filter(|b| b.expires_at > timestamp_ns)
            .cloned()
    }

    pub fn insert(&self, metric: &str, timestamp_ns: i64, baseline: Baseline) {
        let key = BaselineKey {
            metric: metric.to_string(),
            bucket: hour_bucket(timestamp_ns),
        };
        self.entries
            .lock()
            .expect("baseline cache poisoned")
            .insert(key, baseline);
    }

    /// Drops expired entries.
    pub fn evict_expired(&self, now_ns: i64) -> usize {
        let mut entries = self.entries.lock().expect("baseline cache poisoned");
        let before = entries.len();
        entries.retain(|_, b| b.expires_at > now_ns);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("baseline cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BaselineCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_stddev_uses_n_minus_one() {
        let (mean, stddev) = compute_stats(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((mean - 5.0).abs() < 1e-9);
        // Sample variance of this classic set is 32/7.
        assert!((stddev - (32.0f64 / 7.0).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn single_sample_has_zero_spread() {
        assert_eq!(compute_stats(&[3.0]), (3.0, 0.0));
        assert_eq!(compute_stats(&[]), (0.0, 0.0));
    }

    #[test]
    fn buckets_separate_time_of_day() {
        let noon = Utc
            .with_ymd_and_hms(2024, 6, 1, 12, 0, 0)
            .unwrap()
            .timestamp_nanos_opt()
            .unwrap();
        let midnight = Utc
            .with_ymd_and_hms(2024, 6, 1, 0, 30, 0)
            .unwrap()
            .timestamp_nanos_opt()
            .unwrap();

        let cache = BaselineCache::new();
        cache.insert(
            "rps",
            noon,
            Baseline {
                mean: 100.0,
                stddev: 10.0,
                window_start: 0,
                window_end: noon,
                expires_at: i64::MAX,
            },
        );

        assert!(cache.get("rps", noon).is_some());
        assert!(cache.get("rps", midnight).is_none());
    }

    #[test]
    fn expired_entries_miss_and_evict() {
        let cache = BaselineCache::new();
        cache.insert(
            "rps",
            1_000,
            Baseline {
                mean: 1.0,
                stddev: 0.0,
                window_start: 0,
                window_end: 500,
                expires_at: 2_000,
            },
        );
        assert!(cache.get("rps", 1_500).is_some());
        assert!(cache.get("rps", 2_500).is_none());
        assert_eq!(cache.evict_expired(3_000), 1);
        assert!(cache.is_empty());
    }
}
