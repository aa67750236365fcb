//! Statistical anomaly detection over metric samples.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use super::baseline::Baseline;

/// Metric names matching this are error-rate metrics, where a 2-sigma
/// deviation is already critical.
static ERROR_RATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)5xx|error|failed|failure").expect("error-rate regex")
});

const ERROR_RATE_CRITICAL_SIGMA: f64 = 2.0;
const NORMAL_CRITICAL_SIGMA: f64 = 3.0;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Clone, Debug, Serialize)]
pub struct Anomaly {
    pub metric: String,
    pub value: f64,
    pub z_score: f64,
    pub severity: Severity,
    pub baseline_mean: f64,
    pub baseline_stddev: f64,
}

pub fn is_error_rate_metric(name: &str) -> bool {
    ERROR_RATE_RE.is_match(name)
}

/// Absolute z-score; zero when the baseline has no spread.
pub fn z_score(value: f64, mean: f64, stddev: f64) -> f64 {
    if stddev == 0.0 || !stddev.is_finite() {
        return 0.0;
    }
    ((value - mean) / stddev).abs()
}

/// Evaluates one sample against its baseline.
pub fn detect(metric: &str, value: f64, baseline: &Baseline) -> Option<Anomaly> {
    let z = z_score(value, baseline.mean, baseline.stddev);
    let critical_at = if is_error_rate_metric(metric) {
        ERROR_RATE_CRITICAL_SIGMA
    } else {
        NORMAL_CRITICAL_SIGMA
    };

    let severity = if z >= critical_at {
        Severity::Critical
    } else if z >= critical_at - 1.0 {
        Severity::Warning
    } else {
        return None;
    };

    Some(Anomaly {
        metric: metric.to_string(),
        value,
        z_score: z,
        severity,
        baseline_mean: baseline.mean,
        baseline_stddev: baseline.stddev,
    })
}

/// Orders anomalies most-severe first, ties broken by z-score.
pub fn rank(mut anomalies: Vec<Anomaly>) -> Vec<Anomaly> {
    anomalies.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then(b.z_score.partial_cmp(&a.z_score).unwrap_or(std::cmp::Ordering::Equal))
    });
    anomalies
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baseline(mean: f64, stddev: f64) -> Baseline {
        Baseline {
            mean,
            stddev,
            window_start: 0,
            window_end: 0,
            expires_at: i64::MAX,
        }
    }

    #[test]
    fn zero_stddev_never_divides() {
        assert_eq!(z_score(100.0, 0.0, 0.0), 0.0);
        assert!(detect("http_requests_total", 100.0, &baseline(0.0, 0.0)).is_none());
    }

    #[test]
    fn error_rate_metrics_are_critical_at_two_sigma() {
        let b = baseline(10.0, 5.0);
        // z = 2.4
        let anomaly = detect("http_5xx_rate", 22.0, &b).unwrap();
        assert_eq!(anomaly.severity, Severity::Critical);

        // The same deviation on a normal metric is only a warning.
        let anomaly = detect("http_requests_total", 22.0, &b).unwrap();
        assert_eq!(anomaly.severity, Severity::Warning);
    }

    #[test]
    fn normal_metrics_are_critical_at_three_sigma() {
        let b = baseline(10.0, 5.0);
        let anomaly = detect("queue_depth", 26.0, &b).unwrap(); // z = 3.2
        assert_eq!(anomaly.severity, Severity::Critical);
    }

    #[test]
    fn small_deviations_are_not_anomalies() {
        let b = baseline(10.0, 5.0);
        assert!(detect("queue_depth", 12.0, &b).is_none()); // z = 0.4
    }

    #[test]
    fn error_rate_name_matching() {
        assert!(is_error_rate_metric("api_5xx_count"));
        assert!(is_error_rate_metric("requests_failed_total"));
        assert!(is_error_rate_metric("login_failures"));
        assert!(is_error_rate_metric("Payment_Errors"));
        assert!(!is_error_rate_metric("http_requests_total"));
    }

    #[test]
    fn ranking_puts_critical_first() {
        let b = baseline(10.0, 5.0);
        let ranked = rank(vec![
            detect("queue_depth", 22.0, &b).unwrap(),       // warning
            detect("http_5xx_rate", 40.0, &b).unwrap(),     // critical, z=6
            detect("disk_errors_total", 22.0, &b).unwrap(), // critical, z=2.4
        ]);
        assert_eq!(ranked[0].metric, "http_5xx_rate");
        assert_eq!(ranked[1].metric, "disk_errors_total");
        assert_eq!(ranked[2].metric, "queue_depth");
    }
}
