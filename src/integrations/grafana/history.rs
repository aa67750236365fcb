//! Historical alert behavior: flappiness, baseline deviation, and
//! multi-label categorization.

use serde::Serialize;

use super::client::AlertState;
use crate::analysis::baseline::compute_stats;

/// Analysis window for flappiness: 6 hours.
pub const FLAP_WINDOW_NS: i64 = 6 * 3600 * 1_000_000_000;
/// Baseline distribution window: 7 days.
pub const BASELINE_WINDOW_NS: i64 = 7 * 24 * 3600 * 1_000_000_000;
/// Histories shorter than this are reported as insufficient.
pub const MIN_HISTORY_NS: i64 = 24 * 3600 * 1_000_000_000;

/// Transition-count threshold at which the count term of the flappiness
/// score saturates.
const FLAP_TRANSITION_THRESHOLD: f64 = 5.0;

#[derive(Clone, Debug, PartialEq)]
pub struct StateChange {
    pub timestamp: i64,
    pub from: AlertState,
    pub to: AlertState,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Onset {
    New,
    Recent,
    Persistent,
    Chronic,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Pattern {
    StableFiring,
    StableNormal,
    Flapping,
    TrendingWorse,
    TrendingBetter,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Categorization {
    InsufficientData {
        history_hours: f64,
    },
    Categorized {
        onset: Onset,
        pattern: Pattern,
        flappiness: f64,
        firing_fraction: f64,
        /// Deviation of the current firing fraction from the 7-day
        /// distribution, in standard deviations.
        baseline_deviation: f64,
    },
}

/// Time spent in each state across `[window_start, window_end]`, walking the
/// change list and assuming the last known state across gaps.
pub fn occupancy(
    changes: &[StateChange],
    initial: AlertState,
    window_start: i64,
    window_end: i64,
) -> Vec<(AlertState, i64)> {
    let mut segments = Vec::new();
    let mut state = initial;
    let mut cursor = window_start;

    for change in changes {
        if change.timestamp <= window_start {
            state = change.to;
            continue;
        }
        if change.timestamp >= window_end {
            break;
        }
        segments.push((state, change.timestamp - cursor));
        state = change.to;
        cursor = change.timestamp;
    }
    if window_end > cursor {
        segments.push((state, window_end - cursor));
    }
    segments
}

pub fn firing_fraction(segments: &[(AlertState, i64)]) -> f64 {
    let total: i64 = segments.iter().map(|(_, d)| d).sum();
    if total <= 0 {
        return 0.0;
    }
    let firing: i64 = segments
        .iter()
        .filter(|(s, _)| *s == AlertState::Firing)
        .map(|(_, d)| d)
        .sum();
    firing as f64 / total as f64
}

/// Continuous 0..1 flappiness over a window: transition count saturating at
/// the threshold, blended with a dwell-time term that penalizes short
/// dwells.
pub fn flappiness(changes_in_window: usize, mean_dwell_ns: f64, window_ns: i64) -> f64 {
    if changes_in_window == 0 {
        return 0.0;
    }
    let count_term = (changes_in_window as f64 / FLAP_TRANSITION_THRESHOLD).min(1.0);
    let dwell_term = 1.0 - (mean_dwell_ns / window_ns as f64).clamp(0.0, 1.0);
    (0.6 * count_term + 0.4 * dwell_term).clamp(0.0, 1.0)
}

/// Deviation of `current` from the historical distribution, in standard
/// deviations. Zero spread yields zero.
pub fn baseline_deviation(current: f64, historical: &[f64]) -> f64 {
    let (mean, stddev) = compute_stats(historical);
    if stddev == 0.0 {
        return 0.0;
    }
    (current - mean) / stddev
}

pub struct HistoryInput {
    /// All recorded transitions, oldest first.
    pub changes: Vec<StateChange>,
    /// When the alert was first observed.
    pub first_seen: i64,
    pub current_state: AlertState,
    pub now: i64,
}

pub fn categorize(input: &HistoryInput) -> Categorization {
    let history_ns = input.now.saturating_sub(input.first_seen);
    if history_ns < MIN_HISTORY_NS {
        return Categorization::InsufficientData {
            history_hours: history_ns as f64 / 3.6e12,
        };
    }

    let window_start = input.now - FLAP_WINDOW_NS;
    let in_window: Vec<&StateChange> = input
        .changes
        .iter()
        .filter(|c| c.timestamp >= window_start)
        .collect();

    // Dwell times between consecutive transitions inside the window, plus
    // the tail dwell up to now.
    let mut dwells = Vec::new();
    for pair in in_window.windows(2) {
        dwells.push((pair[1].timestamp - pair[0].timestamp) as f64);
    }
    if let Some(last) = in_window.last() {
        dwells.push((input.now - last.timestamp) as f64);
    }
    let mean_dwell = if dwells.is_empty() {
        FLAP_WINDOW_NS as f64
    } else {
        dwells.iter().sum::<f64>() / dwells.len() as f64
    };
    let flappiness = flappiness(in_window.len(), mean_dwell, FLAP_WINDOW_NS);

    // State the alert was in as the window opened.
    let initial = input
        .changes
        .iter()
        .take_while(|c| c.timestamp <= window_start)
        .last()
        .map(|c| c.to)
        .unwrap_or(if in_window.is_empty() {
            input.current_state
        } else {
            in_window[0].from
        });
    let segments = occupancy(&input.changes, initial, window_start, input.now);
    let fraction = firing_fraction(&segments);

    // 7-day distribution of firing fractions, one bucket per flap window.
    let baseline_start = input.now - BASELINE_WINDOW_NS;
    let mut historical = Vec::new();
    let mut bucket_start = baseline_start;
    while bucket_start + FLAP_WINDOW_NS <= window_start {
        let bucket_initial = input
            .changes
            .iter()
            .take_while(|c| c.timestamp <= bucket_start)
            .last()
            .map(|c| c.to)
            .unwrap_or(AlertState::Normal);
        let bucket =
            occupancy(&input.changes, bucket_initial, bucket_start, bucket_start + FLAP_WINDOW_NS);
        historical.push(firing_fraction(&bucket));
        bucket_start += FLAP_WINDOW_NS;
    }
    let deviation = baseline_deviation(fraction, &historical);

    // Trend: compare the halves of the flap window.
    let half = window_start + FLAP_WINDOW_NS / 2;
    let first_half = firing_fraction(&occupancy(&input.changes, initial, window_start, half));
    let second_half_initial = input
        .changes
        .iter()
        .take_while(|c| c.timestamp <= half)
        .last()
        .map(|c| c.to)
        .unwrap_or(initial);
    let second_half =
        firing_fraction(&occupancy(&input.changes, second_half_initial, half, input.now));

    let pattern = if flappiness >= 0.5 {
        Pattern::Flapping
    } else if second_half > first_half + 0.2 {
        Pattern::TrendingWorse
    } else if first_half > second_half + 0.2 {
        Pattern::TrendingBetter
    } else if fraction >= 0.9 {
        Pattern::StableFiring
    } else {
        Pattern::StableNormal
    };

    let onset = if history_ns > BASELINE_WINDOW_NS && fraction > 0.8 {
        Onset::Chronic
    } else if history_ns < 3600 * 1_000_000_000 {
        Onset::New
    } else if history_ns < MIN_HISTORY_NS {
        Onset::Recent
    } else {
        Onset::Persistent
    };

    Categorization::Categorized {
        onset,
        pattern,
        flappiness,
        firing_fraction: fraction,
        baseline_deviation: deviation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AlertState::*;

    const HOUR_NS: i64 = 3600 * 1_000_000_000;

    fn change(timestamp: i64, from: AlertState, to: AlertState) -> StateChange {
        StateChange {
            timestamp,
            from,
            to,
        }
    }

    #[test]
    fn occupancy_fills_gaps_with_last_state() {
        let changes = vec![change(10, Normal, Firing)];
        let segments = occupancy(&changes, Normal, 0, 100);
        assert_eq!(segments, vec![(Normal, 10), (Firing, 90)]);
        assert!((firing_fraction(&segments) - 0.9).abs() < 1e-9);
    }

    #[test]
    fn no_transitions_is_not_flappy() {
        assert_eq!(flappiness(0, FLAP_WINDOW_NS as f64, FLAP_WINDOW_NS), 0.0);
    }

    #[test]
    fn many_short_dwells_are_flappy() {
        // Ten transitions with five-minute dwells in a six-hour window.
        let score = flappiness(10, 5.0 * 60.0 * 1e9, FLAP_WINDOW_NS);
        assert!(score > 0.9, "score was {score}");
    }

    #[test]
    fn few_long_dwells_score_low() {
        // Two transitions, three-hour dwells.
        let score = flappiness(2, 3.0 * 3600.0 * 1e9, FLAP_WINDOW_NS);
        assert!(score < 0.5, "score was {score}");
    }

    #[test]
    fn short_history_is_insufficient() {
        let input = HistoryInput {
            changes: Vec::new(),
            first_seen: 0,
            current_state: Normal,
            now: 23 * HOUR_NS,
        };
        match categorize(&input) {
            Categorization::InsufficientData { history_hours } => {
                assert!((history_hours - 23.0).abs() < 0.01);
            }
            other => panic!("expected insufficient data, got {other:?}"),
        }
    }

    #[test]
    fn stable_firing_alert() {
        let now = 30 * 24 * HOUR_NS;
        let input = HistoryInput {
            changes: vec![change(HOUR_NS, Normal, Firing)],
            first_seen: 0,
            current_state: Firing,
            now,
        };
        match categorize(&input) {
            Categorization::Categorized { onset, pattern, firing_fraction, .. } => {
                assert_eq!(onset, Onset::Chronic);
                assert_eq!(pattern, Pattern::StableFiring);
                assert!(firing_fraction > 0.99);
            }
            other => panic!("expected categorized, got {other:?}"),
        }
    }

    #[test]
    fn flapping_alert_is_detected() {
        let now = 10 * 24 * HOUR_NS;
        // A transition every 20 minutes for the last 6 hours.
        let mut changes = Vec::new();
        let mut state = Normal;
        let mut t = now - 6 * HOUR_NS;
        while t < now {
            let next = if state == Normal { Firing } else { Normal };
            changes.push(change(t, state, next));
            state = next;
            t += 20 * 60 * 1_000_000_000;
        }
        let input = HistoryInput {
            changes,
            first_seen: 0,
            current_state: state,
            now,
        };
        match categorize(&input) {
            Categorization::Categorized { pattern, flappiness, .. } => {
                assert_eq!(pattern, Pattern::Flapping);
                assert!(flappiness >= 0.5);
            }
            other => panic!("expected categorized, got {other:?}"),
        }
    }

    #[test]
    fn quiet_alert_is_stable_normal() {
        let now = 10 * 24 * HOUR_NS;
        let input = HistoryInput {
            changes: Vec::new(),
            first_seen: 0,
            current_state: Normal,
            now,
        };
        match categorize(&input) {
            Categorization::Categorized { pattern, firing_fraction, .. } => {
                assert_eq!(pattern, Pattern::StableNormal);
                assert_eq!(firing_fraction, 0.0);
            }
            other => panic!("expected categorized, got {other:?}"),
        }
    }
}
