//! Statistical analysis: anomaly detection, metric baselines, log template
//! mining, and novelty detection.

pub mod anomaly;
pub mod baseline;
pub mod drain;
pub mod novelty;

pub use anomaly::{detect, rank, z_score, Anomaly, Severity};
pub use baseline::{Baseline, BaselineCache};
pub use drain::{DrainConfig, DrainTree, Template};
pub use novelty::{compare_windows, PatternEntry};
