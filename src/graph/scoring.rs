//! Evidence-weighted confidence scoring for inferred edges.

use crate::graph::model::{Evidence, CONFIDENCE_FLOOR};

/// Weights of the heuristic evidence signals. The denominator of a score is
/// the full table, so an edge supported by every signal reaches 1.0 exactly
/// and anything less stays below it.
pub const WEIGHT_LABEL_MATCH: f64 = 0.4;
pub const WEIGHT_NAMESPACE_MATCH: f64 = 0.2;
pub const WEIGHT_TEMPORAL_PROXIMITY: f64 = 0.4;

pub const TOTAL_HEURISTIC_WEIGHT: f64 =
    WEIGHT_LABEL_MATCH + WEIGHT_NAMESPACE_MATCH + WEIGHT_TEMPORAL_PROXIMITY;

/// Events closer together than this (nanoseconds) count as temporally
/// proximate: 120 s.
pub const TEMPORAL_PROXIMITY_WINDOW_NS: i64 = 120 * 1_000_000_000;

/// Earned weight over total weight, clamped to the inferred-edge range.
pub fn confidence_from_evidence(evidence: &[Evidence]) -> f64 {
    if evidence.is_empty() {
        return CONFIDENCE_FLOOR;
    }
    let earned: f64 = evidence.iter().map(|e| e.weight).sum();
    (earned / TOTAL_HEURISTIC_WEIGHT).clamp(CONFIDENCE_FLOOR, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::model::EvidenceType;

    fn evidence(evidence_type: EvidenceType, weight: f64) -> Evidence {
        Evidence {
            evidence_type,
            value: String::new(),
            weight,
            timestamp: 0,
        }
    }

    #[test]
    fn full_evidence_scores_one() {
        let all = vec![
            evidence(EvidenceType::LabelMatch, WEIGHT_LABEL_MATCH),
            evidence(EvidenceType::NamespaceMatch, WEIGHT_NAMESPACE_MATCH),
            evidence(EvidenceType::TemporalProximity, WEIGHT_TEMPORAL_PROXIMITY),
        ];
        assert!((confidence_from_evidence(&all) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_evidence_scores_proportionally() {
        let partial = vec![
            evidence(EvidenceType::LabelMatch, WEIGHT_LABEL_MATCH),
            evidence(EvidenceType::NamespaceMatch, WEIGHT_NAMESPACE_MATCH),
        ];
        let score = confidence_from_evidence(&partial);
        assert!((score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn no_evidence_floors() {
        assert_eq!(confidence_from_evidence(&[]), CONFIDENCE_FLOOR);
    }
}
