//! Typed node and edge model for the relationship graph.

use serde::{Deserialize, Serialize};

/// Edge types. The variant name is the relationship type stored in the
/// graph, so renames are format changes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum EdgeType {
    Owns,
    Manages,
    CreatesObserved,
    ReferencesSpec,
    BindsRole,
    ScheduledOn,
    BoundTo,
    GrantsTo,
    StateTransition,
    Changed,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::Owns => "OWNS",
            EdgeType::Manages => "MANAGES",
            EdgeType::CreatesObserved => "CREATES_OBSERVED",
            EdgeType::ReferencesSpec => "REFERENCES_SPEC",
            EdgeType::BindsRole => "BINDS_ROLE",
            EdgeType::ScheduledOn => "SCHEDULED_ON",
            EdgeType::BoundTo => "BOUND_TO",
            EdgeType::GrantsTo => "GRANTS_TO",
            EdgeType::StateTransition => "STATE_TRANSITION",
            EdgeType::Changed => "CHANGED",
        }
    }
}

impl std::fmt::Display for EdgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EdgeType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "OWNS" => Some(EdgeType::Owns),
            "MANAGES" => Some(EdgeType::Manages),
            "CREATES_OBSERVED" => Some(EdgeType::CreatesObserved),
            "REFERENCES_SPEC" => Some(EdgeType::ReferencesSpec),
            "BINDS_ROLE" => Some(EdgeType::BindsRole),
            "SCHEDULED_ON" => Some(EdgeType::ScheduledOn),
            "BOUND_TO" => Some(EdgeType::BoundTo),
            "GRANTS_TO" => Some(EdgeType::GrantsTo),
            "STATE_TRANSITION" => Some(EdgeType::StateTransition),
            "CHANGED" => Some(EdgeType::Changed),
            _ => None,
        }
    }
}

/// A stored edge as read back for revalidation.
#[derive(Clone, Debug, PartialEq)]
pub struct Edge {
    pub from_uid: String,
    pub to_uid: String,
    pub edge_type: EdgeType,
    pub confidence: f64,
    /// Confidence as originally earned; decay factors apply to this, never
    /// compounding on an already-decayed value.
    pub base_confidence: f64,
    pub first_observed: i64,
    pub last_validated: i64,
    pub validation_state: ValidationState,
    pub endpoints_alive: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ValidationState {
    Valid,
    Invalid,
    Stale,
}

impl ValidationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationState::Valid => "Valid",
            ValidationState::Invalid => "Invalid",
            ValidationState::Stale => "Stale",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "Invalid" => ValidationState::Invalid,
            "Stale" => ValidationState::Stale,
            _ => ValidationState::Valid,
        }
    }
}

/// A weighted observation supporting an inferred edge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    #[serde(rename = "type")]
    pub evidence_type: EvidenceType,
    pub value: String,
    pub weight: f64,
    pub timestamp: i64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceType {
    OwnerReference,
    FieldReference,
    LabelMatch,
    NamespaceMatch,
    TemporalProximity,
}

/// How an extractor addresses the far end of an edge.
#[derive(Clone, Debug, PartialEq)]
pub enum EdgeTarget {
    Uid(String),
    /// Resolved against live graph nodes by identity; the edge is dropped
    /// when no such node exists yet.
    Named {
        kind: String,
        namespace: Option<String>,
        name: String,
    },
}

/// An edge proposal produced by an extractor.
#[derive(Clone, Debug, PartialEq)]
pub struct EdgeCandidate {
    pub edge_type: EdgeType,
    pub from: EdgeTarget,
    pub to: EdgeTarget,
    pub confidence: f64,
    pub evidence: Vec<Evidence>,
}

/// Confidence floor for inferred edges. Explicit references stay at 1.0 and
/// never decay.
pub const CONFIDENCE_FLOOR: f64 = 0.1;
pub const EXPLICIT_CONFIDENCE: f64 = 1.0;

/// Change nodes and state-transition edges expire after this many
/// nanoseconds (7 days).
pub const CHANGE_TTL_NS: i64 = 7 * 24 * 3600 * 1_000_000_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_type_names_are_stable() {
        assert_eq!(EdgeType::Owns.as_str(), "OWNS");
        assert_eq!(EdgeType::CreatesObserved.as_str(), "CREATES_OBSERVED");
        assert_eq!(EdgeType::StateTransition.as_str(), "STATE_TRANSITION");
    }

    #[test]
    fn validation_state_parse_defaults_to_valid() {
        assert_eq!(ValidationState::parse("Stale"), ValidationState::Stale);
        assert_eq!(ValidationState::parse("bogus"), ValidationState::Valid);
    }
}
