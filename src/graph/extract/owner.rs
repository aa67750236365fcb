//! Explicit ownership from `metadata.ownerReferences`.

use serde_json::Value;

use super::Extractor;
use crate::event::Event;
use crate::graph::model::{
    EdgeCandidate, EdgeTarget, EdgeType, Evidence, EvidenceType, EXPLICIT_CONFIDENCE,
};

pub struct OwnerReferenceExtractor;

impl Extractor for OwnerReferenceExtractor {
    fn name(&self) -> &'static str {
        "owner-references"
    }

    fn edge_types(&self) -> &'static [EdgeType] {
        &[EdgeType::Owns]
    }

    fn matches(&self, event: &Event) -> bool {
        event
            .payload
            .pointer("/metadata/ownerReferences")
            .and_then(Value::as_array)
            .map(|refs| !refs.is_empty())
            .unwrap_or(false)
    }

    fn extract(&self, event: &Event) -> Vec<EdgeCandidate> {
        let Some(refs) = event
            .payload
            .pointer("/metadata/ownerReferences")
            .and_then(Value::as_array)
        else {
            return Vec::new();
        };

        refs.iter()
            .filter_map(|owner| {
                let uid = owner.get("uid").and_then(Value::as_str)?;
                let kind = owner.get("kind").and_then(Value::as_str).unwrap_or("");
                let name = owner.get("name").and_then(Value::as_str).unwrap_or("");
                Some(EdgeCandidate {
                    edge_type: EdgeType::Owns,
                    from: EdgeTarget::Uid(uid.to_string()),
                    to: EdgeTarget::Uid(event.identity.uid.clone()),
                    confidence: EXPLICIT_CONFIDENCE,
                    evidence: vec![Evidence {
                        evidence_type: EvidenceType::OwnerReference,
                        value: format!("ownerReference {kind}/{name}"),
                        weight: EXPLICIT_CONFIDENCE,
                        timestamp: event.timestamp,
                    }],
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, ResourceIdentity, ResourceStatus};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn pod_event(payload: Value) -> Event {
        Event {
            id: uuid::Uuid::nil(),
            timestamp: 42,
            kind: EventKind::Create,
            identity: ResourceIdentity {
                api_group: String::new(),
                api_version: "v1".into(),
                kind: "Pod".into(),
                namespace: Some("default".into()),
                name: "web-1".into(),
                uid: "uid-pod".into(),
                involved_object_uid: None,
            },
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            payload,
            status: ResourceStatus::Ready,
            raw_size: 0,
            normalized_size: 0,
        }
    }

    #[test]
    fn owner_reference_yields_owns_edge_at_full_confidence() {
        let event = pod_event(json!({
            "metadata": {
                "ownerReferences": [
                    {"uid": "uid-rs", "kind": "ReplicaSet", "name": "web-abc", "controller": true}
                ]
            }
        }));

        let extractor = OwnerReferenceExtractor;
        assert!(extractor.matches(&event));
        let edges = extractor.extract(&event);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].edge_type, EdgeType::Owns);
        assert_eq!(edges[0].from, EdgeTarget::Uid("uid-rs".into()));
        assert_eq!(edges[0].to, EdgeTarget::Uid("uid-pod".into()));
        assert_eq!(edges[0].confidence, EXPLICIT_CONFIDENCE);
    }

    #[test]
    fn no_owner_references_no_match() {
        let event = pod_event(json!({"metadata": {}}));
        assert!(!OwnerReferenceExtractor.matches(&event));
    }
}
