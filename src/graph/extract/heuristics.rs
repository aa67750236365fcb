//! Label and controller heuristics for inferred MANAGES and
//! CREATES_OBSERVED edges.
//!
//! These edges are guesses. Each carries the evidence it was inferred from;
//! the builder may add contextual evidence (temporal proximity) before
//! scoring.

use serde_json::Value;

use super::Extractor;
use crate::event::Event;
use crate::graph::model::{EdgeCandidate, EdgeTarget, EdgeType, Evidence, EvidenceType};
use crate::graph::scoring::{
    confidence_from_evidence, WEIGHT_LABEL_MATCH, WEIGHT_NAMESPACE_MATCH,
};

const ARGOCD_INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
const FLUX_NAME_LABEL: &str = "kustomize.toolkit.fluxcd.io/name";
const FLUX_NAMESPACE_LABEL: &str = "kustomize.toolkit.fluxcd.io/namespace";

/// ArgoCD Applications and Flux Kustomizations stamp the resources they
/// manage with well-known labels.
pub struct GitOpsManagerExtractor;

impl Extractor for GitOpsManagerExtractor {
    fn name(&self) -> &'static str {
        "gitops-managers"
    }

    fn edge_types(&self) -> &'static [EdgeType] {
        &[EdgeType::Manages]
    }

    fn matches(&self, event: &Event) -> bool {
        event.labels.contains_key(ARGOCD_INSTANCE_LABEL)
            || event.labels.contains_key(FLUX_NAME_LABEL)
    }

    fn extract(&self, event: &Event) -> Vec<EdgeCandidate> {
        let mut edges = Vec::new();

        if let Some(instance) = event.labels.get(ARGOCD_INSTANCE_LABEL) {
            let evidence = vec![Evidence {
                evidence_type: EvidenceType::LabelMatch,
                value: format!("{ARGOCD_INSTANCE_LABEL}={instance}"),
                weight: WEIGHT_LABEL_MATCH,
                timestamp: event.timestamp,
            }];
            edges.push(EdgeCandidate {
                edge_type: EdgeType::Manages,
                from: EdgeTarget::Named {
                    kind: "Application".into(),
                    namespace: None,
                    name: instance.clone(),
                },
                to: EdgeTarget::Uid(event.identity.uid.clone()),
                confidence: confidence_from_evidence(&evidence),
                evidence,
            });
        }

        if let Some(name) = event.labels.get(FLUX_NAME_LABEL) {
            let manager_ns = event.labels.get(FLUX_NAMESPACE_LABEL).cloned();
            let mut evidence = vec![Evidence {
                evidence_type: EvidenceType::LabelMatch,
                value: format!("{FLUX_NAME_LABEL}={name}"),
                weight: WEIGHT_LABEL_MATCH,
                timestamp: event.timestamp,
            }];
            if manager_ns.as_deref() == event.identity.namespace.as_deref() {
                evidence.push(Evidence {
                    evidence_type: EvidenceType::NamespaceMatch,
                    value: manager_ns.clone().unwrap_or_default(),
                    weight: WEIGHT_NAMESPACE_MATCH,
                    timestamp: event.timestamp,
                });
            }
            edges.push(EdgeCandidate {
                edge_type: EdgeType::Manages,
                from: EdgeTarget::Named {
                    kind: "Kustomization".into(),
                    namespace: manager_ns,
                    name: name.clone(),
                },
                to: EdgeTarget::Uid(event.identity.uid.clone()),
                confidence: confidence_from_evidence(&evidence),
                evidence,
            });
        }

        edges
    }
}

/// CREATES_OBSERVED edges from controller `Event` resources: a
/// `SuccessfulCreate` event on a ReplicaSet names the Pod it created.
pub struct ObservedCreationExtractor;

const CREATION_REASONS: &[&str] = &["SuccessfulCreate", "Created", "ScalingReplicaSet"];

impl Extractor for ObservedCreationExtractor {
    fn name(&self) -> &'static str {
        "observed-creations"
    }

    fn edge_types(&self) -> &'static [EdgeType] {
        &[EdgeType::CreatesObserved]
    }

    fn matches(&self, event: &Event) -> bool {
        event.identity.kind == "Event"
            && event
                .payload
                .get("reason")
                .and_then(Value::as_str)
                .map(|r| CREATION_REASONS.contains(&r))
                .unwrap_or(false)
    }

    fn extract(&self, event: &Event) -> Vec<EdgeCandidate> {
        let Some(creator_uid) = event
            .payload
            .pointer("/involvedObject/uid")
            .and_then(Value::as_str)
        else {
            return Vec::new();
        };
        let Some(message) = event.payload.get("message").and_then(Value::as_str) else {
            return Vec::new();
        };
        let Some((kind, name)) = parse_created_object(message) else {
            return Vec::new();
        };

        let namespace = event
            .payload
            .pointer("/involvedObject/namespace")
            .and_then(Value::as_str)
            .or(event.identity.namespace.as_deref())
            .map(str::to_string);

        let evidence = vec![
            Evidence {
                evidence_type: EvidenceType::TemporalProximity,
                value: format!("creation event at {}", event.timestamp),
                weight: crate::graph::scoring::WEIGHT_TEMPORAL_PROXIMITY,
                timestamp: event.timestamp,
            },
            Evidence {
                evidence_type: EvidenceType::NamespaceMatch,
                value: namespace.clone().unwrap_or_default(),
                weight: WEIGHT_NAMESPACE_MATCH,
                timestamp: event.timestamp,
            },
        ];

        vec![EdgeCandidate {
            edge_type: EdgeType::CreatesObserved,
            from: EdgeTarget::Uid(creator_uid.to_string()),
            to: EdgeTarget::Named {
                kind,
                namespace,
                name,
            },
            confidence: confidence_from_evidence(&evidence),
            evidence,
        }]
    }
}

/// Parses `Created pod: web-abc-123` style controller messages.
fn parse_created_object(message: &str) -> Option<(String, String)> {
    let rest = message.strip_prefix("Created ")?;
    let (kind, name) = rest.split_once(':')?;
    let kind = match kind.trim().to_ascii_lowercase().as_str() {
        "pod" => "Pod",
        "container" => return None,
        other => {
            // Capitalize single-word kinds; multi-word messages are not
            // creation records.
            if other.contains(' ') {
                return None;
            }
            return Some((capitalize(other), name.trim().to_string()));
        }
    };
    Some((kind.to_string(), name.trim().to_string()))
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, ResourceIdentity, ResourceStatus};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn labeled_event(labels: &[(&str, &str)]) -> Event {
        Event {
            id: uuid::Uuid::nil(),
            timestamp: 0,
            kind: EventKind::Create,
            identity: ResourceIdentity {
                api_group: "apps".into(),
                api_version: "v1".into(),
                kind: "Deployment".into(),
                namespace: Some("prod".into()),
                name: "web".into(),
                uid: "uid-web".into(),
                involved_object_uid: None,
            },
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            annotations: BTreeMap::new(),
            payload: json!({}),
            status: ResourceStatus::Ready,
            raw_size: 0,
            normalized_size: 0,
        }
    }

    #[test]
    fn argocd_label_infers_manages() {
        let event = labeled_event(&[(ARGOCD_INSTANCE_LABEL, "shop")]);
        let edges = GitOpsManagerExtractor.extract(&event);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].edge_type, EdgeType::Manages);
        assert!(edges[0].confidence < 1.0);
        assert!(edges[0].confidence >= 0.1);
        match &edges[0].from {
            EdgeTarget::Named { kind, name, .. } => {
                assert_eq!(kind, "Application");
                assert_eq!(name, "shop");
            }
            other => panic!("unexpected target: {:?}", other),
        }
    }

    #[test]
    fn flux_labels_with_namespace_match_score_higher() {
        let without = labeled_event(&[(FLUX_NAME_LABEL, "infra")]);
        let with = labeled_event(&[(FLUX_NAME_LABEL, "infra"), (FLUX_NAMESPACE_LABEL, "prod")]);

        let low = GitOpsManagerExtractor.extract(&without)[0].confidence;
        let high = GitOpsManagerExtractor.extract(&with)[0].confidence;
        assert!(high > low);
    }

    #[test]
    fn successful_create_event_yields_creates_observed() {
        let mut event = labeled_event(&[]);
        event.identity.kind = "Event".into();
        event.payload = json!({
            "reason": "SuccessfulCreate",
            "message": "Created pod: web-abc-123",
            "involvedObject": {"kind": "ReplicaSet", "uid": "uid-rs", "namespace": "prod"}
        });

        let extractor = ObservedCreationExtractor;
        assert!(extractor.matches(&event));
        let edges = extractor.extract(&event);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].edge_type, EdgeType::CreatesObserved);
        assert_eq!(edges[0].from, EdgeTarget::Uid("uid-rs".into()));
        match &edges[0].to {
            EdgeTarget::Named { kind, name, .. } => {
                assert_eq!(kind, "Pod");
                assert_eq!(name, "web-abc-123");
            }
            other => panic!("unexpected target: {:?}", other),
        }
    }

    #[test]
    fn created_object_message_parsing() {
        assert_eq!(
            parse_created_object("Created pod: web-1"),
            Some(("Pod".into(), "web-1".into()))
        );
        assert_eq!(parse_created_object("Scaled up replica set"), None);
        assert_eq!(parse_created_object("Created container: app"), None);
    }
}
