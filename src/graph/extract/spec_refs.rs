//! Typed references found in resource specs.
//!
//! These are unambiguous (the spec names the target outright) so the edges
//! carry confidence 1.0.

use serde_json::Value;

use super::Extractor;
use crate::event::Event;
use crate::graph::model::{
    EdgeCandidate, EdgeTarget, EdgeType, Evidence, EvidenceType, EXPLICIT_CONFIDENCE,
};

pub struct SpecReferenceExtractor;

impl Extractor for SpecReferenceExtractor {
    fn name(&self) -> &'static str {
        "spec-references"
    }

    fn edge_types(&self) -> &'static [EdgeType] {
        &[
            EdgeType::ReferencesSpec,
            EdgeType::ScheduledOn,
            EdgeType::BoundTo,
            EdgeType::BindsRole,
            EdgeType::GrantsTo,
        ]
    }

    fn matches(&self, event: &Event) -> bool {
        matches!(
            event.identity.kind.as_str(),
            "Pod"
                | "PersistentVolumeClaim"
                | "RoleBinding"
                | "ClusterRoleBinding"
                | "HTTPRoute"
        )
    }

    fn extract(&self, event: &Event) -> Vec<EdgeCandidate> {
        match event.identity.kind.as_str() {
            "Pod" => pod_references(event),
            "PersistentVolumeClaim" => pvc_references(event),
            "RoleBinding" | "ClusterRoleBinding" => role_binding_references(event),
            "HTTPRoute" => httproute_references(event),
            _ => Vec::new(),
        }
    }
}

fn explicit(
    event: &Event,
    edge_type: EdgeType,
    to: EdgeTarget,
    field: &str,
) -> EdgeCandidate {
    EdgeCandidate {
        edge_type,
        from: EdgeTarget::Uid(event.identity.uid.clone()),
        to,
        confidence: EXPLICIT_CONFIDENCE,
        evidence: vec![Evidence {
            evidence_type: EvidenceType::FieldReference,
            value: field.to_string(),
            weight: EXPLICIT_CONFIDENCE,
            timestamp: event.timestamp,
        }],
    }
}

fn named(kind: &str, namespace: Option<&str>, name: &str) -> EdgeTarget {
    EdgeTarget::Named {
        kind: kind.to_string(),
        namespace: namespace.map(str::to_string),
        name: name.to_string(),
    }
}

fn pod_references(event: &Event) -> Vec<EdgeCandidate> {
    let mut edges = Vec::new();
    let ns = event.identity.namespace.as_deref();
    let spec = event.payload.pointer("/spec");
    let Some(spec) = spec else { return edges };

    if let Some(volumes) = spec.get("volumes").and_then(Value::as_array) {
        for volume in volumes {
            if let Some(secret) = volume.pointer("/secret/secretName").and_then(Value::as_str) {
                edges.push(explicit(
                    event,
                    EdgeType::ReferencesSpec,
                    named("Secret", ns, secret),
                    "spec.volumes[].secret.secretName",
                ));
            }
            if let Some(cm) = volume.pointer("/configMap/name").and_then(Value::as_str) {
                edges.push(explicit(
                    event,
                    EdgeType::ReferencesSpec,
                    named("ConfigMap", ns, cm),
                    "spec.volumes[].configMap.name",
                ));
            }
        }
    }

    if let Some(containers) = spec.get("containers").and_then(Value::as_array) {
        for container in containers {
            if let Some(env) = container.get("env").and_then(Value::as_array) {
                for entry in env {
                    if let Some(secret) = entry
                        .pointer("/valueFrom/secretKeyRef/name")
                        .and_then(Value::as_str)
                    {
                        edges.push(explicit(
                            event,
                            EdgeType::ReferencesSpec,
                            named("Secret", ns, secret),
                            "spec.containers[].env[].valueFrom.secretKeyRef",
                        ));
                    }
                    if let Some(cm) = entry
                        .pointer("/valueFrom/configMapKeyRef/name")
                        .and_then(Value::as_str)
                    {
                        edges.push(explicit(
                            event,
                            EdgeType::ReferencesSpec,
                            named("ConfigMap", ns, cm),
                            "spec.containers[].env[].valueFrom.configMapKeyRef",
                        ));
                    }
                }
            }
            if let Some(env_from) = container.get("envFrom").and_then(Value::as_array) {
                for entry in env_from {
                    if let Some(secret) =
                        entry.pointer("/secretRef/name").and_then(Value::as_str)
                    {
                        edges.push(explicit(
                            event,
                            EdgeType::ReferencesSpec,
                            named("Secret", ns, secret),
                            "spec.containers[].envFrom[].secretRef",
                        ));
                    }
                    if let Some(cm) =
                        entry.pointer("/configMapRef/name").and_then(Value::as_str)
                    {
                        edges.push(explicit(
                            event,
                            EdgeType::ReferencesSpec,
                            named("ConfigMap", ns, cm),
                            "spec.containers[].envFrom[].configMapRef",
                        ));
                    }
                }
            }
        }
    }

    if let Some(sa) = spec.get("serviceAccountName").and_then(Value::as_str) {
        edges.push(explicit(
            event,
            EdgeType::ReferencesSpec,
            named("ServiceAccount", ns, sa),
            "spec.serviceAccountName",
        ));
    }

    if let Some(node) = spec.get("nodeName").and_then(Value::as_str) {
        edges.push(explicit(
            event,
            EdgeType::ScheduledOn,
            named("Node", None, node),
            "spec.nodeName",
        ));
    }

    edges
}

fn pvc_references(event: &Event) -> Vec<EdgeCandidate> {
    let mut edges = Vec::new();
    if let Some(volume) = event
        .payload
        .pointer("/spec/volumeName")
        .and_then(Value::as_str)
    {
        edges.push(explicit(
            event,
            EdgeType::BoundTo,
            named("PersistentVolume", None, volume),
            "spec.volumeName",
        ));
    }
    edges
}

fn role_binding_references(event: &Event) -> Vec<EdgeCandidate> {
    let mut edges = Vec::new();
    let ns = event.identity.namespace.as_deref();

    if let Some(role_ref) = event.payload.get("roleRef") {
        let kind = role_ref.get("kind").and_then(Value::as_str).unwrap_or("Role");
        if let Some(name) = role_ref.get("name").and_then(Value::as_str) {
            let role_ns = if kind == "ClusterRole" { None } else { ns };
            edges.push(explicit(
                event,
                EdgeType::BindsRole,
                named(kind, role_ns, name),
                "roleRef",
            ));
        }
    }

    if let Some(subjects) = event.payload.get("subjects").and_then(Value::as_array) {
        for subject in subjects {
            let kind = subject.get("kind").and_then(Value::as_str).unwrap_or("");
            if kind != "ServiceAccount" {
                continue;
            }
            let Some(name) = subject.get("name").and_then(Value::as_str) else {
                continue;
            };
            let subject_ns = subject.get("namespace").and_then(Value::as_str).or(ns);
            edges.push(explicit(
                event,
                EdgeType::GrantsTo,
                named("ServiceAccount", subject_ns, name),
                "subjects[]",
            ));
        }
    }

    edges
}

fn httproute_references(event: &Event) -> Vec<EdgeCandidate> {
    let mut edges = Vec::new();
    let ns = event.identity.namespace.as_deref();

    if let Some(parents) = event
        .payload
        .pointer("/spec/parentRefs")
        .and_then(Value::as_array)
    {
        for parent in parents {
            let kind = parent.get("kind").and_then(Value::as_str).unwrap_or("Gateway");
            let Some(name) = parent.get("name").and_then(Value::as_str) else {
                continue;
            };
            let parent_ns = parent.get("namespace").and_then(Value::as_str).or(ns);
            edges.push(explicit(
                event,
                EdgeType::ReferencesSpec,
                named(kind, parent_ns, name),
                "spec.parentRefs[]",
            ));
        }
    }

    if let Some(rules) = event
        .payload
        .pointer("/spec/rules")
        .and_then(Value::as_array)
    {
        for rule in rules {
            let Some(backends) = rule.get("backendRefs").and_then(Value::as_array) else {
                continue;
            };
            for backend in backends {
                let kind = backend.get("kind").and_then(Value::as_str).unwrap_or("Service");
                let Some(name) = backend.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let backend_ns = backend.get("namespace").and_then(Value::as_str).or(ns);
                edges.push(explicit(
                    event,
                    EdgeType::ReferencesSpec,
                    named(kind, backend_ns, name),
                    "spec.rules[].backendRefs[]",
                ));
            }
        }
    }

    edges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, ResourceIdentity, ResourceStatus};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn event(kind: &str, payload: Value) -> Event {
        Event {
            id: uuid::Uuid::nil(),
            timestamp: 0,
            kind: EventKind::Update,
            identity: ResourceIdentity {
                api_group: String::new(),
                api_version: "v1".into(),
                kind: kind.into(),
                namespace: Some("default".into()),
                name: "x".into(),
                uid: "uid-x".into(),
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
    fn pod_secret_and_node_references() {
        let pod = event(
            "Pod",
            json!({
                "spec": {
                    "nodeName": "node-1",
                    "serviceAccountName": "deployer",
                    "volumes": [{"secret": {"secretName": "tls-cert"}}],
                    "containers": [{
                        "env": [{"valueFrom": {"configMapKeyRef": {"name": "app-config"}}}]
                    }]
                }
            }),
        );
        let edges = SpecReferenceExtractor.extract(&pod);

        let kinds: Vec<_> = edges.iter().map(|e| e.edge_type).collect();
        assert!(kinds.contains(&EdgeType::ScheduledOn));
        assert_eq!(
            kinds.iter().filter(|k| **k == EdgeType::ReferencesSpec).count(),
            3
        );
        assert!(edges.iter().all(|e| e.confidence == EXPLICIT_CONFIDENCE));

        let node_edge = edges
            .iter()
            .find(|e| e.edge_type == EdgeType::ScheduledOn)
            .unwrap();
        assert_eq!(
            node_edge.to,
            EdgeTarget::Named {
                kind: "Node".into(),
                namespace: None,
                name: "node-1".into()
            }
        );
    }

    #[test]
    fn role_binding_edges() {
        let binding = event(
            "RoleBinding",
            json!({
                "roleRef": {"kind": "Role", "name": "reader"},
                "subjects": [
                    {"kind": "ServiceAccount", "name": "app", "namespace": "prod"},
                    {"kind": "User", "name": "alice"}
                ]
            }),
        );
        let edges = SpecReferenceExtractor.extract(&binding);
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].edge_type, EdgeType::BindsRole);
        assert_eq!(edges[1].edge_type, EdgeType::GrantsTo);
    }

    #[test]
    fn httproute_edges() {
        let route = event(
            "HTTPRoute",
            json!({
                "spec": {
                    "parentRefs": [{"name": "public-gw"}],
                    "rules": [{"backendRefs": [{"name": "web-svc", "port": 80}]}]
                }
            }),
        );
        let edges = SpecReferenceExtractor.extract(&route);
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().all(|e| e.edge_type == EdgeType::ReferencesSpec));
    }
}
