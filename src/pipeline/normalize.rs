//! Normalization of raw watched objects into [`Event`]s.
//!
//! Server-managed bookkeeping is pruned from the payload so the block store
//! only carries bytes a human investigating an incident would want back.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;
use snafu::{OptionExt, Snafu};
use uuid::Uuid;

use super::status::infer_status;
use super::RawResourceEvent;
use crate::event::{Event, ResourceIdentity};

/// Fields under `metadata` that the API server maintains and that carry no
/// investigative value.
const PRUNED_METADATA_FIELDS: &[&str] = &[
    "managedFields",
    "resourceVersion",
    "generation",
    "selfLink",
];

const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

#[derive(Debug, Snafu)]
pub enum NormalizeError {
    #[snafu(display("object has no metadata.uid"))]
    MissingUid,

    #[snafu(display("object has no metadata.name"))]
    MissingName,
}

pub fn normalize(raw: &RawResourceEvent) -> Result<Event, NormalizeError> {
    let object = &raw.object;
    let raw_size = serde_json::to_vec(object).map(|v| v.len() as u64).unwrap_or(0);

    let uid = object
        .pointer("/metadata/uid")
        .and_then(Value::as_str)
        .context(MissingUidSnafu)?
        .to_string();
    let name = object
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .context(MissingNameSnafu)?
        .to_string();
    let namespace = object
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .map(str::to_string);

    let labels = string_map(object.pointer("/metadata/labels"));
    let annotations = string_map(object.pointer("/metadata/annotations"));

    let involved_object_uid = if raw.resource_kind == "Event" {
        object
            .pointer("/involvedObject/uid")
            .and_then(Value::as_str)
            .map(str::to_string)
    } else {
        None
    };

    let payload = prune(object.clone());
    let normalized_size = serde_json::to_vec(&payload)
        .map(|v| v.len() as u64)
        .unwrap_or(0);

    let status = infer_status(&raw.resource_kind, object);

    Ok(Event {
        id: Uuid::new_v4(),
        timestamp: Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX),
        kind: raw.kind,
        identity: ResourceIdentity {
            api_group: raw.api_group.clone(),
            api_version: raw.api_version.clone(),
            kind: raw.resource_kind.clone(),
            namespace,
            name,
            uid,
            involved_object_uid,
        },
        labels,
        annotations,
        payload,
        status,
        raw_size,
        normalized_size,
    })
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Removes server-managed metadata in place and returns the pruned object.
pub fn prune(mut object: Value) -> Value {
    if let Some(metadata) = object
        .pointer_mut("/metadata")
        .and_then(Value::as_object_mut)
    {
        for field in PRUNED_METADATA_FIELDS {
            metadata.remove(*field);
        }
        if let Some(annotations) = metadata
            .get_mut("annotations")
            .and_then(Value::as_object_mut)
        {
            annotations.remove(LAST_APPLIED_ANNOTATION);
            if annotations.is_empty() {
                metadata.remove("annotations");
            }
        }
    }
    object
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use serde_json::json;

    fn raw(kind: &str, object: Value) -> RawResourceEvent {
        RawResourceEvent {
            kind: EventKind::Create,
            api_group: String::new(),
            api_version: "v1".into(),
            resource_kind: kind.into(),
            object,
        }
    }

    #[test]
    fn prunes_managed_fields_and_last_applied() {
        let object = json!({
            "metadata": {
                "name": "web",
                "uid": "u1",
                "managedFields": [{"manager": "kubectl"}],
                "resourceVersion": "12345",
                "annotations": {
                    "kubectl.kubernetes.io/last-applied-configuration": "{}",
                    "team": "platform"
                }
            }
        });
        let pruned = prune(object);
        assert!(pruned.pointer("/metadata/managedFields").is_none());
        assert!(pruned.pointer("/metadata/resourceVersion").is_none());
        assert!(pruned
            .pointer("/metadata/annotations/kubectl.kubernetes.io~1last-applied-configuration")
            .is_none());
        assert_eq!(
            pruned.pointer("/metadata/annotations/team").and_then(Value::as_str),
            Some("platform")
        );
    }

    #[test]
    fn normalized_event_captures_identity_and_sizes() {
        let event = normalize(&raw(
            "Pod",
            json!({
                "metadata": {
                    "name": "web-1",
                    "namespace": "default",
                    "uid": "uid-1",
                    "labels": {"app": "web"},
                    "managedFields": [{"manager": "kubelet", "operation": "Update"}]
                },
                "status": {"phase": "Pending"}
            }),
        ))
        .unwrap();

        assert_eq!(event.identity.name, "web-1");
        assert_eq!(event.identity.namespace.as_deref(), Some("default"));
        assert_eq!(event.identity.uid, "uid-1");
        assert_eq!(event.labels.get("app").map(String::as_str), Some("web"));
        assert!(event.normalized_size < event.raw_size);
        assert!(event.payload.pointer("/metadata/managedFields").is_none());
    }

    #[test]
    fn kubernetes_event_lifts_involved_object_uid() {
        let event = normalize(&raw(
            "Event",
            json!({
                "metadata": {"name": "web-1.17f", "namespace": "default", "uid": "uid-evt"},
                "involvedObject": {"kind": "Pod", "uid": "uid-pod"},
                "reason": "BackOff"
            }),
        ))
        .unwrap();
        assert_eq!(event.identity.involved_object_uid.as_deref(), Some("uid-pod"));
        assert_eq!(event.identity.effective_uid(), "uid-pod");
    }

    #[test]
    fn missing_uid_is_an_error() {
        let err = normalize(&raw("Pod", json!({"metadata": {"name": "x"}}))).unwrap_err();
        assert!(matches!(err, NormalizeError::MissingUid));
    }
}
