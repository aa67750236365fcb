//! The core event model.
//!
//! An [`Event`] is the atomic record of a single observed change to a
//! Kubernetes resource. Events are immutable once appended to the block
//! store; per-uid timestamps are strictly monotonic within a process.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What happened to the resource.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Create => "Create",
            EventKind::Update => "Update",
            EventKind::Delete => "Delete",
        }
    }
}

/// Coarse health label inferred from the resource payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ResourceStatus {
    Ready,
    Warning,
    Error,
    Terminating,
    Unknown,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Ready => "Ready",
            ResourceStatus::Warning => "Warning",
            ResourceStatus::Error => "Error",
            ResourceStatus::Terminating => "Terminating",
            ResourceStatus::Unknown => "Unknown",
        }
    }
}

/// Identity of the resource an event refers to.
///
/// `involved_object_uid` is populated for event-like resources (corev1
/// `Event`) where the interesting identity is the object the event is about
/// rather than the event object itself.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResourceIdentity {
    #[serde(default)]
    pub api_group: String,
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub involved_object_uid: Option<String>,
}

impl ResourceIdentity {
    /// The uid relationships should attach to: the involved object for
    /// event-like resources, the resource itself otherwise.
    pub fn effective_uid(&self) -> &str {
        self.involved_object_uid.as_deref().unwrap_or(&self.uid)
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_none()
    }
}

/// A single observed resource change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    /// Nanoseconds since the Unix epoch.
    pub timestamp: i64,
    pub kind: EventKind,
    pub identity: ResourceIdentity,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Pruned, normalized object payload.
    pub payload: serde_json::Value,
    pub status: ResourceStatus,
    pub raw_size: u64,
    pub normalized_size: u64,
}

impl Event {
    pub fn timestamp_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.timestamp)
    }

    /// The UTC hour partition this event belongs to, formatted as the block
    /// file stem (`YYYY-MM-DD-HH`).
    pub fn hour_partition(&self) -> String {
        hour_partition(self.timestamp)
    }
}

/// Formats a nanosecond timestamp as its hourly partition name.
pub fn hour_partition(timestamp_ns: i64) -> String {
    Utc.timestamp_nanos(timestamp_ns)
        .format("%Y-%m-%d-%H")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hour_partition_is_utc() {
        // 2021-09-05T12:34:56Z
        let ts = Utc
            .with_ymd_and_hms(2021, 9, 5, 12, 34, 56)
            .unwrap()
            .timestamp_nanos_opt()
            .unwrap();
        assert_eq!(hour_partition(ts), "2021-09-05-12");
    }

    #[test]
    fn effective_uid_prefers_involved_object() {
        let mut identity = ResourceIdentity {
            uid: "event-uid".into(),
            ..Default::default()
        };
        assert_eq!(identity.effective_uid(), "event-uid");

        identity.involved_object_uid = Some("pod-uid".into());
        assert_eq!(identity.effective_uid(), "pod-uid");
    }
}
