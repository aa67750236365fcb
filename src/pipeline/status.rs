//! Coarse per-resource status inference.
//!
//! Inspectors are resource-kind specific where it matters (Pods mostly) and
//! fall back to generic condition scanning elsewhere.

use serde_json::Value;

use crate::event::ResourceStatus;

const ERROR_WAITING_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerError",
    "RunContainerError",
];

/// OOM kills surface as exit code 137 even when the reason string is absent.
const OOM_EXIT_CODE: i64 = 137;

pub fn infer_status(kind: &str, object: &Value) -> ResourceStatus {
    if object.pointer("/metadata/deletionTimestamp").is_some() {
        return ResourceStatus::Terminating;
    }

    match kind {
        "Pod" => pod_status(object),
        "Deployment" | "StatefulSet" | "ReplicaSet" => workload_status(object),
        "DaemonSet" => daemonset_status(object),
        "Node" => node_status(object),
        "Job" => job_status(object),
        _ => generic_status(object),
    }
}

fn pod_status(object: &Value) -> ResourceStatus {
    let statuses = object
        .pointer("/status/containerStatuses")
        .and_then(Value::as_array);
    if let Some(statuses) = statuses {
        for container in statuses {
            if let Some(reason) = container
                .pointer("/state/waiting/reason")
                .and_then(Value::as_str)
            {
                if ERROR_WAITING_REASONS.contains(&reason) {
                    return ResourceStatus::Error;
                }
            }
            let terminated = container.pointer("/lastState/terminated");
            if let Some(terminated) = terminated {
                let oom = terminated
                    .pointer("/reason")
                    .and_then(Value::as_str)
                    .map(|r| r == "OOMKilled")
                    .unwrap_or(false)
                    || terminated
                        .pointer("/exitCode")
                        .and_then(Value::as_i64)
                        .map(|c| c == OOM_EXIT_CODE)
                        .unwrap_or(false);
                if oom {
                    return ResourceStatus::Error;
                }
            }
        }
    }

    match object.pointer("/status/phase").and_then(Value::as_str) {
        Some("Running") => {
            if condition_is_true(object, "Ready") {
                ResourceStatus::Ready
            } else {
                ResourceStatus::Warning
            }
        }
        Some("Succeeded") => ResourceStatus::Ready,
        Some("Pending") => ResourceStatus::Warning,
        Some("Failed") => ResourceStatus::Error,
        _ => ResourceStatus::Unknown,
    }
}

fn workload_status(object: &Value) -> ResourceStatus {
    let desired = object
        .pointer("/spec/replicas")
        .and_then(Value::as_i64)
        .unwrap_or(1);
    let ready = object
        .pointer("/status/readyReplicas")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    if desired == 0 || ready >= desired {
        ResourceStatus::Ready
    } else if ready > 0 {
        ResourceStatus::Warning
    } else {
        ResourceStatus::Error
    }
}

fn daemonset_status(object: &Value) -> ResourceStatus {
    let desired = object
        .pointer("/status/desiredNumberScheduled")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let ready = object
        .pointer("/status/numberReady")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    if desired == 0 || ready >= desired {
        ResourceStatus::Ready
    } else if ready > 0 {
        ResourceStatus::Warning
    } else {
        ResourceStatus::Error
    }
}

fn node_status(object: &Value) -> ResourceStatus {
    if condition_is_true(object, "Ready") {
        ResourceStatus::Ready
    } else {
        ResourceStatus::Error
    }
}

fn job_status(object: &Value) -> ResourceStatus {
    if condition_is_true(object, "Complete") {
        return ResourceStatus::Ready;
    }
    if condition_is_true(object, "Failed") {
        return ResourceStatus::Error;
    }
    let active = object
        .pointer("/status/active")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    if active > 0 {
        ResourceStatus::Warning
    } else {
        ResourceStatus::Unknown
    }
}

fn generic_status(object: &Value) -> ResourceStatus {
    for condition_type in ["Ready", "Available"] {
        if let Some(status) = condition(object, condition_type) {
            return if status {
                ResourceStatus::Ready
            } else {
                ResourceStatus::Warning
            };
        }
    }
    ResourceStatus::Unknown
}

fn condition(object: &Value, condition_type: &str) -> Option<bool> {
    object
        .pointer("/status/conditions")
        .and_then(Value::as_array)?
        .iter()
        .find(|c| c.pointer("/type").and_then(Value::as_str) == Some(condition_type))
        .and_then(|c| c.pointer("/status").and_then(Value::as_str))
        .map(|s| s == "True")
}

fn condition_is_true(object: &Value, condition_type: &str) -> bool {
    condition(object, condition_type).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn crashloop_pod_is_error() {
        let pod = json!({
            "status": {
                "phase": "Running",
                "containerStatuses": [
                    {"state": {"waiting": {"reason": "CrashLoopBackOff"}}}
                ]
            }
        });
        assert_eq!(infer_status("Pod", &pod), ResourceStatus::Error);
    }

    #[test]
    fn oom_killed_by_exit_code_is_error() {
        let pod = json!({
            "status": {
                "phase": "Running",
                "containerStatuses": [
                    {"lastState": {"terminated": {"exitCode": 137}}}
                ]
            }
        });
        assert_eq!(infer_status("Pod", &pod), ResourceStatus::Error);
    }

    #[test]
    fn ready_running_pod() {
        let pod = json!({
            "status": {
                "phase": "Running",
                "conditions": [{"type": "Ready", "status": "True"}],
                "containerStatuses": []
            }
        });
        assert_eq!(infer_status("Pod", &pod), ResourceStatus::Ready);
    }

    #[test]
    fn deletion_timestamp_wins() {
        let pod = json!({
            "metadata": {"deletionTimestamp": "2024-01-01T00:00:00Z"},
            "status": {"phase": "Running"}
        });
        assert_eq!(infer_status("Pod", &pod), ResourceStatus::Terminating);
    }

    #[test]
    fn deployment_scaling_is_warning() {
        let deploy = json!({
            "spec": {"replicas": 3},
            "status": {"readyReplicas": 1}
        });
        assert_eq!(infer_status("Deployment", &deploy), ResourceStatus::Warning);
    }

    #[test]
    fn unknown_kind_without_conditions_is_unknown() {
        assert_eq!(infer_status("ConfigMap", &json!({})), ResourceStatus::Unknown);
    }
}
