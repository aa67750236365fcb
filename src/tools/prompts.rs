//! Parameterized investigation prompts.
//!
//! Prompts are workflow instructions for assistants driving the tools, not
//! answers themselves. Two are shipped: a post-mortem walkthrough and a
//! live-incident triage flow.

use serde::Serialize;

#[derive(Clone, Debug, Serialize)]
pub struct PromptArgument {
    pub name: String,
    pub description: String,
    pub required: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct PromptDescriptor {
    pub name: String,
    pub description: String,
    pub arguments: Vec<PromptArgument>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: serde_json::Value,
}

pub fn list() -> Vec<PromptDescriptor> {
    vec![
        PromptDescriptor {
            name: "post_mortem".into(),
            description: "Reconstruct what happened to a workload over a past time range".into(),
            arguments: vec![
                PromptArgument {
                    name: "namespace".into(),
                    description: "Namespace of the affected workload".into(),
                    required: true,
                },
                PromptArgument {
                    name: "from".into(),
                    description: "Start of the incident window (RFC 3339)".into(),
                    required: true,
                },
                PromptArgument {
                    name: "to".into(),
                    description: "End of the incident window (RFC 3339)".into(),
                    required: true,
                },
            ],
        },
        PromptDescriptor {
            name: "live_incident".into(),
            description: "Triage an ongoing incident starting from symptoms".into(),
            arguments: vec![PromptArgument {
                name: "namespace".into(),
                description: "Namespace showing symptoms (omit to survey the cluster)".into(),
                required: false,
            }],
        },
    ]
}

fn argument<'a>(args: &'a serde_json::Value, name: &str) -> &'a str {
    args.get(name).and_then(|v| v.as_str()).unwrap_or("")
}

pub fn get(name: &str, args: &serde_json::Value) -> Option<Vec<PromptMessage>> {
    let text = match name {
        "post_mortem" => {
            let namespace = argument(args, "namespace");
            let from = argument(args, "from");
            let to = argument(args, "to");
            format!(
                "You are reconstructing an incident in namespace `{namespace}` \
                 between {from} and {to}.\n\n\
                 Work outward from symptoms to causes, narrowing at each step:\n\
                 1. Call `cluster_health` to frame overall state in the window.\n\
                 2. Call `resource_changes` with the namespace and window to list \
                 what changed, paying attention to Delete events and Error statuses.\n\
                 3. For each suspicious resource, call `investigate` to see its \
                 relationships (owners, managers, references) and recent changes.\n\
                 4. Use the log tools: `*_overview` for error volume by namespace, \
                 then `*_patterns` over the window to find novel log templates, \
                 then `*_logs` only for the templates that matter.\n\
                 5. Check alert history for flapping or state changes in the window.\n\
                 6. Correlate: line up the change timeline against log novelty and \
                 alert transitions before concluding.\n\n\
                 Produce: a timeline of relevant changes, the most likely root \
                 cause, contributing factors, and evidence for each claim."
            )
        }
        "live_incident" => {
            let namespace = argument(args, "namespace");
            let scope = if namespace.is_empty() {
                "the whole cluster".to_string()
            } else {
                format!("namespace `{namespace}`")
            };
            format!(
                "You are triaging a live incident in {scope}.\n\n\
                 Move from broad to narrow, cheapest calls first:\n\
                 1. `cluster_health` for the blast radius: which namespaces are \
                 degraded right now.\n\
                 2. Metrics `overview` for active anomalies; treat error-rate \
                 anomalies as the strongest signal.\n\
                 3. Alert list for currently firing alerts and recent transitions; \
                 discount alerts categorized as flapping.\n\
                 4. `resource_changes` over the last hour in affected namespaces; \
                 recent Deploys, ConfigMap changes, and scaling events are prime \
                 suspects.\n\
                 5. `*_patterns` for novel log templates since the incident began; \
                 novel templates usually name the failing component.\n\
                 6. `investigate` the suspect resource to find what manages it and \
                 what else it touches before proposing a mitigation.\n\n\
                 Report: current impact, most likely trigger, and the single \
                 safest next action."
            )
        }
        _ => return None,
    };

    Some(vec![PromptMessage {
        role: "user".into(),
        content: serde_json::json!({"type": "text", "text": text}),
    }])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prompts_are_listed() {
        let prompts = list();
        assert_eq!(prompts.len(), 2);
        assert!(prompts.iter().any(|p| p.name == "post_mortem"));
        assert!(prompts.iter().any(|p| p.name == "live_incident"));
    }

    #[test]
    fn post_mortem_interpolates_arguments() {
        let messages = get(
            "post_mortem",
            &json!({"namespace": "prod", "from": "2024-01-01T00:00:00Z", "to": "2024-01-01T06:00:00Z"}),
        )
        .unwrap();
        let text = messages[0].content["text"].as_str().unwrap();
        assert!(text.contains("`prod`"));
        assert!(text.contains("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn unknown_prompt_is_none() {
        assert!(get("nope", &json!({})).is_none());
    }
}
