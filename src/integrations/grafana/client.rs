//! Grafana HTTP API client: dashboards, alert rules, alert states, and
//! datasource-proxied metric queries.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use snafu::{ResultExt, Snafu};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Liveness probe budget.
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Snafu)]
pub enum ClientError {
    #[snafu(display("request to {} failed: {}", url, source))]
    Request { url: String, source: reqwest::Error },

    #[snafu(display("{} returned status {}", url, status))]
    Status { url: String, status: u16 },

    #[snafu(display("malformed response from {}: {}", url, source))]
    Malformed { url: String, source: reqwest::Error },
}

#[derive(Clone, Debug, Deserialize)]
pub struct DashboardHit {
    pub uid: String,
    pub title: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, rename = "folderTitle")]
    pub folder_title: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AlertRule {
    pub uid: String,
    pub title: String,
    #[serde(default, rename = "folderUID")]
    pub folder_uid: Option<String>,
    #[serde(default, rename = "ruleGroup")]
    pub rule_group: Option<String>,
}

/// Worst-first ordering: firing > pending > normal.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    Normal,
    Pending,
    Firing,
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertState::Normal => "normal",
            AlertState::Pending => "pending",
            AlertState::Firing => "firing",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "firing" | "alerting" => AlertState::Firing,
            "pending" => AlertState::Pending,
            _ => AlertState::Normal,
        }
    }
}

/// One alert rule with the states of its instances.
#[derive(Clone, Debug)]
pub struct AlertStateRecord {
    /// Rule uid when the API provides one, else the rule name.
    pub key: String,
    pub name: String,
    pub instance_states: Vec<AlertState>,
}

#[derive(Clone)]
pub struct GrafanaClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl GrafanaClient {
    pub fn new(base_url: String, token: Option<String>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| ClientError::Request {
                url: base_url.clone(),
                source,
            })?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.get(format!("{}{}", self.base_url, path));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.post(format!("{}{}", self.base_url, path));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .get(path)
            .send()
            .await
            .context(RequestSnafu { url: url.clone() })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                url,
                status: status.as_u16(),
            });
        }
        response.json().await.context(MalformedSnafu { url })
    }

    pub async fn healthy(&self) -> Result<(), ClientError> {
        let url = format!("{}/api/health", self.base_url);
        let response = self
            .get("/api/health")
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .context(RequestSnafu { url: url.clone() })?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ClientError::Status {
                url,
                status: status.as_u16(),
            })
        }
    }

    pub async fn search_dashboards(&self) -> Result<Vec<DashboardHit>, ClientError> {
        self.get_json("/api/search?type=dash-db&limit=5000").await
    }

    /// Full dashboard JSON (panels, templating) by uid.
    pub async fn dashboard(&self, uid: &str) -> Result<Value, ClientError> {
        let body: Value = self.get_json(&format!("/api/dashboards/uid/{uid}")).await?;
        Ok(body.get("dashboard").cloned().unwrap_or(Value::Null))
    }

    pub async fn alert_rules(&self) -> Result<Vec<AlertRule>, ClientError> {
        self.get_json("/api/v1/provisioning/alert-rules").await
    }

    /// Current alert instance states from the Prometheus-compatible rules
    /// endpoint.
    pub async fn alert_states(&self) -> Result<Vec<AlertStateRecord>, ClientError> {
        #[derive(Deserialize)]
        struct RulesResponse {
            #[serde(default)]
            data: RulesData,
        }
        #[derive(Default, Deserialize)]
        struct RulesData {
            #[serde(default)]
            groups: Vec<RuleGroup>,
        }
        #[derive(Deserialize)]
        struct RuleGroup {
            #[serde(default)]
            rules: Vec<Rule>,
        }
        #[derive(Deserialize)]
        struct Rule {
            #[serde(default)]
            name: String,
            #[serde(default)]
            uid: Option<String>,
            #[serde(default)]
            state: Option<String>,
            #[serde(default)]
            alerts: Vec<RuleAlert>,
        }
        #[derive(Deserialize)]
        struct RuleAlert {
            #[serde(default)]
            state: String,
        }

        let response: RulesResponse = self
            .get_json("/api/prometheus/grafana/api/v1/rules")
            .await?;

        let mut records = Vec::new();
        for group in response.data.groups {
            for rule in group.rules {
                // Alerting rules only; recording rules carry no state.
                let Some(rule_state) = rule.state else { continue };
                let mut instance_states: Vec<AlertState> = rule
                    .alerts
                    .iter()
                    .map(|a| AlertState::parse(&a.state))
                    .collect();
                if instance_states.is_empty() {
                    instance_states.push(AlertState::parse(&rule_state));
                }
                records.push(AlertStateRecord {
                    key: rule.uid.clone().unwrap_or_else(|| rule.name.clone()),
                    name: rule.name,
                    instance_states,
                });
            }
        }
        Ok(records)
    }

    /// Executes one metric expression through the datasource proxy and
    /// returns (timestamp-ms, value) samples.
    pub async fn query_range(
        &self,
        datasource_uid: &str,
        expr: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<(i64, f64)>, ClientError> {
        let url = format!("{}/api/ds/query", self.base_url);
        let body = json!({
            "from": from_ms.to_string(),
            "to": to_ms.to_string(),
            "queries": [{
                "refId": "A",
                "expr": expr,
                "datasource": {"uid": datasource_uid},
                "maxDataPoints": 500,
            }]
        });

        let response = self
            .post("/api/ds/query")
            .json(&body)
            .send()
            .await
            .context(RequestSnafu { url: url.clone() })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                url,
                status: status.as_u16(),
            });
        }
        let parsed: Value = response.json().await.context(MalformedSnafu { url })?;

        // results.A.frames[].data.values = [[timestamps], [values]]
        let mut samples = Vec::new();
        if let Some(frames) = parsed
            .pointer("/results/A/frames")
            .and_then(Value::as_array)
        {
            for frame in frames {
                let Some(columns) = frame.pointer("/data/values").and_then(Value::as_array) else {
                    continue;
                };
                let timestamps = columns.get(0).and_then(Value::as_array);
                let values = columns.get(1).and_then(Value::as_array);
                if let (Some(timestamps), Some(values)) = (timestamps, values) {
                    for (ts, value) in timestamps.iter().zip(values) {
                        if let (Some(ts), Some(value)) = (ts.as_i64(), value.as_f64()) {
                            samples.push((ts, value));
                        }
                    }
                }
            }
        }
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_state_parsing_and_order() {
        assert_eq!(AlertState::parse("firing"), AlertState::Firing);
        assert_eq!(AlertState::parse("alerting"), AlertState::Firing);
        assert_eq!(AlertState::parse("pending"), AlertState::Pending);
        assert_eq!(AlertState::parse("inactive"), AlertState::Normal);
        assert_eq!(AlertState::parse("ok"), AlertState::Normal);

        assert!(AlertState::Firing > AlertState::Pending);
        assert!(AlertState::Pending > AlertState::Normal);
    }
}
