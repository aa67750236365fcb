//! The tool/prompt protocol spoken by AI assistants.
//!
//! JSON-RPC-shaped request/response with a fixed method set. Two transports
//! (framed HTTP POST and newline-delimited stdio) share this handler. Tool
//! failures are content-level results with `isError`; protocol-level errors
//! are reserved for malformed requests and unknown methods.

pub mod stdio;

use std::sync::Arc;

use serde_json::{json, Value};

use crate::tools::{prompts, ToolRegistry};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

pub struct McpHandler {
    tools: Arc<ToolRegistry>,
}

impl McpHandler {
    pub fn new(tools: Arc<ToolRegistry>) -> Arc<Self> {
        Arc::new(Self { tools })
    }

    /// Handles one raw request line/body. Returns `None` for notifications
    /// (requests without an id), which get no response.
    pub async fn handle_raw(&self, raw: &str) -> Option<Value> {
        let request: Value = match serde_json::from_str(raw) {
            Ok(request) => request,
            Err(error) => {
                return Some(error_response(
                    Value::Null,
                    PARSE_ERROR,
                    &format!("parse error: {error}"),
                ))
            }
        };
        self.handle(request).await
    }

    pub async fn handle(&self, request: Value) -> Option<Value> {
        let id = request.get("id").cloned();
        let Some(method) = request.get("method").and_then(Value::as_str) else {
            return Some(error_response(
                id.unwrap_or(Value::Null),
                INVALID_REQUEST,
                "missing method",
            ));
        };
        let params = request.get("params").cloned().unwrap_or(json!({}));

        debug!(message = "mcp request", method);
        let outcome = self.dispatch(method, params).await;

        // Notifications get processed but never answered.
        let id = id?;
        Some(match outcome {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, message)) => error_response(id, code, &message),
        })
    }

    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, (i64, String)> {
        match method {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {},
                    "prompts": {},
                    "logging": {},
                },
                "serverInfo": {
                    "name": "spectre",
                    "version": env!("CARGO_PKG_VERSION"),
                }
            })),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({"tools": self.tools.list()})),
            "tools/call" => {
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or((INVALID_PARAMS, "missing tool name".to_string()))?;
                let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
                let result = self.tools.call(name, arguments).await;
                serde_json::to_value(&result)
                    .map_err(|e| (INVALID_PARAMS, format!("unserializable result: {e}")))
            }
            "prompts/list" => Ok(json!({"prompts": prompts::list()})),
            "prompts/get" => {
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or((INVALID_PARAMS, "missing prompt name".to_string()))?;
                let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
                match prompts::get(name, &arguments) {
                    Some(messages) => Ok(json!({"messages": messages})),
                    None => Err((INVALID_PARAMS, format!("unknown prompt: {name}"))),
                }
            }
            "logging/setLevel" => {
                let level = params
                    .get("level")
                    .and_then(Value::as_str)
                    .unwrap_or("info");
                // The subscriber filter is fixed at startup; acknowledge and
                // record the request so operators can see it was asked for.
                info!(message = "log level change requested via mcp", requested = level);
                Ok(json!({}))
            }
            other => Err((METHOD_NOT_FOUND, format!("unknown method: {other}"))),
        }
    }
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message}
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{Tool, ToolResult};
    use async_trait::async_trait;

    struct Fixed;

    #[async_trait]
    impl Tool for Fixed {
        fn name(&self) -> String {
            "fixed".into()
        }
        fn description(&self) -> String {
            "returns a fixed string".into()
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: Value) -> ToolResult {
            ToolResult::text("forty-two")
        }
    }

    fn handler() -> Arc<McpHandler> {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Fixed));
        McpHandler::new(registry)
    }

    #[tokio::test]
    async fn initialize_and_ping() {
        let handler = handler();
        let response = handler
            .handle_raw(r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#)
            .await
            .unwrap();
        assert_eq!(response["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(response["id"], 1);

        let response = handler
            .handle_raw(r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#)
            .await
            .unwrap();
        assert_eq!(response["result"], json!({}));
    }

    #[tokio::test]
    async fn tools_list_and_call() {
        let handler = handler();
        let response = handler
            .handle_raw(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#)
            .await
            .unwrap();
        assert_eq!(response["result"]["tools"][0]["name"], "fixed");

        let response = handler
            .handle_raw(
                r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"fixed","arguments":{}}}"#,
            )
            .await
            .unwrap();
        assert_eq!(response["result"]["isError"], false);
        assert_eq!(response["result"]["content"][0]["text"], "forty-two");
    }

    #[tokio::test]
    async fn unknown_tool_is_content_error_not_protocol_error() {
        let handler = handler();
        let response = handler
            .handle_raw(
                r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"nope"}}"#,
            )
            .await
            .unwrap();
        assert!(response.get("error").is_none());
        assert_eq!(response["result"]["isError"], true);
    }

    #[tokio::test]
    async fn unknown_method_is_protocol_error() {
        let handler = handler();
        let response = handler
            .handle_raw(r#"{"jsonrpc":"2.0","id":4,"method":"bogus"}"#)
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let handler = handler();
        let response = handler
            .handle_raw(r#"{"jsonrpc":"2.0","method":"ping"}"#)
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn malformed_json_is_parse_error() {
        let handler = handler();
        let response = handler.handle_raw("{not json").await.unwrap();
        assert_eq!(response["error"]["code"], PARSE_ERROR);
    }

    #[tokio::test]
    async fn prompts_round_trip() {
        let handler = handler();
        let response = handler
            .handle_raw(r#"{"jsonrpc":"2.0","id":5,"method":"prompts/list"}"#)
            .await
            .unwrap();
        assert!(response["result"]["prompts"].as_array().unwrap().len() >= 2);

        let response = handler
            .handle_raw(
                r#"{"jsonrpc":"2.0","id":6,"method":"prompts/get","params":{"name":"live_incident","arguments":{}}}"#,
            )
            .await
            .unwrap();
        assert!(response["result"]["messages"][0]["content"]["text"]
            .as_str()
            .unwrap()
            .contains("cluster_health"));
    }
}
