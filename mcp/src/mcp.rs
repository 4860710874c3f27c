//! MCP (Model Context Protocol) JSON-RPC handler.
//!
//! Implements the [MCP specification](https://spec.modelcontextprotocol.io/)
//! over stdio: reads JSON-RPC 2.0 requests from stdin (one per line) and
//! writes responses to stdout.
//!
//! ## Supported methods
//!
//! | Method              | Description                          |
//! |---------------------|--------------------------------------|
//! | `initialize`        | Handshake, returns capabilities      |
//! | `tools/list`        | List operation definitions           |
//! | `tools/call`        | Run an operation, return its envelope|
//! | `resources/list`    | List `proxmox://` resources          |
//! | `resources/read`    | Read one resource                    |
//! | `ping`              | Liveness check                       |
//!
//! Notifications (`notifications/initialized`, `notifications/cancelled`) are
//! acknowledged silently. Every call runs with the caller role fixed at startup.

use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::dispatcher::Dispatcher;

const SERVER_NAME: &str = "pve-mcp";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Run the MCP server on stdio, processing JSON-RPC requests until EOF.
pub async fn run_stdio(dispatcher: &Dispatcher, role: &str) {
    let reader = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    serve(dispatcher, role, reader, &mut stdout).await;
}

/// Line-delimited JSON-RPC loop over any reader/writer pair.
pub async fn serve<R, W>(dispatcher: &Dispatcher, role: &str, mut reader: R, writer: &mut W)
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "stdin read error");
                break;
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Value>(trimmed) {
            Ok(request) => handle_request(dispatcher, role, &request).await,
            Err(e) => Some(json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": {
                    "code": -32700,
                    "message": format!("Parse error: {}", e)
                }
            })),
        };
        if let Some(response) = response {
            write_response(writer, &response).await;
        }
    }
}

/// Answer one request. Notifications produce no response.
pub async fn handle_request(dispatcher: &Dispatcher, role: &str, request: &Value) -> Option<Value> {
    let id = request.get("id").cloned();
    let method = request.get("method").and_then(Value::as_str).unwrap_or("");

    let Some(id) = id else {
        match method {
            "notifications/initialized" | "notifications/cancelled" => {}
            _ => tracing::debug!(method, "Ignoring unknown notification"),
        }
        return None;
    };

    let params = request.get("params").cloned().unwrap_or(json!({}));
    let response = match method {
        "initialize" => handle_initialize(),
        "ping" => json!({ "jsonrpc": "2.0", "result": {} }),
        "tools/list" => json!({
            "jsonrpc": "2.0",
            "result": { "tools": dispatcher.list_operations() }
        }),
        "tools/call" => handle_tools_call(dispatcher, role, &params).await,
        "resources/list" => json!({
            "jsonrpc": "2.0",
            "result": { "resources": dispatcher.list_resources() }
        }),
        "resources/read" => handle_resources_read(dispatcher, role, &params).await,
        _ => json!({
            "jsonrpc": "2.0",
            "error": {
                "code": -32601,
                "message": format!("Method not found: {}", method)
            }
        }),
    };
    Some(inject_id(response, id))
}

/// Handle `initialize`: protocol version, capabilities, and server info.
fn handle_initialize() -> Value {
    json!({
        "jsonrpc": "2.0",
        "result": {
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": false },
                "resources": { "listChanged": false }
            },
            "serverInfo": {
                "name": SERVER_NAME,
                "version": SERVER_VERSION
            }
        }
    })
}

/// Handle `tools/call`: the envelope becomes the text content; failures set
/// `isError`.
async fn handle_tools_call(dispatcher: &Dispatcher, role: &str, params: &Value) -> Value {
    let name = params.get("name").and_then(Value::as_str).unwrap_or("");
    let args = match params.get("arguments") {
        None | Some(Value::Null) => json!({}),
        Some(v) => v.clone(),
    };

    let envelope = dispatcher.call_operation(name, &args, role).await;
    let text = serde_json::to_string_pretty(&envelope.to_value()).unwrap_or_default();

    let mut result = json!({
        "content": [{ "type": "text", "text": text }]
    });
    if !envelope.success {
        result["isError"] = json!(true);
    }
    json!({ "jsonrpc": "2.0", "result": result })
}

async fn handle_resources_read(dispatcher: &Dispatcher, role: &str, params: &Value) -> Value {
    let Some(uri) = params.get("uri").and_then(Value::as_str) else {
        return json!({
            "jsonrpc": "2.0",
            "error": { "code": -32602, "message": "Invalid params: missing uri" }
        });
    };

    let envelope = dispatcher.read_resource(uri, role).await;
    match (envelope.success, envelope.result) {
        (true, Some(doc)) => json!({
            "jsonrpc": "2.0",
            "result": {
                "contents": [{
                    "uri": uri,
                    "mimeType": "application/json",
                    "text": serde_json::to_string_pretty(&doc).unwrap_or_default()
                }]
            }
        }),
        _ => {
            let (message, data) = envelope
                .error
                .map(|e| (e.message.clone(), json!({ "code": e.code, "details": e.details })))
                .unwrap_or_else(|| ("resource read failed".to_string(), Value::Null));
            json!({
                "jsonrpc": "2.0",
                "error": { "code": -32002, "message": message, "data": data }
            })
        }
    }
}

/// Inject the request `id` into a response object.
fn inject_id(mut response: Value, id: Value) -> Value {
    response["id"] = id;
    response
}

/// Write a JSON-RPC response (one line, flushed immediately).
async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &Value) {
    let mut output = serde_json::to_string(response).unwrap_or_default();
    output.push('\n');
    if let Err(e) = writer.write_all(output.as_bytes()).await {
        tracing::error!(error = %e, "stdout write error");
    }
    if let Err(e) = writer.flush().await {
        tracing::error!(error = %e, "stdout flush error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::tests::dispatcher;
    use crate::mock::MockTransport;

    #[tokio::test(start_paused = true)]
    async fn initialize_reports_server() {
        let mock = MockTransport::new();
        let d = dispatcher(&mock).await;
        let resp = handle_request(&d, "viewer", &json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}))
            .await
            .unwrap();
        assert_eq!(resp["id"], 1);
        assert_eq!(resp["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(resp["result"]["serverInfo"]["name"], "pve-mcp");
    }

    #[tokio::test(start_paused = true)]
    async fn notifications_are_silent() {
        let mock = MockTransport::new();
        let d = dispatcher(&mock).await;
        let resp = handle_request(
            &d,
            "viewer",
            &json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        )
        .await;
        assert!(resp.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_method() {
        let mock = MockTransport::new();
        let d = dispatcher(&mock).await;
        let resp = handle_request(&d, "viewer", &json!({"jsonrpc": "2.0", "id": "a", "method": "sampling/create"}))
            .await
            .unwrap();
        assert_eq!(resp["error"]["code"], -32601);
        assert_eq!(resp["id"], "a");
    }

    #[tokio::test(start_paused = true)]
    async fn denied_call_sets_is_error() {
        let mock = MockTransport::new();
        let d = dispatcher(&mock).await;
        let resp = handle_request(
            &d,
            "viewer",
            &json!({
                "jsonrpc": "2.0", "id": 7, "method": "tools/call",
                "params": {"name": "delete_vm", "arguments": {"node": "pve1", "vmid": 101}}
            }),
        )
        .await
        .unwrap();
        assert_eq!(resp["result"]["isError"], true);
        let text = resp["result"]["content"][0]["text"].as_str().unwrap();
        let envelope: Value = serde_json::from_str(text).unwrap();
        assert_eq!(envelope["success"], false);
        assert_eq!(envelope["error"]["code"], "PermissionDenied");
    }

    #[tokio::test(start_paused = true)]
    async fn serve_handles_parse_errors_and_calls() {
        let mock = MockTransport::new();
        let d = dispatcher(&mock).await;
        mock.respond("ha_resources", json!([]));

        let input = concat!(
            "not json\n",
            "\n",
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/call\",\"params\":{\"name\":\"get_ha_resources\"}}\n",
            "{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ping\"}\n",
        );
        let mut out = Vec::new();
        serve(&d, "viewer", input.as_bytes(), &mut out).await;

        let lines: Vec<Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["error"]["code"], -32700);
        assert!(lines[1]["result"].get("isError").is_none());
        assert_eq!(lines[2]["id"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn resources_roundtrip() {
        let mock = MockTransport::new();
        let d = dispatcher(&mock).await;
        mock.respond("cluster_status", json!([{"type": "node", "name": "pve1", "online": 1}]));

        let list = handle_request(&d, "viewer", &json!({"jsonrpc": "2.0", "id": 1, "method": "resources/list"}))
            .await
            .unwrap();
        assert_eq!(list["result"]["resources"].as_array().unwrap().len(), 8);

        let read = handle_request(
            &d,
            "viewer",
            &json!({"jsonrpc": "2.0", "id": 2, "method": "resources/read", "params": {"uri": "proxmox://cluster/status"}}),
        )
        .await
        .unwrap();
        let text = read["result"]["contents"][0]["text"].as_str().unwrap();
        assert!(text.contains("healthy"));

        let missing = handle_request(
            &d,
            "viewer",
            &json!({"jsonrpc": "2.0", "id": 3, "method": "resources/read", "params": {"uri": "proxmox://nope"}}),
        )
        .await
        .unwrap();
        assert_eq!(missing["error"]["data"]["code"], "UnknownResource");
    }
}
