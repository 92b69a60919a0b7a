//! Line-delimited JSON-RPC transport over stdio.
//!
//! Each stdin line is one request; each response is one stdout line.
//! Methods: `tools/list` and `tools/call {name, arguments}`.

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::tools::{ToolSurface, TOOL_NAMES};
use crate::types::error::OrchestratorError;
use crate::types::RequestId;

/// Handle one request line; `None` for blank lines.
pub async fn handle_line(surface: &ToolSurface, line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let request: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            return Some(
                error_response(serde_json::Value::Null, -32700, &format!("parse error: {e}"), None)
                    .to_string(),
            )
        }
    };
    let id = request.get("id").cloned().unwrap_or(serde_json::Value::Null);
    let method = request.get("method").and_then(|m| m.as_str()).unwrap_or("");

    let response = match method {
        "tools/list" => {
            let tools: Vec<serde_json::Value> = TOOL_NAMES
                .iter()
                .map(|name| serde_json::json!({ "name": name }))
                .collect();
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "tools": tools },
            })
        }
        "tools/call" => {
            let params = request.get("params").cloned().unwrap_or_default();
            let name = params.get("name").and_then(|n| n.as_str()).unwrap_or("");
            let arguments = params
                .get("arguments")
                .cloned()
                .unwrap_or(serde_json::json!({}));

            match surface.dispatch(name, arguments, RequestId::new(), 0).await {
                Ok(result) => serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": result,
                }),
                Err(e) => error_response(id, -32000, &e.to_string(), Some(e)),
            }
        }
        other => error_response(id, -32601, &format!("unknown method: {other}"), None),
    };

    Some(response.to_string())
}

fn error_response(
    id: serde_json::Value,
    code: i64,
    message: &str,
    error: Option<OrchestratorError>,
) -> serde_json::Value {
    let data = error.map(|e| e.to_wire());
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message, "data": data },
    })
}

/// Serve requests from stdin until EOF.
pub async fn run(surface: Arc<ToolSurface>) -> std::io::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    tracing::info!("stdio transport ready");
    while let Some(line) = lines.next_line().await? {
        if let Some(response) = handle_line(&surface, &line).await {
            stdout.write_all(response.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
    }
    tracing::info!("stdin closed, stdio transport exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testutil::scripted_services;

    async fn surface(dir: &tempfile::TempDir) -> ToolSurface {
        ToolSurface::new(scripted_services(vec![], dir).await)
    }

    #[tokio::test]
    async fn lists_tools() {
        let dir = tempfile::TempDir::new().unwrap();
        let surface = surface(&dir).await;
        let response = handle_line(
            &surface,
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#,
        )
        .await
        .unwrap();
        let json: serde_json::Value = serde_json::from_str(&response).unwrap();
        assert_eq!(json["id"], 1);
        let tools = json["result"]["tools"].as_array().unwrap();
        assert!(tools.iter().any(|t| t["name"] == "research"));
    }

    #[tokio::test]
    async fn calls_a_tool_and_correlates_ids() {
        let dir = tempfile::TempDir::new().unwrap();
        let surface = surface(&dir).await;
        let response = handle_line(
            &surface,
            r#"{"jsonrpc":"2.0","id":"abc","method":"tools/call","params":{"name":"index_status","arguments":{}}}"#,
        )
        .await
        .unwrap();
        let json: serde_json::Value = serde_json::from_str(&response).unwrap();
        assert_eq!(json["id"], "abc");
        assert_eq!(json["result"]["documents"], 0);
    }

    #[tokio::test]
    async fn tool_errors_carry_categories() {
        let dir = tempfile::TempDir::new().unwrap();
        let surface = surface(&dir).await;
        let response = handle_line(
            &surface,
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"cancel_job","arguments":{"job_id":"job_0_nope0000"}}}"#,
        )
        .await
        .unwrap();
        let json: serde_json::Value = serde_json::from_str(&response).unwrap();
        assert_eq!(json["error"]["data"]["category"], "not_found");
    }

    #[tokio::test]
    async fn malformed_json_is_a_parse_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let surface = surface(&dir).await;
        let response = handle_line(&surface, "{not json").await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&response).unwrap();
        assert_eq!(json["error"]["code"], -32700);
        assert!(handle_line(&surface, "   ").await.is_none());
    }
}
