// src/engine/mcp.rs
//! Tool server client (JSON-RPC 2.0 over HTTP POST)
//!
//! Methods used:
//!
//! - `tools/list` → `{"tools": [{"name", "description", "inputSchema"}]}`
//! - `tools/call` `{"name", "arguments"}` → `{"content": [{"type": "text", "text"}], "isError"}`
//!
//! The bearer token is attached to every request. Replacing it drops the
//! cached catalogue and re-lists tools with the new credential.

use crate::engine::tools::{ToolError, ToolLayer, ToolSpec};
use crate::protocol::message::TabMemoryPayload;
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

const SAVE_TAB_MEMORY_TOOL: &str = "save_tab_memory";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ToolList {
    #[serde(default)]
    tools: Vec<ToolSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallResult {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    is_error: bool,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl CallResult {
    fn text(&self) -> String {
        self.content
            .iter()
            .filter(|block| block.kind == "text" || block.text.is_some())
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// [`ToolLayer`] backed by a remote tool server
pub struct McpToolLayer {
    url: Url,
    client: Client,
    token: RwLock<Option<String>>,
    catalogue: RwLock<Option<Vec<ToolSpec>>>,
    next_id: AtomicU64,
}

impl McpToolLayer {
    pub fn new(url: &str, token: Option<String>) -> Result<Self, ToolError> {
        let url = Url::parse(url).map_err(|e| ToolError::Unavailable(format!("invalid tool server url: {e}")))?;
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ToolError::Transport(e.to_string()))?;

        Ok(Self {
            url,
            client,
            token: RwLock::new(token),
            catalogue: RwLock::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn has_token(&self) -> bool {
        self.token.read().is_some()
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, ToolError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        debug!(method, id = request.id, "Tool server request");

        let mut builder = self.client.post(self.url.clone()).json(&request);
        let token = self.token.read().clone();
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ToolError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::Transport(format!(
                "tool server returned {status} for {method}"
            )));
        }

        let body: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| ToolError::Transport(format!("invalid JSON-RPC response: {e}")))?;

        if let Some(err) = body.error {
            return Err(ToolError::Execution {
                tool: method.to_string(),
                reason: format!("JSON-RPC error {}: {}", err.code, err.message),
            });
        }
        Ok(body.result.unwrap_or(Value::Null))
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallResult, ToolError> {
        let result = self
            .rpc("tools/call", json!({"name": name, "arguments": arguments}))
            .await
            .map_err(|e| match e {
                ToolError::Execution { reason, .. } => ToolError::Execution {
                    tool: name.to_string(),
                    reason,
                },
                other => other,
            })?;

        let call: CallResult = serde_json::from_value(result).map_err(|e| ToolError::Execution {
            tool: name.to_string(),
            reason: format!("unexpected result shape: {e}"),
        })?;

        if call.is_error {
            return Err(ToolError::Execution {
                tool: name.to_string(),
                reason: call.text(),
            });
        }
        Ok(call)
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolError> {
        let result = self.rpc("tools/list", json!({})).await?;
        let list: ToolList = serde_json::from_value(result)
            .map_err(|e| ToolError::Transport(format!("invalid tools/list result: {e}")))?;
        Ok(list.tools)
    }
}

#[async_trait]
impl ToolLayer for McpToolLayer {
    async fn catalogue(&self) -> Result<Vec<ToolSpec>, ToolError> {
        let cached = self.catalogue.read().clone();
        if let Some(tools) = cached {
            return Ok(tools);
        }

        let tools = self.list_tools().await?;
        info!(count = tools.len(), url = %self.url, "Loaded tool catalogue");
        *self.catalogue.write() = Some(tools.clone());
        Ok(tools)
    }

    async fn execute(&self, name: &str, arguments: Value) -> Result<String, ToolError> {
        Ok(self.call_tool(name, arguments).await?.text())
    }

    async fn save_tab_memory(&self, page: &TabMemoryPayload) -> Result<Value, ToolError> {
        let arguments = serde_json::to_value(page).map_err(|e| ToolError::Execution {
            tool: SAVE_TAB_MEMORY_TOOL.to_string(),
            reason: e.to_string(),
        })?;
        let result = self.call_tool(SAVE_TAB_MEMORY_TOOL, arguments).await?;
        Ok(json!({"saved": true, "message": result.text()}))
    }

    async fn set_auth_token(&self, token: Option<String>) -> Result<(), ToolError> {
        *self.token.write() = token;
        self.catalogue.write().take();

        match self.catalogue().await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("Tool server rejected refreshed credential: {}", e);
                Err(e)
            }
        }
    }

    async fn reset(&self) {
        self.catalogue.write().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Requests seen by the fake server: (authorization header, JSON body)
    type Seen = Arc<Mutex<Vec<(Option<String>, Value)>>>;

    /// Minimal one-request-per-connection HTTP responder
    async fn fake_server<F>(handler: F) -> (String, Seen)
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/rpc", listener.local_addr().unwrap());
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let seen_task = Arc::clone(&seen);
        let handler = Arc::new(handler);

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                let (head_end, content_length) = loop {
                    let n = socket.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break (0, 0);
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        let head = String::from_utf8_lossy(&buf[..pos]).to_lowercase();
                        let len = head
                            .lines()
                            .find_map(|l| l.strip_prefix("content-length:"))
                            .map(|v| v.trim().parse::<usize>().unwrap())
                            .unwrap_or(0);
                        break (pos + 4, len);
                    }
                };
                if head_end == 0 {
                    continue;
                }
                while buf.len() < head_end + content_length {
                    let n = socket.read(&mut chunk).await.unwrap();
                    buf.extend_from_slice(&chunk[..n]);
                }

                let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
                let auth = head.lines().find_map(|l| {
                    l.to_lowercase()
                        .starts_with("authorization:")
                        .then(|| l["authorization:".len()..].trim().to_string())
                });
                let body: Value = serde_json::from_slice(&buf[head_end..head_end + content_length]).unwrap();
                seen_task.lock().push((auth, body.clone()));

                let reply = json!({"jsonrpc": "2.0", "id": body["id"], "result": handler(&body)});
                let payload = reply.to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    payload.len(),
                    payload
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                let _ = socket.shutdown().await;
            }
        });

        (url, seen)
    }

    fn weather_server(request: &Value) -> Value {
        match request["method"].as_str() {
            Some("tools/list") => json!({"tools": [{
                "name": "get_weather",
                "description": "Weather for a city",
                "inputSchema": {"type": "object"}
            }]}),
            Some("tools/call") if request["params"]["name"] == "get_weather" => {
                json!({"content": [{"type": "text", "text": "18C, cloudy"}]})
            }
            Some("tools/call") if request["params"]["name"] == "save_tab_memory" => {
                json!({"content": [{"type": "text", "text": "stored"}]})
            }
            _ => json!({"content": [{"type": "text", "text": "no such tool"}], "isError": true}),
        }
    }

    #[tokio::test]
    async fn test_catalogue_is_cached() {
        let (url, seen) = fake_server(weather_server).await;
        let tools = McpToolLayer::new(&url, None).unwrap();

        let first = tools.catalogue().await.unwrap();
        let second = tools.catalogue().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].name, "get_weather");
        assert_eq!(seen.lock().len(), 1);

        tools.reset().await;
        tools.catalogue().await.unwrap();
        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_execute_and_tool_errors() {
        let (url, _seen) = fake_server(weather_server).await;
        let tools = McpToolLayer::new(&url, None).unwrap();

        let text = tools
            .execute("get_weather", json!({"city": "Paris"}))
            .await
            .unwrap();
        assert_eq!(text, "18C, cloudy");

        let err = tools.execute("send_email", json!({})).await.unwrap_err();
        assert_eq!(
            err,
            ToolError::Execution {
                tool: "send_email".into(),
                reason: "no such tool".into()
            }
        );
    }

    #[tokio::test]
    async fn test_token_refresh_relists_with_new_credential() {
        let (url, seen) = fake_server(weather_server).await;
        let tools = McpToolLayer::new(&url, Some("old".into())).unwrap();
        tools.catalogue().await.unwrap();

        tools.set_auth_token(Some("new".into())).await.unwrap();
        tools.set_auth_token(None).await.unwrap();
        assert!(!tools.has_token());

        let seen = seen.lock();
        let auths: Vec<Option<String>> = seen.iter().map(|(auth, _)| auth.clone()).collect();
        assert_eq!(
            auths,
            [Some("Bearer old".to_string()), Some("Bearer new".to_string()), None]
        );
        assert!(seen.iter().all(|(_, body)| body["method"] == "tools/list"));
    }

    #[tokio::test]
    async fn test_save_tab_memory_calls_tool() {
        let (url, seen) = fake_server(weather_server).await;
        let tools = McpToolLayer::new(&url, None).unwrap();
        let page = TabMemoryPayload {
            url: "https://example.com".into(),
            title: "Example".into(),
            content: "hello".into(),
        };

        let result = tools.save_tab_memory(&page).await.unwrap();
        assert_eq!(result["saved"], true);

        let seen = seen.lock();
        assert_eq!(seen[0].1["params"]["name"], SAVE_TAB_MEMORY_TOOL);
        assert_eq!(seen[0].1["params"]["arguments"]["url"], "https://example.com");
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_token_propagation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let tools = McpToolLayer::new(&url, None).unwrap();
        let err = tools.set_auth_token(Some("t".into())).await.unwrap_err();
        assert!(matches!(err, ToolError::Transport(_)));
        assert!(tools.has_token());
    }
}
