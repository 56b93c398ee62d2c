// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Inbound tool endpoint.
//!
//! A session-oriented HTTP transport speaking JSON-RPC-style tool calls:
//! `POST /mcp` carries initialization and subsequent calls identified by a
//! session-id header, `DELETE /mcp` terminates a session, and `GET /health`
//! returns a service summary. Server-initiated notifications are not
//! supported, so `GET /mcp` answers 405.
//!
//! The transport is protocol plumbing only: every tool call is handed to a
//! [`ToolDispatcher`], which is the master's router in coordinated mode or
//! the local executor when standalone.

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::coordination::protocol::ToolCallResponse;

/// Header identifying the inbound session.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Protocol version reported during initialization.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Executes inbound tool calls on behalf of the transport.
#[async_trait]
pub trait ToolDispatcher: Send + Sync + 'static {
    /// Dispatch one tool call and report where it ran.
    async fn dispatch_tool(&self, tool: &str, params: serde_json::Value) -> ToolCallResponse;

    /// Tool names currently reachable through this dispatcher.
    fn list_tools(&self) -> Vec<String>;

    /// Service summary served at `GET /health`.
    fn service_summary(&self) -> serde_json::Value;
}

/// One inbound session
#[derive(Debug, Clone)]
pub struct McpSession {
    /// Session id issued at initialization
    pub id: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// In-memory session table.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<String, McpSession>,
}

impl SessionStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session and return its id.
    pub fn create(&self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.sessions.insert(
            id.clone(),
            McpSession {
                id: id.clone(),
                created_at: Utc::now(),
            },
        );
        id
    }

    /// Whether the session exists.
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Remove a session; true when it existed.
    pub fn remove(&self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }

    /// Live session count.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[derive(Clone)]
struct McpState {
    dispatcher: Arc<dyn ToolDispatcher>,
    sessions: Arc<SessionStore>,
}

/// JSON-RPC request envelope
#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    #[serde(default)]
    id: Option<serde_json::Value>,
    method: String,
    #[serde(default)]
    params: serde_json::Value,
}

/// JSON-RPC response envelope
#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

impl JsonRpcResponse {
    fn result(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: id.unwrap_or(serde_json::Value::Null),
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Option<serde_json::Value>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: id.unwrap_or(serde_json::Value::Null),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Build the inbound transport routes on top of a dispatcher.
pub fn router(dispatcher: Arc<dyn ToolDispatcher>, sessions: Arc<SessionStore>) -> axum::Router {
    let state = McpState {
        dispatcher,
        sessions,
    };
    axum::Router::new()
        .route(
            "/mcp",
            axum::routing::post(post_mcp)
                .get(get_mcp)
                .delete(delete_mcp),
        )
        .route("/health", get(get_health))
        .with_state(state)
}

async fn post_mcp(
    State(state): State<McpState>,
    headers: HeaderMap,
    Json(request): Json<JsonRpcRequest>,
) -> Response {
    debug!(method = %request.method, "inbound request");

    match request.method.as_str() {
        "initialize" => {
            let session_id = state.sessions.create();
            let body = JsonRpcResponse::result(
                request.id,
                serde_json::json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": {
                        "name": "editor-fleet",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            );
            ([(SESSION_HEADER, session_id)], Json(body)).into_response()
        }
        "notifications/initialized" => StatusCode::ACCEPTED.into_response(),
        method => {
            let Some(session_id) = header_str(&headers, SESSION_HEADER) else {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(JsonRpcResponse::error(
                        request.id,
                        -32000,
                        "missing session id",
                    )),
                )
                    .into_response();
            };
            if !state.sessions.contains(session_id) {
                return (
                    StatusCode::NOT_FOUND,
                    Json(JsonRpcResponse::error(request.id, -32001, "unknown session")),
                )
                    .into_response();
            }

            match method {
                "tools/list" => {
                    let tools: Vec<serde_json::Value> = state
                        .dispatcher
                        .list_tools()
                        .into_iter()
                        .map(|name| serde_json::json!({ "name": name }))
                        .collect();
                    Json(JsonRpcResponse::result(
                        request.id,
                        serde_json::json!({ "tools": tools }),
                    ))
                    .into_response()
                }
                "tools/call" => {
                    let Some(name) = request.params.get("name").and_then(|v| v.as_str()) else {
                        return (
                            StatusCode::BAD_REQUEST,
                            Json(JsonRpcResponse::error(
                                request.id,
                                -32602,
                                "tools/call requires a name",
                            )),
                        )
                            .into_response();
                    };
                    let arguments = request
                        .params
                        .get("arguments")
                        .cloned()
                        .unwrap_or(serde_json::Value::Null);

                    let outcome = state.dispatcher.dispatch_tool(name, arguments).await;
                    let text = match (&outcome.result, &outcome.error) {
                        (Some(result), _) => result.to_string(),
                        (None, Some(error)) => error.clone(),
                        (None, None) => String::new(),
                    };
                    let mut result = serde_json::json!({
                        "content": [{ "type": "text", "text": text }],
                        "isError": !outcome.success,
                    });
                    if let Some(routed_to) = outcome.routed_to {
                        result["routedTo"] = serde_json::Value::String(routed_to);
                    }
                    Json(JsonRpcResponse::result(request.id, result)).into_response()
                }
                other => Json(JsonRpcResponse::error(
                    request.id,
                    -32601,
                    format!("method not found: {other}"),
                ))
                .into_response(),
            }
        }
    }
}

async fn get_mcp() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(serde_json::json!({
            "error": "server-initiated notifications are not supported",
        })),
    )
        .into_response()
}

async fn delete_mcp(State(state): State<McpState>, headers: HeaderMap) -> Response {
    let Some(session_id) = header_str(&headers, SESSION_HEADER) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    if state.sessions.remove(session_id) {
        Json(serde_json::json!({ "success": true })).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn get_health(State(state): State<McpState>) -> Json<serde_json::Value> {
    let mut summary = state.dispatcher.service_summary();
    if let Some(map) = summary.as_object_mut() {
        map.insert(
            "sessions".to_string(),
            serde_json::json!(state.sessions.len()),
        );
    }
    Json(summary)
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
