// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Interfaces to the editor-integration layer.
//!
//! The coordination plane never reads diagnostics, files, or symbols
//! itself; it consumes the editor through two narrow traits. Tool names
//! and parameter shapes are opaque to the core — the only thing the core
//! knows about a tool is its routing class (see [`routing`]).

pub mod routing;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::coordination::types::{WorkerStatus, WorkspaceScoreInputs};

pub use routing::{merge_policy, routing_class, MergePolicy, RoutingClass};

/// Outcome of a single tool execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the tool produced a result
    pub success: bool,
    /// Tool output on success
    pub result: Option<serde_json::Value>,
    /// Error message on failure, propagated verbatim to the caller
    pub error: Option<String>,
}

impl ToolResult {
    /// Successful result.
    pub fn ok(value: serde_json::Value) -> Self {
        Self {
            success: true,
            result: Some(value),
            error: None,
        }
    }

    /// Failed result.
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(message.into()),
        }
    }
}

/// Executes tools against the local editor instance.
#[async_trait]
pub trait LocalToolExecutor: Send + Sync {
    /// Execute a named tool with opaque parameters.
    ///
    /// Tool-specific failures are reported inside the [`ToolResult`];
    /// an `Err` means the executor itself broke.
    async fn execute_tool(&self, name: &str, params: serde_json::Value)
        -> anyhow::Result<ToolResult>;

    /// Tool names this instance can execute.
    fn available_tools(&self) -> Vec<String>;
}

/// Description of the local workspace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    /// Workspace name
    pub name: String,
    /// Absolute workspace root path
    pub path: String,
    /// Workspace kind, e.g. "folder" or "multi-root"
    pub kind: String,
    /// Root folders of a multi-root workspace
    pub folders: Vec<String>,
}

/// Read-only view of the local editor state used by coordination.
pub trait WorkspaceAdapter: Send + Sync {
    /// The workspace this instance owns.
    fn workspace_info(&self) -> WorkspaceInfo;

    /// Inputs to the election workspace score.
    fn score_inputs(&self) -> WorkspaceScoreInputs;

    /// Current activity status, reported in heartbeats.
    fn worker_status(&self) -> WorkerStatus;
}

/// Executor that echoes its input back; used in tests and as a stand-in
/// when no editor adapter is wired up.
#[derive(Debug, Clone, Default)]
pub struct EchoToolExecutor;

#[async_trait]
impl LocalToolExecutor for EchoToolExecutor {
    async fn execute_tool(
        &self,
        name: &str,
        params: serde_json::Value,
    ) -> anyhow::Result<ToolResult> {
        Ok(ToolResult::ok(serde_json::json!({
            "tool": name,
            "params": params,
        })))
    }

    fn available_tools(&self) -> Vec<String> {
        routing::KNOWN_TOOLS.iter().map(|t| t.0.to_string()).collect()
    }
}

/// Static adapter with fixed workspace info; used in tests.
#[derive(Debug, Clone)]
pub struct StaticWorkspaceAdapter {
    /// Workspace to report
    pub info: WorkspaceInfo,
    /// Score inputs to report
    pub score_inputs: WorkspaceScoreInputs,
    /// Status to report
    pub status: WorkerStatus,
}

impl StaticWorkspaceAdapter {
    /// Adapter for a single-folder workspace at `path`.
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            info: WorkspaceInfo {
                name: name.into(),
                path: path.clone(),
                kind: "folder".to_string(),
                folders: vec![path],
            },
            score_inputs: WorkspaceScoreInputs::default(),
            status: WorkerStatus::Idle,
        }
    }
}

impl WorkspaceAdapter for StaticWorkspaceAdapter {
    fn workspace_info(&self) -> WorkspaceInfo {
        self.info.clone()
    }

    fn score_inputs(&self) -> WorkspaceScoreInputs {
        self.score_inputs
    }

    fn worker_status(&self) -> WorkerStatus {
        self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_executor_reflects_input() {
        let executor = EchoToolExecutor;
        let result = executor
            .execute_tool("get_diagnostics", serde_json::json!({"uri": "file:///a.rs"}))
            .await
            .unwrap();

        assert!(result.success);
        let value = result.result.unwrap();
        assert_eq!(value["tool"], "get_diagnostics");
        assert_eq!(value["params"]["uri"], "file:///a.rs");
    }

    #[test]
    fn test_static_adapter_reports_folder() {
        let adapter = StaticWorkspaceAdapter::new("demo", "/home/dev/demo");
        let info = adapter.workspace_info();
        assert_eq!(info.name, "demo");
        assert_eq!(info.folders, vec!["/home/dev/demo".to_string()]);
    }
}
