// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Tool-call routing.
//!
//! Every inbound call is dispatched by its tool's routing class:
//! workspace-specific calls go to the one worker owning the workspace,
//! active-context calls to the most-recently-active worker, aggregated
//! calls fan out to every worker plus local and merge. Remote failure on
//! a single-target call falls back to local execution.

use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::coordination::registry::WorkerRegistry;
use crate::coordination::remote::RemoteExecutor;
use crate::coordination::types::{CoordinationError, Role, WorkerRecord};
use crate::tools::{merge_policy, routing_class, LocalToolExecutor, MergePolicy, RoutingClass, ToolResult};

/// Cap applied by the workspace-symbols merge.
const SYMBOL_MERGE_CAP: usize = 100;

/// Result of routing one tool call
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    /// The tool result to return to the caller
    pub result: ToolResult,
    /// Execution target: a worker instance id, "local", or "aggregated"
    pub routed_to: Option<String>,
}

/// One branch of an aggregated fan-out
struct Branch {
    /// "local" or the worker instance id
    origin: String,
    /// Originator role label used by role-tagged merges
    role: Role,
    /// Successful branch payload; None for failed branches
    value: Option<serde_json::Value>,
}

/// Dispatches tool calls across the fleet.
pub struct Router {
    registry: Arc<WorkerRegistry>,
    remote: RemoteExecutor,
    local: Arc<dyn LocalToolExecutor>,
    local_role: Role,
}

impl Router {
    /// Router executing remote calls through `remote` and local calls
    /// through `local`.
    pub fn new(
        registry: Arc<WorkerRegistry>,
        remote: RemoteExecutor,
        local: Arc<dyn LocalToolExecutor>,
        local_role: Role,
    ) -> Self {
        Self {
            registry,
            remote,
            local,
            local_role,
        }
    }

    /// Route one tool call and return its result plus where it ran.
    pub async fn route(&self, tool: &str, params: serde_json::Value) -> RouteOutcome {
        match routing_class(tool) {
            RoutingClass::WorkspaceSpecific => {
                let target = self.select_workspace_target(tool, &params);
                self.call_single(target, tool, params).await
            }
            RoutingClass::ActiveContext => {
                let target = self
                    .registry
                    .most_recently_active()
                    .filter(|worker| worker_supports(worker, tool));
                self.call_single(target, tool, params).await
            }
            RoutingClass::Aggregated => self.route_aggregated(tool, params).await,
        }
    }

    /// Selection chain for workspace-specific tools: explicit workspace
    /// parameter, then uri prefix, then most-recently-active, then any
    /// worker. `None` means execute locally.
    fn select_workspace_target(
        &self,
        tool: &str,
        params: &serde_json::Value,
    ) -> Option<WorkerRecord> {
        if let Some(workspace) = params.get("workspace").and_then(|v| v.as_str()) {
            if let Some(worker) = self.registry.worker_for_workspace(workspace) {
                return Some(worker);
            }
        }
        if let Some(uri) = params.get("uri").and_then(|v| v.as_str()) {
            if let Some(worker) = self.registry.worker_for_path(normalize_uri(uri)) {
                return Some(worker);
            }
        }
        self.registry
            .most_recently_active()
            .filter(|worker| worker_supports(worker, tool))
            .or_else(|| self.registry.any_worker())
    }

    /// Execute on one worker with local fallback, or directly locally.
    async fn call_single(
        &self,
        target: Option<WorkerRecord>,
        tool: &str,
        params: serde_json::Value,
    ) -> RouteOutcome {
        let Some(worker) = target else {
            let result = self.execute_local(tool, params).await;
            return RouteOutcome {
                result,
                routed_to: Some("local".to_string()),
            };
        };

        match self.remote.call(&worker, tool, &params).await {
            Ok(result) => RouteOutcome {
                result,
                routed_to: Some(worker.instance_id),
            },
            // Tool-level rejections are final; transport-level failures
            // fall back to local execution.
            Err(CoordinationError::ToolFailed(message)) => RouteOutcome {
                result: ToolResult::err(message),
                routed_to: Some(worker.instance_id),
            },
            Err(error) => {
                warn!(
                    worker = %worker.instance_id,
                    tool,
                    %error,
                    "remote target failed, falling back to local execution"
                );
                let result = self.execute_local(tool, params).await;
                RouteOutcome {
                    result,
                    routed_to: Some("local".to_string()),
                }
            }
        }
    }

    /// Fan out to every capable worker and local, then merge.
    async fn route_aggregated(&self, tool: &str, params: serde_json::Value) -> RouteOutcome {
        let workers: Vec<WorkerRecord> = self
            .registry
            .list()
            .into_iter()
            .filter(|worker| worker_supports(worker, tool))
            .collect();

        let remote_branches = workers.iter().map(|worker| {
            let params = params.clone();
            async move {
                match self.remote.call(worker, tool, &params).await {
                    Ok(result) if result.success => Branch {
                        origin: worker.instance_id.clone(),
                        role: Role::Worker,
                        value: result.result,
                    },
                    Ok(result) => {
                        debug!(
                            worker = %worker.instance_id,
                            tool,
                            error = result.error.as_deref().unwrap_or("unknown"),
                            "aggregated branch reported failure"
                        );
                        Branch {
                            origin: worker.instance_id.clone(),
                            role: Role::Worker,
                            value: None,
                        }
                    }
                    Err(error) => {
                        debug!(worker = %worker.instance_id, tool, %error, "aggregated branch failed");
                        Branch {
                            origin: worker.instance_id.clone(),
                            role: Role::Worker,
                            value: None,
                        }
                    }
                }
            }
        });

        let local_branch = async {
            let result = self.execute_local(tool, params.clone()).await;
            Branch {
                origin: "local".to_string(),
                role: self.local_role,
                value: if result.success { result.result } else { None },
            }
        };

        let (mut branches, local) =
            futures::future::join(join_all(remote_branches), local_branch).await;
        branches.push(local);

        let successes = branches.iter().filter(|b| b.value.is_some()).count();
        if successes == 0 {
            let error = CoordinationError::AggregationFailed(tool.to_string());
            return RouteOutcome {
                result: ToolResult::err(error.to_string()),
                routed_to: Some("aggregated".to_string()),
            };
        }

        let merged = merge_branches(merge_policy(tool), branches);
        RouteOutcome {
            result: ToolResult::ok(merged),
            routed_to: Some("aggregated".to_string()),
        }
    }

    async fn execute_local(&self, tool: &str, params: serde_json::Value) -> ToolResult {
        match self.local.execute_tool(tool, params).await {
            Ok(result) => result,
            Err(error) => ToolResult::err(error.to_string()),
        }
    }
}

fn worker_supports(worker: &WorkerRecord, tool: &str) -> bool {
    worker.capabilities.is_empty() || worker.capabilities.contains(tool)
}

/// Strip the file scheme so uri parameters compare against workspace paths.
fn normalize_uri(uri: &str) -> &str {
    uri.strip_prefix("file://").unwrap_or(uri)
}

/// Flatten a branch payload into its entries: arrays contribute their
/// elements, scalars and objects contribute themselves.
fn entries(value: serde_json::Value) -> Vec<serde_json::Value> {
    match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    }
}

fn merge_branches(policy: MergePolicy, branches: Vec<Branch>) -> serde_json::Value {
    match policy {
        MergePolicy::OpenFiles => merge_dedupe(branches, |entry| {
            entry
                .get("uri")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| entry.to_string())
        }, None),
        MergePolicy::WorkspaceSymbols => {
            merge_dedupe(branches, |entry| entry.to_string(), Some(SYMBOL_MERGE_CAP))
        }
        MergePolicy::FileSearch => merge_lines(branches),
        MergePolicy::RoleTagged => merge_role_tagged(branches),
        MergePolicy::FirstSuccess => branches
            .into_iter()
            .find_map(|branch| branch.value)
            .unwrap_or(serde_json::Value::Null),
    }
}

/// Concatenate entries across branches, keeping the first occurrence of
/// each key, optionally capped.
fn merge_dedupe<F>(branches: Vec<Branch>, key: F, cap: Option<usize>) -> serde_json::Value
where
    F: Fn(&serde_json::Value) -> String,
{
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    'outer: for branch in branches {
        let Some(value) = branch.value else { continue };
        for entry in entries(value) {
            if seen.insert(key(&entry)) {
                merged.push(entry);
                if cap.is_some_and(|cap| merged.len() >= cap) {
                    break 'outer;
                }
            }
        }
    }
    serde_json::Value::Array(merged)
}

/// Concatenate non-empty result lines across branches.
fn merge_lines(branches: Vec<Branch>) -> serde_json::Value {
    let mut lines = Vec::new();
    for branch in branches {
        let Some(value) = branch.value else { continue };
        match value {
            serde_json::Value::String(text) => {
                lines.extend(
                    text.lines()
                        .filter(|line| !line.trim().is_empty())
                        .map(|line| serde_json::Value::String(line.to_string())),
                );
            }
            other => {
                for entry in entries(other) {
                    match entry {
                        serde_json::Value::String(line) if line.trim().is_empty() => {}
                        entry => lines.push(entry),
                    }
                }
            }
        }
    }
    serde_json::Value::Array(lines)
}

/// Concatenate entries, tagging each with the originating role and branch.
fn merge_role_tagged(branches: Vec<Branch>) -> serde_json::Value {
    let mut merged = Vec::new();
    for branch in branches {
        let Some(value) = branch.value else { continue };
        for entry in entries(value) {
            match entry {
                serde_json::Value::Object(mut map) => {
                    map.insert(
                        "role".to_string(),
                        serde_json::Value::String(branch.role.to_string()),
                    );
                    map.insert(
                        "source".to_string(),
                        serde_json::Value::String(branch.origin.clone()),
                    );
                    merged.push(serde_json::Value::Object(map));
                }
                other => merged.push(serde_json::json!({
                    "role": branch.role.to_string(),
                    "source": branch.origin.clone(),
                    "value": other,
                })),
            }
        }
    }
    serde_json::Value::Array(merged)
}
