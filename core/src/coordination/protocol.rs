// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Protocol definitions for master-worker communication.
//!
//! All surfaces speak JSON over loopback HTTP; these are the request and
//! response bodies. Probe identity travels in headers so that a plain
//! health check stays a GET.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::coordination::types::{
    InstanceId, PerformanceMetrics, ToolCallLog, WorkerRecord, WorkerStatus,
};

/// Header carrying the prober's instance id on health requests.
pub const HEADER_INSTANCE_ID: &str = "x-fleet-instance-id";

/// Header carrying the prober's role on health requests.
pub const HEADER_ROLE: &str = "x-fleet-role";

/// Register worker request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Worker instance id
    pub instance_id: InstanceId,
    /// Workspace name
    pub workspace_name: String,
    /// Absolute workspace root path
    pub workspace_path: String,
    /// Loopback port of the worker surface
    pub port: u16,
    /// Tool names the worker can execute
    pub capabilities: BTreeSet<String>,
    /// Worker code version
    pub version: String,
}

/// Register worker response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// Registration success
    pub success: bool,
    /// Echo of the worker instance id
    pub instance_id: InstanceId,
    /// The master's instance id
    pub master_instance_id: InstanceId,
    /// Heartbeat cadence the worker must use, in seconds
    pub heartbeat_interval_secs: u64,
    /// Failure reason when not successful
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Heartbeat request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Worker instance id
    pub instance_id: InstanceId,
    /// Current worker activity status
    pub status: WorkerStatus,
    /// Worker-side send time
    pub timestamp: DateTime<Utc>,
}

/// Heartbeat response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Acknowledgment
    pub success: bool,
    /// The master's view of its own health
    pub master_status: String,
    /// Set when the master does not know the worker id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub should_reregister: Option<bool>,
}

/// Plain acknowledgment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    /// Operation success
    pub success: bool,
}

/// Worker listing response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerListResponse {
    /// Registered workers
    pub workers: Vec<WorkerRecord>,
}

/// Tool invocation response, shared by the master and worker tool endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResponse {
    /// Whether the tool produced a result
    pub success: bool,
    /// Tool result on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error message on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Execution target: a worker instance id, or "local"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routed_to: Option<String>,
}

/// Master health summary served at `/coordination/health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationHealth {
    /// "healthy" or "shutting_down"
    pub status: String,
    /// Master instance id
    pub instance_id: InstanceId,
    /// Milliseconds since the master started
    pub uptime_ms: u64,
    /// Registered worker count
    pub worker_count: usize,
    /// Master code version
    pub version: String,
    /// Server time
    pub timestamp: DateTime<Utc>,
}

/// Master status summary served at `/coordination/status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationStatus {
    /// Rolling performance counters
    pub metrics: PerformanceMetrics,
    /// Recent tool calls, oldest first
    pub history: Vec<ToolCallLog>,
}

/// Worker health summary served at `/health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealth {
    /// "healthy"
    pub status: String,
    /// Worker instance id
    pub instance_id: InstanceId,
    /// Workspace name
    pub workspace_name: String,
    /// Tool names the worker can execute
    pub capabilities: BTreeSet<String>,
}

/// Worker context summary served at `/context`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextResponse {
    /// Workspace description from the editor adapter
    pub workspace: serde_json::Value,
    /// Currently focused editor, when the adapter exposes one
    pub active_editor: Option<serde_json::Value>,
    /// Open files, when the local executor exposes them
    pub open_files: Option<serde_json::Value>,
}

/// Election message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElectionMessageKind {
    /// An election has been started by a worker
    ElectionStarted,
    /// A winner has been decided
    MasterElected,
}

/// Election coordination message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionMessage {
    /// Message kind
    #[serde(rename = "type")]
    pub kind: ElectionMessageKind,
    /// Sender instance id
    pub from_instance_id: InstanceId,
    /// Sender-side send time
    pub timestamp: DateTime<Utc>,
    /// Kind-specific payload; MASTER_ELECTED carries `new_master_id`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ElectionMessage {
    /// Build a MASTER_ELECTED broadcast.
    pub fn master_elected(from: InstanceId, new_master_id: &str) -> Self {
        Self {
            kind: ElectionMessageKind::MasterElected,
            from_instance_id: from,
            timestamp: Utc::now(),
            data: Some(serde_json::json!({ "new_master_id": new_master_id })),
        }
    }

    /// Extract `new_master_id` from a MASTER_ELECTED payload.
    pub fn new_master_id(&self) -> Option<&str> {
        self.data.as_ref()?.get("new_master_id")?.as_str()
    }
}

/// Graceful-shutdown notification broadcast by a stopping master
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownNotice {
    /// Always "MASTER_SHUTDOWN"
    #[serde(rename = "type")]
    pub kind: String,
    /// Stopping master's instance id
    pub instance_id: InstanceId,
    /// Send time
    pub timestamp: DateTime<Utc>,
    /// Human-readable reason
    pub message: String,
}

impl ShutdownNotice {
    /// Wire value of the `type` field.
    pub const KIND: &'static str = "MASTER_SHUTDOWN";

    /// Build a notice from the stopping master.
    pub fn new(instance_id: InstanceId, message: impl Into<String>) -> Self {
        Self {
            kind: Self::KIND.to_string(),
            instance_id,
            timestamp: Utc::now(),
            message: message.into(),
        }
    }
}
