// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Core types for the coordination plane.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Instance identifier, generated once per process start.
///
/// Opaque and globally unique; lexicographic comparison on the raw string
/// is used for deterministic tie-breaking.
pub type InstanceId = String;

/// Generate a fresh instance identifier.
pub fn new_instance_id() -> InstanceId {
    uuid::Uuid::new_v4().to_string()
}

/// Result type for coordination operations
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Coordination plane errors
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum CoordinationError {
    /// No free port in the configured range
    #[error("No available port in range {start}-{end}")]
    NoAvailablePort {
        /// First port tried
        start: u16,
        /// Last port tried
        end: u16,
    },

    /// A local port could not be bound
    #[error("Failed to bind port {port}: {reason}")]
    PortBindFailed {
        /// The port that could not be bound
        port: u16,
        /// Underlying bind error
        reason: String,
    },

    /// Worker not found in the registry
    #[error("Worker not found: {0}")]
    WorkerNotFound(InstanceId),

    /// Worker did not respond after all retries
    #[error("Worker unreachable: {0}")]
    WorkerUnreachable(InstanceId),

    /// Registration rejected by the master
    #[error("Registration rejected: {0}")]
    RegistrationRejected(String),

    /// Registration retries exhausted
    #[error("Registration failed after {attempts} attempts: {reason}")]
    RegistrationExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Last failure
        reason: String,
    },

    /// A second election was requested while one is running
    #[error("Election already in progress")]
    ElectionInProgress,

    /// Not enough candidate responses to decide an election
    #[error("Election quorum not met: {responses} responses, {required} required")]
    QuorumNotMet {
        /// Responses received
        responses: usize,
        /// Minimum required
        required: usize,
    },

    /// Election explicitly aborted
    #[error("Election aborted: {0}")]
    ElectionAborted(String),

    /// Every branch of an aggregated fan-out failed
    #[error("All workers and local failed for tool {0}")]
    AggregationFailed(String),

    /// Tool execution failed
    #[error("Tool execution failed: {0}")]
    ToolFailed(String),

    /// Transport-level failure
    #[error("Communication error: {0}")]
    Communication(String),

    /// Deadline exceeded
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Role of an instance within the fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Serves the inbound endpoint and owns the registry
    Master,
    /// Registered with a master, executes routed tool calls
    Worker,
    /// Serves its own local tool calls only
    Standalone,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Worker => write!(f, "worker"),
            Self::Standalone => write!(f, "standalone"),
        }
    }
}

/// Classification of a remote master produced by a health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterStatus {
    /// Probe completed quickly with a parseable response
    Healthy,
    /// Probe completed but slow or malformed
    Degraded,
    /// Connection refused or timed out
    Unreachable,
    /// The master reported it is shutting down
    Shutdown,
}

impl MasterStatus {
    /// Whether the probed master can be relied on right now.
    pub fn is_healthy(self) -> bool {
        self == Self::Healthy
    }
}

impl fmt::Display for MasterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unreachable => write!(f, "unreachable"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Worker activity status, reported via heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// The editor has recent focused activity
    Active,
    /// No recent activity
    Idle,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Idle => write!(f, "idle"),
        }
    }
}

/// Registry entry for one registered worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Worker instance id (primary key)
    pub instance_id: InstanceId,
    /// Human-readable workspace name
    pub workspace_name: String,
    /// Absolute workspace root path
    pub workspace_path: String,
    /// Loopback port of the worker surface
    pub port: u16,
    /// Tool names the worker can execute
    pub capabilities: BTreeSet<String>,
    /// Activity status from the latest heartbeat
    pub status: WorkerStatus,
    /// Registration time
    pub registered_at: DateTime<Utc>,
    /// Last heartbeat receipt; monotonic non-decreasing
    pub last_seen: DateTime<Utc>,
    /// Worker code version
    pub version: String,
}

impl WorkerRecord {
    /// Whether the record has missed three heartbeat intervals.
    pub fn is_expired(&self, heartbeat_interval: Duration) -> bool {
        let cutoff = heartbeat_interval
            .as_millis()
            .saturating_mul(3)
            .min(i64::MAX as u128) as i64;
        let elapsed = Utc::now()
            .signed_duration_since(self.last_seen)
            .num_milliseconds();
        elapsed > cutoff
    }

    /// Base URL of the worker surface.
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

/// Rolling performance counters maintained by the master
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Total tool calls observed
    pub total_calls: u64,
    /// Calls that completed without error
    pub successful_calls: u64,
    /// successful_calls / total_calls
    pub success_rate: f64,
    /// Rolling average call duration in milliseconds
    pub avg_response_ms: f64,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self {
            total_calls: 0,
            successful_calls: 0,
            success_rate: 0.0,
            avg_response_ms: 0.0,
            updated_at: Utc::now(),
        }
    }
}

impl PerformanceMetrics {
    /// Fold one completed call into the rolling counters.
    pub fn record(&mut self, duration_ms: u64, success: bool) {
        self.total_calls += 1;
        if success {
            self.successful_calls += 1;
        }
        self.success_rate = self.successful_calls as f64 / self.total_calls as f64;
        self.avg_response_ms +=
            (duration_ms as f64 - self.avg_response_ms) / self.total_calls as f64;
        self.updated_at = Utc::now();
    }
}

/// One entry in the master's tool-call history ring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallLog {
    /// Call id
    pub id: String,
    /// Tool name
    pub tool: String,
    /// Parameters as received
    pub params: serde_json::Value,
    /// Result on success
    pub result: Option<serde_json::Value>,
    /// Error on failure
    pub error: Option<String>,
    /// Master-observed start time
    pub timestamp: DateTime<Utc>,
    /// Call duration in milliseconds
    pub duration_ms: u64,
    /// Execution target: a worker instance id, or "local"
    pub routed_to: Option<String>,
}

/// Capacity of the tool-call history ring.
pub const TOOL_CALL_HISTORY_CAPACITY: usize = 100;

/// A worker's self-description during an election
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionCandidate {
    /// Candidate instance id
    pub instance_id: InstanceId,
    /// file_count * 0.4 + git_commits * 0.3 + recent_activity * 0.3
    pub workspace_score: f64,
    /// Milliseconds since the candidate started serving
    pub uptime_ms: u64,
    /// 0-100, lower is better
    pub resource_usage: f64,
    /// Tool names the candidate can execute
    pub capabilities: BTreeSet<String>,
    /// When the candidate last saw the old master
    pub last_seen: DateTime<Utc>,
    /// The candidate's own worker record, when it has one
    pub worker_info: Option<WorkerRecord>,
}

impl ElectionCandidate {
    /// Election ordering key: higher sorts first.
    ///
    /// (workspace_score DESC, uptime DESC, resource_usage ASC, instance_id ASC)
    pub fn beats(&self, other: &Self) -> bool {
        match self
            .workspace_score
            .partial_cmp(&other.workspace_score)
            .unwrap_or(std::cmp::Ordering::Equal)
        {
            std::cmp::Ordering::Greater => return true,
            std::cmp::Ordering::Less => return false,
            std::cmp::Ordering::Equal => {}
        }
        match self.uptime_ms.cmp(&other.uptime_ms) {
            std::cmp::Ordering::Greater => return true,
            std::cmp::Ordering::Less => return false,
            std::cmp::Ordering::Equal => {}
        }
        match self
            .resource_usage
            .partial_cmp(&other.resource_usage)
            .unwrap_or(std::cmp::Ordering::Equal)
        {
            std::cmp::Ordering::Less => return true,
            std::cmp::Ordering::Greater => return false,
            std::cmp::Ordering::Equal => {}
        }
        self.instance_id < other.instance_id
    }
}

/// Inputs to the workspace score, supplied by the editor adapter
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WorkspaceScoreInputs {
    /// Files under the workspace root
    pub file_count: u64,
    /// Commits in the workspace repository
    pub git_commits: u64,
    /// High iff the editor has focused activity
    pub recent_activity: f64,
}

impl WorkspaceScoreInputs {
    /// Weighted workspace score.
    pub fn score(&self) -> f64 {
        self.file_count as f64 * 0.4 + self.git_commits as f64 * 0.3 + self.recent_activity * 0.3
    }
}
