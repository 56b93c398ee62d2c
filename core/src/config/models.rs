//! Configuration data structures for Editor Fleet
//!
//! Defines the full configuration schema: instance identity (workspace
//! name and path overrides) and the coordination plane settings (ports,
//! intervals, timeouts, election tuning).

use serde::{Deserialize, Serialize};
use serde_valid::Validate;
use std::time::Duration;

/// Root configuration structure for Editor Fleet
///
/// Configuration sources are merged in this precedence (highest to lowest):
/// 1. CLI Arguments
/// 2. Environment Variables (EDITOR_FLEET_ prefix)
/// 3. Config Files (~/.config/editor-fleet/config.toml)
/// 4. Defaults
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq, Default)]
#[serde(default)]
pub struct FleetConfig {
    /// Workspace identity overrides
    pub workspace: WorkspaceSettings,

    /// Coordination plane settings
    #[validate]
    pub coordination: CoordinationConfig,
}

/// Workspace identity overrides
///
/// When unset, the editor adapter's own workspace description is used.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq, Default)]
#[serde(default)]
pub struct WorkspaceSettings {
    /// Workspace name override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Workspace root path override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Forced role selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModeOverride {
    /// Detect the role from the environment
    #[default]
    Auto,
    /// Always start as master
    Master,
    /// Always start as worker
    Worker,
    /// Always start standalone
    Standalone,
}

/// Coordination plane settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Whether multi-instance coordination is enabled at all
    ///
    /// When false the instance always runs standalone.
    pub enabled: bool,

    /// Forced role, bypassing detection
    pub mode: ModeOverride,

    /// Port of the master surface (coordination + inbound endpoint)
    #[validate(minimum = 1024)]
    pub master_port: u16,

    /// First port of the worker range
    #[validate(minimum = 1024)]
    pub worker_port_start: u16,

    /// Last port of the worker range (inclusive)
    #[validate(minimum = 1024)]
    pub worker_port_end: u16,

    /// Worker heartbeat cadence in seconds
    #[validate(minimum = 1)]
    pub heartbeat_interval_secs: u64,

    /// Worker-side master health probe cadence in seconds
    #[validate(minimum = 1)]
    pub master_health_check_interval_secs: u64,

    /// Registration request timeout in seconds
    #[validate(minimum = 1)]
    pub registration_timeout_secs: u64,

    /// Election candidate-collection bound in seconds
    #[validate(minimum = 1)]
    pub election_timeout_secs: u64,

    /// Per-attempt remote tool call timeout in seconds
    #[validate(minimum = 1)]
    pub tool_call_timeout_secs: u64,

    /// Workspace score at or above which a degraded-master observer
    /// contends for mastership
    pub workspace_score_threshold: f64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: ModeOverride::Auto,
            master_port: 9100,
            worker_port_start: 9101,
            worker_port_end: 9199,
            heartbeat_interval_secs: 5,
            master_health_check_interval_secs: 3,
            registration_timeout_secs: 10,
            election_timeout_secs: 5,
            tool_call_timeout_secs: 30,
            workspace_score_threshold: 10.0,
        }
    }
}

impl CoordinationConfig {
    /// Cross-field sanity checks that serde_valid field attributes
    /// cannot express. Failure here is fatal at startup.
    pub fn ensure_valid(&self) -> Result<(), String> {
        if self.worker_port_start > self.worker_port_end {
            return Err(format!(
                "worker port range is empty: {} > {}",
                self.worker_port_start, self.worker_port_end
            ));
        }
        if (self.worker_port_start..=self.worker_port_end).contains(&self.master_port) {
            return Err(format!(
                "master port {} lies inside the worker range {}-{}",
                self.master_port, self.worker_port_start, self.worker_port_end
            ));
        }
        Ok(())
    }

    /// Worker heartbeat cadence.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Master health probe cadence.
    pub fn master_health_check_interval(&self) -> Duration {
        Duration::from_secs(self.master_health_check_interval_secs)
    }

    /// Registration request timeout.
    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout_secs)
    }

    /// Election candidate-collection bound.
    pub fn election_timeout(&self) -> Duration {
        Duration::from_secs(self.election_timeout_secs)
    }

    /// Per-attempt remote tool call timeout.
    pub fn tool_call_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_call_timeout_secs)
    }
}
