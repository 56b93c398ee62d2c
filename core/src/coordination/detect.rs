// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Startup role detection.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{CoordinationConfig, ModeOverride};
use crate::coordination::probe::HealthProbe;
use crate::coordination::types::{InstanceId, MasterStatus, Role};
use crate::tools::WorkspaceAdapter;

/// Number of confirmation probes when the master looks degraded.
const DEGRADED_PROBE_COUNT: usize = 3;

/// Interval between confirmation probes.
const DEGRADED_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound of the randomised pre-takeover backoff, in milliseconds.
///
/// The random delay de-synchronises instances that observed the same
/// degraded master at the same moment; without it they would all re-probe
/// and claim mastership together.
const TAKEOVER_BACKOFF_MAX_MS: u64 = 2000;

/// Decides the initial role of this process.
pub struct RoleDetector {
    config: CoordinationConfig,
    adapter: Arc<dyn WorkspaceAdapter>,
    probe: HealthProbe,
}

impl RoleDetector {
    /// Detector for the given instance.
    pub fn new(
        config: CoordinationConfig,
        adapter: Arc<dyn WorkspaceAdapter>,
        instance_id: InstanceId,
    ) -> Self {
        let probe = HealthProbe::with_identity(instance_id, Role::Standalone);
        Self {
            config,
            adapter,
            probe,
        }
    }

    /// Detect the role this process should start in.
    pub async fn detect(&self) -> Role {
        if !self.config.enabled {
            info!("coordination disabled, running standalone");
            return Role::Standalone;
        }

        match self.config.mode {
            ModeOverride::Master => return Role::Master,
            ModeOverride::Worker => return Role::Worker,
            ModeOverride::Standalone => return Role::Standalone,
            ModeOverride::Auto => {}
        }

        let timeout = self.config.registration_timeout();
        let status = self
            .probe
            .probe_master(self.config.master_port, timeout)
            .await;
        debug!(%status, port = self.config.master_port, "initial master probe");

        match status {
            MasterStatus::Healthy => Role::Worker,
            MasterStatus::Unreachable | MasterStatus::Shutdown => Role::Master,
            MasterStatus::Degraded => self.evaluate_degraded_master(timeout).await,
        }
    }

    /// Confirm a degraded observation before contending for mastership.
    async fn evaluate_degraded_master(&self, timeout: Duration) -> Role {
        let mut unhealthy = 0usize;
        for _ in 0..DEGRADED_PROBE_COUNT {
            tokio::time::sleep(DEGRADED_PROBE_INTERVAL).await;
            let status = self
                .probe
                .probe_master(self.config.master_port, timeout)
                .await;
            if !status.is_healthy() {
                unhealthy += 1;
            }
        }

        // Require >= 2/3 of confirmation probes to stay unhealthy.
        if unhealthy * 3 < DEGRADED_PROBE_COUNT * 2 {
            debug!(unhealthy, "degraded master recovered, joining as worker");
            return Role::Worker;
        }

        let score = self.adapter.score_inputs().score();
        if score < self.config.workspace_score_threshold {
            debug!(
                score,
                threshold = self.config.workspace_score_threshold,
                "workspace score below takeover threshold"
            );
            return Role::Worker;
        }

        let backoff_ms = rand::thread_rng().gen_range(0..=TAKEOVER_BACKOFF_MAX_MS);
        debug!(backoff_ms, "takeover backoff before final probe");
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;

        let final_status = self
            .probe
            .probe_master(self.config.master_port, timeout)
            .await;
        match final_status {
            MasterStatus::Healthy => Role::Worker,
            MasterStatus::Degraded | MasterStatus::Unreachable | MasterStatus::Shutdown => {
                info!(%final_status, "degraded master confirmed, claiming mastership");
                Role::Master
            }
        }
    }
}
