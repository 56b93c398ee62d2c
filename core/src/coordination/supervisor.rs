// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Lifecycle orchestration across roles.
//!
//! The supervisor owns the running role as a tagged variant and performs
//! every transition by stopping the old component and constructing a fresh
//! one; a role is never mutated in place. Transitions are applied one at a
//! time from a single event loop, so a stale event for a role that is no
//! longer active is simply ignored.

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::routing::post;
use axum::Json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::CoordinationConfig;
use crate::coordination::detect::RoleDetector;
use crate::coordination::master::MasterCore;
use crate::coordination::ports::PortProber;
use crate::coordination::protocol::ToolCallResponse;
use crate::coordination::types::{CoordinationError, CoordinationResult, InstanceId, Role};
use crate::coordination::worker::{WorkerCore, WorkerTuning};
use crate::mcp::{self, SessionStore, ToolDispatcher};
use crate::tools::{LocalToolExecutor, WorkspaceAdapter};

/// Pause between a master stepping down and its worker rebirth.
const STEP_DOWN_DELAY: Duration = Duration::from_millis(500);

/// Bound on `stop()` of the standalone server.
const STOP_DEADLINE: Duration = Duration::from_secs(5);

/// Role-change requests emitted by the running components.
#[derive(Debug)]
pub enum RoleEvent {
    /// A worker won an election or self-promoted
    PromoteToMaster {
        /// Why the promotion happened
        reason: String,
    },
    /// A master lost split-brain arbitration
    StepDownToWorker {
        /// The instance that keeps serving as master
        competing_master: InstanceId,
    },
    /// A worker exhausted its registration attempts
    DemoteToStandalone {
        /// Why coordination was abandoned
        reason: String,
    },
}

/// The running role
enum ActiveRole {
    Master(MasterCore),
    Worker(WorkerCore),
    Standalone(StandaloneCore),
}

impl ActiveRole {
    fn role(&self) -> Role {
        match self {
            Self::Master(_) => Role::Master,
            Self::Worker(_) => Role::Worker,
            Self::Standalone(_) => Role::Standalone,
        }
    }

    async fn stop(self) {
        match self {
            Self::Master(master) => master.stop().await,
            Self::Worker(worker) => worker.stop().await,
            Self::Standalone(standalone) => standalone.stop().await,
        }
    }
}

/// Starts the detected role and drives role transitions until shutdown.
pub struct ModeSupervisor {
    config: CoordinationConfig,
    instance_id: InstanceId,
    local: Arc<dyn LocalToolExecutor>,
    adapter: Arc<dyn WorkspaceAdapter>,
    worker_tuning: WorkerTuning,
    role_tx: watch::Sender<Role>,
}

impl ModeSupervisor {
    /// Supervisor for one instance.
    pub fn new(
        config: CoordinationConfig,
        instance_id: InstanceId,
        local: Arc<dyn LocalToolExecutor>,
        adapter: Arc<dyn WorkspaceAdapter>,
    ) -> Self {
        let (role_tx, _) = watch::channel(Role::Standalone);
        Self {
            config,
            instance_id,
            local,
            adapter,
            worker_tuning: WorkerTuning::default(),
            role_tx,
        }
    }

    /// Override worker timing knobs; tests shrink them.
    pub fn with_worker_tuning(mut self, tuning: WorkerTuning) -> Self {
        self.worker_tuning = tuning;
        self
    }

    /// Observe the current role.
    pub fn role_watch(&self) -> watch::Receiver<Role> {
        self.role_tx.subscribe()
    }

    /// Detect the initial role and run until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> CoordinationResult<()> {
        let detector = RoleDetector::new(
            self.config.clone(),
            self.adapter.clone(),
            self.instance_id.clone(),
        );
        let initial = detector.detect().await;
        info!(role = %initial, instance_id = %self.instance_id, "starting in detected role");

        let (events_tx, mut events_rx) = mpsc::channel::<RoleEvent>(8);
        let mut active = self.start_role(initial, &events_tx).await?;
        self.role_tx.send_replace(active.role());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested");
                    active.stop().await;
                    return Ok(());
                }
                event = events_rx.recv() => {
                    let Some(event) = event else {
                        active.stop().await;
                        return Ok(());
                    };
                    active = self.apply_transition(active, event, &events_tx).await?;
                    self.role_tx.send_replace(active.role());
                }
            }
        }
    }

    async fn start_role(
        &self,
        role: Role,
        events: &mpsc::Sender<RoleEvent>,
    ) -> CoordinationResult<ActiveRole> {
        match role {
            Role::Master => match self.start_master(events).await {
                Ok(master) => Ok(ActiveRole::Master(master)),
                Err(error) => {
                    // Lost the bind race: someone else just became master.
                    warn!(%error, "could not claim master port, joining as worker");
                    self.start_worker_or_standalone(events).await
                }
            },
            Role::Worker => self.start_worker_or_standalone(events).await,
            Role::Standalone => Ok(ActiveRole::Standalone(self.start_standalone().await?)),
        }
    }

    async fn apply_transition(
        &self,
        active: ActiveRole,
        event: RoleEvent,
        events: &mpsc::Sender<RoleEvent>,
    ) -> CoordinationResult<ActiveRole> {
        match (active, event) {
            (ActiveRole::Worker(worker), RoleEvent::PromoteToMaster { reason }) => {
                info!(reason, "worker promoting to master");
                worker.stop().await;
                match self.start_master_with_retry(events).await {
                    Ok(master) => Ok(ActiveRole::Master(master)),
                    Err(error) => {
                        // Another candidate claimed the port first; rejoin it.
                        warn!(%error, "promotion lost the bind race, rejoining as worker");
                        self.start_worker_or_standalone(events).await
                    }
                }
            }
            (ActiveRole::Master(master), RoleEvent::StepDownToWorker { competing_master }) => {
                let snapshot = master.context().preserve_state();
                info!(
                    winner = %competing_master,
                    preserved_workers = snapshot.len(),
                    "stepping down to worker"
                );
                master.stop().await;
                tokio::time::sleep(STEP_DOWN_DELAY).await;
                self.start_worker_or_standalone(events).await
            }
            (ActiveRole::Worker(worker), RoleEvent::DemoteToStandalone { reason }) => {
                info!(reason, "worker falling back to standalone");
                worker.stop().await;
                Ok(ActiveRole::Standalone(self.start_standalone().await?))
            }
            (active, event) => {
                debug!(?event, role = %active.role(), "ignoring stale role event");
                Ok(active)
            }
        }
    }

    async fn start_master(
        &self,
        events: &mpsc::Sender<RoleEvent>,
    ) -> CoordinationResult<MasterCore> {
        MasterCore::start(
            self.config.clone(),
            self.instance_id.clone(),
            self.local.clone(),
            events.clone(),
        )
        .await
    }

    /// Claim the master port, tolerating the brief window in which the
    /// previous master is still releasing it.
    async fn start_master_with_retry(
        &self,
        events: &mpsc::Sender<RoleEvent>,
    ) -> CoordinationResult<MasterCore> {
        let mut last_error = CoordinationError::Internal("no attempt made".to_string());
        for _ in 0..5 {
            match self.start_master(events).await {
                Ok(master) => return Ok(master),
                Err(error) => {
                    last_error = error;
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }
        Err(last_error)
    }

    async fn start_worker_or_standalone(
        &self,
        events: &mpsc::Sender<RoleEvent>,
    ) -> CoordinationResult<ActiveRole> {
        let started = WorkerCore::start_with_tuning(
            self.config.clone(),
            self.instance_id.clone(),
            self.local.clone(),
            self.adapter.clone(),
            events.clone(),
            self.worker_tuning.clone(),
        )
        .await;
        match started {
            Ok(worker) => Ok(ActiveRole::Worker(worker)),
            Err(error) => {
                warn!(%error, "worker start failed, falling back to standalone");
                Ok(ActiveRole::Standalone(self.start_standalone().await?))
            }
        }
    }

    async fn start_standalone(&self) -> CoordinationResult<StandaloneCore> {
        StandaloneCore::start(
            self.config.clone(),
            self.instance_id.clone(),
            self.local.clone(),
        )
        .await
    }
}

/// Local-only loop: serves the inbound endpoint and local tools without
/// any coordination peers.
pub struct StandaloneCore {
    cancel: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    port: u16,
}

struct StandaloneDispatcher {
    instance_id: InstanceId,
    local: Arc<dyn LocalToolExecutor>,
    started: Instant,
}

#[async_trait]
impl ToolDispatcher for StandaloneDispatcher {
    async fn dispatch_tool(&self, tool: &str, params: serde_json::Value) -> ToolCallResponse {
        let result = match self.local.execute_tool(tool, params).await {
            Ok(result) => result,
            Err(error) => crate::tools::ToolResult::err(error.to_string()),
        };
        ToolCallResponse {
            success: result.success,
            result: result.result,
            error: result.error,
            routed_to: Some("local".to_string()),
        }
    }

    fn list_tools(&self) -> Vec<String> {
        self.local.available_tools()
    }

    fn service_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "status": "healthy",
            "role": Role::Standalone.to_string(),
            "instance_id": self.instance_id,
            "uptime_ms": self.started.elapsed().as_millis() as u64,
            "worker_count": 0,
            "version": env!("CARGO_PKG_VERSION"),
        })
    }
}

async fn standalone_tool(
    State(dispatcher): State<Arc<StandaloneDispatcher>>,
    Path(tool): Path<String>,
    Json(params): Json<serde_json::Value>,
) -> Json<ToolCallResponse> {
    Json(dispatcher.dispatch_tool(&tool, params).await)
}

impl StandaloneCore {
    /// Serve the inbound endpoint and local tools on the master port when
    /// it is free, otherwise on a worker-range port.
    pub async fn start(
        config: CoordinationConfig,
        instance_id: InstanceId,
        local: Arc<dyn LocalToolExecutor>,
    ) -> CoordinationResult<Self> {
        let listener = match tokio::net::TcpListener::bind(("127.0.0.1", config.master_port)).await
        {
            Ok(listener) => listener,
            Err(_) => {
                let port = PortProber::find_available_port(
                    config.worker_port_start,
                    config.worker_port_end,
                )
                .await?;
                tokio::net::TcpListener::bind(("127.0.0.1", port))
                    .await
                    .map_err(|e| CoordinationError::PortBindFailed {
                        port,
                        reason: e.to_string(),
                    })?
            }
        };
        let port = listener
            .local_addr()
            .map_err(|e| CoordinationError::Internal(e.to_string()))?
            .port();

        let dispatcher = Arc::new(StandaloneDispatcher {
            instance_id: instance_id.clone(),
            local,
            started: Instant::now(),
        });
        let app = axum::Router::new()
            .route("/tools/:tool", post(standalone_tool))
            .with_state(dispatcher.clone())
            .merge(mcp::router(
                dispatcher as Arc<dyn ToolDispatcher>,
                Arc::new(SessionStore::new()),
            ))
            .layer(TraceLayer::new_for_http());

        let cancel = CancellationToken::new();
        let server_cancel = cancel.clone();
        let server = tokio::spawn(async move {
            let shutdown = async move { server_cancel.cancelled().await };
            if let Err(error) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(%error, "standalone server exited with error");
            }
        });

        info!(%instance_id, port, "standalone started");
        Ok(Self {
            cancel,
            server,
            port,
        })
    }

    /// The port the standalone surface is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop serving within the stop deadline.
    pub async fn stop(self) {
        self.cancel.cancel();
        if tokio::time::timeout(STOP_DEADLINE, self.server).await.is_err() {
            warn!("standalone server did not stop within deadline");
        }
    }
}
