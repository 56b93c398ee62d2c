// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Worker role: local tool host registered with a master.
//!
//! A worker serves its workspace's tools on a port from the worker range,
//! keeps itself registered through heartbeats, and watches the master's
//! health. Three consecutive failed probes (or an explicit shutdown
//! notice) start an election; the heartbeat path itself never decides
//! that the master is gone.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::CoordinationConfig;
use crate::coordination::election::{ElectionCoordinator, ElectionOutcome};
use crate::coordination::ports::PortProber;
use crate::coordination::probe::HealthProbe;
use crate::coordination::protocol::{
    AckResponse, ContextResponse, ElectionMessage, ElectionMessageKind, HeartbeatRequest,
    HeartbeatResponse, RegisterRequest, RegisterResponse, ShutdownNotice, ToolCallResponse,
    WorkerHealth,
};
use crate::coordination::supervisor::RoleEvent;
use crate::coordination::types::{
    CoordinationError, CoordinationResult, ElectionCandidate, InstanceId, MasterStatus, Role,
    WorkerRecord,
};
use crate::tools::{LocalToolExecutor, WorkspaceAdapter};

/// Consecutive failed master probes before an election starts.
const MASTER_FAILURE_THRESHOLD: u32 = 3;

/// Bound on `stop()`.
const STOP_DEADLINE: Duration = Duration::from_secs(5);

/// Timeout for the goodbye deregistration on stop.
const DEREGISTER_TIMEOUT: Duration = Duration::from_secs(3);

/// Timing knobs with slow production defaults; tests shrink them.
#[derive(Debug, Clone)]
pub struct WorkerTuning {
    /// Registration attempts before giving up and going standalone
    pub registration_max_attempts: u32,
    /// First retry delay; doubles per attempt
    pub registration_backoff_base: Duration,
    /// How long a losing candidate waits for the new master to appear
    pub new_master_wait: Duration,
    /// Poll cadence inside that wait
    pub new_master_poll: Duration,
}

impl Default for WorkerTuning {
    fn default() -> Self {
        Self {
            registration_max_attempts: 5,
            registration_backoff_base: Duration::from_secs(2),
            new_master_wait: Duration::from_secs(30),
            new_master_poll: Duration::from_secs(1),
        }
    }
}

/// Internal nudges from request handlers to the health loop
#[derive(Debug)]
enum WorkerSignal {
    /// The master announced a graceful shutdown
    MasterShutdown,
    /// An election elsewhere decided a new master
    MasterElected(InstanceId),
}

/// Shared worker state, handed to request handlers behind an `Arc`.
pub struct WorkerShared {
    /// This worker's instance id
    pub instance_id: InstanceId,
    config: CoordinationConfig,
    tuning: WorkerTuning,
    local: Arc<dyn LocalToolExecutor>,
    adapter: Arc<dyn WorkspaceAdapter>,
    port: u16,
    started: Instant,
    inflight: AtomicUsize,
    heartbeat_interval: RwLock<Duration>,
    master_id: RwLock<Option<InstanceId>>,
    last_master_seen: RwLock<DateTime<Utc>>,
    own_record: RwLock<Option<WorkerRecord>>,
    election: RwLock<Option<Arc<ElectionCoordinator>>>,
    signals: mpsc::Sender<WorkerSignal>,
    events: mpsc::Sender<RoleEvent>,
    probe: HealthProbe,
    client: reqwest::Client,
}

impl WorkerShared {
    fn master_base(&self) -> String {
        format!("http://127.0.0.1:{}", self.config.master_port)
    }

    fn capabilities(&self) -> BTreeSet<String> {
        self.local.available_tools().into_iter().collect()
    }

    /// This worker's election self-description.
    pub fn build_candidate(&self) -> ElectionCandidate {
        let inputs = self.adapter.score_inputs();
        let cores = num_cpus::get().max(1);
        let inflight = self.inflight.load(Ordering::Relaxed);
        ElectionCandidate {
            instance_id: self.instance_id.clone(),
            workspace_score: inputs.score(),
            uptime_ms: self.started.elapsed().as_millis() as u64,
            resource_usage: ((inflight * 100 / cores) as f64).min(100.0),
            capabilities: self.capabilities(),
            last_seen: *self.last_master_seen.read(),
            worker_info: self.own_record.read().clone(),
        }
    }

    /// One registration attempt against the configured master port.
    async fn register_once(&self) -> CoordinationResult<RegisterResponse> {
        let info = self.adapter.workspace_info();
        let request = RegisterRequest {
            instance_id: self.instance_id.clone(),
            workspace_name: info.name.clone(),
            workspace_path: info.path.clone(),
            port: self.port,
            capabilities: self.capabilities(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };

        let url = format!("{}/coordination/workers/register", self.master_base());
        let response = self
            .client
            .post(&url)
            .timeout(self.config.registration_timeout())
            .json(&request)
            .send()
            .await
            .map_err(|e| CoordinationError::Communication(e.to_string()))?;
        let body = response
            .json::<RegisterResponse>()
            .await
            .map_err(|e| CoordinationError::Communication(e.to_string()))?;

        if !body.success {
            return Err(CoordinationError::RegistrationRejected(
                body.error.unwrap_or_else(|| "unspecified".to_string()),
            ));
        }

        *self.heartbeat_interval.write() = Duration::from_secs(body.heartbeat_interval_secs.max(1));
        *self.master_id.write() = Some(body.master_instance_id.clone());
        let now = Utc::now();
        *self.own_record.write() = Some(WorkerRecord {
            instance_id: self.instance_id.clone(),
            workspace_name: info.name,
            workspace_path: info.path,
            port: self.port,
            capabilities: self.capabilities(),
            status: self.adapter.worker_status(),
            registered_at: now,
            last_seen: now,
            version: env!("CARGO_PKG_VERSION").to_string(),
        });
        info!(master = %body.master_instance_id, "registered with master");
        Ok(body)
    }

    fn election_in_progress(&self) -> bool {
        self.election.read().is_some()
    }

    async fn send_event(&self, event: RoleEvent) {
        if self.events.send(event).await.is_err() {
            debug!("role event receiver dropped");
        }
    }
}

/// The running worker role.
pub struct WorkerCore {
    shared: Arc<WorkerShared>,
    cancel: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    lifecycle: tokio::task::JoinHandle<()>,
    port: u16,
}

impl WorkerCore {
    /// Start with production timing defaults.
    pub async fn start(
        config: CoordinationConfig,
        instance_id: InstanceId,
        local: Arc<dyn LocalToolExecutor>,
        adapter: Arc<dyn WorkspaceAdapter>,
        events: mpsc::Sender<RoleEvent>,
    ) -> CoordinationResult<Self> {
        Self::start_with_tuning(
            config,
            instance_id,
            local,
            adapter,
            events,
            WorkerTuning::default(),
        )
        .await
    }

    /// Start with explicit timing knobs.
    ///
    /// Picks a port from the worker range, serves the worker surface, and
    /// spawns the registration/heartbeat/health lifecycle.
    pub async fn start_with_tuning(
        config: CoordinationConfig,
        instance_id: InstanceId,
        local: Arc<dyn LocalToolExecutor>,
        adapter: Arc<dyn WorkspaceAdapter>,
        events: mpsc::Sender<RoleEvent>,
        tuning: WorkerTuning,
    ) -> CoordinationResult<Self> {
        let chosen =
            PortProber::find_available_port(config.worker_port_start, config.worker_port_end)
                .await?;
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", chosen))
            .await
            .map_err(|e| CoordinationError::PortBindFailed {
                port: chosen,
                reason: e.to_string(),
            })?;
        let port = listener
            .local_addr()
            .map_err(|e| CoordinationError::Internal(e.to_string()))?
            .port();

        let (signals, signal_receiver) = mpsc::channel(8);
        let shared = Arc::new(WorkerShared {
            instance_id: instance_id.clone(),
            probe: HealthProbe::with_identity(instance_id.clone(), Role::Worker),
            config: config.clone(),
            tuning,
            local,
            adapter,
            port,
            started: Instant::now(),
            inflight: AtomicUsize::new(0),
            heartbeat_interval: RwLock::new(config.heartbeat_interval()),
            master_id: RwLock::new(None),
            last_master_seen: RwLock::new(Utc::now()),
            own_record: RwLock::new(None),
            election: RwLock::new(None),
            signals,
            events,
            client: reqwest::Client::new(),
        });

        let cancel = CancellationToken::new();

        let app = routes(shared.clone());
        let server_cancel = cancel.clone();
        let server = tokio::spawn(async move {
            let shutdown = async move { server_cancel.cancelled().await };
            if let Err(error) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(%error, "worker server exited with error");
            }
        });

        let lifecycle = tokio::spawn(lifecycle(
            shared.clone(),
            signal_receiver,
            cancel.clone(),
        ));

        info!(%instance_id, port, "worker started");
        Ok(Self {
            shared,
            cancel,
            server,
            lifecycle,
            port,
        })
    }

    /// The port the worker surface is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Shared worker state.
    pub fn shared(&self) -> &Arc<WorkerShared> {
        &self.shared
    }

    /// Stop serving: say goodbye to the master, abort any election, and
    /// shut the server and lifecycle down within the stop deadline.
    pub async fn stop(self) {
        // Best-effort goodbye so the master reaps us immediately.
        let url = format!(
            "{}/coordination/workers/{}",
            self.shared.master_base(),
            self.shared.instance_id
        );
        if let Err(error) = self
            .shared
            .client
            .delete(&url)
            .timeout(DEREGISTER_TIMEOUT)
            .send()
            .await
        {
            debug!(%error, "deregistration on stop failed");
        }

        if let Some(election) = self.shared.election.read().clone() {
            election.abort();
        }
        self.cancel.cancel();

        if tokio::time::timeout(STOP_DEADLINE, self.server).await.is_err() {
            warn!("worker server did not stop within deadline");
        }
        if tokio::time::timeout(STOP_DEADLINE, self.lifecycle)
            .await
            .is_err()
        {
            warn!("worker lifecycle did not stop within deadline");
        }
        info!(instance_id = %self.shared.instance_id, "worker stopped");
    }
}

fn routes(shared: Arc<WorkerShared>) -> axum::Router {
    axum::Router::new()
        .route("/health", get(worker_health))
        .route("/tools/:tool", post(execute_tool))
        .route("/context", get(worker_context))
        .route("/election/candidate", get(election_candidate))
        .route("/election/message", post(election_message))
        .route("/coordination/shutdown", post(shutdown_notice))
        .with_state(shared)
        .layer(TraceLayer::new_for_http())
}

async fn worker_health(State(shared): State<Arc<WorkerShared>>) -> Json<WorkerHealth> {
    Json(WorkerHealth {
        status: "healthy".to_string(),
        instance_id: shared.instance_id.clone(),
        workspace_name: shared.adapter.workspace_info().name,
        capabilities: shared.capabilities(),
    })
}

async fn execute_tool(
    State(shared): State<Arc<WorkerShared>>,
    Path(tool): Path<String>,
    Json(params): Json<serde_json::Value>,
) -> Json<ToolCallResponse> {
    shared.inflight.fetch_add(1, Ordering::Relaxed);
    let result = shared.local.execute_tool(&tool, params).await;
    shared.inflight.fetch_sub(1, Ordering::Relaxed);

    let response = match result {
        Ok(result) => ToolCallResponse {
            success: result.success,
            result: result.result,
            error: result.error,
            routed_to: None,
        },
        Err(error) => ToolCallResponse {
            success: false,
            result: None,
            error: Some(error.to_string()),
            routed_to: None,
        },
    };
    Json(response)
}

async fn worker_context(State(shared): State<Arc<WorkerShared>>) -> Json<ContextResponse> {
    let available = shared.local.available_tools();
    let active_editor = fetch_optional(&shared, &available, "get_active_editor").await;
    let open_files = fetch_optional(&shared, &available, "list_open_files").await;
    Json(ContextResponse {
        workspace: serde_json::to_value(shared.adapter.workspace_info())
            .unwrap_or(serde_json::Value::Null),
        active_editor,
        open_files,
    })
}

/// Query a local tool for the context summary, if the executor has it.
async fn fetch_optional(
    shared: &Arc<WorkerShared>,
    available: &[String],
    tool: &str,
) -> Option<serde_json::Value> {
    if !available.iter().any(|name| name == tool) {
        return None;
    }
    match shared
        .local
        .execute_tool(tool, serde_json::Value::Null)
        .await
    {
        Ok(result) if result.success => result.result,
        _ => None,
    }
}

async fn election_candidate(
    State(shared): State<Arc<WorkerShared>>,
) -> Json<ElectionCandidate> {
    Json(shared.build_candidate())
}

async fn election_message(
    State(shared): State<Arc<WorkerShared>>,
    Json(message): Json<ElectionMessage>,
) -> Json<AckResponse> {
    match message.kind {
        ElectionMessageKind::MasterElected => {
            if let Some(new_master) = message.new_master_id() {
                info!(new_master, from = %message.from_instance_id, "election result received");
                let _ = shared
                    .signals
                    .send(WorkerSignal::MasterElected(new_master.to_string()))
                    .await;
            }
        }
        ElectionMessageKind::ElectionStarted => {
            debug!(from = %message.from_instance_id, "election started elsewhere");
        }
    }
    Json(AckResponse { success: true })
}

async fn shutdown_notice(
    State(shared): State<Arc<WorkerShared>>,
    Json(notice): Json<ShutdownNotice>,
) -> Json<AckResponse> {
    info!(master = %notice.instance_id, "master announced shutdown");
    let _ = shared.signals.send(WorkerSignal::MasterShutdown).await;
    Json(AckResponse { success: true })
}

/// Register, then heartbeat and watch the master until cancelled.
async fn lifecycle(
    shared: Arc<WorkerShared>,
    signals: mpsc::Receiver<WorkerSignal>,
    cancel: CancellationToken,
) {
    if !register_with_retries(&shared, &cancel).await {
        if !cancel.is_cancelled() {
            shared
                .send_event(RoleEvent::DemoteToStandalone {
                    reason: "registration retries exhausted".to_string(),
                })
                .await;
        }
        return;
    }

    let heartbeat = tokio::spawn(heartbeat_loop(shared.clone(), cancel.clone()));
    health_loop(shared, signals, cancel).await;
    let _ = heartbeat.await;
}

/// Initial registration with exponential backoff. True on success.
async fn register_with_retries(shared: &Arc<WorkerShared>, cancel: &CancellationToken) -> bool {
    let mut backoff = shared.tuning.registration_backoff_base;
    for attempt in 1..=shared.tuning.registration_max_attempts {
        if attempt > 1 {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff *= 2;
        }
        match shared.register_once().await {
            Ok(_) => return true,
            Err(error) => {
                warn!(attempt, %error, "registration attempt failed");
            }
        }
    }
    false
}

/// Send one heartbeat per interval. Transport failures are tolerated; the
/// health loop is the authority for master failure detection.
async fn heartbeat_loop(shared: Arc<WorkerShared>, cancel: CancellationToken) {
    loop {
        let interval = *shared.heartbeat_interval.read();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let request = HeartbeatRequest {
            instance_id: shared.instance_id.clone(),
            status: shared.adapter.worker_status(),
            timestamp: Utc::now(),
        };
        let url = format!(
            "{}/coordination/workers/{}/heartbeat",
            shared.master_base(),
            shared.instance_id
        );
        let response = shared
            .client
            .post(&url)
            .timeout(interval)
            .json(&request)
            .send()
            .await;

        match response {
            Ok(response) => {
                if let Ok(body) = response.json::<HeartbeatResponse>().await {
                    if body.should_reregister == Some(true) {
                        info!("master does not know us, re-registering");
                        if let Err(error) = shared.register_once().await {
                            warn!(%error, "re-registration failed");
                        }
                    }
                }
            }
            Err(error) => {
                debug!(%error, "heartbeat send failed");
            }
        }
    }
}

/// Probe the master on a fixed cadence and start an election after the
/// failure threshold.
async fn health_loop(
    shared: Arc<WorkerShared>,
    mut signals: mpsc::Receiver<WorkerSignal>,
    cancel: CancellationToken,
) {
    let mut failures = 0u32;
    let mut ticker = tokio::time::interval(shared.config.master_health_check_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            signal = signals.recv() => match signal {
                Some(WorkerSignal::MasterShutdown) => {
                    failures = 0;
                    run_election(&shared, &cancel).await;
                }
                Some(WorkerSignal::MasterElected(new_master)) => {
                    debug!(%new_master, "waiting for elected master");
                    failures = 0;
                    wait_for_new_master(&shared, &cancel).await;
                }
                None => break,
            },
            _ = ticker.tick() => {
                let (status, health) = shared
                    .probe
                    .probe_master_detailed(
                        shared.config.master_port,
                        shared.config.registration_timeout(),
                    )
                    .await;

                match status {
                    MasterStatus::Healthy => {
                        failures = 0;
                        *shared.last_master_seen.write() = Utc::now();
                        if let Some(health) = health {
                            let known = shared.master_id.read().clone();
                            if known.as_deref() != Some(health.instance_id.as_str()) {
                                info!(
                                    new_master = %health.instance_id,
                                    "master identity changed, re-registering"
                                );
                                if let Err(error) = shared.register_once().await {
                                    warn!(%error, "re-registration with new master failed");
                                }
                            }
                        }
                    }
                    MasterStatus::Shutdown => {
                        failures = 0;
                        run_election(&shared, &cancel).await;
                    }
                    MasterStatus::Degraded | MasterStatus::Unreachable => {
                        failures += 1;
                        debug!(failures, %status, "master probe unhealthy");
                        if failures >= MASTER_FAILURE_THRESHOLD && !shared.election_in_progress() {
                            failures = 0;
                            run_election(&shared, &cancel).await;
                        }
                    }
                }
            }
        }
    }
}

/// Run one election and act on its outcome.
async fn run_election(shared: &Arc<WorkerShared>, cancel: &CancellationToken) {
    if shared.election_in_progress() {
        return;
    }

    let coordinator = Arc::new(ElectionCoordinator::new(
        shared.config.clone(),
        shared.build_candidate(),
        shared.port,
    ));
    *shared.election.write() = Some(coordinator.clone());

    info!("initiating master election");
    let result = tokio::select! {
        result = coordinator.run() => result,
        _ = cancel.cancelled() => {
            coordinator.abort();
            *shared.election.write() = None;
            return;
        }
    };
    *shared.election.write() = None;

    match result {
        Ok(ElectionOutcome::Won { candidates }) => {
            info!(candidates, "election won, promoting to master");
            shared
                .send_event(RoleEvent::PromoteToMaster {
                    reason: "election won".to_string(),
                })
                .await;
        }
        Ok(ElectionOutcome::Lost { winner }) => {
            info!(winner = %winner.instance_id, "election lost, waiting for new master");
            if !wait_for_new_master(shared, cancel).await && !cancel.is_cancelled() {
                warn!("no new master appeared in time, self-promoting");
                shared
                    .send_event(RoleEvent::PromoteToMaster {
                        reason: "new master never appeared after lost election".to_string(),
                    })
                    .await;
            }
        }
        Err(CoordinationError::QuorumNotMet { responses, required }) => {
            warn!(
                responses,
                required, "election quorum not met, self-promoting as last resort"
            );
            shared
                .send_event(RoleEvent::PromoteToMaster {
                    reason: "election quorum not met".to_string(),
                })
                .await;
        }
        Err(error) => {
            warn!(%error, "election failed");
        }
    }
}

/// Poll for a healthy master and re-register with it. True when
/// registration succeeded before the wait deadline.
async fn wait_for_new_master(shared: &Arc<WorkerShared>, cancel: &CancellationToken) -> bool {
    let deadline = tokio::time::Instant::now() + shared.tuning.new_master_wait;
    loop {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(shared.tuning.new_master_poll) => {}
        }

        let status = shared
            .probe
            .probe_master(
                shared.config.master_port,
                shared.config.registration_timeout(),
            )
            .await;
        if status.is_healthy() {
            match shared.register_once().await {
                Ok(_) => return true,
                Err(error) => debug!(%error, "registration with new master failed, retrying"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{EchoToolExecutor, StaticWorkspaceAdapter};
    use crate::coordination::types::WorkspaceScoreInputs;
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_tuning() -> WorkerTuning {
        WorkerTuning {
            registration_max_attempts: 2,
            registration_backoff_base: Duration::from_millis(50),
            new_master_wait: Duration::from_millis(500),
            new_master_poll: Duration::from_millis(100),
        }
    }

    fn test_config(master_port: u16) -> CoordinationConfig {
        CoordinationConfig {
            master_port,
            // Port 0 lets the OS pick; the scan range stays tiny.
            worker_port_start: 0,
            worker_port_end: 0,
            heartbeat_interval_secs: 1,
            master_health_check_interval_secs: 1,
            registration_timeout_secs: 2,
            election_timeout_secs: 1,
            ..CoordinationConfig::default()
        }
    }

    async fn mount_register(server: &MockServer, heartbeat_secs: u64) {
        Mock::given(method("POST"))
            .and(path("/coordination/workers/register"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "instance_id": "echo",
                "master_instance_id": "m1",
                "heartbeat_interval_secs": heartbeat_secs,
            })))
            .mount(server)
            .await;
    }

    async fn mount_healthy_master(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/coordination/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "healthy",
                "instance_id": "m1",
                "uptime_ms": 1000,
                "worker_count": 1,
                "version": "0.1.0",
                "timestamp": Utc::now(),
            })))
            .mount(server)
            .await;
    }

    async fn mount_ack_endpoints(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path_regex(r"^/coordination/workers/.+/heartbeat$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "master_status": "healthy",
            })))
            .mount(server)
            .await;
        Mock::given(method("DELETE"))
            .and(path_regex(r"^/coordination/workers/.+$"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": true})),
            )
            .mount(server)
            .await;
    }

    async fn start_worker(
        master: &MockServer,
    ) -> (WorkerCore, mpsc::Receiver<RoleEvent>, reqwest::Client) {
        let (events, receiver) = mpsc::channel(8);
        let worker = WorkerCore::start_with_tuning(
            test_config(master.address().port()),
            "worker-under-test".to_string(),
            Arc::new(EchoToolExecutor),
            Arc::new(StaticWorkspaceAdapter::new("demo", "/home/dev/demo")),
            events,
            fast_tuning(),
        )
        .await
        .expect("worker starts");
        (worker, receiver, reqwest::Client::new())
    }

    #[tokio::test]
    async fn test_worker_registers_and_heartbeats() {
        let master = MockServer::start().await;
        mount_register(&master, 1).await;
        mount_healthy_master(&master).await;
        mount_ack_endpoints(&master).await;

        let (worker, _events, _client) = start_worker(&master).await;
        tokio::time::sleep(Duration::from_millis(1600)).await;
        worker.stop().await;

        let requests = master.received_requests().await.unwrap();
        let registrations = requests
            .iter()
            .filter(|r| r.url.path() == "/coordination/workers/register")
            .count();
        let heartbeats = requests
            .iter()
            .filter(|r| r.url.path().ends_with("/heartbeat"))
            .count();
        assert_eq!(registrations, 1);
        assert!(heartbeats >= 1, "expected at least one heartbeat");
    }

    #[tokio::test]
    async fn test_worker_surface_serves_tools_and_health() {
        let master = MockServer::start().await;
        mount_register(&master, 60).await;
        mount_healthy_master(&master).await;
        mount_ack_endpoints(&master).await;

        let (worker, _events, client) = start_worker(&master).await;
        let base = format!("http://127.0.0.1:{}", worker.port());

        let health: WorkerHealth = client
            .get(format!("{base}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health.instance_id, "worker-under-test");
        assert_eq!(health.workspace_name, "demo");

        let response: ToolCallResponse = client
            .post(format!("{base}/tools/get_diagnostics"))
            .json(&serde_json::json!({"uri": "file:///a.rs"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(response.success);

        worker.stop().await;
    }

    #[tokio::test]
    async fn test_candidate_reflects_adapter_score() {
        let master = MockServer::start().await;
        mount_register(&master, 60).await;
        mount_healthy_master(&master).await;
        mount_ack_endpoints(&master).await;

        let (events, _receiver) = mpsc::channel(8);
        let mut adapter = StaticWorkspaceAdapter::new("demo", "/home/dev/demo");
        adapter.score_inputs = WorkspaceScoreInputs {
            file_count: 100,
            git_commits: 50,
            recent_activity: 10.0,
        };
        let worker = WorkerCore::start_with_tuning(
            test_config(master.address().port()),
            "worker-under-test".to_string(),
            Arc::new(EchoToolExecutor),
            Arc::new(adapter),
            events,
            fast_tuning(),
        )
        .await
        .unwrap();

        let candidate: ElectionCandidate = reqwest::Client::new()
            .get(format!("http://127.0.0.1:{}/election/candidate", worker.port()))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        // 100 * 0.4 + 50 * 0.3 + 10 * 0.3 = 58
        assert!((candidate.workspace_score - 58.0).abs() < 0.001);
        assert_eq!(candidate.instance_id, "worker-under-test");

        worker.stop().await;
    }

    #[tokio::test]
    async fn test_reregisters_when_master_asks() {
        let master = MockServer::start().await;
        mount_register(&master, 1).await;
        mount_healthy_master(&master).await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/coordination/workers/.+/heartbeat$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": false,
                "master_status": "healthy",
                "should_reregister": true,
            })))
            .mount(&master)
            .await;
        Mock::given(method("DELETE"))
            .and(path_regex(r"^/coordination/workers/.+$"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": true})),
            )
            .mount(&master)
            .await;

        let (worker, _events, _client) = start_worker(&master).await;
        tokio::time::sleep(Duration::from_millis(1600)).await;
        worker.stop().await;

        let registrations = master
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == "/coordination/workers/register")
            .count();
        assert!(
            registrations >= 2,
            "expected re-registration, saw {registrations}"
        );
    }

    #[tokio::test]
    async fn test_registration_exhaustion_goes_standalone() {
        // A dead master port: every registration attempt fails.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = listener.local_addr().unwrap().port();
        drop(listener);

        let master_config = test_config(dead_port);
        let (events, mut receiver) = mpsc::channel(8);
        let worker = WorkerCore::start_with_tuning(
            master_config,
            "worker-under-test".to_string(),
            Arc::new(EchoToolExecutor),
            Arc::new(StaticWorkspaceAdapter::new("demo", "/home/dev/demo")),
            events,
            fast_tuning(),
        )
        .await
        .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        assert!(matches!(event, RoleEvent::DemoteToStandalone { .. }));

        // The local tool endpoint keeps serving.
        let response: ToolCallResponse = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{}/tools/open_file", worker.port()))
            .json(&serde_json::json!({"uri": "file:///a.rs"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(response.success);

        worker.stop().await;
    }

    #[tokio::test]
    async fn test_master_failure_triggers_election_and_promotion() {
        let master = MockServer::start().await;
        mount_register(&master, 60).await;
        mount_ack_endpoints(&master).await;
        // Health endpoint is broken: responses parse as garbage.
        Mock::given(method("GET"))
            .and(path("/coordination/health"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&master)
            .await;

        let (worker, mut events, _client) = start_worker(&master).await;

        // Three failed probes at 1 s cadence, then a lone election win.
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        assert!(matches!(event, RoleEvent::PromoteToMaster { .. }));

        worker.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_notice_triggers_election() {
        let master = MockServer::start().await;
        mount_register(&master, 60).await;
        mount_healthy_master(&master).await;
        mount_ack_endpoints(&master).await;

        let (worker, mut events, client) = start_worker(&master).await;

        // Give registration a moment, then deliver the shutdown notice.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let ack: AckResponse = client
            .post(format!(
                "http://127.0.0.1:{}/coordination/shutdown",
                worker.port()
            ))
            .json(&ShutdownNotice::new("m1".to_string(), "going away"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(ack.success);

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        assert!(matches!(event, RoleEvent::PromoteToMaster { .. }));

        worker.stop().await;
    }
}
