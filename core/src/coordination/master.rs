// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Master role: registry owner and inbound endpoint host.

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get, post};
use axum::Json;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::CoordinationConfig;
use crate::coordination::ports::PortProber;
use crate::coordination::protocol::{
    AckResponse, CoordinationHealth, CoordinationStatus, HeartbeatRequest, HeartbeatResponse,
    RegisterRequest, RegisterResponse, ShutdownNotice, ToolCallResponse, WorkerListResponse,
    HEADER_INSTANCE_ID, HEADER_ROLE,
};
use crate::coordination::registry::WorkerRegistry;
use crate::coordination::remote::RemoteExecutor;
use crate::coordination::router::Router;
use crate::coordination::supervisor::RoleEvent;
use crate::coordination::types::{
    CoordinationError, CoordinationResult, InstanceId, Role, ToolCallLog, PerformanceMetrics,
    WorkerRecord, WorkerStatus, TOOL_CALL_HISTORY_CAPACITY,
};
use crate::mcp::{self, SessionStore, ToolDispatcher};
use crate::tools::LocalToolExecutor;

/// Bound on `stop()` including the shutdown broadcast.
const STOP_DEADLINE: Duration = Duration::from_secs(5);

/// Per-worker shutdown notification timeout.
const SHUTDOWN_NOTIFY_TIMEOUT: Duration = Duration::from_secs(3);

/// Concurrency bound for the shutdown broadcast fan-out.
const BROADCAST_CONCURRENCY: usize = 10;

/// Reachability check timeout applied during worker registration.
const REGISTER_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared master state; exclusively owned by the master role, handed to
/// request handlers behind an `Arc`.
pub struct MasterContext {
    /// This master's instance id
    pub instance_id: InstanceId,
    config: CoordinationConfig,
    registry: Arc<WorkerRegistry>,
    router: Router,
    local: Arc<dyn LocalToolExecutor>,
    sessions: Arc<SessionStore>,
    metrics: RwLock<PerformanceMetrics>,
    history: Mutex<VecDeque<ToolCallLog>>,
    started: Instant,
    shutting_down: AtomicBool,
    stepping_down: AtomicBool,
    events: mpsc::Sender<RoleEvent>,
    client: reqwest::Client,
}

impl MasterContext {
    /// Execute one inbound tool call: route it, fold the outcome into the
    /// performance counters, and append it to the history ring.
    pub async fn handle_tool_call(
        &self,
        tool: &str,
        params: serde_json::Value,
    ) -> ToolCallResponse {
        let timestamp = Utc::now();
        let started = Instant::now();
        let outcome = self.router.route(tool, params.clone()).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        self.metrics
            .write()
            .record(duration_ms, outcome.result.success);

        let entry = ToolCallLog {
            id: uuid::Uuid::new_v4().to_string(),
            tool: tool.to_string(),
            params,
            result: outcome.result.result.clone(),
            error: outcome.result.error.clone(),
            timestamp,
            duration_ms,
            routed_to: outcome.routed_to.clone(),
        };
        let mut history = self.history.lock();
        if history.len() >= TOOL_CALL_HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(entry);
        drop(history);

        ToolCallResponse {
            success: outcome.result.success,
            result: outcome.result.result,
            error: outcome.result.error,
            routed_to: outcome.routed_to,
        }
    }

    /// Health summary for probes and the status surface.
    fn health(&self) -> CoordinationHealth {
        CoordinationHealth {
            status: self.status_label().to_string(),
            instance_id: self.instance_id.clone(),
            uptime_ms: self.started.elapsed().as_millis() as u64,
            worker_count: self.registry.len(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
        }
    }

    fn status_label(&self) -> &'static str {
        if self.shutting_down.load(Ordering::SeqCst) {
            "shutting_down"
        } else {
            "healthy"
        }
    }

    /// Inspect probe headers for a competing master and arbitrate.
    ///
    /// Both sides can decide locally from the id pair: the instance with
    /// the HIGHER lexicographic id steps down, the other keeps serving.
    fn observe_probe(self: &Arc<Self>, headers: &HeaderMap) {
        let id = headers
            .get(HEADER_INSTANCE_ID)
            .and_then(|v| v.to_str().ok());
        let role = headers.get(HEADER_ROLE).and_then(|v| v.to_str().ok());

        let (Some(other_id), Some("master")) = (id, role) else {
            return;
        };
        if other_id == self.instance_id {
            return;
        }

        if self.instance_id.as_str() > other_id {
            if !self.stepping_down.swap(true, Ordering::SeqCst) {
                warn!(
                    other = %other_id,
                    "competing master detected, stepping down (higher instance id)"
                );
                let events = self.events.clone();
                let other = other_id.to_string();
                tokio::spawn(async move {
                    let _ = events
                        .send(RoleEvent::StepDownToWorker {
                            competing_master: other,
                        })
                        .await;
                });
            }
        } else {
            info!(
                other = %other_id,
                "competing master detected with higher id, expecting it to step down"
            );
        }
    }

    /// Snapshot of the registry for state preservation at step-down.
    pub fn preserve_state(&self) -> Vec<WorkerRecord> {
        self.registry.list()
    }

    /// Notify every registered worker that this master is going away.
    /// Bounded fan-out, bounded overall.
    async fn broadcast_shutdown(&self) {
        let workers = self.registry.list();
        if workers.is_empty() {
            return;
        }
        info!(count = workers.len(), "broadcasting master shutdown");

        let notice = ShutdownNotice::new(self.instance_id.clone(), "master shutting down");
        let client = &self.client;
        let notify_all = futures::stream::iter(workers.into_iter().map(|worker| {
            let notice = notice.clone();
            async move {
                let url = format!("{}/coordination/shutdown", worker.base_url());
                if let Err(error) = client
                    .post(&url)
                    .timeout(SHUTDOWN_NOTIFY_TIMEOUT)
                    .json(&notice)
                    .send()
                    .await
                {
                    debug!(worker = %worker.instance_id, %error, "shutdown notify failed");
                }
            }
        }))
        .buffer_unordered(BROADCAST_CONCURRENCY)
        .collect::<Vec<()>>();

        if tokio::time::timeout(STOP_DEADLINE, notify_all).await.is_err() {
            warn!("shutdown broadcast exceeded deadline, abandoning");
        }
    }
}

#[async_trait]
impl ToolDispatcher for MasterContext {
    async fn dispatch_tool(&self, tool: &str, params: serde_json::Value) -> ToolCallResponse {
        self.handle_tool_call(tool, params).await
    }

    fn list_tools(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self.local.available_tools().into_iter().collect();
        for worker in self.registry.list() {
            names.extend(worker.capabilities);
        }
        names.into_iter().collect()
    }

    fn service_summary(&self) -> serde_json::Value {
        let health = self.health();
        serde_json::json!({
            "status": health.status,
            "role": Role::Master.to_string(),
            "instance_id": health.instance_id,
            "uptime_ms": health.uptime_ms,
            "worker_count": health.worker_count,
            "version": health.version,
        })
    }
}

/// The running master role.
pub struct MasterCore {
    context: Arc<MasterContext>,
    cancel: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    reaper: tokio::task::JoinHandle<()>,
    port: u16,
}

impl MasterCore {
    /// Bind the master port and start serving the coordination and inbound
    /// surfaces, plus the heartbeat reaper.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::PortBindFailed`] when the master port is taken;
    /// this is the fatal-at-runtime condition.
    pub async fn start(
        config: CoordinationConfig,
        instance_id: InstanceId,
        local: Arc<dyn LocalToolExecutor>,
        events: mpsc::Sender<RoleEvent>,
    ) -> CoordinationResult<Self> {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", config.master_port))
            .await
            .map_err(|e| CoordinationError::PortBindFailed {
                port: config.master_port,
                reason: e.to_string(),
            })?;
        let port = listener
            .local_addr()
            .map_err(|e| CoordinationError::Internal(e.to_string()))?
            .port();

        let registry = Arc::new(WorkerRegistry::new());
        let remote = RemoteExecutor::new(config.tool_call_timeout());
        let router = Router::new(registry.clone(), remote, local.clone(), Role::Master);

        let context = Arc::new(MasterContext {
            instance_id: instance_id.clone(),
            config: config.clone(),
            registry: registry.clone(),
            router,
            local,
            sessions: Arc::new(SessionStore::new()),
            metrics: RwLock::new(PerformanceMetrics::default()),
            history: Mutex::new(VecDeque::with_capacity(TOOL_CALL_HISTORY_CAPACITY)),
            started: Instant::now(),
            shutting_down: AtomicBool::new(false),
            stepping_down: AtomicBool::new(false),
            events,
            client: reqwest::Client::new(),
        });

        let cancel = CancellationToken::new();

        let app = routes(context.clone());
        let server_cancel = cancel.clone();
        let server = tokio::spawn(async move {
            let shutdown = async move { server_cancel.cancelled().await };
            if let Err(error) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(%error, "master server exited with error");
            }
        });

        let reaper_cancel = cancel.clone();
        let reaper_registry = registry;
        let heartbeat_interval = config.heartbeat_interval();
        let reaper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = reaper_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = reaper_registry.reap_expired(heartbeat_interval);
                        for record in reaped {
                            warn!(
                                instance_id = %record.instance_id,
                                workspace = %record.workspace_path,
                                "worker heartbeat timed out"
                            );
                        }
                    }
                }
            }
        });

        info!(%instance_id, port, "master started");
        Ok(Self {
            context,
            cancel,
            server,
            reaper,
            port,
        })
    }

    /// The port the master surface is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Shared master state.
    pub fn context(&self) -> &Arc<MasterContext> {
        &self.context
    }

    /// The master's registry.
    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.context.registry
    }

    /// Stop serving: notify workers, then shut the server and reaper down
    /// within the stop deadline.
    pub async fn stop(self) {
        self.context.shutting_down.store(true, Ordering::SeqCst);
        self.context.broadcast_shutdown().await;

        self.cancel.cancel();
        if tokio::time::timeout(STOP_DEADLINE, self.server).await.is_err() {
            warn!("master server did not stop within deadline");
        }
        if tokio::time::timeout(STOP_DEADLINE, self.reaper).await.is_err() {
            warn!("master reaper did not stop within deadline");
        }
        info!(instance_id = %self.context.instance_id, "master stopped");
    }
}

fn routes(context: Arc<MasterContext>) -> axum::Router {
    let inbound = mcp::router(
        context.clone() as Arc<dyn ToolDispatcher>,
        context.sessions.clone(),
    );
    axum::Router::new()
        .route("/coordination/health", get(coordination_health))
        .route("/coordination/status", get(coordination_status))
        .route("/coordination/workers", get(list_workers))
        .route("/coordination/workers/register", post(register_worker))
        .route("/coordination/workers/:id", delete(deregister_worker))
        .route("/coordination/workers/:id/heartbeat", post(worker_heartbeat))
        .route("/coordination/tools/:tool", post(call_tool))
        .with_state(context)
        .merge(inbound)
        .layer(TraceLayer::new_for_http())
}

async fn coordination_health(
    State(context): State<Arc<MasterContext>>,
    headers: HeaderMap,
) -> Json<CoordinationHealth> {
    context.observe_probe(&headers);
    Json(context.health())
}

async fn coordination_status(
    State(context): State<Arc<MasterContext>>,
) -> Json<CoordinationStatus> {
    let metrics = context.metrics.read().clone();
    let history = context.history.lock().iter().cloned().collect();
    Json(CoordinationStatus { metrics, history })
}

async fn list_workers(State(context): State<Arc<MasterContext>>) -> Json<WorkerListResponse> {
    Json(WorkerListResponse {
        workers: context.registry.list(),
    })
}

async fn register_worker(
    State(context): State<Arc<MasterContext>>,
    Json(request): Json<RegisterRequest>,
) -> (StatusCode, Json<RegisterResponse>) {
    let reject = |reason: String| {
        (
            StatusCode::BAD_REQUEST,
            Json(RegisterResponse {
                success: false,
                instance_id: request.instance_id.clone(),
                master_instance_id: context.instance_id.clone(),
                heartbeat_interval_secs: context.config.heartbeat_interval_secs,
                error: Some(reason),
            }),
        )
    };

    if request.instance_id.is_empty() || request.workspace_path.is_empty() || request.port == 0 {
        return reject("instance_id, workspace_path and port are required".to_string());
    }

    // A record only enters the registry with a reachable port.
    if !PortProber::is_reachable(request.port, REGISTER_PROBE_TIMEOUT).await {
        return reject(format!("worker port {} is not reachable", request.port));
    }

    let now = Utc::now();
    let record = WorkerRecord {
        instance_id: request.instance_id.clone(),
        workspace_name: request.workspace_name.clone(),
        workspace_path: request.workspace_path.clone(),
        port: request.port,
        capabilities: request.capabilities.clone(),
        status: WorkerStatus::Idle,
        registered_at: now,
        last_seen: now,
        version: request.version.clone(),
    };
    context.registry.register(record);

    (
        StatusCode::OK,
        Json(RegisterResponse {
            success: true,
            instance_id: request.instance_id,
            master_instance_id: context.instance_id.clone(),
            heartbeat_interval_secs: context.config.heartbeat_interval_secs,
            error: None,
        }),
    )
}

async fn deregister_worker(
    State(context): State<Arc<MasterContext>>,
    Path(id): Path<String>,
) -> Json<AckResponse> {
    context.registry.deregister(&id);
    Json(AckResponse { success: true })
}

async fn worker_heartbeat(
    State(context): State<Arc<MasterContext>>,
    Path(id): Path<String>,
    Json(request): Json<HeartbeatRequest>,
) -> Json<HeartbeatResponse> {
    let known = context
        .registry
        .heartbeat(&id, request.status, request.timestamp);
    Json(HeartbeatResponse {
        success: known,
        master_status: context.status_label().to_string(),
        should_reregister: (!known).then_some(true),
    })
}

async fn call_tool(
    State(context): State<Arc<MasterContext>>,
    Path(tool): Path<String>,
    Json(params): Json<serde_json::Value>,
) -> Json<ToolCallResponse> {
    Json(context.handle_tool_call(&tool, params).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoToolExecutor;
    use std::collections::BTreeSet;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> CoordinationConfig {
        CoordinationConfig {
            master_port: 0,
            heartbeat_interval_secs: 1,
            ..CoordinationConfig::default()
        }
    }

    async fn start_master() -> (MasterCore, mpsc::Receiver<RoleEvent>, reqwest::Client) {
        let (events, receiver) = mpsc::channel(8);
        let master = MasterCore::start(
            test_config(),
            "master-under-test".to_string(),
            Arc::new(EchoToolExecutor),
            events,
        )
        .await
        .expect("master starts");
        (master, receiver, reqwest::Client::new())
    }

    fn base(master: &MasterCore) -> String {
        format!("http://127.0.0.1:{}", master.port())
    }

    async fn register_fake_worker(
        master: &MasterCore,
        client: &reqwest::Client,
        id: &str,
        workspace_path: &str,
        port: u16,
    ) -> RegisterResponse {
        client
            .post(format!("{}/coordination/workers/register", base(master)))
            .json(&RegisterRequest {
                instance_id: id.to_string(),
                workspace_name: format!("ws-{id}"),
                workspace_path: workspace_path.to_string(),
                port,
                capabilities: BTreeSet::new(),
                version: "0.1.0".to_string(),
            })
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_fresh_master_health() {
        let (master, _events, client) = start_master().await;

        let health: CoordinationHealth = client
            .get(format!("{}/coordination/health", base(&master)))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(health.status, "healthy");
        assert_eq!(health.worker_count, 0);
        assert_eq!(health.instance_id, "master-under-test");
        master.stop().await;
    }

    #[tokio::test]
    async fn test_register_lists_worker() {
        let (master, _events, client) = start_master().await;

        // Hold a listener open so the reachability check passes.
        let worker_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let worker_port = worker_listener.local_addr().unwrap().port();

        let response =
            register_fake_worker(&master, &client, "w1", "/home/dev/app", worker_port).await;
        assert!(response.success);
        assert_eq!(response.master_instance_id, "master-under-test");
        assert_eq!(response.heartbeat_interval_secs, 1);

        let listing: WorkerListResponse = client
            .get(format!("{}/coordination/workers", base(&master)))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listing.workers.len(), 1);
        assert_eq!(listing.workers[0].port, worker_port);
        master.stop().await;
    }

    #[tokio::test]
    async fn test_register_unreachable_port_rejected() {
        let (master, _events, client) = start_master().await;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = listener.local_addr().unwrap().port();
        drop(listener);

        let response = client
            .post(format!("{}/coordination/workers/register", base(&master)))
            .json(&RegisterRequest {
                instance_id: "w1".to_string(),
                workspace_name: "ws".to_string(),
                workspace_path: "/home/dev/app".to_string(),
                port: dead_port,
                capabilities: BTreeSet::new(),
                version: "0.1.0".to_string(),
            })
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: RegisterResponse = response.json().await.unwrap();
        assert!(!body.success);
        assert_eq!(master.registry().len(), 0);
        master.stop().await;
    }

    #[tokio::test]
    async fn test_silent_worker_is_reaped_with_its_routes() {
        let (master, _events, client) = start_master().await;

        let worker_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let worker_port = worker_listener.local_addr().unwrap().port();
        let response =
            register_fake_worker(&master, &client, "w1", "/home/dev/app", worker_port).await;
        assert!(response.success);
        assert_eq!(master.registry().len(), 1);

        // Never heartbeat: three 1 s intervals later the reaper removes the
        // record and its routing entries together.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(6);
        loop {
            if master.registry().get("w1").is_none() {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "worker was not reaped in time"
            );
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        assert!(master.registry().worker_for_path("/home/dev/app/file").is_none());
        assert!(master.registry().routing_is_consistent());
        master.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_heartbeat_requests_reregistration() {
        let (master, _events, client) = start_master().await;

        let response: HeartbeatResponse = client
            .post(format!(
                "{}/coordination/workers/ghost/heartbeat",
                base(&master)
            ))
            .json(&HeartbeatRequest {
                instance_id: "ghost".to_string(),
                status: WorkerStatus::Idle,
                timestamp: Utc::now(),
            })
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert!(!response.success);
        assert_eq!(response.should_reregister, Some(true));
        master.stop().await;
    }

    #[tokio::test]
    async fn test_tool_call_updates_metrics_and_history() {
        let (master, _events, client) = start_master().await;

        let response: ToolCallResponse = client
            .post(format!(
                "{}/coordination/tools/get_diagnostics",
                base(&master)
            ))
            .json(&serde_json::json!({"uri": "file:///a.rs"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.routed_to.as_deref(), Some("local"));

        let status: CoordinationStatus = client
            .get(format!("{}/coordination/status", base(&master)))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status.metrics.total_calls, 1);
        assert!((status.metrics.success_rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(status.history.len(), 1);
        assert_eq!(status.history[0].tool, "get_diagnostics");
        master.stop().await;
    }

    #[tokio::test]
    async fn test_competing_master_with_lower_id_forces_step_down() {
        let (master, mut events, client) = start_master().await;

        // "aaa" < "master-under-test": the running master has the higher
        // id and must step down.
        client
            .get(format!("{}/coordination/health", base(&master)))
            .header(HEADER_INSTANCE_ID, "aaa-competitor")
            .header(HEADER_ROLE, "master")
            .send()
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event within deadline")
            .expect("channel open");
        match event {
            RoleEvent::StepDownToWorker { competing_master } => {
                assert_eq!(competing_master, "aaa-competitor");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        master.stop().await;
    }

    #[tokio::test]
    async fn test_competing_master_with_higher_id_keeps_serving() {
        let (master, mut events, client) = start_master().await;

        client
            .get(format!("{}/coordination/health", base(&master)))
            .header(HEADER_INSTANCE_ID, "zzz-competitor")
            .header(HEADER_ROLE, "master")
            .send()
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_millis(300), events.recv()).await;
        assert!(event.is_err(), "no step-down expected");
        master.stop().await;
    }

    #[tokio::test]
    async fn test_stop_broadcasts_shutdown_to_workers() {
        let (master, _events, client) = start_master().await;

        let worker = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/coordination/shutdown"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "success": true })),
            )
            .expect(1)
            .mount(&worker)
            .await;

        let response = register_fake_worker(
            &master,
            &client,
            "w1",
            "/home/dev/app",
            worker.address().port(),
        )
        .await;
        assert!(response.success);

        master.stop().await;
        // MockServer verifies the expected shutdown call on drop.
    }
}
