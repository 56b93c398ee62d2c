// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Leader election.
//!
//! A worker that has lost its master discovers the surviving candidates,
//! collects their self-descriptions, and decides a winner with a
//! deterministic comparator. Only quorum-backed decisions are binding;
//! losing candidates learn the outcome from the broadcast or from their
//! own health loop.

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CoordinationConfig;
use crate::coordination::protocol::{ElectionMessage, WorkerHealth, WorkerListResponse};
use crate::coordination::types::{
    CoordinationError, CoordinationResult, ElectionCandidate, InstanceId,
};

/// Per-message timeout for election traffic.
const ELECTION_MESSAGE_TIMEOUT: Duration = Duration::from_secs(3);

/// Per-port probe timeout during the discovery scan.
const SCAN_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Ports probed concurrently per scan batch. The bound keeps the scan from
/// throttling itself on loopback.
const SCAN_BATCH_SIZE: usize = 10;

/// Pause between scan batches.
const SCAN_BATCH_DELAY: Duration = Duration::from_millis(100);

/// Election state machine phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionPhase {
    /// No election running
    Idle,
    /// Finding surviving workers
    Discovering,
    /// Fetching candidate self-descriptions
    CollectingCandidates,
    /// Winner decided
    Decided,
    /// Notifying losing candidates
    Broadcasting,
}

/// Result of a completed election
#[derive(Debug, Clone)]
pub enum ElectionOutcome {
    /// This instance is the new master
    Won {
        /// Number of candidates considered, including self
        candidates: usize,
    },
    /// Another instance won
    Lost {
        /// The winning candidate
        winner: ElectionCandidate,
    },
}

/// A worker found during discovery
#[derive(Debug, Clone)]
struct DiscoveredWorker {
    instance_id: InstanceId,
    port: u16,
}

/// Runs at most one election for this process.
pub struct ElectionCoordinator {
    config: CoordinationConfig,
    self_candidate: ElectionCandidate,
    self_port: u16,
    client: reqwest::Client,
    phase: RwLock<ElectionPhase>,
    in_progress: AtomicBool,
    cancel: CancellationToken,
}

impl ElectionCoordinator {
    /// Coordinator for the given instance.
    ///
    /// `self_candidate` is this instance's own entry in the candidate set;
    /// `self_port` is excluded from the discovery scan.
    pub fn new(
        config: CoordinationConfig,
        self_candidate: ElectionCandidate,
        self_port: u16,
    ) -> Self {
        Self {
            config,
            self_candidate,
            self_port,
            client: reqwest::Client::new(),
            phase: RwLock::new(ElectionPhase::Idle),
            in_progress: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Whether an election is currently running.
    pub fn is_election_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Current phase.
    pub fn phase(&self) -> ElectionPhase {
        *self.phase.read()
    }

    /// Abort the running election; candidate state is cleared and the
    /// in-progress flag reset by the aborted `run`.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Run one election to completion.
    ///
    /// # Errors
    ///
    /// - [`CoordinationError::ElectionInProgress`] if called re-entrantly.
    /// - [`CoordinationError::QuorumNotMet`] when too few candidates
    ///   responded for the decision to be binding.
    /// - [`CoordinationError::ElectionAborted`] after [`abort`](Self::abort).
    pub async fn run(&self) -> CoordinationResult<ElectionOutcome> {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            return Err(CoordinationError::ElectionInProgress);
        }

        let result = tokio::select! {
            result = self.run_inner() => result,
            _ = self.cancel.cancelled() => {
                Err(CoordinationError::ElectionAborted("aborted by caller".to_string()))
            }
        };

        *self.phase.write() = ElectionPhase::Idle;
        self.in_progress.store(false, Ordering::SeqCst);
        result
    }

    async fn run_inner(&self) -> CoordinationResult<ElectionOutcome> {
        *self.phase.write() = ElectionPhase::Discovering;
        let discovered = self.discover_workers().await;
        info!(count = discovered.len(), "election discovery complete");

        if discovered.is_empty() {
            // Alone in the fleet; a single-candidate election is trivially
            // quorate.
            *self.phase.write() = ElectionPhase::Decided;
            return Ok(ElectionOutcome::Won { candidates: 1 });
        }

        *self.phase.write() = ElectionPhase::CollectingCandidates;
        let collected = self.collect_candidates(&discovered).await;

        let total = discovered.len() + 1;
        let responses = collected.len() + 1;
        let required = total.div_ceil(2);
        if responses < required {
            warn!(responses, required, "election quorum not met");
            return Err(CoordinationError::QuorumNotMet {
                responses,
                required,
            });
        }

        *self.phase.write() = ElectionPhase::Decided;
        let mut winner = &self.self_candidate;
        for candidate in &collected {
            if candidate.beats(winner) {
                winner = candidate;
            }
        }
        let winner = winner.clone();
        let won = winner.instance_id == self.self_candidate.instance_id;
        info!(
            winner = %winner.instance_id,
            won,
            candidates = responses,
            "election decided"
        );

        *self.phase.write() = ElectionPhase::Broadcasting;
        self.broadcast_result(&discovered, &winner).await;

        if won {
            Ok(ElectionOutcome::Won {
                candidates: responses,
            })
        } else {
            Ok(ElectionOutcome::Lost { winner })
        }
    }

    /// Find surviving workers: ask the (possibly dying) master first, then
    /// fall back to scanning the worker port range.
    async fn discover_workers(&self) -> Vec<DiscoveredWorker> {
        let from_master = self.discover_via_master().await;
        if !from_master.is_empty() {
            return from_master;
        }
        self.discover_via_scan().await
    }

    async fn discover_via_master(&self) -> Vec<DiscoveredWorker> {
        let url = format!(
            "http://127.0.0.1:{}/coordination/workers",
            self.config.master_port
        );
        let response = self
            .client
            .get(&url)
            .timeout(ELECTION_MESSAGE_TIMEOUT)
            .send()
            .await;

        match response {
            Ok(response) => match response.json::<WorkerListResponse>().await {
                Ok(listing) => listing
                    .workers
                    .into_iter()
                    .filter(|worker| worker.instance_id != self.self_candidate.instance_id)
                    .map(|worker| DiscoveredWorker {
                        instance_id: worker.instance_id,
                        port: worker.port,
                    })
                    .collect(),
                Err(error) => {
                    debug!(%error, "master registry listing unparseable");
                    vec![]
                }
            },
            Err(error) => {
                debug!(%error, "master registry listing unavailable");
                vec![]
            }
        }
    }

    async fn discover_via_scan(&self) -> Vec<DiscoveredWorker> {
        let ports: Vec<u16> = (self.config.worker_port_start..=self.config.worker_port_end)
            .filter(|port| *port != self.self_port)
            .collect();
        let mut found = Vec::new();

        for (index, batch) in ports.chunks(SCAN_BATCH_SIZE).enumerate() {
            if index > 0 {
                tokio::time::sleep(SCAN_BATCH_DELAY).await;
            }
            let probes = batch.iter().map(|port| self.probe_worker(*port));
            for worker in futures::future::join_all(probes).await.into_iter().flatten() {
                found.push(worker);
            }
        }
        found
    }

    /// A port is a worker iff its `/health` reply carries a non-empty
    /// instance id.
    async fn probe_worker(&self, port: u16) -> Option<DiscoveredWorker> {
        let url = format!("http://127.0.0.1:{port}/health");
        let response = self
            .client
            .get(&url)
            .timeout(SCAN_PROBE_TIMEOUT)
            .send()
            .await
            .ok()?;
        let health = response.json::<WorkerHealth>().await.ok()?;
        if health.instance_id.is_empty()
            || health.instance_id == self.self_candidate.instance_id
        {
            return None;
        }
        Some(DiscoveredWorker {
            instance_id: health.instance_id,
            port,
        })
    }

    /// Fetch candidate self-descriptions, bounded overall by the election
    /// timeout; whatever arrived by the deadline is used.
    async fn collect_candidates(&self, discovered: &[DiscoveredWorker]) -> Vec<ElectionCandidate> {
        let deadline = tokio::time::Instant::now() + self.config.election_timeout();
        let mut fetches: FuturesUnordered<_> = discovered
            .iter()
            .map(|worker| self.fetch_candidate(worker))
            .collect();

        let mut collected = Vec::new();
        loop {
            tokio::select! {
                next = fetches.next() => match next {
                    Some(Some(candidate)) => collected.push(candidate),
                    Some(None) => {}
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        collected = collected.len(),
                        pending = fetches.len(),
                        "election timeout, evaluating with responses received"
                    );
                    break;
                }
            }
        }
        collected
    }

    async fn fetch_candidate(&self, worker: &DiscoveredWorker) -> Option<ElectionCandidate> {
        let url = format!("http://127.0.0.1:{}/election/candidate", worker.port);
        let response = self
            .client
            .get(&url)
            .timeout(ELECTION_MESSAGE_TIMEOUT)
            .send()
            .await;
        match response {
            Ok(response) => match response.json::<ElectionCandidate>().await {
                Ok(candidate) => Some(candidate),
                Err(error) => {
                    debug!(worker = %worker.instance_id, %error, "candidate reply unparseable");
                    None
                }
            },
            Err(error) => {
                debug!(worker = %worker.instance_id, %error, "candidate unreachable");
                None
            }
        }
    }

    /// Send MASTER_ELECTED to every discovered candidate except the winner.
    /// Failures are logged and ignored; losers also discover the new master
    /// through their own health loop.
    async fn broadcast_result(&self, discovered: &[DiscoveredWorker], winner: &ElectionCandidate) {
        let message = ElectionMessage::master_elected(
            self.self_candidate.instance_id.clone(),
            &winner.instance_id,
        );

        let sends = discovered
            .iter()
            .filter(|worker| worker.instance_id != winner.instance_id)
            .map(|worker| {
                let message = message.clone();
                async move {
                    let url = format!("http://127.0.0.1:{}/election/message", worker.port);
                    if let Err(error) = self
                        .client
                        .post(&url)
                        .timeout(ELECTION_MESSAGE_TIMEOUT)
                        .json(&message)
                        .send()
                        .await
                    {
                        debug!(worker = %worker.instance_id, %error, "result broadcast failed");
                    }
                }
            });
        futures::future::join_all(sends).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::types::{WorkerRecord, WorkerStatus};
    use chrono::Utc;
    use std::collections::BTreeSet;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn candidate(id: &str, score: f64) -> ElectionCandidate {
        ElectionCandidate {
            instance_id: id.to_string(),
            workspace_score: score,
            uptime_ms: 1000,
            resource_usage: 10.0,
            capabilities: BTreeSet::new(),
            last_seen: Utc::now(),
            worker_info: None,
        }
    }

    fn record(id: &str, port: u16) -> WorkerRecord {
        WorkerRecord {
            instance_id: id.to_string(),
            workspace_name: format!("ws-{id}"),
            workspace_path: format!("/tmp/{id}"),
            port,
            capabilities: BTreeSet::new(),
            status: WorkerStatus::Idle,
            registered_at: Utc::now(),
            last_seen: Utc::now(),
            version: "0.1.0".to_string(),
        }
    }

    /// Config pointing master discovery at `master_port` with an empty
    /// scan range (scan covers only `self_port`).
    fn config_with(master_port: u16, self_port: u16) -> CoordinationConfig {
        CoordinationConfig {
            master_port,
            worker_port_start: self_port,
            worker_port_end: self_port,
            election_timeout_secs: 2,
            ..CoordinationConfig::default()
        }
    }

    async fn mount_worker_listing(server: &MockServer, workers: Vec<WorkerRecord>) {
        Mock::given(method("GET"))
            .and(path("/coordination/workers"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(WorkerListResponse { workers }),
            )
            .mount(server)
            .await;
    }

    async fn mount_candidate(server: &MockServer, candidate: &ElectionCandidate) {
        Mock::given(method("GET"))
            .and(path("/election/candidate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(candidate))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_lone_candidate_wins() {
        // Dead master port, empty scan range: nobody else is out there.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = listener.local_addr().unwrap().port();
        drop(listener);

        let coordinator = ElectionCoordinator::new(
            config_with(dead_port, 1),
            candidate("self", 1.0),
            1,
        );
        let outcome = coordinator.run().await.unwrap();
        assert!(matches!(outcome, ElectionOutcome::Won { candidates: 1 }));
        assert!(!coordinator.is_election_in_progress());
        assert_eq!(coordinator.phase(), ElectionPhase::Idle);
    }

    #[tokio::test]
    async fn test_strongest_candidate_wins_and_losers_are_notified() {
        let master = MockServer::start().await;
        let peer = MockServer::start().await;

        mount_worker_listing(&master, vec![record("peer", peer.address().port())]).await;
        mount_candidate(&peer, &candidate("peer", 1.0)).await;
        // The losing peer must receive the result broadcast.
        Mock::given(method("POST"))
            .and(path("/election/message"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": true})),
            )
            .expect(1)
            .mount(&peer)
            .await;

        let coordinator = ElectionCoordinator::new(
            config_with(master.address().port(), 1),
            candidate("self", 50.0),
            1,
        );
        let outcome = coordinator.run().await.unwrap();
        assert!(matches!(outcome, ElectionOutcome::Won { candidates: 2 }));
    }

    #[tokio::test]
    async fn test_losing_initiator_reports_winner() {
        let master = MockServer::start().await;
        let peer = MockServer::start().await;

        mount_worker_listing(&master, vec![record("peer", peer.address().port())]).await;
        mount_candidate(&peer, &candidate("peer", 99.0)).await;

        let coordinator = ElectionCoordinator::new(
            config_with(master.address().port(), 1),
            candidate("self", 1.0),
            1,
        );
        match coordinator.run().await.unwrap() {
            ElectionOutcome::Lost { winner } => assert_eq!(winner.instance_id, "peer"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_quorum_failure_aborts() {
        let master = MockServer::start().await;
        // Three discovered workers, none responding to candidate fetches:
        // 1 of 4 responses < ceil(4/2).
        mount_worker_listing(
            &master,
            vec![record("a", 1), record("b", 2), record("c", 3)],
        )
        .await;

        let config = CoordinationConfig {
            master_port: master.address().port(),
            worker_port_start: 4,
            worker_port_end: 4,
            election_timeout_secs: 1,
            ..CoordinationConfig::default()
        };
        let coordinator = ElectionCoordinator::new(config, candidate("self", 1.0), 4);
        let result = coordinator.run().await;
        assert!(matches!(
            result,
            Err(CoordinationError::QuorumNotMet { responses: 1, required: 2 })
        ));
    }

    #[tokio::test]
    async fn test_discovery_falls_back_to_port_scan() {
        let peer = MockServer::start().await;
        let peer_port = peer.address().port();
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(WorkerHealth {
                status: "healthy".to_string(),
                instance_id: "peer".to_string(),
                workspace_name: "ws-peer".to_string(),
                capabilities: BTreeSet::new(),
            }))
            .mount(&peer)
            .await;
        mount_candidate(&peer, &candidate("peer", 99.0)).await;

        // Master unreachable; the scan range covers exactly the peer port.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = CoordinationConfig {
            master_port: dead_port,
            worker_port_start: peer_port,
            worker_port_end: peer_port,
            election_timeout_secs: 2,
            ..CoordinationConfig::default()
        };
        let coordinator = ElectionCoordinator::new(config, candidate("self", 1.0), 1);
        match coordinator.run().await.unwrap() {
            ElectionOutcome::Lost { winner } => assert_eq!(winner.instance_id, "peer"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_second_start_is_rejected_while_running() {
        let master = MockServer::start().await;
        let peer = MockServer::start().await;
        mount_worker_listing(&master, vec![record("peer", peer.address().port())]).await;
        Mock::given(method("GET"))
            .and(path("/election/candidate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(candidate("peer", 1.0))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&peer)
            .await;

        let coordinator = std::sync::Arc::new(ElectionCoordinator::new(
            config_with(master.address().port(), 1),
            candidate("self", 50.0),
            1,
        ));

        let running = coordinator.clone();
        let first = tokio::spawn(async move { running.run().await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(coordinator.is_election_in_progress());
        assert!(matches!(
            coordinator.run().await,
            Err(CoordinationError::ElectionInProgress)
        ));

        let outcome = first.await.unwrap().unwrap();
        assert!(matches!(outcome, ElectionOutcome::Won { .. }));
    }

    #[tokio::test]
    async fn test_abort_clears_election_state() {
        let master = MockServer::start().await;
        let peer = MockServer::start().await;
        mount_worker_listing(&master, vec![record("peer", peer.address().port())]).await;
        Mock::given(method("GET"))
            .and(path("/election/candidate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(candidate("peer", 1.0))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&peer)
            .await;

        let coordinator = std::sync::Arc::new(ElectionCoordinator::new(
            config_with(master.address().port(), 1),
            candidate("self", 50.0),
            1,
        ));

        let running = coordinator.clone();
        let handle = tokio::spawn(async move { running.run().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        coordinator.abort();

        let result = handle.await.unwrap();
        assert!(matches!(
            result,
            Err(CoordinationError::ElectionAborted(_))
        ));
        assert!(!coordinator.is_election_in_progress());
        assert_eq!(coordinator.phase(), ElectionPhase::Idle);
    }
}
