// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Master-side worker registry.
//!
//! The registry and the workspace routing index live behind one lock so
//! that every observable state satisfies: each routing value names a
//! registered worker, and reaping a worker removes its routing entries in
//! the same step.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::coordination::types::{InstanceId, WorkerRecord, WorkerStatus};

#[derive(Debug, Default)]
struct RegistryInner {
    workers: HashMap<InstanceId, WorkerRecord>,
    /// workspace_path -> instance_id
    workspace_routing: HashMap<String, InstanceId>,
}

impl RegistryInner {
    fn remove_worker(&mut self, id: &str) -> Option<WorkerRecord> {
        let removed = self.workers.remove(id);
        if removed.is_some() {
            self.workspace_routing.retain(|_, routed| routed != id);
        }
        removed
    }
}

/// Registry of workers registered with this master.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    inner: RwLock<RegistryInner>,
}

impl WorkerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record for `record.instance_id` and index its
    /// workspace path.
    ///
    /// Port reachability is the caller's responsibility; the registry only
    /// stores records whose port was already verified.
    pub fn register(&self, record: WorkerRecord) {
        let mut inner = self.inner.write();
        let id = record.instance_id.clone();
        // A re-registration may carry a new workspace; drop stale routes first.
        inner.remove_worker(&id);
        inner
            .workspace_routing
            .insert(record.workspace_path.clone(), id.clone());
        inner.workers.insert(id.clone(), record);
        debug!(instance_id = %id, "worker registered");
    }

    /// Remove a worker and its routing entries. Idempotent.
    pub fn deregister(&self, id: &str) -> Option<WorkerRecord> {
        let removed = self.inner.write().remove_worker(id);
        if removed.is_some() {
            debug!(instance_id = %id, "worker deregistered");
        }
        removed
    }

    /// Apply a heartbeat. Returns false when the id is unknown, in which
    /// case the worker must re-register.
    ///
    /// `last_seen` never moves backwards, even if heartbeats arrive with
    /// skewed timestamps.
    pub fn heartbeat(&self, id: &str, status: WorkerStatus, timestamp: DateTime<Utc>) -> bool {
        let mut inner = self.inner.write();
        match inner.workers.get_mut(id) {
            Some(record) => {
                record.status = status;
                let seen = timestamp.max(Utc::now());
                if seen > record.last_seen {
                    record.last_seen = seen;
                }
                true
            }
            None => false,
        }
    }

    /// Remove every record that has missed three heartbeat intervals,
    /// together with its routing entries. Returns the reaped records.
    pub fn reap_expired(&self, heartbeat_interval: Duration) -> Vec<WorkerRecord> {
        let mut inner = self.inner.write();
        let expired: Vec<InstanceId> = inner
            .workers
            .values()
            .filter(|record| record.is_expired(heartbeat_interval))
            .map(|record| record.instance_id.clone())
            .collect();

        let mut reaped = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(record) = inner.remove_worker(&id) {
                info!(instance_id = %id, "reaped expired worker");
                reaped.push(record);
            }
        }
        reaped
    }

    /// Snapshot of one record.
    pub fn get(&self, id: &str) -> Option<WorkerRecord> {
        self.inner.read().workers.get(id).cloned()
    }

    /// Snapshot of all records.
    pub fn list(&self) -> Vec<WorkerRecord> {
        self.inner.read().workers.values().cloned().collect()
    }

    /// Number of registered workers.
    pub fn len(&self) -> usize {
        self.inner.read().workers.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().workers.is_empty()
    }

    /// Worker that matches a workspace by name or path, exactly.
    pub fn worker_for_workspace(&self, workspace: &str) -> Option<WorkerRecord> {
        let inner = self.inner.read();
        if let Some(id) = inner.workspace_routing.get(workspace) {
            if let Some(record) = inner.workers.get(id) {
                return Some(record.clone());
            }
        }
        inner
            .workers
            .values()
            .find(|record| record.workspace_name == workspace)
            .cloned()
    }

    /// Worker whose workspace path is the longest prefix of `path`.
    pub fn worker_for_path(&self, path: &str) -> Option<WorkerRecord> {
        let inner = self.inner.read();
        inner
            .workspace_routing
            .iter()
            .filter(|(workspace_path, _)| path.starts_with(workspace_path.as_str()))
            .max_by_key(|(workspace_path, _)| workspace_path.len())
            .and_then(|(_, id)| inner.workers.get(id))
            .cloned()
    }

    /// Most-recently-active worker: `active` status first, then latest
    /// `last_seen`.
    pub fn most_recently_active(&self) -> Option<WorkerRecord> {
        let inner = self.inner.read();
        inner
            .workers
            .values()
            .max_by_key(|record| (record.status == WorkerStatus::Active, record.last_seen))
            .cloned()
    }

    /// Any registered worker.
    pub fn any_worker(&self) -> Option<WorkerRecord> {
        self.inner.read().workers.values().next().cloned()
    }

    /// Check that every routing value names a registered worker.
    /// Exposed for tests; production paths keep this true by construction.
    pub fn routing_is_consistent(&self) -> bool {
        let inner = self.inner.read();
        inner
            .workspace_routing
            .values()
            .all(|id| inner.workers.contains_key(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::collections::BTreeSet;

    fn record(id: &str, path: &str, port: u16) -> WorkerRecord {
        WorkerRecord {
            instance_id: id.to_string(),
            workspace_name: format!("ws-{id}"),
            workspace_path: path.to_string(),
            port,
            capabilities: BTreeSet::from(["get_diagnostics".to_string()]),
            status: WorkerStatus::Idle,
            registered_at: Utc::now(),
            last_seen: Utc::now(),
            version: "0.1.0".to_string(),
        }
    }

    #[test]
    fn test_register_deregister_roundtrip() {
        let registry = WorkerRegistry::new();
        assert!(registry.is_empty());

        registry.register(record("w1", "/home/dev/app", 9101));
        assert_eq!(registry.len(), 1);
        assert!(registry.routing_is_consistent());

        registry.deregister("w1");
        assert!(registry.is_empty());
        assert!(registry.worker_for_path("/home/dev/app/src").is_none());
        assert!(registry.routing_is_consistent());

        // Deregistering again is a no-op.
        assert!(registry.deregister("w1").is_none());
    }

    #[test]
    fn test_reregistration_replaces_record_and_routes() {
        let registry = WorkerRegistry::new();
        registry.register(record("w1", "/home/dev/old", 9101));
        registry.register(record("w1", "/home/dev/new", 9102));

        assert_eq!(registry.len(), 1);
        assert!(registry.worker_for_path("/home/dev/old/src").is_none());
        let found = registry.worker_for_path("/home/dev/new/src").unwrap();
        assert_eq!(found.port, 9102);
        assert!(registry.routing_is_consistent());
    }

    #[test]
    fn test_heartbeat_updates_only_liveness() {
        let registry = WorkerRegistry::new();
        registry.register(record("w1", "/home/dev/app", 9101));
        let before = registry.get("w1").unwrap();

        assert!(registry.heartbeat("w1", WorkerStatus::Active, Utc::now()));
        assert!(registry.heartbeat("w1", WorkerStatus::Active, Utc::now()));

        let after = registry.get("w1").unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(after.status, WorkerStatus::Active);
        assert_eq!(after.workspace_path, before.workspace_path);
        assert!(after.last_seen >= before.last_seen);
    }

    #[test]
    fn test_heartbeat_last_seen_is_monotonic() {
        let registry = WorkerRegistry::new();
        registry.register(record("w1", "/home/dev/app", 9101));
        assert!(registry.heartbeat("w1", WorkerStatus::Active, Utc::now()));
        let seen = registry.get("w1").unwrap().last_seen;

        // A skewed, ancient timestamp must not move last_seen backwards.
        let ancient = Utc::now() - ChronoDuration::hours(1);
        assert!(registry.heartbeat("w1", WorkerStatus::Idle, ancient));
        assert!(registry.get("w1").unwrap().last_seen >= seen);
    }

    #[test]
    fn test_unknown_heartbeat_reports_reregister() {
        let registry = WorkerRegistry::new();
        assert!(!registry.heartbeat("ghost", WorkerStatus::Idle, Utc::now()));
    }

    #[test]
    fn test_reap_removes_registry_and_routes_atomically() {
        let registry = WorkerRegistry::new();
        let mut stale = record("w1", "/home/dev/app", 9101);
        stale.last_seen = Utc::now() - ChronoDuration::seconds(60);
        registry.register(stale);
        registry.register(record("w2", "/home/dev/other", 9102));

        // Refresh w2 so only w1 is expired.
        assert!(registry.heartbeat("w2", WorkerStatus::Idle, Utc::now()));

        let reaped = registry.reap_expired(Duration::from_secs(5));
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].instance_id, "w1");
        assert!(registry.get("w1").is_none());
        assert!(registry.worker_for_path("/home/dev/app/file").is_none());
        assert!(registry.get("w2").is_some());
        assert!(registry.routing_is_consistent());
    }

    #[test]
    fn test_longest_prefix_wins() {
        let registry = WorkerRegistry::new();
        registry.register(record("outer", "/home/dev", 9101));
        registry.register(record("inner", "/home/dev/app", 9102));

        let found = registry.worker_for_path("/home/dev/app/src/main.rs").unwrap();
        assert_eq!(found.instance_id, "inner");

        let found = registry.worker_for_path("/home/dev/readme.md").unwrap();
        assert_eq!(found.instance_id, "outer");
    }

    #[test]
    fn test_most_recently_active_prefers_active_status() {
        let registry = WorkerRegistry::new();
        registry.register(record("idle", "/a", 9101));
        registry.register(record("active", "/b", 9102));

        assert!(registry.heartbeat("active", WorkerStatus::Active, Utc::now()));
        // The idle worker heartbeats later, but active status wins.
        assert!(registry.heartbeat("idle", WorkerStatus::Idle, Utc::now()));

        let found = registry.most_recently_active().unwrap();
        assert_eq!(found.instance_id, "active");
    }

    #[test]
    fn test_worker_for_workspace_matches_name_and_path() {
        let registry = WorkerRegistry::new();
        registry.register(record("w1", "/home/dev/app", 9101));

        assert_eq!(
            registry.worker_for_workspace("/home/dev/app").unwrap().instance_id,
            "w1"
        );
        assert_eq!(
            registry.worker_for_workspace("ws-w1").unwrap().instance_id,
            "w1"
        );
        assert!(registry.worker_for_workspace("elsewhere").is_none());
    }
}
