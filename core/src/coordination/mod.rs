// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Multi-Instance Coordination
//!
//! This module federates concurrently-running editor instances on one host
//! behind a single inbound endpoint. One instance serves as master; the
//! others register with it as workers, each owning a workspace.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Master                               │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────┐  │
//! │  │ WorkerRegistry │  │     Router     │  │ Inbound (/mcp) │  │
//! │  │  - records     │  │  - workspace   │  │  - sessions    │  │
//! │  │  - routing idx │  │  - active ctx  │  │  - tool calls  │  │
//! │  │  - reaper      │  │  - aggregated  │  │                │  │
//! │  └────────────────┘  └────────────────┘  └────────────────┘  │
//! │           │                   │                              │
//! │           └───────────────────┴── loopback HTTP ─────────────┤
//! └──────────────┬───────────────────────────┬───────────────────┘
//!                │                           │
//!                ▼                           ▼
//!        ┌───────────────┐           ┌───────────────┐
//!        │   Worker 1    │           │   Worker N    │
//!        │  - tools      │    ...    │  - tools      │
//!        │  - heartbeat  │           │  - heartbeat  │
//!        │  - election   │           │  - election   │
//!        └───────────────┘           └───────────────┘
//! ```
//!
//! ## Lifecycle
//!
//! [`detect::RoleDetector`] decides the starting role from a probe of the
//! master port. [`supervisor::ModeSupervisor`] owns the running role and
//! performs transitions: a worker that wins an election becomes master, a
//! master that loses split-brain arbitration steps down to worker, and a
//! worker that cannot register falls back to standalone. Failure of the
//! master is detected by each worker's health loop and resolved by
//! [`election::ElectionCoordinator`] with a deterministic comparator and a
//! majority quorum.

pub mod detect;
pub mod election;
pub mod master;
pub mod ports;
pub mod probe;
pub mod protocol;
pub mod registry;
pub mod remote;
pub mod router;
pub mod supervisor;
pub mod types;
pub mod worker;

pub use detect::RoleDetector;
pub use election::{ElectionCoordinator, ElectionOutcome, ElectionPhase};
pub use master::{MasterCore, MasterContext};
pub use ports::PortProber;
pub use probe::{HealthProbe, HEALTHY_LATENCY};
pub use registry::WorkerRegistry;
pub use remote::RemoteExecutor;
pub use router::{RouteOutcome, Router};
pub use supervisor::{ModeSupervisor, RoleEvent, StandaloneCore};
pub use types::{
    CoordinationError, CoordinationResult, ElectionCandidate, InstanceId, MasterStatus, Role,
    WorkerRecord, WorkerStatus,
};
pub use worker::{WorkerCore, WorkerTuning};

/// Default master surface port.
pub const DEFAULT_MASTER_PORT: u16 = 9100;

/// Default first worker port.
pub const DEFAULT_WORKER_PORT_START: u16 = 9101;

/// Default last worker port.
pub const DEFAULT_WORKER_PORT_END: u16 = 9199;

/// Default worker heartbeat cadence (seconds).
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 5;

/// Default master health probe cadence (seconds).
pub const DEFAULT_MASTER_HEALTH_CHECK_INTERVAL: u64 = 3;
