//! Job execution.
//!
//! - **job**: the durable job record, its state machine and retry policy
//! - **worker_pool**: bounded slot pools with RAII permits
//! - **dispatcher**: leases jobs and runs them through the provider
//! - **reconcile**: writes execution outcomes back, reclaims expired leases
//! - **maintenance**: retention sweeper for terminal events
//!
//! ```text
//!   store ──lease──▶ dispatcher ──slot──▶ provider
//!     ▲                                      │
//!     └──────────── reconcile ◀──outcome─────┘
//! ```

pub mod dispatcher;
pub mod job;
pub mod maintenance;
pub mod reconcile;
pub mod worker_pool;

pub use dispatcher::{DispatcherHandle, DispatcherStats, JobDispatcher};
pub use job::{BackoffStrategy, Job, JobId, JobPriority, JobState, Lease, RetryPolicy};
pub use maintenance::RetentionSweeper;
pub use reconcile::{ExecutionOutcome, OutcomeReconciler, Reclaim, Resolution};
pub use worker_pool::{SlotPermit, WorkerPool, WorkerPoolConfig, WorkerPoolStats};
