#![allow(clippy::result_large_err)]
//! # vmgov core
//!
//! Transaction pipeline for governed VM changes.
//!
//! ## Architecture
//!
//! - **Governance**: immutable request events, approval tickets, the
//!   auto-approval policy and the transactional enqueuer that writes
//!   event, ticket and job in one commit
//! - **Jobs**: leased, retryable jobs executed by a bounded dispatcher with
//!   per-aggregate serialization
//! - **Store**: the durable store boundary, backed by PostgreSQL or memory
//! - **Provider**: the closed set of VM operations and the cluster API adapter
//! - **Telemetry**: structured logging, OTLP traces and Prometheus metrics

pub mod config;
pub mod error;
pub mod governance;
pub mod jobs;
pub mod provider;
pub mod store;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, GovernanceError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, ErrorContext, GovernanceError, Result};
    pub use crate::governance::{
        ApprovalTicket, ApproveRequest, Event, EventId, EventStatus, EventType, Requester,
        RuleBasedApprovalPolicy, SubmitRequest, Submission, TicketId, TicketStatus,
        TransactionalEnqueuer,
    };
    pub use crate::jobs::{
        Job, JobDispatcher, JobId, JobPriority, JobState, RetentionSweeper, RetryPolicy,
    };
    pub use crate::provider::{HttpProvider, Provider, ProviderResult, ResultStatus, Target, VmOperation};
    pub use crate::store::{InMemoryStore, PgStore, Store};
}
