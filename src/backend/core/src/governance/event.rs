//! Event log records.
//!
//! An event is the immutable record of one requested change (or, for
//! `*_completed` / `*_failed` types, of its outcome). Only the status and the
//! archive marker ever change after insert; the payload is write-once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{GovernanceError, Result};
use crate::provider::VmOperation;

// ═══════════════════════════════════════════════════════════════════════════════
// Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for an event, generated server-side at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for EventId {
    type Err = GovernanceError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| GovernanceError::validation(format!("invalid event id: {}", s)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Event Type
// ═══════════════════════════════════════════════════════════════════════════════

/// `vm_<operation>_requested`, `vm_<operation>_completed` or `vm_<operation>_failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Requested(VmOperation),
    Completed(VmOperation),
    Failed(VmOperation),
}

impl EventType {
    pub fn operation(&self) -> VmOperation {
        match self {
            Self::Requested(op) | Self::Completed(op) | Self::Failed(op) => *op,
        }
    }

    /// Outcome type for a successful execution of this request.
    pub fn completed(&self) -> Self {
        Self::Completed(self.operation())
    }

    /// Outcome type for a failed execution of this request.
    pub fn failed(&self) -> Self {
        Self::Failed(self.operation())
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (op, suffix) = match self {
            Self::Requested(op) => (op, "requested"),
            Self::Completed(op) => (op, "completed"),
            Self::Failed(op) => (op, "failed"),
        };
        write!(f, "vm_{}_{}", op, suffix)
    }
}

impl FromStr for EventType {
    type Err = GovernanceError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || GovernanceError::validation(format!("unknown event type: {}", s));
        let rest = s.strip_prefix("vm_").ok_or_else(invalid)?;

        let (op, ctor): (&str, fn(VmOperation) -> EventType) =
            if let Some(op) = rest.strip_suffix("_requested") {
                (op, EventType::Requested)
            } else if let Some(op) = rest.strip_suffix("_completed") {
                (op, EventType::Completed)
            } else if let Some(op) = rest.strip_suffix("_failed") {
                (op, EventType::Failed)
            } else {
                return Err(invalid());
            };

        op.parse::<VmOperation>().map(ctor).map_err(|_| invalid())
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Event Status
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Awaiting approval
    Pending,
    /// Approved; a job exists
    Processing,
    Completed,
    Failed,
    /// Rejected, cancelled before approval, or job cancelled
    Cancelled,
}

impl EventStatus {
    pub const ALL: [EventStatus; 5] = [
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: EventStatus) -> bool {
        use EventStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = GovernanceError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| GovernanceError::validation(format!("unknown event status: {}", s)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Event
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub event_type: EventType,
    pub aggregate_type: String,
    /// May be a temporary identifier until the provider names the resource
    pub aggregate_id: String,
    pub(crate) payload: Vec<u8>,
    pub status: EventStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
    /// Set on outcome events; points at the request they resolve
    pub parent_event_id: Option<EventId>,
}

impl Event {
    /// A new request event.
    pub fn request(
        operation: VmOperation,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: Vec<u8>,
        created_by: impl Into<String>,
        status: EventStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EventId::new(),
            event_type: EventType::Requested(operation),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            payload,
            status,
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
            archived_at: None,
            parent_event_id: None,
        }
    }

    /// The outcome event appended when `request` resolves.
    pub fn outcome(
        request: &Event,
        succeeded: bool,
        payload: Vec<u8>,
        created_by: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let (event_type, status) = if succeeded {
            (request.event_type.completed(), EventStatus::Completed)
        } else {
            (request.event_type.failed(), EventStatus::Failed)
        };

        Self {
            id: EventId::new(),
            event_type,
            aggregate_type: request.aggregate_type.clone(),
            aggregate_id: request.aggregate_id.clone(),
            payload,
            status,
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
            archived_at: None,
            parent_event_id: Some(request.id),
        }
    }

    /// The original requested parameters, exactly as submitted.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn operation(&self) -> VmOperation {
        self.event_type.operation()
    }

    pub fn transition_to(&mut self, next: EventStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(GovernanceError::invalid_state_transition(
                "event",
                self.status,
                next,
            )
            .with_context("event_id", self.id.to_string()));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Soft-archive a terminal event. Returns false when already archived.
    pub fn archive(&mut self, now: DateTime<Utc>) -> Result<bool> {
        if !self.status.is_terminal() {
            return Err(GovernanceError::validation(format!(
                "event {} is {} and cannot be archived",
                self.id, self.status
            )));
        }
        if self.archived_at.is_some() {
            return Ok(false);
        }
        self.archived_at = Some(now);
        Ok(true)
    }
}
