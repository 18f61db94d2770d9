//! Approval tickets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{GovernanceError, Result};
use crate::governance::event::EventId;

/// Actor recorded on tickets approved by policy.
pub const AUTO_APPROVAL_ACTOR: &str = "system:auto-approval";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(pub Uuid);

impl TicketId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TicketId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for TicketId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for TicketId {
    type Err = GovernanceError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| GovernanceError::validation(format!("invalid ticket id: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    PendingApproval,
    Approved,
    Rejected,
    Cancelled,
}

impl TicketStatus {
    pub const ALL: [TicketStatus; 4] = [
        Self::PendingApproval,
        Self::Approved,
        Self::Rejected,
        Self::Cancelled,
    ];

    /// Every status but `pending_approval` is final for the ticket.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::PendingApproval)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = GovernanceError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| GovernanceError::validation(format!("unknown ticket status: {}", s)))
    }
}

/// Approval workflow state for exactly one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalTicket {
    pub id: TicketId,
    pub event_id: EventId,
    pub status: TicketStatus,
    /// Field-level overrides applied on top of the event payload
    pub modified_spec: Option<serde_json::Value>,
    pub request_reason: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decision_reason: Option<String>,
}

impl ApprovalTicket {
    /// A ticket waiting for a human decision.
    pub fn pending(
        event_id: EventId,
        created_by: impl Into<String>,
        request_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TicketId::new(),
            event_id,
            status: TicketStatus::PendingApproval,
            modified_spec: None,
            request_reason,
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
            decided_by: None,
            decided_at: None,
            decision_reason: None,
        }
    }

    /// A ticket approved by policy at submission time.
    pub fn auto_approved(
        event_id: EventId,
        created_by: impl Into<String>,
        request_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut ticket = Self::pending(event_id, created_by, request_reason, now);
        ticket.status = TicketStatus::Approved;
        ticket.decided_by = Some(AUTO_APPROVAL_ACTOR.to_string());
        ticket.decided_at = Some(now);
        ticket.decision_reason = Some("auto-approved by policy".to_string());
        ticket
    }

    fn decide(
        &mut self,
        next: TicketStatus,
        actor: &str,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.status != TicketStatus::PendingApproval {
            return Err(GovernanceError::invalid_ticket_state(
                self.id,
                self.status,
                TicketStatus::PendingApproval,
            ));
        }
        self.status = next;
        self.decided_by = Some(actor.to_string());
        self.decided_at = Some(now);
        self.decision_reason = reason;
        self.updated_at = now;
        Ok(())
    }

    /// `pending_approval → approved`, storing any modified spec.
    pub fn approve(
        &mut self,
        approver: &str,
        modified_spec: Option<serde_json::Value>,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.decide(TicketStatus::Approved, approver, comment, now)?;
        self.modified_spec = modified_spec.filter(|spec| !spec.is_null());
        Ok(())
    }

    pub fn reject(&mut self, actor: &str, reason: Option<String>, now: DateTime<Utc>) -> Result<()> {
        self.decide(TicketStatus::Rejected, actor, reason, now)
    }

    pub fn cancel(&mut self, actor: &str, reason: Option<String>, now: DateTime<Utc>) -> Result<()> {
        self.decide(TicketStatus::Cancelled, actor, reason, now)
    }
}
