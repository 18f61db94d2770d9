//! Request bookkeeping: events, approval tickets, policy and the
//! transactional enqueuer that ties them together.

pub mod enqueuer;
pub mod event;
pub mod policy;
pub mod spec;
pub mod ticket;

pub use enqueuer::{
    ApproveRequest, JobCancellation, Submission, SubmissionDraft, SubmitRequest, TicketDecision,
    TransactionalEnqueuer,
};
pub use event::{Event, EventId, EventStatus, EventType};
pub use policy::{
    ApprovalDecision, ApprovalPolicy, ApprovalPolicyConfig, PolicyInput, Requester,
    RuleBasedApprovalPolicy, TargetContext,
};
pub use spec::{get_effective_spec, ResolvedSpec};
pub use ticket::{ApprovalTicket, TicketId, TicketStatus, AUTO_APPROVAL_ACTOR};
