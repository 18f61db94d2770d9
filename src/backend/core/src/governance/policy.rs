//! Auto-approval policy.
//!
//! The policy answers one question before any transaction opens:
//! "Can this requester's change go straight to execution, or does a human
//! have to look at it first?"
//!
//! Evaluation is pure. It reads nothing but its input and its rules, so the
//! same input always produces the same decision.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

use crate::error::{GovernanceError, Result};
use crate::provider::VmOperation;

// ═══════════════════════════════════════════════════════════════════════════════
// Input
// ═══════════════════════════════════════════════════════════════════════════════

/// Who is asking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Requester {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            roles: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }
}

/// What the change is aimed at.
#[derive(Debug, Clone, Copy)]
pub struct TargetContext<'a> {
    pub aggregate_type: &'a str,
    pub aggregate_id: &'a str,
    /// Requested parameters; must be a JSON object
    pub spec: &'a Value,
}

impl TargetContext<'_> {
    /// The `cluster` field of the requested spec, if any.
    pub fn cluster(&self) -> Option<&str> {
        self.spec.get("cluster").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PolicyInput<'a> {
    pub requester: &'a Requester,
    pub operation: VmOperation,
    pub target: TargetContext<'a>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Decision
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    AutoApprove,
    RequireApproval { reasons: Vec<String> },
}

impl ApprovalDecision {
    pub fn requires_approval(&self) -> bool {
        matches!(self, Self::RequireApproval { .. })
    }
}

/// Decides whether a request needs a human.
pub trait ApprovalPolicy: Send + Sync {
    /// Fails only with `PolicyInputInvalid`.
    fn evaluate(&self, input: &PolicyInput<'_>) -> Result<ApprovalDecision>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rule-based policy
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalPolicyConfig {
    /// Roles whose requests are always auto-approved
    #[serde(default = "default_auto_approve_roles")]
    pub auto_approve_roles: Vec<String>,

    /// Operations eligible for auto-approval
    #[serde(default = "default_auto_approve_operations")]
    pub auto_approve_operations: Vec<VmOperation>,

    /// Requests above this many vCPUs need approval
    #[serde(default = "default_max_auto_cpu")]
    pub max_auto_cpu: u64,

    /// Requests above this much memory need approval
    #[serde(default = "default_max_auto_memory_mb")]
    pub max_auto_memory_mb: u64,

    /// Clusters where every change needs approval
    #[serde(default)]
    pub protected_clusters: Vec<String>,
}

fn default_auto_approve_roles() -> Vec<String> {
    vec!["admin".to_string()]
}

fn default_auto_approve_operations() -> Vec<VmOperation> {
    vec![
        VmOperation::Create,
        VmOperation::PowerOn,
        VmOperation::PowerOff,
        VmOperation::Restart,
        VmOperation::Reconfigure,
    ]
}

fn default_max_auto_cpu() -> u64 {
    8
}

fn default_max_auto_memory_mb() -> u64 {
    16_384
}

impl Default for ApprovalPolicyConfig {
    fn default() -> Self {
        Self {
            auto_approve_roles: default_auto_approve_roles(),
            auto_approve_operations: default_auto_approve_operations(),
            max_auto_cpu: default_max_auto_cpu(),
            max_auto_memory_mb: default_max_auto_memory_mb(),
            protected_clusters: Vec::new(),
        }
    }
}

/// Rule-based [`ApprovalPolicy`] built from [`ApprovalPolicyConfig`].
#[derive(Debug, Clone)]
pub struct RuleBasedApprovalPolicy {
    auto_approve_roles: HashSet<String>,
    auto_approve_operations: HashSet<VmOperation>,
    max_auto_cpu: u64,
    max_auto_memory_mb: u64,
    protected_clusters: HashSet<String>,
}

impl RuleBasedApprovalPolicy {
    pub fn new(config: &ApprovalPolicyConfig) -> Self {
        Self {
            auto_approve_roles: config.auto_approve_roles.iter().cloned().collect(),
            auto_approve_operations: config.auto_approve_operations.iter().copied().collect(),
            max_auto_cpu: config.max_auto_cpu,
            max_auto_memory_mb: config.max_auto_memory_mb,
            protected_clusters: config.protected_clusters.iter().cloned().collect(),
        }
    }

    /// A policy that sends everything to a human.
    pub fn always_require_approval() -> Self {
        Self {
            auto_approve_roles: HashSet::new(),
            auto_approve_operations: HashSet::new(),
            max_auto_cpu: 0,
            max_auto_memory_mb: 0,
            protected_clusters: HashSet::new(),
        }
    }

    fn validate(input: &PolicyInput<'_>) -> Result<()> {
        if input.requester.user_id.trim().is_empty() {
            return Err(GovernanceError::policy_input_invalid("requester id is empty"));
        }
        if input.target.aggregate_id.trim().is_empty() {
            return Err(GovernanceError::policy_input_invalid("aggregate id is empty"));
        }
        if !input.target.spec.is_object() {
            return Err(GovernanceError::policy_input_invalid("spec must be a JSON object"));
        }
        for field in ["cpu", "memory_mb"] {
            resource(input.target.spec, field)?;
        }
        Ok(())
    }
}

/// Reads a positive integer resource field; absent means "not requested".
fn resource(spec: &Value, field: &str) -> Result<Option<u64>> {
    match spec.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => match value.as_u64() {
            Some(n) if n > 0 => Ok(Some(n)),
            _ => Err(GovernanceError::policy_input_invalid(format!(
                "{} must be a positive integer, got {}",
                field, value
            ))),
        },
    }
}

impl ApprovalPolicy for RuleBasedApprovalPolicy {
    fn evaluate(&self, input: &PolicyInput<'_>) -> Result<ApprovalDecision> {
        Self::validate(input)?;

        if input
            .requester
            .roles
            .iter()
            .any(|role| self.auto_approve_roles.contains(role))
        {
            debug!(user_id = %input.requester.user_id, operation = %input.operation, "Auto-approved by role");
            return Ok(ApprovalDecision::AutoApprove);
        }

        let mut reasons = Vec::new();

        if input.operation.is_destructive() {
            reasons.push(format!("{} always requires approval", input.operation));
        } else if !self.auto_approve_operations.contains(&input.operation) {
            reasons.push(format!("{} is not eligible for auto-approval", input.operation));
        }

        if let Some(cluster) = input.target.cluster() {
            if self.protected_clusters.contains(cluster) {
                reasons.push(format!("cluster {} is protected", cluster));
            }
        }

        if let Some(cpu) = resource(input.target.spec, "cpu")? {
            if cpu > self.max_auto_cpu {
                reasons.push(format!("cpu {} exceeds auto-approval limit {}", cpu, self.max_auto_cpu));
            }
        }

        if let Some(memory) = resource(input.target.spec, "memory_mb")? {
            if memory > self.max_auto_memory_mb {
                reasons.push(format!(
                    "memory_mb {} exceeds auto-approval limit {}",
                    memory, self.max_auto_memory_mb
                ));
            }
        }

        if reasons.is_empty() {
            Ok(ApprovalDecision::AutoApprove)
        } else {
            Ok(ApprovalDecision::RequireApproval { reasons })
        }
    }
}
