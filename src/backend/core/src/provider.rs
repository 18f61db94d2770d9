//! Provider boundary.
//!
//! The provider performs the actual infrastructure mutation. The pipeline only
//! relies on its contract: a closed set of operations, a tri-state result and
//! calls that are safe to repeat after a transient failure.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::config::ProviderConfig;
use crate::error::{ErrorContext, GovernanceError, Result};
use crate::governance::event::EventId;
use crate::governance::spec::ResolvedSpec;

// ═══════════════════════════════════════════════════════════════════════════════
// Operations
// ═══════════════════════════════════════════════════════════════════════════════

/// The closed set of VM mutations the pipeline can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmOperation {
    Create,
    Delete,
    PowerOn,
    PowerOff,
    Restart,
    Reconfigure,
    Migrate,
}

impl VmOperation {
    pub const ALL: [VmOperation; 7] = [
        Self::Create,
        Self::Delete,
        Self::PowerOn,
        Self::PowerOff,
        Self::Restart,
        Self::Reconfigure,
        Self::Migrate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Delete => "delete",
            Self::PowerOn => "power_on",
            Self::PowerOff => "power_off",
            Self::Restart => "restart",
            Self::Reconfigure => "reconfigure",
            Self::Migrate => "migrate",
        }
    }

    /// Operations that destroy the target.
    pub fn is_destructive(&self) -> bool {
        matches!(self, Self::Delete)
    }
}

impl fmt::Display for VmOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmOperation {
    type Err = GovernanceError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| GovernanceError::validation(format!("unknown operation: {}", s)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Contract
// ═══════════════════════════════════════════════════════════════════════════════

/// What the provider acts on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub aggregate_type: String,
    pub aggregate_id: String,
    /// The request event; stable across retries so the provider can dedupe
    pub request_id: EventId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    TransientFailure,
    PermanentFailure,
}

/// Outcome of one provider invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResult {
    pub status: ResultStatus,
    pub observed_state: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl ProviderResult {
    pub fn success(observed_state: Option<serde_json::Value>) -> Self {
        Self {
            status: ResultStatus::Success,
            observed_state,
            error: None,
        }
    }

    pub fn transient(error: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::TransientFailure,
            observed_state: None,
            error: Some(error.into()),
        }
    }

    pub fn permanent(error: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::PermanentFailure,
            observed_state: None,
            error: Some(error.into()),
        }
    }
}

impl From<GovernanceError> for ProviderResult {
    fn from(error: GovernanceError) -> Self {
        if error.is_retryable() {
            Self::transient(error.to_string())
        } else {
            Self::permanent(error.to_string())
        }
    }
}

/// The external capability that mutates infrastructure.
///
/// Implementations must tolerate being called again for the same
/// `target.request_id` after a transient failure or a reclaimed lease.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(
        &self,
        operation: VmOperation,
        spec: &ResolvedSpec,
        target: &Target,
    ) -> ProviderResult;
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP cluster API adapter
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
struct MutationRequest<'a> {
    request_id: EventId,
    target: TargetRef<'a>,
    spec: &'a serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct TargetRef<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    id: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct OperationStatus {
    #[serde(default)]
    operation_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Talks to a cluster API over HTTP.
///
/// `POST {base}/v1/vms/{operation}`; a `202` carrying an `operation_id` is
/// followed by polling `GET {base}/v1/operations/{id}`. The caller bounds
/// the whole call with its own deadline.
pub struct HttpProvider {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
    poll_interval: Duration,
}

impl HttpProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
            poll_interval: config.status_poll_interval,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn submit(
        &self,
        operation: VmOperation,
        spec: &ResolvedSpec,
        target: &Target,
    ) -> std::result::Result<ProviderResult, reqwest::Error> {
        let url = format!("{}/v1/vms/{}", self.base_url, operation);
        let body = MutationRequest {
            request_id: target.request_id,
            target: TargetRef {
                kind: &target.aggregate_type,
                id: &target.aggregate_id,
            },
            spec: spec.fields(),
        };

        let response = self
            .authorize(self.client.post(&url))
            .header("Idempotency-Key", target.request_id.to_string())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Ok(failure_for(status, &text));
        }

        let observed: Option<serde_json::Value> = if text.trim().is_empty() {
            None
        } else {
            serde_json::from_str(&text).ok()
        };

        if status == StatusCode::ACCEPTED {
            let pending: OperationStatus = observed
                .clone()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            if let Some(operation_id) = pending.operation_id {
                debug!(%operation, operation_id = %operation_id, "Cluster API accepted operation, polling");
                return self.poll_operation(&operation_id).await;
            }
        }

        Ok(ProviderResult::success(observed))
    }

    async fn poll_operation(
        &self,
        operation_id: &str,
    ) -> std::result::Result<ProviderResult, reqwest::Error> {
        let url = format!("{}/v1/operations/{}", self.base_url, operation_id);

        loop {
            let response = self.authorize(self.client.get(&url)).send().await?;
            let status = response.status();
            let text = response.text().await?;
            if !status.is_success() {
                return Ok(failure_for(status, &text));
            }

            let op: OperationStatus = serde_json::from_str(&text).unwrap_or_default();
            match op.status.as_deref() {
                Some("succeeded") => {
                    let observed = op
                        .result
                        .or_else(|| serde_json::from_str(&text).ok());
                    return Ok(ProviderResult::success(observed));
                }
                Some("failed") => {
                    return Ok(ProviderResult::permanent(
                        op.error
                            .unwrap_or_else(|| format!("operation {} failed", operation_id)),
                    ));
                }
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }
}

/// Map a non-2xx cluster API response to a result status.
fn failure_for(status: StatusCode, body: &str) -> ProviderResult {
    let message = format!("cluster API returned {}: {}", status, body.trim());
    if is_transient_status(status) {
        ProviderResult::transient(message)
    } else {
        ProviderResult::permanent(message)
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || matches!(status.as_u16(), 408 | 425 | 429)
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip(self, spec), fields(aggregate_id = %target.aggregate_id, request_id = %target.request_id))]
    async fn execute(
        &self,
        operation: VmOperation,
        spec: &ResolvedSpec,
        target: &Target,
    ) -> ProviderResult {
        match self.submit(operation, spec, target).await {
            Ok(result) => result,
            Err(error) => {
                warn!(error = %error, "Cluster API request failed");
                GovernanceError::from(error).into()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_round_trip() {
        for op in VmOperation::ALL {
            assert_eq!(op.as_str().parse::<VmOperation>().unwrap(), op);
        }
        assert!("reboot".parse::<VmOperation>().is_err());
        assert!(VmOperation::Delete.is_destructive());
        assert!(!VmOperation::Restart.is_destructive());
    }

    #[test]
    fn test_status_classification() {
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_transient_status(StatusCode::BAD_REQUEST));
        assert!(!is_transient_status(StatusCode::CONFLICT));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_error_to_result() {
        let transient: ProviderResult = GovernanceError::provider_transient("busy").into();
        assert_eq!(transient.status, ResultStatus::TransientFailure);

        let permanent: ProviderResult = GovernanceError::provider_permanent("bad spec").into();
        assert_eq!(permanent.status, ResultStatus::PermanentFailure);
    }
}
