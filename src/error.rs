//! Failure classification for campaign job processing.
//!
//! Every failure site in the pipeline raises a structured
//! `PipelineError` variant; retry eligibility is decided by reading
//! `PipelineError::kind()` rather than by matching message text, so a
//! reworded message can never change retry behavior.

use thiserror::Error;

use crate::gateway::GatewayError;
use crate::scripts::ScriptError;
use crate::telephony::TelephonyError;

/// Retry category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Retrying cannot succeed; the job is terminally failed at once.
    Permanent,
    /// A ceiling or throttle was hit; retried with backoff.
    RateLimited,
    /// A downstream service misbehaved; retried with backoff.
    ServiceUnavailable,
    /// Unclassified; retried by default up to the attempt ceiling.
    Temporary,
}

impl FailureKind {
    /// Whether jobs failing with this kind may be redelivered.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::Permanent)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Permanent => "permanent",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::ServiceUnavailable => "service_unavailable",
            FailureKind::Temporary => "temporary",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while processing one campaign job.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Daily spend reached the budget ceiling (including safety margin).
    #[error("Daily budget exceeded for tenant {tenant_id}: spent {spent:.2} of ceiling {ceiling:.2}")]
    BudgetExceeded {
        tenant_id: String,
        spent: f64,
        ceiling: f64,
    },

    /// Daily call ceiling reached.
    #[error("Daily call limit reached for tenant {tenant_id}: {calls} of {limit}")]
    CallLimitExceeded {
        tenant_id: String,
        calls: u32,
        limit: u32,
    },

    /// The tenant has not enabled this campaign type.
    #[error("Campaign type {campaign} is not enabled for tenant {tenant_id}")]
    CampaignNotAllowed {
        tenant_id: String,
        campaign: String,
    },

    /// No tenant record exists.
    #[error("Tenant {0} not found")]
    TenantNotFound(String),

    /// The tenant has no outbound caller identity configured.
    #[error("Tenant {0} has no outbound caller identity configured")]
    CallerIdMissing(String),

    /// No usable consent record for (phone, tenant, campaign type).
    #[error("No opted-in consent for {phone} with tenant {tenant_id} ({campaign})")]
    ConsentMissing {
        phone: String,
        tenant_id: String,
        campaign: String,
    },

    /// Consent existed but was revoked or not opted in.
    #[error("Consent for {phone} with tenant {tenant_id} does not permit contact")]
    ConsentNotPermitted { phone: String, tenant_id: String },

    /// The job violates the enqueue contract (missing required fields).
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// Intake is closed because the worker is draining.
    #[error("Worker is draining; job not accepted")]
    WorkerDraining,

    /// The worker's memory usage is above its configured ceiling.
    #[error("Worker over memory ceiling: {used_mb} MB used of {max_mb} MB")]
    WorkerOverloaded { used_mb: u64, max_mb: u64 },

    /// Processing exceeded the per-job deadline.
    #[error("Job processing timed out after {0:?}")]
    JobTimeout(std::time::Duration),

    /// Script selection or rendering failed.
    #[error(transparent)]
    Script(#[from] ScriptError),

    /// Data-store failure.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Telephony provider failure.
    #[error(transparent)]
    Telephony(#[from] TelephonyError),
}

impl PipelineError {
    /// Retry category of this failure; the classifier the worker pool
    /// consults before deciding ack, retry or terminal failure.
    pub fn kind(&self) -> FailureKind {
        match self {
            PipelineError::BudgetExceeded { .. } | PipelineError::CallLimitExceeded { .. } => {
                FailureKind::RateLimited
            }

            PipelineError::CampaignNotAllowed { .. }
            | PipelineError::TenantNotFound(_)
            | PipelineError::CallerIdMissing(_)
            | PipelineError::ConsentMissing { .. }
            | PipelineError::ConsentNotPermitted { .. }
            | PipelineError::InvalidJob(_) => FailureKind::Permanent,

            // A broken script asset cannot heal between attempts.
            PipelineError::Script(_) => FailureKind::Permanent,

            PipelineError::Gateway(e) => match e {
                GatewayError::NotFound(_) => FailureKind::Permanent,
                _ => FailureKind::ServiceUnavailable,
            },

            PipelineError::Telephony(e) => match e {
                TelephonyError::InvalidNumber(_) | TelephonyError::BlockedNumber(_) => {
                    FailureKind::Permanent
                }
                TelephonyError::RateLimited(_) => FailureKind::RateLimited,
                _ => FailureKind::ServiceUnavailable,
            },

            PipelineError::WorkerDraining
            | PipelineError::WorkerOverloaded { .. }
            | PipelineError::JobTimeout(_) => FailureKind::Temporary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_failure_kind_names() {
        assert_eq!(FailureKind::Permanent.as_str(), "permanent");
        assert_eq!(FailureKind::RateLimited.as_str(), "rate_limited");
        assert_eq!(
            FailureKind::ServiceUnavailable.as_str(),
            "service_unavailable"
        );
        assert_eq!(FailureKind::Temporary.as_str(), "temporary");
    }

    #[test]
    fn test_only_permanent_is_not_retryable() {
        assert!(!FailureKind::Permanent.is_retryable());
        assert!(FailureKind::RateLimited.is_retryable());
        assert!(FailureKind::ServiceUnavailable.is_retryable());
        assert!(FailureKind::Temporary.is_retryable());
    }

    #[test]
    fn test_budget_and_call_ceiling_are_rate_limited() {
        let err = PipelineError::BudgetExceeded {
            tenant_id: "t1".to_string(),
            spent: 33.0,
            ceiling: 27.5,
        };
        assert_eq!(err.kind(), FailureKind::RateLimited);

        let err = PipelineError::CallLimitExceeded {
            tenant_id: "t1".to_string(),
            calls: 50,
            limit: 50,
        };
        assert_eq!(err.kind(), FailureKind::RateLimited);
    }

    #[test]
    fn test_consent_and_identity_failures_are_permanent() {
        let err = PipelineError::ConsentMissing {
            phone: "+31612345678".to_string(),
            tenant_id: "t1".to_string(),
            campaign: "REACTIVATION".to_string(),
        };
        assert_eq!(err.kind(), FailureKind::Permanent);

        let err = PipelineError::ConsentNotPermitted {
            phone: "+31612345678".to_string(),
            tenant_id: "t1".to_string(),
        };
        assert_eq!(err.kind(), FailureKind::Permanent);

        let err = PipelineError::TenantNotFound("t1".to_string());
        assert_eq!(err.kind(), FailureKind::Permanent);

        let err = PipelineError::CallerIdMissing("t1".to_string());
        assert_eq!(err.kind(), FailureKind::Permanent);
    }

    #[test]
    fn test_telephony_kinds() {
        let err = PipelineError::from(TelephonyError::Timeout(Duration::from_secs(30)));
        assert_eq!(err.kind(), FailureKind::ServiceUnavailable);

        let err = PipelineError::from(TelephonyError::InvalidNumber("+31".to_string()));
        assert_eq!(err.kind(), FailureKind::Permanent);

        let err = PipelineError::from(TelephonyError::BlockedNumber("+31612345678".to_string()));
        assert_eq!(err.kind(), FailureKind::Permanent);

        let err = PipelineError::from(TelephonyError::RateLimited("429".to_string()));
        assert_eq!(err.kind(), FailureKind::RateLimited);

        let err = PipelineError::from(TelephonyError::AuthFailed("bad token".to_string()));
        assert_eq!(err.kind(), FailureKind::ServiceUnavailable);
    }

    #[test]
    fn test_gateway_kinds() {
        let err = PipelineError::from(GatewayError::Timeout("daily usage".to_string()));
        assert_eq!(err.kind(), FailureKind::ServiceUnavailable);

        let err = PipelineError::from(GatewayError::ConnectionFailed("refused".to_string()));
        assert_eq!(err.kind(), FailureKind::ServiceUnavailable);

        let err = PipelineError::from(GatewayError::NotFound("tenant t1".to_string()));
        assert_eq!(err.kind(), FailureKind::Permanent);
    }

    #[test]
    fn test_preflight_conditions_are_temporary() {
        assert_eq!(PipelineError::WorkerDraining.kind(), FailureKind::Temporary);
        let err = PipelineError::WorkerOverloaded {
            used_mb: 612,
            max_mb: 512,
        };
        assert_eq!(err.kind(), FailureKind::Temporary);
    }
}
