//! Campaign data gateway: read/write access to tenant, customer, consent
//! and analytics records.
//!
//! The gateway is the pipeline's only view of the relational store. It is
//! expressed as a trait so worker processes can be constructed against
//! the Postgres implementation in production and against in-memory
//! doubles in tests.

pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::job::CampaignType;

pub use postgres::PostgresGateway;

/// Errors that can occur during gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Connection to the store failed.
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Record not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Query exceeded its deadline.
    #[error("Store operation timed out: {0}")]
    Timeout(String),

    /// Serialization of a JSON column failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Tenant profile, including the limits consulted at validation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantProfile {
    pub tenant_id: String,
    /// Display name used in call scripts.
    pub name: String,
    /// Outbound caller identity. Calls cannot be placed without one.
    pub caller_id: Option<String>,
    /// Daily spend ceiling, in `budget_currency`.
    pub daily_budget: f64,
    /// ISO currency code the budget is tracked in.
    pub budget_currency: String,
    /// Daily outbound-call ceiling.
    pub daily_call_limit: u32,
    /// Campaign types this tenant has enabled.
    pub allowed_campaigns: Vec<CampaignType>,
    /// Tenant-wide default script language.
    pub default_language: Option<String>,
}

impl TenantProfile {
    /// Whether the tenant has enabled the given campaign type.
    pub fn allows(&self, campaign: CampaignType) -> bool {
        self.allowed_campaigns.contains(&campaign)
    }
}

/// Customer profile as needed for script personalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerProfile {
    pub customer_id: Option<String>,
    pub name: Option<String>,
    pub phone: String,
    pub preferred_language: Option<String>,
}

impl CustomerProfile {
    /// Minimal profile for a number with no matching customer record.
    ///
    /// Missed-call callbacks routinely target unknown numbers, so an
    /// unresolvable customer is synthesized rather than rejected.
    pub fn anonymous(phone: impl Into<String>) -> Self {
        Self {
            customer_id: None,
            name: None,
            phone: phone.into(),
            preferred_language: None,
        }
    }
}

/// Today's usage counters for one tenant.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DailyUsage {
    /// Outbound calls placed today.
    pub calls: u32,
    /// Accumulated provider spend today, in USD.
    pub spend_usd: f64,
}

/// Consent state for one (tenant, phone, campaign type) triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsentStatus {
    OptedIn,
    OptedOut,
    PendingVerification,
}

/// A recorded, revocable contact permission. Owned and mutated by the
/// external consent system; the core only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub status: ConsentStatus,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ConsentRecord {
    /// A call may be placed only for an opted-in, non-revoked record.
    pub fn permits_contact(&self) -> bool {
        self.status == ConsentStatus::OptedIn && self.revoked_at.is_none()
    }
}

/// Outcome recorded in the execution log for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallLogStatus {
    Initiated,
    Failed,
}

impl std::fmt::Display for CallLogStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallLogStatus::Initiated => write!(f, "initiated"),
            CallLogStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Immutable record of one processing attempt's outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallExecutionLog {
    pub job_id: Uuid,
    pub campaign_type: CampaignType,
    pub tenant_id: String,
    pub customer_id: Option<String>,
    pub customer_phone: String,
    /// Provider call id; absent when placement failed.
    pub call_reference: Option<String>,
    pub status: CallLogStatus,
    pub error_message: Option<String>,
    pub campaign_context: serde_json::Value,
}

/// Read/write interface to tenant, contact, consent and analytics records.
#[async_trait]
pub trait CampaignDataGateway: Send + Sync {
    /// Today's call count and spend for a tenant.
    async fn get_daily_usage(
        &self,
        tenant_id: &str,
        date: NaiveDate,
    ) -> Result<DailyUsage, GatewayError>;

    /// Tenant profile including limits and caller identity.
    /// Returns `None` when the tenant does not exist.
    async fn get_tenant_profile(
        &self,
        tenant_id: &str,
    ) -> Result<Option<TenantProfile>, GatewayError>;

    /// Customer lookup by record id.
    async fn get_customer_by_id(
        &self,
        customer_id: &str,
        tenant_id: &str,
    ) -> Result<Option<CustomerProfile>, GatewayError>;

    /// Customer lookup by phone number.
    async fn get_customer_by_phone(
        &self,
        phone: &str,
        tenant_id: &str,
    ) -> Result<Option<CustomerProfile>, GatewayError>;

    /// Consent record for (phone, tenant, campaign type), if any.
    async fn get_consent(
        &self,
        phone: &str,
        tenant_id: &str,
        campaign_type: CampaignType,
    ) -> Result<Option<ConsentRecord>, GatewayError>;

    /// Appends one immutable execution-log row.
    async fn append_execution_log(&self, entry: &CallExecutionLog) -> Result<(), GatewayError>;

    /// Increments today's analytics counters for (tenant, campaign type).
    /// Must be an atomic increment-on-conflict upsert at the store.
    async fn increment_daily_analytics(
        &self,
        tenant_id: &str,
        campaign_type: CampaignType,
    ) -> Result<(), GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consent_permits_contact() {
        let record = ConsentRecord {
            status: ConsentStatus::OptedIn,
            revoked_at: None,
        };
        assert!(record.permits_contact());

        let record = ConsentRecord {
            status: ConsentStatus::OptedOut,
            revoked_at: None,
        };
        assert!(!record.permits_contact());

        // Opted in but revoked later: contact is not permitted.
        let record = ConsentRecord {
            status: ConsentStatus::OptedIn,
            revoked_at: Some(Utc::now()),
        };
        assert!(!record.permits_contact());

        let record = ConsentRecord {
            status: ConsentStatus::PendingVerification,
            revoked_at: None,
        };
        assert!(!record.permits_contact());
    }

    #[test]
    fn test_consent_status_wire_format() {
        let json = serde_json::to_string(&ConsentStatus::OptedIn).expect("should serialize");
        assert_eq!(json, "\"OPTED_IN\"");
        let parsed: ConsentStatus =
            serde_json::from_str("\"PENDING_VERIFICATION\"").expect("should parse");
        assert_eq!(parsed, ConsentStatus::PendingVerification);
    }

    #[test]
    fn test_anonymous_customer_profile() {
        let profile = CustomerProfile::anonymous("+31612345678");
        assert!(profile.customer_id.is_none());
        assert!(profile.name.is_none());
        assert!(profile.preferred_language.is_none());
        assert_eq!(profile.phone, "+31612345678");
    }

    #[test]
    fn test_tenant_allows_campaign() {
        let tenant = TenantProfile {
            tenant_id: "t1".to_string(),
            name: "Salon Zuid".to_string(),
            caller_id: Some("+31201234567".to_string()),
            daily_budget: 25.0,
            budget_currency: "EUR".to_string(),
            daily_call_limit: 50,
            allowed_campaigns: vec![CampaignType::ReviewRequest, CampaignType::Reactivation],
            default_language: Some("nl".to_string()),
        };

        assert!(tenant.allows(CampaignType::Reactivation));
        assert!(!tenant.allows(CampaignType::Promotional));
    }

    #[test]
    fn test_call_log_status_display() {
        assert_eq!(CallLogStatus::Initiated.to_string(), "initiated");
        assert_eq!(CallLogStatus::Failed.to_string(), "failed");
    }
}
