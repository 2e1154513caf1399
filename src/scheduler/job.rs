//! Job definitions for the campaign scheduler.
//!
//! This module defines the core types moved through the queues:
//!
//! - `CampaignJob`: one scheduled outbound-call attempt for one contact
//! - `CampaignType`: the five supported campaign kinds
//! - `EnqueueOptions`: scheduling hints accepted at enqueue time
//! - `CallOutcome`: result of a successfully executed job

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default maximum number of attempts for a job.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default priority for jobs (0 is normal priority).
const DEFAULT_PRIORITY: i32 = 0;

/// The supported outbound campaign kinds.
///
/// Each kind maps to its own durable queue so that consumers and retries
/// never interleave across campaign types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CampaignType {
    ReviewRequest,
    Reactivation,
    FollowUp,
    Promotional,
    MissedCallCallback,
}

impl CampaignType {
    /// All campaign types, in queue-binding order.
    pub const ALL: [CampaignType; 5] = [
        CampaignType::ReviewRequest,
        CampaignType::Reactivation,
        CampaignType::FollowUp,
        CampaignType::Promotional,
        CampaignType::MissedCallCallback,
    ];

    /// Wire name of the campaign type (matches the enqueue contract).
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignType::ReviewRequest => "REVIEW_REQUEST",
            CampaignType::Reactivation => "REACTIVATION",
            CampaignType::FollowUp => "FOLLOW_UP",
            CampaignType::Promotional => "PROMOTIONAL",
            CampaignType::MissedCallCallback => "MISSED_CALL_CALLBACK",
        }
    }

    /// Deterministic name of the durable queue for this campaign type.
    pub fn queue_name(&self) -> &'static str {
        match self {
            CampaignType::ReviewRequest => "calls:review_request",
            CampaignType::Reactivation => "calls:reactivation",
            CampaignType::FollowUp => "calls:follow_up",
            CampaignType::Promotional => "calls:promotional",
            CampaignType::MissedCallCallback => "calls:missed_call_callback",
        }
    }

    /// Column name of the per-campaign counter in the daily analytics row.
    pub fn analytics_column(&self) -> &'static str {
        match self {
            CampaignType::ReviewRequest => "review_request_calls",
            CampaignType::Reactivation => "reactivation_calls",
            CampaignType::FollowUp => "follow_up_calls",
            CampaignType::Promotional => "promotional_calls",
            CampaignType::MissedCallCallback => "missed_call_callback_calls",
        }
    }
}

impl std::fmt::Display for CampaignType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "REVIEW_REQUEST" => Ok(CampaignType::ReviewRequest),
            "REACTIVATION" => Ok(CampaignType::Reactivation),
            "FOLLOW_UP" => Ok(CampaignType::FollowUp),
            "PROMOTIONAL" => Ok(CampaignType::Promotional),
            "MISSED_CALL_CALLBACK" => Ok(CampaignType::MissedCallCallback),
            other => Err(format!("unknown campaign type '{}'", other)),
        }
    }
}

/// Voice settings carried with a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VoiceConfig {
    /// Preferred language for the call script (e.g. "nl", "en").
    #[serde(default)]
    pub language: Option<String>,
    /// Named voice to use at the provider, if the tenant configured one.
    #[serde(default)]
    pub voice: Option<String>,
}

/// One scheduled attempt to place a single outbound call for one contact.
///
/// Jobs are serialized into Redis and mutated only by the worker pool
/// (attempt counters). `tenant_id` and `customer_phone` are required;
/// everything else is optional context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignJob {
    /// Unique identifier for this job.
    pub job_id: Uuid,
    /// Which campaign this call belongs to.
    pub campaign_type: CampaignType,
    /// Tenant on whose behalf the call is placed.
    pub tenant_id: String,
    /// Customer record id, when the contact is a known customer.
    #[serde(default)]
    pub customer_id: Option<String>,
    /// E.164 phone number to call.
    pub customer_phone: String,
    /// Opaque campaign context (service type, appointment id, ...).
    #[serde(default)]
    pub campaign_context: BTreeMap<String, serde_json::Value>,
    /// Voice settings for this call.
    #[serde(default)]
    pub voice_config: VoiceConfig,
    /// Number of processing attempts made so far.
    pub attempts_made: u32,
    /// Maximum attempts before the job is terminally failed.
    pub max_attempts: u32,
    /// Times this job was redelivered after stalling in processing.
    #[serde(default)]
    pub stalled_deliveries: u32,
    /// Scheduling hint; higher values are dequeued sooner.
    pub priority: i32,
    /// When the job was enqueued.
    pub enqueued_at: DateTime<Utc>,
}

impl CampaignJob {
    /// Creates a new job with default attempt and priority settings.
    pub fn new(
        campaign_type: CampaignType,
        tenant_id: impl Into<String>,
        customer_phone: impl Into<String>,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            campaign_type,
            tenant_id: tenant_id.into(),
            customer_id: None,
            customer_phone: customer_phone.into(),
            campaign_context: BTreeMap::new(),
            voice_config: VoiceConfig::default(),
            attempts_made: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            stalled_deliveries: 0,
            priority: DEFAULT_PRIORITY,
            enqueued_at: Utc::now(),
        }
    }

    /// Sets the customer record id.
    pub fn with_customer_id(mut self, customer_id: impl Into<String>) -> Self {
        self.customer_id = Some(customer_id.into());
        self
    }

    /// Sets the preferred script language.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.voice_config.language = Some(language.into());
        self
    }

    /// Adds one campaign-context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.campaign_context.insert(key.into(), value);
        self
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the priority hint.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Increments the attempt counter. Called once per delivery, before
    /// the pipeline runs.
    pub fn increment_attempts(&mut self) {
        self.attempts_made += 1;
    }

    /// Whether the job may be redelivered after a retryable failure.
    pub fn should_retry(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    /// Remaining retry attempts.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts_made)
    }

    /// Checks the required-field invariant: `tenant_id` and
    /// `customer_phone` must be present.
    pub fn validate(&self) -> Result<(), String> {
        if self.tenant_id.trim().is_empty() {
            return Err("tenant_id is required".to_string());
        }
        if self.customer_phone.trim().is_empty() {
            return Err("customer_phone is required".to_string());
        }
        Ok(())
    }

    /// How long ago the job was enqueued.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.enqueued_at
    }
}

/// Scheduling hints accepted at enqueue time.
///
/// `delay` and `priority` are passthrough hints for the queue; neither
/// affects the job's semantics once it is delivered.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Delay before the job becomes visible to workers.
    pub delay: Option<Duration>,
    /// Priority hint; higher is dequeued sooner.
    pub priority: i32,
    /// Maximum attempts for this job.
    pub max_attempts: u32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            delay: None,
            priority: DEFAULT_PRIORITY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl EnqueueOptions {
    /// Sets the visibility delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sets the priority hint.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Result of a successfully executed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallOutcome {
    /// Call reference assigned by the telephony provider.
    pub call_reference: String,
    /// Tenant the call was placed for.
    pub tenant_id: String,
    /// Customer record id, when known.
    pub customer_id: Option<String>,
    /// Campaign the call belonged to.
    pub campaign_type: CampaignType,
}
