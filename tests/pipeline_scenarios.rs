//! End-to-end pipeline scenarios against in-memory collaborators.
//!
//! These tests drive `CampaignPipeline` with mock gateway/telephony
//! doubles and assert the gating, classification and bookkeeping
//! behavior of the stage machine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};

use callforge::error::{FailureKind, PipelineError};
use callforge::gateway::{
    CallExecutionLog, CallLogStatus, CampaignDataGateway, ConsentRecord, ConsentStatus,
    CustomerProfile, DailyUsage, GatewayError, TenantProfile,
};
use callforge::pipeline::CampaignPipeline;
use callforge::scheduler::{CampaignJob, CampaignType};
use callforge::scripts::ScriptLibrary;
use callforge::telephony::{CallPlacement, CallRequest, TelephonyClient, TelephonyError};

#[derive(Default)]
struct GatewayCalls {
    daily_usage: AtomicUsize,
    tenant_profile: AtomicUsize,
    customer_by_id: AtomicUsize,
    customer_by_phone: AtomicUsize,
    consent: AtomicUsize,
}

struct MockGateway {
    tenant: Option<TenantProfile>,
    customer: Option<CustomerProfile>,
    consent: Option<ConsentRecord>,
    usage: DailyUsage,
    calls: GatewayCalls,
    logs: Mutex<Vec<CallExecutionLog>>,
    analytics: Mutex<Vec<(String, CampaignType)>>,
}

impl MockGateway {
    fn new(tenant: Option<TenantProfile>) -> Self {
        Self {
            tenant,
            customer: None,
            consent: None,
            usage: DailyUsage::default(),
            calls: GatewayCalls::default(),
            logs: Mutex::new(Vec::new()),
            analytics: Mutex::new(Vec::new()),
        }
    }

    fn with_customer(mut self, customer: CustomerProfile) -> Self {
        self.customer = Some(customer);
        self
    }

    fn with_consent(mut self, status: ConsentStatus) -> Self {
        self.consent = Some(ConsentRecord {
            status,
            revoked_at: None,
        });
        self
    }

    fn with_usage(mut self, usage: DailyUsage) -> Self {
        self.usage = usage;
        self
    }

    fn customer_lookups(&self) -> usize {
        self.calls.customer_by_id.load(Ordering::SeqCst)
            + self.calls.customer_by_phone.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CampaignDataGateway for MockGateway {
    async fn get_daily_usage(
        &self,
        _tenant_id: &str,
        _date: NaiveDate,
    ) -> Result<DailyUsage, GatewayError> {
        self.calls.daily_usage.fetch_add(1, Ordering::SeqCst);
        Ok(self.usage)
    }

    async fn get_tenant_profile(
        &self,
        _tenant_id: &str,
    ) -> Result<Option<TenantProfile>, GatewayError> {
        self.calls.tenant_profile.fetch_add(1, Ordering::SeqCst);
        Ok(self.tenant.clone())
    }

    async fn get_customer_by_id(
        &self,
        _customer_id: &str,
        _tenant_id: &str,
    ) -> Result<Option<CustomerProfile>, GatewayError> {
        self.calls.customer_by_id.fetch_add(1, Ordering::SeqCst);
        Ok(self.customer.clone())
    }

    async fn get_customer_by_phone(
        &self,
        _phone: &str,
        _tenant_id: &str,
    ) -> Result<Option<CustomerProfile>, GatewayError> {
        self.calls.customer_by_phone.fetch_add(1, Ordering::SeqCst);
        Ok(self.customer.clone())
    }

    async fn get_consent(
        &self,
        _phone: &str,
        _tenant_id: &str,
        _campaign_type: CampaignType,
    ) -> Result<Option<ConsentRecord>, GatewayError> {
        self.calls.consent.fetch_add(1, Ordering::SeqCst);
        Ok(self.consent.clone())
    }

    async fn append_execution_log(&self, entry: &CallExecutionLog) -> Result<(), GatewayError> {
        self.logs.lock().unwrap().push(entry.clone());
        Ok(())
    }

    async fn increment_daily_analytics(
        &self,
        tenant_id: &str,
        campaign_type: CampaignType,
    ) -> Result<(), GatewayError> {
        self.analytics
            .lock()
            .unwrap()
            .push((tenant_id.to_string(), campaign_type));
        Ok(())
    }
}

enum TelephonyBehavior {
    Succeed,
    Timeout,
    InvalidNumber,
}

struct MockTelephony {
    behavior: TelephonyBehavior,
    requests: Mutex<Vec<CallRequest>>,
}

impl MockTelephony {
    fn new(behavior: TelephonyBehavior) -> Self {
        Self {
            behavior,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn placements(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl TelephonyClient for MockTelephony {
    async fn place_call(&self, request: &CallRequest) -> Result<CallPlacement, TelephonyError> {
        self.requests.lock().unwrap().push(request.clone());
        match self.behavior {
            TelephonyBehavior::Succeed => Ok(CallPlacement {
                call_reference: format!("call-{}", request.metadata.job_id),
            }),
            TelephonyBehavior::Timeout => Err(TelephonyError::Timeout(
                std::time::Duration::from_secs(30),
            )),
            TelephonyBehavior::InvalidNumber => {
                Err(TelephonyError::InvalidNumber(request.to.clone()))
            }
        }
    }
}

fn tenant() -> TenantProfile {
    TenantProfile {
        tenant_id: "t1".to_string(),
        name: "Salon Zuid".to_string(),
        caller_id: Some("+31201234567".to_string()),
        daily_budget: 25.0,
        budget_currency: "EUR".to_string(),
        daily_call_limit: 50,
        allowed_campaigns: CampaignType::ALL.to_vec(),
        default_language: Some("nl".to_string()),
    }
}

fn reactivation_job() -> CampaignJob {
    CampaignJob::new(CampaignType::Reactivation, "t1", "+31612345678").with_language("nl")
}

fn pipeline(
    gateway: Arc<MockGateway>,
    telephony: Arc<MockTelephony>,
) -> CampaignPipeline {
    CampaignPipeline::new(
        gateway,
        telephony,
        Arc::new(ScriptLibrary::load_default().expect("bundled scripts should load")),
        "https://worker.example/callbacks/voice",
    )
}

// Scenario A: opted-in consent and spend below budget produce a call
// reference and exactly one analytics increment.
#[tokio::test]
async fn opted_in_job_places_call_and_increments_analytics_once() {
    let gateway = Arc::new(
        MockGateway::new(Some(tenant()))
            .with_customer(CustomerProfile {
                customer_id: Some("c-9".to_string()),
                name: Some("Anna".to_string()),
                phone: "+31612345678".to_string(),
                preferred_language: Some("nl".to_string()),
            })
            .with_consent(ConsentStatus::OptedIn),
    );
    let telephony = Arc::new(MockTelephony::new(TelephonyBehavior::Succeed));

    let outcome = pipeline(Arc::clone(&gateway), Arc::clone(&telephony))
        .execute(&reactivation_job())
        .await
        .expect("pipeline should succeed");

    assert!(outcome.call_reference.starts_with("call-"));
    assert_eq!(outcome.tenant_id, "t1");
    assert_eq!(outcome.campaign_type, CampaignType::Reactivation);

    let analytics = gateway.analytics.lock().unwrap();
    assert_eq!(
        analytics.as_slice(),
        &[("t1".to_string(), CampaignType::Reactivation)]
    );

    let logs = gateway.logs.lock().unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, CallLogStatus::Initiated);
    assert!(logs[0].call_reference.is_some());
}

// Scenario B: OPTED_OUT consent raises a permanent failure, telephony
// is never invoked and the failed attempt is logged.
#[tokio::test]
async fn opted_out_consent_is_permanent_and_never_dials() {
    let gateway =
        Arc::new(MockGateway::new(Some(tenant())).with_consent(ConsentStatus::OptedOut));
    let telephony = Arc::new(MockTelephony::new(TelephonyBehavior::Succeed));

    let err = pipeline(Arc::clone(&gateway), Arc::clone(&telephony))
        .execute(&reactivation_job())
        .await
        .expect_err("opted-out consent must fail");

    assert!(matches!(err, PipelineError::ConsentNotPermitted { .. }));
    assert_eq!(err.kind(), FailureKind::Permanent);
    assert_eq!(telephony.placements(), 0);

    let logs = gateway.logs.lock().unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, CallLogStatus::Failed);
    assert!(logs[0].error_message.is_some());

    assert!(gateway.analytics.lock().unwrap().is_empty());
}

// Missing consent records gate identically to explicit opt-outs.
#[tokio::test]
async fn absent_consent_never_invokes_telephony() {
    let gateway = Arc::new(MockGateway::new(Some(tenant())));
    let telephony = Arc::new(MockTelephony::new(TelephonyBehavior::Succeed));

    let err = pipeline(Arc::clone(&gateway), Arc::clone(&telephony))
        .execute(&reactivation_job())
        .await
        .expect_err("absent consent must fail");

    assert!(matches!(err, PipelineError::ConsentMissing { .. }));
    assert_eq!(err.kind(), FailureKind::Permanent);
    assert_eq!(telephony.placements(), 0);
}

// A revoked record blocks even though its status is still OPTED_IN.
#[tokio::test]
async fn revoked_consent_blocks_contact() {
    let mut gateway = MockGateway::new(Some(tenant()));
    gateway.consent = Some(ConsentRecord {
        status: ConsentStatus::OptedIn,
        revoked_at: Some(Utc::now()),
    });
    let gateway = Arc::new(gateway);
    let telephony = Arc::new(MockTelephony::new(TelephonyBehavior::Succeed));

    let err = pipeline(Arc::clone(&gateway), Arc::clone(&telephony))
        .execute(&reactivation_job())
        .await
        .expect_err("revoked consent must fail");

    assert_eq!(err.kind(), FailureKind::Permanent);
    assert_eq!(telephony.placements(), 0);
}

// Scenario C: spend at budget x 1.2 rejects at validation, before any
// customer lookup happens.
#[tokio::test]
async fn over_budget_rejects_before_context_retrieval() {
    let gateway = Arc::new(
        MockGateway::new(Some(tenant()))
            .with_consent(ConsentStatus::OptedIn)
            // 25 EUR budget; spend 30 EUR expressed in USD.
            .with_usage(DailyUsage {
                calls: 3,
                spend_usd: 30.0 / 0.92,
            }),
    );
    let telephony = Arc::new(MockTelephony::new(TelephonyBehavior::Succeed));

    let err = pipeline(Arc::clone(&gateway), Arc::clone(&telephony))
        .execute(&reactivation_job())
        .await
        .expect_err("over-budget tenant must be rejected");

    assert!(matches!(err, PipelineError::BudgetExceeded { .. }));
    assert_eq!(err.kind(), FailureKind::RateLimited);
    assert_eq!(gateway.customer_lookups(), 0);
    assert_eq!(telephony.placements(), 0);
}

// The call ceiling blocks with the same timing as the budget ceiling.
#[tokio::test]
async fn call_ceiling_rejects_before_context_retrieval() {
    let gateway = Arc::new(MockGateway::new(Some(tenant())).with_usage(DailyUsage {
        calls: 50,
        spend_usd: 0.0,
    }));
    let telephony = Arc::new(MockTelephony::new(TelephonyBehavior::Succeed));

    let err = pipeline(Arc::clone(&gateway), Arc::clone(&telephony))
        .execute(&reactivation_job())
        .await
        .expect_err("at the ceiling the job must be rejected");

    assert!(matches!(err, PipelineError::CallLimitExceeded { .. }));
    assert_eq!(gateway.customer_lookups(), 0);
}

// Scenario D: a provider timeout classifies as service_unavailable and
// stays retryable.
#[tokio::test]
async fn provider_timeout_is_service_unavailable() {
    let gateway = Arc::new(
        MockGateway::new(Some(tenant())).with_consent(ConsentStatus::OptedIn),
    );
    let telephony = Arc::new(MockTelephony::new(TelephonyBehavior::Timeout));

    let err = pipeline(Arc::clone(&gateway), Arc::clone(&telephony))
        .execute(&reactivation_job())
        .await
        .expect_err("timeout must surface");

    assert_eq!(err.kind(), FailureKind::ServiceUnavailable);
    assert!(err.kind().is_retryable());
    assert_eq!(telephony.placements(), 1);

    // The failed attempt is still logged, and analytics stay untouched.
    let logs = gateway.logs.lock().unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, CallLogStatus::Failed);
    assert!(gateway.analytics.lock().unwrap().is_empty());
}

// A provider-side invalid-number rejection is permanent too: the number
// was well-formed but is not dialable.
#[tokio::test]
async fn provider_invalid_number_is_permanent() {
    let gateway = Arc::new(
        MockGateway::new(Some(tenant())).with_consent(ConsentStatus::OptedIn),
    );
    let telephony = Arc::new(MockTelephony::new(TelephonyBehavior::InvalidNumber));

    let err = pipeline(Arc::clone(&gateway), Arc::clone(&telephony))
        .execute(&reactivation_job())
        .await
        .expect_err("undialable number must fail");

    assert_eq!(err.kind(), FailureKind::Permanent);
    assert_eq!(telephony.placements(), 1);
}

// An invalid destination number is permanent: redelivery cannot fix it.
#[tokio::test]
async fn invalid_number_is_permanent() {
    let gateway = Arc::new(
        MockGateway::new(Some(tenant())).with_consent(ConsentStatus::OptedIn),
    );
    let telephony = Arc::new(MockTelephony::new(TelephonyBehavior::Succeed));

    let job = CampaignJob::new(CampaignType::Reactivation, "t1", "not-a-number");
    let err = pipeline(Arc::clone(&gateway), Arc::clone(&telephony))
        .execute(&job)
        .await
        .expect_err("malformed number must fail");

    assert!(matches!(
        err,
        PipelineError::Telephony(TelephonyError::InvalidNumber(_))
    ));
    assert_eq!(err.kind(), FailureKind::Permanent);
    assert_eq!(telephony.placements(), 0);
}

// A missing tenant and a missing caller identity are both permanent.
#[tokio::test]
async fn missing_tenant_and_caller_id_are_permanent() {
    let gateway = Arc::new(MockGateway::new(None));
    let telephony = Arc::new(MockTelephony::new(TelephonyBehavior::Succeed));

    let err = pipeline(Arc::clone(&gateway), Arc::clone(&telephony))
        .execute(&reactivation_job())
        .await
        .expect_err("unknown tenant must fail");
    assert!(matches!(err, PipelineError::TenantNotFound(_)));
    assert_eq!(err.kind(), FailureKind::Permanent);

    let mut bare = tenant();
    bare.caller_id = None;
    let gateway = Arc::new(MockGateway::new(Some(bare)).with_consent(ConsentStatus::OptedIn));

    let err = pipeline(Arc::clone(&gateway), Arc::clone(&telephony))
        .execute(&reactivation_job())
        .await
        .expect_err("missing caller identity must fail");
    assert!(matches!(err, PipelineError::CallerIdMissing(_)));
    assert_eq!(err.kind(), FailureKind::Permanent);
    assert_eq!(telephony.placements(), 0);
}

// An unresolvable customer is synthesized, not rejected: missed-call
// callbacks dial unknown numbers.
#[tokio::test]
async fn unknown_customer_still_gets_called() {
    let gateway = Arc::new(
        MockGateway::new(Some(tenant())).with_consent(ConsentStatus::OptedIn),
    );
    let telephony = Arc::new(MockTelephony::new(TelephonyBehavior::Succeed));

    let job = CampaignJob::new(CampaignType::MissedCallCallback, "t1", "+31687654321");
    let outcome = pipeline(Arc::clone(&gateway), Arc::clone(&telephony))
        .execute(&job)
        .await
        .expect("unknown numbers must still be dialable");

    assert!(outcome.customer_id.is_none());
    assert_eq!(telephony.placements(), 1);
}

// A language with no template silently falls back to the default
// language rather than raising.
#[tokio::test]
async fn unknown_language_falls_back_to_default_script() {
    let gateway = Arc::new(
        MockGateway::new(Some(tenant())).with_consent(ConsentStatus::OptedIn),
    );
    let telephony = Arc::new(MockTelephony::new(TelephonyBehavior::Succeed));

    let job = CampaignJob::new(CampaignType::ReviewRequest, "t1", "+31612345678")
        .with_language("sv");
    pipeline(Arc::clone(&gateway), Arc::clone(&telephony))
        .execute(&job)
        .await
        .expect("unknown language must not fail the job");

    let requests = telephony.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    // The Dutch default template was used.
    assert!(requests[0].script.starts_with("Goedemiddag"));
    assert_eq!(requests[0].from, "+31201234567");
}
