//! The campaign pipeline executor.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::gateway::{
    CallExecutionLog, CallLogStatus, CampaignDataGateway, CustomerProfile, DailyUsage,
    TenantProfile,
};
use crate::scheduler::job::{CallOutcome, CampaignJob};
use crate::scripts::{ScriptContext, ScriptLibrary};
use crate::telephony::{is_valid_e164, CallMetadata, CallRequest, TelephonyClient, TelephonyError};

/// Safety margin applied over the nominal daily budget: a tenant is
/// blocked once spend reaches budget x 1.1, not budget itself.
const BUDGET_SAFETY_MARGIN: f64 = 1.1;

/// Approximate USD -> EUR conversion used when a tenant's budget and the
/// accumulated provider spend are tracked in different currencies.
// TODO: pull the FX rate from configuration instead of this constant.
const USD_TO_EUR: f64 = 0.92;

/// Result of the execution-validation stage.
///
/// Computed fresh per job from today's counters; never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    pub allowed: bool,
    /// Present iff the job was not allowed.
    pub reason: Option<String>,
    /// Remaining budget (tenant currency) under the safety-margin ceiling.
    pub remaining_budget: f64,
    /// Remaining calls under the daily ceiling.
    pub remaining_calls: u32,
}

impl ValidationOutcome {
    fn allowed(remaining_budget: f64, remaining_calls: u32) -> Self {
        Self {
            allowed: true,
            reason: None,
            remaining_budget,
            remaining_calls,
        }
    }

    fn blocked(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            remaining_budget: 0.0,
            remaining_calls: 0,
        }
    }
}

/// Converts today's spend into the tenant's budget currency.
///
/// Provider spend accumulates in USD; budgets are configured in the
/// tenant's own currency.
fn spend_in_budget_currency(usage: DailyUsage, budget_currency: &str) -> f64 {
    match budget_currency {
        "USD" => usage.spend_usd,
        // EUR and anything else we have no table entry for: approximate.
        _ => usage.spend_usd * USD_TO_EUR,
    }
}

/// Pure limit evaluation for the validation stage.
fn check_limits(
    job: &CampaignJob,
    tenant: &TenantProfile,
    usage: DailyUsage,
) -> Result<ValidationOutcome, PipelineError> {
    let ceiling = tenant.daily_budget * BUDGET_SAFETY_MARGIN;
    let spent = spend_in_budget_currency(usage, &tenant.budget_currency);

    if spent >= ceiling {
        return Err(PipelineError::BudgetExceeded {
            tenant_id: job.tenant_id.clone(),
            spent,
            ceiling,
        });
    }

    if usage.calls >= tenant.daily_call_limit {
        return Err(PipelineError::CallLimitExceeded {
            tenant_id: job.tenant_id.clone(),
            calls: usage.calls,
            limit: tenant.daily_call_limit,
        });
    }

    if !tenant.allows(job.campaign_type) {
        return Err(PipelineError::CampaignNotAllowed {
            tenant_id: job.tenant_id.clone(),
            campaign: job.campaign_type.to_string(),
        });
    }

    Ok(ValidationOutcome::allowed(
        ceiling - spent,
        tenant.daily_call_limit - usage.calls,
    ))
}

/// Resolves the script language: job voice settings win, then the
/// customer's preference, then the tenant default, then the global one.
fn resolve_language<'a>(
    job: &'a CampaignJob,
    customer: &'a CustomerProfile,
    tenant: &'a TenantProfile,
    global_default: &'a str,
) -> &'a str {
    job.voice_config
        .language
        .as_deref()
        .or(customer.preferred_language.as_deref())
        .or(tenant.default_language.as_deref())
        .unwrap_or(global_default)
}

/// Executes the per-job stage machine against injected collaborators.
pub struct CampaignPipeline {
    gateway: Arc<dyn CampaignDataGateway>,
    telephony: Arc<dyn TelephonyClient>,
    scripts: Arc<ScriptLibrary>,
    /// Status-callback target handed to the provider on every call.
    callback_url: String,
}

impl CampaignPipeline {
    pub fn new(
        gateway: Arc<dyn CampaignDataGateway>,
        telephony: Arc<dyn TelephonyClient>,
        scripts: Arc<ScriptLibrary>,
        callback_url: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            telephony,
            scripts,
            callback_url: callback_url.into(),
        }
    }

    /// Runs all stages for one job.
    ///
    /// The execution log (stage 6) is written for success and failure
    /// alike, and the analytics counters (stage 7) are incremented only
    /// after a successful placement. Neither write can change the
    /// returned outcome: a lost audit row is acceptable, a lost job
    /// outcome is not.
    pub async fn execute(&self, job: &CampaignJob) -> Result<CallOutcome, PipelineError> {
        let result = self.run_stages(job).await;

        self.write_execution_log(job, &result).await;

        if result.is_ok() {
            self.update_analytics(job).await;
        }

        result
    }

    async fn run_stages(&self, job: &CampaignJob) -> Result<CallOutcome, PipelineError> {
        // Stage 1: execution validation.
        let validation = self.validate_execution(job).await?;
        debug!(
            job_id = %job.job_id,
            tenant_id = %job.tenant_id,
            remaining_budget = validation.remaining_budget,
            remaining_calls = validation.remaining_calls,
            "Execution validated"
        );

        // Stage 2: context retrieval. Tenant and customer are fetched
        // concurrently; there is no ordering dependency between them.
        let (tenant, customer) = self.fetch_context(job).await?;
        let caller_id = tenant
            .caller_id
            .clone()
            .ok_or_else(|| PipelineError::CallerIdMissing(job.tenant_id.clone()))?;

        // Stage 3: consent check.
        self.check_consent(job).await?;

        // Stage 4: script selection and rendering.
        let language = resolve_language(job, &customer, &tenant, self.scripts.default_language());
        let script = self.scripts.render(
            job.campaign_type,
            language,
            &ScriptContext {
                customer_name: customer.name.clone(),
                tenant_name: tenant.name.clone(),
                service: job
                    .campaign_context
                    .get("service")
                    .and_then(|v| v.as_str())
                    .map(String::from),
            },
        )?;

        // Stage 5: call placement. Provider failures propagate unmodified.
        if !is_valid_e164(&job.customer_phone) {
            return Err(TelephonyError::InvalidNumber(job.customer_phone.clone()).into());
        }

        let placement = self
            .telephony
            .place_call(&CallRequest {
                to: job.customer_phone.clone(),
                from: caller_id,
                script,
                callback_url: self.callback_url.clone(),
                metadata: CallMetadata {
                    job_id: job.job_id,
                    tenant_id: job.tenant_id.clone(),
                    campaign_type: job.campaign_type,
                },
            })
            .await?;

        Ok(CallOutcome {
            call_reference: placement.call_reference,
            tenant_id: job.tenant_id.clone(),
            customer_id: customer.customer_id.clone(),
            campaign_type: job.campaign_type,
        })
    }

    async fn validate_execution(
        &self,
        job: &CampaignJob,
    ) -> Result<ValidationOutcome, PipelineError> {
        let today = Utc::now().date_naive();
        let usage = self.gateway.get_daily_usage(&job.tenant_id, today).await?;
        let tenant = self
            .gateway
            .get_tenant_profile(&job.tenant_id)
            .await?
            .ok_or_else(|| PipelineError::TenantNotFound(job.tenant_id.clone()))?;

        check_limits(job, &tenant, usage).inspect_err(|e| {
            let outcome = ValidationOutcome::blocked(e.to_string());
            debug!(
                job_id = %job.job_id,
                tenant_id = %job.tenant_id,
                reason = outcome.reason.as_deref().unwrap_or_default(),
                "Execution blocked"
            );
        })
    }

    async fn fetch_context(
        &self,
        job: &CampaignJob,
    ) -> Result<(TenantProfile, CustomerProfile), PipelineError> {
        let (tenant, customer) = tokio::try_join!(
            self.gateway.get_tenant_profile(&job.tenant_id),
            self.lookup_customer(job)
        )?;

        let tenant = tenant.ok_or_else(|| PipelineError::TenantNotFound(job.tenant_id.clone()))?;

        // Unknown numbers are still dialable: missed-call callbacks must
        // work for contacts we have no record of.
        let customer =
            customer.unwrap_or_else(|| CustomerProfile::anonymous(job.customer_phone.clone()));

        Ok((tenant, customer))
    }

    async fn lookup_customer(
        &self,
        job: &CampaignJob,
    ) -> Result<Option<CustomerProfile>, crate::gateway::GatewayError> {
        if let Some(customer_id) = &job.customer_id {
            if let Some(profile) = self
                .gateway
                .get_customer_by_id(customer_id, &job.tenant_id)
                .await?
            {
                return Ok(Some(profile));
            }
        }

        self.gateway
            .get_customer_by_phone(&job.customer_phone, &job.tenant_id)
            .await
    }

    async fn check_consent(&self, job: &CampaignJob) -> Result<(), PipelineError> {
        let consent = self
            .gateway
            .get_consent(&job.customer_phone, &job.tenant_id, job.campaign_type)
            .await?;

        match consent {
            None => Err(PipelineError::ConsentMissing {
                phone: job.customer_phone.clone(),
                tenant_id: job.tenant_id.clone(),
                campaign: job.campaign_type.to_string(),
            }),
            Some(record) if !record.permits_contact() => Err(PipelineError::ConsentNotPermitted {
                phone: job.customer_phone.clone(),
                tenant_id: job.tenant_id.clone(),
            }),
            Some(_) => Ok(()),
        }
    }

    /// Stage 6: best-effort execution log for whatever happened.
    async fn write_execution_log(
        &self,
        job: &CampaignJob,
        result: &Result<CallOutcome, PipelineError>,
    ) {
        let (status, call_reference, error_message) = match result {
            Ok(outcome) => (
                CallLogStatus::Initiated,
                Some(outcome.call_reference.clone()),
                None,
            ),
            Err(e) => (CallLogStatus::Failed, None, Some(e.to_string())),
        };

        let entry = CallExecutionLog {
            job_id: job.job_id,
            campaign_type: job.campaign_type,
            tenant_id: job.tenant_id.clone(),
            customer_id: job.customer_id.clone(),
            customer_phone: job.customer_phone.clone(),
            call_reference,
            status,
            error_message,
            campaign_context: serde_json::Value::Object(
                job.campaign_context.clone().into_iter().collect(),
            ),
        };

        if let Err(e) = self.gateway.append_execution_log(&entry).await {
            warn!(job_id = %job.job_id, error = %e, "Failed to write execution log");
        }
    }

    /// Stage 7: best-effort analytics increment after a placed call.
    async fn update_analytics(&self, job: &CampaignJob) {
        if let Err(e) = self
            .gateway
            .increment_daily_analytics(&job.tenant_id, job.campaign_type)
            .await
        {
            warn!(job_id = %job.job_id, error = %e, "Failed to update daily analytics");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::CampaignType;

    fn tenant() -> TenantProfile {
        TenantProfile {
            tenant_id: "t1".to_string(),
            name: "Salon Zuid".to_string(),
            caller_id: Some("+31201234567".to_string()),
            daily_budget: 25.0,
            budget_currency: "EUR".to_string(),
            daily_call_limit: 50,
            allowed_campaigns: vec![CampaignType::Reactivation, CampaignType::ReviewRequest],
            default_language: Some("nl".to_string()),
        }
    }

    fn job() -> CampaignJob {
        CampaignJob::new(CampaignType::Reactivation, "t1", "+31612345678")
    }

    #[test]
    fn test_limits_pass_under_budget() {
        let usage = DailyUsage {
            calls: 10,
            spend_usd: 5.0,
        };
        let outcome = check_limits(&job(), &tenant(), usage).expect("should be allowed");

        assert!(outcome.allowed);
        assert!(outcome.reason.is_none());
        assert_eq!(outcome.remaining_calls, 40);
        assert!(outcome.remaining_budget > 0.0);
    }

    #[test]
    fn test_budget_ceiling_includes_safety_margin() {
        // Budget 25 EUR, margin 1.1 -> ceiling 27.5 EUR. Spending past
        // the nominal budget but under the ceiling still passes.
        let usage = DailyUsage {
            calls: 0,
            spend_usd: 26.0 / USD_TO_EUR,
        };
        assert!(check_limits(&job(), &tenant(), usage).is_ok());

        // Past the ceiling the job is blocked.
        let usage = DailyUsage {
            calls: 0,
            spend_usd: 28.0 / USD_TO_EUR,
        };
        let err = check_limits(&job(), &tenant(), usage).unwrap_err();
        assert!(matches!(err, PipelineError::BudgetExceeded { .. }));
    }

    #[test]
    fn test_usd_budget_skips_conversion() {
        let mut t = tenant();
        t.budget_currency = "USD".to_string();

        let usage = DailyUsage {
            calls: 0,
            spend_usd: 28.0,
        };
        let err = check_limits(&job(), &t, usage).unwrap_err();
        assert!(matches!(err, PipelineError::BudgetExceeded { .. }));

        let usage = DailyUsage {
            calls: 0,
            spend_usd: 26.0,
        };
        assert!(check_limits(&job(), &t, usage).is_ok());
    }

    #[test]
    fn test_call_ceiling_blocks() {
        let usage = DailyUsage {
            calls: 50,
            spend_usd: 0.0,
        };
        let err = check_limits(&job(), &tenant(), usage).unwrap_err();
        assert!(matches!(err, PipelineError::CallLimitExceeded { .. }));
    }

    #[test]
    fn test_disallowed_campaign_blocks() {
        let usage = DailyUsage::default();
        let promo = CampaignJob::new(CampaignType::Promotional, "t1", "+31612345678");
        let err = check_limits(&promo, &tenant(), usage).unwrap_err();
        assert!(matches!(err, PipelineError::CampaignNotAllowed { .. }));
    }

    #[test]
    fn test_language_resolution_chain() {
        let t = tenant();
        let customer = CustomerProfile {
            customer_id: Some("c1".to_string()),
            name: Some("Anna".to_string()),
            phone: "+31612345678".to_string(),
            preferred_language: Some("en".to_string()),
        };

        // Job voice config wins.
        let j = job().with_language("fr");
        assert_eq!(resolve_language(&j, &customer, &t, "nl"), "fr");

        // Then the customer preference.
        let j = job();
        assert_eq!(resolve_language(&j, &customer, &t, "nl"), "en");

        // Then the tenant default.
        let anonymous = CustomerProfile::anonymous("+31612345678");
        assert_eq!(resolve_language(&j, &anonymous, &t, "de"), "nl");

        // Finally the global default.
        let mut bare = t.clone();
        bare.default_language = None;
        assert_eq!(resolve_language(&j, &anonymous, &bare, "de"), "de");
    }

    #[test]
    fn test_blocked_outcome_carries_reason() {
        let outcome = ValidationOutcome::blocked("budget exceeded");
        assert!(!outcome.allowed);
        assert_eq!(outcome.reason.as_deref(), Some("budget exceeded"));
        assert_eq!(outcome.remaining_calls, 0);
    }
}
