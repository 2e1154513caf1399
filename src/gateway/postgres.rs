//! PostgreSQL implementation of the campaign data gateway.
//!
//! Schema ownership lives with the surrounding platform; this module
//! only reads tenant/customer/consent records and writes execution logs
//! and daily analytics counters.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::scheduler::job::CampaignType;

use super::{
    CallExecutionLog, CampaignDataGateway, ConsentRecord, ConsentStatus, CustomerProfile,
    DailyUsage, GatewayError, TenantProfile,
};

/// PostgreSQL-backed gateway.
pub struct PostgresGateway {
    pool: PgPool,
}

impl PostgresGateway {
    /// Connects to the store and returns a new gateway.
    pub async fn connect(database_url: &str) -> Result<Self, GatewayError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| GatewayError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Creates a gateway from an existing pool.
    ///
    /// Useful when sharing a pool across multiple components, and for
    /// constructing isolated instances in tests.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn parse_campaign_list(raw: Vec<String>) -> Vec<CampaignType> {
        // Unknown entries are skipped rather than failing the tenant:
        // the set only ever gates campaign types this worker knows.
        raw.iter()
            .filter_map(|name| name.parse::<CampaignType>().ok())
            .collect()
    }
}

#[async_trait]
impl CampaignDataGateway for PostgresGateway {
    async fn get_daily_usage(
        &self,
        tenant_id: &str,
        date: NaiveDate,
    ) -> Result<DailyUsage, GatewayError> {
        let row = sqlx::query(
            r#"
            SELECT outbound_calls, total_cost
            FROM daily_analytics
            WHERE tenant_id = $1 AND date = $2 AND period_type = 'daily'
            "#,
        )
        .bind(tenant_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;

        // No row yet simply means no calls were placed today.
        Ok(match row {
            Some(row) => DailyUsage {
                calls: row.try_get::<i32, _>("outbound_calls")? as u32,
                spend_usd: row.try_get::<f64, _>("total_cost")?,
            },
            None => DailyUsage::default(),
        })
    }

    async fn get_tenant_profile(
        &self,
        tenant_id: &str,
    ) -> Result<Option<TenantProfile>, GatewayError> {
        let row = sqlx::query(
            r#"
            SELECT tenant_id, name, caller_id, daily_budget, budget_currency,
                   daily_call_limit, allowed_campaigns, default_language
            FROM tenants
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(TenantProfile {
            tenant_id: row.try_get("tenant_id")?,
            name: row.try_get("name")?,
            caller_id: row.try_get("caller_id")?,
            daily_budget: row.try_get("daily_budget")?,
            budget_currency: row.try_get("budget_currency")?,
            daily_call_limit: row.try_get::<i32, _>("daily_call_limit")? as u32,
            allowed_campaigns: Self::parse_campaign_list(row.try_get("allowed_campaigns")?),
            default_language: row.try_get("default_language")?,
        }))
    }

    async fn get_customer_by_id(
        &self,
        customer_id: &str,
        tenant_id: &str,
    ) -> Result<Option<CustomerProfile>, GatewayError> {
        let row = sqlx::query(
            r#"
            SELECT customer_id, name, phone, preferred_language
            FROM customers
            WHERE customer_id = $1 AND tenant_id = $2
            "#,
        )
        .bind(customer_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            Ok::<_, sqlx::Error>(CustomerProfile {
                customer_id: row.try_get("customer_id")?,
                name: row.try_get("name")?,
                phone: row.try_get("phone")?,
                preferred_language: row.try_get("preferred_language")?,
            })
        })
        .transpose()?)
    }

    async fn get_customer_by_phone(
        &self,
        phone: &str,
        tenant_id: &str,
    ) -> Result<Option<CustomerProfile>, GatewayError> {
        let row = sqlx::query(
            r#"
            SELECT customer_id, name, phone, preferred_language
            FROM customers
            WHERE phone = $1 AND tenant_id = $2
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(phone)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            Ok::<_, sqlx::Error>(CustomerProfile {
                customer_id: row.try_get("customer_id")?,
                name: row.try_get("name")?,
                phone: row.try_get("phone")?,
                preferred_language: row.try_get("preferred_language")?,
            })
        })
        .transpose()?)
    }

    async fn get_consent(
        &self,
        phone: &str,
        tenant_id: &str,
        campaign_type: CampaignType,
    ) -> Result<Option<ConsentRecord>, GatewayError> {
        let row = sqlx::query(
            r#"
            SELECT status, revoked_at
            FROM consents
            WHERE phone = $1 AND tenant_id = $2 AND campaign_type = $3
            "#,
        )
        .bind(phone)
        .bind(tenant_id)
        .bind(campaign_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.try_get("status")?;
        let status = match status.as_str() {
            "OPTED_IN" => ConsentStatus::OptedIn,
            "OPTED_OUT" => ConsentStatus::OptedOut,
            _ => ConsentStatus::PendingVerification,
        };

        Ok(Some(ConsentRecord {
            status,
            revoked_at: row.try_get("revoked_at")?,
        }))
    }

    async fn append_execution_log(&self, entry: &CallExecutionLog) -> Result<(), GatewayError> {
        sqlx::query(
            r#"
            INSERT INTO call_execution_logs (
                job_id, campaign_type, tenant_id, customer_id, customer_phone,
                call_reference, status, error_message, campaign_context, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.job_id)
        .bind(entry.campaign_type.as_str())
        .bind(&entry.tenant_id)
        .bind(&entry.customer_id)
        .bind(&entry.customer_phone)
        .bind(&entry.call_reference)
        .bind(entry.status.to_string())
        .bind(&entry.error_message)
        .bind(&entry.campaign_context)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn increment_daily_analytics(
        &self,
        tenant_id: &str,
        campaign_type: CampaignType,
    ) -> Result<(), GatewayError> {
        // The campaign column name comes from the enum, never from input.
        let query = format!(
            r#"
            INSERT INTO daily_analytics (
                tenant_id, date, period_type, total_calls, outbound_calls, {column}
            ) VALUES ($1, $2, 'daily', 1, 1, 1)
            ON CONFLICT (tenant_id, date, period_type) DO UPDATE SET
                total_calls = daily_analytics.total_calls + 1,
                outbound_calls = daily_analytics.outbound_calls + 1,
                {column} = daily_analytics.{column} + 1
            "#,
            column = campaign_type.analytics_column()
        );

        sqlx::query(&query)
            .bind(tenant_id)
            .bind(Utc::now().date_naive())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_campaign_list_skips_unknown() {
        let parsed = PostgresGateway::parse_campaign_list(vec![
            "REVIEW_REQUEST".to_string(),
            "NEWSLETTER".to_string(),
            "reactivation".to_string(),
        ]);
        assert_eq!(
            parsed,
            vec![CampaignType::ReviewRequest, CampaignType::Reactivation]
        );
    }

    #[test]
    fn test_gateway_error_display() {
        let err = GatewayError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));

        let err = GatewayError::NotFound("tenant t1".to_string());
        assert!(err.to_string().contains("t1"));

        let err = GatewayError::Timeout("daily usage".to_string());
        assert!(err.to_string().contains("timed out"));
    }
}
