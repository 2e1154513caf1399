//! Telephony capability: place outbound voice calls.
//!
//! The provider is an external, independently scaled service; this
//! module defines the `TelephonyClient` seam the pipeline calls through
//! and an HTTP implementation against the provider's voice API.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::job::CampaignType;

/// Request timeout for call placement.
const REQUEST_TIMEOUT_SECS: u64 = 30;

static E164_RE: OnceLock<Regex> = OnceLock::new();

/// Whether `phone` is a dialable E.164 number.
///
/// Checked locally before placement so obviously malformed numbers fail
/// without a provider round trip.
pub fn is_valid_e164(phone: &str) -> bool {
    E164_RE
        .get_or_init(|| Regex::new(r"^\+[1-9]\d{6,14}$").expect("static regex is valid"))
        .is_match(phone)
}

/// Errors raised by the telephony provider.
///
/// Variants carry enough structure for the failure classifier to decide
/// retry eligibility without inspecting message text.
#[derive(Debug, Error)]
pub enum TelephonyError {
    /// Credentials were rejected by the provider.
    #[error("Provider authentication failed: {0}")]
    AuthFailed(String),

    /// The destination number is not a dialable phone number.
    #[error("Invalid phone number: {0}")]
    InvalidNumber(String),

    /// The destination number is on a block list.
    #[error("Number is blocked: {0}")]
    BlockedNumber(String),

    /// The provider signaled throttling.
    #[error("Provider rate limited: {0}")]
    RateLimited(String),

    /// The provider did not answer within the deadline.
    #[error("Provider request timed out after {0:?}")]
    Timeout(Duration),

    /// Any other provider-side failure.
    #[error("Provider error ({code}): {message}")]
    Provider { code: u16, message: String },

    /// Transport-level failure reaching the provider.
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Correlation metadata attached to every placed call, echoed back on
/// the status callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallMetadata {
    pub job_id: Uuid,
    pub tenant_id: String,
    pub campaign_type: CampaignType,
}

/// One outbound call placement request.
#[derive(Debug, Clone, Serialize)]
pub struct CallRequest {
    /// Destination number (E.164).
    pub to: String,
    /// Tenant's caller identity.
    pub from: String,
    /// Rendered script the voice agent speaks.
    pub script: String,
    /// Where the provider posts call-status updates.
    pub callback_url: String,
    /// Correlation metadata.
    pub metadata: CallMetadata,
}

/// Successful placement acknowledgment.
#[derive(Debug, Clone, Deserialize)]
pub struct CallPlacement {
    /// Provider-assigned call id.
    pub call_reference: String,
}

/// The "place outbound call" capability consumed by the pipeline.
#[async_trait]
pub trait TelephonyClient: Send + Sync {
    async fn place_call(&self, request: &CallRequest) -> Result<CallPlacement, TelephonyError>;
}

/// Error body shape returned by the provider on non-2xx responses.
#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// HTTP client for the provider's voice API.
pub struct HttpVoiceProvider {
    client: Client,
    base_url: String,
    api_token: String,
}

impl HttpVoiceProvider {
    /// Creates a provider client against the given API base URL.
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .expect("Failed to build HTTP client - system TLS configuration error"),
            base_url: base_url.into(),
            api_token: api_token.into(),
        }
    }

    fn map_error_response(status: StatusCode, body: ProviderErrorBody) -> TelephonyError {
        let message = body.message.unwrap_or_else(|| "no detail".to_string());

        match (status, body.code.as_deref()) {
            (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, _) => {
                TelephonyError::AuthFailed(message)
            }
            (_, Some("invalid_number")) => TelephonyError::InvalidNumber(message),
            (_, Some("blocked_number")) => TelephonyError::BlockedNumber(message),
            (StatusCode::TOO_MANY_REQUESTS, _) => TelephonyError::RateLimited(message),
            _ => TelephonyError::Provider {
                code: status.as_u16(),
                message,
            },
        }
    }
}

#[async_trait]
impl TelephonyClient for HttpVoiceProvider {
    async fn place_call(&self, request: &CallRequest) -> Result<CallPlacement, TelephonyError> {
        let url = format!("{}/v1/calls", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TelephonyError::Timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                } else {
                    TelephonyError::Transport(e)
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<CallPlacement>().await?);
        }

        let body = response
            .json::<ProviderErrorBody>()
            .await
            .unwrap_or(ProviderErrorBody {
                code: None,
                message: None,
            });

        Err(Self::map_error_response(status, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(code: Option<&str>, message: &str) -> ProviderErrorBody {
        ProviderErrorBody {
            code: code.map(|c| c.to_string()),
            message: Some(message.to_string()),
        }
    }

    #[test]
    fn test_auth_errors_map_to_auth_failed() {
        let err = HttpVoiceProvider::map_error_response(
            StatusCode::UNAUTHORIZED,
            body(None, "bad token"),
        );
        assert!(matches!(err, TelephonyError::AuthFailed(_)));
    }

    #[test]
    fn test_invalid_and_blocked_numbers_map_structurally() {
        let err = HttpVoiceProvider::map_error_response(
            StatusCode::BAD_REQUEST,
            body(Some("invalid_number"), "+31 is not dialable"),
        );
        assert!(matches!(err, TelephonyError::InvalidNumber(_)));

        let err = HttpVoiceProvider::map_error_response(
            StatusCode::BAD_REQUEST,
            body(Some("blocked_number"), "on do-not-call registry"),
        );
        assert!(matches!(err, TelephonyError::BlockedNumber(_)));
    }

    #[test]
    fn test_throttling_maps_to_rate_limited() {
        let err = HttpVoiceProvider::map_error_response(
            StatusCode::TOO_MANY_REQUESTS,
            body(None, "slow down"),
        );
        assert!(matches!(err, TelephonyError::RateLimited(_)));
    }

    #[test]
    fn test_unexpected_status_maps_to_provider_error() {
        let err = HttpVoiceProvider::map_error_response(
            StatusCode::BAD_GATEWAY,
            body(None, "upstream carrier error"),
        );
        match err {
            TelephonyError::Provider { code, message } => {
                assert_eq!(code, 502);
                assert!(message.contains("carrier"));
            }
            other => panic!("expected Provider error, got {:?}", other),
        }
    }

    #[test]
    fn test_e164_validation() {
        assert!(is_valid_e164("+31612345678"));
        assert!(is_valid_e164("+12025550123"));

        assert!(!is_valid_e164("0612345678"));
        assert!(!is_valid_e164("+0612345678"));
        assert!(!is_valid_e164("+31 6 1234 5678"));
        assert!(!is_valid_e164("+31"));
        assert!(!is_valid_e164(""));
    }

    #[test]
    fn test_call_request_serializes_metadata() {
        let request = CallRequest {
            to: "+31612345678".to_string(),
            from: "+31201234567".to_string(),
            script: "Goedemiddag!".to_string(),
            callback_url: "https://worker.example/callbacks/voice".to_string(),
            metadata: CallMetadata {
                job_id: Uuid::new_v4(),
                tenant_id: "t1".to_string(),
                campaign_type: CampaignType::ReviewRequest,
            },
        };

        let json = serde_json::to_value(&request).expect("request should serialize");
        assert_eq!(json["metadata"]["campaign_type"], "REVIEW_REQUEST");
        assert_eq!(json["to"], "+31612345678");
    }
}
