use crate::config::MpesaConfig;
use crate::errors::ServiceError;
use crate::services::mpesa::types::{
    StkPushRequest, StkPushResponse, StkQueryRequest, StkQueryResponse, TokenResponse,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use reqwest::StatusCode;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, instrument, warn};

/// Provider limit on AccountReference length
const ACCOUNT_REFERENCE_MAX_LEN: usize = 12;
const ACCOUNT_REFERENCE_DEFAULT: &str = "PHARMACY";
const TRANSACTION_TYPE_PAYBILL: &str = "CustomerPayBillOnline";

/// Tokens are refreshed this long before their stated expiry so an in-flight
/// push never rides an expiring token.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// HTTP client for the Daraja API: OAuth token with caching and bounded
/// retry, STK push, and push status query.
pub struct MpesaGateway {
    http: reqwest::Client,
    config: MpesaConfig,
    token_cache: RwLock<Option<CachedToken>>,
}

/// Converts local phone formats to `254…` international format.
///
/// Accepts `07XXXXXXXX`, `011XXXXXXX`, `7XXXXXXXX`, `1XXXXXXXX`,
/// `254XXXXXXXXX` and a leading `+`.
pub fn normalize_phone(raw: &str) -> Result<String, ServiceError> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    let normalized = if digits.len() == 12 && digits.starts_with("254") {
        digits
    } else if digits.len() == 10 && digits.starts_with('0') {
        format!("254{}", &digits[1..])
    } else if digits.len() == 9 && (digits.starts_with('7') || digits.starts_with('1')) {
        format!("254{}", digits)
    } else {
        return Err(ServiceError::InvalidInput(format!(
            "Invalid phone number format: {}",
            raw
        )));
    };

    Ok(normalized)
}

/// Restricts an account reference to the provider's alphanumeric charset and
/// length limit. Truncation keeps the TAIL, which carries the random suffix
/// that makes the reference distinguishable.
pub fn sanitize_account_reference(raw: &str) -> String {
    let cleaned: String = raw.chars().filter(|c| c.is_ascii_alphanumeric()).collect();

    if cleaned.is_empty() {
        return ACCOUNT_REFERENCE_DEFAULT.to_string();
    }

    if cleaned.len() > ACCOUNT_REFERENCE_MAX_LEN {
        cleaned[cleaned.len() - ACCOUNT_REFERENCE_MAX_LEN..].to_string()
    } else {
        cleaned
    }
}

/// Whole-shilling amount for the push. The provider takes integers only;
/// fractions round UP so a partial unit is never undercharged.
pub fn amount_to_shillings(amount: Decimal) -> Result<u64, ServiceError> {
    if amount <= Decimal::ZERO {
        return Err(ServiceError::InvalidInput(
            "Amount must be positive".to_string(),
        ));
    }

    amount.ceil().to_u64().ok_or_else(|| {
        ServiceError::InvalidInput(format!("Amount out of range: {}", amount))
    })
}

/// `base64(shortcode + passkey + timestamp)` as the push password.
pub fn push_password(shortcode: &str, passkey: &str, timestamp: &str) -> String {
    BASE64.encode(format!("{}{}{}", shortcode, passkey, timestamp))
}

impl MpesaGateway {
    pub fn new(config: MpesaConfig) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                ServiceError::InternalError(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            http,
            config,
            token_cache: RwLock::new(None),
        })
    }

    /// Returns a valid access token, from cache when fresh.
    ///
    /// Transient failures are retried with exponential backoff; an invalid
    /// credential response (401/403) fails immediately since retrying cannot
    /// help.
    #[instrument(skip(self))]
    pub async fn access_token(&self) -> Result<String, ServiceError> {
        {
            let cached = self.token_cache.read().await;
            if let Some(token) = cached.as_ref() {
                if token.expires_at > Instant::now() {
                    debug!("Using cached M-Pesa access token");
                    return Ok(token.token.clone());
                }
            }
        }

        let mut guard = self.token_cache.write().await;
        // Another task may have refreshed while we waited on the lock
        if let Some(token) = guard.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.token.clone());
            }
        }

        let token_response = self.fetch_token_with_retry().await?;
        let lifetime = Duration::from_secs(token_response.expires_in_secs())
            .saturating_sub(TOKEN_EXPIRY_MARGIN);

        let cached = CachedToken {
            token: token_response.access_token,
            expires_at: Instant::now() + lifetime,
        };
        let token = cached.token.clone();
        *guard = Some(cached);

        Ok(token)
    }

    async fn fetch_token_with_retry(&self) -> Result<TokenResponse, ServiceError> {
        let url = format!(
            "{}/oauth/v1/generate?grant_type=client_credentials",
            self.config.api_base_url
        );
        let attempts = self.config.token_retry_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = Duration::from_millis(
                    self.config.token_retry_base_delay_ms << (attempt - 2).min(8),
                );
                debug!(attempt, ?delay, "Retrying M-Pesa token fetch");
                tokio::time::sleep(delay).await;
            }

            let result = self
                .http
                .get(&url)
                .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret))
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        error!(%status, "M-Pesa credentials rejected");
                        return Err(ServiceError::GatewayError(
                            "Invalid M-Pesa API credentials".to_string(),
                        ));
                    }
                    if status.is_success() {
                        return response.json::<TokenResponse>().await.map_err(|e| {
                            error!("Malformed token response: {}", e);
                            ServiceError::GatewayError(format!(
                                "Malformed token response: {}",
                                e
                            ))
                        });
                    }
                    warn!(attempt, %status, "M-Pesa token request failed");
                    last_error = format!("HTTP {}", status);
                }
                Err(e) => {
                    warn!(attempt, "M-Pesa token request transport error: {}", e);
                    last_error = e.to_string();
                }
            }
        }

        error!(attempts, "M-Pesa token fetch exhausted retries: {}", last_error);
        Err(ServiceError::GatewayUnavailable(format!(
            "Token fetch failed after {} attempts: {}",
            attempts, last_error
        )))
    }

    /// Sends the STK push. `phone` must already be normalized and `amount`
    /// already whole shillings.
    #[instrument(skip(self, token), fields(phone = %phone, amount))]
    pub async fn stk_push(
        &self,
        token: &str,
        phone: &str,
        amount: u64,
        account_reference: &str,
        description: &str,
    ) -> Result<StkPushResponse, ServiceError> {
        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let request = StkPushRequest {
            business_short_code: self.config.shortcode.clone(),
            password: push_password(&self.config.shortcode, &self.config.passkey, &timestamp),
            timestamp,
            transaction_type: TRANSACTION_TYPE_PAYBILL.to_string(),
            amount,
            party_a: phone.to_string(),
            party_b: self.config.shortcode.clone(),
            phone_number: phone.to_string(),
            callback_url: self.config.callback_url.clone(),
            account_reference: account_reference.to_string(),
            transaction_desc: description.to_string(),
        };

        let url = format!("{}/mpesa/stkpush/v1/processrequest", self.config.api_base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                // Transport failure: connect, TLS, or timeout
                error!("STK push transport error: {}", e);
                ServiceError::GatewayUnavailable(format!("STK push transport error: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(%status, body = %body, "STK push rejected by provider");
            return Err(ServiceError::GatewayError(format!(
                "STK push rejected: HTTP {}",
                status
            )));
        }

        response.json::<StkPushResponse>().await.map_err(|e| {
            error!("Malformed STK push response: {}", e);
            ServiceError::GatewayError(format!("Malformed STK push response: {}", e))
        })
    }

    /// Queries the status of an earlier push by its CheckoutRequestID.
    #[instrument(skip(self, token))]
    pub async fn query_status(
        &self,
        token: &str,
        checkout_request_id: &str,
    ) -> Result<StkQueryResponse, ServiceError> {
        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let request = StkQueryRequest {
            business_short_code: self.config.shortcode.clone(),
            password: push_password(&self.config.shortcode, &self.config.passkey, &timestamp),
            timestamp,
            checkout_request_id: checkout_request_id.to_string(),
        };

        let url = format!("{}/mpesa/stkpushquery/v1/query", self.config.api_base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("STK query transport error: {}", e);
                ServiceError::GatewayUnavailable(format!("STK query transport error: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(%status, body = %body, "STK query rejected by provider");
            return Err(ServiceError::GatewayError(format!(
                "STK query rejected: HTTP {}",
                status
            )));
        }

        response.json::<StkQueryResponse>().await.map_err(|e| {
            error!("Malformed STK query response: {}", e);
            ServiceError::GatewayError(format!("Malformed STK query response: {}", e))
        })
    }
}
