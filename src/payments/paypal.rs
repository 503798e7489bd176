use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;

use super::{CaptureOutcome, CaptureStatus, CreatedOrder, PaymentError, PaymentOrders};
use crate::config::PayPalConfig;

const ALREADY_CAPTURED_ISSUE: &str = "ORDER_ALREADY_CAPTURED";
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

/// PayPal Orders v2 client. All calls carry a bounded timeout; the OAuth2
/// client-credentials token is cached until shortly before expiry.
pub struct PayPalOrdersClient {
    client: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    token: RwLock<Option<CachedToken>>,
}

struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl PayPalOrdersClient {
    pub fn new(config: &PayPalConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build payment client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            token: RwLock::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn access_token(&self) -> Result<String, PaymentError> {
        if let Some(cached) = self.token.read().await.as_ref() {
            if cached.expires_at > Utc::now() {
                return Ok(cached.value.clone());
            }
        }

        let response = self
            .client
            .post(self.endpoint("v1/oauth2/token"))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PaymentError::Api {
                status: response.status().as_u16(),
                detail: response.text().await.unwrap_or_default(),
            });
        }
        let token: TokenResponse = response.json().await?;

        let mut guard = self.token.write().await;
        *guard = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Utc::now()
                + chrono::Duration::seconds(
                    token.expires_in.saturating_sub(TOKEN_EXPIRY_MARGIN_SECS).max(0),
                ),
        });
        Ok(token.access_token)
    }

    async fn show_order(&self, order_id: &str) -> Result<OrderResource, PaymentError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(self.endpoint(&format!("v2/checkout/orders/{order_id}")))
            .bearer_auth(token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PaymentError::Api {
                status: response.status().as_u16(),
                detail: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }

    /// Raw capture call. A 422 carrying the provider's already-captured issue
    /// becomes the typed variant; no caller ever matches on transport shapes.
    async fn try_capture(&self, order_id: &str) -> Result<OrderResource, PaymentError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .post(self.endpoint(&format!("v2/checkout/orders/{order_id}/capture")))
            .bearer_auth(token)
            .header("Prefer", "return=representation")
            .json(&json!({}))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 422 {
            if let Ok(parsed) = serde_json::from_str::<ApiErrorBody>(&body) {
                if parsed
                    .details
                    .iter()
                    .any(|detail| detail.issue.as_deref() == Some(ALREADY_CAPTURED_ISSUE))
                {
                    return Err(PaymentError::AlreadyCaptured);
                }
            }
        }
        Err(PaymentError::Api {
            status: status.as_u16(),
            detail: body,
        })
    }
}

#[async_trait]
impl PaymentOrders for PayPalOrdersClient {
    async fn create_order(
        &self,
        reference_id: &str,
        amount_cents: i32,
        currency: &str,
        return_url: &str,
        cancel_url: &str,
    ) -> Result<CreatedOrder, PaymentError> {
        let token = self.access_token().await?;
        let payload = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": reference_id,
                "amount": {
                    "currency_code": currency,
                    "value": format_amount(amount_cents),
                },
            }],
            "application_context": {
                "return_url": return_url,
                "cancel_url": cancel_url,
            },
        });

        let response = self
            .client
            .post(self.endpoint("v2/checkout/orders"))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PaymentError::Api {
                status: response.status().as_u16(),
                detail: response.text().await.unwrap_or_default(),
            });
        }
        let order: OrderResource = response.json().await?;

        let approval_url = order
            .links
            .iter()
            .find(|link| link.rel == "approve")
            .map(|link| link.href.clone());
        Ok(CreatedOrder {
            order_id: order.id,
            approval_url,
        })
    }

    async fn capture_order(&self, order_id: &str) -> Result<CaptureOutcome, PaymentError> {
        match self.try_capture(order_id).await {
            Ok(order) => Ok(outcome_from_order(order, false)),
            Err(PaymentError::AlreadyCaptured) => {
                let order = self.show_order(order_id).await?;
                Ok(outcome_from_order(order, true))
            }
            Err(err) => Err(err),
        }
    }
}

fn outcome_from_order(order: OrderResource, already_captured: bool) -> CaptureOutcome {
    let raw_status = order.status.unwrap_or_else(|| "UNKNOWN".to_string());
    let status = if raw_status == "COMPLETED" {
        CaptureStatus::Completed
    } else {
        CaptureStatus::Other(raw_status)
    };
    let transaction_id = order
        .purchase_units
        .iter()
        .filter_map(|unit| unit.payments.as_ref())
        .flat_map(|payments| payments.captures.iter())
        .map(|capture| capture.id.clone())
        .next();
    CaptureOutcome {
        status,
        payer_id: order.payer.and_then(|payer| payer.payer_id),
        transaction_id,
        already_captured,
    }
}

fn format_amount(amount_cents: i32) -> String {
    format!("{}.{:02}", amount_cents / 100, amount_cents % 100)
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct OrderResource {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    payer: Option<PayerResource>,
    #[serde(default)]
    purchase_units: Vec<PurchaseUnitResource>,
    #[serde(default)]
    links: Vec<LinkResource>,
}

#[derive(Debug, Deserialize)]
struct PayerResource {
    #[serde(default)]
    payer_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PurchaseUnitResource {
    #[serde(default)]
    payments: Option<PaymentsResource>,
}

#[derive(Debug, Deserialize)]
struct PaymentsResource {
    #[serde(default)]
    captures: Vec<CaptureResource>,
}

#[derive(Debug, Deserialize)]
struct CaptureResource {
    id: String,
}

#[derive(Debug, Deserialize)]
struct LinkResource {
    rel: String,
    href: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    details: Vec<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    issue: Option<String>,
}
