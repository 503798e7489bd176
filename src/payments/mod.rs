pub mod paypal;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::PayPalConfig;
use crate::error::AppError;

pub use paypal::PayPalOrdersClient;

/// Handle on an order as created with the processor.
#[derive(Debug, Clone)]
pub struct CreatedOrder {
    pub order_id: String,
    pub approval_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureStatus {
    Completed,
    /// Any non-completed provider status, carried verbatim for reporting.
    Other(String),
}

/// Result of a capture attempt, normalized across the fresh-capture and
/// already-captured paths.
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub status: CaptureStatus,
    pub payer_id: Option<String>,
    pub transaction_id: Option<String>,
    /// True when the processor refused a second capture and the outcome was
    /// reconstructed from the order's current state.
    pub already_captured: bool,
}

#[derive(Debug, Error)]
pub enum PaymentError {
    /// The processor rejected the capture because the order was captured
    /// before. Internal to the adapter: `capture_order` converts this into a
    /// success-equivalent outcome by re-fetching the order.
    #[error("order already captured")]
    AlreadyCaptured,
    #[error("provider returned {status}: {detail}")]
    Api { status: u16, detail: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        AppError::PaymentProvider(err.to_string())
    }
}

/// Seam to the external payment processor's order API.
#[async_trait]
pub trait PaymentOrders: Send + Sync {
    async fn create_order(
        &self,
        reference_id: &str,
        amount_cents: i32,
        currency: &str,
        return_url: &str,
        cancel_url: &str,
    ) -> Result<CreatedOrder, PaymentError>;

    /// Captures an order. The provider's "already captured" rejection is never
    /// surfaced as an error: the adapter re-fetches the order and returns the
    /// equivalent outcome flagged `already_captured`.
    async fn capture_order(&self, order_id: &str) -> Result<CaptureOutcome, PaymentError>;
}

/// Extension-injected handle; absent when no processor is configured.
#[derive(Clone)]
pub struct PaymentsHandle(Option<Arc<dyn PaymentOrders>>);

impl PaymentsHandle {
    pub fn new(inner: Option<Arc<dyn PaymentOrders>>) -> Self {
        Self(inner)
    }

    pub fn from_config(config: Option<&PayPalConfig>) -> anyhow::Result<Self> {
        match config {
            Some(config) => {
                let client = PayPalOrdersClient::new(config)?;
                Ok(Self(Some(Arc::new(client))))
            }
            None => {
                tracing::warn!("payment processor not configured; order creation will fail");
                Ok(Self(None))
            }
        }
    }

    pub fn require(&self) -> Result<&Arc<dyn PaymentOrders>, AppError> {
        self.0
            .as_ref()
            .ok_or_else(|| AppError::Config("payment processor credentials missing".to_string()))
    }
}
