//! Best-effort notification of the external balance service.
//!
//! Nothing in the ledger depends on the outcome: errors are returned to the
//! dispatcher, which logs them and moves on. There is no retry.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::MerchantId;

pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);
const RECORD_PATH: &str = "/internal/balance/record";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceUpdate {
    pub merchant_id: MerchantId,
    pub currency: String,
    /// Display units.
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
}

#[async_trait]
pub trait BalanceNotifier: Send + Sync {
    async fn notify(&self, update: &BalanceUpdate) -> Result<()>;
}

pub struct HttpBalanceNotifier {
    client: Client,
    endpoint: String,
}

impl HttpBalanceNotifier {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), RECORD_PATH),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl BalanceNotifier for HttpBalanceNotifier {
    async fn notify(&self, update: &BalanceUpdate) -> Result<()> {
        let res = self.client.post(&self.endpoint).json(update).send().await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(Error::NotificationRejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Used when notifications are switched off.
pub struct NoopNotifier;

#[async_trait]
impl BalanceNotifier for NoopNotifier {
    async fn notify(&self, _update: &BalanceUpdate) -> Result<()> {
        Ok(())
    }
}
