//! Outbound alarm notification seam
//!
//! The engine only knows the [`AlarmNotifier`] trait; the shipped
//! implementation posts the rendered batch to a webhook.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, TankSrvError};

/// Dispatch target for rendered alarm batches.
#[async_trait]
pub trait AlarmNotifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<()>;
}

/// Posts `{"text": ...}` to a configured webhook URL.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        WebhookNotifier { url, client }
    }
}

#[async_trait]
impl AlarmNotifier for WebhookNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "text": message }))
            .send()
            .await
            .map_err(|e| TankSrvError::AlarmError(format!("webhook request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TankSrvError::AlarmError(format!(
                "webhook returned {status}"
            )));
        }
        debug!("alarm webhook delivered");
        Ok(())
    }
}
