use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::SmsConfig;

/// Notification delivery errors
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("SMS provider is not configured")]
    NotConfigured,
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Best-effort message delivery
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, destination: &str, message: &str) -> Result<(), NotificationError>;
}

/// Sends SMS through the provider's JSON endpoint
pub struct SmsNotificationSender {
    client: Client,
    api_url: String,
    api_key: String,
    sender: Option<String>,
}

impl SmsNotificationSender {
    pub fn new(config: &SmsConfig) -> anyhow::Result<Self> {
        let api_url = config
            .api_url
            .clone()
            .context("sms.api_url is required for the SMS sender")?;
        let api_key = config
            .api_key
            .clone()
            .context("sms.api_key is required for the SMS sender")?;
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to construct reqwest client for sms sender")?;
        Ok(Self {
            client,
            api_url,
            api_key,
            sender: config.sender.clone(),
        })
    }
}

#[async_trait]
impl NotificationSender for SmsNotificationSender {
    #[instrument(skip(self, message))]
    async fn send(&self, destination: &str, message: &str) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "to": destination,
                "from": self.sender,
                "text": message,
            }))
            .send()
            .await
            .map_err(|e| NotificationError::Delivery(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotificationError::Delivery(format!(
                "provider answered {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Writes messages to the log instead of delivering them
#[derive(Debug, Default, Clone)]
pub struct LoggingNotificationSender;

#[async_trait]
impl NotificationSender for LoggingNotificationSender {
    async fn send(&self, destination: &str, message: &str) -> Result<(), NotificationError> {
        info!(destination, message, "notification (not delivered)");
        Ok(())
    }
}

/// Picks the SMS sender when enabled, otherwise the logging sender
pub fn sender_from_config(config: &SmsConfig) -> anyhow::Result<Arc<dyn NotificationSender>> {
    if config.enabled {
        Ok(Arc::new(SmsNotificationSender::new(config)?))
    } else {
        Ok(Arc::new(LoggingNotificationSender))
    }
}

/// Sends on a spawned task; failures are logged and never reach the caller
pub fn dispatch(sender: Arc<dyn NotificationSender>, destination: String, message: String) {
    tokio::spawn(async move {
        if let Err(e) = sender.send(&destination, &message).await {
            warn!(error = %e, "notification delivery failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_sms_falls_back_to_logging() {
        assert!(sender_from_config(&SmsConfig::default()).is_ok());
    }

    #[test]
    fn enabled_sms_without_url_fails_to_build() {
        let config = SmsConfig {
            enabled: true,
            api_key: Some("key".into()),
            ..Default::default()
        };
        assert!(sender_from_config(&config).is_err());
    }

    #[tokio::test]
    async fn logging_sender_always_succeeds() {
        assert!(LoggingNotificationSender
            .send("+989120000000", "paid")
            .await
            .is_ok());
    }
}
