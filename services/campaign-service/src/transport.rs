use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::EngineError;

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug)]
pub struct DeliveryReceipt {
    pub message_id: String,
}

/// Narrow outbound delivery contract: one message in, a delivery id or an
/// error reason out. The engine does not care which protocol sits behind it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, EngineError>;
}

/// Delivery through an HTTP mail API (Mailgun-style JSON endpoint).
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    sender: String,
}

#[derive(Deserialize)]
struct MailApiResponse {
    id: Option<String>,
}

impl HttpTransport {
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var("MAIL_API_URL").ok()?;
        let api_key = std::env::var("MAIL_API_KEY").ok();
        let sender =
            std::env::var("MAIL_SENDER").unwrap_or_else(|_| "noreply@localhost".to_string());
        Some(Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
            sender,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, EngineError> {
        let payload = json!({
            "from": self.sender,
            "to": message.to,
            "subject": message.subject,
            "html": message.body,
        });

        let mut request = self.client.post(&self.endpoint).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| EngineError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let snippet: String = detail.chars().take(200).collect();
            return Err(EngineError::Transport(format!(
                "mail api returned {status}: {snippet}"
            )));
        }

        let message_id = response
            .json::<MailApiResponse>()
            .await
            .ok()
            .and_then(|body| body.id)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(DeliveryReceipt { message_id })
    }
}

/// Dev-mode transport: logs the delivery and reports success. Used when no
/// mail API is configured so the queue can drain locally.
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn deliver(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, EngineError> {
        tracing::info!(to = %message.to, subject = %message.subject, "dry-run delivery");
        Ok(DeliveryReceipt {
            message_id: Uuid::new_v4().to_string(),
        })
    }
}

#[cfg(test)]
pub mod mock {
    use std::collections::HashSet;

    use tokio::sync::Mutex;

    use super::*;

    /// Records every delivery and fails for recipients on the reject list.
    pub struct MockTransport {
        pub sent: Mutex<Vec<OutboundMessage>>,
        reject: HashSet<String>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                reject: HashSet::new(),
            }
        }

        pub fn rejecting(recipients: &[&str]) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                reject: recipients.iter().map(|r| r.to_string()).collect(),
            }
        }

        pub async fn sent_count(&self) -> usize {
            self.sent.lock().await.len()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn deliver(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, EngineError> {
            if self.reject.contains(&message.to) {
                return Err(EngineError::Transport(format!(
                    "recipient rejected: {}",
                    message.to
                )));
            }
            self.sent.lock().await.push(message.clone());
            Ok(DeliveryReceipt {
                message_id: format!("mock-{}", self.sent.lock().await.len()),
            })
        }
    }
}
