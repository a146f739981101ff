//! Outbound customer messages.
//!
//! The core never composes text on its own; it hands the configured
//! organization message to a [`MessageSender`] and moves on.

use async_trait::async_trait;
use handoff_models::Contact;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::error::HandoffError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    SlaWarning,
    SlaAutoClose,
    InactivityReminder,
    InactivityAutoClose,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::SlaWarning => "sla_warning",
            MessageKind::SlaAutoClose => "sla_auto_close",
            MessageKind::InactivityReminder => "inactivity_reminder",
            MessageKind::InactivityAutoClose => "inactivity_auto_close",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SendOptions {
    pub kind: MessageKind,
    pub transfer_id: Option<String>,
}

impl SendOptions {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            transfer_id: None,
        }
    }

    pub fn for_transfer(mut self, transfer_id: &str) -> Self {
        self.transfer_id = Some(transfer_id.to_string());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message_id: Option<String>,
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(
        &self,
        channel_account_id: &str,
        contact: &Contact,
        content: &str,
        options: &SendOptions,
    ) -> Result<SendReceipt, HandoffError>;
}

/// Posts messages to a channel gateway as JSON.
pub struct HttpMessageSender {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpMessageSender {
    pub fn new(gateway_url: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{}/messages", gateway_url.trim_end_matches('/')),
            timeout,
        }
    }
}

#[async_trait]
impl MessageSender for HttpMessageSender {
    async fn send(
        &self,
        channel_account_id: &str,
        contact: &Contact,
        content: &str,
        options: &SendOptions,
    ) -> Result<SendReceipt, HandoffError> {
        let payload = serde_json::json!({
            "channel_account_id": channel_account_id,
            "contact_id": contact.id,
            "phone": contact.phone,
            "content": content,
            "kind": options.kind,
            "transfer_id": options.transfer_id,
        });

        let resp = self
            .client
            .post(&self.url)
            .json(&payload)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| HandoffError::Delivery(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(HandoffError::Delivery(format!("HTTP {status}: {body}")));
        }
        // Gateways that answer with an empty body still count as delivered.
        Ok(resp.json::<SendReceipt>().await.unwrap_or_default())
    }
}

/// Used when no gateway is configured: records the send in the log only.
pub struct LogSender;

#[async_trait]
impl MessageSender for LogSender {
    async fn send(
        &self,
        channel_account_id: &str,
        contact: &Contact,
        content: &str,
        options: &SendOptions,
    ) -> Result<SendReceipt, HandoffError> {
        info!(
            target: "handoff::messaging",
            channel_account_id,
            contact_id = %contact.id,
            kind = options.kind.as_str(),
            transfer_id = options.transfer_id.as_deref().unwrap_or("-"),
            chars = content.chars().count(),
            "customer message (no gateway configured)"
        );
        Ok(SendReceipt::default())
    }
}
