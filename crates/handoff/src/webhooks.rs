use hmac::{Hmac, Mac};
use handoff_models::Transfer;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Handoff-Signature";

/// Fires transfer lifecycle webhooks to the configured endpoints.
#[derive(Clone)]
pub struct WebhookDispatcher {
    urls: Arc<Vec<String>>,
    secret: Option<Arc<String>>,
    max_attempts: u32,
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(urls: Vec<String>, secret: Option<String>, max_attempts: u32) -> Self {
        Self {
            urls: Arc::new(urls.into_iter().filter(|u| !u.is_empty()).collect()),
            secret: secret.filter(|s| !s.is_empty()).map(Arc::new),
            max_attempts: max_attempts.max(1),
            client: reqwest::Client::new(),
        }
    }

    /// A dispatcher with no endpoints; `dispatch` does nothing.
    pub fn disabled() -> Self {
        Self::new(vec![], None, 1)
    }

    pub fn is_enabled(&self) -> bool {
        !self.urls.is_empty()
    }

    /// Fire `event_type` for `transfer` to every endpoint. Delivery happens
    /// in the background; each endpoint retries with quadratic backoff.
    pub fn dispatch(&self, event_type: &str, transfer: &Transfer) {
        if !self.is_enabled() {
            return;
        }

        let payload = serde_json::json!({
            "event": event_type,
            "organization_id": transfer.organization_id,
            "transfer_id": transfer.id,
            "transfer": transfer,
            "timestamp": chrono::Utc::now().to_rfc3339()
        });
        let body = payload.to_string();
        let signature = self.secret.as_deref().and_then(|s| sign(s, body.as_bytes()));

        for url in self.urls.iter() {
            let client = self.client.clone();
            let url = url.clone();
            let body = body.clone();
            let signature = signature.clone();
            let event_type = event_type.to_string();
            let transfer_id = transfer.id.clone();
            let max_attempts = self.max_attempts;

            tokio::spawn(async move {
                for attempt in 1..=max_attempts {
                    let mut req = client
                        .post(&url)
                        .header("Content-Type", "application/json")
                        .timeout(Duration::from_secs(10))
                        .body(body.clone());
                    if let Some(sig) = &signature {
                        req = req.header(SIGNATURE_HEADER, sig);
                    }

                    match req.send().await {
                        Ok(resp) if resp.status().is_success() => {
                            debug!(%url, event = %event_type, %transfer_id, attempt, "webhook delivered");
                            return;
                        }
                        Ok(resp) => {
                            if attempt == max_attempts {
                                warn!(%url, event = %event_type, %transfer_id, status = %resp.status(), "webhook failed");
                            }
                        }
                        Err(e) => {
                            if attempt == max_attempts {
                                warn!(%url, event = %event_type, %transfer_id, error = %e, "webhook failed");
                            }
                        }
                    }

                    if attempt < max_attempts {
                        tokio::time::sleep(Duration::from_secs(attempt as u64 * attempt as u64)).await;
                    }
                }
            });
        }
    }
}

/// `sha256=<hex hmac>` over the raw request body.
pub fn sign(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}
