use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// A real-time notification for an organization's connected clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub organization_id: String,
    /// The agent the event concerns, when there is one.
    pub agent_id: Option<String>,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

pub mod kind {
    pub const TRANSFER_CREATED: &str = "transfer.created";
    pub const TRANSFER_ASSIGNED: &str = "transfer.assigned";
    pub const TRANSFER_RESUMED: &str = "transfer.resumed";
    pub const TRANSFER_ESCALATED: &str = "transfer.escalated";
    pub const TRANSFER_EXPIRED: &str = "transfer.expired";
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn emit(&self, event: Event) {
        // Ignore send errors (no active receivers)
        let _ = self.sender.send(event);
    }

    /// Broadcast to everyone listening on `org_id`.
    pub fn notify_org(
        &self,
        org_id: &str,
        event_type: &str,
        agent_id: Option<&str>,
        data: serde_json::Value,
    ) {
        self.emit(Event {
            event_type: event_type.to_string(),
            organization_id: org_id.to_string(),
            agent_id: agent_id.map(|s| s.to_string()),
            data,
            timestamp: Utc::now(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_org_reaches_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.notify_org(
            "org-1",
            kind::TRANSFER_CREATED,
            Some("agent-7"),
            serde_json::json!({"transfer_id": "t-1"}),
        );

        let received = rx.recv().await.expect("should receive event");
        assert_eq!(received.event_type, "transfer.created");
        assert_eq!(received.organization_id, "org-1");
        assert_eq!(received.agent_id.as_deref(), Some("agent-7"));
        assert_eq!(received.data["transfer_id"], "t-1");
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.notify_org("org-1", kind::TRANSFER_ESCALATED, None, serde_json::json!({}));

        let e1 = rx1.recv().await.expect("rx1 should receive");
        let e2 = rx2.recv().await.expect("rx2 should receive");
        assert_eq!(e1.event_type, "transfer.escalated");
        assert_eq!(e2.event_type, "transfer.escalated");
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.notify_org("org-1", kind::TRANSFER_EXPIRED, None, serde_json::Value::Null);
    }
}
