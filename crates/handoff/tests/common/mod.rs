#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use tempfile::TempDir;

use handoff::db;
use handoff::events::EventBus;
use handoff::queue::TransferQueue;
use handoff::storage::StorageBackend;
use handoff::webhooks::WebhookDispatcher;
use handoff_models::*;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap()
}

pub fn minutes(m: i64) -> DateTime<Utc> {
    t0() + chrono::Duration::minutes(m)
}

/// One organization on a fresh temp database, with a queue in front of it.
pub struct Fixture {
    pub storage: Arc<dyn StorageBackend>,
    pub queue: TransferQueue,
    pub events: EventBus,
    pub org: Organization,
    pub db_path: String,
    _tmp: TempDir,
}

impl Fixture {
    pub fn new(settings: OrgSettings) -> Self {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let db_path = tmp.path().join("handoff.db").to_str().unwrap().to_string();
        let storage = db::init_sqlite_storage(&db_path).unwrap();
        let org = storage.create_organization("Acme Support", &settings).unwrap();
        let events = EventBus::default();
        let queue = TransferQueue::new(storage.clone(), events.clone(), WebhookDispatcher::disabled());
        Fixture {
            storage,
            queue,
            events,
            org,
            db_path,
            _tmp: tmp,
        }
    }

    pub fn org_id(&self) -> &str {
        &self.org.id
    }

    pub fn system(&self) -> Identity {
        Identity::System {
            organization_id: self.org.id.clone(),
        }
    }

    pub fn as_user(&self, user: &User) -> Identity {
        Identity::User {
            id: user.id.clone(),
            organization_id: self.org.id.clone(),
            role: user.role,
        }
    }

    pub fn agent(&self, name: &str) -> User {
        self.storage.create_user(&self.org.id, &CreateUser::new(name)).unwrap()
    }

    pub fn user(&self, input: CreateUser) -> User {
        self.storage.create_user(&self.org.id, &input).unwrap()
    }

    pub fn contact(&self, phone: &str) -> Contact {
        self.storage
            .create_contact(&self.org.id, &CreateContact::new(phone))
            .unwrap()
    }

    pub fn team(&self, name: &str, strategy: &str, agents: &[&User]) -> Team {
        let team = self
            .storage
            .create_team(&self.org.id, &CreateTeam::new(name, strategy))
            .unwrap();
        for agent in agents {
            self.storage
                .add_team_member(&team.id, &agent.id, MemberRole::Agent)
                .unwrap();
        }
        team
    }

    /// Queue a transfer for `contact` as the chatbot would, at `at`.
    pub fn queue_at(&self, contact: &Contact, at: DateTime<Utc>) -> Transfer {
        self.queue
            .create_transfer_at(
                &self.system(),
                CreateTransfer::new(&contact.id, "acct-1").with_source(TransferSource::Flow),
                at,
            )
            .unwrap()
    }

    pub fn transfer(&self, id: &str) -> Transfer {
        self.storage.get_transfer(&self.org.id, id).unwrap().unwrap()
    }

    pub fn reload_contact(&self, id: &str) -> Contact {
        self.storage.get_contact(&self.org.id, id).unwrap().unwrap()
    }
}

pub fn sla_settings(response: i64, escalation: Option<i64>) -> OrgSettings {
    OrgSettings {
        sla: SlaSettings {
            enabled: true,
            response_minutes: Some(response),
            escalation_minutes: escalation,
            ..Default::default()
        },
        ..Default::default()
    }
}
