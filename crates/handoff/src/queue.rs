//! The transfer queue: handing a conversation from the chatbot to a human.
//!
//! `TransferQueue` validates callers and input, delegates the transactional
//! work to the storage backend, then publishes the outcome to the
//! organization's event stream and the lifecycle webhooks. Publishing happens
//! only after the storage transaction committed.

use chrono::{DateTime, Utc};
use handoff_models::*;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{HandoffError, Result};
use crate::events::{kind, EventBus};
use crate::storage::{QueueScope, StorageBackend};
use crate::webhooks::WebhookDispatcher;

/// Result of [`TransferQueue::pick_next_transfer`]. An empty queue is not an error.
#[derive(Debug, Clone)]
pub enum PickOutcome {
    Picked(Transfer),
    QueueEmpty,
}

impl PickOutcome {
    pub fn into_transfer(self) -> Option<Transfer> {
        match self {
            PickOutcome::Picked(t) => Some(t),
            PickOutcome::QueueEmpty => None,
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn require_field(value: &str, name: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(HandoffError::Validation(format!("{name} is required")));
    }
    Ok(trimmed.to_string())
}

#[derive(Clone)]
pub struct TransferQueue {
    storage: Arc<dyn StorageBackend>,
    events: EventBus,
    webhooks: WebhookDispatcher,
}

impl TransferQueue {
    pub fn new(storage: Arc<dyn StorageBackend>, events: EventBus, webhooks: WebhookDispatcher) -> Self {
        Self {
            storage,
            events,
            webhooks,
        }
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn settings(&self, org_id: &str) -> Result<OrgSettings> {
        self.storage
            .get_organization(org_id)?
            .map(|org| org.settings)
            .ok_or_else(|| HandoffError::NotFound("organization".to_string()))
    }

    fn publish(&self, event_type: &str, transfer: &Transfer) {
        self.events.notify_org(
            &transfer.organization_id,
            event_type,
            transfer.agent_id.as_deref(),
            serde_json::json!({ "transfer": transfer }),
        );
        self.webhooks.dispatch(event_type, transfer);
    }

    /// Which part of the queue `caller` may see. A team filter requires
    /// membership unless the caller is an administrator.
    fn scope_for(&self, caller: &Identity, team_id: Option<&str>) -> Result<QueueScope> {
        let org_id = caller.organization_id();
        match (team_id, caller.user_id()) {
            (Some(team_id), Some(user_id)) if !caller.is_admin() => {
                if !self.storage.is_team_member(org_id, team_id, user_id)? {
                    return Err(HandoffError::Forbidden(
                        "you are not a member of this team".to_string(),
                    ));
                }
                Ok(QueueScope::Team(team_id.to_string()))
            }
            (Some(team_id), _) => Ok(QueueScope::Team(team_id.to_string())),
            (None, _) if caller.is_admin() => Ok(QueueScope::All),
            (None, Some(user_id)) => Ok(QueueScope::MemberOf(
                self.storage.team_ids_for_user(org_id, user_id)?,
            )),
            (None, None) => Ok(QueueScope::All),
        }
    }

    pub fn create_transfer(&self, caller: &Identity, input: CreateTransfer) -> Result<Transfer> {
        self.create_transfer_at(caller, input, Utc::now())
    }

    /// Hand a contact over to a human. Fails with `Conflict` when the contact
    /// already has an active transfer; nothing is written in that case.
    pub fn create_transfer_at(
        &self,
        caller: &Identity,
        input: CreateTransfer,
        now: DateTime<Utc>,
    ) -> Result<Transfer> {
        let org_id = caller.organization_id();
        let input = CreateTransfer {
            contact_id: require_field(&input.contact_id, "contact_id")?,
            channel_account_id: require_field(&input.channel_account_id, "channel_account_id")?,
            agent_id: non_empty(input.agent_id.as_deref()),
            team_id: non_empty(input.team_id.as_deref()),
            notes: input.notes,
            source: input.source,
        };
        let settings = self.settings(org_id)?;

        let transfer =
            self.storage
                .create_transfer(org_id, &input, caller.user_id(), &settings, now)?;

        info!(
            transfer_id = %transfer.id,
            organization_id = %org_id,
            contact_id = %transfer.contact_id,
            agent_id = transfer.agent_id.as_deref().unwrap_or("-"),
            team_id = transfer.team_id.as_deref().unwrap_or("-"),
            source = transfer.source.as_str(),
            "transfer created"
        );
        self.publish(kind::TRANSFER_CREATED, &transfer);
        Ok(transfer)
    }

    /// Assign an active transfer. Agents may only take it themselves and
    /// must not name an agent; managers and administrators may name any
    /// available agent.
    pub fn assign_transfer(
        &self,
        caller: &Identity,
        transfer_id: &str,
        input: &AssignTransfer,
    ) -> Result<Transfer> {
        let org_id = caller.organization_id();
        let requested = non_empty(input.agent_id.as_deref());
        let agent_id = match (requested, caller.user_id()) {
            (Some(_), Some(_)) if !caller.can_manage() => {
                return Err(HandoffError::Forbidden(
                    "only managers can assign transfers to a named agent".to_string(),
                ))
            }
            (Some(agent_id), _) => agent_id,
            (None, Some(me)) => me.to_string(),
            (None, None) => return Err(HandoffError::Validation("agent_id is required".to_string())),
        };

        let transfer = self
            .storage
            .assign_transfer(org_id, transfer_id, &agent_id, Utc::now())?;

        info!(transfer_id, organization_id = %org_id, agent_id = %agent_id, by = caller.author_id(), "transfer assigned");
        self.publish(kind::TRANSFER_ASSIGNED, &transfer);
        Ok(transfer)
    }

    pub fn pick_next_transfer(&self, caller: &Identity, team_id: Option<&str>) -> Result<PickOutcome> {
        self.pick_next_transfer_at(caller, team_id, Utc::now())
    }

    /// Claim the oldest unassigned transfer the caller may see. Two callers
    /// never receive the same transfer.
    pub fn pick_next_transfer_at(
        &self,
        caller: &Identity,
        team_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<PickOutcome> {
        let org_id = caller.organization_id();
        let Some(agent_id) = caller.user_id() else {
            return Err(HandoffError::Forbidden(
                "picking a transfer requires an agent".to_string(),
            ));
        };
        let team_id = non_empty(team_id);
        let scope = self.scope_for(caller, team_id.as_deref())?;

        match self.storage.pick_next_transfer(org_id, agent_id, &scope, now)? {
            Some(transfer) => {
                info!(
                    transfer_id = %transfer.id,
                    organization_id = %org_id,
                    agent_id,
                    breached = transfer.sla.breached,
                    "transfer picked"
                );
                self.publish(kind::TRANSFER_ASSIGNED, &transfer);
                Ok(PickOutcome::Picked(transfer))
            }
            None => {
                debug!(organization_id = %org_id, agent_id, ?scope, "queue empty");
                Ok(PickOutcome::QueueEmpty)
            }
        }
    }

    /// Hand the conversation back to the chatbot.
    pub fn resume_from_transfer(&self, caller: &Identity, transfer_id: &str) -> Result<Transfer> {
        let org_id = caller.organization_id();
        let settings = self.settings(org_id)?;
        let transfer = self.storage.resume_transfer(
            org_id,
            transfer_id,
            caller.user_id(),
            !settings.assign_to_same_agent,
            Utc::now(),
        )?;

        info!(transfer_id, organization_id = %org_id, by = caller.author_id(), "transfer resumed");
        self.publish(kind::TRANSFER_RESUMED, &transfer);
        Ok(transfer)
    }

    /// Run a team's assignment strategy without creating a transfer.
    pub fn assign_to_team(&self, team_id: &str, org_id: &str) -> Result<Option<String>> {
        let team_id = require_field(team_id, "team_id")?;
        if self.storage.get_team(org_id, &team_id)?.is_none() {
            return Err(HandoffError::NotFound("team".to_string()));
        }
        Ok(self.storage.select_team_agent(org_id, &team_id, Utc::now())?)
    }

    pub fn record_first_response(&self, caller: &Identity, transfer_id: &str) -> Result<Transfer> {
        self.storage
            .record_first_response(caller.organization_id(), transfer_id, Utc::now())
    }

    pub fn get_transfer(&self, caller: &Identity, transfer_id: &str) -> Result<Transfer> {
        self.storage
            .get_transfer(caller.organization_id(), transfer_id)?
            .ok_or_else(|| HandoffError::NotFound("transfer".to_string()))
    }

    /// Unassigned active transfers the caller may pick, oldest first.
    pub fn list_queue(&self, caller: &Identity, team_id: Option<&str>) -> Result<Vec<Transfer>> {
        let team_id = non_empty(team_id);
        let scope = self.scope_for(caller, team_id.as_deref())?;
        Ok(self.storage.list_queue(caller.organization_id(), &scope)?)
    }
}
