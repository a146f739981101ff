pub mod sqlite;

use chrono::{DateTime, Utc};
use handoff_models::*;
use thiserror::Error;

use crate::error::HandoffError;

/// Error type for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("storage lock poisoned")]
    Poisoned,
}

/// Which part of an organization's queue a caller may see and pick from.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueScope {
    /// Every queued transfer in the organization (administrators).
    All,
    /// One team's queue.
    Team(String),
    /// The given teams plus the unteamed general queue.
    MemberOf(Vec<String>),
}

// --- Storage Traits ---
// Each trait covers a domain. All methods are scoped by `org_id`, the tenant
// boundary; rows from other organizations are never visible.

pub trait TransferStore: Send + Sync {
    /// Check-then-create inside one transaction. Resolves the agent (explicit,
    /// team strategy, sticky agent), reassigns the contact, cancels the
    /// contact's chatbot session and attaches SLA deadlines.
    fn create_transfer(
        &self,
        org_id: &str,
        input: &CreateTransfer,
        initiated_by: Option<&str>,
        settings: &OrgSettings,
        now: DateTime<Utc>,
    ) -> Result<Transfer, HandoffError>;
    fn get_transfer(&self, org_id: &str, id: &str) -> Result<Option<Transfer>, StorageError>;
    fn active_transfer_for_contact(
        &self,
        org_id: &str,
        contact_id: &str,
    ) -> Result<Option<Transfer>, StorageError>;
    fn list_queue(&self, org_id: &str, scope: &QueueScope) -> Result<Vec<Transfer>, StorageError>;
    fn assign_transfer(
        &self,
        org_id: &str,
        id: &str,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Transfer, HandoffError>;
    /// Claim the oldest unassigned active transfer in scope. `Ok(None)` when
    /// nothing is eligible.
    fn pick_next_transfer(
        &self,
        org_id: &str,
        agent_id: &str,
        scope: &QueueScope,
        now: DateTime<Utc>,
    ) -> Result<Option<Transfer>, HandoffError>;
    fn resume_transfer(
        &self,
        org_id: &str,
        id: &str,
        resumed_by: Option<&str>,
        clear_contact_assignment: bool,
        now: DateTime<Utc>,
    ) -> Result<Transfer, HandoffError>;
    fn record_first_response(
        &self,
        org_id: &str,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Transfer, HandoffError>;

    // SLA passes
    fn expired_transfers(
        &self,
        org_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Transfer>, StorageError>;
    /// Returns false when the transfer was no longer active and due.
    fn expire_transfer(
        &self,
        org_id: &str,
        id: &str,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError>;
    fn escalation_candidates(
        &self,
        org_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Transfer>, StorageError>;
    /// Persist an escalation computed from a transfer read at
    /// `previous_level`. Returns false when another writer got there first.
    fn save_escalation(
        &self,
        org_id: &str,
        transfer: &Transfer,
        previous_level: i64,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError>;
    fn sweep_breaches(&self, org_id: &str, now: DateTime<Utc>) -> Result<usize, StorageError>;
}

pub trait TeamStore: Send + Sync {
    fn get_team(&self, org_id: &str, team_id: &str) -> Result<Option<Team>, StorageError>;
    fn list_team_members(&self, team_id: &str) -> Result<Vec<TeamMember>, StorageError>;
    fn team_ids_for_user(&self, org_id: &str, user_id: &str) -> Result<Vec<String>, StorageError>;
    fn is_team_member(
        &self,
        org_id: &str,
        team_id: &str,
        user_id: &str,
    ) -> Result<bool, StorageError>;
    /// Run the team's assignment strategy in its own transaction.
    fn select_team_agent(
        &self,
        org_id: &str,
        team_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, StorageError>;
}

pub trait DirectoryStore: Send + Sync {
    fn create_organization(
        &self,
        name: &str,
        settings: &OrgSettings,
    ) -> Result<Organization, StorageError>;
    fn get_organization(&self, org_id: &str) -> Result<Option<Organization>, StorageError>;
    fn update_org_settings(
        &self,
        org_id: &str,
        settings: &OrgSettings,
    ) -> Result<bool, StorageError>;
    /// Organizations with SLA or client inactivity enabled.
    fn list_scheduled_organizations(&self) -> Result<Vec<Organization>, StorageError>;

    fn create_user(&self, org_id: &str, input: &CreateUser) -> Result<User, StorageError>;
    fn get_user(&self, org_id: &str, user_id: &str) -> Result<Option<User>, StorageError>;
    fn set_user_availability(
        &self,
        org_id: &str,
        user_id: &str,
        available: bool,
    ) -> Result<bool, StorageError>;

    fn create_team(&self, org_id: &str, input: &CreateTeam) -> Result<Team, StorageError>;
    fn set_team_active(&self, org_id: &str, team_id: &str, active: bool)
        -> Result<bool, StorageError>;
    fn add_team_member(
        &self,
        team_id: &str,
        user_id: &str,
        role: MemberRole,
    ) -> Result<TeamMember, StorageError>;

    fn create_contact(&self, org_id: &str, input: &CreateContact) -> Result<Contact, StorageError>;
    fn get_contact(&self, org_id: &str, contact_id: &str) -> Result<Option<Contact>, StorageError>;

    fn start_chatbot_session(
        &self,
        org_id: &str,
        contact_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ChatbotSession, StorageError>;
    fn active_chatbot_session(
        &self,
        org_id: &str,
        contact_id: &str,
    ) -> Result<Option<ChatbotSession>, StorageError>;
    /// Record an automated message to the contact; restarts inactivity tracking.
    fn record_chatbot_message(
        &self,
        org_id: &str,
        contact_id: &str,
        channel_account_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError>;
}

pub trait InactivityStore: Send + Sync {
    /// Contacts with inactivity tracking set and no active transfer.
    fn inactive_contacts(&self, org_id: &str) -> Result<Vec<Contact>, StorageError>;
    /// Both writes apply only while `chatbot_last_message_at` still equals
    /// `seen_at`; they return false when a newer chatbot message arrived.
    fn mark_reminder_sent(
        &self,
        org_id: &str,
        contact_id: &str,
        seen_at: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError>;
    /// Clear inactivity tracking and complete the chatbot session.
    fn end_inactive_session(
        &self,
        org_id: &str,
        contact_id: &str,
        seen_at: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError>;
}

/// Super-trait combining all domain stores.
pub trait StorageBackend: TransferStore + TeamStore + DirectoryStore + InactivityStore {
    /// Flush the write-ahead log; called on graceful shutdown.
    fn checkpoint(&self) -> Result<(), StorageError>;
}
