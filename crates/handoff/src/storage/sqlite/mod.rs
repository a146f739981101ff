use chrono::{DateTime, Utc};
use handoff_models::*;
use rusqlite::Connection;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::db_ops;
use crate::error::HandoffError;
use crate::storage::*;

/// SQLite-backed storage implementation.
/// Wraps a `Mutex<Connection>` and delegates to `db_ops` functions. Several
/// backends may point at the same database file; SQLite's write lock plus the
/// connection busy timeout serialize them.
pub struct SqliteBackend {
    pub conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }
}

impl TransferStore for SqliteBackend {
    fn create_transfer(
        &self,
        org_id: &str,
        input: &CreateTransfer,
        initiated_by: Option<&str>,
        settings: &OrgSettings,
        now: DateTime<Utc>,
    ) -> Result<Transfer, HandoffError> {
        db_ops::create_transfer(&mut *self.lock()?, org_id, input, initiated_by, settings, now)
    }
    fn get_transfer(&self, org_id: &str, id: &str) -> Result<Option<Transfer>, StorageError> {
        db_ops::get_transfer(&*self.lock()?, org_id, id)
    }
    fn active_transfer_for_contact(
        &self,
        org_id: &str,
        contact_id: &str,
    ) -> Result<Option<Transfer>, StorageError> {
        db_ops::active_transfer_for_contact(&*self.lock()?, org_id, contact_id)
    }
    fn list_queue(&self, org_id: &str, scope: &QueueScope) -> Result<Vec<Transfer>, StorageError> {
        db_ops::list_queue(&*self.lock()?, org_id, scope)
    }
    fn assign_transfer(
        &self,
        org_id: &str,
        id: &str,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Transfer, HandoffError> {
        db_ops::assign_transfer(&mut *self.lock()?, org_id, id, agent_id, now)
    }
    fn pick_next_transfer(
        &self,
        org_id: &str,
        agent_id: &str,
        scope: &QueueScope,
        now: DateTime<Utc>,
    ) -> Result<Option<Transfer>, HandoffError> {
        db_ops::pick_next_transfer(&mut *self.lock()?, org_id, agent_id, scope, now)
    }
    fn resume_transfer(
        &self,
        org_id: &str,
        id: &str,
        resumed_by: Option<&str>,
        clear_contact_assignment: bool,
        now: DateTime<Utc>,
    ) -> Result<Transfer, HandoffError> {
        db_ops::resume_transfer(
            &mut *self.lock()?,
            org_id,
            id,
            resumed_by,
            clear_contact_assignment,
            now,
        )
    }
    fn record_first_response(
        &self,
        org_id: &str,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Transfer, HandoffError> {
        db_ops::record_first_response(&mut *self.lock()?, org_id, id, now)
    }
    fn expired_transfers(
        &self,
        org_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Transfer>, StorageError> {
        db_ops::expired_transfers(&*self.lock()?, org_id, now)
    }
    fn expire_transfer(
        &self,
        org_id: &str,
        id: &str,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        db_ops::expire_transfer(&mut *self.lock()?, org_id, id, note, now)
    }
    fn escalation_candidates(
        &self,
        org_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Transfer>, StorageError> {
        db_ops::escalation_candidates(&*self.lock()?, org_id, now)
    }
    fn save_escalation(
        &self,
        org_id: &str,
        transfer: &Transfer,
        previous_level: i64,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        db_ops::save_escalation(&*self.lock()?, org_id, transfer, previous_level, note, now)
    }
    fn sweep_breaches(&self, org_id: &str, now: DateTime<Utc>) -> Result<usize, StorageError> {
        db_ops::sweep_breaches(&*self.lock()?, org_id, now)
    }
}

impl TeamStore for SqliteBackend {
    fn get_team(&self, org_id: &str, team_id: &str) -> Result<Option<Team>, StorageError> {
        db_ops::get_team(&*self.lock()?, org_id, team_id)
    }
    fn list_team_members(&self, team_id: &str) -> Result<Vec<TeamMember>, StorageError> {
        db_ops::list_team_members(&*self.lock()?, team_id)
    }
    fn team_ids_for_user(&self, org_id: &str, user_id: &str) -> Result<Vec<String>, StorageError> {
        db_ops::team_ids_for_user(&*self.lock()?, org_id, user_id)
    }
    fn is_team_member(
        &self,
        org_id: &str,
        team_id: &str,
        user_id: &str,
    ) -> Result<bool, StorageError> {
        db_ops::is_team_member(&*self.lock()?, org_id, team_id, user_id)
    }
    fn select_team_agent(
        &self,
        org_id: &str,
        team_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, StorageError> {
        db_ops::select_team_agent(&mut *self.lock()?, org_id, team_id, now)
    }
}

impl DirectoryStore for SqliteBackend {
    fn create_organization(
        &self,
        name: &str,
        settings: &OrgSettings,
    ) -> Result<Organization, StorageError> {
        db_ops::create_organization(&*self.lock()?, name, settings)
    }
    fn get_organization(&self, org_id: &str) -> Result<Option<Organization>, StorageError> {
        db_ops::get_organization(&*self.lock()?, org_id)
    }
    fn update_org_settings(
        &self,
        org_id: &str,
        settings: &OrgSettings,
    ) -> Result<bool, StorageError> {
        db_ops::update_org_settings(&*self.lock()?, org_id, settings)
    }
    fn list_scheduled_organizations(&self) -> Result<Vec<Organization>, StorageError> {
        db_ops::list_scheduled_organizations(&*self.lock()?)
    }
    fn create_user(&self, org_id: &str, input: &CreateUser) -> Result<User, StorageError> {
        db_ops::create_user(&*self.lock()?, org_id, input)
    }
    fn get_user(&self, org_id: &str, user_id: &str) -> Result<Option<User>, StorageError> {
        db_ops::get_user(&*self.lock()?, org_id, user_id)
    }
    fn set_user_availability(
        &self,
        org_id: &str,
        user_id: &str,
        available: bool,
    ) -> Result<bool, StorageError> {
        db_ops::set_user_availability(&*self.lock()?, org_id, user_id, available)
    }
    fn create_team(&self, org_id: &str, input: &CreateTeam) -> Result<Team, StorageError> {
        db_ops::create_team(&*self.lock()?, org_id, input)
    }
    fn set_team_active(
        &self,
        org_id: &str,
        team_id: &str,
        active: bool,
    ) -> Result<bool, StorageError> {
        db_ops::set_team_active(&*self.lock()?, org_id, team_id, active)
    }
    fn add_team_member(
        &self,
        team_id: &str,
        user_id: &str,
        role: MemberRole,
    ) -> Result<TeamMember, StorageError> {
        db_ops::add_team_member(&*self.lock()?, team_id, user_id, role)
    }
    fn create_contact(&self, org_id: &str, input: &CreateContact) -> Result<Contact, StorageError> {
        db_ops::create_contact(&*self.lock()?, org_id, input)
    }
    fn get_contact(&self, org_id: &str, contact_id: &str) -> Result<Option<Contact>, StorageError> {
        db_ops::get_contact(&*self.lock()?, org_id, contact_id)
    }
    fn start_chatbot_session(
        &self,
        org_id: &str,
        contact_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ChatbotSession, StorageError> {
        db_ops::start_chatbot_session(&*self.lock()?, org_id, contact_id, now)
    }
    fn active_chatbot_session(
        &self,
        org_id: &str,
        contact_id: &str,
    ) -> Result<Option<ChatbotSession>, StorageError> {
        db_ops::active_chatbot_session(&*self.lock()?, org_id, contact_id)
    }
    fn record_chatbot_message(
        &self,
        org_id: &str,
        contact_id: &str,
        channel_account_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        db_ops::record_chatbot_message(&*self.lock()?, org_id, contact_id, channel_account_id, at)
    }
}

impl InactivityStore for SqliteBackend {
    fn inactive_contacts(&self, org_id: &str) -> Result<Vec<Contact>, StorageError> {
        db_ops::inactive_contacts(&*self.lock()?, org_id)
    }
    fn mark_reminder_sent(
        &self,
        org_id: &str,
        contact_id: &str,
        seen_at: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        db_ops::mark_reminder_sent(&*self.lock()?, org_id, contact_id, seen_at, now)
    }
    fn end_inactive_session(
        &self,
        org_id: &str,
        contact_id: &str,
        seen_at: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        db_ops::end_inactive_session(&mut *self.lock()?, org_id, contact_id, seen_at, now)
    }
}

impl StorageBackend for SqliteBackend {
    fn checkpoint(&self) -> Result<(), StorageError> {
        db_ops::checkpoint(&*self.lock()?)
    }
}
