use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::storage::{sqlite::SqliteBackend, StorageBackend, StorageError};

/// How long a connection waits on another writer before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a connection with the pragmas every handle needs. Does not touch the
/// schema; use [`init_db`] for the first handle on a database file.
pub fn open(path: &str) -> Result<Connection, StorageError> {
    let conn = Connection::open(path)?;

    // WAL for concurrent readers; several handles may write to the same file.
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    Ok(conn)
}

pub fn init_db(path: &str) -> Result<Connection, StorageError> {
    let conn = open(path)?;

    // Checkpoint pending WAL data before touching the schema.
    conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS organizations (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            settings TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL REFERENCES organizations(id),
            name TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'agent',
            is_active INTEGER NOT NULL DEFAULT 1,
            is_available INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_users_org ON users(organization_id);

        CREATE TABLE IF NOT EXISTS teams (
            id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL REFERENCES organizations(id),
            name TEXT NOT NULL,
            assignment_strategy TEXT NOT NULL DEFAULT 'round_robin',
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_teams_org ON teams(organization_id);

        CREATE TABLE IF NOT EXISTS team_members (
            team_id TEXT NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            role TEXT NOT NULL DEFAULT 'agent',
            last_assigned_at TEXT,
            created_at TEXT NOT NULL,
            PRIMARY KEY (team_id, user_id)
        );
        CREATE INDEX IF NOT EXISTS idx_team_members_user ON team_members(user_id);

        CREATE TABLE IF NOT EXISTS contacts (
            id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL REFERENCES organizations(id),
            name TEXT,
            phone TEXT NOT NULL,
            assigned_user_id TEXT,
            channel_account_id TEXT,
            chatbot_last_message_at TEXT,
            chatbot_reminder_sent INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_contacts_inactivity
            ON contacts(organization_id, chatbot_last_message_at);

        CREATE TABLE IF NOT EXISTS chatbot_sessions (
            id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL REFERENCES organizations(id),
            contact_id TEXT NOT NULL REFERENCES contacts(id),
            status TEXT NOT NULL DEFAULT 'active',
            started_at TEXT NOT NULL,
            ended_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_chatbot_sessions_contact
            ON chatbot_sessions(organization_id, contact_id, status);

        CREATE TABLE IF NOT EXISTS transfers (
            id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL REFERENCES organizations(id),
            contact_id TEXT NOT NULL REFERENCES contacts(id),
            channel_account_id TEXT NOT NULL,
            team_id TEXT REFERENCES teams(id),
            agent_id TEXT REFERENCES users(id),
            transferred_by TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            source TEXT NOT NULL DEFAULT 'manual',
            notes TEXT,
            sla_response_deadline TEXT,
            sla_resolution_deadline TEXT,
            sla_escalation_deadline TEXT,
            sla_expires_at TEXT,
            sla_breached INTEGER NOT NULL DEFAULT 0,
            sla_breached_at TEXT,
            sla_escalation_level INTEGER NOT NULL DEFAULT 0,
            sla_picked_up_at TEXT,
            sla_first_response_at TEXT,
            status_history TEXT NOT NULL DEFAULT '[]',
            transferred_at TEXT NOT NULL,
            resumed_at TEXT,
            resumed_by TEXT,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_transfers_queue
            ON transfers(organization_id, status, agent_id, transferred_at);
        CREATE INDEX IF NOT EXISTS idx_transfers_agent
            ON transfers(organization_id, agent_id, status);
        CREATE INDEX IF NOT EXISTS idx_transfers_contact
            ON transfers(organization_id, contact_id);

        -- At most one active transfer per contact.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_transfers_one_active
            ON transfers(organization_id, contact_id) WHERE status = 'active';
        ",
    )?;

    Ok(conn)
}

/// Create a SQLite-backed StorageBackend from a path.
pub fn init_sqlite_storage(path: &str) -> Result<Arc<dyn StorageBackend>, StorageError> {
    let conn = init_db(path)?;
    let conn = Arc::new(Mutex::new(conn));
    Ok(Arc::new(SqliteBackend::new(conn)))
}
