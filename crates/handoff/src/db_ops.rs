use chrono::{DateTime, Utc};
use rusqlite::{
    params, params_from_iter, types::Type, Connection, ErrorCode, OptionalExtension,
    TransactionBehavior,
};
use tracing::warn;
use uuid::Uuid;

use handoff_models::*;

use crate::assignment;
use crate::clock;
use crate::error::HandoffError;
use crate::sla;
use crate::storage::{QueueScope, StorageError};

// --- Helpers ---

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn unknown_value(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unknown value '{value}'").into(),
    )
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation
    )
}

/// Append a status transition entry to the transfer's status_history JSON column.
fn append_status_history(
    conn: &Connection,
    transfer_id: &str,
    status: TransferStatus,
    actor_type: &str,
    actor_id: Option<&str>,
    at: &str,
) -> Result<(), StorageError> {
    let existing: String = conn
        .query_row(
            "SELECT COALESCE(status_history, '[]') FROM transfers WHERE id = ?1",
            params![transfer_id],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or_else(|| "[]".to_string());

    let mut history: Vec<StatusHistoryEntry> = serde_json::from_str(&existing).unwrap_or_default();
    history.push(StatusHistoryEntry {
        status: status.as_str().to_string(),
        actor_id: actor_id.map(|s| s.to_string()),
        actor_type: Some(actor_type.to_string()),
        timestamp: at.to_string(),
    });

    let json = serde_json::to_string(&history).map_err(|e| StorageError::Corrupt(e.to_string()))?;
    conn.execute(
        "UPDATE transfers SET status_history = ?1 WHERE id = ?2",
        params![json, transfer_id],
    )?;
    Ok(())
}

// --- Organizations ---

fn row_to_organization(row: &rusqlite::Row) -> rusqlite::Result<(Organization, Option<String>)> {
    let raw: String = row.get(2)?;
    let (settings, bad) = match serde_json::from_str::<OrgSettings>(&raw) {
        Ok(s) => (s, None),
        Err(e) => (OrgSettings::default(), Some(e.to_string())),
    };
    Ok((
        Organization {
            id: row.get(0)?,
            name: row.get(1)?,
            settings,
            created_at: row.get(3)?,
        },
        bad,
    ))
}

pub fn create_organization(
    conn: &Connection,
    name: &str,
    settings: &OrgSettings,
) -> Result<Organization, StorageError> {
    let id = new_id();
    let json = serde_json::to_string(settings).map_err(|e| StorageError::Corrupt(e.to_string()))?;
    conn.execute(
        "INSERT INTO organizations (id, name, settings, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![id, name, json, clock::now_stamp()],
    )?;
    get_organization(conn, &id)?
        .ok_or_else(|| StorageError::Corrupt(format!("organization {id} vanished after insert")))
}

pub fn get_organization(conn: &Connection, org_id: &str) -> Result<Option<Organization>, StorageError> {
    let found = conn
        .query_row(
            "SELECT id, name, settings, created_at FROM organizations WHERE id = ?1",
            params![org_id],
            row_to_organization,
        )
        .optional()?;
    match found {
        Some((_, Some(bad))) => Err(StorageError::Corrupt(format!(
            "organization {org_id} settings: {bad}"
        ))),
        Some((org, None)) => Ok(Some(org)),
        None => Ok(None),
    }
}

pub fn update_org_settings(
    conn: &Connection,
    org_id: &str,
    settings: &OrgSettings,
) -> Result<bool, StorageError> {
    let json = serde_json::to_string(settings).map_err(|e| StorageError::Corrupt(e.to_string()))?;
    let rows = conn.execute(
        "UPDATE organizations SET settings = ?1 WHERE id = ?2",
        params![json, org_id],
    )?;
    Ok(rows > 0)
}

/// Organizations with SLA or client inactivity switched on. Organizations
/// with unreadable settings are skipped so they cannot stall everyone else.
pub fn list_scheduled_organizations(conn: &Connection) -> Result<Vec<Organization>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT id, name, settings, created_at FROM organizations
         WHERE json_valid(settings) = 0
            OR json_extract(settings, '$.sla.enabled') = 1
            OR json_extract(settings, '$.client_inactivity.enabled') = 1
         ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map([], row_to_organization)?;
    let mut orgs = Vec::new();
    for row in rows {
        let (org, bad) = row?;
        if let Some(bad) = bad {
            warn!(organization_id = %org.id, error = %bad, "skipping organization with unreadable settings");
            continue;
        }
        if org.settings.needs_scheduler() {
            orgs.push(org);
        }
    }
    Ok(orgs)
}

// --- Users ---

fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
    let role: String = row.get(3)?;
    Ok(User {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        name: row.get(2)?,
        role: UserRole::from_str(&role).ok_or_else(|| unknown_value(3, &role))?,
        is_active: row.get::<_, i64>(4)? != 0,
        is_available: row.get::<_, i64>(5)? != 0,
    })
}

pub fn create_user(conn: &Connection, org_id: &str, input: &CreateUser) -> Result<User, StorageError> {
    let id = new_id();
    conn.execute(
        "INSERT INTO users (id, organization_id, name, role, is_active, is_available, created_at)
         VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6)",
        params![
            id,
            org_id,
            input.name,
            input.role.as_str(),
            input.is_available as i64,
            clock::now_stamp()
        ],
    )?;
    get_user(conn, org_id, &id)?
        .ok_or_else(|| StorageError::Corrupt(format!("user {id} vanished after insert")))
}

pub fn get_user(conn: &Connection, org_id: &str, user_id: &str) -> Result<Option<User>, StorageError> {
    Ok(conn
        .query_row(
            "SELECT id, organization_id, name, role, is_active, is_available
             FROM users WHERE id = ?1 AND organization_id = ?2",
            params![user_id, org_id],
            row_to_user,
        )
        .optional()?)
}

pub fn set_user_availability(
    conn: &Connection,
    org_id: &str,
    user_id: &str,
    available: bool,
) -> Result<bool, StorageError> {
    let rows = conn.execute(
        "UPDATE users SET is_available = ?1 WHERE id = ?2 AND organization_id = ?3",
        params![available as i64, user_id, org_id],
    )?;
    Ok(rows > 0)
}

// --- Teams ---

fn row_to_team(row: &rusqlite::Row) -> rusqlite::Result<Team> {
    let strategy: String = row.get(3)?;
    Ok(Team {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        name: row.get(2)?,
        assignment_strategy: AssignmentStrategy::parse_or_default(&strategy),
        is_active: row.get::<_, i64>(4)? != 0,
    })
}

pub fn create_team(conn: &Connection, org_id: &str, input: &CreateTeam) -> Result<Team, StorageError> {
    let id = new_id();
    conn.execute(
        "INSERT INTO teams (id, organization_id, name, assignment_strategy, is_active, created_at)
         VALUES (?1, ?2, ?3, ?4, 1, ?5)",
        params![id, org_id, input.name, input.assignment_strategy, clock::now_stamp()],
    )?;
    get_team(conn, org_id, &id)?
        .ok_or_else(|| StorageError::Corrupt(format!("team {id} vanished after insert")))
}

pub fn get_team(conn: &Connection, org_id: &str, team_id: &str) -> Result<Option<Team>, StorageError> {
    Ok(conn
        .query_row(
            "SELECT id, organization_id, name, assignment_strategy, is_active
             FROM teams WHERE id = ?1 AND organization_id = ?2",
            params![team_id, org_id],
            row_to_team,
        )
        .optional()?)
}

pub fn set_team_active(
    conn: &Connection,
    org_id: &str,
    team_id: &str,
    active: bool,
) -> Result<bool, StorageError> {
    let rows = conn.execute(
        "UPDATE teams SET is_active = ?1 WHERE id = ?2 AND organization_id = ?3",
        params![active as i64, team_id, org_id],
    )?;
    Ok(rows > 0)
}

fn row_to_member(row: &rusqlite::Row) -> rusqlite::Result<TeamMember> {
    let role: String = row.get(2)?;
    Ok(TeamMember {
        team_id: row.get(0)?,
        user_id: row.get(1)?,
        role: MemberRole::from_str(&role).ok_or_else(|| unknown_value(2, &role))?,
        last_assigned_at: row.get(3)?,
    })
}

pub fn add_team_member(
    conn: &Connection,
    team_id: &str,
    user_id: &str,
    role: MemberRole,
) -> Result<TeamMember, StorageError> {
    conn.execute(
        "INSERT INTO team_members (team_id, user_id, role, created_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(team_id, user_id) DO UPDATE SET role = excluded.role",
        params![team_id, user_id, role.as_str(), clock::now_stamp()],
    )?;
    Ok(conn.query_row(
        "SELECT team_id, user_id, role, last_assigned_at FROM team_members
         WHERE team_id = ?1 AND user_id = ?2",
        params![team_id, user_id],
        row_to_member,
    )?)
}

pub fn list_team_members(conn: &Connection, team_id: &str) -> Result<Vec<TeamMember>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT team_id, user_id, role, last_assigned_at FROM team_members
         WHERE team_id = ?1 ORDER BY created_at ASC, rowid ASC",
    )?;
    let rows = stmt.query_map(params![team_id], row_to_member)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn team_ids_for_user(
    conn: &Connection,
    org_id: &str,
    user_id: &str,
) -> Result<Vec<String>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT tm.team_id FROM team_members tm
         INNER JOIN teams t ON t.id = tm.team_id
         WHERE tm.user_id = ?1 AND t.organization_id = ?2
         ORDER BY tm.team_id",
    )?;
    let rows = stmt.query_map(params![user_id, org_id], |row| row.get(0))?;
    Ok(rows.collect::<Result<Vec<String>, _>>()?)
}

pub fn is_team_member(
    conn: &Connection,
    org_id: &str,
    team_id: &str,
    user_id: &str,
) -> Result<bool, StorageError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM team_members tm
         INNER JOIN teams t ON t.id = tm.team_id
         WHERE tm.team_id = ?1 AND tm.user_id = ?2 AND t.organization_id = ?3",
        params![team_id, user_id, org_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// AssignToTeam: run the strategy in its own transaction.
pub fn select_team_agent(
    conn: &mut Connection,
    org_id: &str,
    team_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<String>, StorageError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let selected = assignment::select_agent(&tx, team_id, org_id, now)?;
    tx.commit()?;
    Ok(selected)
}

// --- Contacts & chatbot sessions ---

const CONTACT_COLS: &str = "id, organization_id, name, phone, assigned_user_id, channel_account_id, chatbot_last_message_at, chatbot_reminder_sent";

fn row_to_contact(row: &rusqlite::Row) -> rusqlite::Result<Contact> {
    Ok(Contact {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        name: row.get(2)?,
        phone: row.get(3)?,
        assigned_user_id: row.get(4)?,
        channel_account_id: row.get(5)?,
        chatbot_last_message_at: row.get(6)?,
        chatbot_reminder_sent: row.get::<_, i64>(7)? != 0,
    })
}

pub fn create_contact(
    conn: &Connection,
    org_id: &str,
    input: &CreateContact,
) -> Result<Contact, StorageError> {
    let id = new_id();
    let now = clock::now_stamp();
    conn.execute(
        "INSERT INTO contacts (id, organization_id, name, phone, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![id, org_id, input.name, input.phone, now],
    )?;
    get_contact(conn, org_id, &id)?
        .ok_or_else(|| StorageError::Corrupt(format!("contact {id} vanished after insert")))
}

pub fn get_contact(
    conn: &Connection,
    org_id: &str,
    contact_id: &str,
) -> Result<Option<Contact>, StorageError> {
    let sql = format!(
        "SELECT {} FROM contacts WHERE id = ?1 AND organization_id = ?2",
        CONTACT_COLS
    );
    Ok(conn
        .query_row(&sql, params![contact_id, org_id], row_to_contact)
        .optional()?)
}

fn set_contact_assignment(
    conn: &Connection,
    org_id: &str,
    contact_id: &str,
    user_id: Option<&str>,
    at: &str,
) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE contacts SET assigned_user_id = ?1, updated_at = ?2
         WHERE id = ?3 AND organization_id = ?4",
        params![user_id, at, contact_id, org_id],
    )?;
    Ok(())
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<ChatbotSession> {
    let status: String = row.get(3)?;
    Ok(ChatbotSession {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        contact_id: row.get(2)?,
        status: SessionStatus::from_str(&status).ok_or_else(|| unknown_value(3, &status))?,
        started_at: row.get(4)?,
        ended_at: row.get(5)?,
    })
}

pub fn start_chatbot_session(
    conn: &Connection,
    org_id: &str,
    contact_id: &str,
    now: DateTime<Utc>,
) -> Result<ChatbotSession, StorageError> {
    let id = new_id();
    conn.execute(
        "INSERT INTO chatbot_sessions (id, organization_id, contact_id, status, started_at)
         VALUES (?1, ?2, ?3, 'active', ?4)",
        params![id, org_id, contact_id, clock::stamp(now)],
    )?;
    Ok(conn.query_row(
        "SELECT id, organization_id, contact_id, status, started_at, ended_at
         FROM chatbot_sessions WHERE id = ?1",
        params![id],
        row_to_session,
    )?)
}

pub fn active_chatbot_session(
    conn: &Connection,
    org_id: &str,
    contact_id: &str,
) -> Result<Option<ChatbotSession>, StorageError> {
    Ok(conn
        .query_row(
            "SELECT id, organization_id, contact_id, status, started_at, ended_at
             FROM chatbot_sessions
             WHERE organization_id = ?1 AND contact_id = ?2 AND status = 'active'
             ORDER BY started_at DESC LIMIT 1",
            params![org_id, contact_id],
            row_to_session,
        )
        .optional()?)
}

fn close_chatbot_sessions(
    conn: &Connection,
    org_id: &str,
    contact_id: &str,
    status: SessionStatus,
    at: &str,
) -> Result<usize, StorageError> {
    Ok(conn.execute(
        "UPDATE chatbot_sessions SET status = ?1, ended_at = ?2
         WHERE organization_id = ?3 AND contact_id = ?4 AND status = 'active'",
        params![status.as_str(), at, org_id, contact_id],
    )?)
}

pub fn record_chatbot_message(
    conn: &Connection,
    org_id: &str,
    contact_id: &str,
    channel_account_id: &str,
    at: DateTime<Utc>,
) -> Result<bool, StorageError> {
    let at = clock::stamp(at);
    let rows = conn.execute(
        "UPDATE contacts
         SET chatbot_last_message_at = ?1, chatbot_reminder_sent = 0,
             channel_account_id = ?2, updated_at = ?1
         WHERE id = ?3 AND organization_id = ?4",
        params![at, channel_account_id, contact_id, org_id],
    )?;
    Ok(rows > 0)
}

// --- Transfers ---

const TRANSFER_COLS: &str = "id, organization_id, contact_id, channel_account_id, team_id, agent_id, transferred_by, status, source, notes, sla_response_deadline, sla_resolution_deadline, sla_escalation_deadline, sla_expires_at, sla_breached, sla_breached_at, sla_escalation_level, sla_picked_up_at, sla_first_response_at, status_history, transferred_at, resumed_at, resumed_by, updated_at";

fn row_to_transfer(row: &rusqlite::Row) -> rusqlite::Result<Transfer> {
    let status: String = row.get(7)?;
    let source: String = row.get(8)?;
    let history: Option<String> = row.get(19)?;
    let status_history: Vec<StatusHistoryEntry> = history
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    Ok(Transfer {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        contact_id: row.get(2)?,
        channel_account_id: row.get(3)?,
        team_id: row.get(4)?,
        agent_id: row.get(5)?,
        transferred_by: row.get(6)?,
        status: TransferStatus::from_str(&status).ok_or_else(|| unknown_value(7, &status))?,
        source: TransferSource::from_str(&source).ok_or_else(|| unknown_value(8, &source))?,
        notes: row.get(9)?,
        sla: SlaState {
            response_deadline: row.get(10)?,
            resolution_deadline: row.get(11)?,
            escalation_deadline: row.get(12)?,
            expires_at: row.get(13)?,
            breached: row.get::<_, i64>(14)? != 0,
            breached_at: row.get(15)?,
            escalation_level: row.get(16)?,
            picked_up_at: row.get(17)?,
            first_response_at: row.get(18)?,
        },
        status_history,
        transferred_at: row.get(20)?,
        resumed_at: row.get(21)?,
        resumed_by: row.get(22)?,
        updated_at: row.get(23)?,
    })
}

fn query_transfers(
    conn: &Connection,
    sql: &str,
    values: &[String],
) -> Result<Vec<Transfer>, StorageError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), row_to_transfer)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn get_transfer(conn: &Connection, org_id: &str, id: &str) -> Result<Option<Transfer>, StorageError> {
    let sql = format!(
        "SELECT {} FROM transfers WHERE id = ?1 AND organization_id = ?2",
        TRANSFER_COLS
    );
    Ok(conn
        .query_row(&sql, params![id, org_id], row_to_transfer)
        .optional()?)
}

fn require_transfer(conn: &Connection, org_id: &str, id: &str) -> Result<Transfer, HandoffError> {
    get_transfer(conn, org_id, id)?.ok_or_else(|| HandoffError::NotFound("transfer".to_string()))
}

pub fn active_transfer_for_contact(
    conn: &Connection,
    org_id: &str,
    contact_id: &str,
) -> Result<Option<Transfer>, StorageError> {
    let sql = format!(
        "SELECT {} FROM transfers
         WHERE organization_id = ?1 AND contact_id = ?2 AND status = 'active'
         LIMIT 1",
        TRANSFER_COLS
    );
    Ok(conn
        .query_row(&sql, params![org_id, contact_id], row_to_transfer)
        .optional()?)
}

/// SQL fragment restricting the queue to a scope. Placeholders start at
/// `?{first_param}`; the returned values bind in order.
fn scope_clause(scope: &QueueScope, first_param: usize) -> (String, Vec<String>) {
    match scope {
        QueueScope::All => (String::new(), vec![]),
        QueueScope::Team(team_id) => (
            format!(" AND team_id = ?{first_param}"),
            vec![team_id.clone()],
        ),
        QueueScope::MemberOf(team_ids) if team_ids.is_empty() => {
            (" AND team_id IS NULL".to_string(), vec![])
        }
        QueueScope::MemberOf(team_ids) => {
            let placeholders: Vec<String> = (0..team_ids.len())
                .map(|i| format!("?{}", first_param + i))
                .collect();
            (
                format!(
                    " AND (team_id IS NULL OR team_id IN ({}))",
                    placeholders.join(", ")
                ),
                team_ids.clone(),
            )
        }
    }
}

/// Unassigned active transfers in scope, oldest first.
pub fn list_queue(
    conn: &Connection,
    org_id: &str,
    scope: &QueueScope,
) -> Result<Vec<Transfer>, StorageError> {
    let (clause, scope_values) = scope_clause(scope, 2);
    let sql = format!(
        "SELECT {} FROM transfers
         WHERE organization_id = ?1 AND status = 'active' AND agent_id IS NULL{}
         ORDER BY transferred_at ASC, rowid ASC",
        TRANSFER_COLS, clause
    );
    let mut values = vec![org_id.to_string()];
    values.extend(scope_values);
    query_transfers(conn, &sql, &values)
}

fn insert_transfer(conn: &Connection, t: &Transfer) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO transfers (id, organization_id, contact_id, channel_account_id, team_id, agent_id,
             transferred_by, status, source, notes, sla_response_deadline, sla_resolution_deadline,
             sla_escalation_deadline, sla_expires_at, transferred_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            t.id,
            t.organization_id,
            t.contact_id,
            t.channel_account_id,
            t.team_id,
            t.agent_id,
            t.transferred_by,
            t.status.as_str(),
            t.source.as_str(),
            t.notes,
            t.sla.response_deadline,
            t.sla.resolution_deadline,
            t.sla.escalation_deadline,
            t.sla.expires_at,
            t.transferred_at,
            t.updated_at,
        ],
    )
}

fn available_user(conn: &Connection, org_id: &str, user_id: &str) -> Result<User, HandoffError> {
    let user = get_user(conn, org_id, user_id)?
        .ok_or_else(|| HandoffError::NotFound(format!("agent {user_id}")))?;
    if !user.can_take_conversations() {
        return Err(HandoffError::Validation(format!(
            "agent '{}' is not available",
            user.name
        )));
    }
    Ok(user)
}

/// Agent resolution for a new transfer: explicit agent, then the team's
/// strategy, then the contact's previous agent when sticky routing is on.
fn resolve_agent(
    conn: &Connection,
    org_id: &str,
    input: &CreateTransfer,
    contact: &Contact,
    settings: &OrgSettings,
    now: DateTime<Utc>,
) -> Result<Option<String>, HandoffError> {
    if let Some(agent_id) = input.agent_id.as_deref() {
        return Ok(Some(available_user(conn, org_id, agent_id)?.id));
    }
    if let Some(team_id) = input.team_id.as_deref() {
        return Ok(assignment::select_agent(conn, team_id, org_id, now)?);
    }
    if settings.assign_to_same_agent {
        if let Some(previous) = contact.assigned_user_id.as_deref() {
            if let Some(user) = get_user(conn, org_id, previous)? {
                if user.can_take_conversations() {
                    return Ok(Some(user.id));
                }
            }
        }
    }
    Ok(None)
}

pub fn create_transfer(
    conn: &mut Connection,
    org_id: &str,
    input: &CreateTransfer,
    initiated_by: Option<&str>,
    settings: &OrgSettings,
    now: DateTime<Utc>,
) -> Result<Transfer, HandoffError> {
    // Dropping the transaction without commit rolls everything back.
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let contact = get_contact(&tx, org_id, &input.contact_id)?
        .ok_or_else(|| HandoffError::NotFound("contact".to_string()))?;

    if let Some(existing) = active_transfer_for_contact(&tx, org_id, &contact.id)? {
        return Err(HandoffError::Conflict(format!(
            "contact already has an active transfer ({})",
            existing.id
        )));
    }

    if let Some(team_id) = input.team_id.as_deref() {
        if get_team(&tx, org_id, team_id)?.is_none() {
            return Err(HandoffError::NotFound("team".to_string()));
        }
    }

    let agent_id = resolve_agent(&tx, org_id, input, &contact, settings, now)?;

    let at = clock::stamp(now);
    let mut transfer = Transfer {
        id: new_id(),
        organization_id: org_id.to_string(),
        contact_id: contact.id.clone(),
        channel_account_id: input.channel_account_id.clone(),
        team_id: input.team_id.clone(),
        agent_id,
        transferred_by: initiated_by.map(|s| s.to_string()),
        status: TransferStatus::Active,
        source: input.source.unwrap_or_default(),
        notes: input.notes.clone().filter(|n| !n.trim().is_empty()),
        sla: SlaState::default(),
        status_history: vec![],
        transferred_at: at.clone(),
        resumed_at: None,
        resumed_by: None,
        updated_at: at.clone(),
    };
    sla::set_sla_deadlines(&mut transfer, &settings.sla, now);

    match insert_transfer(&tx, &transfer) {
        Ok(_) => {}
        // A concurrent creator won the race on the one-active-per-contact index.
        Err(e) if is_unique_violation(&e) => {
            return Err(HandoffError::Conflict(
                "contact already has an active transfer".to_string(),
            ))
        }
        Err(e) => return Err(e.into()),
    }

    if let Some(agent_id) = transfer.agent_id.as_deref() {
        set_contact_assignment(&tx, org_id, &contact.id, Some(agent_id), &at)?;
    }
    close_chatbot_sessions(&tx, org_id, &contact.id, SessionStatus::Cancelled, &at)?;
    append_status_history(
        &tx,
        &transfer.id,
        TransferStatus::Active,
        if initiated_by.is_some() { "user" } else { "system" },
        initiated_by,
        &at,
    )?;

    tx.commit()?;
    require_transfer(conn, org_id, &transfer.id)
}

pub fn assign_transfer(
    conn: &mut Connection,
    org_id: &str,
    id: &str,
    agent_id: &str,
    now: DateTime<Utc>,
) -> Result<Transfer, HandoffError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let transfer = require_transfer(&tx, org_id, id)?;
    if !transfer.is_active() {
        return Err(HandoffError::Conflict(format!(
            "transfer is {}; only active transfers can be assigned",
            transfer.status.as_str()
        )));
    }
    let agent = available_user(&tx, org_id, agent_id)?;

    let at = clock::stamp(now);
    let rows = tx.execute(
        "UPDATE transfers SET agent_id = ?1, updated_at = ?2
         WHERE id = ?3 AND organization_id = ?4 AND status = 'active'",
        params![agent.id, at, id, org_id],
    )?;
    if rows == 0 {
        return Err(HandoffError::Conflict("transfer is no longer active".to_string()));
    }
    set_contact_assignment(&tx, org_id, &transfer.contact_id, Some(&agent.id), &at)?;

    tx.commit()?;
    require_transfer(conn, org_id, id)
}

/// Claim the oldest unassigned active transfer in scope for `agent_id`.
///
/// SQLite has no `SKIP LOCKED`, so the claim is a compare-and-swap: the
/// UPDATE re-checks `agent_id IS NULL AND status = 'active'` on the row the
/// subquery picked, inside an immediate (write-locked) transaction. Two
/// pickers can never both see their UPDATE succeed on the same row; a picker
/// blocked on the write lock waits on `busy_timeout` and then sees the next
/// row as the oldest eligible one.
pub fn pick_next_transfer(
    conn: &mut Connection,
    org_id: &str,
    agent_id: &str,
    scope: &QueueScope,
    now: DateTime<Utc>,
) -> Result<Option<Transfer>, HandoffError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let at = clock::stamp(now);
    let (clause, scope_values) = scope_clause(scope, 4);
    let sql = format!(
        "UPDATE transfers
         SET agent_id = ?1, transferred_by = COALESCE(transferred_by, ?1), updated_at = ?2
         WHERE id = (
             SELECT id FROM transfers
             WHERE organization_id = ?3 AND status = 'active' AND agent_id IS NULL{}
             ORDER BY transferred_at ASC, rowid ASC
             LIMIT 1
         )
         AND status = 'active' AND agent_id IS NULL
         RETURNING id",
        clause
    );
    let mut values = vec![agent_id.to_string(), at.clone(), org_id.to_string()];
    values.extend(scope_values);

    let claimed: Option<String> = tx
        .query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))
        .optional()?;
    let Some(id) = claimed else {
        return Ok(None);
    };

    let mut transfer = require_transfer(&tx, org_id, &id)?;
    sla::update_sla_on_pickup(&mut transfer, now);
    tx.execute(
        "UPDATE transfers
         SET sla_picked_up_at = ?1,
             sla_breached = MAX(sla_breached, ?2),
             sla_breached_at = COALESCE(sla_breached_at, ?3)
         WHERE id = ?4",
        params![
            transfer.sla.picked_up_at,
            transfer.sla.breached as i64,
            transfer.sla.breached_at,
            id
        ],
    )?;
    set_contact_assignment(&tx, org_id, &transfer.contact_id, Some(agent_id), &at)?;

    tx.commit()?;
    Ok(Some(require_transfer(conn, org_id, &id)?))
}

pub fn resume_transfer(
    conn: &mut Connection,
    org_id: &str,
    id: &str,
    resumed_by: Option<&str>,
    clear_contact_assignment: bool,
    now: DateTime<Utc>,
) -> Result<Transfer, HandoffError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let transfer = require_transfer(&tx, org_id, id)?;
    let at = clock::stamp(now);
    let rows = tx.execute(
        "UPDATE transfers SET status = 'resumed', resumed_at = ?1, resumed_by = ?2, updated_at = ?1
         WHERE id = ?3 AND organization_id = ?4 AND status = 'active'",
        params![at, resumed_by, id, org_id],
    )?;
    if rows == 0 {
        return Err(HandoffError::Conflict(format!(
            "transfer is {}; only active transfers can be resumed",
            transfer.status.as_str()
        )));
    }
    if clear_contact_assignment {
        set_contact_assignment(&tx, org_id, &transfer.contact_id, None, &at)?;
    }
    append_status_history(
        &tx,
        id,
        TransferStatus::Resumed,
        if resumed_by.is_some() { "user" } else { "system" },
        resumed_by,
        &at,
    )?;

    tx.commit()?;
    require_transfer(conn, org_id, id)
}

pub fn record_first_response(
    conn: &mut Connection,
    org_id: &str,
    id: &str,
    now: DateTime<Utc>,
) -> Result<Transfer, HandoffError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut transfer = require_transfer(&tx, org_id, id)?;
    if sla::update_sla_on_first_response(&mut transfer, now) {
        tx.execute(
            "UPDATE transfers SET sla_first_response_at = ?1, updated_at = ?1
             WHERE id = ?2 AND organization_id = ?3 AND sla_first_response_at IS NULL",
            params![transfer.sla.first_response_at, id, org_id],
        )?;
    }
    tx.commit()?;
    require_transfer(conn, org_id, id)
}

// --- SLA passes ---

pub fn expired_transfers(
    conn: &Connection,
    org_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<Transfer>, StorageError> {
    let sql = format!(
        "SELECT {} FROM transfers
         WHERE organization_id = ?1 AND status = 'active'
           AND sla_expires_at IS NOT NULL AND sla_expires_at <= ?2
         ORDER BY transferred_at ASC",
        TRANSFER_COLS
    );
    query_transfers(conn, &sql, &[org_id.to_string(), clock::stamp(now)])
}

const APPEND_NOTE: &str =
    "CASE WHEN notes IS NULL OR notes = '' THEN ?{n} ELSE notes || char(10) || ?{n} END";

fn append_note_sql(param: usize) -> String {
    APPEND_NOTE.replace("{n}", &param.to_string())
}

pub fn expire_transfer(
    conn: &mut Connection,
    org_id: &str,
    id: &str,
    note: &str,
    now: DateTime<Utc>,
) -> Result<bool, StorageError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let at = clock::stamp(now);
    let sql = format!(
        "UPDATE transfers SET status = 'expired', notes = {}, updated_at = ?4
         WHERE id = ?1 AND organization_id = ?2 AND status = 'active'
           AND sla_expires_at IS NOT NULL AND sla_expires_at <= ?4",
        append_note_sql(3)
    );
    let rows = tx.execute(&sql, params![id, org_id, note, at])?;
    if rows > 0 {
        append_status_history(&tx, id, TransferStatus::Expired, "system", Some("sla_auto_close"), &at)?;
    }
    tx.commit()?;
    Ok(rows > 0)
}

pub fn escalation_candidates(
    conn: &Connection,
    org_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<Transfer>, StorageError> {
    let sql = format!(
        "SELECT {} FROM transfers
         WHERE organization_id = ?1 AND status = 'active'
           AND sla_escalation_level < {}
           AND sla_escalation_deadline IS NOT NULL AND sla_escalation_deadline <= ?2
         ORDER BY transferred_at ASC",
        TRANSFER_COLS, MAX_ESCALATION_LEVEL
    );
    query_transfers(conn, &sql, &[org_id.to_string(), clock::stamp(now)])
}

pub fn save_escalation(
    conn: &Connection,
    org_id: &str,
    transfer: &Transfer,
    previous_level: i64,
    note: &str,
    now: DateTime<Utc>,
) -> Result<bool, StorageError> {
    let sql = format!(
        "UPDATE transfers
         SET sla_escalation_level = ?1,
             sla_escalation_deadline = ?2,
             sla_breached = MAX(sla_breached, ?3),
             sla_breached_at = COALESCE(sla_breached_at, ?4),
             notes = {},
             updated_at = ?6
         WHERE id = ?7 AND organization_id = ?8 AND status = 'active'
           AND sla_escalation_level = ?9",
        append_note_sql(5)
    );
    let rows = conn.execute(
        &sql,
        params![
            transfer.sla.escalation_level,
            transfer.sla.escalation_deadline,
            transfer.sla.breached as i64,
            transfer.sla.breached_at,
            note,
            clock::stamp(now),
            transfer.id,
            org_id,
            previous_level,
        ],
    )?;
    Ok(rows > 0)
}

/// Flag unassigned active transfers whose response deadline passed. Covers
/// organizations that have a response SLA but no escalation window.
pub fn sweep_breaches(conn: &Connection, org_id: &str, now: DateTime<Utc>) -> Result<usize, StorageError> {
    Ok(conn.execute(
        "UPDATE transfers SET sla_breached = 1, sla_breached_at = ?2, updated_at = ?2
         WHERE organization_id = ?1 AND status = 'active' AND agent_id IS NULL
           AND sla_breached = 0
           AND sla_response_deadline IS NOT NULL AND sla_response_deadline < ?2",
        params![org_id, clock::stamp(now)],
    )?)
}

// --- Client inactivity ---

pub fn inactive_contacts(conn: &Connection, org_id: &str) -> Result<Vec<Contact>, StorageError> {
    let sql = format!(
        "SELECT {} FROM contacts c
         WHERE c.organization_id = ?1 AND c.chatbot_last_message_at IS NOT NULL
           AND NOT EXISTS (
               SELECT 1 FROM transfers t
               WHERE t.organization_id = c.organization_id AND t.contact_id = c.id
                 AND t.status = 'active'
           )
         ORDER BY c.chatbot_last_message_at ASC",
        CONTACT_COLS
            .split(", ")
            .map(|c| format!("c.{c}"))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![org_id], row_to_contact)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Inactivity writes are guarded by the `chatbot_last_message_at` the pass
/// read; a chatbot message recorded since then restarts tracking and wins.
pub fn mark_reminder_sent(
    conn: &Connection,
    org_id: &str,
    contact_id: &str,
    seen_at: &str,
    now: DateTime<Utc>,
) -> Result<bool, StorageError> {
    let rows = conn.execute(
        "UPDATE contacts SET chatbot_reminder_sent = 1, updated_at = ?4
         WHERE id = ?1 AND organization_id = ?2
           AND chatbot_reminder_sent = 0 AND chatbot_last_message_at = ?3",
        params![contact_id, org_id, seen_at, clock::stamp(now)],
    )?;
    Ok(rows > 0)
}

pub fn end_inactive_session(
    conn: &mut Connection,
    org_id: &str,
    contact_id: &str,
    seen_at: &str,
    now: DateTime<Utc>,
) -> Result<bool, StorageError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let at = clock::stamp(now);
    let rows = tx.execute(
        "UPDATE contacts SET chatbot_last_message_at = NULL, chatbot_reminder_sent = 0, updated_at = ?3
         WHERE id = ?1 AND organization_id = ?2 AND chatbot_last_message_at = ?4",
        params![contact_id, org_id, at, seen_at],
    )?;
    if rows > 0 {
        close_chatbot_sessions(&tx, org_id, contact_id, SessionStatus::Completed, &at)?;
    }
    tx.commit()?;
    Ok(rows > 0)
}

pub fn checkpoint(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
    Ok(())
}
