//! Per-team auto-assignment.
//!
//! Selection never locks anything itself. It takes a plain `&Connection` so a
//! caller holding a `rusqlite::Transaction` (which derefs to `Connection`) gets
//! the round-robin cursor update inside its own transaction.

use chrono::{DateTime, Utc};
use handoff_models::AssignmentStrategy;
use rusqlite::{params, Connection};
use tracing::{debug, warn};

use crate::clock;
use crate::db_ops;
use crate::storage::StorageError;

/// A team member eligible to receive a conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub user_id: String,
    pub last_assigned_at: Option<String>,
}

/// Least recently assigned first; never-assigned agents before everyone else.
/// Ties keep enumeration order.
pub fn pick_round_robin(candidates: &[Candidate]) -> Option<&Candidate> {
    // `Option` orders `None` before `Some`, and `min_by` keeps the first of equals.
    candidates
        .iter()
        .min_by(|a, b| a.last_assigned_at.cmp(&b.last_assigned_at))
}

/// Fewest active transfers wins; the first enumerated candidate wins ties.
pub fn pick_least_loaded(loads: &[(Candidate, i64)]) -> Option<&Candidate> {
    loads
        .iter()
        .min_by_key(|(_, load)| *load)
        .map(|(candidate, _)| candidate)
}

/// Agents of the team whose user is active and available, in membership order.
pub fn list_candidates(
    conn: &Connection,
    org_id: &str,
    team_id: &str,
) -> Result<Vec<Candidate>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT tm.user_id, tm.last_assigned_at
         FROM team_members tm
         INNER JOIN users u ON u.id = tm.user_id
         WHERE tm.team_id = ?1 AND u.organization_id = ?2
           AND tm.role = 'agent' AND u.is_active = 1 AND u.is_available = 1
         ORDER BY tm.created_at ASC, tm.rowid ASC",
    )?;
    let rows = stmt.query_map(params![team_id, org_id], |row| {
        Ok(Candidate {
            user_id: row.get(0)?,
            last_assigned_at: row.get(1)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn active_load(conn: &Connection, org_id: &str, user_id: &str) -> Result<i64, StorageError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM transfers
         WHERE organization_id = ?1 AND agent_id = ?2 AND status = 'active'",
        params![org_id, user_id],
        |row| row.get(0),
    )?)
}

/// Pick an agent for `team_id` according to the team's strategy.
///
/// Returns `Ok(None)` for manual teams, missing or inactive teams, and teams
/// without an eligible agent. Round robin moves the chosen agent's cursor to
/// `now`.
pub fn select_agent(
    conn: &Connection,
    team_id: &str,
    org_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<String>, StorageError> {
    let Some(team) = db_ops::get_team(conn, org_id, team_id)? else {
        warn!(team_id, organization_id = org_id, "assignment skipped: team not found");
        return Ok(None);
    };
    if !team.is_active {
        warn!(team_id, organization_id = org_id, "assignment skipped: team inactive");
        return Ok(None);
    }

    let selected = match team.assignment_strategy {
        AssignmentStrategy::Manual => None,
        AssignmentStrategy::RoundRobin => {
            let candidates = list_candidates(conn, org_id, team_id)?;
            match pick_round_robin(&candidates) {
                Some(c) => {
                    conn.execute(
                        "UPDATE team_members SET last_assigned_at = ?1
                         WHERE team_id = ?2 AND user_id = ?3",
                        params![clock::stamp(now), team_id, c.user_id],
                    )?;
                    Some(c.user_id.clone())
                }
                None => None,
            }
        }
        AssignmentStrategy::LoadBalanced => {
            let mut loads = Vec::new();
            for c in list_candidates(conn, org_id, team_id)? {
                let load = active_load(conn, org_id, &c.user_id)?;
                loads.push((c, load));
            }
            pick_least_loaded(&loads).map(|c| c.user_id.clone())
        }
    };

    debug!(
        team_id,
        strategy = team.assignment_strategy.as_str(),
        agent_id = selected.as_deref().unwrap_or("-"),
        "team assignment"
    );
    Ok(selected)
}
