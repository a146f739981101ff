//! SLA bookkeeping on a single transfer.
//!
//! These functions only mutate the in-memory [`Transfer`]; callers persist the
//! result with a status-guarded update so that the queue (at pickup time) and
//! the scheduler (on its tick) can both flag a breach without stepping on each
//! other.

use chrono::{DateTime, Duration, Utc};
use handoff_models::{SlaSettings, Transfer, TransferStatus, MAX_ESCALATION_LEVEL};

use crate::clock;

/// True once `deadline` is at or before `now`. Unset deadlines never fall due.
pub fn is_due(deadline: Option<&str>, now: DateTime<Utc>) -> bool {
    deadline
        .and_then(clock::parse)
        .is_some_and(|d| d <= now)
}

/// True once `now` is strictly past `deadline`.
pub fn is_past(deadline: Option<&str>, now: DateTime<Utc>) -> bool {
    deadline
        .and_then(clock::parse)
        .is_some_and(|d| now > d)
}

fn after(base: DateTime<Utc>, window: Option<Duration>) -> Option<String> {
    window.and_then(|w| clock::after(base, w)).map(clock::stamp)
}

/// Attach deadlines relative to `created_at`. Each deadline is independently
/// disabled when its window is zero, absent or too large to represent;
/// nothing is set when SLA is disabled for the organization.
pub fn set_sla_deadlines(transfer: &mut Transfer, settings: &SlaSettings, created_at: DateTime<Utc>) {
    if !settings.enabled {
        return;
    }
    let sla = &mut transfer.sla;
    sla.response_deadline = after(created_at, settings.response_window().and_then(clock::minutes));
    sla.resolution_deadline =
        after(created_at, settings.resolution_window().and_then(clock::minutes));
    sla.escalation_deadline =
        after(created_at, settings.escalation_window().and_then(clock::minutes));
    sla.expires_at = after(
        created_at,
        settings.auto_close_window_hours().and_then(clock::hours),
    );
}

fn mark_breached(transfer: &mut Transfer, now: DateTime<Utc>) -> bool {
    if transfer.sla.breached || !is_past(transfer.sla.response_deadline.as_deref(), now) {
        return false;
    }
    transfer.sla.breached = true;
    transfer.sla.breached_at = Some(clock::stamp(now));
    true
}

/// Pickup hook. Records the pickup time and flags a late pickup as a breach.
/// Returns true if this call set the breach flag.
pub fn update_sla_on_pickup(transfer: &mut Transfer, now: DateTime<Utc>) -> bool {
    if transfer.sla.picked_up_at.is_none() {
        transfer.sla.picked_up_at = Some(clock::stamp(now));
    }
    mark_breached(transfer, now)
}

/// First-response hook. Only the first call has an effect.
pub fn update_sla_on_first_response(transfer: &mut Transfer, now: DateTime<Utc>) -> bool {
    if transfer.sla.first_response_at.is_some() {
        return false;
    }
    transfer.sla.first_response_at = Some(clock::stamp(now));
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Escalation {
    pub level: i64,
    pub newly_breached: bool,
}

impl Escalation {
    pub fn is_first(&self) -> bool {
        self.level == 1
    }
}

/// Escalate an active transfer whose escalation deadline has passed.
///
/// The level is capped at [`MAX_ESCALATION_LEVEL`]. Below the cap the next
/// escalation deadline moves one escalation window past `now`.
pub fn escalate(
    transfer: &mut Transfer,
    settings: &SlaSettings,
    now: DateTime<Utc>,
) -> Option<Escalation> {
    if transfer.status != TransferStatus::Active
        || transfer.sla.escalation_level >= MAX_ESCALATION_LEVEL
        || !is_due(transfer.sla.escalation_deadline.as_deref(), now)
    {
        return None;
    }

    transfer.sla.escalation_level += 1;
    let newly_breached = mark_breached(transfer, now);
    if transfer.sla.escalation_level < MAX_ESCALATION_LEVEL {
        if let Some(window) = settings.escalation_window().and_then(clock::minutes) {
            transfer.sla.escalation_deadline = after(now, Some(window));
        }
    }

    Some(Escalation {
        level: transfer.sla.escalation_level,
        newly_breached,
    })
}

/// Expire guard: active and past the auto-close deadline.
pub fn can_expire(transfer: &Transfer, now: DateTime<Utc>) -> bool {
    transfer.status.can_transition_to(&TransferStatus::Expired)
        && is_due(transfer.sla.expires_at.as_deref(), now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use handoff_models::{SlaState, TransferSource};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap()
    }

    fn transfer() -> Transfer {
        Transfer {
            id: "t-1".into(),
            organization_id: "org-1".into(),
            contact_id: "c-1".into(),
            channel_account_id: "acct-1".into(),
            team_id: None,
            agent_id: None,
            transferred_by: None,
            status: TransferStatus::Active,
            source: TransferSource::Flow,
            notes: None,
            sla: SlaState::default(),
            status_history: vec![],
            transferred_at: clock::stamp(t0()),
            resumed_at: None,
            resumed_by: None,
            updated_at: clock::stamp(t0()),
        }
    }

    fn settings() -> SlaSettings {
        SlaSettings {
            enabled: true,
            response_minutes: Some(10),
            resolution_minutes: Some(60),
            escalation_minutes: Some(15),
            auto_close_hours: Some(24),
            ..Default::default()
        }
    }

    #[test]
    fn deadlines_are_relative_to_creation() {
        let mut t = transfer();
        set_sla_deadlines(&mut t, &settings(), t0());
        assert_eq!(
            t.sla.response_deadline.as_deref(),
            Some("2026-10-16T09:10:00.000Z")
        );
        assert_eq!(
            t.sla.resolution_deadline.as_deref(),
            Some("2026-10-16T10:00:00.000Z")
        );
        assert_eq!(
            t.sla.escalation_deadline.as_deref(),
            Some("2026-10-16T09:15:00.000Z")
        );
        assert_eq!(t.sla.expires_at.as_deref(), Some("2026-10-17T09:00:00.000Z"));
    }

    #[test]
    fn disabled_sla_sets_nothing() {
        let mut t = transfer();
        let mut s = settings();
        s.enabled = false;
        set_sla_deadlines(&mut t, &s, t0());
        assert_eq!(t.sla, SlaState::default());
    }

    #[test]
    fn zero_window_disables_single_deadline() {
        let mut t = transfer();
        let mut s = settings();
        s.escalation_minutes = Some(0);
        s.auto_close_hours = None;
        set_sla_deadlines(&mut t, &s, t0());
        assert!(t.sla.response_deadline.is_some());
        assert!(t.sla.escalation_deadline.is_none());
        assert!(t.sla.expires_at.is_none());
    }

    #[test]
    fn late_pickup_breaches_once() {
        let mut t = transfer();
        set_sla_deadlines(&mut t, &settings(), t0());

        assert!(update_sla_on_pickup(&mut t, t0() + Duration::minutes(11)));
        let breached_at = t.sla.breached_at.clone();
        assert!(t.sla.breached);

        assert!(!update_sla_on_pickup(&mut t, t0() + Duration::minutes(30)));
        assert_eq!(t.sla.breached_at, breached_at);
    }

    #[test]
    fn on_time_pickup_does_not_breach() {
        let mut t = transfer();
        set_sla_deadlines(&mut t, &settings(), t0());
        assert!(!update_sla_on_pickup(&mut t, t0() + Duration::minutes(3)));
        assert!(!t.sla.breached);
        assert!(t.sla.picked_up_at.is_some());
    }

    #[test]
    fn first_response_is_recorded_once() {
        let mut t = transfer();
        assert!(update_sla_on_first_response(&mut t, t0()));
        assert!(!update_sla_on_first_response(&mut t, t0() + Duration::minutes(5)));
        assert_eq!(
            t.sla.first_response_at.as_deref(),
            Some("2026-10-16T09:00:00.000Z")
        );
    }

    #[test]
    fn escalation_caps_at_two() {
        let mut t = transfer();
        let s = settings();
        set_sla_deadlines(&mut t, &s, t0());

        assert!(escalate(&mut t, &s, t0() + Duration::minutes(5)).is_none());

        let first = escalate(&mut t, &s, t0() + Duration::minutes(16)).unwrap();
        assert!(first.is_first());
        assert!(first.newly_breached);
        // Next level waits another window.
        assert!(escalate(&mut t, &s, t0() + Duration::minutes(17)).is_none());

        let second = escalate(&mut t, &s, t0() + Duration::minutes(40)).unwrap();
        assert_eq!(second.level, 2);
        assert!(!second.newly_breached);

        for h in 1..10 {
            assert!(escalate(&mut t, &s, t0() + Duration::hours(h)).is_none());
        }
        assert_eq!(t.sla.escalation_level, MAX_ESCALATION_LEVEL);
    }

    #[test]
    fn second_level_fires_one_window_after_first() {
        let mut t = transfer();
        let s = settings();
        set_sla_deadlines(&mut t, &s, t0());

        let first_at = t0() + Duration::minutes(20);
        escalate(&mut t, &s, first_at).unwrap();
        let window = Duration::minutes(15);
        assert!(escalate(&mut t, &s, first_at + window - Duration::seconds(1)).is_none());
        assert_eq!(escalate(&mut t, &s, first_at + window).unwrap().level, 2);
    }

    #[test]
    fn oversized_windows_disable_deadlines() {
        let mut t = transfer();
        let s = SlaSettings {
            enabled: true,
            response_minutes: Some(10),
            escalation_minutes: Some(i64::MAX / 2),
            auto_close_hours: Some(i64::MAX / 4),
            resolution_minutes: Some(60 * 24 * 365 * 20_000),
            ..Default::default()
        };
        set_sla_deadlines(&mut t, &s, t0());
        assert!(t.sla.response_deadline.is_some());
        assert!(t.sla.escalation_deadline.is_none());
        assert!(t.sla.resolution_deadline.is_none());
        assert!(t.sla.expires_at.is_none());
        assert!(escalate(&mut t, &s, t0() + Duration::days(365)).is_none());
    }

    #[test]
    fn terminal_transfers_never_escalate_or_expire() {
        let mut t = transfer();
        let s = settings();
        set_sla_deadlines(&mut t, &s, t0());
        t.status = TransferStatus::Expired;
        let later = t0() + Duration::days(3);
        assert!(escalate(&mut t, &s, later).is_none());
        assert!(!can_expire(&t, later));

        t.status = TransferStatus::Active;
        assert!(can_expire(&t, later));
        assert!(!can_expire(&t, t0() + Duration::hours(1)));
    }
}
