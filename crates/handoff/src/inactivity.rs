//! Client inactivity: nudge, then close, automated conversations the
//! customer walked away from.

use chrono::{DateTime, Utc};
use handoff_models::{ClientInactivitySettings, Contact};
use tracing::{debug, info, warn};

use crate::clock;
use crate::messaging::{MessageKind, MessageSender, SendOptions};
use crate::storage::{StorageBackend, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InactivityAction {
    None,
    Remind,
    AutoClose,
}

/// Decide what to do with a contact. Auto-close wins when both thresholds
/// have passed; a reminder is sent at most once per tracking period.
pub fn evaluate(
    contact: &Contact,
    settings: &ClientInactivitySettings,
    now: DateTime<Utc>,
) -> InactivityAction {
    if !settings.enabled {
        return InactivityAction::None;
    }
    let Some(last) = contact
        .chatbot_last_message_at
        .as_deref()
        .and_then(clock::parse)
    else {
        return InactivityAction::None;
    };
    let elapsed = now - last;

    if settings
        .auto_close_window()
        .and_then(clock::minutes)
        .is_some_and(|w| elapsed >= w)
    {
        return InactivityAction::AutoClose;
    }
    if !contact.chatbot_reminder_sent
        && settings
            .reminder_window()
            .and_then(clock::minutes)
            .is_some_and(|w| elapsed >= w)
    {
        return InactivityAction::Remind;
    }
    InactivityAction::None
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InactivityReport {
    pub reminders: usize,
    pub closed: usize,
}

async fn send(
    sender: &dyn MessageSender,
    contact: &Contact,
    message: Option<&str>,
    kind: MessageKind,
) {
    let (Some(message), Some(account)) = (
        message.filter(|m| !m.trim().is_empty()),
        contact.channel_account_id.as_deref(),
    ) else {
        return;
    };
    if let Err(e) = sender
        .send(account, contact, message, &SendOptions::new(kind))
        .await
    {
        warn!(contact_id = %contact.id, kind = kind.as_str(), error = %e, "inactivity message failed");
    }
}

/// One inactivity pass over an organization. Message failures are logged;
/// tracking state is updated regardless.
pub async fn run_pass(
    storage: &dyn StorageBackend,
    sender: &dyn MessageSender,
    org_id: &str,
    settings: &ClientInactivitySettings,
    now: DateTime<Utc>,
) -> Result<InactivityReport, StorageError> {
    let mut report = InactivityReport::default();
    if !settings.enabled {
        return Ok(report);
    }

    for contact in storage.inactive_contacts(org_id)? {
        let Some(seen_at) = contact.chatbot_last_message_at.as_deref() else {
            continue;
        };
        match evaluate(&contact, settings, now) {
            InactivityAction::None => {}
            InactivityAction::Remind => {
                send(
                    sender,
                    &contact,
                    settings.reminder_message.as_deref(),
                    MessageKind::InactivityReminder,
                )
                .await;
                if storage.mark_reminder_sent(org_id, &contact.id, seen_at, now)? {
                    report.reminders += 1;
                    info!(organization_id = org_id, contact_id = %contact.id, "inactivity reminder sent");
                } else {
                    debug!(contact_id = %contact.id, "chatbot activity during reminder; tracking kept");
                }
            }
            InactivityAction::AutoClose => {
                send(
                    sender,
                    &contact,
                    settings.auto_close_message.as_deref(),
                    MessageKind::InactivityAutoClose,
                )
                .await;
                if storage.end_inactive_session(org_id, &contact.id, seen_at, now)? {
                    report.closed += 1;
                    info!(organization_id = org_id, contact_id = %contact.id, "inactive chatbot session closed");
                } else {
                    debug!(contact_id = %contact.id, "chatbot activity during auto-close; session kept");
                }
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap()
    }

    fn contact(reminded: bool) -> Contact {
        Contact {
            id: "c-1".into(),
            organization_id: "org-1".into(),
            name: None,
            phone: "+15550100".into(),
            assigned_user_id: None,
            channel_account_id: Some("acct-1".into()),
            chatbot_last_message_at: Some(clock::stamp(t0())),
            chatbot_reminder_sent: reminded,
        }
    }

    fn settings() -> ClientInactivitySettings {
        ClientInactivitySettings {
            enabled: true,
            reminder_minutes: Some(5),
            reminder_message: Some("Still there?".into()),
            auto_close_minutes: Some(15),
            auto_close_message: Some("Closing this chat.".into()),
        }
    }

    #[test]
    fn reminder_then_auto_close() {
        let s = settings();
        assert_eq!(evaluate(&contact(false), &s, t0() + Duration::minutes(4)), InactivityAction::None);
        assert_eq!(evaluate(&contact(false), &s, t0() + Duration::minutes(6)), InactivityAction::Remind);
        assert_eq!(evaluate(&contact(true), &s, t0() + Duration::minutes(6)), InactivityAction::None);
        assert_eq!(evaluate(&contact(true), &s, t0() + Duration::minutes(16)), InactivityAction::AutoClose);
    }

    #[test]
    fn auto_close_wins_over_reminder() {
        assert_eq!(
            evaluate(&contact(false), &settings(), t0() + Duration::minutes(20)),
            InactivityAction::AutoClose
        );
    }

    #[test]
    fn oversized_windows_never_fire() {
        let mut s = settings();
        s.auto_close_minutes = Some(i64::MAX / 2);
        s.reminder_minutes = Some(i64::MAX);
        let later = t0() + Duration::days(365);
        assert_eq!(evaluate(&contact(false), &s, later), InactivityAction::None);
    }

    #[test]
    fn disabled_or_untracked_does_nothing() {
        let mut s = settings();
        s.enabled = false;
        assert_eq!(evaluate(&contact(false), &s, t0() + Duration::hours(2)), InactivityAction::None);

        let mut c = contact(false);
        c.chatbot_last_message_at = None;
        assert_eq!(evaluate(&c, &settings(), t0() + Duration::hours(2)), InactivityAction::None);
    }
}
