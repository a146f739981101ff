//! Background SLA enforcement.
//!
//! One [`SlaScheduler`] per process walks every organization with SLA or
//! client inactivity enabled on a fixed interval: auto-close expired
//! transfers, escalate overdue ones, flag missed response deadlines, then run
//! the inactivity pass. Every step is guarded by its own status predicate so a
//! tick racing a pick or a resume never resurrects a terminal transfer.

use chrono::{DateTime, Utc};
use handoff_models::{Organization, Transfer};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{kind, EventBus};
use crate::inactivity;
use crate::messaging::{MessageKind, MessageSender, SendOptions};
use crate::settings::SettingsCache;
use crate::sla;
use crate::storage::{StorageBackend, StorageError};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub startup_delay: Duration,
    pub settings_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            startup_delay: Duration::from_secs(10),
            settings_ttl: Duration::from_secs(300),
        }
    }
}

/// What one tick did, summed over all organizations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub organizations: usize,
    pub expired: usize,
    pub escalated: usize,
    pub breached: usize,
    pub reminders: usize,
    pub inactivity_closed: usize,
    pub errors: usize,
}

impl TickReport {
    pub fn has_activity(&self) -> bool {
        self.expired + self.escalated + self.breached + self.reminders + self.inactivity_closed
            + self.errors
            > 0
    }
}

pub struct SlaScheduler {
    storage: Arc<dyn StorageBackend>,
    settings: SettingsCache,
    sender: Arc<dyn MessageSender>,
    events: EventBus,
    config: SchedulerConfig,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SlaScheduler {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        sender: Arc<dyn MessageSender>,
        events: EventBus,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            settings: SettingsCache::new(storage.clone(), config.settings_ttl),
            storage,
            sender,
            events,
            config,
            running: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &SettingsCache {
        &self.settings
    }

    /// Spawn the tick loop. The loop stops when `ctx` or [`stop`](Self::stop)
    /// cancels it. Returns false if the scheduler was already running.
    pub fn start(self: &Arc<Self>, ctx: &CancellationToken) -> bool {
        let Ok(mut running) = self.running.lock() else {
            error!("scheduler state poisoned; not starting");
            return false;
        };
        if running.as_ref().is_some_and(|(token, _)| !token.is_cancelled()) {
            return false;
        }

        let token = ctx.child_token();
        let cancel = token.clone();
        let this = Arc::clone(self);
        let period = self.config.interval.max(Duration::from_secs(1));
        let start = tokio::time::Instant::now() + self.config.startup_delay;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = period.as_secs(), "SLA scheduler started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let report = this.tick().await;
                        if report.has_activity() {
                            info!(
                                organizations = report.organizations,
                                expired = report.expired,
                                escalated = report.escalated,
                                breached = report.breached,
                                reminders = report.reminders,
                                inactivity_closed = report.inactivity_closed,
                                errors = report.errors,
                                "SLA tick"
                            );
                        }
                    }
                    _ = cancel.cancelled() => {
                        info!("SLA scheduler shutting down");
                        break;
                    }
                }
            }
        });

        *running = Some((token, handle));
        true
    }

    /// Cancel the loop. A tick already in flight finishes its organization walk.
    pub fn stop(&self) {
        if let Ok(mut running) = self.running.lock() {
            if let Some((token, _handle)) = running.take() {
                token.cancel();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|r| {
                r.as_ref()
                    .is_some_and(|(token, handle)| !token.is_cancelled() && !handle.is_finished())
            })
            .unwrap_or(false)
    }

    pub async fn tick(&self) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    /// One pass over every scheduled organization at `now`. Errors are
    /// counted and logged; one organization failing never stops the others.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let orgs = match self.settings.scheduled_orgs() {
            Ok(orgs) => orgs,
            Err(e) => {
                error!(error = %e, "failed to load organization settings");
                report.errors += 1;
                return report;
            }
        };

        for org in orgs.iter() {
            report.organizations += 1;
            self.run_org(org, now, &mut report).await;
        }
        report
    }

    async fn run_org(&self, org: &Organization, now: DateTime<Utc>, report: &mut TickReport) {
        let org_id = org.id.as_str();
        let settings = &org.settings;

        if settings.sla.enabled {
            if let Err(e) = self.auto_close(org, now, report).await {
                error!(organization_id = org_id, error = %e, "auto-close pass failed");
                report.errors += 1;
            }
            if let Err(e) = self.escalate(org, now, report).await {
                error!(organization_id = org_id, error = %e, "escalation pass failed");
                report.errors += 1;
            }
            match self.storage.sweep_breaches(org_id, now) {
                Ok(n) => {
                    if n > 0 {
                        info!(organization_id = org_id, count = n, "response SLA breached");
                    }
                    report.breached += n;
                }
                Err(e) => {
                    error!(organization_id = org_id, error = %e, "breach sweep failed");
                    report.errors += 1;
                }
            }
        }

        if settings.client_inactivity.enabled {
            match inactivity::run_pass(
                self.storage.as_ref(),
                self.sender.as_ref(),
                org_id,
                &settings.client_inactivity,
                now,
            )
            .await
            {
                Ok(r) => {
                    report.reminders += r.reminders;
                    report.inactivity_closed += r.closed;
                }
                Err(e) => {
                    error!(organization_id = org_id, error = %e, "inactivity pass failed");
                    report.errors += 1;
                }
            }
        }
    }

    /// Send `message` to the transfer's contact. Failures are logged only.
    async fn notify_customer(&self, transfer: &Transfer, message: Option<&str>, kind: MessageKind) {
        let Some(message) = message.filter(|m| !m.trim().is_empty()) else {
            return;
        };
        let contact = match self
            .storage
            .get_contact(&transfer.organization_id, &transfer.contact_id)
        {
            Ok(Some(c)) => c,
            Ok(None) => {
                warn!(transfer_id = %transfer.id, contact_id = %transfer.contact_id, "contact missing; message skipped");
                return;
            }
            Err(e) => {
                warn!(transfer_id = %transfer.id, error = %e, "contact lookup failed; message skipped");
                return;
            }
        };
        let options = SendOptions::new(kind).for_transfer(&transfer.id);
        if let Err(e) = self
            .sender
            .send(&transfer.channel_account_id, &contact, message, &options)
            .await
        {
            warn!(transfer_id = %transfer.id, kind = kind.as_str(), error = %e, "customer message failed");
        }
    }

    async fn auto_close(
        &self,
        org: &Organization,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), StorageError> {
        let sla_settings = &org.settings.sla;
        for transfer in self.storage.expired_transfers(&org.id, now)? {
            if !sla::can_expire(&transfer, now) {
                continue;
            }
            self.notify_customer(
                &transfer,
                sla_settings.auto_close_message.as_deref(),
                MessageKind::SlaAutoClose,
            )
            .await;

            let note = format!(
                "Auto-closed by SLA after {} hour(s) without resolution",
                sla_settings.auto_close_window_hours().unwrap_or_default()
            );
            match self.storage.expire_transfer(&org.id, &transfer.id, &note, now) {
                Ok(true) => {
                    report.expired += 1;
                    info!(transfer_id = %transfer.id, organization_id = %org.id, "transfer expired");
                    self.events.notify_org(
                        &org.id,
                        kind::TRANSFER_EXPIRED,
                        transfer.agent_id.as_deref(),
                        serde_json::json!({
                            "transfer_id": transfer.id,
                            "contact_id": transfer.contact_id,
                        }),
                    );
                }
                Ok(false) => {
                    debug!(transfer_id = %transfer.id, "transfer left active state before expiry")
                }
                Err(e) => {
                    error!(transfer_id = %transfer.id, error = %e, "expire failed");
                    report.errors += 1;
                }
            }
        }
        Ok(())
    }

    async fn escalate(
        &self,
        org: &Organization,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), StorageError> {
        let sla_settings = &org.settings.sla;
        for mut transfer in self.storage.escalation_candidates(&org.id, now)? {
            let previous_level = transfer.sla.escalation_level;
            let Some(escalation) = sla::escalate(&mut transfer, sla_settings, now) else {
                continue;
            };

            let note = format!("SLA escalated to level {}", escalation.level);
            match self
                .storage
                .save_escalation(&org.id, &transfer, previous_level, &note, now)
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(transfer_id = %transfer.id, "escalation lost to a concurrent update");
                    continue;
                }
                Err(e) => {
                    error!(transfer_id = %transfer.id, error = %e, "escalation failed");
                    report.errors += 1;
                    continue;
                }
            }

            report.escalated += 1;
            if escalation.newly_breached {
                report.breached += 1;
            }
            warn!(
                transfer_id = %transfer.id,
                organization_id = %org.id,
                level = escalation.level,
                agent_id = transfer.agent_id.as_deref().unwrap_or("-"),
                "transfer escalated"
            );
            self.events.notify_org(
                &org.id,
                kind::TRANSFER_ESCALATED,
                transfer.agent_id.as_deref(),
                serde_json::json!({
                    "transfer_id": transfer.id,
                    "contact_id": transfer.contact_id,
                    "team_id": transfer.team_id,
                    "level": escalation.level,
                    "breached": transfer.sla.breached,
                    "notify_ids": sla_settings.escalation_notify_ids,
                }),
            );

            if escalation.is_first() {
                self.notify_customer(
                    &transfer,
                    sla_settings.warning_message.as_deref(),
                    MessageKind::SlaWarning,
                )
                .await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_report_has_no_activity() {
        let mut r = TickReport {
            organizations: 3,
            ..Default::default()
        };
        assert!(!r.has_activity());
        r.breached = 1;
        assert!(r.has_activity());
    }
}
