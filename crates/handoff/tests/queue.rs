mod common;

use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Barrier, Mutex};

use common::{minutes, sla_settings, t0, Fixture};
use handoff::clock;
use handoff::db;
use handoff::error::HandoffError;
use handoff::queue::PickOutcome;
use handoff::storage::sqlite::SqliteBackend;
use handoff::storage::{QueueScope, TransferStore};
use handoff_models::*;

// --- CreateTransfer ---

#[test]
fn second_active_transfer_for_contact_conflicts_without_writes() {
    let fx = Fixture::new(OrgSettings::default());
    let contact = fx.contact("+15550001");
    let first = fx.queue_at(&contact, t0());

    let err = fx
        .queue
        .create_transfer_at(
            &fx.system(),
            CreateTransfer::new(&contact.id, "acct-1"),
            minutes(1),
        )
        .unwrap_err();
    assert!(matches!(err, HandoffError::Conflict(_)), "got {err:?}");

    let queue = fx.queue.list_queue(&fx.system(), None).unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].id, first.id);
}

#[test]
fn new_transfer_allowed_after_resume() {
    let fx = Fixture::new(OrgSettings::default());
    let contact = fx.contact("+15550002");
    let first = fx.queue_at(&contact, t0());
    fx.queue.resume_from_transfer(&fx.system(), &first.id).unwrap();

    let second = fx.queue_at(&contact, minutes(5));
    assert_ne!(first.id, second.id);
    assert!(second.is_active());
}

#[test]
fn create_validates_input_and_references() {
    let fx = Fixture::new(OrgSettings::default());
    let contact = fx.contact("+15550003");

    let err = fx
        .queue
        .create_transfer(&fx.system(), CreateTransfer::new("  ", "acct-1"))
        .unwrap_err();
    assert!(matches!(err, HandoffError::Validation(_)));

    let err = fx
        .queue
        .create_transfer(&fx.system(), CreateTransfer::new("missing", "acct-1"))
        .unwrap_err();
    assert!(matches!(err, HandoffError::NotFound(_)));

    let err = fx
        .queue
        .create_transfer(
            &fx.system(),
            CreateTransfer::new(&contact.id, "acct-1").with_team("no-such-team"),
        )
        .unwrap_err();
    assert!(matches!(err, HandoffError::NotFound(_)));

    let away = fx.user(CreateUser::new("away").unavailable());
    let err = fx
        .queue
        .create_transfer(
            &fx.system(),
            CreateTransfer::new(&contact.id, "acct-1").with_agent(&away.id),
        )
        .unwrap_err();
    assert!(matches!(err, HandoffError::Validation(_)));

    // None of the failures left anything behind.
    assert!(fx
        .storage
        .active_transfer_for_contact(fx.org_id(), &contact.id)
        .unwrap()
        .is_none());
}

#[test]
fn create_records_history_and_cancels_chatbot_session() {
    let fx = Fixture::new(OrgSettings::default());
    let contact = fx.contact("+15550004");
    fx.storage
        .start_chatbot_session(fx.org_id(), &contact.id, t0())
        .unwrap();

    let transfer = fx.queue_at(&contact, t0());
    assert_eq!(transfer.source, TransferSource::Flow);
    assert_eq!(transfer.transferred_by, None);
    assert_eq!(transfer.status_history.len(), 1);
    assert_eq!(transfer.status_history[0].status, "active");
    assert_eq!(transfer.status_history[0].actor_type.as_deref(), Some("system"));
    assert!(fx
        .storage
        .active_chatbot_session(fx.org_id(), &contact.id)
        .unwrap()
        .is_none());
}

#[test]
fn agent_resolution_prefers_explicit_then_team() {
    let fx = Fixture::new(OrgSettings::default());
    let alice = fx.agent("alice");
    let bob = fx.agent("bob");
    let team = fx.team("billing", "round_robin", &[&bob]);

    let c1 = fx.contact("+15550010");
    let explicit = fx
        .queue
        .create_transfer(
            &fx.system(),
            CreateTransfer::new(&c1.id, "acct-1")
                .with_agent(&alice.id)
                .with_team(&team.id),
        )
        .unwrap();
    assert_eq!(explicit.agent_id.as_deref(), Some(alice.id.as_str()));
    assert_eq!(
        fx.reload_contact(&c1.id).assigned_user_id.as_deref(),
        Some(alice.id.as_str())
    );

    let c2 = fx.contact("+15550011");
    let routed = fx
        .queue
        .create_transfer(
            &fx.system(),
            CreateTransfer::new(&c2.id, "acct-1").with_team(&team.id),
        )
        .unwrap();
    assert_eq!(routed.agent_id.as_deref(), Some(bob.id.as_str()));
    assert_eq!(routed.team_id.as_deref(), Some(team.id.as_str()));
}

#[test]
fn manual_team_leaves_transfer_queued() {
    let fx = Fixture::new(OrgSettings::default());
    let alice = fx.agent("alice");
    let team = fx.team("vip", "manual", &[&alice]);
    let contact = fx.contact("+15550012");

    let transfer = fx
        .queue
        .create_transfer(
            &fx.system(),
            CreateTransfer::new(&contact.id, "acct-1").with_team(&team.id),
        )
        .unwrap();
    assert!(transfer.is_queued());
}

#[test]
fn sticky_agent_is_reused_only_while_available() {
    let settings = OrgSettings {
        assign_to_same_agent: true,
        ..Default::default()
    };
    let fx = Fixture::new(settings);
    let alice = fx.agent("alice");
    let contact = fx.contact("+15550013");

    let first = fx
        .queue
        .create_transfer(
            &fx.system(),
            CreateTransfer::new(&contact.id, "acct-1").with_agent(&alice.id),
        )
        .unwrap();
    fx.queue.resume_from_transfer(&fx.system(), &first.id).unwrap();
    // Sticky routing keeps the contact's agent across resume.
    assert_eq!(
        fx.reload_contact(&contact.id).assigned_user_id.as_deref(),
        Some(alice.id.as_str())
    );

    let second = fx.queue_at(&contact, minutes(10));
    assert_eq!(second.agent_id.as_deref(), Some(alice.id.as_str()));
    fx.queue.resume_from_transfer(&fx.system(), &second.id).unwrap();

    fx.storage
        .set_user_availability(fx.org_id(), &alice.id, false)
        .unwrap();
    let third = fx.queue_at(&contact, minutes(20));
    assert!(third.is_queued());
}

#[test]
fn sla_deadlines_attached_at_creation() {
    let fx = Fixture::new(sla_settings(10, Some(15)));
    let contact = fx.contact("+15550014");
    let transfer = fx.queue_at(&contact, t0());

    assert_eq!(
        transfer.sla.response_deadline.as_deref(),
        Some(clock::stamp(minutes(10)).as_str())
    );
    assert_eq!(
        transfer.sla.escalation_deadline.as_deref(),
        Some(clock::stamp(minutes(15)).as_str())
    );
    assert!(transfer.sla.expires_at.is_none());
}

#[test]
fn oversized_sla_windows_leave_storage_usable() {
    let mut settings = sla_settings(10, Some(i64::MAX / 2));
    settings.sla.auto_close_hours = Some(i64::MAX / 4);
    let fx = Fixture::new(settings);
    let contact = fx.contact("+15550015");

    let transfer = fx.queue_at(&contact, t0());
    assert!(transfer.sla.response_deadline.is_some());
    assert!(transfer.sla.escalation_deadline.is_none());
    assert!(transfer.sla.expires_at.is_none());

    // The connection is still healthy for the next caller.
    assert_eq!(fx.reload_contact(&contact.id).id, contact.id);
    let other = fx.contact("+15550016");
    fx.queue_at(&other, minutes(1));
}

// --- ResumeFromTransfer ---

#[test]
fn resume_clears_contact_and_is_terminal() {
    let fx = Fixture::new(OrgSettings::default());
    let alice = fx.agent("alice");
    let contact = fx.contact("+15550020");
    let transfer = fx
        .queue
        .create_transfer(
            &fx.system(),
            CreateTransfer::new(&contact.id, "acct-1").with_agent(&alice.id),
        )
        .unwrap();

    let resumed = fx
        .queue
        .resume_from_transfer(&fx.as_user(&alice), &transfer.id)
        .unwrap();
    assert_eq!(resumed.status, TransferStatus::Resumed);
    assert_eq!(resumed.resumed_by.as_deref(), Some(alice.id.as_str()));
    assert!(resumed.resumed_at.is_some());
    assert_eq!(resumed.status_history.len(), 2);
    assert!(fx.reload_contact(&contact.id).assigned_user_id.is_none());

    let err = fx
        .queue
        .resume_from_transfer(&fx.system(), &transfer.id)
        .unwrap_err();
    assert!(matches!(err, HandoffError::Conflict(_)));

    let err = fx
        .queue
        .assign_transfer(&fx.as_user(&alice), &transfer.id, &AssignTransfer::default())
        .unwrap_err();
    assert!(matches!(err, HandoffError::Conflict(_)));
}

// --- AssignTransfer ---

#[test]
fn agents_may_only_assign_themselves() {
    let fx = Fixture::new(OrgSettings::default());
    let alice = fx.agent("alice");
    let bob = fx.agent("bob");
    let manager = fx.user(CreateUser::new("maria").with_role(UserRole::Manager));
    let contact = fx.contact("+15550030");
    let transfer = fx.queue_at(&contact, t0());

    let err = fx
        .queue
        .assign_transfer(
            &fx.as_user(&alice),
            &transfer.id,
            &AssignTransfer {
                agent_id: Some(bob.id.clone()),
            },
        )
        .unwrap_err();
    assert!(matches!(err, HandoffError::Forbidden(_)));

    // Naming themselves is still naming an agent.
    let err = fx
        .queue
        .assign_transfer(
            &fx.as_user(&alice),
            &transfer.id,
            &AssignTransfer {
                agent_id: Some(alice.id.clone()),
            },
        )
        .unwrap_err();
    assert!(matches!(err, HandoffError::Forbidden(_)));
    assert!(fx.transfer(&transfer.id).is_queued());

    let mine = fx
        .queue
        .assign_transfer(&fx.as_user(&alice), &transfer.id, &AssignTransfer::default())
        .unwrap();
    assert_eq!(mine.agent_id.as_deref(), Some(alice.id.as_str()));

    let moved = fx
        .queue
        .assign_transfer(
            &fx.as_user(&manager),
            &transfer.id,
            &AssignTransfer {
                agent_id: Some(bob.id.clone()),
            },
        )
        .unwrap();
    assert_eq!(moved.agent_id.as_deref(), Some(bob.id.as_str()));
    assert_eq!(
        fx.reload_contact(&contact.id).assigned_user_id.as_deref(),
        Some(bob.id.as_str())
    );
}

#[test]
fn assign_rejects_unavailable_agent() {
    let fx = Fixture::new(OrgSettings::default());
    let manager = fx.user(CreateUser::new("maria").with_role(UserRole::Manager));
    let away = fx.user(CreateUser::new("away").unavailable());
    let transfer = fx.queue_at(&fx.contact("+15550031"), t0());

    let err = fx
        .queue
        .assign_transfer(
            &fx.as_user(&manager),
            &transfer.id,
            &AssignTransfer {
                agent_id: Some(away.id.clone()),
            },
        )
        .unwrap_err();
    assert!(matches!(err, HandoffError::Validation(_)));
    assert!(fx.transfer(&transfer.id).is_queued());
}

// --- PickNextTransfer ---

#[test]
fn pick_takes_oldest_first() {
    let fx = Fixture::new(OrgSettings::default());
    let alice = fx.agent("alice");
    let late = fx.queue_at(&fx.contact("+15550040"), minutes(2));
    let early = fx.queue_at(&fx.contact("+15550041"), t0());
    let middle = fx.queue_at(&fx.contact("+15550042"), minutes(1));

    let me = fx.as_user(&alice);
    let order: Vec<String> = (0..3)
        .map(|_| {
            fx.queue
                .pick_next_transfer_at(&me, None, minutes(3))
                .unwrap()
                .into_transfer()
                .unwrap()
                .id
        })
        .collect();
    assert_eq!(order, vec![early.id.clone(), middle.id, late.id]);

    let picked = fx.transfer(&early.id);
    assert_eq!(picked.agent_id.as_deref(), Some(alice.id.as_str()));
    assert_eq!(picked.transferred_by.as_deref(), Some(alice.id.as_str()));
    assert_eq!(
        picked.sla.picked_up_at.as_deref(),
        Some(clock::stamp(minutes(3)).as_str())
    );

    assert!(matches!(
        fx.queue.pick_next_transfer(&me, None).unwrap(),
        PickOutcome::QueueEmpty
    ));
}

#[test]
fn pick_respects_team_scope() {
    let fx = Fixture::new(OrgSettings::default());
    let alice = fx.agent("alice");
    let bob = fx.agent("bob");
    let admin = fx.user(CreateUser::new("root").with_role(UserRole::Admin));
    let billing = fx.team("billing", "manual", &[&bob]);

    let team_transfer = fx
        .queue
        .create_transfer_at(
            &fx.system(),
            CreateTransfer::new(&fx.contact("+15550050").id, "acct-1").with_team(&billing.id),
            t0(),
        )
        .unwrap();
    let general = fx.queue_at(&fx.contact("+15550051"), minutes(1));

    // alice is not in billing: she only sees the general queue.
    let err = fx
        .queue
        .pick_next_transfer(&fx.as_user(&alice), Some(&billing.id))
        .unwrap_err();
    assert!(matches!(err, HandoffError::Forbidden(_)));
    let visible = fx.queue.list_queue(&fx.as_user(&alice), None).unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, general.id);

    // bob sees his team first because it is older.
    let picked = fx
        .queue
        .pick_next_transfer(&fx.as_user(&bob), None)
        .unwrap()
        .into_transfer()
        .unwrap();
    assert_eq!(picked.id, team_transfer.id);

    // Administrators see everything.
    let picked = fx
        .queue
        .pick_next_transfer(&fx.as_user(&admin), None)
        .unwrap()
        .into_transfer()
        .unwrap();
    assert_eq!(picked.id, general.id);
}

#[test]
fn late_pickup_marks_breach() {
    let fx = Fixture::new(sla_settings(10, None));
    let alice = fx.agent("alice");
    let transfer = fx.queue_at(&fx.contact("+15550060"), t0());

    let picked = fx
        .queue
        .pick_next_transfer_at(&fx.as_user(&alice), None, minutes(11))
        .unwrap()
        .into_transfer()
        .unwrap();
    assert_eq!(picked.id, transfer.id);
    assert!(picked.sla.breached);
    assert_eq!(
        picked.sla.breached_at.as_deref(),
        Some(clock::stamp(minutes(11)).as_str())
    );
}

#[test]
fn system_caller_cannot_pick() {
    let fx = Fixture::new(OrgSettings::default());
    let err = fx.queue.pick_next_transfer(&fx.system(), None).unwrap_err();
    assert!(matches!(err, HandoffError::Forbidden(_)));
}

#[test]
fn concurrent_pickers_never_share_a_transfer() {
    const TRANSFERS: usize = 5;
    const PICKERS: usize = 8;

    let fx = Fixture::new(OrgSettings::default());
    for i in 0..TRANSFERS {
        fx.queue_at(&fx.contact(&format!("+1555007{i}")), minutes(i as i64));
    }
    let agents: Vec<User> = (0..PICKERS).map(|i| fx.agent(&format!("agent-{i}"))).collect();

    let barrier = Arc::new(Barrier::new(PICKERS));
    let handles: Vec<_> = agents
        .into_iter()
        .map(|agent| {
            let barrier = barrier.clone();
            let path = fx.db_path.clone();
            let org_id = fx.org.id.clone();
            std::thread::spawn(move || {
                // Each picker gets its own connection to the same database file.
                let conn = db::open(&path).unwrap();
                let backend = SqliteBackend::new(Arc::new(Mutex::new(conn)));
                barrier.wait();
                backend
                    .pick_next_transfer(&org_id, &agent.id, &QueueScope::All, Utc::now())
                    .unwrap()
                    .map(|t| (t.id, agent.id))
            })
        })
        .collect();

    let picks: Vec<(String, String)> = handles
        .into_iter()
        .filter_map(|h| h.join().unwrap())
        .collect();
    assert_eq!(picks.len(), TRANSFERS);

    let ids: HashSet<&str> = picks.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids.len(), TRANSFERS);

    for (id, agent_id) in &picks {
        assert_eq!(fx.transfer(id).agent_id.as_deref(), Some(agent_id.as_str()));
    }
    assert!(fx.queue.list_queue(&fx.system(), None).unwrap().is_empty());
}

// --- Assignment strategies ---

#[test]
fn round_robin_rotates_through_team() {
    let fx = Fixture::new(OrgSettings::default());
    let a = fx.agent("a");
    let b = fx.agent("b");
    let c = fx.agent("c");
    let away = fx.user(CreateUser::new("away").unavailable());
    let team = fx.team("support", "round_robin", &[&a, &b, &away, &c]);

    let first_pass: Vec<String> = (0..3)
        .map(|_| fx.queue.assign_to_team(&team.id, fx.org_id()).unwrap().unwrap())
        .collect();
    let distinct: HashSet<&String> = first_pass.iter().collect();
    assert_eq!(distinct.len(), 3);
    assert!(!first_pass.contains(&away.id));

    std::thread::sleep(std::time::Duration::from_millis(5));
    let fourth = fx.queue.assign_to_team(&team.id, fx.org_id()).unwrap().unwrap();
    assert_eq!(fourth, first_pass[0]);
}

#[test]
fn round_robin_skips_managers_and_empty_teams() {
    let fx = Fixture::new(OrgSettings::default());
    let boss = fx.agent("boss");
    let team = fx.team("empty", "round_robin", &[]);
    fx.storage
        .add_team_member(&team.id, &boss.id, MemberRole::Manager)
        .unwrap();
    assert_eq!(fx.queue.assign_to_team(&team.id, fx.org_id()).unwrap(), None);

    fx.storage.set_team_active(fx.org_id(), &team.id, false).unwrap();
    assert_eq!(fx.queue.assign_to_team(&team.id, fx.org_id()).unwrap(), None);
}

#[test]
fn load_balanced_picks_least_busy() {
    let fx = Fixture::new(OrgSettings::default());
    let busy = fx.agent("busy");
    let idle = fx.agent("idle");
    let team = fx.team("sales", "load_balanced", &[&busy, &idle]);

    for i in 0..2 {
        fx.queue
            .create_transfer(
                &fx.system(),
                CreateTransfer::new(&fx.contact(&format!("+1555008{i}")).id, "acct-1")
                    .with_agent(&busy.id),
            )
            .unwrap();
    }
    assert_eq!(
        fx.queue.assign_to_team(&team.id, fx.org_id()).unwrap().as_deref(),
        Some(idle.id.as_str())
    );

    // Equal load: first member wins.
    for i in 0..2 {
        fx.queue
            .create_transfer(
                &fx.system(),
                CreateTransfer::new(&fx.contact(&format!("+1555009{i}")).id, "acct-1")
                    .with_agent(&idle.id),
            )
            .unwrap();
    }
    assert_eq!(
        fx.queue.assign_to_team(&team.id, fx.org_id()).unwrap().as_deref(),
        Some(busy.id.as_str())
    );
}

// --- Reads ---

#[test]
fn transfers_are_scoped_to_their_organization() {
    let fx = Fixture::new(OrgSettings::default());
    let transfer = fx.queue_at(&fx.contact("+15550100"), t0());

    let stranger = Identity::System {
        organization_id: "another-org".to_string(),
    };
    let err = fx.queue.get_transfer(&stranger, &transfer.id).unwrap_err();
    assert!(matches!(err, HandoffError::NotFound(_)));
    assert!(fx.queue.list_queue(&stranger, None).unwrap().is_empty());
}

#[test]
fn first_response_recorded_once() {
    let fx = Fixture::new(sla_settings(10, None));
    let transfer = fx.queue_at(&fx.contact("+15550101"), t0());

    let first = fx.queue.record_first_response(&fx.system(), &transfer.id).unwrap();
    let stamp = first.sla.first_response_at.clone();
    assert!(stamp.is_some());

    std::thread::sleep(std::time::Duration::from_millis(5));
    let again = fx.queue.record_first_response(&fx.system(), &transfer.id).unwrap();
    assert_eq!(again.sla.first_response_at, stamp);
}
