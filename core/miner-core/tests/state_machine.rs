//! Reconciliation rules exercised end to end through the registry.

use chrono::{DateTime, TimeZone, Utc};
use miner_core::{HookEvent, LogEvent, MonitorEvent, Registry, ResourceSample};
use miner_protocol::{DetectionMode, HookKind, SessionEvent, SessionStatus};

const X: &str = "286e962f-c045-4274-8f37-c4e41fb6104a";

fn t(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_760_000_000 + secs, 0).unwrap()
}

fn log(session_id: &str, pid: u32, at: DateTime<Utc>) -> MonitorEvent {
    MonitorEvent::Log(LogEvent {
        session_id: Some(session_id.to_string()),
        pid: Some(pid),
        at,
    })
}

fn sample(pid: u32, cpu: f32, has_terminal: bool, at: DateTime<Utc>) -> MonitorEvent {
    MonitorEvent::Resource(ResourceSample {
        pid,
        cpu_usage: cpu,
        memory_bytes: 256 * 1024 * 1024,
        has_terminal,
        at,
    })
}

fn hook(session_id: &str, kind: HookKind, at: DateTime<Utc>) -> MonitorEvent {
    MonitorEvent::Hook(HookEvent {
        session_id: session_id.to_string(),
        kind,
        at,
    })
}

fn status_changes(events: &[SessionEvent]) -> Vec<(SessionStatus, SessionStatus)> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::SessionStatusChanged {
                old_status,
                new_status,
                ..
            } => Some((*old_status, *new_status)),
            _ => None,
        })
        .collect()
}

#[test]
fn legacy_session_upgrades_without_recreation() {
    let mut registry = Registry::default();
    let created = registry.apply(&log(X, 42, t(0)));
    assert!(matches!(created.as_slice(), [SessionEvent::SessionCreated { .. }]));

    registry.apply(&sample(42, 15.0, true, t(5)));
    assert_eq!(registry.get(X).unwrap().status, SessionStatus::Working);

    let events = registry.apply(&hook(X, HookKind::Work, t(6)));
    assert_eq!(
        events,
        vec![SessionEvent::DetectionUpgraded {
            pid: 42,
            session_id: X.to_string()
        }]
    );
    let session = registry.get(X).unwrap();
    assert_eq!(session.detection_mode, DetectionMode::EventDriven);
    assert_eq!(session.status, SessionStatus::Working);
    assert_eq!(registry.len(), 1);
}

#[test]
fn placeholder_stays_legacy_for_non_uuid_hooks() {
    let mut registry = Registry::default();
    registry.apply(&sample(1234, 50.0, true, t(0)));

    let events = registry.apply(&hook("1234", HookKind::Work, t(1)));
    assert!(events.is_empty());

    for (offset, session_id) in ["pid-1234", "1234", "$SESSION_ID", "pid-1234"].iter().enumerate() {
        registry.apply(&hook(session_id, HookKind::Work, t(2 + offset as i64)));
        registry.apply(&hook(session_id, HookKind::Rest, t(2 + offset as i64)));
    }

    let placeholder = registry.get("pid-1234").unwrap();
    assert_eq!(placeholder.detection_mode, DetectionMode::Legacy);
    assert_eq!(placeholder.last_hook, None);
    assert_eq!(registry.len(), 1);
}

#[test]
fn lost_terminal_turns_event_driven_session_into_zombie() {
    let mut registry = Registry::default();
    registry.apply(&log(X, 42, t(0)));
    registry.apply(&hook(X, HookKind::Work, t(1)));
    assert_eq!(registry.get(X).unwrap().status, SessionStatus::Working);

    let events = registry.apply(&sample(42, 80.0, false, t(2)));
    assert_eq!(
        status_changes(&events),
        vec![(SessionStatus::Working, SessionStatus::Zombie)]
    );

    // Hooks cannot override a lost terminal.
    assert!(registry.apply(&hook(X, HookKind::Rest, t(3))).is_empty());
    assert_eq!(registry.get(X).unwrap().status, SessionStatus::Zombie);

    // Reattaching restores the last hook's status.
    let events = registry.apply(&sample(42, 0.0, true, t(4)));
    assert_eq!(
        status_changes(&events),
        vec![(SessionStatus::Zombie, SessionStatus::Resting)]
    );
}

#[test]
fn event_driven_transitions_emit_once_each() {
    let mut registry = Registry::default();
    let created = registry.apply(&hook(X, HookKind::Work, t(0)));
    let [SessionEvent::SessionCreated { session }] = created.as_slice() else {
        panic!("expected a single created event, got {created:?}");
    };
    assert_eq!(session.status, SessionStatus::Working);
    assert_eq!(session.detection_mode, DetectionMode::EventDriven);
    assert_eq!(session.pid, 0);

    let rest = registry.apply(&hook(X, HookKind::Rest, t(1)));
    assert_eq!(rest.len(), 1);
    assert_eq!(
        status_changes(&rest),
        vec![(SessionStatus::Working, SessionStatus::Resting)]
    );

    let work = registry.apply(&hook(X, HookKind::Work, t(2)));
    assert_eq!(work.len(), 1);
    assert_eq!(
        status_changes(&work),
        vec![(SessionStatus::Resting, SessionStatus::Working)]
    );

    assert!(registry.apply(&hook(X, HookKind::Work, t(3))).is_empty());
}

#[test]
fn session_start_hook_rests() {
    let mut registry = Registry::default();
    registry.apply(&hook(X, HookKind::Rest, t(0)));
    assert_eq!(registry.get(X).unwrap().status, SessionStatus::Resting);
}

#[test]
fn zombie_dominates_in_legacy_mode() {
    let mut registry = Registry::default();
    registry.apply(&log(X, 7, t(0)));
    registry.apply(&sample(7, 99.0, false, t(1)));
    registry.apply(&log(X, 7, t(2)));
    assert_eq!(registry.get(X).unwrap().status, SessionStatus::Zombie);
}

#[test]
fn upgrade_happens_at_most_once() {
    let mut registry = Registry::default();
    let sequence = [
        log(X, 42, t(0)),
        sample(42, 20.0, true, t(1)),
        hook(X, HookKind::Work, t(2)),
        hook(X, HookKind::Rest, t(3)),
        log(X, 42, t(4)),
        sample(42, 1.0, true, t(5)),
        hook(X, HookKind::Work, t(6)),
    ];

    let upgrades = sequence
        .iter()
        .flat_map(|event| registry.apply(event))
        .filter(|event| matches!(event, SessionEvent::DetectionUpgraded { .. }))
        .count();
    assert_eq!(upgrades, 1);
    assert_eq!(
        registry.get(X).unwrap().detection_mode,
        DetectionMode::EventDriven
    );
}

#[test]
fn replay_is_deterministic() {
    let sequence = vec![
        sample(42, 30.0, true, t(0)),
        log(X, 42, t(1)),
        sample(42, 30.0, true, t(2)),
        sample(77, 2.0, true, t(2)),
        hook(X, HookKind::Rest, t(3)),
        sample(77, 2.0, false, t(30)),
        log(X, 42, t(31)),
    ];

    let run = || {
        let mut registry = Registry::default();
        let events: Vec<SessionEvent> = sequence
            .iter()
            .flat_map(|event| {
                std::thread::sleep(std::time::Duration::from_millis(2));
                registry.apply(event)
            })
            .collect();
        (events, registry.snapshot())
    };

    assert_eq!(run(), run());
}

#[test]
fn identical_samples_emit_nothing() {
    let mut registry = Registry::default();
    registry.apply(&sample(9, 5.0, true, t(0)));
    assert!(registry.apply(&sample(9, 5.0, true, t(0))).is_empty());
    assert!(registry.apply(&sample(9, 6.0, true, t(1))).is_empty());
}

#[test]
fn legacy_activity_window_expires() {
    let mut registry = Registry::default();
    registry.apply(&log(X, 42, t(0)));
    registry.apply(&sample(42, 40.0, true, t(2)));
    assert_eq!(registry.get(X).unwrap().status, SessionStatus::Working);

    let events = registry.apply(&sample(42, 40.0, true, t(20)));
    assert_eq!(
        status_changes(&events),
        vec![(SessionStatus::Working, SessionStatus::Resting)]
    );
}

#[test]
fn placeholder_and_uuid_never_coexist_for_one_pid() {
    let mut registry = Registry::default();
    registry.apply(&sample(42, 0.0, true, t(0)));
    registry.apply(&hook(X, HookKind::Work, t(1)));
    assert_eq!(registry.len(), 2);

    registry.apply(&log(X, 42, t(2)));
    assert_eq!(registry.len(), 1);

    // Later samples land on the canonical record, not a fresh placeholder.
    registry.apply(&sample(42, 0.0, false, t(3)));
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.get(X).unwrap().status, SessionStatus::Zombie);
}
