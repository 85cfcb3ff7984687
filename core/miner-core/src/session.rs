//! The session record and its pure transition functions.
//!
//! Nothing here reads the clock. Every classification is evaluated against the
//! timestamp of the event being applied, so replaying the same ordered events
//! always yields the same record.

use chrono::{DateTime, Duration, Utc};
use miner_protocol::{DetectionMode, HookKind, SessionStatus, SessionView};

use crate::events::HookEvent;
use crate::identity::SessionIdentity;

/// Thresholds for classifying sessions that have no hook feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierPolicy {
    pub cpu_threshold_percent: f32,
    pub activity_window: Duration,
}

impl Default for ClassifierPolicy {
    fn default() -> Self {
        Self {
            cpu_threshold_percent: 10.0,
            activity_window: Duration::seconds(15),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub identity: SessionIdentity,
    /// 0 until the OS process is known.
    pub pid: u32,
    pub detection_mode: DetectionMode,
    pub status: SessionStatus,
    /// Assumed attached until a resource sample says otherwise.
    pub has_terminal: bool,
    pub cpu_usage: f32,
    pub memory_bytes: u64,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub last_sampled_at: Option<DateTime<Utc>>,
    /// Most recent signal of any kind; drives the stale sweep.
    pub last_seen_at: DateTime<Utc>,
    /// Last Work/Rest hook, kept so status can be restored after a zombie spell.
    pub last_hook: Option<HookKind>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn legacy(identity: SessionIdentity, pid: u32, at: DateTime<Utc>) -> Self {
        Self {
            identity,
            pid,
            detection_mode: DetectionMode::Legacy,
            status: SessionStatus::LegacyPending,
            has_terminal: true,
            cpu_usage: 0.0,
            memory_bytes: 0,
            last_activity_at: None,
            last_sampled_at: None,
            last_seen_at: at,
            last_hook: None,
            created_at: at,
        }
    }

    /// A session first seen through the hook feed. Its pid is learned later.
    pub fn event_driven(identity: SessionIdentity, hook: &HookEvent) -> Self {
        let mut session = Self::legacy(identity, 0, hook.at);
        session.detection_mode = DetectionMode::EventDriven;
        session.last_hook = Some(hook.kind);
        session.last_activity_at = Some(hook.at);
        session
    }

    pub fn key(&self) -> String {
        self.identity.key()
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.last_seen_at = self.last_seen_at.max(at);
    }

    pub fn record_activity(&mut self, at: DateTime<Utc>) {
        self.last_activity_at = Some(match self.last_activity_at {
            Some(existing) => existing.max(at),
            None => at,
        });
        self.touch(at);
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            identity: self.identity.key(),
            pid: self.pid,
            status: self.status,
            detection_mode: self.detection_mode,
            cpu_usage: self.cpu_usage,
            memory_bytes: self.memory_bytes,
            has_terminal: self.has_terminal,
            last_activity_at: self.last_activity_at,
            created_at: self.created_at,
        }
    }
}

/// Derives status from the record, in priority order: lost terminal, hook
/// feed, then CPU and recent activity.
pub fn derive_status(session: &Session, policy: &ClassifierPolicy, now: DateTime<Utc>) -> SessionStatus {
    if !session.has_terminal {
        return SessionStatus::Zombie;
    }

    match session.detection_mode {
        DetectionMode::EventDriven => match session.last_hook {
            Some(HookKind::Work) => SessionStatus::Working,
            _ => SessionStatus::Resting,
        },
        DetectionMode::Legacy => {
            if session.last_sampled_at.is_none() {
                return SessionStatus::LegacyPending;
            }
            classify_legacy(session, policy, now)
        }
    }
}

fn classify_legacy(session: &Session, policy: &ClassifierPolicy, now: DateTime<Utc>) -> SessionStatus {
    let busy = session.cpu_usage > policy.cpu_threshold_percent;
    let recent = session
        .last_activity_at
        .map(|at| now.signed_duration_since(at) < policy.activity_window)
        .unwrap_or(false);

    if busy && recent {
        SessionStatus::Working
    } else {
        SessionStatus::Resting
    }
}

/// Applies a Work/Rest hook to a session, upgrading it to event-driven
/// detection when the hook names this session's canonical identity.
///
/// Upgrading is one-way; re-applying it is a no-op. `End` hooks are handled by
/// the registry (removal) and leave the session untouched here.
pub fn apply_hook(session: &Session, hook: &HookEvent) -> Session {
    let mut next = session.clone();
    if hook.kind == HookKind::End {
        return next;
    }

    if next.detection_mode == DetectionMode::Legacy && next.identity.accepts_hook(&hook.session_id) {
        next.detection_mode = DetectionMode::EventDriven;
    }
    if next.detection_mode == DetectionMode::EventDriven {
        next.last_hook = Some(hook.kind);
    }
    next.record_activity(hook.at);
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SESSION: &str = "3f2a9c1e-8b7d-4e6f-a5c4-1d2e3f4a5b6c";

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn hook(kind: HookKind, at: DateTime<Utc>) -> HookEvent {
        HookEvent {
            session_id: SESSION.to_string(),
            kind,
            at,
        }
    }

    fn sampled(cpu: f32, at: DateTime<Utc>) -> Session {
        let mut session = Session::legacy(SessionIdentity::canonical(SESSION).unwrap(), 42, t(0));
        session.cpu_usage = cpu;
        session.last_sampled_at = Some(at);
        session
    }

    #[test]
    fn legacy_is_pending_until_sampled() {
        let session = Session::legacy(SessionIdentity::placeholder(42), 42, t(0));
        assert_eq!(
            derive_status(&session, &ClassifierPolicy::default(), t(0)),
            SessionStatus::LegacyPending
        );
    }

    #[test]
    fn legacy_needs_cpu_and_recent_activity_to_work() {
        let policy = ClassifierPolicy::default();

        let mut session = sampled(15.0, t(20));
        session.last_activity_at = Some(t(15));
        assert_eq!(derive_status(&session, &policy, t(20)), SessionStatus::Working);

        session.cpu_usage = 10.0;
        assert_eq!(derive_status(&session, &policy, t(20)), SessionStatus::Resting);

        session.cpu_usage = 50.0;
        assert_eq!(derive_status(&session, &policy, t(30)), SessionStatus::Resting);

        session.last_activity_at = None;
        assert_eq!(derive_status(&session, &policy, t(20)), SessionStatus::Resting);
    }

    #[test]
    fn lost_terminal_dominates_every_mode() {
        let policy = ClassifierPolicy::default();

        let mut legacy = sampled(90.0, t(1));
        legacy.last_activity_at = Some(t(1));
        legacy.has_terminal = false;
        assert_eq!(derive_status(&legacy, &policy, t(1)), SessionStatus::Zombie);

        let mut driven = apply_hook(&sampled(0.0, t(1)), &hook(HookKind::Work, t(2)));
        driven.has_terminal = false;
        assert_eq!(derive_status(&driven, &policy, t(2)), SessionStatus::Zombie);
    }

    #[test]
    fn matching_hook_upgrades_once() {
        let session = sampled(0.0, t(1));
        let upgraded = apply_hook(&session, &hook(HookKind::Work, t(2)));
        assert_eq!(upgraded.detection_mode, DetectionMode::EventDriven);
        assert_eq!(upgraded.last_hook, Some(HookKind::Work));

        let again = apply_hook(&upgraded, &hook(HookKind::Rest, t(3)));
        assert_eq!(again.detection_mode, DetectionMode::EventDriven);
        assert_eq!(again.last_hook, Some(HookKind::Rest));
        assert_eq!(
            derive_status(&again, &ClassifierPolicy::default(), t(3)),
            SessionStatus::Resting
        );
    }

    #[test]
    fn placeholder_ignores_hook_kind() {
        let session = Session::legacy(SessionIdentity::placeholder(1234), 1234, t(0));
        let next = apply_hook(
            &session,
            &HookEvent {
                session_id: "pid-1234".to_string(),
                kind: HookKind::Work,
                at: t(1),
            },
        );
        assert_eq!(next.detection_mode, DetectionMode::Legacy);
        assert_eq!(next.last_hook, None);
        assert_eq!(next.last_activity_at, Some(t(1)));
    }

    #[test]
    fn activity_never_moves_backwards() {
        let mut session = sampled(0.0, t(0));
        session.record_activity(t(10));
        session.record_activity(t(5));
        assert_eq!(session.last_activity_at, Some(t(10)));
    }

    #[test]
    fn end_hook_leaves_session_untouched() {
        let session = sampled(0.0, t(0));
        assert_eq!(apply_hook(&session, &hook(HookKind::End, t(9))), session);
    }
}
