//! Session registry and reconciliation rules.
//!
//! The registry is owned by the coordinator thread and mutated only through
//! [`Registry::apply`] and the explicit removal calls. Each call returns the
//! outward notifications it caused, at most one per state change.
//!
//! Identity rules:
//! - a resource sample for an unknown pid creates a `pid-<pid>` placeholder
//! - a log event naming both a session UUID and a pid joins that pid's
//!   placeholder to the UUID session, so the two never coexist
//! - hook events never join identities; they only find sessions by UUID, and
//!   placeholder-shaped ids never match anything

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use miner_protocol::{HookKind, SessionEvent, SessionStatus, SessionView};
use tracing::{debug, info, warn};

use crate::events::{HookEvent, LogEvent, MonitorEvent, ResourceSample};
use crate::identity::SessionIdentity;
use crate::session::{self, ClassifierPolicy, Session};

/// The parts of a record that decide what to emit once it is replaced.
struct Prior {
    key: String,
    pid: u32,
    status: SessionStatus,
}

impl Prior {
    fn of(session: &Session) -> Self {
        Self {
            key: session.key(),
            pid: session.pid,
            status: session.status,
        }
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    sessions: HashMap<String, Session>,
    by_pid: HashMap<u32, String>,
    policy: ClassifierPolicy,
}

impl Registry {
    pub fn new(policy: ClassifierPolicy) -> Self {
        Self {
            sessions: HashMap::new(),
            by_pid: HashMap::new(),
            policy,
        }
    }

    pub fn apply(&mut self, event: &MonitorEvent) -> Vec<SessionEvent> {
        match event {
            MonitorEvent::Log(log) => self.apply_log(log),
            MonitorEvent::Resource(sample) => self.apply_sample(sample),
            MonitorEvent::Hook(hook) => self.apply_hook(hook),
            // Liveness is checked by the coordinator, which then calls remove_pid.
            MonitorEvent::ProcessVanished { .. } => Vec::new(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Session> {
        self.sessions.get(key)
    }

    pub fn find_by_pid(&self, pid: u32) -> Option<&Session> {
        self.by_pid.get(&pid).and_then(|key| self.sessions.get(key))
    }

    pub fn contains_pid(&self, pid: u32) -> bool {
        self.find_by_pid(pid).is_some()
    }

    /// Sessions ordered by creation time, then identity.
    pub fn snapshot(&self) -> Vec<SessionView> {
        let mut views: Vec<SessionView> = self.sessions.values().map(Session::view).collect();
        views.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.identity.cmp(&b.identity))
        });
        views
    }

    pub fn status_counts(&self) -> HashMap<SessionStatus, usize> {
        let mut counts = HashMap::new();
        for session in self.sessions.values() {
            *counts.entry(session.status).or_insert(0) += 1;
        }
        counts
    }

    /// Sessions with no signal of any kind since `cutoff`, as `(key, pid)`.
    pub fn idle_since(&self, cutoff: DateTime<Utc>) -> Vec<(String, u32)> {
        let mut idle: Vec<(String, u32)> = self
            .sessions
            .values()
            .filter(|session| session.last_seen_at < cutoff)
            .map(|session| (session.key(), session.pid))
            .collect();
        idle.sort();
        idle
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Removal
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn remove_pid(&mut self, pid: u32) -> Option<SessionEvent> {
        let key = self.by_pid.get(&pid)?.clone();
        self.remove_key(&key)
    }

    pub fn remove_key(&mut self, key: &str) -> Option<SessionEvent> {
        let session = self.sessions.remove(key)?;
        if session.pid != 0 && self.by_pid.get(&session.pid).map(String::as_str) == Some(key) {
            self.by_pid.remove(&session.pid);
        }
        info!(
            identity = %session.identity,
            pid = session.pid,
            "Session terminated"
        );
        Some(SessionEvent::SessionTerminated {
            pid: session.pid,
            identity: session.key(),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Event application
    // ─────────────────────────────────────────────────────────────────────────────

    fn apply_log(&mut self, log: &LogEvent) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let pid = log.pid.filter(|pid| *pid != 0);
        let canonical = log.session_id.as_deref().and_then(SessionIdentity::canonical);

        let (prior, mut next) = match (canonical, pid) {
            (Some(identity), pid) => self.resolve_canonical(identity, pid, log.at, &mut events),
            (None, Some(pid)) => self.resolve_pid(pid, log.at),
            (None, None) => {
                debug!(session_id = ?log.session_id, "Log event names no session or pid");
                return events;
            }
        };

        next.record_activity(log.at);
        self.store(prior, next, log.at, &mut events);
        events
    }

    fn apply_sample(&mut self, sample: &ResourceSample) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if sample.pid == 0 {
            return events;
        }

        let (prior, mut next) = self.resolve_pid(sample.pid, sample.at);
        next.cpu_usage = sample.cpu_usage;
        next.memory_bytes = sample.memory_bytes;
        next.has_terminal = sample.has_terminal;
        next.last_sampled_at = Some(sample.at);
        next.touch(sample.at);

        self.store(prior, next, sample.at, &mut events);
        events
    }

    fn apply_hook(&mut self, hook: &HookEvent) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let Some(identity) = SessionIdentity::canonical(&hook.session_id) else {
            debug!(
                session_id = %hook.session_id,
                "Dropping hook for non-canonical session id"
            );
            return events;
        };
        if hook.kind == HookKind::End {
            events.extend(self.remove_key(&hook.session_id));
            return events;
        }

        if let Some(existing) = self.sessions.get(&hook.session_id) {
            let prior = Prior::of(existing);
            let before = existing.detection_mode;
            let next = session::apply_hook(existing, hook);
            if next.detection_mode != before {
                info!(
                    session_id = %hook.session_id,
                    pid = next.pid,
                    "Session upgraded to event-driven detection"
                );
                events.push(SessionEvent::DetectionUpgraded {
                    pid: next.pid,
                    session_id: hook.session_id.clone(),
                });
            }
            self.store(Some(prior), next, hook.at, &mut events);
        } else {
            let next = Session::event_driven(identity, hook);
            self.store(None, next, hook.at, &mut events);
        }
        events
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Identity resolution
    // ─────────────────────────────────────────────────────────────────────────────

    fn resolve_pid(&self, pid: u32, at: DateTime<Utc>) -> (Option<Prior>, Session) {
        match self.find_by_pid(pid) {
            Some(existing) => (Some(Prior::of(existing)), existing.clone()),
            None => (None, Session::legacy(SessionIdentity::placeholder(pid), pid, at)),
        }
    }

    fn resolve_canonical(
        &mut self,
        identity: SessionIdentity,
        pid: Option<u32>,
        at: DateTime<Utc>,
        events: &mut Vec<SessionEvent>,
    ) -> (Option<Prior>, Session) {
        let key = identity.key();
        let holder = pid.and_then(|pid| self.by_pid.get(&pid).cloned());

        let Some(existing) = self.sessions.get(&key) else {
            return match (pid, holder) {
                (Some(pid), Some(holder)) if is_placeholder_key(&self.sessions, &holder) => {
                    let Some(placeholder) = self.sessions.get(&holder) else {
                        return (None, Session::legacy(identity, pid, at));
                    };
                    let prior = Prior::of(placeholder);
                    let mut next = placeholder.clone();
                    info!(pid, session_id = %key, "Placeholder resolved to canonical session");
                    events.push(SessionEvent::IdentityResolved {
                        pid,
                        placeholder: holder,
                        session_id: key,
                    });
                    next.identity = identity;
                    (Some(prior), next)
                }
                (Some(pid), Some(holder)) => {
                    warn!(
                        pid,
                        session_id = %key,
                        current = %holder,
                        "Pid already claimed by another session; tracking without pid"
                    );
                    (None, Session::legacy(identity, 0, at))
                }
                (pid, _) => (None, Session::legacy(identity, pid.unwrap_or(0), at)),
            };
        };

        let prior = Prior::of(existing);
        let mut next = existing.clone();
        let Some(pid) = pid else {
            return (Some(prior), next);
        };

        match holder {
            Some(holder) if holder == key => {}
            Some(holder) if is_placeholder_key(&self.sessions, &holder) => {
                if let Some(placeholder) = self.sessions.remove(&holder) {
                    absorb_placeholder(&mut next, placeholder);
                    info!(pid, session_id = %key, "Placeholder merged into canonical session");
                    events.push(SessionEvent::IdentityResolved {
                        pid,
                        placeholder: holder,
                        session_id: key,
                    });
                }
            }
            Some(holder) => {
                warn!(
                    pid,
                    session_id = %key,
                    current = %holder,
                    "Pid already claimed by another session; leaving pid unchanged"
                );
            }
            None => {
                if next.pid != 0 && next.pid != pid {
                    info!(old_pid = next.pid, pid, session_id = %key, "Session moved to a new process");
                }
                next.pid = pid;
            }
        }
        (Some(prior), next)
    }

    /// Recomputes status, writes the record and emits Created/StatusChanged.
    fn store(
        &mut self,
        prior: Option<Prior>,
        mut next: Session,
        now: DateTime<Utc>,
        events: &mut Vec<SessionEvent>,
    ) {
        next.status = session::derive_status(&next, &self.policy, now);
        let key = next.key();

        if let Some(prior) = &prior {
            if prior.key != key {
                self.sessions.remove(&prior.key);
            }
            if prior.pid != 0
                && prior.pid != next.pid
                && self.by_pid.get(&prior.pid) == Some(&prior.key)
            {
                self.by_pid.remove(&prior.pid);
            }
        }
        if next.pid != 0 {
            self.by_pid.insert(next.pid, key.clone());
        }

        match prior {
            None => {
                info!(
                    identity = %key,
                    pid = next.pid,
                    status = %next.status,
                    "Session created"
                );
                events.push(SessionEvent::SessionCreated {
                    session: next.view(),
                });
            }
            Some(prior) if prior.status != next.status => {
                debug!(
                    identity = %key,
                    pid = next.pid,
                    old = %prior.status,
                    new = %next.status,
                    "Session status changed"
                );
                events.push(SessionEvent::SessionStatusChanged {
                    pid: next.pid,
                    identity: key.clone(),
                    old_status: prior.status,
                    new_status: next.status,
                });
            }
            Some(_) => {}
        }

        self.sessions.insert(key, next);
    }
}

fn is_placeholder_key(sessions: &HashMap<String, Session>, key: &str) -> bool {
    sessions
        .get(key)
        .map(|session| session.identity.is_placeholder())
        .unwrap_or(false)
}

/// Folds a placeholder's process facts into the canonical record.
fn absorb_placeholder(session: &mut Session, placeholder: Session) {
    session.pid = placeholder.pid;
    let newer_sample = match (session.last_sampled_at, placeholder.last_sampled_at) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(own), Some(theirs)) => theirs > own,
    };
    if newer_sample {
        session.cpu_usage = placeholder.cpu_usage;
        session.memory_bytes = placeholder.memory_bytes;
        session.has_terminal = placeholder.has_terminal;
        session.last_sampled_at = placeholder.last_sampled_at;
    }
    if let Some(activity) = placeholder.last_activity_at {
        session.record_activity(activity);
    }
    session.touch(placeholder.last_seen_at);
    session.created_at = session.created_at.min(placeholder.created_at);
}
