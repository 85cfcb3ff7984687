//! The coordinator: sole consumer of the event queue and sole writer of the
//! session registry.
//!
//! Everything that changes a session goes through the queue, including kill
//! commands, so monitor events and operator actions are serialized. Readers
//! get copies: a snapshot behind a lock, or the push feed of [`SessionEvent`]s.

use std::collections::BTreeSet;
use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use miner_protocol::{SessionEvent, SessionStatus, SessionView};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::KillError;
use crate::events::MonitorEvent;
use crate::monitor::MonitorSource;
use crate::process::ProcessControl;
use crate::queue::{event_queue, Command, EventReceiver, EventSender, Pop, QueueItem};
use crate::registry::Registry;
use crate::session::ClassifierPolicy;

const MAX_IDLE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub sessions: usize,
    pub events_processed: u64,
    pub down_monitors: Vec<MonitorSource>,
    pub started_at: DateTime<Utc>,
}

struct Shared {
    sessions: Vec<SessionView>,
    status: CoordinatorStatus,
}

/// Fan-out of session events to any number of listeners. Listeners that hang
/// up are dropped on the next publish.
#[derive(Clone, Default)]
pub struct Subscribers(Arc<Mutex<Vec<Sender<SessionEvent>>>>);

impl Subscribers {
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subscribers) = self.0.lock() {
            subscribers.push(tx);
        }
        rx
    }

    fn publish(&self, event: &SessionEvent) {
        if let Ok(mut subscribers) = self.0.lock() {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    pub fn len(&self) -> usize {
        self.0.lock().map(|subscribers| subscribers.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cloneable access to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    sender: EventSender,
    shared: Arc<RwLock<Shared>>,
    subscribers: Subscribers,
    kill_timeout: Duration,
}

impl CoordinatorHandle {
    /// Sender for monitors to enqueue events on.
    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    pub fn sessions(&self) -> Vec<SessionView> {
        self.shared
            .read()
            .map(|shared| shared.sessions.clone())
            .unwrap_or_default()
    }

    pub fn status(&self) -> Option<CoordinatorStatus> {
        self.shared.read().map(|shared| shared.status.clone()).ok()
    }

    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        self.subscribers.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Queues a kill behind any pending events and waits for the outcome.
    pub fn kill(&self, pid: u32) -> Result<(), KillError> {
        let (reply, outcome) = mpsc::channel();
        if !self.sender.command(Command::Kill { pid, reply }) {
            return Err(KillError::Other("coordinator is not running".to_string()));
        }
        match outcome.recv_timeout(self.kill_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                Err(KillError::Other("coordinator did not respond".to_string()))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(KillError::Other("coordinator stopped".to_string()))
            }
        }
    }

    /// Asks the coordinator to drain the queue and stop.
    pub fn shutdown(&self) -> bool {
        self.sender.command(Command::Shutdown)
    }
}

pub struct Coordinator<P: ProcessControl> {
    registry: Registry,
    queue: EventReceiver,
    control: P,
    config: CoordinatorConfig,
    shared: Arc<RwLock<Shared>>,
    subscribers: Subscribers,
    down: BTreeSet<MonitorSource>,
    unreachable_reported: bool,
    events_processed: u64,
    started_at: DateTime<Utc>,
    last_tick: Instant,
}

/// Starts the coordinator thread and returns a handle to it.
pub fn spawn_coordinator<P: ProcessControl>(
    policy: ClassifierPolicy,
    config: CoordinatorConfig,
    control: P,
) -> io::Result<(CoordinatorHandle, JoinHandle<()>)> {
    let (sender, queue) = event_queue();
    let started_at = Utc::now();
    let shared = Arc::new(RwLock::new(Shared {
        sessions: Vec::new(),
        status: CoordinatorStatus {
            sessions: 0,
            events_processed: 0,
            down_monitors: Vec::new(),
            started_at,
        },
    }));
    let subscribers = Subscribers::default();

    let handle = CoordinatorHandle {
        sender,
        shared: Arc::clone(&shared),
        subscribers: subscribers.clone(),
        kill_timeout: config.kill_timeout(),
    };

    let coordinator = Coordinator {
        registry: Registry::new(policy),
        queue,
        control,
        config,
        shared,
        subscribers,
        down: BTreeSet::new(),
        unreachable_reported: false,
        events_processed: 0,
        started_at,
        last_tick: Instant::now(),
    };

    let join = thread::Builder::new()
        .name("miner-coordinator".to_string())
        .spawn(move || coordinator.run())?;
    Ok((handle, join))
}

impl<P: ProcessControl> Coordinator<P> {
    fn run(mut self) {
        info!("Coordinator started");
        let idle_wait = self.config.summary_interval().min(MAX_IDLE_WAIT);

        loop {
            match self.queue.pop(idle_wait) {
                Pop::Item(QueueItem::Command(Command::Shutdown)) => {
                    self.drain();
                    break;
                }
                Pop::Item(item) => self.handle(item),
                Pop::Idle => {}
                Pop::Closed => break,
            }
            self.tick_if_due();
        }

        self.log_summary();
        info!("Coordinator stopped");
    }

    /// Applies everything already queued; used on shutdown.
    fn drain(&mut self) {
        let mut drained = 0usize;
        while let Some(item) = self.queue.try_pop() {
            if !matches!(item, QueueItem::Command(Command::Shutdown)) {
                self.handle(item);
                drained += 1;
            }
        }
        debug!(drained, "Drained queue before shutdown");
    }

    fn handle(&mut self, item: QueueItem) {
        match item {
            QueueItem::Event(event) => self.on_event(event),
            QueueItem::Command(Command::Kill { pid, reply }) => {
                let result = self.kill(pid);
                if reply.send(result).is_err() {
                    debug!(pid, "Kill caller went away before the reply");
                }
            }
            QueueItem::Command(Command::MonitorStopped { source, reason }) => {
                self.on_monitor_stopped(source, reason)
            }
            QueueItem::Command(Command::Shutdown) => {}
        }
        self.refresh_shared();
    }

    fn on_event(&mut self, event: MonitorEvent) {
        self.events_processed += 1;
        let events = match &event {
            MonitorEvent::ProcessVanished { pid, .. } => self.on_vanished(*pid),
            _ => self.registry.apply(&event),
        };
        self.emit(events);
    }

    fn on_vanished(&mut self, pid: u32) -> Vec<SessionEvent> {
        if !self.registry.contains_pid(pid) || self.control.is_alive(pid) {
            return Vec::new();
        }
        debug!(pid, "Tracked process exited");
        self.registry.remove_pid(pid).into_iter().collect()
    }

    fn kill(&mut self, pid: u32) -> Result<(), KillError> {
        if !self.registry.contains_pid(pid) {
            warn!(pid, "Refusing to kill untracked pid");
            return Err(KillError::NotFound);
        }

        match self.control.terminate(pid) {
            Ok(()) => {
                info!(pid, "Session process terminated by operator");
                let events = self.registry.remove_pid(pid).into_iter().collect();
                self.emit(events);
                Ok(())
            }
            Err(err) => {
                warn!(pid, error = %err, "Kill failed");
                Err(err)
            }
        }
    }

    fn on_monitor_stopped(&mut self, source: MonitorSource, reason: String) {
        self.down.insert(source);
        error!(
            monitor = %source,
            reason = %reason,
            down = self.down.len(),
            "Monitor stopped"
        );
        if self.down.len() == MonitorSource::ALL.len() && !self.unreachable_reported {
            self.unreachable_reported = true;
            error!("All monitors unreachable");
            self.subscribers.publish(&SessionEvent::MonitorsUnreachable);
        }
    }

    fn emit(&mut self, events: Vec<SessionEvent>) {
        if events.is_empty() {
            return;
        }
        // Listeners reacting to an event must find it reflected in the snapshot.
        self.refresh_shared();
        for event in &events {
            self.subscribers.publish(event);
        }
    }

    fn refresh_shared(&self) {
        if let Ok(mut shared) = self.shared.write() {
            shared.sessions = self.registry.snapshot();
            shared.status = CoordinatorStatus {
                sessions: self.registry.len(),
                events_processed: self.events_processed,
                down_monitors: self.down.iter().copied().collect(),
                started_at: self.started_at,
            };
        }
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Periodic work
    // ─────────────────────────────────────────────────────────────────────────────

    fn tick_if_due(&mut self) {
        if self.last_tick.elapsed() < self.config.summary_interval() {
            return;
        }
        self.last_tick = Instant::now();
        self.sweep_stale(Utc::now());
        self.log_summary();
    }

    /// Drops sessions that have been silent too long and whose process is gone.
    fn sweep_stale(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.config.stale_after();
        let mut events = Vec::new();
        for (key, pid) in self.registry.idle_since(cutoff) {
            if pid != 0 && self.control.is_alive(pid) {
                continue;
            }
            debug!(identity = %key, pid, "Removing stale session");
            events.extend(self.registry.remove_key(&key));
        }
        self.emit(events);
        self.refresh_shared();
    }

    fn log_summary(&self) {
        let counts = self.registry.status_counts();
        let count = |status: SessionStatus| counts.get(&status).copied().unwrap_or(0);
        info!(
            sessions = self.registry.len(),
            working = count(SessionStatus::Working),
            resting = count(SessionStatus::Resting),
            zombie = count(SessionStatus::Zombie),
            pending = count(SessionStatus::LegacyPending),
            events_processed = self.events_processed,
            subscribers = self.subscribers.len(),
            "Session summary"
        );
    }
}
