//! Local socket listener for lifecycle records pushed by the agent's hooks.
//!
//! Clients connect to the feed socket and write newline-delimited JSON
//! [`FeedRecord`]s. Connections are served one at a time on the listener
//! thread, so records reach the queue in the order hooks connected. A bad
//! record is counted and skipped, and never takes the listener down.

use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use chrono::Utc;
use fs_err as fs;
use miner_protocol::{parse_feed_record_within, FeedRecord};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{MonitorSource, StopFlag, STOP_POLL_INTERVAL};
use crate::backoff::RetryBackoff;
use crate::config::EventReceiverConfig;
use crate::error::MonitorError;
use crate::events::{HookEvent, MonitorEvent};
use crate::queue::EventSender;

const SOURCE: MonitorSource = MonitorSource::EventReceiver;

/// Counters for the feed, shared with the health endpoint.
#[derive(Debug, Default)]
pub struct ReceiverStats {
    connections: AtomicU64,
    records: AtomicU64,
    forwarded: AtomicU64,
    ignored: AtomicU64,
    parse_errors: AtomicU64,
    read_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReceiverStatsSnapshot {
    pub connections: u64,
    pub records: u64,
    pub forwarded: u64,
    pub ignored: u64,
    pub parse_errors: u64,
    pub read_errors: u64,
}

impl ReceiverStats {
    pub fn snapshot(&self) -> ReceiverStatsSnapshot {
        ReceiverStatsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct FeedReceiver {
    socket_path: PathBuf,
    config: EventReceiverConfig,
    sender: EventSender,
    stop: StopFlag,
    stats: Arc<ReceiverStats>,
}

impl FeedReceiver {
    pub fn new(
        socket_path: PathBuf,
        config: EventReceiverConfig,
        sender: EventSender,
        stop: StopFlag,
    ) -> Self {
        Self {
            socket_path,
            config,
            sender,
            stop,
            stats: Arc::new(ReceiverStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ReceiverStats> {
        Arc::clone(&self.stats)
    }

    pub fn run(self) -> Result<(), MonitorError> {
        let Some(listener) = self.bind_with_retry() else {
            return Ok(());
        };
        info!(path = %self.socket_path.display(), "Event receiver listening");

        let mut backoff = RetryBackoff::default();
        while !self.stop.is_stopped() {
            match listener.accept() {
                Ok((stream, _)) => {
                    backoff.reset();
                    ReceiverStats::bump(&self.stats.connections);
                    // Served inline so records land on the queue in accept order.
                    let connection = Connection {
                        sender: &self.sender,
                        stats: &self.stats,
                        config: &self.config,
                    };
                    connection.serve(stream);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(STOP_POLL_INTERVAL);
                }
                Err(err) => {
                    ReceiverStats::bump(&self.stats.read_errors);
                    let delay = backoff.record_failure();
                    warn!(error = %err, retry_ms = delay.as_millis() as u64, "Failed to accept feed connection");
                    if !self.stop.sleep(delay) {
                        break;
                    }
                }
            }
        }

        if let Err(err) = fs::remove_file(&self.socket_path) {
            debug!(error = %err, "Feed socket already removed");
        }
        Ok(())
    }

    /// Returns None if stopped before the socket could be bound.
    fn bind_with_retry(&self) -> Option<UnixListener> {
        let mut backoff = RetryBackoff::default();
        loop {
            match bind_socket(&self.socket_path) {
                Ok(listener) => return Some(listener),
                Err(err) => {
                    let delay = backoff.record_failure();
                    warn!(
                        error = %err,
                        path = %self.socket_path.display(),
                        retry_ms = delay.as_millis() as u64,
                        "Failed to bind feed socket"
                    );
                    if !self.stop.sleep(delay) {
                        return None;
                    }
                }
            }
        }
    }
}

fn bind_socket(socket_path: &Path) -> Result<UnixListener, MonitorError> {
    if let Some(parent) = socket_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| MonitorError::io("create feed socket directory", err))?;
    }
    if socket_path.exists() {
        fs::remove_file(socket_path).map_err(|err| MonitorError::io("remove stale feed socket", err))?;
    }
    let listener =
        UnixListener::bind(socket_path).map_err(|err| MonitorError::io("bind feed socket", err))?;
    listener
        .set_nonblocking(true)
        .map_err(|err| MonitorError::io("configure feed socket", err))?;
    Ok(listener)
}

struct Connection<'a> {
    sender: &'a EventSender,
    stats: &'a ReceiverStats,
    config: &'a EventReceiverConfig,
}

impl Connection<'_> {
    fn serve(self, stream: UnixStream) {
        // Accepted sockets inherit non-blocking mode from the listener on some platforms.
        let _ = stream.set_nonblocking(false);
        let _ = stream.set_read_timeout(Some(self.config.read_timeout()));

        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        loop {
            line.clear();
            let limit = self.config.max_record_bytes as u64 + 1;
            match (&mut reader).take(limit).read_until(b'\n', &mut line) {
                Ok(0) => return,
                Ok(_) => {}
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    debug!("Feed connection idle; closing");
                    return;
                }
                Err(err) => {
                    ReceiverStats::bump(&self.stats.read_errors);
                    warn!(error = %err, "Feed connection read failed");
                    return;
                }
            }

            if !line.ends_with(b"\n") && line.len() as u64 >= limit {
                ReceiverStats::bump(&self.stats.parse_errors);
                warn!(limit = self.config.max_record_bytes, "Oversized feed record; closing connection");
                return;
            }

            if line.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }
            if self.handle_line(&line).is_err() {
                return;
            }
        }
    }

    fn handle_line(&self, line: &[u8]) -> Result<(), MonitorError> {
        ReceiverStats::bump(&self.stats.records);
        let record = match parse_feed_record_within(line, self.config.max_record_bytes) {
            Ok(record) => record,
            Err(err) => {
                ReceiverStats::bump(&self.stats.parse_errors);
                warn!(code = %err.code, message = %err.message, "Skipping malformed feed record");
                return Ok(());
            }
        };

        let Some(event) = hook_event(&record) else {
            ReceiverStats::bump(&self.stats.ignored);
            debug!(event_name = %record.event_name, "Ignoring unrecognized feed event");
            return Ok(());
        };

        self.sender.send(SOURCE, MonitorEvent::Hook(event))?;
        ReceiverStats::bump(&self.stats.forwarded);
        Ok(())
    }
}

/// Converts a validated record, stamping it with the receive time when the
/// hook sent none.
pub fn hook_event(record: &FeedRecord) -> Option<HookEvent> {
    Some(HookEvent {
        session_id: record.session_id.clone(),
        kind: record.kind()?,
        at: record.recorded_at().unwrap_or_else(Utc::now),
    })
}
