//! Control socket: health, session snapshots, kill, and a push subscription.
//!
//! Each connection carries one newline-terminated JSON [`Request`] and gets
//! one JSON [`Response`] line back. `subscribe` keeps the connection open and
//! streams [`SessionEvent`]s as NDJSON after the initial response.

use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fs_err as fs;
use miner_core::{CoordinatorHandle, ReceiverStats, StopFlag};
use miner_protocol::{
    parse_kill_params, ErrorInfo, KillFailure, Method, Request, Response, SessionEvent,
    MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use serde_json::Value;
use tracing::{debug, info, warn};

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const SUBSCRIBE_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// A subscriber that stops reading for this long is disconnected.
const SUBSCRIBER_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct ControlContext {
    pub handle: CoordinatorHandle,
    pub receiver_stats: Arc<ReceiverStats>,
    pub stop: StopFlag,
}

pub struct ControlServer {
    listener: UnixListener,
    socket_path: PathBuf,
    context: ControlContext,
}

impl ControlServer {
    pub fn bind(socket_path: PathBuf, context: ControlContext) -> Result<Self, String> {
        prepare_socket_dir(&socket_path)?;
        remove_existing_socket(&socket_path)?;
        let listener = UnixListener::bind(&socket_path)
            .map_err(|err| format!("Failed to bind control socket: {}", err))?;
        listener
            .set_nonblocking(true)
            .map_err(|err| format!("Failed to configure control socket: {}", err))?;
        info!(path = %socket_path.display(), "Control socket listening");
        Ok(Self {
            listener,
            socket_path,
            context,
        })
    }

    pub fn serve(self) {
        while !self.context.stop.is_stopped() {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    let context = self.context.clone();
                    let spawned = thread::Builder::new()
                        .name("miner-control-conn".to_string())
                        .spawn(move || handle_connection(stream, context));
                    if let Err(err) = spawned {
                        warn!(error = %err, "Failed to spawn control connection handler");
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(err) => {
                    warn!(error = %err, "Failed to accept control connection");
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }
        if let Err(err) = fs::remove_file(&self.socket_path) {
            debug!(error = %err, "Control socket already removed");
        }
    }
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, context: ControlContext) {
    // Accepted sockets inherit non-blocking mode from the listener on some platforms.
    let _ = stream.set_nonblocking(false);
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_line(&mut stream, &response);
            return;
        }
    };

    debug!(method = ?request.method, id = ?request.id, "Control request received");
    if request.protocol_version == PROTOCOL_VERSION && request.method == Method::Subscribe {
        stream_events(stream, request.id, &context);
        return;
    }
    let response = handle_request(request, &context);
    let _ = write_line(&mut stream, &response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };
    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, context: &ControlContext) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    match request.method {
        Method::GetHealth => Response::ok(request.id, health(context)),
        Method::GetSessions => {
            let sessions = context.handle.sessions();
            debug!(sessions = sessions.len(), "Sessions snapshot");
            match serde_json::to_value(&sessions) {
                Ok(value) => Response::ok(request.id, value),
                Err(err) => Response::error(
                    request.id,
                    "serialization_error",
                    format!("Failed to serialize sessions: {}", err),
                ),
            }
        }
        Method::Kill => handle_kill(request.id, request.params, context),
        // Routed to `stream_events` before we get here.
        Method::Subscribe => Response::error(
            request.id,
            "invalid_method",
            "subscribe must be the only request on its connection",
        ),
    }
}

fn health(context: &ControlContext) -> Value {
    let status = context.handle.status();
    let degraded = status
        .as_ref()
        .map(|status| !status.down_monitors.is_empty())
        .unwrap_or(true);

    let mut data = serde_json::json!({
        "status": if degraded { "degraded" } else { "ok" },
        "pid": std::process::id(),
        "version": env!("CARGO_PKG_VERSION"),
        "protocol_version": PROTOCOL_VERSION,
        "subscribers": context.handle.subscriber_count(),
    });
    if let Some(value) = status.and_then(|status| serde_json::to_value(status).ok()) {
        data["coordinator"] = value;
    }
    if let Ok(value) = serde_json::to_value(context.receiver_stats.snapshot()) {
        data["event_receiver"] = value;
    }
    data
}

fn handle_kill(id: Option<String>, params: Option<Value>, context: &ControlContext) -> Response {
    let Some(params) = params else {
        return Response::error(id, "invalid_params", "pid is required");
    };
    let parsed = match parse_kill_params(params) {
        Ok(parsed) => parsed,
        Err(err) => return Response::error_with_info(id, err),
    };

    match context.handle.kill(parsed.pid) {
        Ok(()) => {
            info!(pid = parsed.pid, "Killed session process on request");
            Response::ok(id, serde_json::json!({ "killed": true, "pid": parsed.pid }))
        }
        Err(err) => {
            let message = err.to_string();
            let failure = KillFailure::from(err);
            warn!(pid = parsed.pid, code = failure.code(), error = %message, "Kill request failed");
            Response::error(id, failure.code(), message)
        }
    }
}

fn stream_events(mut stream: UnixStream, id: Option<String>, context: &ControlContext) {
    if let Err(err) = stream.set_write_timeout(Some(SUBSCRIBER_WRITE_TIMEOUT)) {
        warn!(error = %err, "Failed to configure subscriber socket");
        return;
    }
    let events = context.handle.subscribe();
    let ack = Response::ok(
        id,
        serde_json::json!({ "subscribed": true, "sessions": context.handle.sessions() }),
    );
    if write_line(&mut stream, &ack).is_err() {
        return;
    }
    debug!("Subscriber attached");

    // Returning drops `events`; the coordinator prunes the sender on its next publish.
    if let Err(err) = forward_events(&mut stream, &events, &context.stop) {
        debug!(error = %err, "Subscriber went away");
    }
}

fn forward_events(
    stream: &mut UnixStream,
    events: &Receiver<SessionEvent>,
    stop: &StopFlag,
) -> io::Result<()> {
    while !stop.is_stopped() {
        match events.recv_timeout(SUBSCRIBE_POLL_INTERVAL) {
            Ok(event) => {
                write_line(stream, &event)?;
                if matches!(event, SessionEvent::MonitorsUnreachable) {
                    return Ok(());
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
    Ok(())
}

fn write_line<T: serde::Serialize>(stream: &mut UnixStream, value: &T) -> io::Result<()> {
    serde_json::to_writer(&mut *stream, value)?;
    stream.write_all(b"\n")?;
    stream.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    #[test]
    fn subscriber_that_never_reads_is_disconnected() {
        let (mut server, _client) = UnixStream::pair().unwrap();
        server
            .set_write_timeout(Some(SUBSCRIBER_WRITE_TIMEOUT))
            .unwrap();
        let (tx, rx) = mpsc::channel();
        let identity = "x".repeat(64 * 1024);
        for pid in 0..256 {
            tx.send(SessionEvent::SessionTerminated {
                pid,
                identity: identity.clone(),
            })
            .unwrap();
        }

        let started = Instant::now();
        let result = forward_events(&mut server, &rx, &StopFlag::new());
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn forwarding_ends_after_monitors_unreachable() {
        let (mut server, client) = UnixStream::pair().unwrap();
        let (tx, rx) = mpsc::channel();
        tx.send(SessionEvent::MonitorsUnreachable).unwrap();

        forward_events(&mut server, &rx, &StopFlag::new()).unwrap();
        drop(server);

        let mut received = String::new();
        (&client).read_to_string(&mut received).unwrap();
        let event: SessionEvent = serde_json::from_str(received.trim()).unwrap();
        assert_eq!(event, SessionEvent::MonitorsUnreachable);
    }
}
