//! Socket clients for the feed and control channels.
//!
//! The feed is fire-and-forget: one NDJSON record per connection, no reply.
//! The control socket answers each request with one JSON line; `subscribe`
//! keeps streaming afterwards.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use miner_protocol::{
    FeedRecord, Method, Request, Response, SessionEvent, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use serde_json::Value;
use thiserror::Error;

const READ_TIMEOUT_MS: u64 = 600;
const WRITE_TIMEOUT_MS: u64 = 600;
const KILL_READ_TIMEOUT_MS: u64 = 10_000;
const RETRY_DELAY_MS: u64 = 50;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Socket I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid JSON from daemon: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timed out waiting for daemon response")]
    Timeout,

    #[error("Response exceeded maximum size")]
    TooLarge,

    #[error("Daemon response was empty")]
    Empty,

    #[error("{code}: {message}")]
    Daemon { code: String, message: String },
}

fn connect(path: &Path) -> Result<UnixStream, ClientError> {
    UnixStream::connect(path).map_err(|source| ClientError::Connect {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes one record to the feed socket, retrying once after a short pause.
pub fn send_feed_record(socket: &Path, record: &FeedRecord) -> Result<(), ClientError> {
    match write_feed_record(socket, record) {
        Ok(()) => Ok(()),
        Err(err) => {
            tracing::warn!(error = %err, "Failed to send feed record; retrying");
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            write_feed_record(socket, record)
        }
    }
}

fn write_feed_record(socket: &Path, record: &FeedRecord) -> Result<(), ClientError> {
    let mut stream = connect(socket)?;
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    stream.write_all(&line)?;
    stream.flush()?;
    Ok(())
}

pub fn request(method: Method, params: Option<Value>) -> Request {
    Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id: Some(format!("miner-hook-{}", std::process::id())),
        params,
    }
}

/// Sends a request and returns the `data` of a successful response.
pub fn call(socket: &Path, request: Request) -> Result<Value, ClientError> {
    // Kill waits on the coordinator and the signal; give it room.
    let read_timeout = match request.method {
        Method::Kill => KILL_READ_TIMEOUT_MS,
        _ => READ_TIMEOUT_MS,
    };
    let mut stream = open_request(socket, &request, Duration::from_millis(read_timeout))?;
    let response = read_response(&mut stream)?;
    into_data(response)
}

fn open_request(
    socket: &Path,
    request: &Request,
    read_timeout: Duration,
) -> Result<UnixStream, ClientError> {
    let mut stream = connect(socket)?;
    let _ = stream.set_read_timeout(Some(read_timeout));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));
    serde_json::to_writer(&mut stream, request)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(stream)
}

fn into_data(response: Response) -> Result<Value, ClientError> {
    if response.ok {
        return Ok(response.data.unwrap_or(Value::Null));
    }
    let (code, message) = response
        .error
        .map(|err| (err.code, err.message))
        .unwrap_or_else(|| ("unknown".to_string(), "Unknown daemon error".to_string()));
    Err(ClientError::Daemon { code, message })
}

fn read_response(stream: &mut UnixStream) -> Result<Response, ClientError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ClientError::TooLarge);
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                return Err(ClientError::Timeout);
            }
            Err(err) => return Err(err.into()),
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };
    if response_bytes.is_empty() {
        return Err(ClientError::Empty);
    }
    Ok(serde_json::from_slice(response_bytes)?)
}

/// Streams pushed events until `on_event` returns false or the daemon hangs up.
pub fn subscribe<F>(socket: &Path, mut on_event: F) -> Result<(), ClientError>
where
    F: FnMut(SessionEvent) -> bool,
{
    let stream = open_request(
        socket,
        &request(Method::Subscribe, None),
        Duration::from_millis(READ_TIMEOUT_MS),
    )?;
    let mut reader = BufReader::new(stream);

    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim().is_empty() {
        return Err(ClientError::Empty);
    }
    into_data(serde_json::from_str(&line)?)?;
    // Events arrive whenever sessions change; no read deadline from here on.
    reader.get_ref().set_read_timeout(None)?;

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }
        let event: SessionEvent = serde_json::from_str(&line)?;
        if !on_event(event) {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::thread;
    use tempfile::TempDir;

    fn read_line(stream: &mut UnixStream) -> String {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        line
    }

    #[test]
    fn feed_record_is_sent_as_one_line() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("feed.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_line(&mut stream)
        });

        let record = FeedRecord::new("286e962f-c045-4274-8f37-c4e41fb6104a", "Stop");
        send_feed_record(&socket, &record).unwrap();

        let line = server.join().unwrap();
        assert!(line.ends_with('\n'));
        let parsed = miner_protocol::parse_feed_record(line.trim_end().as_bytes()).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn missing_socket_is_a_connect_error() {
        let temp = TempDir::new().unwrap();
        let record = FeedRecord::new("abc", "Stop");
        let err = send_feed_record(&temp.path().join("absent.sock"), &record).unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
    }

    #[test]
    fn daemon_errors_surface_code_and_message() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("control.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let line = read_line(&mut stream);
            let request: Request = serde_json::from_str(&line).unwrap();
            assert_eq!(request.method, Method::Kill);
            let response = Response::error(request.id, "not_found", "no tracked session");
            let mut payload = serde_json::to_vec(&response).unwrap();
            payload.push(b'\n');
            stream.write_all(&payload).unwrap();
        });

        let err = call(
            &socket,
            request(Method::Kill, Some(serde_json::json!({"pid": 5}))),
        )
        .unwrap_err();
        server.join().unwrap();
        match err {
            ClientError::Daemon { code, .. } => assert_eq!(code, "not_found"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn subscribe_yields_events_until_callback_stops() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("control.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_line(&mut stream);
            let ack = Response::ok(None, serde_json::json!({"subscribed": true}));
            let events = [
                SessionEvent::SessionTerminated {
                    pid: 1,
                    identity: "pid-1".to_string(),
                },
                SessionEvent::MonitorsUnreachable,
                SessionEvent::SessionTerminated {
                    pid: 2,
                    identity: "pid-2".to_string(),
                },
            ];
            let mut payload = serde_json::to_vec(&ack).unwrap();
            payload.push(b'\n');
            for event in &events {
                payload.extend(serde_json::to_vec(event).unwrap());
                payload.push(b'\n');
            }
            let _ = stream.write_all(&payload);
        });

        let mut seen = Vec::new();
        subscribe(&socket, |event| {
            let keep_going = !matches!(event, SessionEvent::MonitorsUnreachable);
            seen.push(event);
            keep_going
        })
        .unwrap();
        server.join().unwrap();

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], SessionEvent::MonitorsUnreachable);
    }
}
