use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use miner_protocol::{Method, Request, Response, PROTOCOL_VERSION};
use serde_json::Value;
use tempfile::TempDir;

const SESSION_ID: &str = "286e962f-c045-4274-8f37-c4e41fb6104a";

struct DaemonGuard {
    child: Option<Child>,
}

impl DaemonGuard {
    fn terminate(&mut self) -> Option<i32> {
        let mut child = self.child.take()?;
        // SAFETY: signalling our own child process.
        unsafe {
            libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
        }
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if let Ok(Some(status)) = child.try_wait() {
                return status.code();
            }
            sleep(Duration::from_millis(50));
        }
        let _ = child.kill();
        let _ = child.wait();
        None
    }
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

struct Env {
    home: TempDir,
}

impl Env {
    fn new() -> Self {
        let home = TempDir::new().expect("Failed to create temp HOME");
        let config = format!(
            "[log_watcher]\nlog_dir = \"{}\"\n\n[resource_monitor]\nprocess_names = [\"miner-smoke-no-such-process\"]\n",
            home.path().join("debug").display()
        );
        std::fs::write(home.path().join("miner.toml"), config).expect("write config");
        Self { home }
    }

    fn control_socket(&self) -> PathBuf {
        self.home.path().join(".miner").join("control.sock")
    }

    fn feed_socket(&self) -> PathBuf {
        self.home.path().join(".miner").join("feed.sock")
    }

    fn spawn_daemon(&self) -> DaemonGuard {
        let child = Command::new(env!("CARGO_BIN_EXE_miner-daemon"))
            .env("HOME", self.home.path())
            .env("MINER_CONFIG", self.home.path().join("miner.toml"))
            .env_remove("MINER_FEED_SOCKET")
            .env_remove("MINER_CONTROL_SOCKET")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("Failed to spawn miner-daemon");
        wait_for_socket(&self.control_socket(), Duration::from_secs(5));
        wait_for_socket(&self.feed_socket(), Duration::from_secs(5));
        DaemonGuard { child: Some(child) }
    }
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if UnixStream::connect(path).is_ok() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("Timed out waiting for socket at {}", path.display());
}

fn request(method: Method, params: Option<Value>) -> Request {
    Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id: Some(format!("{:?}", method)),
        params,
    }
}

fn send_request(socket: &Path, request: Request) -> Response {
    let mut stream = UnixStream::connect(socket).expect("Failed to connect to control socket");
    serde_json::to_writer(&mut stream, &request).expect("Failed to serialize request");
    stream.write_all(b"\n").expect("Failed to write request");
    stream.flush().ok();
    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Response {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).expect("Failed to read response");
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if chunk[..n].contains(&b'\n') {
            break;
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };
    serde_json::from_slice(response_bytes).expect("Failed to parse response JSON")
}

fn send_feed(socket: &Path, event_name: &str) {
    let mut stream = UnixStream::connect(socket).expect("Failed to connect to feed socket");
    writeln!(
        stream,
        r#"{{"session_id":"{}","event_name":"{}"}}"#,
        SESSION_ID, event_name
    )
    .expect("Failed to write feed record");
}

fn sessions(socket: &Path) -> Vec<Value> {
    let response = send_request(socket, request(Method::GetSessions, None));
    assert!(response.ok, "sessions response was not ok");
    response
        .data
        .and_then(|data| data.as_array().cloned())
        .expect("sessions payload is array")
}

fn wait_for_sessions(socket: &Path, count: usize) -> Vec<Value> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let current = sessions(socket);
        if current.len() == count || Instant::now() >= deadline {
            return current;
        }
        sleep(Duration::from_millis(25));
    }
}

#[test]
fn daemon_health_sessions_and_kill_smoke() {
    let env = Env::new();
    let control = env.control_socket();
    let mut daemon = env.spawn_daemon();

    let health = send_request(&control, request(Method::GetHealth, None));
    assert!(health.ok, "health response was not ok");
    let data = health.data.expect("health payload");
    assert_eq!(data["status"], "ok");
    assert_eq!(data["protocol_version"], PROTOCOL_VERSION);

    send_feed(&env.feed_socket(), "UserPromptSubmit");
    let current = wait_for_sessions(&control, 1);
    assert_eq!(current.len(), 1);
    assert_eq!(current[0]["identity"], SESSION_ID);
    assert_eq!(current[0]["detection_mode"], "event_driven");
    assert_eq!(current[0]["status"], "working");
    assert_eq!(current[0]["pid"], 0);

    let kill = send_request(
        &control,
        request(Method::Kill, Some(serde_json::json!({ "pid": 999_999 }))),
    );
    assert!(!kill.ok);
    assert_eq!(kill.error.expect("kill error").code, "not_found");

    let missing = send_request(&control, request(Method::Kill, None));
    assert_eq!(missing.error.expect("params error").code, "invalid_params");

    send_feed(&env.feed_socket(), "SessionEnd");
    assert!(wait_for_sessions(&control, 0).is_empty());

    assert_eq!(daemon.terminate(), Some(0));
    assert!(!control.exists(), "control socket left behind");
}

#[test]
fn daemon_rejects_bad_requests() {
    let env = Env::new();
    let control = env.control_socket();
    let _daemon = env.spawn_daemon();

    let mut stream = UnixStream::connect(&control).expect("connect");
    stream.write_all(b"{not json}\n").expect("write");
    let response = read_response(&mut stream);
    assert_eq!(response.error.expect("error").code, "invalid_json");

    let mismatch = send_request(
        &control,
        Request {
            protocol_version: PROTOCOL_VERSION + 1,
            method: Method::GetHealth,
            id: None,
            params: None,
        },
    );
    assert_eq!(mismatch.error.expect("error").code, "protocol_mismatch");
}

#[test]
fn subscribers_receive_pushed_session_events() {
    let env = Env::new();
    let control = env.control_socket();
    let _daemon = env.spawn_daemon();

    let mut stream = UnixStream::connect(&control).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");
    serde_json::to_writer(&mut stream, &request(Method::Subscribe, None)).expect("serialize");
    stream.write_all(b"\n").expect("write");

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).expect("ack");
    let ack: Response = serde_json::from_str(&line).expect("ack json");
    assert!(ack.ok);
    assert_eq!(ack.data.expect("ack payload")["subscribed"], true);

    send_feed(&env.feed_socket(), "SessionStart");

    line.clear();
    reader.read_line(&mut line).expect("event");
    let event: Value = serde_json::from_str(&line).expect("event json");
    assert_eq!(event["type"], "session_created");
    assert_eq!(event["session"]["identity"], SESSION_ID);
    assert_eq!(event["session"]["status"], "resting");
}
