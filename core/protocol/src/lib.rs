//! Wire and control protocol types for miner.
//!
//! This crate is shared by the daemon, the core library, and the hook CLI to
//! prevent schema drift. Two channels are described here:
//!
//! - the **feed**: newline-delimited [`FeedRecord`]s written by the monitored
//!   program's lifecycle hooks;
//! - the **control** socket: versioned [`Request`]/[`Response`] envelopes for
//!   querying sessions, killing processes, and subscribing to [`SessionEvent`]s.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_FEED_RECORD_BYTES: usize = 64 * 1024;

/// Session id the hook shell template leaves behind when the variable was not expanded.
pub const UNEXPANDED_SESSION_ID: &str = "$SESSION_ID";

// ═══════════════════════════════════════════════════════════════════════════════
// Control envelope
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    GetSessions,
    Kill,
    Subscribe,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct KillParams {
    pub pid: u32,
}

pub fn parse_kill_params(params: Value) -> Result<KillParams, ErrorInfo> {
    let parsed: KillParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new("invalid_params", format!("kill params are invalid: {}", err))
    })?;
    if parsed.pid == 0 {
        return Err(ErrorInfo::new("invalid_pid", "pid must be non-zero"));
    }
    Ok(parsed)
}

/// Reason a kill request failed, as reported to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum KillFailure {
    NotFound,
    PermissionDenied,
    Other(String),
}

impl KillFailure {
    pub fn code(&self) -> &'static str {
        match self {
            KillFailure::NotFound => "not_found",
            KillFailure::PermissionDenied => "permission_denied",
            KillFailure::Other(_) => "kill_failed",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Session model (as seen by clients)
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Legacy session observed but not yet classified by a resource sample.
    LegacyPending,
    Working,
    Resting,
    Zombie,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::LegacyPending => "legacy_pending",
            SessionStatus::Working => "working",
            SessionStatus::Resting => "resting",
            SessionStatus::Zombie => "zombie",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    Legacy,
    EventDriven,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionView {
    pub identity: String,
    pub pid: u32,
    pub status: SessionStatus,
    pub detection_mode: DetectionMode,
    pub cpu_usage: f32,
    pub memory_bytes: u64,
    pub has_terminal: bool,
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Outward push feed published by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionCreated {
        session: SessionView,
    },
    SessionStatusChanged {
        pid: u32,
        identity: String,
        old_status: SessionStatus,
        new_status: SessionStatus,
    },
    SessionTerminated {
        pid: u32,
        identity: String,
    },
    DetectionUpgraded {
        pid: u32,
        session_id: String,
    },
    /// A pid-only placeholder was joined to its canonical session id; the
    /// placeholder identity no longer exists.
    IdentityResolved {
        pid: u32,
        placeholder: String,
        session_id: String,
    },
    /// Every monitor has stopped; the surrounding application should escalate.
    MonitorsUnreachable,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Feed records (hook → daemon)
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    Work,
    Rest,
    End,
}

impl HookKind {
    /// Maps a lifecycle hook name to its kind. Unknown names are not guessed at.
    pub fn from_event_name(name: &str) -> Option<Self> {
        match name.trim() {
            "UserPromptSubmit" | "working" => Some(HookKind::Work),
            "Stop" | "SessionStart" | "start" | "resting" => Some(HookKind::Rest),
            "SessionEnd" | "end" => Some(HookKind::End),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeedTimestamp {
    UnixSeconds(i64),
    Rfc3339(String),
}

impl FeedTimestamp {
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            FeedTimestamp::UnixSeconds(secs) => Utc.timestamp_opt(*secs, 0).single(),
            FeedTimestamp::Rfc3339(value) => DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRecord {
    #[serde(alias = "sid")]
    pub session_id: String,
    #[serde(alias = "evt")]
    pub event_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<FeedTimestamp>,
}

impl FeedRecord {
    pub fn new(session_id: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            event_name: event_name.into(),
            timestamp: Some(FeedTimestamp::Rfc3339(Utc::now().to_rfc3339())),
        }
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        let session_id = self.session_id.trim();
        if session_id.is_empty() {
            return Err(ErrorInfo::new("invalid_session_id", "session_id is required"));
        }
        if session_id == UNEXPANDED_SESSION_ID {
            return Err(ErrorInfo::new(
                "invalid_session_id",
                "session_id was not expanded by the hook",
            ));
        }
        if self.event_name.trim().is_empty() {
            return Err(ErrorInfo::new("invalid_event_name", "event_name is required"));
        }
        if let Some(timestamp) = &self.timestamp {
            if timestamp.to_datetime().is_none() {
                return Err(ErrorInfo::new(
                    "invalid_timestamp",
                    "timestamp must be RFC3339 or unix seconds",
                ));
            }
        }
        Ok(())
    }

    pub fn kind(&self) -> Option<HookKind> {
        HookKind::from_event_name(&self.event_name)
    }

    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp.as_ref().and_then(FeedTimestamp::to_datetime)
    }
}

/// Parses and validates one feed line (without its trailing newline).
pub fn parse_feed_record(line: &[u8]) -> Result<FeedRecord, ErrorInfo> {
    parse_feed_record_within(line, MAX_FEED_RECORD_BYTES)
}

/// Like [`parse_feed_record`], with a caller-chosen size limit.
pub fn parse_feed_record_within(line: &[u8], max_bytes: usize) -> Result<FeedRecord, ErrorInfo> {
    if line.len() > max_bytes {
        return Err(ErrorInfo::new(
            "record_too_large",
            "feed record exceeded maximum size",
        ));
    }
    let text = std::str::from_utf8(line)
        .map_err(|err| ErrorInfo::new("invalid_encoding", format!("not UTF-8: {}", err)))?;
    let record: FeedRecord = serde_json::from_str(text.trim()).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("feed record was not valid JSON: {}", err),
        )
    })?;
    record.validate()?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_feed_record() {
        let line = br#"{"session_id":"286e962f-c045-4274-8f37-c4e41fb6104a","event_name":"UserPromptSubmit","timestamp":"2026-01-31T00:00:00Z"}"#;
        let record = parse_feed_record(line).expect("record");
        assert_eq!(record.kind(), Some(HookKind::Work));
        assert_eq!(
            record.recorded_at(),
            DateTime::parse_from_rfc3339("2026-01-31T00:00:00Z")
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        );
    }

    #[test]
    fn accepts_short_aliases_and_unix_timestamp() {
        let line = br#"{"sid":"abc","evt":"end","timestamp":1700000000}"#;
        let record = parse_feed_record(line).expect("record");
        assert_eq!(record.session_id, "abc");
        assert_eq!(record.kind(), Some(HookKind::End));
        assert_eq!(record.recorded_at().map(|t| t.timestamp()), Some(1_700_000_000));
    }

    #[test]
    fn missing_timestamp_is_allowed() {
        let record = parse_feed_record(br#"{"sid":"abc","evt":"Stop"}"#).expect("record");
        assert!(record.timestamp.is_none());
        assert_eq!(record.kind(), Some(HookKind::Rest));
    }

    #[test]
    fn rejects_unexpanded_session_id() {
        let err = parse_feed_record(br#"{"sid":"$SESSION_ID","evt":"start"}"#).unwrap_err();
        assert_eq!(err.code, "invalid_session_id");
    }

    #[test]
    fn rejects_missing_fields_and_bad_encoding() {
        assert_eq!(
            parse_feed_record(br#"{"session_id":"abc"}"#).unwrap_err().code,
            "invalid_json"
        );
        assert_eq!(
            parse_feed_record(&[0xff, 0xfe, b'{']).unwrap_err().code,
            "invalid_encoding"
        );
    }

    #[test]
    fn size_limit_is_caller_controlled() {
        let mut line = br#"{"sid":"abc","evt":"Stop"}"#.to_vec();
        line.extend(std::iter::repeat(b' ').take(MAX_FEED_RECORD_BYTES));

        assert_eq!(parse_feed_record(&line).unwrap_err().code, "record_too_large");
        let record = parse_feed_record_within(&line, 2 * MAX_FEED_RECORD_BYTES).expect("record");
        assert_eq!(record.kind(), Some(HookKind::Rest));
        assert_eq!(
            parse_feed_record_within(&line[..40], 16).unwrap_err().code,
            "record_too_large"
        );
    }

    #[test]
    fn unknown_event_names_have_no_kind() {
        assert_eq!(HookKind::from_event_name("PreToolUse"), None);
        assert_eq!(HookKind::from_event_name("killed"), None);
    }

    #[test]
    fn kill_params_reject_zero_pid() {
        let err = parse_kill_params(serde_json::json!({"pid": 0})).unwrap_err();
        assert_eq!(err.code, "invalid_pid");
        let ok = parse_kill_params(serde_json::json!({"pid": 42})).expect("params");
        assert_eq!(ok.pid, 42);
    }

    #[test]
    fn session_event_serializes_with_type_tag() {
        let event = SessionEvent::SessionTerminated {
            pid: 7,
            identity: "pid-7".to_string(),
        };
        let value = serde_json::to_value(&event).expect("json");
        assert_eq!(value["type"], "session_terminated");
        assert_eq!(value["pid"], 7);
    }
}
