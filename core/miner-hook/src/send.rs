//! `miner-hook send`: forwards one agent lifecycle hook to the feed socket.
//!
//! The agent pipes the hook payload to stdin as JSON. Only the session id and
//! event name are read; everything else in the payload is ignored.

use std::io::{self, Read};
use std::path::Path;

use miner_protocol::{FeedRecord, HookKind};
use serde::Deserialize;

use crate::client;

#[derive(Debug, Default, Deserialize)]
pub struct HookInput {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub hook_event_name: Option<String>,
}

/// Builds the feed record, with flags taking precedence over stdin.
/// None means there is nothing worth forwarding.
pub fn feed_record(
    input: &HookInput,
    session_id: Option<&str>,
    event_name: Option<&str>,
) -> Option<FeedRecord> {
    let session_id = session_id
        .or(input.session_id.as_deref())
        .map(str::trim)
        .filter(|id| !id.is_empty())?;
    let event_name = event_name
        .or(input.hook_event_name.as_deref())
        .map(str::trim)
        .filter(|name| !name.is_empty())?;

    HookKind::from_event_name(event_name)?;
    let record = FeedRecord::new(session_id, event_name);
    record.validate().ok()?;
    Some(record)
}

fn read_stdin() -> Result<HookInput, String> {
    let mut input = String::new();
    io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| format!("Failed to read stdin: {}", e))?;
    if input.trim().is_empty() {
        return Ok(HookInput::default());
    }
    serde_json::from_str(&input).map_err(|e| format!("Failed to parse hook input: {}", e))
}

pub fn run(socket: &Path, session_id: Option<&str>, event_name: Option<&str>) -> Result<(), String> {
    let input = if session_id.is_some() && event_name.is_some() {
        HookInput::default()
    } else {
        read_stdin()?
    };

    let Some(record) = feed_record(&input, session_id, event_name) else {
        tracing::debug!(
            event = ?input.hook_event_name,
            "Skipping hook (missing session id or untracked event)"
        );
        return Ok(());
    };

    client::send_feed_record(socket, &record).map_err(|err| err.to_string())?;
    tracing::debug!(
        session = %record.session_id,
        event = %record.event_name,
        "Feed record sent"
    );
    Ok(())
}
