//! Session identity.
//!
//! A session is known either by the agent's canonical session UUID or, until
//! one is learned, by a placeholder derived from its pid. Only canonical
//! identities can ever be matched against hook events.

use std::fmt;

use uuid::Uuid;

const PLACEHOLDER_PREFIX: &str = "pid-";
const CANONICAL_LEN: usize = 36;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionIdentity {
    Canonical(String),
    Placeholder(u32),
}

impl SessionIdentity {
    /// Returns a canonical identity when `session_id` is a hyphenated UUID.
    pub fn canonical(session_id: &str) -> Option<Self> {
        is_canonical_session_id(session_id).then(|| Self::Canonical(session_id.to_string()))
    }

    pub fn placeholder(pid: u32) -> Self {
        Self::Placeholder(pid)
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Placeholder(_))
    }

    /// Registry key: the UUID itself, or `pid-<pid>`.
    pub fn key(&self) -> String {
        match self {
            Self::Canonical(id) => id.clone(),
            Self::Placeholder(pid) => format!("{PLACEHOLDER_PREFIX}{pid}"),
        }
    }

    /// True only for a canonical identity equal to a well-formed `session_id`.
    pub fn accepts_hook(&self, session_id: &str) -> bool {
        match self {
            Self::Canonical(id) => is_canonical_session_id(session_id) && id == session_id,
            Self::Placeholder(_) => false,
        }
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canonical(id) => f.write_str(id),
            Self::Placeholder(pid) => write!(f, "{PLACEHOLDER_PREFIX}{pid}"),
        }
    }
}

/// Hyphenated 36-character UUID that is neither a placeholder nor an
/// unexpanded shell variable.
pub fn is_canonical_session_id(value: &str) -> bool {
    value.len() == CANONICAL_LEN
        && !value.starts_with(PLACEHOLDER_PREFIX)
        && !value.starts_with('$')
        && Uuid::try_parse(value).is_ok()
}
