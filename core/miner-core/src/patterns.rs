//! Compiled regex patterns for parsing agent debug logs.
//!
//! Update these when the agent's debug log format changes.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ConfigError;

// ═══════════════════════════════════════════════════════════════════════════════
// Process Identity
// ═══════════════════════════════════════════════════════════════════════════════

/// Temp files the agent writes carry its pid: `.../settings.json.tmp.48213.1730000000`.
pub static RE_TMP_PID: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.tmp\.(\d+)\.").unwrap());

// ═══════════════════════════════════════════════════════════════════════════════
// Activity Markers
// ═══════════════════════════════════════════════════════════════════════════════

/// Lines that only appear while the agent is streaming a response or compacting.
pub const DEFAULT_ACTIVITY_MARKERS: &[&str] = &[
    r"Stream started - received first chunk",
    r"(?i)compacting",
];

/// Finds the most recent pid mentioned in the given lines.
pub fn find_pid<'a, I>(lines: I) -> Option<u32>
where
    I: IntoIterator<Item = &'a str>,
    I::IntoIter: DoubleEndedIterator,
{
    lines.into_iter().rev().find_map(|line| {
        RE_TMP_PID
            .captures_iter(line)
            .filter_map(|caps| caps.get(1)?.as_str().parse::<u32>().ok())
            .filter(|pid| *pid != 0)
            .last()
    })
}

/// Compiled set of activity markers.
#[derive(Debug, Clone)]
pub struct ActivityMatcher {
    markers: Vec<Regex>,
}

impl ActivityMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, ConfigError> {
        let markers = patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern.as_ref()).map_err(|err| ConfigError::InvalidMarker {
                    pattern: pattern.as_ref().to_string(),
                    details: err.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { markers })
    }

    pub fn is_match(&self, line: &str) -> bool {
        self.markers.iter().any(|marker| marker.is_match(line))
    }

    pub fn any_match<'a, I>(&self, lines: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        lines.into_iter().any(|line| self.is_match(line))
    }
}

impl Default for ActivityMatcher {
    fn default() -> Self {
        let markers = DEFAULT_ACTIVITY_MARKERS
            .iter()
            .filter_map(|pattern| Regex::new(pattern).ok())
            .collect();
        Self { markers }
    }
}
