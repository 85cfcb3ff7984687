//! OS process control and inspection.
//!
//! The coordinator only talks to processes through [`ProcessControl`], so tests
//! can substitute a fake without sending real signals.

use crate::error::KillError;

pub trait ProcessControl: Send + 'static {
    /// Asks the process to terminate (SIGTERM).
    fn terminate(&self, pid: u32) -> Result<(), KillError>;

    fn is_alive(&self, pid: u32) -> bool;
}

/// Signals real processes via `kill(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalProcessControl;

impl ProcessControl for SignalProcessControl {
    fn terminate(&self, pid: u32) -> Result<(), KillError> {
        terminate_pid(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        is_pid_alive(pid)
    }
}

/// Rejects pids that `kill(2)` would interpret as a process group.
fn as_signal_target(pid: u32) -> Option<i32> {
    i32::try_from(pid).ok().filter(|pid| *pid > 0)
}

#[cfg(unix)]
pub fn terminate_pid(pid: u32) -> Result<(), KillError> {
    let Some(target) = as_signal_target(pid) else {
        return Err(KillError::NotFound);
    };

    // SAFETY: kill(2) has no memory-safety preconditions; target is a positive pid.
    #[allow(unsafe_code)]
    let result = unsafe { libc::kill(target, libc::SIGTERM) };
    if result == 0 {
        return Ok(());
    }

    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Err(KillError::NotFound),
        Some(libc::EPERM) => Err(KillError::PermissionDenied),
        _ => Err(KillError::Other(err.to_string())),
    }
}

#[cfg(not(unix))]
pub fn terminate_pid(_pid: u32) -> Result<(), KillError> {
    Err(KillError::Other("unsupported platform".to_string()))
}

#[cfg(unix)]
pub fn is_pid_alive(pid: u32) -> bool {
    let Some(target) = as_signal_target(pid) else {
        return false;
    };

    // SAFETY: signal 0 performs only the existence and permission check.
    #[allow(unsafe_code)]
    let result = unsafe { libc::kill(target, 0) };
    if result == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to someone else.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_pid_alive(_pid: u32) -> bool {
    false
}

// ═══════════════════════════════════════════════════════════════════════════════
// Terminal Attachment
// ═══════════════════════════════════════════════════════════════════════════════

/// Whether `pid` still has a controlling terminal. `None` when the process
/// could not be inspected (usually because it already exited).
#[cfg(target_os = "linux")]
pub fn has_controlling_terminal(pid: u32) -> Option<bool> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat_tty(&stat).map(|tty_nr| tty_nr != 0)
}

#[cfg(target_os = "macos")]
pub fn has_controlling_terminal(pid: u32) -> Option<bool> {
    let output = std::process::Command::new("ps")
        .args(["-o", "tty=", "-p", &pid.to_string()])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let tty = String::from_utf8_lossy(&output.stdout);
    Some(tty_name_is_attached(tty.trim()))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn has_controlling_terminal(_pid: u32) -> Option<bool> {
    Some(true)
}

/// Extracts `tty_nr` from `/proc/<pid>/stat`. The command name may contain
/// spaces and parentheses, so fields are counted from the last `)`.
pub fn parse_stat_tty(stat: &str) -> Option<i64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    // state ppid pgrp session tty_nr
    rest.split_whitespace().nth(4)?.parse().ok()
}

/// `ps` prints `?` or `??` for processes without a controlling terminal.
pub fn tty_name_is_attached(tty: &str) -> bool {
    !(tty.is_empty() || tty.chars().all(|c| c == '?'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_stat_tty_reads_fifth_field_after_comm() {
        let stat = "4242 (claude) S 1 4242 4242 34817 4242 4194304 0 0";
        assert_eq!(parse_stat_tty(stat), Some(34817));
    }

    #[test]
    fn parse_stat_tty_handles_parens_in_comm() {
        let stat = "77 (node (worker) x) R 1 77 77 0 -1 4194560";
        assert_eq!(parse_stat_tty(stat), Some(0));
    }

    #[test]
    fn parse_stat_tty_rejects_garbage() {
        assert_eq!(parse_stat_tty("no parens here"), None);
        assert_eq!(parse_stat_tty("1 (x) S 1"), None);
    }

    #[test]
    fn ps_question_marks_mean_detached() {
        assert!(!tty_name_is_attached("?"));
        assert!(!tty_name_is_attached("??"));
        assert!(!tty_name_is_attached(""));
        assert!(tty_name_is_attached("ttys004"));
        assert!(tty_name_is_attached("pts/3"));
    }

    #[test]
    fn group_pids_are_never_signalled() {
        assert_eq!(as_signal_target(0), None);
        assert_eq!(as_signal_target(u32::MAX), None);
        assert_eq!(as_signal_target(1234), Some(1234));
        assert_eq!(terminate_pid(0), Err(KillError::NotFound));
        assert!(!is_pid_alive(0));
    }

    #[test]
    fn current_process_is_alive() {
        assert!(is_pid_alive(std::process::id()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn own_terminal_state_is_readable() {
        assert!(has_controlling_terminal(std::process::id()).is_some());
    }
}
