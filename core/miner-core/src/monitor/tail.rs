//! Bounded tail reads.

use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tail {
    pub lines: Vec<String>,
    /// File length at the time of the read; a shrink means truncation.
    pub file_len: u64,
}

/// Reads at most the last `max_bytes` of `path` and keeps the last
/// `max_lines` complete lines. Invalid UTF-8 is replaced rather than rejected.
pub fn read_tail(path: &Path, max_lines: usize, max_bytes: u64) -> io::Result<Tail> {
    let mut file = fs_err::File::open(path)?;
    let file_len = file.metadata()?.len();
    let start = file_len.saturating_sub(max_bytes);
    file.seek(SeekFrom::Start(start))?;

    let mut buf = Vec::new();
    file.take(max_bytes).read_to_end(&mut buf)?;
    let text = String::from_utf8_lossy(&buf);

    let mut lines: Vec<&str> = text.lines().collect();
    if start > 0 && !lines.is_empty() {
        // Started mid-line.
        lines.remove(0);
    }
    let skip = lines.len().saturating_sub(max_lines);

    Ok(Tail {
        lines: lines[skip..].iter().map(|line| line.to_string()).collect(),
        file_len,
    })
}
