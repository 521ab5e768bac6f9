//! The daemon's own log file, as served to `logs` requests.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use focusknob_common::paths::LOG_FILE;

pub fn log_file_in(dir: &Path) -> PathBuf {
    dir.join(LOG_FILE)
}

/// Open (creating as needed) the log file for appending.
pub fn open_log_file(dir: &Path) -> io::Result<File> {
    std::fs::create_dir_all(dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file_in(dir))
}

/// Last `lines` lines of `path`, newline-terminated. Missing file reads as
/// empty.
pub fn tail(path: &Path, lines: usize) -> String {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return String::new(),
        Err(e) => return format!("Error reading logs: {e}"),
    };
    let text = String::from_utf8_lossy(&raw);
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].iter().fold(String::new(), |mut out, line| {
        out.push_str(line);
        out.push('\n');
        out
    })
}
