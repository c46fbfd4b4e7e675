//! The Scanner (spec §4.5): enumerate memory files and session transcripts,
//! read contents, compute file fingerprints.

mod memory;
mod sessions;

use std::path::Path;
use std::path::PathBuf;

use tracing::debug;

use crate::types::FileEntry;
use crate::types::Source;

pub struct Scanner {
    home: PathBuf,
    workspace: PathBuf,
}

impl Scanner {
    pub fn new(workspace: PathBuf) -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self { home, workspace }
    }

    /// Enumerate admitted memory-source files under the workspace (§4.5
    /// "Memory source").
    pub fn scan_memory(&self) -> Vec<FileEntry> {
        memory::scan(&self.workspace)
    }

    /// Enumerate admitted session transcripts under the two well-known
    /// transcript roots (§4.5 "Session source").
    pub fn scan_sessions(&self, day_window: i64, max_count: i64) -> Vec<FileEntry> {
        if max_count == 0 {
            return Vec::new();
        }
        sessions::scan(&self.home, day_window, max_count)
    }
}

/// Read a UTF-8 file's content, mtime, and size into a [`FileEntry`],
/// computing its SHA-256 fingerprint (§4.5 "File entry"). Returns `None`
/// and logs a debug event on read failure so the caller can skip it
/// without aborting the whole sync (§7 "corrupt or missing record").
pub(crate) fn read_file_entry(source: Source, abs_path: &Path, rel_path: String) -> Option<FileEntry> {
    let content = match std::fs::read_to_string(abs_path) {
        Ok(c) => c,
        Err(e) => {
            debug!(path = %abs_path.display(), error = %e, "skipping unreadable file");
            return None;
        }
    };
    let metadata = match std::fs::metadata(abs_path) {
        Ok(m) => m,
        Err(e) => {
            debug!(path = %abs_path.display(), error = %e, "skipping file with unreadable metadata");
            return None;
        }
    };
    let mtime_ms = mtime_to_ms(&metadata);
    let hash = FileEntry::fingerprint(&content);
    Some(FileEntry {
        source,
        path: rel_path,
        size: content.len() as u64,
        content,
        mtime_ms,
        hash,
    })
}

pub(crate) fn mtime_to_ms(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
