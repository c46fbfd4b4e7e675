//! Memory-source enumeration (§4.5 "Memory source").

use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

use tracing::warn;

use crate::config::indexed_extension;
use crate::scanner::read_file_entry;
use crate::types::FileEntry;
use crate::types::Source;

const TOP_LEVEL_NAMES: [&str; 4] = ["MEMORY.md", "memory.md", "MEMORY.txt", "memory.txt"];

pub fn scan(workspace: &Path) -> Vec<FileEntry> {
    let mut seen_real_paths: HashSet<PathBuf> = HashSet::new();
    let mut out = Vec::new();

    for name in TOP_LEVEL_NAMES {
        let abs = workspace.join(name);
        if !is_regular_non_symlink(&abs) {
            continue;
        }
        if !dedup_insert(&mut seen_real_paths, &abs) {
            continue;
        }
        if let Some(entry) = read_file_entry(Source::Memory, &abs, name.to_string()) {
            out.push(entry);
        }
    }

    let memory_dir = workspace.join("memory");
    if memory_dir.is_dir() {
        walk_memory_dir(&memory_dir, workspace, &mut seen_real_paths, &mut out);
    }

    out
}

fn walk_memory_dir(dir: &Path, workspace: &Path, seen: &mut HashSet<PathBuf>, out: &mut Vec<FileEntry>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "cannot read memory directory");
            return;
        }
    };

    let mut children: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    children.sort();

    for path in children {
        let symlink_meta = match std::fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if symlink_meta.file_type().is_symlink() {
            warn!(path = %path.display(), "skipping symlink under memory/");
            continue;
        }
        if symlink_meta.is_dir() {
            walk_memory_dir(&path, workspace, seen, out);
            continue;
        }
        if !symlink_meta.is_file() {
            continue;
        }
        if !indexed_extension(&path) {
            continue;
        }
        if !dedup_insert(seen, &path) {
            continue;
        }
        let rel = relative_slash_path(workspace, &path);
        if let Some(entry) = read_file_entry(Source::Memory, &path, rel) {
            out.push(entry);
        }
    }
}

fn is_regular_non_symlink(path: &Path) -> bool {
    match std::fs::symlink_metadata(path) {
        Ok(meta) => meta.is_file() && !meta.file_type().is_symlink(),
        Err(_) => false,
    }
}

/// Dedup by resolved real path, preserving first-seen order (§4.5).
fn dedup_insert(seen: &mut HashSet<PathBuf>, path: &Path) -> bool {
    let real = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    seen.insert(real)
}

fn relative_slash_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn finds_top_level_and_nested_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("MEMORY.md"), "hello").unwrap();
        std::fs::create_dir_all(dir.path().join("memory/sub")).unwrap();
        std::fs::write(dir.path().join("memory/a.md"), "a").unwrap();
        std::fs::write(dir.path().join("memory/sub/b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("memory/ignored.png"), "x").unwrap();

        let entries = scan(dir.path());
        let paths: HashSet<String> = entries.iter().map(|e| e.path.clone()).collect();
        assert!(paths.contains("MEMORY.md"));
        assert!(paths.contains("memory/a.md"));
        assert!(paths.contains("memory/sub/b.txt"));
        assert!(!paths.contains("memory/ignored.png"));
    }
}
