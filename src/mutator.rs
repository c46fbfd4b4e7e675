//! The Mutator (spec §4.8): structured append/replace/remove of fact
//! entries in a human-readable ledger, with evidence linking and dedup.

use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

use crate::error::MemoryError;
use crate::error::Result;
use crate::search::SearchEngine;
use crate::sync::SyncEngine;
use crate::types::SearchOptions;
use crate::types::Source;

static ENTRY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^- (.+?)(?: \[ref:([^\]]+)\])?(?: _\(source: ([^)]+)\)_)?(?: — (.+))?$").unwrap()
});
static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9]+|[\u{4e00}-\u{9fff}\u{3400}-\u{4dbf}]+").unwrap());

#[derive(Debug, Clone)]
struct LedgerEntry {
    content: String,
    evidence_ref: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WriteOutcome {
    pub stored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fact: Option<String>,
    #[serde(rename = "evidencePath", skip_serializing_if = "Option::is_none")]
    pub evidence_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(rename = "similarEntry", skip_serializing_if = "Option::is_none")]
    pub similar_entry: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ForgetOutcome {
    pub removed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(rename = "removedContent", skip_serializing_if = "Option::is_none")]
    pub removed_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateOutcome {
    pub updated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<String>,
    #[serde(rename = "evidencePath", skip_serializing_if = "Option::is_none")]
    pub evidence_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub struct Mutator {
    workspace: PathBuf,
    search: Arc<SearchEngine>,
    sync: Arc<SyncEngine>,
}

impl Mutator {
    pub fn new(workspace: PathBuf, search: Arc<SearchEngine>, sync: Arc<SyncEngine>) -> Self {
        Self { workspace, search, sync }
    }

    pub async fn write(&self, content: &str, category: Option<&str>, source: Option<&str>, evidence: Option<&str>) -> Result<WriteOutcome> {
        let content = content.trim();
        let category = sanitize_category(category);
        let rel_path = format!("memory/{category}.md");
        let abs_path = self.workspace.join(&rel_path);

        let normalized_input = normalize(content);
        for line in read_lines(&abs_path) {
            if let Some(entry) = parse_entry_line(&line) {
                if normalize(&entry.content) == normalized_input {
                    return Ok(WriteOutcome {
                        stored: false,
                        reason: Some("duplicate".to_string()),
                        ..Default::default()
                    });
                }
            }
        }

        let hits = self
            .search
            .search(
                content,
                SearchOptions {
                    max_results: Some(3),
                    min_score: Some(0.3),
                    ..Default::default()
                },
            )
            .await?;
        for hit in &hits {
            if hit.source != Source::Memory || hit.score <= 0.6 {
                continue;
            }
            if word_overlap_ratio(content, &hit.snippet) >= 0.5 {
                return Ok(WriteOutcome {
                    stored: false,
                    reason: Some("semantic_duplicate".to_string()),
                    similar_entry: Some(hit.snippet.clone()),
                    path: Some(hit.path.clone()),
                    ..Default::default()
                });
            }
        }

        let fact_id = fact_id(content);
        let evidence_path = match evidence {
            Some(ev) => Some(self.write_evidence(&fact_id, content, ev)?),
            None => None,
        };

        let timestamp = now_timestamp();
        let line = format_entry_line(content, evidence_path.as_deref(), source, &timestamp);
        append_entry(&abs_path, &category, &line)?;
        self.sync.reset_memory_cooldown();

        Ok(WriteOutcome {
            stored: true,
            path: Some(rel_path),
            fact: Some(fact_id),
            evidence_path,
            reason: None,
            similar_entry: None,
        })
    }

    pub async fn forget(&self, content: &str, category: Option<&str>) -> Result<ForgetOutcome> {
        let Some((path, idx, entry)) = self.locate(content, category).await? else {
            return Ok(ForgetOutcome {
                removed: false,
                reason: Some("not_found".to_string()),
                ..Default::default()
            });
        };
        self.remove_line(&path, idx, &entry)
    }

    pub async fn update(
        &self,
        old_content: &str,
        new_content: &str,
        category: Option<&str>,
        source: Option<&str>,
        evidence: Option<&str>,
    ) -> Result<UpdateOutcome> {
        let Some((path, idx, old_entry)) = self.locate(old_content, category).await? else {
            return Ok(UpdateOutcome {
                updated: false,
                reason: Some("not_found".to_string()),
                ..Default::default()
            });
        };

        if let Some(evidence_ref) = &old_entry.evidence_ref {
            let _ = std::fs::remove_file(self.workspace.join(evidence_ref));
        }

        let new_content = new_content.trim();
        let fact_id = fact_id(new_content);
        let evidence_path = match evidence {
            Some(ev) => Some(self.write_evidence(&fact_id, new_content, ev)?),
            None => None,
        };

        let timestamp = now_timestamp();
        let line = format_entry_line(new_content, evidence_path.as_deref(), source, &timestamp);

        let mut lines = read_lines(&path);
        if idx >= lines.len() {
            return Ok(UpdateOutcome {
                updated: false,
                reason: Some("not_found".to_string()),
                ..Default::default()
            });
        }
        lines[idx] = line;
        write_lines(&path, &lines)?;
        self.sync.reset_memory_cooldown();

        Ok(UpdateOutcome {
            updated: true,
            path: Some(relative_path(&self.workspace, &path)),
            old: Some(old_entry.content),
            new: Some(new_content.to_string()),
            evidence_path,
            reason: None,
        })
    }

    /// Locate an entry by `(path, line_index, parsed entry)`: primary scan
    /// of category files by normalized-content containment, falling back
    /// to Search-based word-overlap within the matched chunk's line range
    /// (§4.8 "Forget").
    async fn locate(&self, query: &str, category: Option<&str>) -> Result<Option<(PathBuf, usize, LedgerEntry)>> {
        let normalized_query = normalize(query);
        for path in self.category_files(category)? {
            let lines = read_lines(&path);
            for (idx, line) in lines.iter().enumerate() {
                if let Some(entry) = parse_entry_line(line) {
                    let normalized_entry = normalize(&entry.content);
                    if normalized_entry == normalized_query
                        || normalized_entry.contains(&normalized_query)
                        || normalized_query.contains(&normalized_entry)
                    {
                        return Ok(Some((path, idx, entry)));
                    }
                }
            }
        }

        let hits = self
            .search
            .search(
                query,
                SearchOptions {
                    max_results: Some(5),
                    min_score: Some(0.3),
                    ..Default::default()
                },
            )
            .await?;
        for hit in hits {
            if hit.source != Source::Memory {
                continue;
            }
            let abs = self.workspace.join(&hit.path);
            let lines = read_lines(&abs);
            let start = (hit.start_line.saturating_sub(1)) as usize;
            let end = (hit.end_line as usize).min(lines.len());
            let mut best: Option<(usize, f64, LedgerEntry)> = None;
            for idx in start..end {
                if let Some(entry) = parse_entry_line(&lines[idx]) {
                    let overlap = word_overlap_ratio(query, &entry.content);
                    let better = best.as_ref().map(|(_, b, _)| overlap > *b).unwrap_or(true);
                    if better {
                        best = Some((idx, overlap, entry));
                    }
                }
            }
            if let Some((idx, _, entry)) = best {
                return Ok(Some((abs, idx, entry)));
            }
        }

        Ok(None)
    }

    fn remove_line(&self, path: &Path, idx: usize, entry: &LedgerEntry) -> Result<ForgetOutcome> {
        let mut lines = read_lines(path);
        if idx >= lines.len() {
            return Ok(ForgetOutcome {
                removed: false,
                reason: Some("not_found".to_string()),
                ..Default::default()
            });
        }
        if let Some(evidence_ref) = &entry.evidence_ref {
            let _ = std::fs::remove_file(self.workspace.join(evidence_ref));
        }
        let removed_content = entry.content.clone();
        lines.remove(idx);
        write_lines(path, &lines)?;
        self.sync.reset_memory_cooldown();

        Ok(ForgetOutcome {
            removed: true,
            path: Some(relative_path(&self.workspace, path)),
            removed_content: Some(removed_content),
            reason: None,
        })
    }

    fn write_evidence(&self, fact_id: &str, content: &str, evidence: &str) -> Result<String> {
        let rel = format!("memory/evidence/{fact_id}.md");
        let abs = self.workspace.join(&rel);
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent).map_err(|cause| MemoryError::Io {
                path: parent.to_path_buf(),
                cause,
            })?;
        }
        let body = format!("# Evidence for: {content}\n\n{evidence}\n");
        std::fs::write(&abs, body).map_err(|cause| MemoryError::Io { path: abs.clone(), cause })?;
        Ok(rel)
    }

    fn category_files(&self, category: Option<&str>) -> Result<Vec<PathBuf>> {
        if let Some(cat) = category {
            let sanitized = sanitize_category(Some(cat));
            return Ok(vec![self.workspace.join(format!("memory/{sanitized}.md"))]);
        }
        let dir = self.workspace.join("memory");
        let mut out = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("md") {
                    out.push(path);
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

fn parse_entry_line(line: &str) -> Option<LedgerEntry> {
    let caps = ENTRY_RE.captures(line)?;
    Some(LedgerEntry {
        content: caps.get(1)?.as_str().to_string(),
        evidence_ref: caps.get(2).map(|m| m.as_str().to_string()),
    })
}

fn format_entry_line(content: &str, evidence_ref: Option<&str>, source: Option<&str>, timestamp: &str) -> String {
    let mut line = format!("- {content}");
    if let Some(r) = evidence_ref {
        line.push_str(&format!(" [ref:{r}]"));
    }
    if let Some(s) = source {
        line.push_str(&format!(" _(source: {s})_"));
    }
    line.push_str(&format!(" — {timestamp}"));
    line
}

fn append_entry(path: &Path, category: &str, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|cause| MemoryError::Io {
            path: parent.to_path_buf(),
            cause,
        })?;
    }
    let mut content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => format!("# {}\n\n", capitalize(category)),
    };
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(line);
    content.push('\n');
    std::fs::write(path, content).map_err(|cause| MemoryError::Io { path: path.to_path_buf(), cause })
}

fn sanitize_category(raw: Option<&str>) -> String {
    let lowered = raw.unwrap_or("general").to_ascii_lowercase();
    let cleaned: String = lowered.chars().filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-').collect();
    if cleaned.is_empty() {
        "general".to_string()
    } else {
        cleaned
    }
}

fn normalize(s: &str) -> String {
    s.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

fn fact_id(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    hex::encode(digest)[0..12].to_string()
}

fn now_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        None => String::new(),
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
    }
}

fn content_words(text: &str) -> HashSet<String> {
    WORD_RE
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|w| w.chars().count() >= 2)
        .collect()
}

/// Fraction of `a`'s content words also present in `b` (§4.8 "content-word
/// overlap").
fn word_overlap_ratio(a: &str, b: &str) -> f64 {
    let words_a = content_words(a);
    if words_a.is_empty() {
        return 0.0;
    }
    let words_b = content_words(b);
    let overlap = words_a.intersection(&words_b).count();
    overlap as f64 / words_a.len() as f64
}

fn read_lines(path: &Path) -> Vec<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => content.lines().map(|l| l.to_string()).collect(),
        Err(_) => Vec::new(),
    }
}

fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    let mut content = lines.join("\n");
    content.push('\n');
    std::fs::write(path, content).map_err(|cause| MemoryError::Io { path: path.to_path_buf(), cause })
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_entry_line() {
        let line = "- user prefers dark mode [ref:memory/evidence/abc123456789.md] _(source: chat)_ — 2026-01-01 00:00:00 UTC";
        let entry = parse_entry_line(line).unwrap();
        assert_eq!(entry.content, "user prefers dark mode");
        assert_eq!(entry.evidence_ref.as_deref(), Some("memory/evidence/abc123456789.md"));
    }

    #[test]
    fn parses_bare_entry_line() {
        let entry = parse_entry_line("- hello").unwrap();
        assert_eq!(entry.content, "hello");
        assert!(entry.evidence_ref.is_none());
    }

    #[test]
    fn sanitize_category_strips_disallowed_chars() {
        assert_eq!(sanitize_category(Some("My Category!")), "mycategory");
        assert_eq!(sanitize_category(None), "general");
        assert_eq!(sanitize_category(Some("???")), "general");
    }

    #[test]
    fn word_overlap_is_fraction_of_input_words() {
        let ratio = word_overlap_ratio("user prefers dark mode", "the user likes dark themes");
        assert!(ratio > 0.4 && ratio < 0.6);
    }

    #[test]
    fn fact_id_is_twelve_hex_chars() {
        let id = fact_id("hello");
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
