//! Session-source enumeration and transcript extraction (§4.5 "Session
//! source" and "Transcript extraction").

use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde_json::Value;

use crate::scanner::mtime_to_ms;
use crate::types::FileEntry;
use crate::types::Source;

struct Candidate {
    abs: PathBuf,
    id: String,
    mtime_ms: i64,
    size: u64,
}

const MS_PER_DAY: i64 = 86_400_000;

pub fn scan(home: &Path, day_window: i64, max_count: i64) -> Vec<FileEntry> {
    let mut candidates = Vec::new();
    collect_copilot(&home.join(".copilot").join("history"), &mut candidates);
    collect_claude(&home.join(".claude").join("projects"), &mut candidates);

    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    let window_ms = if day_window > 0 { Some(day_window * MS_PER_DAY) } else { None };

    candidates.retain(|c| c.size > 0 && window_ms.is_none_or(|w| now_ms - c.mtime_ms <= w));
    candidates.sort_by(|a, b| b.mtime_ms.cmp(&a.mtime_ms));

    if max_count >= 0 {
        candidates.truncate(max_count as usize);
    }

    candidates.iter().filter_map(build_entry).collect()
}

fn collect_copilot(root: &Path, out: &mut Vec<Candidate>) {
    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let events = dir.join("events.jsonl");
        if let Ok(meta) = std::fs::metadata(&events) {
            if meta.is_file() {
                out.push(Candidate {
                    mtime_ms: mtime_to_ms(&meta),
                    size: meta.len(),
                    id: dir.file_name().unwrap_or_default().to_string_lossy().to_string(),
                    abs: events,
                });
            }
        }
    }
}

fn collect_claude(root: &Path, out: &mut Vec<Candidate>) {
    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let project_dir = entry.path();
        if !project_dir.is_dir() {
            continue;
        }
        let Ok(files) = std::fs::read_dir(&project_dir) else {
            continue;
        };
        for file in files.flatten() {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            if let Ok(meta) = std::fs::metadata(&path) {
                if meta.is_file() {
                    out.push(Candidate {
                        mtime_ms: mtime_to_ms(&meta),
                        size: meta.len(),
                        id: path.file_stem().unwrap_or_default().to_string_lossy().to_string(),
                        abs: path,
                    });
                }
            }
        }
    }
}

fn build_entry(c: &Candidate) -> Option<FileEntry> {
    let raw = std::fs::read_to_string(&c.abs).ok()?;
    let extracted = extract_transcript(&raw)?;
    let hash = FileEntry::fingerprint(&extracted);
    Some(FileEntry {
        source: Source::Sessions,
        path: format!("sessions/{}.jsonl", c.id),
        size: extracted.len() as u64,
        content: extracted,
        mtime_ms: c.mtime_ms,
        hash,
    })
}

/// Extract concatenated `User:`/`Assistant:` lines from a transcript's
/// JSONL body. Returns `None` if no messages were extracted.
fn extract_transcript(raw: &str) -> Option<String> {
    let mut emitted = Vec::new();
    for line in raw.split('\n') {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if let Some(text) = extract_record(&value) {
            emitted.push(text);
        }
    }
    if emitted.is_empty() {
        None
    } else {
        Some(emitted.join("\n"))
    }
}

fn extract_record(v: &Value) -> Option<String> {
    let record_type = v.get("type")?.as_str()?;
    match record_type {
        "user.message" => {
            let content = v.get("data")?.get("content")?.as_str()?;
            (!content.is_empty() && !content.starts_with('/')).then(|| format!("User: {content}"))
        }
        "assistant.message" => {
            let content = v.get("data")?.get("content")?.as_str()?;
            (!content.is_empty()).then(|| format!("Assistant: {content}"))
        }
        "user" => {
            let text = extract_message_content(v)?;
            is_admissible_user_text(&text).then(|| format!("User: {text}"))
        }
        "assistant" => {
            let text = extract_message_content(v)?;
            (!text.is_empty()).then(|| format!("Assistant: {text}"))
        }
        _ => None,
    }
}

fn is_admissible_user_text(text: &str) -> bool {
    !text.is_empty() && !text.starts_with('/') && !text.starts_with("<command-") && !text.starts_with("<local-command-")
}

fn extract_message_content(v: &Value) -> Option<String> {
    let content = v.get("message")?.get("content")?;
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let mut buf = String::new();
            for block in blocks {
                if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                        buf.push_str(text);
                    }
                }
            }
            Some(buf)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_type_emits_prefixed_line() {
        let raw = r#"{"type":"user.message","data":{"content":"hi there"}}"#;
        assert_eq!(extract_transcript(raw), Some("User: hi there".to_string()));
    }

    #[test]
    fn slash_command_is_filtered() {
        let raw = r#"{"type":"user.message","data":{"content":"/help"}}"#;
        assert_eq!(extract_transcript(raw), None);
    }

    #[test]
    fn user_record_with_array_content_concatenates_text_blocks() {
        let raw = r#"{"type":"user","message":{"content":[{"type":"text","text":"hello "},{"type":"image"},{"type":"text","text":"world"}]}}"#;
        assert_eq!(extract_transcript(raw), Some("User: hello world".to_string()));
    }

    #[test]
    fn malformed_lines_are_ignored() {
        let raw = "not json\n{\"type\":\"assistant.message\",\"data\":{\"content\":\"ok\"}}\n";
        assert_eq!(extract_transcript(raw), Some("Assistant: ok".to_string()));
    }

    #[test]
    fn no_messages_returns_none() {
        let raw = r#"{"type":"system","data":{}}"#;
        assert_eq!(extract_transcript(raw), None);
    }
}
