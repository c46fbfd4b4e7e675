//! Top-level key/array-element chunking (§4.4, `.json`).

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::types::RawChunk;

static KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^\s*"([^"]+)"\s*:"#).unwrap());

pub fn chunk_json(text: &str) -> Vec<RawChunk> {
    let lines: Vec<&str> = text.split('\n').collect();
    let whole_file = || vec![RawChunk {
        start_line: 1,
        end_line: lines.len() as u32,
        text: text.to_string(),
    }];

    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return whole_file(),
    };

    match &value {
        Value::Object(map) => {
            let depth_at_start = depth_at_line_start(&lines);
            let mut starts: Vec<usize> = Vec::new();
            for (i, line) in lines.iter().enumerate() {
                if depth_at_start[i] != 1 {
                    continue;
                }
                if let Some(caps) = KEY_RE.captures(line) {
                    let key = &caps[1];
                    if map.contains_key(key) {
                        starts.push(i);
                    }
                }
            }
            if starts.is_empty() {
                return whole_file();
            }
            starts.dedup();
            build_key_chunks(&lines, &starts)
        }
        Value::Array(items) => {
            if items.len() <= 1 {
                return whole_file();
            }
            let elements = depth2_elements(&lines);
            if elements.is_empty() {
                return whole_file();
            }
            elements
                .into_iter()
                .map(|(start, end)| RawChunk {
                    start_line: (start + 1) as u32,
                    end_line: (end + 1) as u32,
                    text: lines[start..=end].join("\n"),
                })
                .collect()
        }
        _ => whole_file(),
    }
}

fn build_key_chunks(lines: &[&str], starts: &[usize]) -> Vec<RawChunk> {
    let mut chunks = Vec::with_capacity(starts.len());
    for (idx, &start) in starts.iter().enumerate() {
        let end = if idx + 1 < starts.len() {
            starts[idx + 1] - 1
        } else {
            lines.len() - 1
        };
        let chunk_lines: Vec<&str> = lines[start..=end].to_vec();
        let text = match chunk_lines.last().and_then(|last| strip_trailing_comma(last)) {
            Some(stripped) => {
                let mut owned: Vec<String> = chunk_lines[..chunk_lines.len() - 1].iter().map(|s| s.to_string()).collect();
                owned.push(stripped);
                owned.join("\n")
            }
            None => chunk_lines.join("\n"),
        };
        chunks.push(RawChunk {
            start_line: (start + 1) as u32,
            end_line: (end + 1) as u32,
            text,
        });
    }
    chunks
}

fn strip_trailing_comma(line: &str) -> Option<String> {
    let trimmed_end = line.trim_end();
    if let Some(stripped) = trimmed_end.strip_suffix(',') {
        let trailing_ws = &line[stripped.len() + 1..];
        Some(format!("{stripped}{trailing_ws}"))
    } else {
        None
    }
}

/// Depth of nesting (counting `{`/`[` as +1, `}`/`]` as -1) in effect at
/// the *start* of each line, ignoring bracket characters inside strings.
fn depth_at_line_start(lines: &[&str]) -> Vec<i32> {
    let mut result = Vec::with_capacity(lines.len());
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;
    for line in lines {
        result.push(depth);
        for c in line.chars() {
            if escape {
                escape = false;
                continue;
            }
            match c {
                '\\' if in_string => escape = true,
                '"' => in_string = !in_string,
                '{' | '[' if !in_string => depth += 1,
                '}' | ']' if !in_string => depth -= 1,
                _ => {}
            }
        }
    }
    result
}

/// Top-level (depth 1 → 2 → 1) element spans within an array, as
/// `(start_line_idx, end_line_idx)` pairs (0-based).
fn depth2_elements(lines: &[&str]) -> Vec<(usize, usize)> {
    let mut elements = Vec::new();
    let mut depth = 0i32;
    let mut stack: Vec<usize> = Vec::new();
    let mut in_string = false;
    let mut escape = false;

    for (line_idx, line) in lines.iter().enumerate() {
        for c in line.chars() {
            if escape {
                escape = false;
                continue;
            }
            match c {
                '\\' if in_string => escape = true,
                '"' => in_string = !in_string,
                '{' | '[' if !in_string => {
                    depth += 1;
                    stack.push(line_idx);
                }
                '}' | ']' if !in_string => {
                    let start = stack.pop();
                    if depth == 2 {
                        if let Some(s) = start {
                            elements.push((s, line_idx));
                        }
                    }
                    depth -= 1;
                }
                _ => {}
            }
        }
    }
    elements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_root_is_single_chunk() {
        let chunks = chunk_json("42");
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn invalid_json_falls_back_to_whole_file() {
        let chunks = chunk_json("{ not json");
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn object_splits_per_top_level_key() {
        let text = "{\n  \"a\": 1,\n  \"b\": {\n    \"c\": 2\n  }\n}";
        let chunks = chunk_json(text);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].text.contains("\"a\""));
        assert!(chunks[1].text.contains("\"b\""));
    }

    #[test]
    fn short_array_is_single_chunk() {
        let chunks = chunk_json("[1]");
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn array_of_objects_splits_per_element() {
        let text = "[\n  {\n    \"x\": 1\n  },\n  {\n    \"y\": 2\n  }\n]";
        let chunks = chunk_json(text);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].text.contains("\"x\""));
        assert!(chunks[1].text.contains("\"y\""));
    }
}
