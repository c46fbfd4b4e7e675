//! Document- or key-based chunking (§4.4, `.yaml`/`.yml`).

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::RawChunk;

static SEP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^---\s*$").unwrap());
static KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]*\s*:").unwrap());

pub fn chunk_yaml(text: &str) -> Vec<RawChunk> {
    let lines: Vec<&str> = text.split('\n').collect();

    let sep_lines: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| SEP_RE.is_match(l))
        .map(|(i, _)| i)
        .collect();

    if sep_lines.len() >= 2 {
        let mut chunks = Vec::new();
        for (idx, &start) in sep_lines.iter().enumerate() {
            let end = if idx + 1 < sep_lines.len() {
                sep_lines[idx + 1] - 1
            } else {
                lines.len() - 1
            };
            let body_blank = if start + 1 > end {
                true
            } else {
                lines[start + 1..=end].iter().all(|l| l.trim().is_empty())
            };
            if body_blank {
                continue;
            }
            let chunk_text = lines[start..=end].join("\n");
            chunks.push(RawChunk {
                start_line: (start + 1) as u32,
                end_line: (end + 1) as u32,
                text: chunk_text,
            });
        }
        return chunks;
    }

    let key_lines: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| KEY_RE.is_match(l))
        .map(|(i, _)| i)
        .collect();

    if key_lines.len() <= 1 {
        return vec![RawChunk {
            start_line: 1,
            end_line: lines.len() as u32,
            text: text.to_string(),
        }];
    }

    let mut chunks = Vec::new();
    for (idx, &start) in key_lines.iter().enumerate() {
        let end = if idx + 1 < key_lines.len() {
            key_lines[idx + 1] - 1
        } else {
            lines.len() - 1
        };
        let chunk_text = lines[start..=end].join("\n");
        chunks.push(RawChunk {
            start_line: (start + 1) as u32,
            end_line: (end + 1) as u32,
            text: chunk_text,
        });
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_document_splits_per_document() {
        let text = "---\na: 1\n---\nb: 2\n";
        let chunks = chunk_yaml(text);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[1].start_line, 3);
    }

    #[test]
    fn single_key_yields_single_chunk() {
        let text = "a: 1\nb: 2\n";
        let chunks = chunk_yaml(text);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn multiple_keys_split_per_key_span() {
        let text = "a: 1\nb:\n  - x\n  - y\nc: 3\n";
        let chunks = chunk_yaml(text);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].start_line, 2);
        assert_eq!(chunks[1].end_line, 4);
    }
}
