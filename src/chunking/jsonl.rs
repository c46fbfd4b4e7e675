//! One chunk per non-empty line (§4.4, `.jsonl`).

use crate::types::RawChunk;

pub fn chunk_jsonl(text: &str) -> Vec<RawChunk> {
    let mut out = Vec::new();
    for (i, line) in text.split('\n').enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let n = (i + 1) as u32;
        out.push(RawChunk {
            start_line: n,
            end_line: n,
            text: line.to_string(),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_blank_lines() {
        let chunks = chunk_jsonl("{\"a\":1}\n\n{\"b\":2}\n");
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[1].start_line, 3);
    }
}
