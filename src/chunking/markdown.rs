//! Sliding-window chunking with heading breaks (§4.4, markdown/text/default).

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::RawChunk;

static HEADING_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#{1,6}\s").unwrap());

pub fn chunk_markdown(text: &str, tokens: u32) -> Vec<RawChunk> {
    let overlap = tokens / 8;
    let max_chars = std::cmp::max(32, tokens as usize * 4);
    let overlap_chars = overlap as usize * 4;

    let lines: Vec<&str> = text.split('\n').collect();
    let mut chunks = Vec::new();
    let mut buf: Vec<usize> = Vec::new();
    let mut buf_chars = 0usize;

    for (i, &line) in lines.iter().enumerate() {
        let cost = line.len() + 1;
        let is_heading = HEADING_RE.is_match(line);

        if is_heading && !buf.is_empty() {
            push_chunk(&mut chunks, &lines, &buf);
            buf.clear();
            buf_chars = 0;
            buf.push(i);
            buf_chars = cost;
            continue;
        }

        if !buf.is_empty() && buf_chars + cost > max_chars {
            push_chunk(&mut chunks, &lines, &buf);
            let seed = overlap_seed(&buf, &lines, overlap_chars);
            buf_chars = seed.iter().map(|&j| lines[j].len() + 1).sum();
            buf = seed;
            buf.push(i);
            buf_chars += cost;
            continue;
        }

        buf.push(i);
        buf_chars += cost;
    }

    push_chunk(&mut chunks, &lines, &buf);
    chunks
}

fn overlap_seed(buf: &[usize], lines: &[&str], overlap_chars: usize) -> Vec<usize> {
    if overlap_chars == 0 {
        return Vec::new();
    }
    let mut acc = 0usize;
    let mut seed_rev = Vec::new();
    for &idx in buf.iter().rev() {
        seed_rev.push(idx);
        acc += lines[idx].len() + 1;
        if acc >= overlap_chars {
            break;
        }
    }
    seed_rev.reverse();
    seed_rev
}

fn push_chunk(chunks: &mut Vec<RawChunk>, lines: &[&str], buf: &[usize]) {
    if buf.is_empty() {
        return;
    }
    let start_line = (buf[0] + 1) as u32;
    let end_line = (*buf.last().unwrap() + 1) as u32;
    let text = buf.iter().map(|&i| lines[i]).collect::<Vec<_>>().join("\n");
    chunks.push(RawChunk {
        start_line,
        end_line,
        text,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heading_breaks_split_chunks() {
        let text = "# Title\nLine two\n## Sub\nLine four";
        let chunks = chunk_markdown(text, 512);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 2);
        assert_eq!(chunks[0].text, "# Title\nLine two");
        assert_eq!(chunks[1].start_line, 3);
        assert_eq!(chunks[1].end_line, 4);
        assert_eq!(chunks[1].text, "## Sub\nLine four");
    }

    #[test]
    fn long_text_without_headings_splits_on_overflow_with_overlap() {
        let line = "word ".repeat(20); // ~100 chars per line
        let text = (0..50).map(|_| line.clone()).collect::<Vec<_>>().join("\n");
        let chunks = chunk_markdown(&text, 32); // max_chars = 128
        assert!(chunks.len() > 1);
        // Consecutive chunks should overlap: the second chunk's start line
        // should be <= the first chunk's end line (seeded overlap).
        assert!(chunks[1].start_line <= chunks[0].end_line);
    }

    #[test]
    fn single_short_file_is_one_chunk() {
        let chunks = chunk_markdown("hello\nworld", 512);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 2);
    }
}
