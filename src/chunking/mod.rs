//! The Chunker (spec §4.4): split a file's bytes into line-bounded chunks
//! using a strategy chosen by extension.

mod json;
mod jsonl;
mod markdown;
mod yaml;

use crate::types::RawChunk;

/// Strategy selection by lowercased file extension (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Markdown,
    Json,
    Jsonl,
    Yaml,
}

impl Strategy {
    pub fn for_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "json" => Strategy::Json,
            "jsonl" => Strategy::Jsonl,
            "yaml" | "yml" => Strategy::Yaml,
            _ => Strategy::Markdown,
        }
    }
}

/// Default chunk size in tokens (§4.4 "tokens (default 512)").
pub const DEFAULT_CHUNK_TOKENS: u32 = 512;

/// Split `text` into chunks using `strategy`, then apply oversize
/// splitting to any non-markdown chunk whose text exceeds `chunk_size*4`
/// characters (§4.4 "Oversize splitting").
pub fn chunk(text: &str, strategy: Strategy, chunk_size_tokens: u32) -> Vec<RawChunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let raw = match strategy {
        Strategy::Markdown => markdown::chunk_markdown(text, chunk_size_tokens),
        Strategy::Json => json::chunk_json(text),
        Strategy::Jsonl => jsonl::chunk_jsonl(text),
        Strategy::Yaml => yaml::chunk_yaml(text),
    };

    let raw = if strategy == Strategy::Markdown {
        raw
    } else {
        oversize_split(raw, chunk_size_tokens)
    };

    raw.into_iter().filter(|c| !c.text.trim().is_empty()).collect()
}

/// Split any chunk whose text exceeds `chunk_size*4` characters into
/// consecutive line-wise slices of at most that many characters,
/// preserving line numbers (§4.4).
fn oversize_split(chunks: Vec<RawChunk>, chunk_size_tokens: u32) -> Vec<RawChunk> {
    let max_chars = (chunk_size_tokens as usize) * 4;
    let mut out = Vec::with_capacity(chunks.len());
    for c in chunks {
        if c.text.len() <= max_chars {
            out.push(c);
            continue;
        }
        let lines: Vec<&str> = c.text.split('\n').collect();
        let mut buf: Vec<&str> = Vec::new();
        let mut buf_len = 0usize;
        let mut line_no = c.start_line;
        let mut slice_start = c.start_line;
        for line in lines {
            let added = line.len() + 1;
            if !buf.is_empty() && buf_len + added > max_chars {
                out.push(RawChunk {
                    start_line: slice_start,
                    end_line: line_no - 1,
                    text: buf.join("\n"),
                });
                buf.clear();
                buf_len = 0;
                slice_start = line_no;
            }
            buf.push(line);
            buf_len += added;
            line_no += 1;
        }
        if !buf.is_empty() {
            out.push(RawChunk {
                start_line: slice_start,
                end_line: line_no - 1,
                text: buf.join("\n"),
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_no_chunks() {
        assert!(chunk("", Strategy::Markdown, 512).is_empty());
        assert!(chunk("   \n\n", Strategy::Markdown, 512).is_empty());
    }

    #[test]
    fn strategy_selection_by_extension() {
        assert_eq!(Strategy::for_extension("md"), Strategy::Markdown);
        assert_eq!(Strategy::for_extension("JSON"), Strategy::Json);
        assert_eq!(Strategy::for_extension("jsonl"), Strategy::Jsonl);
        assert_eq!(Strategy::for_extension("yml"), Strategy::Yaml);
        assert_eq!(Strategy::for_extension("anything"), Strategy::Markdown);
    }

    #[test]
    fn oversize_split_preserves_line_numbers() {
        let long_line = "a".repeat(50);
        let text = (0..10).map(|_| long_line.clone()).collect::<Vec<_>>().join("\n");
        let chunks = vec![RawChunk {
            start_line: 1,
            end_line: 10,
            text,
        }];
        let split = oversize_split(chunks, 32); // max_chars = 128
        assert!(split.len() > 1);
        assert_eq!(split[0].start_line, 1);
        let last = split.last().unwrap();
        assert_eq!(last.end_line, 10);
    }
}
