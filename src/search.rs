//! The Search Engine (spec §4.7): hybrid lexical/vector retrieval with
//! time filters, normalization, fusion, access-count boost, and a
//! substring fallback.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use crate::embedder::Embedder;
use crate::error::Result;
use crate::store::Store;
use crate::types::Chunk;
use crate::types::SearchOptions;
use crate::types::SearchResult;

pub struct SearchEngine {
    store: Store,
    embedder: Arc<dyn Embedder>,
    default_token_max: u32,
}

impl SearchEngine {
    pub fn new(store: Store, embedder: Arc<dyn Embedder>, default_token_max: u32) -> Self {
        Self {
            store,
            embedder,
            default_token_max,
        }
    }

    pub async fn search(&self, query: &str, options: SearchOptions) -> Result<Vec<SearchResult>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let token_max = options.token_max.unwrap_or(self.default_token_max).max(1);
        let max_results = options.max_results.unwrap_or_else(|| (token_max / 230).clamp(1, 20));
        let min_score = options.min_score.unwrap_or(0.01);

        let snippet_tokens = ((token_max as i64 - 30 * max_results as i64) / max_results as i64).max(50);
        let snippet_max_chars = (snippet_tokens * 3).min(700) as usize;

        let allowed_paths = self.allowed_paths(&options).await?;
        let oversample = max_results * 3;

        let fts_hits = if self.store.fts_available() {
            self.lexical_search(query, oversample, min_score, allowed_paths.as_ref()).await?
        } else {
            Vec::new()
        };

        let vec_hits = if self.store.vec_available() && self.embedder.available().await {
            self.vector_search(query, oversample, min_score, allowed_paths.as_ref()).await?
        } else {
            Vec::new()
        };

        let mut results: Vec<(Chunk, f32)> = match (fts_hits.is_empty(), vec_hits.is_empty()) {
            (false, false) => fuse(fts_hits, vec_hits),
            (false, true) => fts_hits,
            (true, false) => vec_hits,
            (true, true) => self.substring_fallback(query, oversample, allowed_paths.as_ref()).await?,
        };

        results.retain(|(_, score)| *score >= min_score);
        sort_by_score_desc(&mut results);
        results.truncate(max_results as usize);

        let ids: Vec<String> = results.iter().map(|(c, _)| c.id.clone()).collect();
        if !ids.is_empty() {
            self.store.bump_access_counts(ids).await?;
        }

        let mut boosted = Vec::with_capacity(results.len());
        for (chunk, score) in results {
            let count = self.store.access_count(chunk.id.clone()).await?;
            let score = if count > 0 {
                0.85 * score + 0.15 * (1.0_f32).min((1.0 + count as f32).log2() / 10.0)
            } else {
                score
            };
            boosted.push((chunk, score));
        }
        sort_by_score_desc(&mut boosted);

        Ok(boosted.into_iter().map(|(chunk, score)| to_result(chunk, score, snippet_max_chars)).collect())
    }

    async fn allowed_paths(&self, options: &SearchOptions) -> Result<Option<HashSet<String>>> {
        if options.after.is_none() && options.before.is_none() {
            return Ok(None);
        }
        let after_ms = options.after.as_deref().and_then(parse_iso8601_ms);
        let before_ms = options.before.as_deref().and_then(parse_iso8601_ms);
        let set = self.store.paths_in_mtime_range(after_ms, before_ms).await?;
        Ok(Some(set))
    }

    async fn lexical_search(
        &self,
        query: &str,
        limit: u32,
        min_score: f32,
        allowed: Option<&HashSet<String>>,
    ) -> Result<Vec<(Chunk, f32)>> {
        let tokens = crate::segmenter::segment_for_query(query);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        let match_expr = tokens
            .iter()
            .map(|t| format!("\"{}\"", t.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" OR ");

        let rows = self.store.fts_search(match_expr, limit).await?;
        let mut out = Vec::with_capacity(rows.len());
        for (chunk, rank) in rows {
            if let Some(allowed) = allowed {
                if !allowed.contains(&chunk.path) {
                    continue;
                }
            }
            let score = fts_rank_to_score(rank);
            if score < min_score {
                continue;
            }
            out.push((chunk, score));
        }
        Ok(out)
    }

    async fn vector_search(
        &self,
        query: &str,
        limit: u32,
        min_score: f32,
        allowed: Option<&HashSet<String>>,
    ) -> Result<Vec<(Chunk, f32)>> {
        let embedding = match self.embedder.embed(query).await {
            Ok(e) => e,
            Err(_) => return Ok(Vec::new()),
        };
        let rows = self.store.vector_search(embedding, limit).await?;
        let mut out = Vec::with_capacity(rows.len());
        for (chunk, distance) in rows {
            if let Some(allowed) = allowed {
                if !allowed.contains(&chunk.path) {
                    continue;
                }
            }
            let score = 1.0 - distance;
            if score < min_score {
                continue;
            }
            out.push((chunk, score));
        }
        Ok(out)
    }

    async fn substring_fallback(&self, query: &str, limit: u32, allowed: Option<&HashSet<String>>) -> Result<Vec<(Chunk, f32)>> {
        let pattern = format!("%{}%", escape_like(query));
        let rows = self.store.substring_search(pattern, limit).await?;
        let mut out = Vec::with_capacity(rows.len());
        for (i, chunk) in rows.into_iter().enumerate() {
            if let Some(allowed) = allowed {
                if !allowed.contains(&chunk.path) {
                    continue;
                }
            }
            out.push((chunk, 1.0 / (1.0 + i as f32)));
        }
        Ok(out)
    }
}

fn sort_by_score_desc(hits: &mut [(Chunk, f32)]) {
    hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
}

/// BM25 rank (negative, lower is better) to a `[0, 1]` score (§4.7).
fn fts_rank_to_score(rank: f64) -> f32 {
    if !rank.is_finite() || rank == 0.0 {
        return 0.0;
    }
    (1.0 + rank.abs().log10() / 10.0).clamp(0.0, 1.0) as f32
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn parse_iso8601_ms(s: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.timestamp_millis())
}

/// Min-max normalize each list independently, then fuse keyed by
/// `(path, startLine)` as `0.5*fts + 0.5*vec` (§4.7 "Fusion").
fn fuse(fts: Vec<(Chunk, f32)>, vec_hits: Vec<(Chunk, f32)>) -> Vec<(Chunk, f32)> {
    let fts_norm = min_max_normalize(fts);
    let vec_norm = min_max_normalize(vec_hits);

    let mut entries: HashMap<(String, u32), (Chunk, f32, f32)> = HashMap::new();
    for (chunk, score) in fts_norm {
        let key = (chunk.path.clone(), chunk.start_line);
        entries.entry(key).or_insert_with(|| (chunk.clone(), 0.0, 0.0)).1 = score;
    }
    for (chunk, score) in vec_norm {
        let key = (chunk.path.clone(), chunk.start_line);
        entries.entry(key).or_insert_with(|| (chunk.clone(), 0.0, 0.0)).2 = score;
    }

    entries.into_values().map(|(chunk, fts_score, vec_score)| (chunk, 0.5 * fts_score + 0.5 * vec_score)).collect()
}

fn min_max_normalize(hits: Vec<(Chunk, f32)>) -> Vec<(Chunk, f32)> {
    if hits.len() <= 1 {
        return hits.into_iter().map(|(c, _)| (c, 1.0)).collect();
    }
    let min = hits.iter().map(|(_, s)| *s).fold(f32::INFINITY, f32::min);
    let max = hits.iter().map(|(_, s)| *s).fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    if range.abs() < f32::EPSILON {
        return hits.into_iter().map(|(c, _)| (c, 1.0)).collect();
    }
    hits.into_iter().map(|(c, s)| (c, (s - min) / range)).collect()
}

fn to_result(chunk: Chunk, score: f32, snippet_max_chars: usize) -> SearchResult {
    let snippet: String = chunk.text.chars().take(snippet_max_chars).collect();
    SearchResult {
        path: chunk.path,
        start_line: chunk.start_line,
        end_line: chunk.end_line,
        score,
        snippet,
        source: chunk.source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::UnavailableEmbedder;
    use crate::types::Source;
    use tempfile::TempDir;

    fn chunk(path: &str, start: u32) -> Chunk {
        Chunk {
            id: format!("{path}:{start}"),
            path: path.to_string(),
            source: Source::Memory,
            start_line: start,
            end_line: start,
            hash: "h".to_string(),
            text: "hello world".to_string(),
            updated_at: 0,
            access_count: 0,
        }
    }

    #[test]
    fn fts_rank_to_score_clamps() {
        assert_eq!(fts_rank_to_score(0.0), 0.0);
        assert!(fts_rank_to_score(-1.0) > 0.0);
        assert!(fts_rank_to_score(f64::NAN) == 0.0);
    }

    #[test]
    fn min_max_normalize_single_item_is_one() {
        let out = min_max_normalize(vec![(chunk("a.md", 1), 0.3)]);
        assert_eq!(out[0].1, 1.0);
    }

    #[test]
    fn fuse_combines_by_path_and_start_line() {
        let fts = vec![(chunk("x.md", 1), 0.8), (chunk("y.md", 1), 0.2)];
        let vecs = vec![(chunk("y.md", 1), 0.9), (chunk("z.md", 1), 0.3)];
        let fused = fuse(fts, vecs);
        let by_path: HashMap<String, f32> = fused.into_iter().map(|(c, s)| (c.path, s)).collect();
        assert_eq!(by_path["x.md"], 0.5);
        assert_eq!(by_path["y.md"], 0.5);
        assert_eq!(by_path["z.md"], 0.0);
    }

    #[tokio::test]
    async fn empty_query_returns_no_results() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("memory.db"), 512).await.unwrap();
        let engine = SearchEngine::new(store, Arc::new(UnavailableEmbedder), 4096);
        let results = engine.search("   ", SearchOptions::default()).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn substring_fallback_when_fts_and_vec_both_empty() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("memory.db"), 512).await.unwrap();
        let chunks = vec![(
            "id1".to_string(),
            1,
            1,
            "hash1".to_string(),
            "say hello".to_string(),
            None,
        )];
        store
            .reindex_file(Source::Memory, "a.md".into(), "filehash".into(), 0, 9, 0, chunks, false)
            .await
            .unwrap();

        let engine = SearchEngine::new(store, Arc::new(UnavailableEmbedder), 4096);
        let results = engine.search("hello", SearchOptions::default()).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].score, 1.0);
    }
}
