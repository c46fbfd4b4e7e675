//! The Sync Engine (spec §4.6): reconcile Scanner output with the Store,
//! and the background embedding-sync loop.

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use tracing::info;
use tracing::warn;

use crate::chunking;
use crate::chunking::Strategy;
use crate::embedder::Embedder;
use crate::error::Result;
use crate::scanner::Scanner;
use crate::segmenter;
use crate::store::Store;
use crate::types::chunk_id;
use crate::types::FileEntry;
use crate::types::Source;

const MEMORY_COOLDOWN: Duration = Duration::from_secs(5);
const SESSIONS_COOLDOWN: Duration = Duration::from_secs(60);

/// Outcome of one incremental sync pass over a single source (§4.6 step 1-3).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub indexed: u64,
    pub skipped: u64,
    pub deleted: u64,
}

pub struct SyncEngine {
    store: Store,
    scanner: Scanner,
    embedder: Arc<dyn Embedder>,
    chunk_size: u32,
    memory_last_sync: Mutex<Option<Instant>>,
    sessions_last_sync: Mutex<Option<Instant>>,
}

impl SyncEngine {
    pub fn new(store: Store, scanner: Scanner, embedder: Arc<dyn Embedder>, chunk_size: u32) -> Self {
        Self {
            store,
            scanner,
            embedder,
            chunk_size,
            memory_last_sync: Mutex::new(None),
            sessions_last_sync: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Reset the memory cooldown so the next call resyncs immediately
    /// (§4.6 "Debounce"; invoked by the Mutator after write/update/forget).
    pub fn reset_memory_cooldown(&self) {
        *self.memory_last_sync.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    /// Sync the memory source, gated by a 5 s cooldown unless `force`.
    /// Returns `None` when the cooldown suppressed the sync.
    pub async fn sync_memory(&self, force: bool) -> Result<Option<SyncReport>> {
        if !force && cooldown_active(&self.memory_last_sync, MEMORY_COOLDOWN) {
            return Ok(None);
        }
        let entries = self.scanner.scan_memory();
        let report = self.sync_source(Source::Memory, entries, force).await?;
        *self.memory_last_sync.lock().unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());
        Ok(Some(report))
    }

    /// Sync the sessions source, gated by a 60 s cooldown unless `force`.
    pub async fn sync_sessions(&self, force: bool, day_window: i64, max_count: i64) -> Result<Option<SyncReport>> {
        if !force && cooldown_active(&self.sessions_last_sync, SESSIONS_COOLDOWN) {
            return Ok(None);
        }
        let entries = self.scanner.scan_sessions(day_window, max_count);
        let report = self.sync_source(Source::Sessions, entries, force).await?;
        *self.sessions_last_sync.lock().unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());
        Ok(Some(report))
    }

    async fn sync_source(&self, source: Source, entries: Vec<FileEntry>, force: bool) -> Result<SyncReport> {
        let fts_available = self.store.fts_available();
        let mut active: std::collections::HashSet<String> = std::collections::HashSet::with_capacity(entries.len());
        let mut indexed = 0u64;
        let mut skipped = 0u64;

        for entry in entries {
            active.insert(entry.path.clone());

            let stored_hash = self.store.file_hash(source, &entry.path).await?;
            if !force && stored_hash.as_deref() == Some(entry.hash.as_str()) {
                skipped += 1;
                continue;
            }

            let strategy = strategy_for(source, &entry.path);
            let raw_chunks = chunking::chunk(&entry.content, strategy, self.chunk_size);
            let now = now_ms();
            let chunk_rows = raw_chunks
                .into_iter()
                .map(|raw| {
                    let hash = raw.hash();
                    let id = chunk_id(source, &entry.path, raw.start_line, raw.end_line, &hash);
                    let lexical = fts_available.then(|| segmenter::segment_for_index(&raw.text));
                    (id, raw.start_line, raw.end_line, hash, raw.text, lexical)
                })
                .collect();

            self.store
                .reindex_file(source, entry.path.clone(), entry.hash, entry.mtime_ms, entry.size, now, chunk_rows, fts_available)
                .await?;
            indexed += 1;
        }

        let stored_paths = self.store.active_paths(source).await?;
        let mut deleted = 0u64;
        for path in stored_paths {
            if !active.contains(&path) {
                self.store.delete_path(path).await?;
                deleted += 1;
            }
        }

        info!(source = %source, indexed, skipped, deleted, "sync complete");
        Ok(SyncReport { indexed, skipped, deleted })
    }

    /// Embedding sync (§4.6 "Embedding sync"): intended to be spawned as a
    /// background task by the RPC handler so it never blocks the hot path
    /// (§5 "Suspension points"). Errors are logged, never propagated.
    pub async fn sync_embeddings(&self) {
        if !self.store.vec_available() {
            return;
        }
        loop {
            let pending = match self.store.chunks_missing_vector(100).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "embedding sync: failed to list pending chunks");
                    return;
                }
            };
            if pending.is_empty() {
                break;
            }

            let mut remainder = Vec::with_capacity(pending.len());
            for chunk in pending {
                match self.store.embedding_cache_get(chunk.hash.clone()).await {
                    Ok(Some(cached)) => {
                        if let Err(e) = self.store.insert_vector_from_cache(chunk.id.clone(), cached).await {
                            warn!(error = %e, chunk = %chunk.id, "embedding sync: cache-hit insert failed");
                        }
                    }
                    Ok(None) => remainder.push(chunk),
                    Err(e) => {
                        warn!(error = %e, chunk = %chunk.id, "embedding sync: cache lookup failed");
                    }
                }
            }

            if remainder.is_empty() {
                continue;
            }

            let texts: Vec<String> = remainder.iter().map(|c| c.text.clone()).collect();
            match self.embedder.embed_batch(&texts).await {
                Ok(embeddings) if embeddings.len() == remainder.len() => {
                    let now = now_ms();
                    for (chunk, embedding) in remainder.into_iter().zip(embeddings) {
                        if let Err(e) = self.store.insert_vector(chunk.id.clone(), chunk.hash.clone(), embedding, now).await {
                            warn!(error = %e, chunk = %chunk.id, "embedding sync: vector insert failed");
                        }
                    }
                }
                Ok(_) | Err(_) => {
                    warn!(deficit = remainder.len(), "embedding sync: batch embed failed, stopping this cycle");
                    return;
                }
            }
        }

        if let Err(e) = self.store.gc_embedding_cache().await {
            warn!(error = %e, "embedding sync: cache GC failed");
        }
    }
}

fn cooldown_active(last: &Mutex<Option<Instant>>, cooldown: Duration) -> bool {
    match *last.lock().unwrap_or_else(|p| p.into_inner()) {
        Some(t) => t.elapsed() < cooldown,
        None => false,
    }
}

/// Sessions are always chunked with the markdown strategy, regardless of
/// their synthetic `.jsonl` extension (§4.6 step 2).
fn strategy_for(source: Source, path: &str) -> Strategy {
    if source == Source::Sessions {
        return Strategy::Markdown;
    }
    let ext = Path::new(path).extension().and_then(|e| e.to_str()).unwrap_or("");
    Strategy::for_extension(ext)
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::UnavailableEmbedder;
    use tempfile::TempDir;

    async fn engine(dir: &TempDir) -> SyncEngine {
        let store = Store::open(&dir.path().join("memory.db"), 512).await.unwrap();
        let scanner = Scanner::new(dir.path().to_path_buf());
        SyncEngine::new(store, scanner, Arc::new(UnavailableEmbedder), 512)
    }

    #[tokio::test]
    async fn first_sync_indexes_then_second_sync_skips() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("MEMORY.md"), "hello").unwrap();
        let engine = engine(&dir).await;

        let report = engine.sync_memory(true).await.unwrap().unwrap();
        assert_eq!(report.indexed, 1);
        assert_eq!(report.deleted, 0);

        let report2 = engine.sync_memory(true).await.unwrap().unwrap();
        assert_eq!(report2, SyncReport { indexed: 0, skipped: 1, deleted: 0 });
    }

    #[tokio::test]
    async fn cooldown_suppresses_unforced_resync() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("MEMORY.md"), "hello").unwrap();
        let engine = engine(&dir).await;

        assert!(engine.sync_memory(false).await.unwrap().is_some());
        assert!(engine.sync_memory(false).await.unwrap().is_none());

        engine.reset_memory_cooldown();
        assert!(engine.sync_memory(false).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn deletion_propagates_to_store() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("MEMORY.md"), "hello").unwrap();
        let engine = engine(&dir).await;
        engine.sync_memory(true).await.unwrap();

        std::fs::remove_file(dir.path().join("MEMORY.md")).unwrap();
        let report = engine.sync_memory(true).await.unwrap().unwrap();
        assert_eq!(report.deleted, 1);

        let active = engine.store().active_paths(Source::Memory).await.unwrap();
        assert!(active.is_empty());
    }
}
