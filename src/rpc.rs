//! The typed operation surface (spec §6 "RPC surface"): transport-agnostic
//! request/response types and the `MemoryService` that backs them. The
//! line-oriented stdio framing that wraps these is out of scope (§1) and
//! lives in `bin/memory_server.rs`.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Serialize;

use crate::config::indexed_extension;
use crate::config::MemoryConfig;
use crate::embedder::default_embedder;
use crate::embedder::Embedder;
use crate::error::MemoryError;
use crate::error::Result;
use crate::mutator::ForgetOutcome;
use crate::mutator::Mutator;
use crate::mutator::UpdateOutcome;
use crate::mutator::WriteOutcome;
use crate::scanner::Scanner;
use crate::search::SearchEngine;
use crate::store::Store;
use crate::sync::SyncEngine;
use crate::types::SearchOptions;
use crate::types::SearchResult;

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetResponse {
    pub path: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    #[serde(rename = "chunkSize")]
    pub chunk_size: u32,
    #[serde(rename = "tokenMax")]
    pub token_max: u32,
    #[serde(rename = "sessionDays")]
    pub session_days: i64,
    #[serde(rename = "sessionMax")]
    pub session_max: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    #[serde(rename = "workspaceDir")]
    pub workspace_dir: String,
    #[serde(rename = "dbPath")]
    pub db_path: String,
    pub files: u64,
    #[serde(rename = "memoryFiles")]
    pub memory_files: u64,
    #[serde(rename = "sessionFiles")]
    pub session_files: u64,
    pub chunks: u64,
    #[serde(rename = "embeddedChunks")]
    pub embedded_chunks: u64,
    #[serde(rename = "embeddingCache")]
    pub embedding_cache: u64,
    pub config: ConfigSummary,
    #[serde(rename = "lastSyncAt", skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
}

/// Backs the six RPC operations described in spec §6. Owns the Sync,
/// Search, and Mutator components; the transport shell constructs one of
/// these at startup and dispatches each framed request to it.
pub struct MemoryService {
    config: MemoryConfig,
    sync: Arc<SyncEngine>,
    search: Arc<SearchEngine>,
    mutator: Mutator,
    last_sync_at: Mutex<Option<i64>>,
}

impl MemoryService {
    pub async fn init(config: MemoryConfig) -> Result<Self> {
        let store = Store::open(&config.db_path, config.chunk_size).await?;
        let scanner = Scanner::new(config.workspace_dir.clone());
        let embedder: Arc<dyn Embedder> = Arc::from(default_embedder());

        let sync = Arc::new(SyncEngine::new(store.clone(), scanner, embedder.clone(), config.chunk_size));
        let search = Arc::new(SearchEngine::new(store, embedder, config.token_max));
        let mutator = Mutator::new(config.workspace_dir.clone(), search.clone(), sync.clone());

        Ok(Self {
            config,
            sync,
            search,
            mutator,
            last_sync_at: Mutex::new(None),
        })
    }

    /// Debounced pre-call sync (§2 flow: "Host → tool call → Sync
    /// (debounced) → Search/Mutator → Store"). The embedding pass is
    /// spawned as a detached background task (§5 "Suspension points").
    async fn ensure_synced(&self) -> Result<()> {
        let memory_result = self.sync.sync_memory(false).await?;
        let sessions_result = self
            .sync
            .sync_sessions(false, self.config.session_days, self.config.session_max)
            .await?;

        if memory_result.is_some() || sessions_result.is_some() {
            *self.last_sync_at.lock().unwrap_or_else(|p| p.into_inner()) = Some(now_ms());
            let sync = self.sync.clone();
            tokio::spawn(async move { sync.sync_embeddings().await });
        }

        Ok(())
    }

    pub async fn memory_search(&self, query: &str, options: SearchOptions) -> Result<SearchResponse> {
        self.ensure_synced().await?;
        let results = self.search.search(query, options).await?;
        Ok(SearchResponse { count: results.len(), results })
    }

    pub fn memory_get(&self, path: &str, from: Option<u32>, lines: Option<u32>) -> Result<GetResponse> {
        let rel = normalize_requested_path(path);
        if has_parent_traversal(&rel) || !self.is_allowed_path(&rel) {
            return Err(MemoryError::PathNotAllowed(PathBuf::from(path)));
        }

        let abs = self.config.workspace_dir.join(&rel);
        let content = std::fs::read_to_string(&abs).map_err(|_| MemoryError::FileNotFound(abs.clone()))?;

        let text = match from {
            Some(from_line) => slice_lines(&content, from_line, lines),
            None => content,
        };

        Ok(GetResponse { path: rel, text })
    }

    fn is_allowed_path(&self, rel: &str) -> bool {
        const TOP_LEVEL: [&str; 4] = ["MEMORY.md", "memory.md", "MEMORY.txt", "memory.txt"];
        let shape_allowed = TOP_LEVEL.contains(&rel) || rel.starts_with("memory/");
        shape_allowed && indexed_extension(Path::new(rel))
    }

    pub async fn memory_status(&self) -> Result<StatusResponse> {
        let counts = self.sync.store().status_counts().await?;
        let mut warnings = Vec::new();

        if counts.total_files > 50 {
            warnings.push(format!("{} files indexed, consider pruning (> 50)", counts.total_files));
        }
        for (hash, paths) in self.sync.store().duplicate_hash_paths().await? {
            warnings.push(format!("duplicate content (hash {}) across: {}", &hash[..8.min(hash.len())], paths.join(", ")));
        }
        for (path, count) in self.sync.store().large_chunk_files().await? {
            warnings.push(format!("{path} has {count} chunks (> 500)"));
        }

        Ok(StatusResponse {
            workspace_dir: self.config.workspace_dir.display().to_string(),
            db_path: self.config.db_path.display().to_string(),
            files: counts.total_files,
            memory_files: counts.memory_files,
            session_files: counts.session_files,
            chunks: counts.total_chunks,
            embedded_chunks: counts.embedded_chunks,
            embedding_cache: counts.embedding_cache_rows,
            config: ConfigSummary {
                chunk_size: self.config.chunk_size,
                token_max: self.config.token_max,
                session_days: self.config.session_days,
                session_max: self.config.session_max,
            },
            last_sync_at: *self.last_sync_at.lock().unwrap_or_else(|p| p.into_inner()),
            warnings: (!warnings.is_empty()).then_some(warnings),
        })
    }

    pub async fn memory_write(&self, content: &str, category: Option<&str>, source: Option<&str>, evidence: Option<&str>) -> Result<WriteOutcome> {
        self.mutator.write(content, category, source, evidence).await
    }

    pub async fn memory_update(
        &self,
        old_content: &str,
        new_content: &str,
        category: Option<&str>,
        source: Option<&str>,
        evidence: Option<&str>,
    ) -> Result<UpdateOutcome> {
        self.mutator.update(old_content, new_content, category, source, evidence).await
    }

    pub async fn memory_forget(&self, content: &str, category: Option<&str>) -> Result<ForgetOutcome> {
        self.mutator.forget(content, category).await
    }
}

fn normalize_requested_path(path: &str) -> String {
    path.trim_start_matches('/').replace('\\', "/")
}

/// Rejects `..` segments so a request like `memory/../../../outside.md`
/// can't escape `workspace_dir` despite passing the `memory/`-prefix shape
/// check in `is_allowed_path`.
fn has_parent_traversal(rel: &str) -> bool {
    Path::new(rel).components().any(|c| matches!(c, std::path::Component::ParentDir))
}

fn slice_lines(content: &str, from: u32, count: Option<u32>) -> String {
    let start = from.saturating_sub(1) as usize;
    let lines: Vec<&str> = content.lines().collect();
    if start >= lines.len() {
        return String::new();
    }
    let end = match count {
        Some(n) => (start + n as usize).min(lines.len()),
        None => lines.len(),
    };
    lines[start..end].join("\n")
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn service(dir: &TempDir) -> MemoryService {
        let config = MemoryConfig {
            workspace_dir: dir.path().to_path_buf(),
            db_path: dir.path().join("memory.db"),
            chunk_size: 512,
            token_max: 4096,
            session_days: 30,
            session_max: -1,
        };
        MemoryService::init(config).await.unwrap()
    }

    #[tokio::test]
    async fn memory_get_rejects_paths_outside_allow_list() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("secrets.txt"), "nope").unwrap();
        let svc = service(&dir).await;
        let err = svc.memory_get("secrets.txt", None, None).unwrap_err();
        assert!(matches!(err, MemoryError::PathNotAllowed(_)));
    }

    #[tokio::test]
    async fn memory_get_rejects_parent_traversal_under_memory_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("outside.md"), "secret").unwrap();
        std::fs::create_dir_all(dir.path().join("memory")).unwrap();
        let svc = service(&dir).await;
        let err = svc.memory_get("memory/../../outside.md", None, None).unwrap_err();
        assert!(matches!(err, MemoryError::PathNotAllowed(_)));
    }

    #[tokio::test]
    async fn memory_get_rejects_disallowed_extension_under_memory_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("memory")).unwrap();
        std::fs::write(dir.path().join("memory/image.png"), "x").unwrap();
        let svc = service(&dir).await;
        let err = svc.memory_get("memory/image.png", None, None).unwrap_err();
        assert!(matches!(err, MemoryError::PathNotAllowed(_)));
    }

    #[tokio::test]
    async fn memory_get_returns_sliced_lines() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("MEMORY.md"), "a\nb\nc\nd\n").unwrap();
        let svc = service(&dir).await;
        let resp = svc.memory_get("MEMORY.md", Some(2), Some(2)).unwrap();
        assert_eq!(resp.text, "b\nc");
    }

    #[tokio::test]
    async fn memory_write_then_search_round_trips() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir).await;
        let outcome = svc.memory_write("user prefers dark mode", None, None, None).await.unwrap();
        assert!(outcome.stored);

        let resp = svc.memory_search("dark mode", SearchOptions::default()).await.unwrap();
        assert!(resp.count >= 1);
    }

    #[tokio::test]
    async fn memory_status_reports_zero_files_initially() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir).await;
        let status = svc.memory_status().await.unwrap();
        assert_eq!(status.files, 0);
        assert!(status.warnings.is_none());
    }
}
