//! The Store (spec §4.1): an embedded SQL engine with BM25 full-text search
//! and an optional vector-search extension, schema-versioned and atomically
//! rebuildable.
//!
//! Grounded on `storage/sqlite.rs`'s async `spawn_blocking` + mutex wrapper
//! and `storage/sqlite_vec.rs`'s `vec0` registration/table pattern from the
//! teacher crate.

use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;
use zerocopy::IntoBytes;

use crate::error::MemoryError;
use crate::error::Result;
use crate::types::Chunk;
use crate::types::Source;
use crate::types::EMBEDDING_DIM;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS files (
    path   TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    hash   TEXT NOT NULL,
    mtime  INTEGER NOT NULL,
    size   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS files_source_idx ON files(source);

CREATE TABLE IF NOT EXISTS chunks (
    id           TEXT PRIMARY KEY,
    path         TEXT NOT NULL,
    source       TEXT NOT NULL,
    start_line   INTEGER NOT NULL,
    end_line     INTEGER NOT NULL,
    hash         TEXT NOT NULL,
    text         TEXT NOT NULL,
    updated_at   INTEGER NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS chunks_path_idx ON chunks(path);
CREATE INDEX IF NOT EXISTS chunks_source_idx ON chunks(source);
CREATE INDEX IF NOT EXISTS chunks_hash_idx ON chunks(hash);

CREATE TABLE IF NOT EXISTS embedding_cache (
    hash       TEXT PRIMARY KEY,
    embedding  BLOB NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;

const FTS_SCHEMA: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    id UNINDEXED,
    path UNINDEXED,
    source UNINDEXED,
    start_line UNINDEXED,
    end_line UNINDEXED,
    text
);
"#;

fn vec_schema(dimension: u16) -> String {
    format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_vec USING vec0(\
            id TEXT PRIMARY KEY, \
            embedding float[{dimension}] distance_metric=cosine\
        );"
    )
}

/// The Store's durable handle. Cheaply `Clone`-able; internally an
/// `Arc<Mutex<Connection>>` whose blocking statements are dispatched to
/// `spawn_blocking` so the async RPC loop (spec §5) stays responsive.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
    dimension: u16,
    fts_available: bool,
    vec_available: bool,
}

static VEC_EXTENSION_REGISTERED: std::sync::Once = std::sync::Once::new();

fn register_vec_extension() {
    VEC_EXTENSION_REGISTERED.call_once(|| {
        unsafe {
            // The officially documented registration pattern from the
            // sqlite-vec crate: install it as an auto-extension before any
            // connection is opened so every future `Connection::open` picks
            // up `vec0` support automatically.
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                sqlite_vec::sqlite3_vec_init as *const (),
            )));
        }
    });
}

impl Store {
    /// Open (creating if absent) the store at `db_path`, ensuring its schema
    /// matches `chunk_size`. On schema-version or chunk-size mismatch,
    /// performs the atomic rebuild described in §4.1.
    pub async fn open(db_path: &Path, chunk_size: u32) -> Result<Self> {
        let db_path = db_path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::open_blocking(&db_path, chunk_size))
            .await
            .expect("store open task panicked")
    }

    fn open_blocking(db_path: &Path, chunk_size: u32) -> Result<Self> {
        register_vec_extension();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|cause| MemoryError::Io {
                path: parent.to_path_buf(),
                cause,
            })?;
        }

        let fresh = !db_path.exists();
        let conn = open_connection(db_path)?;
        apply_pragmas(&conn)?;

        if fresh {
            init_schema(&conn, EMBEDDING_DIM)?;
            set_meta(&conn, "schema_version", &SCHEMA_VERSION.to_string())?;
            set_meta(&conn, "chunk_size", &chunk_size.to_string())?;
        } else {
            let stored_version = get_meta(&conn, "schema_version")?;
            let stored_chunk_size = get_meta(&conn, "chunk_size")?;
            let needs_rebuild = stored_version.as_deref() != Some(&SCHEMA_VERSION.to_string())
                || stored_chunk_size.as_deref() != Some(&chunk_size.to_string());
            if needs_rebuild {
                rebuild(db_path, conn, chunk_size)?;
            }
        }

        let conn = open_connection(db_path)?;
        apply_pragmas(&conn)?;
        let fts_available = probe_fts(&conn);
        let vec_available = probe_vec(&conn);

        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
            path: db_path.to_path_buf(),
            dimension: EMBEDDING_DIM,
            fts_available,
            vec_available,
        })
    }

    pub fn fts_available(&self) -> bool {
        self.fts_available
    }

    pub fn vec_available(&self) -> bool {
        self.vec_available
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dimension(&self) -> u16 {
        self.dimension
    }

    /// Dispatch a blocking read onto the store's worker thread.
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&guard)
        })
        .await
        .expect("store worker thread panicked")
        .map_err(|cause| MemoryError::Store {
            operation: "query".to_string(),
            cause,
        })
    }

    /// Dispatch a blocking transaction onto the store's worker thread.
    async fn with_tx<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let tx = guard.transaction()?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
        .await
        .expect("store worker thread panicked")
        .map_err(|cause| MemoryError::Store {
            operation: "transaction".to_string(),
            cause,
        })
    }

    pub async fn file_hash(&self, source: Source, path: &str) -> Result<Option<String>> {
        let path = path.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT hash FROM files WHERE path = ?1 AND source = ?2",
                params![path, source.as_str()],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    pub async fn active_paths(&self, source: Source) -> Result<HashSet<String>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT path FROM files WHERE source = ?1")?;
            let rows = stmt.query_map(params![source.as_str()], |row| row.get::<_, String>(0))?;
            rows.collect()
        })
        .await
    }

    /// Re-index one file: delete its existing chunks/fts/vec rows, upsert
    /// the file row, and insert the fresh chunk (and, when FTS is
    /// available, lexical) rows — all in one transaction (§4.6 step 2).
    #[allow(clippy::too_many_arguments)]
    pub async fn reindex_file(
        &self,
        source: Source,
        path: String,
        file_hash: String,
        mtime_ms: i64,
        size: u64,
        now_ms: i64,
        chunks: Vec<(String, u32, u32, String, String, Option<String>)>,
        fts_available: bool,
    ) -> Result<()> {
        self.with_tx(move |tx| {
            delete_path_children(tx, &path)?;

            tx.execute(
                "INSERT INTO files(path, source, hash, mtime, size) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(path) DO UPDATE SET source = excluded.source, hash = excluded.hash,
                    mtime = excluded.mtime, size = excluded.size",
                params![path, source.as_str(), file_hash, mtime_ms, size as i64],
            )?;

            for (id, start_line, end_line, hash, text, lexical_text) in chunks {
                tx.execute(
                    "INSERT INTO chunks(id, path, source, start_line, end_line, hash, text, updated_at, access_count)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
                    params![id, path, source.as_str(), start_line, end_line, hash, text, now_ms],
                )?;
                if fts_available {
                    if let Some(lexical) = lexical_text {
                        tx.execute(
                            "INSERT INTO chunks_fts(id, path, source, start_line, end_line, text)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                            params![id, path, source.as_str(), start_line, end_line, lexical],
                        )?;
                    }
                }
            }
            Ok(())
        })
        .await
    }

    /// Delete a file (and its chunks/fts/vec rows) that is no longer
    /// yielded by the Scanner (§4.6 step 3).
    pub async fn delete_path(&self, path: String) -> Result<()> {
        self.with_tx(move |tx| {
            delete_path_children(tx, &path)?;
            tx.execute("DELETE FROM files WHERE path = ?1", params![path])?;
            Ok(())
        })
        .await
    }

    pub async fn chunks_missing_vector(&self, limit: u32) -> Result<Vec<Chunk>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.path, c.source, c.start_line, c.end_line, c.hash, c.text, c.updated_at, c.access_count
                 FROM chunks c
                 WHERE NOT EXISTS (SELECT 1 FROM chunks_vec v WHERE v.id = c.id)
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], row_to_chunk)?;
            rows.collect()
        })
        .await
    }

    pub async fn embedding_cache_get(&self, hash: String) -> Result<Option<Vec<f32>>> {
        self.with_conn(move |conn| {
            let blob: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT embedding FROM embedding_cache WHERE hash = ?1",
                    params![hash],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(blob.map(|b| bytes_to_f32(&b)))
        })
        .await
    }

    /// Insert a chunk's vector and embedding-cache row in one transaction
    /// (§4.6 embedding sync).
    pub async fn insert_vector(
        &self,
        chunk_id: String,
        text_hash: String,
        embedding: Vec<f32>,
        now_ms: i64,
    ) -> Result<()> {
        self.with_tx(move |tx| {
            let bytes = f32_to_bytes(&embedding);
            tx.execute(
                "INSERT INTO chunks_vec(id, embedding) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET embedding = excluded.embedding",
                params![chunk_id, bytes],
            )?;
            tx.execute(
                "INSERT INTO embedding_cache(hash, embedding, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(hash) DO UPDATE SET embedding = excluded.embedding, updated_at = excluded.updated_at",
                params![text_hash, f32_to_bytes(&embedding), now_ms],
            )?;
            Ok(())
        })
        .await
    }

    /// Remove a vector-only row: the text hash was already cached, so only
    /// `chunks_vec` needs a fresh row (§4.6 "store cache hits directly").
    pub async fn insert_vector_from_cache(&self, chunk_id: String, embedding: Vec<f32>) -> Result<()> {
        self.with_tx(move |tx| {
            let bytes = f32_to_bytes(&embedding);
            tx.execute(
                "INSERT INTO chunks_vec(id, embedding) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET embedding = excluded.embedding",
                params![chunk_id, bytes],
            )?;
            Ok(())
        })
        .await
    }

    /// Garbage-collect embedding-cache rows whose hash no longer belongs to
    /// any chunk (§4.6, end of embedding sync).
    pub async fn gc_embedding_cache(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM embedding_cache WHERE hash NOT IN (SELECT DISTINCT hash FROM chunks)",
                [],
            )?;
            Ok(n as u64)
        })
        .await
    }

    pub async fn fts_search(&self, match_expr: String, limit: u32) -> Result<Vec<(Chunk, f64)>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.path, c.source, c.start_line, c.end_line, c.hash, c.text, c.updated_at, c.access_count, f.rank
                 FROM chunks_fts f
                 JOIN chunks c ON c.id = f.id
                 WHERE chunks_fts MATCH ?1
                 ORDER BY f.rank
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![match_expr, limit], |row| {
                let chunk = row_to_chunk(row)?;
                let rank: f64 = row.get(9)?;
                Ok((chunk, rank))
            })?;
            rows.collect()
        })
        .await
    }

    pub async fn vector_search(&self, embedding: Vec<f32>, limit: u32) -> Result<Vec<(Chunk, f32)>> {
        self.with_conn(move |conn| {
            let has_rows: bool = conn.query_row("SELECT EXISTS(SELECT 1 FROM chunks_vec LIMIT 1)", [], |r| r.get(0))?;
            if !has_rows {
                return Ok(Vec::new());
            }
            let bytes = f32_to_bytes(&embedding);
            let mut stmt = conn.prepare(
                "SELECT c.id, c.path, c.source, c.start_line, c.end_line, c.hash, c.text, c.updated_at, c.access_count, v.distance
                 FROM chunks_vec v
                 JOIN chunks c ON c.id = v.id
                 WHERE v.embedding MATCH ?1 AND k = ?2
                 ORDER BY v.distance",
            )?;
            let rows = stmt.query_map(params![bytes, limit], |row| {
                let chunk = row_to_chunk(row)?;
                let distance: f32 = row.get(9)?;
                Ok((chunk, distance))
            })?;
            rows.collect()
        })
        .await
    }

    pub async fn substring_search(&self, like_pattern: String, limit: u32) -> Result<Vec<Chunk>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, path, source, start_line, end_line, hash, text, updated_at, access_count
                 FROM chunks
                 WHERE text LIKE ?1 ESCAPE '\\'
                 ORDER BY updated_at DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![like_pattern, limit], row_to_chunk)?;
            rows.collect()
        })
        .await
    }

    pub async fn bump_access_counts(&self, ids: Vec<String>) -> Result<()> {
        self.with_tx(move |tx| {
            for id in &ids {
                tx.execute("UPDATE chunks SET access_count = access_count + 1 WHERE id = ?1", params![id])?;
            }
            Ok(())
        })
        .await
    }

    pub async fn access_count(&self, id: String) -> Result<i64> {
        self.with_conn(move |conn| conn.query_row("SELECT access_count FROM chunks WHERE id = ?1", params![id], |r| r.get(0)))
            .await
    }

    /// Paths (across both sources) whose file mtime lies in `[after, before]` (§4.7).
    pub async fn paths_in_mtime_range(&self, after_ms: Option<i64>, before_ms: Option<i64>) -> Result<HashSet<String>> {
        self.with_conn(move |conn| {
            let mut sql = "SELECT path FROM files WHERE 1=1".to_string();
            let mut args: Vec<i64> = Vec::new();
            if let Some(a) = after_ms {
                sql.push_str(" AND mtime >= ?");
                args.push(a);
            }
            if let Some(b) = before_ms {
                sql.push_str(" AND mtime <= ?");
                args.push(b);
            }
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(args), |row| row.get::<_, String>(0))?;
            rows.collect()
        })
        .await
    }

    pub async fn status_counts(&self) -> Result<StatusCounts> {
        self.with_conn(|conn| {
            let total_files: i64 = conn.query_row("SELECT COUNT(*) FROM files", [], |r| r.get(0))?;
            let memory_files: i64 = conn.query_row("SELECT COUNT(*) FROM files WHERE source='memory'", [], |r| r.get(0))?;
            let session_files: i64 = conn.query_row("SELECT COUNT(*) FROM files WHERE source='sessions'", [], |r| r.get(0))?;
            let total_chunks: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))?;
            let embedded_chunks: i64 = conn
                .query_row("SELECT COUNT(*) FROM chunks_vec", [], |r| r.get(0))
                .unwrap_or(0);
            let cache_rows: i64 = conn.query_row("SELECT COUNT(*) FROM embedding_cache", [], |r| r.get(0))?;
            Ok(StatusCounts {
                total_files: total_files as u64,
                memory_files: memory_files as u64,
                session_files: session_files as u64,
                total_chunks: total_chunks as u64,
                embedded_chunks: embedded_chunks as u64,
                embedding_cache_rows: cache_rows as u64,
            })
        })
        .await
    }

    /// Duplicate content hashes across ≥2 distinct paths, top 5 (§6 status warnings).
    pub async fn duplicate_hash_paths(&self) -> Result<Vec<(String, Vec<String>)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT hash, GROUP_CONCAT(DISTINCT path) FROM chunks GROUP BY hash HAVING COUNT(DISTINCT path) >= 2 LIMIT 5",
            )?;
            let rows = stmt.query_map([], |row| {
                let hash: String = row.get(0)?;
                let paths: String = row.get(1)?;
                Ok((hash, paths.split(',').map(|s| s.to_string()).collect()))
            })?;
            rows.collect()
        })
        .await
    }

    /// Paths with more than 500 chunks (§6 status warnings).
    pub async fn large_chunk_files(&self) -> Result<Vec<(String, i64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT path, COUNT(*) c FROM chunks GROUP BY path HAVING c > 500")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
            rows.collect()
        })
        .await
    }
}

#[derive(Debug, Clone)]
pub struct StatusCounts {
    pub total_files: u64,
    pub memory_files: u64,
    pub session_files: u64,
    pub total_chunks: u64,
    pub embedded_chunks: u64,
    pub embedding_cache_rows: u64,
}

const SCHEMA_VERSION: u32 = 1;

fn open_connection(path: &Path) -> Result<Connection> {
    Connection::open(path).map_err(|cause| MemoryError::Store {
        operation: "open".to_string(),
        cause,
    })
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|cause| MemoryError::Store {
        operation: "pragma".to_string(),
        cause,
    })
}

fn init_schema(conn: &Connection, dimension: u16) -> Result<()> {
    conn.execute_batch(SCHEMA).map_err(|cause| MemoryError::Store {
        operation: "init_schema".to_string(),
        cause,
    })?;
    // FTS5 and vec0 are optional extensions; missing either degrades
    // gracefully per §4.1's failure modes instead of failing `open`.
    let _ = conn.execute_batch(FTS_SCHEMA);
    let _ = conn.execute_batch(&vec_schema(dimension));
    Ok(())
}

fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| row.get(0))
        .optional()
        .map_err(|cause| MemoryError::Store {
            operation: "get_meta".to_string(),
            cause,
        })
}

fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO meta(key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )
    .map_err(|cause| MemoryError::Store {
        operation: "set_meta".to_string(),
        cause,
    })?;
    Ok(())
}

fn probe_fts(conn: &Connection) -> bool {
    conn.query_row("SELECT COUNT(*) FROM chunks_fts", [], |row| row.get::<_, i64>(0))
        .is_ok()
}

fn probe_vec(conn: &Connection) -> bool {
    conn.query_row("SELECT COUNT(*) FROM chunks_vec", [], |row| row.get::<_, i64>(0))
        .is_ok()
}

fn delete_path_children(tx: &rusqlite::Transaction, path: &str) -> rusqlite::Result<()> {
    let ids: Vec<String> = {
        let mut stmt = tx.prepare("SELECT id FROM chunks WHERE path = ?1")?;
        let rows = stmt.query_map(params![path], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };
    for id in &ids {
        tx.execute("DELETE FROM chunks_vec WHERE id = ?1", params![id]).ok();
        let _ = tx.execute("DELETE FROM chunks_fts WHERE id = ?1", params![id]);
    }
    tx.execute("DELETE FROM chunks WHERE path = ?1", params![path])?;
    Ok(())
}

fn row_to_chunk(row: &rusqlite::Row) -> rusqlite::Result<Chunk> {
    let source_str: String = row.get(2)?;
    Ok(Chunk {
        id: row.get(0)?,
        path: row.get(1)?,
        source: Source::parse(&source_str).unwrap_or(Source::Memory),
        start_line: row.get::<_, i64>(3)? as u32,
        end_line: row.get::<_, i64>(4)? as u32,
        hash: row.get(5)?,
        text: row.get(6)?,
        updated_at: row.get(7)?,
        access_count: row.get(8)?,
    })
}

fn f32_to_bytes(v: &[f32]) -> Vec<u8> {
    v.as_bytes().to_vec()
}

fn bytes_to_f32(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Rebuild the store's schema to match `chunk_size` (§4.1). Tries the
/// atomic rename dance first; if that strategy can't complete, falls back
/// to an in-place `DROP` + recreate on the original file. Either way the
/// caller's `old_conn` is dropped up front, since both strategies need
/// `primary` free of open handles on platforms that reject rename- or
/// write-over-open-file.
fn rebuild(primary: &Path, old_conn: Connection, chunk_size: u32) -> Result<()> {
    let cached_rows = read_embedding_cache(&old_conn).unwrap_or_default();
    drop(old_conn);

    match rebuild_via_rename(primary, chunk_size, &cached_rows) {
        Ok(()) => Ok(()),
        Err(_) => rebuild_in_place(primary, chunk_size, &cached_rows),
    }
}

fn read_embedding_cache(conn: &Connection) -> Result<Vec<(String, Vec<u8>, i64)>> {
    let mut stmt = conn
        .prepare("SELECT hash, embedding, updated_at FROM embedding_cache")
        .map_err(|cause| MemoryError::Store {
            operation: "rebuild_read_cache".to_string(),
            cause,
        })?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?, row.get::<_, i64>(2)?))
        })
        .map_err(|cause| MemoryError::Store {
            operation: "rebuild_read_cache".to_string(),
            cause,
        })?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(|cause| MemoryError::Store {
        operation: "rebuild_read_cache".to_string(),
        cause,
    })
}

fn insert_cached_rows(conn: &Connection, rows: &[(String, Vec<u8>, i64)]) {
    for (hash, embedding, updated_at) in rows {
        let _ = conn.execute(
            "INSERT INTO embedding_cache(hash, embedding, updated_at) VALUES (?1, ?2, ?3)",
            params![hash, embedding, updated_at],
        );
    }
}

/// Primary strategy (§4.1): sibling temp file, rename dance. `embedding_cache`
/// rows are copied verbatim, best-effort, before the swap so previously-
/// embedded text is not re-embedded after a chunk-size change (§3 lifecycle,
/// §8 invariant 7).
fn rebuild_via_rename(primary: &Path, chunk_size: u32, cached_rows: &[(String, Vec<u8>, i64)]) -> Result<()> {
    let suffix: u32 = std::process::id() ^ (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0));
    let tmp_path = primary.with_extension(format!("rebuild-{suffix}.db"));
    let bak_path = primary.with_extension("bak");

    let result = (|| -> Result<()> {
        let tmp_conn = open_connection(&tmp_path)?;
        apply_pragmas(&tmp_conn)?;
        init_schema(&tmp_conn, EMBEDDING_DIM)?;
        set_meta(&tmp_conn, "schema_version", &SCHEMA_VERSION.to_string())?;
        set_meta(&tmp_conn, "chunk_size", &chunk_size.to_string())?;
        insert_cached_rows(&tmp_conn, cached_rows);
        drop(tmp_conn);
        Ok(())
    })();

    if let Err(err) = result {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(err);
    }

    // The caller has already dropped its connection to `primary`, so these
    // renames never race an open handle on platforms that reject
    // rename-over-open-file (§9 design note).
    let swap = (|| -> std::io::Result<()> {
        if primary.exists() {
            std::fs::rename(primary, &bak_path)?;
        }
        std::fs::rename(&tmp_path, primary)?;
        let _ = std::fs::remove_file(&bak_path);
        let _ = std::fs::remove_file(primary.with_extension("db-wal"));
        let _ = std::fs::remove_file(primary.with_extension("db-shm"));
        Ok(())
    })();

    match swap {
        Ok(()) => Ok(()),
        Err(cause) => {
            // Leave the original untouched; restore it if the rename to
            // `.bak` succeeded but the second rename failed.
            if bak_path.exists() && !primary.exists() {
                let _ = std::fs::rename(&bak_path, primary);
            }
            let _ = std::fs::remove_file(&tmp_path);
            Err(MemoryError::Io {
                path: primary.to_path_buf(),
                cause,
            })
        }
    }
}

/// Fallback strategy (§4.1): the rename dance couldn't complete, so rebuild
/// the schema in place on `primary` instead of swapping files. Used on
/// platforms or failure modes (e.g. a sibling path collision) where the
/// atomic rename approach is unusable.
fn rebuild_in_place(primary: &Path, chunk_size: u32, cached_rows: &[(String, Vec<u8>, i64)]) -> Result<()> {
    let conn = open_connection(primary)?;
    apply_pragmas(&conn)?;
    conn.execute_batch(
        "DROP TABLE IF EXISTS chunks_vec;
         DROP TABLE IF EXISTS chunks_fts;
         DROP TABLE IF EXISTS chunks;
         DROP TABLE IF EXISTS files;
         DROP TABLE IF EXISTS embedding_cache;
         DROP TABLE IF EXISTS meta;",
    )
    .map_err(|cause| MemoryError::Store {
        operation: "rebuild_in_place_drop".to_string(),
        cause,
    })?;
    init_schema(&conn, EMBEDDING_DIM)?;
    set_meta(&conn, "schema_version", &SCHEMA_VERSION.to_string())?;
    set_meta(&conn, "chunk_size", &chunk_size.to_string())?;
    insert_cached_rows(&conn, cached_rows);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_test_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("memory.db"), 512).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn open_creates_schema_and_probes_capabilities() {
        let (_dir, store) = open_test_store().await;
        assert!(store.fts_available());
        // vec0 is a real registered extension in this crate's dependency
        // set, so it should also be available in a fresh store.
        assert!(store.vec_available());
    }

    #[tokio::test]
    async fn reindex_then_delete_round_trips() {
        let (_dir, store) = open_test_store().await;
        let chunks = vec![(
            "id1".to_string(),
            1,
            2,
            "hash1".to_string(),
            "hello world".to_string(),
            Some("hello world".to_string()),
        )];
        store
            .reindex_file(Source::Memory, "memory/a.md".into(), "filehash".into(), 0, 11, 0, chunks, true)
            .await
            .unwrap();

        let active = store.active_paths(Source::Memory).await.unwrap();
        assert!(active.contains("memory/a.md"));

        store.delete_path("memory/a.md".into()).await.unwrap();
        let active = store.active_paths(Source::Memory).await.unwrap();
        assert!(!active.contains("memory/a.md"));
    }

    #[tokio::test]
    async fn rebuild_on_chunk_size_change_preserves_cache() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("memory.db");
        let store = Store::open(&db_path, 512).await.unwrap();
        store
            .insert_vector("chunk1".into(), "texthash1".into(), vec![0.1_f32; 768], 0)
            .await
            .unwrap();
        drop(store);

        let store2 = Store::open(&db_path, 256).await.unwrap();
        let cached = store2.embedding_cache_get("texthash1".into()).await.unwrap();
        assert!(cached.is_some());
    }

    #[tokio::test]
    async fn rebuild_falls_back_to_in_place_when_rename_fails() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("memory.db");
        let store = Store::open(&db_path, 512).await.unwrap();
        store
            .insert_vector("chunk1".into(), "texthash1".into(), vec![0.1_f32; 768], 0)
            .await
            .unwrap();
        drop(store);

        // Occupy the `.bak` sibling with a directory so the rename dance's
        // first rename (primary -> .bak) fails; this is how a platform that
        // rejects rename-over-open-file would surface that failure.
        std::fs::create_dir(db_path.with_extension("bak")).unwrap();

        let store2 = Store::open(&db_path, 256).await.unwrap();
        let cached = store2.embedding_cache_get("texthash1".into()).await.unwrap();
        assert!(cached.is_some());
        assert!(store2.fts_available());
    }
}
