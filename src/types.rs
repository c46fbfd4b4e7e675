//! Core data types shared across the retrieval components.

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

/// Partition a file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Memory,
    Sessions,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Memory => "memory",
            Source::Sessions => "sessions",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "memory" => Some(Source::Memory),
            "sessions" => Some(Source::Sessions),
            _ => None,
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file admitted by the Scanner, ready to be (re)synced into the Store.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub source: Source,
    /// Relative path from the workspace root, `/`-separated.
    pub path: String,
    pub content: String,
    pub mtime_ms: i64,
    pub size: u64,
    pub hash: String,
}

impl FileEntry {
    pub fn fingerprint(content: &str) -> String {
        let digest = Sha256::digest(content.as_bytes());
        hex::encode(digest)
    }
}

/// A stored file record (§3 "File record").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: String,
    pub source: Source,
    pub hash: String,
    pub mtime_ms: i64,
    pub size: u64,
}

/// A span of text extracted by the Chunker, prior to persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    /// 1-based inclusive.
    pub start_line: u32,
    /// 1-based inclusive.
    pub end_line: u32,
    pub text: String,
}

impl RawChunk {
    pub fn hash(&self) -> String {
        let digest = Sha256::digest(self.text.as_bytes());
        hex::encode(digest)
    }
}

/// Deterministic chunk identity per §3: SHA256(source ":" path ":" startLine ":" endLine ":" chunkHash).
pub fn chunk_id(source: Source, path: &str, start_line: u32, end_line: u32, chunk_hash: &str) -> String {
    let preimage = format!(
        "{}:{}:{}:{}:{}",
        source.as_str(),
        path,
        start_line,
        end_line,
        chunk_hash
    );
    let digest = Sha256::digest(preimage.as_bytes());
    hex::encode(digest)
}

/// A persisted chunk row, as read back from the Store.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub path: String,
    pub source: Source,
    pub start_line: u32,
    pub end_line: u32,
    pub hash: String,
    pub text: String,
    pub updated_at: i64,
    pub access_count: i64,
}

/// Embedder capability dimensionality, fixed per §4.3.
pub const EMBEDDING_DIM: u16 = 768;

/// Result of a search query (§4.7 "Outputs").
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub path: String,
    #[serde(rename = "startLine")]
    pub start_line: u32,
    #[serde(rename = "endLine")]
    pub end_line: u32,
    pub score: f32,
    pub snippet: String,
    pub source: Source,
}

/// Search options, per §4.7 "Inputs".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchOptions {
    #[serde(rename = "maxResults")]
    pub max_results: Option<u32>,
    #[serde(rename = "minScore")]
    pub min_score: Option<f32>,
    #[serde(rename = "tokenMax")]
    pub token_max: Option<u32>,
    pub after: Option<String>,
    pub before: Option<String>,
}
