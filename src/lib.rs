//! Local hybrid lexical/vector retrieval core for personal memory notes and
//! agent session transcripts.
//!
//! ## Modules
//!
//! | Module | Responsibility |
//! |--------|-----------------|
//! | `config` | `MEMORY_*` environment variables |
//! | `error` | crate-wide error/result types |
//! | `types` | shared data shapes (chunks, search options/results) |
//! | `store` | SQLite-backed persistence: files, chunks, FTS5, vec0, cache |
//! | `segmenter` | CJK-aware tokenization for lexical indexing/queries |
//! | `embedder` | local embedding capability, optional and gracefully degraded |
//! | `chunking` | per-format chunking strategies (markdown/json/yaml/jsonl) |
//! | `scanner` | filesystem enumeration for the memory and sessions sources |
//! | `sync` | reconciliation between the Scanner and the Store |
//! | `search` | hybrid retrieval: lexical, vector, fusion, fallback |
//! | `mutator` | ledger writes, dedup, forget/update |
//! | `rpc` | the typed operation surface backing the six RPC methods |

pub mod chunking;
pub mod config;
pub mod embedder;
pub mod error;
pub mod mutator;
pub mod rpc;
pub mod scanner;
pub mod search;
pub mod segmenter;
pub mod store;
pub mod sync;
pub mod types;

pub use config::MemoryConfig;
pub use error::MemoryError;
pub use error::Result;
pub use rpc::MemoryService;
pub use types::SearchOptions;
pub use types::SearchResult;
