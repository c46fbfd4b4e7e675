//! Environment-driven configuration (§6 "Environment").

use std::path::Path;
use std::path::PathBuf;

use crate::error::MemoryError;
use crate::error::Result;

/// Runtime configuration, read once at process start from the `MEMORY_*`
/// environment variables documented in `spec.md` §6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    pub workspace_dir: PathBuf,
    pub db_path: PathBuf,
    pub chunk_size: u32,
    pub token_max: u32,
    pub session_days: i64,
    pub session_max: i64,
}

impl MemoryConfig {
    /// Build configuration from the environment, validating every
    /// documented range and falling back to the default for unset vars.
    pub fn from_env() -> Result<Self> {
        let workspace_dir = match std::env::var("MEMORY_WORKSPACE") {
            Ok(v) if !v.is_empty() => PathBuf::from(v),
            _ => default_workspace_dir(),
        };

        let db_path = match std::env::var("MEMORY_DB_PATH") {
            Ok(v) if !v.is_empty() => PathBuf::from(v),
            _ => workspace_dir.join("memory.db"),
        };

        let chunk_size = parse_ranged_u32("MEMORY_CHUNK_SIZE", 512, 64, 4096)?;
        let token_max = parse_ranged_u32("MEMORY_TOKEN_MAX", 4096, 100, 16384)?;
        let session_days = parse_ranged_i64("MEMORY_SESSION_DAYS", 30, 0, i64::MAX)?;
        let session_max = parse_ranged_i64("MEMORY_SESSION_MAX", -1, -1, i64::MAX)?;

        Ok(Self {
            workspace_dir,
            db_path,
            chunk_size,
            token_max,
            session_days,
            session_max,
        })
    }
}

/// Default workspace: `$HOME/.copilot`, or `$HOME/.claude` when that
/// profile marker directory already exists (the profile switch in §6).
fn default_workspace_dir() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let claude = home.join(".claude");
    if claude.is_dir() {
        claude
    } else {
        home.join(".copilot")
    }
}

fn parse_ranged_u32(var: &str, default: u32, min: u32, max: u32) -> Result<u32> {
    match std::env::var(var) {
        Err(_) => Ok(default),
        Ok(raw) => {
            let value: u32 = raw.trim().parse().map_err(|_| MemoryError::Config {
                field: var.to_string(),
                cause: format!("not an integer: {raw:?}"),
            })?;
            if value < min || value > max {
                return Err(MemoryError::Config {
                    field: var.to_string(),
                    cause: format!("{value} out of range [{min}, {max}]"),
                });
            }
            Ok(value)
        }
    }
}

fn parse_ranged_i64(var: &str, default: i64, min: i64, max: i64) -> Result<i64> {
    match std::env::var(var) {
        Err(_) => Ok(default),
        Ok(raw) => {
            let value: i64 = raw.trim().parse().map_err(|_| MemoryError::Config {
                field: var.to_string(),
                cause: format!("not an integer: {raw:?}"),
            })?;
            if value < min || value > max {
                return Err(MemoryError::Config {
                    field: var.to_string(),
                    cause: format!("{value} out of range [{min}, {max}]"),
                });
            }
            Ok(value)
        }
    }
}

/// The file-extension set admitted for memory-source indexing (§4.5, §6).
pub fn indexed_extension(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref(),
        Some("md") | Some("txt") | Some("json") | Some("jsonl") | Some("yaml") | Some("yml")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_unset() {
        // Only assert behavior independent of ambient env state.
        let chunk_size = parse_ranged_u32("MEMORY_CHUNK_SIZE_TEST_UNSET_VAR", 512, 64, 4096).unwrap();
        assert_eq!(chunk_size, 512);
    }

    #[test]
    fn rejects_out_of_range() {
        std::env::set_var("MEMORY_RANGE_TEST_VAR", "1");
        let err = parse_ranged_u32("MEMORY_RANGE_TEST_VAR", 512, 64, 4096).unwrap_err();
        assert!(matches!(err, MemoryError::Config { .. }));
        std::env::remove_var("MEMORY_RANGE_TEST_VAR");
    }
}
