//! Store parameters with environment variable and file-based loading.
//!
//! Environment variables:
//! - `CHUNKSTORE_DATA_DIR`: directory holding the chunk database
//! - `CHUNKSTORE_CACHE_CAPACITY`: MemStore capacity in chunks
//! - `CHUNKSTORE_DB_CAPACITY`: DbStore capacity in bytes
//! - `CHUNKSTORE_MAX_IN_FLIGHT`: concurrent chunk puts per split
//! - `CHUNKSTORE_SPLIT_WORKERS`: concurrent subtree builders per split
//!
//! Default data directory: `~/.chunkstore`

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Chunks held by the cache tier unless configured otherwise.
pub const DEFAULT_CACHE_CAPACITY: usize = 5000;

/// Durable tier budget unless configured otherwise (20 GiB).
pub const DEFAULT_DB_CAPACITY: u64 = 20 * 1024 * 1024 * 1024;

pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;

pub const DEFAULT_SPLIT_WORKERS: usize = 8;

/// Capacities and concurrency for a store. Fixed once a store is built from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreParams {
    /// The chunk database lives at `{data_dir}/chunks.db`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// MemStore capacity, in chunks. Zero disables caching.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// DbStore capacity, in bytes of chunk data.
    #[serde(default = "default_db_capacity")]
    pub db_capacity: u64,

    /// Chunk puts a single split may have outstanding.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Subtrees a single split builds concurrently.
    #[serde(default = "default_split_workers")]
    pub split_workers: usize,
}

fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".chunkstore"))
        .unwrap_or_else(|| PathBuf::from(".chunkstore"))
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

fn default_db_capacity() -> u64 {
    DEFAULT_DB_CAPACITY
}

fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT
}

fn default_split_workers() -> usize {
    DEFAULT_SPLIT_WORKERS
}

impl Default for StoreParams {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            db_capacity: DEFAULT_DB_CAPACITY,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            split_workers: DEFAULT_SPLIT_WORKERS,
        }
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {name}: {value:?}")),
        Err(_) => Ok(default),
    }
}

impl StoreParams {
    /// Load parameters from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let data_dir = env::var("CHUNKSTORE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());

        Ok(Self {
            data_dir,
            cache_capacity: env_parse("CHUNKSTORE_CACHE_CAPACITY", DEFAULT_CACHE_CAPACITY)?,
            db_capacity: env_parse("CHUNKSTORE_DB_CAPACITY", DEFAULT_DB_CAPACITY)?,
            max_in_flight: env_parse("CHUNKSTORE_MAX_IN_FLIGHT", DEFAULT_MAX_IN_FLIGHT)?,
            split_workers: env_parse("CHUNKSTORE_SPLIT_WORKERS", DEFAULT_SPLIT_WORKERS)?,
        })
    }

    /// Load parameters from a TOML file, falling back to environment.
    ///
    /// The file should contain a `[chunkstore]` section; missing keys take defaults:
    /// ```toml
    /// [chunkstore]
    /// data_dir = "/tank/chunks"
    /// cache_capacity = 10000
    /// db_capacity = 107374182400
    /// ```
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let table: toml::Table = contents
            .parse()
            .with_context(|| format!("failed to parse TOML: {}", path.display()))?;

        match table.get("chunkstore") {
            Some(section) => section
                .clone()
                .try_into()
                .context("failed to parse [chunkstore] section"),
            None => Self::from_env(),
        }
    }

    /// Defaults, rooted at a specific data directory.
    pub fn with_data_dir(path: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: path.into(),
            ..Self::default()
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chunks.db")
    }

    /// Concurrency limits clamped to at least one.
    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.max(1)
    }

    pub(crate) fn split_workers(&self) -> usize {
        self.split_workers.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_params() {
        let params = StoreParams::default();
        assert!(params.data_dir.to_string_lossy().contains(".chunkstore"));
        assert_eq!(params.cache_capacity, 5000);
        assert_eq!(params.db_capacity, 20 * 1024 * 1024 * 1024);
        assert_eq!(params.max_in_flight, 64);
        assert_eq!(params.split_workers, 8);
    }

    #[test]
    fn test_with_data_dir() {
        let params = StoreParams::with_data_dir("/custom/path");
        assert_eq!(params.data_dir, PathBuf::from("/custom/path"));
        assert_eq!(params.db_path(), PathBuf::from("/custom/path/chunks.db"));
        assert_eq!(params.cache_capacity, DEFAULT_CACHE_CAPACITY);
    }

    #[test]
    fn test_concurrency_is_clamped() {
        let params = StoreParams {
            max_in_flight: 0,
            split_workers: 0,
            ..StoreParams::with_data_dir("/x")
        };
        assert_eq!(params.max_in_flight(), 1);
        assert_eq!(params.split_workers(), 1);
    }

    #[test]
    fn test_serde_roundtrip() {
        let params = StoreParams {
            data_dir: PathBuf::from("/custom/chunks"),
            cache_capacity: 12,
            db_capacity: 1 << 20,
            max_in_flight: 4,
            split_workers: 2,
        };
        let json = serde_json::to_string(&params).unwrap();
        let restored: StoreParams = serde_json::from_str(&json).unwrap();
        assert_eq!(params, restored);
    }

    #[test]
    fn test_from_file_reads_section() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(
            file,
            "[chunkstore]\ndata_dir = \"/tank/chunks\"\ncache_capacity = 42\n"
        )?;

        let params = StoreParams::from_file(file.path())?;
        assert_eq!(params.data_dir, PathBuf::from("/tank/chunks"));
        assert_eq!(params.cache_capacity, 42);
        assert_eq!(params.db_capacity, DEFAULT_DB_CAPACITY);
        Ok(())
    }

    #[test]
    fn test_from_file_rejects_bad_toml() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "[chunkstore\nnot toml")?;
        assert!(StoreParams::from_file(file.path()).is_err());
        Ok(())
    }

    #[test]
    fn test_from_file_missing_file() {
        let result = StoreParams::from_file(Path::new("/nonexistent/chunkstore.toml"));
        assert!(result.is_err());
    }
}
