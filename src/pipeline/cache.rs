//! Content-addressed annotation cache. Keys are SHA-256 digests of the
//! trimmed fragment text plus an options suffix; values carry a creation
//! timestamp and read as absent once older than the TTL. Storage faults are
//! absorbed: a failed read is a miss, a failed write is a no-op. Caching is
//! an optimization, never a correctness dependency.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const LOG_TARGET: &str = "rubimark::cache";

/// Schema-versioned store name for the durable page cache.
pub const PAGE_STORE_NAME: &str = "rubimark-cache-v1.json";

pub const PAGE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFINITION_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub html: String,
    pub created_at: u64,
}

/// `digest(trimmed text) + options suffix`. The suffix must encode only
/// options that change what the service returns; display-only filtering
/// stays out so one annotation serves every display variation.
pub fn cache_key(trimmed_text: &str, options_suffix: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(trimmed_text.as_bytes());
    format!("{}{}", hex::encode(hasher.finalize()), options_suffix)
}

pub trait CacheBackend: Send {
    fn load(&mut self, key: &str) -> anyhow::Result<Option<CacheEntry>>;
    fn store(&mut self, key: &str, entry: CacheEntry) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct MemoryBackend {
    entries: HashMap<String, CacheEntry>,
}

impl CacheBackend for MemoryBackend {
    fn load(&mut self, key: &str) -> anyhow::Result<Option<CacheEntry>> {
        Ok(self.entries.get(key).cloned())
    }

    fn store(&mut self, key: &str, entry: CacheEntry) -> anyhow::Result<()> {
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }
}

/// Durable single-table store: one JSON file, opened lazily on first
/// access. A missing file is an empty table; an unreadable one degrades to
/// always-miss via the error-absorbing [`CacheStore`] layer above.
pub struct JsonFileBackend {
    path: PathBuf,
    table: Option<HashMap<String, CacheEntry>>,
}

impl JsonFileBackend {
    pub fn at_dir(dir: &Path) -> Self {
        Self::from_path(dir.join(PAGE_STORE_NAME))
    }

    pub fn from_path(path: PathBuf) -> Self {
        Self { path, table: None }
    }

    fn table_mut(&mut self) -> anyhow::Result<&mut HashMap<String, CacheEntry>> {
        if self.table.is_none() {
            let table = if self.path.exists() {
                let text = std::fs::read_to_string(&self.path)
                    .with_context(|| format!("read cache store: {}", self.path.display()))?;
                serde_json::from_str(&text).context("parse cache store")?
            } else {
                HashMap::new()
            };
            self.table = Some(table);
        }
        Ok(self.table.as_mut().expect("just populated"))
    }

    fn flush(&self) -> anyhow::Result<()> {
        let Some(table) = self.table.as_ref() else {
            return Ok(());
        };
        let json = serde_json::to_string(table).context("serialize cache store")?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("write cache store: {}", self.path.display()))?;
        Ok(())
    }
}

impl CacheBackend for JsonFileBackend {
    fn load(&mut self, key: &str) -> anyhow::Result<Option<CacheEntry>> {
        Ok(self.table_mut()?.get(key).cloned())
    }

    fn store(&mut self, key: &str, entry: CacheEntry) -> anyhow::Result<()> {
        self.table_mut()?.insert(key.to_string(), entry);
        self.flush()
    }
}

pub struct CacheStore {
    backend: Box<dyn CacheBackend>,
    ttl: Duration,
}

impl CacheStore {
    pub fn new(backend: Box<dyn CacheBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Box::new(MemoryBackend::default()), ttl)
    }

    pub fn get(&mut self, key: &str) -> Option<String> {
        self.get_at(key, unix_now())
    }

    pub fn set(&mut self, key: &str, html: String) {
        self.set_at(key, html, unix_now());
    }

    pub(crate) fn get_at(&mut self, key: &str, now: u64) -> Option<String> {
        let entry = match self.backend.load(key) {
            Ok(v) => v?,
            Err(err) => {
                log::debug!(target: LOG_TARGET, "cache read failed, treating as miss: {err:#}");
                return None;
            }
        };
        if now.saturating_sub(entry.created_at) >= self.ttl.as_secs() {
            return None;
        }
        Some(entry.html)
    }

    pub(crate) fn set_at(&mut self, key: &str, html: String, now: u64) {
        let entry = CacheEntry {
            html,
            created_at: now,
        };
        if let Err(err) = self.backend.store(key, entry) {
            log::debug!(target: LOG_TARGET, "cache write failed, dropping entry: {err:#}");
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_differ_by_text_and_options_suffix() {
        let a = cache_key("猫", ":furigana");
        let b = cache_key("犬", ":furigana");
        let c = cache_key("猫", ":romaji");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, cache_key("猫", ":furigana"));
    }

    #[test]
    fn entry_expires_after_ttl() {
        let mut store = CacheStore::in_memory(Duration::from_secs(100));
        store.set_at("k", "<ruby>猫</ruby>".to_string(), 1_000);
        assert_eq!(store.get_at("k", 1_050).as_deref(), Some("<ruby>猫</ruby>"));
        // Exactly at TTL reads as absent.
        assert_eq!(store.get_at("k", 1_100), None);
        assert_eq!(store.get_at("k", 2_000), None);
    }

    #[test]
    fn file_backend_round_trips_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CacheStore::new(
            Box::new(JsonFileBackend::at_dir(dir.path())),
            Duration::from_secs(100),
        );
        store.set_at("k", "値".to_string(), 10);

        // Fresh backend instance reads the flushed file.
        let mut reopened = CacheStore::new(
            Box::new(JsonFileBackend::at_dir(dir.path())),
            Duration::from_secs(100),
        );
        assert_eq!(reopened.get_at("k", 20).as_deref(), Some("値"));
    }

    #[test]
    fn unreadable_store_degrades_to_miss_and_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PAGE_STORE_NAME);
        std::fs::write(&path, "not json at all").unwrap();
        let mut store = CacheStore::new(
            Box::new(JsonFileBackend::from_path(path)),
            Duration::from_secs(100),
        );
        assert_eq!(store.get_at("k", 10), None);
        // Write also absorbs the failure.
        store.set_at("k", "値".to_string(), 10);
        assert_eq!(store.get_at("k", 11), None);
    }

    #[test]
    fn missing_file_is_an_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CacheStore::new(
            Box::new(JsonFileBackend::at_dir(dir.path())),
            Duration::from_secs(100),
        );
        assert_eq!(store.get_at("anything", 10), None);
    }
}
