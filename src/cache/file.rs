// src/cache/file.rs
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::fs;
use tracing::{info, warn};

use super::{CacheBackend, CacheSnapshot, ResultCache, CACHE_FORMAT_VERSION, DEFAULT_TTL_DAYS};
use crate::error::{PipelineError, Result};

pub const ENV_CACHE_PATH: &str = "CENSUS_TRACT_CACHE_PATH";
pub const DEFAULT_CACHE_PATH: &str = "cache/geocode_cache.json";

/// Local JSON file. Written via tmp file + rename so an interrupted flush
/// never leaves a truncated cache behind.
pub struct JsonFileBackend {
    path: PathBuf,
    ttl: Duration,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ttl: Duration::days(DEFAULT_TTL_DAYS),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist_err(&self, e: impl std::fmt::Display) -> PipelineError {
        PipelineError::CachePersist {
            path: self.path.clone(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl CacheBackend for JsonFileBackend {
    async fn load(&self) -> Result<ResultCache> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    target: "cache",
                    path = %self.path.display(),
                    "couldn't find an existing cache file; creating new cache"
                );
                return Ok(ResultCache::with_ttl(self.ttl));
            }
            Err(e) => return Err(self.persist_err(e)),
        };

        let snapshot: CacheSnapshot = match serde_json::from_str(&raw) {
            Ok(s) => s,
            Err(e) => {
                warn!(target: "cache", path = %self.path.display(), error = %e, "unreadable cache file; starting empty");
                return Ok(ResultCache::with_ttl(self.ttl));
            }
        };
        if snapshot.version != CACHE_FORMAT_VERSION {
            warn!(
                target: "cache",
                found = snapshot.version,
                expected = CACHE_FORMAT_VERSION,
                "cache format version mismatch; starting empty"
            );
            return Ok(ResultCache::with_ttl(self.ttl));
        }

        let cache = ResultCache::from_snapshot(snapshot, self.ttl);
        info!(target: "cache", entries = cache.len(), path = %self.path.display(), "cache loaded");
        Ok(cache)
    }

    async fn flush(&self, cache: &ResultCache) -> Result<()> {
        let snapshot = cache.snapshot(Utc::now());
        let json = serde_json::to_vec(&snapshot).map_err(|e| self.persist_err(e))?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| self.persist_err(e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &json)
            .await
            .map_err(|e| self.persist_err(e))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.persist_err(e))?;

        info!(
            target: "cache",
            entries = snapshot.entries.len(),
            path = %self.path.display(),
            "cache flushed"
        );
        Ok(())
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geocode::{GeocodeMatch, GeocodeResult};

    #[tokio::test]
    async fn missing_file_loads_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonFileBackend::new(dir.path().join("nope.json"));
        let c = backend.load().await.unwrap();
        assert!(c.is_empty());
    }

    #[tokio::test]
    async fn flush_then_load_keeps_negative_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.json");
        let backend = JsonFileBackend::new(&path);

        let mut c = backend.load().await.unwrap();
        c.put("miss", GeocodeResult::Unresolved);
        c.put("hit", GeocodeResult::Resolved(GeocodeMatch::at(47.6, -122.3)));
        backend.flush(&c).await.unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let again = backend.load().await.unwrap();
        assert_eq!(again.get("miss"), Some(&GeocodeResult::Unresolved));
        assert_eq!(again.get("hit").and_then(|r| r.coordinate()), Some((47.6, -122.3)));
    }

    #[tokio::test]
    async fn corrupt_or_foreign_version_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(JsonFileBackend::new(&path).load().await.unwrap().is_empty());

        std::fs::write(&path, r#"{"version": 99, "entries": {}}"#).unwrap();
        assert!(JsonFileBackend::new(&path).load().await.unwrap().is_empty());
    }
}
