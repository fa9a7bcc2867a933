use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::envelope::now_secs;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// On-disk layout of a cache file
#[derive(Debug, Serialize, Deserialize)]
struct CacheFile<T> {
    timestamp: i64,
    data: T,
}

/// A value read back from a cache file
#[derive(Debug, Clone)]
pub struct Cached<T> {
    pub data: T,
    pub age_secs: u64,
    pub fresh: bool,
}

/// Whole-file JSON cache with a TTL.
///
/// Every `store` overwrites the file; readers see either the previous or the
/// new document, never a partial one.
pub struct JsonCache<T> {
    path: PathBuf,
    ttl_secs: u64,
    write_lock: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCache<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>, ttl_secs: u64) -> Self {
        Self {
            path: path.into(),
            ttl_secs,
            write_lock: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Read the cache regardless of age. Missing or corrupt files yield `None`.
    pub async fn load(&self) -> Option<Cached<T>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read cache");
                return None;
            }
        };

        let file: CacheFile<T> = match serde_json::from_str(&raw) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring corrupt cache");
                return None;
            }
        };

        let age_secs = (now_secs() - file.timestamp).max(0) as u64;
        Some(Cached {
            data: file.data,
            age_secs,
            fresh: age_secs < self.ttl_secs,
        })
    }

    /// Read the cache only if it is younger than the TTL
    pub async fn load_fresh(&self) -> Option<T> {
        self.load().await.filter(|c| c.fresh).map(|c| c.data)
    }

    /// Overwrite the cache with `data`, stamped with the current time
    pub async fn store(&self, data: &T) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock().await;

        let body = serde_json::to_string_pretty(&CacheFile {
            timestamp: now_secs(),
            data,
        })?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| CacheError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|source| CacheError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| CacheError::Io {
                path: self.path.clone(),
                source,
            })?;

        debug!(path = %self.path.display(), "cache written");
        Ok(())
    }
}
