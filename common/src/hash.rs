use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::spawn_blocking;

use crate::hash_file;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
struct CachedHash {
    hash: String,
    mod_time: u64,
    size: u64,
}

/// Persisted at `<state dir>/hash.json`.
pub struct HashCache {
    path: PathBuf,
    entries: Mutex<HashMap<PathBuf, CachedHash>>,
}

fn mod_time_nanos(modified: SystemTime) -> u64 {
    modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

impl HashCache {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(data) => match serde_json::from_slice::<HashMap<PathBuf, CachedHash>>(&data) {
                Ok(entries) => {
                    info!("loaded {} cached hashes", entries.len());
                    entries
                }
                Err(e) => {
                    warn!("discarding unreadable hash cache {}: {e}", path.display());
                    HashMap::new()
                }
            },
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("could not read hash cache {}: {e}", path.display());
                }
                HashMap::new()
            }
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, CachedHash>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn hash(&self, path: &Path) -> io::Result<String> {
        let meta = tokio::fs::metadata(path).await?;
        let mod_time = mod_time_nanos(meta.modified()?);
        let size = meta.len();
        if let Some(cached) = self.entries().get(path) {
            if cached.mod_time == mod_time && cached.size == size {
                return Ok(cached.hash.clone());
            }
        }

        debug!("hashing {}", path.display());
        let owned = path.to_path_buf();
        let hash = spawn_blocking(move || hash_file(fs::File::open(owned)?))
            .await
            .map_err(io::Error::other)??;
        self.entries().insert(
            path.to_path_buf(),
            CachedHash {
                hash: hash.clone(),
                mod_time,
                size,
            },
        );
        Ok(hash)
    }

    pub async fn save(&self) -> io::Result<()> {
        let data = {
            let mut entries = self.entries();
            let before = entries.len();
            entries.retain(|path, _| path.exists());
            if entries.len() != before {
                debug!("pruned {} hash cache entries", before - entries.len());
            }
            serde_json::to_vec_pretty(&*entries)?
        };
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, data).await
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[tokio::test]
    async fn hashes_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("empty.db");
        std::fs::write(&db, b"").unwrap();

        let cache = HashCache::load(dir.path().join("state/hash.json"));
        assert!(cache.is_empty());
        assert_eq!(cache.hash(&db).await.unwrap(), EMPTY_SHA256);
        assert_eq!(cache.len(), 1);

        cache.save().await.unwrap();
        let reloaded = HashCache::load(dir.path().join("state/hash.json"));
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.hash(&db).await.unwrap(), EMPTY_SHA256);
    }

    #[tokio::test]
    async fn changed_size_is_rehashed() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("a.db");
        std::fs::write(&db, b"").unwrap();
        let cache = HashCache::load(dir.path().join("hash.json"));
        assert_eq!(cache.hash(&db).await.unwrap(), EMPTY_SHA256);
        std::fs::write(&db, b"changed").unwrap();
        assert_ne!(cache.hash(&db).await.unwrap(), EMPTY_SHA256);
    }

    #[tokio::test]
    async fn save_prunes_vanished_files() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("gone.db");
        std::fs::write(&db, b"x").unwrap();
        let cache = HashCache::load(dir.path().join("hash.json"));
        cache.hash(&db).await.unwrap();
        std::fs::remove_file(&db).unwrap();
        cache.save().await.unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn corrupt_cache_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hash.json");
        std::fs::write(&path, "nope").unwrap();
        assert!(HashCache::load(path).is_empty());
    }
}
