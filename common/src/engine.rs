use std::{
    cmp::Reverse,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::debug;
use tokio::fs;

use crate::{
    anchor::AnchorStore,
    config::Config,
    hash::HashCache,
    ledger::Ledger,
    lock::{Identity, LockCoordinator},
    notify::Notifier,
    store::{join_remote, ObjectStore, StoreError, StoreResult},
};

pub struct SyncEngine {
    pub store: Arc<dyn ObjectStore>,
    pub locks: LockCoordinator,
    pub ledger: Ledger,
    pub anchors: AnchorStore,
    pub hashes: HashCache,
    pub notifier: Notifier,
    pub identity: Identity,
    db_dir: PathBuf,
    remote_root: String,
    state_dir: PathBuf,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn ObjectStore>, config: &Config) -> Self {
        Self {
            locks: LockCoordinator::new(store.clone(), config.lock_dir()),
            ledger: Ledger::new(store.clone(), config.version_dir()),
            anchors: AnchorStore::new(config.anchor_dir()),
            hashes: HashCache::load(config.hash_cache_path()),
            store,
            notifier: Notifier::new(config.webhook_url.clone()),
            identity: config.identity.clone(),
            db_dir: config.db_dir.clone(),
            remote_root: config.remote_root.clone(),
            state_dir: config.state_dir(),
        }
    }

    pub fn db_dir(&self) -> &Path {
        &self.db_dir
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn remote_root(&self) -> &str {
        &self.remote_root
    }

    pub fn local_path(&self, database: &str) -> PathBuf {
        self.db_dir.join(database)
    }

    pub fn remote_path(&self, database: &str) -> String {
        join_remote(&self.remote_root, database)
    }

    pub async fn local_databases(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(&self.db_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("database directory {} does not exist", self.db_dir.display());
                return Ok(names);
            }
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".db") {
                continue;
            }
            // Broken entries still count; their status reports the stat failure.
            match entry.file_type().await {
                Ok(t) if t.is_dir() => continue,
                _ => names.push(name),
            }
        }
        Ok(names)
    }

    pub async fn remote_databases(&self) -> StoreResult<Vec<String>> {
        match self.store.list_files(&self.remote_root, "*.db").await {
            Ok(names) => Ok(names),
            Err(StoreError::DirNotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

fn versioned(name: &str) -> Option<(&str, u64)> {
    name.rmatch_indices("-v").find_map(|(i, _)| {
        let after = &name[i + 2..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            return None;
        }
        let rest = &after[digits..];
        if !rest.is_empty() && !rest.starts_with('.') {
            return None;
        }
        Some((&name[..i], after[..digits].parse().unwrap_or(0)))
    })
}

/// Sorts by name, keeping `<base>-v<N>` databases together with the newest
/// version first.
pub fn sort_databases<T>(items: &mut [T], name: impl Fn(&T) -> &str) {
    items.sort_by(|a, b| {
        let key = |n: &str| -> (String, Reverse<u64>, String) {
            match versioned(n) {
                Some((base, v)) => (base.to_string(), Reverse(v), n.to_string()),
                None => (n.to_string(), Reverse(0), n.to_string()),
            }
        };
        key(name(a)).cmp(&key(name(b)))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::test_config, store::MemoryStore};

    #[test]
    fn version_suffix() {
        assert_eq!(versioned("mills-v3.db"), Some(("mills", 3)));
        assert_eq!(versioned("a-v-b-v12"), Some(("a-v-b", 12)));
        assert_eq!(versioned("mills.db"), None);
        assert_eq!(versioned("mills-vx.db"), None);
        assert_eq!(versioned("mills-v2x.db"), None);
    }

    #[test]
    fn versions_sort_newest_first() {
        let mut names = vec![
            "zeta.db".to_string(),
            "mills-v1.db".to_string(),
            "mills-v10.db".to_string(),
            "alpha.db".to_string(),
            "mills-v2.db".to_string(),
        ];
        sort_databases(&mut names, |s| s.as_str());
        assert_eq!(
            names,
            ["alpha.db", "mills-v10.db", "mills-v2.db", "mills-v1.db", "zeta.db"]
        );
    }

    #[tokio::test]
    async fn discovers_databases() {
        let dir = tempfile::tempdir().unwrap();
        let db_dir = dir.path().join("db");
        let store = Arc::new(MemoryStore::new());
        let config = test_config(dir.path(), &Identity::new("alice", "laptop"));
        let engine = SyncEngine::new(store.clone(), &config);
        assert!(engine.local_databases().await.unwrap().is_empty());
        assert!(engine.remote_databases().await.unwrap().is_empty());

        std::fs::create_dir_all(db_dir.join("nested.db")).unwrap();
        std::fs::write(db_dir.join("a.db"), b"a").unwrap();
        std::fs::write(db_dir.join("notes.txt"), b"n").unwrap();
        store.insert("r:dbs/b.db", "b");
        store.insert("r:dbs/lock/b.db.bob.desk.lock", "");

        assert_eq!(engine.local_databases().await.unwrap(), ["a.db"]);
        assert_eq!(engine.remote_databases().await.unwrap(), ["b.db"]);
        assert_eq!(engine.remote_path("b.db"), "r:dbs/b.db");
        assert_eq!(engine.local_path("a.db"), db_dir.join("a.db"));
    }
}
