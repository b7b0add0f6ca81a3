use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
};

use log::{debug, warn};
use tokio::fs;

use crate::ledger::{decode, file_id, metadata_file_name, MetadataRecord};

pub struct AnchorStore {
    dir: PathBuf,
}

impl AnchorStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, database: &str) -> PathBuf {
        self.dir.join(metadata_file_name(database))
    }

    pub async fn read(&self, database: &str) -> Option<MetadataRecord> {
        let path = self.path(database);
        match fs::read(&path).await {
            Ok(data) => decode(&path.display().to_string(), &data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("could not read anchor {}: {e}", path.display());
                None
            }
        }
    }

    /// Anchors keyed by file id.
    pub async fn read_all(&self) -> HashMap<String, MetadataRecord> {
        let mut anchors = HashMap::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("could not list anchors in {}: {e}", self.dir.display());
                }
                return anchors;
            }
        };
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("stopped listing anchors: {e}");
                    break;
                }
            };
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(id) = name.strip_suffix(".metadata.json") else {
                continue;
            };
            if let Ok(data) = fs::read(entry.path()).await {
                if let Some(record) = decode(&name, &data) {
                    anchors.insert(id.to_string(), record);
                }
            }
        }
        anchors
    }

    pub async fn write(&self, database: &str, record: &MetadataRecord) -> io::Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let mut anchor = record.without_events();
        anchor.file_id = file_id(database).to_string();
        let data = serde_json::to_vec_pretty(&anchor)?;
        let path = self.path(database);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &path).await?;
        debug!("anchored {database} at {}", anchor.hash);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{status, MetaEvent};

    fn record(hash: &str) -> MetadataRecord {
        let mut r = MetadataRecord::empty("ignored");
        r.hash = hash.to_string();
        r.status = status::SUCCESS.to_string();
        r.events.push(MetaEvent::default());
        r
    }

    #[tokio::test]
    async fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let anchors = AnchorStore::new(dir.path().join("local-version"));
        assert_eq!(anchors.read("mills.db").await, None);
        assert!(anchors.read_all().await.is_empty());

        anchors.write("mills.db", &record("abc")).await.unwrap();
        let anchor = anchors.read("mills.db").await.unwrap();
        assert_eq!(anchor.hash, "abc");
        assert_eq!(anchor.file_id, "mills");
        assert!(anchor.events.is_empty());
        assert!(dir.path().join("local-version/mills.metadata.json").exists());

        let all = anchors.read_all().await;
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("mills"));
    }

    #[tokio::test]
    async fn corrupt_anchor_reads_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mills.metadata.json"), "garbage").unwrap();
        let anchors = AnchorStore::new(dir.path());
        assert_eq!(anchors.read("mills.db").await, None);
        assert!(anchors.read_all().await.is_empty());
    }
}
