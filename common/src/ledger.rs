use std::{collections::HashMap, path::Path, sync::Arc, time::SystemTime};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    lock::Identity,
    store::{join_remote, ObjectStore, StoreError},
    DATETIME_FORMAT,
};

/// Ledger status values.
/// Not an enum because records written by other tools may carry values this
/// version does not know; those must survive a read-modify-write untouched.
pub mod status {
    pub const SUCCESS: &str = "success";
    pub const UPLOADING: &str = "uploading";
    pub const CANCELLED: &str = "cancelled";
    pub const UPDATING: &str = "updating";
}

const METADATA_SUFFIX: &str = ".metadata.json";

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct MetaEvent {
    pub sequence_id: u64,
    pub datetime: String,
    pub timestamp: i64,
    pub hash: String,
    pub size_bytes: u64,
    pub uploader: String,
    pub hostname: String,
    pub platform: String,
    pub tool_version: String,
    pub upload_duration_sec: f64,
    pub status: String,
}

impl MetaEvent {
    /// Describes the local file as it stands now. `sequence_id` is assigned
    /// when the event is appended.
    pub fn new(
        hash: String,
        size_bytes: u64,
        modified: SystemTime,
        identity: &Identity,
        status: &str,
        upload_duration_sec: f64,
    ) -> Self {
        let modified: DateTime<Utc> = modified.into();
        Self {
            sequence_id: 0,
            datetime: modified.format(DATETIME_FORMAT).to_string(),
            timestamp: modified.timestamp(),
            hash,
            size_bytes,
            uploader: identity.owner.clone(),
            hostname: identity.host.clone(),
            platform: std::env::consts::OS.to_string(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            upload_duration_sec,
            status: status.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct MetadataRecord {
    pub file_id: String,
    pub hash: String,
    pub timestamp: i64,
    pub size_bytes: u64,
    pub uploader: String,
    pub hostname: String,
    pub platform: String,
    pub tool_version: String,
    pub upload_duration_sec: f64,
    pub datetime: String,
    pub status: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<MetaEvent>,
}

impl MetadataRecord {
    pub fn empty(file_id: &str) -> Self {
        Self {
            file_id: file_id.to_string(),
            ..Default::default()
        }
    }

    pub fn apply(&mut self, event: &MetaEvent) {
        self.hash = event.hash.clone();
        self.timestamp = event.timestamp;
        self.size_bytes = event.size_bytes;
        self.uploader = event.uploader.clone();
        self.hostname = event.hostname.clone();
        self.platform = event.platform.clone();
        self.tool_version = event.tool_version.clone();
        self.upload_duration_sec = event.upload_duration_sec;
        self.datetime = event.datetime.clone();
        self.status = event.status.clone();
    }

    pub fn head(&self) -> MetaEvent {
        MetaEvent {
            sequence_id: self.last_sequence(),
            datetime: self.datetime.clone(),
            timestamp: self.timestamp,
            hash: self.hash.clone(),
            size_bytes: self.size_bytes,
            uploader: self.uploader.clone(),
            hostname: self.hostname.clone(),
            platform: self.platform.clone(),
            tool_version: self.tool_version.clone(),
            upload_duration_sec: self.upload_duration_sec,
            status: self.status.clone(),
        }
    }

    pub fn last_sequence(&self) -> u64 {
        self.events.iter().map(|e| e.sequence_id).max().unwrap_or(0)
    }

    pub fn without_events(&self) -> Self {
        Self {
            events: Vec::new(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("could not encode metadata: {0}")]
    Encode(#[from] serde_json::Error),
}

pub fn file_id(database: &str) -> &str {
    database.strip_suffix(".db").unwrap_or(database)
}

pub fn metadata_file_name(database: &str) -> String {
    format!("{}{METADATA_SUFFIX}", file_id(database))
}

pub(crate) fn decode(source: &str, data: &[u8]) -> Option<MetadataRecord> {
    match serde_json::from_slice(data) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!("ignoring malformed metadata {source}: {e}");
            None
        }
    }
}

pub struct Ledger {
    store: Arc<dyn ObjectStore>,
    version_dir: String,
}

impl Ledger {
    pub fn new(store: Arc<dyn ObjectStore>, version_dir: impl Into<String>) -> Self {
        Self {
            store,
            version_dir: version_dir.into(),
        }
    }

    fn object_path(&self, database: &str) -> String {
        join_remote(&self.version_dir, &metadata_file_name(database))
    }

    pub async fn read(&self, database: &str) -> Result<Option<MetadataRecord>, LedgerError> {
        let path = self.object_path(database);
        Ok(self
            .store
            .read(&path)
            .await?
            .and_then(|data| decode(&path, &data)))
    }

    pub async fn read_all(&self) -> Result<HashMap<String, MetadataRecord>, LedgerError> {
        let names = match self.store.list(&self.version_dir).await {
            Ok(names) => names,
            Err(StoreError::DirNotFound(_)) => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };
        let reads = names
            .iter()
            .filter_map(|name| name.strip_suffix(METADATA_SUFFIX).map(|id| (id, name)))
            .map(|(id, name)| async move {
                let path = join_remote(&self.version_dir, name);
                match self.store.read(&path).await {
                    Ok(Some(data)) => decode(&path, &data).map(|r| (id.to_string(), r)),
                    Ok(None) => None,
                    Err(e) => {
                        warn!("could not read {path}: {e}");
                        None
                    }
                }
            });
        Ok(join_all(reads).await.into_iter().flatten().collect())
    }

    pub async fn write(&self, database: &str, record: &MetadataRecord) -> Result<(), LedgerError> {
        let data = serde_json::to_vec_pretty(record)?;
        self.store.write(&self.object_path(database), &data).await?;
        debug!("wrote metadata for {database} ({})", record.status);
        Ok(())
    }

    /// Appends `event` with the next sequence number and makes it the
    /// top-level state.
    pub async fn append_event(
        &self,
        database: &str,
        mut event: MetaEvent,
    ) -> Result<MetadataRecord, LedgerError> {
        let mut record = self
            .read(database)
            .await?
            .unwrap_or_else(|| MetadataRecord::empty(file_id(database)));
        record.file_id = file_id(database).to_string();
        event.sequence_id = record.last_sequence() + 1;
        record.apply(&event);
        record.events.push(event);
        self.write(database, &record).await?;
        info!(
            "recorded {} event #{} for {database}",
            record.status,
            record.last_sequence()
        );
        Ok(record)
    }

    /// Marks an upload as started by rewriting the top-level status only.
    /// `event` describes the new content and seeds a record that does not
    /// exist yet; an existing record keeps its last completed hash.
    ///
    /// A crash before a terminal event leaves the record in this state.
    pub async fn mark_in_progress(
        &self,
        database: &str,
        event: &MetaEvent,
    ) -> Result<MetadataRecord, LedgerError> {
        let mut record = match self.read(database).await? {
            Some(record) => record,
            None => {
                let mut record = MetadataRecord::empty(file_id(database));
                record.apply(event);
                record
            }
        };
        record.file_id = file_id(database).to_string();
        record.status = status::UPLOADING.to_string();
        self.write(database, &record).await?;
        Ok(record)
    }
}

pub(crate) async fn describe_file(
    path: &Path,
    hash: String,
    identity: &Identity,
    status: &str,
    duration: f64,
) -> std::io::Result<MetaEvent> {
    let meta = tokio::fs::metadata(path).await?;
    Ok(MetaEvent::new(
        hash,
        meta.len(),
        meta.modified()?,
        identity,
        status,
        duration,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const VERSIONS: &str = "r:dbs/version/";

    fn setup() -> (Arc<MemoryStore>, Ledger) {
        let store = Arc::new(MemoryStore::new());
        let ledger = Ledger::new(store.clone(), VERSIONS);
        (store, ledger)
    }

    fn event(hash: &str, status: &str) -> MetaEvent {
        MetaEvent::new(
            hash.to_string(),
            42,
            SystemTime::UNIX_EPOCH,
            &Identity::new("alice", "laptop"),
            status,
            1.5,
        )
    }

    #[test]
    fn file_ids() {
        assert_eq!(file_id("mills.db"), "mills");
        assert_eq!(file_id("mills.v2.db"), "mills.v2");
        assert_eq!(file_id("notes"), "notes");
        assert_eq!(metadata_file_name("mills.db"), "mills.metadata.json");
    }

    #[test]
    fn event_fields() {
        let e = event("abc", status::SUCCESS);
        assert_eq!(e.datetime, "1970-01-01 00:00:00 UTC");
        assert_eq!(e.timestamp, 0);
        assert_eq!(e.uploader, "alice");
        assert_eq!(e.hostname, "laptop");
    }

    #[tokio::test]
    async fn missing_record_is_none() {
        let (_store, ledger) = setup();
        assert_eq!(ledger.read("mills.db").await.unwrap(), None);
        assert!(ledger.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sequence_is_strictly_increasing() {
        let (_store, ledger) = setup();
        let statuses = [
            status::SUCCESS,
            status::CANCELLED,
            status::UPDATING,
            status::SUCCESS,
        ];
        for (i, s) in statuses.iter().enumerate() {
            let e = event(&format!("h{i}"), s);
            let record = ledger.append_event("mills.db", e.clone()).await.unwrap();
            let last = record.events.last().unwrap();
            assert_eq!(last.sequence_id, i as u64 + 1);
            assert_eq!(record.head(), *last);
        }
        let record = ledger.read("mills.db").await.unwrap().unwrap();
        assert_eq!(record.file_id, "mills");
        assert!(record
            .events
            .windows(2)
            .all(|w| w[0].sequence_id < w[1].sequence_id));
        assert_eq!(record.hash, "h3");
    }

    #[tokio::test]
    async fn in_progress_marker_adds_no_event() {
        let (_store, ledger) = setup();
        ledger
            .mark_in_progress("mills.db", &event("new", status::UPLOADING))
            .await
            .unwrap();
        let record = ledger.read("mills.db").await.unwrap().unwrap();
        assert_eq!(record.status, status::UPLOADING);
        assert!(record.events.is_empty());

        let record = ledger
            .append_event("mills.db", event("new", status::SUCCESS))
            .await
            .unwrap();
        assert_eq!(record.events.len(), 1);
        assert_eq!(record.status, status::SUCCESS);
    }

    #[tokio::test]
    async fn malformed_records_are_skipped() {
        let (store, ledger) = setup();
        store.insert("r:dbs/version/broken.metadata.json", "{not json");
        store.insert("r:dbs/version/stray.txt", "hello");
        ledger
            .append_event("mills.db", event("abc", status::SUCCESS))
            .await
            .unwrap();
        let all = ledger.read_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["mills"].hash, "abc");
        assert_eq!(ledger.read("broken.db").await.unwrap(), None);
    }

    #[test]
    fn unknown_fields_and_statuses_survive() {
        let json = r#"{"file_id":"x","hash":"h","status":"archived","extra":1}"#;
        let record: MetadataRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.status, "archived");
        assert!(record.events.is_empty());
        let out = serde_json::to_value(record.without_events()).unwrap();
        assert!(out.get("events").is_none());
    }
}
