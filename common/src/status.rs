//! Status resolution: one user-facing status per database per refresh.
//!
//! [`resolve`] is a pure function of the gathered inputs. [`SyncEngine::refresh`]
//! gathers those inputs for every known database; nothing is cached between
//! refreshes except local file hashes.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt, io,
    path::Path,
    time::SystemTime,
};

use log::{debug, info, warn};
use serde::Serialize;
use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::{
    engine::{sort_databases, SyncEngine},
    ledger::{file_id, status as ledger_status, MetadataRecord},
    lock::{Identity, LockRecord},
    sync::SyncError,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseStatus {
    UpToDate,
    LocalNewer,
    RemoteNewer,
    NewLocal,
    RemoteOnly,
    LockedByYou,
    LockedByOther,
    Uploading,
    UploadCancelled,
    StaleMeta,
    NoMetadata,
    ErrorReadLocal,
    ErrorStatLocal,
    Unknown,
}

impl DatabaseStatus {
    pub fn code(self) -> &'static str {
        match self {
            Self::UpToDate => "up_to_date",
            Self::LocalNewer => "local_newer",
            Self::RemoteNewer => "remote_newer",
            Self::NewLocal => "new_local",
            Self::RemoteOnly => "remote_only",
            Self::LockedByYou => "locked_by_you",
            Self::LockedByOther => "locked_by_other",
            Self::Uploading => "uploading",
            Self::UploadCancelled => "upload_cancelled",
            Self::StaleMeta => "stale_meta",
            Self::NoMetadata => "no_metadata",
            Self::ErrorReadLocal => "error_read_local",
            Self::ErrorStatLocal => "error_stat_local",
            Self::Unknown => "unknown",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::UpToDate => "Up to date",
            Self::LocalNewer => "Ready to upload",
            Self::RemoteNewer => "Remote is newer",
            Self::NewLocal => "New local database",
            Self::RemoteOnly => "Remote only",
            Self::LockedByYou => "Locked by you",
            Self::LockedByOther => "Locked by another user",
            Self::Uploading => "Uploading",
            Self::UploadCancelled => "Upload cancelled",
            Self::StaleMeta => "Possibly incomplete upload",
            Self::NoMetadata => "No metadata",
            Self::ErrorReadLocal => "Cannot read local file",
            Self::ErrorStatLocal => "Cannot stat local file",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for DatabaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocalFile {
    Missing,
    StatFailed(String),
    ReadFailed(String),
    Present {
        modified: SystemTime,
        hash: Option<String>,
    },
}

impl LocalFile {
    pub fn exists(&self) -> bool {
        !matches!(self, Self::Missing)
    }

    pub fn modified(&self) -> Option<SystemTime> {
        match self {
            Self::Present { modified, .. } => Some(*modified),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct StatusInputs<'a> {
    pub identity: &'a Identity,
    pub local: &'a LocalFile,
    pub remote_exists: bool,
    pub lock: Option<&'a LockRecord>,
    pub active: bool,
    pub ledger: Option<&'a MetadataRecord>,
    pub anchor: Option<&'a MetadataRecord>,
}

enum Step {
    Done(DatabaseStatus),
    CompareContent,
}

fn precheck(inputs: &StatusInputs) -> Step {
    use DatabaseStatus::*;

    if let Some(lock) = inputs.lock.filter(|l| l.is_blocking()) {
        if !lock.is_held_by(inputs.identity) {
            return Step::Done(LockedByOther);
        }
        if inputs.active {
            return Step::Done(Uploading);
        }
        let stuck = inputs
            .ledger
            .is_some_and(|l| l.status == ledger_status::UPLOADING);
        return Step::Done(if stuck { StaleMeta } else { LockedByYou });
    }

    match inputs.local {
        LocalFile::StatFailed(_) => return Step::Done(ErrorStatLocal),
        LocalFile::ReadFailed(_) => return Step::Done(ErrorReadLocal),
        _ => {}
    }

    match (inputs.local.exists(), inputs.remote_exists) {
        (true, false) => return Step::Done(NewLocal),
        (false, true) => return Step::Done(RemoteOnly),
        (false, false) => return Step::Done(Unknown),
        (true, true) => {}
    }

    let Some(ledger) = inputs.ledger else {
        return Step::Done(NoMetadata);
    };
    match ledger.status.as_str() {
        ledger_status::UPLOADING => Step::Done(StaleMeta),
        ledger_status::CANCELLED => Step::Done(UploadCancelled),
        _ => Step::CompareContent,
    }
}

pub fn needs_content(inputs: &StatusInputs) -> bool {
    matches!(precheck(inputs), Step::CompareContent)
}

/// Resolves the status of one database. Rules apply in order:
///
/// 1. A `lock` held by anyone else (including the same user on another host)
///    is `locked_by_other`; our own is `uploading` while an operation runs,
///    `stale_meta` if the ledger is stuck at uploading, else `locked_by_you`.
/// 2. Local stat and read failures.
/// 3. Existence: `new_local`, `remote_only`.
/// 4. Ledger: missing is `no_metadata`, stuck uploading is `stale_meta`, a
///    cancelled last attempt is `upload_cancelled`.
/// 5. Content: the anchor tells a remote change from a local one.
pub fn resolve(inputs: &StatusInputs) -> DatabaseStatus {
    match precheck(inputs) {
        Step::Done(status) => status,
        Step::CompareContent => compare_content(inputs),
    }
}

fn compare_content(inputs: &StatusInputs) -> DatabaseStatus {
    let (Some(ledger), LocalFile::Present { hash: Some(local_hash), .. }) =
        (inputs.ledger, inputs.local)
    else {
        return DatabaseStatus::Unknown;
    };
    if let Some(anchor) = inputs.anchor {
        if anchor.hash != ledger.hash {
            return DatabaseStatus::RemoteNewer;
        }
    }
    if *local_hash == ledger.hash {
        DatabaseStatus::UpToDate
    } else if inputs.anchor.is_none() {
        DatabaseStatus::RemoteNewer
    } else {
        DatabaseStatus::LocalNewer
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalDatabase {
    pub name: String,
    pub local_exists: bool,
    pub remote_exists: bool,
    pub local_modified: Option<SystemTime>,
}

#[derive(Clone, Debug)]
pub struct DatabaseStatusInfo {
    pub database: LocalDatabase,
    pub status: DatabaseStatus,
    pub lock: Option<LockRecord>,
    pub ledger_status: Option<String>,
    pub detail: String,
}

impl DatabaseStatusInfo {
    pub fn name(&self) -> &str {
        &self.database.name
    }
}

fn detail(status: DatabaseStatus, lock: Option<&LockRecord>, ledger: Option<&MetadataRecord>) -> String {
    let ledger_state = ledger.map(|l| l.status.as_str());
    match (status, lock) {
        (DatabaseStatus::LockedByOther, Some(lock)) => match ledger_state {
            Some(ledger_status::UPLOADING) => format!("{} is uploading", lock.host),
            Some(ledger_status::UPDATING) => format!("{} is updating", lock.host),
            _ => format!("locked by {}@{}", lock.owner, lock.host),
        },
        (DatabaseStatus::LockedByYou, _) if ledger_state == Some(ledger_status::UPDATING) => {
            "you are updating".to_string()
        }
        (DatabaseStatus::StaleMeta, _) => match ledger {
            Some(l) => format!("upload by {}@{} never finished", l.uploader, l.hostname),
            None => status.label().to_string(),
        },
        _ => status.label().to_string(),
    }
}

async fn stat_local(path: &Path) -> LocalFile {
    match tokio::fs::metadata(path).await {
        Ok(meta) => match meta.modified() {
            Ok(modified) => LocalFile::Present {
                modified,
                hash: None,
            },
            Err(e) => LocalFile::StatFailed(e.to_string()),
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => LocalFile::Missing,
        Err(e) => LocalFile::StatFailed(e.to_string()),
    }
}

struct Gathered<'a> {
    name: &'a str,
    local: LocalFile,
    remote_exists: bool,
    lock: Option<&'a LockRecord>,
    active: bool,
    ledger: Option<&'a MetadataRecord>,
    anchor: Option<&'a MetadataRecord>,
}

impl SyncEngine {
    fn inputs<'a>(&'a self, g: &'a Gathered<'_>) -> StatusInputs<'a> {
        StatusInputs {
            identity: &self.identity,
            local: &g.local,
            remote_exists: g.remote_exists,
            lock: g.lock,
            active: g.active,
            ledger: g.ledger,
            anchor: g.anchor,
        }
    }

    async fn evaluate(&self, mut g: Gathered<'_>) -> DatabaseStatusInfo {
        if needs_content(&self.inputs(&g)) {
            if let LocalFile::Present { modified, .. } = g.local {
                g.local = match self.hashes.hash(&self.local_path(g.name)).await {
                    Ok(hash) => LocalFile::Present {
                        modified,
                        hash: Some(hash),
                    },
                    Err(e) => {
                        warn!("could not hash {}: {e}", g.name);
                        LocalFile::ReadFailed(e.to_string())
                    }
                };
            }
        }
        let status = resolve(&self.inputs(&g));

        if status == DatabaseStatus::UpToDate && g.anchor.is_none() {
            if let Some(ledger) = g.ledger {
                info!("recreating missing anchor for {}", g.name);
                if let Err(e) = self.anchors.write(g.name, ledger).await {
                    warn!("could not recreate anchor for {}: {e}", g.name);
                }
            }
        }
        debug!("{} -> {status}", g.name);

        DatabaseStatusInfo {
            database: LocalDatabase {
                name: g.name.to_string(),
                local_exists: g.local.exists(),
                remote_exists: g.remote_exists,
                local_modified: g.local.modified(),
            },
            status,
            lock: g.lock.cloned(),
            ledger_status: g.ledger.map(|l| l.status.clone()),
            detail: detail(status, g.lock, g.ledger),
        }
    }

    /// Resolves every database known locally or remotely.
    ///
    /// `active` names the databases with an operation running in this process.
    /// Cancelling `cancel` abandons the sweep.
    pub async fn refresh(
        &self,
        active: &HashSet<String>,
        cancel: &CancellationToken,
    ) -> Result<Vec<DatabaseStatusInfo>, SyncError> {
        let gather = async {
            tokio::join!(
                self.local_databases(),
                self.remote_databases(),
                self.locks.fetch_locks(),
                self.ledger.read_all(),
                self.anchors.read_all(),
            )
        };
        let (local, remote, locks, ledgers, anchors) = select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            gathered = gather => gathered,
        };
        let local = local.map_err(|source| SyncError::Local {
            path: self.db_dir().to_path_buf(),
            source,
        })?;
        let remote: HashSet<String> = remote?.into_iter().collect();
        let ledgers: HashMap<String, MetadataRecord> = ledgers?;
        let local_names: HashSet<&String> = local.iter().collect();
        let names: BTreeSet<&String> = local.iter().chain(remote.iter()).collect();

        let mut infos = Vec::with_capacity(names.len());
        for name in names {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let local_file = if local_names.contains(name) {
                stat_local(&self.local_path(name)).await
            } else {
                LocalFile::Missing
            };
            let id = file_id(name);
            infos.push(
                self.evaluate(Gathered {
                    name,
                    local: local_file,
                    remote_exists: remote.contains(name),
                    lock: locks.get(name),
                    active: active.contains(name),
                    ledger: ledgers.get(id),
                    anchor: anchors.get(id),
                })
                .await,
            );
        }
        if let Err(e) = self.hashes.save().await {
            warn!("could not save hash cache: {e}");
        }
        sort_databases(&mut infos, DatabaseStatusInfo::name);
        Ok(infos)
    }

    pub async fn status_of(
        &self,
        database: &str,
        active: bool,
        cancel: &CancellationToken,
    ) -> Result<DatabaseStatusInfo, SyncError> {
        let local_path = self.local_path(database);
        let gather = async {
            tokio::join!(
                stat_local(&local_path),
                self.store.list_files(self.remote_root(), database),
                self.locks.fetch_locks(),
                self.ledger.read(database),
                self.anchors.read(database),
            )
        };
        let (local, remote, locks, ledger, anchor) = select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            gathered = gather => gathered,
        };
        let remote_exists = match remote {
            Ok(names) => names.iter().any(|n| n == database),
            Err(crate::store::StoreError::DirNotFound(_)) => false,
            Err(e) => return Err(e.into()),
        };
        let ledger = ledger?;
        let info = self
            .evaluate(Gathered {
                name: database,
                local,
                remote_exists,
                lock: locks.get(database),
                active,
                ledger: ledger.as_ref(),
                anchor: anchor.as_ref(),
            })
            .await;
        if let Err(e) = self.hashes.save().await {
            warn!("could not save hash cache: {e}");
        }
        Ok(info)
    }
}
