//! Lock objects: claims on a database encoded entirely in an object name.
//!
//! A lock object lives under the lock prefix as
//! `<database>.<owner>.<host>.<kind>`. Its body is free text for humans and is
//! never parsed. Acquiring is check-then-act: two hosts can both observe an
//! unlocked database and both write a lock. The ledger records both attempts.

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc, time::Duration};

use chrono::Utc;
use log::{debug, info, warn};
use thiserror::Error;

use crate::store::{join_remote, ObjectStore, StoreError};

/// Advisory lifetime of a lock. Nothing enforces it; it is only written into
/// the lock body.
pub const LOCK_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockKind {
    /// Provisional claim, shown but not blocking for status or downloads.
    Reserve,
    /// Exclusive claim held while a database is being written.
    Lock,
}

impl LockKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reserve => "reserve",
            Self::Lock => "lock",
        }
    }
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reserve" => Ok(Self::Reserve),
            "lock" => Ok(Self::Lock),
            _ => Err(()),
        }
    }
}

/// Who is acting: a user name and the host they act from.
///
/// Both parts are stored without dots so that lock names can always be split
/// from the right.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity {
    pub owner: String,
    pub host: String,
}

impl Identity {
    pub fn new(owner: &str, host: &str) -> Self {
        Self {
            owner: sanitize(owner),
            host: sanitize(host),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.owner, self.host)
    }
}

fn sanitize(part: &str) -> String {
    let cleaned: String = part
        .trim()
        .chars()
        .map(|c| match c {
            '.' | '/' | '\\' | '*' | '?' => '-',
            c if c.is_whitespace() => '-',
            c => c,
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockRecord {
    pub database: String,
    pub owner: String,
    pub host: String,
    pub kind: LockKind,
}

impl LockRecord {
    pub fn new(database: &str, identity: &Identity, kind: LockKind) -> Self {
        Self {
            database: database.to_string(),
            owner: identity.owner.clone(),
            host: identity.host.clone(),
            kind,
        }
    }

    pub fn object_name(&self) -> String {
        format!("{}.{}.{}.{}", self.database, self.owner, self.host, self.kind)
    }

    /// Decodes an object name. Anything with fewer than four segments or an
    /// unknown kind is not a lock.
    pub fn parse(name: &str) -> Option<Self> {
        let mut parts = name.rsplitn(4, '.');
        let kind = parts.next()?.parse().ok()?;
        let host = parts.next()?;
        let owner = parts.next()?;
        let database = parts.next()?;
        if database.is_empty() || owner.is_empty() || host.is_empty() {
            return None;
        }
        Some(Self {
            database: database.to_string(),
            owner: owner.to_string(),
            host: host.to_string(),
            kind,
        })
    }

    pub fn is_blocking(&self) -> bool {
        self.kind == LockKind::Lock
    }

    pub fn is_held_by(&self, identity: &Identity) -> bool {
        self.owner == identity.owner && self.host == identity.host
    }
}

impl fmt::Display for LockRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} by {}@{})", self.database, self.kind, self.owner, self.host)
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("{database} is already locked by {owner}@{host}")]
    AlreadyLocked {
        database: String,
        owner: String,
        host: String,
    },
    #[error("{database} is locked by {owner}, not by you")]
    NotOwner { database: String, owner: String },
    #[error("invalid database name `{0}`")]
    InvalidName(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub fn validate_db_name(name: &str) -> Result<(), LockError> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.ends_with('.')
        || name
            .chars()
            .any(|c| matches!(c, '/' | '\\' | '*' | '?' | '[' | ']') || c.is_control());
    if bad {
        Err(LockError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}

pub struct LockCoordinator {
    store: Arc<dyn ObjectStore>,
    lock_dir: String,
}

impl LockCoordinator {
    pub fn new(store: Arc<dyn ObjectStore>, lock_dir: impl Into<String>) -> Self {
        Self {
            store,
            lock_dir: lock_dir.into(),
        }
    }

    fn object_path(&self, record: &LockRecord) -> String {
        join_remote(&self.lock_dir, &record.object_name())
    }

    pub async fn fetch_all(&self) -> Vec<LockRecord> {
        let names = match self.store.list(&self.lock_dir).await {
            Ok(names) => names,
            Err(StoreError::DirNotFound(_)) => {
                debug!("lock directory {} does not exist yet", self.lock_dir);
                return Vec::new();
            }
            Err(e) => {
                warn!("could not list locks, assuming none: {e}");
                return Vec::new();
            }
        };
        names
            .iter()
            .filter_map(|name| {
                let record = LockRecord::parse(name);
                if record.is_none() {
                    debug!("ignoring malformed lock object {name}");
                }
                record
            })
            .collect()
    }

    pub async fn fetch_locks(&self) -> HashMap<String, LockRecord> {
        let mut locks: HashMap<String, LockRecord> = HashMap::new();
        for record in self.fetch_all().await {
            match locks.get(&record.database) {
                Some(existing) if existing.is_blocking() => {}
                _ => {
                    locks.insert(record.database.clone(), record);
                }
            }
        }
        locks
    }

    async fn records_for(&self, database: &str) -> Vec<LockRecord> {
        self.fetch_all()
            .await
            .into_iter()
            .filter(|r| r.database == database)
            .collect()
    }

    /// Claims `database` for `identity`.
    ///
    /// Fails with [`LockError::AlreadyLocked`] if another owner holds a record,
    /// unless `force` is set, in which case their records are removed first.
    pub async fn acquire(
        &self,
        database: &str,
        identity: &Identity,
        kind: LockKind,
        intent: &str,
        force: bool,
    ) -> Result<LockRecord, LockError> {
        validate_db_name(database)?;
        let existing = self.records_for(database).await;
        let (own, others): (Vec<_>, Vec<_>) = existing
            .into_iter()
            .partition(|r| r.owner == identity.owner);

        if let Some(other) = others.first() {
            if !force {
                return Err(LockError::AlreadyLocked {
                    database: database.to_string(),
                    owner: other.owner.clone(),
                    host: other.host.clone(),
                });
            }
            for record in &others {
                warn!("force-removing lock {record}");
                self.delete(record).await?;
            }
        }

        let record = LockRecord::new(database, identity, kind);
        let now = Utc::now();
        let expires = now + LOCK_TTL;
        let body = format!(
            "{intent}\nacquired {} by {identity}, advisory expiry {}\n",
            now.format(crate::DATETIME_FORMAT),
            expires.format(crate::DATETIME_FORMAT),
        );
        self.store
            .write(&self.object_path(&record), body.as_bytes())
            .await?;

        // The same owner on this host may still hold the other kind.
        for stale in own
            .iter()
            .filter(|r| r.host == identity.host && r.kind != kind)
        {
            if let Err(e) = self.delete(stale).await {
                warn!("could not remove superseded lock {stale}: {e}");
            }
        }
        info!("acquired {record}");
        Ok(record)
    }

    /// Releases the caller's records for `database`.
    ///
    /// With `force`, every record for the database goes regardless of owner.
    /// Returns the records that were deleted; nothing to delete is not an error.
    pub async fn release(
        &self,
        database: &str,
        owner: &str,
        force: bool,
    ) -> Result<Vec<LockRecord>, LockError> {
        let existing = self.records_for(database).await;
        if existing.is_empty() {
            debug!("no lock on {database} to release");
            return Ok(existing);
        }
        let targets: Vec<LockRecord> = if force {
            existing
        } else {
            let (own, others): (Vec<_>, Vec<_>) =
                existing.into_iter().partition(|r| r.owner == owner);
            if own.is_empty() {
                return Err(LockError::NotOwner {
                    database: database.to_string(),
                    owner: others[0].owner.clone(),
                });
            }
            own
        };
        for record in &targets {
            self.delete(record).await?;
            info!("released {record}");
        }
        Ok(targets)
    }

    async fn delete(&self, record: &LockRecord) -> Result<(), StoreError> {
        match self.store.delete_file(&self.object_path(record)).await {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
