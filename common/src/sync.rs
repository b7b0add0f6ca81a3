use std::{
    io,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use log::{error, info, warn};
use thiserror::Error;
use tokio::{fs, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::{
    coordinator::{OperationContext, OperationKind, Outcome},
    engine::SyncEngine,
    ledger::{describe_file, status, LedgerError, MetadataRecord},
    lock::{validate_db_name, LockError, LockKind, LockRecord},
    progress::phase,
    status::{DatabaseStatus, DatabaseStatusInfo},
    store::{StoreError, TransferControl},
};

const UNLOCK_ATTEMPTS: u32 = 3;
const UNLOCK_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(StoreError),
    #[error("{}: {source}", path.display())]
    Local { path: PathBuf, source: io::Error },
    #[error("{0} does not exist locally")]
    MissingLocal(String),
    #[error("{0} does not exist on the remote")]
    MissingRemote(String),
    #[error("{0}")]
    Refused(String),
    #[error("declined")]
    Declined,
    #[error("cancelled")]
    Cancelled,
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Cancelled => Self::Cancelled,
            e => Self::Store(e),
        }
    }
}

pub fn outcome<T>(result: Result<T, SyncError>) -> Outcome {
    match result {
        Ok(_) => Outcome::Completed,
        Err(SyncError::Cancelled | SyncError::Declined) => Outcome::Cancelled,
        Err(e) => Outcome::Failed(e.to_string()),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Proceed,
    Confirm(String),
    Refuse(String),
}

pub fn validate_action(kind: OperationKind, info: &DatabaseStatusInfo) -> Verdict {
    use DatabaseStatus::*;
    let name = info.name();
    match kind {
        OperationKind::Upload => match info.status {
            RemoteNewer => Verdict::Refuse(format!(
                "the remote copy of {name} is newer; download it first"
            )),
            RemoteOnly | Unknown => {
                Verdict::Refuse(format!("{name} does not exist locally"))
            }
            ErrorReadLocal | ErrorStatLocal => {
                Verdict::Refuse(format!("{name} cannot be read: {}", info.detail))
            }
            _ => Verdict::Proceed,
        },
        OperationKind::Download => match info.status {
            NewLocal | Unknown => {
                Verdict::Refuse(format!("{name} does not exist on the remote"))
            }
            Uploading => Verdict::Refuse(format!("{name} is being uploaded from here")),
            LocalNewer => Verdict::Confirm(format!(
                "{name} has local changes that would be lost. Download anyway?"
            )),
            LockedByOther
                if matches!(
                    info.ledger_status.as_deref(),
                    Some(status::UPLOADING | status::UPDATING)
                ) =>
            {
                Verdict::Confirm(format!(
                    "{name} is being changed ({}). Download anyway?",
                    info.detail
                ))
            }
            _ => Verdict::Proceed,
        },
        OperationKind::Lock | OperationKind::Unlock => Verdict::Proceed,
    }
}

fn confirmed(answer: Option<bool>) -> Result<(), SyncError> {
    match answer {
        None => Err(SyncError::Cancelled),
        Some(false) => Err(SyncError::Declined),
        Some(true) => Ok(()),
    }
}

fn local_error(path: &Path) -> impl FnOnce(io::Error) -> SyncError + '_ {
    move |source| SyncError::Local {
        path: path.to_path_buf(),
        source,
    }
}

impl SyncEngine {
    async fn local_hash(&self, path: &Path) -> Result<String, SyncError> {
        self.hashes.hash(path).await.map_err(local_error(path))
    }

    async fn save_hashes(&self) {
        if let Err(e) = self.hashes.save().await {
            warn!("could not save hash cache: {e}");
        }
    }

    /// Takes `kind` on the context's database, asking to override another
    /// owner's claim. Nothing is acquired when the question is declined or
    /// the operation is cancelled while it is pending.
    async fn acquire_or_confirm(
        &self,
        ctx: &OperationContext,
        kind: LockKind,
        intent: &str,
        force: bool,
    ) -> Result<LockRecord, SyncError> {
        let db = ctx.database();
        match self
            .locks
            .acquire(db, &self.identity, kind, intent, force)
            .await
        {
            Err(LockError::AlreadyLocked { owner, host, .. }) => {
                ctx.phase(phase::AWAITING_CONFIRMATION);
                confirmed(
                    ctx.confirm(format!(
                        "{db} is locked by {owner}@{host}. Force override?"
                    ))
                    .await,
                )?;
                ctx.phase(phase::LOCKING);
                Ok(self
                    .locks
                    .acquire(db, &self.identity, kind, intent, true)
                    .await?)
            }
            result => Ok(result?),
        }
    }

    /// Publishes the local copy of the context's database.
    ///
    /// Lock, mark the ledger, transfer, record success, anchor, unlock. An
    /// interrupted transfer records a `cancelled` event and gives the lock
    /// back. When the remote object already matches but the ledger does not
    /// say so, the success event is recorded without a transfer. Returns
    /// `false` when there was nothing to do.
    pub async fn upload(&self, ctx: &OperationContext, force: bool) -> Result<bool, SyncError> {
        let db = ctx.database();
        validate_db_name(db)?;
        let local = self.local_path(db);
        if !fs::try_exists(&local).await.map_err(local_error(&local))? {
            return Err(SyncError::MissingLocal(db.to_string()));
        }

        let mut checked = None;
        if !force {
            ctx.phase(phase::SAFETY_CHECK);
            let info = self.status_of(db, false, ctx.token()).await?;
            if let Verdict::Refuse(reason) = validate_action(OperationKind::Upload, &info) {
                return Err(SyncError::Refused(reason));
            }
            checked = Some(info);
        }

        ctx.phase(phase::CHECKING);
        let transfer = match self.store.differs(&local, &self.remote_path(db)).await {
            Ok(differs) => differs,
            Err(e) => {
                warn!("could not compare {db} with the remote, uploading anyway: {e}");
                true
            }
        };
        if !transfer {
            let info = match checked {
                Some(info) => info,
                None => self.status_of(db, false, ctx.token()).await?,
            };
            if info.status == DatabaseStatus::UpToDate
                && info.ledger_status.as_deref() == Some(status::SUCCESS)
            {
                info!("no change in {db}, skipping upload");
                ctx.phase(phase::DONE);
                return Ok(false);
            }
            info!(
                "{db} is already on the remote but reads as {}; recording it",
                info.status.code()
            );
        }
        if ctx.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        ctx.phase(phase::LOCKING);
        self.acquire_or_confirm(ctx, LockKind::Lock, "upload", force)
            .await?;

        let started = Instant::now();
        if let Err(e) = self.transfer_and_record(ctx, &local, started, transfer).await {
            ctx.phase(phase::CANCELLING);
            self.abandon_upload(db, &local, started, &e).await;
            return Err(e);
        }

        ctx.phase(phase::UNLOCKING);
        self.release_own(db).await?;
        if transfer {
            self.notifier.database_updated(db);
        }
        ctx.phase(phase::DONE);
        Ok(true)
    }

    /// Gives back this user's lock. Another owner's claim, left by a forced
    /// override, stays in place.
    async fn release_own(&self, db: &str) -> Result<(), LockError> {
        match self.locks.release(db, &self.identity.owner, false).await {
            Err(LockError::NotOwner { owner, .. }) => {
                warn!("our lock on {db} was overridden by {owner}; leaving theirs in place");
                Ok(())
            }
            result => result.map(drop),
        }
    }

    async fn transfer_and_record(
        &self,
        ctx: &OperationContext,
        local: &Path,
        started: Instant,
        transfer: bool,
    ) -> Result<(), SyncError> {
        let db = ctx.database();
        ctx.phase(phase::SETTING_METADATA);
        let hash = self.local_hash(local).await?;
        let marker = describe_file(local, hash.clone(), &self.identity, status::UPLOADING, 0.0)
            .await
            .map_err(local_error(local))?;
        self.ledger.mark_in_progress(db, &marker).await?;

        if transfer {
            ctx.phase(phase::UPLOADING);
            let ctl = TransferControl::new(ctx.token().clone())
                .with_progress(ctx.progress_sink(), phase::UPLOADING);
            self.store.upload(local, self.remote_root(), &ctl).await?;
        }

        ctx.phase(phase::FINALIZING);
        let duration = started.elapsed().as_secs_f64();
        let event = describe_file(local, hash, &self.identity, status::SUCCESS, duration)
            .await
            .map_err(local_error(local))?;
        let record = self.ledger.append_event(db, event).await?;
        if let Err(e) = self.anchors.write(db, &record).await {
            warn!("could not anchor {db}: {e}");
        }
        self.save_hashes().await;
        info!("uploaded {db} in {duration:.1}s");
        Ok(())
    }

    /// Best-effort cleanup after an upload that held the lock but did not
    /// finish. Runs to completion even though the operation's scope is
    /// already cancelled.
    async fn abandon_upload(&self, db: &str, local: &Path, started: Instant, cause: &SyncError) {
        warn!("upload of {db} did not complete: {cause}");

        // Keep the last published hash so the record still describes the
        // remote object.
        let published = match self.ledger.read(db).await {
            Ok(Some(record)) => Some(record.hash),
            _ => None,
        };
        let hash = match published {
            Some(hash) => hash,
            None => self.hashes.hash(local).await.unwrap_or_default(),
        };
        let duration = started.elapsed().as_secs_f64();
        match describe_file(local, hash, &self.identity, status::CANCELLED, duration).await {
            Ok(event) => {
                if let Err(e) = self.ledger.append_event(db, event).await {
                    warn!("could not record cancellation of {db}: {e}");
                }
            }
            Err(e) => warn!("could not describe {} for the ledger: {e}", local.display()),
        }

        for attempt in 1..=UNLOCK_ATTEMPTS {
            match self.release_own(db).await {
                Ok(()) => {
                    info!("released lock on {db} (attempt {attempt})");
                    return;
                }
                Err(e) => {
                    warn!("unlock attempt {attempt} for {db} failed: {e}");
                    if attempt < UNLOCK_ATTEMPTS {
                        sleep(UNLOCK_RETRY_DELAY).await;
                    }
                }
            }
        }
        error!("could not release the lock on {db}; unlock it manually");
    }

    pub async fn download(&self, ctx: &OperationContext, force: bool) -> Result<(), SyncError> {
        let db = ctx.database();
        validate_db_name(db)?;

        ctx.phase(phase::CHECKING);
        let info = self.status_of(db, false, ctx.token()).await?;
        match validate_action(OperationKind::Download, &info) {
            Verdict::Proceed => {}
            Verdict::Refuse(reason) => return Err(SyncError::Refused(reason)),
            Verdict::Confirm(_) if force => {}
            Verdict::Confirm(question) => {
                ctx.phase(phase::AWAITING_CONFIRMATION);
                confirmed(ctx.confirm(question).await)?;
            }
        }
        if !info.database.remote_exists {
            return Err(SyncError::MissingRemote(db.to_string()));
        }

        let db_dir = self.db_dir();
        fs::create_dir_all(db_dir).await.map_err(local_error(db_dir))?;

        ctx.phase(phase::DOWNLOADING);
        let ctl = TransferControl::new(ctx.token().clone())
            .with_progress(ctx.progress_sink(), phase::DOWNLOADING);
        self.store.download(&self.remote_path(db), db_dir, &ctl).await?;

        ctx.phase(phase::FINALIZING);
        let local = self.local_path(db);
        let hash = self.local_hash(&local).await?;
        match self.ledger.read(db).await? {
            Some(record) => self.anchor_download(db, record, hash).await?,
            None => warn!("{db} has no metadata; not anchoring the download"),
        }
        self.save_hashes().await;
        ctx.phase(phase::DONE);
        info!("downloaded {db}");
        Ok(())
    }

    async fn anchor_download(
        &self,
        db: &str,
        mut record: MetadataRecord,
        hash: String,
    ) -> Result<(), SyncError> {
        record.hash = hash;
        record.status = status::SUCCESS.to_string();
        self.anchors
            .write(db, &record)
            .await
            .map_err(local_error(self.anchors.dir()))
    }

    pub async fn lock_for_update(
        &self,
        ctx: &OperationContext,
        force: bool,
    ) -> Result<LockRecord, SyncError> {
        let db = ctx.database();
        validate_db_name(db)?;
        let local = self.local_path(db);
        if !fs::try_exists(&local).await.map_err(local_error(&local))? {
            return Err(SyncError::MissingLocal(db.to_string()));
        }

        ctx.phase(phase::LOCKING);
        let record = self
            .acquire_or_confirm(ctx, LockKind::Lock, "manual update", force)
            .await?;

        ctx.phase(phase::SETTING_METADATA);
        let marked = async {
            let hash = self.local_hash(&local).await?;
            let event = describe_file(&local, hash, &self.identity, status::UPDATING, 0.0)
                .await
                .map_err(local_error(&local))?;
            self.ledger.append_event(db, event).await?;
            Ok::<_, SyncError>(())
        };
        if let Err(e) = marked.await {
            if let Err(release) = self.release_own(db).await {
                warn!("could not undo lock on {db}: {release}");
            }
            return Err(e);
        }
        self.save_hashes().await;
        ctx.phase(phase::DONE);
        Ok(record)
    }

    pub async fn unlock(
        &self,
        ctx: &OperationContext,
        force: bool,
    ) -> Result<Vec<LockRecord>, SyncError> {
        let db = ctx.database();
        ctx.phase(phase::UNLOCKING);
        let released = match self.locks.release(db, &self.identity.owner, force).await {
            Err(LockError::NotOwner { owner, .. }) => {
                ctx.phase(phase::AWAITING_CONFIRMATION);
                confirmed(
                    ctx.confirm(format!("{db} is locked by {owner}. Force unlock?"))
                        .await,
                )?;
                ctx.phase(phase::UNLOCKING);
                self.locks.release(db, &self.identity.owner, true).await?
            }
            result => result?,
        };
        if released.is_empty() {
            info!("{db} was not locked");
        }
        ctx.phase(phase::DONE);
        Ok(released)
    }

    pub async fn regenerate_metadata(
        &self,
        cancel: &CancellationToken,
    ) -> Result<usize, SyncError> {
        let names = self
            .local_databases()
            .await
            .map_err(local_error(self.db_dir()))?;
        let mut written = 0;
        for db in &names {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let local = self.local_path(db);
            let hash = self.local_hash(&local).await?;
            let event = describe_file(&local, hash, &self.identity, status::SUCCESS, 0.0)
                .await
                .map_err(local_error(&local))?;
            let record = self.ledger.append_event(db, event).await?;
            if let Err(e) = self.anchors.write(db, &record).await {
                warn!("could not anchor {db}: {e}");
            }
            written += 1;
        }
        self.save_hashes().await;
        info!("regenerated metadata for {written} database(s)");
        Ok(written)
    }

    /// Forgets everything this machine knows locally: anchors and cached
    /// hashes. Remote state is untouched.
    pub async fn reset(&self) -> Result<(), SyncError> {
        let dir = self.state_dir();
        match fs::remove_dir_all(dir).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                return Err(SyncError::Local {
                    path: dir.to_path_buf(),
                    source: e,
                })
            }
            _ => {}
        }
        self.hashes.clear();
        info!("removed local state in {}", dir.display());
        Ok(())
    }

    pub async fn is_anchored(&self, db: &str) -> bool {
        self.anchors.read(db).await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::SystemTime};

    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        coordinator::OperationUpdate,
        ledger::MetaEvent,
        lock::Identity,
        config::test_config,
        store::MemoryStore,
    };

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<MemoryStore>,
        engine: Arc<SyncEngine>,
    }

    fn engine_for(dir: &Path, store: Arc<MemoryStore>, identity: Identity) -> SyncEngine {
        SyncEngine::new(store, &test_config(dir, &identity))
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("db")).unwrap();
        let store = Arc::new(MemoryStore::new());
        let engine = engine_for(dir.path(), store.clone(), Identity::new("alice", "laptop"));
        Fixture {
            _dir: dir,
            store,
            engine: Arc::new(engine),
        }
    }

    fn context(db: &str) -> (OperationContext, mpsc::UnboundedReceiver<OperationUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (OperationContext::new(db, CancellationToken::new(), tx), rx)
    }

    fn write_local(f: &Fixture, db: &str, contents: &[u8]) {
        std::fs::write(f.engine.local_path(db), contents).unwrap();
    }

    fn has_locks(f: &Fixture) -> bool {
        f.store.paths().iter().any(|p| p.starts_with("r:dbs/lock/"))
    }

    async fn publish_as_bob(f: &Fixture, db: &str, contents: &[u8]) {
        f.store.insert(&format!("r:dbs/{db}"), contents);
        let event = MetaEvent::new(
            crate::hash_bytes(contents),
            contents.len() as u64,
            SystemTime::now(),
            &Identity::new("bob", "desk"),
            status::SUCCESS,
            1.0,
        );
        f.engine.ledger.append_event(db, event).await.unwrap();
    }

    async fn current_status(f: &Fixture, db: &str) -> DatabaseStatus {
        f.engine
            .status_of(db, false, &CancellationToken::new())
            .await
            .unwrap()
            .status
    }

    /// Waits for the first confirmation request, skipping other updates.
    async fn next_confirm(
        rx: &mut mpsc::UnboundedReceiver<OperationUpdate>,
    ) -> (String, tokio::sync::oneshot::Sender<bool>) {
        loop {
            match rx.recv().await.unwrap() {
                OperationUpdate::Confirm { message, reply, .. } => return (message, reply),
                _ => continue,
            }
        }
    }

    fn info(status: DatabaseStatus, ledger_status: Option<&str>) -> DatabaseStatusInfo {
        DatabaseStatusInfo {
            database: crate::status::LocalDatabase {
                name: "mills.db".to_string(),
                local_exists: true,
                remote_exists: true,
                local_modified: None,
            },
            status,
            lock: None,
            ledger_status: ledger_status.map(str::to_string),
            detail: String::new(),
        }
    }

    #[test]
    fn upload_validation() {
        use DatabaseStatus::*;
        for s in [RemoteNewer, RemoteOnly, Unknown, ErrorReadLocal, ErrorStatLocal] {
            assert!(matches!(
                validate_action(OperationKind::Upload, &info(s, None)),
                Verdict::Refuse(_)
            ));
        }
        for s in [UpToDate, LocalNewer, NewLocal, LockedByOther, StaleMeta, UploadCancelled] {
            assert_eq!(
                validate_action(OperationKind::Upload, &info(s, None)),
                Verdict::Proceed
            );
        }
    }

    #[test]
    fn download_validation() {
        use DatabaseStatus::*;
        let verdict = |s, l| validate_action(OperationKind::Download, &info(s, l));
        assert!(matches!(verdict(LocalNewer, None), Verdict::Confirm(_)));
        assert!(matches!(verdict(LockedByOther, Some(status::UPLOADING)), Verdict::Confirm(_)));
        assert!(matches!(verdict(LockedByOther, Some(status::UPDATING)), Verdict::Confirm(_)));
        assert_eq!(verdict(LockedByOther, Some(status::SUCCESS)), Verdict::Proceed);
        assert!(matches!(verdict(NewLocal, None), Verdict::Refuse(_)));
        assert_eq!(verdict(RemoteNewer, Some(status::SUCCESS)), Verdict::Proceed);
        assert_eq!(verdict(RemoteOnly, Some(status::SUCCESS)), Verdict::Proceed);
    }

    #[test]
    fn outcomes() {
        assert_eq!(outcome(Ok::<_, SyncError>(())), Outcome::Completed);
        assert_eq!(outcome::<()>(Err(SyncError::Declined)), Outcome::Cancelled);
        assert_eq!(
            outcome::<()>(Err(StoreError::Cancelled.into())),
            Outcome::Cancelled
        );
        assert_eq!(
            outcome::<()>(Err(SyncError::MissingLocal("a.db".into()))),
            Outcome::Failed("a.db does not exist locally".into())
        );
    }

    #[tokio::test]
    async fn new_local_database_upload() {
        let f = fixture();
        write_local(&f, "fresh.db", b"fresh");
        assert_eq!(current_status(&f, "fresh.db").await, DatabaseStatus::NewLocal);

        let (ctx, _rx) = context("fresh.db");
        assert!(f.engine.upload(&ctx, false).await.unwrap());

        let record = f.engine.ledger.read("fresh.db").await.unwrap().unwrap();
        assert_eq!(record.events.len(), 1);
        assert_eq!(record.status, status::SUCCESS);
        assert_eq!(record.hash, crate::hash_bytes(b"fresh"));
        assert_eq!(record.uploader, "alice");
        assert!(!has_locks(&f));
        assert_eq!(f.store.get("r:dbs/fresh.db").unwrap(), b"fresh");
        assert!(f.engine.is_anchored("fresh.db").await);
        assert_eq!(current_status(&f, "fresh.db").await, DatabaseStatus::UpToDate);

        // Nothing changed: no transfer and no new event.
        let (ctx, _rx) = context("fresh.db");
        assert!(!f.engine.upload(&ctx, false).await.unwrap());
        let record = f.engine.ledger.read("fresh.db").await.unwrap().unwrap();
        assert_eq!(record.events.len(), 1);
    }

    #[tokio::test]
    async fn local_change_is_uploaded_as_next_event() {
        let f = fixture();
        write_local(&f, "mills.db", b"v1");
        let (ctx, _rx) = context("mills.db");
        f.engine.upload(&ctx, false).await.unwrap();

        write_local(&f, "mills.db", b"v2-longer");
        assert_eq!(current_status(&f, "mills.db").await, DatabaseStatus::LocalNewer);
        let (ctx, _rx) = context("mills.db");
        assert!(f.engine.upload(&ctx, false).await.unwrap());
        let record = f.engine.ledger.read("mills.db").await.unwrap().unwrap();
        let ids: Vec<u64> = record.events.iter().map(|e| e.sequence_id).collect();
        assert_eq!(ids, [1, 2]);
        assert_eq!(record.hash, crate::hash_bytes(b"v2-longer"));
    }

    #[tokio::test]
    async fn crash_mid_upload_reads_as_stale() {
        let f = fixture();
        write_local(&f, "mills.db", b"v1");
        let (ctx, _rx) = context("mills.db");
        f.engine.upload(&ctx, false).await.unwrap();

        // A process that took the lock and marked the upload, then died.
        write_local(&f, "mills.db", b"v2");
        f.engine
            .locks
            .acquire("mills.db", &f.engine.identity, LockKind::Lock, "upload", false)
            .await
            .unwrap();
        let marker = describe_file(
            &f.engine.local_path("mills.db"),
            crate::hash_bytes(b"v2"),
            &f.engine.identity,
            status::UPLOADING,
            0.0,
        )
        .await
        .unwrap();
        f.engine.ledger.mark_in_progress("mills.db", &marker).await.unwrap();

        assert_eq!(current_status(&f, "mills.db").await, DatabaseStatus::StaleMeta);
        let active = f
            .engine
            .status_of("mills.db", true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(active.status, DatabaseStatus::Uploading);
    }

    #[tokio::test]
    async fn cancelled_while_awaiting_override() {
        let f = fixture();
        write_local(&f, "mills.db", b"mine");
        f.store.insert("r:dbs/lock/mills.db.bob.desk.lock", "");

        let (ctx, mut rx) = context("mills.db");
        let token = ctx.token().clone();
        let engine = f.engine.clone();
        let task = tokio::spawn(async move { engine.upload(&ctx, false).await });

        let (message, _reply) = next_confirm(&mut rx).await;
        assert!(message.contains("bob@desk"));
        token.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert_eq!(outcome(result), Outcome::Cancelled);
        let locks = f.engine.locks.fetch_all().await;
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].owner, "bob");
        assert!(f.engine.ledger.read("mills.db").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn declined_override_leaves_the_lock_alone() {
        let f = fixture();
        write_local(&f, "mills.db", b"mine");
        f.store.insert("r:dbs/lock/mills.db.bob.desk.lock", "");

        let (ctx, mut rx) = context("mills.db");
        let engine = f.engine.clone();
        let task = tokio::spawn(async move { engine.upload(&ctx, false).await });
        let (_, reply) = next_confirm(&mut rx).await;
        reply.send(false).unwrap();

        assert!(matches!(task.await.unwrap(), Err(SyncError::Declined)));
        assert!(f.store.contains("r:dbs/lock/mills.db.bob.desk.lock"));
        assert!(!f.store.contains("r:dbs/mills.db"));
    }

    #[tokio::test]
    async fn accepted_override_forces_the_lock() {
        let f = fixture();
        write_local(&f, "mills.db", b"mine");
        f.store.insert("r:dbs/lock/mills.db.bob.desk.reserve", "");

        let (ctx, mut rx) = context("mills.db");
        let engine = f.engine.clone();
        let task = tokio::spawn(async move { engine.upload(&ctx, false).await });
        let (_, reply) = next_confirm(&mut rx).await;
        reply.send(true).unwrap();

        assert!(task.await.unwrap().unwrap());
        assert!(!has_locks(&f));
        assert_eq!(f.store.get("r:dbs/mills.db").unwrap(), b"mine");
    }

    #[tokio::test]
    async fn interrupted_transfer_records_cancellation() {
        let f = fixture();
        write_local(&f, "mills.db", b"big");
        f.store.set_transfer_delay(Duration::from_secs(30));

        let (ctx, mut rx) = context("mills.db");
        let token = ctx.token().clone();
        let engine = f.engine.clone();
        let task = tokio::spawn(async move { engine.upload(&ctx, false).await });
        loop {
            if let Some(OperationUpdate::Phase { label, .. }) = rx.recv().await {
                if label == phase::UPLOADING {
                    break;
                }
            }
        }
        assert!(has_locks(&f));
        token.cancel();

        assert!(matches!(task.await.unwrap(), Err(SyncError::Cancelled)));
        let record = f.engine.ledger.read("mills.db").await.unwrap().unwrap();
        assert_eq!(record.status, status::CANCELLED);
        assert_eq!(record.events.len(), 1);
        assert!(!has_locks(&f));
        assert!(!f.store.contains("r:dbs/mills.db"));
        assert_eq!(current_status(&f, "mills.db").await, DatabaseStatus::NewLocal);
    }

    #[tokio::test]
    async fn finishing_upload_keeps_an_overriding_lock() {
        let f = fixture();
        write_local(&f, "mills.db", b"mine");
        f.store.set_transfer_delay(Duration::from_millis(300));

        let (ctx, mut rx) = context("mills.db");
        let engine = f.engine.clone();
        let task = tokio::spawn(async move { engine.upload(&ctx, false).await });
        loop {
            if let Some(OperationUpdate::Phase { label, .. }) = rx.recv().await {
                if label == phase::UPLOADING {
                    break;
                }
            }
        }
        let bob = engine_for(f._dir.path(), f.store.clone(), Identity::new("bob", "desk"));
        bob.locks
            .acquire("mills.db", &bob.identity, LockKind::Lock, "upload", true)
            .await
            .unwrap();

        assert!(task.await.unwrap().unwrap());
        let locks = f.engine.locks.fetch_all().await;
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].owner, "bob");
        assert!(f.store.contains("r:dbs/lock/mills.db.bob.desk.lock"));
    }

    #[tokio::test]
    async fn reupload_after_crash_records_the_transferred_content() {
        let f = fixture();
        write_local(&f, "mills.db", b"v1");
        let (ctx, _rx) = context("mills.db");
        f.engine.upload(&ctx, false).await.unwrap();

        // Died after the transfer, before the success event.
        write_local(&f, "mills.db", b"v2");
        f.engine
            .locks
            .acquire("mills.db", &f.engine.identity, LockKind::Lock, "upload", false)
            .await
            .unwrap();
        let marker = describe_file(
            &f.engine.local_path("mills.db"),
            crate::hash_bytes(b"v2"),
            &f.engine.identity,
            status::UPLOADING,
            0.0,
        )
        .await
        .unwrap();
        f.engine.ledger.mark_in_progress("mills.db", &marker).await.unwrap();
        f.store.insert("r:dbs/mills.db", b"v2".to_vec());
        assert_eq!(current_status(&f, "mills.db").await, DatabaseStatus::StaleMeta);

        let (ctx, _rx) = context("mills.db");
        assert!(f.engine.upload(&ctx, false).await.unwrap());
        let record = f.engine.ledger.read("mills.db").await.unwrap().unwrap();
        assert_eq!(record.status, status::SUCCESS);
        assert_eq!(record.hash, crate::hash_bytes(b"v2"));
        assert_eq!(record.events.len(), 2);
        assert!(!has_locks(&f));
        assert_eq!(current_status(&f, "mills.db").await, DatabaseStatus::UpToDate);

        // Now there really is nothing to do.
        let (ctx, _rx) = context("mills.db");
        assert!(!f.engine.upload(&ctx, false).await.unwrap());
    }

    #[tokio::test]
    async fn upload_refused_when_remote_is_newer() {
        let f = fixture();
        publish_as_bob(&f, "mills.db", b"v1").await;
        let (ctx, _rx) = context("mills.db");
        f.engine.download(&ctx, false).await.unwrap();
        assert_eq!(current_status(&f, "mills.db").await, DatabaseStatus::UpToDate);

        publish_as_bob(&f, "mills.db", b"v2").await;
        write_local(&f, "mills.db", b"v3");
        let (ctx, _rx) = context("mills.db");
        let result = f.engine.upload(&ctx, false).await;
        assert!(matches!(result, Err(SyncError::Refused(_))));
        assert_eq!(f.store.get("r:dbs/mills.db").unwrap(), b"v2");
        assert!(!has_locks(&f));
    }

    #[tokio::test]
    async fn download_anchors_the_remote_copy() {
        let f = fixture();
        publish_as_bob(&f, "mills.db", b"remote").await;
        assert_eq!(current_status(&f, "mills.db").await, DatabaseStatus::RemoteOnly);

        let (ctx, _rx) = context("mills.db");
        f.engine.download(&ctx, false).await.unwrap();
        assert_eq!(
            std::fs::read(f.engine.local_path("mills.db")).unwrap(),
            b"remote"
        );
        let anchor = f.engine.anchors.read("mills.db").await.unwrap();
        assert_eq!(anchor.hash, crate::hash_bytes(b"remote"));
        assert_eq!(anchor.uploader, "bob");
        assert!(anchor.events.is_empty());
        assert_eq!(current_status(&f, "mills.db").await, DatabaseStatus::UpToDate);
    }

    #[tokio::test]
    async fn download_over_local_changes_asks_first() {
        let f = fixture();
        publish_as_bob(&f, "mills.db", b"remote").await;
        let (ctx, _rx) = context("mills.db");
        f.engine.download(&ctx, false).await.unwrap();
        write_local(&f, "mills.db", b"edited locally");

        // Nobody answering counts as "no".
        let (ctx, rx) = context("mills.db");
        drop(rx);
        assert!(matches!(
            f.engine.download(&ctx, false).await,
            Err(SyncError::Declined)
        ));
        assert_eq!(
            std::fs::read(f.engine.local_path("mills.db")).unwrap(),
            b"edited locally"
        );

        let (ctx, _rx) = context("mills.db");
        f.engine.download(&ctx, true).await.unwrap();
        assert_eq!(
            std::fs::read(f.engine.local_path("mills.db")).unwrap(),
            b"remote"
        );
    }

    #[tokio::test]
    async fn download_of_unpublished_database_is_refused() {
        let f = fixture();
        write_local(&f, "fresh.db", b"x");
        let (ctx, _rx) = context("fresh.db");
        assert!(matches!(
            f.engine.download(&ctx, false).await,
            Err(SyncError::Refused(_))
        ));
    }

    #[tokio::test]
    async fn manual_lock_and_unlock() {
        let f = fixture();
        write_local(&f, "mills.db", b"v1");
        let (ctx, _rx) = context("mills.db");
        f.engine.upload(&ctx, false).await.unwrap();

        let (ctx, _rx) = context("mills.db");
        let record = f.engine.lock_for_update(&ctx, false).await.unwrap();
        assert_eq!(record.kind, LockKind::Lock);
        let ledger = f.engine.ledger.read("mills.db").await.unwrap().unwrap();
        assert_eq!(ledger.status, status::UPDATING);
        assert_eq!(current_status(&f, "mills.db").await, DatabaseStatus::LockedByYou);

        let bob = engine_for(f._dir.path(), f.store.clone(), Identity::new("bob", "desk"));
        let seen = bob
            .status_of("mills.db", false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(seen.status, DatabaseStatus::LockedByOther);
        assert_eq!(
            validate_action(OperationKind::Download, &seen),
            Verdict::Confirm(format!(
                "mills.db is being changed ({}). Download anyway?",
                seen.detail
            ))
        );

        // Bob cannot unlock without an answer.
        let (ctx, rx) = context("mills.db");
        drop(rx);
        assert!(matches!(bob.unlock(&ctx, false).await, Err(SyncError::Declined)));
        assert!(has_locks(&f));

        let (ctx, _rx) = context("mills.db");
        let released = f.engine.unlock(&ctx, false).await.unwrap();
        assert_eq!(released.len(), 1);
        assert!(!has_locks(&f));

        // Unlocking again is a no-op.
        let (ctx, _rx) = context("mills.db");
        assert!(f.engine.unlock(&ctx, false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn forced_unlock_after_confirmation() {
        let f = fixture();
        f.store.insert("r:dbs/lock/mills.db.bob.desk.lock", "");
        let (ctx, mut rx) = context("mills.db");
        let engine = f.engine.clone();
        let task = tokio::spawn(async move { engine.unlock(&ctx, false).await });
        let (message, reply) = next_confirm(&mut rx).await;
        assert!(message.contains("bob"));
        reply.send(true).unwrap();
        assert_eq!(task.await.unwrap().unwrap().len(), 1);
        assert!(!has_locks(&f));
    }

    #[tokio::test]
    async fn regenerate_and_reset() {
        let f = fixture();
        write_local(&f, "a.db", b"a");
        write_local(&f, "b-v2.db", b"b");
        let cancel = CancellationToken::new();
        assert_eq!(f.engine.regenerate_metadata(&cancel).await.unwrap(), 2);
        for db in ["a.db", "b-v2.db"] {
            let record = f.engine.ledger.read(db).await.unwrap().unwrap();
            assert_eq!(record.events.len(), 1);
            assert_eq!(record.status, status::SUCCESS);
            assert!(f.engine.is_anchored(db).await);
        }
        assert!(!f.engine.hashes.is_empty());

        f.engine.reset().await.unwrap();
        assert!(!f.engine.state_dir().exists());
        assert!(f.engine.hashes.is_empty());
        assert!(!f.engine.is_anchored("a.db").await);
        // Resetting twice is fine.
        f.engine.reset().await.unwrap();
    }
}
