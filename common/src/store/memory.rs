use std::{
    collections::BTreeMap,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use glob::Pattern;
use tokio::{select, time::sleep};

use super::{join_remote, ObjectStore, StoreError, StoreResult, TransferControl};
use crate::progress::TransferProgress;

/// An [`ObjectStore`] keeping every object in a map keyed by remote path.
///
/// Transfers read and write the real local filesystem. A transfer delay can be
/// configured so cancellation paths can be exercised.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    transfer_delay: Mutex<Duration>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_transfer_delay(&self, delay: Duration) {
        *self.transfer_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// While offline every operation fails like an unreachable remote would.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn insert(&self, path: &str, data: impl Into<Vec<u8>>) {
        self.objects().insert(path.to_string(), data.into());
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.objects().get(path).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects().contains_key(path)
    }

    pub fn paths(&self) -> Vec<String> {
        self.objects().keys().cloned().collect()
    }

    fn objects(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_online(&self, op: &str) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Failed {
                op: op.to_string(),
                code: Some(1),
                detail: "remote unreachable".to_string(),
            });
        }
        Ok(())
    }

    fn dir_prefix(dir: &str) -> String {
        join_remote(dir, "")
    }

    async fn simulate_transfer(&self, size: u64, ctl: &TransferControl) -> StoreResult<()> {
        let delay = *self
            .transfer_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        ctl.report(TransferProgress::new(0, Some(size), 0.0, &ctl.phase));
        if !delay.is_zero() {
            select! {
                _ = sleep(delay) => {}
                _ = ctl.cancel.cancelled() => return Err(StoreError::Cancelled),
            }
        }
        if ctl.cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        ctl.report(TransferProgress::new(size, Some(size), size as f64, &ctl.phase));
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self, dir: &str) -> StoreResult<Vec<String>> {
        self.check_online("lsf")?;
        let prefix = Self::dir_prefix(dir);
        let objects = self.objects();
        let mut under = objects
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .peekable();
        if under.peek().is_none() {
            return Err(StoreError::DirNotFound(dir.to_string()));
        }
        Ok(under
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }

    async fn list_files(&self, dir: &str, include: &str) -> StoreResult<Vec<String>> {
        let pattern = Pattern::new(include).map_err(|e| StoreError::Failed {
            op: "lsf".to_string(),
            code: None,
            detail: format!("bad include pattern `{include}`: {e}"),
        })?;
        Ok(self
            .list(dir)
            .await?
            .into_iter()
            .filter(|name| pattern.matches(name))
            .collect())
    }

    async fn read(&self, path: &str) -> StoreResult<Option<Vec<u8>>> {
        self.check_online("cat")?;
        Ok(self.get(path))
    }

    async fn write(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        self.check_online("rcat")?;
        self.insert(path, data);
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> StoreResult<()> {
        self.check_online("deletefile")?;
        match self.objects().remove(path) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(path.to_string())),
        }
    }

    async fn upload(
        &self,
        local: &Path,
        remote_dir: &str,
        ctl: &TransferControl,
    ) -> StoreResult<()> {
        self.check_online("copy")?;
        let data = tokio::fs::read(local).await?;
        let name = local
            .file_name()
            .ok_or_else(|| StoreError::NotFound(local.display().to_string()))?
            .to_string_lossy()
            .to_string();
        self.simulate_transfer(data.len() as u64, ctl).await?;
        self.insert(&join_remote(remote_dir, &name), data);
        Ok(())
    }

    async fn download(
        &self,
        remote: &str,
        local_dir: &Path,
        ctl: &TransferControl,
    ) -> StoreResult<()> {
        self.check_online("copy")?;
        let data = self
            .get(remote)
            .ok_or_else(|| StoreError::NotFound(remote.to_string()))?;
        let name = remote.rsplit(['/', ':']).next().unwrap_or(remote).to_string();
        self.simulate_transfer(data.len() as u64, ctl).await?;
        tokio::fs::write(local_dir.join(name), data).await?;
        Ok(())
    }

    async fn differs(&self, local: &Path, remote: &str) -> StoreResult<bool> {
        self.check_online("check")?;
        let local = tokio::fs::read(local).await?;
        Ok(self.get(remote).as_deref() != Some(local.as_slice()))
    }
}
