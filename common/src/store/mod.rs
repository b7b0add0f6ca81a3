use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::progress::TransferProgress;

mod memory;
mod rclone;

pub use memory::MemoryStore;
pub use rclone::{RcloneStore, TransferOptions};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("remote directory `{0}` not found")]
    DirNotFound(String),
    #[error("remote object `{0}` not found")]
    NotFound(String),
    #[error("`{op}` failed (exit code {code:?}): {detail}")]
    Failed {
        op: String,
        code: Option<i32>,
        detail: String,
    },
    #[error("transfer cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

pub type ProgressSink = mpsc::UnboundedSender<TransferProgress>;

#[derive(Clone, Debug)]
pub struct TransferControl {
    pub cancel: CancellationToken,
    pub progress: Option<ProgressSink>,
    /// Phase label attached to every progress record of this transfer.
    pub phase: String,
}

impl TransferControl {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            progress: None,
            phase: String::new(),
        }
    }

    pub fn with_progress(mut self, sink: ProgressSink, phase: impl Into<String>) -> Self {
        self.progress = Some(sink);
        self.phase = phase.into();
        self
    }

    pub(crate) fn report(&self, progress: TransferProgress) {
        if let Some(sink) = &self.progress {
            // The receiver going away only means nobody is watching.
            let _ = sink.send(progress);
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list(&self, dir: &str) -> StoreResult<Vec<String>>;

    async fn list_files(&self, dir: &str, include: &str) -> StoreResult<Vec<String>>;

    async fn read(&self, path: &str) -> StoreResult<Option<Vec<u8>>>;

    async fn write(&self, path: &str, data: &[u8]) -> StoreResult<()>;

    async fn delete_file(&self, path: &str) -> StoreResult<()>;

    async fn upload(&self, local: &Path, remote_dir: &str, ctl: &TransferControl)
        -> StoreResult<()>;

    async fn download(&self, remote: &str, local_dir: &Path, ctl: &TransferControl)
        -> StoreResult<()>;

    /// One-way content check of a local file against a remote one.
    /// `Ok(true)` means the two differ.
    async fn differs(&self, local: &Path, remote: &str) -> StoreResult<bool>;
}

pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir.ends_with('/') || dir.ends_with(':') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_handles_trailing_separators() {
        assert_eq!(join_remote("b2:bucket/lock/", "a.db"), "b2:bucket/lock/a.db");
        assert_eq!(join_remote("b2:bucket/lock", "a.db"), "b2:bucket/lock/a.db");
        assert_eq!(join_remote("b2:", "a.db"), "b2:a.db");
    }
}
