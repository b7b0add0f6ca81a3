use std::{
    collections::{HashMap, HashSet},
    fmt,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use log::{debug, info, warn};
use thiserror::Error;
use tokio::{
    select, spawn,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::sleep,
};
use tokio_util::sync::CancellationToken;

use crate::{progress::TransferProgress, store::ProgressSink};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Upload,
    Download,
    Lock,
    Unlock,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Upload => "upload",
            Self::Download => "download",
            Self::Lock => "lock",
            Self::Unlock => "unlock",
        })
    }
}

/// Per-database lifecycle. Only `Running` is ever stored; a database without
/// an entry is `Idle`, and the terminal states are reported through
/// [`OperationUpdate::Finished`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationState {
    Idle,
    Running,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Cancelled,
    Failed(String),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

#[derive(Debug)]
pub enum OperationUpdate {
    Phase {
        database: String,
        label: String,
    },
    Progress {
        database: String,
        progress: TransferProgress,
    },
    /// The operation is suspended until `reply` is answered or it is cancelled.
    Confirm {
        database: String,
        message: String,
        reply: oneshot::Sender<bool>,
    },
    Finished {
        database: String,
        kind: OperationKind,
        outcome: Outcome,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StartError {
    #[error("an operation on {0} is already running")]
    AlreadyRunning(String),
    #[error("shutting down; no new operations are accepted")]
    ShuttingDown,
}

#[derive(Clone, Debug)]
pub struct OperationContext {
    database: String,
    token: CancellationToken,
    updates: mpsc::UnboundedSender<OperationUpdate>,
}

impl OperationContext {
    pub fn new(
        database: impl Into<String>,
        token: CancellationToken,
        updates: mpsc::UnboundedSender<OperationUpdate>,
    ) -> Self {
        Self {
            database: database.into(),
            token,
            updates,
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn send(&self, update: OperationUpdate) {
        if self.updates.send(update).is_err() {
            debug!("nobody is listening for updates on {}", self.database);
        }
    }

    pub fn phase(&self, label: &str) {
        self.send(OperationUpdate::Phase {
            database: self.database.clone(),
            label: label.to_string(),
        });
    }

    pub fn progress_sink(&self) -> ProgressSink {
        let (sink, mut records) = mpsc::unbounded_channel::<TransferProgress>();
        let ctx = self.clone();
        spawn(async move {
            while let Some(progress) = records.recv().await {
                ctx.send(OperationUpdate::Progress {
                    database: ctx.database.clone(),
                    progress,
                });
            }
        });
        sink
    }

    /// Asks the presentation layer to confirm `message` and waits for the answer.
    ///
    /// Returns `None` if the operation is cancelled while waiting. A dropped
    /// reply counts as "no".
    pub async fn confirm(&self, message: impl Into<String>) -> Option<bool> {
        let (reply, answer) = oneshot::channel();
        self.send(OperationUpdate::Confirm {
            database: self.database.clone(),
            message: message.into(),
            reply,
        });
        select! {
            biased;
            _ = self.token.cancelled() => None,
            answer = answer => Some(answer.unwrap_or(false)),
        }
    }
}

struct ActiveOperation {
    kind: OperationKind,
    token: CancellationToken,
}

type ActiveMap = Arc<Mutex<HashMap<String, ActiveOperation>>>;

fn lock_map(map: &ActiveMap) -> std::sync::MutexGuard<'_, HashMap<String, ActiveOperation>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ActiveGuard {
    map: ActiveMap,
    database: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        lock_map(&self.map).remove(&self.database);
    }
}

pub struct OperationHandle {
    database: String,
    kind: OperationKind,
    token: CancellationToken,
    outcome: JoinHandle<Outcome>,
}

impl OperationHandle {
    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub async fn wait(self) -> Outcome {
        match self.outcome.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => Outcome::Cancelled,
            Err(e) => Outcome::Failed(format!("operation panicked: {e}")),
        }
    }
}

pub struct OperationCoordinator {
    root: CancellationToken,
    active: ActiveMap,
    updates: mpsc::UnboundedSender<OperationUpdate>,
}

impl OperationCoordinator {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OperationUpdate>) {
        let (updates, receiver) = mpsc::unbounded_channel();
        let coordinator = Self {
            root: CancellationToken::new(),
            active: Arc::default(),
            updates,
        };
        (coordinator, receiver)
    }

    pub fn updates(&self) -> mpsc::UnboundedSender<OperationUpdate> {
        self.updates.clone()
    }

    /// Runs `action` as an independent task under a child of the root scope.
    ///
    /// Rejected without side effects if `database` already has an operation.
    pub fn start<F, Fut>(
        &self,
        database: &str,
        kind: OperationKind,
        action: F,
    ) -> Result<OperationHandle, StartError>
    where
        F: FnOnce(OperationContext) -> Fut,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let token = {
            let mut active = lock_map(&self.active);
            if self.root.is_cancelled() {
                return Err(StartError::ShuttingDown);
            }
            if active.contains_key(database) {
                return Err(StartError::AlreadyRunning(database.to_string()));
            }
            let token = self.root.child_token();
            active.insert(
                database.to_string(),
                ActiveOperation {
                    kind,
                    token: token.clone(),
                },
            );
            token
        };
        let guard = ActiveGuard {
            map: self.active.clone(),
            database: database.to_string(),
        };
        info!("starting {kind} of {database}");

        let ctx = OperationContext::new(database, token.clone(), self.updates.clone());
        let fut = action(ctx);
        let updates = self.updates.clone();
        let db = database.to_string();
        let outcome = spawn(async move {
            let outcome = fut.await;
            drop(guard);
            info!("{kind} of {db} {outcome}");
            let _ = updates.send(OperationUpdate::Finished {
                database: db,
                kind,
                outcome: outcome.clone(),
            });
            outcome
        });

        Ok(OperationHandle {
            database: database.to_string(),
            kind,
            token,
            outcome,
        })
    }

    pub fn cancel(&self, database: &str) -> bool {
        match lock_map(&self.active).get(database) {
            Some(op) => {
                info!("cancelling {} of {database}", op.kind);
                op.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn state(&self, database: &str) -> OperationState {
        if self.is_active(database) {
            OperationState::Running
        } else {
            OperationState::Idle
        }
    }

    pub fn is_active(&self, database: &str) -> bool {
        lock_map(&self.active).contains_key(database)
    }

    pub fn active(&self) -> HashSet<String> {
        lock_map(&self.active).keys().cloned().collect()
    }

    /// Cancels the root scope and polls until every operation has finished.
    /// Returns `false` if some were still running after `max_polls` polls.
    pub async fn shutdown(&self, poll: Duration, max_polls: u32) -> bool {
        self.root.cancel();
        for _ in 0..max_polls {
            if lock_map(&self.active).is_empty() {
                return true;
            }
            sleep(poll).await;
        }
        let left = self.active();
        if left.is_empty() {
            return true;
        }
        warn!("giving up on {} unfinished operation(s): {left:?}", left.len());
        false
    }
}
