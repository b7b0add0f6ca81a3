use std::{
    path::Path,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use async_trait::async_trait;
use futures::{pin_mut, StreamExt};
use log::{debug, info, warn};
use tokio::{io::AsyncWriteExt, process::Command, select, spawn};

use super::{join_remote, ObjectStore, StoreError, StoreResult, TransferControl};
use crate::progress::{progress_lines, TransferLine};

/// rclone exit code for "directory not found".
const EXIT_DIR_NOT_FOUND: i32 = 3;
/// rclone exit code for "file not found".
const EXIT_FILE_NOT_FOUND: i32 = 4;
/// `rclone check` exit code when the two sides differ.
const EXIT_CHECK_DIFFERENCES: i32 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferOptions {
    pub retries: u32,
    pub low_level_retries: u32,
    pub retries_sleep: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            retries: 20,
            low_level_retries: 30,
            retries_sleep: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RcloneStore {
    binary: String,
    options: TransferOptions,
}

impl RcloneStore {
    pub fn new(binary: impl Into<String>, options: TransferOptions) -> Self {
        Self {
            binary: binary.into(),
            options,
        }
    }

    pub async fn ensure_available(&self) -> StoreResult<()> {
        let out = self.command(&["version"]).output().await?;
        if !out.status.success() {
            return Err(failure("version", out.status, &out.stderr));
        }
        if let Some(first) = String::from_utf8_lossy(&out.stdout).lines().next() {
            info!("using {first}");
        }
        Ok(())
    }

    fn command(&self, args: &[&str]) -> Command {
        debug!("running {} {}", self.binary, args.join(" "));
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn retry_args(&self) -> Vec<String> {
        vec![
            "--checksum".to_string(),
            "--retries".to_string(),
            self.options.retries.to_string(),
            "--low-level-retries".to_string(),
            self.options.low_level_retries.to_string(),
            "--retries-sleep".to_string(),
            format!("{}s", self.options.retries_sleep.as_secs()),
        ]
    }

    async fn transfer(&self, source: &str, dest: &str, ctl: &TransferControl) -> StoreResult<()> {
        let mut args = vec!["copy".to_string(), source.to_string(), dest.to_string()];
        args.extend(self.retry_args());
        args.extend(
            ["-v", "--use-json-log", "--stats", "0.5s"]
                .iter()
                .map(|s| s.to_string()),
        );
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let mut cmd = self.command(&args);
        cmd.stdout(Stdio::null());
        let mut child = cmd.spawn()?;

        let forwarder = child.stderr.take().map(|stderr| {
            let ctl = ctl.clone();
            spawn(async move {
                let lines = progress_lines(stderr, ctl.phase.clone());
                pin_mut!(lines);
                let mut last_error = None;
                while let Some(line) = lines.next().await {
                    match line {
                        TransferLine::Progress(progress) => ctl.report(progress),
                        TransferLine::Error(msg) => {
                            warn!("rclone: {msg}");
                            last_error = Some(msg);
                        }
                    }
                }
                last_error
            })
        });

        let status = select! {
            status = child.wait() => status?,
            _ = ctl.cancel.cancelled() => {
                warn!("cancelling transfer {source} -> {dest}");
                if let Err(e) = child.kill().await {
                    warn!("failed to kill transfer process: {e}");
                }
                return Err(StoreError::Cancelled);
            }
        };
        let last_error = match forwarder {
            Some(forwarder) => forwarder.await.ok().flatten(),
            None => None,
        };
        if status.success() {
            Ok(())
        } else {
            Err(failure("copy", status, last_error.unwrap_or_default().as_bytes()))
        }
    }
}

fn failure(op: &str, status: ExitStatus, stderr: &[u8]) -> StoreError {
    StoreError::Failed {
        op: op.to_string(),
        code: status.code(),
        detail: String::from_utf8_lossy(stderr).trim().to_string(),
    }
}

fn lines(stdout: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl ObjectStore for RcloneStore {
    async fn list(&self, dir: &str) -> StoreResult<Vec<String>> {
        let out = self.command(&["lsf", dir, "--files-only"]).output().await?;
        match out.status.code() {
            Some(0) => Ok(lines(&out.stdout)),
            Some(EXIT_DIR_NOT_FOUND) => Err(StoreError::DirNotFound(dir.to_string())),
            _ => Err(failure("lsf", out.status, &out.stderr)),
        }
    }

    async fn list_files(&self, dir: &str, include: &str) -> StoreResult<Vec<String>> {
        let out = self
            .command(&["lsf", dir, "--files-only", "--include", include])
            .output()
            .await?;
        match out.status.code() {
            Some(0) => Ok(lines(&out.stdout)),
            Some(EXIT_DIR_NOT_FOUND) => Err(StoreError::DirNotFound(dir.to_string())),
            _ => Err(failure("lsf", out.status, &out.stderr)),
        }
    }

    async fn read(&self, path: &str) -> StoreResult<Option<Vec<u8>>> {
        let out = self.command(&["cat", path]).output().await?;
        match out.status.code() {
            Some(0) => Ok(Some(out.stdout)),
            Some(EXIT_DIR_NOT_FOUND) | Some(EXIT_FILE_NOT_FOUND) => Ok(None),
            _ => Err(failure("cat", out.status, &out.stderr)),
        }
    }

    async fn write(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        let mut cmd = self.command(&["rcat", path]);
        cmd.stdin(Stdio::piped());
        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(data).await?;
            stdin.shutdown().await?;
        }
        let out = child.wait_with_output().await?;
        if out.status.success() {
            Ok(())
        } else {
            Err(failure("rcat", out.status, &out.stderr))
        }
    }

    async fn delete_file(&self, path: &str) -> StoreResult<()> {
        let out = self.command(&["deletefile", path]).output().await?;
        match out.status.code() {
            Some(0) => Ok(()),
            Some(EXIT_DIR_NOT_FOUND) | Some(EXIT_FILE_NOT_FOUND) => {
                Err(StoreError::NotFound(path.to_string()))
            }
            _ => Err(failure("deletefile", out.status, &out.stderr)),
        }
    }

    async fn upload(
        &self,
        local: &Path,
        remote_dir: &str,
        ctl: &TransferControl,
    ) -> StoreResult<()> {
        self.transfer(&local.to_string_lossy(), remote_dir, ctl).await
    }

    async fn download(
        &self,
        remote: &str,
        local_dir: &Path,
        ctl: &TransferControl,
    ) -> StoreResult<()> {
        self.transfer(remote, &local_dir.to_string_lossy(), ctl).await
    }

    async fn differs(&self, local: &Path, remote: &str) -> StoreResult<bool> {
        // `check` compares directories; filter down to the one file.
        let (local_dir, name) = match (local.parent(), local.file_name()) {
            (Some(dir), Some(name)) => (dir.to_string_lossy(), name.to_string_lossy()),
            _ => return Err(StoreError::NotFound(local.display().to_string())),
        };
        let remote_dir = remote
            .strip_suffix(name.as_ref())
            .map(str::to_string)
            .unwrap_or_else(|| join_remote(remote, ""));
        let out = self
            .command(&[
                "check",
                local_dir.as_ref(),
                remote_dir.as_str(),
                "--one-way",
                "--include",
                name.as_ref(),
            ])
            .output()
            .await?;
        match out.status.code() {
            Some(0) => Ok(false),
            Some(EXIT_CHECK_DIFFERENCES) => Ok(true),
            _ => Err(failure("check", out.status, &out.stderr)),
        }
    }
}
