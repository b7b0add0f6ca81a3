use std::{
    env,
    ffi::OsString,
    path::{Path, PathBuf},
    time::Duration,
};

use log::debug;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::{
    lock::Identity,
    store::{join_remote, TransferOptions},
};

pub const CONFIG_FILE_NAME: &str = "dbsync.toml";
pub const STATE_DIR_NAME: &str = ".dbsync";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no dbsync.toml found in {} or any parent directory", .0.display())]
    NotFound(PathBuf),
    #[error("could not read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("`{0}` is not configured")]
    Missing(&'static str),
    #[error("invalid webhook url `{url}`: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
}

#[derive(Deserialize, Default, Debug)]
#[serde(default)]
struct FileSection {
    remote_root: Option<String>,
    db_dir: Option<String>,
    webhook_url: Option<String>,
    rclone_binary: Option<String>,
    retries: Option<u32>,
    low_level_retries: Option<u32>,
    retries_sleep_secs: Option<u64>,
}

#[derive(Deserialize, Default, Debug)]
struct ConfigFile {
    #[serde(default)]
    dbsync: FileSection,
}

/// Values that take precedence over the file. Flags beat environment
/// variables; see [`Overrides::or`].
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub remote_root: Option<String>,
    pub db_dir: Option<String>,
    pub webhook_url: Option<String>,
    pub user: Option<String>,
    pub host: Option<String>,
}

impl Overrides {
    pub fn from_env() -> Self {
        let var = |name: &str| env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            config: env::var_os("DBSYNC_CONFIG").map(PathBuf::from),
            remote_root: var("DBSYNC_REMOTE_ROOT"),
            db_dir: var("DBSYNC_DB_DIR"),
            webhook_url: var("DBSYNC_WEBHOOK_URL"),
            user: var("DBSYNC_USER"),
            host: var("DBSYNC_HOST"),
        }
    }

    pub fn or(self, fallback: Self) -> Self {
        Self {
            config: self.config.or(fallback.config),
            remote_root: self.remote_root.or(fallback.remote_root),
            db_dir: self.db_dir.or(fallback.db_dir),
            webhook_url: self.webhook_url.or(fallback.webhook_url),
            user: self.user.or(fallback.user),
            host: self.host.or(fallback.host),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub project_root: PathBuf,
    /// Remote root, always ending in `/`.
    pub remote_root: String,
    pub db_dir: PathBuf,
    pub webhook_url: Option<Url>,
    pub rclone_binary: String,
    pub transfer: TransferOptions,
    pub identity: Identity,
}

impl Config {
    /// Finds and reads the config file, then applies `overrides`.
    ///
    /// Without a file, the overrides alone must supply the remote root and the
    /// database directory; the working directory becomes the project root.
    pub fn load(overrides: Overrides) -> Result<Self, ConfigError> {
        let cwd = env::current_dir().map_err(|source| ConfigError::Read {
            path: PathBuf::from("."),
            source,
        })?;
        let path = match overrides.config.clone() {
            Some(path) => Some(path),
            None => find_config(&cwd),
        };
        match path {
            Some(path) => {
                debug!("reading configuration from {}", path.display());
                let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                let root = path
                    .parent()
                    .map(Path::to_path_buf)
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or(cwd);
                Self::from_toml_str(&text, root, overrides)
            }
            None if overrides.remote_root.is_some() && overrides.db_dir.is_some() => {
                Self::from_toml_str("", cwd, overrides)
            }
            None => Err(ConfigError::NotFound(cwd)),
        }
    }

    pub fn from_toml_str(
        text: &str,
        project_root: PathBuf,
        overrides: Overrides,
    ) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text)?;
        let section = file.dbsync;

        let remote_root = overrides
            .remote_root
            .or(section.remote_root)
            .filter(|r| !r.trim().is_empty())
            .ok_or(ConfigError::Missing("remote_root"))?;
        let remote_root = if remote_root.ends_with('/') || remote_root.ends_with(':') {
            remote_root
        } else {
            format!("{remote_root}/")
        };

        let db_dir = overrides
            .db_dir
            .or(section.db_dir)
            .filter(|d| !d.trim().is_empty())
            .ok_or(ConfigError::Missing("db_dir"))?;
        let db_dir = PathBuf::from(db_dir);
        let db_dir = if db_dir.is_absolute() {
            db_dir
        } else {
            project_root.join(db_dir)
        };

        let webhook_url = overrides
            .webhook_url
            .or(section.webhook_url)
            .filter(|u| !u.trim().is_empty())
            .map(|url| Url::parse(&url).map_err(|source| ConfigError::InvalidUrl { url, source }))
            .transpose()?;

        let defaults = TransferOptions::default();
        let transfer = TransferOptions {
            retries: section.retries.unwrap_or(defaults.retries),
            low_level_retries: section
                .low_level_retries
                .unwrap_or(defaults.low_level_retries),
            retries_sleep: section
                .retries_sleep_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.retries_sleep),
        };

        let (detected_user, detected_host) = detect_identity();
        let identity = Identity::new(
            &overrides.user.unwrap_or(detected_user),
            &overrides.host.unwrap_or(detected_host),
        );

        Ok(Self {
            project_root,
            remote_root,
            db_dir,
            webhook_url,
            rclone_binary: section.rclone_binary.unwrap_or_else(|| "rclone".to_string()),
            transfer,
            identity,
        })
    }

    pub fn lock_dir(&self) -> String {
        join_remote(&self.remote_root, "lock/")
    }

    pub fn version_dir(&self) -> String {
        join_remote(&self.remote_root, "version/")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.project_root.join(STATE_DIR_NAME)
    }

    pub fn anchor_dir(&self) -> PathBuf {
        self.state_dir().join("local-version")
    }

    pub fn hash_cache_path(&self) -> PathBuf {
        self.state_dir().join("hash.json")
    }

    pub fn log_path(&self) -> PathBuf {
        self.state_dir().join("dbsync.log")
    }
}

pub fn find_config(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .find(|candidate| candidate.is_file())
}

pub fn detect_identity() -> (String, String) {
    use nix::unistd::{gethostname, getuid, User};

    let user = match User::from_uid(getuid()) {
        Ok(Some(user)) => user.name,
        _ => env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
    };
    let host = gethostname()
        .ok()
        .map(OsString::into_string)
        .and_then(Result::ok)
        .unwrap_or_else(|| "unknown".to_string());
    (user, host)
}

/// A project rooted at `project_root` with its databases in `db/` and the
/// remote at `r:dbs/`.
#[cfg(test)]
pub(crate) fn test_config(project_root: &Path, identity: &Identity) -> Config {
    Config {
        project_root: project_root.to_path_buf(),
        remote_root: "r:dbs/".to_string(),
        db_dir: project_root.join("db"),
        webhook_url: None,
        rclone_binary: "rclone".to_string(),
        transfer: TransferOptions::default(),
        identity: identity.clone(),
    }
}
