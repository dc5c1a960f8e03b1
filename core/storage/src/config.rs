//! Storage configuration.
//!
//! Loaded from an optional JSON file, then overridden from the environment.
//! The environment lookup is injectable so overrides can be tested without
//! touching the process environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use fleetsync_common::{parse_flag, DeploymentMode, Error, Result, Secret};

pub const ENV_DISCONNECTED: &str = "FLEETSYNC_DISCONNECTED";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_POOL_MAX: &str = "FLEETSYNC_DB_POOL_MAX";
pub const ENV_IDLE_TIMEOUT: &str = "FLEETSYNC_DB_IDLE_TIMEOUT_SECS";
pub const ENV_CONNECT_TIMEOUT: &str = "FLEETSYNC_DB_CONNECT_TIMEOUT_SECS";
pub const ENV_DATA_DIR: &str = "FLEETSYNC_DATA_DIR";
pub const ENV_DB_FILE: &str = "FLEETSYNC_DB_FILE";
pub const ENV_REPLICA_URL: &str = "FLEETSYNC_REPLICA_URL";
pub const ENV_REPLICA_TOKEN: &str = "FLEETSYNC_REPLICA_TOKEN";
pub const ENV_REPLICA_INTERVAL: &str = "FLEETSYNC_REPLICA_SYNC_INTERVAL_SECS";
pub const ENV_ENCRYPTION_KEY: &str = "FLEETSYNC_ENCRYPTION_KEY";

/// Connection pool bounds for the connected backend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub idle_timeout_secs: u64,
    /// Bounds both the initial connect and every later acquire.
    pub connect_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            idle_timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

impl PoolSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Remote replica settings for disconnected nodes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplicaSettings {
    pub url: Option<String>,
    pub auth_token: Option<Secret>,
    pub sync_interval_secs: u64,
    pub request_timeout_secs: u64,
    /// Identifies this node to the replica. Defaults to a random id per process.
    pub node_id: Option<String>,
}

impl Default for ReplicaSettings {
    fn default() -> Self {
        Self {
            url: None,
            auth_token: None,
            sync_interval_secs: 60,
            request_timeout_secs: 30,
            node_id: None,
        }
    }
}

impl ReplicaSettings {
    /// URL and token, when both are present and non-empty.
    pub fn credentials(&self) -> Option<(&str, &Secret)> {
        let url = self.url.as_deref().filter(|u| !u.trim().is_empty())?;
        let token = self.auth_token.as_ref().filter(|t| !t.is_empty())?;
        Some((url, token))
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Everything the deployment mode provider needs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub mode: DeploymentMode,
    pub database_url: Option<Secret>,
    pub pool: PoolSettings,
    pub data_dir: PathBuf,
    pub database_file: String,
    pub replica: ReplicaSettings,
    pub encryption_key: Option<Secret>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: DeploymentMode::Connected,
            database_url: None,
            pool: PoolSettings::default(),
            data_dir: PathBuf::from("./data"),
            database_file: "fleet.db".to_string(),
            replica: ReplicaSettings::default(),
            encryption_key: None,
        }
    }
}

impl StorageConfig {
    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_DISCONNECTED) {
            let flag = parse_flag(&raw).ok_or_else(|| {
                Error::Config(format!("{} must be a boolean, got '{}'", ENV_DISCONNECTED, raw))
            })?;
            self.mode = DeploymentMode::from_disconnected_flag(flag);
        }
        if let Some(url) = lookup(ENV_DATABASE_URL) {
            self.database_url = Some(Secret::new(url));
        }
        if let Some(v) = parse_env_var(&lookup, ENV_POOL_MAX)? {
            self.pool.max_connections = v;
        }
        if let Some(v) = parse_env_var(&lookup, ENV_IDLE_TIMEOUT)? {
            self.pool.idle_timeout_secs = v;
        }
        if let Some(v) = parse_env_var(&lookup, ENV_CONNECT_TIMEOUT)? {
            self.pool.connect_timeout_secs = v;
        }
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(file) = lookup(ENV_DB_FILE) {
            self.database_file = file;
        }
        if let Some(url) = lookup(ENV_REPLICA_URL) {
            self.replica.url = Some(url);
        }
        if let Some(token) = lookup(ENV_REPLICA_TOKEN) {
            self.replica.auth_token = Some(Secret::new(token));
        }
        if let Some(v) = parse_env_var(&lookup, ENV_REPLICA_INTERVAL)? {
            self.replica.sync_interval_secs = v;
        }
        if let Some(key) = lookup(ENV_ENCRYPTION_KEY) {
            self.encryption_key = Some(Secret::new(key));
        }
        Ok(())
    }

    /// Full path of the local database file.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    /// Check settings that would otherwise fail later with a less useful error.
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_connections == 0 {
            return Err(Error::Config("pool.max_connections must be at least 1".to_string()));
        }
        if self.mode.is_disconnected() {
            if self.database_file.trim().is_empty() {
                return Err(Error::Config("database_file cannot be empty".to_string()));
            }
            if self.replica.sync_interval_secs == 0 {
                return Err(Error::Config(
                    "replica.sync_interval_secs must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Read and parse an optional variable, rejecting malformed values.
pub fn parse_env_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            Error::Config(format!("{} has an invalid value '{}'", key, raw))
        }),
    }
}
