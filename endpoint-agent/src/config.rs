//! Configuration management with atomic persistence
//!
//! Handles:
//! - Endpoint identity (id, remote hosts, shared secret)
//! - Key material written by the registration handshake
//! - Transport and check runner tunables
//! - Cross-platform storage location

use crate::errors::AgentError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "ENDPOINT_AGENT_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigData {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub remote_hosts: Vec<String>,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub server_public_key: String,
    #[serde(default)]
    pub disk: DiskConfig,
    #[serde(default)]
    pub transport: TransportOptions,
    #[serde(default)]
    pub checks: CheckOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Filesystem types to skip, replaces the built-in list when set
    #[serde(default)]
    pub ignores: Option<Vec<String>>,
}

/// Buffer sizes and timings of the stream transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    pub primary_capacity: usize,
    pub secondary_capacity: usize,
    pub in_flight_capacity: usize,
    /// Headroom kept free in every buffer before overflowing
    pub overflow_margin: usize,
    pub swap_interval_secs: u64,
    pub write_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub ping_wait_secs: u64,
    pub handshake_timeout_secs: u64,
    pub reconnect_delay_ms: u64,
    /// Use http/ws instead of https/wss, for local development collectors
    pub plaintext: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            primary_capacity: 1100,
            secondary_capacity: 50100,
            in_flight_capacity: 1100,
            overflow_margin: 100,
            swap_interval_secs: 180,
            write_timeout_secs: 10,
            ping_interval_secs: 30,
            ping_wait_secs: 40,
            handshake_timeout_secs: 45,
            reconnect_delay_ms: 1000,
            plaintext: false,
        }
    }
}

impl TransportOptions {
    pub fn swap_interval(&self) -> Duration {
        Duration::from_secs(self.swap_interval_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn ping_wait(&self) -> Duration {
        Duration::from_secs(self.ping_wait_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn http_scheme(&self) -> &'static str {
        if self.plaintext { "http" } else { "https" }
    }

    pub fn ws_scheme(&self) -> &'static str {
        if self.plaintext { "ws" } else { "wss" }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckOptions {
    /// Upper bound on checks executing at the same time
    pub max_concurrent: usize,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self { max_concurrent: 64 }
    }
}

/// Everything the transport needs before it may connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub remote_host: String,
    pub secret: String,
    pub public_key: String,
    pub private_key: String,
    pub server_public_key: String,
}

impl ConfigData {
    pub fn remote_host(&self) -> Option<&str> {
        self.remote_hosts
            .first()
            .map(String::as_str)
            .filter(|h| !h.is_empty())
    }

    /// Check the fields registration itself depends on
    pub fn validate_registration(&self) -> Result<(), AgentError> {
        if self.id.is_empty() {
            return Err(AgentError::parse("endpoint: Config missing ID"));
        }
        if self.remote_host().is_none() {
            return Err(AgentError::parse("endpoint: Config missing remote host"));
        }
        if self.secret.is_empty() {
            return Err(AgentError::parse("endpoint: Config missing secret"));
        }
        Ok(())
    }

    pub fn needs_registration(&self) -> bool {
        self.public_key.is_empty()
            || self.private_key.is_empty()
            || self.server_public_key.is_empty()
    }

    /// Identity usable by the transport, or an error naming the missing piece
    pub fn identity(&self) -> Result<Identity, AgentError> {
        self.validate_registration()?;
        if self.needs_registration() {
            return Err(AgentError::parse("endpoint: Config missing key material"));
        }

        Ok(Identity {
            id: self.id.clone(),
            remote_host: self.remote_host().unwrap_or_default().to_string(),
            secret: self.secret.clone(),
            public_key: self.public_key.clone(),
            private_key: self.private_key.clone(),
            server_public_key: self.server_public_key.clone(),
        })
    }
}

/// Config store shared by the handshake, the transport and the producers
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    data: RwLock<ConfigData>,
}

impl ConfigStore {
    /// Store backed by `path` holding `data`, without touching the disk
    pub fn new(path: impl Into<PathBuf>, data: ConfigData) -> Self {
        Self {
            path: path.into(),
            data: RwLock::new(data),
        }
    }

    /// Load from `path`; a missing file yields defaults
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, AgentError> {
        let path = path.into();

        let data = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| AgentError::read("config: File read error", e))?;
            toml::from_str(&content)
                .map_err(|e| AgentError::read("config: File unmarshal error", e))?
        } else {
            ConfigData::default()
        };

        Ok(Self::new(path, data))
    }

    /// Load from the default location, creating the file when absent
    pub async fn init() -> Result<Self, AgentError> {
        let path = Self::config_file_path()?;
        let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
        let store = Self::load(path).await?;
        if !exists {
            store.save().await?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> ConfigData {
        self.data.read().clone()
    }

    pub fn set<F>(&self, update: F)
    where
        F: FnOnce(&mut ConfigData),
    {
        let mut data = self.data.write();
        update(&mut *data);
    }

    /// Write to a temp file next to the target, then rename over it
    pub async fn save(&self) -> Result<(), AgentError> {
        let content = toml::to_string_pretty(&self.get())
            .map_err(|e| AgentError::write("config: File marshal error", e))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| AgentError::write("config: Failed to create config dir", e))?;
            }
        }

        let tmp_path = self.path.with_extension("toml.tmp");
        tokio::fs::write(&tmp_path, content)
            .await
            .map_err(|e| AgentError::write("config: File write error", e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| AgentError::write("config: File permission error", e))?;
        }

        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| AgentError::write("config: File rename error", e))?;

        Ok(())
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf, AgentError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.is_empty() {
                return Ok(PathBuf::from(path));
            }
        }

        let mut path = dirs::config_dir()
            .ok_or_else(|| AgentError::parse("config: Could not find config directory"))?;
        path.push("endpoint-agent");
        path.push("config.toml");
        Ok(path)
    }
}
