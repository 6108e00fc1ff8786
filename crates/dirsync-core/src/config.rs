//! Configuration for hub and peer processes
//!
//! Loaded from a TOML file; every key is optional and falls back to the
//! defaults below.
//!
//! ```toml
//! root = "/srv/project"
//! password = "shared secret"
//! host = "0.0.0.0"
//! port = 5151
//! ignored = ["__pycache__", ".git", ".code-workspace"]
//! debounce_ms = 1000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::types::IgnoreList;

/// Default TCP port the hub listens on
pub const DEFAULT_PORT: u16 = 5151;

/// Default debounce window in milliseconds
pub const DEFAULT_DEBOUNCE_MS: u64 = 1000;

/// Default file name looked up in the dirsync home directory
pub const CONFIG_FILE: &str = "config.toml";

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_ignored() -> Vec<String> {
    vec![
        "__pycache__".to_string(),
        ".git".to_string(),
        ".code-workspace".to_string(),
    ]
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

/// Settings shared by the hub and peer roles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Directory being mirrored
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Shared secret checked at bootstrap
    #[serde(default)]
    pub password: String,

    /// Address the hub binds to, or the hub address a peer connects to
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Path substrings excluded from synchronization
    #[serde(default = "default_ignored")]
    pub ignored: Vec<String>,

    /// Echo suppression window in milliseconds
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            password: String::new(),
            host: default_host(),
            port: default_port(),
            ignored: default_ignored(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> SyncResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(text: &str) -> SyncResult<Self> {
        toml::from_str(text).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Render as TOML, as accepted by [`SyncConfig::from_toml`]
    pub fn to_toml(&self) -> SyncResult<String> {
        toml::to_string(self).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Check that the configuration is usable for a connection
    pub fn validate(&self) -> SyncResult<()> {
        if self.password.is_empty() {
            return Err(SyncError::Config("password must not be empty".into()));
        }
        if self.host.trim().is_empty() {
            return Err(SyncError::Config("host must not be empty".into()));
        }
        Ok(())
    }

    /// `host:port` string for binding or connecting
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn ignore_list(&self) -> IgnoreList {
        IgnoreList::new(self.ignored.iter().cloned())
    }
}
