//! Configuration loading and key material.
//!
//! The config lives at `$HOME/.goixy/config.json`. An absent file is
//! tolerated: the proxy starts with empty upstreams and every dial fails
//! per-connection until one is configured.

use crate::crypto::{self, KEY_LEN};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

const CONFIG_DIR: &str = ".goixy";
const CONFIG_FILE: &str = "config.json";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot determine home directory")]
    NoHome,

    #[error("failed to read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Process exit code for this failure: an existing-but-unreadable
    /// config file exits 1, everything else exits 2.
    pub fn exit_code(&self) -> i32 {
        match self {
            ConfigError::Unreadable { .. } => 1,
            _ => 2,
        }
    }
}

/// On-disk schema. Ports are strings and keys are passphrases; both are
/// resolved into [`Config`] at load time.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct RawConfig {
    host: String,
    port: String,
    key: String,
    white_list: Vec<String>,
    direct_host: String,
    direct_port: String,
    direct_key: String,
}

/// One of the two relays a destination can be routed to.
#[derive(Debug, Clone)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
    pub key: [u8; KEY_LEN],
}

impl Upstream {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Resolved configuration, immutable after startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upstream for whitelisted destination hosts.
    pub routed: Upstream,
    /// Upstream for everything else.
    pub direct: Upstream,
    /// Regex patterns deciding which hosts go to `routed`.
    pub whitelist: Vec<String>,
}

impl Config {
    /// Load from `$HOME/.goixy/config.json`.
    pub fn load() -> Result<Self, ConfigError> {
        let home = std::env::var_os("HOME").ok_or(ConfigError::NoHome)?;
        let path = Path::new(&home).join(CONFIG_DIR).join(CONFIG_FILE);
        Self::load_from(&path)
    }

    /// Load from an explicit path. A missing file yields the empty config.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Self::from_raw(RawConfig::default());
        }

        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&data)
    }

    /// Parse the JSON schema and resolve ports and keys.
    pub fn from_json(data: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_json::from_str(data).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let key = crypto::derive_key(&raw.key);
        // The direct relay inherits the primary key when none is given.
        let direct_key = if raw.direct_key.is_empty() {
            key
        } else {
            crypto::derive_key(&raw.direct_key)
        };

        Ok(Self {
            routed: Upstream {
                host: raw.host,
                port: parse_port(&raw.port)?,
                key,
            },
            direct: Upstream {
                host: raw.direct_host,
                port: parse_port(&raw.direct_port)?,
                key: direct_key,
            },
            whitelist: raw.white_list,
        })
    }
}

fn parse_port(port: &str) -> Result<u16, ConfigError> {
    if port.is_empty() {
        return Ok(0);
    }
    port.parse()
        .map_err(|_| ConfigError::Invalid(format!("bad port: {port:?}")))
}
