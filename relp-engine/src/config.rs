//! Daemon configuration from file and environment.

use std::path::{Path, PathBuf};

use relp_core::frame::DEFAULT_MAX_DATA_LEN;
use relp_core::txn::{DEFAULT_TXNR_WRAP, DEFAULT_WINDOW_SIZE};
use relp_core::{Offers, SessionConfig, PROTOCOL_VERSION};
use serde::Deserialize;

use crate::listener::DEFAULT_PORT;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("no listen ports configured")]
    NoPorts,
}

/// Daemon configuration. File: ~/.config/relpd/config.toml or /etc/relpd/config.toml.
/// Env overrides: RELPD_LISTEN_PORTS (comma separated), RELPD_LISTEN_ADDRESS,
/// RELPD_WINDOW_SIZE, RELPD_MAX_DATA_LEN.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Ports to listen on (default 20514).
    #[serde(default = "default_listen_ports")]
    pub listen_ports: Vec<String>,
    /// Bind only this host; wildcard IPv4 and IPv6 when unset.
    #[serde(default)]
    pub listen_address: Option<String>,
    /// Outstanding commands per session (default 128).
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Transaction numbers wrap back to 1 at this value (default 1000).
    #[serde(default = "default_txnr_wrap")]
    pub txnr_wrap: u32,
    /// Largest accepted frame payload in bytes (default 128 KiB).
    #[serde(default = "default_max_data_len")]
    pub max_data_len: usize,
}

fn default_listen_ports() -> Vec<String> {
    vec![DEFAULT_PORT.to_string()]
}
fn default_window_size() -> usize {
    DEFAULT_WINDOW_SIZE
}
fn default_txnr_wrap() -> u32 {
    DEFAULT_TXNR_WRAP
}
fn default_max_data_len() -> usize {
    DEFAULT_MAX_DATA_LEN
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_ports: default_listen_ports(),
            listen_address: None,
            window_size: default_window_size(),
            txnr_wrap: default_txnr_wrap(),
            max_data_len: default_max_data_len(),
        }
    }
}

impl Config {
    pub fn from_toml(s: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply environment overrides. Unparsable values are logged and ignored.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("RELPD_LISTEN_PORTS") {
            let ports: Vec<String> = s
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
            if !ports.is_empty() {
                self.listen_ports = ports;
            }
        }
        if let Some(s) = var("RELPD_LISTEN_ADDRESS") {
            self.listen_address = Some(s).filter(|a| !a.is_empty());
        }
        if let Some(s) = var("RELPD_WINDOW_SIZE") {
            match s.parse() {
                Ok(n) => self.window_size = n,
                Err(_) => tracing::warn!(value = %s, "ignoring invalid RELPD_WINDOW_SIZE"),
            }
        }
        if let Some(s) = var("RELPD_MAX_DATA_LEN") {
            match s.parse() {
                Ok(n) => self.max_data_len = n,
                Err(_) => tracing::warn!(value = %s, "ignoring invalid RELPD_MAX_DATA_LEN"),
            }
        }
    }

    /// Session settings for the engine. Offers are the ones this build supports.
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        if self.listen_ports.is_empty() {
            return Err(ConfigError::NoPorts);
        }
        Ok(SessionConfig {
            window_size: self.window_size,
            txnr_wrap: self.txnr_wrap,
            max_data_len: self.max_data_len,
            offers: Offers::with_version(PROTOCOL_VERSION),
        })
    }
}

/// Load config: default, then the file (explicit path, else the first one
/// found in the search paths), then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(path) => load_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => load_file(&path)?,
            None => Config::default(),
        },
    };
    c.apply_env(|name| std::env::var(name).ok());
    Ok(c)
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Config::from_toml(&s, path)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/relpd/config.toml"));
    }
    out.push(PathBuf::from("/etc/relpd/config.toml"));
    out
}
