use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::server::listener::{DEFAULT_IDLE_TIMEOUT_MS, DEFAULT_REQUEST_TIMEOUT_MS, ListenerBuilder};

/// Environment variable naming a YAML configuration file.
pub const CONFIG_PATH_ENV: &str = "CONTROL_HTTP_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid listen address {0:?}")]
    InvalidListenAddr(String),
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub request_timeout_ms: i64,
    pub idle_timeout_ms: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8000".to_string(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
        }
    }
}

impl Config {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    /// File named by `CONTROL_HTTP_CONFIG` (or defaults), then the
    /// `LISTEN`, `REQUEST_TIMEOUT_MS` and `IDLE_TIMEOUT_MS` overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut cfg = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        cfg.apply_overrides(|var| std::env::var(var).ok())?;
        Ok(cfg)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("LISTEN") {
            self.server.listen_addr = addr;
        }
        if let Some(ms) = lookup("REQUEST_TIMEOUT_MS") {
            self.server.request_timeout_ms = parse_millis("REQUEST_TIMEOUT_MS", ms)?;
        }
        if let Some(ms) = lookup("IDLE_TIMEOUT_MS") {
            self.server.idle_timeout_ms = parse_millis("IDLE_TIMEOUT_MS", ms)?;
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .listen_addr
            .parse()
            .map_err(|_| ConfigError::InvalidListenAddr(self.server.listen_addr.clone()))
    }

    /// Builder with endpoint and timeouts filled in; the factory is left to
    /// the caller.
    pub fn listener_builder(&self) -> Result<ListenerBuilder, ConfigError> {
        Ok(ListenerBuilder::new()
            .endpoint(self.listen_addr()?)
            .request_timeout_ms(self.server.request_timeout_ms)
            .idle_timeout_ms(self.server.idle_timeout_ms))
    }
}

fn parse_millis(var: &'static str, value: String) -> Result<i64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}
