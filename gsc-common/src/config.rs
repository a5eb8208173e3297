//! Daemon configuration.
//!
//! Loaded from a TOML file; every section is optional and falls back to
//! defaults. `validate` runs once at startup: it canonicalizes the explorer
//! root (the path guard compares against normalized absolute components),
//! checks the supervised command is non-empty, and resolves the child
//! encoding label.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use encoding_rs::Encoding;
use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("server.command must not be empty")]
    EmptyCommand,

    #[error("server.encoding label {0:?} is not a known encoding")]
    UnknownEncoding(String),

    #[error("explorer.root {0} is not an existing directory")]
    BadRoot(PathBuf),

    #[error("server.working_dir {0} is not an existing directory")]
    BadWorkingDir(PathBuf),
}

/// The supervised child process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Command and arguments, e.g. `["java", "-jar", "server.jar", "nogui"]`.
    pub command: Vec<String>,
    /// Working directory the child runs in.
    pub working_dir: PathBuf,
    /// Text encoding of the child's console. `"shift_jis"` for legacy
    /// Windows game servers, `"utf-8"` everywhere else. Never auto-detected.
    pub encoding: String,
    /// Start the child as soon as the daemon boots.
    pub autostart: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            working_dir: PathBuf::from("."),
            encoding: "utf-8".to_string(),
            autostart: false,
        }
    }
}

/// Console transcript sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsoleConfig {
    /// Bytes of transcript replayed to a newly connected client.
    pub replay_bytes: usize,
    /// Rolling transcript cap; oldest bytes are trimmed first.
    pub transcript_limit: usize,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            replay_bytes: 1_000_000,
            transcript_limit: 4 * 1024 * 1024,
        }
    }
}

/// File explorer confinement root.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExplorerConfig {
    pub root: PathBuf,
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
        }
    }
}

/// HTTP listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub bind: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".parse().expect("static default address"),
        }
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub console: ConsoleConfig,
    pub explorer: ExplorerConfig,
    pub http: HttpConfig,
}

impl Config {
    /// Read and parse a config file, then validate it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate and normalize in place.
    ///
    /// Canonicalizes `explorer.root` and `server.working_dir` so the path
    /// guard's prefix comparison operates on a normalized root.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.server.command.is_empty() {
            return Err(ConfigError::EmptyCommand);
        }
        if Encoding::for_label(self.server.encoding.as_bytes()).is_none() {
            return Err(ConfigError::UnknownEncoding(self.server.encoding.clone()));
        }

        self.explorer.root = self
            .explorer
            .root
            .canonicalize()
            .map_err(|_| ConfigError::BadRoot(self.explorer.root.clone()))?;
        if !self.explorer.root.is_dir() {
            return Err(ConfigError::BadRoot(self.explorer.root.clone()));
        }

        self.server.working_dir = self
            .server
            .working_dir
            .canonicalize()
            .map_err(|_| ConfigError::BadWorkingDir(self.server.working_dir.clone()))?;
        if !self.server.working_dir.is_dir() {
            return Err(ConfigError::BadWorkingDir(self.server.working_dir.clone()));
        }
        Ok(())
    }

    /// The child console encoding. Only valid after [`Config::validate`].
    pub fn child_encoding(&self) -> &'static Encoding {
        Encoding::for_label(self.server.encoding.as_bytes()).unwrap_or(encoding_rs::UTF_8)
    }
}
