use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from probe.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ProbeConfig {
    pub server: ServerConfig,
    pub timing: TimingConfig,
}

/// The target server binary and its launch environment.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct ServerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Timeouts and pacing. Defaults match the smoke-check's historical
/// constants: 3s startup grace, 10s initialize, 5s tools/list, 100ms poll
/// quantum, 5s shutdown grace.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub startup_wait_secs: u64,
    pub init_timeout_secs: u64,
    pub list_timeout_secs: u64,
    pub poll_quantum_ms: u64,
    pub shutdown_grace_secs: u64,
}

// --- Default implementations ---

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            startup_wait_secs: 3,
            init_timeout_secs: 10,
            list_timeout_secs: 5,
            poll_quantum_ms: 100,
            shutdown_grace_secs: 5,
        }
    }
}

impl TimingConfig {
    pub fn startup_wait(&self) -> Duration {
        Duration::from_secs(self.startup_wait_secs)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    pub fn list_timeout(&self) -> Duration {
        Duration::from_secs(self.list_timeout_secs)
    }

    pub fn poll_quantum(&self) -> Duration {
        Duration::from_millis(self.poll_quantum_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to parse the config file as TOML.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// No server command given by config file or CLI.
    MissingCommand,
    /// A zero poll quantum would spin the poll loop.
    ZeroQuantum,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::MissingCommand => {
                write!(f, "no server command configured (set [server].command or pass one on the command line)")
            }
            ConfigError::ZeroQuantum => {
                write!(f, "[timing].poll_quantum_ms must be greater than zero")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::MissingCommand | ConfigError::ZeroQuantum => None,
        }
    }
}

impl ProbeConfig {
    /// Load from a TOML file. A missing file yields the defaults, so the
    /// tool runs with nothing but a command on the CLI.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Reject configurations the probe cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.command.is_empty() {
            return Err(ConfigError::MissingCommand);
        }
        if self.timing.poll_quantum_ms == 0 {
            return Err(ConfigError::ZeroQuantum);
        }
        Ok(())
    }
}
