use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from gpu-probe.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct ProbeConfig {
    pub elevation: ElevationConfig,
    pub sampler: SamplerConfig,
    pub status: StatusConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ElevationConfig {
    /// Elevation program, normally `sudo`.
    pub program: String,
    /// Arguments placed before the mode flags (`-S -v` / `-n`).
    pub args: Vec<String>,
    pub validate_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Upper bound for one sampling invocation. 0 disables the timeout.
    pub timeout_secs: u64,
    /// Failed cycles in a row before the session gives up. 0 never gives up.
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    pub file: PathBuf,
}

// --- Default implementations ---

impl Default for ElevationConfig {
    fn default() -> Self {
        Self {
            program: "sudo".to_string(),
            args: Vec::new(),
            validate_timeout_secs: 30,
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_consecutive_failures: 30,
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            file: PathBuf::from("/tmp/gpu_probe.status"),
        }
    }
}

impl StatusConfig {
    /// The snapshot path, or `None` when the snapshot is disabled.
    pub fn path(&self) -> Option<&Path> {
        self.enabled.then_some(self.file.as_path())
    }
}

/// Errors from loading the configuration file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "invalid config {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

/// Load config from `path`. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<ProbeConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(ProbeConfig::default());
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
