//! Layer configuration.
//!
//! Three layers, later wins: built-in defaults, an optional TOML file, and
//! `LGN_VALIDATION_*` environment overrides. The bootstrap keys the loader
//! consumes at process start are surfaced separately.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io failure reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed configuration: {0}")]
    Malformed(#[from] toml::de::Error),
    #[error("invalid override {key}={value}")]
    InvalidOverride { key: String, value: String },
}

pub type Result<T, E = ConfigError> = std::result::Result<T, E>;

/// Export stream provisioning strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllocationModeConfig {
    LocalCommandBuffer,
    GlobalCyclicBufferNoOverwrite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayerConfig {
    pub shader_worker_count: usize,
    pub pipeline_worker_count: usize,

    pub cache_path: Option<PathBuf>,
    pub cache_flush_threshold: u32,
    pub cache_growth_factor: f32,

    pub allocation_mode: AllocationModeConfig,
    /// Live-segment cap per queue in local mode.
    pub max_live_segments: usize,

    pub synchronous_recording: bool,

    pub endpoint_address: String,
    pub endpoint_port: u16,

    /// Tracked texels; zero selects the format maximum.
    pub texel_capacity: u64,

    pub bypass_signing: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            shader_worker_count: 4,
            pipeline_worker_count: 4,
            cache_path: None,
            cache_flush_threshold: 32,
            cache_growth_factor: 1.5,
            allocation_mode: AllocationModeConfig::LocalCommandBuffer,
            max_live_segments: 64,
            synchronous_recording: false,
            endpoint_address: "127.0.0.1".to_string(),
            endpoint_port: 42_110,
            texel_capacity: 0,
            bypass_signing: true,
        }
    }
}

impl LayerConfig {
    /// Load the configuration: defaults, then `path` when given, then the
    /// environment.
    ///
    /// # Errors
    ///
    /// Fails on unreadable or malformed files and on unparsable override
    /// values; a missing file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = path {
            match std::fs::read_to_string(path) {
                Ok(contents) => {
                    config = toml::from_str(&contents)?;
                }
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(ConfigError::Io {
                        path: path.to_path_buf(),
                        source,
                    })
                }
            }
        }

        config.apply_environment(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `LGN_VALIDATION_*` overrides from an environment reader.
    ///
    /// # Errors
    ///
    /// Fails on unparsable values.
    pub fn apply_environment(
        &mut self,
        reader: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        if let Some(value) = reader("LGN_VALIDATION_SYNCHRONOUS_RECORDING") {
            self.synchronous_recording = parse_bool("LGN_VALIDATION_SYNCHRONOUS_RECORDING", &value)?;
        }
        if let Some(value) = reader("LGN_VALIDATION_CACHE_PATH") {
            self.cache_path = Some(PathBuf::from(value));
        }
        if let Some(value) = reader("LGN_VALIDATION_ENDPOINT_PORT") {
            self.endpoint_port = value.parse().map_err(|_| ConfigError::InvalidOverride {
                key: "LGN_VALIDATION_ENDPOINT_PORT".to_string(),
                value,
            })?;
        }
        if let Some(value) = reader("LGN_VALIDATION_TEXEL_CAPACITY") {
            self.texel_capacity = value.parse().map_err(|_| ConfigError::InvalidOverride {
                key: "LGN_VALIDATION_TEXEL_CAPACITY".to_string(),
                value,
            })?;
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidOverride {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Environment handed to the process by the loader at startup.
#[derive(Debug, Clone, Default)]
pub struct BootstrapEnvironment {
    pub startup_environment: Option<String>,
    pub reserved_token: Option<String>,
    pub capture_child_processes: bool,
    pub attach_all_devices: bool,
    pub no_service_trap: bool,
}

impl BootstrapEnvironment {
    pub fn from_process_environment() -> Self {
        Self::from_reader(|key| std::env::var(key).ok())
    }

    pub fn from_reader(reader: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| {
            reader(key)
                .map(|value| value != "0" && !value.is_empty())
                .unwrap_or(false)
        };

        Self {
            startup_environment: reader("STARTUP_ENVIRONMENT"),
            reserved_token: reader("RESERVED_TOKEN"),
            capture_child_processes: flag("CAPTURE_CHILD_PROCESSES"),
            attach_all_devices: flag("ATTACH_ALL_DEVICES"),
            no_service_trap: flag("NO_SERVICE_TRAP"),
        }
    }
}
