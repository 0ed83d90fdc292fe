//! Configuration loaded with Figment.
//!
//! Sources, later ones overriding earlier ones:
//! 1. Built-in defaults
//! 2. `config/ctlab.toml` (or the path given to [`CtlabConfig::load_from`])
//! 3. Environment variables prefixed with `CTLAB_`, nested keys split on `__`
//!    (e.g. `CTLAB_BUS__PORT=10002`)
//!
//! # Example
//! ```no_run
//! use ctlab::{config::CtlabConfig, profiles, Connection};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = CtlabConfig::load()?;
//! let connection = Connection::from_config(&config.bus);
//! let modules = profiles::build_all(&config, &connection)?;
//! connection.connect().await?;
//! # Ok(())
//! # }
//! ```

use anyhow::{bail, Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/ctlab.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "CTLAB_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CtlabConfig {
    /// Bus gateway transport
    #[serde(default)]
    pub bus: BusConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Modules expected on the bus
    #[serde(default)]
    pub modules: Vec<ModuleDefinition>,
}

/// Bus gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusConfig {
    /// Gateway host name or address
    #[serde(default = "default_host")]
    pub host: String,
    /// Gateway TCP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bytes requested per transport read
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Return from reads when no data is queued
    #[serde(default)]
    pub nonblocking: bool,
    /// Timeout for event-driven queries in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            buffer_size: default_buffer_size(),
            nonblocking: false,
            request_timeout_ms: default_request_timeout(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored (development)
    #[default]
    Pretty,
    /// Single line, no colors
    Compact,
    /// JSON lines for log aggregation
    Json,
}

/// Device profile of a configured module.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    /// Regulated source/sink
    Dcg,
    /// Analog I/O breakout
    AdaIo,
    /// Electronic load
    Edl,
    /// No profile
    #[default]
    Generic,
}

/// A module expected on the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleDefinition {
    /// Bus id
    pub id: u8,
    /// Device profile
    #[serde(default)]
    pub profile: ProfileKind,
    /// Optional label for logs
    #[serde(default)]
    pub name: Option<String>,
}

impl ModuleDefinition {
    /// Unnamed module definition.
    pub fn new(id: u8, profile: ProfileKind) -> Self {
        Self {
            id,
            profile,
            name: None,
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    10001
}

fn default_buffer_size() -> usize {
    4096
}

fn default_request_timeout() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl CtlabConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` and the environment, then validate.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the bus layer cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.bus.host.trim().is_empty() {
            bail!("bus.host must not be empty");
        }
        if self.bus.port == 0 {
            bail!("bus.port must be non-zero");
        }
        if self.bus.buffer_size == 0 {
            bail!("bus.buffer_size must be at least 1");
        }

        crate::logging::parse_log_level(&self.logging.level)?;

        let mut ids = HashSet::new();
        for module in &self.modules {
            if !ids.insert(module.id) {
                bail!("Duplicate module id: {}", module.id);
            }
        }

        Ok(())
    }

    /// Definition for bus id `id`, if configured.
    pub fn module(&self, id: u8) -> Option<&ModuleDefinition> {
        self.modules.iter().find(|module| module.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CtlabConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bus.buffer_size, 4096);
        assert_eq!(config.bus.request_timeout_ms, 2000);
        assert!(!config.bus.nonblocking);
    }

    #[test]
    fn validation_rejects_bad_settings() {
        let mut config = CtlabConfig::default();
        config.bus.port = 0;
        assert!(config.validate().is_err());

        let mut config = CtlabConfig::default();
        config.bus.host = " ".into();
        assert!(config.validate().is_err());

        let mut config = CtlabConfig::default();
        config.logging.level = "verbose".into();
        assert!(config.validate().is_err());

        let mut config = CtlabConfig::default();
        config.modules = vec![
            ModuleDefinition::new(1, ProfileKind::Dcg),
            ModuleDefinition::new(1, ProfileKind::Edl),
        ];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate module id: 1"));
    }

    #[test]
    fn profile_names_are_lowercase() {
        let definition: ModuleDefinition =
            toml_from_str("id = 4\nprofile = \"adaio\"\nname = \"breakout\"");
        assert_eq!(definition.profile, ProfileKind::AdaIo);
        assert_eq!(definition.name.as_deref(), Some("breakout"));
    }

    fn toml_from_str<T: serde::de::DeserializeOwned>(text: &str) -> T {
        Figment::from(Toml::string(text)).extract().unwrap()
    }
}
