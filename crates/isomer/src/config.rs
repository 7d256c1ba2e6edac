//! Configuration file support.
//!
//! Loads and validates isomer configuration from TOML files.
//! Default location: /etc/isomer/isomer.toml

use isomer_types::Protocol;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::binding::Binding;
use crate::error::{IsomerError, Result};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/isomer/isomer.toml";

/// Kernel table sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablesConfig {
    /// Capacity of the bindings table
    #[serde(default = "default_max_bindings")]
    pub max_bindings: usize,

    /// Capacity of the destinations, sockets and metrics tables
    #[serde(default = "default_max_destinations")]
    pub max_destinations: usize,
}

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

/// A binding as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingConfig {
    pub label: String,
    pub protocol: Protocol,
    /// Address or CIDR prefix
    pub prefix: String,
    /// 0 matches any port
    #[serde(default)]
    pub port: u16,
}

impl BindingConfig {
    pub fn to_binding(&self) -> Result<Binding> {
        Binding::new(self.label.as_str(), self.protocol, &self.prefix, self.port)
    }
}

impl From<&Binding> for BindingConfig {
    fn from(binding: &Binding) -> Self {
        Self {
            label: binding.label().to_string(),
            protocol: binding.protocol(),
            prefix: binding.prefix().to_string(),
            port: binding.port(),
        }
    }
}

/// Complete isomer configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsomerConfig {
    #[serde(default)]
    pub tables: TablesConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Desired bindings, applied with `Dispatcher::replace_bindings`
    #[serde(default)]
    pub bindings: Vec<BindingConfig>,
}

fn default_max_bindings() -> usize {
    4096
}

fn default_max_destinations() -> usize {
    512
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TablesConfig {
    fn default() -> Self {
        Self {
            max_bindings: default_max_bindings(),
            max_destinations: default_max_destinations(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl IsomerConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content).map_err(|e| match e {
                IsomerError::Config(msg) => {
                    IsomerError::Config(format!("{}: {}", path.display(), msg))
                }
                other => other,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(IsomerError::Io(e)),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> Result<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| IsomerError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| IsomerError::Config(format!("failed to serialize config: {}", e)))?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.tables.max_bindings == 0 {
            return Err(IsomerError::Config("max_bindings must be > 0".to_string()));
        }
        if self.tables.max_destinations == 0 {
            return Err(IsomerError::Config(
                "max_destinations must be > 0".to_string(),
            ));
        }
        if self.bindings.len() > self.tables.max_bindings {
            return Err(IsomerError::Config(format!(
                "{} bindings exceed max_bindings {}",
                self.bindings.len(),
                self.tables.max_bindings
            )));
        }
        self.desired_bindings().map(|_| ())
    }

    /// Converts the configured bindings, most specific first.
    pub fn desired_bindings(&self) -> Result<Vec<Binding>> {
        let mut bindings = self
            .bindings
            .iter()
            .map(BindingConfig::to_binding)
            .collect::<Result<Vec<_>>>()?;
        bindings.sort();
        Ok(bindings)
    }
}
