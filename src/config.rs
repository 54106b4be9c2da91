//! Bridge configuration (TOML file plus environment overlay)
//!
//! ```toml
//! [locking]
//! wait = true
//!
//! [errors]
//! max_message_len = 1024
//! separator = "\n"
//!
//! [lifecycle]
//! warn_on_implicit_failure = true
//! defer_reentrant_release = true
//!
//! [logging]
//! level = "info"
//! format = "compact"
//! ```

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub locking: LockingConfig,

    #[serde(default)]
    pub errors: ErrorsConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockingConfig {
    /// Block on a per-object lock held by another thread instead of failing
    #[serde(default = "default_true")]
    pub wait: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorsConfig {
    /// Accumulated native messages are cut at this many bytes
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,

    #[serde(default = "default_separator")]
    pub separator: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Log failed implicit (drop-driven) releases at warn rather than debug
    #[serde(default = "default_true")]
    pub warn_on_implicit_failure: bool,

    /// Queue releases requested inside a guarded call until the next call;
    /// when off they are performed in place
    #[serde(default = "default_true")]
    pub defer_reentrant_release: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Log file path; console output when absent
    #[serde(default)]
    pub file: Option<String>,

    #[serde(default)]
    pub spans: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    #[default]
    Compact,
    Json,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self { wait: true }
    }
}

impl Default for ErrorsConfig {
    fn default() -> Self {
        Self {
            max_message_len: default_max_message_len(),
            separator: default_separator(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            warn_on_implicit_failure: true,
            defer_reentrant_release: true,
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
            file: None,
            spans: false,
        }
    }
}

fn default_true() -> bool { true }
fn default_max_message_len() -> usize { 1024 }
fn default_separator() -> String { "\n".to_string() }
fn default_level() -> String { "info".to_string() }

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("Failed to read {}: {}", path.display(), e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| BridgeError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Defaults overlaid with `ASTBRIDGE_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Overlay `ASTBRIDGE_LOCK_WAIT` and `ASTBRIDGE_MAX_MESSAGE_LEN`
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var("ASTBRIDGE_LOCK_WAIT") {
            self.locking.wait = match value.to_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                other => {
                    return Err(BridgeError::Config(format!(
                        "ASTBRIDGE_LOCK_WAIT must be a boolean, not \"{}\"",
                        other
                    )))
                }
            };
        }

        if let Ok(value) = std::env::var("ASTBRIDGE_MAX_MESSAGE_LEN") {
            self.errors.max_message_len = value.trim().parse().map_err(|_| {
                BridgeError::Config(format!(
                    "ASTBRIDGE_MAX_MESSAGE_LEN must be a byte count, not \"{}\"",
                    value
                ))
            })?;
        }

        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| BridgeError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml()?;
        fs::write(path, content)
            .map_err(|e| BridgeError::Config(format!("Failed to write {}: {}", path.display(), e)))
    }
}
