//! Console Configuration
//!
//! TOML configuration for the chatline console. Every field has a default,
//! so a missing file yields a fully usable configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Console configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Sidebar/console behavior
    #[serde(default)]
    pub console: ConsoleConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

/// Sidebar and thread view behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// Characters of the last message shown per sidebar row
    #[serde(default = "default_preview_length")]
    pub preview_length: usize,

    /// Conversation to open at startup; first ranked when unset
    #[serde(default)]
    pub open_conversation: Option<String>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            preview_length: default_preview_length(),
            open_conversation: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Tracing filter directive (overridden by RUST_LOG)
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_preview_length() -> usize {
    48
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Config {
    /// Default configuration file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chatline")
            .join("config.toml")
    }

    /// Load configuration from a file, falling back to defaults if missing
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config at {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.console.preview_length, 48);
        assert!(config.console.open_conversation.is_none());
        assert_eq!(config.log.filter, "info");
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [console]
            open_conversation = "conv-ana"
            "#,
        )
        .unwrap();
        assert_eq!(config.console.open_conversation.as_deref(), Some("conv-ana"));
        assert_eq!(config.console.preview_length, 48);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::load(Path::new("/nonexistent/chatline.toml")).unwrap();
        assert_eq!(config.console.preview_length, 48);
    }
}
