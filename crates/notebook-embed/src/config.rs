//! Embedding configuration.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/notebook-embed/settings.json
//! - Linux: ~/.config/notebook-embed/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\notebook-embed\settings.json

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::Result;

pub const DEFAULT_COMPLETION_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_KERNEL_READY_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 3;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 500;
pub const DEFAULT_PATH: &str = "untitled.ipynb";

/// Tunables for the coordination core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedConfig {
    /// How long a completion request waits for its providers
    #[serde(default = "default_completion_timeout_ms")]
    pub completion_timeout_ms: u64,

    /// How long queued executions wait for the kernel to become idle
    #[serde(default = "default_kernel_ready_timeout_ms")]
    pub kernel_ready_timeout_ms: u64,

    /// Reconnect attempts after a transport drop
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Kernelspec to bind new documents to
    #[serde(default, deserialize_with = "deserialize_kernel_name")]
    pub default_kernel: Option<String>,

    /// Path for documents opened without one
    #[serde(default = "default_path")]
    pub default_path: String,
}

fn default_completion_timeout_ms() -> u64 {
    DEFAULT_COMPLETION_TIMEOUT_MS
}

fn default_kernel_ready_timeout_ms() -> u64 {
    DEFAULT_KERNEL_READY_TIMEOUT_MS
}

fn default_reconnect_attempts() -> u32 {
    DEFAULT_RECONNECT_ATTEMPTS
}

fn default_reconnect_delay_ms() -> u64 {
    DEFAULT_RECONNECT_DELAY_MS
}

fn default_path() -> String {
    DEFAULT_PATH.to_string()
}

/// Accept a kernel name as a string, treating `null` and `""` as unset.
fn deserialize_kernel_name<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    struct KernelNameVisitor;

    impl<'de> de::Visitor<'de> for KernelNameVisitor {
        type Value = Option<String>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a kernelspec name or null")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Option<String>, E> {
            let trimmed = v.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
        }

        fn visit_unit<E: de::Error>(self) -> std::result::Result<Option<String>, E> {
            Ok(None)
        }

        fn visit_none<E: de::Error>(self) -> std::result::Result<Option<String>, E> {
            Ok(None)
        }
    }

    deserializer.deserialize_any(KernelNameVisitor)
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            completion_timeout_ms: DEFAULT_COMPLETION_TIMEOUT_MS,
            kernel_ready_timeout_ms: DEFAULT_KERNEL_READY_TIMEOUT_MS,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            default_kernel: None,
            default_path: DEFAULT_PATH.to_string(),
        }
    }
}

impl EmbedConfig {
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    pub fn kernel_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.kernel_ready_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Get the path to the settings file
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("notebook-embed")
        .join("settings.json")
}

/// Load settings from disk, returning defaults if the file doesn't exist
pub fn load_config() -> EmbedConfig {
    load_config_from(&config_path())
}

/// Load settings from `path`; a missing or unreadable file yields defaults.
pub fn load_config_from(path: &Path) -> EmbedConfig {
    if path.exists() {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    } else {
        EmbedConfig::default()
    }
}

/// Save settings to `path`
pub fn save_config_to(config: &EmbedConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(config)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EmbedConfig::default();
        assert_eq!(config.completion_timeout(), Duration::from_millis(1000));
        assert_eq!(config.kernel_ready_timeout(), Duration::from_secs(5));
        assert_eq!(config.reconnect_attempts, 3);
        assert_eq!(config.default_path, "untitled.ipynb");
        assert!(config.default_kernel.is_none());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let json = r#"{"completion_timeout_ms": 250, "default_kernel": "python3"}"#;
        let parsed: EmbedConfig = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.completion_timeout_ms, 250);
        assert_eq!(parsed.default_kernel.as_deref(), Some("python3"));
        assert_eq!(parsed.reconnect_delay_ms, DEFAULT_RECONNECT_DELAY_MS);
    }

    #[test]
    fn test_empty_kernel_name_is_unset() {
        let parsed: EmbedConfig = serde_json::from_str(r#"{"default_kernel": "  "}"#).unwrap();
        assert!(parsed.default_kernel.is_none());
        let parsed: EmbedConfig = serde_json::from_str(r#"{"default_kernel": null}"#).unwrap();
        assert!(parsed.default_kernel.is_none());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let config = EmbedConfig {
            reconnect_attempts: 7,
            ..EmbedConfig::default()
        };
        save_config_to(&config, &path).unwrap();
        assert_eq!(load_config_from(&path), config);
    }

    #[test]
    fn test_missing_or_corrupt_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        assert_eq!(load_config_from(&path), EmbedConfig::default());
        std::fs::write(&path, "not json").unwrap();
        assert_eq!(load_config_from(&path), EmbedConfig::default());
    }
}
