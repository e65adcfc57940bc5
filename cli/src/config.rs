// Configuration management for the lehost CLI
//
// Cross-platform config stored in:
// - Linux: ~/.config/lehost/config.json
// - macOS: ~/Library/Application Support/lehost/config.json
// - Windows: %APPDATA%\lehost\config.json

use anyhow::{Context, Result};
use lehost_core::HostConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Host core behaviour and scan profiles
    #[serde(default)]
    pub host: HostConfig,

    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter used when RUST_LOG is not set
    pub level: String,

    /// Also write logs to rolling files
    pub file_logging: bool,

    /// Directory for log files; defaults to the data directory
    pub log_dir: Option<String>,

    /// hourly, daily or never
    pub rotation: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            file_logging: false,
            log_dir: None,
            rotation: "daily".to_string(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        Ok(dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("lehost"))
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        Ok(dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("lehost"))
    }

    /// Default config file path
    pub fn default_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load from `path`, or defaults if the file does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config
            .host
            .validate()
            .context("Invalid host configuration")?;
        Ok(config)
    }

    /// Write to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Directory for rolling log files
    pub fn log_dir(&self) -> Result<PathBuf> {
        match &self.log.log_dir {
            Some(dir) => Ok(PathBuf::from(dir)),
            None => Ok(Self::data_dir()?.join("logs")),
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let scan = &self.host.scan;
        vec![
            (
                "scan.active".to_string(),
                format!("{}ms/{}ms", scan.active.interval_ms, scan.active.window_ms),
            ),
            (
                "scan.passive".to_string(),
                format!("{}ms/{}ms", scan.passive.interval_ms, scan.passive.window_ms),
            ),
            (
                "auto_reconnect_paired".to_string(),
                self.host.auto_reconnect_paired.to_string(),
            ),
            ("attach_hid".to_string(), self.host.attach_hid.to_string()),
            (
                "load_known_devices".to_string(),
                self.host.load_known_devices.to_string(),
            ),
            ("log.level".to_string(), self.log.level.clone()),
            ("log.file_logging".to_string(), self.log.file_logging.to_string()),
            (
                "log.log_dir".to_string(),
                self.log.log_dir.clone().unwrap_or_else(|| "(auto)".to_string()),
            ),
            ("log.rotation".to_string(), self.log.rotation.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.host.auto_reconnect_paired);
        assert_eq!(config.log.level, "warn");
        assert!(!config.log.file_logging);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config::load_from(&dir.path().join("absent.json")).expect("load");
        assert!(config.host.attach_hid);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.host.attach_hid = false;
        config.log.rotation = "hourly".to_string();
        config.save_to(&path).expect("save");

        let loaded = Config::load_from(&path).expect("load");
        assert!(!loaded.host.attach_hid);
        assert_eq!(loaded.log.rotation, "hourly");
    }

    #[test]
    fn test_partial_file_and_validation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");

        std::fs::write(&path, r#"{"log": {"level": "debug"}}"#).expect("write");
        let loaded = Config::load_from(&path).expect("load");
        assert_eq!(loaded.log.level, "debug");
        assert_eq!(loaded.log.rotation, "daily");

        std::fs::write(
            &path,
            r#"{"host": {"scan": {"active": {"active": true, "interval_ms": 10, "window_ms": 20}}}}"#,
        )
        .expect("write");
        assert!(Config::load_from(&path).is_err());
    }
}
