// Configuration management for the adpc CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/adpc/config.json
// - Linux: ~/.config/adpc/config.json
// - Windows: %APPDATA%\adpc\config.json

use adpc_core::CentralConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Consent central tunables
    pub central: CentralConfig,

    /// Ledger database path (default: platform data dir)
    pub storage_path: Option<String>,

    /// Write daily rolling log files here when set
    pub log_dir: Option<String>,
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("adpc");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("adpc");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Ledger database location
    pub fn ledger_path(&self) -> Result<PathBuf> {
        match &self.storage_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("ledger")),
        }
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let config_file = Self::config_file()?;

        if config_file.exists() {
            let contents =
                std::fs::read_to_string(&config_file).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .central
                .validate()
                .context("Invalid central configuration")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        let config_file = Self::config_file()?;
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_file, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value and persist it
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.apply(key, value)?;
        self.central
            .validate()
            .context("Value rejected by validation")?;
        self.save()
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let central = &mut self.central;
        match key {
            "scan_window_secs" => {
                central.scan_window_secs = value.parse().context("Invalid number")?;
            }
            "allow_duplicates" => {
                central.allow_duplicates = value.parse().context("Invalid boolean value")?;
            }
            "settle_delay_ms" => {
                central.settle_delay_ms = value.parse().context("Invalid number")?;
            }
            "ready_timeout_ms" => {
                central.ready_timeout_ms = value.parse().context("Invalid number")?;
            }
            "retry_attempts" => {
                central.retry.max_attempts = value.parse().context("Invalid number")?;
            }
            "retry_backoff_ms" => {
                central.retry.initial_backoff_ms = value.parse().context("Invalid number")?;
            }
            "scan_on_radio_on" => {
                central.scan_on_radio_on = value.parse().context("Invalid boolean value")?;
            }
            "service_filters" => {
                central.service_filters = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(uuid::Uuid::parse_str)
                    .collect::<Result<_, _>>()
                    .context("Invalid service UUID")?;
            }
            "storage_path" => self.storage_path = optional(value),
            "log_dir" => self.log_dir = optional(value),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let central = &self.central;
        let filters = if central.service_filters.is_empty() {
            "(all)".to_string()
        } else {
            central
                .service_filters
                .iter()
                .map(|u| u.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        vec![
            ("scan_window_secs".to_string(), central.scan_window_secs.to_string()),
            ("allow_duplicates".to_string(), central.allow_duplicates.to_string()),
            ("settle_delay_ms".to_string(), central.settle_delay_ms.to_string()),
            ("ready_timeout_ms".to_string(), central.ready_timeout_ms.to_string()),
            ("retry_attempts".to_string(), central.retry.max_attempts.to_string()),
            ("retry_backoff_ms".to_string(), central.retry.initial_backoff_ms.to_string()),
            ("scan_on_radio_on".to_string(), central.scan_on_radio_on.to_string()),
            ("service_filters".to_string(), filters),
            (
                "storage_path".to_string(),
                self.storage_path.clone().unwrap_or_else(|| "(auto)".to_string()),
            ),
            (
                "log_dir".to_string(),
                self.log_dir.clone().unwrap_or_else(|| "(off)".to_string()),
            ),
        ]
    }
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
