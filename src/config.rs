use configparser::ini::Ini;
use dirs::home_dir;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::sync::SyncConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse config file: {0}")]
    ParseError(String),
    #[error("Invalid config path: {0}")]
    InvalidPath(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: Option<String>,
    pub debug: bool,
    pub log_file: Option<String>,
    /// Override for the queue database location
    pub queue_db: Option<String>,
    /// Seconds between connectivity probes
    pub probe_interval_seconds: u64,
    pub sync_config: SyncConfig,
}

impl Config {
    pub fn load(config_path: &str) -> Result<Self, ConfigError> {
        let config_path = Self::resolve_config_path(config_path)?;

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let mut ini = Ini::new();
        let config_map = ini.load(&config_path).map_err(|e| {
            ConfigError::ParseError(format!(
                "Failed to load config from {}: {}",
                config_path.display(),
                e
            ))
        })?;

        let settings = config_map.get("settings").cloned().unwrap_or_default();

        Ok(Config {
            api_url: settings.get("api_url").and_then(|v| v.clone()),
            debug: settings
                .get("debug")
                .and_then(|s| s.as_ref().and_then(|v| v.parse().ok()))
                .unwrap_or(false),
            log_file: settings.get("log_file").and_then(|v| v.clone()),
            queue_db: settings.get("queue_db").and_then(|v| v.clone()),
            probe_interval_seconds: settings
                .get("probe_interval")
                .and_then(|s| s.as_ref().and_then(|v| v.parse().ok()))
                .unwrap_or(30),
            sync_config: Self::parse_sync_config(&settings),
        })
    }

    pub fn resolve_config_path(config_path: &str) -> Result<PathBuf, ConfigError> {
        let path = Path::new(config_path);

        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }

        if let Some(stripped) = config_path.strip_prefix("~/") {
            if let Some(mut home) = home_dir() {
                home.push(stripped);
                return Ok(home);
            }
        }

        if let Ok(current_dir) = std::env::current_dir() {
            return Ok(current_dir.join(config_path));
        }

        Err(ConfigError::InvalidPath(config_path.to_string()))
    }

    pub fn get_api_url(&self, cli_url: Option<&String>) -> String {
        cli_url
            .cloned()
            .or_else(|| self.api_url.clone())
            .unwrap_or_else(|| "https://api.haulsync.in/v1".to_string())
    }

    fn parse_sync_config(
        settings: &std::collections::HashMap<String, Option<String>>,
    ) -> SyncConfig {
        let mut sync_config = SyncConfig::default();

        if let Some(batch_size) = settings.get("sync_batch_size") {
            if let Some(value) = batch_size.as_ref() {
                if let Ok(parsed) = value.parse::<usize>() {
                    sync_config.batch_size = parsed;
                }
            }
        }

        if let Some(interval) = settings.get("sync_interval") {
            if let Some(value) = interval.as_ref() {
                if let Ok(parsed) = value.parse::<u64>() {
                    sync_config.drain_interval_seconds = parsed;
                }
            }
        }

        if let Some(concurrency) = settings.get("sync_concurrency") {
            if let Some(value) = concurrency.as_ref() {
                if let Ok(parsed) = value.parse::<usize>() {
                    sync_config.max_concurrent_dispatches = parsed.max(1);
                }
            }
        }

        if let Some(stale) = settings.get("sync_stale_claim_seconds") {
            if let Some(value) = stale.as_ref() {
                if let Ok(parsed) = value.parse::<u64>() {
                    sync_config.stale_claim_seconds = parsed;
                }
            }
        }

        if let Some(background) = settings.get("sync_background") {
            if let Some(value) = background.as_ref() {
                if let Ok(parsed) = value.parse::<bool>() {
                    sync_config.background_sync = parsed;
                }
            }
        }

        sync_config
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: None,
            debug: false,
            log_file: None,
            queue_db: None,
            probe_interval_seconds: 30,
            sync_config: SyncConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.debug);
        assert_eq!(config.probe_interval_seconds, 30);
        assert_eq!(config.sync_config.batch_size, 10);
    }

    #[test]
    fn test_load_config_from_file() {
        let temp_file = NamedTempFile::new().unwrap();
        let config_content = r#"
[settings]
api_url = https://staging.haulsync.in/v1
debug = true
sync_batch_size = 25
sync_interval = 120
sync_background = false
probe_interval = 10
"#;
        fs::write(temp_file.path(), config_content).unwrap();

        let config = Config::load(temp_file.path().to_str().unwrap()).unwrap();
        assert_eq!(
            config.api_url,
            Some("https://staging.haulsync.in/v1".to_string())
        );
        assert!(config.debug);
        assert_eq!(config.sync_config.batch_size, 25);
        assert_eq!(config.sync_config.drain_interval_seconds, 120);
        assert!(!config.sync_config.background_sync);
        assert_eq!(config.probe_interval_seconds, 10);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::load("/nonexistent/haulsync.cfg").unwrap();
        assert!(config.api_url.is_none());
        assert_eq!(config.sync_config.drain_interval_seconds, 300);
    }

    #[test]
    fn test_get_api_url_precedence() {
        let config = Config {
            api_url: Some("https://config.haulsync.in/v1".to_string()),
            ..Default::default()
        };

        assert_eq!(
            config.get_api_url(Some(&"https://cli.haulsync.in/v1".to_string())),
            "https://cli.haulsync.in/v1"
        );
        assert_eq!(config.get_api_url(None), "https://config.haulsync.in/v1");

        let empty = Config::default();
        assert_eq!(empty.get_api_url(None), "https://api.haulsync.in/v1");
    }
}
