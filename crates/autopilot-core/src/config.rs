//! Autopilot configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{AutopilotError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutopilotConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_data_dir() -> String {
    AutopilotConfig::home_dir().to_string_lossy().into_owned()
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database: DatabaseConfig::default(),
            engine: EngineConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AutopilotConfig {
    /// Load config from the default path (~/.autopilot/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AutopilotError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| AutopilotError::Config(format!("Failed to parse config: {e}")))?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| AutopilotError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Autopilot home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".autopilot")
    }

    /// Resolved SQLite path: explicit `database.path`, else `<data_dir>/automation.db`.
    pub fn database_path(&self) -> PathBuf {
        match &self.database.path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(&self.data_dir).join("automation.db"),
        }
    }
}

/// Schedule store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub path: Option<String>,
}

/// Engine behavior.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Start with the global pause gate closed.
    #[serde(default)]
    pub start_paused: bool,
}

/// Log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

fn default_filter() -> String { "autopilot=info".into() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AutopilotConfig::default();
        assert!(!config.engine.start_paused);
        assert_eq!(config.logging.filter, "autopilot=info");
        assert!(config.database_path().ends_with("automation.db"));
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            data_dir = "/var/lib/autopilot"

            [database]
            path = "/tmp/custom.db"

            [engine]
            start_paused = true
        "#;

        let config: AutopilotConfig = toml::from_str(toml_str).unwrap();
        assert!(config.engine.start_paused);
        assert_eq!(config.database_path(), PathBuf::from("/tmp/custom.db"));
        assert_eq!(config.logging.filter, "autopilot=info");
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: AutopilotConfig = toml::from_str("").unwrap();
        assert!(config.data_dir.contains("autopilot"));
        assert!(config.database.path.is_none());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = AutopilotConfig::default();
        config.engine.start_paused = true;
        config.logging.filter = "autopilot=debug".into();
        config.save_to(&path).unwrap();

        let loaded = AutopilotConfig::load_from(&path).unwrap();
        assert!(loaded.engine.start_paused);
        assert_eq!(loaded.logging.filter, "autopilot=debug");
    }

    #[test]
    fn test_malformed_config_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "engine = [").unwrap();
        assert!(matches!(
            AutopilotConfig::load_from(&path).unwrap_err(),
            AutopilotError::Config(_)
        ));
    }
}
