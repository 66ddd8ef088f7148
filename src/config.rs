use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_cpu_warning_percent")]
    pub cpu_warning_percent: f64,
    #[serde(default = "default_update_utility")]
    pub update_utility: UtilityConfig,
    #[serde(default = "default_info_utility")]
    pub info_utility: UtilityConfig,
}

/// External program plus the fixed arguments placed before `-Action`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct UtilityConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        Self::from_yaml(&text, &path_display)
    }

    pub fn from_yaml(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let cfg: Config = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation(
                "поле listen обязательно".to_string(),
            ));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "поле listen должно быть корректным адресом host:port".to_string(),
            ));
        }
        if self.interval_secs < 1 {
            return Err(ConfigError::Validation(
                "interval_secs должно быть >= 1".to_string(),
            ));
        }
        if self.database_path.trim().is_empty() {
            return Err(ConfigError::Validation(
                "database_path не должен быть пустым".to_string(),
            ));
        }
        if self.history_limit < 1 {
            return Err(ConfigError::Validation(
                "history_limit должно быть >= 1".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.cpu_warning_percent) {
            return Err(ConfigError::Validation(
                "cpu_warning_percent должно быть в диапазоне 0..100".to_string(),
            ));
        }

        validate_utility("update_utility", &self.update_utility)?;
        validate_utility("info_utility", &self.info_utility)?;

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_utility(field: &str, utility: &UtilityConfig) -> Result<(), ConfigError> {
    if utility.program.trim().is_empty() {
        return Err(ConfigError::Validation(format!(
            "{field}.program не должен быть пустым"
        )));
    }
    if utility
        .args
        .iter()
        .any(|arg| arg.eq_ignore_ascii_case("-Action"))
    {
        return Err(ConfigError::Validation(format!(
            "{field}.args не должен содержать -Action, он добавляется автоматически"
        )));
    }
    Ok(())
}

const fn default_interval_secs() -> u64 {
    300
}

fn default_database_path() -> String {
    "autopatch_guardian.db".to_string()
}

const fn default_history_limit() -> usize {
    crate::store::DEFAULT_RECENT_LIMIT
}

const fn default_cpu_warning_percent() -> f64 {
    80.0
}

fn powershell_script(script: &str) -> UtilityConfig {
    UtilityConfig {
        program: "powershell.exe".to_string(),
        args: vec![
            "-ExecutionPolicy".to_string(),
            "Bypass".to_string(),
            "-File".to_string(),
            format!("powershell/{script}"),
        ],
    }
}

fn default_update_utility() -> UtilityConfig {
    powershell_script("update_manager.ps1")
}

fn default_info_utility() -> UtilityConfig {
    powershell_script("device_info.ps1")
}
