use crate::collectors::command::{action_args, CommandError, CommandRunner};
use crate::config::UtilityConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use sysinfo::{CpuExt, System, SystemExt};
use thiserror::Error;

const UNKNOWN: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "WARNING")]
    Warning,
    #[serde(rename = "error")]
    Error,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Ok => "OK",
            HealthStatus::Warning => "WARNING",
            HealthStatus::Error => "error",
        }
    }

    /// Unrecognized stored values read back as `Error`.
    pub fn parse(value: &str) -> Self {
        match value {
            "OK" => HealthStatus::Ok,
            "WARNING" => HealthStatus::Warning,
            _ => HealthStatus::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_health: String,
    pub status: HealthStatus,
}

impl HealthSnapshot {
    /// Placeholder row for a poll that produced no reading.
    pub fn failed() -> Self {
        Self {
            cpu_usage: 0.0,
            memory_usage: 0.0,
            disk_health: UNKNOWN.to_string(),
            status: HealthStatus::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceConfig {
    pub os_version: String,
    pub os_name: String,
    pub hostname: String,
    pub processor: String,
    pub total_memory: String,
    pub storage_info: String,
}

#[derive(Debug, Error)]
pub enum HealthError {
    #[error(transparent)]
    Invocation(#[from] CommandError),
    #[error("info utility exited with code {code:?}: {stderr}")]
    Utility { code: Option<i32>, stderr: String },
    #[error("malformed {field} value '{value}'")]
    Parse { field: &'static str, value: String },
    #[error("info utility task aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, Copy)]
enum InfoAction {
    GetSystemHealth,
    GetDeviceConfig,
}

impl InfoAction {
    fn as_str(self) -> &'static str {
        match self {
            InfoAction::GetSystemHealth => "GetSystemHealth",
            InfoAction::GetDeviceConfig => "GetDeviceConfig",
        }
    }
}

#[derive(Clone)]
pub struct HealthClient {
    runner: Arc<dyn CommandRunner>,
    utility: UtilityConfig,
    cpu_warning_percent: f64,
}

impl HealthClient {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        utility: UtilityConfig,
        cpu_warning_percent: f64,
    ) -> Self {
        Self {
            runner,
            utility,
            cpu_warning_percent,
        }
    }

    pub fn get_system_health(&self) -> Result<HealthSnapshot, HealthError> {
        let stdout = self.invoke(InfoAction::GetSystemHealth)?;
        let fields = UtilityFields::parse(&stdout);

        let cpu_usage = parse_percent("cpu_usage", fields.get(&["cpu", "cpu_usage"], 0))?;
        let memory_usage = parse_percent(
            "memory_usage",
            fields.get(&["memory", "memory_usage", "mem"], 1),
        )?;
        let disk_health = fields
            .get(&["disk", "disk_health"], 2)
            .unwrap_or(UNKNOWN)
            .to_string();

        let status = if cpu_usage >= self.cpu_warning_percent {
            HealthStatus::Warning
        } else {
            HealthStatus::Ok
        };

        Ok(HealthSnapshot {
            cpu_usage,
            memory_usage,
            disk_health,
            status,
        })
    }

    pub fn get_device_configuration(&self) -> Result<DeviceConfig, HealthError> {
        let stdout = self.invoke(InfoAction::GetDeviceConfig)?;
        let fields = UtilityFields::parse(&stdout);
        let host = HostInfo::detect();

        Ok(DeviceConfig {
            os_version: host.os_version,
            os_name: host.os_name,
            hostname: host.hostname,
            processor: host.processor,
            total_memory: fields
                .get(&["total_memory", "memory"], 0)
                .unwrap_or(UNKNOWN)
                .to_string(),
            storage_info: fields
                .get(&["storage_info", "storage"], 1)
                .unwrap_or(UNKNOWN)
                .to_string(),
        })
    }

    fn invoke(&self, action: InfoAction) -> Result<String, HealthError> {
        let args = action_args(&self.utility, action.as_str(), &[]);
        let out = self.runner.run(&self.utility.program, &args)?;
        if !out.success() {
            return Err(HealthError::Utility {
                code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(out.stdout)
    }
}

/// Values read from the local machine rather than from the info utility.
struct HostInfo {
    os_name: String,
    os_version: String,
    hostname: String,
    processor: String,
}

impl HostInfo {
    fn detect() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        Self {
            os_name: system.name().unwrap_or_else(|| UNKNOWN.to_string()),
            os_version: system
                .long_os_version()
                .or_else(|| system.os_version())
                .unwrap_or_else(|| UNKNOWN.to_string()),
            hostname: system.host_name().unwrap_or_else(|| UNKNOWN.to_string()),
            processor: system
                .cpus()
                .first()
                .map(|c| c.brand().trim().to_string())
                .filter(|b| !b.is_empty())
                .unwrap_or_else(|| UNKNOWN.to_string()),
        }
    }
}

/// One line of `|`-separated utility output. A line whose first field is
/// `key=value` is read by label, otherwise by position. Later fields may
/// contain `=` as free text.
#[derive(Debug)]
enum UtilityFields {
    Labeled(HashMap<String, String>),
    Positional(Vec<String>),
}

impl UtilityFields {
    fn parse(stdout: &str) -> Self {
        let line = stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("");
        let parts: Vec<&str> = line.split('|').map(str::trim).collect();

        if parts.first().is_some_and(|p| p.contains('=')) {
            let labeled = parts
                .iter()
                .filter_map(|p| p.split_once('='))
                .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
                .collect();
            return UtilityFields::Labeled(labeled);
        }

        UtilityFields::Positional(parts.into_iter().map(str::to_string).collect())
    }

    fn get(&self, keys: &[&str], position: usize) -> Option<&str> {
        let value = match self {
            UtilityFields::Labeled(map) => keys.iter().find_map(|k| map.get(*k)),
            UtilityFields::Positional(parts) => parts.get(position),
        };
        value.map(String::as_str).filter(|v| !v.is_empty())
    }
}

fn parse_percent(field: &'static str, raw: Option<&str>) -> Result<f64, HealthError> {
    let Some(raw) = raw else {
        return Ok(0.0);
    };
    let cleaned = raw.trim_end_matches('%').trim().replace(',', ".");
    match cleaned.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(HealthError::Parse {
            field,
            value: raw.to_string(),
        }),
    }
}
