//! Plain-text views for the one-shot CLI commands.

use crate::collectors::health::{DeviceConfig, HealthSnapshot};
use crate::collectors::updates::UpdateResult;
use crate::store::{StoredHealth, UpdateLogEntry};
use std::fmt::Write;
use std::time::{Duration, UNIX_EPOCH};

pub fn render_update_check(result: &UpdateResult) -> String {
    if !result.is_success() {
        return format!("Update check failed: {}", or_unknown(result.message()));
    }
    let pending = result.pending_updates.as_deref().unwrap_or_default();
    if pending.is_empty() {
        return "No pending updates.".to_string();
    }

    let mut out = format!("Pending updates ({}):\n", pending.len());
    for name in pending {
        let _ = writeln!(out, "  {name:<40} Pending");
    }
    out
}

pub fn render_action(label: &str, result: &UpdateResult) -> String {
    if result.is_success() {
        format!("{label} succeeded: {}", result.message())
    } else {
        format!("{label} failed: {}", or_unknown(result.message()))
    }
}

pub fn render_health(snapshot: &HealthSnapshot) -> String {
    format!(
        "CPU Usage: {:.1}%\nMemory Usage: {:.1}%\nDisk Health: {}\nOverall Status: {}\n",
        snapshot.cpu_usage,
        snapshot.memory_usage,
        snapshot.disk_health,
        snapshot.status.as_str()
    )
}

pub fn render_device_config(config: &DeviceConfig) -> String {
    format!(
        "OS Version: {}\nOS Name: {}\nHostname: {}\nProcessor: {}\nTotal Memory: {}\nStorage Info: {}\n",
        config.os_version,
        config.os_name,
        config.hostname,
        config.processor,
        config.total_memory,
        config.storage_info
    )
}

pub fn render_health_history(rows: &[StoredHealth]) -> String {
    if rows.is_empty() {
        return "No health history.".to_string();
    }
    let mut out = String::new();
    for row in rows {
        let _ = writeln!(
            out,
            "{}  System Health Check  {:<7}  CPU: {:.1}%, Memory: {:.1}%, Disk: {}",
            format_unix_ms(row.timestamp_ms),
            row.snapshot.status.as_str(),
            row.snapshot.cpu_usage,
            row.snapshot.memory_usage,
            row.snapshot.disk_health
        );
    }
    out
}

pub fn render_update_history(rows: &[UpdateLogEntry]) -> String {
    if rows.is_empty() {
        return "No update history.".to_string();
    }
    let mut out = String::new();
    for row in rows {
        let _ = writeln!(
            out,
            "{}  {}  {:<7}  {}",
            format_unix_ms(row.timestamp_ms),
            row.update_name,
            row.status,
            row.details.trim()
        );
    }
    out
}

fn format_unix_ms(ts_ms: i64) -> String {
    let st = UNIX_EPOCH + Duration::from_millis(ts_ms.max(0) as u64);
    humantime::format_rfc3339_seconds(st).to_string()
}

fn or_unknown(text: &str) -> &str {
    if text.is_empty() {
        "Unknown error"
    } else {
        text
    }
}
