use crate::collectors::health::{DeviceConfig, HealthSnapshot, HealthStatus};
use crate::collectors::updates::UpdateResult;
use crate::store::{RecordOutcome, StoredHealth, UpdateLogEntry};
use serde::Serialize;

/// Everything the dashboard currently shows.
#[derive(Debug, Clone, Default, Serialize)]
pub struct State {
    pub started_at_unix: i64,
    pub last_refresh_timestamp_seconds: i64,
    pub pending_updates: Vec<String>,
    pub last_update_check: Option<UpdateResult>,
    pub health: Option<HealthSnapshot>,
    pub health_error: Option<String>,
    pub device_config: Option<DeviceConfig>,
    pub device_config_error: Option<String>,
    pub last_action: Option<ActionRecord>,
    pub recent_health: Vec<StoredHealth>,
    pub recent_updates: Vec<UpdateLogEntry>,
    /// Set when a history row was dropped; cleared by the next stored row.
    pub last_store_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Install,
    Rollback,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Install => "install",
            ActionKind::Rollback => "rollback",
        }
    }
}

/// Last user-triggered update action and its outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ActionRecord {
    pub kind: ActionKind,
    pub target: String,
    pub finished_at_unix: i64,
    pub result: UpdateResult,
}

impl State {
    pub fn new(now_unix: i64) -> Self {
        Self {
            started_at_unix: now_unix,
            ..Self::default()
        }
    }

    /// A failed check keeps the previous pending list.
    pub fn apply_update_check(&mut self, result: UpdateResult) {
        if let Some(pending) = &result.pending_updates {
            self.pending_updates = pending.clone();
        }
        self.last_update_check = Some(result);
    }

    pub fn apply_health(&mut self, health: Result<HealthSnapshot, String>) {
        match health {
            Ok(snapshot) => {
                self.health = Some(snapshot);
                self.health_error = None;
            }
            Err(err) => {
                self.health = Some(HealthSnapshot::failed());
                self.health_error = Some(err);
            }
        }
    }

    pub fn apply_device_config(&mut self, config: Result<DeviceConfig, String>) {
        match config {
            Ok(config) => {
                self.device_config = Some(config);
                self.device_config_error = None;
            }
            Err(err) => self.device_config_error = Some(err),
        }
    }

    pub fn apply_action(&mut self, record: ActionRecord) {
        self.last_action = Some(record);
    }

    pub fn apply_history(&mut self, health: Vec<StoredHealth>, updates: Vec<UpdateLogEntry>) {
        self.recent_health = health;
        self.recent_updates = updates;
    }

    pub fn apply_record_outcome(&mut self, outcome: RecordOutcome) {
        self.last_store_error = match outcome {
            RecordOutcome::Stored => None,
            RecordOutcome::Dropped { reason } => Some(reason),
        };
    }

    pub fn mark_refreshed(&mut self, now_unix: i64) {
        self.last_refresh_timestamp_seconds = now_unix;
    }

    pub fn health_status(&self) -> Option<HealthStatus> {
        self.health.as_ref().map(|h| h.status)
    }
}
