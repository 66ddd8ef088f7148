use crate::collectors::command::{action_args, CommandOutput, CommandRunner};
use crate::config::UtilityConfig;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateAction {
    CheckUpdates,
    InstallUpdates,
    RollbackUpdates,
}

impl UpdateAction {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateAction::CheckUpdates => "CheckUpdates",
            UpdateAction::InstallUpdates => "InstallUpdates",
            UpdateAction::RollbackUpdates => "RollbackUpdates",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Error,
}

impl ResultStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultStatus::Success => "success",
            ResultStatus::Error => "error",
        }
    }
}

/// Outcome of one update-utility run. Never persisted as-is.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateResult {
    pub status: ResultStatus,
    pub output: String,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_updates: Option<Vec<String>>,
}

impl UpdateResult {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Error,
            output: String::new(),
            error: message.into(),
            pending_updates: None,
        }
    }

    fn from_output(out: CommandOutput) -> Self {
        Self {
            status: if out.success() {
                ResultStatus::Success
            } else {
                ResultStatus::Error
            },
            output: out.stdout,
            error: out.stderr,
            pending_updates: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }

    /// Text worth showing to the user: output on success, error otherwise.
    pub fn message(&self) -> &str {
        let text = if self.is_success() {
            &self.output
        } else {
            &self.error
        };
        text.trim()
    }
}

#[derive(Clone)]
pub struct UpdateClient {
    runner: Arc<dyn CommandRunner>,
    utility: UtilityConfig,
}

impl UpdateClient {
    pub fn new(runner: Arc<dyn CommandRunner>, utility: UtilityConfig) -> Self {
        Self { runner, utility }
    }

    pub fn check_pending_updates(&self) -> UpdateResult {
        let out = match self.invoke(UpdateAction::CheckUpdates, &[]) {
            Ok(out) => out,
            Err(result) => return result,
        };
        if !out.success() {
            warn!(
                action = "CheckUpdates",
                code = ?out.exit_code,
                "утилита обновлений завершилась ошибкой"
            );
            return UpdateResult::failure(out.stderr);
        }

        let pending = parse_update_names(&out.stdout);
        UpdateResult {
            status: ResultStatus::Success,
            output: out.stdout,
            error: out.stderr,
            pending_updates: Some(pending),
        }
    }

    pub fn install_updates(&self, names: &[String]) -> UpdateResult {
        let joined = names.join(",");
        let extra: Vec<(&str, &str)> = if names.is_empty() {
            Vec::new()
        } else {
            vec![("-Updates", joined.as_str())]
        };
        self.run_action(UpdateAction::InstallUpdates, &extra)
    }

    pub fn rollback_updates(&self, update_id: Option<&str>) -> UpdateResult {
        let extra: Vec<(&str, &str)> = match update_id {
            Some(id) if !id.trim().is_empty() => vec![("-UpdateID", id)],
            _ => Vec::new(),
        };
        self.run_action(UpdateAction::RollbackUpdates, &extra)
    }

    fn run_action(&self, action: UpdateAction, extra: &[(&str, &str)]) -> UpdateResult {
        match self.invoke(action, extra) {
            Ok(out) => {
                if !out.success() {
                    warn!(
                        action = action.as_str(),
                        code = ?out.exit_code,
                        "утилита обновлений завершилась ошибкой"
                    );
                }
                UpdateResult::from_output(out)
            }
            Err(result) => result,
        }
    }

    fn invoke(
        &self,
        action: UpdateAction,
        extra: &[(&str, &str)],
    ) -> Result<CommandOutput, UpdateResult> {
        let args = action_args(&self.utility, action.as_str(), extra);
        self.runner
            .run(&self.utility.program, &args)
            .map_err(|err| {
                warn!(
                    action = action.as_str(),
                    error = %err,
                    "не удалось запустить утилиту обновлений"
                );
                UpdateResult::failure(err.to_string())
            })
    }
}

/// One update name per line; blank lines and CR are dropped.
pub fn parse_update_names(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
