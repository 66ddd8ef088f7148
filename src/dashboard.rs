use crate::collectors::health::{HealthClient, HealthError, HealthSnapshot};
use crate::collectors::updates::{UpdateAction, UpdateClient, UpdateResult};
use crate::metrics::Metrics;
use crate::now_unix;
use crate::state::{ActionKind, ActionRecord, State};
use crate::store::{HistoryStore, StoredHealth, UpdateLogEntry};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum DashboardError {
    #[error("dashboard worker is not running")]
    WorkerGone,
}

/// Requests handled one at a time by the dashboard worker.
#[derive(Debug)]
pub enum DashboardCommand {
    Refresh {
        reply: oneshot::Sender<()>,
    },
    CheckUpdates {
        reply: oneshot::Sender<UpdateResult>,
    },
    InstallUpdates {
        names: Vec<String>,
        reply: oneshot::Sender<UpdateResult>,
    },
    RollbackUpdates {
        update_id: Option<String>,
        reply: oneshot::Sender<UpdateResult>,
    },
    RefreshHealth {
        reply: oneshot::Sender<Result<HealthSnapshot, HealthError>>,
    },
    HealthHistory {
        limit: usize,
        reply: oneshot::Sender<Vec<StoredHealth>>,
    },
    UpdateHistory {
        limit: usize,
        reply: oneshot::Sender<Vec<UpdateLogEntry>>,
    },
}

/// Cloneable sender side used by the HTTP surface.
#[derive(Clone)]
pub struct DashboardHandle {
    tx: mpsc::Sender<DashboardCommand>,
}

pub fn channel(buffer: usize) -> (DashboardHandle, mpsc::Receiver<DashboardCommand>) {
    let (tx, rx) = mpsc::channel(buffer);
    (DashboardHandle { tx }, rx)
}

impl DashboardHandle {
    pub async fn refresh(&self) -> Result<(), DashboardError> {
        self.request(|reply| DashboardCommand::Refresh { reply })
            .await
    }

    pub async fn check_updates(&self) -> Result<UpdateResult, DashboardError> {
        self.request(|reply| DashboardCommand::CheckUpdates { reply })
            .await
    }

    pub async fn install_updates(&self, names: Vec<String>) -> Result<UpdateResult, DashboardError> {
        self.request(|reply| DashboardCommand::InstallUpdates { names, reply })
            .await
    }

    pub async fn rollback_updates(
        &self,
        update_id: Option<String>,
    ) -> Result<UpdateResult, DashboardError> {
        self.request(|reply| DashboardCommand::RollbackUpdates { update_id, reply })
            .await
    }

    pub async fn refresh_health(
        &self,
    ) -> Result<Result<HealthSnapshot, HealthError>, DashboardError> {
        self.request(|reply| DashboardCommand::RefreshHealth { reply })
            .await
    }

    pub async fn health_history(&self, limit: usize) -> Result<Vec<StoredHealth>, DashboardError> {
        self.request(|reply| DashboardCommand::HealthHistory { limit, reply })
            .await
    }

    pub async fn update_history(
        &self,
        limit: usize,
    ) -> Result<Vec<UpdateLogEntry>, DashboardError> {
        self.request(|reply| DashboardCommand::UpdateHistory { limit, reply })
            .await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> DashboardCommand,
    ) -> Result<T, DashboardError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| DashboardError::WorkerGone)?;
        response.await.map_err(|_| DashboardError::WorkerGone)
    }
}

/// Owns the clients and the history store; the only caller of either.
pub struct Dashboard {
    updates: UpdateClient,
    health: HealthClient,
    store: HistoryStore,
    state: Arc<RwLock<State>>,
    metrics: Arc<Metrics>,
    history_limit: usize,
}

impl Dashboard {
    pub fn new(
        updates: UpdateClient,
        health: HealthClient,
        store: HistoryStore,
        state: Arc<RwLock<State>>,
        metrics: Arc<Metrics>,
        history_limit: usize,
    ) -> Self {
        Self {
            updates,
            health,
            store,
            state,
            metrics,
            history_limit,
        }
    }

    /// Refreshes once before serving any command, then every `interval`
    /// until shutdown or until every handle is dropped.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<DashboardCommand>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.periodic_refresh().await;

        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("получен сигнал остановки панели");
                    break;
                }
                _ = ticker.tick() => {
                    self.periodic_refresh().await;
                }
                cmd = commands.recv() => {
                    match cmd {
                        Some(cmd) => self.handle(cmd).await,
                        None => break,
                    }
                }
            }
        }

        self.close();
    }

    pub async fn handle(&mut self, cmd: DashboardCommand) {
        match cmd {
            DashboardCommand::Refresh { reply } => {
                self.periodic_refresh().await;
                let _ = reply.send(());
            }
            DashboardCommand::CheckUpdates { reply } => {
                let result = self.refresh_pending_updates().await;
                self.publish_metrics().await;
                let _ = reply.send(result);
            }
            DashboardCommand::InstallUpdates { names, reply } => {
                let _ = reply.send(self.install_updates(names).await);
            }
            DashboardCommand::RollbackUpdates { update_id, reply } => {
                let _ = reply.send(self.rollback_updates(update_id).await);
            }
            DashboardCommand::RefreshHealth { reply } => {
                let result = self.refresh_device_health().await;
                self.refresh_history().await;
                self.publish_metrics().await;
                let _ = reply.send(result);
            }
            DashboardCommand::HealthHistory { limit, reply } => {
                let _ = reply.send(self.store.recent_health(limit));
            }
            DashboardCommand::UpdateHistory { limit, reply } => {
                let _ = reply.send(self.store.recent_updates(limit));
            }
        }
    }

    pub async fn periodic_refresh(&mut self) {
        self.refresh_pending_updates().await;
        if let Err(err) = self.refresh_device_health().await {
            warn!(error = %err, "не удалось опросить состояние устройства");
        }
        self.refresh_history().await;
        self.state.write().await.mark_refreshed(now_unix());
        self.publish_metrics().await;
    }

    pub async fn refresh_pending_updates(&mut self) -> UpdateResult {
        let client = self.updates.clone();
        let result = run_blocking(move || client.check_pending_updates())
            .await
            .unwrap_or_else(UpdateResult::failure);
        if !result.is_success() {
            self.metrics
                .inc_utility_error(UpdateAction::CheckUpdates.as_str());
        }
        self.state.write().await.apply_update_check(result.clone());
        result
    }

    /// Polls health, records it (an error row on failure), then reads the
    /// device configuration.
    pub async fn refresh_device_health(&mut self) -> Result<HealthSnapshot, HealthError> {
        let client = self.health.clone();
        let health = run_blocking(move || client.get_system_health())
            .await
            .unwrap_or_else(|err| Err(HealthError::Aborted(err)));

        let recorded = match &health {
            Ok(snapshot) => snapshot.clone(),
            Err(err) => {
                warn!(
                    action = "GetSystemHealth",
                    error = %err,
                    "ошибка утилиты сведений об устройстве"
                );
                self.metrics.inc_utility_error("GetSystemHealth");
                HealthSnapshot::failed()
            }
        };
        let outcome = self.store.record_health(&recorded);
        if !outcome.is_stored() {
            self.metrics.inc_store_dropped("device_health");
        }

        let client = self.health.clone();
        let config = run_blocking(move || client.get_device_configuration())
            .await
            .unwrap_or_else(|err| Err(HealthError::Aborted(err)));
        if let Err(err) = &config {
            warn!(
                action = "GetDeviceConfig",
                error = %err,
                "ошибка утилиты сведений об устройстве"
            );
            self.metrics.inc_utility_error("GetDeviceConfig");
        }

        {
            let mut guard = self.state.write().await;
            guard.apply_health(health.as_ref().cloned().map_err(|e| e.to_string()));
            guard.apply_device_config(config.map_err(|err| err.to_string()));
            guard.apply_record_outcome(outcome);
        }
        health
    }

    pub async fn refresh_history(&mut self) {
        let (health, updates) = self.history(self.history_limit);
        self.state.write().await.apply_history(health, updates);
    }

    pub fn history(&self, limit: usize) -> (Vec<StoredHealth>, Vec<UpdateLogEntry>) {
        (
            self.store.recent_health(limit),
            self.store.recent_updates(limit),
        )
    }

    pub async fn install_updates(&mut self, names: Vec<String>) -> UpdateResult {
        let target = if names.is_empty() {
            "all pending updates".to_string()
        } else {
            names.join(",")
        };
        let client = self.updates.clone();
        let result = run_blocking(move || client.install_updates(&names))
            .await
            .unwrap_or_else(UpdateResult::failure);

        self.finish_action(ActionKind::Install, UpdateAction::InstallUpdates, target, &result)
            .await;
        self.refresh_pending_updates().await;
        self.refresh_history().await;
        self.publish_metrics().await;
        result
    }

    pub async fn rollback_updates(&mut self, update_id: Option<String>) -> UpdateResult {
        let target = update_id
            .clone()
            .unwrap_or_else(|| "last update".to_string());
        let client = self.updates.clone();
        let result = run_blocking(move || client.rollback_updates(update_id.as_deref()))
            .await
            .unwrap_or_else(UpdateResult::failure);

        self.finish_action(ActionKind::Rollback, UpdateAction::RollbackUpdates, target, &result)
            .await;
        self.refresh_history().await;
        self.publish_metrics().await;
        result
    }

    pub fn close(&mut self) {
        if !self.store.is_closed() {
            info!("закрытие базы истории");
            self.store.close();
        }
    }

    async fn finish_action(
        &mut self,
        kind: ActionKind,
        action: UpdateAction,
        target: String,
        result: &UpdateResult,
    ) {
        if result.is_success() {
            info!(kind = kind.as_str(), target = %target, "операция с обновлениями выполнена");
        } else {
            warn!(
                kind = kind.as_str(),
                target = %target,
                error = %result.message(),
                "операция с обновлениями завершилась ошибкой"
            );
            self.metrics.inc_utility_error(action.as_str());
        }

        let outcome = self
            .store
            .record_update(&target, result.status.as_str(), result.message());
        if !outcome.is_stored() {
            self.metrics.inc_store_dropped("update_logs");
        }

        let mut guard = self.state.write().await;
        guard.apply_record_outcome(outcome);
        guard.apply_action(ActionRecord {
            kind,
            target,
            finished_at_unix: now_unix(),
            result: result.clone(),
        });
    }

    async fn publish_metrics(&mut self) {
        let guard = self.state.read().await;
        self.metrics.update_from_state(&guard);
    }
}

/// External utilities block; keep them off the async workers.
async fn run_blocking<T, F>(f: F) -> Result<T, String>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| err.to_string())
}
