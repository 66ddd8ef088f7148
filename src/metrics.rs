use crate::collectors::health::HealthStatus;
use crate::state::State;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub patchguard_cpu_usage_percent: Gauge,
    pub patchguard_memory_usage_percent: Gauge,
    pub patchguard_health_status: Gauge,
    pub patchguard_pending_updates: Gauge,
    pub patchguard_utility_errors_total: CounterVec,
    pub patchguard_store_dropped_total: CounterVec,
    pub patchguard_scrape_count_total: Counter,
    pub patchguard_uptime_seconds: Gauge,
    pub patchguard_last_refresh_timestamp_seconds: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let patchguard_cpu_usage_percent = Gauge::with_opts(opts!(
            "patchguard_cpu_usage_percent",
            "CPU usage reported by the info utility in percent"
        ))?;
        let patchguard_memory_usage_percent = Gauge::with_opts(opts!(
            "patchguard_memory_usage_percent",
            "Memory usage reported by the info utility in percent"
        ))?;
        let patchguard_health_status = Gauge::with_opts(opts!(
            "patchguard_health_status",
            "Last health status: 0 OK, 1 WARNING, 2 error"
        ))?;
        let patchguard_pending_updates = Gauge::with_opts(opts!(
            "patchguard_pending_updates",
            "Number of pending updates from the last successful check"
        ))?;
        let patchguard_utility_errors_total = CounterVec::new(
            opts!(
                "patchguard_utility_errors_total",
                "Failed external utility runs by action"
            ),
            &["action"],
        )?;
        let patchguard_store_dropped_total = CounterVec::new(
            opts!(
                "patchguard_store_dropped_total",
                "History rows dropped after a storage failure by table"
            ),
            &["table"],
        )?;
        let patchguard_scrape_count_total = Counter::with_opts(opts!(
            "patchguard_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let patchguard_uptime_seconds =
            Gauge::with_opts(opts!("patchguard_uptime_seconds", "Daemon uptime in seconds"))?;
        let patchguard_last_refresh_timestamp_seconds = Gauge::with_opts(opts!(
            "patchguard_last_refresh_timestamp_seconds",
            "Unix timestamp of the last periodic refresh"
        ))?;

        register(&registry, &patchguard_cpu_usage_percent)?;
        register(&registry, &patchguard_memory_usage_percent)?;
        register(&registry, &patchguard_health_status)?;
        register(&registry, &patchguard_pending_updates)?;
        register(&registry, &patchguard_utility_errors_total)?;
        register(&registry, &patchguard_store_dropped_total)?;
        register(&registry, &patchguard_scrape_count_total)?;
        register(&registry, &patchguard_uptime_seconds)?;
        register(&registry, &patchguard_last_refresh_timestamp_seconds)?;

        Ok(Arc::new(Self {
            registry,
            patchguard_cpu_usage_percent,
            patchguard_memory_usage_percent,
            patchguard_health_status,
            patchguard_pending_updates,
            patchguard_utility_errors_total,
            patchguard_store_dropped_total,
            patchguard_scrape_count_total,
            patchguard_uptime_seconds,
            patchguard_last_refresh_timestamp_seconds,
        }))
    }

    pub fn update_from_state(&self, state: &State) {
        if let Some(health) = &state.health {
            self.patchguard_cpu_usage_percent.set(health.cpu_usage);
            self.patchguard_memory_usage_percent
                .set(health.memory_usage);
        }
        if let Some(status) = state.health_status() {
            self.patchguard_health_status.set(match status {
                HealthStatus::Ok => 0.0,
                HealthStatus::Warning => 1.0,
                HealthStatus::Error => 2.0,
            });
        }
        self.patchguard_pending_updates
            .set(state.pending_updates.len() as f64);
        self.patchguard_last_refresh_timestamp_seconds
            .set(state.last_refresh_timestamp_seconds as f64);
        self.patchguard_uptime_seconds
            .set(now_unix().saturating_sub(state.started_at_unix).max(0) as f64);
    }

    pub fn inc_scrape_count(&self) {
        self.patchguard_scrape_count_total.inc();
    }

    pub fn inc_utility_error(&self, action: &str) {
        self.patchguard_utility_errors_total
            .with_label_values(&[action])
            .inc();
    }

    pub fn inc_store_dropped(&self, table: &str) {
        self.patchguard_store_dropped_total
            .with_label_values(&[table])
            .inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::health::HealthSnapshot;

    #[test]
    fn state_values_are_exported() {
        let metrics = Metrics::new().expect("инициализация метрик");
        let mut state = State::new(0);
        state.pending_updates = vec!["KB1".to_string(), "KB2".to_string()];
        state.apply_health(Ok(HealthSnapshot {
            cpu_usage: 85.0,
            memory_usage: 40.0,
            disk_health: "Healthy".to_string(),
            status: HealthStatus::Warning,
        }));
        metrics.update_from_state(&state);
        metrics.inc_utility_error("CheckUpdates");
        metrics.inc_store_dropped("device_health");

        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains("patchguard_pending_updates 2"));
        assert!(text.contains("patchguard_health_status 1"));
        assert!(text.contains("patchguard_utility_errors_total{action=\"CheckUpdates\"} 1"));
        assert!(text.contains("patchguard_store_dropped_total{table=\"device_health\"} 1"));
    }
}
