mod collectors;
mod config;
mod dashboard;
mod http;
mod metrics;
mod render;
mod state;
mod store;

use axum::serve;
use clap::{Parser, Subcommand};
use collectors::command::{CommandRunner, ProcessRunner};
use collectors::health::HealthClient;
use collectors::updates::UpdateClient;
use config::Config;
use dashboard::Dashboard;
use metrics::Metrics;
use state::State;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use store::HistoryStore;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "patchguard")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the dashboard daemon (default)
    Serve,
    /// Check for pending updates
    Check,
    /// Install the named updates, or everything pending when none are given
    Install { updates: Vec<String> },
    /// Roll back one update, or the most recent one
    Rollback {
        #[arg(long)]
        update_id: Option<String>,
    },
    /// Poll system health and device configuration once
    Health,
    /// Print recent health and update history
    History {
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };

    let store = match HistoryStore::open(Path::new(&cfg.database_path)) {
        Ok(store) => store,
        Err(err) => {
            error!(error = %err, path = %cfg.database_path, "не удалось открыть базу истории");
            std::process::exit(1);
        }
    };
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };

    let shared_state = Arc::new(RwLock::new(State::new(now_unix())));
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
    let dashboard = Dashboard::new(
        UpdateClient::new(runner.clone(), cfg.update_utility.clone()),
        HealthClient::new(runner, cfg.info_utility.clone(), cfg.cpu_warning_percent),
        store,
        shared_state.clone(),
        metrics.clone(),
        cfg.history_limit,
    );

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_daemon(cfg, dashboard, shared_state, metrics).await,
        command => {
            let code = run_once(command, dashboard, &shared_state, cfg.history_limit).await;
            std::process::exit(code);
        }
    }
}

async fn run_daemon(
    cfg: Config,
    dashboard: Dashboard,
    shared_state: Arc<RwLock<State>>,
    metrics: Arc<Metrics>,
) {
    info!(
        listen = %cfg.listen,
        interval_secs = cfg.interval_secs,
        database = %cfg.database_path,
        "запуск patchguard"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (handle, commands) = dashboard::channel(16);

    let http_task = {
        let listen = cfg.listen.clone();
        let app = http::build_router(http::HttpAppState {
            metrics,
            state: shared_state,
            dashboard: handle,
            history_limit: cfg.history_limit,
        });
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "некорректный адрес listen");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "не удалось запустить HTTP-сервер");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "ошибка HTTP-сервера");
            }
        })
    };

    let dashboard_task = tokio::spawn(dashboard.run(
        commands,
        Duration::from_secs(cfg.interval_secs),
        shutdown_rx,
    ));

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");

    let _ = shutdown_tx.send(true);

    let _ = dashboard_task.await;
    let _ = http_task.await;
}

/// Runs one command, prints the result and returns the process exit code.
async fn run_once(
    command: Command,
    mut dashboard: Dashboard,
    shared_state: &Arc<RwLock<State>>,
    default_limit: usize,
) -> i32 {
    let code = match command {
        Command::Serve => 0,
        Command::Check => {
            let result = dashboard.refresh_pending_updates().await;
            println!("{}", render::render_update_check(&result));
            exit_code(result.is_success())
        }
        Command::Install { updates } => {
            let result = dashboard.install_updates(updates).await;
            println!("{}", render::render_action("Update installation", &result));
            exit_code(result.is_success())
        }
        Command::Rollback { update_id } => {
            let result = dashboard.rollback_updates(update_id).await;
            println!("{}", render::render_action("Update rollback", &result));
            exit_code(result.is_success())
        }
        Command::Health => {
            let health = dashboard.refresh_device_health().await;
            let guard = shared_state.read().await;
            match &health {
                Ok(snapshot) => print!("{}", render::render_health(snapshot)),
                Err(err) => eprintln!("Failed to refresh device health: {err}"),
            }
            match (&guard.device_config, &guard.device_config_error) {
                (_, Some(err)) => eprintln!("Failed to read device configuration: {err}"),
                (Some(config), None) => print!("{}", render::render_device_config(config)),
                (None, None) => {}
            }
            exit_code(health.is_ok())
        }
        Command::History { limit } => {
            let (health, updates) = dashboard.history(limit.unwrap_or(default_limit));
            println!("Health history:\n{}", render::render_health_history(&health));
            println!("Update history:\n{}", render::render_update_history(&updates));
            0
        }
    };

    dashboard.close();
    code
}

fn exit_code(success: bool) -> i32 {
    if success {
        0
    } else {
        1
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
