/**
 * UPSWAKE KERNEL - Process entry point
 *
 * Bootstrap: .env, logging, settings, rule book, config (fatal if invalid),
 * services, HTTP listener, per-target workers and the config reloader.
 * Ctrl-C or SIGTERM cancels workers and the reloader at once, then the HTTP
 * server drains and the workers get a grace period to finish.
 */

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use upswake_kernel::config::{Config, Settings, TriggerMode};
use upswake_kernel::evaluator::Evaluator;
use upswake_kernel::http::{self, AppState};
use upswake_kernel::policy::{PolicyEngine, RuleBook};
use upswake_kernel::reload::spawn_config_reloader;
use upswake_kernel::scheduler::{
    cancel_on, HttpTrigger, InProcessTrigger, WakeTrigger, WorkerExit, WorkerRegistry,
};
use upswake_kernel::service::WakeService;
use upswake_kernel::state::SharedConfig;
use upswake_kernel::telemetry::NutClient;
use upswake_kernel::wol::WakeDispatcher;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = Settings::from_env().context("reading settings from environment")?;

    let policy: Arc<dyn PolicyEngine> = Arc::new(RuleBook::new(&settings.rules_dir));
    let cfg = Config::load(&settings.config_path, policy.as_ref())
        .await
        .with_context(|| format!("loading {}", settings.config_path.display()))?;
    info!(
        path = %settings.config_path.display(),
        sources = cfg.nut_servers.len(),
        targets = cfg.target_count(),
        "config loaded"
    );

    let shared = SharedConfig::new(cfg);
    let telemetry = Arc::new(NutClient::new(settings.nut_timeout));
    let evaluator = Evaluator::new(telemetry, policy.clone());
    let service = WakeService::new(evaluator, WakeDispatcher::udp());

    let listener = TcpListener::bind(settings.listen)
        .await
        .with_context(|| format!("binding {}", settings.listen))?;
    info!(addr = %settings.listen, "listening");

    let trigger: Arc<dyn WakeTrigger> = match settings.trigger {
        TriggerMode::Http => {
            Arc::new(HttpTrigger::new(&settings.base_url).context("building HTTP client")?)
        }
        TriggerMode::InProcess => Arc::new(InProcessTrigger::new(service.clone(), shared.clone())),
    };

    let cancel = CancellationToken::new();
    let registry = WorkerRegistry::spawn(&shared.snapshot(), trigger, cancel.clone());
    if registry.is_empty() {
        warn!("no wake targets configured, only the HTTP API is active");
    }

    let reloader = match settings.reload_debounce {
        Some(debounce) => Some(
            spawn_config_reloader(
                settings.config_path.clone(),
                shared.clone(),
                policy.clone(),
                debounce,
                cancel.clone(),
            )
            .context("starting config watcher")?,
        ),
        None => None,
    };

    let app = http::build_router(AppState {
        config: shared,
        service,
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel_on(shutdown_signal(), cancel.clone()))
        .await
        .context("HTTP server")?;

    info!("shutting down");
    for (name, exit) in registry.shutdown(SHUTDOWN_GRACE).await {
        match exit {
            WorkerExit::Stopped => {}
            WorkerExit::Failed(e) => warn!(wake_target = %name, error = %e, "worker had failed"),
            WorkerExit::Panicked(e) => error!(wake_target = %name, error = %e, "worker panicked"),
            WorkerExit::Aborted => warn!(wake_target = %name, "worker aborted"),
        }
    }
    if let Some(handle) = reloader {
        handle.await.ok();
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
