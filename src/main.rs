use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

use agent_dispatch::admission::{AdmissionController, spawn_admission_loop};
use agent_dispatch::agents::AgentRegistry;
use agent_dispatch::config::DispatchConfig;
use agent_dispatch::monitor::{LatestSample, SysinfoMonitor};
use agent_dispatch::store::LibSqlBackend;
use agent_dispatch::tasks::{ApiState, LogObserver, TaskStore, WebhookObserver, task_routes};
use agent_dispatch::worker::{WorkerEngine, spawn_worker_loop};

/// Install the global subscriber. With a log directory, output also goes to
/// a daily-rolling file; the returned guard must live until exit.
fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let file = tracing_appender::rolling::daily(dir, "agent-dispatch.log");
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(std::io::stdout.and(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DispatchConfig::from_env().context("invalid AGENT_DISPATCH_* configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    let roles = config.roles;
    eprintln!("Agent Dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Worker ID: {}", config.worker_id);
    eprintln!(
        "   Roles: api={} worker={} admission={}",
        roles.api, roles.worker, roles.admission
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db = LibSqlBackend::new_local(&config.db_path)
        .await
        .with_context(|| format!("failed to open database at {}", config.db_path.display()))?;
    eprintln!("   Database: {}", config.db_path.display());

    let store = TaskStore::new(Arc::new(db));
    store.register_observer(Arc::new(LogObserver)).await;
    if let Some(ref url) = config.blocked_webhook {
        store
            .register_observer(Arc::new(WebhookObserver::new(url.clone())?))
            .await;
        eprintln!("   Blocked webhook: {url}");
    }

    // ── Agents ───────────────────────────────────────────────────────────
    let agents = Arc::new(AgentRegistry::load(&config.agents_file)?);
    eprintln!(
        "   Agents: {} profile(s) from {}",
        agents.len(),
        config.agents_file.display()
    );

    let engine = Arc::new(WorkerEngine::new(
        store.clone(),
        Arc::clone(&agents),
        config.worker_config(),
    ));
    let latest_sample = LatestSample::new();
    let mut loops = Vec::new();

    // ── Admission ────────────────────────────────────────────────────────
    let admission = if roles.admission {
        let monitor = Arc::new(SysinfoMonitor::new(config.db_path.clone()));
        let controller = Arc::new(AdmissionController::new(
            monitor,
            Arc::clone(&engine),
            latest_sample.clone(),
            config.admission_config(),
        ));
        loops.push(spawn_admission_loop(
            Arc::clone(&controller),
            config.admission_interval,
        ));
        eprintln!(
            "   Admission: every {}s, max {} concurrent, ceilings cpu {}% ram {}% disk {}%",
            config.admission_interval.as_secs(),
            config.max_concurrent,
            config.ceilings.cpu,
            config.ceilings.ram,
            config.ceilings.disk,
        );
        Some(controller)
    } else {
        None
    };

    // ── Worker ───────────────────────────────────────────────────────────
    if roles.worker {
        loops.push(spawn_worker_loop(
            Arc::clone(&engine),
            config.worker_interval,
            Arc::new(config.exclusions.clone()),
        ));
        eprintln!(
            "   Worker: every {}s, command '{}', timeout {}s",
            config.worker_interval.as_secs(),
            config.command,
            config.timeout.as_secs()
        );
    }

    // ── API ──────────────────────────────────────────────────────────────
    if roles.api {
        let state = ApiState {
            store: store.clone(),
            latest_sample,
            admission,
        };
        let app = task_routes(state).layer(ServiceBuilder::new().layer(CorsLayer::permissive()));
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
            .await
            .with_context(|| format!("failed to bind port {}", config.port))?;
        eprintln!("   API: http://0.0.0.0:{}/api/tasks", config.port);
        eprintln!("   Task WS: ws://0.0.0.0:{}/ws/tasks\n", config.port);
        tracing::info!(port = config.port, "Task API started");

        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;
    } else {
        tokio::signal::ctrl_c().await?;
    }

    tracing::info!("Shutting down");
    for handle in loops {
        handle.abort();
    }
    Ok(())
}
