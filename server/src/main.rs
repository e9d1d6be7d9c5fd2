/// you-get-web server.
///
/// Local web GUI for the you-get media downloader: parses CLI flags, loads
/// the INI config, opens the task database, and serves the GUI plus a JSON
/// API until interrupted.
mod config;
mod eventlog;
mod links;
mod manager;
mod proxy_filter;
mod routes;
mod workers;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::routing::{delete, get, post, put};
use axum::Router;
use clap::Parser;
use sqlx::sqlite::SqlitePool;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{Args, Config, ServerType};
use crate::eventlog::EventLog;
use crate::manager::TaskManager;
use crate::proxy_filter::ProxyFilter;

/// Daily re-check of the proxy rule cache; the weekly expiry decides whether
/// anything is actually fetched.
const RULES_CHECK_INTERVAL_SECS: u64 = 60 * 60 * 24;

/// Shared application state for all route handlers.
pub struct AppState {
    pub pool: SqlitePool,
    pub manager: Arc<TaskManager>,
    pub events: EventLog,
}

fn main() -> Result<()> {
    // Load .env
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Init tracing; -D drops the filter to debug
    let default_filter = if args.debug {
        "you_get_web=debug,you_get_web_shared=debug,tower_http=debug"
    } else {
        "you_get_web=info,you_get_web_shared=info,tower_http=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let config = Config::resolve(&args)?;

    // --server-type picks the runtime flavor the HTTP server runs on
    let runtime = match config.server_type {
        ServerType::Threaded => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?,
        ServerType::Single => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?,
    };
    runtime.block_on(serve(config))
}

async fn serve(config: Config) -> Result<()> {
    config.ensure_dirs()?;

    info!("Config file: {}", config.config_file.display());
    info!("Output dir: {}", config.output_dir.display());
    info!("Data dir: {}", config.data_dir.display());
    info!("Server type: {}", config.server_type);

    // Database
    let pool = you_get_web_shared::db::create_pool(&config.database_url()).await?;
    you_get_web_shared::db::run_migrations(&pool).await?;
    you_get_web_shared::db::ensure_db_version(&pool).await?;

    let events = EventLog::new();
    let proxy = Arc::new(ProxyFilter::new(config.data_dir.clone()));
    let manager = Arc::new(TaskManager::new(
        pool.clone(),
        &config,
        events.clone(),
        proxy.clone(),
    ));

    // Confirm the engine is reachable before accepting work
    match manager.engine_version().await {
        Ok(banner) => info!("Engine found: {}", banner),
        Err(e) => warn!("Engine check failed ({}); downloads will error until it is fixed", e),
    }

    // Proxy rule refresh, now and daily
    if config.auto_extractor_proxy {
        let proxy = proxy.clone();
        let events = events.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(RULES_CHECK_INTERVAL_SECS));
            loop {
                interval.tick().await;
                match proxy.refresh().await {
                    Ok(summary) => events.push(format!("Proxy rules loaded: {}", summary)).await,
                    Err(e) => {
                        warn!("Proxy rule refresh failed: {}", e);
                        events
                            .push(format!("Proxy rules unavailable: {}", e))
                            .await;
                    }
                }
            }
        });
    }

    // Pick up where the last run left off
    manager.requeue_unfinished().await?;

    // Background loops
    tokio::spawn(manager.clone().run_scheduler());
    tokio::spawn(manager.clone().run_flush_loop());

    let state = Arc::new(AppState {
        pool,
        manager: manager.clone(),
        events,
    });

    // CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Router
    let app = Router::new()
        .route("/", get(routes::root))
        .route("/html/", get(routes::gui_page))
        .route("/api/version", get(routes::version))
        .route("/api/status", get(routes::status))
        .route("/api/tasks", post(routes::submit_tasks))
        .route("/api/tasks", get(routes::list_tasks))
        .route("/api/tasks", delete(routes::clear_tasks))
        .route("/api/tasks/:id", get(routes::get_task))
        .route("/api/tasks/:id", delete(routes::remove_task))
        .route("/api/tasks/:id/stop", post(routes::stop_task))
        .route("/api/tasks/:id/restart", post(routes::restart_task))
        .route("/api/tasks/:id/file", get(routes::download_file))
        .route("/api/info", post(routes::media_info))
        .route("/api/log", get(routes::activity_log))
        .route("/api/settings", get(routes::get_settings))
        .route("/api/settings", put(routes::put_settings))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state);

    // Bind
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("you-get-web listening on {}", addr);
    info!("GUI at {}", config.gui_url());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Persist everything and leave the database tidy
    manager.shutdown().await;
    info!("Bye");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("ctrl-c handler failed: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => warn!("SIGTERM handler failed: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received ctrl-c, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
