use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chan_reply_poster::config::Config;
use chan_reply_poster::db::Database;
use chan_reply_poster::drafts::DraftStore;
use chan_reply_poster::posting::{Collaborators, CooldownTracker, CoordinatorConfig, JobCoordinator};
use chan_reply_poster::site::{HttpSite, SiteRegistry};
use chan_reply_poster::web::{self, AppState};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    init_tracing()?;

    info!("Starting chan-reply-poster");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!(
        site = %config.site_name,
        base_url = %config.site_base_url,
        logged_in = config.site_logged_in,
        "Configuration loaded"
    );

    if let Some(parent) = config.database_path.parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("Failed to create database directory: {}", parent.display())
        })?;
    }

    let db = Database::new(&config.database_path)
        .await
        .context("Failed to initialize database")?;

    info!("Database initialized");

    let drafts = Arc::new(DraftStore::new());
    let site = HttpSite::new(config.http_site(), Arc::clone(&drafts))?;

    let mut registry = SiteRegistry::new();
    registry.register(Arc::new(site));
    info!(sites = ?registry.names(), "Sites registered");
    let sites = Arc::new(registry);

    let shutdown = CancellationToken::new();
    let coordinator = JobCoordinator::spawn(
        Collaborators {
            cooldowns: Arc::new(CooldownTracker::new(Arc::clone(&sites))),
            sites,
            replies: drafts.clone(),
            outcomes: Arc::new(db.clone()),
            additional_service: None,
        },
        CoordinatorConfig {
            pin_thread_on_post: config.pin_thread_on_post,
            ..CoordinatorConfig::default()
        },
        shutdown.clone(),
    );

    let exit_when_idle = config.exit_when_idle;
    let state = AppState {
        coordinator: coordinator.clone(),
        drafts,
        db,
        config: Arc::new(config),
    };

    let web_shutdown = shutdown.clone();
    let web_handle = tokio::spawn(async move {
        if let Err(e) = web::serve(state, web_shutdown).await {
            error!("Web server error: {e:#}");
        }
    });

    let mut idle = coordinator.idle_signal();
    tokio::select! {
        () = shutdown_signal() => {}
        _ = idle.changed(), if exit_when_idle => {
            info!("All submitted replies processed, exiting");
        }
    }

    info!("Shutting down...");

    coordinator.cancel_all().await;
    shutdown.cancel();
    if let Err(e) = web_handle.await {
        error!("Web server task failed: {e}");
    }

    info!("Shutdown complete");

    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,chan_reply_poster=debug"));

    // Check if JSON logging is requested
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| matches!(v.to_lowercase().as_str(), "json" | "structured"))
        .unwrap_or(false);

    if use_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
