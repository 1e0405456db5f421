mod config;
mod error;
mod models;
mod routes;
mod services;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::services::{
    credentials::CredentialStore,
    history::RefreshHistory,
    orchestrator::{RefreshOrchestrator, RefreshSettings},
    provider::{FetchOptions, GuideFetcher, HttpProviderApi},
    scheduler::{start_scheduler, SchedulerConfig},
    session::{ChromeLoginDriver, SessionManager, SessionPolicy, SessionStore},
};

/// Application state shared across handlers
pub struct AppState {
    pub config: Config,
    pub orchestrator: Arc<RefreshOrchestrator>,
    pub start_time: Instant,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing/logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dtv_guide_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // Load and check configuration
    let config = Config::from_env();
    config.validate()?;
    let port = config.port;

    tracing::info!("Starting DTV Guide Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        data_dir = %config.data_dir.display(),
        out_dir = %config.out_dir.display(),
        stream_url_mode = %config.stream_url_mode,
        prismcast = config.prismcast_host.is_some(),
        "Configuration loaded"
    );

    tokio::fs::create_dir_all(&config.data_dir).await?;
    tokio::fs::create_dir_all(&config.out_dir).await?;

    // Session management (browser login behind the LoginDriver seam)
    let sessions = Arc::new(SessionManager::new(
        CredentialStore::from_config(&config),
        Arc::new(ChromeLoginDriver::new(&config)),
        SessionStore::new(config.session_path()),
        SessionPolicy::from_config(&config),
    ));
    tracing::info!("Session manager initialized: {}", config.session_path().display());

    // Provider API client and guide fetcher
    let api = Arc::new(HttpProviderApi::new(&config)?);
    let fetcher = GuideFetcher::new(api, sessions.clone(), FetchOptions::from_config(&config));

    let history = RefreshHistory::load(config.history_path(), config.history_limit).await;
    let orchestrator = RefreshOrchestrator::new(
        sessions,
        fetcher,
        history,
        RefreshSettings::from_config(&config)?,
    );

    // Start scheduler (runs in background)
    tokio::spawn(start_scheduler(
        orchestrator.clone(),
        SchedulerConfig::from_config(&config)?,
    ));

    // Build application state
    let state = Arc::new(AppState {
        config,
        orchestrator,
        start_time: Instant::now(),
    });

    let app = routes::router(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
