pub mod assist;
pub mod auth;
pub mod inbox;
pub mod webhook;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::mpsc;
use tracing::info;

use crate::ai::{Analyzer, GeminiClient};
use crate::config::Config;
use crate::errors::{AppError, AppResult};
use crate::gmail::{GmailClient, MailProvider};
use crate::ingest::{self, IngestJob, SyncEngine};
use crate::oauth::OauthService;
use crate::storage::Database;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub provider: Arc<dyn MailProvider>,
    pub analyzer: Arc<dyn Analyzer>,
    pub oauth: Arc<OauthService>,
    pub engine: Arc<SyncEngine>,
    pub jobs: mpsc::Sender<IngestJob>,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/auth/google", get(auth::start))
        .route("/auth/google/callback", get(auth::callback))
        .route("/webhook/gmail", post(webhook::gmail_notification))
        .route("/webhook/health", get(webhook::health))
        .route("/api/inbox", get(inbox::list))
        .route("/api/inbox/send", post(inbox::send))
        .route("/api/inbox/stats/unread", get(inbox::unread_count))
        .route("/api/inbox/reply/:id", post(inbox::reply))
        .route("/api/inbox/:id", get(inbox::detail).delete(inbox::delete))
        .route("/api/inbox/:id/read", post(inbox::mark_read))
        .route("/api/inbox/:id/unread", post(inbox::mark_unread))
        .route("/api/ai/generate-email", post(assist::generate_email))
        .with_state(state)
}

pub async fn run(config: Config) -> AppResult<()> {
    let config = Arc::new(config);

    let db = Arc::new(match &config.database_url {
        Some(url) => Database::connect(url).await?,
        None => Database::open_default().await?,
    });

    let timeout = Duration::from_secs(config.request_timeout_secs);
    let provider: Arc<dyn MailProvider> =
        Arc::new(GmailClient::new(&config.gmail_api_url, timeout)?);
    let analyzer: Arc<dyn Analyzer> = Arc::new(GeminiClient::new(
        &config.ai_api_url,
        config.ai_api_key.as_deref().unwrap_or_default(),
        &config.ai_model,
        timeout,
    )?);
    let oauth = Arc::new(OauthService::from_config(&config)?);

    let engine = Arc::new(SyncEngine::new(
        Arc::clone(&db),
        Arc::clone(&provider),
        Arc::clone(&analyzer),
        Arc::clone(&oauth),
        config.resync_fetch_limit,
    ));

    let jobs = ingest::spawn_worker(Arc::clone(&engine));
    ingest::spawn_watch_renewal(Arc::clone(&engine), Arc::clone(&config));

    let state = AppState {
        db,
        provider,
        analyzer,
        oauth,
        engine,
        jobs,
        config: Arc::clone(&config),
    };
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| AppError::Unexpected(format!("binding {addr}: {e}")))?;
    info!("courier listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| AppError::Unexpected(format!("server error: {e}")))?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}

pub(crate) fn require_field(value: Option<String>, name: &str) -> AppResult<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Validation(format!("{name} is required")))
}
