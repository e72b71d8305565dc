use std::env;

use crate::errors::{AppError, AppResult};

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const GENERATIVE_API_BASE: &str = "https://generativelanguage.googleapis.com";

/// Application-wide configuration. Everything is sourced from env vars with
/// defaults, so no user-authored config files are required.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// SQLite location; `None` means the default data directory.
    pub database_url: Option<String>,
    pub google_client_id: Option<String>,
    pub google_client_secret: Option<String>,
    pub google_redirect_uri: Option<String>,
    pub google_project_id: Option<String>,
    pub pubsub_topic: Option<String>,
    pub gmail_api_url: String,
    pub ai_api_url: String,
    pub ai_api_key: Option<String>,
    pub ai_model: String,
    pub request_timeout_secs: u64,
    /// How many recent messages to pull when re-baselining an expired cursor.
    pub resync_fetch_limit: u32,
    pub watch_renewal_interval_minutes: u64,
}

impl Config {
    pub fn load() -> AppResult<Self> {
        let host = env::var("COURIER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("COURIER_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(3000);

        Ok(Self {
            host,
            port,
            database_url: env::var("DATABASE_URL").ok(),
            google_client_id: env::var("GOOGLE_CLIENT_ID").ok(),
            google_client_secret: env::var("GOOGLE_CLIENT_SECRET").ok(),
            google_redirect_uri: env::var("GOOGLE_REDIRECT_URI").ok(),
            google_project_id: env::var("GOOGLE_PROJECT_ID").ok(),
            pubsub_topic: env::var("PUBSUB_TOPIC_NAME").ok(),
            gmail_api_url: env::var("COURIER_GMAIL_API_URL")
                .unwrap_or_else(|_| GMAIL_API_BASE.to_string()),
            ai_api_url: env::var("COURIER_AI_API_URL")
                .unwrap_or_else(|_| GENERATIVE_API_BASE.to_string()),
            ai_api_key: env::var("GEMINI_API_KEY").ok(),
            ai_model: env::var("COURIER_AI_MODEL")
                .unwrap_or_else(|_| "gemini-2.5-flash".to_string()),
            request_timeout_secs: env::var("COURIER_REQUEST_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(30),
            resync_fetch_limit: env::var("COURIER_RESYNC_FETCH_LIMIT")
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(50),
            watch_renewal_interval_minutes: env::var("COURIER_WATCH_RENEWAL_INTERVAL_MINUTES")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(60),
        })
    }

    /// Fully-qualified Pub/Sub topic for `users.watch`.
    pub fn watch_topic(&self) -> AppResult<String> {
        let project = self
            .google_project_id
            .as_deref()
            .ok_or_else(|| AppError::Config("GOOGLE_PROJECT_ID missing".into()))?;
        let topic = self
            .pubsub_topic
            .as_deref()
            .ok_or_else(|| AppError::Config("PUBSUB_TOPIC_NAME missing".into()))?;
        Ok(format!("projects/{project}/topics/{topic}"))
    }
}
