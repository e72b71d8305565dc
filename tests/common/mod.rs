#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use courier::ai::{Analyzer, EmailInput, Tone};
use courier::config::Config;
use courier::errors::{AppError, AppResult};
use courier::gmail::{
    GmailBody, GmailHeader, GmailMessage, GmailPayload, MailProvider, MailboxProfile, WatchInfo,
};
use courier::ingest::{Notification, SyncEngine};
use courier::oauth::OauthService;
use courier::server::AppState;
use courier::storage::Database;
use courier::types::{now_ts, AiAnnotation, Category, Priority, Sentiment, UserRecord};

/// In-memory mailbox provider with call counters and failure injection.
#[derive(Default)]
pub struct FakeProvider {
    messages: Mutex<HashMap<String, GmailMessage>>,
    history_ids: Mutex<Vec<String>>,
    recent_ids: Mutex<Vec<String>>,
    cursor_expired: Mutex<bool>,
    profile_history_id: Mutex<Option<String>>,
    fail_fetch_once: Mutex<HashSet<String>>,
    pub fetch_calls: AtomicUsize,
    pub history_calls: AtomicUsize,
    pub sent: Mutex<Vec<(String, Option<String>)>>,
}

impl FakeProvider {
    pub fn insert_message(&self, message: GmailMessage) {
        self.messages
            .lock()
            .unwrap()
            .insert(message.id.clone(), message);
    }

    pub fn set_history(&self, ids: &[&str]) {
        *self.history_ids.lock().unwrap() = ids.iter().map(|s| s.to_string()).collect();
    }

    pub fn set_recent(&self, ids: &[&str]) {
        *self.recent_ids.lock().unwrap() = ids.iter().map(|s| s.to_string()).collect();
    }

    pub fn expire_cursor(&self, expired: bool) {
        *self.cursor_expired.lock().unwrap() = expired;
    }

    pub fn set_profile_history_id(&self, history_id: &str) {
        *self.profile_history_id.lock().unwrap() = Some(history_id.to_string());
    }

    /// The next fetch of this id fails transiently; subsequent fetches succeed.
    pub fn fail_next_fetch(&self, id: &str) {
        self.fail_fetch_once.lock().unwrap().insert(id.to_string());
    }

    pub fn sent_messages(&self) -> Vec<(String, Option<String>)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailProvider for FakeProvider {
    async fn profile(&self, _access_token: &str) -> AppResult<MailboxProfile> {
        Ok(MailboxProfile {
            email_address: "fake@example.com".to_string(),
            history_id: self.profile_history_id.lock().unwrap().clone(),
        })
    }

    async fn start_watch(&self, _access_token: &str, _topic: &str) -> AppResult<WatchInfo> {
        Ok(WatchInfo {
            history_id: Some("1".to_string()),
            expiration: Some((now_ts() + 7 * 24 * 3600) * 1000),
        })
    }

    async fn history_added_ids(
        &self,
        _access_token: &str,
        _start_history_id: &str,
    ) -> AppResult<Vec<String>> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        if *self.cursor_expired.lock().unwrap() {
            return Err(AppError::CursorExpired);
        }
        Ok(self.history_ids.lock().unwrap().clone())
    }

    async fn recent_message_ids(&self, _access_token: &str, _limit: u32) -> AppResult<Vec<String>> {
        Ok(self.recent_ids.lock().unwrap().clone())
    }

    async fn fetch_message(
        &self,
        _access_token: &str,
        message_id: &str,
    ) -> AppResult<GmailMessage> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetch_once.lock().unwrap().remove(message_id) {
            return Err(AppError::ProviderTransient("injected fetch failure".into()));
        }
        self.messages
            .lock()
            .unwrap()
            .get(message_id)
            .cloned()
            .ok_or(AppError::MessageNotFound)
    }

    async fn send_message(
        &self,
        _access_token: &str,
        raw: &str,
        thread_id: Option<&str>,
    ) -> AppResult<String> {
        self.sent
            .lock()
            .unwrap()
            .push((raw.to_string(), thread_id.map(|t| t.to_string())));
        Ok(format!("sent-{}", self.sent.lock().unwrap().len()))
    }
}

/// Analyzer stub: either a fixed annotation or a simulated outage.
#[derive(Default)]
pub struct FakeAnalyzer {
    fail: Mutex<bool>,
    pub analyze_calls: AtomicUsize,
}

impl FakeAnalyzer {
    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

#[async_trait]
impl Analyzer for FakeAnalyzer {
    async fn analyze(&self, email: &EmailInput<'_>) -> AppResult<AiAnnotation> {
        self.analyze_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail.lock().unwrap() {
            return Err(AppError::Analysis("simulated outage".into()));
        }
        Ok(AiAnnotation {
            summary: Some(format!("summary of {}", email.subject)),
            category: Some(Category::Work),
            priority: Some(Priority::Medium),
            sentiment: Some(Sentiment::Neutral),
            action_items: vec!["follow up".to_string()],
            suggested_replies: vec![
                "Sounds good.".to_string(),
                "On it!".to_string(),
                "Thanks.".to_string(),
            ],
            analyzed_at: Some(now_ts()),
        })
    }

    async fn compose(
        &self,
        prompt: &str,
        tone: Tone,
        _context: Option<&str>,
    ) -> AppResult<String> {
        if *self.fail.lock().unwrap() {
            return Err(AppError::Analysis("simulated outage".into()));
        }
        Ok(format!("[{}] {prompt}", tone.as_str()))
    }
}

pub struct TestContext {
    pub db: Arc<Database>,
    pub provider: Arc<FakeProvider>,
    pub analyzer: Arc<FakeAnalyzer>,
    pub engine: Arc<SyncEngine>,
}

impl TestContext {
    pub async fn new() -> Self {
        let db = Arc::new(Database::in_memory().await.expect("in-memory db"));
        let provider = Arc::new(FakeProvider::default());
        let analyzer = Arc::new(FakeAnalyzer::default());
        let oauth = Arc::new(
            OauthService::new("test-client", "test-secret", "http://127.0.0.1/callback")
                .expect("oauth service"),
        );
        let provider_dyn: Arc<dyn MailProvider> = provider.clone();
        let analyzer_dyn: Arc<dyn Analyzer> = analyzer.clone();
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&db),
            provider_dyn,
            analyzer_dyn,
            oauth,
            50,
        ));
        Self {
            db,
            provider,
            analyzer,
            engine,
        }
    }

    pub async fn seed_user(&self, email: &str, history_id: Option<&str>) -> UserRecord {
        let user = self
            .db
            .find_or_create_user(&format!("g-{email}"), email, "token-1", Some("refresh-1"), None)
            .await
            .expect("seed user");
        if let Some(cursor) = history_id {
            self.db
                .update_history_id(user.id, cursor)
                .await
                .expect("seed cursor");
        }
        self.db
            .find_user(user.id)
            .await
            .expect("reload user")
            .expect("user exists")
    }

    pub fn app_state(&self) -> AppState {
        let jobs = courier::ingest::spawn_worker(Arc::clone(&self.engine));
        let provider: Arc<dyn MailProvider> = self.provider.clone();
        let analyzer: Arc<dyn Analyzer> = self.analyzer.clone();
        AppState {
            db: Arc::clone(&self.db),
            provider,
            analyzer,
            oauth: Arc::new(
                OauthService::new("test-client", "test-secret", "http://127.0.0.1/callback")
                    .expect("oauth service"),
            ),
            engine: Arc::clone(&self.engine),
            jobs,
            config: Arc::new(test_config()),
        }
    }
}

pub fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        database_url: None,
        google_client_id: None,
        google_client_secret: None,
        google_redirect_uri: None,
        google_project_id: Some("test-project".to_string()),
        pubsub_topic: Some("test-topic".to_string()),
        gmail_api_url: "http://127.0.0.1:1".to_string(),
        ai_api_url: "http://127.0.0.1:1".to_string(),
        ai_api_key: None,
        ai_model: "test-model".to_string(),
        request_timeout_secs: 5,
        resync_fetch_limit: 50,
        watch_renewal_interval_minutes: 60,
    }
}

pub fn notification(email: &str, history_id: &str) -> Notification {
    Notification {
        email_address: email.to_string(),
        history_id: history_id.to_string(),
    }
}

pub fn encode_part(text: &str) -> String {
    URL_SAFE_NO_PAD.encode(text.as_bytes())
}

pub fn header(name: &str, value: &str) -> GmailHeader {
    GmailHeader {
        name: name.to_string(),
        value: value.to_string(),
    }
}

pub fn plain_part(text: &str) -> GmailPayload {
    GmailPayload {
        mime_type: Some("text/plain".to_string()),
        body: Some(GmailBody {
            data: Some(encode_part(text)),
        }),
        ..Default::default()
    }
}

pub fn html_part(html: &str) -> GmailPayload {
    GmailPayload {
        mime_type: Some("text/html".to_string()),
        body: Some(GmailBody {
            data: Some(encode_part(html)),
        }),
        ..Default::default()
    }
}

/// A single-part plain-text message with the usual headers.
pub fn plain_message(
    id: &str,
    thread_id: &str,
    subject: &str,
    from: &str,
    body: &str,
    unread: bool,
) -> GmailMessage {
    let mut labels = vec!["INBOX".to_string()];
    if unread {
        labels.push("UNREAD".to_string());
    }
    GmailMessage {
        id: id.to_string(),
        thread_id: Some(thread_id.to_string()),
        label_ids: Some(labels),
        snippet: Some(body.chars().take(40).collect()),
        internal_date: Some("1700000000000".to_string()),
        payload: Some(GmailPayload {
            mime_type: Some("text/plain".to_string()),
            headers: Some(vec![
                header("Subject", subject),
                header("From", from),
                header("To", "me@example.com"),
                header("Date", "Tue, 14 Nov 2023 22:13:20 +0000"),
            ]),
            body: Some(GmailBody {
                data: Some(encode_part(body)),
            }),
            parts: None,
        }),
    }
}
