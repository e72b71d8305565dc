//! Notification-driven incremental sync: cursor tracking, history fetch,
//! message ingestion with dedup, and the worker queue that decouples inbound
//! acknowledgment from processing.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::ai::{fallback_annotation, Analyzer, EmailInput};
use crate::config::Config;
use crate::errors::{AppError, AppResult};
use crate::gmail::{parse_message, MailProvider, WatchInfo};
use crate::oauth::OauthService;
use crate::storage::Database;
use crate::types::{now_ts, NewMessage, UserRecord};

const INGEST_QUEUE_DEPTH: usize = 256;
const MAX_JOB_ATTEMPTS: u32 = 3;
const RETRY_DELAY_SECS: u64 = 5;
const WATCH_RENEWAL_WINDOW_HOURS: i64 = 24;

/// Decoded push notification payload.
#[derive(Clone, Debug)]
pub struct Notification {
    pub email_address: String,
    pub history_id: String,
}

#[derive(Clone, Debug)]
pub struct IngestJob {
    pub notification: Notification,
    pub attempt: u32,
}

impl IngestJob {
    pub fn new(notification: Notification) -> Self {
        Self {
            notification,
            attempt: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    Created,
    Existing,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Ids the history fetch produced.
    pub fetched: usize,
    /// Newly persisted records.
    pub ingested: usize,
    /// Ids already present in the store.
    pub duplicates: usize,
    /// Ids no longer retrievable at the provider.
    pub skipped: usize,
    /// True when an expired cursor forced the full-resync path.
    pub resynced: bool,
}

pub struct SyncEngine {
    db: Arc<Database>,
    provider: Arc<dyn MailProvider>,
    analyzer: Arc<dyn Analyzer>,
    oauth: Arc<OauthService>,
    resync_fetch_limit: u32,
    user_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl SyncEngine {
    pub fn new(
        db: Arc<Database>,
        provider: Arc<dyn MailProvider>,
        analyzer: Arc<dyn Analyzer>,
        oauth: Arc<OauthService>,
        resync_fetch_limit: u32,
    ) -> Self {
        Self {
            db,
            provider,
            analyzer,
            oauth,
            resync_fetch_limit,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn user_lock(&self, user_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().await;
        locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Returns a usable access token, refreshing and persisting when the
    /// stored one is stale.
    pub async fn access_token(&self, user: &UserRecord) -> AppResult<String> {
        if !user.token_expired(now_ts()) {
            return Ok(user.access_token.clone());
        }
        let refresh = user.refresh_token.as_deref().ok_or_else(|| {
            AppError::AuthFailure("access token expired and no refresh token stored".into())
        })?;
        let bundle = self.oauth.refresh(refresh).await?;
        self.db
            .update_user_tokens(
                user.id,
                &bundle.access_token,
                bundle.refresh_token.as_deref(),
                bundle.expires_at.map(|dt| dt.timestamp()),
            )
            .await?;
        Ok(bundle.access_token)
    }

    /// Processes one change notification end to end. The cursor advances only
    /// after every message in the batch was persisted or confirmed present,
    /// so a partial failure leaves the old cursor for the next attempt.
    pub async fn handle_notification(&self, note: &Notification) -> AppResult<IngestReport> {
        let user = self
            .db
            .find_user_by_email(&note.email_address)
            .await?
            .ok_or(AppError::UserNotFound)?;

        // Serialize cursor-read/fetch/cursor-write per user; concurrent
        // notifications for different users proceed independently.
        let lock = self.user_lock(user.id).await;
        let _guard = lock.lock().await;

        let user = self
            .db
            .find_user(user.id)
            .await?
            .ok_or(AppError::UserNotFound)?;

        let Some(cursor) = user.history_id.clone() else {
            info!(
                user = %user.email,
                cursor = %note.history_id,
                "No stored cursor; adopting notification cursor as baseline"
            );
            self.db.update_history_id(user.id, &note.history_id).await?;
            return Ok(IngestReport::default());
        };

        if cursor == note.history_id {
            debug!(user = %user.email, cursor = %cursor, "Duplicate notification (cursor unchanged)");
            return Ok(IngestReport::default());
        }

        let token = self.access_token(&user).await?;

        let mut report = IngestReport::default();
        let mut commit_cursor = note.history_id.clone();

        let ids = match self.provider.history_added_ids(&token, &cursor).await {
            Ok(ids) => ids,
            Err(AppError::CursorExpired) => {
                warn!(
                    user = %user.email,
                    cursor = %cursor,
                    "Change cursor expired; falling back to full resync"
                );
                report.resynced = true;
                let ids = self
                    .provider
                    .recent_message_ids(&token, self.resync_fetch_limit)
                    .await?;
                // Re-baseline from the live mailbox position; the notification
                // cursor may itself predate the retention window.
                if let Some(history_id) = self.provider.profile(&token).await?.history_id {
                    commit_cursor = history_id;
                }
                ids
            }
            Err(err) => return Err(err),
        };

        report.fetched = ids.len();

        for id in &ids {
            match self.ingest_message(&user, &token, id).await {
                Ok(IngestOutcome::Created) => report.ingested += 1,
                Ok(IngestOutcome::Existing) => report.duplicates += 1,
                Err(AppError::MessageNotFound) => {
                    // Vanished between the history listing and the fetch;
                    // retrying a notification would never recover it.
                    warn!(user = %user.email, message = %id, "Message gone at provider; skipping");
                    report.skipped += 1;
                }
                Err(err) => return Err(err),
            }
        }

        self.db.update_history_id(user.id, &commit_cursor).await?;
        info!(
            user = %user.email,
            cursor = %commit_cursor,
            fetched = report.fetched,
            ingested = report.ingested,
            duplicates = report.duplicates,
            resynced = report.resynced,
            "Notification cycle complete"
        );
        Ok(report)
    }

    /// Fetches, annotates, and persists one message. The store lookup is the
    /// dedup gate: a known id returns without touching the provider or the
    /// analyzer again.
    pub async fn ingest_message(
        &self,
        user: &UserRecord,
        access_token: &str,
        gmail_id: &str,
    ) -> AppResult<IngestOutcome> {
        if self.db.get_message_by_gmail_id(gmail_id).await?.is_some() {
            return Ok(IngestOutcome::Existing);
        }

        let message = self.provider.fetch_message(access_token, gmail_id).await?;
        let parsed = parse_message(&message);

        let annotation = match self
            .analyzer
            .analyze(&EmailInput {
                subject: &parsed.subject,
                from: &parsed.from_addr,
                body: &parsed.body,
            })
            .await
        {
            Ok(annotation) => annotation,
            Err(err) => {
                warn!(message = %gmail_id, error = %err, "Analysis failed; storing fallback annotation");
                fallback_annotation()
            }
        };

        let new_message = NewMessage {
            user_id: user.id,
            gmail_id: parsed.gmail_id,
            thread_id: parsed.thread_id,
            subject: parsed.subject,
            from_addr: parsed.from_addr,
            to_addrs: parsed.to_addrs,
            body: parsed.body,
            snippet: parsed.snippet,
            received_at: parsed.received_at,
            is_read: parsed.is_read,
            annotation,
        };

        let (_, inserted) = self.db.insert_message_if_absent(&new_message).await?;
        Ok(if inserted {
            IngestOutcome::Created
        } else {
            IngestOutcome::Existing
        })
    }

    /// Registers (or re-registers) the mailbox watch and records the returned
    /// expiration. The watch's history id only seeds the cursor when none is
    /// stored yet.
    pub async fn register_watch(&self, user: &UserRecord, topic: &str) -> AppResult<WatchInfo> {
        let token = self.access_token(user).await?;
        let info = self.provider.start_watch(&token, topic).await?;
        self.db
            .update_watch(user.id, info.history_id.as_deref(), info.expiration)
            .await?;
        Ok(info)
    }

    pub async fn renew_expiring_watches(&self, topic: &str) -> AppResult<()> {
        let cutoff_ms = (now_ts() + WATCH_RENEWAL_WINDOW_HOURS * 3600) * 1000;
        for user in self.db.users_with_expiring_watch(cutoff_ms).await? {
            match self.register_watch(&user, topic).await {
                Ok(info) => {
                    info!(user = %user.email, expiration = ?info.expiration, "Watch renewed")
                }
                Err(err) => warn!(user = %user.email, error = %err, "Watch renewal failed"),
            }
        }
        Ok(())
    }
}

/// Starts the ingest consumer. Jobs are processed off the request path;
/// transient provider failures are requeued with backoff, everything else is
/// logged and absorbed so the upstream notifier never sees an error.
pub fn spawn_worker(engine: Arc<SyncEngine>) -> mpsc::Sender<IngestJob> {
    let (tx, mut rx) = mpsc::channel::<IngestJob>(INGEST_QUEUE_DEPTH);
    let retry_tx = tx.clone();

    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let engine = Arc::clone(&engine);
            let retry_tx = retry_tx.clone();
            tokio::spawn(async move {
                match engine.handle_notification(&job.notification).await {
                    Ok(report) => {
                        debug!(
                            user = %job.notification.email_address,
                            ingested = report.ingested,
                            "Ingest job finished"
                        );
                    }
                    Err(err) if err.is_transient() && job.attempt + 1 < MAX_JOB_ATTEMPTS => {
                        let delay = RETRY_DELAY_SECS << job.attempt;
                        warn!(
                            user = %job.notification.email_address,
                            attempt = job.attempt + 1,
                            delay_secs = delay,
                            error = %err,
                            "Transient failure; requeueing ingest job"
                        );
                        tokio::time::sleep(Duration::from_secs(delay)).await;
                        let _ = retry_tx
                            .send(IngestJob {
                                notification: job.notification,
                                attempt: job.attempt + 1,
                            })
                            .await;
                    }
                    Err(err) => {
                        warn!(
                            user = %job.notification.email_address,
                            error = %err,
                            "Notification processing failed"
                        );
                    }
                }
            });
        }
        info!("Ingest worker stopped");
    });

    tx
}

/// Periodic sweep re-registering watches that are close to expiry. Disabled
/// when no Pub/Sub topic is configured.
pub fn spawn_watch_renewal(engine: Arc<SyncEngine>, config: Arc<Config>) {
    tokio::spawn(async move {
        let topic = match config.watch_topic() {
            Ok(topic) => topic,
            Err(err) => {
                info!("Watch renewal disabled: {err}");
                return;
            }
        };
        let mut ticker =
            tokio::time::interval(Duration::from_secs(config.watch_renewal_interval_minutes * 60));
        loop {
            ticker.tick().await;
            if let Err(err) = engine.renew_expiring_watches(&topic).await {
                warn!(error = %err, "Watch renewal sweep failed");
            }
        }
    });
}
