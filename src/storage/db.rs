use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::warn;

use crate::errors::{AppError, AppResult};
use crate::types::{
    now_ts, Category, MessageRecord, NewMessage, Priority, Sentiment, UserRecord,
};

const DB_FILE_NAME: &str = "courier.db";

/// Filters applied to the message list. `page` is 1-based.
#[derive(Clone, Debug, Default)]
pub struct MessageQuery {
    pub search: Option<String>,
    pub is_read: Option<bool>,
    pub category: Option<Category>,
    pub priority: Option<Priority>,
    pub page: u32,
    pub limit: u32,
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn open_default() -> AppResult<Self> {
        let base = default_data_dir()?;
        let db_path = base.join(DB_FILE_NAME);
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        Self::connect(&url).await
    }

    pub async fn connect(database_url: &str) -> AppResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| AppError::Database(format!("invalid database url: {e}")))?
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(|e| AppError::Database(format!("connecting to sqlite: {e}")))?;

        let db = Database { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Single-connection in-memory store, used by tests.
    pub async fn in_memory() -> AppResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| AppError::Database(format!("opening in-memory sqlite: {e}")))?;

        let db = Database { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> AppResult<()> {
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("enabling foreign keys: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                google_id TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL UNIQUE,
                access_token TEXT NOT NULL,
                refresh_token TEXT,
                token_expiry INTEGER,
                history_id TEXT,
                watch_expiration INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                gmail_id TEXT NOT NULL UNIQUE,
                thread_id TEXT NOT NULL,
                subject TEXT NOT NULL,
                from_addr TEXT NOT NULL,
                to_addrs TEXT NOT NULL,
                body TEXT NOT NULL,
                snippet TEXT NOT NULL,
                received_at INTEGER NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0,
                ai_summary TEXT,
                ai_category TEXT,
                ai_priority TEXT,
                ai_sentiment TEXT,
                ai_action_items TEXT,
                ai_suggested_replies TEXT,
                ai_analyzed_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_messages_user_received
                ON messages(user_id, received_at DESC);
            CREATE INDEX IF NOT EXISTS idx_messages_user_read
                ON messages(user_id, is_read);

            CREATE TABLE IF NOT EXISTS processed_notifications (
                notification_id TEXT PRIMARY KEY,
                received_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("running migrations: {e}")))?;

        Ok(())
    }

    // --- users ---

    pub async fn find_or_create_user(
        &self,
        google_id: &str,
        email: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        token_expiry: Option<i64>,
    ) -> AppResult<UserRecord> {
        let now = now_ts();
        sqlx::query(
            r#"
            INSERT INTO users (google_id, email, access_token, refresh_token, token_expiry, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(google_id) DO UPDATE SET
                email = excluded.email,
                access_token = excluded.access_token,
                refresh_token = COALESCE(excluded.refresh_token, users.refresh_token),
                token_expiry = excluded.token_expiry,
                updated_at = excluded.updated_at;
            "#,
        )
        .bind(google_id)
        .bind(email)
        .bind(access_token)
        .bind(refresh_token)
        .bind(token_expiry)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("upserting user: {e}")))?;

        self.find_user_by_google_id(google_id)
            .await?
            .ok_or_else(|| AppError::Database("user missing after upsert".into()))
    }

    pub async fn find_user_by_google_id(&self, google_id: &str) -> AppResult<Option<UserRecord>> {
        let row = sqlx::query(&format!(
            "{USER_COLUMNS} FROM users WHERE google_id = ?1"
        ))
        .bind(google_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("loading user by google id: {e}")))?;
        Ok(row.map(row_to_user))
    }

    pub async fn find_user_by_email(&self, email: &str) -> AppResult<Option<UserRecord>> {
        let row = sqlx::query(&format!("{USER_COLUMNS} FROM users WHERE email = ?1"))
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("loading user by email: {e}")))?;
        Ok(row.map(row_to_user))
    }

    pub async fn find_user(&self, id: i64) -> AppResult<Option<UserRecord>> {
        let row = sqlx::query(&format!("{USER_COLUMNS} FROM users WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("loading user: {e}")))?;
        Ok(row.map(row_to_user))
    }

    /// The API currently serves a single mailbox: the first onboarded user.
    pub async fn first_user(&self) -> AppResult<Option<UserRecord>> {
        let row = sqlx::query(&format!("{USER_COLUMNS} FROM users ORDER BY id ASC LIMIT 1"))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("loading first user: {e}")))?;
        Ok(row.map(row_to_user))
    }

    pub async fn update_user_tokens(
        &self,
        user_id: i64,
        access_token: &str,
        refresh_token: Option<&str>,
        token_expiry: Option<i64>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE users
            SET access_token = ?1,
                refresh_token = COALESCE(?2, refresh_token),
                token_expiry = ?3,
                updated_at = ?4
            WHERE id = ?5;
            "#,
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(token_expiry)
        .bind(now_ts())
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("updating tokens: {e}")))?;
        Ok(())
    }

    pub async fn update_history_id(&self, user_id: i64, history_id: &str) -> AppResult<()> {
        sqlx::query("UPDATE users SET history_id = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(history_id)
            .bind(now_ts())
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("updating history id: {e}")))?;
        Ok(())
    }

    /// Records a watch registration. The watch response's history id is only
    /// used as a baseline when no cursor is stored yet; advancing an existing
    /// cursor happens exclusively after a successful processing cycle.
    pub async fn update_watch(
        &self,
        user_id: i64,
        baseline_history_id: Option<&str>,
        watch_expiration: Option<i64>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE users
            SET watch_expiration = ?1,
                history_id = COALESCE(history_id, ?2),
                updated_at = ?3
            WHERE id = ?4;
            "#,
        )
        .bind(watch_expiration)
        .bind(baseline_history_id)
        .bind(now_ts())
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("updating watch state: {e}")))?;
        Ok(())
    }

    pub async fn users_with_expiring_watch(&self, cutoff_ms: i64) -> AppResult<Vec<UserRecord>> {
        let rows = sqlx::query(&format!(
            "{USER_COLUMNS} FROM users WHERE watch_expiration IS NOT NULL AND watch_expiration <= ?1"
        ))
        .bind(cutoff_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("loading expiring watches: {e}")))?;
        Ok(rows.into_iter().map(row_to_user).collect())
    }

    // --- notifications ---

    /// At-most-once gate keyed on the upstream notification id. Returns true
    /// the first time an id is seen.
    pub async fn try_mark_notification(&self, notification_id: &str) -> AppResult<bool> {
        let res = sqlx::query(
            "INSERT OR IGNORE INTO processed_notifications (notification_id, received_at) VALUES (?1, ?2)",
        )
        .bind(notification_id)
        .bind(now_ts())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("marking notification: {e}")))?;
        Ok(res.rows_affected() == 1)
    }

    // --- messages ---

    /// Atomic insert-if-absent keyed on the provider message id. Returns the
    /// stored record plus whether this call created it.
    pub async fn insert_message_if_absent(
        &self,
        msg: &NewMessage,
    ) -> AppResult<(MessageRecord, bool)> {
        let now = now_ts();
        let ann = &msg.annotation;
        let res = sqlx::query(
            r#"
            INSERT INTO messages (
                user_id, gmail_id, thread_id, subject, from_addr, to_addrs,
                body, snippet, received_at, is_read,
                ai_summary, ai_category, ai_priority, ai_sentiment,
                ai_action_items, ai_suggested_replies, ai_analyzed_at,
                created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
            ON CONFLICT(gmail_id) DO NOTHING;
            "#,
        )
        .bind(msg.user_id)
        .bind(&msg.gmail_id)
        .bind(&msg.thread_id)
        .bind(&msg.subject)
        .bind(&msg.from_addr)
        .bind(&msg.to_addrs)
        .bind(&msg.body)
        .bind(&msg.snippet)
        .bind(msg.received_at)
        .bind(if msg.is_read { 1i64 } else { 0i64 })
        .bind(ann.summary.as_deref())
        .bind(ann.category.map(|c| c.as_str()))
        .bind(ann.priority.map(|p| p.as_str()))
        .bind(ann.sentiment.map(|s| s.as_str()))
        .bind(serde_json::to_string(&ann.action_items).unwrap_or_else(|_| "[]".into()))
        .bind(serde_json::to_string(&ann.suggested_replies).unwrap_or_else(|_| "[]".into()))
        .bind(ann.analyzed_at)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("inserting message: {e}")))?;

        let inserted = res.rows_affected() == 1;
        let record = self
            .get_message_by_gmail_id(&msg.gmail_id)
            .await?
            .ok_or_else(|| AppError::Database("message missing after insert".into()))?;
        Ok((record, inserted))
    }

    pub async fn get_message(&self, id: i64) -> AppResult<Option<MessageRecord>> {
        let row = sqlx::query(&format!("{MESSAGE_COLUMNS} FROM messages WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("loading message: {e}")))?;
        Ok(row.map(row_to_message))
    }

    pub async fn get_message_by_gmail_id(
        &self,
        gmail_id: &str,
    ) -> AppResult<Option<MessageRecord>> {
        let row = sqlx::query(&format!(
            "{MESSAGE_COLUMNS} FROM messages WHERE gmail_id = ?1"
        ))
        .bind(gmail_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("loading message by provider id: {e}")))?;
        Ok(row.map(row_to_message))
    }

    /// Filtered, paginated list ordered by receipt time descending. Returns
    /// the page of records plus the total match count.
    pub async fn list_messages(
        &self,
        user_id: i64,
        query: &MessageQuery,
    ) -> AppResult<(Vec<MessageRecord>, i64)> {
        let mut count_qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM messages");
        push_filters(&mut count_qb, user_id, query);
        let total: i64 = count_qb
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("counting messages: {e}")))?
            .get(0);

        let page = query.page.max(1);
        let limit = query.limit.max(1);
        let offset = (page - 1) as i64 * limit as i64;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(MESSAGE_COLUMNS);
        qb.push(" FROM messages");
        push_filters(&mut qb, user_id, query);
        qb.push(" ORDER BY received_at DESC LIMIT ");
        qb.push_bind(limit as i64);
        qb.push(" OFFSET ");
        qb.push_bind(offset);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("listing messages: {e}")))?;

        Ok((rows.into_iter().map(row_to_message).collect(), total))
    }

    /// Idempotent read-state set; `None` when the id does not exist.
    pub async fn set_read_state(
        &self,
        id: i64,
        is_read: bool,
    ) -> AppResult<Option<MessageRecord>> {
        let res = sqlx::query("UPDATE messages SET is_read = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(if is_read { 1i64 } else { 0i64 })
            .bind(now_ts())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("updating read state: {e}")))?;

        if res.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_message(id).await
    }

    /// Returns false when the id was already gone, so a second delete can be
    /// reported as not-found.
    pub async fn delete_message(&self, id: i64) -> AppResult<bool> {
        let res = sqlx::query("DELETE FROM messages WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("deleting message: {e}")))?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn unread_count(&self, user_id: i64) -> AppResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM messages WHERE user_id = ?1 AND is_read = 0")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("counting unread: {e}")))?;
        Ok(row.get(0))
    }
}

const USER_COLUMNS: &str = "SELECT id, google_id, email, access_token, refresh_token, \
     token_expiry, history_id, watch_expiration, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "SELECT id, user_id, gmail_id, thread_id, subject, from_addr, \
     to_addrs, body, snippet, received_at, is_read, ai_summary, ai_category, ai_priority, \
     ai_sentiment, ai_action_items, ai_suggested_replies, ai_analyzed_at";

fn push_filters(qb: &mut QueryBuilder<Sqlite>, user_id: i64, query: &MessageQuery) {
    qb.push(" WHERE user_id = ");
    qb.push_bind(user_id);

    if let Some(search) = query.search.as_deref() {
        let trimmed = search.trim();
        if !trimmed.is_empty() {
            let pattern = format!("%{}%", trimmed.to_lowercase());
            qb.push(" AND (lower(subject) LIKE ");
            qb.push_bind(pattern.clone());
            qb.push(" OR lower(from_addr) LIKE ");
            qb.push_bind(pattern.clone());
            qb.push(" OR lower(body) LIKE ");
            qb.push_bind(pattern);
            qb.push(")");
        }
    }

    if let Some(is_read) = query.is_read {
        qb.push(" AND is_read = ");
        qb.push_bind(if is_read { 1i64 } else { 0i64 });
    }

    if let Some(category) = query.category {
        qb.push(" AND ai_category = ");
        qb.push_bind(category.as_str());
    }

    if let Some(priority) = query.priority {
        qb.push(" AND ai_priority = ");
        qb.push_bind(priority.as_str());
    }
}

fn row_to_user(row: sqlx::sqlite::SqliteRow) -> UserRecord {
    UserRecord {
        id: row.get(0),
        google_id: row.get(1),
        email: row.get(2),
        access_token: row.get(3),
        refresh_token: row.get(4),
        token_expiry: row.get(5),
        history_id: row.get(6),
        watch_expiration: row.get(7),
        created_at: row.get(8),
        updated_at: row.get(9),
    }
}

fn row_to_message(row: sqlx::sqlite::SqliteRow) -> MessageRecord {
    let action_items: Vec<String> = row
        .get::<Option<String>, _>(15)
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();
    let suggested_replies: Vec<String> = row
        .get::<Option<String>, _>(16)
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();

    MessageRecord {
        id: row.get(0),
        user_id: row.get(1),
        gmail_id: row.get(2),
        thread_id: row.get(3),
        subject: row.get(4),
        from_addr: row.get(5),
        to_addrs: row.get(6),
        body: row.get(7),
        snippet: row.get(8),
        received_at: row.get(9),
        is_read: row.get::<i64, _>(10) == 1,
        ai_summary: row.get(11),
        ai_category: row
            .get::<Option<String>, _>(12)
            .as_deref()
            .and_then(Category::parse),
        ai_priority: row
            .get::<Option<String>, _>(13)
            .as_deref()
            .and_then(Priority::parse),
        ai_sentiment: row
            .get::<Option<String>, _>(14)
            .as_deref()
            .and_then(Sentiment::parse),
        ai_action_items: action_items,
        ai_suggested_replies: suggested_replies,
        ai_analyzed_at: row.get(17),
    }
}

pub(crate) fn default_data_dir() -> AppResult<PathBuf> {
    if let Ok(custom) = env::var("COURIER_DATA_DIR") {
        let path = PathBuf::from(custom);
        std::fs::create_dir_all(&path)
            .map_err(|e| AppError::Database(format!("creating COURIER_DATA_DIR: {e}")))?;
        return Ok(path);
    }

    if let Some(home) = dirs::home_dir() {
        let path = home.join(".courier");
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        }
        warn!(
            "Unable to create {}/.courier; falling back to workspace-local storage",
            home.display()
        );
    }

    let cwd = env::current_dir()
        .map_err(|e| AppError::Database(format!("determining current directory: {e}")))?;
    let path = cwd.join("courier-data");
    std::fs::create_dir_all(&path)
        .map_err(|e| AppError::Database(format!("creating fallback data directory: {e}")))?;
    Ok(path)
}
