//! Gmail REST provider: history-based incremental fetch, message retrieval,
//! watch registration, and send. All calls go through `MailProvider` so tests
//! can substitute a fake.
use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::sleep;

use crate::errors::{AppError, AppResult};
use crate::types::now_ts;

const DEFAULT_PAGE_SIZE: u32 = 100;
const MAX_RATE_LIMIT_RETRIES: usize = 5;
const RESPONSE_SNIPPET_MAX_LEN: usize = 200;

#[derive(Clone, Debug)]
pub struct MailboxProfile {
    pub email_address: String,
    pub history_id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct WatchInfo {
    pub history_id: Option<String>,
    /// Provider epoch millis.
    pub expiration: Option<i64>,
}

/// Normalized form of a fetched message, ready for annotation and storage.
#[derive(Clone, Debug)]
pub struct ParsedEmail {
    pub gmail_id: String,
    pub thread_id: String,
    pub subject: String,
    pub from_addr: String,
    pub to_addrs: String,
    pub body: String,
    pub snippet: String,
    pub received_at: i64,
    pub is_read: bool,
}

#[async_trait]
pub trait MailProvider: Send + Sync {
    async fn profile(&self, access_token: &str) -> AppResult<MailboxProfile>;

    async fn start_watch(&self, access_token: &str, topic: &str) -> AppResult<WatchInfo>;

    /// Message ids added since the cursor, in history order, deduplicated.
    /// Fails with `CursorExpired` when the provider no longer retains the
    /// cursor's range.
    async fn history_added_ids(
        &self,
        access_token: &str,
        start_history_id: &str,
    ) -> AppResult<Vec<String>>;

    /// Most recent message ids, used to re-baseline after cursor expiry.
    async fn recent_message_ids(&self, access_token: &str, limit: u32) -> AppResult<Vec<String>>;

    async fn fetch_message(&self, access_token: &str, message_id: &str)
        -> AppResult<GmailMessage>;

    /// Sends a base64url-encoded RFC 2822 message, optionally threading it.
    /// Returns the provider id of the sent message.
    async fn send_message(
        &self,
        access_token: &str,
        raw: &str,
        thread_id: Option<&str>,
    ) -> AppResult<String>;
}

// --- wire types ---

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GmailMessage {
    pub id: String,
    pub thread_id: Option<String>,
    pub label_ids: Option<Vec<String>>,
    pub snippet: Option<String>,
    /// Epoch millis, serialized as a string by the API.
    pub internal_date: Option<String>,
    pub payload: Option<GmailPayload>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GmailPayload {
    pub mime_type: Option<String>,
    pub headers: Option<Vec<GmailHeader>>,
    pub body: Option<GmailBody>,
    pub parts: Option<Vec<GmailPayload>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct GmailHeader {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GmailBody {
    pub data: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct HistoryListResponse {
    history: Option<Vec<HistoryRecord>>,
    next_page_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct HistoryRecord {
    messages_added: Option<Vec<MessageAdded>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct MessageAdded {
    message: Option<MessageStub>,
}

#[derive(Debug, Default, Deserialize)]
struct MessageStub {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct MessageListResponse {
    messages: Option<Vec<MessageStub>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ProfileResponse {
    email_address: Option<String>,
    history_id: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WatchResponse {
    history_id: Option<Value>,
    expiration: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SendResponse {
    id: Option<String>,
}

/// History ids and expirations arrive as JSON strings or numbers depending on
/// the surface; normalize both.
pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

enum FetchOutcome {
    Body(String),
    NotFound,
}

#[derive(Clone)]
pub struct GmailClient {
    client: reqwest::Client,
    base_url: String,
}

impl GmailClient {
    pub fn new(base_url: &str, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Unexpected(format!("building http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_with_retry(
        &self,
        access_token: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> AppResult<FetchOutcome> {
        let mut backoff_seconds = 1u64;

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let response = self
                .client
                .get(url)
                .bearer_auth(access_token)
                .query(query)
                .send()
                .await
                .map_err(|e| AppError::ProviderTransient(format!("gmail request failed: {e}")))?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                if attempt == MAX_RATE_LIMIT_RETRIES {
                    return Err(AppError::ProviderTransient(
                        "gmail rate limit: retries exhausted".into(),
                    ));
                }
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(backoff_seconds);
                sleep(Duration::from_secs(retry_after)).await;
                backoff_seconds = (backoff_seconds * 2).min(32);
                continue;
            }

            if status == StatusCode::NOT_FOUND {
                return Ok(FetchOutcome::NotFound);
            }

            let body = response
                .text()
                .await
                .map_err(|e| AppError::ProviderTransient(format!("reading gmail response: {e}")))?;

            if status.is_success() {
                return Ok(FetchOutcome::Body(body));
            }
            return Err(status_error(status, &body));
        }

        Err(AppError::ProviderTransient(
            "gmail request failed without response".into(),
        ))
    }

    async fn post_json(
        &self,
        access_token: &str,
        url: &str,
        payload: &Value,
    ) -> AppResult<String> {
        let response = self
            .client
            .post(url)
            .bearer_auth(access_token)
            .json(payload)
            .send()
            .await
            .map_err(|e| AppError::ProviderTransient(format!("gmail request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::ProviderTransient(format!("reading gmail response: {e}")))?;

        if status.is_success() {
            return Ok(body);
        }
        Err(status_error(status, &body))
    }
}

#[async_trait]
impl MailProvider for GmailClient {
    async fn profile(&self, access_token: &str) -> AppResult<MailboxProfile> {
        let url = format!("{}/users/me/profile", self.base_url);
        let body = match self.get_with_retry(access_token, &url, &[]).await? {
            FetchOutcome::Body(body) => body,
            FetchOutcome::NotFound => {
                return Err(AppError::Unexpected("gmail profile not found".into()))
            }
        };
        let parsed: ProfileResponse = serde_json::from_str(&body)
            .map_err(|e| AppError::Unexpected(format!("decode gmail profile: {e}")))?;
        Ok(MailboxProfile {
            email_address: parsed.email_address.unwrap_or_default(),
            history_id: parsed.history_id.as_ref().and_then(value_to_string),
        })
    }

    async fn start_watch(&self, access_token: &str, topic: &str) -> AppResult<WatchInfo> {
        let url = format!("{}/users/me/watch", self.base_url);
        let payload = json!({
            "topicName": topic,
            "labelIds": ["INBOX"],
        });
        let body = self.post_json(access_token, &url, &payload).await?;
        let parsed: WatchResponse = serde_json::from_str(&body)
            .map_err(|e| AppError::Unexpected(format!("decode gmail watch response: {e}")))?;
        Ok(WatchInfo {
            history_id: parsed.history_id.as_ref().and_then(value_to_string),
            expiration: parsed
                .expiration
                .as_ref()
                .and_then(value_to_string)
                .and_then(|raw| raw.parse::<i64>().ok()),
        })
    }

    async fn history_added_ids(
        &self,
        access_token: &str,
        start_history_id: &str,
    ) -> AppResult<Vec<String>> {
        let url = format!("{}/users/me/history", self.base_url);
        let mut ids = Vec::new();
        let mut seen = HashSet::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("startHistoryId", start_history_id.to_string()),
                ("historyTypes", "messageAdded".to_string()),
                ("maxResults", DEFAULT_PAGE_SIZE.to_string()),
            ];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }

            let body = match self.get_with_retry(access_token, &url, &query).await? {
                FetchOutcome::Body(body) => body,
                // history.list answers 404 when the cursor fell out of the
                // retention window
                FetchOutcome::NotFound => return Err(AppError::CursorExpired),
            };
            let list: HistoryListResponse = serde_json::from_str(&body)
                .map_err(|e| AppError::Unexpected(format!("decode gmail history list: {e}")))?;

            for record in list.history.unwrap_or_default() {
                for added in record.messages_added.unwrap_or_default() {
                    if let Some(stub) = added.message {
                        if seen.insert(stub.id.clone()) {
                            ids.push(stub.id);
                        }
                    }
                }
            }

            page_token = list.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        Ok(ids)
    }

    async fn recent_message_ids(&self, access_token: &str, limit: u32) -> AppResult<Vec<String>> {
        let url = format!("{}/users/me/messages", self.base_url);
        let query = vec![("maxResults", limit.to_string())];
        let body = match self.get_with_retry(access_token, &url, &query).await? {
            FetchOutcome::Body(body) => body,
            FetchOutcome::NotFound => {
                return Err(AppError::Unexpected("gmail message list not found".into()))
            }
        };
        let list: MessageListResponse = serde_json::from_str(&body)
            .map_err(|e| AppError::Unexpected(format!("decode gmail message list: {e}")))?;
        Ok(list
            .messages
            .unwrap_or_default()
            .into_iter()
            .map(|stub| stub.id)
            .collect())
    }

    async fn fetch_message(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> AppResult<GmailMessage> {
        let url = format!("{}/users/me/messages/{message_id}", self.base_url);
        let query = vec![("format", "full".to_string())];
        let body = match self.get_with_retry(access_token, &url, &query).await? {
            FetchOutcome::Body(body) => body,
            FetchOutcome::NotFound => return Err(AppError::MessageNotFound),
        };
        serde_json::from_str(&body)
            .map_err(|e| AppError::Unexpected(format!("decode gmail message: {e}")))
    }

    async fn send_message(
        &self,
        access_token: &str,
        raw: &str,
        thread_id: Option<&str>,
    ) -> AppResult<String> {
        let url = format!("{}/users/me/messages/send", self.base_url);
        let mut payload = json!({ "raw": raw });
        if let Some(thread_id) = thread_id {
            payload["threadId"] = json!(thread_id);
        }
        let body = self.post_json(access_token, &url, &payload).await?;
        let parsed: SendResponse = serde_json::from_str(&body)
            .map_err(|e| AppError::Unexpected(format!("decode gmail send response: {e}")))?;
        Ok(parsed.id.unwrap_or_default())
    }
}

fn status_error(status: StatusCode, body: &str) -> AppError {
    let snippet = truncate_response(body);
    if status == StatusCode::UNAUTHORIZED {
        AppError::AuthFailure(format!("gmail rejected credentials: {snippet}"))
    } else if status.is_server_error() {
        AppError::ProviderTransient(format!("gmail server error {status}: {snippet}"))
    } else {
        AppError::Unexpected(format!("gmail request failed with {status}: {snippet}"))
    }
}

fn truncate_response(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= RESPONSE_SNIPPET_MAX_LEN {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(RESPONSE_SNIPPET_MAX_LEN).collect();
        format!("{cut}…[truncated {} bytes]", trimmed.len())
    }
}

// --- message parsing ---

pub fn parse_message(msg: &GmailMessage) -> ParsedEmail {
    let payload = msg.payload.as_ref();

    let subject = payload
        .and_then(|p| extract_header(p, "Subject"))
        .unwrap_or_else(|| "(No Subject)".to_string());
    let from_addr = payload
        .and_then(|p| extract_header(p, "From"))
        .unwrap_or_default();
    let to_addrs = payload
        .and_then(|p| extract_header(p, "To"))
        .unwrap_or_default();
    let date_header = payload.and_then(|p| extract_header(p, "Date"));

    let received_at = date_header
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc2822(raw).ok())
        .map(|dt| dt.with_timezone(&Utc).timestamp())
        .or_else(|| {
            msg.internal_date
                .as_deref()
                .and_then(|ms| ms.parse::<i64>().ok())
                .map(|ms| ms / 1000)
        })
        .unwrap_or_else(now_ts);

    let body = payload
        .map(extract_body)
        .unwrap_or_else(|| "(No content)".to_string());

    let is_read = !msg
        .label_ids
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|label| label == "UNREAD");

    ParsedEmail {
        gmail_id: msg.id.clone(),
        thread_id: msg.thread_id.clone().unwrap_or_default(),
        subject,
        from_addr,
        to_addrs,
        body,
        snippet: msg.snippet.clone().unwrap_or_default(),
        received_at,
        is_read,
    }
}

pub fn extract_header(payload: &GmailPayload, name: &str) -> Option<String> {
    payload
        .headers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

/// Walks the MIME tree collecting plain-text leaves in traversal order;
/// the concatenation of those wins. An HTML part is the fallback when no
/// plain text exists anywhere in the tree.
pub fn extract_body(payload: &GmailPayload) -> String {
    let mut plain: Vec<String> = Vec::new();
    let mut html: Option<String> = None;
    collect_text_parts(payload, &mut plain, &mut html);

    if !plain.is_empty() {
        return plain.concat();
    }
    if let Some(html) = html {
        return html;
    }
    // single-part messages with an unusual mime type still carry data at the root
    if let Some(data) = payload.body.as_ref().and_then(|b| b.data.as_deref()) {
        if let Ok(decoded) = decode_body_data(data) {
            return decoded;
        }
    }
    "(No content)".to_string()
}

fn collect_text_parts(payload: &GmailPayload, plain: &mut Vec<String>, html: &mut Option<String>) {
    let mime_type = payload
        .mime_type
        .as_deref()
        .unwrap_or("")
        .to_ascii_lowercase();

    if let Some(data) = payload.body.as_ref().and_then(|b| b.data.as_deref()) {
        if !data.is_empty() {
            if let Ok(decoded) = decode_body_data(data) {
                if mime_type == "text/plain" {
                    plain.push(decoded);
                } else if mime_type == "text/html" && html.is_none() {
                    *html = Some(decoded);
                }
            }
        }
    }

    if let Some(parts) = &payload.parts {
        for part in parts {
            collect_text_parts(part, plain, html);
        }
    }
}

pub fn decode_body_data(data: &str) -> AppResult<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(data)
        .map_err(|e| AppError::Unexpected(format!("base64url decode body data: {e}")))?;
    String::from_utf8(bytes).map_err(|e| AppError::Unexpected(format!("utf8 decode body: {e}")))
}

// --- outbound message building ---

/// Extracts the address inside angle brackets, falling back to the raw header.
pub fn bracketed_address(raw: &str) -> String {
    if let (Some(start), Some(end)) = (raw.rfind('<'), raw.rfind('>')) {
        if start < end {
            let inner = raw[start + 1..end].trim();
            if !inner.is_empty() {
                return inner.to_string();
            }
        }
    }
    raw.trim().to_string()
}

/// Prefixes `Re: ` unless the subject already carries it, so repeated replies
/// never stack prefixes.
pub fn reply_subject(subject: &str) -> String {
    if subject.starts_with("Re: ") {
        subject.to_string()
    } else {
        format!("Re: {subject}")
    }
}

pub fn build_raw_message(to: &str, subject: &str, body: &str) -> String {
    [
        format!("To: {to}"),
        format!("Subject: {subject}"),
        String::new(),
        body.to_string(),
    ]
    .join("\n")
}

pub fn build_raw_reply(to: &str, subject: &str, original_gmail_id: &str, body: &str) -> String {
    [
        format!("To: {to}"),
        format!("Subject: {subject}"),
        format!("In-Reply-To: {original_gmail_id}"),
        format!("References: {original_gmail_id}"),
        String::new(),
        body.to_string(),
    ]
    .join("\n")
}

pub fn encode_raw(message: &str) -> String {
    URL_SAFE_NO_PAD.encode(message.as_bytes())
}
