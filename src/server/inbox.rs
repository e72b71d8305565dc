use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::errors::{AppError, AppResult};
use crate::gmail::{
    bracketed_address, build_raw_message, build_raw_reply, encode_raw, reply_subject,
};
use crate::server::{require_field, AppState};
use crate::storage::MessageQuery;
use crate::types::{Category, MessageRecord, Priority, UserRecord};

const DEFAULT_PAGE_SIZE: u32 = 50;

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub search: Option<String>,
    pub filter: Option<String>,
    pub category: Option<String>,
    pub priority: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> AppResult<Json<Value>> {
    let user = current_user(&state).await?;

    let is_read = match params.filter.as_deref() {
        Some("unread") => Some(false),
        Some("read") => Some(true),
        _ => None,
    };
    let category = parse_filter(params.category.as_deref(), Category::parse, "category")?;
    let priority = parse_filter(params.priority.as_deref(), Priority::parse, "priority")?;

    let query = MessageQuery {
        search: params.search,
        is_read,
        category,
        priority,
        page: params.page.unwrap_or(1).max(1),
        limit: params.limit.unwrap_or(DEFAULT_PAGE_SIZE).max(1),
    };

    let (items, total) = state.db.list_messages(user.id, &query).await?;
    let limit = query.limit as i64;
    let total_pages = (total + limit - 1) / limit;

    Ok(Json(json!({
        "items": items,
        "totalCount": total,
        "page": query.page,
        "totalPages": total_pages,
    })))
}

pub async fn detail(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<MessageRecord>> {
    let message = state
        .db
        .get_message(id)
        .await?
        .ok_or(AppError::MessageNotFound)?;
    Ok(Json(message))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<MessageRecord>> {
    set_read_state(&state, id, true).await
}

pub async fn mark_unread(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<MessageRecord>> {
    set_read_state(&state, id, false).await
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<Value>> {
    if state.db.delete_message(id).await? {
        Ok(Json(json!({ "deleted": true })))
    } else {
        Err(AppError::MessageNotFound)
    }
}

pub async fn unread_count(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let user = current_user(&state).await?;
    let count = state.db.unread_count(user.id).await?;
    Ok(Json(json!({ "unreadCount": count })))
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub to: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
}

pub async fn send(
    State(state): State<AppState>,
    Json(req): Json<SendRequest>,
) -> AppResult<Json<Value>> {
    let to = require_field(req.to, "to")?;
    let subject = require_field(req.subject, "subject")?;
    let body = require_field(req.body, "body")?;

    let user = current_user(&state).await?;
    let token = state.engine.access_token(&user).await?;

    let raw = encode_raw(&build_raw_message(&to, &subject, &body));
    let id = state.provider.send_message(&token, &raw, None).await?;
    info!(user = %user.email, to = %to, "Email sent");

    Ok(Json(json!({ "sent": true, "id": id })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyRequest {
    pub reply_text: Option<String>,
}

pub async fn reply(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<ReplyRequest>,
) -> AppResult<Json<Value>> {
    let reply_text = require_field(req.reply_text, "replyText")?;

    let message = state
        .db
        .get_message(id)
        .await?
        .ok_or(AppError::MessageNotFound)?;
    let user = current_user(&state).await?;
    let token = state.engine.access_token(&user).await?;

    let to = bracketed_address(&message.from_addr);
    let subject = reply_subject(&message.subject);
    let raw = encode_raw(&build_raw_reply(
        &to,
        &subject,
        &message.gmail_id,
        &reply_text,
    ));
    let sent_id = state
        .provider
        .send_message(&token, &raw, Some(&message.thread_id))
        .await?;
    info!(user = %user.email, thread = %message.thread_id, "Reply sent");

    Ok(Json(json!({ "sent": true, "id": sent_id })))
}

/// The API serves the first onboarded mailbox.
async fn current_user(state: &AppState) -> AppResult<UserRecord> {
    state.db.first_user().await?.ok_or(AppError::UserNotFound)
}

async fn set_read_state(state: &AppState, id: i64, is_read: bool) -> AppResult<Json<MessageRecord>> {
    state
        .db
        .set_read_state(id, is_read)
        .await?
        .map(Json)
        .ok_or(AppError::MessageNotFound)
}

/// `all` and absence mean no filter; anything else must be a known value.
fn parse_filter<T>(
    raw: Option<&str>,
    parse: fn(&str) -> Option<T>,
    name: &str,
) -> AppResult<Option<T>> {
    match raw {
        None | Some("all") | Some("") => Ok(None),
        Some(value) => parse(value)
            .map(Some)
            .ok_or_else(|| AppError::Validation(format!("unknown {name}: {value}"))),
    }
}
