use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::gmail::value_to_string;
use crate::ingest::{IngestJob, Notification};
use crate::server::AppState;

/// Pub/Sub push envelope. The payload of interest is base64 JSON inside
/// `message.data`.
#[derive(Debug, Deserialize)]
pub struct PushEnvelope {
    pub message: Option<PushMessage>,
    #[serde(default)]
    pub subscription: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub data: Option<String>,
    #[serde(alias = "message_id")]
    pub message_id: Option<String>,
    #[serde(default, alias = "publish_time")]
    pub publish_time: Option<String>,
}

/// Inbound notification endpoint. A malformed envelope is the caller's fault
/// and earns a 400; once the envelope decodes, the transport is acknowledged
/// with 200 no matter what happens downstream, so the notifier never
/// redelivers because of our own failures.
pub async fn gmail_notification(
    State(state): State<AppState>,
    Json(envelope): Json<PushEnvelope>,
) -> Response {
    let notification = match decode_envelope(&envelope) {
        Ok(notification) => notification,
        Err(err) => {
            warn!(error = %err, "Malformed push envelope");
            return err.into_response();
        }
    };

    // At-most-once gate on the upstream notification id, stronger than the
    // cursor-equality check the engine applies later.
    if let Some(notification_id) = envelope.message.as_ref().and_then(|m| m.message_id.as_deref())
    {
        match state.db.try_mark_notification(notification_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(id = %notification_id, "Duplicate push notification; ignoring");
                return ok_response("duplicate");
            }
            Err(err) => {
                warn!(error = %err, "Notification dedup check failed; processing anyway");
            }
        }
    }

    if let Err(err) = state.jobs.try_send(IngestJob::new(notification)) {
        warn!(error = %err, "Ingest queue unavailable; dropping notification");
    }
    ok_response("accepted")
}

pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

fn ok_response(status: &str) -> Response {
    (StatusCode::OK, Json(json!({ "status": status }))).into_response()
}

fn decode_envelope(envelope: &PushEnvelope) -> AppResult<Notification> {
    let data = envelope
        .message
        .as_ref()
        .and_then(|m| m.data.as_deref())
        .ok_or_else(|| AppError::Validation("push envelope missing message.data".into()))?;

    let bytes = STANDARD
        .decode(data)
        .map_err(|e| AppError::Validation(format!("push data is not valid base64: {e}")))?;
    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|e| AppError::Validation(format!("push data is not valid JSON: {e}")))?;

    let email_address = value
        .get("emailAddress")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AppError::Validation("push data missing emailAddress".into()))?;
    // historyId arrives as a JSON number from Pub/Sub but as a string on
    // other provider surfaces
    let history_id = value
        .get("historyId")
        .and_then(value_to_string)
        .ok_or_else(|| AppError::Validation("push data missing historyId".into()))?;

    Ok(Notification {
        email_address,
        history_id,
    })
}
