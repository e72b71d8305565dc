use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::ai::Tone;
use crate::errors::AppResult;
use crate::server::{require_field, AppState};

#[derive(Debug, Deserialize)]
pub struct GenerateEmailRequest {
    pub prompt: Option<String>,
    pub tone: Option<String>,
    pub context: Option<String>,
}

/// Drafts an email body from a free-form prompt in the requested tone.
pub async fn generate_email(
    State(state): State<AppState>,
    Json(req): Json<GenerateEmailRequest>,
) -> AppResult<Json<Value>> {
    let prompt = require_field(req.prompt, "prompt")?;
    let tone = Tone::parse(req.tone.as_deref());

    let email_text = state
        .analyzer
        .compose(&prompt, tone, req.context.as_deref())
        .await?;

    Ok(Json(json!({
        "emailText": email_text,
        "tone": tone.as_str(),
    })))
}
