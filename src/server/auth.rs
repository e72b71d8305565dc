use axum::extract::{Query, State};
use axum::response::Redirect;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};
use crate::server::AppState;

/// Kicks off the consent flow.
pub async fn start(State(state): State<AppState>) -> Redirect {
    Redirect::temporary(&state.oauth.authorize_url())
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
}

/// OAuth callback: exchanges the code, persists the user, and registers the
/// mailbox watch. Watch failure is non-critical; onboarding still succeeds.
pub async fn callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> AppResult<Json<Value>> {
    let code = params
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AppError::Validation("code is required".into()))?;

    let tokens = state.oauth.exchange_code(&code).await?;
    let profile = state.oauth.fetch_userinfo(&tokens.access_token).await?;

    let user = state
        .db
        .find_or_create_user(
            &profile.id,
            &profile.email,
            &tokens.access_token,
            tokens.refresh_token.as_deref(),
            tokens.expires_at.map(|dt| dt.timestamp()),
        )
        .await?;
    info!(user = %user.email, "User onboarded");

    let watch = match state.config.watch_topic() {
        Ok(topic) => match state.engine.register_watch(&user, &topic).await {
            Ok(info) => Some(info),
            Err(err) => {
                warn!(user = %user.email, error = %err, "Failed to start mailbox watch");
                None
            }
        },
        Err(err) => {
            warn!(error = %err, "Watch topic not configured; skipping watch registration");
            None
        }
    };

    Ok(Json(json!({
        "connected": true,
        "email": user.email,
        "userId": user.id,
        "watchExpiration": watch.as_ref().and_then(|w| w.expiration),
    })))
}
