use chrono::{DateTime, Duration, Utc};
use oauth2::basic::BasicClient;
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl, RefreshToken,
    Scope, TokenResponse, TokenUrl,
};
use serde::Deserialize;
use tracing::warn;

use crate::config::Config;
use crate::errors::{AppError, AppResult};

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/userinfo.profile",
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/gmail.readonly",
    "https://www.googleapis.com/auth/gmail.send",
    "https://www.googleapis.com/auth/gmail.modify",
];

#[derive(Clone, Debug)]
pub struct TokenBundle {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh_token: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub email: String,
}

/// Google OAuth client for the server-side authorization-code flow: the
/// consent redirect lands on our own callback route, which exchanges the
/// code here.
pub struct OauthService {
    client: BasicClient,
    http: reqwest::Client,
}

impl OauthService {
    pub fn from_config(config: &Config) -> AppResult<Self> {
        let client_id = config
            .google_client_id
            .clone()
            .ok_or_else(|| AppError::Config("GOOGLE_CLIENT_ID missing".into()))?;
        let client_secret = config
            .google_client_secret
            .clone()
            .ok_or_else(|| AppError::Config("GOOGLE_CLIENT_SECRET missing".into()))?;
        let redirect_uri = config
            .google_redirect_uri
            .clone()
            .ok_or_else(|| AppError::Config("GOOGLE_REDIRECT_URI missing".into()))?;
        Self::new(&client_id, &client_secret, &redirect_uri)
    }

    pub fn new(client_id: &str, client_secret: &str, redirect_uri: &str) -> AppResult<Self> {
        let client = BasicClient::new(
            ClientId::new(client_id.to_string()),
            Some(ClientSecret::new(client_secret.to_string())),
            AuthUrl::new(AUTH_URL.to_string())
                .map_err(|e| AppError::Config(format!("invalid auth url: {e}")))?,
            Some(
                TokenUrl::new(TOKEN_URL.to_string())
                    .map_err(|e| AppError::Config(format!("invalid token url: {e}")))?,
            ),
        )
        .set_redirect_uri(
            RedirectUrl::new(redirect_uri.to_string())
                .map_err(|e| AppError::Config(format!("invalid redirect uri {redirect_uri}: {e}")))?,
        )
        .set_auth_type(oauth2::AuthType::RequestBody);

        Ok(Self {
            client,
            http: reqwest::Client::new(),
        })
    }

    /// Consent URL requesting offline access so Google issues a refresh token.
    pub fn authorize_url(&self) -> String {
        let mut req = self
            .client
            .authorize_url(CsrfToken::new_random)
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent");
        for scope in SCOPES {
            req = req.add_scope(Scope::new(scope.to_string()));
        }
        let (url, _csrf) = req.url();
        url.to_string()
    }

    pub async fn exchange_code(&self, code: &str) -> AppResult<TokenBundle> {
        let token_res = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(|e| AppError::AuthFailure(format!("token exchange failed: {e}")))?;

        Ok(TokenBundle {
            access_token: token_res.access_token().secret().to_string(),
            expires_at: token_res
                .expires_in()
                .map(|d| Utc::now() + Duration::from_std(d).unwrap_or_else(|_| Duration::seconds(0))),
            refresh_token: token_res.refresh_token().map(|r| r.secret().to_string()),
        })
    }

    pub async fn refresh(&self, refresh_token: &str) -> AppResult<TokenBundle> {
        let res = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(async_http_client)
            .await;

        match res {
            Ok(token_res) => Ok(TokenBundle {
                access_token: token_res.access_token().secret().to_string(),
                expires_at: token_res.expires_in().map(|d| {
                    Utc::now() + Duration::from_std(d).unwrap_or_else(|_| Duration::seconds(0))
                }),
                refresh_token: None,
            }),
            Err(err) => {
                warn!("Refresh token invalid or expired: {err}");
                Err(AppError::AuthFailure(format!("token refresh failed: {err}")))
            }
        }
    }

    pub async fn fetch_userinfo(&self, access_token: &str) -> AppResult<UserInfo> {
        let res = self
            .http
            .get(USERINFO_URL)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| AppError::ProviderTransient(format!("userinfo request failed: {e}")))?;

        if !res.status().is_success() {
            return Err(AppError::AuthFailure(format!(
                "userinfo failed with status {}",
                res.status()
            )));
        }

        res.json()
            .await
            .map_err(|e| AppError::Unexpected(format!("parse userinfo: {e}")))
    }
}
