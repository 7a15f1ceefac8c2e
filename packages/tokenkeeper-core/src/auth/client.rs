//! HTTP client for the OAuth 2.0 authorization server.
//!
//! All requests are form-encoded `POST`s. Token endpoint errors come back as
//! `{"error": "...", "error_description": "..."}` and are mapped to
//! [`TokenPoll`] states or [`AuthError::OAuth`].

use crate::config::AuthConfig;
use crate::error::AuthError;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const REFRESH_TOKEN_GRANT: &str = "refresh_token";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCodeResponse {
    pub device_code: String,
    pub user_code: String,
    #[serde(alias = "verification_url")]
    pub verification_uri: String,
    pub expires_in: u64,
    pub interval: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .finish_non_exhaustive()
    }
}

fn default_expires_in() -> u64 {
    3600
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// Result of one device-code token exchange
#[derive(Debug)]
pub enum TokenPoll {
    Granted(TokenResponse),
    /// User has not finished signing in yet
    Pending,
    /// Server asked us to poll less often
    SlowDown,
    Declined,
    Expired,
}

#[derive(Debug, Clone)]
pub struct AuthClient {
    http: reqwest::Client,
    client_id: String,
    scope: String,
    device_code_url: String,
    token_url: String,
}

impl AuthClient {
    pub fn new(config: &AuthConfig) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;

        Ok(Self {
            http,
            client_id: config.client_id.clone(),
            scope: config.scope.clone(),
            device_code_url: config.device_code_url.clone(),
            token_url: config.token_url.clone(),
        })
    }

    pub async fn request_device_code(&self) -> Result<DeviceCodeResponse, AuthError> {
        let resp = self
            .http
            .post(&self.device_code_url)
            .form(&[("client_id", self.client_id.as_str()), ("scope", self.scope.as_str())])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(error_from_body(status, &body));
        }

        resp.json::<DeviceCodeResponse>().await.map_err(|e| {
            AuthError::UnexpectedResponse(format!("invalid device code response: {}", e))
        })
    }

    /// Exchange a device code for tokens once.
    pub async fn poll_for_token(&self, device_code: &str) -> Result<TokenPoll, AuthError> {
        let resp = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", DEVICE_CODE_GRANT),
                ("client_id", self.client_id.as_str()),
                ("device_code", device_code),
            ])
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            let token = resp.json::<TokenResponse>().await.map_err(|e| {
                AuthError::UnexpectedResponse(format!("invalid token response: {}", e))
            })?;
            return Ok(TokenPoll::Granted(token));
        }

        let body = resp.text().await.unwrap_or_default();
        match error_from_body(status, &body) {
            AuthError::OAuth { code, description } => match code.as_str() {
                "authorization_pending" => Ok(TokenPoll::Pending),
                "slow_down" => Ok(TokenPoll::SlowDown),
                "authorization_declined" | "access_denied" => Ok(TokenPoll::Declined),
                "expired_token" | "code_expired" => Ok(TokenPoll::Expired),
                _ => Err(AuthError::OAuth { code, description }),
            },
            other => Err(other),
        }
    }

    pub async fn refresh_token(&self, refresh_token: &str) -> Result<TokenResponse, AuthError> {
        let resp = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", REFRESH_TOKEN_GRANT),
                ("client_id", self.client_id.as_str()),
                ("refresh_token", refresh_token),
                ("scope", self.scope.as_str()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(error_from_body(status, &body));
        }

        resp.json::<TokenResponse>()
            .await
            .map_err(|e| AuthError::UnexpectedResponse(format!("invalid token response: {}", e)))
    }
}

/// Map a non-success response to an OAuth error code when the body has one
fn error_from_body(status: StatusCode, body: &str) -> AuthError {
    match serde_json::from_str::<TokenErrorResponse>(body) {
        Ok(err) => AuthError::OAuth {
            code: err.error,
            description: err.error_description,
        },
        Err(_) => AuthError::UnexpectedResponse(format!("server returned {}", status)),
    }
}
