//! In-memory and persisted credential records.

use crate::auth::client::{DeviceCodeResponse, TokenResponse};
use crate::error::{AuthError, AuthInstructions};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Access and refresh tokens from the last successful issuance.
///
/// Always replaced wholesale; never patched field by field.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub token_type: String,
}

impl TokenSet {
    /// Build a token set from a token endpoint response received at `issued_at`.
    ///
    /// `previous_refresh_token` is kept when the server does not rotate it.
    /// An `expires_in` that cannot be represented as a timestamp is rejected.
    pub fn from_response(
        resp: TokenResponse,
        issued_at: DateTime<Utc>,
        previous_refresh_token: Option<String>,
    ) -> Result<Self, AuthError> {
        let expires_at = expiry_after(issued_at, resp.expires_in).ok_or_else(|| {
            AuthError::UnexpectedResponse(format!(
                "token lifetime out of range: expires_in={}",
                resp.expires_in
            ))
        })?;

        Ok(Self {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token.or(previous_refresh_token),
            expires_at,
            token_type: resp.token_type,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True once `now` is within `buffer` of expiry.
    pub fn needs_refresh(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        let buffer = chrono::Duration::from_std(buffer).unwrap_or(chrono::Duration::zero());
        now >= self.expires_at - buffer
    }
}

/// `issued_at + seconds`, or `None` if any step overflows
fn expiry_after(issued_at: DateTime<Utc>, seconds: u64) -> Option<DateTime<Utc>> {
    let millis = i64::try_from(seconds).ok()?.checked_mul(1000)?;
    issued_at.checked_add_signed(TimeDelta::try_milliseconds(millis)?)
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// An in-progress device-authorization grant
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in_seconds: u64,
    pub poll_interval_seconds: u64,
    pub issued_at: DateTime<Utc>,
}

impl DeviceAuthorization {
    pub fn from_response(
        resp: DeviceCodeResponse,
        issued_at: DateTime<Utc>,
        default_interval: Duration,
    ) -> Result<Self, AuthError> {
        if expiry_after(issued_at, resp.expires_in).is_none() {
            return Err(AuthError::UnexpectedResponse(format!(
                "device code lifetime out of range: expires_in={}",
                resp.expires_in
            )));
        }

        Ok(Self {
            device_code: resp.device_code,
            user_code: resp.user_code,
            verification_uri: resp.verification_uri,
            expires_in_seconds: resp.expires_in,
            poll_interval_seconds: resp
                .interval
                .filter(|i| *i > 0)
                .unwrap_or(default_interval.as_secs()),
            issued_at,
        })
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        expiry_after(self.issued_at, self.expires_in_seconds).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    /// What the user needs to finish signing in, with the remaining lifetime.
    pub fn instructions(&self) -> AuthInstructions {
        let remaining = (self.expires_at() - Utc::now()).num_seconds().max(0) as u64;
        AuthInstructions {
            verification_uri: self.verification_uri.clone(),
            user_code: self.user_code.clone(),
            expires_in_seconds: remaining.min(self.expires_in_seconds),
            expires_at: self.expires_at(),
        }
    }
}

impl std::fmt::Debug for DeviceAuthorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceAuthorization")
            .field("device_code", &"<redacted>")
            .field("user_code", &self.user_code)
            .field("verification_uri", &self.verification_uri)
            .field("expires_in_seconds", &self.expires_in_seconds)
            .field("poll_interval_seconds", &self.poll_interval_seconds)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}
