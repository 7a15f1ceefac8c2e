//! Error taxonomy for the credential lifecycle.
//!
//! Only [`AuthError::AuthenticationRequired`] is an expected control-flow
//! signal. Every other variant means the credential state is broken, expired
//! or unreachable and needs a distinct action from the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Instructions a human needs to finish a device-authorization sign-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthInstructions {
    pub verification_uri: String,
    pub user_code: String,
    pub expires_in_seconds: u64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    /// The machine identity could not be read, so no key can be derived
    #[error("Machine identity unavailable: {0}")]
    IdentityUnavailable(String),

    /// An encrypted file exists but cannot be read, parsed or decrypted
    #[error("Credential storage corrupted at {path}: {reason}")]
    StorageCorrupted { path: PathBuf, reason: String },

    /// Authentication tag did not verify, or the blob is malformed
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// A device flow is in progress; the user must complete it out of band
    #[error("Authentication required: visit {} and enter code {}", .0.verification_uri, .0.user_code)]
    AuthenticationRequired(AuthInstructions),

    #[error("Authorization was declined by the user")]
    AuthorizationDeclined,

    #[error("Device code expired before authorization completed")]
    AuthorizationExpired,

    #[error("Timed out waiting for authorization after {attempts} attempts")]
    AuthorizationTimedOut { attempts: u32 },

    /// No device flow is running, or it was discarded by a sign-out
    #[error("Device authorization was cancelled")]
    DeviceFlowCancelled,

    #[error("Device authorization failed: {0}")]
    DeviceFlowFailed(String),

    /// The refresh token was rejected or the refresh exchange failed
    #[error("Reauthentication required: {0}")]
    ReauthenticationRequired(String),

    /// The authorization server returned an OAuth error code
    #[error("Authorization server error {code}: {}", .description.as_deref().unwrap_or("no description"))]
    OAuth {
        code: String,
        description: Option<String>,
    },

    #[error("Unexpected response from authorization server: {0}")]
    UnexpectedResponse(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AuthError {
    pub(crate) fn corrupted(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        AuthError::StorageCorrupted {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors the poll loop absorbs into its own retry budget.
    pub fn is_transient(&self) -> bool {
        match self {
            AuthError::Network(_) => true,
            AuthError::UnexpectedResponse(_) => true,
            AuthError::OAuth { code, .. } => code == "temporarily_unavailable",
            _ => false,
        }
    }

    /// The sign-in instructions carried by an `AuthenticationRequired` signal.
    pub fn instructions(&self) -> Option<&AuthInstructions> {
        match self {
            AuthError::AuthenticationRequired(instructions) => Some(instructions),
            _ => None,
        }
    }

    /// Get user-friendly description and instructions
    pub fn user_message(&self) -> String {
        match self {
            AuthError::AuthenticationRequired(i) => format!(
                "To sign in, visit {} and enter the code {}\n\nThe code expires in {} minutes.",
                i.verification_uri,
                i.user_code,
                i.expires_in_seconds.div_ceil(60)
            ),
            AuthError::IdentityUnavailable(msg) => format!(
                "Could not read this machine's identity: {}\n\nCredentials cannot be stored or read on this host.",
                msg
            ),
            AuthError::StorageCorrupted { path, reason } => format!(
                "Stored credentials at {} could not be read ({}).\n\nRun 'tokenkeeper logout' to clear them, then sign in again.",
                path.display(),
                reason
            ),
            AuthError::AuthorizationDeclined => {
                "Sign-in was declined. Run 'tokenkeeper login' to try again.".to_string()
            }
            AuthError::AuthorizationExpired | AuthError::AuthorizationTimedOut { .. } => {
                "The sign-in code expired before it was used. Run 'tokenkeeper login' to get a new one."
                    .to_string()
            }
            AuthError::ReauthenticationRequired(reason) => format!(
                "Your session could not be renewed ({}).\n\nRun 'tokenkeeper login' to sign in again.",
                reason
            ),
            other => other.to_string(),
        }
    }
}
