//! Credential lifecycle manager.
//!
//! Owns the in-memory [`TokenSet`] and [`DeviceAuthorization`], mirrors them to
//! the encrypted files, and answers "give me a valid access token".
//!
//! All reads and writes of the session go through one async mutex, so a
//! refresh and a background poll completing at the same time never
//! interleave their writes.

use crate::auth::client::AuthClient;
use crate::auth::credentials::{DeviceAuthorization, TokenSet};
use crate::config::AuthConfig;
use crate::crypto::{KeyDeriver, SecretStore};
use crate::error::{AuthError, AuthInstructions};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// Lifecycle state as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Uninitialized,
    NoCredentials,
    AwaitingAuthorization,
    Authenticated,
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthState::Uninitialized => write!(f, "uninitialized"),
            AuthState::NoCredentials => write!(f, "not signed in"),
            AuthState::AwaitingAuthorization => write!(f, "awaiting authorization"),
            AuthState::Authenticated => write!(f, "signed in"),
        }
    }
}

/// Progress of the most recent device flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FlowStatus {
    Idle,
    Awaiting { user_code: String },
    Authorized,
    Declined,
    Expired,
    TimedOut,
    Cancelled,
    Failed { reason: String },
}

impl FlowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FlowStatus::Idle | FlowStatus::Awaiting { .. })
    }
}

/// Snapshot for status displays; never includes token material
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStatus {
    pub state: AuthState,
    pub token_type: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub has_refresh_token: bool,
    pub pending: Option<AuthInstructions>,
}

#[derive(Debug, Default)]
pub(super) struct Session {
    pub(super) initialized: bool,
    pub(super) tokens: Option<TokenSet>,
    pub(super) device: Option<DeviceAuthorization>,
}

impl Session {
    fn state(&self) -> AuthState {
        if !self.initialized {
            AuthState::Uninitialized
        } else if self.tokens.is_some() {
            AuthState::Authenticated
        } else if self.device.is_some() {
            AuthState::AwaitingAuthorization
        } else {
            AuthState::NoCredentials
        }
    }
}

pub(super) struct Inner {
    pub(super) config: AuthConfig,
    pub(super) client: AuthClient,
    keys: Arc<KeyDeriver>,
    pub(super) store: SecretStore,
    pub(super) session: Mutex<Session>,
    pub(super) flow: watch::Sender<FlowStatus>,
}

/// Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct CredentialManager {
    pub(super) inner: Arc<Inner>,
}

enum NextStep {
    Authorize,
    Refresh,
}

impl CredentialManager {
    /// Manager whose storage key is bound to this host's machine identity.
    pub fn new(config: AuthConfig) -> Result<Self, AuthError> {
        Self::with_key_deriver(config, Arc::new(KeyDeriver::for_host()))
    }

    pub fn with_key_deriver(config: AuthConfig, keys: Arc<KeyDeriver>) -> Result<Self, AuthError> {
        let client = AuthClient::new(&config)?;
        let (flow, _) = watch::channel(FlowStatus::Idle);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                client,
                store: SecretStore::new(keys.clone()),
                keys,
                session: Mutex::new(Session::default()),
                flow,
            }),
        })
    }

    pub fn config(&self) -> &AuthConfig {
        &self.inner.config
    }

    /// Paths of the encrypted token and device-code files
    pub fn storage_paths(&self) -> (PathBuf, PathBuf) {
        (
            self.inner.config.tokens_path(),
            self.inner.config.device_code_path(),
        )
    }

    /// Create the storage directory and load persisted state.
    ///
    /// Missing files are normal. A file that exists but cannot be decrypted is
    /// `StorageCorrupted` and must be cleared by an operator. Calling this again
    /// after a successful load is a no-op.
    pub async fn initialize(&self) -> Result<AuthState, AuthError> {
        let mut session = self.inner.session.lock().await;
        self.initialize_locked(&mut session).await?;
        Ok(session.state())
    }

    pub(super) async fn initialize_locked(&self, session: &mut Session) -> Result<(), AuthError> {
        if session.initialized {
            return Ok(());
        }

        let config = &self.inner.config;
        crate::crypto::ensure_private_dir(&config.storage_dir)?;
        self.prepare_key().await?;

        let tokens: Option<TokenSet> = self.inner.store.load(&config.tokens_path())?;
        let mut device: Option<DeviceAuthorization> =
            self.inner.store.load(&config.device_code_path())?;

        if let Some(pending) = device.as_ref() {
            let reason = if tokens.is_some() {
                Some("superseded by stored tokens")
            } else if pending.is_expired(Utc::now()) {
                Some("expired")
            } else {
                None
            };
            if let Some(reason) = reason {
                tracing::info!("Discarding persisted device authorization ({})", reason);
                self.inner.store.remove(&config.device_code_path())?;
                device = None;
            }
        }

        session.tokens = tokens;
        session.device = device;
        session.initialized = true;

        if let Some(pending) = session.device.clone() {
            tracing::info!(
                "Resuming device authorization for code {} (expires {})",
                pending.user_code,
                pending.expires_at().to_rfc3339()
            );
            self.inner.flow.send_replace(FlowStatus::Awaiting {
                user_code: pending.user_code.clone(),
            });
            self.spawn_poll(pending);
        }

        tracing::info!("Credential manager initialized: {}", session.state());
        Ok(())
    }

    /// Run the PBKDF2 derivation on the blocking pool so later loads and
    /// saves hit the cached key.
    async fn prepare_key(&self) -> Result<(), AuthError> {
        let keys = self.inner.keys.clone();
        tokio::task::spawn_blocking(move || keys.derive_key().map(drop))
            .await
            .map_err(|e| AuthError::IdentityUnavailable(format!("key derivation aborted: {}", e)))?
    }

    /// The single entry point for API callers.
    ///
    /// - No tokens held: starts (or reuses) a device flow and fails with
    ///   `AuthenticationRequired` instead of waiting for the user.
    /// - Token within the expiry buffer: refreshes before returning.
    /// - Otherwise: returns the cached token without a network call.
    pub async fn get_valid_access_token(&self) -> Result<String, AuthError> {
        let mut session = self.inner.session.lock().await;
        self.initialize_locked(&mut session).await?;

        let next = match session.tokens.as_ref() {
            None => NextStep::Authorize,
            Some(tokens) if tokens.needs_refresh(Utc::now(), self.inner.config.expiry_buffer) => {
                NextStep::Refresh
            }
            Some(tokens) => return Ok(tokens.access_token.clone()),
        };

        match next {
            NextStep::Authorize => {
                let instructions = self.start_device_flow_locked(&mut session).await?;
                Err(AuthError::AuthenticationRequired(instructions))
            }
            NextStep::Refresh => {
                tracing::debug!("Access token expiring, refreshing before use");
                let tokens = self.refresh_locked(&mut session).await?;
                Ok(tokens.access_token)
            }
        }
    }

    /// Exchange the held refresh token for a new token set.
    ///
    /// On any failure the token set is cleared from memory and disk and
    /// `ReauthenticationRequired` is returned; there is no automatic retry.
    /// If the stored file cannot be deleted, that I/O error is returned
    /// instead.
    pub async fn refresh_access_token(&self) -> Result<TokenSet, AuthError> {
        let mut session = self.inner.session.lock().await;
        self.initialize_locked(&mut session).await?;
        self.refresh_locked(&mut session).await
    }

    async fn refresh_locked(&self, session: &mut Session) -> Result<TokenSet, AuthError> {
        let Some(current) = session.tokens.as_ref() else {
            return Err(AuthError::ReauthenticationRequired(
                "no credentials are held".to_string(),
            ));
        };

        let Some(refresh_token) = current.refresh_token.clone() else {
            self.clear_tokens_locked(session)?;
            return Err(AuthError::ReauthenticationRequired(
                "no refresh token was issued".to_string(),
            ));
        };

        let response = self.inner.client.refresh_token(&refresh_token).await;
        let refreshed = response
            .and_then(|response| TokenSet::from_response(response, Utc::now(), Some(refresh_token)));
        let tokens = match refreshed {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!("Token refresh failed, clearing credentials: {}", e);
                self.clear_tokens_locked(session)?;
                return Err(AuthError::ReauthenticationRequired(e.to_string()));
            }
        };

        self.inner
            .store
            .save(&self.inner.config.tokens_path(), &tokens)?;
        session.tokens = Some(tokens.clone());

        tracing::info!(
            "Access token refreshed, valid until {}",
            tokens.expires_at.to_rfc3339()
        );
        Ok(tokens)
    }

    fn clear_tokens_locked(&self, session: &mut Session) -> Result<(), AuthError> {
        session.tokens = None;
        self.inner
            .store
            .remove(&self.inner.config.tokens_path())
            .map(drop)
            .inspect_err(|e| tracing::error!("Failed to delete stored tokens: {}", e))
    }

    pub async fn state(&self) -> AuthState {
        self.inner.session.lock().await.state()
    }

    pub async fn status(&self) -> AuthStatus {
        let session = self.inner.session.lock().await;
        AuthStatus {
            state: session.state(),
            token_type: session.tokens.as_ref().map(|t| t.token_type.clone()),
            expires_at: session.tokens.as_ref().map(|t| t.expires_at),
            has_refresh_token: session
                .tokens
                .as_ref()
                .is_some_and(|t| t.refresh_token.is_some()),
            pending: session.device.as_ref().map(|d| d.instructions()),
        }
    }

    /// Forget all credentials locally and delete both encrypted files.
    ///
    /// A background poll for the discarded flow stops at its next attempt.
    /// Both deletions are attempted even if the first one fails.
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        let mut session = self.inner.session.lock().await;
        let config = &self.inner.config;

        session.tokens = None;
        session.device = None;
        let tokens_removed = self.inner.store.remove(&config.tokens_path());
        let device_removed = self.inner.store.remove(&config.device_code_path());
        tokens_removed?;
        device_removed?;

        tracing::info!("Signed out, local credentials removed");
        Ok(())
    }
}
