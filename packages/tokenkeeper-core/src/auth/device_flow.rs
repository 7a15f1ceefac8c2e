//! OAuth 2.0 Device Authorization Grant flow implementation.
//!
//! Starting a flow requests a device code, persists it, and hands the user
//! instructions immediately. Polling for the token runs as a detached task;
//! its outcome is logged and published on the manager's flow channel for
//! whoever chooses to wait on it.

use crate::auth::client::{TokenPoll, TokenResponse};
use crate::auth::credentials::{DeviceAuthorization, TokenSet};
use crate::auth::manager::{CredentialManager, FlowStatus, Session};
use crate::error::{AuthError, AuthInstructions};
use chrono::Utc;
use std::time::Duration;
use tokio::time::sleep;

/// Added to the poll interval on each `slow_down` response
const SLOW_DOWN_INCREMENT: Duration = Duration::from_secs(5);

impl CredentialManager {
    /// Request a device code and start polling for it in the background.
    ///
    /// Returns the sign-in instructions without waiting for the user. If an
    /// unexpired flow is already in progress its instructions are returned
    /// and no second flow is started.
    pub async fn start_device_flow(&self) -> Result<AuthInstructions, AuthError> {
        let mut session = self.inner.session.lock().await;
        self.initialize_locked(&mut session).await?;
        self.start_device_flow_locked(&mut session).await
    }

    pub(super) async fn start_device_flow_locked(
        &self,
        session: &mut Session,
    ) -> Result<AuthInstructions, AuthError> {
        if let Some(pending) = session.device.as_ref().filter(|d| !d.is_expired(Utc::now())) {
            tracing::debug!("Device authorization already in progress, reusing it");
            return Ok(pending.instructions());
        }

        let response = self.inner.client.request_device_code().await?;
        let device = DeviceAuthorization::from_response(
            response,
            Utc::now(),
            self.inner.config.default_poll_interval,
        )?;

        self.inner
            .store
            .save(&self.inner.config.device_code_path(), &device)?;
        session.device = Some(device.clone());

        tracing::info!(
            "Device authorization started: visit {} and enter code {}",
            device.verification_uri,
            device.user_code
        );

        self.inner.flow.send_replace(FlowStatus::Awaiting {
            user_code: device.user_code.clone(),
        });
        let instructions = device.instructions();
        self.spawn_poll(device);
        Ok(instructions)
    }

    /// Fire-and-forget background poll for `device`.
    ///
    /// The poll runs in its own task so that a panic inside it still ends
    /// the flow with a published outcome instead of leaving it `Awaiting`.
    pub(super) fn spawn_poll(&self, device: DeviceAuthorization) {
        let manager = self.clone();
        tokio::spawn(async move {
            let poll = tokio::spawn({
                let manager = manager.clone();
                let device = device.clone();
                async move { manager.poll_outcome(&device).await }
            });

            let status = match poll.await {
                Ok(status) => status,
                Err(e) => {
                    tracing::error!("Device authorization poll aborted: {}", e);
                    manager.abandon_device_flow(&device).await;
                    FlowStatus::Failed {
                        reason: format!("poll task aborted: {}", e),
                    }
                }
            };
            manager.publish_outcome(&device, status);
        });
    }

    async fn poll_outcome(&self, device: &DeviceAuthorization) -> FlowStatus {
        match self.poll_for_token(device).await {
            Ok(tokens) => {
                tracing::info!(
                    "Device authorization complete, token valid until {}",
                    tokens.expires_at.to_rfc3339()
                );
                FlowStatus::Authorized
            }
            Err(e) => {
                self.abandon_device_flow(device).await;
                match e {
                    AuthError::AuthorizationDeclined => {
                        tracing::warn!("Device authorization declined by user");
                        FlowStatus::Declined
                    }
                    AuthError::AuthorizationExpired => {
                        tracing::warn!("Device code expired before authorization");
                        FlowStatus::Expired
                    }
                    AuthError::AuthorizationTimedOut { attempts } => {
                        tracing::warn!("Gave up on device authorization after {} polls", attempts);
                        FlowStatus::TimedOut
                    }
                    AuthError::DeviceFlowCancelled => {
                        tracing::info!("Device authorization for code {} discarded", device.user_code);
                        FlowStatus::Cancelled
                    }
                    other => {
                        tracing::error!("Device authorization failed: {}", other);
                        FlowStatus::Failed {
                            reason: other.to_string(),
                        }
                    }
                }
            }
        }
    }

    /// Only report on our own flow; a newer one may already be running
    fn publish_outcome(&self, device: &DeviceAuthorization, status: FlowStatus) {
        self.inner.flow.send_if_modified(|current| match current {
            FlowStatus::Awaiting { user_code } if *user_code == device.user_code => {
                *current = status;
                true
            }
            _ => false,
        });
    }

    /// Poll the token endpoint until the user finishes, declines, or the
    /// attempt budget runs out.
    ///
    /// Transport errors and server hiccups use up an attempt but do not end
    /// the loop. On success the new token set is stored and the device
    /// authorization is removed.
    pub async fn poll_for_token(&self, device: &DeviceAuthorization) -> Result<TokenSet, AuthError> {
        let max_attempts = self.inner.config.max_poll_attempts;
        let mut interval = device.poll_interval();

        for attempt in 1..=max_attempts {
            if !self.is_current_flow(device).await {
                return Err(AuthError::DeviceFlowCancelled);
            }
            if device.is_expired(Utc::now()) {
                return Err(AuthError::AuthorizationExpired);
            }

            match self.inner.client.poll_for_token(&device.device_code).await {
                Ok(TokenPoll::Granted(response)) => {
                    return self.complete_device_flow(device, response).await;
                }
                Ok(TokenPoll::Pending) => {
                    tracing::trace!("Authorization pending ({}/{})", attempt, max_attempts);
                }
                Ok(TokenPoll::SlowDown) => {
                    interval = interval.saturating_add(SLOW_DOWN_INCREMENT);
                    tracing::debug!("Server asked to slow down, polling every {:?}", interval);
                }
                Ok(TokenPoll::Declined) => return Err(AuthError::AuthorizationDeclined),
                Ok(TokenPoll::Expired) => return Err(AuthError::AuthorizationExpired),
                Err(e) if e.is_transient() => {
                    tracing::warn!("Poll attempt {}/{} failed: {}", attempt, max_attempts, e);
                }
                Err(e) => return Err(e),
            }

            if attempt < max_attempts {
                sleep(interval).await;
            }
        }

        Err(AuthError::AuthorizationTimedOut {
            attempts: max_attempts,
        })
    }

    async fn is_current_flow(&self, device: &DeviceAuthorization) -> bool {
        let session = self.inner.session.lock().await;
        session
            .device
            .as_ref()
            .is_some_and(|d| d.device_code == device.device_code)
    }

    async fn complete_device_flow(
        &self,
        device: &DeviceAuthorization,
        response: TokenResponse,
    ) -> Result<TokenSet, AuthError> {
        let tokens = TokenSet::from_response(response, Utc::now(), None)?;
        let config = &self.inner.config;

        let mut session = self.inner.session.lock().await;
        let still_current = session
            .device
            .as_ref()
            .is_some_and(|d| d.device_code == device.device_code);
        if !still_current {
            return Err(AuthError::DeviceFlowCancelled);
        }

        self.inner.store.save(&config.tokens_path(), &tokens)?;
        session.tokens = Some(tokens.clone());
        session.device = None;
        // A leftover file is discarded on the next initialize, tokens supersede it
        if let Err(e) = self.inner.store.remove(&config.device_code_path()) {
            tracing::warn!("Failed to delete device authorization: {}", e);
        }

        Ok(tokens)
    }

    /// Drop `device` from memory and disk if it is still the current flow
    async fn abandon_device_flow(&self, device: &DeviceAuthorization) {
        let mut session = self.inner.session.lock().await;
        let is_current = session
            .device
            .as_ref()
            .is_some_and(|d| d.device_code == device.device_code);
        if !is_current {
            return;
        }

        session.device = None;
        if let Err(e) = self.inner.store.remove(&self.inner.config.device_code_path()) {
            tracing::warn!("Failed to delete device authorization: {}", e);
        }
    }

    /// Current device flow progress
    pub fn flow_status(&self) -> FlowStatus {
        self.inner.flow.borrow().clone()
    }

    /// Wait for the in-progress device flow to finish.
    ///
    /// Returns immediately with the last outcome if no flow is running.
    pub async fn wait_for_authorization(&self) -> Result<(), AuthError> {
        let mut rx = self.inner.flow.subscribe();
        let status = rx
            .wait_for(|s| !matches!(s, FlowStatus::Awaiting { .. }))
            .await
            .map(|s| (*s).clone())
            .map_err(|_| AuthError::DeviceFlowCancelled)?;

        match status {
            FlowStatus::Authorized => Ok(()),
            FlowStatus::Declined => Err(AuthError::AuthorizationDeclined),
            FlowStatus::Expired => Err(AuthError::AuthorizationExpired),
            FlowStatus::TimedOut => Err(AuthError::AuthorizationTimedOut {
                attempts: self.inner.config.max_poll_attempts,
            }),
            FlowStatus::Failed { reason } => Err(AuthError::DeviceFlowFailed(reason)),
            FlowStatus::Idle | FlowStatus::Cancelled | FlowStatus::Awaiting { .. } => {
                Err(AuthError::DeviceFlowCancelled)
            }
        }
    }
}

/// Try to open the verification page in the default browser.
#[cfg(feature = "browser")]
pub fn open_verification_page(instructions: &AuthInstructions) {
    if let Err(e) = webbrowser::open(&instructions.verification_uri) {
        tracing::warn!(
            "Failed to open browser automatically: {}. User can use the manual link.",
            e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::manager::tests::{seed_tokens, stored_tokens, test_keys, test_manager};
    use crate::auth::manager::AuthState;
    use crate::config::AuthConfig;
    use crate::crypto::SecretStore;
    use mockito::{Matcher, Server, ServerGuard};
    use std::path::Path;
    use tempfile::TempDir;

    const DEVICE_CODE_BODY: &str = r#"{
        "device_code": "dev-1",
        "user_code": "WDJB-MJHT",
        "verification_uri": "https://login.example.com/device",
        "expires_in": 900,
        "interval": 1
    }"#;

    async fn mock_device_code(server: &mut ServerGuard) -> mockito::Mock {
        server
            .mock("POST", "/devicecode")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(DEVICE_CODE_BODY)
            .create_async()
            .await
    }

    async fn mock_poll_error(server: &mut ServerGuard, code: &str, hits: usize) -> mockito::Mock {
        server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded("device_code".into(), "dev-1".into()))
            .with_status(400)
            .with_body(format!(r#"{{"error":"{}"}}"#, code))
            .expect_at_least(hits)
            .create_async()
            .await
    }

    fn stored_device(dir: &Path) -> Option<DeviceAuthorization> {
        SecretStore::new(test_keys())
            .load(&dir.join("device_code.json"))
            .unwrap()
    }

    #[tokio::test]
    async fn test_missing_tokens_start_flow_and_background_poll() {
        let mut server = Server::new_async().await;
        let device_code = mock_device_code(&mut server).await;
        let pending = mock_poll_error(&mut server, "authorization_pending", 1).await;

        let dir = TempDir::new().unwrap();
        let manager = test_manager(&server.url(), dir.path());

        let instructions = match manager.get_valid_access_token().await {
            Err(AuthError::AuthenticationRequired(i)) => i,
            other => panic!("expected AuthenticationRequired, got {:?}", other),
        };
        assert_eq!(instructions.user_code, "WDJB-MJHT");
        assert_eq!(instructions.verification_uri, "https://login.example.com/device");
        assert!(instructions.expires_in_seconds <= 900);

        // Persisted so a restart can resume it
        let persisted = stored_device(dir.path()).unwrap();
        assert_eq!(persisted.device_code, "dev-1");
        assert_eq!(manager.state().await, AuthState::AwaitingAuthorization);

        // A poll with that device code lands within one interval
        let mut polled = false;
        for _ in 0..20 {
            if pending.matched_async().await {
                polled = true;
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }
        assert!(polled, "background poll was not issued");

        // A second caller gets the same instructions, not a second flow
        match manager.get_valid_access_token().await {
            Err(AuthError::AuthenticationRequired(again)) => {
                assert_eq!(again.user_code, instructions.user_code)
            }
            other => panic!("expected AuthenticationRequired, got {:?}", other),
        }
        device_code.assert_async().await;
        assert!(matches!(manager.flow_status(), FlowStatus::Awaiting { .. }));
    }

    #[tokio::test]
    async fn test_pending_pending_success() {
        let mut server = Server::new_async().await;
        let _device_code = mock_device_code(&mut server).await;
        let pending = server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded("device_code".into(), "dev-1".into()))
            .with_status(400)
            .with_body(r#"{"error":"authorization_pending"}"#)
            .expect(2)
            .create_async()
            .await;
        let granted = server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded("device_code".into(), "dev-1".into()))
            .with_status(200)
            .with_body(r#"{"access_token":"at-1","refresh_token":"rt-1","expires_in":3600,"token_type":"Bearer"}"#)
            .expect(1)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let manager = test_manager(&server.url(), dir.path());

        manager.start_device_flow().await.unwrap();
        let before = Utc::now();
        manager.wait_for_authorization().await.unwrap();
        let after = Utc::now();

        pending.assert_async().await;
        granted.assert_async().await;

        let tokens = stored_tokens(dir.path()).unwrap();
        assert_eq!(tokens.access_token, "at-1");
        assert_eq!(tokens.refresh_token.as_deref(), Some("rt-1"));
        assert!(tokens.expires_at >= before + chrono::Duration::milliseconds(3_600_000));
        assert!(tokens.expires_at <= after + chrono::Duration::milliseconds(3_600_000));

        // Device authorization removed from storage
        assert!(!dir.path().join("device_code.json").exists());
        assert_eq!(manager.state().await, AuthState::Authenticated);
        assert_eq!(manager.flow_status(), FlowStatus::Authorized);
        assert_eq!(manager.get_valid_access_token().await.unwrap(), "at-1");
    }

    #[tokio::test]
    async fn test_declined_discards_device_authorization() {
        let mut server = Server::new_async().await;
        let _device_code = mock_device_code(&mut server).await;
        let _declined = mock_poll_error(&mut server, "authorization_declined", 1).await;

        let dir = TempDir::new().unwrap();
        let manager = test_manager(&server.url(), dir.path());
        manager.start_device_flow().await.unwrap();

        let err = manager.wait_for_authorization().await.unwrap_err();
        assert!(matches!(err, AuthError::AuthorizationDeclined));
        assert_eq!(manager.state().await, AuthState::NoCredentials);
        assert!(stored_device(dir.path()).is_none());
        assert!(stored_tokens(dir.path()).is_none());
    }

    #[tokio::test]
    async fn test_expired_token_ends_flow() {
        let mut server = Server::new_async().await;
        let _device_code = mock_device_code(&mut server).await;
        let _expired = mock_poll_error(&mut server, "expired_token", 1).await;

        let dir = TempDir::new().unwrap();
        let manager = test_manager(&server.url(), dir.path());
        manager.start_device_flow().await.unwrap();

        let err = manager.wait_for_authorization().await.unwrap_err();
        assert!(matches!(err, AuthError::AuthorizationExpired));
        assert_eq!(manager.flow_status(), FlowStatus::Expired);
        assert_eq!(manager.state().await, AuthState::NoCredentials);
    }

    #[tokio::test]
    async fn test_poll_gives_up_after_max_attempts() {
        let mut server = Server::new_async().await;
        let _device_code = mock_device_code(&mut server).await;
        let pending = mock_poll_error(&mut server, "authorization_pending", 2).await;

        let dir = TempDir::new().unwrap();
        let mut config = AuthConfig::with_authority(&server.url(), "test-client", dir.path().to_path_buf());
        config.max_poll_attempts = 2;
        let manager = CredentialManager::with_key_deriver(config, test_keys()).unwrap();

        manager.start_device_flow().await.unwrap();
        let err = manager.wait_for_authorization().await.unwrap_err();
        assert!(matches!(err, AuthError::AuthorizationTimedOut { attempts: 2 }));

        pending.assert_async().await;
        assert_eq!(manager.state().await, AuthState::NoCredentials);
        assert!(stored_device(dir.path()).is_none());
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let mut server = Server::new_async().await;
        let _device_code = mock_device_code(&mut server).await;
        let outage = server
            .mock("POST", "/token")
            .with_status(502)
            .with_body("bad gateway")
            .expect(1)
            .create_async()
            .await;
        let _granted = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token":"at-after-outage","refresh_token":"rt","expires_in":3600}"#)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let manager = test_manager(&server.url(), dir.path());
        manager.start_device_flow().await.unwrap();
        manager.wait_for_authorization().await.unwrap();

        outage.assert_async().await;
        assert_eq!(manager.get_valid_access_token().await.unwrap(), "at-after-outage");
    }

    #[tokio::test]
    async fn test_initialize_resumes_persisted_flow() {
        let mut server = Server::new_async().await;
        let _granted = server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded("device_code".into(), "dev-resumed".into()))
            .with_status(200)
            .with_body(r#"{"access_token":"at-resumed","refresh_token":"rt","expires_in":3600}"#)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let device = DeviceAuthorization {
            device_code: "dev-resumed".into(),
            user_code: "RESUME".into(),
            verification_uri: "https://login.example.com/device".into(),
            expires_in_seconds: 900,
            poll_interval_seconds: 1,
            issued_at: Utc::now() - chrono::Duration::seconds(30),
        };
        SecretStore::new(test_keys())
            .save(&dir.path().join("device_code.json"), &device)
            .unwrap();

        let manager = test_manager(&server.url(), dir.path());
        assert_eq!(
            manager.initialize().await.unwrap(),
            AuthState::AwaitingAuthorization
        );
        manager.wait_for_authorization().await.unwrap();
        assert_eq!(manager.get_valid_access_token().await.unwrap(), "at-resumed");
    }

    #[tokio::test]
    async fn test_initialize_discards_stale_device_authorization() {
        let dir = TempDir::new().unwrap();
        let device = DeviceAuthorization {
            device_code: "dev-old".into(),
            user_code: "OLD".into(),
            verification_uri: "https://login.example.com/device".into(),
            expires_in_seconds: 900,
            poll_interval_seconds: 5,
            issued_at: Utc::now() - chrono::Duration::hours(1),
        };
        SecretStore::new(test_keys())
            .save(&dir.path().join("device_code.json"), &device)
            .unwrap();

        let manager = test_manager("http://127.0.0.1:9", dir.path());
        assert_eq!(manager.initialize().await.unwrap(), AuthState::NoCredentials);
        assert!(!dir.path().join("device_code.json").exists());
        assert_eq!(manager.flow_status(), FlowStatus::Idle);
    }

    #[tokio::test]
    async fn test_stored_tokens_supersede_device_authorization() {
        let dir = TempDir::new().unwrap();
        seed_tokens(
            dir.path(),
            &TokenSet {
                access_token: "at".into(),
                refresh_token: Some("rt".into()),
                expires_at: Utc::now() + chrono::Duration::hours(1),
                token_type: "Bearer".into(),
            },
        );
        let device = DeviceAuthorization {
            device_code: "dev-leftover".into(),
            user_code: "LEFT".into(),
            verification_uri: "https://login.example.com/device".into(),
            expires_in_seconds: 900,
            poll_interval_seconds: 5,
            issued_at: Utc::now(),
        };
        SecretStore::new(test_keys())
            .save(&dir.path().join("device_code.json"), &device)
            .unwrap();

        let manager = test_manager("http://127.0.0.1:9", dir.path());
        assert_eq!(manager.initialize().await.unwrap(), AuthState::Authenticated);
        assert!(!dir.path().join("device_code.json").exists());
    }

    #[tokio::test]
    async fn test_sign_out_cancels_flow() {
        let mut server = Server::new_async().await;
        let _device_code = mock_device_code(&mut server).await;
        let _pending = mock_poll_error(&mut server, "authorization_pending", 1).await;

        let dir = TempDir::new().unwrap();
        let manager = test_manager(&server.url(), dir.path());
        manager.start_device_flow().await.unwrap();
        manager.sign_out().await.unwrap();

        let err = manager.wait_for_authorization().await.unwrap_err();
        assert!(matches!(err, AuthError::DeviceFlowCancelled));
        assert_eq!(manager.flow_status(), FlowStatus::Cancelled);
        assert!(stored_device(dir.path()).is_none());
    }

    #[tokio::test]
    async fn test_wait_without_flow_returns_immediately() {
        let dir = TempDir::new().unwrap();
        let manager = test_manager("http://127.0.0.1:9", dir.path());
        let err = manager.wait_for_authorization().await.unwrap_err();
        assert!(matches!(err, AuthError::DeviceFlowCancelled));
    }

    #[tokio::test]
    async fn test_slow_down_increases_interval() {
        let mut server = Server::new_async().await;
        let _device_code = mock_device_code(&mut server).await;
        let slow_down = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"slow_down"}"#)
            .expect(1)
            .create_async()
            .await;
        let granted = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token":"at-slow","refresh_token":"rt","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let manager = test_manager(&server.url(), dir.path());
        let started = std::time::Instant::now();
        manager.start_device_flow().await.unwrap();

        // At the original one second interval the grant would already be polled
        sleep(Duration::from_secs(3)).await;
        assert!(!granted.matched_async().await);

        manager.wait_for_authorization().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(6));
        slow_down.assert_async().await;
        granted.assert_async().await;
        assert_eq!(manager.get_valid_access_token().await.unwrap(), "at-slow");
    }

    #[tokio::test]
    async fn test_device_code_expiry_stops_poll() {
        let mut server = Server::new_async().await;
        let _device_code = server
            .mock("POST", "/devicecode")
            .with_status(200)
            .with_body(
                r#"{"device_code":"dev-1","user_code":"SHORT","verification_uri":"https://login.example.com/device","expires_in":2,"interval":1}"#,
            )
            .create_async()
            .await;
        let _pending = mock_poll_error(&mut server, "authorization_pending", 1).await;

        let dir = TempDir::new().unwrap();
        let manager = test_manager(&server.url(), dir.path());
        manager.start_device_flow().await.unwrap();

        let err = manager.wait_for_authorization().await.unwrap_err();
        assert!(matches!(err, AuthError::AuthorizationExpired));
        assert_eq!(manager.flow_status(), FlowStatus::Expired);
        assert_eq!(manager.state().await, AuthState::NoCredentials);
        assert!(stored_device(dir.path()).is_none());
    }

    #[tokio::test]
    async fn test_out_of_range_grant_lifetime_fails_flow() {
        let mut server = Server::new_async().await;
        let _device_code = mock_device_code(&mut server).await;
        let _granted = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token":"at","expires_in":10000000000000}"#)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let manager = test_manager(&server.url(), dir.path());
        manager.start_device_flow().await.unwrap();

        let waited = tokio::time::timeout(Duration::from_secs(5), manager.wait_for_authorization())
            .await
            .expect("flow outcome was never published");
        assert!(matches!(waited, Err(AuthError::DeviceFlowFailed(_))));
        assert!(matches!(manager.flow_status(), FlowStatus::Failed { .. }));
        assert_eq!(manager.state().await, AuthState::NoCredentials);
        assert!(stored_tokens(dir.path()).is_none());
        assert!(stored_device(dir.path()).is_none());
    }

    #[tokio::test]
    async fn test_out_of_range_device_code_lifetime_is_rejected() {
        let mut server = Server::new_async().await;
        let _device_code = server
            .mock("POST", "/devicecode")
            .with_status(200)
            .with_body(
                r#"{"device_code":"dev-1","user_code":"HUGE","verification_uri":"https://login.example.com/device","expires_in":18446744073709551615}"#,
            )
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let manager = test_manager(&server.url(), dir.path());
        let err = manager.start_device_flow().await.unwrap_err();
        assert!(matches!(err, AuthError::UnexpectedResponse(_)));
        assert_eq!(manager.state().await, AuthState::NoCredentials);
        assert_eq!(manager.flow_status(), FlowStatus::Idle);
        assert!(stored_device(dir.path()).is_none());
    }

    #[tokio::test]
    async fn test_unsaved_grant_is_not_kept_in_memory() {
        let mut server = Server::new_async().await;
        let _device_code = mock_device_code(&mut server).await;
        let _granted = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token":"at-unsaved","refresh_token":"rt","expires_in":3600}"#)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        // The atomic write goes through this path; a directory there fails it
        std::fs::create_dir(dir.path().join("tokens.json.tmp")).unwrap();

        let manager = test_manager(&server.url(), dir.path());
        manager.start_device_flow().await.unwrap();

        let err = manager.wait_for_authorization().await.unwrap_err();
        assert!(matches!(err, AuthError::DeviceFlowFailed(_)));
        assert_eq!(manager.state().await, AuthState::NoCredentials);
        assert!(stored_tokens(dir.path()).is_none());
    }
}
