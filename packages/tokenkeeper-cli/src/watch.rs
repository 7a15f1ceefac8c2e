//! Foreground watch mode for keeping the access token fresh
//!
//! This module implements a long-running loop that:
//! - Periodically asks the core for a valid access token, refreshing it early
//! - Stops when the credentials can no longer be renewed
//! - Handles graceful shutdown via SIGTERM/SIGINT

use anyhow::Result;
use tokenkeeper_core::{AuthError, AuthState, CredentialManager};
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Run the token watch loop until interrupted
pub async fn run_watch(manager: CredentialManager, interval_minutes: u64) -> Result<()> {
    let interval_minutes = interval_minutes.max(1);

    // Check authentication first
    let state = manager
        .initialize()
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;
    if state != AuthState::Authenticated {
        eprintln!("Error: Not signed in.");
        eprintln!("Run 'tokenkeeper login' first to authenticate.");
        std::process::exit(1);
    }

    let check_every = check_period(interval_minutes);
    if check_every >= manager.config().expiry_buffer {
        tracing::warn!(
            "Check interval ({}m) is not shorter than the refresh buffer ({}s); the token may expire between checks",
            interval_minutes,
            manager.config().expiry_buffer.as_secs()
        );
    }

    tracing::info!("Starting watch: checking every {} minutes", interval_minutes);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    // First tick fires immediately, so the token is checked on start
    let mut ticker = interval(check_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match manager.get_valid_access_token().await {
                    Ok(_) => {
                        let status = manager.status().await;
                        if let Some(expires_at) = status.expires_at {
                            tracing::debug!("Access token valid until {}", expires_at.to_rfc3339());
                        }
                    }
                    Err(e @ (AuthError::AuthenticationRequired(_) | AuthError::ReauthenticationRequired(_))) => {
                        tracing::warn!("Credentials can no longer be renewed, stopping watch");
                        eprintln!("{}", e.user_message());
                        break;
                    }
                    Err(e) if e.is_transient() => {
                        // Might be a temporary network issue
                        tracing::warn!("Token check failed, will retry: {}", e);
                    }
                    Err(e) => {
                        tracing::error!("Token check failed: {}", e);
                        return Err(anyhow::anyhow!(e.user_message()));
                    }
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested, stopping watch");
                break;
            }
        }
    }

    tracing::info!("Watch stopped");
    Ok(())
}

fn check_period(interval_minutes: u64) -> Duration {
    Duration::from_secs(interval_minutes.saturating_mul(60))
}

/// Resolves on Ctrl+C, or SIGTERM on Unix
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl+C"),
                }
                return;
            }
            Err(e) => tracing::warn!("Failed to register SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Received Ctrl+C");
}
