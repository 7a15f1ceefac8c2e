//! Tokenkeeper Core Library
//!
//! Keeps an OAuth 2.0 access token valid for a headless client:
//! - Device authorization grant sign-in, polled in the background
//! - Proactive refresh before the access token expires
//! - Credentials encrypted at rest under a key bound to this machine
//!
//! # Features
//!
//! - `browser`: Open the verification page automatically during sign-in
//!
//! # Example
//!
//! ```no_run
//! use tokenkeeper_core::{config, AuthError, CredentialManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = CredentialManager::new(config::load_auth_config())?;
//!     manager.initialize().await?;
//!
//!     match manager.get_valid_access_token().await {
//!         Ok(token) => println!("Bearer {}", token),
//!         Err(AuthError::AuthenticationRequired(instructions)) => {
//!             println!("Visit {} and enter {}", instructions.verification_uri, instructions.user_code);
//!             manager.wait_for_authorization().await?;
//!         }
//!         Err(e) => return Err(e.into()),
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod platform;

// Re-export commonly used types
pub use auth::{AuthState, AuthStatus, CredentialManager, DeviceAuthorization, FlowStatus, TokenSet};
pub use config::{AuthConfig, ConfigSource};
pub use crypto::{KeyDeriver, SecretStore};
pub use error::{AuthError, AuthInstructions};
