//! Authentication module.
//!
//! Provides the OAuth 2.0 device flow, token refresh and the credential
//! manager that ties them to encrypted storage.

mod client;
mod credentials;
mod device_flow;
mod manager;

pub use client::{AuthClient, DeviceCodeResponse, TokenPoll, TokenResponse};
pub use credentials::{DeviceAuthorization, TokenSet};
#[cfg(feature = "browser")]
pub use device_flow::open_verification_page;
pub use manager::{AuthState, AuthStatus, CredentialManager, FlowStatus};
