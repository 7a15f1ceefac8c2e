//! Machine-bound key derivation.
//!
//! The key is PBKDF2-HMAC-SHA256 over the host's machine identity with a fixed
//! application salt, so files encrypted here cannot be opened on another host.
//! It is computed at most once per [`KeyDeriver`] and never written to disk.

use crate::error::AuthError;
use crate::platform;
use sha2::Sha256;
use std::fmt;
use std::sync::Mutex;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Key length in bytes (256 bits for AES-256)
pub const KEY_LENGTH: usize = 32;

const KEY_SALT: &[u8] = b"tokenkeeper.machine-key.v1";

const PBKDF2_ITERATIONS: u32 = 100_000;

/// 32-byte symmetric key, wiped from memory on drop
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct MachineKey([u8; KEY_LENGTH]);

impl MachineKey {
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for MachineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MachineKey(<redacted>)")
    }
}

/// Where the machine identity comes from.
pub trait IdentitySource: Send + Sync {
    fn machine_identity(&self) -> anyhow::Result<String>;
}

/// The identity reported by the host OS (see [`crate::platform`]).
#[derive(Debug, Clone, Copy, Default)]
pub struct HostIdentity;

impl IdentitySource for HostIdentity {
    fn machine_identity(&self) -> anyhow::Result<String> {
        platform::machine_id()
    }
}

/// A caller-supplied identity, for embedding and tests.
#[derive(Debug, Clone)]
pub struct FixedIdentity(pub String);

impl IdentitySource for FixedIdentity {
    fn machine_identity(&self) -> anyhow::Result<String> {
        Ok(self.0.clone())
    }
}

pub struct KeyDeriver {
    identity: Box<dyn IdentitySource>,
    cached: Mutex<Option<MachineKey>>,
}

impl KeyDeriver {
    pub fn new(identity: impl IdentitySource + 'static) -> Self {
        Self {
            identity: Box::new(identity),
            cached: Mutex::new(None),
        }
    }

    /// Deriver bound to this host's machine identity.
    pub fn for_host() -> Self {
        Self::new(HostIdentity)
    }

    /// Return the machine key, deriving it on first use.
    ///
    /// A failure to read the identity is not cached, so the next call retries.
    pub fn derive_key(&self) -> Result<MachineKey, AuthError> {
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(key) = cached.as_ref() {
            return Ok(key.clone());
        }

        let mut identity = self
            .identity
            .machine_identity()
            .map_err(|e| AuthError::IdentityUnavailable(format!("{:#}", e)))?;
        if identity.trim().is_empty() {
            return Err(AuthError::IdentityUnavailable(
                "machine identity is empty".to_string(),
            ));
        }

        let mut bytes = [0u8; KEY_LENGTH];
        pbkdf2::pbkdf2_hmac::<Sha256>(identity.as_bytes(), KEY_SALT, PBKDF2_ITERATIONS, &mut bytes);
        identity.zeroize();

        let key = MachineKey(bytes);
        bytes.zeroize();
        tracing::debug!("Machine key derived");

        *cached = Some(key.clone());
        Ok(key)
    }

    #[cfg(test)]
    pub(crate) fn preloaded(key: MachineKey) -> Self {
        Self {
            identity: Box::new(FixedIdentity("preloaded".to_string())),
            cached: Mutex::new(Some(key)),
        }
    }
}

impl fmt::Debug for KeyDeriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cached = self
            .cached
            .lock()
            .map(|c| c.is_some())
            .unwrap_or(false);
        f.debug_struct("KeyDeriver").field("cached", &cached).finish()
    }
}
