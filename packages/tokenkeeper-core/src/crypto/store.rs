//! AES-256-GCM sealed files.
//!
//! Each write serializes the payload to JSON, seals it under the machine key
//! with a fresh random nonce, and stores the blob as hex-in-JSON:
//!
//! ```json
//! { "version": 1, "nonce": "…", "auth_tag": "…", "ciphertext": "…" }
//! ```
//!
//! The store keeps no state between calls beyond the key deriver.

use crate::crypto::key::KeyDeriver;
use crate::error::AuthError;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zeroize::Zeroize;

/// Nonce length in bytes (96 bits for AES-GCM)
const NONCE_LENGTH: usize = 12;

/// GCM authentication tag length in bytes
const TAG_LENGTH: usize = 16;

/// Current blob format version
const BLOB_VERSION: u32 = 1;

/// Ciphertext, nonce and authentication tag, always read and written together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    pub version: u32,
    #[serde(with = "hex")]
    pub nonce: Vec<u8>,
    #[serde(with = "hex")]
    pub auth_tag: Vec<u8>,
    #[serde(with = "hex")]
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SecretStore {
    keys: Arc<KeyDeriver>,
}

impl SecretStore {
    pub fn new(keys: Arc<KeyDeriver>) -> Self {
        Self { keys }
    }

    fn cipher(&self) -> Result<Aes256Gcm, AuthError> {
        let key = self.keys.derive_key()?;
        Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| AuthError::DecryptionFailed(format!("invalid key: {}", e)))
    }

    pub fn encrypt<T: Serialize + ?Sized>(&self, plaintext: &T) -> Result<EncryptedBlob, AuthError> {
        let cipher = self.cipher()?;
        let mut payload = serde_json::to_vec(plaintext)?;

        let mut nonce = [0u8; NONCE_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let sealed = cipher.encrypt(Nonce::from_slice(&nonce), payload.as_slice());
        payload.zeroize();
        let mut ciphertext =
            sealed.map_err(|e| AuthError::DecryptionFailed(format!("encryption failed: {}", e)))?;

        // aes-gcm appends the tag to the ciphertext
        let auth_tag = ciphertext.split_off(ciphertext.len() - TAG_LENGTH);

        Ok(EncryptedBlob {
            version: BLOB_VERSION,
            nonce: nonce.to_vec(),
            auth_tag,
            ciphertext,
        })
    }

    /// Open a blob. Nothing is returned unless the tag verifies.
    pub fn decrypt<T: DeserializeOwned>(&self, blob: &EncryptedBlob) -> Result<T, AuthError> {
        if blob.version != BLOB_VERSION {
            return Err(AuthError::DecryptionFailed(format!(
                "unsupported blob version {}",
                blob.version
            )));
        }
        if blob.nonce.len() != NONCE_LENGTH {
            return Err(AuthError::DecryptionFailed(format!(
                "nonce must be {} bytes, got {}",
                NONCE_LENGTH,
                blob.nonce.len()
            )));
        }
        if blob.auth_tag.len() != TAG_LENGTH {
            return Err(AuthError::DecryptionFailed(format!(
                "auth tag must be {} bytes, got {}",
                TAG_LENGTH,
                blob.auth_tag.len()
            )));
        }

        let cipher = self.cipher()?;
        let mut sealed = Vec::with_capacity(blob.ciphertext.len() + TAG_LENGTH);
        sealed.extend_from_slice(&blob.ciphertext);
        sealed.extend_from_slice(&blob.auth_tag);

        let mut payload = cipher
            .decrypt(Nonce::from_slice(&blob.nonce), sealed.as_slice())
            .map_err(|_| {
                AuthError::DecryptionFailed("authentication tag mismatch".to_string())
            })?;

        let parsed = serde_json::from_slice(&payload).map_err(|e| {
            AuthError::DecryptionFailed(format!("decrypted payload is not valid: {}", e))
        });
        payload.zeroize();
        parsed
    }

    /// Encrypt `plaintext` and atomically replace the file at `path`.
    pub fn save<T: Serialize + ?Sized>(&self, path: &Path, plaintext: &T) -> Result<(), AuthError> {
        let blob = self.encrypt(plaintext)?;
        let json = serde_json::to_string_pretty(&blob)?;

        if let Some(parent) = path.parent() {
            ensure_private_dir(parent)?;
        }

        let tmp = temp_path(path);
        if let Err(e) = write_private_file(&tmp, json.as_bytes()) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        tracing::debug!("Encrypted file written: {:?}", path);
        Ok(())
    }

    /// Load and decrypt `path`.
    ///
    /// A missing file is `Ok(None)`. Anything else that prevents reading the
    /// payload is `StorageCorrupted`, except an unavailable machine identity.
    pub fn load<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, AuthError> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("No encrypted file at {:?}", path);
                return Ok(None);
            }
            Err(e) => return Err(AuthError::corrupted(path, e)),
        };

        let blob: EncryptedBlob =
            serde_json::from_str(&content).map_err(|e| AuthError::corrupted(path, e))?;

        match self.decrypt(&blob) {
            Ok(value) => {
                tracing::debug!("Encrypted file loaded: {:?}", path);
                Ok(Some(value))
            }
            Err(AuthError::DecryptionFailed(reason)) => Err(AuthError::corrupted(path, reason)),
            Err(e) => Err(e),
        }
    }

    /// Delete the file at `path`. Returns whether a file was removed.
    pub fn remove(&self, path: &Path) -> Result<bool, AuthError> {
        match fs::remove_file(path) {
            Ok(()) => {
                tracing::debug!("Encrypted file removed: {:?}", path);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Create `dir` if needed, owner-only on Unix
pub(crate) fn ensure_private_dir(dir: &Path) -> std::io::Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
        }
    }
    Ok(())
}

fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600); // Owner read/write only
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}
