//! Encryption at rest: a machine-bound key and the files it protects.

mod key;
mod store;

pub use key::{FixedIdentity, HostIdentity, IdentitySource, KeyDeriver, MachineKey, KEY_LENGTH};
pub use store::{EncryptedBlob, SecretStore};
pub(crate) use store::ensure_private_dir;
