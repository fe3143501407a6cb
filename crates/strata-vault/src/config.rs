//! Vault configuration.

use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{VaultError, VaultResult};
use crate::keyring::{Keyring, MasterKey};

/// Where the master key comes from.
///
/// Exactly one of `key_file` or `master_key` must be set. Older key
/// versions that still protect records can be listed under `retired_keys`.
#[derive(Clone, Deserialize)]
pub struct VaultConfig {
    /// Path to a base64 key file with mode 0600.
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// Base64 master key supplied directly (e.g. via `STRATA_VAULT__MASTER_KEY`).
    #[serde(default)]
    pub master_key: Option<String>,

    /// Version number of the active key.
    #[serde(default = "default_key_version")]
    pub key_version: u32,

    /// Key files for earlier versions, still accepted for decryption.
    #[serde(default)]
    pub retired_keys: Vec<RetiredKey>,
}

/// A previous master key kept for opening older records.
#[derive(Debug, Clone, Deserialize)]
pub struct RetiredKey {
    /// Version the key was active under.
    pub version: u32,
    /// Path to its key file.
    pub key_file: PathBuf,
}

fn default_key_version() -> u32 {
    1
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            key_file: None,
            master_key: None,
            key_version: default_key_version(),
            retired_keys: Vec::new(),
        }
    }
}

impl VaultConfig {
    /// Loads the configured keys into a keyring.
    pub fn keyring(&self) -> VaultResult<Keyring> {
        let active = match (&self.key_file, &self.master_key) {
            (Some(_), Some(_)) => {
                return Err(VaultError::Configuration(
                    "set only one of vault.key_file and vault.master_key".to_owned(),
                ))
            }
            (Some(path), None) => MasterKey::load(path)?,
            (None, Some(encoded)) => MasterKey::from_base64(encoded)?,
            (None, None) => return Err(VaultError::MasterKeyNotFound),
        };

        let mut keyring = Keyring::new(self.key_version, active);
        for retired in &self.retired_keys {
            keyring = keyring.with_retired(retired.version, MasterKey::load(&retired.key_file)?)?;
        }
        Ok(keyring)
    }
}

impl fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultConfig")
            .field("key_file", &self.key_file)
            .field("master_key", &self.master_key.as_ref().map(|_| "[REDACTED]"))
            .field("key_version", &self.key_version)
            .field("retired_keys", &self.retired_keys)
            .finish()
    }
}
