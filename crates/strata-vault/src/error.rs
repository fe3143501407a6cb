//! Error types for the credential vault.

use thiserror::Error;

use crate::types::CredentialType;

/// Errors that can occur during vault operations.
///
/// None of the variants carry plaintext or key material, so they are safe to
/// log and to surface to callers.
#[derive(Debug, Error)]
pub enum VaultError {
    /// No credential is stored for the account and type.
    #[error("credential not found: {account_id}/{credential_type}")]
    NotFound {
        /// The account the lookup was for.
        account_id: String,
        /// The credential type the lookup was for.
        credential_type: CredentialType,
    },

    /// The stored ciphertext failed authentication or could not be opened
    /// with any key in the keyring.
    #[error("credential for {account_id}/{credential_type} could not be decrypted")]
    Decryption {
        /// The account whose credential failed to decrypt.
        account_id: String,
        /// The credential type that failed to decrypt.
        credential_type: CredentialType,
    },

    /// Sealing a plaintext failed.
    #[error("encryption failed")]
    Encryption,

    /// The supplied master key material is malformed.
    #[error("invalid master key: {0}")]
    InvalidKey(String),

    /// No master key was configured.
    #[error("master key not found")]
    MasterKeyNotFound,

    /// The key file is readable by group or other.
    #[error("insecure key file permissions: {path} has mode {mode:o}")]
    InsecureKeyFile {
        /// The path to the insecure key file.
        path: String,
        /// The file mode (permissions) in octal.
        mode: u32,
    },

    /// A key rotation request was refused.
    #[error("key rotation rejected: {0}")]
    Rotation(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Database error.
    #[error("database error: {0}")]
    Database(String),
}

impl VaultError {
    pub(crate) fn not_found(account_id: &str, credential_type: CredentialType) -> Self {
        Self::NotFound {
            account_id: account_id.to_owned(),
            credential_type,
        }
    }

    pub(crate) fn decryption(account_id: &str, credential_type: CredentialType) -> Self {
        Self::Decryption {
            account_id: account_id.to_owned(),
            credential_type,
        }
    }

    pub(crate) fn database(e: impl std::fmt::Display) -> Self {
        Self::Database(e.to_string())
    }
}

/// Result type for vault operations.
pub type VaultResult<T> = Result<T, VaultError>;
