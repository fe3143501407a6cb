//! Encrypted cloud credential storage for Strata.
//!
//! Cloud account credentials are sealed with XChaCha20-Poly1305 before they
//! reach storage and are only ever decrypted into a [`SecretValue`], which
//! redacts itself in `Debug` output and zeroes its memory on drop.
//!
//! # Storage
//!
//! - **Memory** (`memory` feature): in-process map for testing
//! - **SQLite** (`sqlite` feature): nonce, ciphertext, tag and key version
//!   stored as separate columns
//!
//! # Auditing
//!
//! Every store, fetch, removal and key rotation emits an event on the
//! `strata::audit` tracing target. Events carry the account id, credential
//! type and key version, never the plaintext.
//!
//! # Example
//!
//! ```rust,ignore
//! use strata_vault::{CredentialType, CredentialVault, Keyring, MasterKey, SecretValue};
//!
//! let vault = CredentialVault::new(Arc::new(Keyring::new(1, key)), store);
//! vault.store("acct-1", CredentialType::AwsAccessKey, &SecretValue::new(json)).await?;
//! let secret = vault.fetch("acct-1", CredentialType::AwsAccessKey).await?;
//! ```

#![forbid(unsafe_code)]

mod config;
mod error;
mod keyring;
mod traits;
mod types;
mod vault;

#[cfg(feature = "memory")]
mod memory;

#[cfg(feature = "sqlite")]
mod sqlite;

/// Tracing target for credential access events.
pub const AUDIT_TARGET: &str = "strata::audit";

pub use config::{RetiredKey, VaultConfig};
pub use error::{VaultError, VaultResult};
pub use keyring::{Keyring, MasterKey, KEY_LEN, NONCE_LEN, TAG_LEN};
pub use traits::CredentialStore;
pub use types::{CredentialRecord, CredentialType, RotationReport, SealedSecret, SecretValue};
pub use vault::CredentialVault;

#[cfg(feature = "memory")]
pub use memory::MemoryCredentials;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCredentials;
