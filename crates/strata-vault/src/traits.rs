//! Storage trait for sealed credentials.

use async_trait::async_trait;

use crate::error::VaultResult;
use crate::types::{CredentialRecord, CredentialType};

/// Backend trait for sealed credential storage.
///
/// Backends only ever see ciphertext: sealing and opening happen in
/// [`CredentialVault`](crate::CredentialVault) before records reach the
/// store.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Retrieves the record for an account and credential type.
    async fn get(
        &self,
        account_id: &str,
        credential_type: CredentialType,
    ) -> VaultResult<Option<CredentialRecord>>;

    /// Inserts or replaces the record keyed by its account and type.
    async fn put(&self, record: &CredentialRecord) -> VaultResult<()>;

    /// Deletes the record. Returns true if one existed.
    async fn delete(&self, account_id: &str, credential_type: CredentialType)
        -> VaultResult<bool>;

    /// Lists every stored record.
    async fn list(&self) -> VaultResult<Vec<CredentialRecord>>;

    /// Replaces a batch of records in a single atomic step.
    ///
    /// Either every record in `records` is written or none is. Used by key
    /// rotation so that a failure part-way through leaves the previous
    /// ciphertexts intact.
    async fn replace_all(&self, records: &[CredentialRecord]) -> VaultResult<()>;
}
