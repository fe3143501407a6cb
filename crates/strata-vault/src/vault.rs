//! The credential vault: sealing, opening and key rotation.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::error::{VaultError, VaultResult};
use crate::keyring::{Keyring, MasterKey};
use crate::traits::CredentialStore;
use crate::types::{CredentialRecord, CredentialType, RotationReport, SecretValue};
use crate::AUDIT_TARGET;

/// Encrypts cloud credentials at rest and decrypts them on demand.
///
/// `store`, `fetch` and `remove` hold the keyring's read side for their
/// whole store round trip. [`rotate_key`](Self::rotate_key) takes the write
/// side for the whole re-encryption pass, so no write lands between its
/// `list` and `replace_all` and no caller observes a half-rotated vault.
pub struct CredentialVault {
    keyring: RwLock<Arc<Keyring>>,
    store: Arc<dyn CredentialStore>,
}

impl CredentialVault {
    /// Creates a vault over `store` using `keyring`.
    pub fn new(keyring: Arc<Keyring>, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            keyring: RwLock::new(keyring),
            store,
        }
    }

    /// Returns the version of the key new credentials are sealed with.
    pub async fn active_key_version(&self) -> u32 {
        self.keyring.read().await.active_version()
    }

    /// Binds ciphertext to its lookup key so a record copied onto another
    /// account fails authentication.
    fn associated_data(account_id: &str, credential_type: CredentialType) -> Vec<u8> {
        format!("strata:{account_id}:{credential_type}").into_bytes()
    }

    /// Encrypts and stores a credential, replacing any existing one for the
    /// same account and type.
    #[instrument(skip(self, plaintext), fields(account_id = %account_id, credential_type = %credential_type))]
    pub async fn store(
        &self,
        account_id: &str,
        credential_type: CredentialType,
        plaintext: &SecretValue,
    ) -> VaultResult<CredentialRecord> {
        // Held until the record is written so a rotation cannot list the
        // old ciphertext and then write it back over this one.
        let keyring = self.keyring.read().await;

        let aad = Self::associated_data(account_id, credential_type);
        let sealed = keyring.seal(plaintext.expose().as_bytes(), &aad)?;

        let now = Utc::now();
        let created_at = self
            .store
            .get(account_id, credential_type)
            .await?
            .map_or(now, |existing| existing.created_at);

        let record = CredentialRecord {
            account_id: account_id.to_owned(),
            credential_type,
            sealed,
            created_at,
            updated_at: now,
        };
        self.store.put(&record).await?;

        info!(
            target: AUDIT_TARGET,
            account_id = %account_id,
            credential_type = %credential_type,
            key_version = record.sealed.key_version,
            "credential stored"
        );
        Ok(record)
    }

    /// Decrypts the credential for an account.
    ///
    /// Every call is audit-logged. The returned value never appears in
    /// `Debug` output and is zeroed on drop.
    #[instrument(skip(self), fields(account_id = %account_id, credential_type = %credential_type))]
    pub async fn fetch(
        &self,
        account_id: &str,
        credential_type: CredentialType,
    ) -> VaultResult<SecretValue> {
        let keyring = self.keyring.read().await;
        let record = self
            .store
            .get(account_id, credential_type)
            .await?
            .ok_or_else(|| VaultError::not_found(account_id, credential_type))?;

        let aad = Self::associated_data(account_id, credential_type);

        let plaintext = match keyring.open(&record.sealed, &aad) {
            Ok(plaintext) => plaintext,
            Err(reason) => {
                warn!(
                    target: AUDIT_TARGET,
                    account_id = %account_id,
                    credential_type = %credential_type,
                    key_version = record.sealed.key_version,
                    %reason,
                    "credential decryption failed"
                );
                return Err(VaultError::decryption(account_id, credential_type));
            }
        };

        let value = SecretValue::from_bytes(&plaintext)
            .map_err(|_| VaultError::decryption(account_id, credential_type))?;

        info!(
            target: AUDIT_TARGET,
            account_id = %account_id,
            credential_type = %credential_type,
            key_version = record.sealed.key_version,
            "credential fetched"
        );
        Ok(value)
    }

    /// Removes a stored credential. Returns true if one existed.
    pub async fn remove(
        &self,
        account_id: &str,
        credential_type: CredentialType,
    ) -> VaultResult<bool> {
        let _keyring = self.keyring.read().await;
        let removed = self.store.delete(account_id, credential_type).await?;
        if removed {
            info!(
                target: AUDIT_TARGET,
                account_id = %account_id,
                credential_type = %credential_type,
                "credential removed"
            );
        }
        Ok(removed)
    }

    /// Re-encrypts every stored credential under `new_key`.
    ///
    /// `old_key` must match the active key; the comparison is constant
    /// time. The new ciphertexts are committed in one atomic batch before
    /// the new key becomes active, so a failure at any step leaves the
    /// vault readable with the old key.
    #[instrument(skip_all)]
    pub async fn rotate_key(
        &self,
        old_key: &MasterKey,
        new_key: MasterKey,
    ) -> VaultResult<RotationReport> {
        let mut guard = self.keyring.write().await;
        let current = Arc::clone(&*guard);

        if !current.is_active_key(old_key) {
            warn!(target: AUDIT_TARGET, "key rotation rejected: old key mismatch");
            return Err(VaultError::Rotation(
                "supplied key does not match the active master key".to_owned(),
            ));
        }
        if current.is_active_key(&new_key) {
            return Err(VaultError::Rotation(
                "new key is identical to the active master key".to_owned(),
            ));
        }

        let next = current.rotated(current.next_version(), new_key);
        let records = self.store.list().await?;
        let now = Utc::now();

        let mut resealed = Vec::with_capacity(records.len());
        for record in records {
            let aad = Self::associated_data(&record.account_id, record.credential_type);
            let plaintext = current.open(&record.sealed, &aad).map_err(|reason| {
                warn!(
                    target: AUDIT_TARGET,
                    account_id = %record.account_id,
                    credential_type = %record.credential_type,
                    %reason,
                    "key rotation aborted: credential could not be opened"
                );
                VaultError::decryption(&record.account_id, record.credential_type)
            })?;
            let sealed = next.seal(&plaintext, &aad)?;
            debug!(account_id = %record.account_id, "re-encrypted credential");
            resealed.push(CredentialRecord {
                sealed,
                updated_at: now,
                ..record
            });
        }

        self.store.replace_all(&resealed).await?;

        let report = RotationReport {
            previous_version: current.active_version(),
            active_version: next.active_version(),
            reencrypted: resealed.len(),
        };
        *guard = Arc::new(next);

        info!(
            target: AUDIT_TARGET,
            previous_version = report.previous_version,
            active_version = report.active_version,
            reencrypted = report.reencrypted,
            "master key rotated"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}
