//! In-memory credential store for testing and development.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::VaultResult;
use crate::traits::CredentialStore;
use crate::types::{CredentialRecord, CredentialType};

type Key = (String, CredentialType);

/// In-memory credential store.
///
/// Records are not persisted across restarts.
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentials {
    data: Arc<RwLock<HashMap<Key, CredentialRecord>>>,
}

impl MemoryCredentials {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentials {
    async fn get(
        &self,
        account_id: &str,
        credential_type: CredentialType,
    ) -> VaultResult<Option<CredentialRecord>> {
        let data = self.data.read().await;
        Ok(data.get(&(account_id.to_owned(), credential_type)).cloned())
    }

    async fn put(&self, record: &CredentialRecord) -> VaultResult<()> {
        let mut data = self.data.write().await;
        data.insert(
            (record.account_id.clone(), record.credential_type),
            record.clone(),
        );
        Ok(())
    }

    async fn delete(
        &self,
        account_id: &str,
        credential_type: CredentialType,
    ) -> VaultResult<bool> {
        let mut data = self.data.write().await;
        Ok(data
            .remove(&(account_id.to_owned(), credential_type))
            .is_some())
    }

    async fn list(&self) -> VaultResult<Vec<CredentialRecord>> {
        let data = self.data.read().await;
        let mut records: Vec<_> = data.values().cloned().collect();
        records.sort_by(|a, b| {
            (&a.account_id, a.credential_type).cmp(&(&b.account_id, b.credential_type))
        });
        Ok(records)
    }

    async fn replace_all(&self, records: &[CredentialRecord]) -> VaultResult<()> {
        let mut data = self.data.write().await;
        for record in records {
            data.insert(
                (record.account_id.clone(), record.credential_type),
                record.clone(),
            );
        }
        Ok(())
    }
}
