//! Cloud account registry.
//!
//! Account metadata lives in the [`AccountStore`]; the credential itself is
//! sealed in the [`CredentialVault`] under the account id and the provider's
//! credential type. Plaintext credentials only exist inside
//! [`ProviderCredentials`] for the duration of an engine call.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use strata_vault::{CredentialType, CredentialVault, SecretValue};
use tracing::{info, instrument, warn};

use crate::error::{ControlError, ControlResult};
use crate::store::{AccountFilter, AccountStore, DeploymentStore};
use crate::types::{Account, AccountId, AccountStatus, CloudProvider, NewAccount};

/// Decrypted credentials handed to a provisioning engine.
///
/// `Debug` never prints the secret.
#[derive(Clone)]
pub struct ProviderCredentials {
    /// Provider the credentials are for.
    pub provider: CloudProvider,
    /// Credential type they were stored under.
    pub credential_type: CredentialType,
    secret: SecretValue,
}

impl ProviderCredentials {
    /// Wrap a decrypted credential document.
    #[must_use]
    pub fn new(provider: CloudProvider, secret: SecretValue) -> Self {
        Self {
            provider,
            credential_type: provider.credential_type(),
            secret,
        }
    }

    /// The raw credential document.
    #[must_use]
    pub fn secret(&self) -> &SecretValue {
        &self.secret
    }

    /// The credential document parsed as a JSON object.
    pub fn document(&self) -> ControlResult<Map<String, Value>> {
        parse_document(self.provider, &self.secret)
    }
}

impl fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("provider", &self.provider)
            .field("credential_type", &self.credential_type)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Parse and check a credential document without echoing its content in
/// any error.
fn parse_document(provider: CloudProvider, secret: &SecretValue) -> ControlResult<Map<String, Value>> {
    let document: Map<String, Value> = serde_json::from_str(secret.expose()).map_err(|_| {
        ControlError::validation(format!("{provider} credential must be a JSON object"))
    })?;

    let missing: Vec<&str> = provider
        .required_credential_fields()
        .iter()
        .copied()
        .filter(|field| {
            document
                .get(*field)
                .and_then(Value::as_str)
                .map_or(true, str::is_empty)
        })
        .collect();

    if missing.is_empty() {
        Ok(document)
    } else {
        Err(ControlError::validation(format!(
            "{provider} credential is missing field(s): {}",
            missing.join(", ")
        )))
    }
}

/// Registry of cloud accounts and their sealed credentials.
#[derive(Clone)]
pub struct AccountRegistry {
    store: Arc<dyn AccountStore>,
    deployments: Arc<dyn DeploymentStore>,
    vault: Arc<CredentialVault>,
}

impl AccountRegistry {
    /// Create a registry.
    pub fn new(
        store: Arc<dyn AccountStore>,
        deployments: Arc<dyn DeploymentStore>,
        vault: Arc<CredentialVault>,
    ) -> Self {
        Self {
            store,
            deployments,
            vault,
        }
    }

    /// Register an account and seal its credential.
    #[instrument(skip(self, account, credential), fields(name = %account.name, provider = %account.provider))]
    pub async fn register(
        &self,
        account: NewAccount,
        credential: &SecretValue,
    ) -> ControlResult<Account> {
        if account.name.trim().is_empty() {
            return Err(ControlError::validation("account name must not be empty"));
        }
        parse_document(account.provider, credential)?;

        let now = Utc::now();
        let stored = Account {
            id: account.id.unwrap_or_else(AccountId::generate),
            name: account.name,
            provider: account.provider,
            external_id: account.external_id,
            regions: account.regions,
            status: AccountStatus::Active,
            status_reason: None,
            created_at: now,
            updated_at: now,
        };

        self.store.insert_account(&stored).await?;

        if let Err(e) = self
            .vault
            .store(
                stored.id.as_str(),
                stored.provider.credential_type(),
                credential,
            )
            .await
        {
            warn!(account_id = %stored.id, error = %e, "sealing credential failed; removing account");
            self.store.delete_account(&stored.id).await?;
            return Err(e.into());
        }

        info!(account_id = %stored.id, "account registered");
        Ok(stored)
    }

    /// Fetch an account.
    pub async fn get(&self, id: &AccountId) -> ControlResult<Account> {
        self.store
            .get_account(id)
            .await?
            .ok_or_else(|| ControlError::AccountNotFound(id.to_string()))
    }

    /// List accounts matching the filter.
    pub async fn list(&self, filter: &AccountFilter) -> ControlResult<Vec<Account>> {
        self.store.list_accounts(filter).await
    }

    /// Change an account's status, e.g. after re-validating its credential.
    pub async fn set_status(
        &self,
        id: &AccountId,
        status: AccountStatus,
        reason: Option<String>,
    ) -> ControlResult<Account> {
        let mut account = self.get(id).await?;
        account.status = status;
        account.status_reason = if status == AccountStatus::Active {
            None
        } else {
            reason
        };
        account.updated_at = Utc::now();
        self.store.update_account(&account).await?;

        info!(account_id = %id, status = %status, "account status changed");
        Ok(account)
    }

    /// Replace an account's credential.
    #[instrument(skip(self, credential), fields(account_id = %id))]
    pub async fn rotate_credential(
        &self,
        id: &AccountId,
        credential: &SecretValue,
    ) -> ControlResult<()> {
        let mut account = self.get(id).await?;
        parse_document(account.provider, credential)?;

        self.vault
            .store(id.as_str(), account.provider.credential_type(), credential)
            .await?;

        account.updated_at = Utc::now();
        self.store.update_account(&account).await?;
        Ok(())
    }

    /// Delete an account and its credential.
    ///
    /// Fails with [`ControlError::AccountInUse`] while any deployment
    /// references the account. Destroyed deployments are kept as an audit
    /// trail, so they count too.
    pub async fn delete(&self, id: &AccountId) -> ControlResult<()> {
        let account = self.get(id).await?;

        let deployments = self.deployments.count_for_account(id).await?;
        if deployments > 0 {
            return Err(ControlError::AccountInUse {
                account_id: id.to_string(),
                deployments,
            });
        }

        self.vault
            .remove(id.as_str(), account.provider.credential_type())
            .await?;
        self.store.delete_account(id).await?;

        info!(account_id = %id, "account deleted");
        Ok(())
    }

    /// Decrypt an account's credential for an engine call.
    ///
    /// Only active accounts may be used.
    pub async fn credentials(&self, account: &Account) -> ControlResult<ProviderCredentials> {
        if account.status != AccountStatus::Active {
            return Err(ControlError::validation(format!(
                "account {} is {}",
                account.id, account.status
            )));
        }

        let secret = self
            .vault
            .fetch(account.id.as_str(), account.provider.credential_type())
            .await?;
        Ok(ProviderCredentials::new(account.provider, secret))
    }
}

impl fmt::Debug for AccountRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{
        DeploymentData, DeploymentId, DeploymentRecord, DeploymentRequest, DeploymentStatus,
        TemplateId, Variables,
    };
    use strata_vault::{Keyring, MasterKey, MemoryCredentials, VaultError};

    const AWS_CREDENTIAL: &str =
        r#"{"access_key_id":"AKIAEXAMPLE","secret_access_key":"wJalrXUtnFEMI"}"#;

    fn setup() -> (Arc<MemoryStore>, AccountRegistry) {
        let store = Arc::new(MemoryStore::new());
        let vault = Arc::new(CredentialVault::new(
            Arc::new(Keyring::new(1, MasterKey::generate())),
            Arc::new(MemoryCredentials::new()),
        ));
        let registry = AccountRegistry::new(store.clone(), store.clone(), vault);
        (store, registry)
    }

    fn new_account(id: &str) -> NewAccount {
        NewAccount {
            id: Some(AccountId::new(id)),
            name: "production".to_owned(),
            provider: CloudProvider::Aws,
            external_id: Some("123456789012".to_owned()),
            regions: vec!["eu-west-1".to_owned()],
        }
    }

    #[tokio::test]
    async fn register_and_fetch_credentials() {
        let (_, registry) = setup();
        let account = registry
            .register(new_account("a1"), &SecretValue::new(AWS_CREDENTIAL))
            .await
            .unwrap();
        assert_eq!(account.status, AccountStatus::Active);

        let creds = registry.credentials(&account).await.unwrap();
        assert_eq!(creds.secret().expose(), AWS_CREDENTIAL);
        assert_eq!(creds.document().unwrap()["access_key_id"], "AKIAEXAMPLE");

        let debug = format!("{creds:?}");
        assert!(!debug.contains("wJalrXUtnFEMI"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn register_rejects_incomplete_credentials() {
        let (_, registry) = setup();
        let err = registry
            .register(
                new_account("a1"),
                &SecretValue::new(r#"{"access_key_id":"AKIAEXAMPLE"}"#),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Validation(msg) if msg.contains("secret_access_key")));

        let err = registry
            .register(new_account("a1"), &SecretValue::new("not json at all"))
            .await
            .unwrap_err();
        let ControlError::Validation(msg) = err else {
            panic!("expected validation error");
        };
        assert!(!msg.contains("not json"));

        assert!(registry.get(&AccountId::new("a1")).await.is_err());
    }

    #[tokio::test]
    async fn inactive_accounts_cannot_be_used() {
        let (_, registry) = setup();
        let account = registry
            .register(new_account("a1"), &SecretValue::new(AWS_CREDENTIAL))
            .await
            .unwrap();

        let account = registry
            .set_status(
                &account.id,
                AccountStatus::Inactive,
                Some("suspended".to_owned()),
            )
            .await
            .unwrap();
        assert_eq!(account.status_reason.as_deref(), Some("suspended"));

        let err = registry.credentials(&account).await.unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));
    }

    #[tokio::test]
    async fn delete_refuses_referenced_accounts() {
        let (store, registry) = setup();
        let account = registry
            .register(new_account("a1"), &SecretValue::new(AWS_CREDENTIAL))
            .await
            .unwrap();

        let request = DeploymentRequest::new(
            TemplateId::new("t1"),
            account.id.clone(),
            Variables::new(),
        );
        let mut record = DeploymentRecord {
            data: DeploymentData::new(DeploymentId::new("d1"), &request, 1),
            status: DeploymentStatus::Applied,
            revision: 0,
        };
        store.insert(&record).await.unwrap();

        let err = registry.delete(&account.id).await.unwrap_err();
        assert!(matches!(
            err,
            ControlError::AccountInUse { deployments: 1, .. }
        ));

        // A destroyed deployment still references the account.
        record.status = DeploymentStatus::Destroyed;
        store.persist(&record).await.unwrap();

        let err = registry.delete(&account.id).await.unwrap_err();
        assert!(matches!(
            err,
            ControlError::AccountInUse { deployments: 1, .. }
        ));
        assert!(registry.credentials(&account).await.is_ok());
    }

    #[tokio::test]
    async fn delete_removes_unreferenced_account_and_credential() {
        let (_, registry) = setup();
        let account = registry
            .register(new_account("a1"), &SecretValue::new(AWS_CREDENTIAL))
            .await
            .unwrap();

        registry.delete(&account.id).await.unwrap();
        assert!(matches!(
            registry.get(&account.id).await.unwrap_err(),
            ControlError::AccountNotFound(_)
        ));

        let err = registry.credentials(&account).await.unwrap_err();
        assert!(matches!(err, ControlError::Vault(VaultError::NotFound { .. })));
    }

    #[tokio::test]
    async fn rotate_credential_replaces_secret() {
        let (_, registry) = setup();
        let account = registry
            .register(new_account("a1"), &SecretValue::new(AWS_CREDENTIAL))
            .await
            .unwrap();

        let replacement = r#"{"access_key_id":"AKIANEW","secret_access_key":"rotated"}"#;
        registry
            .rotate_credential(&account.id, &SecretValue::new(replacement))
            .await
            .unwrap();

        let creds = registry.credentials(&account).await.unwrap();
        assert_eq!(creds.secret().expose(), replacement);
    }
}
