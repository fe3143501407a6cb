//! In-memory store for testing.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::{ControlError, ControlResult};
use crate::types::{Account, AccountId, DeploymentId, DeploymentRecord, Template, TemplateId};

use super::{
    AccountFilter, AccountStore, DeploymentFilter, DeploymentStore, TemplateFilter, TemplateStore,
};

/// In-memory store for testing.
///
/// Data is lost when the process exits. Sharing one `MemoryStore` between
/// two orchestrators is how tests simulate a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    deployments: RwLock<HashMap<String, DeploymentRecord>>,
    templates: RwLock<BTreeMap<(String, u32), Template>>,
    accounts: RwLock<HashMap<String, Account>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn read<T>(lock: &RwLock<T>) -> ControlResult<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| ControlError::internal("lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> ControlResult<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| ControlError::internal("lock poisoned"))
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn insert(&self, record: &DeploymentRecord) -> ControlResult<()> {
        let mut deployments = write(&self.deployments)?;

        let key = record.data.id.as_str().to_owned();
        if deployments.contains_key(&key) {
            return Err(ControlError::AlreadyExists(format!("deployment {key}")));
        }

        let mut stored = record.clone();
        stored.revision = 0;
        deployments.insert(key, stored);
        Ok(())
    }

    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        let deployments = read(&self.deployments)?;
        Ok(deployments.get(id.as_str()).cloned())
    }

    async fn persist(&self, record: &DeploymentRecord) -> ControlResult<u64> {
        let mut deployments = write(&self.deployments)?;

        let stored = deployments
            .get_mut(record.data.id.as_str())
            .ok_or_else(|| ControlError::DeploymentNotFound(record.data.id.to_string()))?;

        if stored.revision != record.revision {
            return Err(ControlError::conflict(format!(
                "deployment {} was modified concurrently (expected revision {}, found {})",
                record.data.id, record.revision, stored.revision
            )));
        }

        let revision = record.revision + 1;
        *stored = record.clone();
        stored.revision = revision;
        Ok(revision)
    }

    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>> {
        let deployments = read(&self.deployments)?;

        let mut results: Vec<_> = deployments
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();

        results.sort_by(|a, b| b.data.created_at.cmp(&a.data.created_at));

        let offset = filter.offset.unwrap_or(0) as usize;
        let limit = filter.limit.map_or(usize::MAX, |l| l as usize);
        Ok(results.into_iter().skip(offset).take(limit).collect())
    }

    async fn recover_incomplete(&self) -> ControlResult<Vec<DeploymentId>> {
        let deployments = read(&self.deployments)?;

        let mut ids: Vec<_> = deployments
            .values()
            .filter(|r| r.status.is_transient())
            .map(|r| r.data.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn count_for_account(&self, account_id: &AccountId) -> ControlResult<usize> {
        let deployments = read(&self.deployments)?;
        Ok(deployments
            .values()
            .filter(|r| &r.data.account_id == account_id)
            .count())
    }
}

#[async_trait]
impl TemplateStore for MemoryStore {
    async fn insert_template(&self, template: &Template) -> ControlResult<()> {
        let mut templates = write(&self.templates)?;

        let key = (template.id.as_str().to_owned(), template.version);
        if templates.contains_key(&key) {
            return Err(ControlError::AlreadyExists(format!(
                "template {}",
                template.reference()
            )));
        }
        templates.insert(key, template.clone());
        Ok(())
    }

    async fn get_template(
        &self,
        id: &TemplateId,
        version: Option<u32>,
    ) -> ControlResult<Option<Template>> {
        let templates = read(&self.templates)?;

        let found = match version {
            Some(v) => templates.get(&(id.as_str().to_owned(), v)),
            None => templates
                .range((id.as_str().to_owned(), 0)..=(id.as_str().to_owned(), u32::MAX))
                .next_back()
                .map(|(_, t)| t),
        };
        Ok(found.cloned())
    }

    async fn list_templates(&self, filter: &TemplateFilter) -> ControlResult<Vec<Template>> {
        let templates = read(&self.templates)?;

        // Keys are ordered by (id, version), so the last entry per id wins.
        let mut latest: BTreeMap<&str, &Template> = BTreeMap::new();
        for ((id, _), template) in templates.iter() {
            latest.insert(id.as_str(), template);
        }

        Ok(latest
            .into_values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }

    async fn template_versions(&self, id: &TemplateId) -> ControlResult<Vec<u32>> {
        let templates = read(&self.templates)?;
        Ok(templates
            .range((id.as_str().to_owned(), 0)..=(id.as_str().to_owned(), u32::MAX))
            .map(|((_, v), _)| *v)
            .collect())
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn insert_account(&self, account: &Account) -> ControlResult<()> {
        let mut accounts = write(&self.accounts)?;

        let key = account.id.as_str().to_owned();
        if accounts.contains_key(&key) {
            return Err(ControlError::AlreadyExists(format!("account {key}")));
        }
        accounts.insert(key, account.clone());
        Ok(())
    }

    async fn get_account(&self, id: &AccountId) -> ControlResult<Option<Account>> {
        let accounts = read(&self.accounts)?;
        Ok(accounts.get(id.as_str()).cloned())
    }

    async fn update_account(&self, account: &Account) -> ControlResult<()> {
        let mut accounts = write(&self.accounts)?;

        let stored = accounts
            .get_mut(account.id.as_str())
            .ok_or_else(|| ControlError::AccountNotFound(account.id.to_string()))?;
        *stored = account.clone();
        Ok(())
    }

    async fn list_accounts(&self, filter: &AccountFilter) -> ControlResult<Vec<Account>> {
        let accounts = read(&self.accounts)?;

        let mut results: Vec<_> = accounts
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        results.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(results)
    }

    async fn delete_account(&self, id: &AccountId) -> ControlResult<bool> {
        let mut accounts = write(&self.accounts)?;
        Ok(accounts.remove(id.as_str()).is_some())
    }
}
