//! SQLite store implementation.
//!
//! Each record is kept as a JSON document alongside the handful of columns
//! that queries filter on. The columns are authoritative for status and
//! revision; the document carries everything else.

use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use tokio::fs;

use crate::error::{ControlError, ControlResult};
use crate::types::{Account, AccountId, DeploymentId, DeploymentRecord, Template, TemplateId};

use super::{
    AccountFilter, AccountStore, DeploymentFilter, DeploymentStore, TemplateFilter, TemplateStore,
};

/// SQLite-backed store for deployments, templates and accounts.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    ///
    /// A new file is created with mode 0600, since the same database also
    /// holds sealed credentials.
    pub async fn open(path: impl AsRef<Path>) -> ControlResult<Self> {
        Self::open_with(path, 5, Duration::from_secs(5)).await
    }

    /// Open (or create) the database at `path` with explicit pool settings.
    pub async fn open_with(
        path: impl AsRef<Path>,
        max_connections: u32,
        busy_timeout: Duration,
    ) -> ControlResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                ControlError::Config(format!("failed to create database directory: {e}"))
            })?;
        }

        #[cfg(unix)]
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .await
        {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(ControlError::Config(format!(
                    "failed to create database file: {e}"
                )))
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Connect using a sqlx URL such as `sqlite::memory:`.
    pub async fn connect(url: &str) -> ControlResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await?;
        Self::from_pool(pool).await
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: SqlitePool) -> ControlResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// The underlying pool, for sharing the database with the vault.
    #[must_use]
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    /// Ensure the required tables exist.
    async fn ensure_schema(&self) -> ControlResult<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                account_id TEXT NOT NULL,
                template_id TEXT NOT NULL,
                revision INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                record TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_deployments_status
            ON deployments (status)
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_deployments_account
            ON deployments (account_id)
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS templates (
                id TEXT NOT NULL,
                version INTEGER NOT NULL,
                provider TEXT NOT NULL,
                service_type TEXT NOT NULL,
                created_at TEXT NOT NULL,
                record TEXT NOT NULL,
                PRIMARY KEY (id, version)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                record TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn timestamp(at: DateTime<Utc>) -> String {
        at.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn revision_param(revision: u64) -> ControlResult<i64> {
        i64::try_from(revision)
            .map_err(|_| ControlError::internal(format!("revision {revision} out of range")))
    }

    /// Parse a row into a DeploymentRecord.
    fn row_to_record(row: &SqliteRow) -> ControlResult<DeploymentRecord> {
        let json: String = row.try_get("record")?;
        let status: String = row.try_get("status")?;
        let revision: i64 = row.try_get("revision")?;

        let mut record: DeploymentRecord = serde_json::from_str(&json).map_err(|e| {
            ControlError::Serialisation(format!("failed to deserialise deployment: {e}"))
        })?;
        record.status = status.parse().map_err(|e| {
            ControlError::Serialisation(format!("failed to parse status '{status}': {e}"))
        })?;
        record.revision = u64::try_from(revision)
            .map_err(|_| ControlError::Serialisation(format!("negative revision {revision}")))?;
        Ok(record)
    }

    fn row_to_document<T: serde::de::DeserializeOwned>(
        row: &SqliteRow,
        what: &str,
    ) -> ControlResult<T> {
        let json: String = row.try_get("record")?;
        serde_json::from_str(&json)
            .map_err(|e| ControlError::Serialisation(format!("failed to deserialise {what}: {e}")))
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl DeploymentStore for SqliteStore {
    async fn insert(&self, record: &DeploymentRecord) -> ControlResult<()> {
        let mut stored = record.clone();
        stored.revision = 0;
        let json = serde_json::to_string(&stored)?;

        sqlx::query(
            r"
            INSERT INTO deployments (
                id, status, account_id, template_id, revision,
                created_at, updated_at, record
            )
            VALUES (?, ?, ?, ?, 0, ?, ?, ?)
            ",
        )
        .bind(record.data.id.as_str())
        .bind(record.status.as_str())
        .bind(record.data.account_id.as_str())
        .bind(record.data.template_id.as_str())
        .bind(Self::timestamp(record.data.created_at))
        .bind(Self::timestamp(record.data.updated_at))
        .bind(json)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ControlError::AlreadyExists(format!("deployment {}", record.data.id))
            } else {
                ControlError::Database(e)
            }
        })?;

        Ok(())
    }

    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        let row = sqlx::query(
            r"
            SELECT status, revision, record
            FROM deployments
            WHERE id = ?
            ",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(Self::row_to_record(&r)?)),
            None => Ok(None),
        }
    }

    async fn persist(&self, record: &DeploymentRecord) -> ControlResult<u64> {
        let expected = Self::revision_param(record.revision)?;
        let next = record.revision + 1;

        let mut stored = record.clone();
        stored.revision = next;
        let json = serde_json::to_string(&stored)?;

        let result = sqlx::query(
            r"
            UPDATE deployments
            SET status = ?, revision = revision + 1, updated_at = ?, record = ?
            WHERE id = ? AND revision = ?
            ",
        )
        .bind(record.status.as_str())
        .bind(Self::timestamp(record.data.updated_at))
        .bind(json)
        .bind(record.data.id.as_str())
        .bind(expected)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let current: Option<i64> =
                sqlx::query_scalar("SELECT revision FROM deployments WHERE id = ?")
                    .bind(record.data.id.as_str())
                    .fetch_optional(&self.pool)
                    .await?;

            return Err(match current {
                Some(found) => ControlError::conflict(format!(
                    "deployment {} was modified concurrently (expected revision {}, found {found})",
                    record.data.id, record.revision
                )),
                None => ControlError::DeploymentNotFound(record.data.id.to_string()),
            });
        }

        Ok(next)
    }

    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>> {
        let mut query: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT status, revision, record FROM deployments WHERE 1 = 1");

        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(account_id) = &filter.account_id {
            query.push(" AND account_id = ").push_bind(account_id.as_str());
        }
        if let Some(template_id) = &filter.template_id {
            query.push(" AND template_id = ").push_bind(template_id.as_str());
        }

        query.push(" ORDER BY created_at DESC, id DESC");

        // SQLite needs a LIMIT before OFFSET; -1 means unbounded.
        query
            .push(" LIMIT ")
            .push_bind(filter.limit.map_or(-1, i64::from));
        if let Some(offset) = filter.offset {
            query.push(" OFFSET ").push_bind(i64::from(offset));
        }

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn recover_incomplete(&self) -> ControlResult<Vec<DeploymentId>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r"
            SELECT id FROM deployments
            WHERE status IN ('planning', 'applying', 'destroying')
            ORDER BY id
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(DeploymentId::new).collect())
    }

    async fn count_for_account(&self, account_id: &AccountId) -> ControlResult<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM deployments WHERE account_id = ?",
        )
        .bind(account_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(usize::try_from(count).unwrap_or(0))
    }
}

#[async_trait]
impl TemplateStore for SqliteStore {
    async fn insert_template(&self, template: &Template) -> ControlResult<()> {
        let json = serde_json::to_string(template)?;

        sqlx::query(
            r"
            INSERT INTO templates (id, version, provider, service_type, created_at, record)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(template.id.as_str())
        .bind(i64::from(template.version))
        .bind(template.provider.as_str())
        .bind(&template.service_type)
        .bind(Self::timestamp(template.created_at))
        .bind(json)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ControlError::AlreadyExists(format!("template {}", template.reference()))
            } else {
                ControlError::Database(e)
            }
        })?;

        Ok(())
    }

    async fn get_template(
        &self,
        id: &TemplateId,
        version: Option<u32>,
    ) -> ControlResult<Option<Template>> {
        let row = match version {
            Some(v) => {
                sqlx::query("SELECT record FROM templates WHERE id = ? AND version = ?")
                    .bind(id.as_str())
                    .bind(i64::from(v))
                    .fetch_optional(&self.pool)
                    .await?
            }
            None => {
                sqlx::query(
                    "SELECT record FROM templates WHERE id = ? ORDER BY version DESC LIMIT 1",
                )
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?
            }
        };

        row.map(|r| Self::row_to_document(&r, "template"))
            .transpose()
    }

    async fn list_templates(&self, filter: &TemplateFilter) -> ControlResult<Vec<Template>> {
        let mut query: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            r"
            SELECT t.record FROM templates t
            WHERE t.version = (SELECT MAX(version) FROM templates WHERE id = t.id)
            ",
        );

        if let Some(provider) = filter.provider {
            query.push(" AND t.provider = ").push_bind(provider.as_str());
        }
        if let Some(service_type) = &filter.service_type {
            query
                .push(" AND t.service_type = ")
                .push_bind(service_type.as_str());
        }
        query.push(" ORDER BY t.id");

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| Self::row_to_document(r, "template"))
            .collect()
    }

    async fn template_versions(&self, id: &TemplateId) -> ControlResult<Vec<u32>> {
        let versions: Vec<i64> =
            sqlx::query_scalar("SELECT version FROM templates WHERE id = ? ORDER BY version")
                .bind(id.as_str())
                .fetch_all(&self.pool)
                .await?;

        versions
            .into_iter()
            .map(|v| {
                u32::try_from(v).map_err(|_| {
                    ControlError::Serialisation(format!("template version {v} out of range"))
                })
            })
            .collect()
    }
}

#[async_trait]
impl AccountStore for SqliteStore {
    async fn insert_account(&self, account: &Account) -> ControlResult<()> {
        let json = serde_json::to_string(account)?;

        sqlx::query(
            r"
            INSERT INTO accounts (id, provider, status, created_at, record)
            VALUES (?, ?, ?, ?, ?)
            ",
        )
        .bind(account.id.as_str())
        .bind(account.provider.as_str())
        .bind(account.status.as_str())
        .bind(Self::timestamp(account.created_at))
        .bind(json)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ControlError::AlreadyExists(format!("account {}", account.id))
            } else {
                ControlError::Database(e)
            }
        })?;

        Ok(())
    }

    async fn get_account(&self, id: &AccountId) -> ControlResult<Option<Account>> {
        let row = sqlx::query("SELECT record FROM accounts WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Self::row_to_document(&r, "account"))
            .transpose()
    }

    async fn update_account(&self, account: &Account) -> ControlResult<()> {
        let json = serde_json::to_string(account)?;

        let result = sqlx::query("UPDATE accounts SET status = ?, record = ? WHERE id = ?")
            .bind(account.status.as_str())
            .bind(json)
            .bind(account.id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::AccountNotFound(account.id.to_string()));
        }
        Ok(())
    }

    async fn list_accounts(&self, filter: &AccountFilter) -> ControlResult<Vec<Account>> {
        let mut query: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT record FROM accounts WHERE 1 = 1");

        if let Some(provider) = filter.provider {
            query.push(" AND provider = ").push_bind(provider.as_str());
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        query.push(" ORDER BY created_at, id");

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| Self::row_to_document(r, "account"))
            .collect()
    }

    async fn delete_account(&self, id: &AccountId) -> ControlResult<bool> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        AccountStatus, CloudProvider, DeploymentData, DeploymentRequest, DeploymentStatus,
        Variables,
    };
    use serde_json::json;

    fn record(id: &str, status: DeploymentStatus) -> DeploymentRecord {
        let request = DeploymentRequest::new(
            TemplateId::new("t1"),
            AccountId::new("a1"),
            Variables::from([("instance_type".to_owned(), json!("t3.micro"))]),
        );
        DeploymentRecord {
            data: DeploymentData::new(DeploymentId::new(id), &request, 1),
            status,
            revision: 0,
        }
    }

    async fn open_temp() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("strata.db")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn deployment_round_trip_and_revisions() {
        let (_dir, store) = open_temp().await;
        let mut rec = record("d1", DeploymentStatus::Planning);
        store.insert(&rec).await.unwrap();

        rec.status = DeploymentStatus::Planned;
        rec.revision = store.persist(&rec).await.unwrap();
        assert_eq!(rec.revision, 1);

        let fetched = store.get(&DeploymentId::new("d1")).await.unwrap().unwrap();
        assert_eq!(fetched.status, DeploymentStatus::Planned);
        assert_eq!(fetched.revision, 1);
        assert_eq!(fetched.data.variables["instance_type"], "t3.micro");

        let mut stale = rec.clone();
        stale.revision = 0;
        let err = store.persist(&stale).await.unwrap_err();
        assert!(matches!(err, ControlError::Conflict(_)));

        let err = store.insert(&rec).await.unwrap_err();
        assert!(matches!(err, ControlError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn persist_missing_is_not_found() {
        let (_dir, store) = open_temp().await;
        let err = store
            .persist(&record("ghost", DeploymentStatus::Planned))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::DeploymentNotFound(_)));
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.db");

        {
            let store = SqliteStore::open(&path).await.unwrap();
            store
                .insert(&record("d1", DeploymentStatus::Applying))
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path).await.unwrap();
        let ids = store.recover_incomplete().await.unwrap();
        assert_eq!(ids, vec![DeploymentId::new("d1")]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn database_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.db");
        let _store = SqliteStore::open(&path).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[tokio::test]
    async fn list_filters_and_paginates() {
        let (_dir, store) = open_temp().await;
        for (id, status) in [
            ("d1", DeploymentStatus::Applied),
            ("d2", DeploymentStatus::Planned),
            ("d3", DeploymentStatus::Destroyed),
        ] {
            store.insert(&record(id, status)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let all = store.list(&DeploymentFilter::new()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|r| r.data.id.as_str()).collect();
        assert_eq!(ids, vec!["d3", "d2", "d1"]);

        let applied = store
            .list(&DeploymentFilter::new().with_status(DeploymentStatus::Applied))
            .await
            .unwrap();
        assert_eq!(applied.len(), 1);

        let page = store
            .list(&DeploymentFilter::new().with_limit(1).with_offset(1))
            .await
            .unwrap();
        assert_eq!(page[0].data.id.as_str(), "d2");

        let offset_only = store
            .list(&DeploymentFilter::new().with_offset(2))
            .await
            .unwrap();
        assert_eq!(offset_only.len(), 1);

        assert_eq!(
            store.count_for_account(&AccountId::new("a1")).await.unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn templates_and_accounts() {
        let (_dir, store) = open_temp().await;
        let now = Utc::now();

        for version in 1..=2 {
            store
                .insert_template(&Template {
                    id: TemplateId::new("t1"),
                    version,
                    name: "web".to_owned(),
                    provider: CloudProvider::Aws,
                    service_type: "compute".to_owned(),
                    description: None,
                    body: String::new(),
                    variables: vec![],
                    created_at: now,
                })
                .await
                .unwrap();
        }

        let latest = store
            .get_template(&TemplateId::new("t1"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(
            store.template_versions(&TemplateId::new("t1")).await.unwrap(),
            vec![1, 2]
        );
        assert_eq!(
            store
                .list_templates(&TemplateFilter::new().with_provider(CloudProvider::Aws))
                .await
                .unwrap()
                .len(),
            1
        );

        let mut account = Account {
            id: AccountId::new("a1"),
            name: "prod".to_owned(),
            provider: CloudProvider::Aws,
            external_id: Some("123456789012".to_owned()),
            regions: vec!["eu-west-1".to_owned()],
            status: AccountStatus::Active,
            status_reason: None,
            created_at: now,
            updated_at: now,
        };
        store.insert_account(&account).await.unwrap();

        account.status = AccountStatus::Inactive;
        store.update_account(&account).await.unwrap();

        let inactive = store
            .list_accounts(&AccountFilter::new().with_status(AccountStatus::Inactive))
            .await
            .unwrap();
        assert_eq!(inactive, vec![account.clone()]);

        assert!(store.delete_account(&account.id).await.unwrap());
        assert!(!store.delete_account(&account.id).await.unwrap());
        assert!(store.get_account(&account.id).await.unwrap().is_none());
    }
}
