//! SQLite-backed credential store.
//!
//! Stores the nonce, ciphertext and tag as separate BLOB columns alongside
//! the key version that sealed them. The database file is created with mode
//! 0600 and rejected on open if it has been loosened.

use std::fs;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, instrument};

use crate::error::{VaultError, VaultResult};
use crate::traits::CredentialStore;
use crate::types::{CredentialRecord, CredentialType, SealedSecret};

/// SQLite credential store.
#[derive(Clone)]
pub struct SqliteCredentials {
    pool: SqlitePool,
}

impl SqliteCredentials {
    /// Opens (or creates) the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> VaultResult<Self> {
        let pool = Self::connect_db(path.as_ref()).await?;
        Self::from_pool(pool).await
    }

    /// Uses an existing pool, creating the credentials table if needed.
    ///
    /// Lets the control plane keep credentials in the same database file as
    /// deployment state.
    pub async fn from_pool(pool: SqlitePool) -> VaultResult<Self> {
        Self::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn connect_db(path: &Path) -> VaultResult<SqlitePool> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                VaultError::Configuration(format!("failed to create database directory: {e}"))
            })?;
        }

        #[cfg(unix)]
        if !path.exists() {
            use std::os::unix::fs::OpenOptionsExt;
            fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(path)
                .map_err(|e| {
                    VaultError::Configuration(format!("failed to create database file: {e}"))
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| VaultError::Database(format!("failed to connect: {e}")))?;

        #[cfg(unix)]
        Self::check_db_permissions(path)?;

        Ok(pool)
    }

    #[cfg(unix)]
    fn check_db_permissions(path: &Path) -> VaultResult<()> {
        use std::os::unix::fs::MetadataExt;

        let metadata = fs::metadata(path).map_err(|e| {
            VaultError::Configuration(format!("failed to read database metadata: {e}"))
        })?;

        let mode = metadata.mode() & 0o777;

        if mode & 0o077 != 0 {
            return Err(VaultError::InsecureKeyFile {
                path: path.display().to_string(),
                mode,
            });
        }

        Ok(())
    }

    async fn init_schema(pool: &SqlitePool) -> VaultResult<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS credentials (
                account_id TEXT NOT NULL,
                credential_type TEXT NOT NULL,
                nonce BLOB NOT NULL,
                ciphertext BLOB NOT NULL,
                auth_tag BLOB NOT NULL,
                key_version INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (account_id, credential_type)
            )
            ",
        )
        .execute(pool)
        .await
        .map_err(|e| VaultError::Database(format!("failed to create table: {e}")))?;

        Ok(())
    }

    fn timestamp(at: DateTime<Utc>) -> String {
        at.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn parse_timestamp(raw: &str) -> VaultResult<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| VaultError::Database(format!("invalid timestamp in database: {e}")))
    }

    fn row_to_record(row: &SqliteRow) -> VaultResult<CredentialRecord> {
        let credential_type: String = row.try_get("credential_type").map_err(VaultError::database)?;
        let key_version: i64 = row.try_get("key_version").map_err(VaultError::database)?;
        let created_at: String = row.try_get("created_at").map_err(VaultError::database)?;
        let updated_at: String = row.try_get("updated_at").map_err(VaultError::database)?;

        Ok(CredentialRecord {
            account_id: row.try_get("account_id").map_err(VaultError::database)?,
            credential_type: credential_type.parse().map_err(VaultError::Database)?,
            sealed: SealedSecret {
                nonce: row.try_get("nonce").map_err(VaultError::database)?,
                ciphertext: row.try_get("ciphertext").map_err(VaultError::database)?,
                auth_tag: row.try_get("auth_tag").map_err(VaultError::database)?,
                key_version: u32::try_from(key_version).map_err(|_| {
                    VaultError::Database(format!("key version out of range: {key_version}"))
                })?,
            },
            created_at: Self::parse_timestamp(&created_at)?,
            updated_at: Self::parse_timestamp(&updated_at)?,
        })
    }

    async fn upsert<'e, E>(executor: E, record: &'e CredentialRecord) -> VaultResult<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        sqlx::query(
            r"
            INSERT INTO credentials
                (account_id, credential_type, nonce, ciphertext, auth_tag, key_version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (account_id, credential_type) DO UPDATE SET
                nonce = excluded.nonce,
                ciphertext = excluded.ciphertext,
                auth_tag = excluded.auth_tag,
                key_version = excluded.key_version,
                updated_at = excluded.updated_at
            ",
        )
        .bind(&record.account_id)
        .bind(record.credential_type.as_str())
        .bind(&record.sealed.nonce)
        .bind(&record.sealed.ciphertext)
        .bind(&record.sealed.auth_tag)
        .bind(i64::from(record.sealed.key_version))
        .bind(Self::timestamp(record.created_at))
        .bind(Self::timestamp(record.updated_at))
        .execute(executor)
        .await
        .map_err(|e| VaultError::Database(format!("failed to write credential: {e}")))?;

        Ok(())
    }
}

impl std::fmt::Debug for SqliteCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCredentials").finish_non_exhaustive()
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentials {
    #[instrument(skip(self), fields(account_id = %account_id, credential_type = %credential_type))]
    async fn get(
        &self,
        account_id: &str,
        credential_type: CredentialType,
    ) -> VaultResult<Option<CredentialRecord>> {
        let row = sqlx::query(
            r"
            SELECT account_id, credential_type, nonce, ciphertext, auth_tag, key_version, created_at, updated_at
            FROM credentials
            WHERE account_id = ? AND credential_type = ?
            ",
        )
        .bind(account_id)
        .bind(credential_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| VaultError::Database(format!("query failed: {e}")))?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    #[instrument(skip(self, record), fields(account_id = %record.account_id))]
    async fn put(&self, record: &CredentialRecord) -> VaultResult<()> {
        Self::upsert(&self.pool, record).await?;
        debug!(key_version = record.sealed.key_version, "stored credential");
        Ok(())
    }

    #[instrument(skip(self), fields(account_id = %account_id, credential_type = %credential_type))]
    async fn delete(
        &self,
        account_id: &str,
        credential_type: CredentialType,
    ) -> VaultResult<bool> {
        let result =
            sqlx::query("DELETE FROM credentials WHERE account_id = ? AND credential_type = ?")
                .bind(account_id)
                .bind(credential_type.as_str())
                .execute(&self.pool)
                .await
                .map_err(|e| VaultError::Database(format!("delete failed: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> VaultResult<Vec<CredentialRecord>> {
        let rows = sqlx::query(
            r"
            SELECT account_id, credential_type, nonce, ciphertext, auth_tag, key_version, created_at, updated_at
            FROM credentials
            ORDER BY account_id, credential_type
            ",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| VaultError::Database(format!("query failed: {e}")))?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn replace_all(&self, records: &[CredentialRecord]) -> VaultResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| VaultError::Database(format!("failed to begin transaction: {e}")))?;

        for record in records {
            Self::upsert(&mut *tx, record).await?;
        }

        tx.commit()
            .await
            .map_err(|e| VaultError::Database(format!("failed to commit: {e}")))?;

        debug!(count = records.len(), "replaced credentials");
        Ok(())
    }
}
