// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relational transaction manager over sqlx's `Any` driver.
//!
//! Entities of every type share one table keyed by `(kind, entity_key)`,
//! where `kind` is the logical type name and `entity_key` the encoded
//! [`RelKey`](crate::key::RelKey):
//!
//! ```sql
//! CREATE TABLE registry_entities (
//!   kind VARCHAR(128) NOT NULL,
//!   entity_key VARCHAR(512) NOT NULL,
//!   dual_key TEXT NOT NULL,      -- full DualKey wire form
//!   payload LONGTEXT NOT NULL,   -- JSON as text (sqlx Any driver limitation)
//!   version BIGINT NOT NULL,     -- kind version of the last write
//!   updated_at BIGINT NOT NULL,  -- transaction time, epoch millis
//!   PRIMARY KEY (kind, entity_key)
//! )
//! ```
//!
//! A second table, `registry_kind_versions`, holds a counter per entity type
//! bumped by every commit that touches the type. Row versions are drawn from
//! it, so they never repeat for a given row even across delete and re-insert.
//!
//! Reads go straight to the pool. Writes are buffered in the transaction and
//! flushed in one short database transaction at commit, after the same
//! optimistic checks the in-memory manager performs. Holding no connection
//! while user work runs lets a requires-new transaction commit while the
//! enclosing one is still open, even on SQLite.

use std::collections::BTreeMap;
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyConnection, AnyPool, Row};
use tracing::{debug, info, warn};

use super::pending::{PendingWrite, WriteIntent, WriteSet};
use super::scope::{ActiveTransactions, ManagerId};
use super::traits::{
    Backend, CommitListener, CommittedTransaction, IsolationLevel, Propagation, StorageError,
    TransactionManager, TransactionOptions, Work,
};
use crate::clock::{Clock, SystemClock};
use crate::entity::{Entity, Mutation};
use crate::key::{DualKey, EntityType, KindRegistry};
use crate::metrics;
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// `(type name, encoded RelKey)`
type SqlRowKey = (String, String);

struct SqlTransaction {
    time: DateTime<Utc>,
    isolation: IsolationLevel,
    read_only: bool,
    state: Mutex<WriteSet<SqlRowKey>>,
}

struct StoredRow {
    entity: Entity,
    version: u64,
}

fn backend_error(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Reads a TEXT column as String (SQLite) or bytes (MySQL LONGTEXT).
fn text_column(row: &AnyRow, column: &str) -> Result<String, StorageError> {
    row.try_get::<String, _>(column)
        .or_else(|_| {
            row.try_get::<Vec<u8>, _>(column)
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        })
        .map_err(backend_error)
}

pub struct SqlTransactionManager {
    id: ManagerId,
    pool: AnyPool,
    is_sqlite: bool,
    clock: Arc<dyn Clock>,
    listener: Option<Arc<dyn CommitListener>>,
    default_isolation: IsolationLevel,
    commit_lock: tokio::sync::Mutex<()>,
    /// Empty: stored rows are always parsed with their type as hint
    kinds: KindRegistry,
}

impl SqlTransactionManager {
    /// Connects with startup-mode retry (fails fast if config is wrong) and
    /// creates the schema if missing.
    pub async fn connect(connection_string: &str, max_connections: u32) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(backend_error)
        })
        .await?;

        let manager = Self {
            id: ManagerId::next(),
            pool,
            is_sqlite,
            clock: Arc::new(SystemClock),
            listener: None,
            default_isolation: IsolationLevel::RepeatableRead,
            commit_lock: tokio::sync::Mutex::new(()),
            kinds: KindRegistry::default(),
        };

        if is_sqlite {
            manager.enable_wal_mode().await?;
        }
        manager.init_schema().await?;
        info!(sqlite = is_sqlite, "Relational transaction manager connected");
        Ok(manager)
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn CommitListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    #[must_use]
    pub fn with_default_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.default_isolation = isolation;
        self
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    /// Readers don't block the commit writer in WAL mode.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: [&str; 2] = if self.is_sqlite {
            [
                r#"
                CREATE TABLE IF NOT EXISTS registry_entities (
                    kind TEXT NOT NULL,
                    entity_key TEXT NOT NULL,
                    dual_key TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (kind, entity_key)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS registry_kind_versions (
                    kind TEXT PRIMARY KEY,
                    version INTEGER NOT NULL
                )
                "#,
            ]
        } else {
            [
                r#"
                CREATE TABLE IF NOT EXISTS registry_entities (
                    kind VARCHAR(128) NOT NULL,
                    entity_key VARCHAR(512) NOT NULL,
                    dual_key TEXT NOT NULL,
                    payload LONGTEXT NOT NULL,
                    version BIGINT NOT NULL,
                    updated_at BIGINT NOT NULL,
                    PRIMARY KEY (kind, entity_key),
                    INDEX idx_updated_at (updated_at)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS registry_kind_versions (
                    kind VARCHAR(128) PRIMARY KEY,
                    version BIGINT NOT NULL
                )
                "#,
            ]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(backend_error)
            })
            .await?;
        }
        Ok(())
    }

    fn current(&self) -> Result<Arc<SqlTransaction>, StorageError> {
        ActiveTransactions::current::<SqlTransaction>(self.id).ok_or(StorageError::NotInTransaction)
    }

    fn row_key(key: &DualKey) -> Result<SqlRowKey, StorageError> {
        Ok((key.kind().name().to_string(), key.rel()?.encode()))
    }

    fn locking(&self, sql: &str) -> String {
        if self.is_sqlite {
            sql.to_string()
        } else {
            format!("{sql} FOR UPDATE")
        }
    }

    fn decode_row(&self, row: &AnyRow, kind: EntityType) -> Result<StoredRow, StorageError> {
        let key = DualKey::parse_with_hint(&text_column(row, "dual_key")?, &self.kinds, kind)?;
        let payload = serde_json::from_str(&text_column(row, "payload")?)?;
        let version: i64 = row.try_get("version").map_err(backend_error)?;
        Ok(StoredRow {
            entity: Entity::new(key, payload),
            version: version as u64,
        })
    }

    async fn fetch_row(&self, key: &DualKey) -> Result<Option<StoredRow>, StorageError> {
        let (kind, entity_key) = Self::row_key(key)?;
        let row = sqlx::query(
            "SELECT dual_key, payload, version FROM registry_entities WHERE kind = ? AND entity_key = ?",
        )
        .bind(&kind)
        .bind(&entity_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_error)?;
        row.map(|row| self.decode_row(&row, key.kind())).transpose()
    }

    async fn kind_version(&self, kind: EntityType) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT version FROM registry_kind_versions WHERE kind = ?")
            .bind(kind.name())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_error)?;
        match row {
            Some(row) => Ok(row.try_get::<i64, _>("version").map_err(backend_error)? as u64),
            None => Ok(0),
        }
    }

    /// Value of `key` as seen by `tx`, recording the committed version read.
    async fn visible(&self, tx: &SqlTransaction, key: &DualKey) -> Result<Option<Entity>, StorageError> {
        let row_key = Self::row_key(key)?;
        if let Some(pending) = tx.state.lock().pending(&row_key) {
            return Ok(pending.cloned());
        }
        let committed = self.fetch_row(key).await?;
        if !tx.read_only {
            tx.state
                .lock()
                .record_read(&row_key, committed.as_ref().map(|r| r.version));
        }
        Ok(committed.map(|r| r.entity))
    }

    async fn write(&self, intent: WriteIntent, mutation: Mutation) -> Result<(), StorageError> {
        let tx = self.current()?;
        if tx.read_only {
            return Err(StorageError::WriteInReadOnlyTransaction(mutation.op_name().to_string()));
        }
        let row_key = Self::row_key(mutation.key())?;
        let exists = self.visible(&tx, mutation.key()).await?.is_some();
        let staged = tx.state.lock().stage(row_key, intent, mutation, exists);
        staged
    }

    async fn commit(&self, tx: &SqlTransaction) -> Result<(), StorageError> {
        let state = std::mem::take(&mut *tx.state.lock());
        if tx.read_only || state.log.is_empty() {
            return Ok(());
        }

        // Serializes flush and listener notification so listeners see commit order.
        let _guard = self.commit_lock.lock().await;
        let mut db = self.pool.begin().await.map_err(backend_error)?;
        if let Err(e) = self.flush(&mut db, tx, &state).await {
            if let Err(rollback) = db.rollback().await {
                warn!(error = %rollback, "Rollback after failed flush also failed");
            }
            return Err(e);
        }
        db.commit().await.map_err(backend_error)?;

        if let Some(listener) = &self.listener {
            listener.on_commit(&CommittedTransaction {
                backend: Backend::Relational,
                transaction_time: tx.time,
                mutations: state.log,
            });
        }
        Ok(())
    }

    async fn flush(
        &self,
        conn: &mut AnyConnection,
        tx: &SqlTransaction,
        state: &WriteSet<SqlRowKey>,
    ) -> Result<(), StorageError> {
        let select_row = self.locking("SELECT version FROM registry_entities WHERE kind = ? AND entity_key = ?");
        let select_kind = self.locking("SELECT version FROM registry_kind_versions WHERE kind = ?");

        if tx.isolation >= IsolationLevel::RepeatableRead {
            for ((kind, entity_key), seen) in &state.reads {
                let now = sqlx::query(&select_row)
                    .bind(kind)
                    .bind(entity_key)
                    .fetch_optional(&mut *conn)
                    .await
                    .map_err(backend_error)?
                    .map(|row| row.try_get::<i64, _>("version").map(|v| v as u64))
                    .transpose()
                    .map_err(backend_error)?;
                if now != *seen {
                    return Err(StorageError::Conflict(format!(
                        "{kind} {entity_key} changed since it was read"
                    )));
                }
            }
        }

        // Current version of every kind scanned or written
        let mut kind_versions: BTreeMap<&'static str, u64> = BTreeMap::new();
        let touched = state
            .scans
            .keys()
            .copied()
            .chain(state.writes.values().map(PendingWrite::kind));
        for kind in touched {
            if kind_versions.contains_key(kind.name()) {
                continue;
            }
            let version = sqlx::query(&select_kind)
                .bind(kind.name())
                .fetch_optional(&mut *conn)
                .await
                .map_err(backend_error)?
                .map(|row| row.try_get::<i64, _>("version").map(|v| v as u64))
                .transpose()
                .map_err(backend_error)?
                .unwrap_or(0);
            kind_versions.insert(kind.name(), version);
        }

        if tx.isolation == IsolationLevel::Serializable {
            for (kind, seen) in &state.scans {
                if kind_versions.get(kind.name()).copied().unwrap_or(0) != *seen {
                    return Err(StorageError::Conflict(format!("{kind} changed since it was scanned")));
                }
            }
        }

        let written: BTreeMap<&'static str, u64> = state
            .writes
            .values()
            .map(|w| {
                let kind = w.kind().name();
                (kind, kind_versions.get(kind).copied().unwrap_or(0) + 1)
            })
            .collect();
        let updated_at = tx.time.timestamp_millis();

        for ((kind, entity_key), write) in &state.writes {
            let version = written.get(kind.as_str()).copied().unwrap_or(1) as i64;
            match write {
                PendingWrite::Insert(entity) => {
                    let result = sqlx::query(
                        "INSERT INTO registry_entities (kind, entity_key, dual_key, payload, version, updated_at) \
                         VALUES (?, ?, ?, ?, ?, ?)",
                    )
                    .bind(kind)
                    .bind(entity_key)
                    .bind(entity.key().stringify())
                    .bind(serde_json::to_string(entity.payload())?)
                    .bind(version)
                    .bind(updated_at)
                    .execute(&mut *conn)
                    .await;
                    match result {
                        Ok(_) => {}
                        Err(e) if is_unique_violation(&e) => {
                            return Err(StorageError::DuplicateKey(entity.key().stringify()));
                        }
                        Err(e) => return Err(backend_error(e)),
                    }
                }
                PendingWrite::Update(entity) => {
                    let result = sqlx::query(
                        "UPDATE registry_entities SET dual_key = ?, payload = ?, version = ?, updated_at = ? \
                         WHERE kind = ? AND entity_key = ?",
                    )
                    .bind(entity.key().stringify())
                    .bind(serde_json::to_string(entity.payload())?)
                    .bind(version)
                    .bind(updated_at)
                    .bind(kind)
                    .bind(entity_key)
                    .execute(&mut *conn)
                    .await
                    .map_err(backend_error)?;
                    if result.rows_affected() == 0 {
                        return Err(StorageError::NotFound(entity.key().stringify()));
                    }
                }
                PendingWrite::Put(entity) => {
                    sqlx::query(self.upsert_sql())
                        .bind(kind)
                        .bind(entity_key)
                        .bind(entity.key().stringify())
                        .bind(serde_json::to_string(entity.payload())?)
                        .bind(version)
                        .bind(updated_at)
                        .execute(&mut *conn)
                        .await
                        .map_err(backend_error)?;
                }
                PendingWrite::Delete(_) => {
                    sqlx::query("DELETE FROM registry_entities WHERE kind = ? AND entity_key = ?")
                        .bind(kind)
                        .bind(entity_key)
                        .execute(&mut *conn)
                        .await
                        .map_err(backend_error)?;
                }
            }
        }

        let bump = if self.is_sqlite {
            "INSERT INTO registry_kind_versions (kind, version) VALUES (?, ?) \
             ON CONFLICT(kind) DO UPDATE SET version = excluded.version"
        } else {
            "INSERT INTO registry_kind_versions (kind, version) VALUES (?, ?) \
             ON DUPLICATE KEY UPDATE version = VALUES(version)"
        };
        for (kind, version) in written {
            sqlx::query(bump)
                .bind(kind)
                .bind(version as i64)
                .execute(&mut *conn)
                .await
                .map_err(backend_error)?;
        }
        Ok(())
    }

    fn upsert_sql(&self) -> &'static str {
        if self.is_sqlite {
            "INSERT INTO registry_entities (kind, entity_key, dual_key, payload, version, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(kind, entity_key) DO UPDATE SET \
                dual_key = excluded.dual_key, \
                payload = excluded.payload, \
                version = excluded.version, \
                updated_at = excluded.updated_at"
        } else {
            "INSERT INTO registry_entities (kind, entity_key, dual_key, payload, version, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE \
                dual_key = VALUES(dual_key), \
                payload = VALUES(payload), \
                version = VALUES(version), \
                updated_at = VALUES(updated_at)"
        }
    }
}

#[async_trait]
impl TransactionManager for SqlTransactionManager {
    fn backend(&self) -> Backend {
        Backend::Relational
    }

    fn in_transaction(&self) -> bool {
        self.current().is_ok()
    }

    fn transaction_time(&self) -> Result<DateTime<Utc>, StorageError> {
        Ok(self.current()?.time)
    }

    async fn execute<'a>(
        &'a self,
        options: TransactionOptions,
        work: Work<'a>,
    ) -> Result<(), StorageError> {
        if options.propagation == Propagation::Join && self.in_transaction() {
            return work().await;
        }

        let tx = Arc::new(SqlTransaction {
            time: self.clock.now(),
            isolation: options.isolation.unwrap_or(self.default_isolation),
            read_only: options.read_only,
            state: Mutex::new(WriteSet::default()),
        });
        let result = ActiveTransactions::enter(self.id, Arc::clone(&tx), work()).await;
        let outcome = match result {
            Ok(()) => self.commit(&tx).await,
            Err(e) => Err(e),
        };
        match &outcome {
            Ok(()) => metrics::record_transaction(Backend::Relational.as_str(), "committed"),
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "Relational transaction aborted by conflict");
                metrics::record_transaction(Backend::Relational.as_str(), "conflict");
            }
            Err(e) => {
                debug!(error = %e, "Relational transaction rolled back");
                metrics::record_transaction(Backend::Relational.as_str(), "rolled_back");
            }
        }
        outcome
    }

    async fn load(&self, key: &DualKey) -> Result<Option<Entity>, StorageError> {
        let tx = self.current()?;
        self.visible(&tx, key).await
    }

    async fn load_all(&self, kind: EntityType) -> Result<Vec<Entity>, StorageError> {
        let tx = self.current()?;
        if !tx.read_only {
            let version = self.kind_version(kind).await?;
            tx.state.lock().record_scan(kind, version);
        }
        let rows = sqlx::query(
            "SELECT entity_key, dual_key, payload, version FROM registry_entities WHERE kind = ? ORDER BY entity_key",
        )
        .bind(kind.name())
        .fetch_all(&self.pool)
        .await
        .map_err(backend_error)?;

        let mut found = BTreeMap::new();
        for row in &rows {
            let entity_key = text_column(row, "entity_key")?;
            let stored = self.decode_row(row, kind)?;
            found.insert((kind.name().to_string(), entity_key), stored.entity);
        }
        tx.state.lock().overlay(kind, &mut found);
        Ok(found.into_values().collect())
    }

    async fn insert(&self, entity: Entity) -> Result<(), StorageError> {
        self.write(WriteIntent::Insert, Mutation::Upsert(entity)).await
    }

    async fn update(&self, entity: Entity) -> Result<(), StorageError> {
        self.write(WriteIntent::Update, Mutation::Upsert(entity)).await
    }

    async fn upsert(&self, entity: Entity) -> Result<(), StorageError> {
        self.write(WriteIntent::Upsert, Mutation::Upsert(entity)).await
    }

    async fn delete(&self, key: &DualKey) -> Result<(), StorageError> {
        self.write(WriteIntent::Delete, Mutation::Delete(key.clone())).await
    }
}
