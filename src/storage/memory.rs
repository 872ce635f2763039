// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory transaction manager.
//!
//! Stores entities under the key representation native to the configured
//! [`Backend`]: document managers index by [`DocKey`], relational managers
//! by `(entity type, RelKey)`. Writes are buffered per transaction and
//! applied atomically at commit under a single write lock, after optimistic
//! validation:
//!
//! - inserts must still find their key free, updates must still find it taken;
//! - `RepeatableRead` and above re-check the version of every key read;
//! - `Serializable` additionally re-checks every entity type scanned.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::pending::{PendingWrite, WriteIntent, WriteSet};
use super::scope::{ActiveTransactions, ManagerId};
use super::traits::{
    Backend, CommitListener, CommittedTransaction, IsolationLevel, Propagation, StorageError,
    TransactionManager, TransactionOptions, Work,
};
use crate::clock::{Clock, SystemClock};
use crate::entity::{Entity, Mutation};
use crate::key::{DocKey, DualKey, EntityType, RelKey};
use crate::metrics;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum RowKey {
    Doc(DocKey),
    Rel { kind: &'static str, key: RelKey },
}

#[derive(Debug, Clone)]
struct Row {
    entity: Entity,
    version: u64,
}

#[derive(Debug, Default)]
struct Tables {
    rows: BTreeMap<RowKey, Row>,
    kind_versions: HashMap<EntityType, u64>,
    next_version: u64,
}

#[derive(Debug)]
struct MemoryTransaction {
    time: DateTime<Utc>,
    isolation: IsolationLevel,
    read_only: bool,
    state: Mutex<WriteSet<RowKey>>,
}

impl MemoryTransaction {
    fn check_writable(&self, op: &str) -> Result<(), StorageError> {
        if self.read_only {
            Err(StorageError::WriteInReadOnlyTransaction(op.to_string()))
        } else {
            Ok(())
        }
    }
}

/// Transaction manager over an in-process table.
pub struct MemoryTransactionManager {
    id: ManagerId,
    backend: Backend,
    tables: RwLock<Tables>,
    clock: Arc<dyn Clock>,
    listener: Option<Arc<dyn CommitListener>>,
    default_isolation: IsolationLevel,
}

impl MemoryTransactionManager {
    #[must_use]
    pub fn new(backend: Backend, clock: Arc<dyn Clock>) -> Self {
        Self {
            id: ManagerId::next(),
            backend,
            tables: RwLock::new(Tables::default()),
            clock,
            listener: None,
            default_isolation: IsolationLevel::RepeatableRead,
        }
    }

    /// Stand-in for the document store, on the wall clock.
    #[must_use]
    pub fn document() -> Self {
        Self::new(Backend::Document, Arc::new(SystemClock))
    }

    /// Stand-in for the relational store, on the wall clock.
    #[must_use]
    pub fn relational() -> Self {
        Self::new(Backend::Relational, Arc::new(SystemClock))
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

    /// Number of committed entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.read().rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn current(&self) -> Result<Arc<MemoryTransaction>, StorageError> {
        ActiveTransactions::current::<MemoryTransaction>(self.id).ok_or(StorageError::NotInTransaction)
    }

    fn row_key(&self, key: &DualKey) -> Result<RowKey, StorageError> {
        Ok(match self.backend {
            Backend::Document => RowKey::Doc(key.doc()?.clone()),
            Backend::Relational => RowKey::Rel {
                kind: key.kind().name(),
                key: key.rel()?.clone(),
            },
        })
    }

    /// Current value of `row` as seen by `tx`: its own pending write if any,
    /// otherwise the committed row (recording the version read).
    fn visible(&self, tx: &MemoryTransaction, state: &mut WriteSet<RowKey>, row: &RowKey) -> Option<Entity> {
        if let Some(pending) = state.pending(row) {
            return pending.cloned();
        }
        let tables = self.tables.read();
        let committed = tables.rows.get(row);
        if !tx.read_only {
            state.record_read(row, committed.map(|r| r.version));
        }
        committed.map(|r| r.entity.clone())
    }

    fn commit(&self, tx: &MemoryTransaction) -> Result<(), StorageError> {
        let state = std::mem::take(&mut *tx.state.lock());
        if tx.read_only || state.log.is_empty() {
            return Ok(());
        }

        let mut tables = self.tables.write();
        if tx.isolation >= IsolationLevel::RepeatableRead {
            for (row, seen) in &state.reads {
                let now = tables.rows.get(row).map(|r| r.version);
                if now != *seen {
                    return Err(StorageError::Conflict(format!("{row:?} changed since it was read")));
                }
            }
        }
        if tx.isolation == IsolationLevel::Serializable {
            for (kind, seen) in &state.scans {
                let now = tables.kind_versions.get(kind).copied().unwrap_or(0);
                if now != *seen {
                    return Err(StorageError::Conflict(format!("{kind} changed since it was scanned")));
                }
            }
        }
        for (row, write) in &state.writes {
            match write {
                PendingWrite::Insert(e) if tables.rows.contains_key(row) => {
                    return Err(StorageError::DuplicateKey(e.key().stringify()));
                }
                PendingWrite::Update(e) if !tables.rows.contains_key(row) => {
                    return Err(StorageError::NotFound(e.key().stringify()));
                }
                _ => {}
            }
        }

        tables.next_version += 1;
        let version = tables.next_version;
        for (row, write) in state.writes {
            *tables.kind_versions.entry(write.kind()).or_insert(0) += 1;
            match write {
                PendingWrite::Insert(entity) | PendingWrite::Update(entity) | PendingWrite::Put(entity) => {
                    tables.rows.insert(row, Row { entity, version });
                }
                PendingWrite::Delete(_) => {
                    tables.rows.remove(&row);
                }
            }
        }

        if let Some(listener) = &self.listener {
            listener.on_commit(&CommittedTransaction {
                backend: self.backend,
                transaction_time: tx.time,
                mutations: state.log,
            });
        }
        Ok(())
    }

    fn write(&self, intent: WriteIntent, mutation: Mutation) -> Result<(), StorageError> {
        let tx = self.current()?;
        tx.check_writable(mutation.op_name())?;
        let row = self.row_key(mutation.key())?;
        let mut state = tx.state.lock();
        let exists = self.visible(&tx, &mut state, &row).is_some();
        state.stage(row, intent, mutation, exists)
    }
}

#[async_trait]
impl TransactionManager for MemoryTransactionManager {
    fn backend(&self) -> Backend {
        self.backend
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

        let tx = Arc::new(MemoryTransaction {
            time: self.clock.now(),
            isolation: options.isolation.unwrap_or(self.default_isolation),
            read_only: options.read_only,
            state: Mutex::new(WriteSet::default()),
        });
        let result = ActiveTransactions::enter(self.id, Arc::clone(&tx), work()).await;
        let outcome = result.and_then(|()| self.commit(&tx));
        match &outcome {
            Ok(()) => metrics::record_transaction(self.backend.as_str(), "committed"),
            Err(e) if e.is_retryable() => {
                warn!(backend = %self.backend, error = %e, "Transaction aborted by conflict");
                metrics::record_transaction(self.backend.as_str(), "conflict");
            }
            Err(e) => {
                debug!(backend = %self.backend, error = %e, "Transaction rolled back");
                metrics::record_transaction(self.backend.as_str(), "rolled_back");
            }
        }
        outcome
    }

    async fn load(&self, key: &DualKey) -> Result<Option<Entity>, StorageError> {
        let tx = self.current()?;
        let row = self.row_key(key)?;
        let mut state = tx.state.lock();
        Ok(self.visible(&tx, &mut state, &row))
    }

    async fn load_all(&self, kind: EntityType) -> Result<Vec<Entity>, StorageError> {
        let tx = self.current()?;
        let mut state = tx.state.lock();
        let mut found: BTreeMap<RowKey, Entity> = {
            let tables = self.tables.read();
            if !tx.read_only {
                state.record_scan(kind, tables.kind_versions.get(&kind).copied().unwrap_or(0));
            }
            tables
                .rows
                .iter()
                .filter(|(_, row)| row.entity.kind() == kind)
                .map(|(key, row)| (key.clone(), row.entity.clone()))
                .collect()
        };
        state.overlay(kind, &mut found);
        Ok(found.into_values().collect())
    }

    async fn insert(&self, entity: Entity) -> Result<(), StorageError> {
        self.write(WriteIntent::Insert, Mutation::Upsert(entity))
    }

    async fn update(&self, entity: Entity) -> Result<(), StorageError> {
        self.write(WriteIntent::Update, Mutation::Upsert(entity))
    }

    async fn upsert(&self, entity: Entity) -> Result<(), StorageError> {
        self.write(WriteIntent::Upsert, Mutation::Upsert(entity))
    }

    async fn delete(&self, key: &DualKey) -> Result<(), StorageError> {
        self.write(WriteIntent::Delete, Mutation::Delete(key.clone()))
    }
}
