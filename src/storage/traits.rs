// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The transaction manager abstraction shared by both backends.
//!
//! [`TransactionManager`] is object-safe so routing code can hand out
//! `Arc<dyn TransactionManager>` without knowing which backend sits behind
//! it. Its single unit-of-work entry point, [`TransactionManager::execute`],
//! takes type-erased work; the generic, value-returning forms live in
//! [`TransactionManagerExt`], implemented for every manager.
//!
//! Data operations act on the manager's *current* transaction, which is
//! scoped to the calling task. They fail with
//! [`StorageError::NotInTransaction`] outside one.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entity::{Entity, Mutation};
use crate::key::{DualKey, EntityType, KeyError};

/// Message carried by every [`StorageError::ReadOnlyViolation`].
pub const READ_ONLY_MESSAGE: &str = "Transaction manager currently in read-only mode";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("{0}")]
    ReadOnlyViolation(&'static str),
    #[error("not in a transaction")]
    NotInTransaction,
    #[error("write attempted in a read-only transaction: {0}")]
    WriteInReadOnlyTransaction(String),
    #[error("entity already exists: {0}")]
    DuplicateKey(String),
    #[error("entity not found: {0}")]
    NotFound(String),
    #[error("concurrent modification detected: {0}")]
    Conflict(String),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
    /// Work failed with a caller error; see [`TransactionManagerExt::try_transact_with`]
    #[error("transaction aborted by its work")]
    Aborted,
}

impl StorageError {
    #[must_use]
    pub fn read_only() -> Self {
        StorageError::ReadOnlyViolation(READ_ONLY_MESSAGE)
    }

    /// Whether the caller may reasonably rerun the whole transaction.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Conflict(_))
    }
}

/// Which storage system a manager talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Backend {
    /// The eventually consistent document store being retired.
    Document,
    /// The strongly consistent relational store taking over.
    Relational,
}

impl Backend {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Document => "document",
            Backend::Relational => "relational",
        }
    }

    #[must_use]
    pub fn other(&self) -> Backend {
        match self {
            Backend::Document => Backend::Relational,
            Backend::Relational => Backend::Document,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    #[must_use]
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// How a unit of work relates to an already running transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Propagation {
    /// Run inside the enclosing transaction if there is one.
    #[default]
    Join,
    /// Suspend the enclosing transaction and commit independently.
    RequiresNew,
}

/// Per-call transaction settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionOptions {
    /// `None` uses the manager's configured default.
    pub isolation: Option<IsolationLevel>,
    pub read_only: bool,
    pub propagation: Propagation,
}

impl TransactionOptions {
    #[must_use]
    pub fn requires_new() -> Self {
        Self {
            propagation: Propagation::RequiresNew,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = Some(isolation);
        self
    }
}

/// Boxed future produced by type-erased work.
pub type WorkFuture<'a> = Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + 'a>>;

/// Type-erased unit of work accepted by [`TransactionManager::execute`].
pub type Work<'a> = Box<dyn FnOnce() -> WorkFuture<'a> + Send + 'a>;

/// Everything a read-write transaction wrote, in the order it wrote it.
#[derive(Debug, Clone)]
pub struct CommittedTransaction {
    pub backend: Backend,
    pub transaction_time: DateTime<Utc>,
    pub mutations: Vec<Mutation>,
}

/// Observer of committed transactions.
///
/// Managers invoke it while still holding their commit lock, so calls arrive
/// in commit order. Implementations must not block.
pub trait CommitListener: Send + Sync {
    fn on_commit(&self, commit: &CommittedTransaction);
}

#[async_trait]
pub trait TransactionManager: Send + Sync {
    fn backend(&self) -> Backend;

    /// Whether the calling task is inside a transaction of this manager.
    fn in_transaction(&self) -> bool;

    fn assert_in_transaction(&self) -> Result<(), StorageError> {
        if self.in_transaction() {
            Ok(())
        } else {
            Err(StorageError::NotInTransaction)
        }
    }

    /// Time fixed at the start of the current transaction.
    fn transaction_time(&self) -> Result<DateTime<Utc>, StorageError>;

    /// Runs `work` in a transaction chosen by `options`, committing when it
    /// returns `Ok` and rolling back otherwise.
    async fn execute<'a>(
        &'a self,
        options: TransactionOptions,
        work: Work<'a>,
    ) -> Result<(), StorageError>;

    async fn load(&self, key: &DualKey) -> Result<Option<Entity>, StorageError>;

    async fn load_all(&self, kind: EntityType) -> Result<Vec<Entity>, StorageError>;

    async fn exists(&self, key: &DualKey) -> Result<bool, StorageError> {
        Ok(self.load(key).await?.is_some())
    }

    /// Fails with [`StorageError::DuplicateKey`] if the key is taken.
    async fn insert(&self, entity: Entity) -> Result<(), StorageError>;

    async fn insert_all(&self, entities: Vec<Entity>) -> Result<(), StorageError> {
        for entity in entities {
            self.insert(entity).await?;
        }
        Ok(())
    }

    /// Fails with [`StorageError::NotFound`] if the key is absent.
    async fn update(&self, entity: Entity) -> Result<(), StorageError>;

    async fn update_all(&self, entities: Vec<Entity>) -> Result<(), StorageError> {
        for entity in entities {
            self.update(entity).await?;
        }
        Ok(())
    }

    async fn upsert(&self, entity: Entity) -> Result<(), StorageError>;

    async fn upsert_all(&self, entities: Vec<Entity>) -> Result<(), StorageError> {
        for entity in entities {
            self.upsert(entity).await?;
        }
        Ok(())
    }

    /// Deleting an absent key is not an error.
    async fn delete(&self, key: &DualKey) -> Result<(), StorageError>;

    async fn delete_all(&self, keys: Vec<DualKey>) -> Result<(), StorageError> {
        for key in &keys {
            self.delete(key).await?;
        }
        Ok(())
    }
}

fn erase_work<'a, T, F, Fut>(slot: &'a mut Option<T>, work: F) -> Work<'a>
where
    T: Send + 'a,
    F: FnOnce() -> Fut + Send + 'a,
    Fut: Future<Output = Result<T, StorageError>> + Send + 'a,
{
    Box::new(move || {
        let future: WorkFuture<'a> = Box::pin(async move {
            *slot = Some(work().await?);
            Ok(())
        });
        future
    })
}

/// Value-returning transaction entry points.
///
/// ```no_run
/// # use registry_cutover::storage::{TransactionManager, TransactionManagerExt, StorageError};
/// # use registry_cutover::key::DualKey;
/// # async fn example(tm: &dyn TransactionManager, key: DualKey) -> Result<(), StorageError> {
/// let found = tm.transact(|| async { tm.exists(&key).await }).await?;
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait TransactionManagerExt: TransactionManager {
    async fn transact_with<T, F, Fut>(
        &self,
        options: TransactionOptions,
        work: F,
    ) -> Result<T, StorageError>
    where
        T: Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, StorageError>> + Send,
    {
        let mut output = None;
        self.execute(options, erase_work(&mut output, work)).await?;
        output.ok_or_else(|| StorageError::Backend("transaction finished without a result".into()))
    }

    /// Like [`transact_with`](Self::transact_with) for work that fails with a
    /// caller error type. Such an error rolls the transaction back and is
    /// returned unchanged.
    async fn try_transact_with<T, E, F, Fut>(
        &self,
        options: TransactionOptions,
        work: F,
    ) -> Result<T, E>
    where
        T: Send,
        E: From<StorageError> + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        let mut failure = None;
        let result = self
            .transact_with(options, || async {
                work().await.map_err(|e| {
                    failure = Some(e);
                    StorageError::Aborted
                })
            })
            .await;
        match (result, failure) {
            (_, Some(e)) => Err(e),
            (result, None) => result.map_err(E::from),
        }
    }

    /// Runs `work` atomically, joining an enclosing transaction if any.
    async fn transact<T, F, Fut>(&self, work: F) -> Result<T, StorageError>
    where
        T: Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, StorageError>> + Send,
    {
        self.transact_with(TransactionOptions::default(), work).await
    }

    /// Runs `work` in an independent transaction that commits even if the
    /// enclosing one later rolls back.
    async fn transact_new<T, F, Fut>(&self, work: F) -> Result<T, StorageError>
    where
        T: Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, StorageError>> + Send,
    {
        self.transact_with(TransactionOptions::requires_new(), work).await
    }

    /// Runs `work` in a transaction that rejects writes.
    async fn transact_read_only<T, F, Fut>(&self, work: F) -> Result<T, StorageError>
    where
        T: Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, StorageError>> + Send,
    {
        self.transact_with(TransactionOptions::read_only(), work).await
    }
}

impl<M: TransactionManager + ?Sized> TransactionManagerExt for M {}
