// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read-only decorator over any transaction manager.
//!
//! Used during the read-only migration phases: reads and transaction
//! control pass straight through, every write fails before reaching the
//! wrapped manager.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use super::traits::{Backend, StorageError, TransactionManager, TransactionOptions, Work};
use crate::entity::Entity;
use crate::key::{DualKey, EntityType};
use crate::metrics;

pub struct ReadOnlyTransactionManager {
    delegate: Arc<dyn TransactionManager>,
}

impl ReadOnlyTransactionManager {
    #[must_use]
    pub fn new(delegate: Arc<dyn TransactionManager>) -> Self {
        Self { delegate }
    }

    #[must_use]
    pub fn delegate(&self) -> &Arc<dyn TransactionManager> {
        &self.delegate
    }

    fn reject(&self, op: &'static str) -> StorageError {
        warn!(backend = %self.delegate.backend(), op, "Write rejected in read-only mode");
        metrics::record_read_only_violation(self.delegate.backend().as_str(), op);
        StorageError::read_only()
    }
}

#[async_trait]
impl TransactionManager for ReadOnlyTransactionManager {
    fn backend(&self) -> Backend {
        self.delegate.backend()
    }

    fn in_transaction(&self) -> bool {
        self.delegate.in_transaction()
    }

    fn transaction_time(&self) -> Result<DateTime<Utc>, StorageError> {
        self.delegate.transaction_time()
    }

    async fn execute<'a>(
        &'a self,
        options: TransactionOptions,
        work: Work<'a>,
    ) -> Result<(), StorageError> {
        self.delegate.execute(options, work).await
    }

    async fn load(&self, key: &DualKey) -> Result<Option<Entity>, StorageError> {
        self.delegate.load(key).await
    }

    async fn load_all(&self, kind: EntityType) -> Result<Vec<Entity>, StorageError> {
        self.delegate.load_all(kind).await
    }

    async fn exists(&self, key: &DualKey) -> Result<bool, StorageError> {
        self.delegate.exists(key).await
    }

    async fn insert(&self, _entity: Entity) -> Result<(), StorageError> {
        Err(self.reject("insert"))
    }

    async fn insert_all(&self, _entities: Vec<Entity>) -> Result<(), StorageError> {
        Err(self.reject("insert_all"))
    }

    async fn update(&self, _entity: Entity) -> Result<(), StorageError> {
        Err(self.reject("update"))
    }

    async fn update_all(&self, _entities: Vec<Entity>) -> Result<(), StorageError> {
        Err(self.reject("update_all"))
    }

    async fn upsert(&self, _entity: Entity) -> Result<(), StorageError> {
        Err(self.reject("upsert"))
    }

    async fn upsert_all(&self, _entities: Vec<Entity>) -> Result<(), StorageError> {
        Err(self.reject("upsert_all"))
    }

    async fn delete(&self, _key: &DualKey) -> Result<(), StorageError> {
        Err(self.reject("delete"))
    }

    async fn delete_all(&self, _keys: Vec<DualKey>) -> Result<(), StorageError> {
        Err(self.reject("delete_all"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::RelKey;
    use crate::storage::memory::MemoryTransactionManager;
    use crate::storage::traits::{TransactionManagerExt, READ_ONLY_MESSAGE};
    use serde_json::json;

    const CONTACT: EntityType = EntityType::new("Contact", "ContactResource");

    fn contact(id: &str) -> Entity {
        Entity::new(DualKey::root(CONTACT, RelKey::from(id)), json!({"id": id}))
    }

    async fn seeded() -> (Arc<MemoryTransactionManager>, ReadOnlyTransactionManager) {
        let inner = Arc::new(MemoryTransactionManager::relational());
        inner
            .transact(|| async { inner.insert(contact("c1")).await })
            .await
            .unwrap();
        let read_only = ReadOnlyTransactionManager::new(inner.clone());
        (inner, read_only)
    }

    #[tokio::test]
    async fn test_reads_pass_through() {
        let (_, ro) = seeded().await;
        let (found, all, time) = ro
            .transact(|| async {
                assert!(ro.in_transaction());
                Ok((
                    ro.exists(contact("c1").key()).await?,
                    ro.load_all(CONTACT).await?,
                    ro.transaction_time()?,
                ))
            })
            .await
            .unwrap();
        assert!(found);
        assert_eq!(all, vec![contact("c1")]);
        assert!(time <= Utc::now());
        assert_eq!(ro.backend(), Backend::Relational);
    }

    #[tokio::test]
    async fn test_reads_match_wrapped_manager() {
        use crate::clock::FakeClock;
        use chrono::TimeZone;

        let clock = Arc::new(FakeClock::new(Utc.with_ymd_and_hms(2021, 9, 1, 8, 0, 0).unwrap()));
        let inner = Arc::new(MemoryTransactionManager::new(Backend::Relational, clock));
        inner
            .transact(|| async {
                inner.insert_all(vec![contact("c1"), contact("c2"), contact("c3")]).await?;
                inner.delete(contact("c2").key()).await
            })
            .await
            .unwrap();
        let ro = ReadOnlyTransactionManager::new(inner.clone());
        let keys = ["c1", "c2", "c3", "missing"].map(|id| contact(id).key().clone());

        ro.transact(|| async {
            assert_eq!(ro.in_transaction(), inner.in_transaction());
            assert_eq!(ro.transaction_time()?, inner.transaction_time()?);
            assert_eq!(ro.load_all(CONTACT).await?, inner.load_all(CONTACT).await?);
            for key in &keys {
                assert_eq!(ro.load(key).await?, inner.load(key).await?, "{key:?}");
                assert_eq!(ro.exists(key).await?, inner.exists(key).await?, "{key:?}");
            }
            Ok(())
        })
        .await
        .unwrap();

        assert!(!ro.in_transaction());
        assert_eq!(ro.in_transaction(), inner.in_transaction());
        assert!(matches!(ro.transaction_time(), Err(StorageError::NotInTransaction)));
        assert!(matches!(inner.transaction_time(), Err(StorageError::NotInTransaction)));
    }

    #[tokio::test]
    async fn test_every_write_is_rejected() {
        let (inner, ro) = seeded().await;
        let key = contact("c1").key().clone();
        let results = ro
            .transact(|| async {
                Ok(vec![
                    ro.insert(contact("c2")).await,
                    ro.insert_all(vec![contact("c3")]).await,
                    ro.update(contact("c1")).await,
                    ro.update_all(vec![contact("c1")]).await,
                    ro.upsert(contact("c4")).await,
                    ro.upsert_all(vec![contact("c5")]).await,
                    ro.delete(&key).await,
                    ro.delete_all(vec![key.clone()]).await,
                ])
            })
            .await
            .unwrap();
        for result in results {
            match result {
                Err(StorageError::ReadOnlyViolation(message)) => {
                    assert_eq!(message, READ_ONLY_MESSAGE);
                }
                other => panic!("expected read-only violation, got {other:?}"),
            }
        }
        assert_eq!(inner.len(), 1);
    }

    #[tokio::test]
    async fn test_writes_rejected_outside_transaction_too() {
        let (_, ro) = seeded().await;
        assert!(matches!(
            ro.delete(contact("c1").key()).await,
            Err(StorageError::ReadOnlyViolation(_))
        ));
    }
}
