// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{prepare_for, CapturedTransaction, Cursor, CursorScope, ReplayError, ReplayQueue};
use crate::config::MigrationConfig;
use crate::entity::Mutation;
use crate::metrics;
use crate::resilience::retry::{retry_if, RetryConfig};
use crate::storage::{StorageError, TransactionManager, TransactionManagerExt, TransactionOptions};

const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Transactions written to the target
    pub applied: usize,
    /// Transactions at or below the cursor, dropped without writing
    pub skipped: usize,
}

impl DrainReport {
    fn merge(&mut self, other: DrainReport) {
        self.applied += other.applied;
        self.skipped += other.skipped;
    }
}

/// Applies queued transactions to the secondary backend.
///
/// Only one drainer may run per cursor scope. Before its first pass it
/// resumes the queue above the stored cursor.
pub struct ReplayDrainer {
    queue: Arc<ReplayQueue>,
    target: Arc<dyn TransactionManager>,
    scope: CursorScope,
    batch_size: usize,
    resumed: AtomicBool,
}

impl ReplayDrainer {
    #[must_use]
    pub fn new(queue: Arc<ReplayQueue>, target: Arc<dyn TransactionManager>, scope: CursorScope) -> Self {
        Self {
            queue,
            target,
            scope,
            batch_size: DEFAULT_BATCH_SIZE,
            resumed: AtomicBool::new(false),
        }
    }

    /// Scope and batch size from `config`.
    #[must_use]
    pub fn from_config(
        queue: Arc<ReplayQueue>,
        target: Arc<dyn TransactionManager>,
        config: &MigrationConfig,
    ) -> Self {
        let scope = CursorScope::from(config.replay_cursor_scope.clone());
        Self::new(queue, target, scope).with_batch_size(config.replay_batch_size)
    }

    /// Transactions per pass of [`drain_all`](Self::drain_all) (at least 1).
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Lifts the queue above this scope's stored cursor so captures made
    /// since a restart are never taken for applied ones.
    ///
    /// Runs once, before the first pass; calling it again is a no-op.
    pub async fn resume(&self) -> Result<(), ReplayError> {
        if self.resumed.load(Ordering::Acquire) {
            return Ok(());
        }
        let target = &*self.target;
        let cursor = target
            .transact_read_only(|| async { Cursor::load(target, &self.scope).await })
            .await?;
        if let Some(cursor) = cursor {
            self.queue.resume_after(cursor.position);
        }
        self.resumed.store(true, Ordering::Release);
        Ok(())
    }

    /// Replays up to `batch_size` queued transactions, oldest first.
    ///
    /// Stops at the first failure, leaving that transaction queued.
    pub async fn drain_once(&self, batch_size: usize) -> Result<DrainReport, ReplayError> {
        self.resume().await?;
        let mut report = DrainReport::default();
        for captured in self.queue.peek(batch_size) {
            let applied = match retry_if(
                "replay_transaction",
                &RetryConfig::transaction(),
                is_conflict,
                || self.replay(&captured),
            )
            .await
            {
                Ok(applied) => applied,
                Err(e) => {
                    warn!(
                        transaction_order = captured.transaction_order,
                        error = %e,
                        "Replay failed; transaction stays queued"
                    );
                    self.record(report);
                    return Err(e);
                }
            };
            self.queue.acknowledge(captured.transaction_order);
            if applied {
                report.applied += 1;
            } else {
                report.skipped += 1;
            }
        }
        self.record(report);
        Ok(report)
    }

    /// Drains until the queue is empty.
    pub async fn drain_all(&self) -> Result<DrainReport, ReplayError> {
        let mut total = DrainReport::default();
        while !self.queue.is_empty() {
            total.merge(self.drain_once(self.batch_size).await?);
        }
        if total.applied + total.skipped > 0 {
            info!(
                target = %self.target.backend(),
                applied = total.applied,
                skipped = total.skipped,
                "Replay queue drained"
            );
        }
        Ok(total)
    }

    /// Applies one captured transaction with the cursor advance. Returns
    /// `false` when the cursor shows it was already applied.
    async fn replay(&self, captured: &CapturedTransaction) -> Result<bool, ReplayError> {
        let target = &*self.target;
        target
            .try_transact_with(TransactionOptions::requires_new(), || async {
                if let Some(cursor) = Cursor::load(target, &self.scope).await? {
                    if captured.position <= cursor.position {
                        debug!(
                            transaction_order = captured.transaction_order,
                            "Already replayed, skipping"
                        );
                        return Ok(false);
                    }
                }
                for mutation in &captured.mutations {
                    self.apply(mutation).await?;
                }
                Cursor::advance(target, &self.scope, captured.position).await?;
                Ok(true)
            })
            .await
    }

    async fn apply(&self, mutation: &Mutation) -> Result<(), ReplayError> {
        match prepare_for(mutation, self.target.backend()).map_err(StorageError::from)? {
            Mutation::Upsert(entity) => self.target.upsert(entity).await?,
            Mutation::Delete(key) => self.target.delete(&key).await?,
        }
        Ok(())
    }

    fn record(&self, report: DrainReport) {
        metrics::record_replay_applied(report.applied);
        metrics::record_replay_skipped(report.skipped);
    }
}

fn is_conflict(e: &ReplayError) -> bool {
    matches!(e, ReplayError::Storage(e) if e.is_retryable())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::entity::Entity;
    use crate::key::{DualKey, EntityType, RelKey};
    use crate::storage::{Backend, CommitListener, MemoryTransactionManager};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    const DOMAIN: EntityType = EntityType::new("Domain", "DomainBase");

    fn domain(id: &str, v: i64) -> Entity {
        Entity::new(DualKey::root(DOMAIN, RelKey::from(id)), json!({"v": v}))
    }

    struct Setup {
        queue: Arc<ReplayQueue>,
        primary: Arc<MemoryTransactionManager>,
        secondary: Arc<MemoryTransactionManager>,
        drainer: ReplayDrainer,
    }

    fn setup() -> Setup {
        let clock = Arc::new(FakeClock::new(Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap()));
        let queue = Arc::new(ReplayQueue::new(clock.clone()));
        queue.set_source(Some(Backend::Document));
        let primary = Arc::new(
            MemoryTransactionManager::new(Backend::Document, clock.clone()).with_listener(queue.clone()),
        );
        let secondary = Arc::new(MemoryTransactionManager::new(Backend::Relational, clock));
        let drainer =
            ReplayDrainer::new(queue.clone(), secondary.clone(), CursorScope::Global).with_batch_size(2);
        Setup { queue, primary, secondary, drainer }
    }

    async fn secondary_domains(s: &Setup) -> Vec<Entity> {
        s.secondary
            .transact(|| async { s.secondary.load_all(DOMAIN).await })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_replays_in_commit_order() {
        let s = setup();
        s.primary.transact(|| async { s.primary.insert(domain("a", 1)).await }).await.unwrap();
        s.primary.transact(|| async { s.primary.update(domain("a", 2)).await }).await.unwrap();
        s.primary
            .transact(|| async {
                s.primary.insert(domain("b", 1)).await?;
                s.primary.delete(domain("a", 0).key()).await
            })
            .await
            .unwrap();

        let report = s.drainer.drain_all().await.unwrap();
        assert_eq!(report, DrainReport { applied: 3, skipped: 0 });
        assert!(s.queue.is_empty());
        assert_eq!(secondary_domains(&s).await, vec![domain("b", 1)]);
    }

    #[tokio::test]
    async fn test_redelivery_is_skipped() {
        let s = setup();
        s.primary.transact(|| async { s.primary.upsert(domain("a", 1)).await }).await.unwrap();
        s.drainer.resume().await.unwrap();
        let captured = s.queue.peek(1).remove(0);

        assert!(s.drainer.replay(&captured).await.unwrap());
        // offered again after its apply committed, before acknowledge
        assert!(!s.drainer.replay(&captured).await.unwrap());
        let report = s.drainer.drain_all().await.unwrap();

        assert_eq!(report, DrainReport { applied: 0, skipped: 1 });
        assert!(s.queue.is_empty());
        assert_eq!(secondary_domains(&s).await, vec![domain("a", 1)]);
    }

    #[tokio::test]
    async fn test_restart_with_lagging_clock_keeps_new_writes() {
        let s = setup();
        s.primary.transact(|| async { s.primary.upsert(domain("a", 1)).await }).await.unwrap();
        s.drainer.drain_all().await.unwrap();

        // a restarted process whose clock is behind the stored cursor
        let clock = Arc::new(FakeClock::new(Utc.with_ymd_and_hms(2021, 5, 31, 23, 59, 59).unwrap()));
        let queue = Arc::new(ReplayQueue::new(clock.clone()));
        queue.set_source(Some(Backend::Document));
        let primary = MemoryTransactionManager::new(Backend::Document, clock).with_listener(queue.clone());
        primary.transact(|| async { primary.upsert(domain("b", 7)).await }).await.unwrap();

        let restarted = ReplayDrainer::new(queue.clone(), s.secondary.clone(), CursorScope::Global);
        let report = restarted.drain_all().await.unwrap();

        assert_eq!(report, DrainReport { applied: 1, skipped: 0 });
        assert!(queue.is_empty());
        assert_eq!(secondary_domains(&s).await, vec![domain("a", 1), domain("b", 7)]);

        // captures after the first pass keep landing above the cursor
        primary.transact(|| async { primary.upsert(domain("c", 3)).await }).await.unwrap();
        let report = restarted.drain_all().await.unwrap();
        assert_eq!(report, DrainReport { applied: 1, skipped: 0 });
    }

    #[tokio::test]
    async fn test_applying_twice_matches_applying_once() {
        let s = setup();
        let once = Arc::new(MemoryTransactionManager::relational());
        let once_drainer = ReplayDrainer::new(s.queue.clone(), once.clone(), CursorScope::Global);
        let mutations = vec![
            Mutation::Upsert(domain("a", 1)),
            Mutation::Upsert(domain("b", 2)),
            Mutation::Delete(domain("b", 0).key().clone()),
            Mutation::Upsert(domain("a", 3)),
        ];

        for mutation in &mutations {
            let tm = &*once;
            tm.try_transact_with(TransactionOptions::default(), || async {
                once_drainer.apply(mutation).await
            })
            .await
            .unwrap();
            for _ in 0..2 {
                let tm = &*s.secondary;
                tm.try_transact_with(TransactionOptions::default(), || async {
                    s.drainer.apply(mutation).await
                })
                .await
                .unwrap();
            }
        }

        let once_domains = once.transact(|| async { once.load_all(DOMAIN).await }).await.unwrap();
        assert_eq!(secondary_domains(&s).await, once_domains);
        assert_eq!(once_domains, vec![domain("a", 3)]);
    }

    #[tokio::test]
    async fn test_replay_into_document_restores_doc_key() {
        let clock = Arc::new(FakeClock::new(Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap()));
        let queue = Arc::new(ReplayQueue::new(clock.clone()));
        queue.set_source(Some(Backend::Relational));
        let relational = Arc::new(
            MemoryTransactionManager::new(Backend::Relational, clock.clone()).with_listener(queue.clone()),
        );
        let document = Arc::new(MemoryTransactionManager::new(Backend::Document, clock));
        let drainer = ReplayDrainer::new(queue, document.clone(), CursorScope::named("to-doc"));

        let rel_only = Entity::new(DualKey::from_rel(DOMAIN, RelKey::from("x")), json!({"v": 1}));
        relational
            .transact(|| async { relational.insert(rel_only.clone()).await })
            .await
            .unwrap();
        drainer.drain_all().await.unwrap();

        let restored = DualKey::root(DOMAIN, RelKey::from("x"));
        let found = document
            .transact(|| async { document.load(&restored).await })
            .await
            .unwrap();
        assert_eq!(found.map(|e| e.payload().clone()), Some(json!({"v": 1})));
    }

    #[tokio::test]
    async fn test_config_selects_cursor_scope() {
        let s = setup();
        let config = MigrationConfig {
            replay_cursor_scope: Some("to-rel".into()),
            ..MigrationConfig::default()
        };
        let drainer = ReplayDrainer::from_config(s.queue.clone(), s.secondary.clone(), &config);
        s.primary.transact(|| async { s.primary.upsert(domain("a", 1)).await }).await.unwrap();
        drainer.drain_all().await.unwrap();

        let tm = &*s.secondary;
        let (named, global) = tm
            .transact(|| async {
                let named = Cursor::load(tm, &CursorScope::named("to-rel")).await?;
                let global = Cursor::load(tm, &CursorScope::Global).await?;
                Ok((named, global))
            })
            .await
            .unwrap();
        assert!(named.is_some());
        assert!(global.is_none());
    }

    #[tokio::test]
    async fn test_failed_replay_stays_queued() {
        let s = setup();
        // a document key with no relational form cannot be written to the relational side
        let doc_only = Entity::new(
            DualKey::from_doc(DOMAIN, crate::key::DocKey::root("DomainBase", crate::key::DocId::Id(7))),
            json!({}),
        );
        s.primary.transact(|| async { s.primary.upsert(doc_only.clone()).await }).await.unwrap();

        let err = s.drainer.drain_once(10).await.unwrap_err();
        assert!(matches!(err, ReplayError::Storage(StorageError::Key(_))));
        assert_eq!(s.queue.len(), 1);
    }
}
