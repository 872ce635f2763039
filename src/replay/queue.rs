// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::entity::Mutation;
use crate::metrics;
use crate::migration::MIGRATION_STATE_KIND;
use crate::replay::CURSOR_KIND;
use crate::storage::{Backend, CommitListener, CommittedTransaction};

/// One captured mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayEntry {
    pub mutation: Mutation,
    pub transaction_order: u64,
    pub transaction_time: DateTime<Utc>,
    /// Strictly increasing across captured transactions
    pub position: DateTime<Utc>,
}

/// All mutations of one captured transaction, in write order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedTransaction {
    pub transaction_order: u64,
    pub transaction_time: DateTime<Utc>,
    pub position: DateTime<Utc>,
    pub mutations: Vec<Mutation>,
}

impl CapturedTransaction {
    pub fn entries(&self) -> impl Iterator<Item = ReplayEntry> + '_ {
        self.mutations.iter().map(|mutation| ReplayEntry {
            mutation: mutation.clone(),
            transaction_order: self.transaction_order,
            transaction_time: self.transaction_time,
            position: self.position,
        })
    }
}

#[derive(Default)]
struct QueueState {
    source: Option<Backend>,
    pending: VecDeque<CapturedTransaction>,
    next_order: u64,
    last_position: Option<DateTime<Utc>>,
}

/// FIFO of committed transactions awaiting replay.
///
/// Registered as the [`CommitListener`] of both managers; only commits on
/// the current capture source are recorded.
pub struct ReplayQueue {
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
}

impl ReplayQueue {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Starts or stops capture. `None` disables recording.
    pub fn set_source(&self, source: Option<Backend>) {
        let mut state = self.state.lock();
        if state.source != source {
            info!(
                from = ?state.source.map(|b| b.as_str()),
                to = ?source.map(|b| b.as_str()),
                "Replay capture source changed"
            );
            state.source = source;
        }
    }

    #[must_use]
    pub fn source(&self) -> Option<Backend> {
        self.state.lock().source
    }

    /// Queued transactions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    /// Drops everything queued; capture continues.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.pending.clear();
        metrics::set_replay_queue_depth(0);
    }

    /// Every queued mutation, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<ReplayEntry> {
        let state = self.state.lock();
        state.pending.iter().flat_map(|tx| tx.entries()).collect()
    }

    /// Up to `limit` of the oldest queued transactions, left in place.
    #[must_use]
    pub fn peek(&self, limit: usize) -> Vec<CapturedTransaction> {
        self.state.lock().pending.iter().take(limit).cloned().collect()
    }

    /// Lifts every queued position, and every later capture, strictly above
    /// `floor`. Returns how many queued transactions moved.
    ///
    /// Called with the stored cursor before a drainer's first pass: positions
    /// come from this process's clock, which may lag the one that advanced
    /// the cursor.
    pub fn resume_after(&self, floor: DateTime<Utc>) -> usize {
        let mut state = self.state.lock();
        let mut last = floor;
        let mut lifted = 0;
        for tx in state.pending.iter_mut() {
            if tx.position <= last {
                tx.position = last + Duration::microseconds(1);
                lifted += 1;
            }
            last = tx.position;
        }
        if state.last_position.map_or(true, |position| position < last) {
            state.last_position = Some(last);
        }
        if lifted > 0 {
            info!(floor = %floor, lifted, "Lifted queued replay positions above cursor");
        }
        lifted
    }

    /// Removes the head transaction if it is `transaction_order`.
    pub fn acknowledge(&self, transaction_order: u64) -> bool {
        let mut state = self.state.lock();
        let is_head = state
            .pending
            .front()
            .is_some_and(|tx| tx.transaction_order == transaction_order);
        if is_head {
            state.pending.pop_front();
            metrics::set_replay_queue_depth(state.pending.len());
        }
        is_head
    }
}

/// Migration bookkeeping stays with the backend that wrote it.
fn is_replicated(mutation: &Mutation) -> bool {
    let kind = mutation.key().kind();
    kind != CURSOR_KIND && kind != MIGRATION_STATE_KIND
}

impl CommitListener for ReplayQueue {
    fn on_commit(&self, commit: &CommittedTransaction) {
        let mut state = self.state.lock();
        if state.source != Some(commit.backend) {
            return;
        }
        let mutations: Vec<Mutation> = commit
            .mutations
            .iter()
            .filter(|m| is_replicated(m))
            .cloned()
            .collect();
        if mutations.is_empty() {
            return;
        }
        let count = mutations.len();
        let now = self.clock.now();
        let position = match state.last_position {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        let transaction_order = state.next_order;
        state.next_order += 1;
        state.last_position = Some(position);
        state.pending.push_back(CapturedTransaction {
            transaction_order,
            transaction_time: commit.transaction_time,
            position,
            mutations,
        });
        debug!(
            backend = %commit.backend,
            transaction_order,
            mutations = count,
            "Captured transaction for replay"
        );
        metrics::set_replay_queue_depth(state.pending.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::entity::Entity;
    use crate::key::{DualKey, EntityType, RelKey};
    use chrono::TimeZone;
    use serde_json::json;

    const DOMAIN: EntityType = EntityType::new("Domain", "DomainBase");

    fn commit(backend: Backend, id: &str) -> CommittedTransaction {
        let key = DualKey::root(DOMAIN, RelKey::from(id));
        CommittedTransaction {
            backend,
            transaction_time: Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap(),
            mutations: vec![
                Mutation::Upsert(Entity::new(key.clone(), json!({"id": id}))),
                Mutation::Delete(key),
            ],
        }
    }

    fn queue() -> (Arc<FakeClock>, ReplayQueue) {
        let clock = Arc::new(FakeClock::new(Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap()));
        (clock.clone(), ReplayQueue::new(clock))
    }

    #[test]
    fn test_ignores_commits_without_matching_source() {
        let (_, queue) = queue();
        queue.on_commit(&commit(Backend::Document, "a"));
        assert!(queue.is_empty());

        queue.set_source(Some(Backend::Relational));
        queue.on_commit(&commit(Backend::Document, "a"));
        assert!(queue.is_empty());
        queue.on_commit(&commit(Backend::Relational, "a"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_positions_strictly_increase_under_frozen_clock() {
        let (_, queue) = queue();
        queue.set_source(Some(Backend::Document));
        for id in ["a", "b", "c"] {
            queue.on_commit(&commit(Backend::Document, id));
        }
        let captured = queue.peek(10);
        assert_eq!(captured.len(), 3);
        assert!(captured.windows(2).all(|w| w[0].position < w[1].position));
        assert_eq!(
            captured.iter().map(|tx| tx.transaction_order).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_entries_flatten_in_order() {
        let (clock, queue) = queue();
        queue.set_source(Some(Backend::Document));
        queue.on_commit(&commit(Backend::Document, "a"));
        clock.advance(Duration::seconds(1));
        queue.on_commit(&commit(Backend::Document, "b"));
        let entries = queue.entries();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].mutation.op_name(), "UPSERT");
        assert_eq!(entries[1].mutation.op_name(), "DELETE");
        assert_eq!(entries[1].transaction_order, 0);
        assert_eq!(entries[2].transaction_order, 1);
        assert_eq!(entries[2].position, clock.now());
    }

    #[test]
    fn test_bookkeeping_kinds_not_captured() {
        let (_, queue) = queue();
        queue.set_source(Some(Backend::Relational));
        let bookkeeping = |kind| Mutation::Delete(DualKey::root(kind, RelKey::Long(1)));
        let mut tx = commit(Backend::Relational, "a");
        tx.mutations.push(bookkeeping(CURSOR_KIND));
        queue.on_commit(&tx);
        queue.on_commit(&CommittedTransaction {
            mutations: vec![bookkeeping(MIGRATION_STATE_KIND)],
            ..commit(Backend::Relational, "b")
        });
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek(1)[0].mutations.len(), 2);
    }

    #[test]
    fn test_resume_after_lifts_lagging_positions() {
        let (clock, queue) = queue();
        queue.set_source(Some(Backend::Document));
        queue.on_commit(&commit(Backend::Document, "a"));
        clock.advance(Duration::seconds(10));
        queue.on_commit(&commit(Backend::Document, "b"));

        let floor = clock.now() - Duration::seconds(5);
        assert_eq!(queue.resume_after(floor), 1);
        let captured = queue.peek(10);
        assert_eq!(captured[0].position, floor + Duration::microseconds(1));
        assert_eq!(captured[1].position, clock.now());

        // the clock still lags a cursor from another process
        assert_eq!(queue.resume_after(clock.now() + Duration::seconds(60)), 2);
        queue.on_commit(&commit(Backend::Document, "c"));
        let captured = queue.peek(10);
        assert!(captured.windows(2).all(|w| w[0].position < w[1].position));
        assert!(captured[2].position > clock.now() + Duration::seconds(60));
        assert_eq!(queue.resume_after(clock.now()), 0);
    }

    #[test]
    fn test_acknowledge_only_head() {
        let (_, queue) = queue();
        queue.set_source(Some(Backend::Document));
        queue.on_commit(&commit(Backend::Document, "a"));
        queue.on_commit(&commit(Backend::Document, "b"));
        assert!(!queue.acknowledge(1));
        assert!(queue.acknowledge(0));
        assert_eq!(queue.peek(1)[0].transaction_order, 1);
        queue.clear();
        assert!(queue.is_empty());
    }
}
