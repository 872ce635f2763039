// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Task-scoped registry of open transactions.
//!
//! Each running transaction is visible only to the task executing its work,
//! keyed by the owning manager. Entering a scope for a manager that already
//! has one shadows the outer transaction until the inner future completes,
//! which is exactly the suspend/resume behaviour of requires-new.

use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a transaction manager instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ManagerId(u64);

impl ManagerId {
    pub(crate) fn next() -> Self {
        ManagerId(NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

type OpenTransaction = Arc<dyn Any + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct ActiveTransactions {
    entries: Vec<(ManagerId, OpenTransaction)>,
}

tokio::task_local! {
    static ACTIVE: ActiveTransactions;
}

impl ActiveTransactions {
    /// The calling task's open transaction for `manager`, if any.
    pub(crate) fn current<T: Any + Send + Sync>(manager: ManagerId) -> Option<Arc<T>> {
        let open = ACTIVE
            .try_with(|active| {
                active
                    .entries
                    .iter()
                    .rev()
                    .find(|(id, _)| *id == manager)
                    .map(|(_, tx)| Arc::clone(tx))
            })
            .ok()
            .flatten()?;
        open.downcast::<T>().ok()
    }

    /// Runs `future` with `transaction` as `manager`'s open transaction.
    pub(crate) async fn enter<T, F>(manager: ManagerId, transaction: Arc<T>, future: F) -> F::Output
    where
        T: Any + Send + Sync,
        F: Future,
    {
        let mut next = ACTIVE.try_with(|active| active.clone()).unwrap_or_default();
        next.entries.retain(|(id, _)| *id != manager);
        next.entries.push((manager, transaction as OpenTransaction));
        ACTIVE.scope(next, future).await
    }
}
