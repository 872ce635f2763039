// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::Arc;

use tracing::debug;

use super::{MigrationError, MigrationState, MigrationStateMachine};
use crate::replay::ReplayQueue;
use crate::storage::{Backend, ReadOnlyTransactionManager, TransactionManager};

/// Hands out the transaction manager for the current phase.
pub struct TransactionRouter {
    machine: MigrationStateMachine,
    document: Arc<dyn TransactionManager>,
    relational: Arc<dyn TransactionManager>,
    capture: Option<Arc<ReplayQueue>>,
}

impl TransactionRouter {
    #[must_use]
    pub fn new(
        machine: MigrationStateMachine,
        document: Arc<dyn TransactionManager>,
        relational: Arc<dyn TransactionManager>,
    ) -> Self {
        Self {
            machine,
            document,
            relational,
            capture: None,
        }
    }

    /// Points `queue` at each phase's replay source as phases are observed.
    #[must_use]
    pub fn with_replay_queue(mut self, queue: Arc<ReplayQueue>) -> Self {
        self.capture = Some(queue);
        self
    }

    #[must_use]
    pub fn manager(&self, backend: Backend) -> &Arc<dyn TransactionManager> {
        match backend {
            Backend::Document => &self.document,
            Backend::Relational => &self.relational,
        }
    }

    /// The authoritative manager right now.
    ///
    /// Writes through it fail in the read-only phases.
    pub async fn current(&self) -> Result<Arc<dyn TransactionManager>, MigrationError> {
        let state = self.observe().await?;
        let primary = self.manager(state.primary_backend()).clone();
        if state.is_read_only() {
            return Ok(Arc::new(ReadOnlyTransactionManager::new(primary)));
        }
        Ok(primary)
    }

    /// The non-authoritative manager while both backends are live, for
    /// draining replay and comparing contents.
    pub async fn replica(&self) -> Result<Option<Arc<dyn TransactionManager>>, MigrationError> {
        let state = self.observe().await?;
        Ok(match state {
            MigrationState::DocOnly | MigrationState::RelOnly => None,
            _ => Some(self.manager(state.primary_backend().other()).clone()),
        })
    }

    async fn observe(&self) -> Result<MigrationState, MigrationError> {
        let state = self.machine.current().await?;
        debug!(state = %state, "Routing by migration state");
        if let Some(queue) = &self.capture {
            queue.set_source(state.replay_source());
        }
        Ok(state)
    }
}
