// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{MigrationError, MigrationState};
use crate::entity::Entity;
use crate::key::{DualKey, EntityType, RelKey};
use crate::metrics;
use crate::storage::{IsolationLevel, TransactionManager, TransactionManagerExt, TransactionOptions};

pub const MIGRATION_STATE_KIND: EntityType =
    EntityType::new("MigrationStateRecord", "MigrationStateRecord");

/// The single persisted migration state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStateRecord {
    pub state: MigrationState,
    pub last_transition_time: DateTime<Utc>,
}

impl MigrationStateRecord {
    fn key() -> DualKey {
        DualKey::root(MIGRATION_STATE_KIND, RelKey::Long(1))
    }

    fn to_entity(&self) -> Result<Entity, MigrationError> {
        let payload = serde_json::to_value(self).map_err(|e| MigrationError::Corrupt(e.to_string()))?;
        Ok(Entity::new(Self::key(), payload))
    }

    fn from_entity(entity: Entity) -> Result<Self, MigrationError> {
        serde_json::from_value(entity.into_payload()).map_err(|e| MigrationError::Corrupt(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: MigrationState,
    pub to: MigrationState,
    pub at: DateTime<Utc>,
}

/// Reads and moves the persisted migration state.
///
/// The record lives in whichever backend `manager` talks to; an absent
/// record reads as [`MigrationState::DocOnly`].
#[derive(Clone)]
pub struct MigrationStateMachine {
    manager: Arc<dyn TransactionManager>,
}

impl MigrationStateMachine {
    #[must_use]
    pub fn new(manager: Arc<dyn TransactionManager>) -> Self {
        Self { manager }
    }

    pub async fn record(&self) -> Result<Option<MigrationStateRecord>, MigrationError> {
        let key = MigrationStateRecord::key();
        let entity = self
            .manager
            .transact_read_only(|| async { self.manager.load(&key).await })
            .await?;
        entity.map(MigrationStateRecord::from_entity).transpose()
    }

    pub async fn current(&self) -> Result<MigrationState, MigrationError> {
        Ok(self
            .record()
            .await?
            .map_or(MigrationState::DocOnly, |record| record.state))
    }

    /// Moves to `next` if the adjacency table allows it.
    ///
    /// Runs in its own serializable transaction, independent of any the
    /// caller has open, and stamps the record with that transaction's time.
    pub async fn set_state(&self, next: MigrationState) -> Result<StateTransition, MigrationError> {
        let options = TransactionOptions::requires_new().with_isolation(IsolationLevel::Serializable);
        let key = MigrationStateRecord::key();
        let transition = self
            .manager
            .try_transact_with(options, || async {
                let from = match self.manager.load(&key).await? {
                    Some(entity) => MigrationStateRecord::from_entity(entity)?.state,
                    None => MigrationState::DocOnly,
                };
                if !from.can_transition_to(next) {
                    return Err(MigrationError::IllegalTransition { from, to: next });
                }
                let record = MigrationStateRecord {
                    state: next,
                    last_transition_time: self.manager.transaction_time()?,
                };
                self.manager.upsert(record.to_entity()?).await?;
                Ok(StateTransition {
                    from,
                    to: next,
                    at: record.last_transition_time,
                })
            })
            .await?;

        info!(
            from = %transition.from,
            to = %transition.to,
            at = %transition.at,
            "Migration state changed"
        );
        metrics::record_state_transition(transition.from.as_str(), transition.to.as_str());
        metrics::set_migration_phase(transition.to.ordinal());
        Ok(transition)
    }
}
