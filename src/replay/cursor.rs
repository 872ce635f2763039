// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable resumption marker for replay and backfill.
//!
//! One cursor per scope, stored as an entity in the backend being written
//! to, so the marker commits atomically with the writes it describes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::ReplayError;
use crate::entity::Entity;
use crate::key::{DualKey, EntityType, RelKey};
use crate::storage::{StorageError, TransactionManager};

pub const CURSOR_KIND: EntityType = EntityType::new("Cursor", "Cursor");

const GLOBAL_SCOPE: &str = "GLOBAL";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CursorScope {
    Global,
    /// A named cursor. The name `GLOBAL` is the global cursor.
    Namespaced(String),
}

impl CursorScope {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        CursorScope::Namespaced(name.into())
    }

    fn as_str(&self) -> &str {
        match self {
            CursorScope::Global => GLOBAL_SCOPE,
            CursorScope::Namespaced(name) => name,
        }
    }

    fn key(&self) -> DualKey {
        DualKey::root(CURSOR_KIND, RelKey::from(self.as_str()))
    }
}

impl fmt::Display for CursorScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Option<String>> for CursorScope {
    fn from(name: Option<String>) -> Self {
        name.map_or(CursorScope::Global, CursorScope::Namespaced)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub scope: CursorScope,
    pub position: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorRecord {
    scope: String,
    position: DateTime<Utc>,
    last_update_time: DateTime<Utc>,
}

impl Cursor {
    /// The cursor for `scope`, if it was ever advanced.
    pub async fn load(
        manager: &dyn TransactionManager,
        scope: &CursorScope,
    ) -> Result<Option<Cursor>, StorageError> {
        manager.assert_in_transaction()?;
        let Some(entity) = manager.load(&scope.key()).await? else {
            return Ok(None);
        };
        let record: CursorRecord = serde_json::from_value(entity.into_payload())?;
        Ok(Some(Cursor {
            scope: scope.clone(),
            position: record.position,
            last_update_time: record.last_update_time,
        }))
    }

    /// Moves the cursor forward to `position`, creating it if needed.
    ///
    /// Advancing to the current position is a no-op; moving backward fails
    /// with [`ReplayError::CursorRegression`].
    pub async fn advance(
        manager: &dyn TransactionManager,
        scope: &CursorScope,
        position: DateTime<Utc>,
    ) -> Result<Cursor, ReplayError> {
        if let Some(current) = Self::load(manager, scope).await? {
            if position < current.position {
                return Err(ReplayError::CursorRegression {
                    scope: scope.to_string(),
                    current: current.position,
                    requested: position,
                });
            }
            if position == current.position {
                return Ok(current);
            }
        }
        Ok(Self::store(manager, scope, position).await?)
    }

    /// Sets the cursor to `position` unconditionally. Operator use only.
    pub async fn reset(
        manager: &dyn TransactionManager,
        scope: &CursorScope,
        position: DateTime<Utc>,
    ) -> Result<Cursor, StorageError> {
        manager.assert_in_transaction()?;
        warn!(scope = %scope, position = %position, "Resetting cursor");
        Self::store(manager, scope, position).await
    }

    async fn store(
        manager: &dyn TransactionManager,
        scope: &CursorScope,
        position: DateTime<Utc>,
    ) -> Result<Cursor, StorageError> {
        let cursor = Cursor {
            scope: scope.clone(),
            position,
            last_update_time: manager.transaction_time()?,
        };
        let record = CursorRecord {
            scope: scope.to_string(),
            position,
            last_update_time: cursor.last_update_time,
        };
        manager
            .upsert(Entity::new(scope.key(), serde_json::to_value(record)?))
            .await?;
        Ok(cursor)
    }
}
