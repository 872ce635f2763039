// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Live mirroring of committed mutations into the non-authoritative backend.
//!
//! ```text
//!   primary.transact(..) ──commit──▶ ReplayQueue (CommitListener)
//!                                        │  FIFO, one entry per mutation,
//!                                        │  grouped by transaction
//!                                        ▼
//!                                  ReplayDrainer ──requires-new tx──▶ secondary
//!                                        │                (mutations + Cursor)
//!                                        ▼
//!                                  acknowledge
//! ```
//!
//! The cursor is advanced in the same transaction that applies a captured
//! transaction, so a transaction offered again after its apply committed is
//! skipped. Positions come from the capturing process's clock; a drainer
//! lifts its queue above the stored cursor before its first pass, so a
//! restart with a lagging clock never hides new commits behind the cursor.

pub mod cursor;
pub mod drain;
pub mod queue;
pub mod verify;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::backup::{ListingError, SegmentError};
use crate::entity::Mutation;
use crate::key::KeyError;
use crate::storage::{Backend, StorageError};

pub use cursor::{Cursor, CursorScope, CURSOR_KIND};
pub use drain::{DrainReport, ReplayDrainer};
pub use queue::{CapturedTransaction, ReplayEntry, ReplayQueue};
pub use verify::{ConsistencyChecker, ConsistencyReport, KindReport};

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("cursor {scope} cannot move back from {current} to {requested}")]
    CursorRegression {
        scope: String,
        current: DateTime<Utc>,
        requested: DateTime<Utc>,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Listing(#[from] ListingError),
    #[error(transparent)]
    Segment(#[from] SegmentError),
}

/// Readies a mutation for `target`. Document targets need a document key,
/// which root entities can derive from their relational key.
pub(crate) fn prepare_for(mutation: &Mutation, target: Backend) -> Result<Mutation, KeyError> {
    if target != Backend::Document || mutation.key().try_doc().is_some() {
        return Ok(mutation.clone());
    }
    let key = mutation.key().restore_doc(None)?;
    Ok(match mutation {
        Mutation::Upsert(entity) => Mutation::Upsert(entity.with_key(key)),
        Mutation::Delete(_) => Mutation::Delete(key),
    })
}
