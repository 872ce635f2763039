// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cutover phases and the persisted state machine that moves between them.
//!
//! ```text
//! DOC_ONLY ⇄ DOC_PRIMARY ⇄ DOC_PRIMARY_READ_ONLY ⇄ REL_PRIMARY ⇄ REL_PRIMARY_READ_ONLY ⇄ REL_ONLY
//! ```
//!
//! Each request asks the [`TransactionRouter`] for a manager; the router
//! consults the [`MigrationStateMachine`] every time, so a transition takes
//! effect for the next request without restarts.

pub mod machine;
pub mod router;
pub mod state;

use thiserror::Error;

use crate::storage::StorageError;

pub use machine::{MigrationStateMachine, MigrationStateRecord, StateTransition, MIGRATION_STATE_KIND};
pub use router::TransactionRouter;
pub use state::MigrationState;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("illegal migration state transition from {from} to {to}")]
    IllegalTransition {
        from: MigrationState,
        to: MigrationState,
    },
    #[error("unknown migration state: {0}")]
    UnknownState(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("migration state record is corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
