// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Registry Cutover
//!
//! Live migration of a domain registry's system of record from a document
//! store to a relational store, without stopping traffic.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TransactionRouter                       │
//! │  • Reads the persisted MigrationState on every request     │
//! │  • Returns the primary manager, read-only when frozen      │
//! └─────────────────────────────────────────────────────────────┘
//!                │                                │
//!                ▼                                ▼
//! ┌───────────────────────────┐    ┌───────────────────────────┐
//! │  Document manager         │    │  Relational manager       │
//! │  (DocKey addressed)       │    │  (RelKey addressed, SQL)  │
//! └───────────────────────────┘    └───────────────────────────┘
//!                │        commit listeners        │
//!                └───────────────┬────────────────┘
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ReplayQueue                           │
//! │  • Captures commits on the current primary                 │
//! │  • ReplayDrainer applies them to the secondary + Cursor    │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Backfill (offline)                         │
//! │  • LogSegmentLister rebuilds the gap-free segment chain    │
//! │  • Segments applied in order with a Cursor per segment     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use registry_cutover::migration::{MigrationState, MigrationStateMachine, TransactionRouter};
//! use registry_cutover::storage::{Backend, MemoryTransactionManager, TransactionManager};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let document: Arc<dyn TransactionManager> = Arc::new(MemoryTransactionManager::document());
//! let relational: Arc<dyn TransactionManager> = Arc::new(MemoryTransactionManager::relational());
//! let machine = MigrationStateMachine::new(relational.clone());
//! let router = TransactionRouter::new(machine.clone(), document, relational);
//!
//! machine.set_state(MigrationState::DocPrimary).await?;
//! let primary = router.current().await?;
//! assert_eq!(primary.backend(), Backend::Document);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`key`]: [`DualKey`] identity usable by either backend
//! - [`storage`]: Transaction managers (memory, SQL, read-only decorator)
//! - [`migration`]: Phases, the persisted state machine, routing
//! - [`replay`]: Commit capture, draining to the secondary, cursors
//! - [`backup`]: Commit log segments, chain listing, backfill
//! - [`commands`]: Operator commands behind the `registry-migration` binary

pub mod backup;
pub mod clock;
pub mod commands;
pub mod config;
pub mod entity;
pub mod key;
pub mod metrics;
pub mod migration;
pub mod replay;
pub mod resilience;
pub mod storage;

pub use backup::{Backfill, ListingError, LogSegment, LogSegmentLister, SegmentError};
pub use clock::{Clock, FakeClock, SystemClock};
pub use config::MigrationConfig;
pub use entity::{Entity, Mutation};
pub use key::{DocKey, DualKey, EntityType, KeyError, KindRegistry, RelKey};
pub use metrics::LatencyTimer;
pub use migration::{MigrationError, MigrationState, MigrationStateMachine, TransactionRouter};
pub use replay::{Cursor, CursorScope, ReplayDrainer, ReplayError, ReplayQueue};
pub use resilience::retry::RetryConfig;
pub use storage::{
    ReadOnlyTransactionManager, StorageError, TransactionManager, TransactionManagerExt,
    TransactionOptions,
};
