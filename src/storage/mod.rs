// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transaction managers for the document and relational backends.

pub mod memory;
pub(crate) mod pending;
pub mod read_only;
pub(crate) mod scope;
pub mod sql;
pub mod traits;

pub use memory::MemoryTransactionManager;
pub use read_only::ReadOnlyTransactionManager;
pub use sql::SqlTransactionManager;
pub use traits::{
    Backend, CommitListener, CommittedTransaction, IsolationLevel, Propagation, StorageError,
    TransactionManager, TransactionManagerExt, TransactionOptions, Work, WorkFuture,
    READ_ONLY_MESSAGE,
};
