// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Commit log segments in object storage and the backfill built on them.
//!
//! Each segment covers `(lower, upper]` in checkpoint time. The upper bound
//! is part of the object name, the lower bound is object metadata, so a
//! chain can be followed backward one `stat` at a time:
//!
//! ```text
//!   commit_diff_until_T1      commit_diff_until_T2      commit_diff_until_T3
//!   lower = T0                lower = T1                lower = T2
//!        ▲                         │  ▲                      │
//!        └─────────────────────────┘  └──────────────────────┘
//! ```
//!
//! Listings are eventually consistent; [`LogSegmentLister`] probes canonical
//! names to fill gaps and refuses to return anything but a complete chain.

pub mod backfill;
pub mod lister;
pub mod object_store;
pub mod segment;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::key::KeyError;

pub use backfill::{Backfill, BackfillReport, BACKFILL_SCOPE};
pub use lister::LogSegmentLister;
pub use object_store::{FsObjectStore, MemoryObjectStore, ObjectInfo, ObjectStore, ObjectStoreError};
pub use segment::{
    format_checkpoint, parse_checkpoint, segment_name, LogSegment, LogSegmentWriter, SegmentRecord,
    LOWER_BOUND_METADATA_KEY,
};

/// Object name prefix of commit log segments.
pub const DEFAULT_SEGMENT_PREFIX: &str = "commit_diff_until_";

#[derive(Error, Debug)]
pub enum ListingError {
    #[error(
        "segment chain ending at {head} is broken: missing {missing} (requested {from} to {})",
        .to.map_or_else(|| "now".to_string(), |t| t.to_string())
    )]
    ChainBroken {
        missing: String,
        head: DateTime<Utc>,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
    },
    #[error("segment history has forks: {0}")]
    ChainForkUnresolved(String),
    #[error("malformed segment name: {0}")]
    MalformedSegmentName(String),
    /// Metadata lacks a parseable lower bound
    #[error("segment {0} has no valid lower bound")]
    MissingLowerBound(String),
    #[error("segment {name} lower bound {lower} is not before its upper bound")]
    InvalidBounds { name: String, lower: DateTime<Utc> },
    #[error("listed segment {0} does not exist")]
    MissingObject(String),
    #[error(transparent)]
    Storage(#[from] ObjectStoreError),
    #[error("metadata fetch task failed: {0}")]
    FetchTask(String),
}

#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("malformed checkpoint {0:?}")]
    MalformedCheckpoint(String),
    #[error("segment bounds out of order: {lower} is not before {upper}")]
    InvalidBounds {
        lower: DateTime<Utc>,
        upper: DateTime<Utc>,
    },
    #[error("unknown segment record op {0:?}")]
    UnknownOp(String),
    #[error("upsert record for {0} has no payload")]
    MissingPayload(String),
    #[error("segment body compression failed: {0}")]
    Compression(String),
    #[error("segment body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Storage(#[from] ObjectStoreError),
}
