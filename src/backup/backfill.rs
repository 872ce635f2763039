// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Seeds a backend from historical commit log segments.
//!
//! Each segment is applied in its own transaction together with a cursor
//! advance to its upper bound, so an interrupted run resumes after the last
//! applied segment.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use super::lister::LogSegmentLister;
use super::object_store::ObjectStore;
use super::segment::{format_checkpoint, read_segment, LogSegment};
use crate::config::MigrationConfig;
use crate::entity::{Entity, Mutation};
use crate::key::{DualKey, KindRegistry};
use crate::metrics::{self, LatencyTimer};
use crate::replay::{prepare_for, Cursor, CursorScope, ReplayError};
use crate::storage::{StorageError, TransactionManager, TransactionManagerExt, TransactionOptions};

/// Cursor scope used by backfill unless overridden.
pub const BACKFILL_SCOPE: &str = "backfill";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// Effective lower bound after consulting the cursor
    pub resumed_from: Option<DateTime<Utc>>,
    pub segments: usize,
    pub mutations: usize,
}

pub struct Backfill {
    lister: LogSegmentLister,
    bucket: String,
    target: Arc<dyn TransactionManager>,
    registry: Arc<KindRegistry>,
    scope: CursorScope,
}

impl Backfill {
    #[must_use]
    pub fn new(
        lister: LogSegmentLister,
        bucket: impl Into<String>,
        target: Arc<dyn TransactionManager>,
        registry: Arc<KindRegistry>,
    ) -> Self {
        Self {
            lister,
            bucket: bucket.into(),
            target,
            registry,
            scope: CursorScope::named(BACKFILL_SCOPE),
        }
    }

    /// Lists from the configured bucket and prefix.
    #[must_use]
    pub fn from_config(
        store: Arc<dyn ObjectStore>,
        target: Arc<dyn TransactionManager>,
        registry: Arc<KindRegistry>,
        config: &MigrationConfig,
    ) -> Self {
        let lister = LogSegmentLister::from_config(store, config);
        Self::new(lister, config.log_bucket.clone(), target, registry)
    }

    #[must_use]
    pub fn with_scope(mut self, scope: CursorScope) -> Self {
        self.scope = scope;
        self
    }

    /// Applies every segment in `(max(from, cursor), to]`, oldest first.
    ///
    /// The chain is listed up front; a broken or forked chain fails before
    /// anything is written.
    pub async fn run(
        &self,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
    ) -> Result<BackfillReport, ReplayError> {
        let _timer = LatencyTimer::new("backfill");
        let target = &*self.target;
        let cursor = target
            .transact_read_only(|| async { Cursor::load(target, &self.scope).await })
            .await?;
        let start = match &cursor {
            Some(cursor) if cursor.position > from => cursor.position,
            _ => from,
        };
        if start != from {
            info!(
                scope = %self.scope,
                requested = %format_checkpoint(from),
                resuming = %format_checkpoint(start),
                "Resuming backfill from cursor"
            );
        }

        let segments = self.lister.list(&self.bucket, start, to).await?;
        let mut report = BackfillReport {
            resumed_from: Some(start),
            ..BackfillReport::default()
        };
        for segment in &segments {
            let applied = self.apply_segment(segment).await?;
            metrics::record_backfill_segment(applied);
            report.segments += 1;
            report.mutations += applied;
        }
        info!(
            bucket = %self.bucket,
            target = %target.backend(),
            segments = report.segments,
            mutations = report.mutations,
            "Backfill complete"
        );
        Ok(report)
    }

    async fn apply_segment(&self, segment: &LogSegment) -> Result<usize, ReplayError> {
        let mutations = read_segment(&**self.lister.store(), &self.bucket, segment, &self.registry).await?;
        let backend = self.target.backend();
        let mutations = mutations
            .iter()
            .map(|m| prepare_for(m, backend))
            .collect::<Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;
        let count = mutations.len();
        let target = &*self.target;

        target
            .try_transact_with(TransactionOptions::requires_new(), || async {
                for run in runs(mutations) {
                    match run {
                        Run::Upserts(entities) => target.upsert_all(entities).await?,
                        Run::Deletes(keys) => target.delete_all(keys).await?,
                    }
                }
                Cursor::advance(target, &self.scope, segment.upper_bound).await?;
                Ok::<_, ReplayError>(())
            })
            .await?;
        info!(segment = %segment.name, mutations = count, "Applied segment");
        Ok(count)
    }
}

enum Run {
    Upserts(Vec<Entity>),
    Deletes(Vec<DualKey>),
}

/// Groups consecutive mutations of the same kind, keeping their order.
fn runs(mutations: Vec<Mutation>) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();
    for mutation in mutations {
        match (mutation, runs.last_mut()) {
            (Mutation::Upsert(entity), Some(Run::Upserts(batch))) => batch.push(entity),
            (Mutation::Delete(key), Some(Run::Deletes(batch))) => batch.push(key),
            (Mutation::Upsert(entity), _) => runs.push(Run::Upserts(vec![entity])),
            (Mutation::Delete(key), _) => runs.push(Run::Deletes(vec![key])),
        }
    }
    runs
}
