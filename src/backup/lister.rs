// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Gap-free reconstruction of the segment chain over a time window.
//!
//! The listing is only a hint. The chain is rebuilt by walking lower bounds
//! backward from the newest listed segment, probing canonical names for
//! segments the listing missed. Anything short of one unbroken chain that
//! accounts for every listed segment fails the whole call.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::object_store::{ObjectInfo, ObjectStore, ObjectStoreError};
use super::segment::{format_checkpoint, parse_checkpoint, segment_name, LogSegment};
use super::{ListingError, DEFAULT_SEGMENT_PREFIX};
use crate::config::MigrationConfig;
use crate::metrics::{self, LatencyTimer};

const DEFAULT_POOL_SIZE: usize = 20;

type FetchResult = (DateTime<Utc>, String, Result<Option<ObjectInfo>, ObjectStoreError>);

pub struct LogSegmentLister {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    pool_size: usize,
}

impl LogSegmentLister {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            prefix: DEFAULT_SEGMENT_PREFIX.to_string(),
            pool_size: DEFAULT_POOL_SIZE,
        }
    }

    #[must_use]
    pub fn from_config(store: Arc<dyn ObjectStore>, config: &MigrationConfig) -> Self {
        Self::new(store)
            .with_prefix(config.log_prefix.clone())
            .with_pool_size(config.lister_pool_size)
    }

    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Max concurrent metadata fetches (at least 1).
    #[must_use]
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Segments covering `(from, to]` in ascending order.
    ///
    /// Segments ending at or before `from` are excluded; `to` is inclusive
    /// and `None` means no upper limit. Returns an empty list when nothing
    /// in the range is listed, and never a partial chain.
    pub async fn list(
        &self,
        bucket: &str,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<LogSegment>, ListingError> {
        let _timer = LatencyTimer::new("list_segments");
        info!(
            bucket,
            from = %format_checkpoint(from),
            to = ?to.map(format_checkpoint),
            "Listing commit log segments"
        );

        let candidates = self.candidates(bucket, from, to).await?;
        let Some(head) = candidates.keys().next_back().copied() else {
            info!(bucket, "No segments found");
            metrics::record_segments_listed(0);
            return Ok(Vec::new());
        };
        let listed = self.fetch_all(bucket, candidates).await?;

        let mut chain = BTreeMap::new();
        let mut healed = 0;
        if let Some(missing) = self.walk(bucket, &listed, from, head, &mut chain, &mut healed).await? {
            error!(
                bucket,
                missing = %missing,
                head = %format_checkpoint(head),
                from = %format_checkpoint(from),
                to = ?to.map(format_checkpoint),
                "Gap in commit log segment chain"
            );
            metrics::record_chain_failure("gap");
            return Err(ListingError::ChainBroken { missing, head, from, to });
        }

        let orphans: Vec<DateTime<Utc>> = listed
            .keys()
            .rev()
            .filter(|upper| !chain.contains_key(*upper))
            .copied()
            .collect();
        if !orphans.is_empty() {
            self.trace_orphans(bucket, &listed, from, &mut chain, &mut healed).await?;
            let names: Vec<&str> = orphans
                .iter()
                .filter_map(|upper| listed.get(upper).map(|s| s.name.as_str()))
                .collect();
            error!(bucket, head = %format_checkpoint(head), orphans = ?names, "Forked commit log history");
            metrics::record_chain_failure("fork");
            return Err(ListingError::ChainForkUnresolved(format!(
                "{} listed segment(s) are not on the chain ending at {}: {}",
                names.len(),
                format_checkpoint(head),
                names.join(", ")
            )));
        }

        let segments: Vec<LogSegment> = chain.into_values().collect();
        if let Some(first) = segments.first() {
            info!(
                bucket,
                segments = segments.len(),
                healed,
                actual_from = %format_checkpoint(first.lower_bound),
                "Found segment chain"
            );
        }
        metrics::record_segments_listed(segments.len());
        metrics::record_segments_healed(healed);
        Ok(segments)
    }

    /// Listed names with their upper bound in `(from, to]`.
    async fn candidates(
        &self,
        bucket: &str,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
    ) -> Result<BTreeMap<DateTime<Utc>, String>, ListingError> {
        let mut candidates = BTreeMap::new();
        for name in self.store.list(bucket, &self.prefix).await? {
            let upper = name
                .strip_prefix(self.prefix.as_str())
                .and_then(|suffix| parse_checkpoint(suffix).ok())
                .ok_or_else(|| ListingError::MalformedSegmentName(name.clone()))?;
            if upper <= from || to.is_some_and(|to| upper > to) {
                continue;
            }
            if let Some(other) = candidates.insert(upper, name.clone()) {
                metrics::record_chain_failure("tie");
                return Err(ListingError::ChainForkUnresolved(format!(
                    "{other} and {name} both end at {}",
                    format_checkpoint(upper)
                )));
            }
        }
        Ok(candidates)
    }

    /// Fetches metadata of every candidate on a bounded pool.
    async fn fetch_all(
        &self,
        bucket: &str,
        candidates: BTreeMap<DateTime<Utc>, String>,
    ) -> Result<BTreeMap<DateTime<Utc>, LogSegment>, ListingError> {
        let semaphore = Arc::new(Semaphore::new(self.pool_size));
        let mut join_set: JoinSet<FetchResult> = JoinSet::new();
        for (upper, name) in candidates {
            let store = self.store.clone();
            let semaphore = semaphore.clone();
            let bucket = bucket.to_string();
            join_set.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => store.stat(&bucket, &name).await,
                    Err(e) => Err(ObjectStoreError::Unavailable(e.to_string())),
                };
                (upper, name, result)
            });
        }

        let mut listed = BTreeMap::new();
        while let Some(joined) = join_set.join_next().await {
            let (upper, name, result) = joined.map_err(|e| ListingError::FetchTask(e.to_string()))?;
            let info = result?.ok_or_else(|| ListingError::MissingObject(name.clone()))?;
            listed.insert(upper, to_segment(&info, upper)?);
        }
        debug!(bucket, segments = listed.len(), "Fetched segment metadata");
        Ok(listed)
    }

    /// Follows lower bounds from `start` down to `from`, adding each segment
    /// to `chain`. Returns the canonical name of the first segment that
    /// could not be found, if any.
    async fn walk(
        &self,
        bucket: &str,
        listed: &BTreeMap<DateTime<Utc>, LogSegment>,
        from: DateTime<Utc>,
        start: DateTime<Utc>,
        chain: &mut BTreeMap<DateTime<Utc>, LogSegment>,
        healed: &mut usize,
    ) -> Result<Option<String>, ListingError> {
        let mut checkpoint = start;
        while checkpoint > from {
            let segment = match listed.get(&checkpoint) {
                Some(segment) => segment.clone(),
                None => {
                    let name = segment_name(&self.prefix, checkpoint);
                    let Some(info) = self.store.stat(bucket, &name).await? else {
                        warn!(bucket, missing = %name, "Segment absent from listing and storage");
                        return Ok(Some(name));
                    };
                    info!(bucket, segment = %name, "Found segment missing from listing");
                    *healed += 1;
                    to_segment(&info, checkpoint)?
                }
            };
            checkpoint = segment.lower_bound;
            chain.insert(segment.upper_bound, segment);
        }
        Ok(None)
    }

    /// Walks back from each listed segment the head walk did not reach,
    /// newest first, for the diagnostics.
    async fn trace_orphans(
        &self,
        bucket: &str,
        listed: &BTreeMap<DateTime<Utc>, LogSegment>,
        from: DateTime<Utc>,
        chain: &mut BTreeMap<DateTime<Utc>, LogSegment>,
        healed: &mut usize,
    ) -> Result<(), ListingError> {
        while let Some(orphan) = listed.keys().rev().find(|upper| !chain.contains_key(*upper)).copied() {
            warn!(
                bucket,
                orphan = %format_checkpoint(orphan),
                "Listed segment is not on the main chain"
            );
            if let Some(missing) = self.walk(bucket, listed, from, orphan, chain, healed).await? {
                warn!(bucket, orphan = %format_checkpoint(orphan), missing = %missing, "Orphan chain is broken");
                break;
            }
        }
        Ok(())
    }
}

fn to_segment(info: &ObjectInfo, upper: DateTime<Utc>) -> Result<LogSegment, ListingError> {
    let segment =
        LogSegment::from_info(info, upper).ok_or_else(|| ListingError::MissingLowerBound(info.name.clone()))?;
    if segment.lower_bound >= segment.upper_bound {
        return Err(ListingError::InvalidBounds {
            name: segment.name,
            lower: segment.lower_bound,
        });
    }
    Ok(segment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::segment::LOWER_BOUND_METADATA_KEY;
    use crate::backup::{LogSegmentWriter, MemoryObjectStore};
    use chrono::{Duration, TimeZone};

    const BUCKET: &str = "commit-logs";

    fn t(i: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 2, 1, 0, 0, 0).unwrap() + Duration::minutes(i)
    }

    /// Segments `(t(i-1), t(i)]` for `i` in `1..=n`.
    async fn chained(n: i64) -> (Arc<MemoryObjectStore>, LogSegmentLister) {
        let store = Arc::new(MemoryObjectStore::new());
        let writer = LogSegmentWriter::new(store.clone(), BUCKET, DEFAULT_SEGMENT_PREFIX);
        for i in 1..=n {
            writer.write(t(i - 1), t(i), &[]).await.unwrap();
        }
        let lister = LogSegmentLister::new(store.clone()).with_pool_size(2);
        (store, lister)
    }

    fn uppers(segments: &[LogSegment]) -> Vec<DateTime<Utc>> {
        segments.iter().map(|s| s.upper_bound).collect()
    }

    #[tokio::test]
    async fn test_full_chain_ascending() {
        let (_, lister) = chained(5).await;
        let segments = lister.list(BUCKET, t(0), None).await.unwrap();
        assert_eq!(uppers(&segments), (1..=5).map(t).collect::<Vec<_>>());
        assert!(segments.windows(2).all(|w| w[1].lower_bound == w[0].upper_bound));
    }

    #[tokio::test]
    async fn test_window_selects_upper_bounds_in_range() {
        let (_, lister) = chained(5).await;
        assert_eq!(uppers(&lister.list(BUCKET, t(1), Some(t(2))).await.unwrap()), vec![t(2)]);
        assert_eq!(
            uppers(&lister.list(BUCKET, t(2), Some(t(4))).await.unwrap()),
            vec![t(3), t(4)]
        );
        // from falls inside a segment: that segment is still needed
        let mid = t(2) + Duration::seconds(30);
        assert_eq!(uppers(&lister.list(BUCKET, mid, None).await.unwrap()), vec![t(3), t(4), t(5)]);
    }

    #[tokio::test]
    async fn test_empty_range() {
        let (_, lister) = chained(3).await;
        assert!(lister.list(BUCKET, t(3), None).await.unwrap().is_empty());
        assert!(lister.list("no-such-bucket", t(0), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_heals_listing_gaps() {
        let (store, lister) = chained(5).await;
        store.hide_from_listing(BUCKET, &segment_name(DEFAULT_SEGMENT_PREFIX, t(2)));
        store.hide_from_listing(BUCKET, &segment_name(DEFAULT_SEGMENT_PREFIX, t(3)));
        let segments = lister.list(BUCKET, t(0), None).await.unwrap();
        assert_eq!(uppers(&segments), (1..=5).map(t).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_missing_segment_fails_closed() {
        let (store, lister) = chained(5).await;
        let missing = segment_name(DEFAULT_SEGMENT_PREFIX, t(3));
        store.remove(BUCKET, &missing);
        match lister.list(BUCKET, t(0), None).await {
            Err(ListingError::ChainBroken { missing: name, head, .. }) => {
                assert_eq!(name, missing);
                assert_eq!(head, t(5));
            }
            other => panic!("expected ChainBroken, got {other:?}"),
        }
        // the part above the gap is intact and still listable
        assert_eq!(uppers(&lister.list(BUCKET, t(3), None).await.unwrap()), vec![t(4), t(5)]);
    }

    #[tokio::test]
    async fn test_orphan_is_a_fork() {
        let (store, lister) = chained(3).await;
        // a second segment claiming to follow t(2)
        let writer = LogSegmentWriter::new(store.clone(), BUCKET, DEFAULT_SEGMENT_PREFIX);
        writer.write(t(2), t(2) + Duration::seconds(10), &[]).await.unwrap();
        assert!(matches!(
            lister.list(BUCKET, t(0), None).await,
            Err(ListingError::ChainForkUnresolved(_))
        ));
    }

    #[tokio::test]
    async fn test_gap_takes_precedence_over_fork() {
        let (store, lister) = chained(4).await;
        let writer = LogSegmentWriter::new(store.clone(), BUCKET, DEFAULT_SEGMENT_PREFIX);
        writer.write(t(1), t(1) + Duration::seconds(10), &[]).await.unwrap();
        store.remove(BUCKET, &segment_name(DEFAULT_SEGMENT_PREFIX, t(3)));
        assert!(matches!(
            lister.list(BUCKET, t(0), None).await,
            Err(ListingError::ChainBroken { .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_checkpoint_is_a_fork() {
        let (store, lister) = chained(2).await;
        let metadata = std::collections::BTreeMap::from([(
            LOWER_BOUND_METADATA_KEY.to_string(),
            format_checkpoint(t(1)),
        )]);
        // same instant as t(2), different spelling
        let alias = format!("{DEFAULT_SEGMENT_PREFIX}2021-02-01T00:02:00Z");
        store.write(BUCKET, &alias, Vec::new(), metadata).await.unwrap();
        assert!(matches!(
            lister.list(BUCKET, t(0), None).await,
            Err(ListingError::ChainForkUnresolved(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_name_fails() {
        let (store, lister) = chained(2).await;
        let name = format!("{DEFAULT_SEGMENT_PREFIX}not-a-time");
        store
            .write(BUCKET, &name, Vec::new(), Default::default())
            .await
            .unwrap();
        assert!(matches!(
            lister.list(BUCKET, t(0), None).await,
            Err(ListingError::MalformedSegmentName(n)) if n == name
        ));
    }

    #[tokio::test]
    async fn test_metadata_problems_fail() {
        let (store, lister) = chained(2).await;
        let name = segment_name(DEFAULT_SEGMENT_PREFIX, t(3));
        store.write(BUCKET, &name, Vec::new(), Default::default()).await.unwrap();
        assert!(matches!(
            lister.list(BUCKET, t(0), None).await,
            Err(ListingError::MissingLowerBound(n)) if n == name
        ));

        let (store, lister) = chained(3).await;
        store.fail_stat(BUCKET, &segment_name(DEFAULT_SEGMENT_PREFIX, t(2)));
        assert!(matches!(
            lister.list(BUCKET, t(0), None).await,
            Err(ListingError::Storage(ObjectStoreError::Unavailable(_)))
        ));
    }
}
