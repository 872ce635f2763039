// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Segment naming, checkpoint format and the record body codec.
//!
//! A segment body is a JSON array of [`SegmentRecord`]s. Bodies are stored
//! zstd-compressed when that is smaller; readers detect compression by the
//! zstd magic bytes, so plain JSON bodies stay readable.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::object_store::{ObjectInfo, ObjectStore};
use super::SegmentError;
use crate::entity::{Entity, Mutation};
use crate::key::{DualKey, KindRegistry};

/// Object metadata key holding a segment's lower bound checkpoint.
pub const LOWER_BOUND_METADATA_KEY: &str = "lowerBoundCheckpoint";

/// Zstd magic bytes (little-endian): 0xFD2FB528
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

const COMPRESSION_LEVEL: i32 = 3;

/// RFC 3339 with millisecond precision and a `Z` suffix.
#[must_use]
pub fn format_checkpoint(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses any RFC 3339 timestamp into UTC.
pub fn parse_checkpoint(s: &str) -> Result<DateTime<Utc>, SegmentError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| SegmentError::MalformedCheckpoint(s.to_string()))
}

/// Canonical object name of the segment ending at `upper`.
#[must_use]
pub fn segment_name(prefix: &str, upper: DateTime<Utc>) -> String {
    format!("{prefix}{}", format_checkpoint(upper))
}

/// A segment covering `(lower_bound, upper_bound]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSegment {
    pub name: String,
    pub upper_bound: DateTime<Utc>,
    pub lower_bound: DateTime<Utc>,
}

impl LogSegment {
    /// Builds a segment from stored metadata. `None` if the lower bound is
    /// absent or unparseable.
    pub(crate) fn from_info(info: &ObjectInfo, upper_bound: DateTime<Utc>) -> Option<Self> {
        let lower = info.metadata.get(LOWER_BOUND_METADATA_KEY)?;
        Some(Self {
            name: info.name.clone(),
            upper_bound,
            lower_bound: parse_checkpoint(lower).ok()?,
        })
    }
}

/// One mutation as it appears in a segment body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub op: String,
    /// DualKey wire form
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl SegmentRecord {
    #[must_use]
    pub fn from_mutation(mutation: &Mutation) -> Self {
        Self {
            op: mutation.op_name().to_string(),
            key: mutation.key().stringify(),
            payload: match mutation {
                Mutation::Upsert(entity) => Some(entity.payload().clone()),
                Mutation::Delete(_) => None,
            },
        }
    }

    pub fn into_mutation(self, registry: &KindRegistry) -> Result<Mutation, SegmentError> {
        let key = DualKey::parse(&self.key, registry)?;
        match self.op.as_str() {
            "UPSERT" => {
                let payload = self.payload.ok_or(SegmentError::MissingPayload(self.key))?;
                Ok(Mutation::Upsert(Entity::new(key, payload)))
            }
            "DELETE" => Ok(Mutation::Delete(key)),
            _ => Err(SegmentError::UnknownOp(self.op)),
        }
    }
}

/// Serializes `mutations` into a segment body.
pub fn encode_body(mutations: &[Mutation]) -> Result<Vec<u8>, SegmentError> {
    let records: Vec<SegmentRecord> = mutations.iter().map(SegmentRecord::from_mutation).collect();
    let json = serde_json::to_vec(&records)?;
    let compressed = zstd::encode_all(json.as_slice(), COMPRESSION_LEVEL)
        .map_err(|e| SegmentError::Compression(e.to_string()))?;
    Ok(if compressed.len() < json.len() { compressed } else { json })
}

/// Parses a segment body, resolving key kinds through `registry`.
pub fn decode_body(body: &[u8], registry: &KindRegistry) -> Result<Vec<Mutation>, SegmentError> {
    let records: Vec<SegmentRecord> = if is_compressed(body) {
        let json = zstd::decode_all(body).map_err(|e| SegmentError::Compression(e.to_string()))?;
        serde_json::from_slice(&json)?
    } else {
        serde_json::from_slice(body)?
    };
    records
        .into_iter()
        .map(|record| record.into_mutation(registry))
        .collect()
}

#[inline]
fn is_compressed(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == ZSTD_MAGIC
}

/// Reads and decodes one segment.
pub async fn read_segment(
    store: &dyn ObjectStore,
    bucket: &str,
    segment: &LogSegment,
    registry: &KindRegistry,
) -> Result<Vec<Mutation>, SegmentError> {
    let body = store.read(bucket, &segment.name).await?;
    let mutations = decode_body(&body, registry)?;
    debug!(segment = %segment.name, mutations = mutations.len(), "Read segment");
    Ok(mutations)
}

/// Writes commit log segments under the canonical naming scheme.
pub struct LogSegmentWriter {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
}

impl LogSegmentWriter {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    /// Stores the mutations committed in `(lower, upper]` as one segment.
    pub async fn write(
        &self,
        lower: DateTime<Utc>,
        upper: DateTime<Utc>,
        mutations: &[Mutation],
    ) -> Result<LogSegment, SegmentError> {
        if lower >= upper {
            return Err(SegmentError::InvalidBounds { lower, upper });
        }
        let name = segment_name(&self.prefix, upper);
        let metadata = BTreeMap::from([(LOWER_BOUND_METADATA_KEY.to_string(), format_checkpoint(lower))]);
        let body = encode_body(mutations)?;
        let info = self.store.write(&self.bucket, &name, body, metadata).await?;
        info!(
            segment = %name,
            lower = %format_checkpoint(lower),
            mutations = mutations.len(),
            bytes = info.size,
            "Wrote commit log segment"
        );
        Ok(LogSegment {
            name,
            upper_bound: upper,
            lower_bound: lower,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::MemoryObjectStore;
    use crate::key::{EntityType, RelKey};
    use chrono::TimeZone;
    use serde_json::json;

    const DOMAIN: EntityType = EntityType::new("Domain", "DomainBase");

    fn registry() -> KindRegistry {
        KindRegistry::builder().register(DOMAIN).build().unwrap()
    }

    fn mutations(n: usize) -> Vec<Mutation> {
        (0..n)
            .map(|i| {
                let key = DualKey::root(DOMAIN, RelKey::from(format!("ROID-{i}")));
                if i % 5 == 4 {
                    Mutation::Delete(key)
                } else {
                    Mutation::Upsert(Entity::new(key, json!({"domainName": format!("d{i}.tld")})))
                }
            })
            .collect()
    }

    #[test]
    fn test_checkpoint_format() {
        let t = Utc.with_ymd_and_hms(2021, 4, 5, 6, 7, 8).unwrap();
        assert_eq!(format_checkpoint(t), "2021-04-05T06:07:08.000Z");
        assert_eq!(parse_checkpoint("2021-04-05T06:07:08.000Z").unwrap(), t);
        assert_eq!(parse_checkpoint("2021-04-05T08:07:08+02:00").unwrap(), t);
        assert!(matches!(
            parse_checkpoint("yesterday"),
            Err(SegmentError::MalformedCheckpoint(_))
        ));
        assert_eq!(segment_name("p_", t), "p_2021-04-05T06:07:08.000Z");
    }

    #[test]
    fn test_large_bodies_are_compressed() {
        let many = mutations(200);
        let body = encode_body(&many).unwrap();
        assert!(is_compressed(&body));
        assert_eq!(decode_body(&body, &registry()).unwrap(), many);
    }

    #[test]
    fn test_plain_json_body_accepted() {
        let one = mutations(1);
        let body = serde_json::to_vec(&[SegmentRecord::from_mutation(&one[0])]).unwrap();
        assert!(!is_compressed(&body));
        assert_eq!(decode_body(&body, &registry()).unwrap(), one);
    }

    #[test]
    fn test_bad_records_rejected() {
        let key = DualKey::root(DOMAIN, RelKey::from("a")).stringify();
        let unknown = serde_json::to_vec(&json!([{"op": "MERGE", "key": key}])).unwrap();
        assert!(matches!(
            decode_body(&unknown, &registry()),
            Err(SegmentError::UnknownOp(_))
        ));
        let no_payload = serde_json::to_vec(&json!([{"op": "UPSERT", "key": key}])).unwrap();
        assert!(matches!(
            decode_body(&no_payload, &registry()),
            Err(SegmentError::MissingPayload(_))
        ));
        let unknown_kind = DualKey::root(EntityType::new("Host", "HostResource"), RelKey::from("h")).stringify();
        let body = serde_json::to_vec(&json!([{"op": "DELETE", "key": unknown_kind}])).unwrap();
        assert!(matches!(decode_body(&body, &registry()), Err(SegmentError::Key(_))));
    }

    #[tokio::test]
    async fn test_writer_names_and_metadata() {
        let store = Arc::new(MemoryObjectStore::new());
        let writer = LogSegmentWriter::new(store.clone(), "logs", "commit_diff_until_");
        let lower = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        let upper = Utc.with_ymd_and_hms(2021, 1, 1, 0, 1, 0).unwrap();

        let segment = writer.write(lower, upper, &mutations(3)).await.unwrap();
        assert_eq!(segment.name, "commit_diff_until_2021-01-01T00:01:00.000Z");

        let info = store.stat("logs", &segment.name).await.unwrap().unwrap();
        assert_eq!(info.metadata[LOWER_BOUND_METADATA_KEY], "2021-01-01T00:00:00.000Z");
        assert_eq!(LogSegment::from_info(&info, upper), Some(segment.clone()));
        let read = read_segment(&*store, "logs", &segment, &registry()).await.unwrap();
        assert_eq!(read, mutations(3));

        assert!(matches!(
            writer.write(upper, lower, &[]).await,
            Err(SegmentError::InvalidBounds { .. })
        ));
    }
}
