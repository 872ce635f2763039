// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Side-by-side comparison of two backends before a cutover.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::entity::Entity;
use crate::key::{DualKey, EntityType};
use crate::metrics;
use crate::storage::{StorageError, TransactionManager, TransactionManagerExt};

/// Differences found for one kind. Keys are in DualKey wire form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KindReport {
    pub kind: String,
    pub missing_in_right: Vec<String>,
    pub missing_in_left: Vec<String>,
    pub mismatched: Vec<String>,
}

impl KindReport {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.missing_in_right.is_empty() && self.missing_in_left.is_empty() && self.mismatched.is_empty()
    }

    fn differences(&self) -> usize {
        self.missing_in_right.len() + self.missing_in_left.len() + self.mismatched.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub kinds: Vec<KindReport>,
}

impl ConsistencyReport {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.kinds.iter().all(KindReport::is_consistent)
    }
}

pub struct ConsistencyChecker {
    left: Arc<dyn TransactionManager>,
    right: Arc<dyn TransactionManager>,
}

impl ConsistencyChecker {
    #[must_use]
    pub fn new(left: Arc<dyn TransactionManager>, right: Arc<dyn TransactionManager>) -> Self {
        Self { left, right }
    }

    /// Compares every entity of each kind by content hash.
    ///
    /// Entities are matched on their relational key when they have one,
    /// otherwise on their document key.
    pub async fn compare(&self, kinds: &[EntityType]) -> Result<ConsistencyReport, StorageError> {
        let mut report = ConsistencyReport::default();
        for &kind in kinds {
            let left = snapshot(&*self.left, kind).await?;
            let right = snapshot(&*self.right, kind).await?;
            let kind_report = diff(kind, &left, &right);

            if kind_report.is_consistent() {
                info!(kind = %kind, entities = left.len(), "Backends agree");
            } else {
                warn!(
                    kind = %kind,
                    missing_in_right = kind_report.missing_in_right.len(),
                    missing_in_left = kind_report.missing_in_left.len(),
                    mismatched = kind_report.mismatched.len(),
                    "Backends disagree"
                );
            }
            metrics::record_consistency_mismatches(kind.name(), kind_report.differences());
            report.kinds.push(kind_report);
        }
        Ok(report)
    }
}

fn identity(key: &DualKey) -> String {
    match (key.try_rel(), key.try_doc()) {
        (Some(rel), _) => format!("rel:{}", rel.encode()),
        (None, Some(doc)) => format!("doc:{}", doc.encode()),
        // DualKey always carries one of the two
        (None, None) => key.stringify(),
    }
}

async fn snapshot(
    manager: &dyn TransactionManager,
    kind: EntityType,
) -> Result<BTreeMap<String, Entity>, StorageError> {
    let entities = manager
        .transact_read_only(|| async { manager.load_all(kind).await })
        .await?;
    Ok(entities
        .into_iter()
        .map(|entity| (identity(entity.key()), entity))
        .collect())
}

fn diff(kind: EntityType, left: &BTreeMap<String, Entity>, right: &BTreeMap<String, Entity>) -> KindReport {
    let mut report = KindReport {
        kind: kind.name().to_string(),
        ..KindReport::default()
    };
    for (id, entity) in left {
        match right.get(id) {
            None => report.missing_in_right.push(entity.key().stringify()),
            Some(other) if other.content_hash() != entity.content_hash() => {
                report.mismatched.push(entity.key().stringify());
            }
            Some(_) => {}
        }
    }
    report.missing_in_left = right
        .iter()
        .filter(|(id, _)| !left.contains_key(*id))
        .map(|(_, entity)| entity.key().stringify())
        .collect();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::RelKey;
    use crate::storage::MemoryTransactionManager;
    use serde_json::json;

    const DOMAIN: EntityType = EntityType::new("Domain", "DomainBase");
    const CONTACT: EntityType = EntityType::new("Contact", "ContactResource");

    fn entity(kind: EntityType, id: &str, v: i64) -> Entity {
        Entity::new(DualKey::root(kind, RelKey::from(id)), json!({"v": v}))
    }

    async fn seed(tm: &MemoryTransactionManager, entities: Vec<Entity>) {
        tm.transact(|| async { tm.upsert_all(entities.clone()).await })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_identical_backends_agree() {
        let doc = Arc::new(MemoryTransactionManager::document());
        let rel = Arc::new(MemoryTransactionManager::relational());
        let data = vec![entity(DOMAIN, "a", 1), entity(DOMAIN, "b", 2), entity(CONTACT, "c", 3)];
        seed(&doc, data.clone()).await;
        seed(&rel, data).await;

        let report = ConsistencyChecker::new(doc, rel)
            .compare(&[DOMAIN, CONTACT])
            .await
            .unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.kinds.len(), 2);
    }

    #[tokio::test]
    async fn test_reports_each_kind_of_difference() {
        let doc = Arc::new(MemoryTransactionManager::document());
        let rel = Arc::new(MemoryTransactionManager::relational());
        seed(&doc, vec![entity(DOMAIN, "same", 1), entity(DOMAIN, "only-doc", 1), entity(DOMAIN, "changed", 1)]).await;
        seed(&rel, vec![entity(DOMAIN, "same", 1), entity(DOMAIN, "only-rel", 1), entity(DOMAIN, "changed", 2)]).await;

        let report = ConsistencyChecker::new(doc, rel).compare(&[DOMAIN]).await.unwrap();
        assert!(!report.is_consistent());
        let kind = &report.kinds[0];
        assert_eq!(kind.kind, "Domain");
        assert_eq!(kind.missing_in_right, vec![entity(DOMAIN, "only-doc", 0).key().stringify()]);
        assert_eq!(kind.missing_in_left, vec![entity(DOMAIN, "only-rel", 0).key().stringify()]);
        assert_eq!(kind.mismatched, vec![entity(DOMAIN, "changed", 0).key().stringify()]);
    }

    #[tokio::test]
    async fn test_matches_relational_only_keys_by_rel() {
        let doc = Arc::new(MemoryTransactionManager::document());
        let rel = Arc::new(MemoryTransactionManager::relational());
        seed(&doc, vec![entity(DOMAIN, "x", 1)]).await;
        seed(&rel, vec![Entity::new(DualKey::from_rel(DOMAIN, RelKey::from("x")), json!({"v": 1}))]).await;

        let report = ConsistencyChecker::new(doc, rel).compare(&[DOMAIN]).await.unwrap();
        assert!(report.is_consistent());
    }
}
