// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-transaction write buffer shared by the backends.
//!
//! Both managers stage writes here and apply them in one step at commit,
//! after checking that what the transaction observed still holds.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use super::traits::StorageError;
use crate::entity::{Entity, Mutation};
use crate::key::{DualKey, EntityType};

/// Net effect of a transaction on one row.
#[derive(Debug, Clone)]
pub(crate) enum PendingWrite {
    /// Row must not exist at commit
    Insert(Entity),
    /// Row must exist at commit
    Update(Entity),
    Put(Entity),
    Delete(DualKey),
}

impl PendingWrite {
    pub(crate) fn entity(&self) -> Option<&Entity> {
        match self {
            PendingWrite::Insert(e) | PendingWrite::Update(e) | PendingWrite::Put(e) => Some(e),
            PendingWrite::Delete(_) => None,
        }
    }

    pub(crate) fn kind(&self) -> EntityType {
        match self {
            PendingWrite::Insert(e) | PendingWrite::Update(e) | PendingWrite::Put(e) => e.kind(),
            PendingWrite::Delete(key) => key.kind(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteIntent {
    Insert,
    Update,
    Upsert,
    Delete,
}

#[derive(Debug)]
pub(crate) struct WriteSet<K> {
    pub(crate) writes: BTreeMap<K, PendingWrite>,
    /// Every write in call order, as reported to commit listeners
    pub(crate) log: Vec<Mutation>,
    /// Committed version first observed per row (`None` = absent)
    pub(crate) reads: HashMap<K, Option<u64>>,
    /// Committed version of each entity type when first scanned
    pub(crate) scans: HashMap<EntityType, u64>,
}

impl<K> Default for WriteSet<K> {
    fn default() -> Self {
        Self {
            writes: BTreeMap::new(),
            log: Vec::new(),
            reads: HashMap::new(),
            scans: HashMap::new(),
        }
    }
}

impl<K: Ord + Hash + Clone> WriteSet<K> {
    /// `Some(value)` when this transaction already wrote `key`.
    pub(crate) fn pending(&self, key: &K) -> Option<Option<&Entity>> {
        self.writes.get(key).map(PendingWrite::entity)
    }

    pub(crate) fn record_read(&mut self, key: &K, version: Option<u64>) {
        self.reads.entry(key.clone()).or_insert(version);
    }

    pub(crate) fn record_scan(&mut self, kind: EntityType, version: u64) {
        self.scans.entry(kind).or_insert(version);
    }

    /// Folds `mutation` into the buffered state of `key`.
    ///
    /// `exists` is whether the row is visible to this transaction right now.
    pub(crate) fn stage(
        &mut self,
        key: K,
        intent: WriteIntent,
        mutation: Mutation,
        exists: bool,
    ) -> Result<(), StorageError> {
        let prior = self.writes.get(&key);
        let next = match (&mutation, intent) {
            (Mutation::Upsert(entity), WriteIntent::Insert) => {
                if exists {
                    return Err(StorageError::DuplicateKey(entity.key().stringify()));
                }
                Some(match prior {
                    // deleted earlier in this transaction, so the committed row is replaced
                    Some(PendingWrite::Delete(_)) => PendingWrite::Put(entity.clone()),
                    _ => PendingWrite::Insert(entity.clone()),
                })
            }
            (Mutation::Upsert(entity), WriteIntent::Update) => {
                if !exists {
                    return Err(StorageError::NotFound(entity.key().stringify()));
                }
                Some(match prior {
                    Some(PendingWrite::Insert(_)) => PendingWrite::Insert(entity.clone()),
                    _ => PendingWrite::Update(entity.clone()),
                })
            }
            (Mutation::Upsert(entity), _) => Some(match prior {
                Some(PendingWrite::Insert(_)) => PendingWrite::Insert(entity.clone()),
                _ => PendingWrite::Put(entity.clone()),
            }),
            (Mutation::Delete(deleted), _) => match prior {
                // never committed, nothing to remove
                Some(PendingWrite::Insert(_)) => None,
                _ => Some(PendingWrite::Delete(deleted.clone())),
            },
        };
        match next {
            Some(write) => {
                self.writes.insert(key, write);
            }
            None => {
                self.writes.remove(&key);
            }
        }
        self.log.push(mutation);
        Ok(())
    }

    /// Applies this transaction's own writes of `kind` over committed rows.
    pub(crate) fn overlay(&self, kind: EntityType, rows: &mut BTreeMap<K, Entity>) {
        for (key, write) in &self.writes {
            match write.entity() {
                Some(entity) if entity.kind() == kind => {
                    rows.insert(key.clone(), entity.clone());
                }
                Some(_) => {}
                None => {
                    rows.remove(key);
                }
            }
        }
    }
}
