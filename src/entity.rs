// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity snapshots and the mutations applied to them.
//!
//! An [`Entity`] is what the transaction managers store: a [`DualKey`] and an
//! opaque JSON payload. The business schema lives in the payload and is of
//! no concern to the migration machinery.
//!
//! ```
//! use registry_cutover::entity::Entity;
//! use registry_cutover::key::{DualKey, EntityType, RelKey};
//! use serde_json::json;
//!
//! const DOMAIN: EntityType = EntityType::new("Domain", "DomainBase");
//! let entity = Entity::new(
//!     DualKey::root(DOMAIN, RelKey::from("ROID-1")),
//!     json!({"domainName": "example.tld"}),
//! );
//! assert_eq!(entity.content_hash().len(), 64);
//! ```

use std::sync::OnceLock;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::key::{DualKey, EntityType};

#[derive(Debug, Clone)]
pub struct Entity {
    key: DualKey,
    payload: Value,
    /// Hex SHA-256 of the payload (lazily computed)
    content_hash: OnceLock<String>,
}

impl Entity {
    #[must_use]
    pub fn new(key: DualKey, payload: Value) -> Self {
        Self {
            key,
            payload,
            content_hash: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn key(&self) -> &DualKey {
        &self.key
    }

    #[must_use]
    pub fn kind(&self) -> EntityType {
        self.key.kind()
    }

    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    #[must_use]
    pub fn into_payload(self) -> Value {
        self.payload
    }

    /// Copy of this entity under a different key (e.g. after restoring the
    /// document representation).
    #[must_use]
    pub fn with_key(&self, key: DualKey) -> Self {
        Self::new(key, self.payload.clone())
    }

    /// Hex SHA-256 of the canonical JSON payload.
    pub fn content_hash(&self) -> &str {
        self.content_hash.get_or_init(|| {
            let bytes = serde_json::to_vec(&self.payload).unwrap_or_default();
            hex::encode(Sha256::digest(&bytes))
        })
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.payload == other.payload
    }
}

impl Eq for Entity {}

/// A single write performed inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Upsert(Entity),
    Delete(DualKey),
}

impl Mutation {
    #[must_use]
    pub fn key(&self) -> &DualKey {
        match self {
            Mutation::Upsert(entity) => entity.key(),
            Mutation::Delete(key) => key,
        }
    }

    #[must_use]
    pub fn op_name(&self) -> &'static str {
        match self {
            Mutation::Upsert(_) => "UPSERT",
            Mutation::Delete(_) => "DELETE",
        }
    }
}
