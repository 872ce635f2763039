// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity identity that spans both storage backends.
//!
//! The document store addresses records by a hierarchical [`DocKey`]
//! (ancestor path plus leaf name or id); the relational store addresses them
//! by a flat [`RelKey`]. During the migration a record may be known by
//! either or both, so business code passes [`DualKey`]s around and each
//! backend picks the representation it understands.
//!
//! # Wire form
//!
//! ```text
//! kind:<storage kind>@doc:<base64url(json)>@rel:<base64url(json)>
//! ```
//!
//! The `doc` and `rel` fields appear only when set. Parsing resolves the kind
//! label through a [`KindRegistry`] built at startup.
//!
//! ```
//! use registry_cutover::key::{DualKey, EntityType, KindRegistry, RelKey};
//!
//! const DOMAIN: EntityType = EntityType::new("Domain", "DomainBase");
//! let registry = KindRegistry::builder().register(DOMAIN).build().unwrap();
//!
//! let key = DualKey::from_rel(DOMAIN, RelKey::from("ROID-1"));
//! let parsed = DualKey::parse(&key.stringify(), &registry).unwrap();
//! assert_eq!(parsed, key);
//! ```

mod registry;

pub use registry::{KindRegistry, KindRegistryBuilder};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const FIELD_DELIMITER: char = '@';
const KIND_FIELD: &str = "kind";
const DOC_FIELD: &str = "doc";
const REL_FIELD: &str = "rel";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("key of kind {kind} has no {representation} representation")]
    MissingRepresentation {
        kind: &'static str,
        representation: &'static str,
    },
    #[error("malformed key: {0}")]
    MalformedKey(String),
    #[error("unknown kind: {0}")]
    UnknownKind(String),
    #[error("storage kind {0:?} cannot appear in a key")]
    InvalidKind(String),
}

/// A logical entity type and the storage kind label written into its keys.
///
/// Several logical types may share one `storage_kind` (legacy subtype
/// aliasing); those need a caller hint to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityType {
    name: &'static str,
    storage_kind: &'static str,
}

impl EntityType {
    #[must_use]
    pub const fn new(name: &'static str, storage_kind: &'static str) -> Self {
        Self { name, storage_kind }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn storage_kind(&self) -> &'static str {
        self.storage_kind
    }

    /// Whether the storage kind can be written into a key and read back.
    pub(crate) fn is_wire_safe(&self) -> bool {
        !self.storage_kind.is_empty()
            && !self.storage_kind.contains([FIELD_DELIMITER, ':'])
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Leaf identifier of a document key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocId {
    Name(String),
    Id(i64),
}

/// Hierarchical key native to the document store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<Box<DocKey>>,
    kind: String,
    id: DocId,
}

impl DocKey {
    pub fn root(kind: impl Into<String>, id: DocId) -> Self {
        Self { parent: None, kind: kind.into(), id }
    }

    pub fn child(parent: DocKey, kind: impl Into<String>, id: DocId) -> Self {
        Self {
            parent: Some(Box::new(parent)),
            kind: kind.into(),
            id,
        }
    }

    #[must_use]
    pub fn parent(&self) -> Option<&DocKey> {
        self.parent.as_deref()
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    #[must_use]
    pub fn id(&self) -> &DocId {
        &self.id
    }

    /// Encoded form, also used as an opaque column value.
    #[must_use]
    pub fn encode(&self) -> String {
        encode_part(self)
    }

    pub fn decode(encoded: &str) -> Result<Self, KeyError> {
        decode_part(DOC_FIELD, encoded)
    }
}

/// Flat primary key native to the relational store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelKey {
    Str(String),
    Long(i64),
}

impl RelKey {
    #[must_use]
    pub fn encode(&self) -> String {
        encode_part(self)
    }

    pub fn decode(encoded: &str) -> Result<Self, KeyError> {
        decode_part(REL_FIELD, encoded)
    }

    fn as_doc_id(&self) -> DocId {
        match self {
            RelKey::Str(s) => DocId::Name(s.clone()),
            RelKey::Long(n) => DocId::Id(*n),
        }
    }
}

impl From<&str> for RelKey {
    fn from(value: &str) -> Self {
        RelKey::Str(value.to_string())
    }
}

impl From<String> for RelKey {
    fn from(value: String) -> Self {
        RelKey::Str(value)
    }
}

impl From<i64> for RelKey {
    fn from(value: i64) -> Self {
        RelKey::Long(value)
    }
}

impl fmt::Display for RelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelKey::Str(s) => f.write_str(s),
            RelKey::Long(n) => write!(f, "{n}"),
        }
    }
}

/// Identity of a record in either or both backends.
///
/// Always carries at least one representation; the constructors make a key
/// with neither unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DualKey {
    kind: EntityType,
    doc: Option<DocKey>,
    rel: Option<RelKey>,
}

impl DualKey {
    #[must_use]
    pub fn from_doc(kind: EntityType, doc: DocKey) -> Self {
        Self { kind, doc: Some(doc), rel: None }
    }

    #[must_use]
    pub fn from_rel(kind: EntityType, rel: RelKey) -> Self {
        Self { kind, doc: None, rel: Some(rel) }
    }

    #[must_use]
    pub fn from_both(kind: EntityType, doc: DocKey, rel: RelKey) -> Self {
        Self { kind, doc: Some(doc), rel: Some(rel) }
    }

    /// Root-level key known to both backends, the common case for entities
    /// without an ancestor: the document leaf mirrors the relational key.
    #[must_use]
    pub fn root(kind: EntityType, rel: RelKey) -> Self {
        let doc = DocKey::root(kind.storage_kind(), rel.as_doc_id());
        Self::from_both(kind, doc, rel)
    }

    #[must_use]
    pub fn kind(&self) -> EntityType {
        self.kind
    }

    pub fn doc(&self) -> Result<&DocKey, KeyError> {
        self.doc.as_ref().ok_or(KeyError::MissingRepresentation {
            kind: self.kind.name,
            representation: DOC_FIELD,
        })
    }

    pub fn rel(&self) -> Result<&RelKey, KeyError> {
        self.rel.as_ref().ok_or(KeyError::MissingRepresentation {
            kind: self.kind.name,
            representation: REL_FIELD,
        })
    }

    #[must_use]
    pub fn try_doc(&self) -> Option<&DocKey> {
        self.doc.as_ref()
    }

    #[must_use]
    pub fn try_rel(&self) -> Option<&RelKey> {
        self.rel.as_ref()
    }

    /// Returns a copy with the document representation set.
    #[must_use]
    pub fn with_doc(&self, doc: DocKey) -> Self {
        Self {
            kind: self.kind,
            doc: Some(doc),
            rel: self.rel.clone(),
        }
    }

    /// Derives the document key from the relational key, placing the leaf
    /// under `parent` when the entity lives below an ancestor.
    ///
    /// Keys that already carry a document key are returned unchanged.
    pub fn restore_doc(&self, parent: Option<DocKey>) -> Result<Self, KeyError> {
        if self.doc.is_some() {
            return Ok(self.clone());
        }
        let rel = self.rel()?;
        let doc = match parent {
            Some(parent) => DocKey::child(parent, self.kind.storage_kind, rel.as_doc_id()),
            None => DocKey::root(self.kind.storage_kind, rel.as_doc_id()),
        };
        Ok(self.with_doc(doc))
    }

    /// Stable, lossless string form.
    #[must_use]
    pub fn stringify(&self) -> String {
        let mut out = format!("{KIND_FIELD}:{}", self.kind.storage_kind);
        if let Some(doc) = &self.doc {
            out.push(FIELD_DELIMITER);
            out.push_str(DOC_FIELD);
            out.push(':');
            out.push_str(&doc.encode());
        }
        if let Some(rel) = &self.rel {
            out.push(FIELD_DELIMITER);
            out.push_str(REL_FIELD);
            out.push(':');
            out.push_str(&rel.encode());
        }
        out
    }

    /// Parses the wire form, resolving the kind label through `registry`.
    pub fn parse(encoded: &str, registry: &KindRegistry) -> Result<Self, KeyError> {
        Self::parse_inner(encoded, registry, None)
    }

    /// Parses the wire form, using `hint` to pick among logical types that
    /// share a storage kind label.
    pub fn parse_with_hint(
        encoded: &str,
        registry: &KindRegistry,
        hint: EntityType,
    ) -> Result<Self, KeyError> {
        Self::parse_inner(encoded, registry, Some(hint))
    }

    fn parse_inner(
        encoded: &str,
        registry: &KindRegistry,
        hint: Option<EntityType>,
    ) -> Result<Self, KeyError> {
        // the kind always leads
        let leads_with_kind = encoded
            .split_once(':')
            .is_some_and(|(name, _)| name == KIND_FIELD);
        if !leads_with_kind {
            return Err(KeyError::MalformedKey("missing kind".into()));
        }
        let mut label = None;
        let mut doc = None;
        let mut rel = None;

        for field in encoded.split(FIELD_DELIMITER) {
            let (name, value) = field
                .split_once(':')
                .ok_or_else(|| KeyError::MalformedKey(format!("field without name: {field:?}")))?;
            let duplicate = match name {
                KIND_FIELD => label.replace(value).is_some(),
                DOC_FIELD => doc.replace(DocKey::decode(value)?).is_some(),
                REL_FIELD => rel.replace(RelKey::decode(value)?).is_some(),
                other => {
                    return Err(KeyError::MalformedKey(format!("unknown field {other:?}")));
                }
            };
            if duplicate {
                return Err(KeyError::MalformedKey(format!("duplicate field {name:?}")));
            }
        }

        let label = label.ok_or_else(|| KeyError::MalformedKey("missing kind".into()))?;
        if doc.is_none() && rel.is_none() {
            return Err(KeyError::MalformedKey(format!(
                "key of kind {label} has no representation"
            )));
        }
        let kind = registry.resolve(label, hint)?;
        Ok(Self { kind, doc, rel })
    }
}

impl fmt::Display for DualKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stringify())
    }
}

fn encode_part<T: Serialize>(part: &T) -> String {
    // Serializing plain enums and strings cannot fail.
    let json = serde_json::to_vec(part).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

fn decode_part<T: DeserializeOwned>(field: &str, encoded: &str) -> Result<T, KeyError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| KeyError::MalformedKey(format!("{field} is not base64: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| KeyError::MalformedKey(format!("{field} does not decode: {e}")))
}
