// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::HashMap;

use super::{EntityType, KeyError};

/// Maps storage kind labels to the logical entity types that use them.
///
/// Built once at startup from the fixed set of entity types the process
/// knows about and passed to whatever needs to parse keys.
#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    by_label: HashMap<&'static str, Vec<EntityType>>,
}

#[derive(Debug, Default)]
pub struct KindRegistryBuilder {
    by_label: HashMap<&'static str, Vec<EntityType>>,
    rejected: Vec<EntityType>,
}

impl KindRegistryBuilder {
    #[must_use]
    pub fn register(mut self, kind: EntityType) -> Self {
        if !kind.is_wire_safe() {
            self.rejected.push(kind);
            return self;
        }
        let entries = self.by_label.entry(kind.storage_kind()).or_default();
        if !entries.contains(&kind) {
            entries.push(kind);
        }
        self
    }

    #[must_use]
    pub fn register_all(self, kinds: impl IntoIterator<Item = EntityType>) -> Self {
        kinds.into_iter().fold(self, Self::register)
    }

    /// Fails with [`KeyError::InvalidKind`] if any registered storage kind
    /// could not survive a key round-trip.
    pub fn build(self) -> Result<KindRegistry, KeyError> {
        if let Some(kind) = self.rejected.first() {
            return Err(KeyError::InvalidKind(kind.storage_kind().to_string()));
        }
        Ok(KindRegistry { by_label: self.by_label })
    }
}

impl KindRegistry {
    #[must_use]
    pub fn builder() -> KindRegistryBuilder {
        KindRegistryBuilder::default()
    }

    /// Logical types registered under `label`.
    #[must_use]
    pub fn candidates(&self, label: &str) -> &[EntityType] {
        self.by_label.get(label).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Resolves a label to exactly one type.
    ///
    /// A hint wins when it is one of the registered candidates, or when the
    /// label is unregistered but the hint declares that storage kind.
    pub(crate) fn resolve(
        &self,
        label: &str,
        hint: Option<EntityType>,
    ) -> Result<EntityType, KeyError> {
        let candidates = self.candidates(label);
        match (hint, candidates) {
            (Some(hint), []) if hint.storage_kind() == label => Ok(hint),
            (Some(hint), candidates) if candidates.contains(&hint) => Ok(hint),
            (Some(hint), _) => Err(KeyError::UnknownKind(format!(
                "{label} does not resolve to hinted type {hint}"
            ))),
            (None, [only]) => Ok(*only),
            (None, []) => Err(KeyError::UnknownKind(label.to_string())),
            (None, many) => Err(KeyError::UnknownKind(format!(
                "{label} is shared by {} types and no hint was given",
                many.len()
            ))),
        }
    }
}
