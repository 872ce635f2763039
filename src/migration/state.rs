// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::MigrationError;
use crate::storage::Backend;

/// Phase of the document-to-relational cutover.
///
/// Variants are declared in migration order. Legal moves are one step
/// forward or one step back; see [`MigrationState::successors`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationState {
    DocOnly,
    DocPrimary,
    DocPrimaryReadOnly,
    RelPrimary,
    RelPrimaryReadOnly,
    RelOnly,
}

impl MigrationState {
    pub const ALL: [MigrationState; 6] = [
        MigrationState::DocOnly,
        MigrationState::DocPrimary,
        MigrationState::DocPrimaryReadOnly,
        MigrationState::RelPrimary,
        MigrationState::RelPrimaryReadOnly,
        MigrationState::RelOnly,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationState::DocOnly => "DOC_ONLY",
            MigrationState::DocPrimary => "DOC_PRIMARY",
            MigrationState::DocPrimaryReadOnly => "DOC_PRIMARY_READ_ONLY",
            MigrationState::RelPrimary => "REL_PRIMARY",
            MigrationState::RelPrimaryReadOnly => "REL_PRIMARY_READ_ONLY",
            MigrationState::RelOnly => "REL_ONLY",
        }
    }

    /// Position in migration order, 0 through 5.
    #[must_use]
    pub fn ordinal(&self) -> u8 {
        *self as u8
    }

    /// States reachable in one step.
    #[must_use]
    pub fn successors(&self) -> &'static [MigrationState] {
        use MigrationState::*;
        match self {
            DocOnly => &[DocPrimary],
            DocPrimary => &[DocOnly, DocPrimaryReadOnly],
            DocPrimaryReadOnly => &[DocPrimary, RelPrimary],
            RelPrimary => &[DocPrimaryReadOnly, RelPrimaryReadOnly],
            RelPrimaryReadOnly => &[RelPrimary, RelOnly],
            RelOnly => &[RelPrimaryReadOnly],
        }
    }

    #[must_use]
    pub fn can_transition_to(&self, next: MigrationState) -> bool {
        self.successors().contains(&next)
    }

    /// Backend holding the authoritative copy.
    #[must_use]
    pub fn primary_backend(&self) -> Backend {
        match self {
            MigrationState::DocOnly
            | MigrationState::DocPrimary
            | MigrationState::DocPrimaryReadOnly => Backend::Document,
            MigrationState::RelPrimary
            | MigrationState::RelPrimaryReadOnly
            | MigrationState::RelOnly => Backend::Relational,
        }
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            MigrationState::DocPrimaryReadOnly | MigrationState::RelPrimaryReadOnly
        )
    }

    /// Backend whose commits are captured for replay into the other one.
    ///
    /// Capture stays on through the read-only phase that follows, so commits
    /// from managers handed out before the freeze are still mirrored.
    #[must_use]
    pub fn replay_source(&self) -> Option<Backend> {
        match self {
            MigrationState::DocPrimary | MigrationState::DocPrimaryReadOnly => Some(Backend::Document),
            MigrationState::RelPrimary | MigrationState::RelPrimaryReadOnly => Some(Backend::Relational),
            MigrationState::DocOnly | MigrationState::RelOnly => None,
        }
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationState {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MigrationState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| MigrationError::UnknownState(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_round_trip() {
        for state in MigrationState::ALL {
            assert_eq!(state.as_str().parse::<MigrationState>().unwrap(), state);
            assert_eq!(
                serde_json::to_value(state).unwrap(),
                serde_json::Value::String(state.as_str().to_string())
            );
        }
        assert!(matches!(
            "doc_only".parse::<MigrationState>(),
            Err(MigrationError::UnknownState(_))
        ));
    }

    #[test]
    fn test_only_adjacent_moves_are_legal() {
        for from in MigrationState::ALL {
            for to in MigrationState::ALL {
                let distance = (from.ordinal() as i8 - to.ordinal() as i8).abs();
                assert_eq!(from.can_transition_to(to), distance == 1, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_phase_properties() {
        use MigrationState::*;
        assert_eq!(DocPrimaryReadOnly.primary_backend(), Backend::Document);
        assert_eq!(RelPrimary.primary_backend(), Backend::Relational);
        assert!(DocPrimaryReadOnly.is_read_only());
        assert!(RelPrimaryReadOnly.is_read_only());
        assert!(!RelOnly.is_read_only());
        assert_eq!(DocPrimary.replay_source(), Some(Backend::Document));
        assert_eq!(RelPrimary.replay_source(), Some(Backend::Relational));
        assert_eq!(DocPrimaryReadOnly.replay_source(), Some(Backend::Document));
        assert_eq!(RelPrimaryReadOnly.replay_source(), Some(Backend::Relational));
        assert_eq!(DocOnly.replay_source(), None);
        assert_eq!(RelOnly.replay_source(), None);
    }
}
