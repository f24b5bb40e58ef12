use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type WorkspaceId = Uuid;
pub type RuleId = Uuid;
pub type DimensionId = Uuid;
pub type ValueId = Uuid;
pub type StringId = Uuid;
pub type BatchId = Uuid;
pub type JobId = Uuid;

/// Position of a slot inside a rule's ordered template.
pub type SlotIndex = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionKind {
    FreeText,
    Enumerated,
}

impl DimensionKind {
    /// Whether details bound to this dimension may carry arbitrary text.
    pub fn allows_free_text(&self) -> bool {
        matches!(self, DimensionKind::FreeText)
    }

    /// Whether values must come from the dimension's enumerated value set.
    pub fn is_enumerated(&self) -> bool {
        matches!(self, DimensionKind::Enumerated)
    }
}

impl fmt::Display for DimensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DimensionKind::FreeText => "free_text",
            DimensionKind::Enumerated => "enumerated",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for DimensionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free_text" | "free-text" | "freetext" => Ok(DimensionKind::FreeText),
            "enumerated" | "list" => Ok(DimensionKind::Enumerated),
            other => Err(format!("unknown dimension kind: {}", other)),
        }
    }
}

/// Derived classification of a detail against its direct parent.
///
/// Never persisted; recomputed on demand so it cannot go stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InheritanceStatus {
    Inherited,
    Overridden,
}

impl InheritanceStatus {
    pub fn is_inherited(&self) -> bool {
        matches!(self, InheritanceStatus::Inherited)
    }
}

impl fmt::Display for InheritanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InheritanceStatus::Inherited => "inherited",
            InheritanceStatus::Overridden => "overridden",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Uniqueness,
    Constraint,
    ParentLink,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictKind::Uniqueness => "uniqueness",
            ConflictKind::Constraint => "constraint",
            ConflictKind::ParentLink => "parent_link",
        };
        write!(f, "{}", s)
    }
}

/// A detected violation blocking one proposed detail update.
///
/// Conflicts are data carried in results, not errors: a partially
/// conflicting batch still returns the applied/conflicted split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub string_id: StringId,
    pub slot: SlotIndex,
    pub kind: ConflictKind,
    pub value: String,
    pub message: String,
}

impl Conflict {
    pub fn uniqueness(string_id: StringId, slot: SlotIndex, value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            string_id,
            slot,
            kind: ConflictKind::Uniqueness,
            message: format!(
                "value '{}' is already used by a sibling in slot {}",
                value, slot
            ),
            value,
        }
    }

    pub fn constraint(
        string_id: StringId,
        slot: SlotIndex,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let value = value.into();
        Self {
            string_id,
            slot,
            kind: ConflictKind::Constraint,
            message: format!("value '{}' rejected for slot {}: {}", value, slot, reason.into()),
            value,
        }
    }

    pub fn parent_link(
        string_id: StringId,
        slot: SlotIndex,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let value = value.into();
        Self {
            string_id,
            slot,
            kind: ConflictKind::ParentLink,
            message: format!(
                "parent link for value '{}' in slot {} is invalid: {}",
                value,
                slot,
                reason.into()
            ),
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimension_kind_round_trip() {
        for kind in [DimensionKind::FreeText, DimensionKind::Enumerated] {
            let parsed: DimensionKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("banana".parse::<DimensionKind>().is_err());
    }

    #[test]
    fn kind_capabilities() {
        assert!(DimensionKind::FreeText.allows_free_text());
        assert!(!DimensionKind::FreeText.is_enumerated());
        assert!(DimensionKind::Enumerated.is_enumerated());
        assert!(!DimensionKind::Enumerated.allows_free_text());
    }

    #[test]
    fn conflict_messages_name_the_value() {
        let id = Uuid::new_v4();
        let c = Conflict::uniqueness(id, 2, "prod");
        assert_eq!(c.kind, ConflictKind::Uniqueness);
        assert!(c.message.contains("prod"));
        assert!(c.message.contains('2'));
    }
}
