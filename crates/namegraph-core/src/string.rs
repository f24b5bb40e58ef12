use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{RuleId, SlotIndex, StringId, ValueId, WorkspaceId};

/// A generated naming instance. Parent/child links form a forest within
/// one (workspace, rule); depth is bounded by configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameString {
    pub id: StringId,
    pub workspace_id: WorkspaceId,
    pub rule_id: RuleId,
    pub parent_id: Option<StringId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NameString {
    pub fn new(workspace_id: WorkspaceId, rule_id: RuleId) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            rule_id,
            parent_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_parent(mut self, parent_id: StringId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }
}

/// The realized value + formatting for one slot of a string.
///
/// Exactly one detail exists per (string, slot). The three formatting
/// fields are nullable; `None` and `""` are equivalent for inheritance
/// classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringDetail {
    pub string_id: StringId,
    pub slot: SlotIndex,
    pub value: String,
    /// Bound enumerated value, when the slot dimension is enumerated.
    pub value_id: Option<ValueId>,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    pub delimiter: Option<String>,
}

impl StringDetail {
    pub fn new(string_id: StringId, slot: SlotIndex, value: impl Into<String>) -> Self {
        Self {
            string_id,
            slot,
            value: value.into(),
            value_id: None,
            prefix: None,
            suffix: None,
            delimiter: None,
        }
    }

    pub fn with_value_id(mut self, value_id: ValueId) -> Self {
        self.value_id = Some(value_id);
        self
    }

    pub fn with_formatting(
        mut self,
        prefix: Option<String>,
        suffix: Option<String>,
        delimiter: Option<String>,
    ) -> Self {
        self.prefix = prefix;
        self.suffix = suffix;
        self.delimiter = delimiter;
        self
    }

    pub fn snapshot(&self) -> DetailSnapshot {
        DetailSnapshot {
            value: self.value.clone(),
            value_id: self.value_id,
            prefix: self.prefix.clone(),
            suffix: self.suffix.clone(),
            delimiter: self.delimiter.clone(),
        }
    }
}

/// Point-in-time copy of a detail's user-visible fields, used to carry
/// before/after states through batch results and propagation jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailSnapshot {
    pub value: String,
    pub value_id: Option<ValueId>,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    pub delimiter: Option<String>,
}

impl DetailSnapshot {
    /// Apply this snapshot onto an existing detail, keeping its identity.
    pub fn apply_to(&self, detail: &mut StringDetail) {
        detail.value = self.value.clone();
        detail.value_id = self.value_id;
        detail.prefix = self.prefix.clone();
        detail.suffix = self.suffix.clone();
        detail.delimiter = self.delimiter.clone();
    }
}

/// Tri-state patch for a nullable formatting field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldEdit {
    #[default]
    Keep,
    Clear,
    Set(String),
}

impl FieldEdit {
    pub fn apply(&self, field: &mut Option<String>) {
        match self {
            FieldEdit::Keep => {}
            FieldEdit::Clear => *field = None,
            FieldEdit::Set(v) => *field = Some(v.clone()),
        }
    }

    pub fn is_keep(&self) -> bool {
        matches!(self, FieldEdit::Keep)
    }
}

/// One requested change to a string's detail at `slot`.
///
/// `value: None` keeps the current value (the value itself is not
/// nullable); formatting fields use the tri-state patch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailEdit {
    pub slot: SlotIndex,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub value_id: Option<ValueId>,
    #[serde(default)]
    pub prefix: FieldEdit,
    #[serde(default)]
    pub suffix: FieldEdit,
    #[serde(default)]
    pub delimiter: FieldEdit,
}

impl DetailEdit {
    pub fn set_value(slot: SlotIndex, value: impl Into<String>) -> Self {
        Self {
            slot,
            value: Some(value.into()),
            ..Self::default()
        }
    }

    /// Whether the edit changes nothing at all.
    pub fn is_noop(&self) -> bool {
        self.value.is_none()
            && self.value_id.is_none()
            && self.prefix.is_keep()
            && self.suffix.is_keep()
            && self.delimiter.is_keep()
    }

    /// Patch an existing detail in place.
    pub fn apply_to(&self, detail: &mut StringDetail) {
        if let Some(value) = &self.value {
            detail.value = value.clone();
            // A stale binding must not survive a value change.
            detail.value_id = self.value_id;
        } else if let Some(value_id) = self.value_id {
            detail.value_id = Some(value_id);
        }
        self.prefix.apply(&mut detail.prefix);
        self.suffix.apply(&mut detail.suffix);
        self.delimiter.apply(&mut detail.delimiter);
    }
}

/// One string's worth of writes inside a chunk commit: the post-edit
/// details for the changed slots only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailWrite {
    pub string_id: StringId,
    pub workspace_id: WorkspaceId,
    pub rule_id: RuleId,
    pub parent_id: Option<StringId>,
    pub details: Vec<StringDetail>,
}
