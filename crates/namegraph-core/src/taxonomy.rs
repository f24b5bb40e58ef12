use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{DimensionId, DimensionKind, ValueId, WorkspaceId};

/// A taxonomy axis, optionally parented to another dimension.
///
/// The dimension hierarchy (e.g. Region under Environment) is independent
/// of the string hierarchy; it only scopes which values may parent which.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dimension {
    pub id: DimensionId,
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub kind: DimensionKind,
    pub parent_id: Option<DimensionId>,
}

impl Dimension {
    pub fn new(workspace_id: WorkspaceId, name: impl Into<String>, kind: DimensionKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            name: name.into(),
            kind,
            parent_id: None,
        }
    }

    pub fn with_parent(mut self, parent_id: DimensionId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }
}

/// One permitted value of an enumerated dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionValue {
    pub id: ValueId,
    pub dimension_id: DimensionId,
    pub value: String,
    /// Must reference a value of the dimension's declared parent dimension.
    pub parent_value_id: Option<ValueId>,
}

impl DimensionValue {
    pub fn new(dimension_id: DimensionId, value: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            dimension_id,
            value: value.into(),
            parent_value_id: None,
        }
    }

    pub fn with_parent_value(mut self, parent_value_id: ValueId) -> Self {
        self.parent_value_id = Some(parent_value_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    /// Value must match the regular expression.
    Pattern(String),
    /// Value length must fall in `min..=max`.
    Length { min: usize, max: usize },
}

/// A declared constraint on a dimension's values.
///
/// Membership in the enumerated value set is not a constraint row; it is
/// implied by `DimensionKind::Enumerated`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionConstraint {
    pub dimension_id: DimensionId,
    pub kind: ConstraintKind,
}

impl DimensionConstraint {
    pub fn pattern(dimension_id: DimensionId, pattern: impl Into<String>) -> Self {
        Self {
            dimension_id,
            kind: ConstraintKind::Pattern(pattern.into()),
        }
    }

    pub fn length(dimension_id: DimensionId, min: usize, max: usize) -> Self {
        Self {
            dimension_id,
            kind: ConstraintKind::Length { min, max },
        }
    }
}
