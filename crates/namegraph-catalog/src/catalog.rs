use std::collections::HashMap;

use chrono::{DateTime, Utc};
use namegraph_core::{
    ConflictKind, ConstraintKind, Dimension, DimensionConstraint, DimensionId, DimensionValue,
    Rule, SlotIndex, ValueId,
};
use regex::Regex;

/// A dimension constraint with its pattern pre-compiled so per-write
/// validation never touches the regex compiler.
#[derive(Debug, Clone)]
pub enum CompiledConstraint {
    Pattern { source: String, regex: Regex },
    Length { min: usize, max: usize },
}

impl CompiledConstraint {
    pub fn compile(constraint: &DimensionConstraint) -> Result<Self, String> {
        match &constraint.kind {
            ConstraintKind::Pattern(source) => Regex::new(source)
                .map(|regex| Self::Pattern {
                    source: source.clone(),
                    regex,
                })
                .map_err(|e| format!("invalid pattern '{}': {}", source, e)),
            ConstraintKind::Length { min, max } => Ok(Self::Length {
                min: *min,
                max: *max,
            }),
        }
    }

    pub fn check(&self, literal: &str) -> Result<(), String> {
        match self {
            Self::Pattern { source, regex } => {
                if regex.is_match(literal) {
                    Ok(())
                } else {
                    Err(format!("value '{}' does not match pattern '{}'", literal, source))
                }
            }
            Self::Length { min, max } => {
                let len = literal.chars().count();
                if len < *min || len > *max {
                    Err(format!(
                        "value '{}' has length {}, expected {}..={}",
                        literal, len, min, max
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Why a proposed value is not acceptable for a slot. Carries the
/// conflict kind so callers can surface it without re-deriving.
#[derive(Debug, Clone)]
pub enum ValueViolation {
    Constraint(String),
    ParentLink(String),
}

impl ValueViolation {
    pub fn kind(&self) -> ConflictKind {
        match self {
            Self::Constraint(_) => ConflictKind::Constraint,
            Self::ParentLink(_) => ConflictKind::ParentLink,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Constraint(reason) | Self::ParentLink(reason) => reason,
        }
    }
}

/// Everything one rule slot needs for validation, fully indexed.
#[derive(Debug, Clone)]
pub struct SlotCatalog {
    pub slot: SlotIndex,
    pub dimension: Dimension,
    values: HashMap<ValueId, DimensionValue>,
    by_literal: HashMap<String, ValueId>,
    constraints: Vec<CompiledConstraint>,
}

impl SlotCatalog {
    pub fn new(
        slot: SlotIndex,
        dimension: Dimension,
        values: Vec<DimensionValue>,
        constraints: Vec<CompiledConstraint>,
    ) -> Self {
        let mut by_id = HashMap::with_capacity(values.len());
        let mut by_literal = HashMap::with_capacity(values.len());
        for value in values {
            by_literal.insert(value.value.clone(), value.id);
            by_id.insert(value.id, value);
        }
        Self {
            slot,
            dimension,
            values: by_id,
            by_literal,
            constraints,
        }
    }

    pub fn value(&self, value_id: ValueId) -> Option<&DimensionValue> {
        self.values.get(&value_id)
    }

    pub fn value_by_literal(&self, literal: &str) -> Option<&DimensionValue> {
        self.by_literal
            .get(literal)
            .and_then(|id| self.values.get(id))
    }

    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    pub fn constraints(&self) -> &[CompiledConstraint] {
        &self.constraints
    }
}

/// Pre-indexed view of one rule's taxonomy: per-slot dimensions,
/// value lookups by id and literal, compiled constraints, and a
/// cross-dimension value index for parent-link checks.
#[derive(Debug, Clone)]
pub struct Catalog {
    rule: Rule,
    slots: HashMap<SlotIndex, SlotCatalog>,
    /// Which dimension each known value belongs to, spanning the slot
    /// dimensions and their declared parent dimensions.
    value_dimensions: HashMap<ValueId, DimensionId>,
    pub built_at: DateTime<Utc>,
}

impl Catalog {
    pub fn new(
        rule: Rule,
        slots: Vec<SlotCatalog>,
        value_dimensions: HashMap<ValueId, DimensionId>,
    ) -> Self {
        let slots = slots.into_iter().map(|s| (s.slot, s)).collect();
        Self {
            rule,
            slots,
            value_dimensions,
            built_at: Utc::now(),
        }
    }

    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    pub fn slot(&self, slot: SlotIndex) -> Option<&SlotCatalog> {
        self.slots.get(&slot)
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn dimension_of_value(&self, value_id: ValueId) -> Option<DimensionId> {
        self.value_dimensions.get(&value_id).copied()
    }

    /// Resolve a literal to its value id for an enumerated slot.
    /// Free-text slots never bind value ids.
    pub fn resolve_literal(&self, slot: SlotIndex, literal: &str) -> Option<ValueId> {
        let entry = self.slots.get(&slot)?;
        if !entry.dimension.kind.is_enumerated() {
            return None;
        }
        entry.by_literal.get(literal).copied()
    }

    /// Validate one proposed (literal, value binding) for a slot.
    /// Returns the value id the detail should bind (None for free
    /// text). Violations carry the kind and a user-facing reason.
    pub fn validate_slot_value(
        &self,
        slot: SlotIndex,
        literal: &str,
        value_id: Option<ValueId>,
    ) -> Result<Option<ValueId>, ValueViolation> {
        let entry = self.slots.get(&slot).ok_or_else(|| {
            ValueViolation::Constraint(format!("rule has no slot {}", slot))
        })?;

        for constraint in &entry.constraints {
            constraint.check(literal).map_err(ValueViolation::Constraint)?;
        }

        if entry.dimension.kind.is_enumerated() {
            let resolved = match value_id {
                Some(id) => {
                    let value = entry.value(id).ok_or_else(|| {
                        ValueViolation::Constraint(format!(
                            "value {} does not belong to dimension '{}'",
                            id, entry.dimension.name
                        ))
                    })?;
                    value.clone()
                }
                None => entry
                    .value_by_literal(literal)
                    .ok_or_else(|| {
                        ValueViolation::Constraint(format!(
                            "'{}' is not a permitted value of dimension '{}'",
                            literal, entry.dimension.name
                        ))
                    })?
                    .clone(),
            };
            self.check_parent_link(entry, &resolved)?;
            Ok(Some(resolved.id))
        } else {
            Ok(None)
        }
    }

    fn check_parent_link(
        &self,
        entry: &SlotCatalog,
        value: &DimensionValue,
    ) -> Result<(), ValueViolation> {
        let Some(parent_value) = value.parent_value_id else {
            return Ok(());
        };
        let Some(parent_dimension) = entry.dimension.parent_id else {
            return Err(ValueViolation::ParentLink(format!(
                "value '{}' references a parent value but dimension '{}' declares no parent dimension",
                value.value, entry.dimension.name
            )));
        };
        match self.value_dimensions.get(&parent_value) {
            Some(owner) if *owner == parent_dimension => Ok(()),
            Some(owner) => Err(ValueViolation::ParentLink(format!(
                "parent value of '{}' belongs to dimension {}, expected {}",
                value.value, owner, parent_dimension
            ))),
            None => Err(ValueViolation::ParentLink(format!(
                "parent value {} of '{}' is unknown",
                parent_value, value.value
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use namegraph_core::{DimensionKind, WorkspaceId};
    use uuid::Uuid;

    fn free_text_slot(slot: SlotIndex, constraints: Vec<CompiledConstraint>) -> SlotCatalog {
        let dimension = Dimension::new(
            WorkspaceId::new_v4(),
            "service".to_string(),
            DimensionKind::FreeText,
        );
        SlotCatalog::new(slot, dimension, Vec::new(), constraints)
    }

    #[test]
    fn length_constraint_counts_chars() {
        let constraint = CompiledConstraint::Length { min: 2, max: 4 };
        assert!(constraint.check("ab").is_ok());
        assert!(constraint.check("abcd").is_ok());
        assert!(constraint.check("a").is_err());
        assert!(constraint.check("abcde").is_err());
    }

    #[test]
    fn pattern_constraint_reports_the_pattern() {
        let compiled = CompiledConstraint::compile(&DimensionConstraint::pattern(
            Uuid::new_v4(),
            "^[a-z]+$".to_string(),
        ))
        .unwrap();
        let err = compiled.check("UP").unwrap_err();
        assert!(err.contains("^[a-z]+$"));
    }

    #[test]
    fn free_text_slot_passes_constraints_and_binds_nothing() {
        let slot = free_text_slot(
            0,
            vec![CompiledConstraint::Length { min: 1, max: 10 }],
        );
        let rule = Rule::new(slot.dimension.workspace_id, "aws".to_string(), Vec::new());
        let catalog = Catalog::new(rule, vec![slot], HashMap::new());

        assert_eq!(catalog.validate_slot_value(0, "edge", None).unwrap(), None);
        let violation = catalog
            .validate_slot_value(0, "a-value-that-is-too-long", None)
            .unwrap_err();
        assert!(matches!(violation, ValueViolation::Constraint(_)));
    }

    #[test]
    fn enumerated_slot_resolves_literals() {
        let workspace = WorkspaceId::new_v4();
        let dimension = Dimension::new(workspace, "env".to_string(), DimensionKind::Enumerated);
        let prod = DimensionValue::new(dimension.id, "prod".to_string());
        let prod_id = prod.id;
        let slot = SlotCatalog::new(0, dimension.clone(), vec![prod], Vec::new());
        let mut value_dimensions = HashMap::new();
        value_dimensions.insert(prod_id, dimension.id);
        let rule = Rule::new(workspace, "aws".to_string(), Vec::new());
        let catalog = Catalog::new(rule, vec![slot], value_dimensions);

        assert_eq!(
            catalog.validate_slot_value(0, "prod", None).unwrap(),
            Some(prod_id)
        );
        assert_eq!(catalog.resolve_literal(0, "prod"), Some(prod_id));
        assert!(catalog.validate_slot_value(0, "staging", None).is_err());
    }

    #[test]
    fn parent_link_must_match_declared_parent_dimension() {
        let workspace = WorkspaceId::new_v4();
        let region = Dimension::new(workspace, "region".to_string(), DimensionKind::Enumerated);
        let env = Dimension::new(workspace, "env".to_string(), DimensionKind::Enumerated)
            .with_parent(region.id);

        let us_east = DimensionValue::new(region.id, "us-east".to_string());
        let prod = DimensionValue::new(env.id, "prod".to_string())
            .with_parent_value(us_east.id);
        let stray = DimensionValue::new(env.id, "stray".to_string())
            .with_parent_value(ValueId::new_v4());

        let mut value_dimensions = HashMap::new();
        value_dimensions.insert(us_east.id, region.id);
        value_dimensions.insert(prod.id, env.id);
        value_dimensions.insert(stray.id, env.id);

        let slot = SlotCatalog::new(0, env, vec![prod.clone(), stray.clone()], Vec::new());
        let rule = Rule::new(workspace, "aws".to_string(), Vec::new());
        let catalog = Catalog::new(rule, vec![slot], value_dimensions);

        assert!(catalog.validate_slot_value(0, "prod", Some(prod.id)).is_ok());
        let violation = catalog
            .validate_slot_value(0, "stray", Some(stray.id))
            .unwrap_err();
        assert!(matches!(violation, ValueViolation::ParentLink(_)));
    }
}
