use std::collections::{HashMap, HashSet};

use namegraph_core::{DimensionId, RuleId, TaxonomyStore, ValueId};
use parking_lot::RwLock;
use tracing::info;

use crate::cache::CatalogCache;
use crate::catalog::Catalog;

/// Taxonomy mutation events, emitted by the CRUD layer that owns
/// dimensions and rules.
#[derive(Debug, Clone)]
pub enum TaxonomyEvent {
    DimensionChanged { dimension_id: DimensionId },
    ValueChanged { dimension_id: DimensionId, value_id: ValueId },
    ConstraintChanged { dimension_id: DimensionId },
    RuleChanged { rule_id: RuleId },
}

impl TaxonomyEvent {
    fn dimension(&self) -> Option<DimensionId> {
        match self {
            Self::DimensionChanged { dimension_id }
            | Self::ValueChanged { dimension_id, .. }
            | Self::ConstraintChanged { dimension_id } => Some(*dimension_id),
            Self::RuleChanged { .. } => None,
        }
    }
}

/// Reverse index from dimensions to the rules whose catalogs depend
/// on them. Registered when a catalog is built; a stale entry only
/// costs one redundant invalidation.
#[derive(Default)]
pub struct InvalidationIndex {
    dimension_rules: RwLock<HashMap<DimensionId, HashSet<RuleId>>>,
}

impl InvalidationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the dimensions this catalog was built from, including
    /// declared parent dimensions, whose value changes affect
    /// parent-link validation.
    pub fn register(&self, catalog: &Catalog) {
        let rule_id = catalog.rule().id;
        let mut index = self.dimension_rules.write();
        for slot in &catalog.rule().slots {
            index.entry(slot.dimension_id).or_default().insert(rule_id);
            if let Some(entry) = catalog.slot(slot.index) {
                if let Some(parent) = entry.dimension.parent_id {
                    index.entry(parent).or_default().insert(rule_id);
                }
            }
        }
    }

    pub fn rules_for_dimension(&self, dimension_id: DimensionId) -> Vec<RuleId> {
        self.dimension_rules
            .read()
            .get(&dimension_id)
            .map(|rules| rules.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Map an event to the affected rules and drop their cached
    /// catalogs. Returns the invalidated rule ids.
    pub fn apply<T: TaxonomyStore>(
        &self,
        event: &TaxonomyEvent,
        cache: &CatalogCache<T>,
    ) -> Vec<RuleId> {
        let affected = match event {
            TaxonomyEvent::RuleChanged { rule_id } => vec![*rule_id],
            _ => event
                .dimension()
                .map(|d| self.rules_for_dimension(d))
                .unwrap_or_default(),
        };
        let mut invalidated = Vec::new();
        for rule_id in affected {
            if cache.invalidate(rule_id) {
                invalidated.push(rule_id);
            }
        }
        if !invalidated.is_empty() {
            info!(?event, count = invalidated.len(), "catalogs invalidated");
        }
        invalidated
    }
}
