use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::try_join_all;
use namegraph_core::{
    Dimension, DimensionId, NameGraphError, Result, Rule, RuleId, TaxonomyStore, ValueId,
};
use tracing::{debug, warn};

use crate::catalog::{Catalog, CompiledConstraint, SlotCatalog};

/// Assembles per-rule catalogs from a [`TaxonomyStore`]. Slot loads
/// run concurrently; the result is fully indexed so consumers never
/// scan value lists.
pub struct CatalogBuilder<T> {
    store: Arc<T>,
}

impl<T: TaxonomyStore> CatalogBuilder<T> {
    pub fn new(store: Arc<T>) -> Self {
        Self { store }
    }

    pub async fn build(&self, rule_id: RuleId) -> Result<Catalog> {
        let rule = self
            .store
            .get_rule(rule_id)
            .await?
            .ok_or_else(|| NameGraphError::NotFound(format!("rule {}", rule_id)))?;

        let dimensions = self.load_slot_dimensions(&rule).await?;
        self.check_dimension_hierarchy(&dimensions)?;

        let mut value_dimensions: HashMap<ValueId, DimensionId> = HashMap::new();
        let mut slots = Vec::with_capacity(rule.slots.len());

        let loads = rule.slots.iter().map(|slot| {
            let store = Arc::clone(&self.store);
            let dimension = dimensions
                .get(&slot.dimension_id)
                .cloned()
                .expect("slot dimensions were just loaded");
            async move {
                let values = store.values_of(dimension.id).await?;
                let constraints = store.constraints_of(dimension.id).await?;
                Ok::<_, NameGraphError>((slot.index, dimension, values, constraints))
            }
        });

        for (index, dimension, values, raw_constraints) in try_join_all(loads).await? {
            let mut compiled = Vec::with_capacity(raw_constraints.len());
            for constraint in &raw_constraints {
                let c = CompiledConstraint::compile(constraint).map_err(|reason| {
                    NameGraphError::Taxonomy(format!(
                        "dimension '{}': {}",
                        dimension.name, reason
                    ))
                })?;
                compiled.push(c);
            }
            for value in &values {
                value_dimensions.insert(value.id, value.dimension_id);
            }
            slots.push(SlotCatalog::new(index, dimension, values, compiled));
        }

        // Parent dimensions are not necessarily bound to any slot, but
        // their values must be resolvable for parent-link checks.
        let parent_ids: HashSet<DimensionId> = dimensions
            .values()
            .filter_map(|d| d.parent_id)
            .filter(|id| !dimensions.contains_key(id))
            .collect();
        for parent_id in parent_ids {
            match self.store.values_of(parent_id).await {
                Ok(values) => {
                    for value in values {
                        value_dimensions.insert(value.id, value.dimension_id);
                    }
                }
                Err(e) => {
                    warn!(dimension = %parent_id, error = %e, "parent dimension values unavailable");
                }
            }
        }

        debug!(
            rule = %rule_id,
            slots = slots.len(),
            values = value_dimensions.len(),
            "catalog built"
        );
        Ok(Catalog::new(rule, slots, value_dimensions))
    }

    async fn load_slot_dimensions(&self, rule: &Rule) -> Result<HashMap<DimensionId, Dimension>> {
        let ids: HashSet<DimensionId> = rule.slots.iter().map(|s| s.dimension_id).collect();
        let loads = ids.into_iter().map(|id| {
            let store = Arc::clone(&self.store);
            async move {
                let dimension = store.get_dimension(id).await?.ok_or_else(|| {
                    NameGraphError::Taxonomy(format!("rule references missing dimension {}", id))
                })?;
                Ok::<_, NameGraphError>((id, dimension))
            }
        });
        Ok(try_join_all(loads).await?.into_iter().collect())
    }

    /// The dimension parent chain must be acyclic; value parent chains
    /// ascend it, so an acyclic dimension hierarchy bounds them too.
    fn check_dimension_hierarchy(
        &self,
        dimensions: &HashMap<DimensionId, Dimension>,
    ) -> Result<()> {
        for start in dimensions.values() {
            let mut seen = HashSet::new();
            seen.insert(start.id);
            let mut cursor = start.parent_id;
            while let Some(id) = cursor {
                if !seen.insert(id) {
                    return Err(NameGraphError::Taxonomy(format!(
                        "dimension hierarchy cycle through '{}'",
                        start.name
                    )));
                }
                cursor = dimensions.get(&id).and_then(|d| d.parent_id);
            }
        }
        Ok(())
    }
}
