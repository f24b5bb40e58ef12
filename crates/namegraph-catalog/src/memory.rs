use async_trait::async_trait;
use dashmap::DashMap;
use namegraph_core::{
    Dimension, DimensionConstraint, DimensionId, DimensionValue, Result, Rule, RuleId,
    TaxonomyStore,
};

/// In-memory taxonomy backing store. Serves as the reference
/// implementation of [`TaxonomyStore`] and the fixture store in
/// tests.
#[derive(Default)]
pub struct MemoryTaxonomyStore {
    rules: DashMap<RuleId, Rule>,
    dimensions: DashMap<DimensionId, Dimension>,
    values: DashMap<DimensionId, Vec<DimensionValue>>,
    constraints: DashMap<DimensionId, Vec<DimensionConstraint>>,
}

impl MemoryTaxonomyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_rule(&self, rule: Rule) {
        self.rules.insert(rule.id, rule);
    }

    pub fn insert_dimension(&self, dimension: Dimension) {
        self.dimensions.insert(dimension.id, dimension);
    }

    pub fn insert_value(&self, value: DimensionValue) {
        self.values.entry(value.dimension_id).or_default().push(value);
    }

    pub fn insert_constraint(&self, constraint: DimensionConstraint) {
        self.constraints
            .entry(constraint.dimension_id)
            .or_default()
            .push(constraint);
    }

    pub fn remove_value(&self, dimension_id: DimensionId, literal: &str) {
        if let Some(mut values) = self.values.get_mut(&dimension_id) {
            values.retain(|v| v.value != literal);
        }
    }
}

#[async_trait]
impl TaxonomyStore for MemoryTaxonomyStore {
    async fn get_rule(&self, rule_id: RuleId) -> Result<Option<Rule>> {
        Ok(self.rules.get(&rule_id).map(|r| r.clone()))
    }

    async fn get_dimension(&self, dimension_id: DimensionId) -> Result<Option<Dimension>> {
        Ok(self.dimensions.get(&dimension_id).map(|d| d.clone()))
    }

    async fn values_of(&self, dimension_id: DimensionId) -> Result<Vec<DimensionValue>> {
        Ok(self
            .values
            .get(&dimension_id)
            .map(|v| v.clone())
            .unwrap_or_default())
    }

    async fn constraints_of(
        &self,
        dimension_id: DimensionId,
    ) -> Result<Vec<DimensionConstraint>> {
        Ok(self
            .constraints
            .get(&dimension_id)
            .map(|c| c.clone())
            .unwrap_or_default())
    }
}
