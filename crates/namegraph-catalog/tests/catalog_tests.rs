use std::sync::Arc;

use namegraph_catalog::{CatalogCache, InvalidationIndex, MemoryTaxonomyStore, TaxonomyEvent};
use namegraph_core::{
    Dimension, DimensionConstraint, DimensionKind, DimensionValue, NameGraphError, Rule, RuleSlot,
    WorkspaceId,
};

struct Fixture {
    store: Arc<MemoryTaxonomyStore>,
    rule: Rule,
    region: Dimension,
    env: Dimension,
    service: Dimension,
}

fn make_fixture() -> Fixture {
    let workspace = WorkspaceId::new_v4();
    let store = Arc::new(MemoryTaxonomyStore::new());

    let region = Dimension::new(workspace, "region".to_string(), DimensionKind::Enumerated);
    let env = Dimension::new(workspace, "env".to_string(), DimensionKind::Enumerated)
        .with_parent(region.id);
    let service = Dimension::new(workspace, "service".to_string(), DimensionKind::FreeText);

    let us_east = DimensionValue::new(region.id, "us-east".to_string());
    let prod = DimensionValue::new(env.id, "prod".to_string()).with_parent_value(us_east.id);
    let staging = DimensionValue::new(env.id, "staging".to_string()).with_parent_value(us_east.id);

    store.insert_dimension(region.clone());
    store.insert_dimension(env.clone());
    store.insert_dimension(service.clone());
    store.insert_value(us_east);
    store.insert_value(prod);
    store.insert_value(staging);
    store.insert_constraint(DimensionConstraint::pattern(
        service.id,
        "^[a-z][a-z0-9-]*$".to_string(),
    ));
    store.insert_constraint(DimensionConstraint::length(service.id, 2, 12));

    let rule = Rule::new(
        workspace,
        "aws".to_string(),
        vec![
            RuleSlot::new(0, env.id),
            RuleSlot::new(1, service.id),
        ],
    );
    store.insert_rule(rule.clone());

    Fixture {
        store,
        rule,
        region,
        env,
        service,
    }
}

#[tokio::test]
async fn test_build_indexes_values_and_constraints() {
    let fx = make_fixture();
    let cache = CatalogCache::new(Arc::clone(&fx.store), None);

    let catalog = cache.get(fx.rule.id).await.unwrap();
    let env_slot = catalog.slot(0).unwrap();
    assert_eq!(env_slot.value_count(), 2);
    assert!(env_slot.value_by_literal("prod").is_some());
    assert!(env_slot.value_by_literal("qa").is_none());

    let service_slot = catalog.slot(1).unwrap();
    assert_eq!(service_slot.constraints().len(), 2);
    assert!(catalog.validate_slot_value(1, "checkout", None).is_ok());
    assert!(catalog.validate_slot_value(1, "Checkout", None).is_err());
    assert!(catalog.validate_slot_value(1, "x", None).is_err());
}

#[tokio::test]
async fn test_parent_values_resolvable_for_link_checks() {
    let fx = make_fixture();
    let cache = CatalogCache::new(Arc::clone(&fx.store), None);

    let catalog = cache.get(fx.rule.id).await.unwrap();
    let prod = catalog.slot(0).unwrap().value_by_literal("prod").unwrap().clone();
    let parent = prod.parent_value_id.unwrap();
    assert_eq!(catalog.dimension_of_value(parent), Some(fx.region.id));
    assert!(catalog.validate_slot_value(0, "prod", Some(prod.id)).is_ok());
}

#[tokio::test]
async fn test_cache_hits_after_first_build() {
    let fx = make_fixture();
    let cache = CatalogCache::new(Arc::clone(&fx.store), None);

    cache.get(fx.rule.id).await.unwrap();
    cache.get(fx.rule.id).await.unwrap();
    cache.get(fx.rule.id).await.unwrap();

    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.rebuilds, 1);
    assert_eq!(stats.entries, 1);
}

#[tokio::test]
async fn test_value_mutation_invalidates_and_rebuild_sees_the_change() {
    let fx = make_fixture();
    let cache = CatalogCache::new(Arc::clone(&fx.store), None);
    let index = InvalidationIndex::new();

    let catalog = cache.get(fx.rule.id).await.unwrap();
    index.register(&catalog);
    assert_eq!(catalog.resolve_literal(0, "qa"), None);

    let qa = DimensionValue::new(fx.env.id, "qa".to_string());
    let qa_id = qa.id;
    fx.store.insert_value(qa);
    let invalidated = index.apply(
        &TaxonomyEvent::ValueChanged {
            dimension_id: fx.env.id,
            value_id: qa_id,
        },
        &cache,
    );
    assert_eq!(invalidated, vec![fx.rule.id]);
    assert!(!cache.contains(fx.rule.id));

    let rebuilt = cache.get(fx.rule.id).await.unwrap();
    assert_eq!(rebuilt.resolve_literal(0, "qa"), Some(qa_id));
    assert_eq!(cache.stats().invalidations, 1);
}

#[tokio::test]
async fn test_parent_dimension_event_invalidates_dependent_rule() {
    let fx = make_fixture();
    let cache = CatalogCache::new(Arc::clone(&fx.store), None);
    let index = InvalidationIndex::new();

    let catalog = cache.get(fx.rule.id).await.unwrap();
    index.register(&catalog);

    // region is not bound to any slot, but env declares it as parent.
    let invalidated = index.apply(
        &TaxonomyEvent::DimensionChanged {
            dimension_id: fx.region.id,
        },
        &cache,
    );
    assert_eq!(invalidated, vec![fx.rule.id]);
}

#[tokio::test]
async fn test_unrelated_dimension_event_touches_nothing() {
    let fx = make_fixture();
    let cache = CatalogCache::new(Arc::clone(&fx.store), None);
    let index = InvalidationIndex::new();

    let catalog = cache.get(fx.rule.id).await.unwrap();
    index.register(&catalog);

    let other = Dimension::new(
        fx.rule.workspace_id,
        "team".to_string(),
        DimensionKind::FreeText,
    );
    let invalidated = index.apply(
        &TaxonomyEvent::DimensionChanged {
            dimension_id: other.id,
        },
        &cache,
    );
    assert!(invalidated.is_empty());
    assert!(cache.contains(fx.rule.id));
}

#[tokio::test]
async fn test_missing_rule_is_not_found() {
    let fx = make_fixture();
    let cache = CatalogCache::new(Arc::clone(&fx.store), None);

    let err = cache.get(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, NameGraphError::NotFound(_)));
}

#[tokio::test]
async fn test_invalid_pattern_is_a_taxonomy_error() {
    let fx = make_fixture();
    fx.store.insert_constraint(DimensionConstraint::pattern(
        fx.service.id,
        "[unclosed".to_string(),
    ));
    let cache = CatalogCache::new(Arc::clone(&fx.store), None);

    let err = cache.get(fx.rule.id).await.unwrap_err();
    assert!(matches!(err, NameGraphError::Taxonomy(_)));
}

#[tokio::test]
async fn test_dimension_cycle_is_rejected() {
    let workspace = WorkspaceId::new_v4();
    let store = Arc::new(MemoryTaxonomyStore::new());

    let mut a = Dimension::new(workspace, "a".to_string(), DimensionKind::Enumerated);
    let b = Dimension::new(workspace, "b".to_string(), DimensionKind::Enumerated)
        .with_parent(a.id);
    a.parent_id = Some(b.id);
    store.insert_dimension(a.clone());
    store.insert_dimension(b.clone());

    let rule = Rule::new(
        workspace,
        "aws".to_string(),
        vec![RuleSlot::new(0, a.id), RuleSlot::new(1, b.id)],
    );
    store.insert_rule(rule.clone());

    let cache = CatalogCache::new(store, None);
    let err = cache.get(rule.id).await.unwrap_err();
    assert!(matches!(err, NameGraphError::Taxonomy(_)));
}
