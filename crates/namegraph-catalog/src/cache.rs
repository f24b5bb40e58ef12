use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use namegraph_core::{Result, RuleId, TaxonomyStore};
use tracing::debug;

use crate::builder::CatalogBuilder;
use crate::catalog::Catalog;

/// Catalog cache statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct CatalogStats {
    pub hits: u64,
    pub misses: u64,
    pub rebuilds: u64,
    pub invalidations: u64,
    pub entries: usize,
}

impl CatalogStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}

/// Per-rule catalog cache. Entries are rebuilt on miss, after
/// explicit invalidation, or when older than the optional TTL.
pub struct CatalogCache<T> {
    builder: CatalogBuilder<T>,
    catalogs: DashMap<RuleId, Arc<Catalog>>,
    ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
    rebuilds: AtomicU64,
    invalidations: AtomicU64,
}

impl<T: TaxonomyStore> CatalogCache<T> {
    pub fn new(store: Arc<T>, ttl: Option<Duration>) -> Self {
        Self {
            builder: CatalogBuilder::new(store),
            catalogs: DashMap::new(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            rebuilds: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Cached catalog for the rule, building it on demand.
    pub async fn get(&self, rule_id: RuleId) -> Result<Arc<Catalog>> {
        if let Some(entry) = self.catalogs.get(&rule_id) {
            if !self.expired(&entry) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(&entry));
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.rebuild(rule_id).await
    }

    /// Force a fresh build, replacing whatever was cached.
    pub async fn rebuild(&self, rule_id: RuleId) -> Result<Arc<Catalog>> {
        let catalog = Arc::new(self.builder.build(rule_id).await?);
        self.catalogs.insert(rule_id, Arc::clone(&catalog));
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
        debug!(rule = %rule_id, "catalog rebuilt");
        Ok(catalog)
    }

    pub fn invalidate(&self, rule_id: RuleId) -> bool {
        let removed = self.catalogs.remove(&rule_id).is_some();
        if removed {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn invalidate_all(&self) {
        let count = self.catalogs.len() as u64;
        self.catalogs.clear();
        self.invalidations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn contains(&self, rule_id: RuleId) -> bool {
        self.catalogs.contains_key(&rule_id)
    }

    pub fn stats(&self) -> CatalogStats {
        CatalogStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            entries: self.catalogs.len(),
        }
    }

    fn expired(&self, catalog: &Arc<Catalog>) -> bool {
        match self.ttl {
            Some(ttl) => {
                let age = Utc::now() - catalog.built_at;
                age.to_std().map(|age| age > ttl).unwrap_or(false)
            }
            None => false,
        }
    }
}
