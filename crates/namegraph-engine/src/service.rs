use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use namegraph_catalog::{Catalog, CatalogCache, InvalidationIndex, TaxonomyEvent};
use namegraph_core::{
    AuditStore, Batch, BatchId, Conflict, DetailEdit, EngineSettings, InheritanceStatus, JobId,
    NameGraphError, NameString, PropagationError, PropagationJob, Result, RuleId, SlotIndex,
    StringDetail, StringId, StringStore, TaxonomyStore, WorkspaceId,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::batch::{BatchMutator, BatchOptions, BatchRequest, BatchResult, BatchSelector};
use crate::inheritance::InheritanceMatrix;
use crate::propagation::{JobEvent, PropagationEngine, SlotChange};

/// Outcome of a batch submission. Small batches run inline; batches
/// above the sync threshold are deferred to a background task and
/// polled through [`NamingService::get_batch`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BatchSubmission {
    Completed {
        result: BatchResult,
        propagation_jobs: Vec<JobId>,
    },
    Deferred {
        batch_id: BatchId,
    },
}

/// A job's audit state with its recorded errors, shaped for polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job: PropagationJob,
    pub errors: Vec<PropagationError>,
}

/// Entry point tying the engine together: batch updates with
/// automatic cascades, job polling and cancellation, hierarchy
/// maintenance, and catalog invalidation. A cheap handle; clones
/// share all state.
pub struct NamingService<S, A, T> {
    strings: Arc<S>,
    audit: Arc<A>,
    catalogs: Arc<CatalogCache<T>>,
    invalidation: Arc<InvalidationIndex>,
    batches: Arc<BatchMutator<S, A>>,
    propagation: PropagationEngine<S, A, T>,
    settings: EngineSettings,
}

impl<S, A, T> Clone for NamingService<S, A, T> {
    fn clone(&self) -> Self {
        Self {
            strings: Arc::clone(&self.strings),
            audit: Arc::clone(&self.audit),
            catalogs: Arc::clone(&self.catalogs),
            invalidation: Arc::clone(&self.invalidation),
            batches: Arc::clone(&self.batches),
            propagation: self.propagation.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<S, A, T> NamingService<S, A, T>
where
    S: StringStore + 'static,
    A: AuditStore + 'static,
    T: TaxonomyStore + 'static,
{
    pub fn new(strings: Arc<S>, audit: Arc<A>, taxonomy: Arc<T>, settings: EngineSettings) -> Self {
        let ttl = settings.catalog.ttl_secs.map(Duration::from_secs);
        let catalogs = Arc::new(CatalogCache::new(taxonomy, ttl));
        let batches = Arc::new(BatchMutator::new(
            Arc::clone(&strings),
            Arc::clone(&audit),
            settings.batch.clone(),
        ));
        let propagation = PropagationEngine::new(
            Arc::clone(&strings),
            Arc::clone(&audit),
            Arc::clone(&catalogs),
            Arc::clone(&batches),
            settings.propagation.clone(),
        );
        Self {
            strings,
            audit,
            catalogs,
            invalidation: Arc::new(InvalidationIndex::new()),
            batches,
            propagation,
            settings,
        }
    }

    /// The catalog for a rule, registered for event invalidation.
    pub async fn catalog(&self, rule_id: RuleId) -> Result<Arc<Catalog>> {
        let catalog = self.catalogs.get(rule_id).await?;
        self.invalidation.register(&catalog);
        Ok(catalog)
    }

    /// Drop cached catalogs the event touches; returns the affected
    /// rules. The next lookup rebuilds from the taxonomy store.
    pub fn taxonomy_changed(&self, event: &TaxonomyEvent) -> Vec<RuleId> {
        self.invalidation.apply(event, &self.catalogs)
    }

    /// Apply a bulk edit. Batches within the sync threshold run
    /// inline and, when not a dry run, automatically start one
    /// propagation job per applied origin that has children. Larger
    /// batches return a batch id immediately and run in the
    /// background.
    pub async fn submit_batch_update(
        &self,
        request: BatchRequest,
        options: BatchOptions,
    ) -> Result<BatchSubmission> {
        let catalog = self.catalog(request.rule_id).await?;
        let size = match &request.selector {
            BatchSelector::Ids(ids) => ids.len(),
            BatchSelector::ChildrenOf(parent) => self.strings.child_count(*parent).await?,
        };
        if size <= self.settings.batch.sync_threshold {
            let result = self
                .batches
                .apply(catalog.as_ref(), request.clone(), options.clone())
                .await?;
            let propagation_jobs = if options.dry_run {
                Vec::new()
            } else {
                self.start_cascades(&result, &request.initiator).await?
            };
            return Ok(BatchSubmission::Completed {
                result,
                propagation_jobs,
            });
        }

        let batch = Batch::new(
            request.workspace_id,
            request.rule_id,
            request.initiator.clone(),
            options.dry_run,
        );
        let batch_id = batch.id;
        self.audit.record_batch(batch.clone()).await?;
        info!(batch = %batch_id, targets = size, "deferring oversized batch");

        let service = self.clone();
        tokio::spawn(async move {
            match service
                .batches
                .execute(batch, catalog.as_ref(), request.clone(), options.clone())
                .await
            {
                Ok(result) => {
                    if !options.dry_run {
                        if let Err(e) = service.start_cascades(&result, &request.initiator).await {
                            warn!(batch = %batch_id, error = %e, "cascade start failed");
                        }
                    }
                }
                Err(e) => warn!(batch = %batch_id, error = %e, "deferred batch failed"),
            }
        });
        Ok(BatchSubmission::Deferred { batch_id })
    }

    /// The conflicts a real run of this payload would reject, via the
    /// dry-run path. The dry-run batch row is the audit marker.
    pub async fn preview_conflicts(&self, request: BatchRequest) -> Result<Vec<Conflict>> {
        let catalog = self.catalog(request.rule_id).await?;
        let result = self
            .batches
            .apply(catalog.as_ref(), request, BatchOptions::dry_run())
            .await?;
        Ok(result.conflicts)
    }

    pub async fn get_batch(&self, batch_id: BatchId) -> Result<Option<Batch>> {
        self.audit.get_batch(batch_id).await
    }

    pub async fn get_propagation_job(&self, job_id: JobId) -> Result<Option<JobSnapshot>> {
        let Some(job) = self.audit.get_job(job_id).await? else {
            return Ok(None);
        };
        let errors = self.audit.errors_for_job(job_id).await?;
        Ok(Some(JobSnapshot { job, errors }))
    }

    pub async fn cancel_propagation_job(&self, job_id: JobId) -> Result<()> {
        self.propagation.cancel(job_id).await
    }

    /// Lifecycle events of all propagation jobs.
    pub fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent> {
        self.propagation.subscribe()
    }

    /// Create a string with its initial details. Enforces the depth
    /// limit and validates every value against the catalog before the
    /// store's uniqueness check runs.
    pub async fn create_string(
        &self,
        workspace_id: WorkspaceId,
        rule_id: RuleId,
        parent_id: Option<StringId>,
        details: Vec<DetailEdit>,
    ) -> Result<NameString> {
        if details.is_empty() {
            return Err(NameGraphError::Validation(
                "a string needs at least one detail".into(),
            ));
        }
        let catalog = self.catalog(rule_id).await?;

        let string = match parent_id {
            Some(parent) => {
                let parent_string = self
                    .strings
                    .get_string(parent)
                    .await?
                    .ok_or_else(|| NameGraphError::NotFound(format!("parent {}", parent)))?;
                if parent_string.workspace_id != workspace_id || parent_string.rule_id != rule_id {
                    return Err(NameGraphError::Validation(format!(
                        "parent {} belongs to another workspace or rule",
                        parent
                    )));
                }
                let max_depth = self.settings.hierarchy.max_depth;
                if self.depth_of(parent).await? + 1 > max_depth {
                    return Err(NameGraphError::DepthLimitExceeded {
                        string_id: parent,
                        max_depth,
                    });
                }
                NameString::new(workspace_id, rule_id).with_parent(parent)
            }
            None => NameString::new(workspace_id, rule_id),
        };

        let mut rows: Vec<StringDetail> = Vec::with_capacity(details.len());
        let mut seen = HashSet::new();
        for edit in details {
            if !seen.insert(edit.slot) {
                return Err(NameGraphError::Validation(format!(
                    "duplicate detail for slot {}",
                    edit.slot
                )));
            }
            let Some(value) = edit.value.clone() else {
                return Err(NameGraphError::Validation(format!(
                    "slot {} needs a value",
                    edit.slot
                )));
            };
            if value.is_empty() {
                return Err(NameGraphError::Validation(format!(
                    "empty value for slot {}",
                    edit.slot
                )));
            }
            let mut detail = StringDetail::new(string.id, edit.slot, value);
            edit.apply_to(&mut detail);
            if detail.value_id.is_none() {
                detail.value_id = catalog.resolve_literal(edit.slot, &detail.value);
            }
            if let Err(violation) =
                catalog.validate_slot_value(edit.slot, &detail.value, detail.value_id)
            {
                return Err(NameGraphError::Validation(violation.reason().to_string()));
            }
            rows.push(detail);
        }

        self.strings.insert_string(string.clone(), rows).await?;
        info!(string = %string.id, parent = ?string.parent_id, "string created");
        Ok(string)
    }

    /// Deletion never cascades; a string with children is rejected
    /// with `CascadeBlocked`, preserving the descendants' history.
    pub async fn delete_string(&self, string_id: StringId) -> Result<()> {
        self.strings.delete_string(string_id).await?;
        info!(string = %string_id, "string deleted");
        Ok(())
    }

    /// Move a string under a new parent. Rejects self or descendant
    /// parents, and moves whose deepest descendant would exceed the
    /// depth limit.
    pub async fn reparent_string(
        &self,
        string_id: StringId,
        new_parent: Option<StringId>,
    ) -> Result<()> {
        let string = self
            .strings
            .get_string(string_id)
            .await?
            .ok_or_else(|| NameGraphError::NotFound(format!("string {}", string_id)))?;
        if string.parent_id == new_parent {
            return Ok(());
        }
        if let Some(parent) = new_parent {
            if parent == string_id {
                return Err(NameGraphError::CycleDetected { string_id });
            }
            let parent_string = self
                .strings
                .get_string(parent)
                .await?
                .ok_or_else(|| NameGraphError::NotFound(format!("parent {}", parent)))?;
            if parent_string.workspace_id != string.workspace_id
                || parent_string.rule_id != string.rule_id
            {
                return Err(NameGraphError::Validation(format!(
                    "parent {} belongs to another workspace or rule",
                    parent
                )));
            }
            self.assert_no_cycle(string_id, parent).await?;

            let max_depth = self.settings.hierarchy.max_depth;
            let depth = self.depth_of(parent).await?;
            let height = self.subtree_height(string_id).await?;
            if depth + 1 + height > max_depth {
                return Err(NameGraphError::DepthLimitExceeded {
                    string_id,
                    max_depth,
                });
            }
        }
        self.strings.set_parent(string_id, new_parent).await?;
        info!(string = %string_id, parent = ?new_parent, "string reparented");
        Ok(())
    }

    /// Per-slot classification of a string against its direct parent.
    pub async fn inheritance_chain(
        &self,
        string_id: StringId,
    ) -> Result<HashMap<SlotIndex, InheritanceStatus>> {
        let string = self
            .strings
            .get_string(string_id)
            .await?
            .ok_or_else(|| NameGraphError::NotFound(format!("string {}", string_id)))?;
        let details = self.strings.get_details(string_id).await?;
        let parent_details = match string.parent_id {
            Some(parent) => Some(self.strings.get_details(parent).await?),
            None => None,
        };
        let catalog = self.catalog(string.rule_id).await?;
        Ok(InheritanceMatrix::build_chain(
            catalog.rule(),
            parent_details.as_deref(),
            &details,
        ))
    }

    /// The composed name for a string under its rule's template.
    pub async fn render(&self, string_id: StringId) -> Result<String> {
        let string = self
            .strings
            .get_string(string_id)
            .await?
            .ok_or_else(|| NameGraphError::NotFound(format!("string {}", string_id)))?;
        let details = self.strings.get_details(string_id).await?;
        let catalog = self.catalog(string.rule_id).await?;
        Ok(catalog.rule().compose(&details))
    }

    /// One cascade per applied origin that still has children; dry
    /// runs never reach this.
    async fn start_cascades(&self, result: &BatchResult, initiator: &str) -> Result<Vec<JobId>> {
        let mut by_string: HashMap<StringId, Vec<SlotChange>> = HashMap::new();
        for change in &result.applied {
            if let Some(slot_change) = SlotChange::from_applied(change) {
                by_string.entry(change.string_id).or_default().push(slot_change);
            }
        }
        let mut jobs = Vec::new();
        for (origin, changes) in by_string {
            if self.strings.child_count(origin).await? == 0 {
                continue;
            }
            let job_id = self.propagation.start(origin, changes, initiator).await?;
            jobs.push(job_id);
        }
        Ok(jobs)
    }

    /// Depth of a string counting its root as 1. A chain longer than
    /// the depth limit means a corrupted parent link.
    async fn depth_of(&self, string_id: StringId) -> Result<u32> {
        let string = self
            .strings
            .get_string(string_id)
            .await?
            .ok_or_else(|| NameGraphError::NotFound(format!("string {}", string_id)))?;
        let mut depth = 1u32;
        let mut cursor = string.parent_id;
        while let Some(ancestor) = cursor {
            depth += 1;
            if depth > self.settings.hierarchy.max_depth {
                return Err(NameGraphError::CycleDetected { string_id });
            }
            cursor = match self.strings.get_string(ancestor).await? {
                Some(s) => s.parent_id,
                None => None,
            };
        }
        Ok(depth)
    }

    /// Ancestor walk from the proposed parent, bounded by the depth
    /// limit; meeting the moved string means the parent lies inside
    /// its own subtree.
    async fn assert_no_cycle(&self, string_id: StringId, new_parent: StringId) -> Result<()> {
        let mut cursor = Some(new_parent);
        let mut steps = 0u32;
        while let Some(current) = cursor {
            if current == string_id {
                return Err(NameGraphError::CycleDetected { string_id });
            }
            steps += 1;
            if steps > self.settings.hierarchy.max_depth {
                return Err(NameGraphError::CycleDetected { string_id });
            }
            cursor = self
                .strings
                .get_string(current)
                .await?
                .and_then(|s| s.parent_id);
        }
        Ok(())
    }

    /// Levels below a string, capped at the depth limit.
    async fn subtree_height(&self, string_id: StringId) -> Result<u32> {
        let mut height = 0u32;
        let mut frontier = vec![string_id];
        loop {
            let mut next = Vec::new();
            for parent in &frontier {
                for child in self.strings.children_of(*parent).await? {
                    next.push(child.id);
                }
            }
            if next.is_empty() {
                return Ok(height);
            }
            height += 1;
            if height > self.settings.hierarchy.max_depth {
                return Ok(height);
            }
            frontier = next;
        }
    }
}
