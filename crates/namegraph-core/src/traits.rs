use async_trait::async_trait;

use crate::{
    Batch, BatchId, Dimension, DimensionConstraint, DimensionId, DimensionValue, JobId, NameString,
    PropagationError, PropagationJob, Result, Rule, RuleId, StringDetail, StringId,
};

/// Read access to the naming taxonomy: rules, dimensions, their value
/// lists and constraints. Implementations are expected to be cheap to
/// call repeatedly; the catalog layer caches on top of this.
#[async_trait]
pub trait TaxonomyStore: Send + Sync {
    async fn get_rule(&self, rule_id: RuleId) -> Result<Option<Rule>>;

    async fn get_dimension(&self, dimension_id: DimensionId) -> Result<Option<Dimension>>;

    /// Every value of the dimension, including nested ones.
    async fn values_of(&self, dimension_id: DimensionId) -> Result<Vec<DimensionValue>>;

    async fn constraints_of(&self, dimension_id: DimensionId)
        -> Result<Vec<DimensionConstraint>>;
}

/// Persistence for strings, their slot details, and the parent/child
/// forest. `commit_chunk` is the only mutating entry point the batch
/// pipeline uses; it must apply all writes in a chunk atomically and
/// re-check slot uniqueness under its own locks.
#[async_trait]
pub trait StringStore: Send + Sync {
    async fn get_string(&self, string_id: StringId) -> Result<Option<NameString>>;

    async fn get_strings(&self, string_ids: &[StringId]) -> Result<Vec<NameString>>;

    async fn children_of(&self, string_id: StringId) -> Result<Vec<NameString>>;

    async fn child_count(&self, string_id: StringId) -> Result<usize>;

    /// Strings of a rule with no parent.
    async fn roots(&self, rule_id: RuleId) -> Result<Vec<NameString>>;

    async fn get_details(&self, string_id: StringId) -> Result<Vec<StringDetail>>;

    async fn get_details_many(
        &self,
        string_ids: &[StringId],
    ) -> Result<Vec<(StringId, Vec<StringDetail>)>>;

    async fn insert_string(
        &self,
        string: NameString,
        details: Vec<StringDetail>,
    ) -> Result<()>;

    /// Fails with `CascadeBlocked` while children remain.
    async fn delete_string(&self, string_id: StringId) -> Result<()>;

    async fn set_parent(&self, string_id: StringId, parent_id: Option<StringId>) -> Result<()>;

    /// Atomically replace the details of every string in the chunk.
    /// Row locks are taken in sorted id order; a lock that cannot be
    /// acquired within the store's timeout surfaces as
    /// `LockContention` and leaves the chunk unapplied.
    async fn commit_chunk(&self, writes: &[crate::DetailWrite]) -> Result<()>;
}

/// Audit trail for batches, propagation jobs, and per-string errors.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn record_batch(&self, batch: Batch) -> Result<()>;

    async fn update_batch(&self, batch: Batch) -> Result<()>;

    async fn get_batch(&self, batch_id: BatchId) -> Result<Option<Batch>>;

    async fn record_job(&self, job: PropagationJob) -> Result<()>;

    async fn update_job(&self, job: PropagationJob) -> Result<()>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<PropagationJob>>;

    async fn record_error(&self, error: PropagationError) -> Result<()>;

    async fn errors_for_job(&self, job_id: JobId) -> Result<Vec<PropagationError>>;
}
