use thiserror::Error;

use crate::types::{JobId, SlotIndex, StringId};

#[derive(Error, Debug)]
pub enum NameGraphError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid update payload: {0}")]
    Validation(String),

    #[error("Value '{value}' already used by a sibling in slot {slot} (string {string_id})")]
    Uniqueness {
        string_id: StringId,
        slot: SlotIndex,
        value: String,
    },

    #[error("Row lock contention on string {string_id}")]
    LockContention { string_id: StringId },

    #[error("Hierarchy depth limit {max_depth} exceeded at string {string_id}")]
    DepthLimitExceeded { string_id: StringId, max_depth: u32 },

    #[error("Parent assignment for string {string_id} would create a cycle")]
    CycleDetected { string_id: StringId },

    #[error("String {string_id} has {child_count} children and cannot be deleted")]
    CascadeBlocked {
        string_id: StringId,
        child_count: usize,
    },

    #[error("Propagation job {job_id} exceeded its execution budget")]
    JobTimeout { job_id: JobId },

    #[error("Propagation job {job_id} was cancelled before reaching this level")]
    JobCancelled { job_id: JobId },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Taxonomy integrity error: {0}")]
    Taxonomy(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

pub type Result<T> = std::result::Result<T, NameGraphError>;
