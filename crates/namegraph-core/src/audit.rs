use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::types::{BatchId, JobId, RuleId, SlotIndex, StringId, WorkspaceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchStatus::Pending => "PENDING",
            BatchStatus::Running => "RUNNING",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

/// Audit record of one bulk-mutation attempt, dry-run or real.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub workspace_id: WorkspaceId,
    pub rule_id: RuleId,
    pub initiator: String,
    pub created_at: DateTime<Utc>,
    pub dry_run: bool,
    pub status: BatchStatus,
    pub applied_count: u32,
    pub conflict_count: u32,
    pub skipped_count: u32,
}

impl Batch {
    pub fn new(
        workspace_id: WorkspaceId,
        rule_id: RuleId,
        initiator: impl Into<String>,
        dry_run: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            rule_id,
            initiator: initiator.into(),
            created_at: Utc::now(),
            dry_run,
            status: BatchStatus::Pending,
            applied_count: 0,
            conflict_count: 0,
            skipped_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Cancelling,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::CompletedWithErrors | JobStatus::Failed
        )
    }

    /// Legal transitions of the propagation state machine. Cancellation is
    /// only reachable from RUNNING and resolves to COMPLETED_WITH_ERRORS.
    pub fn can_transition(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, CompletedWithErrors)
                | (Running, Failed)
                | (Running, Cancelling)
                | (Cancelling, CompletedWithErrors)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Cancelling => "CANCELLING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            JobStatus::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

/// Per-level accounting appended by the runner after the level is fully
/// committed; the vector order is the processing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelStats {
    pub level: u32,
    pub targets: u32,
    pub applied: u32,
    pub conflicted: u32,
    pub skipped: u32,
}

/// One cascade run triggered by a parent edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationJob {
    pub id: JobId,
    pub origin_string: StringId,
    pub workspace_id: WorkspaceId,
    pub rule_id: RuleId,
    pub initiator: String,
    pub status: JobStatus,
    pub current_level: u32,
    pub levels: Vec<LevelStats>,
    pub error_count: u32,
    pub nodes_processed: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message: Option<String>,
}

impl PropagationJob {
    pub fn new(
        origin_string: StringId,
        workspace_id: WorkspaceId,
        rule_id: RuleId,
        initiator: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            origin_string,
            workspace_id,
            rule_id,
            initiator: initiator.into(),
            status: JobStatus::Pending,
            current_level: 0,
            levels: Vec::new(),
            error_count: 0,
            nodes_processed: 0,
            created_at: now,
            updated_at: now,
            message: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropagationErrorKind {
    Uniqueness,
    Constraint,
    ParentLink,
    DepthLimit,
    /// Explicit marker for descendants the job never reached (cancellation,
    /// error budget, level budget). Never silently dropped.
    NotProcessed,
}

impl fmt::Display for PropagationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PropagationErrorKind::Uniqueness => "uniqueness",
            PropagationErrorKind::Constraint => "constraint",
            PropagationErrorKind::ParentLink => "parent_link",
            PropagationErrorKind::DepthLimit => "depth_limit",
            PropagationErrorKind::NotProcessed => "not_processed",
        };
        write!(f, "{}", s)
    }
}

/// One failed or skipped descendant update within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationError {
    pub job_id: JobId,
    pub string_id: StringId,
    pub slot: Option<SlotIndex>,
    pub kind: PropagationErrorKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl PropagationError {
    pub fn new(
        job_id: JobId,
        string_id: StringId,
        slot: Option<SlotIndex>,
        kind: PropagationErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            string_id,
            slot,
            kind,
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}
