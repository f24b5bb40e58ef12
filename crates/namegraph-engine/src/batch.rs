use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use namegraph_catalog::Catalog;
use namegraph_core::{
    AuditStore, Batch, BatchId, BatchSettings, BatchStatus, Conflict, DetailEdit, DetailSnapshot,
    DetailWrite, NameGraphError, NameString, Result, RuleId, SlotIndex, StringDetail, StringId,
    StringStore, WorkspaceId,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::conflict::{ConflictResolver, ProposedState, SiblingSnapshot};

/// Which strings a batch targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BatchSelector {
    Ids(Vec<StringId>),
    ChildrenOf(StringId),
}

/// The edits to apply: one list for every target, or a list per
/// target id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UpdateSpec {
    Uniform(Vec<DetailEdit>),
    PerString(HashMap<StringId, Vec<DetailEdit>>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub workspace_id: WorkspaceId,
    pub rule_id: RuleId,
    pub initiator: String,
    pub selector: BatchSelector,
    pub updates: UpdateSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchOptions {
    pub dry_run: bool,
    /// Overrides the configured chunk size when set.
    pub max_chunk_size: Option<usize>,
}

impl BatchOptions {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            max_chunk_size: None,
        }
    }
}

/// One applied (string, slot) change with its before and after state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedChange {
    pub string_id: StringId,
    pub slot: SlotIndex,
    pub previous: Option<DetailSnapshot>,
    pub current: DetailSnapshot,
}

/// Per-chunk commit outcome. Chunks commit independently; an earlier
/// committed chunk stays committed when a later one fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkOutcome {
    pub index: usize,
    pub strings: Vec<StringId>,
    pub committed: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: BatchId,
    pub dry_run: bool,
    pub applied: Vec<AppliedChange>,
    pub conflicts: Vec<Conflict>,
    /// Targets whose edits changed nothing.
    pub skipped: Vec<StringId>,
    /// Strings in chunks that failed to commit.
    pub failed: Vec<StringId>,
    pub chunks: Vec<ChunkOutcome>,
}

impl BatchResult {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty() && self.failed.is_empty()
    }
}

struct Proposal {
    state: ProposedState,
    /// Pre-edit snapshot per changed slot; `None` when the slot had
    /// no detail yet.
    previous: HashMap<SlotIndex, Option<DetailSnapshot>>,
}

/// Applies bulk detail edits: resolve targets, build proposed states,
/// run conflict checks once, then commit the survivors in bounded
/// chunks. Every invocation leaves a [`Batch`] audit record, dry-run
/// included.
pub struct BatchMutator<S, A> {
    strings: Arc<S>,
    audit: Arc<A>,
    settings: BatchSettings,
}

impl<S: StringStore, A: AuditStore> BatchMutator<S, A> {
    pub fn new(strings: Arc<S>, audit: Arc<A>, settings: BatchSettings) -> Self {
        Self {
            strings,
            audit,
            settings,
        }
    }

    pub async fn apply(
        &self,
        catalog: &Catalog,
        request: BatchRequest,
        options: BatchOptions,
    ) -> Result<BatchResult> {
        let batch = Batch::new(
            request.workspace_id,
            request.rule_id,
            request.initiator.clone(),
            options.dry_run,
        );
        self.audit.record_batch(batch.clone()).await?;
        self.execute(batch, catalog, request, options).await
    }

    /// Drive a batch whose audit row is already recorded. Lets a
    /// caller hand out the batch id before the work is scheduled.
    pub async fn execute(
        &self,
        mut batch: Batch,
        catalog: &Catalog,
        request: BatchRequest,
        options: BatchOptions,
    ) -> Result<BatchResult> {
        if let Err(e) = validate_updates(&request.updates) {
            batch.status = BatchStatus::Failed;
            self.audit.update_batch(batch).await?;
            return Err(e);
        }
        batch.status = BatchStatus::Running;
        self.audit.update_batch(batch.clone()).await?;

        let outcome = self.run(catalog, &request, &options, batch.id).await;
        match outcome {
            Ok(result) => {
                batch.status = BatchStatus::Completed;
                batch.applied_count = result.applied.len() as u32;
                batch.conflict_count = result.conflicts.len() as u32;
                batch.skipped_count = result.skipped.len() as u32;
                self.audit.update_batch(batch).await?;
                info!(
                    batch = %result.batch_id,
                    dry_run = result.dry_run,
                    applied = result.applied.len(),
                    conflicts = result.conflicts.len(),
                    skipped = result.skipped.len(),
                    "batch finished"
                );
                Ok(result)
            }
            Err(e) => {
                batch.status = BatchStatus::Failed;
                self.audit.update_batch(batch).await?;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        catalog: &Catalog,
        request: &BatchRequest,
        options: &BatchOptions,
        batch_id: BatchId,
    ) -> Result<BatchResult> {
        let targets = self.resolve_targets(request).await?;
        let mut result = BatchResult {
            batch_id,
            dry_run: options.dry_run,
            applied: Vec::new(),
            conflicts: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            chunks: Vec::new(),
        };
        if targets.is_empty() {
            return Ok(result);
        }

        let target_ids: Vec<StringId> = targets.iter().map(|t| t.id).collect();
        let details: HashMap<StringId, Vec<StringDetail>> = self
            .strings
            .get_details_many(&target_ids)
            .await?
            .into_iter()
            .collect();

        let mut proposals: Vec<Proposal> = Vec::new();
        for target in &targets {
            let current = details.get(&target.id).cloned().unwrap_or_default();
            let edits = edits_for(&request.updates, target.id);
            if edits.is_empty() {
                result.skipped.push(target.id);
                continue;
            }
            match build_proposal(catalog, target, &current, edits)? {
                Some(proposal) => proposals.push(proposal),
                // Every edit reproduced the current state.
                None => result.skipped.push(target.id),
            }
        }
        if proposals.is_empty() {
            return Ok(result);
        }

        let siblings = self.snapshot_siblings(request.rule_id, &proposals).await?;
        let states: Vec<ProposedState> = proposals.iter().map(|p| p.state.clone()).collect();
        result.conflicts = ConflictResolver::check(&states, &siblings, catalog);

        let conflicted: HashSet<(StringId, SlotIndex)> = result
            .conflicts
            .iter()
            .map(|c| (c.string_id, c.slot))
            .collect();

        // Conflicts reject per detail, not per string; surviving
        // slots of a partially conflicted string still commit.
        let mut writes: Vec<(DetailWrite, Vec<AppliedChange>)> = Vec::new();
        for proposal in &proposals {
            let surviving: Vec<SlotIndex> = proposal
                .state
                .changed_slots
                .iter()
                .copied()
                .filter(|slot| !conflicted.contains(&(proposal.state.string_id, *slot)))
                .collect();
            if surviving.is_empty() {
                continue;
            }
            let details: Vec<StringDetail> = surviving
                .iter()
                .filter_map(|slot| proposal.state.detail(*slot).cloned())
                .collect();
            let changes: Vec<AppliedChange> = details
                .iter()
                .map(|d| AppliedChange {
                    string_id: proposal.state.string_id,
                    slot: d.slot,
                    previous: proposal.previous.get(&d.slot).cloned().flatten(),
                    current: d.snapshot(),
                })
                .collect();
            writes.push((
                DetailWrite {
                    string_id: proposal.state.string_id,
                    workspace_id: request.workspace_id,
                    rule_id: request.rule_id,
                    parent_id: proposal.state.parent_id,
                    details,
                },
                changes,
            ));
        }

        if options.dry_run {
            // The dry-run report counts what a real run would apply.
            for (_, changes) in writes {
                result.applied.extend(changes);
            }
            return Ok(result);
        }

        let chunk_size = options
            .max_chunk_size
            .unwrap_or(self.settings.max_chunk_size)
            .max(1);
        for (index, chunk) in writes.chunks(chunk_size).enumerate() {
            self.commit_chunk(index, chunk, &mut result).await;
        }
        Ok(result)
    }

    /// Commit one chunk, retrying lock contention with backoff and
    /// shedding strings the storage layer rejects as duplicates. A
    /// shed string becomes a conflict; any other failure marks the
    /// whole chunk failed.
    async fn commit_chunk(
        &self,
        index: usize,
        chunk: &[(DetailWrite, Vec<AppliedChange>)],
        result: &mut BatchResult,
    ) {
        let mut pending: Vec<(DetailWrite, Vec<AppliedChange>)> = chunk.to_vec();
        let mut outcome = ChunkOutcome {
            index,
            strings: chunk.iter().map(|(w, _)| w.string_id).collect(),
            committed: false,
            error: None,
        };
        let mut retries_left = self.settings.lock_retries;

        while !pending.is_empty() {
            let writes: Vec<DetailWrite> = pending.iter().map(|(w, _)| w.clone()).collect();
            match self.strings.commit_chunk(&writes).await {
                Ok(()) => {
                    for (_, changes) in pending.drain(..) {
                        result.applied.extend(changes);
                    }
                    outcome.committed = true;
                    break;
                }
                Err(NameGraphError::Uniqueness {
                    string_id,
                    slot,
                    value,
                }) => {
                    // The pre-check ran before our locks were taken;
                    // the store's own index is authoritative.
                    debug!(string = %string_id, slot, "write-time uniqueness rejection");
                    result
                        .conflicts
                        .push(Conflict::uniqueness(string_id, slot, value));
                    pending.retain(|(w, _)| w.string_id != string_id);
                }
                Err(NameGraphError::LockContention { string_id }) if retries_left > 0 => {
                    retries_left -= 1;
                    let backoff = Duration::from_millis(
                        self.settings.retry_backoff_ms
                            * (self.settings.lock_retries - retries_left) as u64,
                    );
                    debug!(string = %string_id, ?backoff, "chunk blocked on row lock, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    warn!(chunk = index, error = %e, "chunk commit failed");
                    outcome.error = Some(e.to_string());
                    result.failed.extend(pending.iter().map(|(w, _)| w.string_id));
                    break;
                }
            }
        }
        if pending.is_empty() {
            outcome.committed = true;
        }
        result.chunks.push(outcome);
    }

    async fn resolve_targets(&self, request: &BatchRequest) -> Result<Vec<NameString>> {
        let targets = match &request.selector {
            BatchSelector::Ids(ids) => {
                let found = self.strings.get_strings(ids).await?;
                if found.len() != ids.len() {
                    let found_ids: HashSet<StringId> = found.iter().map(|s| s.id).collect();
                    let missing = ids.iter().find(|id| !found_ids.contains(id));
                    return Err(NameGraphError::NotFound(format!(
                        "string {}",
                        missing.expect("some id is missing")
                    )));
                }
                found
            }
            BatchSelector::ChildrenOf(parent) => self.strings.children_of(*parent).await?,
        };
        for target in &targets {
            if target.workspace_id != request.workspace_id || target.rule_id != request.rule_id {
                return Err(NameGraphError::Validation(format!(
                    "string {} does not belong to the requested workspace and rule",
                    target.id
                )));
            }
        }
        Ok(targets)
    }

    /// Current owned claims of every sibling set the proposals touch.
    /// Parent values load first so sibling details matching them are
    /// recognized as inherited shadows rather than claims.
    async fn snapshot_siblings(
        &self,
        rule_id: RuleId,
        proposals: &[Proposal],
    ) -> Result<SiblingSnapshot> {
        let parents: HashSet<Option<StringId>> = proposals
            .iter()
            .map(|p| p.state.parent_id)
            .collect();

        let mut snapshot = SiblingSnapshot::new();
        for parent in &parents {
            if let Some(parent_id) = parent {
                for detail in self.strings.get_details(*parent_id).await? {
                    snapshot.set_parent_value(*parent_id, detail.slot, detail.value);
                }
            }
        }
        for parent in parents {
            let siblings = match parent {
                Some(id) => self.strings.children_of(id).await?,
                None => self.strings.roots(rule_id).await?,
            };
            let ids: Vec<StringId> = siblings.iter().map(|s| s.id).collect();
            for (string_id, details) in self.strings.get_details_many(&ids).await? {
                for detail in details {
                    snapshot.observe(parent, detail.slot, detail.value, string_id);
                }
            }
        }
        Ok(snapshot)
    }
}

fn validate_updates(updates: &UpdateSpec) -> Result<()> {
    let lists: Vec<&Vec<DetailEdit>> = match updates {
        UpdateSpec::Uniform(edits) => vec![edits],
        UpdateSpec::PerString(map) => map.values().collect(),
    };
    if lists.is_empty() || lists.iter().all(|edits| edits.is_empty()) {
        return Err(NameGraphError::Validation("no edits in payload".into()));
    }
    for edits in lists {
        let mut seen = HashSet::new();
        for edit in edits {
            if !seen.insert(edit.slot) {
                return Err(NameGraphError::Validation(format!(
                    "duplicate edit for slot {}",
                    edit.slot
                )));
            }
            if edit.value.as_deref() == Some("") {
                return Err(NameGraphError::Validation(format!(
                    "empty value for slot {}",
                    edit.slot
                )));
            }
        }
    }
    Ok(())
}

fn edits_for(updates: &UpdateSpec, string_id: StringId) -> Vec<DetailEdit> {
    match updates {
        UpdateSpec::Uniform(edits) => edits.clone(),
        UpdateSpec::PerString(map) => map.get(&string_id).cloned().unwrap_or_default(),
    }
}

/// Apply the edits to a copy of the current details. Returns `None`
/// when nothing actually changes, which is what makes re-submitting
/// an already-applied batch a no-op.
fn build_proposal(
    catalog: &Catalog,
    target: &NameString,
    current: &[StringDetail],
    edits: Vec<DetailEdit>,
) -> Result<Option<Proposal>> {
    let mut post: Vec<StringDetail> = Vec::new();
    let mut previous: HashMap<SlotIndex, Option<DetailSnapshot>> = HashMap::new();
    let mut changed: Vec<SlotIndex> = Vec::new();

    for edit in edits {
        if edit.is_noop() {
            continue;
        }
        let existing = current.iter().find(|d| d.slot == edit.slot);
        let mut detail = match existing {
            Some(detail) => detail.clone(),
            None => {
                let Some(value) = &edit.value else {
                    return Err(NameGraphError::Validation(format!(
                        "slot {} has no detail to patch and the edit carries no value",
                        edit.slot
                    )));
                };
                StringDetail::new(target.id, edit.slot, value.clone())
            }
        };
        edit.apply_to(&mut detail);
        // Bind enumerated literals to their value id; unknown
        // literals stay unbound and fail the membership check later.
        if detail.value_id.is_none() {
            detail.value_id = catalog.resolve_literal(edit.slot, &detail.value);
        }
        if existing.map(|e| *e == detail).unwrap_or(false) {
            continue;
        }
        previous.insert(edit.slot, existing.map(|e| e.snapshot()));
        changed.push(edit.slot);
        post.push(detail);
    }

    if changed.is_empty() {
        return Ok(None);
    }
    Ok(Some(Proposal {
        state: ProposedState::new(target.id, target.parent_id, post, changed),
        previous,
    }))
}
