use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use namegraph_catalog::CatalogCache;
use namegraph_core::{
    AuditStore, ConflictKind, DetailEdit, DetailSnapshot, FieldEdit, JobId, JobStatus, LevelStats,
    NameGraphError, PropagationError, PropagationErrorKind, PropagationJob, PropagationSettings,
    Result, SlotIndex, StringDetail, StringId, StringStore, TaxonomyStore,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::batch::{
    AppliedChange, BatchMutator, BatchOptions, BatchRequest, BatchSelector, UpdateSpec,
};
use crate::inheritance::InheritanceMatrix;

/// One slot transition on the origin string: the pre-edit state the
/// descendants' classification runs against and the post-edit state
/// to push down. The whole inherited chain carried `previous`
/// canonically, so the same pair applies at every level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotChange {
    pub slot: SlotIndex,
    pub previous: DetailSnapshot,
    pub current: DetailSnapshot,
}

impl SlotChange {
    /// An applied change with no prior detail has no inherited copies
    /// below it and yields no cascade.
    pub fn from_applied(change: &AppliedChange) -> Option<Self> {
        change.previous.clone().map(|previous| Self {
            slot: change.slot,
            previous,
            current: change.current.clone(),
        })
    }

    /// The edit a descendant receives. Formatting mirrors the new
    /// state exactly, absent fields cleared, so the child stays
    /// canonically equal to its parent afterwards.
    fn edit(&self) -> DetailEdit {
        fn mirror(field: &Option<String>) -> FieldEdit {
            match field {
                Some(v) => FieldEdit::Set(v.clone()),
                None => FieldEdit::Clear,
            }
        }
        DetailEdit {
            slot: self.slot,
            value: Some(self.current.value.clone()),
            value_id: self.current.value_id,
            prefix: mirror(&self.current.prefix),
            suffix: mirror(&self.current.suffix),
            delimiter: mirror(&self.current.delimiter),
        }
    }
}

/// Job lifecycle notifications for observers; polling
/// [`AuditStore::get_job`] sees the same state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Started { job_id: JobId },
    LevelCompleted { job_id: JobId, stats: LevelStats },
    Finished { job_id: JobId, status: JobStatus },
}

/// Cascades an applied edit through the descendants of its origin,
/// breadth-first, one [`BatchMutator`] call per level. A job runs as
/// a spawned task; [`PropagationEngine::start`] returns its id
/// immediately and callers poll or subscribe for progress.
///
/// Level N+1 never starts before level N is fully committed and
/// accounted, so every child is classified against its parent's final
/// post-edit state. A conflicted or overridden slot prunes that
/// subtree for that slot only; sibling subtrees and other slots
/// proceed.
///
/// The engine is a cheap handle; clones share the same runner state.
pub struct PropagationEngine<S, A, T> {
    core: Arc<EngineCore<S, A, T>>,
}

impl<S, A, T> Clone for PropagationEngine<S, A, T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

struct EngineCore<S, A, T> {
    strings: Arc<S>,
    audit: Arc<A>,
    catalogs: Arc<CatalogCache<T>>,
    batches: Arc<BatchMutator<S, A>>,
    settings: PropagationSettings,
    cancel_flags: DashMap<JobId, Arc<AtomicBool>>,
    events: broadcast::Sender<JobEvent>,
}

impl<S, A, T> PropagationEngine<S, A, T>
where
    S: StringStore + 'static,
    A: AuditStore + 'static,
    T: TaxonomyStore + 'static,
{
    pub fn new(
        strings: Arc<S>,
        audit: Arc<A>,
        catalogs: Arc<CatalogCache<T>>,
        batches: Arc<BatchMutator<S, A>>,
        settings: PropagationSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            core: Arc::new(EngineCore {
                strings,
                audit,
                catalogs,
                batches,
                settings,
                cancel_flags: DashMap::new(),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.core.events.subscribe()
    }

    /// Record a pending job and spawn its runner. The returned id is
    /// valid for polling before the job makes any progress.
    pub async fn start(
        &self,
        origin: StringId,
        changes: Vec<SlotChange>,
        initiator: impl Into<String>,
    ) -> Result<JobId> {
        if changes.is_empty() {
            return Err(NameGraphError::Validation(
                "propagation needs at least one slot change".into(),
            ));
        }
        let mut seen = HashSet::new();
        for change in &changes {
            if !seen.insert(change.slot) {
                return Err(NameGraphError::Validation(format!(
                    "duplicate slot change for slot {}",
                    change.slot
                )));
            }
        }
        let origin_string = self
            .core
            .strings
            .get_string(origin)
            .await?
            .ok_or_else(|| NameGraphError::NotFound(format!("string {}", origin)))?;

        let job = PropagationJob::new(
            origin,
            origin_string.workspace_id,
            origin_string.rule_id,
            initiator,
        );
        let job_id = job.id;
        self.core.audit.record_job(job.clone()).await?;
        self.core
            .cancel_flags
            .insert(job_id, Arc::new(AtomicBool::new(false)));

        info!(job = %job_id, origin = %origin, slots = changes.len(), "propagation job queued");
        let core = Arc::clone(&self.core);
        tokio::spawn(async move { core.run_job(job, changes).await });
        Ok(job_id)
    }

    /// Flag a running job for cancellation. The runner honors the
    /// flag at the next level boundary; the in-flight level always
    /// finishes.
    pub async fn cancel(&self, job_id: JobId) -> Result<()> {
        if let Some(flag) = self.core.cancel_flags.get(&job_id) {
            flag.store(true, Ordering::Relaxed);
            info!(job = %job_id, "cancellation requested");
            return Ok(());
        }
        match self.core.audit.get_job(job_id).await? {
            Some(job) => Err(NameGraphError::InvalidOperation(format!(
                "job {} is already {}",
                job_id, job.status
            ))),
            None => Err(NameGraphError::NotFound(format!("job {}", job_id))),
        }
    }
}

impl<S, A, T> EngineCore<S, A, T>
where
    S: StringStore + 'static,
    A: AuditStore + 'static,
    T: TaxonomyStore + 'static,
{
    async fn run_job(self: Arc<Self>, mut job: PropagationJob, changes: Vec<SlotChange>) {
        let job_id = job.id;
        if let Err(e) = self.drive(&mut job, &changes).await {
            warn!(job = %job_id, error = %e, "propagation job failed");
            job.message = Some(e.to_string());
            if job.status.can_transition(JobStatus::Failed) {
                job.status = JobStatus::Failed;
            }
            job.updated_at = Utc::now();
            if let Err(e) = self.audit.update_job(job.clone()).await {
                warn!(job = %job_id, error = %e, "could not persist job failure");
            }
        }
        self.cancel_flags.remove(&job_id);
        let _ = self.events.send(JobEvent::Finished {
            job_id,
            status: job.status,
        });
    }

    async fn drive(&self, job: &mut PropagationJob, changes: &[SlotChange]) -> Result<()> {
        self.transition(job, JobStatus::Running).await?;
        let _ = self.events.send(JobEvent::Started { job_id: job.id });
        info!(job = %job.id, origin = %job.origin_string, "propagation running");

        let catalog = self.catalogs.get(job.rule_id).await?;
        let by_slot: HashMap<SlotIndex, &SlotChange> =
            changes.iter().map(|c| (c.slot, c)).collect();
        // Classification probes carrying each slot's pre-edit state.
        let probes: HashMap<SlotIndex, StringDetail> = changes
            .iter()
            .map(|c| {
                let mut probe = StringDetail::new(job.origin_string, c.slot, "");
                c.previous.apply_to(&mut probe);
                (c.slot, probe)
            })
            .collect();

        let started = Instant::now();
        let deadline = Duration::from_millis(self.settings.max_duration_ms);
        let all_slots: Vec<SlotIndex> = changes.iter().map(|c| c.slot).collect();
        let mut frontier: Vec<(StringId, Vec<SlotIndex>)> = vec![(job.origin_string, all_slots)];

        loop {
            let mut level_children: Vec<(namegraph_core::NameString, Vec<SlotIndex>)> = Vec::new();
            for (parent_id, live) in &frontier {
                for child in self.strings.children_of(*parent_id).await? {
                    level_children.push((child, live.clone()));
                }
            }
            if level_children.is_empty() {
                break;
            }
            let level_no = job.current_level + 1;
            let child_ids: Vec<StringId> = level_children.iter().map(|(c, _)| c.id).collect();

            if self.cancel_requested(job.id) {
                let msg = NameGraphError::JobCancelled { job_id: job.id }.to_string();
                self.transition(job, JobStatus::Cancelling).await?;
                self.mark_unvisited(job, &child_ids, PropagationErrorKind::NotProcessed, &msg, false)
                    .await?;
                job.message = Some(msg);
                self.transition(job, JobStatus::CompletedWithErrors).await?;
                return Ok(());
            }
            if started.elapsed() >= deadline {
                let msg = NameGraphError::JobTimeout { job_id: job.id }.to_string();
                self.mark_unvisited(job, &child_ids, PropagationErrorKind::NotProcessed, &msg, false)
                    .await?;
                job.message = Some(msg);
                self.transition(job, JobStatus::Failed).await?;
                return Ok(());
            }
            if level_no > self.settings.max_levels {
                let msg = format!(
                    "level {} exceeds the configured limit of {}",
                    level_no, self.settings.max_levels
                );
                self.mark_unvisited(job, &child_ids, PropagationErrorKind::DepthLimit, &msg, true)
                    .await?;
                job.message = Some(msg);
                self.transition(job, JobStatus::CompletedWithErrors).await?;
                return Ok(());
            }
            if job.error_count >= self.settings.error_threshold {
                let msg = format!(
                    "error threshold of {} reached, remaining levels skipped",
                    self.settings.error_threshold
                );
                self.mark_unvisited(job, &child_ids, PropagationErrorKind::NotProcessed, &msg, true)
                    .await?;
                job.message = Some(msg);
                self.transition(job, JobStatus::CompletedWithErrors).await?;
                return Ok(());
            }
            if level_children.len() > self.settings.max_level_width {
                let msg = format!(
                    "level {} holds {} strings, exceeding the width budget of {}",
                    level_no,
                    level_children.len(),
                    self.settings.max_level_width
                );
                self.mark_unvisited(job, &child_ids, PropagationErrorKind::NotProcessed, &msg, false)
                    .await?;
                job.message = Some(msg);
                self.transition(job, JobStatus::Failed).await?;
                return Ok(());
            }
            job.nodes_processed += level_children.len() as u32;
            if job.nodes_processed as usize > self.settings.max_nodes {
                let msg = format!(
                    "node budget of {} exceeded at level {}",
                    self.settings.max_nodes, level_no
                );
                self.mark_unvisited(job, &child_ids, PropagationErrorKind::NotProcessed, &msg, false)
                    .await?;
                job.message = Some(msg);
                self.transition(job, JobStatus::Failed).await?;
                return Ok(());
            }

            let mut stats = LevelStats {
                level: level_no,
                targets: 0,
                applied: 0,
                conflicted: 0,
                skipped: 0,
            };
            let details: HashMap<StringId, Vec<StringDetail>> = self
                .strings
                .get_details_many(&child_ids)
                .await?
                .into_iter()
                .collect();

            let mut edit_map: HashMap<StringId, Vec<DetailEdit>> = HashMap::new();
            let mut proposed: HashMap<StringId, Vec<SlotIndex>> = HashMap::new();
            for (child, live) in &level_children {
                let child_details = details.get(&child.id).cloned().unwrap_or_default();
                for slot in live {
                    stats.targets += 1;
                    let change = by_slot[slot];
                    let probe = &probes[slot];
                    let Some(detail) = child_details.iter().find(|d| d.slot == *slot) else {
                        stats.skipped += 1;
                        continue;
                    };
                    if InheritanceMatrix::details_match(probe, detail) {
                        edit_map.entry(child.id).or_default().push(change.edit());
                        proposed.entry(child.id).or_default().push(*slot);
                    } else if detail.value == change.current.value {
                        // The override already holds the incoming
                        // value; cascading would collide with the
                        // inherited copies in this sibling set.
                        let error = PropagationError::new(
                            job.id,
                            child.id,
                            Some(*slot),
                            PropagationErrorKind::Uniqueness,
                            format!(
                                "override already holds \"{}\", subtree skipped for slot {}",
                                detail.value, slot
                            ),
                        );
                        self.audit.record_error(error).await?;
                        job.error_count += 1;
                        stats.conflicted += 1;
                    } else {
                        // Override boundary; the subtree keeps its
                        // divergent value for this slot.
                        stats.skipped += 1;
                    }
                }
            }

            let mut next: Vec<(StringId, Vec<SlotIndex>)> = Vec::new();
            if !edit_map.is_empty() {
                let ids: Vec<StringId> = level_children
                    .iter()
                    .map(|(c, _)| c.id)
                    .filter(|id| edit_map.contains_key(id))
                    .collect();
                let request = BatchRequest {
                    workspace_id: job.workspace_id,
                    rule_id: job.rule_id,
                    initiator: job.initiator.clone(),
                    selector: BatchSelector::Ids(ids),
                    updates: UpdateSpec::PerString(edit_map),
                };
                let result = self
                    .batches
                    .apply(catalog.as_ref(), request, BatchOptions::default())
                    .await?;

                let applied: HashSet<(StringId, SlotIndex)> = result
                    .applied
                    .iter()
                    .map(|a| (a.string_id, a.slot))
                    .collect();
                stats.applied = applied.len() as u32;

                let mut conflicted: HashSet<(StringId, SlotIndex)> = HashSet::new();
                for conflict in &result.conflicts {
                    let kind = match conflict.kind {
                        ConflictKind::Uniqueness => PropagationErrorKind::Uniqueness,
                        ConflictKind::Constraint => PropagationErrorKind::Constraint,
                        ConflictKind::ParentLink => PropagationErrorKind::ParentLink,
                    };
                    let error = PropagationError::new(
                        job.id,
                        conflict.string_id,
                        Some(conflict.slot),
                        kind,
                        conflict.message.clone(),
                    );
                    self.audit.record_error(error).await?;
                    job.error_count += 1;
                    stats.conflicted += 1;
                    conflicted.insert((conflict.string_id, conflict.slot));
                }

                let batch_skipped: HashSet<StringId> = result.skipped.iter().copied().collect();
                let failed: HashSet<StringId> = result.failed.iter().copied().collect();
                for (string_id, slots) in &proposed {
                    for slot in slots {
                        if conflicted.contains(&(*string_id, *slot)) {
                            continue;
                        }
                        if failed.contains(string_id) {
                            let error = PropagationError::new(
                                job.id,
                                *string_id,
                                Some(*slot),
                                PropagationErrorKind::NotProcessed,
                                "chunk failed to commit",
                            );
                            self.audit.record_error(error).await?;
                            job.error_count += 1;
                            stats.conflicted += 1;
                        } else if batch_skipped.contains(string_id) {
                            stats.skipped += 1;
                        }
                    }
                }

                for (string_id, slots) in proposed {
                    let live: Vec<SlotIndex> = slots
                        .into_iter()
                        .filter(|slot| applied.contains(&(string_id, *slot)))
                        .collect();
                    if !live.is_empty() {
                        next.push((string_id, live));
                    }
                }
            }

            job.current_level = level_no;
            job.levels.push(stats);
            job.updated_at = Utc::now();
            self.audit.update_job(job.clone()).await?;
            let _ = self.events.send(JobEvent::LevelCompleted {
                job_id: job.id,
                stats,
            });
            debug!(
                job = %job.id,
                level = level_no,
                targets = stats.targets,
                applied = stats.applied,
                conflicted = stats.conflicted,
                "level committed"
            );
            frontier = next;
        }

        let status = if job.error_count > 0 {
            JobStatus::CompletedWithErrors
        } else {
            JobStatus::Completed
        };
        self.transition(job, status).await?;
        info!(
            job = %job.id,
            status = %job.status,
            levels = job.levels.len(),
            errors = job.error_count,
            "propagation finished"
        );
        Ok(())
    }

    async fn transition(&self, job: &mut PropagationJob, next: JobStatus) -> Result<()> {
        if !job.status.can_transition(next) {
            return Err(NameGraphError::InvalidOperation(format!(
                "job {} cannot move from {} to {}",
                job.id, job.status, next
            )));
        }
        job.status = next;
        job.updated_at = Utc::now();
        self.audit.update_job(job.clone()).await
    }

    fn cancel_requested(&self, job_id: JobId) -> bool {
        self.cancel_flags
            .get(&job_id)
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Record one error per descendant the job will not visit, so no
    /// node is dropped silently. `deep` walks the whole remaining
    /// subtree breadth-first; the walk stops at the node budget.
    async fn mark_unvisited(
        &self,
        job: &mut PropagationJob,
        seed: &[StringId],
        kind: PropagationErrorKind,
        message: &str,
        deep: bool,
    ) -> Result<()> {
        let mut queue: VecDeque<StringId> = VecDeque::new();
        let mut marked = 0usize;
        for id in seed {
            let error = PropagationError::new(job.id, *id, None, kind, message);
            self.audit.record_error(error).await?;
            job.error_count += 1;
            marked += 1;
            if deep {
                queue.push_back(*id);
            }
        }
        while let Some(parent) = queue.pop_front() {
            if marked >= self.settings.max_nodes {
                debug!(job = %job.id, marked, "marker walk stopped at the node budget");
                break;
            }
            for child in self.strings.children_of(parent).await? {
                let error = PropagationError::new(job.id, child.id, None, kind, message);
                self.audit.record_error(error).await?;
                job.error_count += 1;
                marked += 1;
                queue.push_back(child.id);
            }
        }
        Ok(())
    }
}
