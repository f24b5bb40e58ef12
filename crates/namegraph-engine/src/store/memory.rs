use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use namegraph_core::{
    AuditStore, Batch, BatchId, DetailWrite, JobId, NameGraphError, NameString, PropagationError,
    PropagationJob, Result, RuleId, SlotIndex, StringDetail, StringId, StringStore,
};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// In-memory [`StringStore`]. Mirrors the contract a relational
/// backend would give: per-row locks taken in sorted id order, atomic
/// chunk commits, and write-time re-verification of the sibling
/// uniqueness rule.
///
/// Uniqueness covers *owned* values only: a detail whose value
/// differs from the parent's value at that slot (roots own all of
/// theirs). Children shadowing the parent's value are what
/// inheritance produces and may repeat freely within a sibling set.
pub struct MemoryStringStore {
    strings: DashMap<StringId, NameString>,
    details: DashMap<StringId, Vec<StringDetail>>,
    children: DashMap<StringId, HashSet<StringId>>,
    roots: DashMap<RuleId, HashSet<StringId>>,
    locks: DashMap<StringId, Arc<Mutex<()>>>,
    /// Serializes the check-then-apply window across callers that did
    /// not lock each other's rows.
    commit_gate: SyncMutex<()>,
    lock_timeout: Duration,
}

impl Default for MemoryStringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStringStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(Duration::from_millis(250))
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            strings: DashMap::new(),
            details: DashMap::new(),
            children: DashMap::new(),
            roots: DashMap::new(),
            locks: DashMap::new(),
            commit_gate: SyncMutex::new(()),
            lock_timeout,
        }
    }

    pub fn string_count(&self) -> usize {
        self.strings.len()
    }

    fn row_lock(&self, string_id: StringId) -> Arc<Mutex<()>> {
        self.locks
            .entry(string_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn acquire_sorted(
        &self,
        mut ids: Vec<StringId>,
    ) -> Result<Vec<tokio::sync::OwnedMutexGuard<()>>> {
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let lock = self.row_lock(id);
            match timeout(self.lock_timeout, lock.lock_owned()).await {
                Ok(guard) => guards.push(guard),
                Err(_) => return Err(NameGraphError::LockContention { string_id: id }),
            }
        }
        Ok(guards)
    }

    fn sibling_ids(&self, rule_id: RuleId, parent: Option<StringId>) -> Vec<StringId> {
        match parent {
            Some(parent_id) => self
                .children
                .get(&parent_id)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default(),
            None => self
                .roots
                .get(&rule_id)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default(),
        }
    }

    /// A string's details as the pending writes would leave them.
    fn effective_details(
        &self,
        string_id: StringId,
        overlay: &HashMap<StringId, &DetailWrite>,
    ) -> Vec<StringDetail> {
        let mut details = self
            .details
            .get(&string_id)
            .map(|d| d.clone())
            .unwrap_or_default();
        if let Some(write) = overlay.get(&string_id) {
            for incoming in &write.details {
                match details.iter_mut().find(|d| d.slot == incoming.slot) {
                    Some(existing) => *existing = incoming.clone(),
                    None => details.push(incoming.clone()),
                }
            }
        }
        details
    }

    /// Verify written rows of one sibling set against its post-write
    /// state: an owned value a written row claims must not already be
    /// owned by another member. Collisions purely among unwritten
    /// members are out of scope here; a cascade rewrites a parent
    /// before its children, and between those levels the children's
    /// stale shadows transiently read as owned duplicates. `extra` is
    /// a member not yet in the tables (an insert or reparent in
    /// flight).
    fn verify_sibling_set(
        &self,
        rule_id: RuleId,
        parent: Option<StringId>,
        touched_slots: &HashSet<SlotIndex>,
        overlay: &HashMap<StringId, &DetailWrite>,
        extra: Option<(StringId, &[StringDetail])>,
        written: &HashSet<StringId>,
    ) -> Result<()> {
        let parent_values: HashMap<SlotIndex, String> = match parent {
            Some(parent_id) => self
                .effective_details(parent_id, overlay)
                .into_iter()
                .map(|d| (d.slot, d.value))
                .collect(),
            None => HashMap::new(),
        };
        let owned = |slot: SlotIndex, value: &str| -> bool {
            parent.is_none()
                || parent_values
                    .get(&slot)
                    .map(|pv| pv != value)
                    .unwrap_or(true)
        };

        let member_ids = self.sibling_ids(rule_id, parent);
        let mut standing: HashMap<(SlotIndex, String), StringId> = HashMap::new();
        let mut pending: Vec<(StringId, Vec<StringDetail>)> = Vec::new();
        for member in member_ids {
            if let Some((extra_id, _)) = extra {
                if member == extra_id {
                    continue;
                }
            }
            let details = self.effective_details(member, overlay);
            if written.contains(&member) {
                pending.push((member, details));
                continue;
            }
            for detail in details {
                if touched_slots.contains(&detail.slot) && owned(detail.slot, &detail.value) {
                    standing.entry((detail.slot, detail.value)).or_insert(member);
                }
            }
        }
        if let Some((extra_id, details)) = extra {
            pending.push((extra_id, details.to_vec()));
        }

        let mut incoming: HashMap<(SlotIndex, String), StringId> = HashMap::new();
        for (string_id, details) in pending {
            for detail in details {
                if !touched_slots.contains(&detail.slot) || !owned(detail.slot, &detail.value) {
                    continue;
                }
                let key = (detail.slot, detail.value.clone());
                let taken = standing.get(&key).is_some()
                    || incoming.get(&key).map(|first| *first != string_id).unwrap_or(false);
                if taken {
                    return Err(NameGraphError::Uniqueness {
                        string_id,
                        slot: detail.slot,
                        value: detail.value,
                    });
                }
                incoming.insert(key, string_id);
            }
        }
        Ok(())
    }

    fn index_child(&self, string: &NameString) {
        match string.parent_id {
            Some(parent) => {
                self.children.entry(parent).or_default().insert(string.id);
            }
            None => {
                self.roots.entry(string.rule_id).or_default().insert(string.id);
            }
        }
    }

    fn unindex_child(&self, string: &NameString) {
        match string.parent_id {
            Some(parent) => {
                if let Some(mut set) = self.children.get_mut(&parent) {
                    set.remove(&string.id);
                }
            }
            None => {
                if let Some(mut set) = self.roots.get_mut(&string.rule_id) {
                    set.remove(&string.id);
                }
            }
        }
    }

    fn sorted(&self, ids: impl IntoIterator<Item = StringId>) -> Vec<NameString> {
        let mut out: Vec<NameString> = ids
            .into_iter()
            .filter_map(|id| self.strings.get(&id).map(|s| s.clone()))
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }
}

#[async_trait]
impl StringStore for MemoryStringStore {
    async fn get_string(&self, string_id: StringId) -> Result<Option<NameString>> {
        Ok(self.strings.get(&string_id).map(|s| s.clone()))
    }

    async fn get_strings(&self, string_ids: &[StringId]) -> Result<Vec<NameString>> {
        Ok(string_ids
            .iter()
            .filter_map(|id| self.strings.get(id).map(|s| s.clone()))
            .collect())
    }

    async fn children_of(&self, string_id: StringId) -> Result<Vec<NameString>> {
        let ids: Vec<StringId> = self
            .children
            .get(&string_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        Ok(self.sorted(ids))
    }

    async fn child_count(&self, string_id: StringId) -> Result<usize> {
        Ok(self.children.get(&string_id).map(|set| set.len()).unwrap_or(0))
    }

    async fn roots(&self, rule_id: RuleId) -> Result<Vec<NameString>> {
        let ids: Vec<StringId> = self
            .roots
            .get(&rule_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        Ok(self.sorted(ids))
    }

    async fn get_details(&self, string_id: StringId) -> Result<Vec<StringDetail>> {
        Ok(self
            .details
            .get(&string_id)
            .map(|d| d.clone())
            .unwrap_or_default())
    }

    async fn get_details_many(
        &self,
        string_ids: &[StringId],
    ) -> Result<Vec<(StringId, Vec<StringDetail>)>> {
        Ok(string_ids
            .iter()
            .map(|id| {
                (
                    *id,
                    self.details.get(id).map(|d| d.clone()).unwrap_or_default(),
                )
            })
            .collect())
    }

    async fn insert_string(&self, string: NameString, details: Vec<StringDetail>) -> Result<()> {
        if let Some(parent_id) = string.parent_id {
            if !self.strings.contains_key(&parent_id) {
                return Err(NameGraphError::NotFound(format!("parent {}", parent_id)));
            }
        }
        let touched: HashSet<SlotIndex> = details.iter().map(|d| d.slot).collect();
        {
            let _gate = self.commit_gate.lock();
            self.verify_sibling_set(
                string.rule_id,
                string.parent_id,
                &touched,
                &HashMap::new(),
                Some((string.id, &details)),
                &HashSet::new(),
            )?;
            self.index_child(&string);
            self.details.insert(string.id, details);
            self.strings.insert(string.id, string);
        }
        Ok(())
    }

    async fn delete_string(&self, string_id: StringId) -> Result<()> {
        let child_count = self.child_count(string_id).await?;
        if child_count > 0 {
            return Err(NameGraphError::CascadeBlocked {
                string_id,
                child_count,
            });
        }
        let Some((_, string)) = self.strings.remove(&string_id) else {
            return Err(NameGraphError::NotFound(format!("string {}", string_id)));
        };
        self.unindex_child(&string);
        self.details.remove(&string_id);
        self.children.remove(&string_id);
        self.locks.remove(&string_id);
        Ok(())
    }

    async fn set_parent(&self, string_id: StringId, parent_id: Option<StringId>) -> Result<()> {
        let _guards = self.acquire_sorted(vec![string_id]).await?;
        let old = self
            .strings
            .get(&string_id)
            .map(|s| s.clone())
            .ok_or_else(|| NameGraphError::NotFound(format!("string {}", string_id)))?;
        if old.parent_id == parent_id {
            return Ok(());
        }
        if let Some(new_parent) = parent_id {
            if !self.strings.contains_key(&new_parent) {
                return Err(NameGraphError::NotFound(format!("parent {}", new_parent)));
            }
        }

        let details = self.get_details(string_id).await?;
        let touched: HashSet<SlotIndex> = details.iter().map(|d| d.slot).collect();
        {
            let _gate = self.commit_gate.lock();
            // The string joins a new sibling set; its values must be
            // re-verified against that set, not the one it leaves.
            self.verify_sibling_set(
                old.rule_id,
                parent_id,
                &touched,
                &HashMap::new(),
                Some((string_id, &details)),
                &HashSet::new(),
            )?;

            let mut updated = old.clone();
            updated.parent_id = parent_id;
            updated.updated_at = Utc::now();
            self.unindex_child(&old);
            self.index_child(&updated);
            self.strings.insert(string_id, updated);
        }
        Ok(())
    }

    async fn commit_chunk(&self, writes: &[DetailWrite]) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let ids: Vec<StringId> = writes.iter().map(|w| w.string_id).collect();
        let _guards = self.acquire_sorted(ids).await?;

        let overlay: HashMap<StringId, &DetailWrite> =
            writes.iter().map(|w| (w.string_id, w)).collect();
        let written: HashSet<StringId> = overlay.keys().copied().collect();

        let mut sets: HashMap<(RuleId, Option<StringId>), HashSet<SlotIndex>> = HashMap::new();
        for write in writes {
            let Some(current) = self.strings.get(&write.string_id) else {
                return Err(NameGraphError::NotFound(format!(
                    "string {}",
                    write.string_id
                )));
            };
            let slots = sets
                .entry((current.rule_id, current.parent_id))
                .or_default();
            slots.extend(write.details.iter().map(|d| d.slot));
        }

        {
            let _gate = self.commit_gate.lock();
            // All checks precede any mutation so a failed chunk
            // leaves no partial state behind.
            for ((rule_id, parent), touched) in &sets {
                self.verify_sibling_set(*rule_id, *parent, touched, &overlay, None, &written)?;
            }

            for write in writes {
                let Some(mut string) = self.strings.get_mut(&write.string_id) else {
                    continue;
                };
                string.updated_at = Utc::now();
                drop(string);
                let merged = self.effective_details(write.string_id, &overlay);
                self.details.insert(write.string_id, merged);
            }
        }
        Ok(())
    }
}

/// In-memory [`AuditStore`].
#[derive(Default)]
pub struct MemoryAuditStore {
    batches: DashMap<BatchId, Batch>,
    jobs: DashMap<JobId, PropagationJob>,
    errors: DashMap<JobId, Vec<PropagationError>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn record_batch(&self, batch: Batch) -> Result<()> {
        self.batches.insert(batch.id, batch);
        Ok(())
    }

    async fn update_batch(&self, batch: Batch) -> Result<()> {
        self.batches.insert(batch.id, batch);
        Ok(())
    }

    async fn get_batch(&self, batch_id: BatchId) -> Result<Option<Batch>> {
        Ok(self.batches.get(&batch_id).map(|b| b.clone()))
    }

    async fn record_job(&self, job: PropagationJob) -> Result<()> {
        self.jobs.insert(job.id, job);
        Ok(())
    }

    async fn update_job(&self, job: PropagationJob) -> Result<()> {
        self.jobs.insert(job.id, job);
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<PropagationJob>> {
        Ok(self.jobs.get(&job_id).map(|j| j.clone()))
    }

    async fn record_error(&self, error: PropagationError) -> Result<()> {
        self.errors.entry(error.job_id).or_default().push(error);
        Ok(())
    }

    async fn errors_for_job(&self, job_id: JobId) -> Result<Vec<PropagationError>> {
        Ok(self.errors.get(&job_id).map(|e| e.clone()).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use namegraph_core::WorkspaceId;
    use uuid::Uuid;

    fn make_string(workspace: WorkspaceId, rule: RuleId) -> NameString {
        NameString::new(workspace, rule)
    }

    fn write(s: &NameString, details: Vec<StringDetail>) -> DetailWrite {
        DetailWrite {
            string_id: s.id,
            workspace_id: s.workspace_id,
            rule_id: s.rule_id,
            parent_id: s.parent_id,
            details,
        }
    }

    #[tokio::test]
    async fn insert_rejects_colliding_roots() {
        let store = MemoryStringStore::new();
        let ws = Uuid::new_v4();
        let rule = Uuid::new_v4();

        let a = make_string(ws, rule);
        store
            .insert_string(a.clone(), vec![StringDetail::new(a.id, 0, "prod")])
            .await
            .unwrap();

        let b = make_string(ws, rule);
        let err = store
            .insert_string(b.clone(), vec![StringDetail::new(b.id, 0, "prod")])
            .await
            .unwrap_err();
        assert!(matches!(err, NameGraphError::Uniqueness { .. }));
    }

    #[tokio::test]
    async fn children_may_shadow_the_parent_value() {
        let store = MemoryStringStore::new();
        let ws = Uuid::new_v4();
        let rule = Uuid::new_v4();

        let parent = make_string(ws, rule);
        store
            .insert_string(parent.clone(), vec![StringDetail::new(parent.id, 0, "prod")])
            .await
            .unwrap();

        // Two children inheriting "prod" coexist; their slot-1 values
        // are what tells them apart.
        for region in ["us-east", "us-west"] {
            let child = make_string(ws, rule).with_parent(parent.id);
            store
                .insert_string(
                    child.clone(),
                    vec![
                        StringDetail::new(child.id, 0, "prod"),
                        StringDetail::new(child.id, 1, region),
                    ],
                )
                .await
                .unwrap();
        }

        // A third child colliding on its owned slot-1 value does not.
        let third = make_string(ws, rule).with_parent(parent.id);
        let err = store
            .insert_string(
                third.clone(),
                vec![
                    StringDetail::new(third.id, 0, "prod"),
                    StringDetail::new(third.id, 1, "us-east"),
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NameGraphError::Uniqueness { .. }));
    }

    #[tokio::test]
    async fn delete_with_children_is_blocked() {
        let store = MemoryStringStore::new();
        let ws = Uuid::new_v4();
        let rule = Uuid::new_v4();

        let parent = make_string(ws, rule);
        store
            .insert_string(parent.clone(), vec![StringDetail::new(parent.id, 0, "p")])
            .await
            .unwrap();
        let child = make_string(ws, rule).with_parent(parent.id);
        store
            .insert_string(child.clone(), vec![StringDetail::new(child.id, 0, "c")])
            .await
            .unwrap();

        let err = store.delete_string(parent.id).await.unwrap_err();
        assert!(matches!(
            err,
            NameGraphError::CascadeBlocked { child_count: 1, .. }
        ));
        assert_eq!(store.string_count(), 2);

        store.delete_string(child.id).await.unwrap();
        store.delete_string(parent.id).await.unwrap();
        assert_eq!(store.string_count(), 0);
    }

    #[tokio::test]
    async fn failed_chunk_leaves_no_partial_state() {
        let store = MemoryStringStore::new();
        let ws = Uuid::new_v4();
        let rule = Uuid::new_v4();

        let a = make_string(ws, rule);
        let b = make_string(ws, rule);
        let c = make_string(ws, rule);
        for (s, v) in [(&a, "one"), (&b, "two"), (&c, "three")] {
            store
                .insert_string(s.clone(), vec![StringDetail::new(s.id, 0, v)])
                .await
                .unwrap();
        }

        // b's new value collides with c, which this chunk leaves alone.
        let writes = vec![
            write(&a, vec![StringDetail::new(a.id, 0, "uno")]),
            write(&b, vec![StringDetail::new(b.id, 0, "three")]),
        ];
        let err = store.commit_chunk(&writes).await.unwrap_err();
        assert!(matches!(
            err,
            NameGraphError::Uniqueness { string_id, .. } if string_id == b.id
        ));

        let details = store.get_details(a.id).await.unwrap();
        assert_eq!(details[0].value, "one");
    }

    #[tokio::test]
    async fn chunk_commit_supports_value_swaps() {
        let store = MemoryStringStore::new();
        let ws = Uuid::new_v4();
        let rule = Uuid::new_v4();

        let a = make_string(ws, rule);
        let b = make_string(ws, rule);
        for (s, v) in [(&a, "x"), (&b, "y")] {
            store
                .insert_string(s.clone(), vec![StringDetail::new(s.id, 0, v)])
                .await
                .unwrap();
        }

        let writes = vec![
            write(&a, vec![StringDetail::new(a.id, 0, "y")]),
            write(&b, vec![StringDetail::new(b.id, 0, "x")]),
        ];
        store.commit_chunk(&writes).await.unwrap();
        assert_eq!(store.get_details(a.id).await.unwrap()[0].value, "y");
        assert_eq!(store.get_details(b.id).await.unwrap()[0].value, "x");
    }

    #[tokio::test]
    async fn reparent_is_checked_against_the_new_sibling_set() {
        let store = MemoryStringStore::new();
        let ws = Uuid::new_v4();
        let rule = Uuid::new_v4();

        let p1 = make_string(ws, rule);
        let p2 = make_string(ws, rule);
        store
            .insert_string(p1.clone(), vec![StringDetail::new(p1.id, 0, "a")])
            .await
            .unwrap();
        store
            .insert_string(p2.clone(), vec![StringDetail::new(p2.id, 0, "b")])
            .await
            .unwrap();

        let c1 = make_string(ws, rule).with_parent(p1.id);
        let c2 = make_string(ws, rule).with_parent(p2.id);
        store
            .insert_string(c1.clone(), vec![StringDetail::new(c1.id, 0, "same")])
            .await
            .unwrap();
        store
            .insert_string(c2.clone(), vec![StringDetail::new(c2.id, 0, "same")])
            .await
            .unwrap();

        // Moving c1 under p2 would collide with c2's owned value.
        let err = store.set_parent(c1.id, Some(p2.id)).await.unwrap_err();
        assert!(matches!(err, NameGraphError::Uniqueness { .. }));

        store.delete_string(c2.id).await.unwrap();
        store.set_parent(c1.id, Some(p2.id)).await.unwrap();
        assert_eq!(store.children_of(p2.id).await.unwrap().len(), 1);
        assert_eq!(store.children_of(p1.id).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn parent_rewrite_does_not_break_inherited_children() {
        let store = MemoryStringStore::new();
        let ws = Uuid::new_v4();
        let rule = Uuid::new_v4();

        let parent = make_string(ws, rule);
        store
            .insert_string(parent.clone(), vec![StringDetail::new(parent.id, 0, "prod")])
            .await
            .unwrap();
        for region in ["east", "west"] {
            let child = make_string(ws, rule).with_parent(parent.id);
            store
                .insert_string(
                    child.clone(),
                    vec![
                        StringDetail::new(child.id, 0, "prod"),
                        StringDetail::new(child.id, 1, region),
                    ],
                )
                .await
                .unwrap();
        }

        // The parent moving off "prod" leaves the children's shadows
        // transiently stale; the write is judged on the parent's own
        // sibling set, and a follow-up cascade realigns the children.
        store
            .commit_chunk(&[write(
                &parent,
                vec![StringDetail::new(parent.id, 0, "production")],
            )])
            .await
            .unwrap();
        assert_eq!(store.get_details(parent.id).await.unwrap()[0].value, "production");
    }
}
