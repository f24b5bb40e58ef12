use std::collections::{HashMap, HashSet};

use namegraph_catalog::Catalog;
use namegraph_core::{Conflict, SlotIndex, StringDetail, StringId};

/// One string's proposed post-update state. `details` holds the full
/// post-edit detail per changed slot; untouched slots are absent.
#[derive(Debug, Clone)]
pub struct ProposedState {
    pub string_id: StringId,
    pub parent_id: Option<StringId>,
    pub details: Vec<StringDetail>,
    pub changed_slots: Vec<SlotIndex>,
}

impl ProposedState {
    pub fn new(
        string_id: StringId,
        parent_id: Option<StringId>,
        details: Vec<StringDetail>,
        changed_slots: Vec<SlotIndex>,
    ) -> Self {
        Self {
            string_id,
            parent_id,
            details,
            changed_slots,
        }
    }

    pub fn detail(&self, slot: SlotIndex) -> Option<&StringDetail> {
        self.details.iter().find(|d| d.slot == slot)
    }
}

/// The sibling state the uniqueness check runs against.
///
/// A value is *owned* by a string when it differs from the parent's
/// value at that slot (roots own every value, sharing the `None`
/// parent set per rule). Inherited shadows of the parent's value are
/// exempt from uniqueness: a whole sibling level legitimately carries
/// the parent's value, and only owned claims may not collide.
#[derive(Debug, Default)]
pub struct SiblingSnapshot {
    claims: HashMap<(Option<StringId>, SlotIndex, String), StringId>,
    parent_values: HashMap<(StringId, SlotIndex), String>,
}

impl SiblingSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the parent's own value for a slot; children matching it
    /// are shadows, not claims.
    pub fn set_parent_value(
        &mut self,
        parent_id: StringId,
        slot: SlotIndex,
        value: impl Into<String>,
    ) {
        self.parent_values.insert((parent_id, slot), value.into());
    }

    /// Record a sibling's detail, keeping it only when owned.
    pub fn observe(
        &mut self,
        parent: Option<StringId>,
        slot: SlotIndex,
        value: impl Into<String>,
        holder: StringId,
    ) {
        let value = value.into();
        if self.is_owned(parent, slot, &value) {
            self.claims.insert((parent, slot, value), holder);
        }
    }

    pub fn is_owned(&self, parent: Option<StringId>, slot: SlotIndex, value: &str) -> bool {
        match parent {
            None => true,
            Some(parent_id) => self
                .parent_values
                .get(&(parent_id, slot))
                .map(|parent_value| parent_value != value)
                .unwrap_or(true),
        }
    }

    pub fn claimant(
        &self,
        parent: Option<StringId>,
        slot: SlotIndex,
        value: &str,
    ) -> Option<StringId> {
        self.claims.get(&(parent, slot, value.to_string())).copied()
    }

    pub fn claim_count(&self) -> usize {
        self.claims.len()
    }
}

/// Pure conflict detection over a set of proposed states. Never
/// touches storage; callers supply the catalog and a sibling
/// snapshot, and commit-time re-checks remain the storage layer's
/// second line of defense.
pub struct ConflictResolver;

impl ConflictResolver {
    /// Check every proposal against the catalog, the existing
    /// siblings, and the other proposals.
    ///
    /// Uniqueness is evaluated against the final state the batch
    /// would produce: an existing claimant whose value at that slot
    /// is rewritten by this batch vacates its claim, and two owned
    /// proposals claiming the same (parent, slot, value) conflict
    /// with each other, first proposal winning.
    pub fn check(
        proposals: &[ProposedState],
        siblings: &SiblingSnapshot,
        catalog: &Catalog,
    ) -> Vec<Conflict> {
        let mut conflicts = Vec::new();

        let changing: HashSet<(StringId, SlotIndex)> = proposals
            .iter()
            .flat_map(|p| p.changed_slots.iter().map(|slot| (p.string_id, *slot)))
            .collect();

        let mut batch_claims: HashMap<(Option<StringId>, SlotIndex, String), StringId> =
            HashMap::new();

        for proposal in proposals {
            for slot in &proposal.changed_slots {
                let Some(detail) = proposal.detail(*slot) else {
                    continue;
                };

                if let Err(violation) =
                    catalog.validate_slot_value(*slot, &detail.value, detail.value_id)
                {
                    let conflict = match violation.kind() {
                        namegraph_core::ConflictKind::ParentLink => Conflict::parent_link(
                            proposal.string_id,
                            *slot,
                            detail.value.clone(),
                            violation.reason(),
                        ),
                        _ => Conflict::constraint(
                            proposal.string_id,
                            *slot,
                            detail.value.clone(),
                            violation.reason(),
                        ),
                    };
                    conflicts.push(conflict);
                    continue;
                }

                // A proposal that lands on the parent's own value is
                // an inherited shadow and claims nothing.
                if !siblings.is_owned(proposal.parent_id, *slot, &detail.value) {
                    continue;
                }

                match siblings.claimant(proposal.parent_id, *slot, &detail.value) {
                    Some(claimant)
                        if claimant != proposal.string_id
                            && !changing.contains(&(claimant, *slot)) =>
                    {
                        conflicts.push(Conflict::uniqueness(
                            proposal.string_id,
                            *slot,
                            detail.value.clone(),
                        ));
                        continue;
                    }
                    _ => {}
                }

                let key = (proposal.parent_id, *slot, detail.value.clone());
                if let Some(first) = batch_claims.get(&key) {
                    if *first != proposal.string_id {
                        conflicts.push(Conflict::uniqueness(
                            proposal.string_id,
                            *slot,
                            detail.value.clone(),
                        ));
                    }
                } else {
                    batch_claims.insert(key, proposal.string_id);
                }
            }
        }

        conflicts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use namegraph_core::{
        ConflictKind, Dimension, DimensionKind, Rule, RuleSlot, StringDetail, WorkspaceId,
    };
    use std::collections::HashMap as StdHashMap;
    use uuid::Uuid;

    fn free_text_catalog(slots: u16) -> Catalog {
        let workspace = WorkspaceId::new_v4();
        let mut rule_slots = Vec::new();
        let mut slot_catalogs = Vec::new();
        for i in 0..slots {
            let dim = Dimension::new(workspace, format!("dim{}", i), DimensionKind::FreeText);
            rule_slots.push(RuleSlot::new(i, dim.id));
            slot_catalogs.push(namegraph_catalog::SlotCatalog::new(
                i,
                dim,
                Vec::new(),
                Vec::new(),
            ));
        }
        let rule = Rule::new(workspace, "aws", rule_slots);
        Catalog::new(rule, slot_catalogs, StdHashMap::new())
    }

    fn proposal(parent: Option<StringId>, slot: SlotIndex, value: &str) -> ProposedState {
        let id = Uuid::new_v4();
        ProposedState::new(
            id,
            parent,
            vec![StringDetail::new(id, slot, value)],
            vec![slot],
        )
    }

    #[test]
    fn owned_collision_is_a_uniqueness_conflict() {
        let catalog = free_text_catalog(1);
        let parent = Uuid::new_v4();
        let mut siblings = SiblingSnapshot::new();
        siblings.set_parent_value(parent, 0, "prod");
        siblings.observe(Some(parent), 0, "production", Uuid::new_v4());

        let conflicts = ConflictResolver::check(
            &[proposal(Some(parent), 0, "production")],
            &siblings,
            &catalog,
        );
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::Uniqueness);
    }

    #[test]
    fn inherited_shadow_is_exempt_from_uniqueness() {
        let catalog = free_text_catalog(1);
        let parent = Uuid::new_v4();
        let mut siblings = SiblingSnapshot::new();
        siblings.set_parent_value(parent, 0, "prod");
        // Another child already carries the parent's value.
        siblings.observe(Some(parent), 0, "prod", Uuid::new_v4());
        assert_eq!(siblings.claim_count(), 0);

        let conflicts =
            ConflictResolver::check(&[proposal(Some(parent), 0, "prod")], &siblings, &catalog);
        assert!(conflicts.is_empty());
    }

    #[test]
    fn roots_own_every_value() {
        let catalog = free_text_catalog(1);
        let mut siblings = SiblingSnapshot::new();
        siblings.observe(None, 0, "prod", Uuid::new_v4());

        let conflicts = ConflictResolver::check(&[proposal(None, 0, "prod")], &siblings, &catalog);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::Uniqueness);
    }

    #[test]
    fn own_current_value_does_not_conflict() {
        let catalog = free_text_catalog(1);
        let parent = Uuid::new_v4();
        let p = proposal(Some(parent), 0, "staging");
        let mut siblings = SiblingSnapshot::new();
        siblings.set_parent_value(parent, 0, "prod");
        siblings.observe(Some(parent), 0, "staging", p.string_id);

        let conflicts = ConflictResolver::check(&[p], &siblings, &catalog);
        assert!(conflicts.is_empty());
    }

    #[test]
    fn same_value_under_different_parents_is_fine() {
        let catalog = free_text_catalog(1);
        let parent_a = Uuid::new_v4();
        let parent_b = Uuid::new_v4();
        let mut siblings = SiblingSnapshot::new();
        siblings.observe(Some(parent_a), 0, "prod", Uuid::new_v4());

        let conflicts = ConflictResolver::check(
            &[proposal(Some(parent_b), 0, "prod")],
            &siblings,
            &catalog,
        );
        assert!(conflicts.is_empty());
    }

    #[test]
    fn value_swap_within_one_batch_is_clean() {
        let catalog = free_text_catalog(1);
        let parent = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut siblings = SiblingSnapshot::new();
        siblings.set_parent_value(parent, 0, "root");
        siblings.observe(Some(parent), 0, "x", a);
        siblings.observe(Some(parent), 0, "y", b);

        let proposals = vec![
            ProposedState::new(a, Some(parent), vec![StringDetail::new(a, 0, "y")], vec![0]),
            ProposedState::new(b, Some(parent), vec![StringDetail::new(b, 0, "x")], vec![0]),
        ];
        let conflicts = ConflictResolver::check(&proposals, &siblings, &catalog);
        assert!(conflicts.is_empty());
    }

    #[test]
    fn duplicate_claims_within_one_batch_conflict_after_the_first() {
        let catalog = free_text_catalog(1);
        let parent = Uuid::new_v4();
        let mut siblings = SiblingSnapshot::new();
        siblings.set_parent_value(parent, 0, "root");

        let first = proposal(Some(parent), 0, "prod");
        let second = proposal(Some(parent), 0, "prod");
        let second_id = second.string_id;

        let conflicts = ConflictResolver::check(&[first, second], &siblings, &catalog);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].string_id, second_id);
    }

    #[test]
    fn unknown_slot_is_a_constraint_conflict() {
        let catalog = free_text_catalog(1);
        let siblings = SiblingSnapshot::new();

        let conflicts = ConflictResolver::check(&[proposal(None, 7, "x")], &siblings, &catalog);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::Constraint);
    }
}
