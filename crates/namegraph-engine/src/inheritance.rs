use std::collections::HashMap;

use namegraph_core::{InheritanceStatus, Rule, SlotIndex, StringDetail};

/// The one place inheritance equality lives. Every component that
/// needs to know whether a detail follows its parent calls through
/// here; the predicate is never duplicated.
pub struct InheritanceMatrix;

impl InheritanceMatrix {
    /// Canonical equality: same value and same formatting triple,
    /// with `None` and `""` treated as the same formatting.
    pub fn details_match(parent: &StringDetail, child: &StringDetail) -> bool {
        parent.value == child.value
            && text_eq(&parent.prefix, &child.prefix)
            && text_eq(&parent.suffix, &child.suffix)
            && text_eq(&parent.delimiter, &child.delimiter)
    }

    /// A detail with no corresponding parent detail is its own source
    /// and classifies as overridden.
    pub fn classify(parent: Option<&StringDetail>, child: &StringDetail) -> InheritanceStatus {
        match parent {
            Some(parent) if Self::details_match(parent, child) => InheritanceStatus::Inherited,
            _ => InheritanceStatus::Overridden,
        }
    }

    /// Classify every slot of a string against its direct parent.
    /// One level only; deep chains are repeated single-level
    /// classification, never re-derived from distant ancestors.
    pub fn build_chain(
        rule: &Rule,
        parent_details: Option<&[StringDetail]>,
        child_details: &[StringDetail],
    ) -> HashMap<SlotIndex, InheritanceStatus> {
        let mut chain = HashMap::with_capacity(child_details.len());
        for slot in &rule.slots {
            let Some(child) = child_details.iter().find(|d| d.slot == slot.index) else {
                continue;
            };
            let parent = parent_details
                .and_then(|details| details.iter().find(|d| d.slot == slot.index));
            chain.insert(slot.index, Self::classify(parent, child));
        }
        chain
    }
}

fn text_eq(a: &Option<String>, b: &Option<String>) -> bool {
    a.as_deref().unwrap_or("") == b.as_deref().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use namegraph_core::{RuleSlot, StringDetail};
    use uuid::Uuid;

    fn detail(slot: SlotIndex, value: &str) -> StringDetail {
        StringDetail::new(Uuid::new_v4(), slot, value)
    }

    #[test]
    fn null_and_empty_formatting_are_equivalent() {
        let parent = detail(0, "prod").with_formatting(Some("".into()), None, Some("".into()));
        let child = detail(0, "prod");
        assert!(InheritanceMatrix::details_match(&parent, &child));
        assert_eq!(
            InheritanceMatrix::classify(Some(&parent), &child),
            InheritanceStatus::Inherited
        );
    }

    #[test]
    fn value_divergence_is_an_override() {
        let parent = detail(0, "prod");
        let child = detail(0, "production");
        assert_eq!(
            InheritanceMatrix::classify(Some(&parent), &child),
            InheritanceStatus::Overridden
        );
    }

    #[test]
    fn formatting_divergence_is_an_override() {
        let parent = detail(0, "prod");
        let child = detail(0, "prod").with_formatting(Some("p_".into()), None, None);
        assert_eq!(
            InheritanceMatrix::classify(Some(&parent), &child),
            InheritanceStatus::Overridden
        );
    }

    #[test]
    fn missing_parent_detail_is_an_override() {
        let child = detail(2, "checkout");
        assert_eq!(
            InheritanceMatrix::classify(None, &child),
            InheritanceStatus::Overridden
        );
    }

    #[test]
    fn chain_classifies_each_slot_independently() {
        let rule = Rule::new(
            Uuid::new_v4(),
            "aws",
            vec![RuleSlot::new(0, Uuid::new_v4()), RuleSlot::new(1, Uuid::new_v4())],
        );
        let parent = vec![detail(0, "prod"), detail(1, "us-east")];
        let child = vec![detail(0, "prod"), detail(1, "us-west")];

        let chain = InheritanceMatrix::build_chain(&rule, Some(&parent), &child);
        assert_eq!(chain[&0], InheritanceStatus::Inherited);
        assert_eq!(chain[&1], InheritanceStatus::Overridden);
    }

    #[test]
    fn root_chain_is_all_overridden() {
        let rule = Rule::new(Uuid::new_v4(), "aws", vec![RuleSlot::new(0, Uuid::new_v4())]);
        let child = vec![detail(0, "prod")];
        let chain = InheritanceMatrix::build_chain(&rule, None, &child);
        assert_eq!(chain[&0], InheritanceStatus::Overridden);
    }
}
