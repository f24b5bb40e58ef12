use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::string::StringDetail;
use crate::types::{DimensionId, RuleId, SlotIndex, WorkspaceId};

/// Default formatting a slot contributes to generated names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotFormat {
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    pub delimiter: Option<String>,
}

/// One position in a rule's template, bound to a dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSlot {
    pub index: SlotIndex,
    pub dimension_id: DimensionId,
    pub format: SlotFormat,
}

impl RuleSlot {
    pub fn new(index: SlotIndex, dimension_id: DimensionId) -> Self {
        Self {
            index,
            dimension_id,
            format: SlotFormat::default(),
        }
    }

    pub fn with_format(mut self, format: SlotFormat) -> Self {
        self.format = format;
        self
    }
}

/// An ordered template of taxonomy slots for one platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub workspace_id: WorkspaceId,
    pub platform: String,
    pub slots: Vec<RuleSlot>,
}

impl Rule {
    pub fn new(workspace_id: WorkspaceId, platform: impl Into<String>, slots: Vec<RuleSlot>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            platform: platform.into(),
            slots,
        }
    }

    pub fn slot(&self, index: SlotIndex) -> Option<&RuleSlot> {
        self.slots.iter().find(|s| s.index == index)
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Render the full name for a string's details.
    ///
    /// Each slot contributes `prefix + value + suffix`; a slot's delimiter
    /// trails its segment and joins it to the next one. Detail-level
    /// formatting wins over the slot default; absent both, the field is
    /// empty. Slots without a detail are skipped.
    pub fn compose(&self, details: &[StringDetail]) -> String {
        let mut segments: Vec<(String, String)> = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let Some(detail) = details.iter().find(|d| d.slot == slot.index) else {
                continue;
            };
            let prefix = effective(&detail.prefix, &slot.format.prefix);
            let suffix = effective(&detail.suffix, &slot.format.suffix);
            let delimiter = effective(&detail.delimiter, &slot.format.delimiter);
            let segment = format!("{}{}{}", prefix, detail.value, suffix);
            segments.push((segment, delimiter.to_string()));
        }

        let mut out = String::new();
        let last = segments.len().saturating_sub(1);
        for (i, (segment, delimiter)) in segments.iter().enumerate() {
            out.push_str(segment);
            if i < last {
                out.push_str(delimiter);
            }
        }
        out
    }
}

fn effective<'a>(detail_field: &'a Option<String>, slot_default: &'a Option<String>) -> &'a str {
    detail_field
        .as_deref()
        .or(slot_default.as_deref())
        .unwrap_or("")
}
