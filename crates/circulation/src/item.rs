use serde::{Deserialize, Serialize};

use crate::search_index::CallNumberComponents;

/// The subset of an inventory item snapshot the search index is built from.
///
/// Other item fields are ignored on decode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSnapshot {
    pub id: String,

    #[serde(default)]
    pub effective_call_number_components: Option<CallNumberComponents>,

    #[serde(default)]
    pub effective_shelving_order: Option<String>,
}

/// Where an item sits on the shelf: every item field feeding the projection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShelvingLocation {
    pub call_number_components: Option<CallNumberComponents>,
    pub shelving_order: Option<String>,
}

impl ItemSnapshot {
    /// Normalized shelving fields; a components object with no fields counts as absent.
    pub fn shelving_location(&self) -> ShelvingLocation {
        ShelvingLocation {
            call_number_components: self
                .effective_call_number_components
                .clone()
                .filter(|c| !c.is_empty()),
            shelving_order: self.effective_shelving_order.clone(),
        }
    }
}

/// True when the update touches any field the projection is built from.
pub fn shelving_changed(old: &ItemSnapshot, new: &ItemSnapshot) -> bool {
    old.shelving_location() != new.shelving_location()
}
