//! Denormalized search-index projection stored on request records.
//!
//! A request carries a `searchIndex` object with copies of upstream fields
//! (item call number, shelving order, pickup service point name) so it can be
//! searched and sorted without joins. Each upstream part is rebuilt wholesale
//! from the latest snapshot: a field missing upstream is removed from the
//! projection, never defaulted and never left stale.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use circstore_core::{DomainError, DomainResult};

use crate::item::ShelvingLocation;

/// Field holding the projection on a request document.
pub const SEARCH_INDEX_FIELD: &str = "searchIndex";

/// Foreign key from a request to its item.
pub const ITEM_ID_FIELD: &str = "itemId";

/// Foreign key from a request to its pickup service point.
pub const PICKUP_SERVICE_POINT_ID_FIELD: &str = "pickupServicePointId";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallNumberComponents {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_number: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
}

impl CallNumberComponents {
    pub fn is_empty(&self) -> bool {
        self.prefix.is_none() && self.call_number.is_none() && self.suffix.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchIndex {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_number_components: Option<CallNumberComponents>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shelving_order: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pickup_service_point_name: Option<String>,

    /// Fields this module does not own; carried through untouched.
    #[serde(flatten)]
    pub other: Map<String, JsonValue>,
}

impl SearchIndex {
    /// Read the projection of a request document (absent projection = empty).
    pub fn of_record(record: &JsonValue) -> DomainResult<Self> {
        match record.get(SEARCH_INDEX_FIELD) {
            None | Some(JsonValue::Null) => Ok(Self::default()),
            Some(value) => Self::deserialize(value)
                .map_err(|e| DomainError::malformed(format!("{SEARCH_INDEX_FIELD}: {e}"))),
        }
    }

    /// Store the projection on a request document, replacing the previous one.
    pub fn write_to(&self, record: &mut JsonValue) -> DomainResult<()> {
        let value = serde_json::to_value(self)
            .map_err(|e| DomainError::malformed(format!("{SEARCH_INDEX_FIELD}: {e}")))?;
        let object = record
            .as_object_mut()
            .ok_or_else(|| DomainError::malformed("record is not a JSON object"))?;
        object.insert(SEARCH_INDEX_FIELD.to_string(), value);
        Ok(())
    }

    /// Replace the item-derived part wholesale. Other fields are untouched.
    pub fn with_shelving_location(&self, location: &ShelvingLocation) -> Self {
        Self {
            call_number_components: location.call_number_components.clone(),
            shelving_order: location.shelving_order.clone(),
            ..self.clone()
        }
    }

    /// Replace the service-point-derived part. Other fields are untouched.
    pub fn with_pickup_service_point_name(&self, name: Option<&str>) -> Self {
        Self {
            pickup_service_point_name: name.map(str::to_string),
            ..self.clone()
        }
    }
}
