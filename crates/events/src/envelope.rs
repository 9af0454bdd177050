use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use circstore_core::TenantId;

/// Kind of change carried by an envelope.
///
/// Upstream inventory modules emit the short forms (`UPDATE`, `DELETE`, ...);
/// both spellings are accepted on the way in, the long form is written.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "CREATED", alias = "CREATE")]
    Created,
    #[serde(rename = "UPDATED", alias = "UPDATE")]
    Updated,
    #[serde(rename = "DELETED", alias = "DELETE")]
    Deleted,
    #[serde(rename = "DELETED_ALL", alias = "DELETE_ALL")]
    DeletedAll,
}

impl EventType {
    /// Derive the event type from which snapshots are present.
    pub fn from_presence(has_old: bool, has_new: bool) -> Self {
        match (has_old, has_new) {
            (false, true) => EventType::Created,
            (true, true) => EventType::Updated,
            (true, false) => EventType::Deleted,
            (false, false) => EventType::DeletedAll,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "CREATED",
            EventType::Updated => "UPDATED",
            EventType::Deleted => "DELETED",
            EventType::DeletedAll => "DELETED_ALL",
        }
    }
}

impl core::fmt::Display for EventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("failed to serialize envelope: {0}")]
    Serialize(String),

    #[error("failed to deserialize envelope: {0}")]
    Deserialize(String),

    #[error("envelope is missing its {0:?} snapshot")]
    MissingSnapshot(&'static str),

    #[error("{event_type} envelope must not carry an {field:?} snapshot")]
    UnexpectedSnapshot {
        event_type: EventType,
        field: &'static str,
    },
}

/// Change event for one entity: the before/after pair plus the owning tenant.
///
/// Wire format: `{"tenant": .., "type": .., "old": object|null, "new": object|null}`.
/// Correlation headers travel as transport headers, never in the body.
///
/// Invariants (checked on construction and on decode):
/// - `CREATED` has no `old`
/// - `DELETED` has no `new`
/// - `DELETED_ALL` has neither
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    tenant: TenantId,

    #[serde(rename = "type")]
    event_type: EventType,

    #[serde(default)]
    old: Option<JsonValue>,

    #[serde(default)]
    new: Option<JsonValue>,
}

impl EventEnvelope {
    /// Build an envelope; the event type follows from which snapshots are present.
    pub fn new(tenant: TenantId, old: Option<JsonValue>, new: Option<JsonValue>) -> Self {
        let event_type = EventType::from_presence(old.is_some(), new.is_some());
        Self {
            tenant,
            event_type,
            old,
            new,
        }
    }

    /// Build an envelope from typed snapshots.
    pub fn from_snapshots<T: Serialize>(
        tenant: TenantId,
        old: Option<&T>,
        new: Option<&T>,
    ) -> Result<Self, EnvelopeError> {
        let to_value = |v: &T| {
            serde_json::to_value(v).map_err(|e| EnvelopeError::Serialize(e.to_string()))
        };
        let old = old.map(to_value).transpose()?;
        let new = new.map(to_value).transpose()?;
        Ok(Self::new(tenant, old, new))
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn old(&self) -> Option<&JsonValue> {
        self.old.as_ref()
    }

    pub fn new_value(&self) -> Option<&JsonValue> {
        self.new.as_ref()
    }

    /// Decode the `old` snapshot into a typed record.
    pub fn decode_old<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        decode_snapshot(self.old.as_ref(), "old")
    }

    /// Decode the `new` snapshot into a typed record.
    pub fn decode_new<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        decode_snapshot(self.new.as_ref(), "new")
    }

    /// Canonical JSON text of the envelope body.
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|e| EnvelopeError::Serialize(e.to_string()))
    }

    /// Parse and validate an envelope body.
    pub fn from_json(payload: &str) -> Result<Self, EnvelopeError> {
        let envelope: EventEnvelope = serde_json::from_str(payload)
            .map_err(|e| EnvelopeError::Deserialize(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        let unexpected = |field| EnvelopeError::UnexpectedSnapshot {
            event_type: self.event_type,
            field,
        };
        match self.event_type {
            EventType::Created if self.old.is_some() => Err(unexpected("old")),
            EventType::Deleted if self.new.is_some() => Err(unexpected("new")),
            EventType::DeletedAll if self.old.is_some() => Err(unexpected("old")),
            EventType::DeletedAll if self.new.is_some() => Err(unexpected("new")),
            _ => Ok(()),
        }
    }
}

fn decode_snapshot<T: DeserializeOwned>(
    value: Option<&JsonValue>,
    field: &'static str,
) -> Result<T, EnvelopeError> {
    let value = value.ok_or(EnvelopeError::MissingSnapshot(field))?;
    T::deserialize(value).map_err(|e| EnvelopeError::Deserialize(format!("{field}: {e}")))
}
