//! Storage mutations that publish their own change events.
//!
//! Every write follows the same pipeline:
//!
//! ```text
//! mutation
//!   ↓
//! 1. Apply to the document store (tenant-scoped)
//!   ↓
//! 2. Publish the matching event on the collection's topic, keyed by record id
//! ```
//!
//! The event is only published once the write has committed. If publishing then
//! fails the write stays, and the caller sees [`RepositoryError::Publish`].

use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::instrument;

use circstore_circulation::Collection;
use circstore_core::{RecordId, TenantId};
use circstore_events::{DeliveryReceipt, ForwardedHeaders};

use crate::publisher::{EventPublisher, PublishError};
use crate::store::{DocumentStore, StoreError, StoredDocument, document_id};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("{collection} record {id} not found")]
    NotFound { collection: Collection, id: RecordId },

    #[error("{collection} record {id} already exists")]
    AlreadyExists { collection: Collection, id: RecordId },

    /// The record changed (or was removed) between read and write.
    #[error("{collection} record {id} was modified concurrently")]
    Conflict { collection: Collection, id: RecordId },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The write committed but its event was not acknowledged (at-least-once;
    /// retrying may duplicate the event).
    #[error("record stored but event not published: {0}")]
    Publish(#[from] PublishError),
}

/// Document store + event publisher for the module's own collections.
#[derive(Clone)]
pub struct RecordRepository {
    store: Arc<dyn DocumentStore>,
    publisher: EventPublisher,
}

impl RecordRepository {
    pub fn new(store: Arc<dyn DocumentStore>, publisher: EventPublisher) -> Self {
        Self { store, publisher }
    }

    pub async fn get(
        &self,
        tenant: &TenantId,
        collection: Collection,
        id: RecordId,
    ) -> Result<Option<StoredDocument>, RepositoryError> {
        Ok(self.store.get(tenant, collection, id).await?)
    }

    pub async fn find_by_field(
        &self,
        tenant: &TenantId,
        collection: Collection,
        field: &str,
        value: &str,
    ) -> Result<Vec<StoredDocument>, RepositoryError> {
        Ok(self
            .store
            .find_by_field(tenant, collection, field, value)
            .await?)
    }

    /// Store a new record and publish `CREATED`. A missing `id` is assigned.
    #[instrument(skip(self, document, caller), fields(tenant = %tenant, collection = %collection), err)]
    pub async fn create(
        &self,
        tenant: &TenantId,
        collection: Collection,
        mut document: JsonValue,
        caller: &ForwardedHeaders,
    ) -> Result<(StoredDocument, DeliveryReceipt), RepositoryError> {
        let id = match document.get("id") {
            Some(_) => document_id(&document)?,
            None => {
                let id = RecordId::new();
                set_id(&mut document, id)?;
                id
            }
        };

        if self.store.get(tenant, collection, id).await?.is_some() {
            return Err(RepositoryError::AlreadyExists { collection, id });
        }
        self.store
            .upsert(tenant, collection, id, document.clone())
            .await?;

        let receipt = self
            .publisher
            .publish_created(collection.topic(), tenant, &id.to_string(), &document, caller)
            .await?;

        Ok((StoredDocument { id, document }, receipt))
    }

    /// Replace an existing record and publish `UPDATED` with both snapshots.
    #[instrument(skip(self, document, caller), fields(tenant = %tenant, collection = %collection, record_id = %id), err)]
    pub async fn update(
        &self,
        tenant: &TenantId,
        collection: Collection,
        id: RecordId,
        mut document: JsonValue,
        caller: &ForwardedHeaders,
    ) -> Result<DeliveryReceipt, RepositoryError> {
        set_id(&mut document, id)?;

        let before = self
            .store
            .get(tenant, collection, id)
            .await?
            .ok_or(RepositoryError::NotFound { collection, id })?;
        let before = self
            .store
            .upsert(tenant, collection, id, document.clone())
            .await?
            .unwrap_or(before.document);

        Ok(self
            .publisher
            .publish_updated(collection.topic(), tenant, &id.to_string(), &before, &document, caller)
            .await?)
    }

    /// Replace a record only if it still equals `expected`, the snapshot the
    /// caller read, and publish `UPDATED` with both snapshots.
    ///
    /// A record changed or removed in the meantime yields
    /// [`RepositoryError::Conflict`]; nothing is written or published then.
    #[instrument(skip(self, expected, document, caller), fields(tenant = %tenant, collection = %collection, record_id = %id), err)]
    pub async fn update_if_unchanged(
        &self,
        tenant: &TenantId,
        collection: Collection,
        id: RecordId,
        expected: &JsonValue,
        mut document: JsonValue,
        caller: &ForwardedHeaders,
    ) -> Result<DeliveryReceipt, RepositoryError> {
        set_id(&mut document, id)?;

        match self
            .store
            .replace_if_unchanged(tenant, collection, id, expected, document.clone())
            .await
        {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                return Err(RepositoryError::Conflict { collection, id });
            }
            Err(e) => return Err(e.into()),
        }

        Ok(self
            .publisher
            .publish_updated(collection.topic(), tenant, &id.to_string(), expected, &document, caller)
            .await?)
    }

    /// Remove a record and publish `DELETED`. Returns `None` when there was
    /// nothing to remove (no event is published then).
    #[instrument(skip(self, caller), fields(tenant = %tenant, collection = %collection, record_id = %id), err)]
    pub async fn delete(
        &self,
        tenant: &TenantId,
        collection: Collection,
        id: RecordId,
        caller: &ForwardedHeaders,
    ) -> Result<Option<DeliveryReceipt>, RepositoryError> {
        let Some(removed) = self.store.delete(tenant, collection, id).await? else {
            return Ok(None);
        };

        let receipt = self
            .publisher
            .publish_removed(collection.topic(), tenant, &id.to_string(), &removed, caller)
            .await?;
        Ok(Some(receipt))
    }

    /// Clear the collection and publish `DELETED_ALL`.
    #[instrument(skip(self, caller), fields(tenant = %tenant, collection = %collection), err)]
    pub async fn delete_all(
        &self,
        tenant: &TenantId,
        collection: Collection,
        caller: &ForwardedHeaders,
    ) -> Result<(u64, DeliveryReceipt), RepositoryError> {
        let removed = self.store.delete_all(tenant, collection).await?;
        let receipt = self
            .publisher
            .publish_all_removed(collection.topic(), tenant, caller)
            .await?;
        Ok((removed, receipt))
    }
}

fn set_id(document: &mut JsonValue, id: RecordId) -> Result<(), StoreError> {
    let object = document
        .as_object_mut()
        .ok_or_else(|| StoreError::InvalidDocument("record is not a JSON object".to_string()))?;
    object.insert("id".to_string(), JsonValue::String(id.to_string()));
    Ok(())
}
