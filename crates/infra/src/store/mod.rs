//! Tenant-isolated document storage.
//!
//! Records are JSON documents keyed by [`RecordId`] inside a tenant's
//! collection. The store knows nothing about events; publishing happens one
//! layer up in [`crate::repository`].

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use circstore_circulation::Collection;
use circstore_core::{RecordId, TenantId};

pub use in_memory::InMemoryDocumentStore;
pub use postgres::PostgresDocumentStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend unreachable or the operation failed in transit (retryable).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected the operation.
    #[error("store query failed: {0}")]
    Query(String),

    /// A stored or submitted document is not usable.
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// A conditional write found the document changed or gone since it was read.
    #[error("concurrent modification: {0}")]
    Conflict(String),
}

/// A document together with its key.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: RecordId,
    pub document: JsonValue,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(
        &self,
        tenant: &TenantId,
        collection: Collection,
        id: RecordId,
    ) -> Result<Option<StoredDocument>, StoreError>;

    /// Insert or replace a document. Returns the document it replaced.
    async fn upsert(
        &self,
        tenant: &TenantId,
        collection: Collection,
        id: RecordId,
        document: JsonValue,
    ) -> Result<Option<JsonValue>, StoreError>;

    /// Replace a document only if it still equals `expected`; otherwise
    /// [`StoreError::Conflict`]. Check and write are one atomic step.
    async fn replace_if_unchanged(
        &self,
        tenant: &TenantId,
        collection: Collection,
        id: RecordId,
        expected: &JsonValue,
        document: JsonValue,
    ) -> Result<(), StoreError>;

    /// Remove a document. Returns the removed document, if there was one.
    async fn delete(
        &self,
        tenant: &TenantId,
        collection: Collection,
        id: RecordId,
    ) -> Result<Option<JsonValue>, StoreError>;

    /// All documents whose top-level string `field` equals `value`.
    async fn find_by_field(
        &self,
        tenant: &TenantId,
        collection: Collection,
        field: &str,
        value: &str,
    ) -> Result<Vec<StoredDocument>, StoreError>;

    /// Remove every document of the collection. Returns how many were removed.
    async fn delete_all(&self, tenant: &TenantId, collection: Collection)
    -> Result<u64, StoreError>;
}

#[async_trait]
impl<S> DocumentStore for Arc<S>
where
    S: DocumentStore + ?Sized,
{
    async fn get(
        &self,
        tenant: &TenantId,
        collection: Collection,
        id: RecordId,
    ) -> Result<Option<StoredDocument>, StoreError> {
        (**self).get(tenant, collection, id).await
    }

    async fn upsert(
        &self,
        tenant: &TenantId,
        collection: Collection,
        id: RecordId,
        document: JsonValue,
    ) -> Result<Option<JsonValue>, StoreError> {
        (**self).upsert(tenant, collection, id, document).await
    }

    async fn replace_if_unchanged(
        &self,
        tenant: &TenantId,
        collection: Collection,
        id: RecordId,
        expected: &JsonValue,
        document: JsonValue,
    ) -> Result<(), StoreError> {
        (**self)
            .replace_if_unchanged(tenant, collection, id, expected, document)
            .await
    }

    async fn delete(
        &self,
        tenant: &TenantId,
        collection: Collection,
        id: RecordId,
    ) -> Result<Option<JsonValue>, StoreError> {
        (**self).delete(tenant, collection, id).await
    }

    async fn find_by_field(
        &self,
        tenant: &TenantId,
        collection: Collection,
        field: &str,
        value: &str,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        (**self).find_by_field(tenant, collection, field, value).await
    }

    async fn delete_all(
        &self,
        tenant: &TenantId,
        collection: Collection,
    ) -> Result<u64, StoreError> {
        (**self).delete_all(tenant, collection).await
    }
}

/// Record id of a document, read from its `id` field.
pub fn document_id(document: &JsonValue) -> Result<RecordId, StoreError> {
    let raw = document
        .get("id")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| StoreError::InvalidDocument("document has no string \"id\"".to_string()))?;
    raw.parse()
        .map_err(|e: circstore_core::DomainError| StoreError::InvalidDocument(e.to_string()))
}
