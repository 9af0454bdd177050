use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use circstore_circulation::Collection;
use circstore_core::{RecordId, TenantId};

use super::{DocumentStore, StoreError, StoredDocument};

type Table = BTreeMap<RecordId, JsonValue>;

/// In-memory tenant-isolated document store for tests/dev.
///
/// Writes to selected ids can be made to fail, to exercise per-record error
/// handling in callers.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    inner: RwLock<HashMap<(TenantId, Collection), Table>>,
    failing_ids: RwLock<HashSet<RecordId>>,
    writes: AtomicUsize,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every future upsert/delete of `id` fail with `Unavailable`.
    pub fn fail_writes_for(&self, id: RecordId) {
        if let Ok(mut ids) = self.failing_ids.write() {
            ids.insert(id);
        }
    }

    /// Number of successful upserts and deletes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Acquire)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<(TenantId, Collection), Table>>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<(TenantId, Collection), Table>>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_string()))
    }

    fn check_writable(&self, id: RecordId) -> Result<(), StoreError> {
        let failing = self
            .failing_ids
            .read()
            .map(|ids| ids.contains(&id))
            .unwrap_or(false);
        if failing {
            return Err(StoreError::Unavailable(format!("write to {id} failed")));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(
        &self,
        tenant: &TenantId,
        collection: Collection,
        id: RecordId,
    ) -> Result<Option<StoredDocument>, StoreError> {
        let map = self.read()?;
        Ok(map
            .get(&(tenant.clone(), collection))
            .and_then(|table| table.get(&id))
            .map(|document| StoredDocument {
                id,
                document: document.clone(),
            }))
    }

    async fn upsert(
        &self,
        tenant: &TenantId,
        collection: Collection,
        id: RecordId,
        document: JsonValue,
    ) -> Result<Option<JsonValue>, StoreError> {
        if !document.is_object() {
            return Err(StoreError::InvalidDocument(format!("{id} is not a JSON object")));
        }
        self.check_writable(id)?;

        let previous = self
            .write()?
            .entry((tenant.clone(), collection))
            .or_default()
            .insert(id, document);
        self.writes.fetch_add(1, Ordering::AcqRel);
        Ok(previous)
    }

    async fn replace_if_unchanged(
        &self,
        tenant: &TenantId,
        collection: Collection,
        id: RecordId,
        expected: &JsonValue,
        document: JsonValue,
    ) -> Result<(), StoreError> {
        if !document.is_object() {
            return Err(StoreError::InvalidDocument(format!("{id} is not a JSON object")));
        }
        self.check_writable(id)?;

        let mut map = self.write()?;
        let current = map
            .get_mut(&(tenant.clone(), collection))
            .and_then(|table| table.get_mut(&id));
        match current {
            Some(current) if *current == *expected => {
                *current = document;
                self.writes.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            Some(_) => Err(StoreError::Conflict(format!("{id} changed since it was read"))),
            None => Err(StoreError::Conflict(format!("{id} no longer exists"))),
        }
    }

    async fn delete(
        &self,
        tenant: &TenantId,
        collection: Collection,
        id: RecordId,
    ) -> Result<Option<JsonValue>, StoreError> {
        self.check_writable(id)?;

        let removed = self
            .write()?
            .get_mut(&(tenant.clone(), collection))
            .and_then(|table| table.remove(&id));
        if removed.is_some() {
            self.writes.fetch_add(1, Ordering::AcqRel);
        }
        Ok(removed)
    }

    async fn find_by_field(
        &self,
        tenant: &TenantId,
        collection: Collection,
        field: &str,
        value: &str,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        let map = self.read()?;
        let Some(table) = map.get(&(tenant.clone(), collection)) else {
            return Ok(Vec::new());
        };

        Ok(table
            .iter()
            .filter(|(_, doc)| doc.get(field).and_then(JsonValue::as_str) == Some(value))
            .map(|(id, doc)| StoredDocument {
                id: *id,
                document: doc.clone(),
            })
            .collect())
    }

    async fn delete_all(
        &self,
        tenant: &TenantId,
        collection: Collection,
    ) -> Result<u64, StoreError> {
        let removed = self
            .write()?
            .remove(&(tenant.clone(), collection))
            .map(|table| table.len() as u64)
            .unwrap_or(0);
        Ok(removed)
    }
}
