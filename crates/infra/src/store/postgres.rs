//! Postgres-backed document store.
//!
//! Each tenant owns a schema named `{tenant}_mod_circulation_storage` with one
//! table per collection:
//!
//! ```sql
//! CREATE TABLE {schema}.{table} (
//!     id          uuid PRIMARY KEY,
//!     jsonb       jsonb NOT NULL,
//!     updated_at  timestamptz NOT NULL
//! );
//! ```
//!
//! Schemas and tables are created by the migration tooling, not here. Tenant ids
//! are word tokens, so they are safe to splice into identifiers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{Span, instrument};
use uuid::Uuid;

use circstore_circulation::Collection;
use circstore_core::{RecordId, TenantId};

use super::{DocumentStore, StoreError, StoredDocument};

const SCHEMA_SUFFIX: &str = "mod_circulation_storage";

/// Postgres JSONB document store.
///
/// Uses an SQLx connection pool, shared across clones of the handle.
#[derive(Clone)]
pub struct PostgresDocumentStore {
    pool: Arc<PgPool>,
}

impl PostgresDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Fully qualified table of a tenant's collection.
    pub fn table_name(tenant: &TenantId, collection: Collection) -> String {
        format!("{tenant}_{SCHEMA_SUFFIX}.{}", collection.table())
    }
}

#[async_trait]
impl DocumentStore for PostgresDocumentStore {
    #[instrument(skip(self), fields(operation = tracing::field::Empty, tenant = %tenant, collection = %collection, record_id = %id), err)]
    async fn get(
        &self,
        tenant: &TenantId,
        collection: Collection,
        id: RecordId,
    ) -> Result<Option<StoredDocument>, StoreError> {
        Span::current().record("operation", "get");

        let sql = format!(
            "SELECT id, jsonb FROM {} WHERE id = $1",
            Self::table_name(tenant, collection)
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(row_to_document).transpose()
    }

    #[instrument(skip(self, document), fields(operation = tracing::field::Empty, tenant = %tenant, collection = %collection, record_id = %id), err)]
    async fn upsert(
        &self,
        tenant: &TenantId,
        collection: Collection,
        id: RecordId,
        document: JsonValue,
    ) -> Result<Option<JsonValue>, StoreError> {
        Span::current().record("operation", "upsert");

        if !document.is_object() {
            return Err(StoreError::InvalidDocument(format!("{id} is not a JSON object")));
        }

        let table = Self::table_name(tenant, collection);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_upsert", e))?;

        let previous: Option<JsonValue> =
            sqlx::query(&format!("SELECT jsonb FROM {table} WHERE id = $1 FOR UPDATE"))
                .bind(id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("lock_previous", e))?
                .map(|row| row.try_get("jsonb"))
                .transpose()
                .map_err(|e| map_sqlx_error("decode_previous", e))?;

        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (id, jsonb, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
            SET jsonb = EXCLUDED.jsonb, updated_at = EXCLUDED.updated_at
            "#
        ))
        .bind(id.as_uuid())
        .bind(&document)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("upsert", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_upsert", e))?;

        Ok(previous)
    }

    /// One `UPDATE ... WHERE jsonb = $expected`; zero affected rows is a conflict.
    #[instrument(skip(self, expected, document), fields(operation = tracing::field::Empty, tenant = %tenant, collection = %collection, record_id = %id), err)]
    async fn replace_if_unchanged(
        &self,
        tenant: &TenantId,
        collection: Collection,
        id: RecordId,
        expected: &JsonValue,
        document: JsonValue,
    ) -> Result<(), StoreError> {
        Span::current().record("operation", "replace_if_unchanged");

        if !document.is_object() {
            return Err(StoreError::InvalidDocument(format!("{id} is not a JSON object")));
        }

        let sql = format!(
            "UPDATE {} SET jsonb = $3, updated_at = $4 WHERE id = $1 AND jsonb = $2",
            Self::table_name(tenant, collection)
        );
        let result = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(expected)
            .bind(&document)
            .bind(Utc::now())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("replace_if_unchanged", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "{id} changed or was removed since it was read"
            )));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(operation = tracing::field::Empty, tenant = %tenant, collection = %collection, record_id = %id), err)]
    async fn delete(
        &self,
        tenant: &TenantId,
        collection: Collection,
        id: RecordId,
    ) -> Result<Option<JsonValue>, StoreError> {
        Span::current().record("operation", "delete");

        let sql = format!(
            "DELETE FROM {} WHERE id = $1 RETURNING jsonb",
            Self::table_name(tenant, collection)
        );
        sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?
            .map(|row| row.try_get("jsonb"))
            .transpose()
            .map_err(|e| map_sqlx_error("decode_deleted", e))
    }

    #[instrument(skip(self), fields(operation = tracing::field::Empty, tenant = %tenant, collection = %collection), err)]
    async fn find_by_field(
        &self,
        tenant: &TenantId,
        collection: Collection,
        field: &str,
        value: &str,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        Span::current().record("operation", "find_by_field");

        let sql = format!(
            "SELECT id, jsonb FROM {} WHERE jsonb->>$1 = $2 ORDER BY id",
            Self::table_name(tenant, collection)
        );
        let rows = sqlx::query(&sql)
            .bind(field)
            .bind(value)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_field", e))?;

        rows.iter().map(row_to_document).collect()
    }

    #[instrument(skip(self), fields(operation = tracing::field::Empty, tenant = %tenant, collection = %collection), err)]
    async fn delete_all(
        &self,
        tenant: &TenantId,
        collection: Collection,
    ) -> Result<u64, StoreError> {
        Span::current().record("operation", "delete_all");

        let sql = format!("DELETE FROM {}", Self::table_name(tenant, collection));
        let result = sqlx::query(&sql)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_all", e))?;

        Ok(result.rows_affected())
    }
}

fn row_to_document(row: &PgRow) -> Result<StoredDocument, StoreError> {
    let id: Uuid = row
        .try_get("id")
        .map_err(|e| map_sqlx_error("decode_id", e))?;
    let document: JsonValue = row
        .try_get("jsonb")
        .map_err(|e| map_sqlx_error("decode_jsonb", e))?;

    Ok(StoredDocument {
        id: RecordId::from_uuid(id),
        document,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::Query(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            StoreError::Unavailable(format!("connection failure in {}: {}", operation, err))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::InvalidDocument(format!("undecodable row in {}: {}", operation, err))
        }
        _ => StoreError::Query(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_live_in_the_tenant_schema() {
        let tenant = TenantId::parse("diku").unwrap();
        assert_eq!(
            PostgresDocumentStore::table_name(&tenant, Collection::CheckIn),
            "diku_mod_circulation_storage.check_in"
        );
    }
}
