use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use tracing::info;

use crate::config::is_valid_identifier;
use crate::store::{DocumentStore, ProcessedEventDocument, StoreError};

// SQLSTATE codes that mean another writer raced us on the same key
const UNIQUE_VIOLATION: &str = "23505";
const SERIALIZATION_FAILURE: &str = "40001";

/// Documents live in one table per collection, keyed by document id.
pub struct PostgresDocumentStore {
    pool: PgPool,
    collection: String,
    upsert_query: String,
}

impl PostgresDocumentStore {
    pub fn new(pool: PgPool, collection: &str) -> Result<Self, StoreError> {
        if !is_valid_identifier(collection) {
            return Err(StoreError::InvalidCollection(collection.to_string()));
        }

        let upsert_query = format!(
            r#"
            INSERT INTO {collection} (id, event_type, event_data, processed_at, processing_service)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
                SET event_type = EXCLUDED.event_type,
                    event_data = EXCLUDED.event_data,
                    processed_at = EXCLUDED.processed_at,
                    processing_service = EXCLUDED.processing_service"#
        );

        Ok(Self {
            pool,
            collection: collection.to_string(),
            upsert_query,
        })
    }

    /// Connects and makes sure the collection exists. Any failure here is a startup failure.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        collection: &str,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .test_before_acquire(true)
            .connect(url)
            .await?;

        let store = Self::new(pool, collection)?;
        store.ensure_collection().await?;
        info!(collection, "Document store initialized");
        Ok(store)
    }

    pub async fn ensure_collection(&self) -> Result<(), StoreError> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                event_data JSONB NOT NULL,
                processed_at TIMESTAMPTZ NOT NULL,
                processing_service TEXT NOT NULL
            )"#,
            self.collection
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }
}

fn is_write_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => matches!(
            db_err.code().as_deref(),
            Some(UNIQUE_VIOLATION) | Some(SERIALIZATION_FAILURE)
        ),
        _ => false,
    }
}

#[async_trait]
impl DocumentStore for PostgresDocumentStore {
    async fn upsert(&self, document: &ProcessedEventDocument) -> Result<(), StoreError> {
        let result = sqlx::query(&self.upsert_query)
            .bind(&document.id)
            .bind(&document.event_type)
            .bind(Json(&document.event_data))
            .bind(document.processed_at)
            .bind(&document.processing_service)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_write_conflict(&e) => Err(StoreError::Conflict(document.id.clone())),
            Err(e) => Err(e.into()),
        }
    }
}
