//! Build history stores.

use async_trait::async_trait;
use pullr_core::{BuildRecord, BuildStore, Error, Result};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// PostgreSQL build store.
///
/// Writes to the image and build history tables owned by the web service:
/// the image row's `last_build` is replaced on every transition and a history
/// row is added once the build is finished.
pub struct PgBuildStore {
    pool: PgPool,
}

impl PgBuildStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(url)
            .await
            .map_err(store_error)?;
        Ok(Self::new(pool))
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn store_error(e: sqlx::Error) -> Error {
    Error::Internal(format!("build store: {}", e))
}

#[async_trait]
impl BuildStore for PgBuildStore {
    async fn update_build_record(
        &self,
        owner: &str,
        key: &str,
        record: &BuildRecord,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        let updated = sqlx::query(
            r#"
            UPDATE images SET last_build = $3, updated_at = NOW()
            WHERE owner = $1 AND key = $2
            "#,
        )
        .bind(owner)
        .bind(key)
        .bind(Json(record))
        .execute(&mut *tx)
        .await
        .map_err(store_error)?
        .rows_affected();

        if updated == 0 {
            return Err(Error::NotFound(format!("image {} of {}", key, owner)));
        }

        if record.status.is_terminal() {
            sqlx::query(
                r#"
                INSERT INTO build_history
                    (id, owner, image_key, status, started_at, finished_at, logs)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(uuid::Uuid::now_v7())
            .bind(owner)
            .bind(key)
            .bind(record.status.to_string())
            .bind(record.started_at)
            .bind(record.finished_at)
            .bind(&record.logs)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        }

        tx.commit().await.map_err(store_error)?;
        debug!(owner = %owner, key = %key, status = %record.status, "Recorded build");
        Ok(())
    }
}

/// In-process build store keyed by `(owner, key)`.
#[derive(Debug, Default)]
pub struct MemoryBuildStore {
    images: Mutex<HashMap<(String, String), Vec<BuildRecord>>>,
}

impl MemoryBuildStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make image `key` of `owner` known.
    pub fn add_image(&self, owner: &str, key: &str) {
        self.images
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry((owner.to_string(), key.to_string()))
            .or_default();
    }

    pub fn remove_image(&self, owner: &str, key: &str) {
        self.images
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(owner.to_string(), key.to_string()));
    }

    /// Every record written for the image, oldest first.
    pub fn records(&self, owner: &str, key: &str) -> Vec<BuildRecord> {
        self.images
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(owner.to_string(), key.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl BuildStore for MemoryBuildStore {
    async fn update_build_record(
        &self,
        owner: &str,
        key: &str,
        record: &BuildRecord,
    ) -> Result<()> {
        let mut images = self.images.lock().unwrap_or_else(|e| e.into_inner());
        let history = images
            .get_mut(&(owner.to_string(), key.to_string()))
            .ok_or_else(|| Error::NotFound(format!("image {} of {}", key, owner)))?;
        history.push(record.clone());
        Ok(())
    }
}
