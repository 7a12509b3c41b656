//! PostgreSQL + PostGIS store adapter

use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::info;

use super::{FeatureRow, LoadTransaction, SampleRow, SpatialStore, StoreError, StoreResult};
use crate::config::DatabaseConfig;

const SAVEPOINT_NAME: &str = "feature_savepoint";

/// Spatial store backed by a sqlx connection pool
///
/// Table names reaching this adapter have been validated as plain
/// lowercase identifiers and are interpolated into statements directly.
#[derive(Debug, Clone)]
pub struct PgSpatialStore {
    pool: PgPool,
}

impl PgSpatialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool with the configured limits
    pub async fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        let options = config
            .connect_options()
            .map_err(|e| StoreError::Rejected(format!("invalid database settings: {:#}", e)))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect_with(options)
            .await?;

        info!(
            target = %config.display_target(),
            max_connections = config.max_connections,
            "Database connection pool created"
        );

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SpatialStore for PgSpatialStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn spatial_version(&self) -> StoreResult<String> {
        let version: String = sqlx::query_scalar("SELECT PostGIS_Version()")
            .fetch_one(&self.pool)
            .await?;
        Ok(version)
    }

    async fn create_spatial_extension(&self) -> StoreResult<()> {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS postgis")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> StoreResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT FROM pg_tables WHERE tablename = $1)")
                .bind(table)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn begin(&self) -> StoreResult<Box<dyn LoadTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLoadTransaction { tx: Some(tx) }))
    }

    async fn count_rows(&self, table: &str) -> StoreResult<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count)
    }

    async fn sample_rows(&self, table: &str, limit: i64) -> StoreResult<Vec<SampleRow>> {
        let sql = format!(
            "SELECT id::bigint, source_id, name, ST_AsText(geometry::geometry) \
             FROM {} ORDER BY id LIMIT $1",
            table
        );
        let rows: Vec<(i64, String, Option<String>, Option<String>)> = sqlx::query_as(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(id, source_id, name, wkt)| SampleRow {
                id,
                source_id,
                name,
                wkt,
            })
            .collect())
    }

    async fn analyze(&self, table: &str) -> StoreResult<()> {
        let sql = format!("ANALYZE {}", table);
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Transaction wrapper; `None` once committed or rolled back
struct PgLoadTransaction {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgLoadTransaction {
    fn conn(&mut self) -> StoreResult<&mut PgConnection> {
        let tx = self.tx.as_mut().ok_or(StoreError::TransactionFinished)?;
        Ok(&mut **tx)
    }

    fn take(&mut self) -> StoreResult<Transaction<'static, Postgres>> {
        self.tx.take().ok_or(StoreError::TransactionFinished)
    }
}

#[async_trait]
impl LoadTransaction for PgLoadTransaction {
    async fn savepoint(&mut self) -> StoreResult<()> {
        let sql = format!("SAVEPOINT {}", SAVEPOINT_NAME);
        sqlx::query(&sql).execute(self.conn()?).await?;
        Ok(())
    }

    async fn release_savepoint(&mut self) -> StoreResult<()> {
        let sql = format!("RELEASE SAVEPOINT {}", SAVEPOINT_NAME);
        sqlx::query(&sql).execute(self.conn()?).await?;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self) -> StoreResult<()> {
        let sql = format!("ROLLBACK TO SAVEPOINT {}", SAVEPOINT_NAME);
        sqlx::query(&sql).execute(self.conn()?).await?;
        Ok(())
    }

    async fn insert_feature(&mut self, table: &str, row: &FeatureRow<'_>) -> StoreResult<i64> {
        let sql = format!(
            "INSERT INTO {} (source_id, name, description, metadata, geometry) \
             VALUES ($1, $2, $3, $4, ST_GeomFromKML($5)::geography) \
             RETURNING id::bigint",
            table
        );
        let id: i64 = sqlx::query_scalar(&sql)
            .bind(row.source_id)
            .bind(row.name)
            .bind(row.description)
            .bind(&row.metadata)
            .bind(&row.kml_fragment)
            .fetch_one(self.conn()?)
            .await?;
        Ok(id)
    }

    async fn commit(&mut self) -> StoreResult<()> {
        self.take()?.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        self.take()?.rollback().await?;
        Ok(())
    }
}
