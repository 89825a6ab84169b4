//! Record persistence.
//!
//! The [`RecordStore`] writes one row per published artifact and resolves
//! identifiers back to the row they were issued with. Rows are append-only.
//!
//! [`PgRecordStore`] talks to Postgres over a bounded `sqlx` pool. Pool
//! exhaustion surfaces as [`PersistError::PoolExhausted`] after the acquire
//! timeout instead of blocking forever.

use crate::{
    error::PersistError,
    types::{Column, Identifier, RecordFields, RecordSummary, TableSelector},
};
use async_trait::async_trait;
use core::time::Duration;
use sqlx::{
    PgPool,
    postgres::{PgConnectOptions, PgPoolOptions},
};

pub const DEFAULT_POOL_SIZE: u32 = 10;
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Tables searched by [`RecordStore::lookup`], in priority order.
pub const LOOKUP_TABLES: [TableSelector; 2] = [TableSelector::Product, TableSelector::QrCode];

/// Resolves one identifier, preferring product rows over QR rows.
pub const LOOKUP_SQL: &str = concat!(
    "SELECT name, unique_id, source FROM (",
    "SELECT name, unique_id, 'products_new' AS source, 0 AS priority ",
    "FROM products_new WHERE unique_id = $1 ",
    "UNION ALL ",
    "SELECT name, unique_id, 'qr_codes_new' AS source, 1 AS priority ",
    "FROM qr_codes_new WHERE unique_id = $1",
    ") AS matches ORDER BY priority LIMIT 1",
);

/// Durable home of published records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Appends one row shaped by `table`.
    ///
    /// # Errors
    ///
    /// [`PersistError`] on constraint violation, connectivity loss or pool
    /// exhaustion. The artifact must not be treated as recorded on error.
    async fn insert(&self, table: TableSelector, fields: &RecordFields)
    -> Result<(), PersistError>;

    /// Finds `identifier` in the product table, then the QR table.
    ///
    /// A miss is `Ok(None)`.
    async fn lookup(&self, identifier: &Identifier) -> Result<Option<RecordSummary>, PersistError>;

    /// Releases pooled resources. Later calls fail with a connectivity error.
    async fn close(&self) {}
}

/// Pool sizing for [`PgRecordStore`].
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_POOL_SIZE,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

/// `CREATE TABLE IF NOT EXISTS` for one record shape.
pub fn create_table_sql(table: TableSelector) -> String {
    let columns = table
        .columns()
        .iter()
        .map(|column| match column {
            Column::Name => "name TEXT NOT NULL".to_string(),
            Column::UniqueId => "unique_id TEXT NOT NULL UNIQUE".to_string(),
            Column::ImagePath(name) => format!("{name} TEXT NOT NULL"),
            Column::ImageBase64(name) => format!("{name} TEXT"),
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "CREATE TABLE IF NOT EXISTS {} (id BIGSERIAL PRIMARY KEY, {columns}, \
         created_at TIMESTAMPTZ NOT NULL DEFAULT now())",
        table.table()
    )
}

/// Postgres-backed [`RecordStore`].
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a bounded pool and verifies one connection can be established.
    pub async fn connect(
        options: PgConnectOptions,
        settings: PoolSettings,
    ) -> Result<Self, PersistError> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout)
            .connect_with(options)
            .await?;
        Ok(Self::new(pool))
    }

    /// Creates the record tables if they don't exist yet.
    pub async fn ensure_schema(&self) -> Result<(), PersistError> {
        for table in [
            TableSelector::Product,
            TableSelector::QrCode,
            TableSelector::LegacyBarcode,
        ] {
            sqlx::query(&create_table_sql(table))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

}

#[async_trait]
impl RecordStore for PgRecordStore {
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(self, fields), fields(table = table.table())))]
    async fn insert(
        &self,
        table: TableSelector,
        fields: &RecordFields,
    ) -> Result<(), PersistError> {
        let sql = table.insert_sql();
        let mut query = sqlx::query(&sql);
        for column in table.columns() {
            query = query.bind(fields.value_for(*column).map(str::to_owned));
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn lookup(&self, identifier: &Identifier) -> Result<Option<RecordSummary>, PersistError> {
        let row = sqlx::query_as::<_, RecordSummary>(LOOKUP_SQL)
            .bind(identifier.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
