//! Results repository
//!
//! Writes scraped records to the result store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use harvest_core::domain::record::ScrapedRecord;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

/// Currency stored when a record does not name one
pub const DEFAULT_CURRENCY: &str = "USD";

/// Identifiers every stored record is scoped to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultScope {
    pub run_id: Uuid,
    pub user_id: Uuid,
    pub competitor_id: Option<Uuid>,
}

#[async_trait]
pub trait ResultRepository: Send + Sync {
    /// Inserts one chunk of records, returning the number of rows written
    async fn insert_records(&self, scope: &ResultScope, records: &[ScrapedRecord]) -> Result<u64>;
}

/// Postgres implementation of ResultRepository
pub struct PgResultRepository {
    pool: PgPool,
}

impl PgResultRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultRepository for PgResultRepository {
    async fn insert_records(&self, scope: &ResultScope, records: &[ScrapedRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let scraped_at = chrono::Utc::now();
        let mut query = QueryBuilder::<Postgres>::new(
            "INSERT INTO scraped_products (user_id, scraper_run_id, competitor_id, name, price, \
             currency, url, image_url, sku, brand, ean, source_id, scraped_at) ",
        );

        query.push_values(records, |mut row, record| {
            row.push_bind(scope.user_id)
                .push_bind(scope.run_id)
                .push_bind(scope.competitor_id)
                .push_bind(&record.name)
                .push_bind(record.price)
                .push_bind(record.currency.as_deref().unwrap_or(DEFAULT_CURRENCY))
                .push_bind(&record.url)
                .push_bind(&record.image_url)
                .push_bind(&record.sku)
                .push_bind(&record.brand)
                .push_bind(&record.ean)
                .push_bind(&record.source_id)
                .push_bind(scraped_at);
        });

        let result = query
            .build()
            .execute(&self.pool)
            .await
            .context("Failed to insert scraped records")?;

        Ok(result.rows_affected())
    }
}
