//! Catalog repository
//!
//! Read-only access to the tenant's own catalog, used to scope a scrape to
//! active brands or to products the tenant already sells.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

/// An active brand of a tenant
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Brand {
    pub id: Uuid,
    pub name: String,
}

/// Identifiers of one active product in a tenant's catalog
#[derive(Debug, Clone, Default, PartialEq, sqlx::FromRow)]
pub struct OwnProduct {
    pub ean: Option<String>,
    pub sku: Option<String>,
    pub brand: Option<String>,
    pub brand_id: Option<Uuid>,
}

#[async_trait]
pub trait CatalogRepository: Send + Sync {
    /// Lists the tenant's active brands
    async fn active_brands(&self, user_id: Uuid) -> Result<Vec<Brand>>;

    /// Lists identifiers of the tenant's active products
    async fn own_products(&self, user_id: Uuid) -> Result<Vec<OwnProduct>>;
}

/// Postgres implementation of CatalogRepository
pub struct PgCatalogRepository {
    pool: PgPool,
}

impl PgCatalogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CatalogRepository for PgCatalogRepository {
    async fn active_brands(&self, user_id: Uuid) -> Result<Vec<Brand>> {
        sqlx::query_as::<_, Brand>(
            "SELECT id, name FROM brands WHERE user_id = $1 AND is_active = TRUE ORDER BY name",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch active brands")
    }

    async fn own_products(&self, user_id: Uuid) -> Result<Vec<OwnProduct>> {
        sqlx::query_as::<_, OwnProduct>(
            "SELECT ean, sku, brand, brand_id FROM products WHERE user_id = $1 AND is_active = TRUE",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch own products")
    }
}
