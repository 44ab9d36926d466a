use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

/// Creates the tables this worker reads and writes
///
/// The job store is normally owned by another service; this exists for local
/// development and is only run when `RUN_MIGRATIONS` is set.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Create scrapers table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scrapers (
            id UUID PRIMARY KEY,
            user_id UUID NOT NULL,
            scraper_type VARCHAR(50) NOT NULL DEFAULT 'typescript',
            script TEXT,
            filter_by_active_brands BOOLEAN NOT NULL DEFAULT FALSE,
            scrape_only_own_products BOOLEAN NOT NULL DEFAULT FALSE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create scraper_runs table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scraper_runs (
            id UUID PRIMARY KEY,
            user_id UUID NOT NULL,
            scraper_id UUID NOT NULL REFERENCES scrapers(id) ON DELETE CASCADE,
            scraper_type VARCHAR(50) NOT NULL DEFAULT 'typescript',
            status VARCHAR(50) NOT NULL DEFAULT 'pending',
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            started_at TIMESTAMPTZ,
            claimed_by_worker_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            is_test_run BOOLEAN NOT NULL DEFAULT FALSE,
            is_validation_run BOOLEAN NOT NULL DEFAULT FALSE,
            competitor_id UUID,
            product_count BIGINT NOT NULL DEFAULT 0,
            execution_time_ms BIGINT,
            products_per_second DOUBLE PRECISION,
            error_message TEXT,
            error_details TEXT,
            current_phase INTEGER,
            current_batch INTEGER,
            total_batches INTEGER,
            progress_messages JSONB NOT NULL DEFAULT '[]'
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create catalog tables
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS brands (
            id UUID PRIMARY KEY,
            user_id UUID NOT NULL,
            name TEXT NOT NULL,
            is_active BOOLEAN NOT NULL DEFAULT TRUE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS products (
            id UUID PRIMARY KEY,
            user_id UUID NOT NULL,
            ean TEXT,
            sku TEXT,
            brand TEXT,
            brand_id UUID,
            is_active BOOLEAN NOT NULL DEFAULT TRUE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create results table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scraped_products (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            user_id UUID NOT NULL,
            scraper_run_id UUID NOT NULL REFERENCES scraper_runs(id) ON DELETE CASCADE,
            competitor_id UUID,
            name TEXT NOT NULL,
            price DOUBLE PRECISION NOT NULL,
            currency VARCHAR(10) NOT NULL DEFAULT 'USD',
            url TEXT,
            image_url TEXT,
            sku TEXT,
            brand TEXT,
            ean TEXT,
            source_id TEXT,
            scraped_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for the claim query and per-tenant catalog reads
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_scraper_runs_claim ON scraper_runs(scraper_type, status, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_brands_user ON brands(user_id, is_active)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_products_user ON products(user_id, is_active)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_scraped_products_run ON scraped_products(scraper_run_id)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
