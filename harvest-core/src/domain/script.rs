//! Script context types
//!
//! The context is assembled once per job and passed to the scraper
//! subprocess as a base64-encoded JSON blob on its command line.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::{Job, ScraperDefinition};

/// A SKU/brand pair from the tenant's own catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkuBrand {
    pub sku: String,
    pub brand: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand_id: Option<Uuid>,
}

/// Catalog data used to scope a scrape
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogFilter {
    pub active_brand_names: Vec<String>,
    pub active_brand_ids: Vec<Uuid>,
    pub own_product_eans: Vec<String>,
    pub own_product_sku_brands: Vec<SkuBrand>,
}

/// Immutable input bundle for one scraper run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptContext {
    pub run_id: Uuid,
    pub scraper_id: Uuid,
    pub user_id: Uuid,
    pub competitor_id: Option<Uuid>,
    pub is_test_run: bool,
    pub is_validation_run: bool,
    pub filter_by_active_brands: bool,
    pub active_brand_names: Vec<String>,
    pub active_brand_ids: Vec<Uuid>,
    pub scrape_only_own_products: bool,
    pub own_product_eans: Vec<String>,
    pub own_product_sku_brands: Vec<SkuBrand>,
}

impl ScriptContext {
    /// Builds the context for a claimed job
    pub fn new(job: &Job, scraper: &ScraperDefinition, filter: CatalogFilter) -> Self {
        Self {
            run_id: job.id,
            scraper_id: job.scraper_id,
            user_id: job.user_id,
            competitor_id: job.competitor_id,
            is_test_run: job.is_test_run,
            is_validation_run: job.is_validation_run,
            filter_by_active_brands: scraper.filter_by_active_brands,
            active_brand_names: filter.active_brand_names,
            active_brand_ids: filter.active_brand_ids,
            scrape_only_own_products: scraper.scrape_only_own_products,
            own_product_eans: filter.own_product_eans,
            own_product_sku_brands: filter.own_product_sku_brands,
        }
    }

    /// Encodes the context as base64 JSON
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_vec(self)?;
        Ok(STANDARD.encode(json))
    }

    /// Decodes a context produced by [`ScriptContext::encode`]
    pub fn decode(encoded: &str) -> Result<Self, String> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| format!("invalid base64 context: {}", e))?;
        serde_json::from_slice(&bytes).map_err(|e| format!("invalid context json: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::JobStatus;

    fn sample_job() -> Job {
        Job {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            scraper_id: Uuid::new_v4(),
            status: JobStatus::Running,
            created_at: chrono::Utc::now(),
            started_at: Some(chrono::Utc::now()),
            completed_at: None,
            is_test_run: true,
            is_validation_run: false,
            competitor_id: Some(Uuid::new_v4()),
            product_count: 0,
            execution_time_ms: None,
            error_message: None,
            error_details: None,
            current_phase: None,
            current_batch: None,
            total_batches: None,
        }
    }

    #[test]
    fn test_context_carries_job_and_filter_data() {
        let job = sample_job();
        let scraper = ScraperDefinition {
            id: job.scraper_id,
            scraper_type: "typescript".to_string(),
            script: Some("console.log('hi')".to_string()),
            filter_by_active_brands: true,
            scrape_only_own_products: false,
        };
        let filter = CatalogFilter {
            active_brand_names: vec!["Acme".to_string()],
            ..CatalogFilter::default()
        };

        let context = ScriptContext::new(&job, &scraper, filter);

        assert_eq!(context.run_id, job.id);
        assert!(context.is_test_run);
        assert!(context.filter_by_active_brands);
        assert_eq!(context.active_brand_names, vec!["Acme".to_string()]);
        assert!(context.own_product_eans.is_empty());
    }

    #[test]
    fn test_encoded_context_is_plain_base64_json() {
        let job = sample_job();
        let scraper = ScraperDefinition {
            id: job.scraper_id,
            scraper_type: "typescript".to_string(),
            script: None,
            filter_by_active_brands: false,
            scrape_only_own_products: true,
        };
        let context = ScriptContext::new(&job, &scraper, CatalogFilter::default());

        let encoded = context.encode().unwrap();
        assert!(!encoded.contains('{'));

        let json = STANDARD.decode(&encoded).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["run_id"], job.id.to_string());
        assert_eq!(value["scrape_only_own_products"], true);
        assert_eq!(ScriptContext::decode(&encoded).unwrap(), context);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(ScriptContext::decode("not base64!!").is_err());
    }
}
