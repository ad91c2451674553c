use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::AppError;
use crate::pricing::currency::Currency;
use crate::pricing::service::{NewVendorModel, PricingService};

const LAST_CATALOG_HASH_KEY: &str = "last_catalog_hash";

/// Pricing catalog file: every vendor model with its prices and tiers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingCatalog {
    pub vendor_models: Vec<NewVendorModel>,
}

/// Parse a catalog and check every entry before anything is imported
pub fn parse_catalog_json(json: &str, default_currency: &Currency) -> Result<PricingCatalog, AppError> {
    let catalog: PricingCatalog = serde_json::from_str(json)
        .map_err(|e| AppError::Catalog(format!("Failed to parse pricing catalog: {}", e)))?;

    let mut seen = std::collections::HashSet::new();
    for model in &catalog.vendor_models {
        if model.model_name.trim().is_empty() {
            return Err(AppError::Catalog(format!(
                "Provider {} has a vendor model without a name",
                model.provider_id
            )));
        }
        if !seen.insert((model.provider_id, model.model_name.as_str())) {
            return Err(AppError::Catalog(format!(
                "Vendor model '{}' of provider {} is listed twice",
                model.model_name, model.provider_id
            )));
        }
        model.check(default_currency).map_err(|e| {
            AppError::Catalog(format!("Vendor model '{}': {}", model.model_name, e))
        })?;
    }

    debug!("Parsed {} vendor models from catalog", catalog.vendor_models.len());
    Ok(catalog)
}

/// Calculate SHA256 hash of content
pub fn calculate_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Outcome of one catalog import
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    Unchanged,
    Imported { models: usize, hash: String },
}

/// Imports catalog files into the pricing store, skipping unchanged content
pub struct CatalogImporter<'a> {
    pricing_service: &'a PricingService,
    db_pool: SqlitePool,
    default_currency: Currency,
}

impl<'a> CatalogImporter<'a> {
    pub fn new(pricing_service: &'a PricingService, default_currency: Currency) -> Self {
        Self {
            db_pool: pricing_service.pool().clone(),
            pricing_service,
            default_currency,
        }
    }

    /// Read and import a catalog file
    pub async fn import_file(&self, path: impl AsRef<Path>) -> Result<ImportOutcome, AppError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            AppError::Catalog(format!("Failed to read {}: {}", path.display(), e))
        })?;
        self.import_str(&content).await
    }

    /// Import catalog content. Returns `Unchanged` if it matches the last import.
    pub async fn import_str(&self, content: &str) -> Result<ImportOutcome, AppError> {
        let new_hash = calculate_hash(content);

        if self.get_last_hash().await?.as_deref() == Some(new_hash.as_str()) {
            debug!("Pricing catalog unchanged (no import needed)");
            return Ok(ImportOutcome::Unchanged);
        }

        // every entry is checked before the first write
        let catalog = parse_catalog_json(content, &self.default_currency)?;

        self.pricing_service
            .upsert_vendor_models(
                &catalog.vendor_models,
                Some((LAST_CATALOG_HASH_KEY, new_hash.as_str())),
            )
            .await?;
        info!(
            models = catalog.vendor_models.len(),
            "Imported pricing catalog"
        );

        Ok(ImportOutcome::Imported {
            models: catalog.vendor_models.len(),
            hash: new_hash,
        })
    }

    async fn get_last_hash(&self) -> Result<Option<String>, AppError> {
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT value FROM pricing_metadata WHERE key = ?",
        )
        .bind(LAST_CATALOG_HASH_KEY)
        .fetch_optional(&self.db_pool)
        .await?;

        Ok(row.and_then(|(value,)| if value.is_empty() { None } else { Some(value) }))
    }

}
