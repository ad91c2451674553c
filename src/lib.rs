pub mod config;
pub mod db;
pub mod error;
pub mod pricing;

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{Config, LogFormat, LoggingConfig};
use crate::pricing::{CatalogImporter, ImportOutcome, PricingService};

/// Initialize tracing/logging. `RUST_LOG` overrides the configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true))
            .try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init(),
    }
}

/// Open the database, import the configured catalog and warm the cache
pub async fn start_pricing_service(config: &Config) -> anyhow::Result<PricingService> {
    let pool = db::connect(&config.database).await?;
    let service = PricingService::new(pool, &config.pricing);

    if let Some(path) = &config.pricing.catalog_path {
        let importer = CatalogImporter::new(&service, config.pricing.default_currency.clone());
        match importer.import_file(path).await? {
            ImportOutcome::Imported { models, hash } => {
                tracing::info!(catalog = %path, models, hash = %hash, "Pricing catalog imported");
            }
            ImportOutcome::Unchanged => {
                tracing::info!(catalog = %path, "Pricing catalog unchanged");
            }
        }
    }

    service.load_cache().await?;
    Ok(service)
}
