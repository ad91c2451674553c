use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::PricingConfig;
use crate::error::{AppError, PriceField, ValidationError};
use crate::pricing::calculator::CostCalculator;
use crate::pricing::currency::{CostTotals, Currency};
use crate::pricing::models::{
    parse_price, CostCalculation, PricingTier, StrategyKind, Usage, VendorModel,
};
use crate::pricing::tiers::TokenBasis;
use crate::pricing::validation::validate_tier_set;

/// A vendor model to create, or to overwrite by `(provider_id, model_name)`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewVendorModel {
    pub provider_id: i64,
    pub model_name: String,
    pub pricing_strategy: StrategyKind,
    #[serde(default)]
    pub input_per_million_tokens: Option<String>,
    #[serde(default)]
    pub output_per_million_tokens: Option<String>,
    #[serde(default)]
    pub cached_input_price: Option<String>,
    #[serde(default)]
    pub per_request_price: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub tiers: Vec<PricingTier>,
}

fn default_enabled() -> bool {
    true
}

fn default_weight() -> u32 {
    100
}

impl NewVendorModel {
    /// Check prices, currency and tiers before anything is written
    pub fn check(&self, default_currency: &Currency) -> Result<Currency, AppError> {
        check_price(PriceField::InputPerMillionTokens, &self.input_per_million_tokens)?;
        check_price(PriceField::OutputPerMillionTokens, &self.output_per_million_tokens)?;
        check_price(PriceField::CachedInputPrice, &self.cached_input_price)?;
        check_price(PriceField::PerRequestPrice, &self.per_request_price)?;

        check_tiers(self.pricing_strategy, &self.tiers)?;

        match &self.currency {
            Some(code) => Ok(Currency::new(code)?),
            None => Ok(default_currency.clone()),
        }
    }
}

/// Partial price update; `None` leaves a column unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceUpdate {
    #[serde(default)]
    pub input_per_million_tokens: Option<String>,
    #[serde(default)]
    pub output_per_million_tokens: Option<String>,
    #[serde(default)]
    pub cached_input_price: Option<String>,
    #[serde(default)]
    pub per_request_price: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
}

fn check_price(field: PriceField, raw: &Option<String>) -> Result<(), AppError> {
    match raw {
        Some(value) if parse_price(value).is_none() => Err(AppError::InvalidPrice {
            field,
            value: value.clone(),
        }),
        _ => Ok(()),
    }
}

/// An empty set is only allowed outside the tiered strategy
fn check_tiers(strategy: StrategyKind, tiers: &[PricingTier]) -> Result<(), ValidationError> {
    if tiers.is_empty() && strategy != StrategyKind::Tiered {
        return Ok(());
    }
    validate_tier_set(tiers).map(|_| ())
}

#[derive(sqlx::FromRow)]
struct VendorModelRow {
    id: i64,
    provider_id: i64,
    model_name: String,
    pricing_strategy: String,
    input_per_million_tokens: Option<String>,
    output_per_million_tokens: Option<String>,
    cached_input_price: Option<String>,
    per_request_price: Option<String>,
    currency: String,
    enabled: i64,
    weight: i64,
}

impl VendorModelRow {
    fn into_model(self, tiers: Vec<PricingTier>) -> Result<VendorModel, sqlx::Error> {
        let weight = u32::try_from(self.weight).map_err(|e| sqlx::Error::ColumnDecode {
            index: "weight".to_string(),
            source: Box::new(e),
        })?;

        Ok(VendorModel {
            id: self.id,
            provider_id: self.provider_id,
            model_name: self.model_name,
            pricing_strategy: self.pricing_strategy,
            input_per_million_tokens: self.input_per_million_tokens,
            output_per_million_tokens: self.output_per_million_tokens,
            cached_input_price: self.cached_input_price,
            per_request_price: self.per_request_price,
            currency: self.currency,
            enabled: self.enabled != 0,
            weight,
            tiers,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TierRow {
    id: i64,
    vendor_model_id: i64,
    tier_number: i64,
    min_tokens: i64,
    max_tokens: Option<i64>,
    input_per_million_tokens: String,
    output_per_million_tokens: String,
    cached_input_price: String,
}

impl TryFrom<TierRow> for PricingTier {
    type Error = sqlx::Error;

    fn try_from(row: TierRow) -> Result<Self, Self::Error> {
        let tier_number =
            u32::try_from(row.tier_number).map_err(|e| sqlx::Error::ColumnDecode {
                index: "tier_number".to_string(),
                source: Box::new(e),
            })?;

        Ok(PricingTier {
            id: Some(row.id),
            tier_number,
            min_tokens: row.min_tokens,
            max_tokens: row.max_tokens,
            input_per_million_tokens: row.input_per_million_tokens,
            output_per_million_tokens: row.output_per_million_tokens,
            cached_input_price: row.cached_input_price,
        })
    }
}

const MODEL_COLUMNS: &str = r#"
    id, provider_id, model_name, pricing_strategy,
    input_per_million_tokens, output_per_million_tokens,
    cached_input_price, per_request_price, currency, enabled, weight
"#;

const TIER_COLUMNS: &str = r#"
    id, vendor_model_id, tier_number, min_tokens, max_tokens,
    input_per_million_tokens, output_per_million_tokens, cached_input_price
"#;

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Load one model and its tiers over a single connection
async fn fetch_model(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<VendorModel>, sqlx::Error> {
    let row = sqlx::query_as::<_, VendorModelRow>(&format!(
        "SELECT {} FROM vendor_models WHERE id = ?",
        MODEL_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let tiers = sqlx::query_as::<_, TierRow>(&format!(
        "SELECT {} FROM pricing_tiers WHERE vendor_model_id = ? ORDER BY tier_number",
        TIER_COLUMNS
    ))
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;

    let tiers = tiers
        .into_iter()
        .map(PricingTier::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(row.into_model(tiers)?))
}

async fn insert_tiers(
    conn: &mut SqliteConnection,
    vendor_model_id: i64,
    tiers: &[PricingTier],
) -> Result<(), sqlx::Error> {
    let mut ordered: Vec<&PricingTier> = tiers.iter().collect();
    ordered.sort_by_key(|t| t.tier_number);
    let created_at = now_millis();

    for tier in ordered {
        sqlx::query(
            r#"
            INSERT INTO pricing_tiers (
                vendor_model_id, tier_number, min_tokens, max_tokens,
                input_per_million_tokens, output_per_million_tokens,
                cached_input_price, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(vendor_model_id)
        .bind(tier.tier_number as i64)
        .bind(tier.min_tokens)
        .bind(tier.max_tokens)
        .bind(tier.input_per_million_tokens.trim())
        .bind(tier.output_per_million_tokens.trim())
        .bind(tier.cached_input_price.trim())
        .bind(created_at)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

async fn delete_tiers(conn: &mut SqliteConnection, vendor_model_id: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM pricing_tiers WHERE vendor_model_id = ?")
        .bind(vendor_model_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Service for managing vendor model pricing and computing costs
pub struct PricingService {
    db_pool: SqlitePool,
    calculator: CostCalculator,
    default_currency: Currency,
    /// Snapshots of committed models; writers hold the lock across their transaction
    cache: Arc<RwLock<HashMap<i64, VendorModel>>>,
}

impl PricingService {
    /// Create a new pricing service
    pub fn new(db_pool: SqlitePool, config: &PricingConfig) -> Self {
        Self {
            db_pool,
            calculator: CostCalculator::new(config.token_basis),
            default_currency: config.default_currency.clone(),
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db_pool
    }

    pub fn calculator(&self) -> CostCalculator {
        self.calculator
    }

    /// Load every vendor model into the cache
    pub async fn load_cache(&self) -> Result<usize, AppError> {
        let mut cache = self.cache.write().await;
        let models = self.list_vendor_models(None).await?;

        cache.clear();
        for model in models {
            cache.insert(model.id, model);
        }

        info!("Loaded {} vendor models into cache", cache.len());
        Ok(cache.len())
    }

    /// Get a vendor model snapshot (from cache)
    pub async fn get_vendor_model(&self, id: i64) -> Result<VendorModel, AppError> {
        if let Some(model) = self.cache.read().await.get(&id) {
            return Ok(model.clone());
        }

        let mut cache = self.cache.write().await;
        if let Some(model) = cache.get(&id) {
            return Ok(model.clone());
        }

        let mut tx = self.db_pool.begin().await?;
        let model = fetch_model(&mut tx, id).await?.ok_or(AppError::NotFound(id))?;
        tx.commit().await?;

        cache.insert(id, model.clone());
        Ok(model)
    }

    /// List vendor models with their tiers, optionally for one provider
    pub async fn list_vendor_models(
        &self,
        provider_id: Option<i64>,
    ) -> Result<Vec<VendorModel>, AppError> {
        let mut tx = self.db_pool.begin().await?;

        let rows = sqlx::query_as::<_, VendorModelRow>(&format!(
            "SELECT {} FROM vendor_models WHERE (?1 IS NULL OR provider_id = ?1) ORDER BY provider_id, model_name",
            MODEL_COLUMNS
        ))
        .bind(provider_id)
        .fetch_all(&mut *tx)
        .await?;

        let tier_rows = sqlx::query_as::<_, TierRow>(&format!(
            "SELECT {} FROM pricing_tiers ORDER BY vendor_model_id, tier_number",
            TIER_COLUMNS
        ))
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut tiers_by_model: HashMap<i64, Vec<PricingTier>> = HashMap::new();
        for row in tier_rows {
            tiers_by_model
                .entry(row.vendor_model_id)
                .or_default()
                .push(PricingTier::try_from(row)?);
        }

        let models = rows
            .into_iter()
            .map(|row| {
                let tiers = tiers_by_model.remove(&row.id).unwrap_or_default();
                row.into_model(tiers)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(models)
    }

    /// Ordered tier list of a vendor model
    pub async fn list_tiers(&self, id: i64) -> Result<Vec<PricingTier>, AppError> {
        Ok(self.get_vendor_model(id).await?.tiers)
    }

    /// Create a vendor model with its tiers; the database assigns the id
    pub async fn create_vendor_model(&self, new: &NewVendorModel) -> Result<VendorModel, AppError> {
        let currency = new.check(&self.default_currency)?;
        let mut cache = self.cache.write().await;
        let mut tx = self.db_pool.begin().await?;

        let id = insert_model(&mut tx, new, &currency).await?;
        insert_tiers(&mut tx, id, &new.tiers).await?;
        let model = fetch_model(&mut tx, id).await?.ok_or(AppError::NotFound(id))?;
        tx.commit().await?;

        info!(
            vendor_model_id = id,
            provider_id = new.provider_id,
            model = %new.model_name,
            strategy = %new.pricing_strategy,
            tiers = new.tiers.len(),
            "Created vendor model"
        );
        cache.insert(id, model.clone());
        Ok(model)
    }

    /// Create or overwrite the model identified by `(provider_id, model_name)`
    pub async fn upsert_vendor_model(&self, new: &NewVendorModel) -> Result<VendorModel, AppError> {
        let currency = new.check(&self.default_currency)?;
        let mut cache = self.cache.write().await;
        let mut tx = self.db_pool.begin().await?;

        let id = upsert_model(&mut tx, new, &currency).await?;
        let model = fetch_model(&mut tx, id).await?.ok_or(AppError::NotFound(id))?;
        tx.commit().await?;

        cache.insert(id, model.clone());
        Ok(model)
    }

    /// Upsert a batch of vendor models and record metadata in one transaction.
    /// Either every model and the metadata entry are stored or nothing is.
    pub async fn upsert_vendor_models(
        &self,
        models: &[NewVendorModel],
        metadata: Option<(&str, &str)>,
    ) -> Result<Vec<VendorModel>, AppError> {
        let currencies = models
            .iter()
            .map(|new| new.check(&self.default_currency))
            .collect::<Result<Vec<_>, _>>()?;

        let mut cache = self.cache.write().await;
        let mut tx = self.db_pool.begin().await?;

        let mut stored = Vec::with_capacity(models.len());
        for (new, currency) in models.iter().zip(&currencies) {
            let id = upsert_model(&mut tx, new, currency).await?;
            stored.push(fetch_model(&mut tx, id).await?.ok_or(AppError::NotFound(id))?);
        }
        if let Some((key, value)) = metadata {
            save_metadata(&mut tx, key, value).await?;
        }
        tx.commit().await?;

        for model in &stored {
            cache.insert(model.id, model.clone());
        }
        Ok(stored)
    }

    /// Replace a model's whole tier set. Either every tier is stored or none is.
    pub async fn replace_tiers(
        &self,
        id: i64,
        tiers: Vec<PricingTier>,
    ) -> Result<Vec<PricingTier>, AppError> {
        let mut cache = self.cache.write().await;
        let mut tx = self.db_pool.begin().await?;

        let current = fetch_model(&mut tx, id).await?.ok_or(AppError::NotFound(id))?;
        let strategy = current.strategy_kind().ok();
        if let Err(err) = check_tiers(strategy.unwrap_or(StrategyKind::Fixed), &tiers) {
            warn!(
                vendor_model_id = id,
                error = %err,
                "Rejected tier set"
            );
            return Err(err.into());
        }

        let removed = delete_tiers(&mut tx, id).await?;
        insert_tiers(&mut tx, id, &tiers).await?;
        touch(&mut tx, id).await?;
        let model = fetch_model(&mut tx, id).await?.ok_or(AppError::NotFound(id))?;
        tx.commit().await?;

        info!(
            vendor_model_id = id,
            removed,
            stored = model.tiers.len(),
            "Replaced pricing tiers"
        );
        let stored = model.tiers.clone();
        cache.insert(id, model);
        Ok(stored)
    }

    /// Switch the billing strategy. Tiers are kept and not re-validated.
    pub async fn update_pricing_strategy(
        &self,
        id: i64,
        strategy: StrategyKind,
    ) -> Result<VendorModel, AppError> {
        let mut cache = self.cache.write().await;
        let mut tx = self.db_pool.begin().await?;

        let result = sqlx::query(
            "UPDATE vendor_models SET pricing_strategy = ?, updated_at = ? WHERE id = ?",
        )
        .bind(strategy.as_str())
        .bind(now_millis())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(id));
        }

        let model = fetch_model(&mut tx, id).await?.ok_or(AppError::NotFound(id))?;
        tx.commit().await?;

        if strategy == StrategyKind::Tiered && model.tiers.is_empty() {
            warn!(
                vendor_model_id = id,
                "Switched to TIERED without tiers; calculations fail until tiers are set"
            );
        } else {
            info!(vendor_model_id = id, strategy = %strategy, "Updated pricing strategy");
        }
        cache.insert(id, model.clone());
        Ok(model)
    }

    /// Update fixed and per-request prices and the currency
    pub async fn update_prices(&self, id: i64, update: &PriceUpdate) -> Result<VendorModel, AppError> {
        check_price(PriceField::InputPerMillionTokens, &update.input_per_million_tokens)?;
        check_price(PriceField::OutputPerMillionTokens, &update.output_per_million_tokens)?;
        check_price(PriceField::CachedInputPrice, &update.cached_input_price)?;
        check_price(PriceField::PerRequestPrice, &update.per_request_price)?;
        let currency = update.currency.as_deref().map(Currency::new).transpose()?;

        let mut cache = self.cache.write().await;
        let mut tx = self.db_pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE vendor_models SET
                input_per_million_tokens = COALESCE(?, input_per_million_tokens),
                output_per_million_tokens = COALESCE(?, output_per_million_tokens),
                cached_input_price = COALESCE(?, cached_input_price),
                per_request_price = COALESCE(?, per_request_price),
                currency = COALESCE(?, currency),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&update.input_per_million_tokens)
        .bind(&update.output_per_million_tokens)
        .bind(&update.cached_input_price)
        .bind(&update.per_request_price)
        .bind(currency.as_ref().map(|c| c.as_str()))
        .bind(now_millis())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(id));
        }

        let model = fetch_model(&mut tx, id).await?.ok_or(AppError::NotFound(id))?;
        tx.commit().await?;

        info!(vendor_model_id = id, "Updated vendor model prices");
        cache.insert(id, model.clone());
        Ok(model)
    }

    pub async fn set_enabled(&self, id: i64, enabled: bool) -> Result<VendorModel, AppError> {
        let mut cache = self.cache.write().await;
        let mut tx = self.db_pool.begin().await?;

        let result =
            sqlx::query("UPDATE vendor_models SET enabled = ?, updated_at = ? WHERE id = ?")
                .bind(enabled)
                .bind(now_millis())
                .bind(id)
                .execute(&mut *tx)
                .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(id));
        }

        let model = fetch_model(&mut tx, id).await?.ok_or(AppError::NotFound(id))?;
        tx.commit().await?;

        info!(vendor_model_id = id, enabled, "Updated vendor model status");
        cache.insert(id, model.clone());
        Ok(model)
    }

    /// Delete a vendor model together with its tiers
    pub async fn delete_vendor_model(&self, id: i64) -> Result<(), AppError> {
        let mut cache = self.cache.write().await;
        let mut tx = self.db_pool.begin().await?;

        let removed_tiers = delete_tiers(&mut tx, id).await?;
        let result = sqlx::query("DELETE FROM vendor_models WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(id));
        }
        tx.commit().await?;

        info!(vendor_model_id = id, removed_tiers, "Deleted vendor model");
        cache.remove(&id);
        Ok(())
    }

    /// Calculate cost for one request against the current snapshot of a model
    pub async fn calculate(&self, id: i64, usage: &Usage) -> Result<CostCalculation, AppError> {
        let model = self.get_vendor_model(id).await?;
        if !model.enabled {
            debug!(vendor_model_id = id, "Calculating cost for a disabled vendor model");
        }

        self.calculator.calculate_cost(&model, usage).map_err(|err| {
            warn!(vendor_model_id = id, error = %err, "Cost calculation failed");
            AppError::from(err)
        })
    }

    /// Calculate cost with a caller-chosen token basis, e.g. a provider's
    /// cumulative period total from `TokenBasis::Cumulative`
    pub async fn calculate_with_basis(
        &self,
        id: i64,
        usage: &Usage,
        basis: TokenBasis,
    ) -> Result<CostCalculation, AppError> {
        let model = self.get_vendor_model(id).await?;
        CostCalculator::new(basis)
            .calculate_cost(&model, usage)
            .map_err(|err| {
                warn!(vendor_model_id = id, error = %err, "Cost calculation failed");
                AppError::from(err)
            })
    }

    /// Calculate and total several requests; all models must bill in one currency
    pub async fn calculate_totals(&self, samples: &[(i64, Usage)]) -> Result<CostTotals, AppError> {
        let mut totals = CostTotals::new();
        for (id, usage) in samples {
            let calculation = self.calculate(*id, usage).await?;
            totals.add(&calculation)?;
        }
        Ok(totals)
    }
}

async fn insert_model(
    conn: &mut SqliteConnection,
    new: &NewVendorModel,
    currency: &Currency,
) -> Result<i64, sqlx::Error> {
    let now = now_millis();
    let result = sqlx::query(
        r#"
        INSERT INTO vendor_models (
            provider_id, model_name, pricing_strategy,
            input_per_million_tokens, output_per_million_tokens,
            cached_input_price, per_request_price, currency,
            enabled, weight, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(new.provider_id)
    .bind(&new.model_name)
    .bind(new.pricing_strategy.as_str())
    .bind(&new.input_per_million_tokens)
    .bind(&new.output_per_million_tokens)
    .bind(&new.cached_input_price)
    .bind(&new.per_request_price)
    .bind(currency.as_str())
    .bind(new.enabled)
    .bind(new.weight as i64)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

async fn upsert_model(
    conn: &mut SqliteConnection,
    new: &NewVendorModel,
    currency: &Currency,
) -> Result<i64, sqlx::Error> {
    let existing = sqlx::query_as::<_, (i64,)>(
        "SELECT id FROM vendor_models WHERE provider_id = ? AND model_name = ?",
    )
    .bind(new.provider_id)
    .bind(&new.model_name)
    .fetch_optional(&mut *conn)
    .await?;

    let id = match existing {
        Some((id,)) => {
            sqlx::query(
                r#"
                UPDATE vendor_models SET
                    pricing_strategy = ?,
                    input_per_million_tokens = ?,
                    output_per_million_tokens = ?,
                    cached_input_price = ?,
                    per_request_price = ?,
                    currency = ?,
                    enabled = ?,
                    weight = ?,
                    updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(new.pricing_strategy.as_str())
            .bind(&new.input_per_million_tokens)
            .bind(&new.output_per_million_tokens)
            .bind(&new.cached_input_price)
            .bind(&new.per_request_price)
            .bind(currency.as_str())
            .bind(new.enabled)
            .bind(new.weight as i64)
            .bind(now_millis())
            .bind(id)
            .execute(&mut *conn)
            .await?;
            delete_tiers(&mut *conn, id).await?;
            id
        }
        None => insert_model(&mut *conn, new, currency).await?,
    };

    insert_tiers(&mut *conn, id, &new.tiers).await?;

    debug!(
        vendor_model_id = id,
        model = %new.model_name,
        updated = existing.is_some(),
        "Upserted vendor model"
    );
    Ok(id)
}

async fn save_metadata(conn: &mut SqliteConnection, key: &str, value: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO pricing_metadata (key, value, updated_at)
        VALUES (?, ?, ?)
        "#,
    )
    .bind(key)
    .bind(value)
    .bind(now_millis())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn touch(conn: &mut SqliteConnection, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE vendor_models SET updated_at = ? WHERE id = ?")
        .bind(now_millis())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}
