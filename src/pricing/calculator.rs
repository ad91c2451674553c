use rust_decimal::Decimal;
use tracing::debug;

use crate::error::CalcError;
use crate::pricing::models::{
    CostCalculation, FixedPricing, PricingStrategy, StrategyKind, Usage, VendorModel,
};
use crate::pricing::tiers::{select_tier, TokenBasis};

const TOKENS_PER_MILLION: i64 = 1_000_000;

/// Calculator for computing request costs under a fixed token basis
#[derive(Debug, Clone, Copy)]
pub struct CostCalculator {
    basis: TokenBasis,
}

impl CostCalculator {
    /// Create a new cost calculator
    pub fn new(basis: TokenBasis) -> Self {
        Self { basis }
    }

    pub fn basis(&self) -> TokenBasis {
        self.basis
    }

    /// Calculate cost for one usage sample against a model snapshot
    pub fn calculate_cost(
        &self,
        model: &VendorModel,
        usage: &Usage,
    ) -> Result<CostCalculation, CalcError> {
        let calculation = calculate_cost(model, usage, self.basis)?;
        debug!(
            vendor_model_id = model.id,
            strategy = %calculation.pricing_strategy,
            tier = ?calculation.tier_number,
            total_cost = %calculation.total_cost,
            currency = %calculation.currency,
            "Calculated cost"
        );
        Ok(calculation)
    }
}

/// Price a usage sample under the model's active strategy
pub fn calculate_cost(
    model: &VendorModel,
    usage: &Usage,
    basis: TokenBasis,
) -> Result<CostCalculation, CalcError> {
    // usage is checked before the record so bad input never depends on model state
    check_usage(usage)?;
    let strategy = model.pricing()?;
    calculate_with_strategy(&strategy, &model.currency, usage, basis)
}

/// Price a usage sample under an already resolved strategy
pub fn calculate_with_strategy(
    strategy: &PricingStrategy,
    currency: &str,
    usage: &Usage,
    basis: TokenBasis,
) -> Result<CostCalculation, CalcError> {
    check_usage(usage)?;

    let (input_cost, output_cost, total_cost, tier_number) = match strategy {
        PricingStrategy::Fixed(rates) => {
            check_cached(usage)?;
            let (input, output) = token_costs(rates, usage)?;
            (input, output, sum(input, output)?, None)
        }
        PricingStrategy::PerRequest { price } => (Decimal::ZERO, Decimal::ZERO, *price, None),
        PricingStrategy::Tiered(schedule) => {
            check_cached(usage)?;
            let total_tokens = basis.total_tokens(usage)?;
            let tier = select_tier(schedule.tiers(), total_tokens)?;
            let (input, output) = token_costs(&tier.rates(), usage)?;
            (input, output, sum(input, output)?, Some(tier.tier_number))
        }
    };

    Ok(CostCalculation {
        input_tokens: usage.input_tokens,
        cached_tokens: usage.cached_tokens,
        output_tokens: usage.output_tokens,
        input_cost,
        output_cost,
        total_cost,
        currency: currency.to_string(),
        pricing_strategy: strategy.kind(),
        tier_number,
    })
}

fn check_usage(usage: &Usage) -> Result<(), CalcError> {
    for (name, value) in [
        ("inputTokens", usage.input_tokens),
        ("cachedTokens", usage.cached_tokens),
        ("outputTokens", usage.output_tokens),
    ] {
        if value < 0 {
            return Err(CalcError::InvalidUsage(format!(
                "{} must be non-negative, got {}",
                name, value
            )));
        }
    }
    Ok(())
}

fn check_cached(usage: &Usage) -> Result<(), CalcError> {
    if usage.cached_tokens > usage.input_tokens {
        return Err(CalcError::InvalidUsage(format!(
            "cachedTokens ({}) exceeds inputTokens ({})",
            usage.cached_tokens, usage.input_tokens
        )));
    }
    Ok(())
}

/// Input and output cost; cached tokens use the cached rate, the rest of input the input rate
fn token_costs(rates: &FixedPricing, usage: &Usage) -> Result<(Decimal, Decimal), CalcError> {
    let cached_rate = rates
        .cached_input_price
        .unwrap_or(rates.input_per_million_tokens);
    let uncached = usage.input_tokens - usage.cached_tokens;

    let input_cost = sum(
        per_million(uncached, rates.input_per_million_tokens)?,
        per_million(usage.cached_tokens, cached_rate)?,
    )?;
    let output_cost = per_million(usage.output_tokens, rates.output_per_million_tokens)?;
    Ok((input_cost, output_cost))
}

fn per_million(tokens: i64, price: Decimal) -> Result<Decimal, CalcError> {
    Decimal::from(tokens)
        .checked_mul(price)
        .and_then(|scaled| scaled.checked_div(Decimal::from(TOKENS_PER_MILLION)))
        .ok_or(CalcError::Overflow)
}

fn sum(a: Decimal, b: Decimal) -> Result<Decimal, CalcError> {
    a.checked_add(b).ok_or(CalcError::Overflow)
}

impl CostCalculation {
    pub fn is_tiered(&self) -> bool {
        self.pricing_strategy == StrategyKind::Tiered
    }
}
