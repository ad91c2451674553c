use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{CalcError, PriceField};
use crate::pricing::validation::validate_tier_set;

/// Billing mode of a vendor model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyKind {
    Fixed,
    PerRequest,
    Tiered,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Fixed => "FIXED",
            StrategyKind::PerRequest => "PER_REQUEST",
            StrategyKind::Tiered => "TIERED",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = CalcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FIXED" => Ok(StrategyKind::Fixed),
            "PER_REQUEST" => Ok(StrategyKind::PerRequest),
            "TIERED" => Ok(StrategyKind::Tiered),
            other => Err(CalcError::UnknownStrategy(other.to_string())),
        }
    }
}

/// One band of a tiered schedule, as submitted or stored.
///
/// Prices stay decimal strings until validation parses them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingTier {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub tier_number: u32,
    pub min_tokens: i64,
    pub max_tokens: Option<i64>,
    pub input_per_million_tokens: String,
    pub output_per_million_tokens: String,
    pub cached_input_price: String,
}

/// A validated tier with parsed prices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceTier {
    pub tier_number: u32,
    pub min_tokens: i64,
    pub max_tokens: Option<i64>,
    pub input_per_million_tokens: Decimal,
    pub output_per_million_tokens: Decimal,
    pub cached_input_price: Decimal,
}

impl PriceTier {
    /// Whether `total_tokens` falls inside `[min_tokens, max_tokens)`
    pub fn contains(&self, total_tokens: i64) -> bool {
        total_tokens >= self.min_tokens && self.max_tokens.map_or(true, |max| total_tokens < max)
    }

    pub fn rates(&self) -> FixedPricing {
        FixedPricing {
            input_per_million_tokens: self.input_per_million_tokens,
            output_per_million_tokens: self.output_per_million_tokens,
            cached_input_price: Some(self.cached_input_price),
        }
    }
}

/// A non-empty, contiguous tier list sorted by tier number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierSchedule {
    tiers: Vec<PriceTier>,
}

impl TierSchedule {
    /// Only `validate_tier_set` builds schedules
    pub(crate) fn from_validated(tiers: Vec<PriceTier>) -> Self {
        Self { tiers }
    }

    pub fn tiers(&self) -> &[PriceTier] {
        &self.tiers
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Upper bound of the whole schedule, `None` when the last tier is open-ended
    pub fn upper_bound(&self) -> Option<i64> {
        self.tiers.last().and_then(|t| t.max_tokens)
    }
}

/// Per-million token prices for the fixed strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedPricing {
    pub input_per_million_tokens: Decimal,
    pub output_per_million_tokens: Decimal,
    /// Cached input tokens fall back to the input rate when absent
    pub cached_input_price: Option<Decimal>,
}

/// The active pricing shape of a vendor model
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PricingStrategy {
    Fixed(FixedPricing),
    PerRequest { price: Decimal },
    Tiered(TierSchedule),
}

impl PricingStrategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            PricingStrategy::Fixed(_) => StrategyKind::Fixed,
            PricingStrategy::PerRequest { .. } => StrategyKind::PerRequest,
            PricingStrategy::Tiered(_) => StrategyKind::Tiered,
        }
    }
}

/// Snapshot of one priced vendor model as the store holds it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VendorModel {
    pub id: i64,
    pub provider_id: i64,
    pub model_name: String,
    pub pricing_strategy: String,
    #[serde(default)]
    pub input_per_million_tokens: Option<String>,
    #[serde(default)]
    pub output_per_million_tokens: Option<String>,
    #[serde(default)]
    pub cached_input_price: Option<String>,
    #[serde(default)]
    pub per_request_price: Option<String>,
    pub currency: String,
    pub enabled: bool,
    pub weight: u32,
    #[serde(default)]
    pub tiers: Vec<PricingTier>,
}

impl VendorModel {
    pub fn strategy_kind(&self) -> Result<StrategyKind, CalcError> {
        self.pricing_strategy.parse()
    }

    /// Resolve the active strategy; fields of other strategies are ignored
    pub fn pricing(&self) -> Result<PricingStrategy, CalcError> {
        match self.strategy_kind()? {
            StrategyKind::Fixed => {
                let strategy = StrategyKind::Fixed.as_str();
                let input = required_price(
                    strategy,
                    PriceField::InputPerMillionTokens,
                    self.input_per_million_tokens.as_deref(),
                )?;
                let output = required_price(
                    strategy,
                    PriceField::OutputPerMillionTokens,
                    self.output_per_million_tokens.as_deref(),
                )?;
                let cached = self
                    .cached_input_price
                    .as_deref()
                    .map(|raw| stored_price(PriceField::CachedInputPrice, raw))
                    .transpose()?;

                Ok(PricingStrategy::Fixed(FixedPricing {
                    input_per_million_tokens: input,
                    output_per_million_tokens: output,
                    cached_input_price: cached,
                }))
            }
            StrategyKind::PerRequest => {
                let price = required_price(
                    StrategyKind::PerRequest.as_str(),
                    PriceField::PerRequestPrice,
                    self.per_request_price.as_deref(),
                )?;
                Ok(PricingStrategy::PerRequest { price })
            }
            StrategyKind::Tiered => {
                if self.tiers.is_empty() {
                    return Err(crate::error::LookupError::NoTierConfigured.into());
                }
                Ok(PricingStrategy::Tiered(validate_tier_set(&self.tiers)?))
            }
        }
    }
}

fn required_price(
    strategy: &'static str,
    field: PriceField,
    raw: Option<&str>,
) -> Result<Decimal, CalcError> {
    match raw {
        Some(raw) => stored_price(field, raw),
        None => Err(CalcError::MissingPriceField { strategy, field }),
    }
}

fn stored_price(field: PriceField, raw: &str) -> Result<Decimal, CalcError> {
    parse_price(raw).ok_or_else(|| CalcError::InvalidPrice {
        field,
        value: raw.to_string(),
    })
}

/// Parse a non-negative decimal price string
pub fn parse_price(raw: &str) -> Option<Decimal> {
    let value = Decimal::from_str(raw.trim()).ok()?;
    if value.is_sign_negative() && !value.is_zero() {
        None
    } else {
        Some(value)
    }
}

/// Token counts reported for one request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: i64,
    #[serde(default)]
    pub cached_tokens: i64,
    pub output_tokens: i64,
}

impl Usage {
    pub fn new(input_tokens: i64, cached_tokens: i64, output_tokens: i64) -> Self {
        Self {
            input_tokens,
            cached_tokens,
            output_tokens,
        }
    }
}

/// Result of pricing one usage sample
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostCalculation {
    pub input_tokens: i64,
    pub cached_tokens: i64,
    pub output_tokens: i64,
    pub input_cost: Decimal,
    pub output_cost: Decimal,
    pub total_cost: Decimal,
    pub currency: String,
    pub pricing_strategy: StrategyKind,
    /// Tier that priced a tiered calculation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier_number: Option<u32>,
}
