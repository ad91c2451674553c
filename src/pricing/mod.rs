pub mod calculator;
pub mod currency;
pub mod loader;
pub mod models;
pub mod service;
pub mod tiers;
pub mod validation;

pub use calculator::{calculate_cost, calculate_with_strategy, CostCalculator};
pub use currency::{format_cost, round_for_display, CostTotals, Currency};
pub use loader::{calculate_hash, parse_catalog_json, CatalogImporter, ImportOutcome, PricingCatalog};
pub use models::{
    CostCalculation, FixedPricing, PriceTier, PricingStrategy, PricingTier, StrategyKind,
    TierSchedule, Usage, VendorModel,
};
pub use service::{NewVendorModel, PriceUpdate, PricingService};
pub use tiers::{select_tier, TokenBasis};
pub use validation::{validate_tier_set, TierDraftSet};
