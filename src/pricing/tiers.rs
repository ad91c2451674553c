use serde::{Deserialize, Serialize};

use crate::error::{CalcError, LookupError};
use crate::pricing::models::{PriceTier, Usage};

/// Token count used to pick a tier.
///
/// There is no implicit default at the engine level: callers choose the
/// basis explicitly, usually from `[pricing] token_basis` in the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenBasis {
    /// `input + output`; cached tokens are already part of input
    InputPlusOutput,
    /// `(input - cached) + output`
    UncachedInputPlusOutput,
    /// `input + cached + output`, for feeds that report cached tokens apart from input
    AllReported,
    /// A period total tracked by the caller, e.g. tokens used this billing month
    Cumulative(u64),
}

impl TokenBasis {
    /// Resolve the lookup total for one usage sample
    pub fn total_tokens(&self, usage: &Usage) -> Result<i64, CalcError> {
        let total = match self {
            TokenBasis::InputPlusOutput => usage.input_tokens.checked_add(usage.output_tokens),
            TokenBasis::UncachedInputPlusOutput => usage
                .input_tokens
                .checked_sub(usage.cached_tokens)
                .and_then(|uncached| uncached.checked_add(usage.output_tokens)),
            TokenBasis::AllReported => usage
                .input_tokens
                .checked_add(usage.cached_tokens)
                .and_then(|sum| sum.checked_add(usage.output_tokens)),
            TokenBasis::Cumulative(total) => i64::try_from(*total).ok(),
        };
        total.ok_or(CalcError::Overflow)
    }
}

/// Find the tier whose `[min_tokens, max_tokens)` interval holds `total_tokens`.
///
/// `tiers` must come from a validated schedule: sorted and contiguous.
pub fn select_tier(tiers: &[PriceTier], total_tokens: i64) -> Result<&PriceTier, LookupError> {
    if total_tokens < 0 {
        return Err(LookupError::InvalidUsage(total_tokens));
    }
    if tiers.is_empty() {
        return Err(LookupError::NoTierConfigured);
    }

    // number of tiers starting at or below the total
    let idx = tiers.partition_point(|t| t.min_tokens <= total_tokens);
    let Some(tier) = idx.checked_sub(1).map(|i| &tiers[i]) else {
        return Err(LookupError::BelowFirstTier {
            total_tokens,
            min_tokens: tiers[0].min_tokens,
        });
    };

    match tier.max_tokens {
        Some(max) if total_tokens >= max => Err(LookupError::AboveTopTier {
            total_tokens,
            max_tokens: max,
        }),
        _ => Ok(tier),
    }
}
