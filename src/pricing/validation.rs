use tracing::debug;

use crate::error::{PriceField, ValidationError};
use crate::pricing::models::{parse_price, PriceTier, PricingTier, TierSchedule};

/// Validate a tier set and build a sorted schedule from it.
///
/// Checks run in a fixed order and the first violation is returned:
/// sequence, overlap, gaps and open bounds, start at zero, prices.
pub fn validate_tier_set(tiers: &[PricingTier]) -> Result<TierSchedule, ValidationError> {
    if tiers.is_empty() {
        return Err(ValidationError::EmptyTierSet);
    }

    // 1. tier numbers are exactly 1..=N
    let mut numbers: Vec<u32> = tiers.iter().map(|t| t.tier_number).collect();
    numbers.sort_unstable();
    let contiguous = numbers
        .iter()
        .enumerate()
        .all(|(i, n)| *n as usize == i + 1);
    if !contiguous {
        return Err(ValidationError::TierSequence {
            expected: tiers.len(),
            found: numbers,
        });
    }

    let mut sorted: Vec<&PricingTier> = tiers.iter().collect();
    sorted.sort_by_key(|t| t.tier_number);

    // 2. starts strictly increasing
    for pair in sorted.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        if next.min_tokens <= prev.min_tokens {
            return Err(ValidationError::TierOverlap {
                tier: next.tier_number,
                min_tokens: next.min_tokens,
                previous_min: prev.min_tokens,
            });
        }
    }

    // 3. every non-last tier ends where the next one starts
    for pair in sorted.windows(2) {
        let (tier, next) = (pair[0], pair[1]);
        match tier.max_tokens {
            None => {
                return Err(ValidationError::TierBounds {
                    tier: tier.tier_number,
                    reason: "only the last tier may be open-ended",
                });
            }
            Some(max) if max != next.min_tokens => {
                return Err(ValidationError::TierGap {
                    tier: tier.tier_number,
                    max_tokens: max,
                    next_tier: next.tier_number,
                    next_min: next.min_tokens,
                });
            }
            Some(_) => {}
        }
    }

    // 4. a closed last tier still needs a non-empty interval
    let last = sorted[sorted.len() - 1];
    if let Some(max) = last.max_tokens {
        if max <= last.min_tokens {
            return Err(ValidationError::TierBounds {
                tier: last.tier_number,
                reason: "maxTokens must exceed minTokens",
            });
        }
    }

    // 5. first tier starts at zero
    let first = sorted[0];
    if first.min_tokens != 0 {
        return Err(ValidationError::TierStart {
            min_tokens: first.min_tokens,
        });
    }

    // 6. prices parse as non-negative decimals
    let mut schedule = Vec::with_capacity(sorted.len());
    for tier in sorted {
        schedule.push(PriceTier {
            tier_number: tier.tier_number,
            min_tokens: tier.min_tokens,
            max_tokens: tier.max_tokens,
            input_per_million_tokens: tier_price(
                tier,
                PriceField::InputPerMillionTokens,
                &tier.input_per_million_tokens,
            )?,
            output_per_million_tokens: tier_price(
                tier,
                PriceField::OutputPerMillionTokens,
                &tier.output_per_million_tokens,
            )?,
            cached_input_price: tier_price(
                tier,
                PriceField::CachedInputPrice,
                &tier.cached_input_price,
            )?,
        });
    }

    debug!(tiers = schedule.len(), "Tier set validated");
    Ok(TierSchedule::from_validated(schedule))
}

fn tier_price(
    tier: &PricingTier,
    field: PriceField,
    raw: &str,
) -> Result<rust_decimal::Decimal, ValidationError> {
    parse_price(raw).ok_or_else(|| ValidationError::InvalidPrice {
        tier: tier.tier_number,
        field,
        value: raw.to_string(),
    })
}

/// Editable tier list for in-progress changes.
///
/// Tiers are addressed by position; tier numbers follow positions and are
/// rewritten after every structural edit. Persisted ids are dropped on load
/// and only assigned again by the store.
#[derive(Debug, Clone, Default)]
pub struct TierDraftSet {
    drafts: Vec<PricingTier>,
}

impl TierDraftSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an edit from stored tiers, ordered by tier number
    pub fn from_tiers(mut tiers: Vec<PricingTier>) -> Self {
        tiers.sort_by_key(|t| t.tier_number);
        for tier in &mut tiers {
            tier.id = None;
        }
        let mut set = Self { drafts: tiers };
        set.renumber();
        set
    }

    pub fn len(&self) -> usize {
        self.drafts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drafts.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<&PricingTier> {
        self.drafts.get(position)
    }

    pub fn get_mut(&mut self, position: usize) -> Option<&mut PricingTier> {
        self.drafts.get_mut(position)
    }

    pub fn push(&mut self, tier: PricingTier) -> usize {
        self.drafts.push(tier);
        self.renumber();
        self.drafts.len() - 1
    }

    /// Insert before `position`; positions past the end append
    pub fn insert(&mut self, position: usize, tier: PricingTier) -> usize {
        let position = position.min(self.drafts.len());
        self.drafts.insert(position, tier);
        self.renumber();
        position
    }

    pub fn remove(&mut self, position: usize) -> Option<PricingTier> {
        if position >= self.drafts.len() {
            return None;
        }
        let removed = self.drafts.remove(position);
        self.renumber();
        Some(removed)
    }

    /// Close every non-last tier at the next tier's start
    pub fn relink(&mut self) {
        let starts: Vec<i64> = self.drafts.iter().skip(1).map(|t| t.min_tokens).collect();
        for (tier, next_min) in self.drafts.iter_mut().zip(starts) {
            tier.max_tokens = Some(next_min);
        }
    }

    /// Validate the drafts as they stand
    pub fn commit(&self) -> Result<TierSchedule, ValidationError> {
        validate_tier_set(&self.drafts)
    }

    pub fn into_tiers(self) -> Vec<PricingTier> {
        self.drafts
    }

    fn renumber(&mut self) {
        for (i, tier) in self.drafts.iter_mut().enumerate() {
            tier.tier_number = i as u32 + 1;
        }
    }
}
