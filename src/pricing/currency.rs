use std::fmt;
use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::CurrencyError;
use crate::pricing::models::CostCalculation;

/// Decimal places shown for costs
pub const DISPLAY_SCALE: u32 = 6;

/// ISO-4217 style currency code, stored upper-case
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    pub fn new(code: &str) -> Result<Self, CurrencyError> {
        let trimmed = code.trim();
        if trimmed.len() != 3 || !trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(CurrencyError::InvalidCode(code.to_string()));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn usd() -> Self {
        Self("USD".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Currency {
    type Err = CurrencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Currency {
    type Error = CurrencyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Currency> for String {
    fn from(value: Currency) -> Self {
        value.0
    }
}

/// Round for display only; engine values are never rounded
pub fn round_for_display(amount: Decimal) -> Decimal {
    let mut rounded =
        amount.round_dp_with_strategy(DISPLAY_SCALE, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(DISPLAY_SCALE);
    rounded
}

/// Format a cost as `0.025000 USD`
pub fn format_cost(amount: Decimal, currency: &Currency) -> String {
    format!("{} {}", round_for_display(amount), currency)
}

/// Running totals over calculations that share one currency
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostTotals {
    pub currency: Option<String>,
    pub requests: u64,
    pub input_tokens: i64,
    pub cached_tokens: i64,
    pub output_tokens: i64,
    pub input_cost: Decimal,
    pub output_cost: Decimal,
    pub total_cost: Decimal,
}

impl Default for CostTotals {
    fn default() -> Self {
        Self {
            currency: None,
            requests: 0,
            input_tokens: 0,
            cached_tokens: 0,
            output_tokens: 0,
            input_cost: Decimal::ZERO,
            output_cost: Decimal::ZERO,
            total_cost: Decimal::ZERO,
        }
    }
}

impl CostTotals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one calculation; the first one fixes the currency.
    ///
    /// On error the totals are left unchanged.
    pub fn add(&mut self, calc: &CostCalculation) -> Result<(), CurrencyError> {
        if let Some(expected) = &self.currency {
            if *expected != calc.currency {
                return Err(CurrencyError::Mismatch {
                    expected: expected.clone(),
                    found: calc.currency.clone(),
                });
            }
        }

        let requests = self.requests.checked_add(1);
        let input_tokens = self.input_tokens.checked_add(calc.input_tokens);
        let cached_tokens = self.cached_tokens.checked_add(calc.cached_tokens);
        let output_tokens = self.output_tokens.checked_add(calc.output_tokens);
        let input_cost = self.input_cost.checked_add(calc.input_cost);
        let output_cost = self.output_cost.checked_add(calc.output_cost);
        let total_cost = self.total_cost.checked_add(calc.total_cost);

        let (
            Some(requests),
            Some(input_tokens),
            Some(cached_tokens),
            Some(output_tokens),
            Some(input_cost),
            Some(output_cost),
            Some(total_cost),
        ) = (
            requests,
            input_tokens,
            cached_tokens,
            output_tokens,
            input_cost,
            output_cost,
            total_cost,
        )
        else {
            return Err(CurrencyError::Overflow);
        };

        if self.currency.is_none() {
            self.currency = Some(calc.currency.clone());
        }
        self.requests = requests;
        self.input_tokens = input_tokens;
        self.cached_tokens = cached_tokens;
        self.output_tokens = output_tokens;
        self.input_cost = input_cost;
        self.output_cost = output_cost;
        self.total_cost = total_cost;
        Ok(())
    }

    pub fn from_calculations<'a, I>(calcs: I) -> Result<Self, CurrencyError>
    where
        I: IntoIterator<Item = &'a CostCalculation>,
    {
        let mut totals = Self::new();
        for calc in calcs {
            totals.add(calc)?;
        }
        Ok(totals)
    }
}
