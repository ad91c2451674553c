use std::fmt;

use thiserror::Error;

/// Price columns a vendor model or tier can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceField {
    InputPerMillionTokens,
    OutputPerMillionTokens,
    CachedInputPrice,
    PerRequestPrice,
}

impl PriceField {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceField::InputPerMillionTokens => "inputPerMillionTokens",
            PriceField::OutputPerMillionTokens => "outputPerMillionTokens",
            PriceField::CachedInputPrice => "cachedInputPrice",
            PriceField::PerRequestPrice => "perRequestPrice",
        }
    }
}

impl fmt::Display for PriceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tier configuration errors, raised by `validate_tier_set`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Tier set is empty")]
    EmptyTierSet,

    #[error("Tier numbers must be exactly 1..={expected}, got {found:?}")]
    TierSequence { expected: usize, found: Vec<u32> },

    #[error("Tier {tier} starts at {min_tokens}, which does not exceed the previous tier's start {previous_min}")]
    TierOverlap {
        tier: u32,
        min_tokens: i64,
        previous_min: i64,
    },

    #[error("Tier {tier} ends at {max_tokens} but tier {next_tier} starts at {next_min}")]
    TierGap {
        tier: u32,
        max_tokens: i64,
        next_tier: u32,
        next_min: i64,
    },

    #[error("Tier {tier} has an invalid upper bound: {reason}")]
    TierBounds { tier: u32, reason: &'static str },

    #[error("First tier must start at 0 tokens, got {min_tokens}")]
    TierStart { min_tokens: i64 },

    #[error("Tier {tier} has invalid {field}: {value:?}")]
    InvalidPrice {
        tier: u32,
        field: PriceField,
        value: String,
    },
}

/// Tier lookup errors, raised by `select_tier`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("Invalid usage: token count {0} is negative")]
    InvalidUsage(i64),

    #[error("No pricing tier configured")]
    NoTierConfigured,

    #[error("Token count {total_tokens} is below the first tier's lower bound {min_tokens}")]
    BelowFirstTier { total_tokens: i64, min_tokens: i64 },

    #[error("Token count {total_tokens} is beyond the last tier's upper bound {max_tokens}")]
    AboveTopTier { total_tokens: i64, max_tokens: i64 },
}

/// Cost calculation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalcError {
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    #[error("Unknown pricing strategy: {0}")]
    UnknownStrategy(String),

    #[error("{strategy} pricing requires {field}")]
    MissingPriceField {
        strategy: &'static str,
        field: PriceField,
    },

    #[error("Stored {field} is not a non-negative decimal: {value:?}")]
    InvalidPrice { field: PriceField, value: String },

    #[error("Stored tier set is invalid: {0}")]
    InvalidTierSet(#[from] ValidationError),

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error("Cost arithmetic overflowed")]
    Overflow,
}

/// Currency code and consistency errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CurrencyError {
    #[error("Invalid currency code: {0:?}")]
    InvalidCode(String),

    #[error("Currency mismatch: expected {expected}, found {found}")]
    Mismatch { expected: String, found: String },

    #[error("Cost totals overflowed")]
    Overflow,
}

/// Errors surfaced by the pricing service and catalog import
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Vendor model not found: {0}")]
    NotFound(i64),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Calculation error: {0}")]
    Calculation(#[from] CalcError),

    #[error("Currency error: {0}")]
    Currency(#[from] CurrencyError),

    #[error("Invalid {field}: {value:?} is not a non-negative decimal")]
    InvalidPrice { field: PriceField, value: String },

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl AppError {
    /// Stable machine-readable name, used as the `error.type` log field
    pub fn type_name(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::Validation(_) => "validation_error",
            AppError::Calculation(_) => "calculation_error",
            AppError::Currency(_) => "currency_error",
            AppError::InvalidPrice { .. } => "invalid_price",
            AppError::Catalog(_) => "catalog_error",
            AppError::Database(_) => "database_error",
        }
    }

    /// Configuration and usage errors are fixable by the caller; database errors are not
    pub fn is_client_error(&self) -> bool {
        !matches!(self, AppError::Database(_))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Catalog(format!("JSON error: {}", err))
    }
}
