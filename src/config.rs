use serde::{Deserialize, Serialize};

use crate::pricing::{Currency, TokenBasis};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    pub pricing: PricingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// SQLite storage for vendor models and tiers
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// SQLite database path, or `:memory:` (default: "./data/pricing.db")
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Connection pool size (default: 5)
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseConfig {
    pub fn is_in_memory(&self) -> bool {
        self.path == ":memory:"
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PricingConfig {
    /// Token count used for tier lookup. Required: there is no safe default.
    /// `cumulative` is rejected here: a period total is per request, see
    /// `PricingService::calculate_with_basis`.
    pub token_basis: TokenBasis,

    /// Currency for vendor models created without one (default: USD)
    #[serde(default = "Currency::usd")]
    pub default_currency: Currency,

    /// Pricing catalog imported at startup, if any
    #[serde(default)]
    pub catalog_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset (default: "info")
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_database_path() -> String {
    "./data/pricing.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Load configuration from `pricing.toml` (or `path`) and `GATEWAY_PRICING__*` variables
pub fn load_config(path: Option<&str>) -> anyhow::Result<Config> {
    let config = config::Config::builder()
        .add_source(config::File::with_name(path.unwrap_or("pricing")))
        .add_source(config::Environment::with_prefix("GATEWAY_PRICING").separator("__"))
        .build()?;

    let cfg: Config = config.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

fn validate_config(cfg: &Config) -> anyhow::Result<()> {
    if cfg.database.path.trim().is_empty() {
        anyhow::bail!("database.path cannot be empty");
    }

    if cfg.database.max_connections < 1 {
        anyhow::bail!("database.max_connections must be >= 1");
    }

    if !LOG_LEVELS.contains(&cfg.logging.level.to_ascii_lowercase().as_str()) {
        anyhow::bail!(
            "logging.level '{}' must be one of {}",
            cfg.logging.level,
            LOG_LEVELS.join(", ")
        );
    }

    if let TokenBasis::Cumulative(_) = cfg.pricing.token_basis {
        anyhow::bail!(
            "pricing.token_basis cannot be cumulative; pass period totals per request instead"
        );
    }

    if let Some(catalog) = &cfg.pricing.catalog_path {
        if catalog.trim().is_empty() {
            anyhow::bail!("pricing.catalog_path cannot be empty when set");
        }
    }

    Ok(())
}
