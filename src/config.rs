//! Process configuration.
//!
//! Everything comes from environment variables with sensible defaults;
//! only the OpenRouter key is required. Parsed once at startup and passed
//! down by value.

use std::time::Duration;

use crate::ledger::{BudgetConfig, BudgetPeriod, BudgetPolicy};
use crate::orchestrator::RetryPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub openrouter_api_key: String,
    /// Path to the SQLite database; `:memory:` for an ephemeral run.
    pub db_path: String,
    /// Webhook the approval gateway publishes to, if any.
    pub publish_url: Option<String>,
    pub publish_token: Option<String>,
    pub budget: BudgetConfig,
    pub default_max_refinements: u32,
    pub retry: RetryPolicy,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any name -> value source. Tests feed a map.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let openrouter_api_key = get("OPENROUTER_API_KEY")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("OPENROUTER_API_KEY"))?;

        let budget = BudgetConfig {
            threshold_micros: parse_or(&get, "BUDGET_THRESHOLD_MICROS", 50_000_000)?,
            period: match get("BUDGET_PERIOD").as_deref() {
                None | Some("month") => BudgetPeriod::Month,
                Some("day") => BudgetPeriod::Day,
                Some("all_time") => BudgetPeriod::AllTime,
                Some(other) => {
                    return Err(ConfigError::Invalid {
                        name: "BUDGET_PERIOD",
                        value: other.to_string(),
                    })
                }
            },
            policy: match get("BUDGET_POLICY").as_deref() {
                None | Some("soft_warn") => BudgetPolicy::SoftWarn,
                Some("hard_stop") => BudgetPolicy::HardStop,
                Some(other) => {
                    return Err(ConfigError::Invalid {
                        name: "BUDGET_POLICY",
                        value: other.to_string(),
                    })
                }
            },
        };

        let retry = RetryPolicy {
            max_retries: parse_or(&get, "PHASE_MAX_RETRIES", 2)?,
            base_delay: Duration::from_millis(parse_or(&get, "RETRY_BASE_DELAY_MS", 500)?),
            phase_deadline: Duration::from_secs(parse_or(&get, "PHASE_DEADLINE_SECS", 120)?),
        };

        Ok(Self {
            host: get("HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_or(&get, "PORT", 8080)?,
            openrouter_api_key,
            db_path: get("DB_PATH").unwrap_or_else(|| "draftworks.db".to_string()),
            publish_url: get("PUBLISH_URL").filter(|v| !v.trim().is_empty()),
            publish_token: get("PUBLISH_TOKEN").filter(|v| !v.trim().is_empty()),
            budget,
            default_max_refinements: parse_or(&get, "MAX_REFINEMENTS", 2)?,
            retry,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            name,
            value: raw,
        }),
    }
}
