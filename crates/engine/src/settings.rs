//! Run configuration, built once from defaults + environment and threaded through every call

use chrono::{Days, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::warn;

use crate::error::ConfigError;

pub const DEFAULT_SYMBOLS: [&str; 5] = ["RELIANCE.NS", "TCS.NS", "INFY.NS", "HINDUNILVR.NS", "ITC.NS"];
pub const DEFAULT_STRATEGY: &str =
    "buy when MACD crosses above signal and price is above 50 EMA, sell when MACD crosses below signal";

/// Upper bound on generate/backtest iterations for one run
pub const MAX_ITERATIONS: u32 = 50;
/// Upper bound on the backtest window (about a century of daily bars)
pub const MAX_LOOKBACK_DAYS: i64 = 36_500;

pub const DEFAULT_LLM_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_LLM_MODEL: &str = "llama-3.3-70b-versatile";

/// Settings for one generator run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    pub symbols: Vec<String>,
    pub initial_cash: Decimal,
    pub max_iterations: u32,
    pub lookback_days: i64,
    pub interval: String,
    pub commission_rate: Decimal,
    pub min_bars: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            symbols: DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect(),
            initial_cash: Decimal::from(10_000),
            max_iterations: 4,
            lookback_days: 730,
            interval: "1d".to_string(),
            commission_rate: Decimal::new(1, 3),
            min_bars: 50,
        }
    }
}

impl AgentSettings {
    /// Defaults overridden by `STRATEGY_LAB_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Self::default();

        if let Some(raw) = lookup("STRATEGY_LAB_SYMBOLS") {
            let symbols = parse_symbol_list(&raw);
            if !symbols.is_empty() {
                settings.symbols = symbols;
            }
        }
        if let Some(v) = parse_var(&lookup, "STRATEGY_LAB_INITIAL_CASH") {
            settings.initial_cash = v;
        }
        if let Some(v) = parse_var(&lookup, "STRATEGY_LAB_MAX_ITERATIONS") {
            settings.max_iterations = v;
        }
        if let Some(v) = parse_var(&lookup, "STRATEGY_LAB_LOOKBACK_DAYS") {
            settings.lookback_days = v;
        }
        if let Some(v) = parse_var(&lookup, "STRATEGY_LAB_COMMISSION") {
            settings.commission_rate = v;
        }
        settings
    }

    /// Reject settings a run cannot use
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_LOOKBACK_DAYS).contains(&self.lookback_days) {
            return Err(out_of_range("lookback_days", self.lookback_days, 1, MAX_LOOKBACK_DAYS));
        }
        if self.max_iterations > MAX_ITERATIONS {
            return Err(out_of_range("max_iterations", self.max_iterations, 0, MAX_ITERATIONS));
        }
        if self.initial_cash <= Decimal::ZERO {
            return Err(ConfigError::OutOfRange {
                field: "initial_cash",
                value: self.initial_cash.to_string(),
                min: "0 (exclusive)".to_string(),
                max: "unbounded".to_string(),
            });
        }
        Ok(())
    }

    /// First day of the backtest window ending at `as_of`
    pub fn window_start(&self, as_of: NaiveDate) -> Result<NaiveDate, ConfigError> {
        u64::try_from(self.lookback_days)
            .ok()
            .filter(|&days| days > 0)
            .and_then(|days| as_of.checked_sub_days(Days::new(days)))
            .ok_or_else(|| ConfigError::DateWindow {
                days: self.lookback_days,
                as_of: as_of.to_string(),
            })
    }
}

fn out_of_range(
    field: &'static str,
    value: impl ToString,
    min: impl ToString,
    max: impl ToString,
) -> ConfigError {
    ConfigError::OutOfRange {
        field,
        value: value.to_string(),
        min: min.to_string(),
        max: max.to_string(),
    }
}

/// Split a comma-separated symbol list, upper-casing and dropping blanks
pub fn parse_symbol_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparseable setting");
            None
        }
    }
}

/// Completion endpoint settings
#[derive(Debug, Clone, PartialEq)]
pub struct LlmSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_LLM_BASE_URL.to_string(),
            model: DEFAULT_LLM_MODEL.to_string(),
            temperature: 0.15,
            max_tokens: 3000,
        }
    }
}

impl LlmSettings {
    /// `LLM_API_KEY` (or `GROQ_API_KEY`), `LLM_BASE_URL`, `LLM_MODEL`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();
        Self {
            api_key: non_empty("LLM_API_KEY").or_else(|| non_empty("GROQ_API_KEY")),
            base_url: non_empty("LLM_BASE_URL").unwrap_or(defaults.base_url),
            model: non_empty("LLM_MODEL").unwrap_or(defaults.model),
            ..defaults
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_agent_defaults() {
        let s = AgentSettings::default();
        assert_eq!(s.symbols.len(), 5);
        assert_eq!(s.symbols[0], "RELIANCE.NS");
        assert_eq!(s.initial_cash, dec!(10000));
        assert_eq!(s.max_iterations, 4);
        assert_eq!(s.lookback_days, 730);
        assert_eq!(s.commission_rate, dec!(0.001));
        assert_eq!(s.min_bars, 50);
    }

    #[test]
    fn test_agent_env_overrides() {
        let s = AgentSettings::from_lookup(lookup(&[
            ("STRATEGY_LAB_SYMBOLS", " aapl, msft ,,"),
            ("STRATEGY_LAB_INITIAL_CASH", "25000"),
            ("STRATEGY_LAB_MAX_ITERATIONS", "2"),
            ("STRATEGY_LAB_COMMISSION", "not-a-number"),
        ]));
        assert_eq!(s.symbols, vec!["AAPL", "MSFT"]);
        assert_eq!(s.initial_cash, dec!(25000));
        assert_eq!(s.max_iterations, 2);
        // bad value keeps the default
        assert_eq!(s.commission_rate, dec!(0.001));
    }

    #[test]
    fn test_validate_rejects_unusable_windows() {
        assert!(AgentSettings::default().validate().is_ok());

        for days in [0, -30, MAX_LOOKBACK_DAYS + 1, i64::MAX] {
            let s = AgentSettings {
                lookback_days: days,
                ..Default::default()
            };
            assert!(
                matches!(s.validate(), Err(ConfigError::OutOfRange { field: "lookback_days", .. })),
                "lookback {days} accepted"
            );
        }

        let s = AgentSettings {
            max_iterations: MAX_ITERATIONS + 1,
            ..Default::default()
        };
        assert!(s.validate().is_err());

        let s = AgentSettings {
            initial_cash: dec!(-5),
            ..Default::default()
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_window_start_never_panics() {
        let as_of = NaiveDate::from_ymd_opt(2024, 6, 30).unwrap();
        let s = AgentSettings {
            lookback_days: 30,
            ..Default::default()
        };
        assert_eq!(s.window_start(as_of).unwrap(), NaiveDate::from_ymd_opt(2024, 5, 31).unwrap());

        let env = AgentSettings::from_lookup(lookup(&[(
            "STRATEGY_LAB_LOOKBACK_DAYS",
            "9223372036854775807",
        )]));
        assert!(matches!(env.window_start(as_of), Err(ConfigError::DateWindow { .. })));

        let negative = AgentSettings {
            lookback_days: -10,
            ..Default::default()
        };
        assert!(negative.window_start(as_of).is_err());
    }

    #[test]
    fn test_llm_key_fallback() {
        let s = LlmSettings::from_lookup(lookup(&[("GROQ_API_KEY", "gsk_test")]));
        assert_eq!(s.api_key.as_deref(), Some("gsk_test"));
        assert_eq!(s.model, DEFAULT_LLM_MODEL);

        let s = LlmSettings::from_lookup(lookup(&[
            ("LLM_API_KEY", "primary"),
            ("GROQ_API_KEY", "secondary"),
            ("LLM_MODEL", "gpt-4o-mini"),
        ]));
        assert_eq!(s.api_key.as_deref(), Some("primary"));
        assert_eq!(s.model, "gpt-4o-mini");

        let s = LlmSettings::from_lookup(lookup(&[("LLM_API_KEY", "  ")]));
        assert!(!s.has_api_key());
    }
}
