//! Clients for the external services: market data and LLM completions

pub mod chat;
pub mod yahoo;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::{CompletionError, MarketDataError};
use crate::types::{PriceHistory, TickerInfo};

pub use chat::ChatCompletionClient;
pub use yahoo::YahooClient;

/// Which slice of history to request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryRange {
    /// Free-text provider period (`1mo`, `1y`, `max`, ...), passed through uninterpreted
    Period(String),
    /// Inclusive calendar date range
    Between { start: NaiveDate, end: NaiveDate },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub range: HistoryRange,
    pub interval: String,
}

impl HistoryQuery {
    pub fn period(period: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            range: HistoryRange::Period(period.into()),
            interval: interval.into(),
        }
    }

    pub fn between(start: NaiveDate, end: NaiveDate, interval: impl Into<String>) -> Self {
        Self {
            range: HistoryRange::Between { start, end },
            interval: interval.into(),
        }
    }
}

/// Source of ticker fundamentals and OHLCV history
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn ticker_info(&self, symbol: &str) -> Result<TickerInfo, MarketDataError>;

    /// Rows must come back ascending with unique timestamps
    async fn history(
        &self,
        symbol: &str,
        query: &HistoryQuery,
    ) -> Result<PriceHistory, MarketDataError>;
}

/// A text-completion endpoint
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, CompletionError>;
}

/// Nominal bar length in seconds for a provider interval string. Unknown intervals count as daily.
pub fn interval_seconds(interval: &str) -> i64 {
    match interval {
        "1m" => 60,
        "2m" => 120,
        "5m" => 300,
        "15m" => 900,
        "30m" => 1_800,
        "60m" | "1h" => 3_600,
        "90m" => 5_400,
        "5d" => 5 * 86_400,
        "1wk" => 7 * 86_400,
        "1mo" => 30 * 86_400,
        "3mo" => 90 * 86_400,
        _ => 86_400,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_seconds() {
        assert_eq!(interval_seconds("1d"), 86_400);
        assert_eq!(interval_seconds("1h"), 3_600);
        assert_eq!(interval_seconds("60m"), 3_600);
        assert_eq!(interval_seconds("1wk"), 604_800);
        assert_eq!(interval_seconds("weird"), 86_400);
    }

    #[test]
    fn test_history_query_constructors() {
        let q = HistoryQuery::period("1mo", "1d");
        assert_eq!(q.range, HistoryRange::Period("1mo".to_string()));

        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 6, 30).unwrap();
        let q = HistoryQuery::between(start, end, "1d");
        assert_eq!(q.range, HistoryRange::Between { start, end });
        assert_eq!(q.interval, "1d");
    }
}
