//! Market data proxy operations: ticker info, single and multi-ticker history

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use tracing::{debug, warn};

use crate::api::{HistoryQuery, MarketDataProvider};
use crate::error::MarketDataError;
use crate::types::{HistoryRecord, TickerInfo};

pub const DEFAULT_SINGLE_PERIOD: &str = "max";
pub const DEFAULT_MULTI_PERIOD: &str = "1mo";
pub const DEFAULT_INTERVAL: &str = "1d";
pub const FALLBACK_CURRENCY: &str = "USD";

/// One ticker's entry in a multi-ticker history response
#[derive(Debug, Clone, Serialize)]
pub struct TickerHistory {
    pub data: Vec<HistoryRecord>,
    pub currency: String,
}

pub async fn ticker_info(
    provider: &dyn MarketDataProvider,
    ticker: &str,
) -> Result<TickerInfo, MarketDataError> {
    provider.ticker_info(ticker).await
}

/// History for one ticker. An empty result is reported as `NotFound`.
pub async fn single_history(
    provider: &dyn MarketDataProvider,
    ticker: &str,
    period: Option<&str>,
    interval: Option<&str>,
) -> Result<Vec<HistoryRecord>, MarketDataError> {
    let query = HistoryQuery::period(
        period.unwrap_or(DEFAULT_SINGLE_PERIOD),
        interval.unwrap_or(DEFAULT_INTERVAL),
    );
    let mut history = provider.history(ticker, &query).await?;
    history.normalize();

    if history.is_empty() {
        return Err(MarketDataError::NotFound {
            symbol: ticker.to_string(),
        });
    }
    Ok(history.rows.iter().map(HistoryRecord::from).collect())
}

/// History for several tickers, fetched one after another.
/// Tickers that fail or come back empty are logged and left out of the result.
pub async fn multi_history(
    provider: &dyn MarketDataProvider,
    tickers: &[String],
    period: Option<&str>,
    interval: Option<&str>,
) -> BTreeMap<String, TickerHistory> {
    let query = HistoryQuery::period(
        period.unwrap_or(DEFAULT_MULTI_PERIOD),
        interval.unwrap_or(DEFAULT_INTERVAL),
    );
    let mut out = BTreeMap::new();

    for ticker in tickers {
        let mut history = match provider.history(ticker, &query).await {
            Ok(h) => h,
            Err(e) => {
                warn!(ticker = %ticker, error = %e, "Skipping ticker, history fetch failed");
                continue;
            }
        };
        history.normalize();
        if history.is_empty() {
            warn!(ticker = %ticker, "Skipping ticker, no history rows");
            continue;
        }

        let currency = match history.currency.take() {
            Some(c) => c,
            None => info_currency(provider, ticker).await,
        };
        debug!(ticker = %ticker, rows = history.rows.len(), currency = %currency, "Collected history");

        out.insert(
            ticker.clone(),
            TickerHistory {
                data: history.rows.iter().map(HistoryRecord::from).collect(),
                currency,
            },
        );
    }
    out
}

async fn info_currency(provider: &dyn MarketDataProvider, ticker: &str) -> String {
    match provider.ticker_info(ticker).await {
        Ok(info) => info
            .get("currency")
            .and_then(|v| v.as_str())
            .unwrap_or(FALLBACK_CURRENCY)
            .to_string(),
        Err(e) => {
            debug!(ticker, error = %e, "Currency lookup failed");
            FALLBACK_CURRENCY.to_string()
        }
    }
}

/// Comma-split a `tickers` parameter: trimmed, blanks dropped, first occurrence kept
pub fn split_tickers(raw: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.to_string()))
        .map(str::to_string)
        .collect()
}
