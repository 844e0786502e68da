//! Yahoo Finance public API client (chart + quoteSummary endpoints, no authentication)

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{HistoryQuery, HistoryRange, MarketDataProvider};
use crate::error::MarketDataError;
use crate::types::{HistoryRow, PriceHistory, TickerInfo};

const DEFAULT_BASE_URL: &str = "https://query1.finance.yahoo.com";
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";
const SUMMARY_MODULES: &str =
    "price,summaryDetail,assetProfile,defaultKeyStatistics,financialData";

/// `range` values the chart endpoint accepts
const VALID_RANGES: [&str; 11] = [
    "1d", "5d", "1mo", "3mo", "6mo", "1y", "2y", "5y", "10y", "ytd", "max",
];
/// `interval` values the chart endpoint accepts
const VALID_INTERVALS: [&str; 13] = [
    "1m", "2m", "5m", "15m", "30m", "60m", "90m", "1h", "1d", "5d", "1wk", "1mo", "3mo",
];

/// Yahoo Finance market data client
#[derive(Clone)]
pub struct YahooClient {
    client: Client,
    base_url: String,
}

// ---------------------------------------------------------------------------
// Chart endpoint payload
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartBody,
}

#[derive(Debug, Deserialize)]
struct ChartBody {
    result: Option<Vec<ChartResult>>,
    error: Option<YahooError>,
}

#[derive(Debug, Deserialize)]
struct YahooError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    meta: ChartMeta,
    timestamp: Option<Vec<i64>>,
    indicators: ChartIndicators,
}

#[derive(Debug, Default, Deserialize)]
struct ChartMeta {
    currency: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChartIndicators {
    #[serde(default)]
    quote: Vec<ChartQuote>,
}

#[derive(Debug, Default, Deserialize)]
struct ChartQuote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

// ---------------------------------------------------------------------------
// quoteSummary endpoint payload
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummaryResponse {
    quote_summary: SummaryBody,
}

#[derive(Debug, Deserialize)]
struct SummaryBody {
    result: Option<Vec<serde_json::Map<String, Value>>>,
    error: Option<YahooError>,
}

impl Default for YahooClient {
    fn default() -> Self {
        Self::new()
    }
}

impl YahooClient {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Base URL plus one percent-encoded path segment per entry of `segments`
    fn endpoint(&self, segments: &[&str]) -> Result<Url, MarketDataError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| MarketDataError::InvalidRequest(format!("bad base URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| MarketDataError::InvalidRequest("base URL cannot take a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn chart_url(&self, symbol: &str, query: &HistoryQuery) -> Result<Url, MarketDataError> {
        check_symbol(symbol)?;
        check_allowed("interval", &query.interval, &VALID_INTERVALS)?;

        let mut url = self.endpoint(&["v8", "finance", "chart", symbol])?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("interval", &query.interval)
                .append_pair("includePrePost", "false");
            match &query.range {
                HistoryRange::Period(period) => {
                    check_allowed("period", period, &VALID_RANGES)?;
                    pairs.append_pair("range", period);
                }
                HistoryRange::Between { start, end } => {
                    let start_ts = start.and_time(chrono::NaiveTime::MIN).and_utc().timestamp();
                    let end_ts = end
                        .succ_opt()
                        .unwrap_or(*end)
                        .and_time(chrono::NaiveTime::MIN)
                        .and_utc()
                        .timestamp();
                    pairs
                        .append_pair("period1", &start_ts.to_string())
                        .append_pair("period2", &end_ts.to_string());
                }
            }
        }
        Ok(url)
    }

    fn summary_url(&self, symbol: &str) -> Result<Url, MarketDataError> {
        check_symbol(symbol)?;
        let mut url = self.endpoint(&["v10", "finance", "quoteSummary", symbol])?;
        url.query_pairs_mut().append_pair("modules", SUMMARY_MODULES);
        Ok(url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        symbol: &str,
        url: Url,
    ) -> Result<T, MarketDataError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();

        // Yahoo answers unknown symbols with 404 and a JSON error body
        if status == StatusCode::NOT_FOUND {
            return Err(MarketDataError::NotFound {
                symbol: symbol.to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MarketDataError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| MarketDataError::Decode(e.to_string()))
    }
}

#[async_trait]
impl MarketDataProvider for YahooClient {
    async fn ticker_info(&self, symbol: &str) -> Result<TickerInfo, MarketDataError> {
        let url = self.summary_url(symbol)?;
        debug!(symbol, "Fetching quote summary from Yahoo");

        let payload: SummaryResponse = self.get_json(symbol, url).await?;
        parse_summary(symbol, payload)
    }

    async fn history(
        &self,
        symbol: &str,
        query: &HistoryQuery,
    ) -> Result<PriceHistory, MarketDataError> {
        let url = self.chart_url(symbol, query)?;
        debug!(symbol, interval = %query.interval, "Fetching chart from Yahoo");

        let payload: ChartResponse = self.get_json(symbol, url).await?;
        let history = parse_chart(symbol, payload)?;

        debug!(symbol, rows = history.rows.len(), "Fetched chart");
        Ok(history)
    }
}

/// Yahoo symbols are letters, digits and `.-^=_` (e.g. `RELIANCE.NS`, `^GSPC`, `EURUSD=X`)
fn check_symbol(symbol: &str) -> Result<(), MarketDataError> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '^' | '=' | '_');
    if symbol.is_empty()
        || symbol.len() > 32
        || !symbol.chars().all(allowed)
        || !symbol.chars().any(|c| c.is_ascii_alphanumeric())
    {
        return Err(MarketDataError::InvalidRequest(format!("invalid symbol '{symbol}'")));
    }
    Ok(())
}

fn check_allowed(name: &str, value: &str, allowed: &[&str]) -> Result<(), MarketDataError> {
    if allowed.contains(&value) {
        Ok(())
    } else {
        Err(MarketDataError::InvalidRequest(format!(
            "unsupported {name} '{value}' (expected one of {})",
            allowed.join(", ")
        )))
    }
}

fn parse_chart(symbol: &str, payload: ChartResponse) -> Result<PriceHistory, MarketDataError> {
    if let Some(err) = payload.chart.error {
        return Err(yahoo_error(symbol, err));
    }

    let Some(result) = payload.chart.result.and_then(|r| r.into_iter().next()) else {
        return Ok(PriceHistory {
            symbol: symbol.to_string(),
            ..Default::default()
        });
    };

    let timestamps = result.timestamp.unwrap_or_default();
    let quote = result.indicators.quote.into_iter().next().unwrap_or_default();
    let at = |v: &Vec<Option<f64>>, i: usize| v.get(i).copied().flatten();

    let rows = timestamps
        .iter()
        .enumerate()
        .map(|(i, &ts)| HistoryRow {
            timestamp: ts,
            open: at(&quote.open, i),
            high: at(&quote.high, i),
            low: at(&quote.low, i),
            close: at(&quote.close, i),
            volume: at(&quote.volume, i)
                .filter(|v| v.is_finite() && *v >= 0.0)
                .map(|v| v.round() as u64),
        })
        .collect();

    let mut history = PriceHistory {
        symbol: symbol.to_string(),
        currency: result.meta.currency,
        rows,
    };
    history.normalize();
    Ok(history)
}

fn parse_summary(symbol: &str, payload: SummaryResponse) -> Result<TickerInfo, MarketDataError> {
    if let Some(err) = payload.quote_summary.error {
        return Err(yahoo_error(symbol, err));
    }
    let modules = payload
        .quote_summary
        .result
        .and_then(|r| r.into_iter().next())
        .ok_or_else(|| MarketDataError::NotFound {
            symbol: symbol.to_string(),
        })?;

    Ok(flatten_summary(modules))
}

/// Merge quoteSummary modules into one flat field map.
/// `{ "raw": 1.2, "fmt": "1.20" }` objects collapse to their raw value; the first module to
/// define a field wins.
fn flatten_summary(modules: serde_json::Map<String, Value>) -> TickerInfo {
    let mut info = TickerInfo::new();
    for (_, module) in modules {
        let Value::Object(fields) = module else {
            continue;
        };
        for (key, value) in fields {
            let value = match value {
                Value::Object(mut obj) if obj.contains_key("raw") => {
                    obj.remove("raw").unwrap_or(Value::Null)
                }
                Value::Object(obj) if obj.is_empty() => continue,
                other => other,
            };
            info.entry(key).or_insert(value);
        }
    }
    info
}

fn yahoo_error(symbol: &str, err: YahooError) -> MarketDataError {
    if err.code.eq_ignore_ascii_case("Not Found") {
        MarketDataError::NotFound {
            symbol: symbol.to_string(),
        }
    } else {
        MarketDataError::Upstream {
            status: 200,
            body: format!("{}: {}", err.code, err.description),
        }
    }
}
