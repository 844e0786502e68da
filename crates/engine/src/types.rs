//! Types shared by the market data client, the backtest engine and the agent loop

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::commission::CommissionConfig;

/// Opaque fundamentals for one symbol, exactly as the provider returned them
pub type TickerInfo = serde_json::Map<String, serde_json::Value>;

/// One raw history row from the provider. Missing values stay `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    /// Bar open time, unix seconds
    pub timestamp: i64,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<u64>,
}

/// Price history for one symbol, ascending by timestamp with no duplicate timestamps
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceHistory {
    pub symbol: String,
    pub currency: Option<String>,
    pub rows: Vec<HistoryRow>,
}

impl PriceHistory {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Sort rows ascending and drop duplicate timestamps (the later row wins)
    pub fn normalize(&mut self) {
        self.rows.sort_by_key(|r| r.timestamp);
        let mut deduped: Vec<HistoryRow> = Vec::with_capacity(self.rows.len());
        for row in self.rows.drain(..) {
            match deduped.last_mut() {
                Some(last) if last.timestamp == row.timestamp => *last = row,
                _ => deduped.push(row),
            }
        }
        self.rows = deduped;
    }

    /// Convert to engine bars, skipping rows with a missing or non-finite price.
    /// `bar_seconds` is the nominal bar length used for `close_time`.
    pub fn to_klines(&self, bar_seconds: i64) -> Vec<Kline> {
        self.rows
            .iter()
            .filter_map(|row| {
                let price = |v: Option<f64>| v.filter(|x| x.is_finite()).and_then(Decimal::from_f64);
                let open_time = row.timestamp * 1000;
                Some(Kline {
                    open_time,
                    open: price(row.open)?,
                    high: price(row.high)?,
                    low: price(row.low)?,
                    close: price(row.close)?,
                    volume: row.volume.map(Decimal::from).unwrap_or(Decimal::ZERO),
                    close_time: open_time + bar_seconds * 1000 - 1,
                })
            })
            .collect()
    }
}

/// Wire shape of a history row: the column names the frontend expects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "Open")]
    pub open: Option<f64>,
    #[serde(rename = "High")]
    pub high: Option<f64>,
    #[serde(rename = "Low")]
    pub low: Option<f64>,
    #[serde(rename = "Close")]
    pub close: Option<f64>,
    #[serde(rename = "Volume")]
    pub volume: Option<u64>,
}

impl From<&HistoryRow> for HistoryRecord {
    fn from(row: &HistoryRow) -> Self {
        let finite = |v: Option<f64>| v.filter(|x| x.is_finite());
        let date = Utc
            .timestamp_opt(row.timestamp, 0)
            .single()
            .map(|d: DateTime<Utc>| d.to_rfc3339())
            .unwrap_or_default();
        Self {
            date,
            open: finite(row.open),
            high: finite(row.high),
            low: finite(row.low),
            close: finite(row.close),
            volume: row.volume,
        }
    }
}

/// A single candlestick (OHLCV)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: i64,
}

impl Kline {
    pub fn close_f64(&self) -> f64 {
        self.close.to_f64().unwrap_or(0.0)
    }
}

/// Configuration for a single-symbol backtest run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub symbol: String,
    pub initial_capital: Decimal,
    /// Position size as percentage of equity (100 = all in)
    pub position_size_pct: Decimal,
    pub commission: CommissionConfig,
    /// Bars per year used to annualise the Sharpe ratio
    pub periods_per_year: f64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            symbol: "RELIANCE.NS".to_string(),
            initial_capital: Decimal::from(10000),
            position_size_pct: Decimal::from(100),
            commission: CommissionConfig::default(),
            periods_per_year: 252.0,
        }
    }
}

/// Side of a trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Signal,
    StopLoss,
    TakeProfit,
    EndOfData,
}

/// A single round-trip trade executed during backtest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestTrade {
    pub entry_time: i64,
    pub exit_time: i64,
    pub side: TradeSide,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub size: Decimal,
    /// Net of commission on both fills
    pub pnl: Decimal,
    pub pnl_pct: Decimal,
    pub exit_reason: ExitReason,
}

/// A point on the equity curve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub time: i64,
    pub equity: Decimal,
}

/// Result of a backtest run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub symbol: String,
    pub start_time: i64,
    pub end_time: i64,
    pub initial_capital: Decimal,
    pub final_equity: Decimal,
    pub total_pnl: Decimal,
    pub total_pnl_pct: Decimal,
    pub buy_hold_return_pct: Decimal,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub win_rate: Decimal,
    pub max_drawdown: Decimal,
    pub max_drawdown_pct: Decimal,
    pub sharpe_ratio: Decimal,
    pub profit_factor: Decimal,
    pub total_commission: Decimal,
    pub trades: Vec<BacktestTrade>,
    pub equity_curve: Vec<EquityPoint>,
}
