//! Per-symbol backtests over a date window, and the sequential universe run

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::api::{interval_seconds, HistoryQuery, MarketDataProvider};
use crate::commission::CommissionConfig;
use crate::engine::BacktestEngine;
use crate::error::BacktestError;
use crate::settings::AgentSettings;
use crate::strategy::CompiledStrategy;
use crate::types::{BacktestConfig, BacktestResult, EquityPoint};

const ERROR_MESSAGE_LIMIT: usize = 100;

/// Fixed-shape metrics for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestRecord {
    pub symbol: String,
    pub strategy_return_pct: Decimal,
    pub buy_hold_return_pct: Decimal,
    pub sharpe: Decimal,
    pub win_rate_pct: Decimal,
    /// Reported negative, so the worst drawdown is the minimum
    pub max_drawdown_pct: Decimal,
    pub trades: u32,
    pub start_balance: Decimal,
    pub end_balance: Decimal,
    pub pnl: Decimal,
}

impl BacktestRecord {
    pub fn from_result(result: &BacktestResult) -> Self {
        Self {
            symbol: result.symbol.clone(),
            strategy_return_pct: result.total_pnl_pct.round_dp(2),
            buy_hold_return_pct: result.buy_hold_return_pct.round_dp(2),
            sharpe: result.sharpe_ratio.round_dp(2),
            win_rate_pct: result.win_rate.round_dp(1),
            max_drawdown_pct: -result.max_drawdown_pct.round_dp(2),
            trades: result.total_trades,
            start_balance: result.initial_capital,
            end_balance: result.final_equity.round_dp(2),
            pnl: result.total_pnl.round_dp(2),
        }
    }

    pub fn is_profitable(&self) -> bool {
        self.pnl > Decimal::ZERO
    }
}

/// Outcome of running one strategy across the symbol universe
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UniverseRun {
    pub records: Vec<BacktestRecord>,
    pub equity_curves: BTreeMap<String, Vec<EquityPoint>>,
    /// `"SYMBOL: message"` per failed symbol, message capped at 100 characters
    pub errors: Vec<String>,
}

/// Backtest one symbol over `[as_of - lookback_days, as_of]`
pub async fn run_symbol(
    provider: &dyn MarketDataProvider,
    strategy: &CompiledStrategy,
    settings: &AgentSettings,
    symbol: &str,
    as_of: NaiveDate,
) -> Result<BacktestResult, BacktestError> {
    let start = settings.window_start(as_of)?;
    let query = HistoryQuery::between(start, as_of, settings.interval.clone());

    let history = provider.history(symbol, &query).await?;
    if history.is_empty() {
        return Err(BacktestError::NoData {
            symbol: symbol.to_string(),
        });
    }

    let klines = history.to_klines(interval_seconds(&settings.interval));
    if klines.len() < settings.min_bars {
        return Err(BacktestError::InsufficientData {
            symbol: symbol.to_string(),
            bars: klines.len(),
            minimum: settings.min_bars,
        });
    }

    let config = BacktestConfig {
        symbol: symbol.to_string(),
        initial_capital: settings.initial_cash,
        commission: CommissionConfig::with_rate(settings.commission_rate),
        ..Default::default()
    };
    BacktestEngine::run(&config, strategy, &klines)
}

/// Run `strategy` on every configured symbol, one after another.
/// Symbols without enough data are skipped quietly; other failures are collected in `errors`.
pub async fn run_universe(
    provider: &dyn MarketDataProvider,
    strategy: &CompiledStrategy,
    settings: &AgentSettings,
    as_of: NaiveDate,
) -> UniverseRun {
    let mut run = UniverseRun::default();

    for symbol in &settings.symbols {
        match run_symbol(provider, strategy, settings, symbol, as_of).await {
            Ok(result) => {
                let record = BacktestRecord::from_result(&result);
                info!(
                    symbol = %symbol,
                    trades = record.trades,
                    return_pct = %record.strategy_return_pct,
                    "Symbol backtest done"
                );
                run.equity_curves.insert(symbol.clone(), result.equity_curve);
                run.records.push(record);
            }
            Err(e @ (BacktestError::NoData { .. } | BacktestError::InsufficientData { .. })) => {
                warn!(symbol = %symbol, error = %e, "Skipping symbol");
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Symbol backtest failed");
                run.errors.push(format_symbol_error(symbol, &e.to_string()));
            }
        }
    }
    run
}

pub fn format_symbol_error(symbol: &str, message: &str) -> String {
    let truncated: String = message.chars().take(ERROR_MESSAGE_LIMIT).collect();
    format!("{symbol}: {truncated}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::tests::{daily_history, StubProvider};
    use crate::strategy::compile;
    use rust_decimal_macros::dec;

    fn as_of() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 30).unwrap()
    }

    fn wave(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| 100.0 + 10.0 * (i as f64 / 6.0).sin() + i as f64 * 0.1)
            .collect()
    }

    fn strategy() -> CompiledStrategy {
        compile(
            r#"{"version":1,"entry_long":"CROSS_ABOVE(close, SMA(5))","exit_long":"CROSS_BELOW(close, SMA(5))"}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_error_truncated_to_limit() {
        let long = "x".repeat(250);
        let formatted = format_symbol_error("TCS.NS", &long);
        assert_eq!(formatted.len(), "TCS.NS: ".len() + 100);
        assert_eq!(format_symbol_error("A", "boom"), "A: boom");
    }

    #[test]
    fn test_record_rounding() {
        let result = BacktestResult {
            symbol: "INFY.NS".to_string(),
            start_time: 0,
            end_time: 0,
            initial_capital: dec!(10000),
            final_equity: dec!(10512.3456),
            total_pnl: dec!(512.3456),
            total_pnl_pct: dec!(5.123456),
            buy_hold_return_pct: dec!(-3.456),
            total_trades: 7,
            winning_trades: 4,
            losing_trades: 3,
            win_rate: dec!(57.142857),
            max_drawdown: dec!(800),
            max_drawdown_pct: dec!(7.777),
            sharpe_ratio: dec!(1.23),
            profit_factor: dec!(1.5),
            total_commission: dec!(70),
            trades: vec![],
            equity_curve: vec![],
        };
        let record = BacktestRecord::from_result(&result);
        assert_eq!(record.strategy_return_pct, dec!(5.12));
        assert_eq!(record.buy_hold_return_pct, dec!(-3.46));
        assert_eq!(record.win_rate_pct, dec!(57.1));
        assert_eq!(record.max_drawdown_pct, dec!(-7.78));
        assert_eq!(record.end_balance, dec!(10512.35));
        assert!(record.is_profitable());
    }

    #[tokio::test]
    async fn test_run_symbol_requests_lookback_window() {
        let provider = StubProvider::default().with_history(daily_history("TCS.NS", &wave(120)));
        let settings = AgentSettings::default();

        let result = run_symbol(&provider, &strategy(), &settings, "TCS.NS", as_of())
            .await
            .unwrap();
        assert_eq!(result.equity_curve.len(), 120);

        let queries = provider.queries.lock().unwrap();
        let start = NaiveDate::from_ymd_opt(2023, 7, 1).unwrap();
        assert_eq!(queries[0].1, HistoryQuery::between(start, as_of(), "1d"));
    }

    #[tokio::test]
    async fn test_run_symbol_minimum_bars() {
        let provider = StubProvider::default().with_history(daily_history("ITC.NS", &wave(49)));
        let err = run_symbol(&provider, &strategy(), &AgentSettings::default(), "ITC.NS", as_of())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BacktestError::InsufficientData {
                bars: 49,
                minimum: 50,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_run_universe_collects_records_and_errors() {
        let provider = StubProvider::default()
            .with_history(daily_history("RELIANCE.NS", &wave(200)))
            .with_history(daily_history("TCS.NS", &wave(150)))
            .with_history(daily_history("SHORT.NS", &wave(10)));
        let settings = AgentSettings {
            symbols: vec![
                "RELIANCE.NS".to_string(),
                "MISSING.NS".to_string(),
                "TCS.NS".to_string(),
                "SHORT.NS".to_string(),
            ],
            ..Default::default()
        };

        let run = run_universe(&provider, &strategy(), &settings, as_of()).await;

        let symbols: Vec<&str> = run.records.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["RELIANCE.NS", "TCS.NS"]);
        assert_eq!(run.equity_curves.len(), 2);
        assert_eq!(run.errors.len(), 1);
        assert!(run.errors[0].starts_with("MISSING.NS: "));
        assert!(run.records.iter().all(|r| r.trades > 0));
    }
}
