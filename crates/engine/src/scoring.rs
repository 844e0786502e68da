//! Portfolio aggregation and the scalar score used to rank iterations

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::runner::BacktestRecord;

/// Sums and means across all symbols of one universe run. All zero when there are no records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub trades: u32,
    pub profitable: u32,
    pub total_symbols: u32,
    pub avg_return: Decimal,
    pub avg_sharpe: Decimal,
    pub avg_win_rate: Decimal,
    pub avg_buy_hold: Decimal,
    pub total_pnl: Decimal,
    /// Worst (most negative) per-symbol drawdown percentage
    pub max_drawdown: Decimal,
    pub total_start: Decimal,
    pub total_end: Decimal,
}

impl PortfolioSummary {
    pub fn from_records(records: &[BacktestRecord]) -> Self {
        if records.is_empty() {
            return Self::default();
        }
        let n = Decimal::from(records.len());
        let mean = |f: fn(&BacktestRecord) -> Decimal| records.iter().map(f).sum::<Decimal>() / n;

        Self {
            trades: records.iter().map(|r| r.trades).sum(),
            profitable: records.iter().filter(|r| r.is_profitable()).count() as u32,
            total_symbols: records.len() as u32,
            avg_return: mean(|r| r.strategy_return_pct).round_dp(2),
            avg_sharpe: mean(|r| r.sharpe).round_dp(2),
            avg_win_rate: mean(|r| r.win_rate_pct).round_dp(1),
            avg_buy_hold: mean(|r| r.buy_hold_return_pct).round_dp(2),
            total_pnl: records.iter().map(|r| r.pnl).sum::<Decimal>().round_dp(2),
            max_drawdown: records
                .iter()
                .map(|r| r.max_drawdown_pct)
                .min()
                .unwrap_or(Decimal::ZERO)
                .round_dp(2),
            total_start: records.iter().map(|r| r.start_balance).sum(),
            total_end: records.iter().map(|r| r.end_balance).sum(),
        }
    }

    /// Portfolio return on the summed balances, in percent
    pub fn portfolio_return_pct(&self) -> Decimal {
        if self.total_start > Decimal::ZERO {
            (self.total_end / self.total_start - Decimal::ONE) * dec!(100)
        } else {
            Decimal::ZERO
        }
    }

    /// Share of symbols that ended in profit, in percent
    pub fn success_rate_pct(&self) -> Decimal {
        if self.total_symbols > 0 {
            Decimal::from(self.profitable) / Decimal::from(self.total_symbols) * dec!(100)
        } else {
            Decimal::ZERO
        }
    }
}

/// trades×0.3 + profitable×10 + max(avg_return,0)×0.5 + max(avg_sharpe,0)×5
pub fn score(summary: &PortfolioSummary) -> Decimal {
    Decimal::from(summary.trades) * dec!(0.3)
        + Decimal::from(summary.profitable) * dec!(10)
        + summary.avg_return.max(Decimal::ZERO) * dec!(0.5)
        + summary.avg_sharpe.max(Decimal::ZERO) * dec!(5)
}
