//! Bar-by-bar backtesting engine
//!
//! Per bar, in order: stop-loss / take-profit against the bar's range, exit rule on close,
//! entry rule on close, then mark-to-market. Any position still open after the last bar
//! is closed at its close.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info};

use crate::commission::calculate_commission;
use crate::error::BacktestError;
use crate::indicators::compute_indicators;
use crate::strategy::{CompiledStrategy, EvalContext};
use crate::types::*;

/// Position state during simulation
struct OpenPosition {
    entry_time: i64,
    entry_price: Decimal,
    size: Decimal,
    side: TradeSide,
    entry_commission: Decimal,
}

impl OpenPosition {
    fn gross_pnl(&self, price: Decimal) -> Decimal {
        match self.side {
            TradeSide::Buy => (price - self.entry_price) * self.size,
            TradeSide::Sell => (self.entry_price - price) * self.size,
        }
    }

    /// Protective exit hit inside `kline`, if any. The stop wins when both levels are touched.
    fn protective_exit(
        &self,
        kline: &Kline,
        stop_loss_pct: Option<Decimal>,
        take_profit_pct: Option<Decimal>,
    ) -> Option<(Decimal, ExitReason)> {
        let hundred = dec!(100);
        match self.side {
            TradeSide::Buy => {
                if let Some(sl) = stop_loss_pct {
                    let stop = self.entry_price * (hundred - sl) / hundred;
                    if kline.low <= stop {
                        return Some((kline.open.min(stop), ExitReason::StopLoss));
                    }
                }
                if let Some(tp) = take_profit_pct {
                    let target = self.entry_price * (hundred + tp) / hundred;
                    if kline.high >= target {
                        return Some((kline.open.max(target), ExitReason::TakeProfit));
                    }
                }
            }
            TradeSide::Sell => {
                if let Some(sl) = stop_loss_pct {
                    let stop = self.entry_price * (hundred + sl) / hundred;
                    if kline.high >= stop {
                        return Some((kline.open.max(stop), ExitReason::StopLoss));
                    }
                }
                if let Some(tp) = take_profit_pct {
                    let target = self.entry_price * (hundred - tp) / hundred;
                    if kline.low <= target {
                        return Some((kline.open.min(target), ExitReason::TakeProfit));
                    }
                }
            }
        }
        None
    }
}

/// Backtesting engine that simulates bar-by-bar execution of a compiled strategy
pub struct BacktestEngine;

impl BacktestEngine {
    /// Run a backtest on the given klines with the specified config
    pub fn run(
        config: &BacktestConfig,
        strategy: &CompiledStrategy,
        klines: &[Kline],
    ) -> Result<BacktestResult, BacktestError> {
        let indicators = compute_indicators(klines, &strategy.indicators())?;
        let ctx = EvalContext::new(klines, &indicators);

        let mut equity = config.initial_capital;
        let mut peak_equity = equity;
        let mut max_drawdown = Decimal::ZERO;
        let mut max_drawdown_pct = Decimal::ZERO;
        let mut total_commission = Decimal::ZERO;

        let mut trades: Vec<BacktestTrade> = Vec::new();
        let mut equity_curve: Vec<EquityPoint> = Vec::with_capacity(klines.len());
        let mut position: Option<OpenPosition> = None;

        let hundred = dec!(100);
        let last_index = klines.len().saturating_sub(1);

        info!(
            symbol = %config.symbol,
            strategy = %strategy.name,
            mode = %strategy.mode,
            bars = klines.len(),
            capital = %config.initial_capital,
            "Starting backtest"
        );

        for (idx, kline) in klines.iter().enumerate() {
            // Protective exits first, then the exit rule
            let mut exit: Option<(Decimal, ExitReason)> = position.as_ref().and_then(|pos| {
                pos.protective_exit(kline, strategy.stop_loss_pct, strategy.take_profit_pct)
            });
            if exit.is_none() {
                if let Some(pos) = &position {
                    let rule = match pos.side {
                        TradeSide::Buy => Some(&strategy.exit_long),
                        TradeSide::Sell => strategy.exit_short.as_ref(),
                    };
                    if rule.is_some_and(|r| ctx.evaluate(r, idx)) {
                        exit = Some((kline.close, ExitReason::Signal));
                    }
                }
            }

            if let Some((price, reason)) = exit {
                if let Some(pos) = position.take() {
                    let closed = close_position(pos, kline.open_time, price, reason, config);
                    // entry commission already left equity when the position opened
                    equity += closed.trade.pnl + closed.entry_commission;
                    total_commission += closed.exit_commission;
                    trades.push(closed.trade);
                }
            }

            // Entries on close, never on the final bar
            if position.is_none() && idx >= strategy.warmup_bars && idx < last_index {
                let side = if ctx.evaluate(&strategy.entry_long, idx) {
                    Some(TradeSide::Buy)
                } else if strategy.allows_short()
                    && strategy
                        .entry_short
                        .as_ref()
                        .is_some_and(|r| ctx.evaluate(r, idx))
                {
                    Some(TradeSide::Sell)
                } else {
                    None
                };

                if let Some(side) = side {
                    if kline.close > Decimal::ZERO && equity > Decimal::ZERO {
                        let position_value = equity * config.position_size_pct / hundred;
                        let size = position_value / kline.close;
                        let entry_commission =
                            calculate_commission(size, kline.close, &config.commission);
                        equity -= entry_commission;
                        total_commission += entry_commission;

                        debug!(
                            side = ?side,
                            price = %kline.close,
                            size = %size,
                            time = kline.open_time,
                            "Opened position"
                        );

                        position = Some(OpenPosition {
                            entry_time: kline.open_time,
                            entry_price: kline.close,
                            size,
                            side,
                            entry_commission,
                        });
                    }
                }
            }

            // Track equity curve
            let unrealized = position
                .as_ref()
                .map(|pos| pos.gross_pnl(kline.close))
                .unwrap_or(Decimal::ZERO);
            let current_equity = equity + unrealized;

            equity_curve.push(EquityPoint {
                time: kline.open_time,
                equity: current_equity,
            });

            // Track max drawdown
            if current_equity > peak_equity {
                peak_equity = current_equity;
            }
            let drawdown = peak_equity - current_equity;
            if drawdown > max_drawdown {
                max_drawdown = drawdown;
                if peak_equity > Decimal::ZERO {
                    max_drawdown_pct = drawdown / peak_equity * hundred;
                }
            }
        }

        // Close any remaining open position at last bar
        if let Some(pos) = position.take() {
            if let Some(last_kline) = klines.last() {
                let closed = close_position(
                    pos,
                    last_kline.open_time,
                    last_kline.close,
                    ExitReason::EndOfData,
                    config,
                );
                equity += closed.trade.pnl + closed.entry_commission;
                total_commission += closed.exit_commission;
                trades.push(closed.trade);
                if let Some(point) = equity_curve.last_mut() {
                    point.equity = equity;
                }
            }
        }

        // Calculate final metrics
        let total_trades = trades.len() as u32;
        let winning_trades = trades.iter().filter(|t| t.pnl > Decimal::ZERO).count() as u32;
        let losing_trades = total_trades - winning_trades;

        let win_rate = if total_trades > 0 {
            Decimal::from(winning_trades) / Decimal::from(total_trades) * hundred
        } else {
            Decimal::ZERO
        };

        let total_pnl = equity - config.initial_capital;
        let total_pnl_pct = if config.initial_capital > Decimal::ZERO {
            total_pnl / config.initial_capital * hundred
        } else {
            Decimal::ZERO
        };

        // Profit factor = gross profits / gross losses
        let gross_profits: Decimal = trades
            .iter()
            .filter(|t| t.pnl > Decimal::ZERO)
            .map(|t| t.pnl)
            .sum();
        let gross_losses: Decimal = trades
            .iter()
            .filter(|t| t.pnl < Decimal::ZERO)
            .map(|t| t.pnl.abs())
            .sum();
        let profit_factor = if gross_losses > Decimal::ZERO {
            (gross_profits / gross_losses).round_dp(2)
        } else if gross_profits > Decimal::ZERO {
            dec!(999.99) // Infinite profit factor capped
        } else {
            Decimal::ZERO
        };

        let sharpe_ratio = Self::calculate_sharpe(&equity_curve, config.periods_per_year);
        let buy_hold_return_pct = Self::buy_and_hold_pct(klines);

        let start_time = klines.first().map(|k| k.open_time).unwrap_or(0);
        let end_time = klines.last().map(|k| k.close_time).unwrap_or(0);

        info!(
            symbol = %config.symbol,
            total_trades,
            winning_trades,
            win_rate = %win_rate.round_dp(1),
            total_pnl = %total_pnl.round_dp(2),
            sharpe = %sharpe_ratio,
            "Backtest complete"
        );

        Ok(BacktestResult {
            symbol: config.symbol.clone(),
            start_time,
            end_time,
            initial_capital: config.initial_capital,
            final_equity: equity,
            total_pnl,
            total_pnl_pct,
            buy_hold_return_pct,
            total_trades,
            winning_trades,
            losing_trades,
            win_rate,
            max_drawdown,
            max_drawdown_pct,
            sharpe_ratio,
            profit_factor,
            total_commission,
            trades,
            equity_curve,
        })
    }

    /// Annualised Sharpe ratio of per-bar equity returns, rounded to 2 decimal places
    fn calculate_sharpe(equity_curve: &[EquityPoint], periods_per_year: f64) -> Decimal {
        let values: Vec<f64> = equity_curve
            .iter()
            .map(|p| p.equity.to_f64().unwrap_or(0.0))
            .collect();
        let returns: Vec<f64> = values
            .windows(2)
            .filter(|w| w[0] > 0.0)
            .map(|w| w[1] / w[0] - 1.0)
            .collect();

        if returns.len() < 2 {
            return Decimal::ZERO;
        }

        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;

        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let std_dev = variance.sqrt();

        if std_dev < 1e-12 {
            return Decimal::ZERO;
        }

        let sharpe = mean / std_dev * periods_per_year.sqrt();

        Decimal::from_f64(sharpe)
            .map(|d| d.round_dp(2))
            .unwrap_or(Decimal::ZERO)
    }

    fn buy_and_hold_pct(klines: &[Kline]) -> Decimal {
        match (klines.first(), klines.last()) {
            (Some(first), Some(last)) if first.close > Decimal::ZERO => {
                (last.close - first.close) / first.close * dec!(100)
            }
            _ => Decimal::ZERO,
        }
    }
}

struct ClosedTrade {
    trade: BacktestTrade,
    entry_commission: Decimal,
    exit_commission: Decimal,
}

fn close_position(
    pos: OpenPosition,
    exit_time: i64,
    exit_price: Decimal,
    exit_reason: ExitReason,
    config: &BacktestConfig,
) -> ClosedTrade {
    let exit_commission = calculate_commission(pos.size, exit_price, &config.commission);
    let pnl = pos.gross_pnl(exit_price) - pos.entry_commission - exit_commission;
    let notional = pos.entry_price * pos.size;
    let pnl_pct = if notional > Decimal::ZERO {
        pnl / notional * dec!(100)
    } else {
        Decimal::ZERO
    };

    debug!(
        entry = %pos.entry_price,
        exit = %exit_price,
        pnl = %pnl,
        reason = ?exit_reason,
        "Closed position"
    );

    ClosedTrade {
        trade: BacktestTrade {
            entry_time: pos.entry_time,
            exit_time,
            side: pos.side,
            entry_price: pos.entry_price,
            exit_price,
            size: pos.size,
            pnl,
            pnl_pct,
            exit_reason,
        },
        entry_commission: pos.entry_commission,
        exit_commission,
    }
}
