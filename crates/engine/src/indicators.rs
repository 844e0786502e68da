//! Indicator series for strategy evaluation
//!
//! Every indicator a compiled strategy references is computed once per symbol, bar-by-bar,
//! with the `ta` crate. Values inside an indicator's warmup window are `None`.

use std::collections::{HashMap, HashSet};
use std::fmt;

use rust_decimal::prelude::ToPrimitive;
use ta::indicators::{
    AverageTrueRange, BollingerBands, ExponentialMovingAverage, FastStochastic,
    MovingAverageConvergenceDivergence, OnBalanceVolume, RateOfChange, RelativeStrengthIndex,
    SimpleMovingAverage, StandardDeviation,
};
use ta::{DataItem, Next};

use crate::error::BacktestError;
use crate::types::Kline;

/// Largest lookback any indicator may use. `ta` allocates a window of this size per indicator.
pub const MAX_PERIOD: usize = 1000;

/// Indicator identity plus parameters. Used as the key of an [`IndicatorSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndicatorType {
    Sma(usize),
    Ema(usize),
    Rsi(usize),
    Atr(usize),
    Roc(usize),
    Stddev(usize),
    StochK(usize),
    Obv,
    Macd {
        fast: usize,
        slow: usize,
        signal: usize,
    },
    /// Multiplier stored ×100 so the key stays hashable
    Bollinger { period: usize, mult_x100: u32 },
}

impl IndicatorType {
    /// Bars needed before the first valid value
    pub fn warmup(&self) -> usize {
        match *self {
            Self::Sma(n) | Self::Ema(n) | Self::Atr(n) | Self::Stddev(n) | Self::StochK(n) => n,
            Self::Rsi(n) | Self::Roc(n) => n + 1,
            Self::Obv => 1,
            Self::Macd { slow, signal, .. } => slow + signal - 1,
            Self::Bollinger { period, .. } => period,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if let Some(n) = self.periods().into_iter().find(|&n| n > MAX_PERIOD) {
            return Err(format!("period {n} exceeds the maximum of {MAX_PERIOD}"));
        }
        match *self {
            Self::Sma(n)
            | Self::Ema(n)
            | Self::Rsi(n)
            | Self::Atr(n)
            | Self::Roc(n)
            | Self::Stddev(n)
            | Self::StochK(n)
                if n == 0 =>
            {
                Err("period must be at least 1".to_string())
            }
            Self::Macd { fast, slow, signal } => {
                if fast == 0 || slow == 0 || signal == 0 {
                    Err("periods must be at least 1".to_string())
                } else if fast >= slow {
                    Err(format!("fast period {fast} must be below slow period {slow}"))
                } else {
                    Ok(())
                }
            }
            Self::Bollinger { period, mult_x100 } => {
                if period < 2 {
                    Err("period must be at least 2".to_string())
                } else if mult_x100 == 0 {
                    Err("multiplier must be positive".to_string())
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    fn periods(&self) -> Vec<usize> {
        match *self {
            Self::Sma(n)
            | Self::Ema(n)
            | Self::Rsi(n)
            | Self::Atr(n)
            | Self::Roc(n)
            | Self::Stddev(n)
            | Self::StochK(n) => vec![n],
            Self::Obv => Vec::new(),
            Self::Macd { fast, slow, signal } => vec![fast, slow, signal],
            Self::Bollinger { period, .. } => vec![period],
        }
    }
}

impl fmt::Display for IndicatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sma(n) => write!(f, "SMA({n})"),
            Self::Ema(n) => write!(f, "EMA({n})"),
            Self::Rsi(n) => write!(f, "RSI({n})"),
            Self::Atr(n) => write!(f, "ATR({n})"),
            Self::Roc(n) => write!(f, "ROC({n})"),
            Self::Stddev(n) => write!(f, "STDDEV({n})"),
            Self::StochK(n) => write!(f, "STOCH_K({n})"),
            Self::Obv => write!(f, "OBV"),
            Self::Macd { fast, slow, signal } => write!(f, "MACD({fast},{slow},{signal})"),
            Self::Bollinger { period, mult_x100 } => {
                write!(f, "BB({period},{})", *mult_x100 as f64 / 100.0)
            }
        }
    }
}

/// One indicator output
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IndicatorValue {
    Simple(f64),
    Macd {
        line: f64,
        signal: f64,
        histogram: f64,
    },
    Bollinger {
        upper: f64,
        middle: f64,
        lower: f64,
    },
}

/// Per-bar values, aligned with the kline slice they were computed from
pub type IndicatorSeries = Vec<Option<IndicatorValue>>;
pub type IndicatorSet = HashMap<IndicatorType, IndicatorSeries>;

/// Running `ta` state for one indicator
enum IndicatorState {
    Sma(SimpleMovingAverage),
    Ema(ExponentialMovingAverage),
    Rsi(RelativeStrengthIndex),
    Atr(AverageTrueRange),
    Roc(RateOfChange),
    Stddev(StandardDeviation),
    StochK(FastStochastic),
    Obv(OnBalanceVolume),
    Macd(MovingAverageConvergenceDivergence),
    Bollinger(BollingerBands),
}

impl IndicatorState {
    fn new(kind: IndicatorType) -> Result<Self, BacktestError> {
        let err = |e: ta::errors::TaError| BacktestError::Indicator(format!("{kind}: {e:?}"));
        Ok(match kind {
            IndicatorType::Sma(n) => Self::Sma(SimpleMovingAverage::new(n).map_err(err)?),
            IndicatorType::Ema(n) => Self::Ema(ExponentialMovingAverage::new(n).map_err(err)?),
            IndicatorType::Rsi(n) => Self::Rsi(RelativeStrengthIndex::new(n).map_err(err)?),
            IndicatorType::Atr(n) => Self::Atr(AverageTrueRange::new(n).map_err(err)?),
            IndicatorType::Roc(n) => Self::Roc(RateOfChange::new(n).map_err(err)?),
            IndicatorType::Stddev(n) => Self::Stddev(StandardDeviation::new(n).map_err(err)?),
            IndicatorType::StochK(n) => Self::StochK(FastStochastic::new(n).map_err(err)?),
            IndicatorType::Obv => Self::Obv(OnBalanceVolume::new()),
            IndicatorType::Macd { fast, slow, signal } => Self::Macd(
                MovingAverageConvergenceDivergence::new(fast, slow, signal).map_err(err)?,
            ),
            IndicatorType::Bollinger { period, mult_x100 } => Self::Bollinger(
                BollingerBands::new(period, mult_x100 as f64 / 100.0).map_err(err)?,
            ),
        })
    }

    fn next(&mut self, bar: &DataItem, close: f64) -> IndicatorValue {
        match self {
            Self::Sma(i) => IndicatorValue::Simple(i.next(close)),
            Self::Ema(i) => IndicatorValue::Simple(i.next(close)),
            Self::Rsi(i) => IndicatorValue::Simple(i.next(close)),
            Self::Atr(i) => IndicatorValue::Simple(i.next(bar)),
            Self::Roc(i) => IndicatorValue::Simple(i.next(close)),
            Self::Stddev(i) => IndicatorValue::Simple(i.next(close)),
            Self::StochK(i) => IndicatorValue::Simple(i.next(bar)),
            Self::Obv(i) => IndicatorValue::Simple(i.next(bar)),
            Self::Macd(i) => {
                let out = i.next(close);
                IndicatorValue::Macd {
                    line: out.macd,
                    signal: out.signal,
                    histogram: out.histogram,
                }
            }
            Self::Bollinger(i) => {
                let out = i.next(close);
                IndicatorValue::Bollinger {
                    upper: out.upper,
                    middle: out.average,
                    lower: out.lower,
                }
            }
        }
    }
}

fn to_f64(v: rust_decimal::Decimal) -> f64 {
    v.to_f64().unwrap_or(0.0)
}

/// `ta` rejects bars whose high/low don't bracket open/close; such bars degrade to a flat bar
fn data_item(kline: &Kline) -> Result<DataItem, BacktestError> {
    let close = to_f64(kline.close);
    let volume = to_f64(kline.volume).max(0.0);
    DataItem::builder()
        .open(to_f64(kline.open))
        .high(to_f64(kline.high))
        .low(to_f64(kline.low))
        .close(close)
        .volume(volume)
        .build()
        .or_else(|_| {
            DataItem::builder()
                .open(close)
                .high(close)
                .low(close)
                .close(close)
                .volume(volume)
                .build()
        })
        .map_err(|e| BacktestError::Indicator(format!("bad bar at {}: {e:?}", kline.open_time)))
}

/// Compute every requested indicator over `klines`
pub fn compute_indicators(
    klines: &[Kline],
    kinds: &HashSet<IndicatorType>,
) -> Result<IndicatorSet, BacktestError> {
    let mut states = kinds
        .iter()
        .map(|&kind| Ok((kind, IndicatorState::new(kind)?)))
        .collect::<Result<Vec<_>, BacktestError>>()?;

    let mut set: IndicatorSet = kinds
        .iter()
        .map(|&kind| (kind, Vec::with_capacity(klines.len())))
        .collect();

    for (idx, kline) in klines.iter().enumerate() {
        let bar = data_item(kline)?;
        let close = to_f64(kline.close);
        for (kind, state) in states.iter_mut() {
            let value = state.next(&bar, close);
            let ready = idx + 1 >= kind.warmup();
            if let Some(series) = set.get_mut(kind) {
                series.push(ready.then_some(value));
            }
        }
    }
    Ok(set)
}
