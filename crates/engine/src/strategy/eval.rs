//! Rule evaluation against bars and precomputed indicator series
//!
//! - Any comparison touching a missing value (indicator warmup, unknown series) is false
//! - `CROSS_ABOVE`/`CROSS_BELOW` need a previous bar and are false at index 0
//! - `CONSECUTIVE(rule, n)`: true on each of the last n bars, current included
//! - `ANY_OF(rule, n)`: true on at least one of the last n bars

use rust_decimal::prelude::ToPrimitive;

use crate::indicators::{IndicatorSet, IndicatorValue};
use crate::types::Kline;

use super::rule::{IndicatorField, IndicatorRef, Operand, Rule};

#[derive(Debug, Clone, Copy)]
struct Bar {
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

/// Bars converted once to f64 plus the indicator set computed over them
pub struct EvalContext<'a> {
    bars: Vec<Bar>,
    indicators: &'a IndicatorSet,
}

impl<'a> EvalContext<'a> {
    pub fn new(klines: &[Kline], indicators: &'a IndicatorSet) -> Self {
        let f = |d: rust_decimal::Decimal| d.to_f64().unwrap_or(f64::NAN);
        let bars = klines
            .iter()
            .map(|k| Bar {
                open: f(k.open),
                high: f(k.high),
                low: f(k.low),
                close: f(k.close),
                volume: f(k.volume),
            })
            .collect();
        Self { bars, indicators }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn evaluate(&self, rule: &Rule, idx: usize) -> bool {
        if idx >= self.bars.len() {
            return false;
        }
        match rule {
            Rule::CrossAbove { left, right } => {
                if idx == 0 {
                    return false;
                }
                match self.pair(left, right, idx).zip(self.pair(left, right, idx - 1)) {
                    Some(((l, r), (lp, rp))) => l > r && lp <= rp,
                    None => false,
                }
            }
            Rule::CrossBelow { left, right } => {
                if idx == 0 {
                    return false;
                }
                match self.pair(left, right, idx).zip(self.pair(left, right, idx - 1)) {
                    Some(((l, r), (lp, rp))) => l < r && lp >= rp,
                    None => false,
                }
            }
            Rule::Above { left, right } => self
                .pair(left, right, idx)
                .is_some_and(|(l, r)| l > r),
            Rule::Below { left, right } => self
                .pair(left, right, idx)
                .is_some_and(|(l, r)| l < r),
            Rule::Between {
                operand,
                lower,
                upper,
            } => self
                .resolve(operand, idx)
                .is_some_and(|v| v >= *lower && v <= *upper),
            Rule::And(rules) => rules.iter().all(|r| self.evaluate(r, idx)),
            Rule::Or(rules) => rules.iter().any(|r| self.evaluate(r, idx)),
            Rule::Not(rule) => !self.evaluate(rule, idx),
            Rule::Consecutive { rule, count } => {
                if idx + 1 < *count {
                    return false;
                }
                (idx + 1 - count..=idx).all(|i| self.evaluate(rule, i))
            }
            Rule::AnyOf { rule, count } => {
                let start = idx.saturating_sub(count.saturating_sub(1));
                (start..=idx).any(|i| self.evaluate(rule, i))
            }
        }
    }

    fn pair(&self, left: &Operand, right: &Operand, idx: usize) -> Option<(f64, f64)> {
        Some((self.resolve(left, idx)?, self.resolve(right, idx)?))
    }

    fn resolve(&self, operand: &Operand, idx: usize) -> Option<f64> {
        let bar = self.bars.get(idx)?;
        let value = match operand {
            Operand::Open => bar.open,
            Operand::High => bar.high,
            Operand::Low => bar.low,
            Operand::Close => bar.close,
            Operand::Volume => bar.volume,
            Operand::Constant(v) => *v,
            Operand::Indicator(r) => self.indicator(r, idx)?,
        };
        value.is_finite().then_some(value)
    }

    fn indicator(&self, r: &IndicatorRef, idx: usize) -> Option<f64> {
        let value = (*self.indicators.get(&r.indicator)?.get(idx)?)?;
        match (value, r.field) {
            (IndicatorValue::Simple(v), IndicatorField::Value) => Some(v),
            (IndicatorValue::Macd { line, .. }, IndicatorField::MacdLine) => Some(line),
            (IndicatorValue::Macd { signal, .. }, IndicatorField::MacdSignal) => Some(signal),
            (IndicatorValue::Macd { histogram, .. }, IndicatorField::MacdHistogram) => {
                Some(histogram)
            }
            (IndicatorValue::Bollinger { upper, .. }, IndicatorField::BollingerUpper) => {
                Some(upper)
            }
            (IndicatorValue::Bollinger { middle, .. }, IndicatorField::BollingerMiddle) => {
                Some(middle)
            }
            (IndicatorValue::Bollinger { lower, .. }, IndicatorField::BollingerLower) => {
                Some(lower)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{compute_indicators, IndicatorType};
    use crate::strategy::parser::parse_rule;
    use rust_decimal::prelude::FromPrimitive;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::HashSet;

    fn make_klines(prices: &[f64]) -> Vec<Kline> {
        prices
            .iter()
            .enumerate()
            .map(|(i, &p)| {
                let price = Decimal::from_f64(p).unwrap();
                Kline {
                    open_time: i as i64 * 86_400_000,
                    open: price,
                    high: price + dec!(0.5),
                    low: price - dec!(0.5),
                    close: price,
                    volume: dec!(1000),
                    close_time: (i as i64 + 1) * 86_400_000 - 1,
                }
            })
            .collect()
    }

    fn eval_all(text: &str, prices: &[f64]) -> Vec<bool> {
        let rule = parse_rule(text).unwrap();
        let klines = make_klines(prices);
        let set = compute_indicators(&klines, &rule.indicators()).unwrap();
        let ctx = EvalContext::new(&klines, &set);
        (0..ctx.len()).map(|i| ctx.evaluate(&rule, i)).collect()
    }

    #[test]
    fn test_cross_above_fires_once_and_never_on_first_bar() {
        let fired = eval_all("CROSS_ABOVE(close, 10)", &[11.0, 9.0, 9.5, 10.5, 11.0, 9.0]);
        assert_eq!(fired, vec![false, false, false, true, false, false]);
    }

    #[test]
    fn test_cross_below() {
        let fired = eval_all("CROSS_BELOW(close, 10)", &[11.0, 10.0, 9.0, 12.0]);
        assert_eq!(fired, vec![false, false, true, false]);
    }

    #[test]
    fn test_warmup_values_compare_false() {
        let fired = eval_all("ABOVE(close, SMA(3))", &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(fired, vec![false, false, true, true]);

        // NOT over a missing value is true
        let fired = eval_all("NOT(ABOVE(close, SMA(3)))", &[1.0, 2.0, 3.0]);
        assert_eq!(fired, vec![true, true, false]);
    }

    #[test]
    fn test_consecutive_and_any_of() {
        let prices = [5.0, 12.0, 13.0, 14.0, 5.0, 5.0];
        assert_eq!(
            eval_all("CONSECUTIVE(ABOVE(close, 10), 3)", &prices),
            vec![false, false, false, true, false, false]
        );
        assert_eq!(
            eval_all("ANY_OF(ABOVE(close, 10), 2)", &prices),
            vec![false, true, true, true, true, false]
        );
    }

    #[test]
    fn test_between_and_composites() {
        let prices = [5.0, 10.0, 15.0, 20.0];
        assert_eq!(
            eval_all("BETWEEN(close, 10, 15)", &prices),
            vec![false, true, true, false]
        );
        assert_eq!(
            eval_all("OR(BELOW(close, 6), ABOVE(close, 19))", &prices),
            vec![true, false, false, true]
        );
        assert_eq!(
            eval_all("AND(ABOVE(close, 6), BELOW(high, 15))", &prices),
            vec![false, true, false, false]
        );
    }

    #[test]
    fn test_missing_series_is_false() {
        let klines = make_klines(&[1.0, 2.0]);
        let set = compute_indicators(&klines, &HashSet::new()).unwrap();
        let ctx = EvalContext::new(&klines, &set);
        let rule = parse_rule("ABOVE(close, EMA(2))").unwrap();
        assert!(!ctx.evaluate(&rule, 1));
        assert!(!ctx.evaluate(&rule, 99));
        assert!(set.get(&IndicatorType::Ema(2)).is_none());
    }
}
