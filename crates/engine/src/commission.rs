//! Commission charged on every fill
//!
//! Formula: fee = notional × rate, with notional = size × price.
//! An optional per-fill minimum applies to non-zero fills.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommissionConfig {
    /// Fraction of notional (default 0.001 = 0.1%)
    pub rate: Decimal,
    /// Floor per fill in account currency (default none)
    pub minimum: Decimal,
}

impl Default for CommissionConfig {
    fn default() -> Self {
        Self {
            rate: dec!(0.001),
            minimum: Decimal::ZERO,
        }
    }
}

impl CommissionConfig {
    pub fn with_rate(rate: Decimal) -> Self {
        Self {
            rate,
            ..Default::default()
        }
    }
}

/// Commission for one fill of `size` units at `price`.
/// Rounded down to 4 decimal places; zero for empty or non-positive fills.
pub fn calculate_commission(size: Decimal, price: Decimal, config: &CommissionConfig) -> Decimal {
    if size <= Decimal::ZERO || price <= Decimal::ZERO || config.rate <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let raw_fee = size * price * config.rate;

    let scale_factor = dec!(10000);
    let rounded = (raw_fee * scale_factor).floor() / scale_factor;

    rounded.max(config.minimum)
}
