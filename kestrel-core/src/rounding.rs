//! Price and size rounding for perpetual markets.
//!
//! The venue accepts prices with at most five significant figures and at
//! most `6 - size_decimals` decimal places; integer prices are always
//! accepted. Sizes truncate to the coin's `size_decimals`.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::{Price, Quantity};

/// Maximum decimal places for a perp price before the size-decimals
/// deduction.
pub const MAX_PRICE_DECIMALS: u32 = 6;

/// Maximum significant figures the venue accepts in a price.
pub const MAX_SIGNIFICANT_FIGURES: u32 = 5;

/// Rounds a price to the venue's tick rule for a coin with the given
/// `size_decimals`. Idempotent: rounding an already-valid price returns it
/// unchanged. Integer prices pass through untouched.
#[must_use]
pub fn round_to_tick(price: Price, size_decimals: u32) -> Price {
    if price.fract().is_zero() {
        return price.normalize();
    }

    let max_decimals = MAX_PRICE_DECIMALS.saturating_sub(size_decimals);

    // Decimal places still available inside the significant-figure budget.
    let abs = price.abs();
    let sig_decimals = if abs >= Decimal::ONE {
        let int_digits = abs.trunc().to_string().len() as u32;
        MAX_SIGNIFICANT_FIGURES.saturating_sub(int_digits)
    } else {
        // For sub-unit prices, leading fractional zeros do not consume
        // significant figures.
        let mut zeros = 0u32;
        let mut scaled = abs;
        while scaled < Decimal::new(1, 1) && zeros < 28 {
            scaled *= Decimal::TEN;
            zeros += 1;
        }
        MAX_SIGNIFICANT_FIGURES + zeros
    };

    let dp = sig_decimals.min(max_decimals);
    price
        .round_dp_with_strategy(dp, RoundingStrategy::MidpointNearestEven)
        .normalize()
}

/// Truncates an order size down to the coin's `size_decimals`.
#[must_use]
pub fn round_to_lot(size: Quantity, size_decimals: u32) -> Quantity {
    size.round_dp_with_strategy(size_decimals, RoundingStrategy::ToZero)
        .normalize()
}

/// Division that treats a zero denominator as zero instead of panicking.
#[must_use]
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator.is_zero() {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Counts the significant figures of a decimal, ignoring leading zeros.
#[must_use]
pub fn significant_figures(value: Decimal) -> u32 {
    let normalized = value.abs().normalize();
    if normalized.is_zero() {
        return 0;
    }
    normalized
        .mantissa()
        .to_u128()
        .map_or(0, |m| m.to_string().len() as u32)
}
