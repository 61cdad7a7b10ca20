//! Realized PnL math.

use kestrel_core::rounding::safe_div;
use kestrel_core::{PositionSide, Price, Quantity};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Realized profit breakdown for one close.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct PnlBreakdown {
    /// Price move only, fees excluded.
    pub gross: Decimal,
    /// Gross minus entry and exit fees.
    pub net: Decimal,
    /// Net relative to entry notional, in percent.
    pub percent: Decimal,
}

/// Computes realized PnL for closing `size` at `exit_price` against a
/// position entered at `entry_price`. `entry_fee` must already be the
/// share attributable to the closed size.
#[must_use]
pub fn realized_pnl(
    side: PositionSide,
    entry_price: Price,
    exit_price: Price,
    size: Quantity,
    entry_fee: Decimal,
    exit_fee: Decimal,
) -> PnlBreakdown {
    let gross = match side {
        PositionSide::Long => (exit_price - entry_price) * size,
        PositionSide::Short => (entry_price - exit_price) * size,
    };
    let net = gross - (entry_fee + exit_fee);
    let percent = safe_div(net, entry_price * size) * Decimal::ONE_HUNDRED;
    PnlBreakdown {
        gross,
        net,
        percent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn long_round_trip_with_fees() {
        let pnl = realized_pnl(
            PositionSide::Long,
            dec!(100),
            dec!(110),
            dec!(1),
            dec!(0.05),
            dec!(0.055),
        );
        assert_eq!(pnl.gross, dec!(10));
        assert_eq!(pnl.net, dec!(9.895));
        assert_eq!(pnl.percent, dec!(9.895));
    }

    #[test]
    fn short_profits_when_price_falls() {
        let pnl = realized_pnl(
            PositionSide::Short,
            dec!(100),
            dec!(90),
            dec!(2),
            Decimal::ZERO,
            Decimal::ZERO,
        );
        assert_eq!(pnl.gross, dec!(20));
        assert_eq!(pnl.net, dec!(20));
        assert_eq!(pnl.percent, dec!(10));
    }

    #[test]
    fn zero_fee_flat_close_nets_zero() {
        let pnl = realized_pnl(
            PositionSide::Long,
            dec!(250),
            dec!(250),
            dec!(4),
            Decimal::ZERO,
            Decimal::ZERO,
        );
        assert_eq!(pnl.gross, Decimal::ZERO);
        assert_eq!(pnl.net, Decimal::ZERO);
        assert_eq!(pnl.percent, Decimal::ZERO);
    }

    #[test]
    fn zero_entry_notional_does_not_panic() {
        let pnl = realized_pnl(
            PositionSide::Long,
            Decimal::ZERO,
            dec!(1),
            Decimal::ZERO,
            Decimal::ZERO,
            Decimal::ZERO,
        );
        assert_eq!(pnl.percent, Decimal::ZERO);
    }
}
