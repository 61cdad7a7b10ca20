//! Reconciliation of local beliefs against venue truth.
//!
//! The venue is authoritative. A position the venue no longer shows (or
//! shows flipped) is force-closed locally; size drift is warned about but
//! never auto-corrected, so a human can investigate partial fills before
//! the ledger mutates itself.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use kestrel_core::rounding::safe_div;
use kestrel_core::{Coin, Fill, PositionSide, Price, Quantity};
use kestrel_venue::PerpPosition;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{CloseStatus, ClosedPosition, PositionLedger};

/// One local/venue size divergence.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DriftWarning {
    pub coin: Coin,
    pub local_size: Quantity,
    pub venue_size: Quantity,
    pub drift_percent: Decimal,
}

/// Outcome of one reconciliation pass.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ReconcileReport {
    /// Positions force-closed because the venue no longer shows them.
    pub force_closed: Vec<ClosedPosition>,
    /// Positions closed by a protective fill found in recent fill history.
    pub protective_closes: Vec<ClosedPosition>,
    /// Size divergences above the warning threshold.
    pub drift_warnings: Vec<DriftWarning>,
    /// Coins the venue holds that the ledger does not track.
    pub untracked: Vec<Coin>,
}

impl ReconcileReport {
    /// True when local and venue state agreed completely.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.force_closed.is_empty()
            && self.protective_closes.is_empty()
            && self.drift_warnings.is_empty()
            && self.untracked.is_empty()
    }
}

pub(crate) fn run(
    ledger: &mut PositionLedger,
    exchange: &[PerpPosition],
    mids: &HashMap<Coin, Price>,
    recent_fills: &[Fill],
    now: DateTime<Utc>,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    // Protective fills the realtime feed may have missed.
    for fill in recent_fills {
        if let Some(closed) = ledger.match_protective_fill(fill) {
            report.protective_closes.push(closed);
        }
    }

    let venue: HashMap<&str, &PerpPosition> = exchange
        .iter()
        .filter(|position| !position.signed_size.is_zero())
        .map(|position| (position.coin.as_str(), position))
        .collect();

    let local_coins: Vec<Coin> = ledger.positions().keys().cloned().collect();
    for coin in local_coins {
        let Some(local) = ledger.position(&coin) else {
            // Removed by a protective close above.
            continue;
        };
        let local_side = local.side;
        let local_size = local.size;

        let remote = venue.get(coin.as_str()).copied();
        let remote_side = remote.map(|position| {
            if position.is_long() {
                PositionSide::Long
            } else {
                PositionSide::Short
            }
        });

        match (remote, remote_side) {
            (Some(remote), Some(side)) if side == local_side => {
                // Drift is measured against the venue's size, which is
                // authoritative.
                let venue_size = remote.abs_size();
                let drift_percent =
                    safe_div((local_size - venue_size).abs(), venue_size) * Decimal::ONE_HUNDRED;
                if drift_percent > ledger.config().drift_warn_percent {
                    warn!(
                        coin = %coin,
                        local = %local_size,
                        venue = %venue_size,
                        drift_percent = %drift_percent,
                        "position size drift, not auto-correcting"
                    );
                    report.drift_warnings.push(DriftWarning {
                        coin: coin.clone(),
                        local_size,
                        venue_size,
                        drift_percent,
                    });
                }
            }
            _ => {
                // Missing or flipped on the venue: the position was closed
                // behind our back. Close at the current mid when we have
                // one; otherwise flat at entry with PnL unknown.
                let (exit_price, known_mid) = match mids.get(&coin) {
                    Some(mid) => (*mid, true),
                    None => (ledger.position(&coin).map_or(Decimal::ZERO, |p| p.entry_price), false),
                };
                // With a mid the exit fee is estimated at the default
                // taker rate; flat-at-entry closes carry no fee guess.
                let exit_fee = if known_mid {
                    exit_price * local_size * ledger.config().estimated_taker_rate
                } else {
                    Decimal::ZERO
                };
                warn!(
                    coin = %coin,
                    known_mid,
                    exit = %exit_price,
                    "venue no longer shows position, force-closing locally"
                );
                if let Ok(closed) = ledger.close(
                    &coin,
                    None,
                    exit_price,
                    exit_fee,
                    CloseStatus::ClosedExternal,
                    true,
                    now,
                ) {
                    report.force_closed.push(closed);
                }
            }
        }
    }

    for (coin, position) in &venue {
        if ledger.position(coin).is_none() {
            info!(
                coin = %coin,
                size = %position.signed_size,
                "venue holds untracked position (possibly another agent's)"
            );
            report.untracked.push((*coin).to_string());
        }
    }

    ledger.persist();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LedgerConfig, PositionLedger};
    use kestrel_core::Side;
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn venue_position(coin: &str, signed_size: Decimal, entry: Decimal) -> PerpPosition {
        PerpPosition {
            coin: coin.into(),
            signed_size,
            entry_price: entry,
            unrealized_pnl: Decimal::ZERO,
            leverage: 20,
            liquidation_price: None,
            margin_used: Decimal::ZERO,
        }
    }

    #[test]
    fn missing_position_force_closes_at_mid() {
        let mut ledger = PositionLedger::new(LedgerConfig::default());
        ledger.open_or_add("BTC", Side::Buy, dec!(1), dec!(100), Decimal::ZERO, now());

        let mids = HashMap::from([("BTC".to_string(), dec!(104))]);
        let report = ledger.reconcile(&[], &mids, &[], now());

        assert_eq!(report.force_closed.len(), 1);
        let closed = &report.force_closed[0];
        assert_eq!(closed.status, CloseStatus::ClosedExternal);
        assert!(closed.estimated);
        assert_eq!(closed.exit_price, dec!(104));
        assert_eq!(closed.pnl.gross, dec!(4));
        // Exit fee estimated at the default taker rate: 104 * 1 * 0.00045.
        assert_eq!(closed.exit_fee, dec!(0.04680));
        assert_eq!(closed.pnl.net, dec!(3.95320));
        assert!(ledger.position("BTC").is_none());
    }

    #[test]
    fn missing_mid_closes_flat_with_unknown_pnl() {
        let mut ledger = PositionLedger::new(LedgerConfig::default());
        ledger.open_or_add("BTC", Side::Buy, dec!(1), dec!(100), Decimal::ZERO, now());

        let report = ledger.reconcile(&[], &HashMap::new(), &[], now());
        let closed = &report.force_closed[0];
        assert_eq!(closed.exit_price, dec!(100));
        assert_eq!(closed.pnl.gross, Decimal::ZERO);
        assert_eq!(closed.exit_fee, Decimal::ZERO);
        assert!(closed.estimated);
    }

    #[test]
    fn flipped_position_is_treated_as_missing() {
        let mut ledger = PositionLedger::new(LedgerConfig::default());
        ledger.open_or_add("BTC", Side::Buy, dec!(1), dec!(100), Decimal::ZERO, now());

        let venue = vec![venue_position("BTC", dec!(-1), dec!(100))];
        let mids = HashMap::from([("BTC".to_string(), dec!(101))]);
        let report = ledger.reconcile(&venue, &mids, &[], now());
        assert_eq!(report.force_closed.len(), 1);
    }

    #[test]
    fn drift_warns_without_mutating() {
        let mut ledger = PositionLedger::new(LedgerConfig::default());
        ledger.open_or_add("BTC", Side::Buy, dec!(10), dec!(100), Decimal::ZERO, now());

        let venue = vec![venue_position("BTC", dec!(9), dec!(100))];
        let report = ledger.reconcile(&venue, &HashMap::new(), &[], now());

        assert_eq!(report.drift_warnings.len(), 1);
        // |10 - 9| / 9, as a percentage of the venue's size.
        assert_eq!(report.drift_warnings[0].drift_percent.round_dp(2), dec!(11.11));
        assert_eq!(ledger.position("BTC").unwrap().size, dec!(10));
        assert!(report.force_closed.is_empty());
    }

    #[test]
    fn small_drift_is_ignored() {
        let mut ledger = PositionLedger::new(LedgerConfig::default());
        ledger.open_or_add("BTC", Side::Buy, dec!(1000), dec!(100), Decimal::ZERO, now());

        let venue = vec![venue_position("BTC", dec!(999), dec!(100))];
        let report = ledger.reconcile(&venue, &HashMap::new(), &[], now());
        assert!(report.is_clean());
    }

    #[test]
    fn untracked_positions_are_reported_only() {
        let mut ledger = PositionLedger::new(LedgerConfig::default());
        let venue = vec![venue_position("ETH", dec!(3), dec!(2000))];
        let report = ledger.reconcile(&venue, &HashMap::new(), &[], now());
        assert_eq!(report.untracked, vec!["ETH".to_string()]);
        assert!(ledger.position("ETH").is_none());
    }

    #[test]
    fn reconcile_is_idempotent() {
        let mut ledger = PositionLedger::new(LedgerConfig::default());
        ledger.open_or_add("BTC", Side::Buy, dec!(1), dec!(100), Decimal::ZERO, now());

        let mids = HashMap::from([("BTC".to_string(), dec!(104))]);
        let first = ledger.reconcile(&[], &mids, &[], now());
        assert_eq!(first.force_closed.len(), 1);
        let second = ledger.reconcile(&[], &mids, &[], now());
        assert!(second.is_clean());
    }

    #[test]
    fn fill_history_fallback_closes_protected_position() {
        let mut ledger = PositionLedger::new(LedgerConfig::default());
        ledger.open_or_add("BTC", Side::Buy, dec!(1), dec!(100), Decimal::ZERO, now());
        ledger.register_protection(
            "BTC",
            kestrel_venue::ProtectionKind::TakeProfit,
            Some(42),
            None,
        );

        let fill = Fill {
            coin: "BTC".into(),
            side: Side::Sell,
            price: dec!(115),
            size: dec!(1),
            fee: dec!(0.05),
            closed_pnl: None,
            order_id: 42,
            correlation_id: None,
            timestamp: now(),
        };
        let report = ledger.reconcile(&[], &HashMap::new(), &[fill], now());
        assert_eq!(report.protective_closes.len(), 1);
        assert_eq!(report.protective_closes[0].status, CloseStatus::TakeProfit);
        // Already closed by the fill, so nothing left to force-close.
        assert!(report.force_closed.is_empty());
    }
}
