//! Pre-trade safety limits.

use chrono::{Duration, Utc};
use kestrel_ledger::PositionLedger;
use kestrel_core::Quantity;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Hard limits checked before any entry order.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SafetyLimits {
    /// Largest single-order size in base units. Zero disables.
    pub max_position_size: Quantity,
    /// Realized-loss budget over a rolling day, in quote currency. Zero
    /// disables.
    pub daily_loss_limit: Decimal,
}

/// Outcome of a safety check.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SafetyVerdict {
    pub allowed: bool,
    /// Human-readable explanation when blocked.
    pub reason: Option<String>,
}

impl SafetyVerdict {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn block(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

impl SafetyLimits {
    /// Checks a proposed entry of `size` base units of `coin` against the
    /// limits, using the ledger's realized history for the loss budget.
    #[must_use]
    pub fn check(&self, coin: &str, size: Quantity, ledger: &PositionLedger) -> SafetyVerdict {
        if self.max_position_size > Decimal::ZERO && size > self.max_position_size {
            return SafetyVerdict::block(format!(
                "Position size {size} {coin} exceeds the per-order limit of {}.",
                self.max_position_size
            ));
        }
        if self.daily_loss_limit > Decimal::ZERO {
            let day_ago = Utc::now() - Duration::hours(24);
            let realized = ledger.realized_pnl_since(day_ago);
            if realized <= -self.daily_loss_limit {
                return SafetyVerdict::block(format!(
                    "Daily loss limit reached: {realized:.2} over the last 24h \
                     (limit -{}).",
                    self.daily_loss_limit
                ));
            }
        }
        SafetyVerdict::allow()
    }
}
