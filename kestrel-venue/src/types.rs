//! Normalized venue payload types.
//!
//! Concrete client implementations translate wire payloads into these
//! structures; everything downstream of the venue seam works only with
//! `Decimal` fields and typed enums.

use chrono::{DateTime, Utc};
use kestrel_core::{Coin, CorrelationId, OrderId, Price, Quantity, Side, TimeInForce};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Static metadata for one perpetual market.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CoinMeta {
    pub coin: Coin,
    /// Decimal places accepted in order sizes for this coin.
    pub size_decimals: u32,
    /// Maximum leverage the venue allows on this coin.
    pub max_leverage: u32,
}

/// Current taker/maker fee rates for the account.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct FeeSchedule {
    pub taker_rate: Decimal,
    pub maker_rate: Decimal,
}

/// One position as reported by the venue. `signed_size` is positive for
/// longs and negative for shorts.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PerpPosition {
    pub coin: Coin,
    pub signed_size: Quantity,
    pub entry_price: Price,
    pub unrealized_pnl: Price,
    pub leverage: u32,
    pub liquidation_price: Option<Price>,
    pub margin_used: Price,
}

impl PerpPosition {
    #[must_use]
    pub fn is_long(&self) -> bool {
        self.signed_size > Decimal::ZERO
    }

    #[must_use]
    pub fn abs_size(&self) -> Quantity {
        self.signed_size.abs()
    }
}

/// Point-in-time account snapshot from the venue's clearinghouse.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ClearinghouseSnapshot {
    pub positions: Vec<PerpPosition>,
    pub account_value: Price,
    pub available_balance: Price,
    pub total_margin_used: Price,
    pub timestamp: DateTime<Utc>,
}

/// One resting order as reported by the venue.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OpenOrder {
    pub order_id: OrderId,
    pub coin: Coin,
    pub side: Side,
    pub price: Price,
    pub size: Quantity,
    pub original_size: Quantity,
    pub correlation_id: Option<CorrelationId>,
    pub reduce_only: bool,
    pub placed_at: DateTime<Utc>,
}

/// Protective order flavor for trigger orders.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionKind {
    StopLoss,
    TakeProfit,
}

/// How an order should execute once accepted.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum OrderKind {
    /// Plain limit order with a time-in-force.
    Limit { tif: TimeInForce },
    /// Trigger (stop/take-profit) order. When `is_market` the order
    /// executes at market on trigger; otherwise it rests as a limit at
    /// the order's price.
    Trigger {
        trigger_price: Price,
        is_market: bool,
        protection: ProtectionKind,
    },
}

/// A fully specified order, ready to submit.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OrderSpec {
    pub coin: Coin,
    pub side: Side,
    pub size: Quantity,
    pub price: Price,
    pub kind: OrderKind,
    pub reduce_only: bool,
    pub correlation_id: Option<CorrelationId>,
}

/// Immediate disposition of a submitted order.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// The order is resting on the book.
    Resting,
    /// The order filled (fully or partially) on arrival.
    Filled {
        average_price: Price,
        total_size: Quantity,
    },
    /// The venue accepted the request but rejected the order.
    Rejected { reason: String },
}

/// Acknowledgement returned by the venue for a placement.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OrderAck {
    pub order_id: Option<OrderId>,
    pub status: AckStatus,
}

/// Outcome of a cancel request.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    /// The order no longer exists on the venue (already filled, already
    /// cancelled, or unknown). Terminal; not worth retrying.
    AlreadyGone { reason: String },
}
