//! Order operation outcomes.
//!
//! Execution methods report failure through [`OrderResult`] rather than an
//! error type: callers always get a value they can log, forward to a
//! status sink, and inspect, whether the order filled, rested, or was
//! rejected.

use kestrel_core::{CorrelationId, OrderId, Price, Quantity};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Final state of an order operation.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    Filled,
    Cancelled,
    Error,
}

/// Immutable outcome of one order operation.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OrderResult {
    pub success: bool,
    pub status: OrderStatus,
    pub order_id: Option<OrderId>,
    pub correlation_id: Option<CorrelationId>,
    pub requested_size: Quantity,
    pub filled_size: Option<Quantity>,
    pub average_price: Option<Price>,
    /// Estimated fee for the fill, when a fee rate was known.
    pub fee: Option<Decimal>,
    pub fee_rate: Option<Decimal>,
    /// Human-readable notes about silent adjustments (size clamps,
    /// price rounding).
    pub adjustments: Vec<String>,
    pub error: Option<String>,
}

impl OrderResult {
    /// A rejection that never reached the venue.
    #[must_use]
    pub fn rejected(requested_size: Quantity, reason: impl Into<String>) -> Self {
        Self {
            success: false,
            status: OrderStatus::Error,
            order_id: None,
            correlation_id: None,
            requested_size,
            filled_size: None,
            average_price: None,
            fee: None,
            fee_rate: None,
            adjustments: Vec::new(),
            error: Some(reason.into()),
        }
    }
}
