//! Venue client seam: the async traits every exchange integration
//! implements, plus the normalized types that cross them.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kestrel_core::{Candle, Coin, CorrelationId, Fill, Interval, OrderId, Price};

mod error;
pub mod normalize;
mod types;

pub use error::{VenueError, VenueResult};
pub use types::{
    AckStatus, CancelOutcome, ClearinghouseSnapshot, CoinMeta, FeeSchedule, OpenOrder, OrderAck,
    OrderKind, OrderSpec, PerpPosition, ProtectionKind,
};

/// Read-only market data queries.
#[async_trait]
pub trait MarketDataClient: Send + Sync {
    /// Current mid price for every listed coin.
    async fn all_mids(&self) -> VenueResult<HashMap<Coin, Price>>;

    /// Most recent candles for a coin, newest last. `limit` bounds the
    /// number of bars; the venue may return fewer.
    async fn candles(
        &self,
        coin: &str,
        interval: Interval,
        limit: usize,
    ) -> VenueResult<Vec<Candle>>;

    /// Static metadata for one coin.
    async fn coin_meta(&self, coin: &str) -> VenueResult<CoinMeta>;

    /// The account's current fee schedule.
    async fn fee_schedule(&self) -> VenueResult<FeeSchedule>;
}

/// Trading and account-state operations.
#[async_trait]
pub trait TradingClient: Send + Sync {
    /// Full account snapshot: positions, balances, margin.
    async fn clearinghouse_state(&self) -> VenueResult<ClearinghouseSnapshot>;

    /// All resting orders for the account.
    async fn open_orders(&self) -> VenueResult<Vec<OpenOrder>>;

    /// Fills since `since`, oldest first.
    async fn recent_fills(&self, since: DateTime<Utc>) -> VenueResult<Vec<Fill>>;

    /// Submits an order and returns its immediate disposition.
    async fn place_order(&self, spec: OrderSpec) -> VenueResult<OrderAck>;

    /// Cancels one order by venue id.
    async fn cancel_order(&self, coin: &str, order_id: OrderId) -> VenueResult<CancelOutcome>;

    /// Cancels one order by its client correlation id.
    async fn cancel_by_correlation(
        &self,
        coin: &str,
        correlation_id: &CorrelationId,
    ) -> VenueResult<CancelOutcome>;

    /// Sets cross leverage for a coin.
    async fn set_leverage(&self, coin: &str, leverage: u32) -> VenueResult<()>;
}
