//! Programmable in-memory venue for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use kestrel_core::{Candle, Coin, CorrelationId, Fill, Interval, OrderId, Price};
use kestrel_venue::{
    AckStatus, CancelOutcome, ClearinghouseSnapshot, CoinMeta, FeeSchedule, MarketDataClient,
    OpenOrder, OrderAck, OrderSpec, TradingClient, VenueError, VenueResult,
};

/// In-memory venue double. Every query serves scripted state; every
/// mutation is recorded for assertions. Failure injection pops one queued
/// error per call site.
#[derive(Default)]
pub struct MockVenue {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    mids: HashMap<Coin, Price>,
    candles: HashMap<(Coin, Interval), Vec<Candle>>,
    metas: HashMap<Coin, CoinMeta>,
    fees: Option<FeeSchedule>,
    snapshot: Option<ClearinghouseSnapshot>,
    open_orders: Vec<OpenOrder>,
    fills: Vec<Fill>,

    placed: Vec<OrderSpec>,
    cancelled: Vec<(Coin, OrderId)>,
    cancelled_by_correlation: Vec<(Coin, CorrelationId)>,
    leverage_calls: Vec<(Coin, u32)>,

    ack_queue: VecDeque<OrderAck>,
    cancel_queue: VecDeque<CancelOutcome>,
    errors: VecDeque<VenueError>,
    next_order_id: OrderId,
}

impl MockVenue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mid(&self, coin: &str, mid: Price) {
        self.lock().mids.insert(coin.to_string(), mid);
    }

    pub fn set_candles(&self, coin: &str, interval: Interval, candles: Vec<Candle>) {
        self.lock()
            .candles
            .insert((coin.to_string(), interval), candles);
    }

    pub fn set_meta(&self, meta: CoinMeta) {
        self.lock().metas.insert(meta.coin.clone(), meta);
    }

    pub fn set_fees(&self, fees: FeeSchedule) {
        self.lock().fees = Some(fees);
    }

    pub fn set_snapshot(&self, snapshot: ClearinghouseSnapshot) {
        self.lock().snapshot = Some(snapshot);
    }

    pub fn set_open_orders(&self, orders: Vec<OpenOrder>) {
        self.lock().open_orders = orders;
    }

    pub fn set_fills(&self, fills: Vec<Fill>) {
        self.lock().fills = fills;
    }

    /// Queues the ack returned by the next `place_order`.
    pub fn push_ack(&self, ack: OrderAck) {
        self.lock().ack_queue.push_back(ack);
    }

    /// Queues the outcome returned by the next cancel call.
    pub fn push_cancel_outcome(&self, outcome: CancelOutcome) {
        self.lock().cancel_queue.push_back(outcome);
    }

    /// Queues an error; the next venue call consumes and returns it.
    pub fn push_error(&self, error: VenueError) {
        self.lock().errors.push_back(error);
    }

    #[must_use]
    pub fn placed_orders(&self) -> Vec<OrderSpec> {
        self.lock().placed.clone()
    }

    #[must_use]
    pub fn cancelled_orders(&self) -> Vec<(Coin, OrderId)> {
        self.lock().cancelled.clone()
    }

    #[must_use]
    pub fn cancelled_correlations(&self) -> Vec<(Coin, CorrelationId)> {
        self.lock().cancelled_by_correlation.clone()
    }

    #[must_use]
    pub fn leverage_calls(&self) -> Vec<(Coin, u32)> {
        self.lock().leverage_calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn take_error(&self) -> Option<VenueError> {
        self.lock().errors.pop_front()
    }
}

#[async_trait]
impl MarketDataClient for MockVenue {
    async fn all_mids(&self) -> VenueResult<HashMap<Coin, Price>> {
        if let Some(err) = self.take_error() {
            return Err(err);
        }
        Ok(self.lock().mids.clone())
    }

    async fn candles(
        &self,
        coin: &str,
        interval: Interval,
        limit: usize,
    ) -> VenueResult<Vec<Candle>> {
        if let Some(err) = self.take_error() {
            return Err(err);
        }
        let state = self.lock();
        let candles = state
            .candles
            .get(&(coin.to_string(), interval))
            .cloned()
            .unwrap_or_default();
        let skip = candles.len().saturating_sub(limit);
        Ok(candles.into_iter().skip(skip).collect())
    }

    async fn coin_meta(&self, coin: &str) -> VenueResult<CoinMeta> {
        if let Some(err) = self.take_error() {
            return Err(err);
        }
        self.lock()
            .metas
            .get(coin)
            .cloned()
            .ok_or_else(|| VenueError::InvalidRequest(format!("unknown coin {coin}")))
    }

    async fn fee_schedule(&self) -> VenueResult<FeeSchedule> {
        if let Some(err) = self.take_error() {
            return Err(err);
        }
        self.lock()
            .fees
            .ok_or_else(|| VenueError::Other("no fee schedule scripted".into()))
    }
}

#[async_trait]
impl TradingClient for MockVenue {
    async fn clearinghouse_state(&self) -> VenueResult<ClearinghouseSnapshot> {
        if let Some(err) = self.take_error() {
            return Err(err);
        }
        self.lock()
            .snapshot
            .clone()
            .ok_or_else(|| VenueError::Other("no snapshot scripted".into()))
    }

    async fn open_orders(&self) -> VenueResult<Vec<OpenOrder>> {
        if let Some(err) = self.take_error() {
            return Err(err);
        }
        Ok(self.lock().open_orders.clone())
    }

    async fn recent_fills(&self, since: DateTime<Utc>) -> VenueResult<Vec<Fill>> {
        if let Some(err) = self.take_error() {
            return Err(err);
        }
        Ok(self
            .lock()
            .fills
            .iter()
            .filter(|fill| fill.timestamp >= since)
            .cloned()
            .collect())
    }

    async fn place_order(&self, spec: OrderSpec) -> VenueResult<OrderAck> {
        if let Some(err) = self.take_error() {
            return Err(err);
        }
        let mut state = self.lock();
        let size = spec.size;
        let price = spec.price;
        state.placed.push(spec);
        if let Some(ack) = state.ack_queue.pop_front() {
            return Ok(ack);
        }
        // Default: immediate full fill at the order price.
        state.next_order_id += 1;
        Ok(OrderAck {
            order_id: Some(state.next_order_id),
            status: AckStatus::Filled {
                average_price: price,
                total_size: size,
            },
        })
    }

    async fn cancel_order(&self, coin: &str, order_id: OrderId) -> VenueResult<CancelOutcome> {
        if let Some(err) = self.take_error() {
            return Err(err);
        }
        let mut state = self.lock();
        state.cancelled.push((coin.to_string(), order_id));
        Ok(state
            .cancel_queue
            .pop_front()
            .unwrap_or(CancelOutcome::Cancelled))
    }

    async fn cancel_by_correlation(
        &self,
        coin: &str,
        correlation_id: &CorrelationId,
    ) -> VenueResult<CancelOutcome> {
        if let Some(err) = self.take_error() {
            return Err(err);
        }
        let mut state = self.lock();
        state
            .cancelled_by_correlation
            .push((coin.to_string(), correlation_id.clone()));
        Ok(state
            .cancel_queue
            .pop_front()
            .unwrap_or(CancelOutcome::Cancelled))
    }

    async fn set_leverage(&self, coin: &str, leverage: u32) -> VenueResult<()> {
        if let Some(err) = self.take_error() {
            return Err(err);
        }
        self.lock().leverage_calls.push((coin.to_string(), leverage));
        Ok(())
    }
}

/// Convenience snapshot with a flat account and no positions.
#[must_use]
pub fn flat_snapshot(balance: Decimal) -> ClearinghouseSnapshot {
    ClearinghouseSnapshot {
        positions: Vec::new(),
        account_value: balance,
        available_balance: balance,
        total_margin_used: Decimal::ZERO,
        timestamp: Utc::now(),
    }
}

/// Builds a simple ramp of candles with the given closes.
#[must_use]
pub fn candles_from_closes(coin: &str, interval: Interval, closes: &[Decimal]) -> Vec<Candle> {
    let start = Utc::now() - interval.as_duration() * closes.len() as u32;
    closes
        .iter()
        .enumerate()
        .map(|(i, close)| {
            let open_time =
                start + chrono::Duration::from_std(interval.as_duration()).unwrap_or_default() * i as i32;
            Candle {
                coin: coin.to_string(),
                interval,
                open: *close,
                high: *close,
                low: *close,
                close: *close,
                volume: Decimal::ONE,
                open_time,
                close_time: open_time
                    + chrono::Duration::from_std(interval.as_duration()).unwrap_or_default(),
            }
        })
        .collect()
}
