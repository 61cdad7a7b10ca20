//! Order placement and cancellation against the venue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use kestrel_core::retry::{retry_on_rate_limit, RetryPolicy};
use kestrel_core::rounding::{round_to_lot, round_to_tick, safe_div};
use kestrel_core::{ids, Coin, OrderId, PositionSide, Price, Quantity, Side, TimeInForce};
use kestrel_venue::{
    AckStatus, CancelOutcome, ClearinghouseSnapshot, CoinMeta, FeeSchedule, MarketDataClient,
    OrderKind, OrderSpec, ProtectionKind, TradingClient, VenueError, VenueResult,
};

use crate::owned::{OwnedOrder, OwnedOrderLedger, OwnedStatus};
use crate::result::{OrderResult, OrderStatus};

/// Executor tunables.
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Leverage applied when none was ever synced for a coin.
    pub default_leverage: u32,
    /// Market-order slippage bound (fraction).
    pub default_slippage: Decimal,
    /// Stop-loss limit offset beyond the trigger price.
    pub stop_loss_limit_offset: Decimal,
    /// Take-profit limit offset beyond the trigger price.
    pub take_profit_limit_offset: Decimal,
    /// Taker rate assumed when the fee schedule is unavailable.
    pub fallback_taker_rate: Decimal,
    pub leverage_sync_ttl: Duration,
    pub meta_ttl: Duration,
    pub account_cache_ttl: Duration,
    pub fee_cache_ttl: Duration,
    pub cancel_batch_size: usize,
    pub cancel_batch_pause: Duration,
    pub owned_retention: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_leverage: 20,
            default_slippage: Decimal::new(5, 2),
            stop_loss_limit_offset: Decimal::new(3, 2),
            take_profit_limit_offset: Decimal::new(1, 2),
            fallback_taker_rate: Decimal::new(45, 5),
            leverage_sync_ttl: Duration::from_secs(60),
            meta_ttl: Duration::from_secs(600),
            account_cache_ttl: Duration::from_secs(2),
            fee_cache_ttl: Duration::from_secs(3600),
            cancel_batch_size: 5,
            cancel_batch_pause: Duration::from_millis(250),
            owned_retention: Duration::from_secs(24 * 3600),
        }
    }
}

/// Summary of a cancel sweep.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CancelSweep {
    pub requested: usize,
    pub cancelled: usize,
    pub already_gone: usize,
    pub failed: usize,
}

#[derive(Default)]
struct Caches {
    metas: HashMap<Coin, (CoinMeta, Instant)>,
    account: Option<(ClearinghouseSnapshot, Instant)>,
    fees: Option<(FeeSchedule, Instant)>,
    leverage_synced: HashMap<Coin, Instant>,
}

/// Places and cancels orders, owning the caches and the owned-order
/// ledger. Cheap to share via `Arc`; all interior state is behind async
/// mutexes and only touched from executor methods.
pub struct OrderExecutor {
    trading: Arc<dyn TradingClient>,
    market: Arc<dyn MarketDataClient>,
    agent_id: Uuid,
    config: ExecutorConfig,
    retry: RetryPolicy,
    caches: Mutex<Caches>,
    owned: Mutex<OwnedOrderLedger>,
}

impl OrderExecutor {
    #[must_use]
    pub fn new(
        trading: Arc<dyn TradingClient>,
        market: Arc<dyn MarketDataClient>,
        agent_id: Uuid,
        config: ExecutorConfig,
    ) -> Self {
        let owned = OwnedOrderLedger::new(agent_id, config.owned_retention);
        Self {
            trading,
            market,
            agent_id,
            config,
            retry: RetryPolicy::default(),
            caches: Mutex::new(Caches::default()),
            owned: Mutex::new(owned),
        }
    }

    /// Access the owned-order ledger (persistence wiring, assertions).
    pub async fn with_owned_orders<R>(&self, f: impl FnOnce(&mut OwnedOrderLedger) -> R) -> R {
        let mut owned = self.owned.lock().await;
        f(&mut owned)
    }

    /// The agent identity used for correlation ids.
    #[must_use]
    pub fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    /// Coin metadata, cached for the configured TTL.
    pub async fn coin_meta(&self, coin: &str) -> VenueResult<CoinMeta> {
        {
            let caches = self.caches.lock().await;
            if let Some((meta, stamp)) = caches.metas.get(coin) {
                if stamp.elapsed() < self.config.meta_ttl {
                    return Ok(meta.clone());
                }
            }
        }
        let meta = retry_on_rate_limit(self.retry, VenueError::is_rate_limit, || {
            self.market.coin_meta(coin)
        })
        .await?;
        self.caches
            .lock()
            .await
            .metas
            .insert(coin.to_string(), (meta.clone(), Instant::now()));
        Ok(meta)
    }

    /// Current mid for one coin.
    pub async fn mid(&self, coin: &str) -> VenueResult<Price> {
        let mids = retry_on_rate_limit(self.retry, VenueError::is_rate_limit, || {
            self.market.all_mids()
        })
        .await?;
        mids.get(coin)
            .copied()
            .ok_or_else(|| VenueError::InvalidRequest(format!("no mid for {coin}")))
    }

    /// Account snapshot, cached briefly to spare the venue during bursts.
    pub async fn account(&self) -> VenueResult<ClearinghouseSnapshot> {
        {
            let caches = self.caches.lock().await;
            if let Some((snapshot, stamp)) = &caches.account {
                if stamp.elapsed() < self.config.account_cache_ttl {
                    return Ok(snapshot.clone());
                }
            }
        }
        let snapshot = retry_on_rate_limit(self.retry, VenueError::is_rate_limit, || {
            self.trading.clearinghouse_state()
        })
        .await?;
        self.caches.lock().await.account = Some((snapshot.clone(), Instant::now()));
        Ok(snapshot)
    }

    /// Drops the cached account snapshot. Called after any call that
    /// mutates venue state has returned.
    pub async fn invalidate_account_cache(&self) {
        self.caches.lock().await.account = None;
    }

    /// Current fee schedule, with a conservative fallback when the query
    /// fails.
    pub async fn fee_schedule(&self) -> FeeSchedule {
        {
            let caches = self.caches.lock().await;
            if let Some((fees, stamp)) = &caches.fees {
                if stamp.elapsed() < self.config.fee_cache_ttl {
                    return *fees;
                }
            }
        }
        match retry_on_rate_limit(self.retry, VenueError::is_rate_limit, || {
            self.market.fee_schedule()
        })
        .await
        {
            Ok(fees) => {
                self.caches.lock().await.fees = Some((fees, Instant::now()));
                fees
            }
            Err(err) => {
                warn!(error = %err, "fee schedule unavailable, using fallback taker rate");
                FeeSchedule {
                    taker_rate: self.config.fallback_taker_rate,
                    maker_rate: Decimal::ZERO,
                }
            }
        }
    }

    /// Forces the next fee query to hit the venue.
    pub async fn refresh_fee_schedule(&self) {
        self.caches.lock().await.fees = None;
    }

    /// Ensures leverage is set for the coin, skipping the venue call when
    /// a sync happened within the TTL. Leverage is capped at the coin's
    /// maximum.
    pub async fn ensure_leverage(&self, coin: &str, max_leverage: u32) -> VenueResult<u32> {
        let leverage = self.config.default_leverage.min(max_leverage).max(1);
        {
            let caches = self.caches.lock().await;
            if let Some(stamp) = caches.leverage_synced.get(coin) {
                if stamp.elapsed() < self.config.leverage_sync_ttl {
                    return Ok(leverage);
                }
            }
        }
        self.trading.set_leverage(coin, leverage).await?;
        self.caches
            .lock()
            .await
            .leverage_synced
            .insert(coin.to_string(), Instant::now());
        debug!(coin, leverage, "leverage synced");
        Ok(leverage)
    }

    /// Places a market order, rendered as an aggressive immediate-or-cancel
    /// limit at the mid plus the slippage bound. Non-reduce-only orders are
    /// sized against the account: notional above
    /// `balance / (1/leverage + taker_rate)` clamps with a note, and a
    /// margin shortfall rejects with an itemized reason.
    pub async fn place_market(
        &self,
        coin: &str,
        side: Side,
        size: Quantity,
        reduce_only: bool,
    ) -> OrderResult {
        if size <= Decimal::ZERO {
            return OrderResult::rejected(size, format!("order size must be positive, got {size}"));
        }

        let meta = match self.coin_meta(coin).await {
            Ok(meta) => meta,
            Err(err) => return OrderResult::rejected(size, format!("coin metadata: {err}")),
        };
        let mid = match self.mid(coin).await {
            Ok(mid) => mid,
            Err(err) => return OrderResult::rejected(size, format!("mid price: {err}")),
        };
        let leverage = match self.ensure_leverage(coin, meta.max_leverage).await {
            Ok(leverage) => leverage,
            Err(err) => return OrderResult::rejected(size, format!("leverage sync: {err}")),
        };

        let mut order_size = round_to_lot(size, meta.size_decimals);
        if order_size.is_zero() {
            return OrderResult::rejected(
                size,
                format!("size {size} rounds to zero at {} decimals", meta.size_decimals),
            );
        }
        let mut notes = Vec::new();
        if order_size != size {
            notes.push(format!("size rounded from {size} to {order_size}"));
        }

        let fees = self.fee_schedule().await;
        if !reduce_only {
            let snapshot = match self.account().await {
                Ok(snapshot) => snapshot,
                Err(err) => return OrderResult::rejected(size, format!("account state: {err}")),
            };
            let balance = snapshot.available_balance;
            let leverage_dec = Decimal::from(leverage);
            let max_notional = safe_div(
                balance,
                safe_div(Decimal::ONE, leverage_dec) + fees.taker_rate,
            );
            let notional = mid * order_size;
            if notional > max_notional {
                let clamped = round_to_lot(safe_div(max_notional, mid), meta.size_decimals);
                if clamped.is_zero() {
                    return OrderResult::rejected(
                        size,
                        format!(
                            "balance {balance} supports at most {max_notional} notional, \
                             below one lot of {coin}"
                        ),
                    );
                }
                warn!(
                    coin,
                    requested = %order_size,
                    clamped = %clamped,
                    max_notional = %max_notional,
                    "order size clamped to affordable notional"
                );
                notes.push(format!(
                    "size clamped from {order_size} to {clamped} (max notional {max_notional})"
                ));
                order_size = clamped;
            }

            let final_notional = mid * order_size;
            let margin_needed = safe_div(final_notional, leverage_dec);
            let fee_reserve = final_notional * fees.taker_rate;
            if margin_needed + fee_reserve > balance {
                return OrderResult::rejected(
                    size,
                    format!(
                        "insufficient balance: need {margin_needed} margin + {fee_reserve} fees, \
                         have {balance}"
                    ),
                );
            }
        }

        let slippage = self.config.default_slippage;
        let raw_price = match side {
            Side::Buy => mid * (Decimal::ONE + slippage),
            Side::Sell => mid * (Decimal::ONE - slippage),
        };
        let limit_price = round_to_tick(raw_price, meta.size_decimals);

        let spec = OrderSpec {
            coin: coin.to_string(),
            side,
            size: order_size,
            price: limit_price,
            kind: OrderKind::Limit {
                tif: TimeInForce::ImmediateOrCancel,
            },
            reduce_only,
            correlation_id: Some(ids::new_correlation_id(self.agent_id)),
        };
        let mut result = self.submit(spec, fees.taker_rate).await;
        result.adjustments.splice(0..0, notes);
        result
    }

    /// Places a resting limit order.
    pub async fn place_limit(
        &self,
        coin: &str,
        side: Side,
        size: Quantity,
        price: Price,
        tif: TimeInForce,
        reduce_only: bool,
    ) -> OrderResult {
        if size <= Decimal::ZERO {
            return OrderResult::rejected(size, format!("order size must be positive, got {size}"));
        }
        let meta = match self.coin_meta(coin).await {
            Ok(meta) => meta,
            Err(err) => return OrderResult::rejected(size, format!("coin metadata: {err}")),
        };
        if let Err(err) = self.ensure_leverage(coin, meta.max_leverage).await {
            return OrderResult::rejected(size, format!("leverage sync: {err}"));
        }
        let order_size = round_to_lot(size, meta.size_decimals);
        if order_size.is_zero() {
            return OrderResult::rejected(
                size,
                format!("size {size} rounds to zero at {} decimals", meta.size_decimals),
            );
        }
        let fees = self.fee_schedule().await;
        let spec = OrderSpec {
            coin: coin.to_string(),
            side,
            size: order_size,
            price: round_to_tick(price, meta.size_decimals),
            kind: OrderKind::Limit { tif },
            reduce_only,
            correlation_id: Some(ids::new_correlation_id(self.agent_id)),
        };
        self.submit(spec, fees.maker_rate).await
    }

    /// Places a reduce-only stop-loss protecting a position. The limit
    /// price sits `stop_loss_limit_offset` beyond the trigger so the order
    /// fills through fast moves.
    pub async fn place_stop_loss(
        &self,
        coin: &str,
        protects: PositionSide,
        size: Quantity,
        trigger_price: Price,
    ) -> OrderResult {
        let offset = self.config.stop_loss_limit_offset;
        let side = protects.close_side();
        let limit_price = match side {
            Side::Sell => trigger_price * (Decimal::ONE - offset),
            Side::Buy => trigger_price * (Decimal::ONE + offset),
        };
        self.place_trigger(coin, side, size, trigger_price, limit_price, ProtectionKind::StopLoss)
            .await
    }

    /// Places a reduce-only take-profit. The limit price concedes
    /// `take_profit_limit_offset` from the trigger.
    pub async fn place_take_profit(
        &self,
        coin: &str,
        protects: PositionSide,
        size: Quantity,
        trigger_price: Price,
    ) -> OrderResult {
        let offset = self.config.take_profit_limit_offset;
        let side = protects.close_side();
        let limit_price = match side {
            Side::Sell => trigger_price * (Decimal::ONE - offset),
            Side::Buy => trigger_price * (Decimal::ONE + offset),
        };
        self.place_trigger(coin, side, size, trigger_price, limit_price, ProtectionKind::TakeProfit)
            .await
    }

    /// Places a stop derived from the current mid and a trail percentage:
    /// below the mid when protecting a long, above when protecting a
    /// short.
    pub async fn place_trailing_stop(
        &self,
        coin: &str,
        protects: PositionSide,
        size: Quantity,
        trail_percent: Decimal,
    ) -> OrderResult {
        let mid = match self.mid(coin).await {
            Ok(mid) => mid,
            Err(err) => return OrderResult::rejected(size, format!("mid price: {err}")),
        };
        let fraction = trail_percent / Decimal::ONE_HUNDRED;
        let trigger = match protects {
            PositionSide::Long => mid * (Decimal::ONE - fraction),
            PositionSide::Short => mid * (Decimal::ONE + fraction),
        };
        self.place_stop_loss(coin, protects, size, trigger).await
    }

    async fn place_trigger(
        &self,
        coin: &str,
        side: Side,
        size: Quantity,
        trigger_price: Price,
        limit_price: Price,
        protection: ProtectionKind,
    ) -> OrderResult {
        if size <= Decimal::ZERO {
            return OrderResult::rejected(size, format!("order size must be positive, got {size}"));
        }
        let meta = match self.coin_meta(coin).await {
            Ok(meta) => meta,
            Err(err) => return OrderResult::rejected(size, format!("coin metadata: {err}")),
        };
        let order_size = round_to_lot(size, meta.size_decimals);
        if order_size.is_zero() {
            return OrderResult::rejected(
                size,
                format!("size {size} rounds to zero at {} decimals", meta.size_decimals),
            );
        }
        let fees = self.fee_schedule().await;
        let spec = OrderSpec {
            coin: coin.to_string(),
            side,
            size: order_size,
            price: round_to_tick(limit_price, meta.size_decimals),
            kind: OrderKind::Trigger {
                trigger_price: round_to_tick(trigger_price, meta.size_decimals),
                is_market: false,
                protection,
            },
            reduce_only: true,
            correlation_id: Some(ids::new_correlation_id(self.agent_id)),
        };
        self.submit(spec, fees.taker_rate).await
    }

    /// Closes all or part of the venue position for `coin` with a
    /// reduce-only market order. Sizes above the held amount clamp.
    pub async fn close_position(&self, coin: &str, size: Option<Quantity>) -> OrderResult {
        let snapshot = match self.account().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                return OrderResult::rejected(
                    size.unwrap_or(Decimal::ZERO),
                    format!("account state: {err}"),
                )
            }
        };
        let Some(position) = snapshot
            .positions
            .iter()
            .find(|position| position.coin == coin && !position.signed_size.is_zero())
        else {
            return OrderResult::rejected(
                size.unwrap_or(Decimal::ZERO),
                format!("no open position for {coin}"),
            );
        };

        let held = position.abs_size();
        let mut close_size = size.unwrap_or(held);
        let mut note = None;
        if close_size > held {
            note = Some(format!("close size clamped from {close_size} to held {held}"));
            close_size = held;
        }
        let side = if position.is_long() {
            Side::Sell
        } else {
            Side::Buy
        };
        let mut result = self.place_market(coin, side, close_size, true).await;
        if let Some(note) = note {
            result.adjustments.insert(0, note);
        }
        result
    }

    /// Cancels one order by venue id.
    pub async fn cancel_order(&self, coin: &str, order_id: OrderId) -> VenueResult<CancelOutcome> {
        let outcome = self.trading.cancel_order(coin, order_id).await;
        self.invalidate_account_cache().await;
        outcome
    }

    /// Cancels one order by correlation id and updates the owned ledger.
    pub async fn cancel_by_correlation(
        &self,
        coin: &str,
        correlation_id: &str,
    ) -> VenueResult<CancelOutcome> {
        let outcome = self
            .trading
            .cancel_by_correlation(coin, &correlation_id.to_string())
            .await;
        self.invalidate_account_cache().await;
        if let Ok(outcome) = &outcome {
            let status = match outcome {
                CancelOutcome::Cancelled => OwnedStatus::Cancelled,
                CancelOutcome::AlreadyGone { .. } => OwnedStatus::ClosedExternal,
            };
            self.owned
                .lock()
                .await
                .mark(correlation_id, status, Utc::now());
        }
        outcome
    }

    /// Cancels every open order this agent placed, in small batches with a
    /// pause between them. Orders the venue reports already gone are
    /// marked `closed_external` and not retried.
    pub async fn cancel_agent_orders(&self) -> CancelSweep {
        let targets: Vec<OwnedOrder> = {
            let owned = self.owned.lock().await;
            owned.open_orders()
        };
        let mut sweep = CancelSweep {
            requested: targets.len(),
            ..CancelSweep::default()
        };
        info!(orders = targets.len(), "cancel sweep starting");

        for batch in targets.chunks(self.config.cancel_batch_size.max(1)) {
            for order in batch {
                match self
                    .trading
                    .cancel_by_correlation(&order.coin, &order.correlation_id)
                    .await
                {
                    Ok(CancelOutcome::Cancelled) => {
                        sweep.cancelled += 1;
                        self.owned.lock().await.mark(
                            &order.correlation_id,
                            OwnedStatus::Cancelled,
                            Utc::now(),
                        );
                    }
                    Ok(CancelOutcome::AlreadyGone { reason }) => {
                        sweep.already_gone += 1;
                        debug!(
                            coin = %order.coin,
                            correlation_id = %order.correlation_id,
                            reason,
                            "order already gone"
                        );
                        self.owned.lock().await.mark(
                            &order.correlation_id,
                            OwnedStatus::ClosedExternal,
                            Utc::now(),
                        );
                    }
                    Err(err) => {
                        sweep.failed += 1;
                        warn!(
                            coin = %order.coin,
                            correlation_id = %order.correlation_id,
                            error = %err,
                            "cancel failed"
                        );
                    }
                }
            }
            if batch.len() == self.config.cancel_batch_size {
                tokio::time::sleep(self.config.cancel_batch_pause).await;
            }
        }
        self.invalidate_account_cache().await;
        info!(?sweep, "cancel sweep finished");
        sweep
    }

    /// Cancels every open order on the account, including orders placed by
    /// other agents. Only safe on accounts this agent has to itself.
    pub async fn cancel_all_orders(&self) -> VenueResult<CancelSweep> {
        let open = retry_on_rate_limit(self.retry, VenueError::is_rate_limit, || {
            self.trading.open_orders()
        })
        .await?;
        let mut sweep = CancelSweep {
            requested: open.len(),
            ..CancelSweep::default()
        };
        warn!(orders = open.len(), "cancelling ALL account orders, not just this agent's");
        for batch in open.chunks(self.config.cancel_batch_size.max(1)) {
            for order in batch {
                match self.trading.cancel_order(&order.coin, order.order_id).await {
                    Ok(CancelOutcome::Cancelled) => sweep.cancelled += 1,
                    Ok(CancelOutcome::AlreadyGone { .. }) => sweep.already_gone += 1,
                    Err(err) => {
                        sweep.failed += 1;
                        warn!(order_id = order.order_id, error = %err, "cancel failed");
                    }
                }
            }
            if batch.len() == self.config.cancel_batch_size {
                tokio::time::sleep(self.config.cancel_batch_pause).await;
            }
        }
        self.invalidate_account_cache().await;
        Ok(sweep)
    }

    async fn submit(&self, spec: OrderSpec, fee_rate: Decimal) -> OrderResult {
        let requested_size = spec.size;
        let correlation_id = spec.correlation_id.clone();
        let coin = spec.coin.clone();
        let side = spec.side;
        let price = spec.price;

        let ack = self.trading.place_order(spec).await;
        // The placement has returned; whatever it did to the account, the
        // cached snapshot is stale now.
        self.invalidate_account_cache().await;

        let ack = match ack {
            Ok(ack) => ack,
            Err(err) => {
                warn!(coin = %coin, error = %err, "order placement failed");
                let mut result = OrderResult::rejected(requested_size, err.to_string());
                result.correlation_id = correlation_id;
                return result;
            }
        };

        let now = Utc::now();
        let (status, filled_size, average_price, error) = match &ack.status {
            AckStatus::Resting => (OrderStatus::Open, None, None, None),
            AckStatus::Filled {
                average_price,
                total_size,
            } => (
                OrderStatus::Filled,
                Some(*total_size),
                Some(*average_price),
                None,
            ),
            AckStatus::Rejected { reason } => {
                (OrderStatus::Error, None, None, Some(reason.clone()))
            }
        };

        if let Some(correlation_id) = &correlation_id {
            let owned_status = match status {
                OrderStatus::Open => OwnedStatus::Open,
                OrderStatus::Filled => OwnedStatus::Filled,
                OrderStatus::Cancelled => OwnedStatus::Cancelled,
                OrderStatus::Error => OwnedStatus::Cancelled,
            };
            if status != OrderStatus::Error {
                let mut owned = self.owned.lock().await;
                owned.record_placement(OwnedOrder {
                    correlation_id: correlation_id.clone(),
                    coin: coin.clone(),
                    side,
                    size: requested_size,
                    price,
                    order_id: ack.order_id,
                    status: owned_status,
                    placed_at: now,
                    updated_at: now,
                });
            }
        }

        let fee = match (filled_size, average_price) {
            (Some(size), Some(avg)) => Some(avg * size * fee_rate),
            _ => None,
        };
        let success = status != OrderStatus::Error;
        if success {
            info!(
                coin = %coin,
                side = %side,
                status = ?status,
                size = %requested_size,
                order_id = ?ack.order_id,
                "order placed"
            );
        }
        OrderResult {
            success,
            status,
            order_id: ack.order_id,
            correlation_id,
            requested_size,
            filled_size,
            average_price,
            fee,
            fee_rate: Some(fee_rate),
            adjustments: Vec::new(),
            error,
        }
    }
}
