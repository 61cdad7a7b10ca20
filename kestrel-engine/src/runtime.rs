//! The agent runtime: owns the trigger table and the position ledger,
//! drives evaluation, and reacts to realtime events.
//!
//! Exactly one task runs the loop. Stream callbacks, scheduled timers,
//! and external control all communicate through the runtime's event
//! queue; nothing else touches the tables.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use kestrel_core::{Coin, Fill, Interval, Price, Quantity, Side};
use kestrel_execution::{OrderExecutor, OrderResult, OrderStatus};
use kestrel_indicators::FieldSelector;
use kestrel_ledger::{CloseStatus, PositionLedger};
use kestrel_stream::StreamMultiplexer;
use kestrel_venue::{MarketDataClient, TradingClient};

use crate::safety::{SafetyLimits, SafetyVerdict};
use crate::status::StatusForwarder;
use crate::trigger::{
    CompositeOp, CompositeState, Condition, EventFilter, LegState, TechnicalShape,
    TriggerCallback, TriggerFire, TriggerId, TriggerKind, TriggerSpec, ValueCondition,
};

/// Engine tunables.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub eval_min_sleep: Duration,
    pub eval_max_sleep: Duration,
    /// Minimum spacing between technical evaluations of one trigger.
    pub technical_min_interval: Duration,
    /// Candle count floor for technical evaluation.
    pub min_candles: usize,
    /// Candle fetches request `max_period * lookback_multiplier` bars.
    pub lookback_multiplier: usize,
    /// Cached mids older than this trigger a direct query.
    pub mid_staleness: Duration,
    pub reconcile_interval: Duration,
    pub fee_refresh_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            eval_min_sleep: Duration::from_millis(250),
            eval_max_sleep: Duration::from_secs(4),
            technical_min_interval: Duration::from_secs(60),
            min_candles: 20,
            lookback_multiplier: 3,
            mid_staleness: Duration::from_secs(10),
            reconcile_interval: Duration::from_secs(300),
            fee_refresh_interval: Duration::from_secs(3600),
        }
    }
}

impl EngineConfig {
    /// Builds engine tunables from loaded application settings.
    #[must_use]
    pub fn from_settings(settings: &kestrel_config::EngineSettings) -> Self {
        Self {
            eval_min_sleep: Duration::from_millis(settings.eval_min_sleep_ms),
            eval_max_sleep: Duration::from_millis(settings.eval_max_sleep_ms),
            technical_min_interval: Duration::from_secs(settings.technical_min_interval_secs),
            min_candles: settings.min_candles,
            lookback_multiplier: settings.lookback_multiplier,
            mid_staleness: Duration::from_secs(settings.mid_staleness_secs),
            reconcile_interval: Duration::from_secs(settings.reconcile_interval_secs),
            fee_refresh_interval: Duration::from_secs(settings.fee_refresh_secs),
        }
    }
}

/// Trigger registration errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("composite triggers need at least two legs, got {0}")]
    CompositeTooSmall(usize),
    #[error("scheduled trigger interval must be positive")]
    ZeroInterval,
}

/// Everything that can reach the runtime loop.
#[derive(Debug)]
pub enum RuntimeEvent {
    /// Fresh mid prices from the realtime stream.
    Mids(HashMap<Coin, Price>),
    /// A fill of one of the account's orders.
    UserFill(Fill),
    /// A liquidation reported on the account's event feed.
    Liquidation {
        coin: Coin,
        size: Quantity,
        price: Price,
    },
    /// A public trade.
    Trade {
        coin: Coin,
        size: Quantity,
        price: Price,
    },
    /// An order book snapshot's top of book.
    Book {
        coin: Coin,
        best_bid: Price,
        best_ask: Price,
    },
    ScheduledFire(TriggerId),
    RemoveTrigger(TriggerId),
    Pause,
    Resume,
    Reconcile,
    RefreshFees,
    Shutdown,
}

/// Cloneable control handle for a running agent.
#[derive(Clone)]
pub struct AgentHandle {
    tx: mpsc::UnboundedSender<RuntimeEvent>,
}

impl AgentHandle {
    pub fn send(&self, event: RuntimeEvent) {
        if self.tx.send(event).is_err() {
            debug!("runtime has stopped, event dropped");
        }
    }

    pub fn pause(&self) {
        self.send(RuntimeEvent::Pause);
    }

    pub fn resume(&self) {
        self.send(RuntimeEvent::Resume);
    }

    pub fn remove_trigger(&self, id: TriggerId) {
        self.send(RuntimeEvent::RemoveTrigger(id));
    }

    pub fn shutdown(&self) {
        self.send(RuntimeEvent::Shutdown);
    }
}

struct TriggerEntry {
    spec: TriggerSpec,
    leg_states: Vec<LegState>,
    composite: CompositeState,
    last_technical_eval: Option<Instant>,
    fire_count: u64,
}

impl TriggerEntry {
    fn new(spec: TriggerSpec) -> Self {
        let legs = match &spec.kind {
            TriggerKind::Single(_) => 1,
            TriggerKind::Composite { legs, .. } => legs.len(),
            _ => 0,
        };
        Self {
            spec,
            leg_states: vec![LegState::default(); legs],
            composite: CompositeState::default(),
            last_technical_eval: None,
            fire_count: 0,
        }
    }

    fn has_technical_legs(&self) -> bool {
        match &self.spec.kind {
            TriggerKind::Single(condition) => matches!(condition, Condition::Technical(_)),
            TriggerKind::Composite { legs, .. } => legs
                .iter()
                .any(|leg| matches!(leg, Condition::Technical(_))),
            _ => false,
        }
    }
}

type CandleCache = HashMap<(Coin, Interval), Result<Vec<Decimal>, String>>;

/// The agent runtime. Owns the trigger table and position ledger.
pub struct AgentRuntime {
    config: EngineConfig,
    executor: Arc<OrderExecutor>,
    trading: Arc<dyn TradingClient>,
    market: Arc<dyn MarketDataClient>,
    ledger: PositionLedger,
    safety: SafetyLimits,
    status: StatusForwarder,
    stream: Option<StreamMultiplexer>,

    triggers: HashMap<TriggerId, TriggerEntry>,
    scheduled_tasks: HashMap<TriggerId, JoinHandle<()>>,
    background_tasks: Vec<JoinHandle<()>>,

    mids: HashMap<Coin, Price>,
    mids_updated: Option<Instant>,
    last_reconcile: DateTime<Utc>,
    paused: bool,

    events_tx: mpsc::UnboundedSender<RuntimeEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<RuntimeEvent>>,
}

impl AgentRuntime {
    #[must_use]
    pub fn new(
        config: EngineConfig,
        executor: Arc<OrderExecutor>,
        trading: Arc<dyn TradingClient>,
        market: Arc<dyn MarketDataClient>,
        ledger: PositionLedger,
        safety: SafetyLimits,
        status: StatusForwarder,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            executor,
            trading,
            market,
            ledger,
            safety,
            status,
            stream: None,
            triggers: HashMap::new(),
            scheduled_tasks: HashMap::new(),
            background_tasks: Vec::new(),
            mids: HashMap::new(),
            mids_updated: None,
            last_reconcile: Utc::now(),
            paused: false,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Stream to close (without reconnecting) on shutdown.
    pub fn attach_stream(&mut self, stream: StreamMultiplexer) {
        self.stream = Some(stream);
    }

    /// Control handle; stream callbacks and timers feed events through it.
    #[must_use]
    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            tx: self.events_tx.clone(),
        }
    }

    /// Registers a trigger before the loop starts. Invalid shapes are
    /// rejected here, before any state is created.
    pub fn add_trigger(&mut self, spec: TriggerSpec) -> Result<TriggerId, EngineError> {
        match &spec.kind {
            TriggerKind::Composite { legs, .. } if legs.len() < 2 => {
                return Err(EngineError::CompositeTooSmall(legs.len()));
            }
            TriggerKind::Scheduled { every } if every.is_zero() => {
                return Err(EngineError::ZeroInterval);
            }
            _ => {}
        }
        let id = TriggerId::new();
        info!(trigger = %id, name = %spec.name, "trigger registered");
        self.triggers.insert(id, TriggerEntry::new(spec));
        Ok(id)
    }

    /// The ledger, for inspection and pre-run restore wiring.
    #[must_use]
    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    #[must_use]
    pub fn ledger_mut(&mut self) -> &mut PositionLedger {
        &mut self.ledger
    }

    /// Checks the proposed entry against the safety limits, reporting the
    /// verdict either way.
    #[must_use]
    pub fn check_safety(&self, coin: &str, size: Quantity) -> SafetyVerdict {
        let verdict = self.safety.check(coin, size, &self.ledger);
        if let Some(reason) = &verdict.reason {
            self.status.report(
                "safety",
                json!({ "coin": coin, "size": size.to_string() }),
                reason.clone(),
            );
        }
        verdict
    }

    /// Safety-checked market entry: refused orders never reach the venue,
    /// and fills are recorded in the ledger.
    pub async fn guarded_market_entry(
        &mut self,
        coin: &str,
        side: Side,
        size: Quantity,
    ) -> OrderResult {
        let verdict = self.check_safety(coin, size);
        if !verdict.allowed {
            return OrderResult::rejected(
                size,
                verdict.reason.unwrap_or_else(|| "blocked by safety limits".into()),
            );
        }
        let result = self.executor.place_market(coin, side, size, false).await;
        if result.status == OrderStatus::Filled {
            if let (Some(filled), Some(price)) = (result.filled_size, result.average_price) {
                let fee = result.fee.unwrap_or(Decimal::ZERO);
                self.ledger
                    .open_or_add(coin, side, filled, price, fee, Utc::now());
            }
        }
        self.status.report(
            "order",
            json!({
                "coin": coin,
                "side": side.to_string(),
                "status": format!("{:?}", result.status),
            }),
            format!(
                "Market {side} {size} {coin}: {:?}{}",
                result.status,
                result
                    .error
                    .as_deref()
                    .map(|e| format!(" ({e})"))
                    .unwrap_or_default()
            ),
        );
        result
    }

    /// Runs until shutdown. Returns the runtime so callers can inspect
    /// final state.
    pub async fn run(mut self) -> Self {
        let Some(mut events_rx) = self.events_rx.take() else {
            warn!("runtime already ran once, refusing to run again");
            return self;
        };
        self.spawn_scheduled_tasks();
        self.spawn_background_timers();
        info!(triggers = self.triggers.len(), "agent runtime started");

        // The evaluation deadline lives outside the select so inbound
        // events cannot postpone it; a busy mids feed must not starve
        // the sampling loop.
        let mut delay = self.config.eval_max_sleep;
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = sleep.as_mut() => {
                    let fired = if self.paused { 0 } else { self.evaluate_pass().await };
                    delay = if fired > 0 {
                        self.config.eval_min_sleep
                    } else {
                        (delay * 2).min(self.config.eval_max_sleep)
                    };
                    sleep.as_mut().reset(tokio::time::Instant::now() + delay);
                }
                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    if matches!(event, RuntimeEvent::Shutdown) {
                        info!("shutdown requested");
                        break;
                    }
                    self.handle_event(event).await;
                }
            }
        }

        self.shutdown().await;
        self
    }

    /// Orderly teardown: timers first, then the realtime connection. Venue
    /// calls are awaited inline by the loop, so none are in flight here.
    async fn shutdown(&mut self) {
        for (_, task) in self.scheduled_tasks.drain() {
            task.abort();
        }
        for task in self.background_tasks.drain(..) {
            task.abort();
        }
        if let Some(stream) = self.stream.take() {
            if stream.close().is_err() {
                debug!("stream already stopped");
            }
        }
        info!("agent runtime stopped");
    }

    fn spawn_scheduled_tasks(&mut self) {
        let scheduled: Vec<(TriggerId, Duration)> = self
            .triggers
            .iter()
            .filter_map(|(id, entry)| match entry.spec.kind {
                TriggerKind::Scheduled { every } => Some((*id, every)),
                _ => None,
            })
            .collect();
        for (id, every) in scheduled {
            let tx = self.events_tx.clone();
            let task = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if tx.send(RuntimeEvent::ScheduledFire(id)).is_err() {
                        break;
                    }
                }
            });
            self.scheduled_tasks.insert(id, task);
        }
    }

    fn spawn_background_timers(&mut self) {
        for (interval, event_of) in [
            (
                self.config.reconcile_interval,
                (|| RuntimeEvent::Reconcile) as fn() -> RuntimeEvent,
            ),
            (self.config.fee_refresh_interval, || RuntimeEvent::RefreshFees),
        ] {
            let tx = self.events_tx.clone();
            self.background_tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if tx.send(event_of()).is_err() {
                        break;
                    }
                }
            }));
        }
    }

    async fn handle_event(&mut self, event: RuntimeEvent) {
        match event {
            RuntimeEvent::Mids(mids) => {
                self.mids.extend(mids);
                self.mids_updated = Some(Instant::now());
            }
            RuntimeEvent::UserFill(fill) => self.apply_user_fill(fill).await,
            RuntimeEvent::Liquidation { coin, size, price } => {
                // A liquidation is an externally-initiated close; any
                // pending protection is moot once the venue has acted.
                if self.ledger.position(&coin).is_some() {
                    if let Some(closed) = self.ledger.apply_liquidation(&coin, price, Utc::now()) {
                        self.status.report(
                            "position",
                            json!({
                                "coin": closed.coin,
                                "net_pnl": closed.pnl.net.to_string(),
                            }),
                            format!(
                                "Liquidated on {}: position force-closed at {}, net PnL {}.",
                                closed.coin, price, closed.pnl.net
                            ),
                        );
                    }
                }
                self.fire_event_triggers(|filter| match filter {
                    EventFilter::Liquidation { min_size } => size >= *min_size,
                    _ => false,
                }, &coin, size, price)
                .await;
            }
            RuntimeEvent::Trade { coin, size, price } => {
                let event_coin = coin.clone();
                self.fire_event_triggers(move |filter| match filter {
                    EventFilter::LargeTrade { coin, min_size } => {
                        size >= *min_size
                            && coin.as_deref().map_or(true, |wanted| wanted == event_coin)
                    }
                    _ => false,
                }, &coin, size, price)
                .await;
            }
            RuntimeEvent::Book {
                coin,
                best_bid,
                best_ask,
            } => {
                let midpoint = (best_bid + best_ask) / Decimal::TWO;
                let event_coin = coin.clone();
                self.fire_event_triggers(
                    move |filter| match filter {
                        EventFilter::BookUpdate { coin } => {
                            coin.as_deref().map_or(true, |wanted| wanted == event_coin)
                        }
                        _ => false,
                    },
                    &coin,
                    Decimal::ZERO,
                    midpoint,
                )
                .await;
            }
            RuntimeEvent::ScheduledFire(id) => {
                if self.paused {
                    debug!(trigger = %id, "paused, scheduled fire skipped");
                    return;
                }
                self.fire_trigger(id, None, "scheduled interval elapsed".into())
                    .await;
            }
            RuntimeEvent::RemoveTrigger(id) => {
                if self.triggers.remove(&id).is_some() {
                    info!(trigger = %id, "trigger removed");
                }
                if let Some(task) = self.scheduled_tasks.remove(&id) {
                    task.abort();
                }
            }
            RuntimeEvent::Pause => {
                self.paused = true;
                self.status
                    .report("runtime", json!({}), "Agent paused; triggers are held.");
            }
            RuntimeEvent::Resume => {
                self.paused = false;
                self.status
                    .report("runtime", json!({}), "Agent resumed; triggers are live.");
            }
            RuntimeEvent::Reconcile => self.reconcile().await,
            RuntimeEvent::RefreshFees => {
                self.executor.refresh_fee_schedule().await;
                let fees = self.executor.fee_schedule().await;
                debug!(taker = %fees.taker_rate, "fee schedule refreshed");
            }
            RuntimeEvent::Shutdown => {}
        }
    }

    /// Routes a fill of the account's orders: protective orders first,
    /// then entry/exit bookkeeping for orders this agent owns.
    async fn apply_user_fill(&mut self, fill: Fill) {
        if self.paused {
            debug!(coin = %fill.coin, "paused, user fill recorded without trigger fan-out");
        }
        if let Some(closed) = self.ledger.match_protective_fill(&fill) {
            self.status.report(
                "position",
                json!({
                    "coin": closed.coin,
                    "status": format!("{:?}", closed.status),
                    "net_pnl": closed.pnl.net.to_string(),
                }),
                format!(
                    "{} filled for {}: net PnL {}.",
                    match closed.status {
                        CloseStatus::StopLoss => "Stop-loss",
                        CloseStatus::TakeProfit => "Take-profit",
                        _ => "Protective order",
                    },
                    closed.coin,
                    closed.pnl.net
                ),
            );
        } else if let Some(correlation_id) = fill.correlation_id.clone() {
            let owned = self
                .executor
                .with_owned_orders(|orders| orders.owns(&correlation_id))
                .await;
            if owned {
                self.apply_owned_fill(&fill);
            }
        }

        if !self.paused {
            let coin = fill.coin.clone();
            let size = fill.size;
            let price = fill.price;
            self.fire_event_triggers(
                |filter| matches!(filter, EventFilter::UserFill),
                &coin,
                size,
                price,
            )
            .await;
        }
    }

    fn apply_owned_fill(&mut self, fill: &Fill) {
        let reduces = self
            .ledger
            .position(&fill.coin)
            .is_some_and(|position| position.side.close_side() == fill.side);
        if reduces && fill.closed_pnl.is_some() {
            if let Err(err) = self.ledger.close(
                &fill.coin,
                Some(fill.size),
                fill.price,
                fill.fee,
                CloseStatus::Closed,
                false,
                fill.timestamp,
            ) {
                warn!(coin = %fill.coin, error = %err, "exit fill could not be applied");
            }
        } else {
            self.ledger.open_or_add(
                &fill.coin,
                fill.side,
                fill.size,
                fill.price,
                fill.fee,
                fill.timestamp,
            );
        }
    }

    async fn fire_event_triggers<F>(&mut self, matches: F, coin: &str, size: Quantity, price: Price)
    where
        F: Fn(&EventFilter) -> bool,
    {
        if self.paused {
            return;
        }
        let due: Vec<TriggerId> = self
            .triggers
            .iter()
            .filter_map(|(id, entry)| match &entry.spec.kind {
                TriggerKind::Event(filter) if matches(filter) => Some(*id),
                _ => None,
            })
            .collect();
        for id in due {
            self.fire_trigger(
                id,
                Some(price),
                format!("event on {coin}: size {size} at {price}"),
            )
            .await;
        }
    }

    /// One evaluation pass over price, technical, and composite triggers.
    /// Returns the number of triggers fired.
    async fn evaluate_pass(&mut self) -> usize {
        self.refresh_mids_if_stale().await;
        let candles = self.fetch_due_candles().await;

        let now = Instant::now();
        let mut fired: Vec<(TriggerId, Option<Decimal>, String)> = Vec::new();
        let mut evaluated = 0usize;
        let mut technical_evaluated = false;

        for (id, entry) in &mut self.triggers {
            let technical_due = entry.last_technical_eval.map_or(true, |at| {
                now.duration_since(at) >= self.config.technical_min_interval
            });
            if entry.has_technical_legs() && !technical_due {
                continue;
            }

            match &entry.spec.kind {
                TriggerKind::Single(condition) => {
                    let Some((value, value_condition)) =
                        resolve_condition(condition, &self.mids, &candles, &self.status)
                    else {
                        if matches!(condition, Condition::Technical(_)) {
                            entry.last_technical_eval = Some(now);
                        }
                        continue;
                    };
                    if matches!(condition, Condition::Technical(_)) {
                        entry.last_technical_eval = Some(now);
                        technical_evaluated = true;
                    }
                    evaluated += 1;
                    let outcome = entry.leg_states[0].observe(&value_condition, value);
                    if outcome.edge {
                        fired.push((
                            *id,
                            Some(value),
                            format!("condition met: observed {value} against {value_condition:?}"),
                        ));
                    } else if outcome.satisfied {
                        debug!(trigger = %id, "condition still satisfied, no new edge");
                    }
                }
                TriggerKind::Composite { operator, legs } => {
                    if entry.has_technical_legs() {
                        entry.last_technical_eval = Some(now);
                        technical_evaluated = true;
                    }
                    evaluated += 1;
                    let mut satisfied_legs = Vec::with_capacity(legs.len());
                    let mut observed = None;
                    let mut complete = true;
                    for (leg, state) in legs.iter().zip(entry.leg_states.iter_mut()) {
                        let Some((value, value_condition)) =
                            resolve_condition(leg, &self.mids, &candles, &self.status)
                        else {
                            complete = false;
                            break;
                        };
                        let outcome = state.observe(&value_condition, value);
                        satisfied_legs.push(outcome.satisfied);
                        observed.get_or_insert(value);
                    }
                    if !complete {
                        continue;
                    }
                    let combined = match operator {
                        CompositeOp::All => satisfied_legs.iter().all(|s| *s),
                        CompositeOp::Any => satisfied_legs.iter().any(|s| *s),
                    };
                    if entry.composite.observe(combined) {
                        fired.push((
                            *id,
                            observed,
                            format!(
                                "composite {:?} satisfied across {} legs",
                                operator,
                                legs.len()
                            ),
                        ));
                    }
                }
                TriggerKind::Scheduled { .. } | TriggerKind::Event(_) => {}
            }
        }

        let count = fired.len();
        for (id, observed, detail) in fired {
            self.fire_trigger(id, observed, detail).await;
        }
        // "Nothing happened" is a decision too, but only worth a line when
        // a rate-limited technical evaluation actually ran.
        if count == 0 && technical_evaluated {
            self.status.report(
                "engine",
                json!({ "evaluated": evaluated }),
                format!("Evaluated {evaluated} triggers; no conditions newly met."),
            );
        }
        count
    }

    async fn refresh_mids_if_stale(&mut self) {
        let needs_prices = self.triggers.values().any(|entry| {
            matches!(
                &entry.spec.kind,
                TriggerKind::Single(Condition::Price(_))
            ) || matches!(
                &entry.spec.kind,
                TriggerKind::Composite { legs, .. }
                    if legs.iter().any(|leg| matches!(leg, Condition::Price(_)))
            )
        });
        if !needs_prices {
            return;
        }
        let stale = self
            .mids_updated
            .map_or(true, |at| at.elapsed() > self.config.mid_staleness);
        if !stale {
            return;
        }
        match self.market.all_mids().await {
            Ok(mids) => {
                self.mids = mids;
                self.mids_updated = Some(Instant::now());
            }
            Err(err) => warn!(error = %err, "mid refresh failed, evaluating with stale prices"),
        }
    }

    /// One deduplicated candle fetch per (coin, interval) needed by a due
    /// technical trigger.
    async fn fetch_due_candles(&mut self) -> CandleCache {
        let now = Instant::now();
        let mut wanted: HashMap<(Coin, Interval), usize> = HashMap::new();
        for entry in self.triggers.values() {
            if !entry.has_technical_legs() {
                continue;
            }
            let due = entry.last_technical_eval.map_or(true, |at| {
                now.duration_since(at) >= self.config.technical_min_interval
            });
            if !due {
                continue;
            }
            let legs: Vec<&Condition> = match &entry.spec.kind {
                TriggerKind::Single(condition) => vec![condition],
                TriggerKind::Composite { legs, .. } => legs.iter().collect(),
                _ => continue,
            };
            for leg in legs {
                if let Condition::Technical(tech) = leg {
                    let limit = (tech.shape.max_period() * self.config.lookback_multiplier)
                        .max(self.config.min_candles);
                    wanted
                        .entry((tech.coin.clone(), tech.interval))
                        .and_modify(|existing| *existing = (*existing).max(limit))
                        .or_insert(limit);
                }
            }
        }

        let mut cache = CandleCache::new();
        for ((coin, interval), limit) in wanted {
            let result = match self.market.candles(&coin, interval, limit).await {
                Ok(candles) => {
                    if candles.len() < self.config.min_candles {
                        Err(format!(
                            "not enough data: {} candles, need {}",
                            candles.len(),
                            self.config.min_candles
                        ))
                    } else {
                        Ok(candles.iter().map(|candle| candle.close).collect())
                    }
                }
                Err(err) => Err(err.to_string()),
            };
            if let Err(reason) = &result {
                self.status.report(
                    "trigger",
                    json!({ "coin": coin, "interval": interval.as_str() }),
                    format!("Technical evaluation for {coin} {interval} skipped: {reason}."),
                );
            }
            cache.insert((coin, interval), result);
        }
        cache
    }

    async fn fire_trigger(&mut self, id: TriggerId, observed: Option<Decimal>, detail: String) {
        let Some(entry) = self.triggers.get_mut(&id) else {
            return;
        };
        entry.fire_count += 1;
        let fire = TriggerFire {
            trigger_id: id,
            name: entry.spec.name.clone(),
            coin: primary_coin(&entry.spec.kind),
            observed,
            detail: detail.clone(),
            fired_at: Utc::now(),
        };
        let callback: TriggerCallback = Arc::clone(&entry.spec.callback);
        let one_shot = entry.spec.one_shot;
        let name = entry.spec.name.clone();

        self.status.report(
            "trigger",
            json!({
                "trigger_id": id.to_string(),
                "name": name,
                "observed": observed.map(|v| v.to_string()),
            }),
            format!("Trigger '{name}' fired: {detail}"),
        );

        if let Err(err) = callback(fire).await {
            error!(trigger = %id, name = %name, error = %err, "trigger callback failed");
            self.status.report(
                "trigger",
                json!({ "trigger_id": id.to_string(), "name": name }),
                format!("Trigger '{name}' callback failed: {err}."),
            );
        }

        if one_shot {
            self.triggers.remove(&id);
            if let Some(task) = self.scheduled_tasks.remove(&id) {
                task.abort();
            }
            info!(trigger = %id, "one-shot trigger retired");
        }
    }

    /// One reconciliation pass: a single snapshot read, current mids, and
    /// the fill history since the last pass.
    async fn reconcile(&mut self) {
        let snapshot = match self.trading.clearinghouse_state().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(error = %err, "reconcile skipped, snapshot unavailable");
                return;
            }
        };
        let mids = match self.market.all_mids().await {
            Ok(mids) => {
                self.mids = mids.clone();
                self.mids_updated = Some(Instant::now());
                mids
            }
            Err(err) => {
                debug!(error = %err, "reconcile falling back to cached mids");
                self.mids.clone()
            }
        };
        let fills = self
            .trading
            .recent_fills(self.last_reconcile)
            .await
            .unwrap_or_default();
        self.last_reconcile = Utc::now();

        let report = self
            .ledger
            .reconcile(&snapshot.positions, &mids, &fills, Utc::now());
        let message = if report.is_clean() {
            "Reconciliation clean: local and venue state agree.".to_string()
        } else {
            format!(
                "Reconciliation: {} force-closed, {} protective closes, {} drift warnings, \
                 {} untracked venue positions.",
                report.force_closed.len(),
                report.protective_closes.len(),
                report.drift_warnings.len(),
                report.untracked.len()
            )
        };
        self.status.report(
            "reconcile",
            json!({
                "force_closed": report.force_closed.len(),
                "drift_warnings": report.drift_warnings.len(),
                "untracked": report.untracked,
            }),
            message,
        );
    }
}

/// Observed value and the condition to feed it through, or `None` when
/// the inputs are unavailable this pass. Two-series crossovers reduce to
/// a directional crossing of the fast-minus-slow difference through
/// zero.
fn resolve_condition(
    condition: &Condition,
    mids: &HashMap<Coin, Price>,
    candles: &CandleCache,
    status: &StatusForwarder,
) -> Option<(Decimal, ValueCondition)> {
    match condition {
        Condition::Price(price) => {
            let mid = mids.get(&price.coin)?;
            Some((*mid, price.condition))
        }
        Condition::Technical(tech) => {
            let closes = match candles.get(&(tech.coin.clone(), tech.interval)) {
                Some(Ok(closes)) => closes,
                _ => return None,
            };
            let report_error = |err: &dyn fmt::Display| {
                status.report(
                    "trigger",
                    json!({ "coin": tech.coin }),
                    format!("Indicator evaluation failed for {}: {err}.", tech.coin),
                );
            };
            match &tech.shape {
                TechnicalShape::Level {
                    indicator,
                    field,
                    condition,
                } => {
                    let value = match indicator.evaluate(closes) {
                        Ok(value) => value,
                        Err(err) => {
                            report_error(&err);
                            return None;
                        }
                    };
                    Some((field.extract(value)?, *condition))
                }
                TechnicalShape::Crossover { fast, slow }
                | TechnicalShape::Crossunder { fast, slow } => {
                    let (fast_value, slow_value) =
                        match (fast.evaluate(closes), slow.evaluate(closes)) {
                            (Ok(fast_value), Ok(slow_value)) => (fast_value, slow_value),
                            (Err(err), _) | (_, Err(err)) => {
                                report_error(&err);
                                return None;
                            }
                        };
                    let primary = FieldSelector::Primary;
                    let difference =
                        primary.extract(fast_value)? - primary.extract(slow_value)?;
                    let cross = if matches!(tech.shape, TechnicalShape::Crossover { .. }) {
                        ValueCondition::CrossesAbove(Decimal::ZERO)
                    } else {
                        ValueCondition::CrossesBelow(Decimal::ZERO)
                    };
                    Some((difference, cross))
                }
            }
        }
    }
}

fn primary_coin(kind: &TriggerKind) -> Option<Coin> {
    match kind {
        TriggerKind::Single(condition) => Some(condition.coin().to_string()),
        TriggerKind::Composite { legs, .. } => {
            legs.first().map(|leg| leg.coin().to_string())
        }
        TriggerKind::Event(EventFilter::LargeTrade { coin, .. })
        | TriggerKind::Event(EventFilter::BookUpdate { coin }) => coin.clone(),
        _ => None,
    }
}
