//! Durable position ledger.
//!
//! Tracks what the agent believes it holds: open positions with weighted
//! entries, realized-PnL history, pending protective orders, and a capped
//! trade log. The ledger is owned by the runtime task; every mutation is
//! synchronous and followed by an enqueued snapshot write.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use kestrel_core::store::{self, JsonFileWriter, StoreError};
use kestrel_core::{Coin, CorrelationId, Fill, OrderId, PositionSide, Price, Quantity, Side};
use kestrel_venue::{PerpPosition, ProtectionKind};

pub mod pnl;
pub mod trade_log;

mod reconcile;

pub use pnl::PnlBreakdown;
pub use reconcile::{DriftWarning, ReconcileReport};
pub use trade_log::{CappedLog, TradeRecord};

/// Errors raised by ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("no open position for {0}")]
    NoPosition(Coin),
    #[error("close size must be positive, got {0}")]
    InvalidCloseSize(Quantity),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How a position left the book.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseStatus {
    /// Ordinary close initiated by the agent.
    Closed,
    StopLoss,
    TakeProfit,
    Liquidated,
    /// The venue no longer shows the position; closed during
    /// reconciliation or by a cancel sweep discovering a terminal order.
    ClosedExternal,
    /// Auto-closed because an opposite-side trade replaced it.
    OppositeOverwrite,
}

/// One open position.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Position {
    pub coin: Coin,
    pub side: PositionSide,
    pub size: Quantity,
    /// Size-weighted average entry price.
    pub entry_price: Price,
    /// Cumulative entry fees across opens and adds.
    pub entry_fee: Decimal,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Entry notional of the current size.
    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.entry_price * self.size
    }
}

/// A fully or partially closed position with its realized outcome.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ClosedPosition {
    pub coin: Coin,
    pub side: PositionSide,
    pub size: Quantity,
    pub entry_price: Price,
    pub exit_price: Price,
    pub entry_fee: Decimal,
    pub exit_fee: Decimal,
    pub pnl: PnlBreakdown,
    pub status: CloseStatus,
    /// True when the exit price or fees were inferred rather than
    /// observed on a fill.
    pub estimated: bool,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

/// A protective order awaiting its fill.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PendingProtection {
    pub kind: ProtectionKind,
    pub order_id: Option<OrderId>,
    pub correlation_id: Option<CorrelationId>,
}

/// Tunables for the ledger.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LedgerConfig {
    /// Closed positions retained in memory and on disk.
    pub closed_history_cap: usize,
    /// Trade records retained.
    pub trade_log_cap: usize,
    /// Taker rate used when a fee must be estimated.
    pub estimated_taker_rate: Decimal,
    /// Size drift (percent of venue size) beyond which reconciliation
    /// warns.
    pub drift_warn_percent: Decimal,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            closed_history_cap: 500,
            trade_log_cap: 1000,
            estimated_taker_rate: Decimal::new(45, 5),
            drift_warn_percent: Decimal::ONE,
        }
    }
}

/// Durable portion of the ledger.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LedgerSnapshot {
    pub positions: HashMap<Coin, Position>,
    pub closed: CappedLog<ClosedPosition>,
    pub protections: HashMap<Coin, Vec<PendingProtection>>,
}

/// The ledger itself. Not `Clone`; exactly one owner mutates it.
pub struct PositionLedger {
    config: LedgerConfig,
    positions: HashMap<Coin, Position>,
    closed: CappedLog<ClosedPosition>,
    protections: HashMap<Coin, Vec<PendingProtection>>,
    trades: CappedLog<TradeRecord>,
    state_writer: Option<JsonFileWriter>,
    trade_writer: Option<JsonFileWriter>,
}

impl PositionLedger {
    #[must_use]
    pub fn new(config: LedgerConfig) -> Self {
        let closed = CappedLog::new(config.closed_history_cap);
        let trades = CappedLog::new(config.trade_log_cap);
        Self {
            config,
            positions: HashMap::new(),
            closed,
            protections: HashMap::new(),
            trades,
            state_writer: None,
            trade_writer: None,
        }
    }

    /// Wires up durable persistence. Each writer owns exactly one file.
    pub fn attach_persistence(&mut self, state: JsonFileWriter, trades: JsonFileWriter) {
        self.state_writer = Some(state);
        self.trade_writer = Some(trades);
    }

    /// Restores durable state written by a previous run.
    pub fn restore_from(&mut self, state_path: &Path) -> Result<(), LedgerError> {
        if let Some(snapshot) = store::load_snapshot::<LedgerSnapshot>(state_path)? {
            info!(
                positions = snapshot.positions.len(),
                closed = snapshot.closed.len(),
                "ledger state restored"
            );
            self.positions = snapshot.positions;
            self.closed = snapshot.closed;
            self.protections = snapshot.protections;
        }
        Ok(())
    }

    /// Applies an entry-side trade. An existing same-side position grows
    /// with a size-weighted entry; an opposite-side position is closed
    /// first at the new trade's price (fees estimated) and the closure is
    /// returned.
    pub fn open_or_add(
        &mut self,
        coin: &str,
        side: Side,
        size: Quantity,
        price: Price,
        fee: Decimal,
        now: DateTime<Utc>,
    ) -> Option<ClosedPosition> {
        let target = PositionSide::from_entry(side);
        let opposite = self
            .positions
            .get(coin)
            .filter(|existing| existing.side != target)
            .map(|existing| (existing.side, existing.size));

        let mut displaced = None;
        if let Some((old_side, old_size)) = opposite {
            // The exit fill for the old position is not observable here;
            // value it at the new trade's price with an estimated taker
            // fee.
            let exit_fee = price * old_size * self.config.estimated_taker_rate;
            warn!(
                coin,
                old_side = %old_side,
                new_side = %target,
                "opposite-side entry, closing prior position at new price (estimated)"
            );
            displaced = self
                .close_internal(
                    coin,
                    None,
                    price,
                    exit_fee,
                    CloseStatus::OppositeOverwrite,
                    true,
                    now,
                )
                .ok();
        }

        match self.positions.get_mut(coin) {
            Some(position) => {
                let total = position.size + size;
                position.entry_price =
                    (position.entry_price * position.size + price * size) / total;
                position.size = total;
                position.entry_fee += fee;
                position.updated_at = now;
                info!(coin, size = %total, entry = %position.entry_price, "position increased");
            }
            None => {
                self.positions.insert(
                    coin.to_string(),
                    Position {
                        coin: coin.to_string(),
                        side: target,
                        size,
                        entry_price: price,
                        entry_fee: fee,
                        opened_at: now,
                        updated_at: now,
                    },
                );
                info!(coin, side = %target, size = %size, entry = %price, "position opened");
            }
        }

        self.record_trade(coin, side, price, size, fee, true, "open", now);
        self.persist();
        displaced
    }

    /// Closes all or part of a position. `size` of `None` closes the whole
    /// position; an oversized request clamps to what is held. Partial
    /// closes take a proportional share of the entry fee; the remainder
    /// keeps the rest.
    pub fn close(
        &mut self,
        coin: &str,
        size: Option<Quantity>,
        exit_price: Price,
        exit_fee: Decimal,
        status: CloseStatus,
        estimated: bool,
        now: DateTime<Utc>,
    ) -> Result<ClosedPosition, LedgerError> {
        let closed = self.close_internal(coin, size, exit_price, exit_fee, status, estimated, now)?;
        self.persist();
        Ok(closed)
    }

    #[allow(clippy::too_many_arguments)]
    fn close_internal(
        &mut self,
        coin: &str,
        size: Option<Quantity>,
        exit_price: Price,
        exit_fee: Decimal,
        status: CloseStatus,
        estimated: bool,
        now: DateTime<Utc>,
    ) -> Result<ClosedPosition, LedgerError> {
        let position = self
            .positions
            .get_mut(coin)
            .ok_or_else(|| LedgerError::NoPosition(coin.to_string()))?;

        let requested = size.unwrap_or(position.size);
        if requested <= Decimal::ZERO {
            return Err(LedgerError::InvalidCloseSize(requested));
        }
        let close_size = requested.min(position.size);
        let full_close = close_size == position.size;

        let entry_fee_share = if full_close {
            position.entry_fee
        } else {
            position.entry_fee * close_size / position.size
        };

        let pnl = pnl::realized_pnl(
            position.side,
            position.entry_price,
            exit_price,
            close_size,
            entry_fee_share,
            exit_fee,
        );

        let closed = ClosedPosition {
            coin: coin.to_string(),
            side: position.side,
            size: close_size,
            entry_price: position.entry_price,
            exit_price,
            entry_fee: entry_fee_share,
            exit_fee,
            pnl,
            status,
            estimated,
            opened_at: position.opened_at,
            closed_at: now,
        };

        let close_order_side = position.side.close_side();
        if full_close {
            self.positions.remove(coin);
            self.protections.remove(coin);
        } else {
            position.size -= close_size;
            position.entry_fee -= entry_fee_share;
            position.updated_at = now;
        }

        info!(
            coin,
            status = ?status,
            size = %close_size,
            exit = %exit_price,
            net_pnl = %pnl.net,
            estimated,
            "position closed"
        );
        self.closed.push(closed.clone());
        self.record_trade(
            coin,
            close_order_side,
            exit_price,
            close_size,
            exit_fee,
            false,
            status_label(status),
            now,
        );
        Ok(closed)
    }

    /// Registers a resting protective order so its fill can be recognized
    /// later.
    pub fn register_protection(
        &mut self,
        coin: &str,
        kind: ProtectionKind,
        order_id: Option<OrderId>,
        correlation_id: Option<CorrelationId>,
    ) {
        self.protections
            .entry(coin.to_string())
            .or_default()
            .push(PendingProtection {
                kind,
                order_id,
                correlation_id,
            });
        self.persist();
    }

    /// Pending protections for a coin.
    #[must_use]
    pub fn protections(&self, coin: &str) -> &[PendingProtection] {
        self.protections.get(coin).map_or(&[], Vec::as_slice)
    }

    /// Matches a fill against pending protective orders. On a match the
    /// position is closed at the fill price and every protection for the
    /// coin is cleared: the venue cancels the sibling order of an OCO
    /// pair, so neither entry remains meaningful.
    pub fn match_protective_fill(&mut self, fill: &Fill) -> Option<ClosedPosition> {
        let entries = self.protections.get(&fill.coin)?;
        let kind = entries
            .iter()
            .find(|entry| {
                entry.order_id == Some(fill.order_id)
                    || (entry.correlation_id.is_some()
                        && entry.correlation_id == fill.correlation_id)
            })
            .map(|entry| entry.kind)?;

        let status = match kind {
            ProtectionKind::StopLoss => CloseStatus::StopLoss,
            ProtectionKind::TakeProfit => CloseStatus::TakeProfit,
        };
        self.protections.remove(&fill.coin);
        match self.close(
            &fill.coin,
            Some(fill.size),
            fill.price,
            fill.fee,
            status,
            false,
            fill.timestamp,
        ) {
            Ok(closed) => Some(closed),
            Err(err) => {
                warn!(coin = %fill.coin, error = %err, "protective fill matched but close failed");
                None
            }
        }
    }

    /// Records a liquidation reported by the venue.
    pub fn apply_liquidation(
        &mut self,
        coin: &str,
        price: Price,
        now: DateTime<Utc>,
    ) -> Option<ClosedPosition> {
        self.close(coin, None, price, Decimal::ZERO, CloseStatus::Liquidated, true, now)
            .ok()
    }

    /// Reconciles local state against the venue. See [`ReconcileReport`].
    pub fn reconcile(
        &mut self,
        exchange: &[PerpPosition],
        mids: &HashMap<Coin, Price>,
        recent_fills: &[Fill],
        now: DateTime<Utc>,
    ) -> ReconcileReport {
        reconcile::run(self, exchange, mids, recent_fills, now)
    }

    /// Open position for one coin.
    #[must_use]
    pub fn position(&self, coin: &str) -> Option<&Position> {
        self.positions.get(coin)
    }

    /// All open positions.
    #[must_use]
    pub fn positions(&self) -> &HashMap<Coin, Position> {
        &self.positions
    }

    /// Closed-position history, oldest first.
    #[must_use]
    pub fn closed_history(&self) -> impl Iterator<Item = &ClosedPosition> {
        self.closed.iter()
    }

    /// Trade log, oldest first.
    #[must_use]
    pub fn trades(&self) -> impl Iterator<Item = &TradeRecord> {
        self.trades.iter()
    }

    /// Net realized PnL accumulated since `since`.
    #[must_use]
    pub fn realized_pnl_since(&self, since: DateTime<Utc>) -> Decimal {
        self.closed
            .iter()
            .filter(|closed| closed.closed_at >= since)
            .map(|closed| closed.pnl.net)
            .sum()
    }

    pub(crate) fn config(&self) -> &LedgerConfig {
        &self.config
    }

    #[allow(clippy::too_many_arguments)]
    fn record_trade(
        &mut self,
        coin: &str,
        side: Side,
        price: Price,
        size: Quantity,
        fee: Decimal,
        is_entry: bool,
        label: &str,
        now: DateTime<Utc>,
    ) {
        self.trades.push(TradeRecord {
            coin: coin.to_string(),
            side,
            price,
            size,
            fee,
            is_entry,
            label: label.to_string(),
            timestamp: now,
        });
        if let Some(writer) = &self.trade_writer {
            if let Err(err) = writer.save(&self.trades) {
                warn!(error = %err, "trade log persistence failed");
            }
        }
    }

    pub(crate) fn persist(&self) {
        let Some(writer) = &self.state_writer else {
            return;
        };
        let snapshot = LedgerSnapshot {
            positions: self.positions.clone(),
            closed: self.closed.clone(),
            protections: self.protections.clone(),
        };
        if let Err(err) = writer.save(&snapshot) {
            warn!(error = %err, "ledger persistence failed");
        }
    }
}

fn status_label(status: CloseStatus) -> &'static str {
    match status {
        CloseStatus::Closed => "close",
        CloseStatus::StopLoss => "stop_loss",
        CloseStatus::TakeProfit => "take_profit",
        CloseStatus::Liquidated => "liquidation",
        CloseStatus::ClosedExternal => "closed_external",
        CloseStatus::OppositeOverwrite => "opposite_overwrite",
    }
}
