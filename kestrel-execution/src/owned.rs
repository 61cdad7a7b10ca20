//! Durable ledger of orders this agent placed.
//!
//! On a shared account the venue's open-orders list mixes every agent's
//! orders together. This ledger keys everything the agent placed by its
//! correlation id, so cancel sweeps and status lookups can stay within
//! the agent's own orders.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use kestrel_core::store::{self, JsonFileWriter, StoreError};
use kestrel_core::{ids, Coin, CorrelationId, OrderId, Price, Quantity, Side};

/// Lifecycle state of an owned order.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnedStatus {
    Open,
    Filled,
    Cancelled,
    /// A cancel sweep found the order already gone on the venue.
    ClosedExternal,
}

/// One order the agent placed.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OwnedOrder {
    pub correlation_id: CorrelationId,
    pub coin: Coin,
    pub side: Side,
    pub size: Quantity,
    pub price: Price,
    pub order_id: Option<OrderId>,
    pub status: OwnedStatus,
    pub placed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Correlation-id-keyed order ledger with retention pruning.
pub struct OwnedOrderLedger {
    agent_id: Uuid,
    orders: HashMap<CorrelationId, OwnedOrder>,
    /// Terminal orders older than this are pruned.
    retention: Duration,
    writer: Option<JsonFileWriter>,
}

impl OwnedOrderLedger {
    #[must_use]
    pub fn new(agent_id: Uuid, retention: Duration) -> Self {
        Self {
            agent_id,
            orders: HashMap::new(),
            retention,
            writer: None,
        }
    }

    pub fn attach_persistence(&mut self, writer: JsonFileWriter) {
        self.writer = Some(writer);
    }

    pub fn restore_from(&mut self, path: &Path) -> Result<(), StoreError> {
        if let Some(orders) = store::load_snapshot::<HashMap<CorrelationId, OwnedOrder>>(path)? {
            info!(orders = orders.len(), "owned-order ledger restored");
            self.orders = orders;
        }
        Ok(())
    }

    /// Whether this agent generated the given correlation id.
    #[must_use]
    pub fn owns(&self, correlation_id: &str) -> bool {
        ids::owns_correlation_id(self.agent_id, correlation_id)
    }

    pub fn record_placement(&mut self, order: OwnedOrder) {
        debug!(
            coin = %order.coin,
            correlation_id = %order.correlation_id,
            status = ?order.status,
            "order recorded"
        );
        self.orders.insert(order.correlation_id.clone(), order);
        self.prune(Utc::now());
        self.persist();
    }

    pub fn mark(&mut self, correlation_id: &str, status: OwnedStatus, now: DateTime<Utc>) {
        if let Some(order) = self.orders.get_mut(correlation_id) {
            order.status = status;
            order.updated_at = now;
            self.persist();
        } else {
            warn!(correlation_id, "status update for unknown order");
        }
    }

    pub fn set_order_id(&mut self, correlation_id: &str, order_id: OrderId) {
        if let Some(order) = self.orders.get_mut(correlation_id) {
            order.order_id = Some(order_id);
            self.persist();
        }
    }

    /// Orders still believed open, for cancel sweeps.
    #[must_use]
    pub fn open_orders(&self) -> Vec<OwnedOrder> {
        self.orders
            .values()
            .filter(|order| order.status == OwnedStatus::Open)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn get(&self, correlation_id: &str) -> Option<&OwnedOrder> {
        self.orders.get(correlation_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.orders.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Drops terminal orders older than the retention window.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return;
        };
        let cutoff = now - retention;
        self.orders.retain(|_, order| {
            order.status == OwnedStatus::Open || order.updated_at >= cutoff
        });
    }

    fn persist(&self) {
        if let Some(writer) = &self.writer {
            if let Err(err) = writer.save(&self.orders) {
                warn!(error = %err, "owned-order persistence failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order(correlation_id: &str, status: OwnedStatus, updated_at: DateTime<Utc>) -> OwnedOrder {
        OwnedOrder {
            correlation_id: correlation_id.to_string(),
            coin: "BTC".into(),
            side: Side::Buy,
            size: dec!(1),
            price: dec!(100),
            order_id: Some(1),
            status,
            placed_at: updated_at,
            updated_at,
        }
    }

    #[test]
    fn ownership_follows_agent_prefix() {
        let agent = Uuid::new_v4();
        let ledger = OwnedOrderLedger::new(agent, Duration::from_secs(3600));
        let mine = ids::new_correlation_id(agent);
        assert!(ledger.owns(&mine));
        assert!(!ledger.owns("0x00000000ffffffffffffffffffffffff"));
    }

    #[test]
    fn open_orders_excludes_terminal_states() {
        let mut ledger = OwnedOrderLedger::new(Uuid::new_v4(), Duration::from_secs(3600));
        let now = Utc::now();
        ledger.record_placement(order("0xaa", OwnedStatus::Open, now));
        ledger.record_placement(order("0xbb", OwnedStatus::Filled, now));
        ledger.record_placement(order("0xcc", OwnedStatus::Cancelled, now));
        let open = ledger.open_orders();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].correlation_id, "0xaa");
    }

    #[test]
    fn prune_drops_stale_terminal_orders_but_keeps_open() {
        let mut ledger = OwnedOrderLedger::new(Uuid::new_v4(), Duration::from_secs(60));
        let old = Utc::now() - chrono::Duration::hours(1);
        ledger.record_placement(order("0xaa", OwnedStatus::Filled, old));
        ledger.record_placement(order("0xbb", OwnedStatus::Open, old));
        ledger.prune(Utc::now());
        assert!(ledger.get("0xaa").is_none());
        assert!(ledger.get("0xbb").is_some());
    }

    #[test]
    fn mark_transitions_status() {
        let mut ledger = OwnedOrderLedger::new(Uuid::new_v4(), Duration::from_secs(3600));
        let now = Utc::now();
        ledger.record_placement(order("0xaa", OwnedStatus::Open, now));
        ledger.mark("0xaa", OwnedStatus::ClosedExternal, now);
        assert_eq!(
            ledger.get("0xaa").unwrap().status,
            OwnedStatus::ClosedExternal
        );
        assert!(ledger.open_orders().is_empty());
    }
}
