//! Append-only trade history with a bounded memory footprint.

use chrono::{DateTime, Utc};
use kestrel_core::{Coin, Price, Quantity, Side};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One executed trade as recorded by the ledger.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TradeRecord {
    pub coin: Coin,
    pub side: Side,
    pub price: Price,
    pub size: Quantity,
    pub fee: Price,
    /// True when the trade opened or grew a position.
    pub is_entry: bool,
    /// Short human-readable label ("open", "stop_loss", "reconcile", ...).
    pub label: String,
    pub timestamp: DateTime<Utc>,
}

/// Ring buffer that drops the oldest entries past `cap`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CappedLog<T> {
    cap: usize,
    entries: VecDeque<T>,
}

impl<T> CappedLog<T> {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, entry: T) {
        if self.entries.len() == self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn last(&self) -> Option<&T> {
        self.entries.back()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_evicts_oldest_first() {
        let mut log = CappedLog::new(3);
        for n in 0..5 {
            log.push(n);
        }
        let kept: Vec<_> = log.iter().copied().collect();
        assert_eq!(kept, vec![2, 3, 4]);
        assert_eq!(log.len(), 3);
    }
}
