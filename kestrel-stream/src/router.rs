//! In-memory subscription table and callback fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::protocol::{StreamMessage, Subscription};

/// Callback invoked for every message routed to a subscription.
pub type StreamCallback = Arc<dyn Fn(&StreamMessage) + Send + Sync>;

/// Handle identifying one registered callback.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CallbackId(Uuid);

impl CallbackId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Routing key: delivery channel plus optional coin scope.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct RouteKey {
    channel: String,
    coin: Option<String>,
}

struct Entry {
    subscription: Subscription,
    callbacks: HashMap<CallbackId, StreamCallback>,
}

/// The subscription table. Owned exclusively by the multiplexer actor;
/// never shared across tasks.
#[derive(Default)]
pub struct SubscriptionTable {
    entries: HashMap<RouteKey, Entry>,
}

impl SubscriptionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback. Returns the callback handle and, when this is
    /// the first callback for the subscription, the subscribe frame that
    /// must go out on the wire.
    pub fn add(&mut self, subscription: Subscription, callback: StreamCallback) -> (CallbackId, Option<Value>) {
        let key = RouteKey {
            channel: subscription.delivery_channel().to_string(),
            coin: subscription.coin().map(str::to_string),
        };
        let id = CallbackId::new();
        let entry = self.entries.entry(key).or_insert_with(|| Entry {
            subscription: subscription.clone(),
            callbacks: HashMap::new(),
        });
        let first = entry.callbacks.is_empty();
        entry.callbacks.insert(id, callback);
        debug!(
            channel = subscription.channel(),
            coin = subscription.coin().unwrap_or("-"),
            first,
            "callback registered"
        );
        (id, first.then(|| subscription.subscribe_frame()))
    }

    /// Removes a callback. When the last callback for a subscription goes
    /// away, returns the unsubscribe frame to send.
    pub fn remove(&mut self, id: CallbackId) -> Option<Value> {
        let key = self
            .entries
            .iter()
            .find(|(_, entry)| entry.callbacks.contains_key(&id))
            .map(|(key, _)| key.clone())?;
        let entry = self.entries.get_mut(&key)?;
        entry.callbacks.remove(&id);
        if entry.callbacks.is_empty() {
            let frame = entry.subscription.unsubscribe_frame();
            self.entries.remove(&key);
            Some(frame)
        } else {
            None
        }
    }

    /// Routes one inbound message. Exact (channel, coin) matches win;
    /// otherwise a channel-global entry receives it. Unmatched messages
    /// are dropped.
    pub fn route(&self, message: &StreamMessage) -> usize {
        let exact = message.coin().and_then(|coin| {
            self.entries.get(&RouteKey {
                channel: message.channel.clone(),
                coin: Some(coin.to_string()),
            })
        });
        let entry = exact.or_else(|| {
            self.entries.get(&RouteKey {
                channel: message.channel.clone(),
                coin: None,
            })
        });
        match entry {
            Some(entry) => {
                for callback in entry.callbacks.values() {
                    callback(message);
                }
                entry.callbacks.len()
            }
            None => {
                trace!(channel = %message.channel, "no subscriber, message dropped");
                0
            }
        }
    }

    /// Subscribe frames for every live subscription, sent once after a
    /// reconnect.
    #[must_use]
    pub fn resubscribe_frames(&self) -> Vec<Value> {
        self.entries
            .values()
            .map(|entry| entry.subscription.subscribe_frame())
            .collect()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callback(counter: Arc<AtomicUsize>) -> StreamCallback {
        Arc::new(move |_msg| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn trades(coin: &str) -> Subscription {
        Subscription::Trades { coin: coin.into() }
    }

    #[test]
    fn first_callback_triggers_subscribe_frame_only_once() {
        let mut table = SubscriptionTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let (_, frame) = table.add(trades("BTC"), counting_callback(hits.clone()));
        assert!(frame.is_some());
        let (_, frame) = table.add(trades("BTC"), counting_callback(hits));
        assert!(frame.is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn routing_prefers_exact_coin_match() {
        let mut table = SubscriptionTable::new();
        let btc_hits = Arc::new(AtomicUsize::new(0));
        let global_hits = Arc::new(AtomicUsize::new(0));
        table.add(trades("BTC"), counting_callback(btc_hits.clone()));
        table.add(Subscription::AllMids, counting_callback(global_hits.clone()));

        let msg =
            StreamMessage::parse(r#"{"channel":"trades","data":[{"coin":"BTC"}]}"#).unwrap();
        table.route(&msg);
        assert_eq!(btc_hits.load(Ordering::SeqCst), 1);
        assert_eq!(global_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unmatched_messages_are_dropped() {
        let mut table = SubscriptionTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        table.add(trades("BTC"), counting_callback(hits.clone()));
        let msg = StreamMessage::parse(r#"{"channel":"trades","data":[{"coin":"ETH"}]}"#).unwrap();
        assert_eq!(table.route(&msg), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn user_events_route_under_user_channel() {
        let mut table = SubscriptionTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        table.add(
            Subscription::UserEvents {
                user: "0xabc".into(),
            },
            counting_callback(hits.clone()),
        );
        let msg = StreamMessage::parse(r#"{"channel":"user","data":{"fills":[]}}"#).unwrap();
        assert_eq!(table.route(&msg), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removing_last_callback_emits_unsubscribe() {
        let mut table = SubscriptionTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let (first, _) = table.add(trades("BTC"), counting_callback(hits.clone()));
        let (second, _) = table.add(trades("BTC"), counting_callback(hits));
        assert!(table.remove(first).is_none());
        let frame = table.remove(second).unwrap();
        assert_eq!(frame["method"], "unsubscribe");
        assert!(table.is_empty());
    }

    #[test]
    fn resubscribe_covers_every_subscription_once() {
        let mut table = SubscriptionTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        table.add(trades("BTC"), counting_callback(hits.clone()));
        table.add(trades("BTC"), counting_callback(hits.clone()));
        table.add(Subscription::AllMids, counting_callback(hits));
        assert_eq!(table.resubscribe_frames().len(), 2);
    }
}
