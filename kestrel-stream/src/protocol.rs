//! Wire-level subscription frames and inbound message parsing.

use kestrel_core::{Coin, Interval};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One realtime channel the multiplexer can subscribe to.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Subscription {
    /// Mid prices for every listed coin.
    AllMids,
    /// Public trades for one coin.
    Trades { coin: Coin },
    /// Candle updates for one coin and interval.
    Candle { coin: Coin, interval: Interval },
    /// Level-2 order book for one coin.
    L2Book { coin: Coin },
    /// Account events (fills, liquidations, funding) for one address.
    /// Subscribed as `userEvents`; the venue delivers them under the
    /// channel name `user`.
    UserEvents { user: String },
}

impl Subscription {
    /// Channel name used in the outbound subscribe frame.
    #[must_use]
    pub fn channel(&self) -> &'static str {
        match self {
            Self::AllMids => "allMids",
            Self::Trades { .. } => "trades",
            Self::Candle { .. } => "candle",
            Self::L2Book { .. } => "l2Book",
            Self::UserEvents { .. } => "userEvents",
        }
    }

    /// Channel name under which the venue delivers data for this
    /// subscription.
    #[must_use]
    pub fn delivery_channel(&self) -> &'static str {
        match self {
            Self::UserEvents { .. } => "user",
            other => other.channel(),
        }
    }

    /// Coin parameter for coin-scoped channels.
    #[must_use]
    pub fn coin(&self) -> Option<&str> {
        match self {
            Self::Trades { coin } | Self::L2Book { coin } | Self::Candle { coin, .. } => {
                Some(coin.as_str())
            }
            Self::AllMids | Self::UserEvents { .. } => None,
        }
    }

    /// Outbound frame that opens this subscription.
    #[must_use]
    pub fn subscribe_frame(&self) -> Value {
        json!({ "method": "subscribe", "subscription": self.subscription_body() })
    }

    /// Outbound frame that closes this subscription.
    #[must_use]
    pub fn unsubscribe_frame(&self) -> Value {
        json!({ "method": "unsubscribe", "subscription": self.subscription_body() })
    }

    fn subscription_body(&self) -> Value {
        match self {
            Self::AllMids => json!({ "type": "allMids" }),
            Self::Trades { coin } => json!({ "type": "trades", "coin": coin }),
            Self::Candle { coin, interval } => {
                json!({ "type": "candle", "coin": coin, "interval": interval.as_str() })
            }
            Self::L2Book { coin } => json!({ "type": "l2Book", "coin": coin }),
            Self::UserEvents { user } => json!({ "type": "userEvents", "user": user }),
        }
    }
}

/// Parsed inbound message: the delivery channel plus its raw payload.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamMessage {
    pub channel: String,
    pub data: Value,
}

impl StreamMessage {
    /// Parses one text frame. Frames without a `channel` field (acks,
    /// pongs) return `None`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(raw).ok()?;
        let channel = value.get("channel")?.as_str()?.to_string();
        let data = value.get("data").cloned().unwrap_or(Value::Null);
        Some(Self { channel, data })
    }

    /// Best-effort coin extraction, used to route coin-scoped channels.
    #[must_use]
    pub fn coin(&self) -> Option<&str> {
        if let Some(coin) = self.data.get("coin").and_then(Value::as_str) {
            return Some(coin);
        }
        // Candle payloads carry the coin as `s`; trades arrive as an array.
        if let Some(coin) = self.data.get("s").and_then(Value::as_str) {
            return Some(coin);
        }
        self.data
            .as_array()
            .and_then(|items| items.first())
            .and_then(|item| item.get("coin"))
            .and_then(Value::as_str)
    }
}

/// Outbound heartbeat frame.
#[must_use]
pub fn ping_frame() -> Value {
    json!({ "method": "ping" })
}
