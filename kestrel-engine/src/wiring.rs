//! Glue between the realtime stream and the runtime's event queue.
//!
//! Stream callbacks run on the multiplexer's actor task, so they only
//! parse and forward; all state lives behind the runtime's queue.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::debug;

use kestrel_core::{Coin, Fill, Price, Side};
use kestrel_stream::{StreamCallback, StreamError, StreamMessage, StreamMultiplexer, Subscription};

use crate::runtime::{AgentHandle, RuntimeEvent};

/// Subscribes the runtime to mid prices, trade feeds for `trade_coins`,
/// book feeds for `book_coins`, and, when a user address is given, the
/// account's own events.
pub async fn wire_stream(
    stream: &StreamMultiplexer,
    handle: &AgentHandle,
    trade_coins: &[Coin],
    book_coins: &[Coin],
    user: Option<String>,
) -> Result<(), StreamError> {
    let mids_handle = handle.clone();
    stream
        .subscribe(
            Subscription::AllMids,
            callback(move |message| {
                if let Some(mids) = parse_mids(&message.data) {
                    mids_handle.send(RuntimeEvent::Mids(mids));
                }
            }),
        )
        .await?;

    for coin in trade_coins {
        let trades_handle = handle.clone();
        stream
            .subscribe(
                Subscription::Trades { coin: coin.clone() },
                callback(move |message| {
                    for event in parse_trades(&message.data) {
                        trades_handle.send(event);
                    }
                }),
            )
            .await?;
    }

    for coin in book_coins {
        let book_handle = handle.clone();
        stream
            .subscribe(
                Subscription::L2Book { coin: coin.clone() },
                callback(move |message| {
                    if let Some(event) = parse_book(&message.data) {
                        book_handle.send(event);
                    }
                }),
            )
            .await?;
    }

    if let Some(user) = user {
        let user_handle = handle.clone();
        stream
            .subscribe(
                Subscription::UserEvents { user },
                callback(move |message| {
                    for event in parse_user_events(&message.data) {
                        user_handle.send(event);
                    }
                }),
            )
            .await?;
    }
    Ok(())
}

fn callback(f: impl Fn(&StreamMessage) + Send + Sync + 'static) -> StreamCallback {
    Arc::new(f)
}

/// The mids payload maps coin to a stringified price.
fn parse_mids(data: &Value) -> Option<HashMap<Coin, Price>> {
    let entries = data.get("mids")?.as_object()?;
    let mut mids = HashMap::with_capacity(entries.len());
    for (coin, price) in entries {
        if let Some(price) = price.as_str().and_then(|raw| raw.parse().ok()) {
            mids.insert(coin.clone(), price);
        }
    }
    Some(mids)
}

/// Trades arrive as an array of objects with stringified numbers.
fn parse_trades(data: &Value) -> Vec<RuntimeEvent> {
    let Some(trades) = data.as_array() else {
        return Vec::new();
    };
    trades
        .iter()
        .filter_map(|trade| {
            let coin = trade.get("coin")?.as_str()?.to_string();
            let price = decimal_field(trade, "px")?;
            let size = decimal_field(trade, "sz")?;
            Some(RuntimeEvent::Trade { coin, size, price })
        })
        .collect()
}

/// Book snapshots carry bid levels then ask levels, best first.
fn parse_book(data: &Value) -> Option<RuntimeEvent> {
    let coin = data.get("coin")?.as_str()?.to_string();
    let levels = data.get("levels")?.as_array()?;
    let best_of = |side: usize| {
        levels
            .get(side)
            .and_then(Value::as_array)
            .and_then(|entries| entries.first())
            .and_then(|level| decimal_field(level, "px"))
    };
    Some(RuntimeEvent::Book {
        coin,
        best_bid: best_of(0)?,
        best_ask: best_of(1)?,
    })
}

/// User events carry fills and, occasionally, a liquidation notice.
fn parse_user_events(data: &Value) -> Vec<RuntimeEvent> {
    let mut events = Vec::new();
    if let Some(fills) = data.get("fills").and_then(Value::as_array) {
        for raw in fills {
            match parse_fill(raw) {
                Some(fill) => events.push(RuntimeEvent::UserFill(fill)),
                None => debug!(payload = %raw, "unparseable fill skipped"),
            }
        }
    }
    if let Some(liquidation) = data.get("liquidation") {
        if let (Some(coin), Some(size), Some(price)) = (
            liquidation.get("coin").and_then(Value::as_str),
            decimal_field(liquidation, "sz"),
            decimal_field(liquidation, "px"),
        ) {
            events.push(RuntimeEvent::Liquidation {
                coin: coin.to_string(),
                size,
                price,
            });
        }
    }
    events
}

fn parse_fill(value: &Value) -> Option<Fill> {
    let coin = value.get("coin")?.as_str()?.to_string();
    let side = match value.get("side")?.as_str()? {
        "B" => Side::Buy,
        _ => Side::Sell,
    };
    let price = decimal_field(value, "px")?;
    let size = decimal_field(value, "sz")?;
    let fee = decimal_field(value, "fee").unwrap_or(Decimal::ZERO);
    // Entries report a zero closed PnL; only exits carry a real value.
    let closed_pnl = decimal_field(value, "closedPnl").filter(|pnl| !pnl.is_zero());
    let order_id = value.get("oid").and_then(Value::as_u64).unwrap_or(0);
    let correlation_id = value
        .get("cloid")
        .and_then(Value::as_str)
        .map(str::to_string);
    let timestamp = value
        .get("time")
        .and_then(Value::as_i64)
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);
    Some(Fill {
        coin,
        side,
        price,
        size,
        fee,
        closed_pnl,
        order_id,
        correlation_id,
        timestamp,
    })
}

fn decimal_field(value: &Value, field: &str) -> Option<Decimal> {
    value.get(field)?.as_str()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn mids_payload_parses() {
        let data = json!({ "mids": { "BTC": "65000.5", "ETH": "3200", "BAD": "x" } });
        let mids = parse_mids(&data).unwrap();
        assert_eq!(mids.get("BTC"), Some(&dec!(65000.5)));
        assert_eq!(mids.get("ETH"), Some(&dec!(3200)));
        assert!(!mids.contains_key("BAD"));
    }

    #[test]
    fn trades_payload_parses() {
        let data = json!([
            { "coin": "BTC", "px": "65000", "sz": "1.5", "side": "B", "time": 1 },
            { "coin": "ETH", "px": "3200", "sz": "10", "side": "A", "time": 2 },
        ]);
        let events = parse_trades(&data);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            RuntimeEvent::Trade { coin, size, .. } if coin == "BTC" && *size == dec!(1.5)
        ));
    }

    #[test]
    fn book_payload_yields_top_of_book() {
        let data = json!({
            "coin": "BTC",
            "levels": [
                [ { "px": "64990", "sz": "2.0", "n": 4 }, { "px": "64980", "sz": "1", "n": 2 } ],
                [ { "px": "65010", "sz": "0.7", "n": 1 } ],
            ],
            "time": 1_700_000_000_000_i64,
        });
        let event = parse_book(&data).unwrap();
        assert!(matches!(
            event,
            RuntimeEvent::Book { ref coin, best_bid, best_ask }
                if coin == "BTC" && best_bid == dec!(64990) && best_ask == dec!(65010)
        ));
    }

    #[test]
    fn fill_parses_with_zero_closed_pnl_as_entry() {
        let raw = json!({
            "coin": "BTC",
            "side": "B",
            "px": "64999.0",
            "sz": "0.01",
            "fee": "0.29",
            "closedPnl": "0.0",
            "oid": 77_001,
            "cloid": "0xdeadbeef00000000000000000000cafe",
            "time": 1_700_000_000_000_i64,
        });
        let fill = parse_fill(&raw).unwrap();
        assert_eq!(fill.coin, "BTC");
        assert_eq!(fill.side, Side::Buy);
        assert_eq!(fill.price, dec!(64999.0));
        assert_eq!(fill.closed_pnl, None);
        assert_eq!(fill.order_id, 77_001);
        assert_eq!(
            fill.correlation_id.as_deref(),
            Some("0xdeadbeef00000000000000000000cafe")
        );
    }

    #[test]
    fn user_events_split_into_fills_and_liquidation() {
        let data = json!({
            "fills": [
                { "coin": "ETH", "side": "A", "px": "3200", "sz": "1", "closedPnl": "12.5" },
            ],
            "liquidation": { "coin": "SOL", "px": "140", "sz": "250" },
        });
        let events = parse_user_events(&data);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            RuntimeEvent::UserFill(fill) if fill.closed_pnl == Some(dec!(12.5))
        ));
        assert!(matches!(
            &events[1],
            RuntimeEvent::Liquidation { coin, .. } if coin == "SOL"
        ));
    }
}
