//! Realtime subscription multiplexer.
//!
//! One WebSocket connection serves every subscriber. A single actor task
//! owns the subscription table and the physical connection; the public
//! handle talks to it over a command channel. On disconnect the actor
//! reconnects with capped exponential backoff and re-opens every live
//! subscription from the table.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

mod backoff;
pub mod protocol;
mod router;

pub use backoff::ReconnectPolicy;
pub use protocol::{StreamMessage, Subscription};
pub use router::{CallbackId, StreamCallback, SubscriptionTable};

/// Errors surfaced by the multiplexer handle.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("multiplexer actor has stopped")]
    ActorGone,
}

/// Invoked once when the reconnect budget is exhausted and the stream
/// gives up.
pub type FatalCallback = Arc<dyn Fn() + Send + Sync>;

/// Multiplexer configuration.
#[derive(Clone)]
pub struct StreamConfig {
    /// WebSocket endpoint.
    pub url: String,
    /// Reconnect schedule.
    pub reconnect: ReconnectPolicy,
    /// Interval between outbound heartbeat pings.
    pub heartbeat: Duration,
    /// Called when reconnect attempts are exhausted.
    pub on_fatal: Option<FatalCallback>,
}

impl StreamConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectPolicy::default(),
            heartbeat: Duration::from_secs(50),
            on_fatal: None,
        }
    }
}

enum StreamCommand {
    Subscribe {
        subscription: Subscription,
        callback: StreamCallback,
        reply: oneshot::Sender<CallbackId>,
    },
    Unsubscribe(CallbackId),
    Close,
}

/// Cloneable handle to the multiplexer actor.
#[derive(Clone)]
pub struct StreamMultiplexer {
    tx: mpsc::UnboundedSender<StreamCommand>,
}

impl StreamMultiplexer {
    /// Spawns the actor task and returns the handle plus its join handle.
    #[must_use]
    pub fn spawn(config: StreamConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_stream_loop(config, rx));
        (Self { tx }, handle)
    }

    /// Registers a callback for a subscription, opening it on the wire if
    /// it is not live yet.
    pub async fn subscribe(
        &self,
        subscription: Subscription,
        callback: StreamCallback,
    ) -> Result<CallbackId, StreamError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StreamCommand::Subscribe {
                subscription,
                callback,
                reply,
            })
            .map_err(|_| StreamError::ActorGone)?;
        rx.await.map_err(|_| StreamError::ActorGone)
    }

    /// Drops a callback; the subscription is closed once its last callback
    /// is gone.
    pub fn unsubscribe(&self, id: CallbackId) -> Result<(), StreamError> {
        self.tx
            .send(StreamCommand::Unsubscribe(id))
            .map_err(|_| StreamError::ActorGone)
    }

    /// Closes the connection without reconnecting and stops the actor.
    pub fn close(&self) -> Result<(), StreamError> {
        self.tx
            .send(StreamCommand::Close)
            .map_err(|_| StreamError::ActorGone)
    }
}

type WsSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn run_stream_loop(config: StreamConfig, mut rx: mpsc::UnboundedReceiver<StreamCommand>) {
    let mut table = SubscriptionTable::new();
    let mut attempt = 0u32;

    loop {
        let socket = match connect_async(&config.url).await {
            Ok((socket, _)) => socket,
            Err(err) => {
                attempt += 1;
                if !config.reconnect.allows(attempt) {
                    error!(attempt, error = %err, "reconnect budget exhausted, stream giving up");
                    if let Some(on_fatal) = &config.on_fatal {
                        on_fatal();
                    }
                    return;
                }
                let delay = config.reconnect.jittered_delay(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "connect failed, backing off"
                );
                if !idle_wait(delay, &mut rx, &mut table).await {
                    return;
                }
                continue;
            }
        };
        info!(url = %config.url, subscriptions = table.len(), "stream connected");
        attempt = 0;

        match drive_connection(socket, &config, &mut rx, &mut table).await {
            ConnectionEnd::Closed => return,
            ConnectionEnd::Lost => {
                attempt += 1;
                if !config.reconnect.allows(attempt) {
                    error!(attempt, "reconnect budget exhausted, stream giving up");
                    if let Some(on_fatal) = &config.on_fatal {
                        on_fatal();
                    }
                    return;
                }
                let delay = config.reconnect.jittered_delay(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "connection lost, backing off before reconnect"
                );
                if !idle_wait(delay, &mut rx, &mut table).await {
                    return;
                }
            }
        }
    }
}

enum ConnectionEnd {
    /// Deliberate shutdown; do not reconnect.
    Closed,
    /// Transport failure; reconnect.
    Lost,
}

async fn drive_connection(
    socket: WsSocket,
    config: &StreamConfig,
    rx: &mut mpsc::UnboundedReceiver<StreamCommand>,
    table: &mut SubscriptionTable,
) -> ConnectionEnd {
    let (mut sink, mut source) = socket.split();

    // Re-open every live subscription exactly once. The table is the
    // sole source of truth; nothing from a previous session is
    // replayed, and a failed flush just regenerates from the table on
    // the next connection.
    for frame in table.resubscribe_frames() {
        if let Err(err) = sink.send(Message::Text(frame.to_string())).await {
            warn!(error = %err, "resubscribe flush failed");
            return ConnectionEnd::Lost;
        }
    }

    let mut heartbeat = tokio::time::interval(config.heartbeat);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    heartbeat.reset();

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(StreamCommand::Subscribe { subscription, callback, reply }) => {
                    let (id, frame) = table.add(subscription, callback);
                    let _ = reply.send(id);
                    if let Some(frame) = frame {
                        if sink.send(Message::Text(frame.to_string())).await.is_err() {
                            return ConnectionEnd::Lost;
                        }
                    }
                }
                Some(StreamCommand::Unsubscribe(id)) => {
                    if let Some(frame) = table.remove(id) {
                        if sink.send(Message::Text(frame.to_string())).await.is_err() {
                            return ConnectionEnd::Lost;
                        }
                    }
                }
                Some(StreamCommand::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    info!("stream closed");
                    return ConnectionEnd::Closed;
                }
            },
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(message) = StreamMessage::parse(&text) {
                        table.route(&message);
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if sink.send(Message::Pong(payload)).await.is_err() {
                        return ConnectionEnd::Lost;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("socket closed by peer");
                    return ConnectionEnd::Lost;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(error = %err, "socket error");
                    return ConnectionEnd::Lost;
                }
            },
            _ = heartbeat.tick() => {
                let ping = protocol::ping_frame().to_string();
                if sink.send(Message::Text(ping)).await.is_err() {
                    return ConnectionEnd::Lost;
                }
            }
        }
    }
}

/// Processes commands while disconnected so table state stays current;
/// subscribe frames are regenerated by the resubscribe flush. Returns
/// `false` when a close was requested.
async fn idle_wait(
    delay: Duration,
    rx: &mut mpsc::UnboundedReceiver<StreamCommand>,
    table: &mut SubscriptionTable,
) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return true,
            command = rx.recv() => match command {
                Some(StreamCommand::Subscribe { subscription, callback, reply }) => {
                    let (id, _) = table.add(subscription, callback);
                    let _ = reply.send(id);
                }
                Some(StreamCommand::Unsubscribe(id)) => {
                    table.remove(id);
                }
                Some(StreamCommand::Close) | None => return false,
            }
        }
    }
}
