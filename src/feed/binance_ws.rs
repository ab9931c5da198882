//! Stream source adapter over the exchange raw-stream endpoint.
//!
//! One adapter owns one logical stream (one market pair, one stream name).
//! `open()` spawns a reader task that pushes `StreamEvent`s into an
//! unbounded channel; the engine drains it and never blocks the reader.
//!
//! Fault model:
//! - a frame that fails to decode produces `Decode` and the stream goes on
//! - transport close or error produces one `Closed` and the task exits;
//!   nothing flows again until the engine reopens
//! - a silent or pong-less connection is closed proactively

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::messages::{decode_frame, DecodeError, FeedMessage};
use crate::config::{SyncConfig, UpdateSpeed};
use crate::models::MarketPair;

/// Event delivered by a stream source.
#[derive(Debug)]
pub enum StreamEvent {
    /// Handshake complete; frames will follow.
    Opened,
    /// One decoded frame.
    Message(FeedMessage),
    /// One frame failed to decode; the stream continues.
    Decode(DecodeError),
    /// Transport closed or failed. Terminal for this connection.
    Closed { reason: String },
}

/// Restartable source of stream events.
///
/// Injected into the engine per instance; the engine is the only caller.
#[async_trait]
pub trait MarketStream: Send {
    /// Open the transport and return this connection's event stream.
    /// Any previous connection is torn down first.
    async fn open(&mut self) -> mpsc::UnboundedReceiver<StreamEvent>;

    /// Suspend frame delivery without dropping the transport.
    async fn pause(&mut self);

    /// Resume a paused stream.
    async fn resume(&mut self);

    /// Tear down the transport. Idempotent. No events are delivered after
    /// this returns.
    async fn close(&mut self);
}

/// Stream name for depth diffs, e.g. `wss://.../ws/bnbbtc@depth@100ms`.
pub fn depth_stream_url(base: &str, pair: &MarketPair, speed: UpdateSpeed) -> String {
    format!(
        "{}/{}@depth{}",
        base.trim_end_matches('/'),
        pair.ws_symbol(),
        speed.stream_suffix()
    )
}

/// Stream name for aggregate trades, e.g. `wss://.../ws/bnbbtc@aggTrade`.
pub fn agg_trade_stream_url(base: &str, pair: &MarketPair) -> String {
    format!("{}/{}@aggTrade", base.trim_end_matches('/'), pair.ws_symbol())
}

/// Transport knobs, split out of `SyncConfig` so the adapter stays
/// constructible without the full config in tests.
#[derive(Debug, Clone)]
pub struct WsParams {
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub stale_timeout: Duration,
}

impl WsParams {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            ping_interval: config.ping_interval(),
            pong_timeout: config.pong_timeout(),
            stale_timeout: config.stale_stream_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Stop,
}

pub struct BinanceWsStream {
    url: String,
    params: WsParams,
    control: Option<watch::Sender<Control>>,
    task: Option<JoinHandle<()>>,
}

impl BinanceWsStream {
    pub fn new(url: String, params: WsParams) -> Self {
        Self {
            url,
            params,
            control: None,
            task: None,
        }
    }

    async fn teardown(&mut self) {
        if let Some(control) = self.control.take() {
            let _ = control.send(Control::Stop);
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

#[async_trait]
impl MarketStream for BinanceWsStream {
    async fn open(&mut self) -> mpsc::UnboundedReceiver<StreamEvent> {
        self.teardown().await;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = watch::channel(Control::Run);

        let url = self.url.clone();
        let params = self.params.clone();
        self.task = Some(tokio::spawn(async move {
            run_connection(url, params, event_tx, control_rx).await;
        }));
        self.control = Some(control_tx);

        event_rx
    }

    async fn pause(&mut self) {
        if let Some(control) = &self.control {
            let _ = control.send(Control::Pause);
        }
    }

    async fn resume(&mut self) {
        if let Some(control) = &self.control {
            let _ = control.send(Control::Run);
        }
    }

    async fn close(&mut self) {
        self.teardown().await;
    }
}

impl Drop for BinanceWsStream {
    fn drop(&mut self) {
        if let Some(control) = self.control.take() {
            let _ = control.send(Control::Stop);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Reader task: one run per connection. Sends `Closed` exactly once on any
/// transport-initiated exit; sends nothing more after `Stop`.
async fn run_connection(
    url: String,
    params: WsParams,
    events: mpsc::UnboundedSender<StreamEvent>,
    mut control: watch::Receiver<Control>,
) {
    let connected = match timeout(params.connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            let _ = events.send(StreamEvent::Closed {
                reason: format!("connect failed: {e}"),
            });
            return;
        }
        Err(_) => {
            let _ = events.send(StreamEvent::Closed {
                reason: "connect timeout".to_string(),
            });
            return;
        }
    };

    let (ws, response) = connected;
    info!(url = %url, status = %response.status(), "stream_connected");
    let _ = events.send(StreamEvent::Opened);

    let (mut write, mut read) = ws.split();

    let mut ping = interval(params.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut last_frame = Instant::now();
    let mut awaiting_pong: Option<Instant> = None;
    let mut paused = *control.borrow() == Control::Pause;

    loop {
        tokio::select! {
            res = control.changed() => {
                if res.is_err() {
                    // Adapter dropped; nothing left to deliver to.
                    return;
                }
                let current = *control.borrow();
                match current {
                    Control::Stop => {
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                    Control::Pause => paused = true,
                    Control::Run => {
                        if paused {
                            debug!(url = %url, "stream_resumed");
                            // Silence while suspended must not count as staleness.
                            last_frame = Instant::now();
                            awaiting_pong = None;
                        }
                        paused = false;
                    }
                }
            }

            _ = ping.tick(), if !paused => {
                if let Some(sent_at) = awaiting_pong {
                    if sent_at.elapsed() > params.pong_timeout {
                        warn!(url = %url, "stream_pong_timeout");
                        let _ = events.send(StreamEvent::Closed {
                            reason: "pong timeout".to_string(),
                        });
                        return;
                    }
                }
                if last_frame.elapsed() > params.stale_timeout {
                    warn!(url = %url, "stream_stale");
                    let _ = events.send(StreamEvent::Closed {
                        reason: "no frames received".to_string(),
                    });
                    return;
                }
                if awaiting_pong.is_none() {
                    if write.send(Message::Ping(Vec::new())).await.is_err() {
                        let _ = events.send(StreamEvent::Closed {
                            reason: "ping write failed".to_string(),
                        });
                        return;
                    }
                    awaiting_pong = Some(Instant::now());
                }
            }

            frame = read.next(), if !paused => {
                let Some(frame) = frame else {
                    let _ = events.send(StreamEvent::Closed {
                        reason: "stream ended".to_string(),
                    });
                    return;
                };

                match frame {
                    Ok(Message::Text(text)) => {
                        last_frame = Instant::now();
                        match decode_frame(&text) {
                            Ok(msg) => {
                                let _ = events.send(StreamEvent::Message(msg));
                            }
                            Err(e) => {
                                let _ = events.send(StreamEvent::Decode(e));
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        last_frame = Instant::now();
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Ok(Message::Pong(_)) => {
                        last_frame = Instant::now();
                        awaiting_pong = None;
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(url = %url, ?frame, "stream_server_close");
                        let _ = events.send(StreamEvent::Closed {
                            reason: "closed by server".to_string(),
                        });
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = events.send(StreamEvent::Closed {
                            reason: format!("transport error: {e}"),
                        });
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> MarketPair {
        MarketPair::parse("BNB/BTC").unwrap()
    }

    #[test]
    fn test_depth_stream_url() {
        assert_eq!(
            depth_stream_url("wss://stream.binance.com:9443/ws", &pair(), UpdateSpeed::Normal),
            "wss://stream.binance.com:9443/ws/bnbbtc@depth"
        );
        assert_eq!(
            depth_stream_url("wss://stream.binance.com:9443/ws/", &pair(), UpdateSpeed::Fast),
            "wss://stream.binance.com:9443/ws/bnbbtc@depth@100ms"
        );
    }

    #[test]
    fn test_agg_trade_stream_url() {
        assert_eq!(
            agg_trade_stream_url("wss://stream.binance.com:9443/ws", &pair()),
            "wss://stream.binance.com:9443/ws/bnbbtc@aggTrade"
        );
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_reports_closed() {
        let params = WsParams {
            connect_timeout: Duration::from_millis(200),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            stale_timeout: Duration::from_secs(30),
        };
        let mut stream = BinanceWsStream::new("ws://127.0.0.1:9".to_string(), params);

        let mut events = stream.open().await;
        match events.recv().await {
            Some(StreamEvent::Closed { .. }) => {}
            other => panic!("expected closed event, got {other:?}"),
        }

        // Idempotent teardown.
        stream.close().await;
        stream.close().await;
    }
}
