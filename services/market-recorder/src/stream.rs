//! Delta stream client
//!
//! One long-lived websocket per symbol carrying every subscribed stream
//! kind. The worker owns the reconnect loop; a `MarketStream` only reports
//! messages until the connection ends, then returns `None`.
//!
//! Connection management:
//! - Outbound pings every `ping_interval`; inbound pings are answered.
//! - Close frames and transport errors end the stream.
//! - Undecodable frames are surfaced as `Err` items and the stream stays
//!   usable; the caller decides whether to skip them.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use types::ids::Symbol;
use types::market::StreamKind;

use crate::binance;
use crate::delta::DepthDelta;
use crate::error::FeedError;
use crate::events::{CandleBar, TradePrint};

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    Trade(TradePrint),
    Depth(DepthDelta),
    Candle(CandleBar),
}

impl StreamMessage {
    pub fn kind(&self) -> StreamKind {
        match self {
            StreamMessage::Trade(_) => StreamKind::Trade,
            StreamMessage::Depth(_) => StreamKind::Depth,
            StreamMessage::Candle(_) => StreamKind::Candle,
        }
    }
}

/// An open connection delivering messages in exchange order.
#[async_trait]
pub trait MarketStream: Send {
    /// Next item, or `None` once the connection has ended.
    async fn next_message(&mut self) -> Option<Result<StreamMessage, FeedError>>;

    /// Close the connection. Safe to call more than once.
    async fn close(&mut self);
}

/// Opens `MarketStream`s. Shared by every restart of a worker.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(
        &self,
        symbol: &Symbol,
        streams: &[StreamKind],
    ) -> Result<Box<dyn MarketStream>, FeedError>;
}

/// Websocket connector for Binance combined streams.
pub struct BinanceStreamConnector {
    base_url: String,
    ping_interval: Duration,
    connect_timeout: Duration,
}

impl BinanceStreamConnector {
    pub fn new(base_url: impl Into<String>, ping_interval: Duration, connect_timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            ping_interval,
            connect_timeout,
        }
    }
}

#[async_trait]
impl StreamConnector for BinanceStreamConnector {
    async fn connect(
        &self,
        symbol: &Symbol,
        streams: &[StreamKind],
    ) -> Result<Box<dyn MarketStream>, FeedError> {
        let url = binance::combined_stream_url(&self.base_url, symbol, streams);
        info!(symbol = %symbol, url = %url, "Connecting market stream");

        let (ws, _response) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| FeedError::Timeout(self.connect_timeout))??;

        let (write, read) = ws.split();
        let mut ping = interval(self.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ping.reset();

        info!(symbol = %symbol, "Market stream connected");
        Ok(Box::new(BinanceStream {
            symbol: symbol.clone(),
            write,
            read,
            ping,
            closed: false,
        }))
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct BinanceStream {
    symbol: Symbol,
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
    ping: Interval,
    closed: bool,
}

#[async_trait]
impl MarketStream for BinanceStream {
    async fn next_message(&mut self) -> Option<Result<StreamMessage, FeedError>> {
        if self.closed {
            return None;
        }
        loop {
            tokio::select! {
                _ = self.ping.tick() => {
                    if let Err(e) = self.write.send(Message::Ping(Vec::new())).await {
                        warn!(symbol = %self.symbol, error = %e, "Ping failed");
                        self.closed = true;
                        return None;
                    }
                }
                frame = self.read.next() => {
                    let Some(frame) = frame else {
                        warn!(symbol = %self.symbol, "Market stream ended");
                        self.closed = true;
                        return None;
                    };
                    match frame {
                        Ok(Message::Text(text)) => match binance::parse_stream_frame(&text) {
                            Ok(Some(message)) => return Some(Ok(message)),
                            Ok(None) => continue,
                            Err(e) => return Some(Err(e)),
                        },
                        Ok(Message::Ping(payload)) => {
                            if let Err(e) = self.write.send(Message::Pong(payload)).await {
                                warn!(symbol = %self.symbol, error = %e, "Pong failed");
                                self.closed = true;
                                return None;
                            }
                        }
                        Ok(Message::Close(frame)) => {
                            info!(symbol = %self.symbol, frame = ?frame, "Market stream closed by remote");
                            self.closed = true;
                            return None;
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            warn!(symbol = %self.symbol, error = %e, "Market stream error");
                            self.closed = true;
                            return None;
                        }
                    }
                }
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.write.send(Message::Close(None)).await {
            debug!(symbol = %self.symbol, error = %e, "Close frame not sent");
        }
        let _ = self.write.close().await;
    }
}
