//! WebSocket lifecycle for a single endpoint.
//!
//! A connection owns two long-running tasks: a writer draining an unbounded
//! channel into the socket (so sends are safe from any task) and a one-way
//! keep-alive ping. The receive half is handed back to the owner, whose
//! listen loop drives it and decides about reconnecting; the connection
//! itself never retries.

use std::time::Duration;

use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use crate::event::{Event, EventBus};
use crate::wire;
use crate::Result;

const WS_PORT: u16 = 8080;
const ORIGIN: &str = "http://st.chatango.com";

/// Keep-alive cadence. One-way; the server never answers with a pong.
const PING_INTERVAL: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Disconnected,
    Dialing,
    Connected,
    Closing,
}

/// The sending side of one endpoint, plus its lifecycle state.
pub(crate) struct Connection {
    state: ConnectionState,
    writer: Option<mpsc::UnboundedSender<WsMessage>>,
    ping_stop: Option<oneshot::Sender<()>>,
}

impl Connection {
    pub fn new() -> Connection {
        Connection {
            state: ConnectionState::Disconnected,
            writer: None,
            ping_stop: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Dial `host` and spawn the writer and ping tasks.
    ///
    /// On failure the state stays `Disconnected`; retrying is the owner's
    /// call.
    pub async fn connect(&mut self, host: &str, events: EventBus) -> Result<FrameReader> {
        self.state = ConnectionState::Dialing;

        let url = format!("ws://{}:{}/", host, WS_PORT);
        trace!("dialing {}", url);
        let request = match url.as_str().into_client_request() {
            Ok(mut request) => {
                request
                    .headers_mut()
                    .insert("Origin", HeaderValue::from_static(ORIGIN));
                request
            }
            Err(err) => {
                self.state = ConnectionState::Disconnected;
                return Err(err.into());
            }
        };

        let stream = match connect_async(request).await {
            Ok((stream, _response)) => stream,
            Err(err) => {
                self.state = ConnectionState::Disconnected;
                return Err(err.into());
            }
        };

        let (mut sink, stream) = stream.split();
        let (writer, mut outbound) = mpsc::unbounded_channel::<WsMessage>();
        tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                if let Err(err) = sink.send(message).await {
                    warn!("websocket send failed: {}", err);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let (ping_stop, stopped) = oneshot::channel();
        tokio::spawn(ping_loop(writer.clone(), events, stopped));

        self.writer = Some(writer);
        self.ping_stop = Some(ping_stop);
        self.state = ConnectionState::Connected;
        Ok(FrameReader { inner: stream })
    }

    /// Write a framed command. Quietly does nothing while not connected;
    /// sends during a reconnect gap are dropped, not queued.
    pub fn send(&self, args: &[&str]) {
        if !self.is_connected() {
            debug!("dropping send while disconnected: {}", args.join(":"));
            return;
        }
        debug!("OUT {}", args.join(":"));
        if let Some(ref writer) = self.writer {
            let _ = writer.send(WsMessage::Text(wire::frame(args)));
        }
    }

    /// Stop the ping task and close the socket. The receive half observes
    /// the closure and ends on its own.
    pub fn disconnect(&mut self) {
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Closing;
        }
        if let Some(stop) = self.ping_stop.take() {
            let _ = stop.send(());
        }
        // dropping the sender ends the writer task, which closes the sink
        self.writer = None;
        self.state = ConnectionState::Disconnected;
    }
}

/// The receive half of a connection, handed to the owning listen loop.
pub struct FrameReader {
    inner: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl FrameReader {
    /// Next text frame, or `None` once the connection is gone. Close frames,
    /// transport errors and stream end all terminate the reader.
    pub async fn next(&mut self) -> Option<String> {
        loop {
            match self.inner.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    if text.is_empty() {
                        // the server answers pings with an empty frame
                        return Some("pong".to_owned());
                    }
                    trace!(" IN {}", text);
                    return Some(text);
                }
                Some(Ok(WsMessage::Close(_))) => return None,
                Some(Ok(other)) => {
                    debug!("unexpected websocket message: {:?}", other);
                }
                Some(Err(err)) => {
                    warn!("websocket receive failed: {}", err);
                    return None;
                }
                None => return None,
            }
        }
    }
}

/// Emit a bare ping frame on a fixed cadence until told to stop or the
/// writer goes away.
async fn ping_loop(
    writer: mpsc::UnboundedSender<WsMessage>,
    events: EventBus,
    mut stopped: oneshot::Receiver<()>,
) {
    let mut interval = tokio::time::interval(PING_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = &mut stopped => break,
        }
        if writer.send(WsMessage::Text(wire::PING.to_owned())).is_err() {
            break;
        }
        events.emit(Event::Ping);
    }
}
