//! WebSocket link to the relay
//!
//! One `RelayLink` lives for the whole process. Each successful
//! [`connect`](RelayLink::connect) starts a connected period: a writer task
//! owns the sink half of the socket and the returned [`Inbound`] owns the
//! stream half. Outbound frames from any task go through a bounded queue to
//! the writer, so senders never contend for the socket.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use rt_core::config::BridgeConfig;
use rt_core::{DeviceIdentity, FrameSink, LinkError, LinkState};
use rt_protocol::{FrameCodec, Message};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound frames queued ahead of the writer task
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// How long `close()` waits for the close handshake to go out
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Transport settings for the relay link
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Relay endpoint (ws:// or wss://)
    pub url: String,
    /// Bound on the TCP + TLS + WebSocket handshake
    pub connect_timeout: Duration,
    /// Interval between WebSocket pings sent to the relay
    pub ping_interval: Duration,
    /// Inbound silence after which the link is considered dead
    pub idle_timeout: Duration,
}

impl LinkSettings {
    /// Take link settings from the bridge configuration
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            url: config.relay_url.clone(),
            connect_timeout: config.connect_timeout,
            ping_interval: config.ping_interval,
            idle_timeout: config.idle_timeout,
        }
    }
}

/// Persistent connection to the relay
pub struct RelayLink {
    settings: LinkSettings,
    identity: DeviceIdentity,
    codec: FrameCodec,
    state: watch::Sender<LinkState>,
    /// Queue into the writer task; present only while connected
    outbound: Mutex<Option<mpsc::Sender<WsMessage>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl RelayLink {
    /// Create a disconnected link
    pub fn new(settings: LinkSettings, identity: DeviceIdentity) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            settings,
            identity,
            codec: FrameCodec::new(),
            state,
            outbound: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    /// Current state
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Connect, register, and hand back the inbound half
    ///
    /// The device registration is the first frame sent on every connection.
    pub async fn connect(&self) -> Result<Inbound, LinkError> {
        if !self.transition(LinkState::Connecting) {
            return Err(LinkError::Closed);
        }

        tracing::info!("Connecting to relay at {}", self.settings.url);

        let connected = tokio::time::timeout(
            self.settings.connect_timeout,
            connect_async(self.settings.url.as_str()),
        )
        .await;

        let socket = match connected {
            Ok(Ok((socket, _response))) => socket,
            Ok(Err(e)) => {
                self.transition(LinkState::Disconnected);
                return Err(LinkError::Connect {
                    url: self.settings.url.clone(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                self.transition(LinkState::Disconnected);
                return Err(LinkError::Connect {
                    url: self.settings.url.clone(),
                    reason: format!("timed out after {:?}", self.settings.connect_timeout),
                });
            }
        };

        let (sink, stream) = socket.split();
        let (tx, rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);

        // Queued before the sender is published, so nothing can overtake it
        let registration = match self.codec.encode(&self.identity.registration()) {
            Ok(text) => text,
            Err(e) => {
                self.transition(LinkState::Disconnected);
                return Err(e.into());
            }
        };
        if tx.try_send(WsMessage::Text(registration)).is_err() {
            self.transition(LinkState::Disconnected);
            return Err(LinkError::NotConnected);
        }

        let writer = tokio::spawn(run_writer(sink, rx, self.settings.ping_interval));
        if let Some(stale) = lock(&self.writer).replace(writer) {
            stale.abort();
        }
        *lock(&self.outbound) = Some(tx);

        if !self.transition(LinkState::Connected) {
            self.teardown();
            return Err(LinkError::Closed);
        }

        tracing::info!(
            "Registered with relay as {} ({})",
            self.identity.device_name,
            self.identity.device_id
        );

        Ok(Inbound {
            stream,
            idle_timeout: self.settings.idle_timeout,
        })
    }

    /// End the current connected period after a transport failure or remote close
    pub fn disconnect(&self) {
        self.teardown();
        self.transition(LinkState::Disconnected);
    }

    /// Enter `Closing`; no further connects succeed and sends fail
    pub fn mark_closing(&self) {
        self.state.send_if_modified(|state| {
            if *state == LinkState::Closing {
                return false;
            }
            tracing::info!("Relay link {} -> {}", state, LinkState::Closing);
            *state = LinkState::Closing;
            true
        });
    }

    /// Close the transport without scheduling a reconnect
    pub async fn close(&self) {
        self.mark_closing();

        let outbound = lock(&self.outbound).take();
        let writer = lock(&self.writer).take();

        if let Some(tx) = outbound {
            let _ = tx.send_timeout(WsMessage::Close(None), CLOSE_TIMEOUT).await;
        }

        if let Some(mut writer) = writer {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut writer).await.is_err() {
                tracing::warn!("Relay writer did not finish within {:?}", CLOSE_TIMEOUT);
                writer.abort();
            }
        }

        tracing::info!("Relay link closed");
    }

    fn teardown(&self) {
        lock(&self.outbound).take();
        if let Some(writer) = lock(&self.writer).take() {
            writer.abort();
        }
    }

    /// Move to `next` unless the link is closing; returns whether it moved
    fn transition(&self, next: LinkState) -> bool {
        let mut moved = false;
        self.state.send_if_modified(|state| {
            if *state == LinkState::Closing || *state == next {
                moved = *state == next;
                return false;
            }
            tracing::debug!("Relay link {} -> {}", state, next);
            *state = next;
            moved = true;
            true
        });
        moved
    }
}

#[async_trait]
impl FrameSink for RelayLink {
    async fn send(&self, message: Message) -> Result<(), LinkError> {
        if self.state() != LinkState::Connected {
            return Err(LinkError::NotConnected);
        }

        let tx = lock(&self.outbound).clone().ok_or(LinkError::NotConnected)?;
        let text = self.codec.encode(&message)?;

        tracing::trace!("Sending {} frame", message.kind());

        tx.send(WsMessage::Text(text))
            .await
            .map_err(|_| LinkError::NotConnected)
    }
}

/// Inbound frames for one connected period
///
/// Not restartable: once [`next`](Self::next) returns `None` or an error,
/// the period is over and the link must reconnect.
pub struct Inbound {
    stream: SplitStream<WsStream>,
    idle_timeout: Duration,
}

impl Inbound {
    /// Next text frame from the relay
    ///
    /// `None` on a graceful close; an error on transport failure or when
    /// nothing at all arrived within the idle timeout.
    pub async fn next(&mut self) -> Option<Result<String, LinkError>> {
        loop {
            let item = match tokio::time::timeout(self.idle_timeout, self.stream.next()).await {
                Ok(item) => item,
                Err(_) => return Some(Err(LinkError::IdleTimeout(self.idle_timeout))),
            };

            match item {
                None => return None,
                Some(Err(e)) => return Some(Err(LinkError::Transport(e.to_string()))),
                Some(Ok(WsMessage::Text(text))) => return Some(Ok(text)),
                Some(Ok(WsMessage::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => tracing::warn!("Dropping non-UTF-8 binary frame from relay"),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    tracing::info!("Relay closed the connection: {:?}", frame);
                    return None;
                }
                // Pings are answered by tungstenite; pongs only reset the idle timer
                Some(Ok(_)) => {}
            }
        }
    }
}

/// Owns the sink half: forwards queued frames and keeps the link alive
async fn run_writer(
    mut sink: SplitSink<WsStream, WsMessage>,
    mut rx: mpsc::Receiver<WsMessage>,
    ping_interval: Duration,
) {
    let start = tokio::time::Instant::now() + ping_interval;
    let mut ping = tokio::time::interval_at(start, ping_interval);

    loop {
        let message = tokio::select! {
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = ping.tick() => WsMessage::Ping(Vec::new()),
        };

        let closing = matches!(message, WsMessage::Close(_));
        if let Err(e) = sink.send(message).await {
            tracing::debug!("Relay write failed: {}", e);
            return;
        }
        if closing {
            return;
        }
    }

    let _ = sink.close().await;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(url: &str) -> RelayLink {
        RelayLink::new(
            LinkSettings {
                url: url.to_string(),
                connect_timeout: Duration::from_secs(2),
                ping_interval: Duration::from_secs(30),
                idle_timeout: Duration::from_secs(40),
            },
            DeviceIdentity::new("dev_test", "test-host", false),
        )
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let link = link("ws://127.0.0.1:9/device");
        assert_eq!(link.state(), LinkState::Disconnected);

        let result = link.send(Message::Pong {}).await;
        assert!(matches!(result, Err(LinkError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_failure_returns_to_disconnected() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let link = link(&format!("ws://127.0.0.1:{}/device", port));
        let result = link.connect().await;

        assert!(matches!(result, Err(LinkError::Connect { .. })));
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_closing_is_terminal() {
        let link = link("ws://127.0.0.1:9/device");
        link.close().await;
        assert_eq!(link.state(), LinkState::Closing);

        assert!(matches!(link.connect().await, Err(LinkError::Closed)));
        link.disconnect();
        assert_eq!(link.state(), LinkState::Closing);
        assert!(matches!(
            link.send(Message::Pong {}).await,
            Err(LinkError::NotConnected)
        ));
    }
}
