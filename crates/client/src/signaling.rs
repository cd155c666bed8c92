//! WebSocket channel to the signaling server.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use meetroom_contracts::{ClientMessage, PeerId, RoomCode, ServerMessage, Signal, SignalPayload};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::SignalingError;
use crate::peer::SignalSink;

/// How long `close` waits for the close frame to go out.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Inbound traffic, tagged with the socket generation it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Message { epoch: u64, message: ServerMessage },
    Closed { epoch: u64, reason: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// One participant's connection to the signaling server for one room.
///
/// Outbound messages are written by a dedicated task; inbound messages
/// are parsed by a reader task and delivered as [`SignalingEvent`]s.
/// Nothing is queued while the socket is not open.
pub struct SignalingChannel {
    endpoint: Url,
    room: RoomCode,
    events: mpsc::UnboundedSender<SignalingEvent>,
    state: ChannelState,
    epoch: u64,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    reconnect_attempts: u32,
}

impl SignalingChannel {
    pub fn new(
        endpoint: Url,
        room: RoomCode,
        events: mpsc::UnboundedSender<SignalingEvent>,
    ) -> Self {
        Self {
            endpoint,
            room,
            events,
            state: ChannelState::Idle,
            epoch: 0,
            outbound: None,
            writer: None,
            reader: None,
            reconnect_attempts: 0,
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn room(&self) -> &RoomCode {
        &self.room
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    /// Generation of the current socket.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Opens the socket and joins the room. Does nothing when already open.
    pub async fn connect(&mut self) -> Result<(), SignalingError> {
        if self.is_open() {
            return Ok(());
        }
        self.stop_tasks();
        self.state = ChannelState::Connecting;
        info!("connecting to signaling server at {}", self.endpoint);

        let (socket, _) = match tokio_tungstenite::connect_async(self.endpoint.as_str()).await {
            Ok(connected) => connected,
            Err(source) => {
                self.state = ChannelState::Closed;
                return Err(SignalingError::Connect {
                    endpoint: self.endpoint.to_string(),
                    source,
                });
            }
        };

        self.epoch += 1;
        let epoch = self.epoch;
        let (mut sink, mut stream) = socket.split();
        let (outbound, mut rx) = mpsc::unbounded_channel::<Message>();

        self.writer = Some(tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    debug!("signaling write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        }));

        let events = self.events.clone();
        self.reader = Some(tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                        Ok(ServerMessage::Unknown) => {
                            warn!("ignoring signaling message of unknown type: {}", text);
                        }
                        Ok(message) => {
                            if events.send(SignalingEvent::Message { epoch, message }).is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("ignoring malformed signaling message: {}", e),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|f| f.reason.to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break None,
                }
            };
            let _ = events.send(SignalingEvent::Closed { epoch, reason });
        }));

        self.outbound = Some(outbound);
        self.state = ChannelState::Open;
        let join = ClientMessage::Join {
            code: self.room.clone(),
        };
        if !self.send(&join) {
            warn!("join for room {} could not be queued", self.room);
        }
        info!("joined room {} (socket {})", self.room, epoch);
        Ok(())
    }

    /// Sends one message. Returns `false` when the channel is not open or
    /// the message could not be encoded; nothing is queued.
    pub fn send(&self, message: &ClientMessage) -> bool {
        let Some(outbound) = self.outbound.as_ref().filter(|_| self.is_open()) else {
            debug!("signaling channel not open, dropping {:?}", message);
            return false;
        };
        match serde_json::to_string(message) {
            Ok(text) => outbound.send(Message::Text(text)).is_ok(),
            Err(e) => {
                warn!("{}", SignalingError::from(e));
                false
            }
        }
    }

    /// Records the end of the socket of `epoch`. Returns `true` when that
    /// was the live, open socket, i.e. the connection was lost.
    pub fn handle_closed(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch || self.state != ChannelState::Open {
            debug!("ignoring close of stale socket {}", epoch);
            return false;
        }
        warn!("signaling connection lost");
        self.state = ChannelState::Closed;
        self.stop_tasks();
        true
    }

    /// Next automatic reconnect attempt and its delay, growing linearly.
    /// `None` once `max` attempts have been used.
    pub fn next_reconnect_attempt(&mut self, max: u32, backoff: Duration) -> Option<(u32, Duration)> {
        if self.reconnect_attempts >= max {
            return None;
        }
        self.reconnect_attempts += 1;
        Some((self.reconnect_attempts, backoff * self.reconnect_attempts))
    }

    pub fn reset_reconnect_attempts(&mut self) {
        self.reconnect_attempts = 0;
    }

    /// Closes the socket. Peer connections are not touched.
    pub async fn close(&mut self) {
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(Message::Close(None));
        }
        // a late close event from this socket is now stale
        self.epoch += 1;
        self.state = ChannelState::Closed;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(CLOSE_GRACE, writer).await.is_err() {
                debug!("signaling writer did not finish in time");
            }
        }
        info!("signaling channel closed");
    }

    fn stop_tasks(&mut self) {
        self.outbound = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

impl SignalSink for SignalingChannel {
    fn send_signal(&self, to: &PeerId, signal: Signal) -> bool {
        self.send(&ClientMessage::Signal {
            code: self.room.clone(),
            payload: SignalPayload {
                to: to.clone(),
                signal,
            },
        })
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}
