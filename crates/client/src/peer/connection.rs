use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use meetroom_contracts::{IceCandidate, PeerId, SessionDescription, Signal};
use tokio::sync::mpsc;

use crate::error::PeerError;
use crate::media::{LocalTrack, TrackKind};

/// Generation of a peer's negotiation object. A new id is issued every
/// time a connection is created, including collision replacements.
pub type ConnectionId = u64;

/// Offer/answer state of one negotiation object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// Connectivity of the direct media path to one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Media arriving on one remote track.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Next payload, `None` once the track has ended.
    async fn next_payload(&self) -> Option<Bytes>;
}

/// One payload received from a remote peer, as handed to whatever
/// renders that peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFrame {
    pub track_id: String,
    pub kind: TrackKind,
    pub payload: Bytes,
}

/// An incoming track announced by a remote peer.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    pub source: Arc<dyn RemoteSource>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// The media a remote peer sends us, grouped by its stream id.
#[derive(Debug, Clone, Default)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    /// Adds or replaces a track by id. A track from another stream starts
    /// a fresh stream.
    pub fn attach(&mut self, track: RemoteTrack) {
        if self.id != track.stream_id {
            self.id = track.stream_id.clone();
            self.tracks.clear();
        }
        self.tracks.retain(|t| t.id != track.id);
        self.tracks.push(track);
    }

    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

#[derive(Debug, Clone)]
pub enum PeerEventKind {
    RemoteTrack(RemoteTrack),
    LocalCandidate(IceCandidate),
    StateChanged(ConnectionState),
}

/// Callback output of a negotiation object, tagged with its generation.
#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub peer_id: PeerId,
    pub connection: ConnectionId,
    pub kind: PeerEventKind,
}

/// Everything a connection needs to report back to the registry.
#[derive(Debug, Clone)]
pub struct PeerContext {
    pub peer_id: PeerId,
    pub connection: ConnectionId,
    pub events: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerContext {
    pub fn emit(&self, kind: PeerEventKind) {
        let event = PeerEvent {
            peer_id: self.peer_id.clone(),
            connection: self.connection,
            kind,
        };
        if self.events.send(event).is_err() {
            tracing::debug!("peer {} event dropped, session is gone", self.peer_id);
        }
    }
}

/// One negotiation object between us and a single remote participant.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> ConnectionState;

    async fn has_remote_description(&self) -> bool;

    /// Attaches a local track as an outgoing sender.
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError>;

    /// Creates an offer and applies it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Creates an answer and applies it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Swaps the track on the sender of `kind` without renegotiating.
    async fn replace_track(&self, kind: TrackKind, track: &LocalTrack) -> Result<(), PeerError>;

    async fn close(&self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, ctx: PeerContext) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

/// Outgoing side of the signaling channel, as seen by the registry.
pub trait SignalSink: Send + Sync {
    /// Addresses `signal` to one peer. Returns `false` when it was dropped.
    fn send_signal(&self, to: &PeerId, signal: Signal) -> bool;
}
