//! Peer connection registry: one negotiation object per remote participant.

mod connection;
mod registry;
pub mod rtc;

pub use connection::{
    ConnectionId, ConnectionState, PeerConnection, PeerConnectionFactory, PeerContext, PeerEvent,
    PeerEventKind, RemoteFrame, RemoteSource, RemoteStream, RemoteTrack, SignalSink,
    SignalingState,
};
pub use registry::{
    MAX_PENDING_CANDIDATES, Peer, PeerRegistry, PeerUpdate, REMOTE_MEDIA_CAPACITY, SignalOutcome,
};
pub use rtc::WebRtcFactory;
