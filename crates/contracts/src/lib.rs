//! Wire contracts shared between the meeting client and the signaling server.

pub mod signaling;

pub use signaling::{
    ClientMessage, IceCandidate, PeerId, RoomCode, SdpType, ServerMessage, SessionDescription,
    Signal, SignalPayload,
};
