use serde::{Deserialize, Serialize};

/// Transient participant identifier assigned by the signaling server
pub type PeerId = String;

/// Opaque meeting room code
pub type RoomCode = String;

/// Messages sent from a participant to the signaling server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Announce presence in a room
    Join { code: RoomCode },
    /// Relay a negotiation message to one other participant
    Signal {
        code: RoomCode,
        payload: SignalPayload,
    },
}

/// Addressed envelope inside a client `signal` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalPayload {
    pub to: PeerId,
    pub signal: Signal,
}

/// Messages pushed by the signaling server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Participants already in the room when we joined, excluding ourselves
    Peers { peers: Vec<PeerId> },
    /// A participant joined after us
    PeerJoined {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    /// Negotiation message relayed from another participant
    Signal { from: PeerId, signal: Signal },
    /// Our own identifier, for servers that announce it
    Welcome { id: PeerId },
    #[serde(other)]
    Unknown,
}

/// Either half of the description exchange, or one trickled candidate.
///
/// The JSON shapes match what browsers produce, so a browser participant
/// and a native one can share a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Signal {
    Sdp { sdp: SessionDescription },
    Candidate { candidate: IceCandidate },
}

impl Signal {
    pub fn sdp(description: SessionDescription) -> Self {
        Signal::Sdp { sdp: description }
    }

    pub fn candidate(candidate: IceCandidate) -> Self {
        Signal::Candidate { candidate }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}
