use meetroom_contracts::{PeerId, RoomCode};

use crate::media::LocalMediaState;
use crate::peer::{ConnectionState, Peer};
use crate::recorder::{RecorderState, RecordingArtifact};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Connected,
    /// Signaling dropped; automatic attempt `attempt` is pending.
    Reconnecting { attempt: u32 },
    /// Signaling dropped and no attempt is scheduled.
    Disconnected,
    /// Reconnecting gave up.
    Failed,
    /// Torn down; the handle is no longer usable.
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerView {
    pub id: PeerId,
    pub state: ConnectionState,
    pub is_connected: bool,
    pub has_video: bool,
    pub has_audio: bool,
}

impl From<&Peer> for PeerView {
    fn from(peer: &Peer) -> Self {
        let remote = peer.remote_stream();
        Self {
            id: peer.id().clone(),
            state: peer.state(),
            is_connected: peer.is_connected(),
            has_video: remote.is_some_and(|s| s.has(crate::media::TrackKind::Video)),
            has_audio: remote.is_some_and(|s| s.has(crate::media::TrackKind::Audio)),
        }
    }
}

/// Everything a front end renders, republished after every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub room: RoomCode,
    pub local_id: Option<PeerId>,
    pub status: SessionStatus,
    pub peers: Vec<PeerView>,
    pub media: LocalMediaState,
    pub recorder: RecorderState,
    pub artifact: Option<RecordingArtifact>,
}

impl SessionView {
    pub fn new(room: RoomCode) -> Self {
        Self {
            room,
            local_id: None,
            status: SessionStatus::Connecting,
            peers: Vec::new(),
            media: LocalMediaState::default(),
            recorder: RecorderState::Idle,
            artifact: None,
        }
    }

    /// Remote peers plus ourselves.
    pub fn participants(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn peer(&self, id: &str) -> Option<&PeerView> {
        self.peers.iter().find(|p| p.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A transient message for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub severity: Severity,
    pub message: String,
}
