use std::time::Duration;

use thiserror::Error;

use crate::media::TrackKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: &'static str, reason: impl ToString) -> Self {
        ConfigError::Invalid {
            key,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("could not reach the signaling server at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[error("failed to encode signaling message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures of the capture devices. Messages are shown to the user as-is.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Camera or microphone access was denied. Allow access and try again.")]
    PermissionDenied,
    #[error("No camera or microphone was found. Connect a device and try again.")]
    NotFound,
    #[error("Screen sharing was cancelled or is not available.")]
    DisplayUnavailable,
    #[error("The device could not be opened: {0}")]
    Device(String),
    #[error("The local stream has no {0} track.")]
    MissingTrack(TrackKind),
    #[error("Could not switch outgoing media: {0}")]
    Replace(#[from] PeerError),
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error(transparent)]
    Transport(#[from] webrtc::Error),
    #[error("no outgoing {0} sender on this connection")]
    NoSender(TrackKind),
    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("Recording needs a video track.")]
    NoVideoTrack,
    #[error("Nothing is being recorded.")]
    NotRecording,
    #[error("Could not save the recording: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("meeting service unreachable: {0}")]
    Http(#[from] reqwest::Error),
    #[error("meeting service answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid meeting service url: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("Connection to the meeting server failed: {0}")]
    Signaling(#[from] SignalingError),
    #[error("Could not register with the meeting: {0}")]
    Directory(#[from] DirectoryError),
    #[error("Joining the meeting timed out after {:?}.", .0)]
    SetupTimeout(Duration),
    #[error(transparent)]
    Recorder(#[from] RecorderError),
    #[error("Peer connections are unavailable: {0}")]
    Peer(#[from] PeerError),
    #[error("The meeting session has ended.")]
    Closed,
}

/// Coarse cause of a failure, for choosing how to present it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Permission,
    Hardware,
    Network,
    Timeout,
    Other,
}

impl SessionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SessionError::Media(MediaError::PermissionDenied)
            | SessionError::Media(MediaError::DisplayUnavailable) => FailureKind::Permission,
            SessionError::Media(MediaError::NotFound | MediaError::Device(_)) => {
                FailureKind::Hardware
            }
            SessionError::Signaling(_) | SessionError::Directory(_) => FailureKind::Network,
            SessionError::SetupTimeout(_) => FailureKind::Timeout,
            _ => FailureKind::Other,
        }
    }
}
