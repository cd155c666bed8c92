use std::path::PathBuf;

use meetroom_contracts::{PeerId, RoomCode};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::error::SessionError;
use crate::media::DeviceInfo;
use crate::peer::RemoteFrame;
use crate::recorder::RecordingArtifact;
use crate::session::view::{Notice, SessionStatus, SessionView};

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

pub(crate) enum Command {
    ToggleAudio(Reply<bool>),
    ToggleVideo(Reply<bool>),
    ToggleScreenShare(Reply<bool>),
    ToggleRecording(Reply<RecordingToggle>),
    DownloadRecording(Reply<Option<PathBuf>>),
    DiscardRecording(Reply<bool>),
    SwitchVideoDevice(String, Reply<()>),
    SwitchAudioDevice(String, Reply<()>),
    Devices(Reply<DeviceList>),
    RemoteMedia(PeerId, Reply<Option<broadcast::Receiver<RemoteFrame>>>),
    Reconnect(Reply<()>),
    Leave(Reply<()>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingToggle {
    Started,
    Stopped(RecordingArtifact),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceList {
    pub cameras: Vec<DeviceInfo>,
    pub microphones: Vec<DeviceInfo>,
    pub selected_camera: Option<String>,
    pub selected_microphone: Option<String>,
}

/// Control surface of a running session.
///
/// Clones share the session. The session tears itself down on
/// [`SessionHandle::leave`] or once every handle has been dropped.
#[derive(Clone)]
pub struct SessionHandle {
    room: RoomCode,
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<SessionView>,
    notices: broadcast::Sender<Notice>,
    audio_level: watch::Receiver<u8>,
    recording_elapsed: watch::Receiver<u64>,
}

impl SessionHandle {
    pub(crate) fn new(
        room: RoomCode,
        commands: mpsc::Sender<Command>,
        view: watch::Receiver<SessionView>,
        notices: broadcast::Sender<Notice>,
        audio_level: watch::Receiver<u8>,
        recording_elapsed: watch::Receiver<u64>,
    ) -> Self {
        Self {
            room,
            commands,
            view,
            notices,
            audio_level,
            recording_elapsed,
        }
    }

    pub fn room_code(&self) -> &RoomCode {
        &self.room
    }

    pub fn view(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    pub fn snapshot(&self) -> SessionView {
        self.view.borrow().clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Microphone level, 0..=255, updated about 60 times a second.
    pub fn audio_level(&self) -> watch::Receiver<u8> {
        self.audio_level.clone()
    }

    pub fn recording_elapsed(&self) -> watch::Receiver<u64> {
        self.recording_elapsed.clone()
    }

    pub async fn toggle_audio(&self) -> Result<bool, SessionError> {
        self.request(Command::ToggleAudio).await?
    }

    pub async fn toggle_video(&self) -> Result<bool, SessionError> {
        self.request(Command::ToggleVideo).await?
    }

    pub async fn toggle_screen_share(&self) -> Result<bool, SessionError> {
        self.request(Command::ToggleScreenShare).await?
    }

    pub async fn toggle_recording(&self) -> Result<RecordingToggle, SessionError> {
        self.request(Command::ToggleRecording).await?
    }

    /// Saves the stopped recording. `None` when there is nothing to save.
    pub async fn download_recording(&self) -> Result<Option<PathBuf>, SessionError> {
        self.request(Command::DownloadRecording).await?
    }

    pub async fn discard_recording(&self) -> Result<bool, SessionError> {
        self.request(Command::DiscardRecording).await?
    }

    pub async fn switch_video_device(&self, device_id: &str) -> Result<(), SessionError> {
        let id = device_id.to_string();
        self.request(|reply| Command::SwitchVideoDevice(id, reply))
            .await?
    }

    pub async fn switch_audio_device(&self, device_id: &str) -> Result<(), SessionError> {
        let id = device_id.to_string();
        self.request(|reply| Command::SwitchAudioDevice(id, reply))
            .await?
    }

    pub async fn devices(&self) -> Result<DeviceList, SessionError> {
        self.request(Command::Devices).await?
    }

    /// Media received from `peer_id`, for rendering. `None` when the peer
    /// is not in the room; the receiver closes once the peer leaves.
    pub async fn remote_media(
        &self,
        peer_id: &str,
    ) -> Result<Option<broadcast::Receiver<RemoteFrame>>, SessionError> {
        let id = peer_id.to_string();
        self.request(|reply| Command::RemoteMedia(id, reply)).await?
    }

    /// Reconnects signaling now and restarts the automatic attempts.
    pub async fn reconnect(&self) -> Result<(), SessionError> {
        self.request(Command::Reconnect).await?
    }

    /// Tears the session down. Returns once every resource is released;
    /// leaving an ended session is a no-op.
    pub async fn leave(&self) -> Result<(), SessionError> {
        match self.request(Command::Leave).await {
            Ok(result) => result,
            Err(SessionError::Closed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Resolves once the session has been torn down.
    pub async fn ended(&self) {
        let mut view = self.view.clone();
        let _ = view.wait_for(|v| v.status == SessionStatus::Ended).await;
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<Result<T, SessionError>, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)
    }
}
