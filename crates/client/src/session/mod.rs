//! The meeting session: one actor task owning the signaling channel, the
//! peer registry, local media and the recorder.

mod handle;
mod view;

use std::sync::Arc;
use std::time::Duration;

use meetroom_contracts::{PeerId, RoomCode, ServerMessage};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MeetConfig;
use crate::directory::{HttpDirectory, MeetingDirectory};
use crate::error::SessionError;
use crate::media::{DeviceInfo, DeviceKind, FileDevices, LocalMedia, MediaDevices};
use crate::peer::{
    ConnectionId, PeerConnectionFactory, PeerEvent, PeerRegistry, PeerUpdate, WebRtcFactory,
};
use crate::recorder::{Recorder, RecorderState};
use crate::signaling::{SignalingChannel, SignalingEvent};

pub use handle::{DeviceList, RecordingToggle, SessionHandle};
pub use view::{Notice, PeerView, SessionStatus, SessionView, Severity};

use handle::Command;

const COMMAND_CAPACITY: usize = 32;
const NOTICE_CAPACITY: usize = 64;

/// External collaborators of a session.
pub struct SessionDeps {
    pub devices: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    /// REST registration; skipped when `None`.
    pub directory: Option<Arc<dyn MeetingDirectory>>,
}

impl SessionDeps {
    /// File-backed devices, webrtc-rs peers and the HTTP directory when an
    /// API base is configured.
    pub fn from_config(config: &MeetConfig) -> Result<Self, SessionError> {
        let directory = HttpDirectory::from_config(config)
            .map(|d| Arc::new(d) as Arc<dyn MeetingDirectory>);
        Ok(Self {
            devices: Arc::new(FileDevices::from_config(config)),
            peers: Arc::new(WebRtcFactory::from_config(config)?),
            directory,
        })
    }
}

enum Timer {
    Reconnect { attempt: u32 },
    PeerGrace {
        peer_id: PeerId,
        connection: ConnectionId,
    },
}

struct Inbox {
    commands: mpsc::Receiver<Command>,
    signaling: mpsc::UnboundedReceiver<SignalingEvent>,
    peers: mpsc::UnboundedReceiver<PeerEvent>,
    share_ended: mpsc::UnboundedReceiver<String>,
    timers: mpsc::UnboundedReceiver<Timer>,
}

/// One joined meeting room.
///
/// Created by [`Session::start`] and driven by a single task; every input
/// is handled to completion before the next one.
pub struct Session {
    config: MeetConfig,
    room: RoomCode,
    local_id: Option<PeerId>,
    status: SessionStatus,
    signaling: SignalingChannel,
    peers: PeerRegistry,
    media: LocalMedia,
    recorder: Recorder,
    directory: Option<Arc<dyn MeetingDirectory>>,
    /// A join request went out; teardown sends the matching leave.
    registered: bool,
    view: watch::Sender<SessionView>,
    notices: broadcast::Sender<Notice>,
    timer_tx: mpsc::UnboundedSender<Timer>,
    reconnect_timer: Option<JoinHandle<()>>,
    grace_timers: Vec<JoinHandle<()>>,
}

impl Session {
    /// Joins `room`: registers with the directory, acquires media and
    /// connects signaling, all within the configured setup timeout. On
    /// failure everything acquired so far is released again.
    pub async fn start(
        config: MeetConfig,
        room: RoomCode,
        deps: SessionDeps,
    ) -> Result<SessionHandle, SessionError> {
        let endpoint = config.signaling_endpoint()?;
        let (command_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (signaling_tx, signaling) = mpsc::unbounded_channel();
        let (peer_tx, peers) = mpsc::unbounded_channel();
        let (share_tx, share_ended) = mpsc::unbounded_channel();
        let (timer_tx, timers) = mpsc::unbounded_channel();
        let (view, view_rx) = watch::channel(SessionView::new(room.clone()));
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        let mut session = Session {
            signaling: SignalingChannel::new(endpoint, room.clone(), signaling_tx),
            peers: PeerRegistry::new(deps.peers, peer_tx),
            media: LocalMedia::new(deps.devices, share_tx),
            recorder: Recorder::new(),
            directory: deps.directory,
            registered: false,
            config,
            room: room.clone(),
            local_id: None,
            status: SessionStatus::Connecting,
            view,
            notices: notices.clone(),
            timer_tx,
            reconnect_timer: None,
            grace_timers: Vec::new(),
        };

        let timeout = session.config.setup_timeout;
        let result = match tokio::time::timeout(timeout, session.setup()).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::SetupTimeout(timeout)),
        };
        if let Err(e) = result {
            warn!("joining room {} failed: {}", room, e);
            session.teardown().await;
            return Err(e);
        }

        session.status = SessionStatus::Connected;
        session.publish();
        let handle = SessionHandle::new(
            room,
            command_tx,
            view_rx,
            notices,
            session.media.level(),
            session.recorder.elapsed(),
        );
        tokio::spawn(session.run(Inbox {
            commands,
            signaling,
            peers,
            share_ended,
            timers,
        }));
        Ok(handle)
    }

    async fn setup(&mut self) -> Result<(), SessionError> {
        if let Some(directory) = &self.directory {
            // set first: a join cut off by the setup timeout may still
            // have reached the server, and teardown must leave again
            self.registered = true;
            directory.join_meeting(&self.room).await?;
        }
        self.media.initialize().await?;
        self.signaling.connect().await?;
        Ok(())
    }

    async fn run(mut self, mut inbox: Inbox) {
        info!("session for room {} running", self.room);
        loop {
            tokio::select! {
                command = inbox.commands.recv() => match command {
                    Some(Command::Leave(reply)) => {
                        self.teardown().await;
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        info!("every session handle dropped");
                        self.teardown().await;
                        break;
                    }
                },
                Some(event) = inbox.signaling.recv() => self.on_signaling(event).await,
                Some(event) = inbox.peers.recv() => self.on_peer_event(event),
                Some(track_id) = inbox.share_ended.recv() => self.on_share_ended(track_id).await,
                Some(timer) = inbox.timers.recv() => self.on_timer(timer).await,
            }
            self.publish();
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::ToggleAudio(reply) => {
                let result = self.media.toggle_audio().map_err(SessionError::from);
                let _ = reply.send(self.settle(result));
            }
            Command::ToggleVideo(reply) => {
                let result = self.media.toggle_video().map_err(SessionError::from);
                let _ = reply.send(self.settle(result));
            }
            Command::ToggleScreenShare(reply) => {
                let result = self
                    .media
                    .toggle_screen_share(&self.peers)
                    .await
                    .map_err(SessionError::from);
                if result.is_ok() {
                    self.recorder.retarget(self.media.stream());
                }
                let _ = reply.send(self.settle(result));
            }
            Command::ToggleRecording(reply) => {
                let result = match self.recorder.state() {
                    RecorderState::Recording => {
                        self.recorder.stop().map(RecordingToggle::Stopped)
                    }
                    _ => self
                        .recorder
                        .start(self.media.stream())
                        .map(|()| RecordingToggle::Started),
                };
                let _ = reply.send(self.settle(result.map_err(SessionError::from)));
            }
            Command::DownloadRecording(reply) => {
                let result = self
                    .recorder
                    .download(&self.config.recordings_dir)
                    .await
                    .map_err(SessionError::from);
                if let Ok(Some(path)) = &result {
                    self.notify(Severity::Info, format!("Recording saved to {}", path.display()));
                }
                let _ = reply.send(self.settle(result));
            }
            Command::DiscardRecording(reply) => {
                let released = self.recorder.discard();
                let _ = reply.send(self.settle(Ok(released)));
            }
            Command::SwitchVideoDevice(id, reply) => {
                let result = self
                    .media
                    .switch_video_device(&id, &self.peers)
                    .await
                    .map_err(SessionError::from);
                if result.is_ok() {
                    self.recorder.retarget(self.media.stream());
                }
                let _ = reply.send(self.settle(result));
            }
            Command::SwitchAudioDevice(id, reply) => {
                let result = self
                    .media
                    .switch_audio_device(&id, &self.peers)
                    .await
                    .map_err(SessionError::from);
                let _ = reply.send(self.settle(result));
            }
            Command::Devices(reply) => {
                let result = self.device_list().await;
                let _ = reply.send(self.settle(result));
            }
            Command::RemoteMedia(peer_id, reply) => {
                let media = self.peers.get(&peer_id).map(|p| p.subscribe_media());
                let _ = reply.send(Ok(media));
            }
            Command::Reconnect(reply) => {
                let result = self.reconnect_now().await;
                let _ = reply.send(self.settle(result));
            }
            Command::Leave(reply) => {
                // handled by the run loop
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn device_list(&mut self) -> Result<DeviceList, SessionError> {
        let devices = self.media.refresh_devices().await?;
        let of_kind = |kind: DeviceKind| -> Vec<DeviceInfo> {
            devices.iter().filter(|d| d.kind == kind).cloned().collect()
        };
        let cameras = of_kind(DeviceKind::VideoInput);
        let microphones = of_kind(DeviceKind::AudioInput);
        let state = self.media.state();
        Ok(DeviceList {
            cameras,
            microphones,
            selected_camera: state.video_device,
            selected_microphone: state.audio_device,
        })
    }

    async fn on_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Message { epoch, message } => {
                if epoch != self.signaling.epoch() {
                    debug!("dropping message from old socket {}", epoch);
                    return;
                }
                // a socket counts as back once the server talks on it
                self.signaling.reset_reconnect_attempts();
                self.on_server_message(message).await;
            }
            SignalingEvent::Closed { epoch, reason } => {
                if self.signaling.handle_closed(epoch) {
                    if let Some(reason) = reason.filter(|r| !r.is_empty()) {
                        debug!("signaling closed: {}", reason);
                    }
                    self.status = SessionStatus::Disconnected;
                    self.notify(
                        Severity::Warning,
                        "Connection to the meeting server was lost. Reconnecting...",
                    );
                    self.schedule_reconnect();
                }
            }
        }
    }

    async fn on_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Peers { peers } => {
                debug!("room roster: {:?}", peers);
                for peer_id in peers {
                    self.add_peer(peer_id).await;
                }
            }
            ServerMessage::PeerJoined { peer_id } => self.add_peer(peer_id).await,
            ServerMessage::Signal { from, signal } => {
                let result = self
                    .peers
                    .handle_signal(&from, signal, self.media.stream(), &self.signaling)
                    .await;
                if let Err(e) = result {
                    self.notify(Severity::Warning, format!("Connection to {from} failed: {e}"));
                }
            }
            ServerMessage::Welcome { id } => {
                info!("signaling server calls us {}", id);
                self.local_id = Some(id);
            }
            ServerMessage::Unknown => {}
        }
    }

    async fn add_peer(&mut self, peer_id: PeerId) {
        if self.local_id.as_ref() == Some(&peer_id) {
            return;
        }
        let result = self
            .peers
            .ensure_peer(&peer_id, self.media.stream(), &self.signaling)
            .await;
        if let Err(e) = result {
            self.notify(Severity::Warning, format!("Could not connect to {peer_id}: {e}"));
        }
    }

    fn on_peer_event(&mut self, event: PeerEvent) {
        let Some(update) = self.peers.handle_event(event, &self.signaling) else {
            return;
        };
        match update {
            PeerUpdate::Failed {
                peer_id,
                connection,
            } => {
                let grace = self.config.peer_failed_grace;
                debug!("peer {} failed, closing in {:?} unless it recovers", peer_id, grace);
                let timer = Timer::PeerGrace {
                    peer_id,
                    connection,
                };
                let handle = self.schedule(grace, timer);
                self.grace_timers.retain(|t| !t.is_finished());
                self.grace_timers.push(handle);
            }
            PeerUpdate::Removed(peer_id) => info!("peer {} left", peer_id),
            PeerUpdate::Connected(_)
            | PeerUpdate::Disconnected(_)
            | PeerUpdate::RemoteTrack { .. } => {}
        }
    }

    async fn on_share_ended(&mut self, track_id: String) {
        match self.media.handle_share_ended(&track_id, &self.peers).await {
            Ok(true) => {
                self.recorder.retarget(self.media.stream());
                self.notify(Severity::Info, "Screen sharing ended.");
            }
            Ok(false) => {}
            Err(e) => self.notify(Severity::Error, format!("Could not return to the camera: {e}")),
        }
    }

    async fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::Reconnect { attempt } => {
                self.reconnect_timer = None;
                if self.signaling.is_open() {
                    return;
                }
                info!("reconnect attempt {}", attempt);
                match self.signaling.connect().await {
                    Ok(()) => {
                        self.status = SessionStatus::Connected;
                        self.notify(Severity::Info, "Reconnected to the meeting server.");
                    }
                    Err(e) => {
                        warn!("reconnect attempt {} failed: {}", attempt, e);
                        self.schedule_reconnect();
                    }
                }
            }
            Timer::PeerGrace {
                peer_id,
                connection,
            } => {
                if self.peers.expire_failed(&peer_id, connection).await {
                    self.notify(
                        Severity::Warning,
                        format!("Lost the connection to {peer_id}."),
                    );
                }
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        let max = self.config.max_reconnect_attempts;
        match self
            .signaling
            .next_reconnect_attempt(max, self.config.reconnect_backoff)
        {
            Some((attempt, delay)) => {
                self.status = SessionStatus::Reconnecting { attempt };
                debug!("reconnect attempt {} of {} in {:?}", attempt, max, delay);
                self.reconnect_timer = Some(self.schedule(delay, Timer::Reconnect { attempt }));
            }
            None => {
                self.status = SessionStatus::Failed;
                self.notify(
                    Severity::Error,
                    "Could not reconnect to the meeting server. Use reconnect to try again.",
                );
            }
        }
    }

    async fn reconnect_now(&mut self) -> Result<(), SessionError> {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        self.signaling.reset_reconnect_attempts();
        if self.signaling.is_open() {
            return Ok(());
        }
        match self.signaling.connect().await {
            Ok(()) => {
                self.status = SessionStatus::Connected;
                Ok(())
            }
            Err(e) => {
                self.schedule_reconnect();
                Err(e.into())
            }
        }
    }

    fn schedule(&self, delay: Duration, timer: Timer) -> JoinHandle<()> {
        let tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(timer);
        })
    }

    /// Releases everything in dependency order.
    async fn teardown(&mut self) {
        self.recorder.shutdown();
        self.media.cancel_level_meter();
        self.peers.close_all().await;
        self.signaling.close().await;
        self.media.stop_tracks();

        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        for timer in self.grace_timers.drain(..) {
            timer.abort();
        }

        if self.registered {
            self.registered = false;
            if let Some(directory) = &self.directory {
                if let Err(e) = directory.leave_meeting(&self.room).await {
                    warn!("leaving meeting {} failed: {}", self.room, e);
                }
            }
        }
        self.status = SessionStatus::Ended;
        self.publish();
        info!("left room {}", self.room);
    }

    /// Makes a command's effect visible before its reply goes out, and
    /// turns a failure into a notice.
    fn settle<T>(&self, result: Result<T, SessionError>) -> Result<T, SessionError> {
        self.publish();
        if let Err(e) = &result {
            self.notify(Severity::Warning, e.to_string());
        }
        result
    }

    fn notify(&self, severity: Severity, message: impl Into<String>) {
        let message = message.into();
        match severity {
            Severity::Info => info!("{}", message),
            Severity::Warning | Severity::Error => warn!("{}", message),
        }
        let _ = self.notices.send(Notice { severity, message });
    }

    fn publish(&self) {
        let view = SessionView {
            room: self.room.clone(),
            local_id: self.local_id.clone(),
            status: self.status,
            peers: {
                let mut peers: Vec<PeerView> = self.peers.iter().map(PeerView::from).collect();
                peers.sort_by(|a, b| a.id.cmp(&b.id));
                peers
            },
            media: self.media.state(),
            recorder: self.recorder.state(),
            artifact: self.recorder.artifact().cloned(),
        };
        self.view.send_if_modified(|current| {
            if *current == view {
                return false;
            }
            *current = view;
            true
        });
    }
}
