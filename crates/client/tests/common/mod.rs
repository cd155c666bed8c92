#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use meetroom_client::error::{DirectoryError, MediaError, PeerError};
use meetroom_client::media::{
    CaptureConstraints, DeviceInfo, DeviceKind, LocalTrack, MediaDevices, MediaStream, TrackKind,
    TrackSource, resolve_device,
};
use meetroom_client::directory::MeetingDirectory;
use meetroom_client::peer::{
    ConnectionState, PeerConnection, PeerConnectionFactory, PeerContext, PeerEventKind,
    RemoteSource, RemoteTrack, SignalSink, SignalingState,
};
use meetroom_contracts::{IceCandidate, PeerId, RoomCode, SdpType, SessionDescription, Signal};
use tokio::sync::mpsc;

/// Polls `check` until it holds or five seconds pass.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn candidate(n: usize) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 2122260223 192.0.2.{n} 5000{n} typ host"),
        sdp_mid: Some("0".into()),
        sdp_m_line_index: Some(0),
        username_fragment: None,
    }
}

// ---- devices ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Denied,
    Missing,
}

impl Failure {
    fn error(self) -> MediaError {
        match self {
            Failure::Denied => MediaError::PermissionDenied,
            Failure::Missing => MediaError::NotFound,
        }
    }
}

/// In-memory cameras and microphones. Tracks carry no media unless a test
/// pushes frames into them.
#[derive(Default)]
pub struct FakeDevices {
    devices: Mutex<Vec<DeviceInfo>>,
    fail_next: Mutex<Option<Failure>>,
    display_unavailable: AtomicBool,
    opened: Mutex<Vec<LocalTrack>>,
    displays: Mutex<Vec<LocalTrack>>,
}

impl FakeDevices {
    pub fn new(cameras: &[&str], microphones: &[&str]) -> Arc<Self> {
        let mut devices = Vec::new();
        for id in cameras {
            devices.push(DeviceInfo {
                device_id: id.to_string(),
                kind: DeviceKind::VideoInput,
                label: format!("Camera {id}"),
            });
        }
        for id in microphones {
            devices.push(DeviceInfo {
                device_id: id.to_string(),
                kind: DeviceKind::AudioInput,
                label: format!("Microphone {id}"),
            });
        }
        Arc::new(Self {
            devices: Mutex::new(devices),
            ..Default::default()
        })
    }

    pub fn standard() -> Arc<Self> {
        Self::new(&["front", "back"], &["headset", "desk"])
    }

    pub fn fail_next(&self, failure: Failure) {
        *self.fail_next.lock().unwrap() = Some(failure);
    }

    pub fn set_display_unavailable(&self, unavailable: bool) {
        self.display_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every camera and microphone track handed out so far.
    pub fn opened(&self) -> Vec<LocalTrack> {
        self.opened.lock().unwrap().clone()
    }

    pub fn last_display(&self) -> Option<LocalTrack> {
        self.displays.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, MediaError> {
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn get_user_media(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<MediaStream, MediaError> {
        if let Some(failure) = self.fail_next.lock().unwrap().take() {
            return Err(failure.error());
        }
        let devices = self.devices.lock().unwrap().clone();
        let mut tracks = Vec::new();
        if let Some(video) = &constraints.video {
            let info = resolve_device(&devices, DeviceKind::VideoInput, &video.device)?;
            tracks.push(LocalTrack::new(
                TrackKind::Video,
                TrackSource::Camera,
                info.label.clone(),
                Some(info.device_id.clone()),
            ));
        }
        if let Some(audio) = &constraints.audio {
            let info = resolve_device(&devices, DeviceKind::AudioInput, &audio.device)?;
            tracks.push(LocalTrack::new(
                TrackKind::Audio,
                TrackSource::Microphone,
                info.label.clone(),
                Some(info.device_id.clone()),
            ));
        }
        self.opened.lock().unwrap().extend(tracks.iter().cloned());
        Ok(MediaStream::new(tracks))
    }

    async fn get_display_media(&self) -> Result<MediaStream, MediaError> {
        if self.display_unavailable.load(Ordering::SeqCst) {
            return Err(MediaError::DisplayUnavailable);
        }
        let track = LocalTrack::new(TrackKind::Video, TrackSource::Display, "Screen", None);
        self.displays.lock().unwrap().push(track.clone());
        Ok(MediaStream::new(vec![track]))
    }
}

// ---- peers ----

#[derive(Debug)]
struct FakeState {
    signaling: SignalingState,
    connection: ConnectionState,
    remote: Vec<SessionDescription>,
    candidates: Vec<IceCandidate>,
    senders: Vec<(TrackKind, String)>,
    offers: usize,
    answers: usize,
}

impl FakeState {
    fn new() -> Self {
        Self {
            signaling: SignalingState::Stable,
            connection: ConnectionState::New,
            remote: Vec::new(),
            candidates: Vec::new(),
            senders: Vec::new(),
            offers: 0,
            answers: 0,
        }
    }
}

/// Negotiation object that follows the offer/answer state machine
/// without any transport.
pub struct FakePeer {
    ctx: PeerContext,
    state: Mutex<FakeState>,
    fail_replace: AtomicBool,
    fail_answer: AtomicBool,
}

impl FakePeer {
    pub fn peer_id(&self) -> &PeerId {
        &self.ctx.peer_id
    }

    pub fn connection(&self) -> u64 {
        self.ctx.connection
    }

    pub fn signaling(&self) -> SignalingState {
        self.state.lock().unwrap().signaling
    }

    /// Remote descriptions applied so far.
    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.state.lock().unwrap().remote.clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().unwrap().candidates.clone()
    }

    pub fn sender_track(&self, kind: TrackKind) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .senders
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, id)| id.clone())
    }

    pub fn offers_created(&self) -> usize {
        self.state.lock().unwrap().offers
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().connection == ConnectionState::Closed
    }

    pub fn fail_replace(&self) {
        self.fail_replace.store(true, Ordering::SeqCst);
    }

    pub fn fail_answer(&self) {
        self.fail_answer.store(true, Ordering::SeqCst);
    }

    /// Simulates the transport reporting a new connectivity state.
    pub fn set_connection_state(&self, state: ConnectionState) {
        self.state.lock().unwrap().connection = state;
        self.ctx.emit(PeerEventKind::StateChanged(state));
    }

    pub fn discover_candidate(&self, candidate: IceCandidate) {
        self.ctx.emit(PeerEventKind::LocalCandidate(candidate));
    }

    /// Announces a remote track. Payloads sent on the returned channel
    /// arrive on the track; dropping it ends the track.
    pub fn receive_track(&self, kind: TrackKind) -> mpsc::UnboundedSender<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.ctx.emit(PeerEventKind::RemoteTrack(RemoteTrack {
            id: format!("{}-{kind}", self.ctx.peer_id),
            stream_id: format!("{}-stream", self.ctx.peer_id),
            kind,
            source: Arc::new(FakeRemoteSource {
                payloads: tokio::sync::Mutex::new(rx),
            }),
        }));
        tx
    }

    fn rejected(&self, what: &str) -> PeerError {
        PeerError::Rejected(format!(
            "{} (connection {}): {what}",
            self.ctx.peer_id, self.ctx.connection
        ))
    }
}

struct FakeRemoteSource {
    payloads: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

#[async_trait]
impl RemoteSource for FakeRemoteSource {
    async fn next_payload(&self) -> Option<Bytes> {
        self.payloads.lock().await.recv().await
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    fn signaling_state(&self) -> SignalingState {
        self.state.lock().unwrap().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().unwrap().connection
    }

    async fn has_remote_description(&self) -> bool {
        !self.state.lock().unwrap().remote.is_empty()
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        let mut state = self.state.lock().unwrap();
        state.senders.push((track.kind(), track.id().to_string()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let mut state = self.state.lock().unwrap();
        if state.signaling != SignalingState::Stable {
            return Err(self.rejected("offer outside stable"));
        }
        state.signaling = SignalingState::HaveLocalOffer;
        state.offers += 1;
        Ok(SessionDescription::offer(format!(
            "offer {} {}",
            self.ctx.peer_id, self.ctx.connection
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        if self.fail_answer.load(Ordering::SeqCst) {
            return Err(self.rejected("answer failed"));
        }
        let mut state = self.state.lock().unwrap();
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(self.rejected("answer without remote offer"));
        }
        state.signaling = SignalingState::Stable;
        state.answers += 1;
        Ok(SessionDescription::answer(format!(
            "answer {} {}",
            self.ctx.peer_id, self.ctx.connection
        )))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let mut state = self.state.lock().unwrap();
        state.signaling = match (desc.kind, state.signaling) {
            (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (kind, current) => {
                return Err(self.rejected(&format!("{kind:?} in {current:?}")));
            }
        };
        state.remote.push(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let mut state = self.state.lock().unwrap();
        if state.remote.is_empty() {
            return Err(self.rejected("candidate before remote description"));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: &LocalTrack) -> Result<(), PeerError> {
        if self.fail_replace.load(Ordering::SeqCst) {
            return Err(self.rejected("replace failed"));
        }
        let mut state = self.state.lock().unwrap();
        let sender = state
            .senders
            .iter_mut()
            .find(|(k, _)| *k == kind)
            .ok_or(PeerError::NoSender(kind))?;
        sender.1 = track.id().to_string();
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.connection == ConnectionState::Closed {
                return Ok(());
            }
            state.signaling = SignalingState::Closed;
            state.connection = ConnectionState::Closed;
        }
        self.ctx.emit(PeerEventKind::StateChanged(ConnectionState::Closed));
        Ok(())
    }
}

/// Hands out [`FakePeer`]s and keeps them for inspection.
#[derive(Default)]
pub struct FakePeerFactory {
    created: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    /// Every connection ever made to `peer_id`, oldest first.
    pub fn connections(&self, peer_id: &str) -> Vec<Arc<FakePeer>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.ctx.peer_id == peer_id)
            .cloned()
            .collect()
    }

    pub fn latest(&self, peer_id: &str) -> Arc<FakePeer> {
        self.connections(peer_id)
            .pop()
            .unwrap_or_else(|| panic!("no connection to {peer_id}"))
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(&self, ctx: PeerContext) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let peer = Arc::new(FakePeer {
            ctx,
            state: Mutex::new(FakeState::new()),
            fail_replace: AtomicBool::new(false),
            fail_answer: AtomicBool::new(false),
        });
        self.created.lock().unwrap().push(Arc::clone(&peer));
        Ok(peer)
    }
}

// ---- signaling ----

/// Captures outgoing signals instead of sending them.
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(PeerId, Signal)>>,
}

impl RecordingSink {
    pub fn sent(&self) -> Vec<(PeerId, Signal)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn descriptions_to(&self, peer_id: &str, kind: SdpType) -> Vec<SessionDescription> {
        self.sent()
            .into_iter()
            .filter(|(to, _)| to == peer_id)
            .filter_map(|(_, signal)| match signal {
                Signal::Sdp { sdp } if sdp.kind == kind => Some(sdp),
                _ => None,
            })
            .collect()
    }

    pub fn candidates_to(&self, peer_id: &str) -> Vec<IceCandidate> {
        self.sent()
            .into_iter()
            .filter(|(to, _)| to == peer_id)
            .filter_map(|(_, signal)| match signal {
                Signal::Candidate { candidate } => Some(candidate),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

impl SignalSink for RecordingSink {
    fn send_signal(&self, to: &PeerId, signal: Signal) -> bool {
        self.sent.lock().unwrap().push((to.clone(), signal));
        true
    }
}

// ---- directory ----

#[derive(Default)]
pub struct FakeDirectory {
    pub joins: AtomicUsize,
    pub leaves: AtomicUsize,
    join_delay: Mutex<Option<Duration>>,
}

impl FakeDirectory {
    /// Makes every later join hang for `delay` after it was counted.
    pub fn delay_joins(&self, delay: Duration) {
        *self.join_delay.lock().unwrap() = Some(delay);
    }

    pub fn joins(&self) -> usize {
        self.joins.load(Ordering::SeqCst)
    }

    pub fn leaves(&self) -> usize {
        self.leaves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MeetingDirectory for FakeDirectory {
    async fn join_meeting(&self, _code: &RoomCode) -> Result<(), DirectoryError> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        let delay = *self.join_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn leave_meeting(&self, _code: &RoomCode) -> Result<(), DirectoryError> {
        self.leaves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
