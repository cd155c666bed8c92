use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::MediaError;
use crate::media::devices::{CaptureConstraints, DeviceChoice, DeviceInfo, MediaDevices};
use crate::media::level::AudioLevelMeter;
use crate::media::track::{LocalTrack, MediaStream, TrackKind};
use crate::peer::PeerRegistry;

/// Snapshot of the outgoing media for display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalMediaState {
    pub video_enabled: bool,
    pub audio_enabled: bool,
    pub screen_sharing: bool,
    pub video_device: Option<String>,
    pub audio_device: Option<String>,
    pub audio_level: u8,
}

/// Owner of the outgoing stream.
///
/// Every replacement of the stream goes through here, and every peer is
/// switched explicitly. A failed acquisition or replacement leaves the
/// previous stream in place.
pub struct LocalMedia {
    devices: Arc<dyn MediaDevices>,
    stream: MediaStream,
    available: Vec<DeviceInfo>,
    video_device: Option<String>,
    audio_device: Option<String>,
    screen: Option<ScreenShare>,
    share_ended: mpsc::UnboundedSender<String>,
    level: AudioLevelMeter,
}

struct ScreenShare {
    track: LocalTrack,
    camera_enabled: bool,
    watcher: JoinHandle<()>,
}

impl LocalMedia {
    /// `share_ended` receives the id of a display track that ended outside
    /// the application.
    pub fn new(devices: Arc<dyn MediaDevices>, share_ended: mpsc::UnboundedSender<String>) -> Self {
        Self {
            devices,
            stream: MediaStream::empty(),
            available: Vec::new(),
            video_device: None,
            audio_device: None,
            screen: None,
            share_ended,
            level: AudioLevelMeter::new(),
        }
    }

    pub fn stream(&self) -> &MediaStream {
        &self.stream
    }

    pub fn available_devices(&self) -> &[DeviceInfo] {
        &self.available
    }

    pub fn level(&self) -> watch::Receiver<u8> {
        self.level.subscribe()
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen.is_some()
    }

    pub fn is_sharing_track(&self, track_id: &str) -> bool {
        self.screen.as_ref().is_some_and(|s| s.track.id() == track_id)
    }

    pub fn state(&self) -> LocalMediaState {
        let enabled = |track: Option<&LocalTrack>| track.is_some_and(|t| t.is_enabled());
        LocalMediaState {
            video_enabled: enabled(self.stream.video_track()),
            audio_enabled: enabled(self.stream.audio_track()),
            screen_sharing: self.screen.is_some(),
            video_device: self.video_device.clone(),
            audio_device: self.audio_device.clone(),
            audio_level: self.level.current(),
        }
    }

    /// Acquires camera and microphone, preferring the last selected devices.
    pub async fn initialize(&mut self) -> Result<(), MediaError> {
        self.refresh_devices().await?;
        let constraints = CaptureConstraints::call(
            DeviceChoice::preferred(self.video_device.as_deref()),
            DeviceChoice::preferred(self.audio_device.as_deref()),
        );
        let stream = self.devices.get_user_media(&constraints).await?;

        let previous = std::mem::replace(&mut self.stream, stream);
        previous.stop_all();
        if let Some(video) = self.stream.video_track() {
            self.video_device = video.device_id().map(String::from);
        }
        if let Some(audio) = self.stream.audio_track() {
            self.audio_device = audio.device_id().map(String::from);
            self.level.start(audio);
        }
        info!(
            "local media ready: {} track(s), camera {:?}, microphone {:?}",
            self.stream.tracks().len(),
            self.video_device,
            self.audio_device
        );
        Ok(())
    }

    pub async fn refresh_devices(&mut self) -> Result<&[DeviceInfo], MediaError> {
        self.available = self.devices.enumerate_devices().await?;
        Ok(&self.available)
    }

    /// Flips the video track's enabled flag. Returns the new flag.
    pub fn toggle_video(&mut self) -> Result<bool, MediaError> {
        toggle(self.stream.video_track(), TrackKind::Video)
    }

    pub fn toggle_audio(&mut self) -> Result<bool, MediaError> {
        toggle(self.stream.audio_track(), TrackKind::Audio)
    }

    /// Starts or stops screen sharing. Returns whether sharing is on.
    pub async fn toggle_screen_share(&mut self, peers: &PeerRegistry) -> Result<bool, MediaError> {
        if self.screen.is_some() {
            self.stop_screen_share(peers).await?;
            Ok(false)
        } else {
            self.start_screen_share(peers).await?;
            Ok(true)
        }
    }

    async fn start_screen_share(&mut self, peers: &PeerRegistry) -> Result<(), MediaError> {
        let display = self.devices.get_display_media().await?;
        let Some(screen) = display.video_track().cloned() else {
            display.stop_all();
            return Err(MediaError::MissingTrack(TrackKind::Video));
        };

        let camera = self.stream.video_track().cloned();
        if let Err(e) = peers
            .replace_outgoing_track(TrackKind::Video, &screen, camera.as_ref())
            .await
        {
            display.stop_all();
            return Err(e.into());
        }

        self.stream = self.stream.with_track(screen.clone());
        let camera_enabled = camera.as_ref().is_none_or(|c| c.is_enabled());
        if let Some(camera) = camera {
            camera.stop();
        }

        let watched = screen.clone();
        let ended = self.share_ended.clone();
        let watcher = tokio::spawn(async move {
            watched.ended().await;
            let _ = ended.send(watched.id().to_string());
        });
        info!("screen sharing started");
        self.screen = Some(ScreenShare {
            track: screen,
            camera_enabled,
            watcher,
        });
        Ok(())
    }

    async fn stop_screen_share(&mut self, peers: &PeerRegistry) -> Result<(), MediaError> {
        let Some(share) = &self.screen else {
            return Ok(());
        };
        let constraints =
            CaptureConstraints::camera(DeviceChoice::preferred(self.video_device.as_deref()));
        let acquired = self.devices.get_user_media(&constraints).await?;
        let Some(camera) = acquired.video_track().cloned() else {
            acquired.stop_all();
            return Err(MediaError::MissingTrack(TrackKind::Video));
        };
        camera.set_enabled(share.camera_enabled);

        if let Err(e) = peers
            .replace_outgoing_track(TrackKind::Video, &camera, Some(&share.track))
            .await
        {
            acquired.stop_all();
            return Err(e.into());
        }

        self.stream = self.stream.with_track(camera.clone());
        self.video_device = camera.device_id().map(String::from);
        if let Some(share) = self.screen.take() {
            share.watcher.abort();
            share.track.stop();
        }
        info!("screen sharing stopped, back on camera {:?}", self.video_device);
        Ok(())
    }

    /// Reverts to the camera after the display track ended on its own.
    /// Returns `false` when `track_id` is not the active share.
    pub async fn handle_share_ended(
        &mut self,
        track_id: &str,
        peers: &PeerRegistry,
    ) -> Result<bool, MediaError> {
        if !self.is_sharing_track(track_id) {
            debug!("ignoring end of inactive display track {}", track_id);
            return Ok(false);
        }
        info!("screen capture ended outside the app");
        self.stop_screen_share(peers).await?;
        Ok(true)
    }

    pub async fn switch_video_device(
        &mut self,
        device_id: &str,
        peers: &PeerRegistry,
    ) -> Result<(), MediaError> {
        if self.screen.is_some() {
            info!("camera {} selected, applied when sharing stops", device_id);
            self.video_device = Some(device_id.to_string());
            return Ok(());
        }
        let constraints = CaptureConstraints::camera(DeviceChoice::Exact(device_id.to_string()));
        let track = self.swap_track(TrackKind::Video, &constraints, peers).await?;
        self.video_device = track.device_id().map(String::from);
        Ok(())
    }

    pub async fn switch_audio_device(
        &mut self,
        device_id: &str,
        peers: &PeerRegistry,
    ) -> Result<(), MediaError> {
        let constraints =
            CaptureConstraints::microphone(DeviceChoice::Exact(device_id.to_string()));
        let track = self.swap_track(TrackKind::Audio, &constraints, peers).await?;
        self.audio_device = track.device_id().map(String::from);
        self.level.start(&track);
        Ok(())
    }

    /// Acquires a track of `kind`, puts it on every peer and into the
    /// stream, then stops the old one.
    async fn swap_track(
        &mut self,
        kind: TrackKind,
        constraints: &CaptureConstraints,
        peers: &PeerRegistry,
    ) -> Result<LocalTrack, MediaError> {
        let acquired = self.devices.get_user_media(constraints).await?;
        let Some(track) = acquired.tracks_of(kind).next().cloned() else {
            acquired.stop_all();
            return Err(MediaError::MissingTrack(kind));
        };

        let old = self.stream.tracks_of(kind).next().cloned();
        track.set_enabled(old.as_ref().is_none_or(|t| t.is_enabled()));
        if let Err(e) = peers.replace_outgoing_track(kind, &track, old.as_ref()).await {
            warn!("switching {} device failed, keeping the current one", kind);
            acquired.stop_all();
            return Err(e.into());
        }

        self.stream = self.stream.with_track(track.clone());
        if let Some(old) = old {
            old.stop();
        }
        info!("{} now from {:?}", kind, track.device_id());
        Ok(track)
    }

    pub fn is_level_meter_running(&self) -> bool {
        self.level.is_running()
    }

    pub fn cancel_level_meter(&mut self) {
        self.level.stop();
    }

    /// Ends every local track, including an active screen share.
    pub fn stop_tracks(&mut self) {
        if let Some(share) = self.screen.take() {
            share.watcher.abort();
            share.track.stop();
        }
        self.stream.stop_all();
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        if let Some(share) = self.screen.take() {
            share.watcher.abort();
        }
    }
}

fn toggle(track: Option<&LocalTrack>, kind: TrackKind) -> Result<bool, MediaError> {
    let track = track.ok_or(MediaError::MissingTrack(kind))?;
    let enabled = !track.is_enabled();
    track.set_enabled(enabled);
    debug!("{} {}", kind, if enabled { "unmuted" } else { "muted" });
    Ok(enabled)
}
