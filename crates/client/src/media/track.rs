use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_PCMU, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Stream id advertised for every outgoing track of this participant.
const LOCAL_STREAM_ID: &str = "meetroom-local";

const FRAME_TAP_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

impl TrackKind {
    fn codec(self) -> RTCRtpCodecCapability {
        match self {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: 8000,
                channels: 1,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        }
    }
}

/// Where a local track's media comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Camera,
    Microphone,
    Display,
}

/// One encoded media frame as written to peers and recorders.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub data: Bytes,
    pub duration: Duration,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    label: String,
    device_id: Option<String>,
    dimensions: std::sync::Mutex<(u16, u16)>,
    enabled: AtomicBool,
    rtc: Arc<TrackLocalStaticSample>,
    frames: broadcast::Sender<MediaFrame>,
    pcm: watch::Sender<Arc<[f32]>>,
    ended: watch::Sender<bool>,
}

/// A captured audio or video track.
///
/// Cloning yields another handle to the same track. The producer feeds it
/// with [`LocalTrack::push_frame`]; peers read it through [`LocalTrack::rtc`],
/// while the recorder and level meter use the frame and PCM taps.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    pub fn new(
        kind: TrackKind,
        source: TrackSource,
        label: impl Into<String>,
        device_id: Option<String>,
    ) -> Self {
        let id = format!("{kind}-{}", Uuid::new_v4());
        let rtc = Arc::new(TrackLocalStaticSample::new(
            kind.codec(),
            id.clone(),
            LOCAL_STREAM_ID.to_owned(),
        ));
        let (frames, _) = broadcast::channel(FRAME_TAP_CAPACITY);
        let (pcm, _) = watch::channel(Arc::from(Vec::new()));
        let (ended, _) = watch::channel(false);

        Self {
            inner: Arc::new(TrackInner {
                id,
                kind,
                source,
                label: label.into(),
                device_id,
                dimensions: std::sync::Mutex::new((640, 480)),
                enabled: AtomicBool::new(true),
                rtc,
                frames,
                pcm,
                ended,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn device_id(&self) -> Option<&str> {
        self.inner.device_id.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    /// Mutes or unmutes in place; the track stays attached everywhere.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn dimensions(&self) -> (u16, u16) {
        self.inner
            .dimensions
            .lock()
            .map(|d| *d)
            .unwrap_or((640, 480))
    }

    pub fn set_dimensions(&self, width: u16, height: u16) {
        if let Ok(mut d) = self.inner.dimensions.lock() {
            *d = (width, height);
        }
    }

    /// The sample track bound to peer connection senders.
    pub fn rtc(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.inner.rtc)
    }

    pub fn subscribe_frames(&self) -> broadcast::Receiver<MediaFrame> {
        self.inner.frames.subscribe()
    }

    /// Latest block of mono PCM, empty while muted or for video tracks.
    pub fn pcm(&self) -> watch::Receiver<Arc<[f32]>> {
        self.inner.pcm.subscribe()
    }

    /// Forwards one encoded frame. Returns `false` once the track has ended.
    pub async fn push_frame(&self, frame: MediaFrame) -> bool {
        if self.is_ended() {
            return false;
        }
        if !self.is_enabled() {
            return true;
        }
        let sample = Sample {
            data: frame.data.clone(),
            duration: frame.duration,
            ..Default::default()
        };
        if let Err(e) = self.inner.rtc.write_sample(&sample).await {
            tracing::debug!("track {} dropped a sample: {}", self.inner.id, e);
        }
        let _ = self.inner.frames.send(frame);
        true
    }

    pub fn push_pcm(&self, samples: Arc<[f32]>) {
        let block = if self.is_enabled() {
            samples
        } else {
            Arc::from(Vec::new())
        };
        self.inner.pcm.send_replace(block);
    }

    /// Ends the track. Producers stop and `ended()` waiters wake up.
    pub fn stop(&self) {
        if !self.inner.ended.send_replace(true) {
            tracing::debug!("track {} ({}) stopped", self.inner.id, self.inner.label);
        }
    }

    pub fn is_ended(&self) -> bool {
        *self.inner.ended.borrow()
    }

    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }
}

impl PartialEq for LocalTrack {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("source", &self.inner.source)
            .field("device_id", &self.inner.device_id)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// A set of local tracks rendered and sent together.
///
/// Streams are values: swapping a track builds a new stream with a new id
/// and the retained tracks of the other kind.
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn video_track(&self) -> Option<&LocalTrack> {
        self.tracks_of(TrackKind::Video).next()
    }

    pub fn audio_track(&self) -> Option<&LocalTrack> {
        self.tracks_of(TrackKind::Audio).next()
    }

    /// New stream with `track` in place of every track of its kind.
    pub fn with_track(&self, track: LocalTrack) -> MediaStream {
        let kind = track.kind();
        let mut tracks: Vec<LocalTrack> = self
            .tracks
            .iter()
            .filter(|t| t.kind() != kind)
            .cloned()
            .collect();
        tracks.push(track);
        MediaStream::new(tracks)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}
