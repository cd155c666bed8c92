//! Local recording of the outgoing video into an IVF file.

mod ivf;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Local};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RecorderError;
use crate::media::{LocalTrack, MediaStream};

pub use ivf::IvfWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
    /// Stopped, waiting for the user to save or discard.
    PendingDecision,
}

/// Revocable local reference to a finished recording.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    fn new() -> Self {
        Self(format!("blob:meetroom/{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingArtifact {
    pub reference: ArtifactRef,
    pub size: u64,
    pub duration: Duration,
}

struct ActiveRecording {
    writer: Arc<Mutex<IvfWriter>>,
    capture: Option<(String, JoinHandle<()>)>,
    ticker: JoinHandle<()>,
    started: Instant,
}

struct PendingArtifact {
    artifact: RecordingArtifact,
    blob: Bytes,
}

/// Records the local video track.
///
/// `Idle -> Recording -> PendingDecision -> Idle`. Failures here never
/// touch the call media.
pub struct Recorder {
    active: Option<ActiveRecording>,
    pending: Option<PendingArtifact>,
    elapsed: Arc<watch::Sender<u64>>,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder {
    pub fn new() -> Self {
        let (elapsed, _) = watch::channel(0);
        Self {
            active: None,
            pending: None,
            elapsed: Arc::new(elapsed),
        }
    }

    pub fn state(&self) -> RecorderState {
        if self.active.is_some() {
            RecorderState::Recording
        } else if self.pending.is_some() {
            RecorderState::PendingDecision
        } else {
            RecorderState::Idle
        }
    }

    /// Whole seconds recorded so far, ticking once per second.
    pub fn elapsed(&self) -> watch::Receiver<u64> {
        self.elapsed.subscribe()
    }

    pub fn elapsed_secs(&self) -> u64 {
        *self.elapsed.borrow()
    }

    pub fn artifact(&self) -> Option<&RecordingArtifact> {
        self.pending.as_ref().map(|p| &p.artifact)
    }

    /// Bytes behind a reference that has not been released yet.
    pub fn resolve(&self, reference: &ArtifactRef) -> Option<Bytes> {
        self.pending
            .as_ref()
            .filter(|p| &p.artifact.reference == reference)
            .map(|p| p.blob.clone())
    }

    /// Starts recording the stream's video track. Does nothing while a
    /// recording is running; an undecided artifact is released first.
    pub fn start(&mut self, stream: &MediaStream) -> Result<(), RecorderError> {
        if self.active.is_some() {
            debug!("already recording");
            return Ok(());
        }
        let track = stream.video_track().ok_or(RecorderError::NoVideoTrack)?;
        if self.pending.is_some() {
            self.discard();
        }

        let (width, height) = track.dimensions();
        let writer = Arc::new(Mutex::new(IvfWriter::new(width, height)));
        let started = Instant::now();
        self.elapsed.send_replace(0);

        let elapsed = Arc::clone(&self.elapsed);
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                elapsed.send_replace(started.elapsed().as_secs());
            }
        });

        let capture = spawn_capture(track, Arc::clone(&writer), started);
        self.active = Some(ActiveRecording {
            writer,
            capture: Some((track.id().to_string(), capture)),
            ticker,
            started,
        });
        info!("recording started ({}x{})", width, height);
        Ok(())
    }

    /// Follows a replaced local stream so the recording continues on the
    /// new video track.
    pub fn retarget(&mut self, stream: &MediaStream) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let next = stream.video_track();
        let current = active.capture.as_ref().map(|(id, _)| id.as_str());
        if next.map(LocalTrack::id) == current {
            return;
        }

        if let Some((_, task)) = active.capture.take() {
            task.abort();
        }
        match next {
            Some(track) => {
                debug!("recording now follows track {}", track.id());
                let task = spawn_capture(track, Arc::clone(&active.writer), active.started);
                active.capture = Some((track.id().to_string(), task));
            }
            None => warn!("local stream has no video, recording paused"),
        }
    }

    /// Finalizes the file and holds it for a save-or-discard decision.
    pub fn stop(&mut self) -> Result<RecordingArtifact, RecorderError> {
        let active = self.active.take().ok_or(RecorderError::NotRecording)?;
        if let Some((_, task)) = active.capture {
            task.abort();
        }
        active.ticker.abort();

        let duration = active.started.elapsed();
        self.elapsed.send_replace(duration.as_secs());
        let writer = {
            let mut guard = active.writer.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *guard, IvfWriter::new(0, 0))
        };
        let frames = writer.frames();
        let blob = writer.finish();

        let artifact = RecordingArtifact {
            reference: ArtifactRef::new(),
            size: blob.len() as u64,
            duration,
        };
        info!(
            "recording stopped: {} frames, {} bytes, {:.1}s",
            frames,
            artifact.size,
            duration.as_secs_f32()
        );
        self.pending = Some(PendingArtifact {
            artifact: artifact.clone(),
            blob,
        });
        Ok(artifact)
    }

    /// Saves the pending artifact into `dir` under a timestamped name.
    /// Returns `None` when there is nothing to save.
    pub async fn download(&self, dir: &Path) -> Result<Option<PathBuf>, RecorderError> {
        let Some(pending) = &self.pending else {
            return Ok(None);
        };
        let path = dir.join(recording_file_name(Local::now()));
        tokio::fs::write(&path, &pending.blob).await?;
        info!("recording saved to {}", path.display());
        Ok(Some(path))
    }

    /// Releases the pending artifact. Returns whether there was one.
    pub fn discard(&mut self) -> bool {
        let Some(pending) = self.pending.take() else {
            return false;
        };
        debug!("released {}", pending.artifact.reference);
        self.elapsed.send_replace(0);
        true
    }

    /// Stops any running recording and releases every artifact.
    pub fn shutdown(&mut self) {
        if self.active.is_some() {
            let _ = self.stop();
        }
        self.discard();
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            if let Some((_, task)) = active.capture {
                task.abort();
            }
            active.ticker.abort();
        }
    }
}

fn spawn_capture(
    track: &LocalTrack,
    writer: Arc<Mutex<IvfWriter>>,
    started: Instant,
) -> JoinHandle<()> {
    let mut frames = track.subscribe_frames();
    let track = track.clone();
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = track.ended() => break,
                frame = frames.recv() => frame,
            };
            match frame {
                Ok(frame) => {
                    if let Ok(mut writer) = writer.lock() {
                        writer.push(&frame.data, started.elapsed());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("recorder fell behind, {} frames lost", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

pub fn recording_file_name(at: DateTime<Local>) -> String {
    at.format("meeting-recording-%Y-%m-%d_%H-%M-%S.ivf").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaFrame, TrackKind, TrackSource};
    use chrono::TimeZone;
    use std::io::Cursor;
    use webrtc::media::io::ivf_reader::IVFReader;

    fn camera() -> LocalTrack {
        let track = LocalTrack::new(TrackKind::Video, TrackSource::Camera, "cam", None);
        track.set_dimensions(320, 240);
        track
    }

    fn feed(track: &LocalTrack) -> JoinHandle<()> {
        let track = track.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(100));
            loop {
                ticker.tick().await;
                let frame = MediaFrame {
                    data: Bytes::from_static(&[0x30, 0x01, 0x00]),
                    duration: Duration::from_millis(100),
                };
                if !track.push_frame(frame).await {
                    break;
                }
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn artifact_covers_recorded_time() {
        let track = camera();
        let stream = MediaStream::new(vec![track.clone()]);
        let feeder = feed(&track);

        let mut recorder = Recorder::new();
        recorder.start(&stream).unwrap();
        assert_eq!(recorder.state(), RecorderState::Recording);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(recorder.elapsed_secs() >= 2);

        let artifact = recorder.stop().unwrap();
        feeder.abort();
        assert_eq!(recorder.state(), RecorderState::PendingDecision);
        assert!(artifact.duration >= Duration::from_secs(2));
        assert!(artifact.duration <= Duration::from_secs(4));
        assert!(artifact.size > 0);
        assert!(artifact.reference.as_str().starts_with("blob:meetroom/"));

        let blob = recorder.resolve(&artifact.reference).unwrap();
        assert_eq!(blob.len() as u64, artifact.size);
        let (_, header) = IVFReader::new(Cursor::new(blob)).unwrap();
        assert_eq!((header.width, header.height), (320, 240));
        assert!(header.num_frames > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn discard_and_download_are_safe_after_release() {
        let track = camera();
        let stream = MediaStream::new(vec![track.clone()]);
        let mut recorder = Recorder::new();
        recorder.start(&stream).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let artifact = recorder.stop().unwrap();

        assert!(recorder.discard());
        assert!(!recorder.discard());
        assert_eq!(recorder.state(), RecorderState::Idle);
        assert!(recorder.resolve(&artifact.reference).is_none());

        let dir = tempfile::tempdir().unwrap();
        assert_eq!(recorder.download(dir.path()).await.unwrap(), None);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn download_keeps_the_artifact() {
        let track = camera();
        let stream = MediaStream::new(vec![track]);
        let mut recorder = Recorder::new();
        recorder.start(&stream).unwrap();
        recorder.stop().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = recorder.download(dir.path()).await.unwrap().unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("meeting-recording-") && name.ends_with(".ivf"));
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
        assert_eq!(recorder.state(), RecorderState::PendingDecision);
    }

    #[test]
    fn start_needs_video() {
        let mic = LocalTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic", None);
        let mut recorder = Recorder::new();
        assert!(matches!(
            recorder.start(&MediaStream::new(vec![mic])),
            Err(RecorderError::NoVideoTrack)
        ));
        assert!(matches!(recorder.stop(), Err(RecorderError::NotRecording)));
    }

    #[tokio::test(start_paused = true)]
    async fn recording_follows_replaced_stream() {
        let first = camera();
        let stream = MediaStream::new(vec![first.clone()]);
        let mut recorder = Recorder::new();
        recorder.start(&stream).unwrap();

        let second = camera();
        let swapped = stream.with_track(second.clone());
        recorder.retarget(&swapped);
        first.stop();

        let feeder = feed(&second);
        tokio::time::sleep(Duration::from_millis(550)).await;
        let artifact = recorder.stop().unwrap();
        feeder.abort();

        let blob = recorder.resolve(&artifact.reference).unwrap();
        let (_, header) = IVFReader::new(Cursor::new(blob)).unwrap();
        assert!(header.num_frames >= 4);
    }

    #[test]
    fn file_name_is_timestamped() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            recording_file_name(at),
            "meeting-recording-2024-03-09_14-05-07.ivf"
        );
    }
}
