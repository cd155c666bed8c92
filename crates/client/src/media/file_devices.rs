use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};
use webrtc::media::io::ivf_reader::{IVFFileHeader, IVFReader};

use crate::config::MeetConfig;
use crate::error::MediaError;
use crate::media::devices::{
    CaptureConstraints, DeviceInfo, DeviceKind, MediaDevices, resolve_device,
};
use crate::media::track::{LocalTrack, MediaFrame, MediaStream, TrackKind, TrackSource};

const AUDIO_FRAME: Duration = Duration::from_millis(20);
const PCMU_RATE: u32 = 8000;

/// Capture devices backed by media files.
///
/// Every `*.ivf` (VP8) file in the media directory is a camera and every
/// `*.wav` file a microphone; the file stem is the device id. Cameras and
/// microphones loop forever, the display source plays once and then ends.
pub struct FileDevices {
    media_dir: PathBuf,
    display_source: Option<PathBuf>,
}

impl FileDevices {
    pub fn new(media_dir: impl Into<PathBuf>, display_source: Option<PathBuf>) -> Self {
        Self {
            media_dir: media_dir.into(),
            display_source,
        }
    }

    pub fn from_config(config: &MeetConfig) -> Self {
        Self::new(config.media_dir.clone(), config.display_source.clone())
    }

    fn scan(&self) -> Result<Vec<(DeviceInfo, PathBuf)>, MediaError> {
        let entries = match std::fs::read_dir(&self.media_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("media directory {} does not exist", self.media_dir.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(map_io(e)),
        };

        let mut found = Vec::new();
        for entry in entries {
            let path = entry.map_err(map_io)?.path();
            let kind = match path.extension().and_then(|e| e.to_str()) {
                Some(ext) if ext.eq_ignore_ascii_case("ivf") => DeviceKind::VideoInput,
                Some(ext) if ext.eq_ignore_ascii_case("wav") => DeviceKind::AudioInput,
                _ => continue,
            };
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let info = DeviceInfo {
                device_id: stem.to_string(),
                kind,
                label: stem.replace(['_', '-'], " "),
            };
            found.push((info, path));
        }
        found.sort_by(|a, b| a.0.device_id.cmp(&b.0.device_id));
        Ok(found)
    }
}

#[async_trait]
impl MediaDevices for FileDevices {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, MediaError> {
        Ok(self.scan()?.into_iter().map(|(info, _)| info).collect())
    }

    async fn get_user_media(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<MediaStream, MediaError> {
        let found = self.scan()?;
        let infos: Vec<DeviceInfo> = found.iter().map(|(info, _)| info.clone()).collect();
        let path_of = |id: &str| {
            found
                .iter()
                .find(|(info, _)| info.device_id == id)
                .map(|(_, path)| path.clone())
                .ok_or(MediaError::NotFound)
        };

        let mut tracks = Vec::new();
        if let Some(video) = &constraints.video {
            let info = resolve_device(&infos, DeviceKind::VideoInput, &video.device)?;
            let path = path_of(&info.device_id)?;
            tracks.push(open_video(
                &path,
                &info.label,
                Some(info.device_id.clone()),
                TrackSource::Camera,
                true,
            )?);
        }
        if let Some(audio) = &constraints.audio {
            let opened = resolve_device(&infos, DeviceKind::AudioInput, &audio.device)
                .and_then(|info| Ok((info, path_of(&info.device_id)?)))
                .and_then(|(info, path)| open_audio(&path, info));
            match opened {
                Ok(track) => tracks.push(track),
                Err(e) => {
                    for track in &tracks {
                        track.stop();
                    }
                    return Err(e);
                }
            }
        }

        if tracks.is_empty() {
            return Err(MediaError::NotFound);
        }
        Ok(MediaStream::new(tracks))
    }

    async fn get_display_media(&self) -> Result<MediaStream, MediaError> {
        let path = self
            .display_source
            .as_ref()
            .ok_or(MediaError::DisplayUnavailable)?;
        let track = open_video(path, "Screen", None, TrackSource::Display, false).map_err(
            |e| match e {
                MediaError::NotFound | MediaError::PermissionDenied => {
                    MediaError::DisplayUnavailable
                }
                other => other,
            },
        )?;
        info!("display capture started from {}", path.display());
        Ok(MediaStream::new(vec![track]))
    }
}

type FileIvf = IVFReader<BufReader<File>>;

fn open_ivf(path: &Path) -> Result<(FileIvf, IVFFileHeader), MediaError> {
    let file = File::open(path).map_err(map_io)?;
    IVFReader::new(BufReader::new(file))
        .map_err(|e| MediaError::Device(format!("{}: {}", path.display(), e)))
}

fn open_video(
    path: &Path,
    label: &str,
    device_id: Option<String>,
    source: TrackSource,
    looping: bool,
) -> Result<LocalTrack, MediaError> {
    let (reader, header) = open_ivf(path)?;
    let track = LocalTrack::new(TrackKind::Video, source, label, device_id);
    track.set_dimensions(header.width, header.height);
    let frame_time = frame_interval(&header);

    tokio::spawn(pump_video(
        path.to_path_buf(),
        reader,
        frame_time,
        track.clone(),
        looping,
    ));
    Ok(track)
}

fn frame_interval(header: &IVFFileHeader) -> Duration {
    if header.timebase_denominator == 0 {
        return Duration::from_millis(33);
    }
    let secs = header.timebase_numerator as f64 / header.timebase_denominator as f64;
    Duration::from_secs_f64(secs).max(Duration::from_millis(1))
}

async fn pump_video(
    path: PathBuf,
    mut reader: FileIvf,
    frame_time: Duration,
    track: LocalTrack,
    looping: bool,
) {
    let mut ticker = tokio::time::interval(frame_time);
    loop {
        tokio::select! {
            _ = track.ended() => return,
            _ = ticker.tick() => {}
        }

        match reader.parse_next_frame() {
            Ok((frame, _)) => {
                let frame = MediaFrame {
                    data: frame.freeze(),
                    duration: frame_time,
                };
                if !track.push_frame(frame).await {
                    return;
                }
            }
            Err(_) if looping => match open_ivf(&path) {
                Ok((next, _)) => reader = next,
                Err(e) => {
                    warn!("camera source {} went away: {}", path.display(), e);
                    track.stop();
                    return;
                }
            },
            Err(_) => {
                info!("display source {} finished", path.display());
                track.stop();
                return;
            }
        }
    }
}

fn open_audio(path: &Path, info: &DeviceInfo) -> Result<LocalTrack, MediaError> {
    let reader = hound::WavReader::open(path).map_err(map_wav)?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(map_wav)?
        }
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(map_wav)?,
    };
    let mono: Vec<f32> = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();
    if mono.is_empty() {
        return Err(MediaError::Device(format!(
            "{} has no samples",
            path.display()
        )));
    }

    debug!(
        "microphone {} -> {} Hz, {} channel(s), {:.1}s loop",
        info.device_id,
        spec.sample_rate,
        spec.channels,
        mono.len() as f32 / spec.sample_rate as f32
    );

    let track = LocalTrack::new(
        TrackKind::Audio,
        TrackSource::Microphone,
        &info.label,
        Some(info.device_id.clone()),
    );
    tokio::spawn(pump_audio(Arc::from(mono), spec.sample_rate, track.clone()));
    Ok(track)
}

async fn pump_audio(samples: Arc<[f32]>, sample_rate: u32, track: LocalTrack) {
    let block = (sample_rate as usize / 50).max(1);
    let mut ticker = tokio::time::interval(AUDIO_FRAME);
    let mut position = 0usize;

    loop {
        tokio::select! {
            _ = track.ended() => return,
            _ = ticker.tick() => {}
        }

        let chunk: Vec<f32> = (0..block)
            .map(|i| samples[(position + i) % samples.len()])
            .collect();
        position = (position + block) % samples.len();

        let payload = encode_ulaw(&resample(&chunk, sample_rate, PCMU_RATE));
        track.push_pcm(Arc::from(chunk));
        let frame = MediaFrame {
            data: Bytes::from(payload),
            duration: AUDIO_FRAME,
        };
        if !track.push_frame(frame).await {
            return;
        }
    }
}

/// Box-filter resampling, good enough for narrowband voice.
fn resample(block: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || block.is_empty() {
        return block.to_vec();
    }
    let out_len = (block.len() as u64 * to as u64 / from as u64).max(1) as usize;
    (0..out_len)
        .map(|i| {
            let start = (i as u64 * from as u64 / to as u64) as usize;
            let end = (((i + 1) as u64 * from as u64 / to as u64) as usize)
                .max(start + 1)
                .min(block.len());
            let start = start.min(end - 1);
            block[start..end].iter().sum::<f32>() / (end - start) as f32
        })
        .collect()
}

fn encode_ulaw(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .map(|s| linear_to_ulaw((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
        .collect()
}

/// G.711 µ-law companding of one 16-bit sample.
fn linear_to_ulaw(sample: i16) -> u8 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32635;

    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    pcm = pcm.min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

fn map_io(err: io::Error) -> MediaError {
    match err.kind() {
        io::ErrorKind::PermissionDenied => MediaError::PermissionDenied,
        io::ErrorKind::NotFound => MediaError::NotFound,
        _ => MediaError::Device(err.to_string()),
    }
}

fn map_wav(err: hound::Error) -> MediaError {
    match err {
        hound::Error::IoError(e) => map_io(e),
        other => MediaError::Device(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::devices::DeviceChoice;
    use crate::recorder::IvfWriter;

    fn write_wav(path: &Path, seconds: f32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 48000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        let total = (48000.0 * seconds) as usize;
        for i in 0..total {
            let t = i as f32 / 48000.0;
            let v = (t * 440.0 * std::f32::consts::TAU).sin() * 0.5;
            writer.write_sample((v * i16::MAX as f32) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn write_ivf(path: &Path, frames: usize) {
        let mut writer = IvfWriter::new(320, 240);
        for i in 0..frames {
            writer.push(&[0x10, 0x02, 0x00, i as u8], Duration::from_millis(33 * i as u64));
        }
        std::fs::write(path, writer.finish()).unwrap();
    }

    #[test]
    fn ulaw_silence_and_sign() {
        assert_eq!(linear_to_ulaw(0), 0xFF);
        let pos = linear_to_ulaw(12000);
        let neg = linear_to_ulaw(-12000);
        assert_eq!(pos ^ neg, 0x80);
        assert_eq!(linear_to_ulaw(i16::MAX), linear_to_ulaw(32635));
    }

    #[test]
    fn twenty_ms_at_48k_becomes_one_pcmu_packet() {
        let block = vec![0.25f32; 960];
        let narrow = resample(&block, 48000, PCMU_RATE);
        assert_eq!(narrow.len(), 160);
        assert!(narrow.iter().all(|v| (v - 0.25).abs() < 1e-6));
    }

    #[tokio::test]
    async fn enumerates_files_as_devices() {
        let dir = tempfile::tempdir().unwrap();
        write_ivf(&dir.path().join("front_camera.ivf"), 3);
        write_wav(&dir.path().join("desk-mic.wav"), 0.1);
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let devices = FileDevices::new(dir.path(), None);
        let found = devices.enumerate_devices().await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].device_id, "desk-mic");
        assert_eq!(found[0].kind, DeviceKind::AudioInput);
        assert_eq!(found[0].label, "desk mic");
        assert_eq!(found[1].device_id, "front_camera");
        assert_eq!(found[1].kind, DeviceKind::VideoInput);
    }

    #[tokio::test]
    async fn capture_opens_both_kinds() {
        let dir = tempfile::tempdir().unwrap();
        write_ivf(&dir.path().join("cam.ivf"), 3);
        write_wav(&dir.path().join("mic.wav"), 0.1);

        let devices = FileDevices::new(dir.path(), None);
        let stream = devices
            .get_user_media(&CaptureConstraints::call(
                DeviceChoice::Default,
                DeviceChoice::Preferred("mic".into()),
            ))
            .await
            .unwrap();

        let video = stream.video_track().unwrap();
        assert_eq!(video.device_id(), Some("cam"));
        assert_eq!(video.dimensions(), (320, 240));
        assert_eq!(stream.audio_track().unwrap().device_id(), Some("mic"));
        stream.stop_all();
    }

    #[tokio::test]
    async fn empty_directory_reports_missing_hardware() {
        let dir = tempfile::tempdir().unwrap();
        let devices = FileDevices::new(dir.path(), None);
        let err = devices
            .get_user_media(&CaptureConstraints::call(
                DeviceChoice::Default,
                DeviceChoice::Default,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::NotFound));
    }

    #[tokio::test]
    async fn display_without_source_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let devices = FileDevices::new(dir.path(), None);
        assert!(matches!(
            devices.get_display_media().await,
            Err(MediaError::DisplayUnavailable)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn display_source_ends_after_last_frame() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("screen.ivf");
        write_ivf(&source, 4);

        let devices = FileDevices::new(dir.path(), Some(source));
        let stream = devices.get_display_media().await.unwrap();
        let track = stream.video_track().unwrap().clone();
        assert_eq!(track.source(), TrackSource::Display);

        tokio::time::timeout(Duration::from_secs(5), track.ended())
            .await
            .unwrap();
    }
}
