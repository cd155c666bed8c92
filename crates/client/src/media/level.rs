use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::media::track::LocalTrack;

pub const FFT_SIZE: usize = 256;
const SMOOTHING: f32 = 0.8;
const MIN_DB: f32 = -100.0;
const MAX_DB: f32 = -30.0;
/// One display frame at 60 Hz.
const FRAME: Duration = Duration::from_micros(16_667);

/// Frequency-domain energy of the most recent audio, as a 0..=255 byte.
///
/// Same pipeline as a browser analyser node: Blackman window, magnitude
/// spectrum, exponential smoothing over time, dB mapped onto a byte and
/// averaged over all bins.
pub struct LevelAnalyser {
    window: Vec<f32>,
    cos: Vec<f32>,
    sin: Vec<f32>,
    smoothed: Vec<f32>,
}

impl Default for LevelAnalyser {
    fn default() -> Self {
        Self::new()
    }
}

impl LevelAnalyser {
    pub fn new() -> Self {
        let n = FFT_SIZE as f32;
        let window = (0..FFT_SIZE)
            .map(|i| {
                let x = i as f32 / n;
                0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
            })
            .collect();
        let cos = (0..FFT_SIZE)
            .map(|i| (2.0 * PI * i as f32 / n).cos())
            .collect();
        let sin = (0..FFT_SIZE)
            .map(|i| (2.0 * PI * i as f32 / n).sin())
            .collect();

        Self {
            window,
            cos,
            sin,
            smoothed: vec![0.0; FFT_SIZE / 2],
        }
    }

    pub fn level(&mut self, samples: &[f32]) -> u8 {
        let mut frame = [0f32; FFT_SIZE];
        let tail = &samples[samples.len().saturating_sub(FFT_SIZE)..];
        let offset = FFT_SIZE - tail.len();
        for (i, s) in tail.iter().enumerate() {
            frame[offset + i] = s * self.window[offset + i];
        }

        let mut total = 0u32;
        for k in 0..FFT_SIZE / 2 {
            let (mut re, mut im) = (0f32, 0f32);
            for (n, x) in frame.iter().enumerate() {
                let idx = (k * n) % FFT_SIZE;
                re += x * self.cos[idx];
                im -= x * self.sin[idx];
            }
            let magnitude = (re * re + im * im).sqrt() / FFT_SIZE as f32;
            self.smoothed[k] = SMOOTHING * self.smoothed[k] + (1.0 - SMOOTHING) * magnitude;

            let db = 20.0 * self.smoothed[k].max(f32::MIN_POSITIVE).log10();
            let scaled = 255.0 * (db - MIN_DB) / (MAX_DB - MIN_DB);
            total += scaled.clamp(0.0, 255.0) as u32;
        }
        (total / (FFT_SIZE as u32 / 2)) as u8
    }
}

/// Per-frame sampling of the local microphone level.
///
/// Only one sampling loop runs at a time; it must be cancelled with
/// [`AudioLevelMeter::stop`] (or by dropping the meter) on teardown.
pub struct AudioLevelMeter {
    level: Arc<watch::Sender<u8>>,
    task: Option<JoinHandle<()>>,
}

impl Default for AudioLevelMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioLevelMeter {
    pub fn new() -> Self {
        let (level, _) = watch::channel(0);
        Self {
            level: Arc::new(level),
            task: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<u8> {
        self.level.subscribe()
    }

    pub fn current(&self) -> u8 {
        *self.level.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Starts sampling `track`, replacing any previous loop.
    pub fn start(&mut self, track: &LocalTrack) {
        self.stop();
        let level = Arc::clone(&self.level);
        let track = track.clone();
        let mut pcm = track.pcm();

        self.task = Some(tokio::spawn(async move {
            let mut analyser = LevelAnalyser::new();
            let mut ticker = tokio::time::interval(FRAME);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if track.is_ended() {
                    break;
                }
                let block = Arc::clone(&pcm.borrow_and_update());
                let value = analyser.level(&block);
                level.send_if_modified(|current| {
                    let changed = *current != value;
                    *current = value;
                    changed
                });
            }
            level.send_replace(0);
        }));
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.level.send_replace(0);
    }
}

impl Drop for AudioLevelMeter {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
