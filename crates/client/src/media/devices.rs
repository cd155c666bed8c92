use async_trait::async_trait;

use crate::error::MediaError;
use crate::media::track::MediaStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    AudioInput,
    VideoInput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub kind: DeviceKind,
    pub label: String,
}

/// Which device a capture request should open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DeviceChoice {
    #[default]
    Default,
    /// Use this device when it exists, otherwise fall back to the default
    Preferred(String),
    /// Use exactly this device or fail
    Exact(String),
}

impl DeviceChoice {
    pub fn preferred(id: Option<&str>) -> Self {
        match id {
            Some(id) => DeviceChoice::Preferred(id.to_string()),
            None => DeviceChoice::Default,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            DeviceChoice::Default => None,
            DeviceChoice::Preferred(id) | DeviceChoice::Exact(id) => Some(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoConstraints {
    pub device: DeviceChoice,
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub ideal_frame_rate: u32,
}

impl VideoConstraints {
    pub fn ideal(device: DeviceChoice) -> Self {
        Self {
            device,
            ideal_width: 1280,
            ideal_height: 720,
            ideal_frame_rate: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConstraints {
    pub device: DeviceChoice,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl AudioConstraints {
    pub fn ideal(device: DeviceChoice) -> Self {
        Self {
            device,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// What to capture; a `None` kind is not requested.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub video: Option<VideoConstraints>,
    pub audio: Option<AudioConstraints>,
}

impl CaptureConstraints {
    pub fn call(video: DeviceChoice, audio: DeviceChoice) -> Self {
        Self {
            video: Some(VideoConstraints::ideal(video)),
            audio: Some(AudioConstraints::ideal(audio)),
        }
    }

    pub fn camera(device: DeviceChoice) -> Self {
        Self {
            video: Some(VideoConstraints::ideal(device)),
            audio: None,
        }
    }

    pub fn microphone(device: DeviceChoice) -> Self {
        Self {
            video: None,
            audio: Some(AudioConstraints::ideal(device)),
        }
    }
}

/// Capture device access.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, MediaError>;

    async fn get_user_media(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<MediaStream, MediaError>;

    /// Screen capture. The returned video track ends on its own when the
    /// capture is stopped outside the application.
    async fn get_display_media(&self) -> Result<MediaStream, MediaError>;
}

/// Resolves a choice against the enumerated devices of one kind.
pub fn resolve_device<'a>(
    devices: &'a [DeviceInfo],
    kind: DeviceKind,
    choice: &DeviceChoice,
) -> Result<&'a DeviceInfo, MediaError> {
    let mut candidates = devices.iter().filter(|d| d.kind == kind);
    match choice {
        DeviceChoice::Default => candidates.next().ok_or(MediaError::NotFound),
        DeviceChoice::Preferred(id) => {
            let all: Vec<&DeviceInfo> = candidates.collect();
            all.iter()
                .find(|d| &d.device_id == id)
                .or_else(|| all.first())
                .copied()
                .ok_or(MediaError::NotFound)
        }
        DeviceChoice::Exact(id) => candidates
            .find(|d| &d.device_id == id)
            .ok_or(MediaError::NotFound),
    }
}
