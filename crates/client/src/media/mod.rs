//! Local capture: devices, tracks, the outgoing stream and its level meter.

mod controller;
pub mod devices;
mod file_devices;
pub mod level;
mod track;

pub use controller::{LocalMedia, LocalMediaState};
pub use devices::{
    AudioConstraints, CaptureConstraints, DeviceChoice, DeviceInfo, DeviceKind, MediaDevices,
    VideoConstraints, resolve_device,
};
pub use file_devices::FileDevices;
pub use level::{AudioLevelMeter, LevelAnalyser};
pub use track::{LocalTrack, MediaFrame, MediaStream, TrackKind, TrackSource};
