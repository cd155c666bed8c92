mod common;

use std::sync::Arc;

use common::{FakeDevices, FakePeerFactory, Failure, RecordingSink};
use meetroom_client::error::MediaError;
use meetroom_client::media::{LocalMedia, TrackKind, TrackSource};
use meetroom_client::peer::{PeerRegistry, SignalingState};
use meetroom_contracts::{SessionDescription, Signal};
use tokio::sync::mpsc;

struct Call {
    devices: Arc<FakeDevices>,
    factory: Arc<FakePeerFactory>,
    media: LocalMedia,
    peers: PeerRegistry,
    share_ended: mpsc::UnboundedReceiver<String>,
}

impl Call {
    /// Local media from the standard fake devices, negotiated with `peers`.
    async fn with_peers(peers: &[&str]) -> Self {
        let devices = FakeDevices::standard();
        let factory = FakePeerFactory::new();
        let (ended_tx, share_ended) = mpsc::unbounded_channel();
        let (events_tx, _events) = mpsc::unbounded_channel();

        let mut media = LocalMedia::new(devices.clone(), ended_tx);
        media.initialize().await.unwrap();
        let mut registry = PeerRegistry::new(factory.clone(), events_tx);
        let sink = RecordingSink::default();
        for peer in peers {
            let id = peer.to_string();
            registry.ensure_peer(&id, media.stream(), &sink).await.unwrap();
            registry
                .handle_signal(
                    &id,
                    Signal::sdp(SessionDescription::answer("answer")),
                    media.stream(),
                    &sink,
                )
                .await
                .unwrap();
        }

        Self {
            devices,
            factory,
            media,
            peers: registry,
            share_ended,
        }
    }

    fn video_id(&self) -> String {
        self.media.stream().video_track().unwrap().id().to_string()
    }

    fn audio_id(&self) -> String {
        self.media.stream().audio_track().unwrap().id().to_string()
    }

    /// Asserts every peer sends the current local video without having
    /// renegotiated.
    fn assert_peers_send_local_video(&self) {
        let video = self.video_id();
        for id in self.peers.ids() {
            let peer = self.factory.latest(&id);
            assert_eq!(peer.sender_track(TrackKind::Video), Some(video.clone()), "{id}");
            assert_eq!(peer.signaling(), SignalingState::Stable, "{id}");
            assert_eq!(peer.offers_created(), 1, "{id}");
        }
    }
}

#[tokio::test]
async fn initialize_opens_default_devices() {
    let call = Call::with_peers(&[]).await;

    let state = call.media.state();
    assert!(state.video_enabled);
    assert!(state.audio_enabled);
    assert!(!state.screen_sharing);
    assert_eq!(state.video_device.as_deref(), Some("front"));
    assert_eq!(state.audio_device.as_deref(), Some("headset"));
    assert_eq!(call.media.available_devices().len(), 4);
}

#[tokio::test]
async fn initialize_failures_keep_their_cause() {
    let devices = FakeDevices::standard();
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut media = LocalMedia::new(devices.clone(), tx);

    devices.fail_next(Failure::Denied);
    assert!(matches!(
        media.initialize().await,
        Err(MediaError::PermissionDenied)
    ));

    devices.fail_next(Failure::Missing);
    assert!(matches!(media.initialize().await, Err(MediaError::NotFound)));

    media.initialize().await.unwrap();
    assert_eq!(media.stream().tracks().len(), 2);
}

#[tokio::test]
async fn toggles_flip_the_same_tracks() {
    let mut call = Call::with_peers(&["B1"]).await;
    let video = call.video_id();
    let audio = call.audio_id();

    assert!(!call.media.toggle_audio().unwrap());
    assert!(!call.media.toggle_video().unwrap());
    assert!(call.media.toggle_audio().unwrap());

    assert_eq!(call.video_id(), video);
    assert_eq!(call.audio_id(), audio);
    let state = call.media.state();
    assert!(state.audio_enabled);
    assert!(!state.video_enabled);
}

#[tokio::test]
async fn switching_camera_updates_every_peer() {
    let mut call = Call::with_peers(&["B1", "B2"]).await;
    let before = call.video_id();
    let audio = call.audio_id();
    let old_track = call.media.stream().video_track().unwrap().clone();

    call.media
        .switch_video_device("back", &call.peers)
        .await
        .unwrap();

    assert_ne!(call.video_id(), before);
    assert_eq!(call.audio_id(), audio);
    assert_eq!(call.media.state().video_device.as_deref(), Some("back"));
    assert!(old_track.is_ended());
    call.assert_peers_send_local_video();
}

#[tokio::test]
async fn switched_track_keeps_the_muted_state() {
    let mut call = Call::with_peers(&["B1"]).await;
    call.media.toggle_video().unwrap();

    call.media
        .switch_video_device("back", &call.peers)
        .await
        .unwrap();

    assert!(!call.media.state().video_enabled);
}

#[tokio::test]
async fn failed_switch_keeps_the_previous_stream() {
    let mut call = Call::with_peers(&["B1"]).await;
    let stream_id = call.media.stream().id().to_string();
    let video = call.video_id();

    let missing = call.media.switch_video_device("unplugged", &call.peers).await;
    assert!(matches!(missing, Err(MediaError::NotFound)));

    call.devices.fail_next(Failure::Denied);
    let denied = call.media.switch_audio_device("desk", &call.peers).await;
    assert!(matches!(denied, Err(MediaError::PermissionDenied)));

    assert_eq!(call.media.stream().id(), stream_id);
    assert_eq!(call.video_id(), video);
    assert!(!call.media.stream().video_track().unwrap().is_ended());
    call.assert_peers_send_local_video();
}

#[tokio::test]
async fn failed_peer_replace_rolls_back_and_stops_the_new_track() {
    let mut call = Call::with_peers(&["B1", "B2"]).await;
    let video = call.video_id();
    call.factory.latest("B2").fail_replace();

    let result = call.media.switch_video_device("back", &call.peers).await;

    assert!(matches!(result, Err(MediaError::Replace(_))));
    assert_eq!(call.video_id(), video);
    assert_eq!(call.media.state().video_device.as_deref(), Some("front"));
    let acquired = call.devices.opened().pop().unwrap();
    assert_eq!(acquired.device_id(), Some("back"));
    assert!(acquired.is_ended());
    for id in ["B1", "B2"] {
        assert_eq!(
            call.factory.latest(id).sender_track(TrackKind::Video),
            Some(video.clone())
        );
    }
}

#[tokio::test]
async fn screen_share_round_trip_restores_the_selected_camera() {
    let mut call = Call::with_peers(&["B1", "B2"]).await;
    call.media
        .switch_video_device("back", &call.peers)
        .await
        .unwrap();
    let audio = call.audio_id();

    assert!(call.media.toggle_screen_share(&call.peers).await.unwrap());
    let screen = call.media.stream().video_track().unwrap().clone();
    assert_eq!(screen.source(), TrackSource::Display);
    assert!(call.media.state().screen_sharing);
    call.assert_peers_send_local_video();

    assert!(!call.media.toggle_screen_share(&call.peers).await.unwrap());
    let camera = call.media.stream().video_track().unwrap();
    assert_eq!(camera.source(), TrackSource::Camera);
    assert_eq!(camera.device_id(), Some("back"));
    assert_eq!(call.audio_id(), audio);
    assert!(screen.is_ended());
    assert!(!call.media.state().screen_sharing);
    call.assert_peers_send_local_video();
}

#[tokio::test]
async fn camera_picked_while_sharing_is_used_afterwards() {
    let mut call = Call::with_peers(&["B1"]).await;
    call.media.toggle_screen_share(&call.peers).await.unwrap();

    call.media
        .switch_video_device("back", &call.peers)
        .await
        .unwrap();
    assert_eq!(
        call.media.stream().video_track().unwrap().source(),
        TrackSource::Display
    );

    call.media.toggle_screen_share(&call.peers).await.unwrap();
    assert_eq!(
        call.media.stream().video_track().unwrap().device_id(),
        Some("back")
    );
}

#[tokio::test]
async fn muted_camera_stays_muted_after_sharing() {
    let mut call = Call::with_peers(&["B1"]).await;
    call.media.toggle_video().unwrap();

    call.media.toggle_screen_share(&call.peers).await.unwrap();
    call.media.toggle_screen_share(&call.peers).await.unwrap();

    assert!(!call.media.state().video_enabled);
}

#[tokio::test]
async fn share_ended_outside_the_app_reverts_to_camera() {
    let mut call = Call::with_peers(&["B1"]).await;
    call.media.toggle_screen_share(&call.peers).await.unwrap();

    call.devices.last_display().unwrap().stop();
    let ended = call.share_ended.recv().await.unwrap();
    let reverted = call
        .media
        .handle_share_ended(&ended, &call.peers)
        .await
        .unwrap();

    assert!(reverted);
    assert!(!call.media.is_screen_sharing());
    assert_eq!(
        call.media.stream().video_track().unwrap().source(),
        TrackSource::Camera
    );
    call.assert_peers_send_local_video();

    let again = call
        .media
        .handle_share_ended(&ended, &call.peers)
        .await
        .unwrap();
    assert!(!again);
}

#[tokio::test]
async fn unavailable_display_leaves_the_camera_on() {
    let mut call = Call::with_peers(&["B1"]).await;
    let video = call.video_id();
    call.devices.set_display_unavailable(true);

    let result = call.media.toggle_screen_share(&call.peers).await;

    assert!(matches!(result, Err(MediaError::DisplayUnavailable)));
    assert!(!call.media.is_screen_sharing());
    assert_eq!(call.video_id(), video);
}

#[tokio::test]
async fn stop_tracks_ends_everything() {
    let mut call = Call::with_peers(&[]).await;
    call.media.toggle_screen_share(&call.peers).await.unwrap();
    assert!(call.media.is_level_meter_running());

    call.media.cancel_level_meter();
    call.media.stop_tracks();

    assert!(!call.media.is_level_meter_running());
    assert_eq!(call.media.state().audio_level, 0);

    assert!(call.media.stream().tracks().iter().all(|t| t.is_ended()));
    assert!(call.devices.last_display().unwrap().is_ended());
    assert!(call.devices.opened().iter().all(|t| t.is_ended()));
}
