use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use meetroom_contracts::{IceCandidate, SdpType, SessionDescription};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::MeetConfig;
use crate::error::PeerError;
use crate::media::{LocalTrack, TrackKind};
use crate::peer::connection::{
    ConnectionState, PeerConnection, PeerConnectionFactory, PeerContext, PeerEventKind,
    RemoteSource, RemoteTrack, SignalingState,
};

/// Builds webrtc-rs peer connections sharing one media engine setup.
pub struct WebRtcFactory {
    api: API,
    ice_servers: Vec<String>,
    ice_candidate_pool_size: u8,
}

impl WebRtcFactory {
    pub fn new(ice_servers: Vec<String>, ice_candidate_pool_size: u8) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_servers,
            ice_candidate_pool_size,
        })
    }

    pub fn from_config(config: &MeetConfig) -> Result<Self, PeerError> {
        Self::new(config.ice_servers.clone(), config.ice_candidate_pool_size)
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcFactory {
    async fn create(&self, ctx: PeerContext) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ice_candidate_pool_size: self.ice_candidate_pool_size,
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);

        let candidates = ctx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let ctx = candidates.clone();
            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => ctx.emit(PeerEventKind::LocalCandidate(from_rtc_candidate(init))),
                    Err(e) => tracing::warn!("peer {} candidate not serializable: {}", ctx.peer_id, e),
                }
            })
        }));

        let tracks = ctx.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let ctx = tracks.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    RTPCodecType::Unspecified => return,
                };
                tracing::info!("peer {} sent a {} track", ctx.peer_id, kind);
                ctx.emit(PeerEventKind::RemoteTrack(RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                    source: track,
                }));
            })
        }));

        let states = ctx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let ctx = states.clone();
            Box::pin(async move {
                tracing::debug!("peer {} connection state: {}", ctx.peer_id, state);
                if let Some(state) = map_connection_state(state) {
                    ctx.emit(PeerEventKind::StateChanged(state));
                }
            })
        }));

        Ok(Arc::new(WebRtcPeer {
            peer_id: ctx.peer_id,
            pc,
            senders: Mutex::new(Vec::new()),
        }))
    }
}

#[async_trait]
impl RemoteSource for TrackRemote {
    async fn next_payload(&self) -> Option<Bytes> {
        match self.read_rtp().await {
            Ok((packet, _)) => Some(packet.payload),
            Err(e) => {
                tracing::debug!("remote track {} stopped: {}", self.id(), e);
                None
            }
        }
    }
}

pub struct WebRtcPeer {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<Vec<(TrackKind, Arc<RTCRtpSender>)>>,
}

impl WebRtcPeer {
    fn sender(&self, kind: TrackKind) -> Option<Arc<RTCRtpSender>> {
        self.senders
            .lock()
            .ok()?
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, s)| Arc::clone(s))
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
        }
    }

    fn connection_state(&self) -> ConnectionState {
        map_connection_state(self.pc.connection_state()).unwrap_or(ConnectionState::New)
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        let rtc: Arc<dyn TrackLocal + Send + Sync> = track.rtc();
        let sender = self.pc.add_track(rtc).await?;

        // RTCP has to be drained for the interceptors to work
        let reader = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = reader.read(&mut rtcp_buf).await {}
        });

        if let Ok(mut senders) = self.senders.lock() {
            senders.push((track.kind(), sender));
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(to_contract(offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(to_contract(answer))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let desc = match desc.kind {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
            SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
            SdpType::Rollback => {
                return Err(PeerError::Rejected("rollback is not supported".into()));
            }
        };
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: &LocalTrack) -> Result<(), PeerError> {
        let sender = self.sender(kind).ok_or(PeerError::NoSender(kind))?;
        let rtc: Arc<dyn TrackLocal + Send + Sync> = track.rtc();
        sender.replace_track(Some(rtc)).await?;
        tracing::debug!("peer {} now sends {} track {}", self.peer_id, kind, track.id());
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc.close().await?;
        Ok(())
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    Some(match state {
        RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        RTCPeerConnectionState::Unspecified => return None,
    })
}

fn to_contract(desc: RTCSessionDescription) -> SessionDescription {
    let kind = match desc.sdp_type {
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Offer | RTCSdpType::Unspecified => SdpType::Offer,
    };
    SessionDescription {
        kind,
        sdp: desc.sdp,
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}
