use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use meetroom_contracts::{IceCandidate, PeerId, SdpType, SessionDescription, Signal};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::PeerError;
use crate::media::{LocalTrack, MediaStream, TrackKind};
use crate::peer::connection::{
    ConnectionId, ConnectionState, PeerConnection, PeerConnectionFactory, PeerContext, PeerEvent,
    PeerEventKind, RemoteFrame, RemoteStream, RemoteTrack, SignalSink, SignalingState,
};

/// Remote candidates kept per peer while no remote description is set.
pub const MAX_PENDING_CANDIDATES: usize = 64;

/// Remote payloads buffered per peer for a slow subscriber.
pub const REMOTE_MEDIA_CAPACITY: usize = 256;

/// One remote participant and its current negotiation object.
pub struct Peer {
    id: PeerId,
    connection: ConnectionId,
    pc: Arc<dyn PeerConnection>,
    state: ConnectionState,
    remote_stream: Option<RemoteStream>,
    pending: VecDeque<IceCandidate>,
    media: broadcast::Sender<RemoteFrame>,
    /// One reader per remote track id.
    readers: HashMap<String, JoinHandle<()>>,
}

impl Peer {
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.pc
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.pc.signaling_state()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    /// Everything this peer sends us, across connection replacements.
    /// The receiver closes once the peer is removed.
    pub fn subscribe_media(&self) -> broadcast::Receiver<RemoteFrame> {
        self.media.subscribe()
    }

    fn attach_remote(&mut self, track: RemoteTrack) {
        let stream = self.remote_stream.get_or_insert_with(RemoteStream::default);
        stream.attach(track.clone());
        self.readers.retain(|id, reader| {
            let live = stream.tracks.iter().any(|t| &t.id == id);
            if !live {
                reader.abort();
            }
            live
        });
        let reader = spawn_reader(&self.id, track.clone(), self.media.clone());
        if let Some(previous) = self.readers.insert(track.id, reader) {
            previous.abort();
        }
    }

    fn stop_readers(&mut self) {
        for (_, reader) in self.readers.drain() {
            reader.abort();
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.stop_readers();
    }
}

fn spawn_reader(
    peer_id: &PeerId,
    track: RemoteTrack,
    media: broadcast::Sender<RemoteFrame>,
) -> JoinHandle<()> {
    let peer_id = peer_id.clone();
    tokio::spawn(async move {
        while let Some(payload) = track.source.next_payload().await {
            // nobody rendering this peer right now is fine
            let _ = media.send(RemoteFrame {
                track_id: track.id.clone(),
                kind: track.kind,
                payload,
            });
        }
        debug!("remote {} track {} of {} ended", track.kind, track.id, peer_id);
    })
}

/// What happened to a signal handed to [`PeerRegistry::handle_signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Applied,
    Queued,
    Ignored,
}

/// Peer changes the session reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerUpdate {
    RemoteTrack { peer_id: PeerId, kind: TrackKind },
    Connected(PeerId),
    Disconnected(PeerId),
    Failed {
        peer_id: PeerId,
        connection: ConnectionId,
    },
    Removed(PeerId),
}

/// All peer connections of one session, keyed by peer id.
pub struct PeerRegistry {
    factory: Arc<dyn PeerConnectionFactory>,
    events: mpsc::UnboundedSender<PeerEvent>,
    peers: HashMap<PeerId, Peer>,
    next_connection: ConnectionId,
}

impl PeerRegistry {
    pub fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            factory,
            events,
            peers: HashMap::new(),
            next_connection: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Peer ids in a stable order.
    pub fn ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Creates and offers to `peer_id` unless it is already known.
    /// Returns whether a new peer was created.
    pub async fn ensure_peer(
        &mut self,
        peer_id: &PeerId,
        local: &MediaStream,
        sink: &dyn SignalSink,
    ) -> Result<bool, PeerError> {
        if self.peers.contains_key(peer_id) {
            debug!("peer {} already known, not offering again", peer_id);
            return Ok(false);
        }
        self.create_peer(peer_id, local).await?;
        self.make_offer(peer_id, sink).await?;
        Ok(true)
    }

    pub async fn create_peer(
        &mut self,
        peer_id: &PeerId,
        local: &MediaStream,
    ) -> Result<(), PeerError> {
        if self.peers.contains_key(peer_id) {
            return Ok(());
        }
        let (connection, pc) = self.connect(peer_id, local).await?;
        info!("created peer {} (connection {})", peer_id, connection);
        let (media, _) = broadcast::channel(REMOTE_MEDIA_CAPACITY);
        self.peers.insert(
            peer_id.clone(),
            Peer {
                id: peer_id.clone(),
                connection,
                pc,
                state: ConnectionState::New,
                remote_stream: None,
                pending: VecDeque::new(),
                media,
                readers: HashMap::new(),
            },
        );
        Ok(())
    }

    pub async fn make_offer(
        &mut self,
        peer_id: &PeerId,
        sink: &dyn SignalSink,
    ) -> Result<(), PeerError> {
        let Some(pc) = self.peers.get(peer_id).map(|p| Arc::clone(&p.pc)) else {
            return Ok(());
        };
        match pc.create_offer().await {
            Ok(offer) => {
                debug!("offering to {}", peer_id);
                sink.send_signal(peer_id, Signal::sdp(offer));
                Ok(())
            }
            Err(e) => {
                self.abort(peer_id).await;
                Err(e)
            }
        }
    }

    /// Applies one inbound negotiation message. Signals for unknown peers
    /// are dropped. A failed offer or answer aborts that peer only.
    pub async fn handle_signal(
        &mut self,
        from: &PeerId,
        signal: Signal,
        local: &MediaStream,
        sink: &dyn SignalSink,
    ) -> Result<SignalOutcome, PeerError> {
        if !self.peers.contains_key(from) {
            debug!("dropping signal from unknown peer {}", from);
            return Ok(SignalOutcome::Ignored);
        }

        let result = match signal {
            Signal::Sdp { sdp } => match sdp.kind {
                SdpType::Offer => self.accept_offer(from, sdp, local, sink).await,
                SdpType::Answer | SdpType::Pranswer => self.accept_answer(from, sdp).await,
                SdpType::Rollback => {
                    debug!("ignoring rollback from {}", from);
                    Ok(SignalOutcome::Ignored)
                }
            },
            Signal::Candidate { candidate } => Ok(self.accept_candidate(from, candidate).await),
        };

        if let Err(e) = &result {
            warn!("negotiation with {} failed: {}", from, e);
        }
        if result.is_err() {
            self.abort(from).await;
        }
        result
    }

    async fn accept_offer(
        &mut self,
        from: &PeerId,
        offer: SessionDescription,
        local: &MediaStream,
        sink: &dyn SignalSink,
    ) -> Result<SignalOutcome, PeerError> {
        let state = self.peer_state(from)?;
        if state != SignalingState::Stable {
            info!("offer collision with {} in {:?}, replacing connection", from, state);
            self.replace_connection(from, local).await?;
        }

        let pc = self.pc(from)?;
        pc.set_remote_description(offer).await?;
        self.flush_candidates(from).await;
        let answer = pc.create_answer().await?;
        sink.send_signal(from, Signal::sdp(answer));
        Ok(SignalOutcome::Applied)
    }

    async fn accept_answer(
        &mut self,
        from: &PeerId,
        answer: SessionDescription,
    ) -> Result<SignalOutcome, PeerError> {
        let state = self.peer_state(from)?;
        if state != SignalingState::HaveLocalOffer {
            debug!("stale answer from {} in {:?}", from, state);
            return Ok(SignalOutcome::Ignored);
        }
        self.pc(from)?.set_remote_description(answer).await?;
        self.flush_candidates(from).await;
        Ok(SignalOutcome::Applied)
    }

    async fn accept_candidate(&mut self, from: &PeerId, candidate: IceCandidate) -> SignalOutcome {
        let Ok(pc) = self.pc(from) else {
            return SignalOutcome::Ignored;
        };
        if pc.has_remote_description().await {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                warn!("candidate from {} rejected: {}", from, e);
                return SignalOutcome::Ignored;
            }
            return SignalOutcome::Applied;
        }

        let Some(peer) = self.peers.get_mut(from) else {
            return SignalOutcome::Ignored;
        };
        if peer.pending.len() >= MAX_PENDING_CANDIDATES {
            peer.pending.pop_front();
            debug!("candidate queue for {} full, dropped the oldest", from);
        }
        peer.pending.push_back(candidate);
        SignalOutcome::Queued
    }

    async fn flush_candidates(&mut self, peer_id: &PeerId) {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };
        let pending = std::mem::take(&mut peer.pending);
        let pc = Arc::clone(&peer.pc);
        if !pending.is_empty() {
            debug!("applying {} queued candidates for {}", pending.len(), peer_id);
        }
        for candidate in pending {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                warn!("queued candidate for {} rejected: {}", peer_id, e);
            }
        }
    }

    /// Applies a connection callback. Events from replaced connections
    /// and from peers that are already gone are ignored.
    pub fn handle_event(&mut self, event: PeerEvent, sink: &dyn SignalSink) -> Option<PeerUpdate> {
        let peer = self.peers.get_mut(&event.peer_id)?;
        if peer.connection != event.connection {
            debug!(
                "ignoring event from replaced connection {} of {}",
                event.connection, event.peer_id
            );
            return None;
        }

        match event.kind {
            PeerEventKind::LocalCandidate(candidate) => {
                sink.send_signal(&event.peer_id, Signal::candidate(candidate));
                None
            }
            PeerEventKind::RemoteTrack(track) => {
                let kind = track.kind;
                peer.attach_remote(track);
                Some(PeerUpdate::RemoteTrack {
                    peer_id: event.peer_id,
                    kind,
                })
            }
            PeerEventKind::StateChanged(state) => {
                if peer.state == state {
                    return None;
                }
                info!("peer {} is {}", event.peer_id, state);
                peer.state = state;
                match state {
                    ConnectionState::Connected => Some(PeerUpdate::Connected(event.peer_id)),
                    ConnectionState::Disconnected => Some(PeerUpdate::Disconnected(event.peer_id)),
                    ConnectionState::Failed => Some(PeerUpdate::Failed {
                        peer_id: event.peer_id,
                        connection: event.connection,
                    }),
                    ConnectionState::Closed => {
                        self.peers.remove(&event.peer_id);
                        Some(PeerUpdate::Removed(event.peer_id))
                    }
                    ConnectionState::New | ConnectionState::Connecting => None,
                }
            }
        }
    }

    /// Closes a peer whose connection is still failed after its grace
    /// period. Returns whether the peer was removed.
    pub async fn expire_failed(&mut self, peer_id: &PeerId, connection: ConnectionId) -> bool {
        let expired = self
            .peers
            .get(peer_id)
            .is_some_and(|p| p.connection == connection && p.state == ConnectionState::Failed);
        if expired {
            info!("peer {} stayed failed, closing it", peer_id);
            self.abort(peer_id).await;
        }
        expired
    }

    /// Puts `track` on the `kind` sender of every peer. If any peer fails,
    /// the peers already switched go back to `previous`.
    pub async fn replace_outgoing_track(
        &self,
        kind: TrackKind,
        track: &LocalTrack,
        previous: Option<&LocalTrack>,
    ) -> Result<usize, PeerError> {
        let mut swapped: Vec<(&PeerId, &Arc<dyn PeerConnection>)> = Vec::new();
        for peer in self.peers.values() {
            match peer.pc.replace_track(kind, track).await {
                Ok(()) => swapped.push((&peer.id, &peer.pc)),
                Err(PeerError::NoSender(_)) => {
                    debug!("peer {} has no {} sender, skipped", peer.id, kind);
                }
                Err(e) => {
                    warn!("replacing {} track for {} failed: {}", kind, peer.id, e);
                    if let Some(previous) = previous {
                        for (id, pc) in &swapped {
                            if let Err(e) = pc.replace_track(kind, previous).await {
                                warn!("rolling back {} track for {} failed: {}", kind, id, e);
                            }
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(swapped.len())
    }

    pub async fn close_all(&mut self) {
        let count = self.peers.len();
        for (id, peer) in self.peers.drain() {
            if peer.state == ConnectionState::Closed
                || peer.pc.signaling_state() == SignalingState::Closed
            {
                continue;
            }
            if let Err(e) = peer.pc.close().await {
                warn!("closing peer {} failed: {}", id, e);
            }
        }
        if count > 0 {
            info!("closed {} peer connection(s)", count);
        }
    }

    async fn connect(
        &mut self,
        peer_id: &PeerId,
        local: &MediaStream,
    ) -> Result<(ConnectionId, Arc<dyn PeerConnection>), PeerError> {
        self.next_connection += 1;
        let connection = self.next_connection;
        let pc = self
            .factory
            .create(PeerContext {
                peer_id: peer_id.clone(),
                connection,
                events: self.events.clone(),
            })
            .await?;

        for track in local.tracks() {
            if let Err(e) = pc.add_track(track).await {
                let _ = pc.close().await;
                return Err(e);
            }
        }
        Ok((connection, pc))
    }

    async fn replace_connection(
        &mut self,
        peer_id: &PeerId,
        local: &MediaStream,
    ) -> Result<(), PeerError> {
        let old = self.pc(peer_id)?;
        if let Err(e) = old.close().await {
            debug!("closing replaced connection of {} failed: {}", peer_id, e);
        }
        let (connection, pc) = self.connect(peer_id, local).await?;
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.connection = connection;
            peer.pc = pc;
            peer.state = ConnectionState::New;
            peer.remote_stream = None;
            peer.stop_readers();
            peer.pending.clear();
        }
        Ok(())
    }

    async fn abort(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.remove(peer_id) {
            if let Err(e) = peer.pc.close().await {
                debug!("closing aborted peer {} failed: {}", peer_id, e);
            }
        }
    }

    fn pc(&self, peer_id: &PeerId) -> Result<Arc<dyn PeerConnection>, PeerError> {
        self.peers
            .get(peer_id)
            .map(|p| Arc::clone(&p.pc))
            .ok_or_else(|| PeerError::Rejected(format!("peer {peer_id} is gone")))
    }

    fn peer_state(&self, peer_id: &PeerId) -> Result<SignalingState, PeerError> {
        Ok(self.pc(peer_id)?.signaling_state())
    }
}
