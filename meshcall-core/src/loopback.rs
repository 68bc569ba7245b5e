//! In-process media backend
//!
//! [`LoopbackBackend`] implements the capability traits without any real
//! capture or network. Links synthesise SDP from their senders, gather a single
//! host candidate per local description, surface the remote side's tracks from
//! the remote SDP, and report `connecting → connected` once both descriptions
//! are in place. Tests steer it through the injection hooks: denials, stats and
//! forced state changes.

use crate::backend::{
    LinkConfig, LinkError, LinkEvent, LinkEventSink, LinkStats, MediaBackend, PeerLink, SenderId,
};
use crate::identity::ParticipantId;
use crate::media::{LocalMedia, LocalTrack, MediaError, RemoteTrack};
use crate::types::{
    ConnectionState, IceCandidate, MediaConstraints, SdpKind, SessionDescription, TrackKind,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

/// Base port for synthesised host candidates
const CANDIDATE_BASE_PORT: u16 = 50_000;

/// In-process [`MediaBackend`]
pub struct LoopbackBackend {
    deny_media: AtomicBool,
    deny_screen: AtomicBool,
    auto_connect: AtomicBool,
    captured: Mutex<Vec<LocalTrack>>,
    links: Mutex<Vec<Arc<LoopbackLink>>>,
    next_port: Arc<AtomicU16>,
}

impl LoopbackBackend {
    /// Backend that grants every capture and auto-connects links
    #[must_use]
    pub fn new() -> Self {
        Self {
            deny_media: AtomicBool::new(false),
            deny_screen: AtomicBool::new(false),
            auto_connect: AtomicBool::new(true),
            captured: Mutex::new(Vec::new()),
            links: Mutex::new(Vec::new()),
            next_port: Arc::new(AtomicU16::new(CANDIDATE_BASE_PORT)),
        }
    }

    /// Refuse (or grant again) camera/microphone access
    pub fn deny_media(&self, deny: bool) {
        self.deny_media.store(deny, Ordering::SeqCst);
    }

    /// Refuse (or grant again) screen capture
    pub fn deny_screen_capture(&self, deny: bool) {
        self.deny_screen.store(deny, Ordering::SeqCst);
    }

    /// Whether new links report progress on their own
    pub fn set_auto_connect(&self, enabled: bool) {
        self.auto_connect.store(enabled, Ordering::SeqCst);
    }

    /// Every track this backend ever captured
    #[must_use]
    pub fn captured_tracks(&self) -> Vec<LocalTrack> {
        self.captured.lock().clone()
    }

    /// Every link this backend created, oldest first
    #[must_use]
    pub fn links(&self) -> Vec<Arc<LoopbackLink>> {
        self.links.lock().clone()
    }

    /// Most recent link towards `participant`
    #[must_use]
    pub fn link_for(&self, participant: &ParticipantId) -> Option<Arc<LoopbackLink>> {
        self.links
            .lock()
            .iter()
            .rev()
            .find(|link| link.events.participant() == participant)
            .cloned()
    }
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaBackend for LoopbackBackend {
    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMedia, MediaError> {
        if self.deny_media.load(Ordering::SeqCst) {
            return Err(MediaError::AccessDenied(
                "permission denied by loopback backend".to_string(),
            ));
        }

        let mut tracks = Vec::new();
        if constraints.has_audio() {
            tracks.push(LocalTrack::new(TrackKind::Audio, "loopback microphone"));
        }
        if constraints.has_video() {
            tracks.push(LocalTrack::new(TrackKind::Video, "loopback camera"));
        }
        self.captured.lock().extend(tracks.iter().cloned());
        Ok(LocalMedia::new(tracks))
    }

    async fn acquire_screen_capture(&self) -> Result<LocalTrack, MediaError> {
        if self.deny_screen.load(Ordering::SeqCst) {
            return Err(MediaError::ScreenCaptureDenied(
                "screen capture denied by loopback backend".to_string(),
            ));
        }
        let track = LocalTrack::new(TrackKind::Screen, "loopback screen");
        self.captured.lock().push(track.clone());
        Ok(track)
    }

    async fn create_connection(
        &self,
        config: &LinkConfig,
        events: LinkEventSink,
    ) -> Result<Arc<dyn PeerLink>, LinkError> {
        let link = Arc::new(LoopbackLink {
            events,
            stream_id: uuid::Uuid::new_v4().to_string(),
            ice_servers: config.ice_servers.clone(),
            auto_connect: self.auto_connect.load(Ordering::SeqCst),
            next_port: Arc::clone(&self.next_port),
            state: Mutex::new(LinkState::default()),
        });
        self.links.lock().push(Arc::clone(&link));
        Ok(link)
    }
}

#[derive(Default)]
struct LinkState {
    senders: Vec<(SenderId, Option<LocalTrack>)>,
    next_sender: u64,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    pending_offer: bool,
    applied_candidates: Vec<IceCandidate>,
    stats: LinkStats,
    connection: Option<ConnectionState>,
    closed: bool,
    version: u64,
}

/// Link created by [`LoopbackBackend`]
pub struct LoopbackLink {
    events: LinkEventSink,
    stream_id: String,
    ice_servers: Vec<String>,
    auto_connect: bool,
    next_port: Arc<AtomicU16>,
    state: Mutex<LinkState>,
}

impl LoopbackLink {
    /// Remote participant of the link
    #[must_use]
    pub fn participant(&self) -> &ParticipantId {
        self.events.participant()
    }

    /// ICE servers the link was configured with
    #[must_use]
    pub fn ice_servers(&self) -> &[String] {
        &self.ice_servers
    }

    /// Candidates applied so far, in application order
    #[must_use]
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied_candidates.clone()
    }

    /// Current local description
    #[must_use]
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    /// Current remote description
    #[must_use]
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    /// Whether `close` was called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Stats returned by the next samples
    pub fn set_stats(&self, stats: LinkStats) {
        self.state.lock().stats = stats;
    }

    /// Force a connection state change, as if reported by the transport
    pub fn emit_state(&self, state: ConnectionState) {
        self.state.lock().connection = Some(state);
        self.events.emit(LinkEvent::StateChanged(state));
    }

    fn describe(&self, state: &mut LinkState, kind: SdpKind) -> SessionDescription {
        state.version += 1;
        let mut sdp = format!(
            "v=0\r\no=- 0 {} IN IP4 127.0.0.1\r\ns=meshcall-loopback\r\nt=0 0\r\n",
            state.version
        );
        for (index, (_, track)) in state.senders.iter().enumerate() {
            let Some(track) = track else { continue };
            let media = if track.kind().is_video() { "video" } else { "audio" };
            sdp.push_str(&format!(
                "m={media} 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:{index}\r\na=msid:{} {}\r\n",
                self.stream_id,
                track.id()
            ));
        }
        SessionDescription { kind, sdp }
    }

    fn gather_candidate(&self) {
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        self.events.emit(LinkEvent::IceCandidate(IceCandidate {
            candidate: format!("candidate:1 1 udp 2122260223 127.0.0.1 {port} typ host"),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }));
    }

    fn announce_remote_tracks(&self, sdp: &str) {
        let mut kind = None;
        for line in sdp.lines() {
            if line.starts_with("m=audio") {
                kind = Some(TrackKind::Audio);
            } else if line.starts_with("m=video") {
                kind = Some(TrackKind::Video);
            } else if let Some(msid) = line.strip_prefix("a=msid:") {
                let mut parts = msid.split_whitespace();
                if let (Some(stream_id), Some(track_id), Some(kind)) = (parts.next(), parts.next(), kind) {
                    self.events.emit(LinkEvent::RemoteTrack {
                        stream_id: stream_id.to_string(),
                        track: RemoteTrack {
                            id: track_id.to_string(),
                            kind,
                        },
                    });
                }
            }
        }
    }

    fn maybe_connect(&self, state: &mut LinkState) {
        if !self.auto_connect || state.connection.is_some() || state.pending_offer {
            return;
        }
        if state.local.is_none() || state.remote.is_none() {
            return;
        }
        state.connection = Some(ConnectionState::Connected);
        self.events.emit(LinkEvent::StateChanged(ConnectionState::Connecting));
        self.events.emit(LinkEvent::StateChanged(ConnectionState::Connected));
    }
}

#[async_trait]
impl PeerLink for LoopbackLink {
    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, LinkError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(LinkError::Closed);
        }
        state.next_sender += 1;
        let id = SenderId(state.next_sender);
        state.senders.push((id, Some(track.clone())));
        Ok(id)
    }

    async fn replace_track(
        &self,
        sender: SenderId,
        track: Option<&LocalTrack>,
    ) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(LinkError::Closed);
        }
        let slot = state
            .senders
            .iter_mut()
            .find(|(id, _)| *id == sender)
            .ok_or_else(|| LinkError::Other(format!("unknown {sender}")))?;
        slot.1 = track.cloned();
        Ok(())
    }

    fn senders(&self) -> Vec<(SenderId, Option<LocalTrack>)> {
        self.state.lock().senders.clone()
    }

    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(LinkError::Closed);
        }
        Ok(self.describe(&mut state, SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, LinkError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(LinkError::Closed);
        }
        match &state.remote {
            Some(remote) if remote.kind == SdpKind::Offer => {}
            _ => {
                return Err(LinkError::Negotiation(
                    "no remote offer to answer".to_string(),
                ))
            }
        }
        Ok(self.describe(&mut state, SdpKind::Answer))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(LinkError::Closed);
        }
        match description.kind {
            SdpKind::Offer => state.pending_offer = true,
            SdpKind::Answer => {
                if state.pending_offer || state.remote.is_none() {
                    return Err(LinkError::Negotiation(
                        "answer without remote offer".to_string(),
                    ));
                }
            }
        }
        state.local = Some(description);
        self.gather_candidate();
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(LinkError::Closed);
        }
        match description.kind {
            SdpKind::Offer if state.pending_offer => {
                return Err(LinkError::Negotiation(
                    "remote offer while local offer pending".to_string(),
                ))
            }
            SdpKind::Offer => {}
            SdpKind::Answer => {
                if !state.pending_offer {
                    return Err(LinkError::Negotiation(
                        "answer without local offer".to_string(),
                    ));
                }
                state.pending_offer = false;
            }
        }
        self.announce_remote_tracks(&description.sdp);
        state.remote = Some(description);
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(LinkError::Closed);
        }
        if state.pending_offer {
            state.pending_offer = false;
            state.local = None;
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(LinkError::Closed);
        }
        if state.remote.is_none() {
            return Err(LinkError::Negotiation(
                "candidate before remote description".to_string(),
            ));
        }
        state.applied_candidates.push(candidate);
        Ok(())
    }

    async fn stats(&self) -> Result<LinkStats, LinkError> {
        let state = self.state.lock();
        if state.closed {
            return Err(LinkError::Closed);
        }
        Ok(state.stats.clone())
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            state.connection = Some(ConnectionState::Closed);
            tracing::debug!(participant = %self.events.participant(), "Loopback link closed");
        }
    }
}
