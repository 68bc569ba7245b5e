//! Peer connection orchestration
//!
//! [`PeerConnectionManager`] owns one peer connection per remote participant
//! of a call. It attaches the local media to every connection, runs the
//! offer/answer/ICE exchange through the signaling relay, swaps the outbound
//! video for screen sharing, samples connection quality and reports what
//! happens as [`PeerEvent`]s.
//!
//! # Negotiation
//!
//! Every connection has its own negotiation lock, so at most one offer/answer
//! exchange per participant is in flight while different participants
//! negotiate in parallel. Remote ICE candidates that arrive before the remote
//! description are buffered and applied in arrival order once it is set.
//!
//! When both sides offer at once, the participant with the smaller id is the
//! polite one: it rolls its own offer back and answers. The other side ignores
//! the colliding offer and keeps waiting for its answer.

use crate::backend::{LinkConfig, LinkEnvelope, LinkEvent, LinkEventSink, MediaBackend, PeerLink, SenderId};
use crate::identity::{CallId, ParticipantId};
use crate::media::{LocalMedia, LocalTrack, MediaError, RemoteStream, RemoteTrack};
use crate::signaling::{OutboundSignal, SignalingError, SignalingHandler, SignalingKind, SignalingMessage};
use crate::types::{
    CallQualityMetrics, ConnectionState, IceCandidate, MediaConstraints, QualityLevel,
    SessionDescription, TrackKind,
};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Candidates kept for a participant that has no connection yet
const MAX_ORPHAN_CANDIDATES: usize = 64;

/// Peer connection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// Camera/microphone access refused
    #[error("Media access denied: {0}")]
    MediaAccessDenied(String),

    /// Screen capture refused; the camera keeps running
    #[error("Screen capture denied: {0}")]
    ScreenCaptureDenied(String),

    /// A connection to this participant already exists
    #[error("Connection already exists for {0}")]
    ConnectionExists(ParticipantId),

    /// No connection to this participant
    #[error("Unknown participant: {0}")]
    UnknownParticipant(ParticipantId),

    /// An offer to this participant is still awaiting its answer
    #[error("Negotiation already in progress with {0}")]
    NegotiationInProgress(ParticipantId),

    /// An answer arrived without a pending offer
    #[error("Unexpected answer from {0}")]
    UnexpectedAnswer(ParticipantId),

    /// The connection to one participant failed
    #[error("Peer connection to {participant} failed: {reason}")]
    PeerConnectionFailed {
        /// Remote participant
        participant: ParticipantId,
        /// Backend failure description
        reason: String,
    },

    /// Local media has not been acquired yet
    #[error("Peer manager not initialized")]
    NotInitialized,

    /// The manager was cleaned up
    #[error("Peer manager closed")]
    ManagerClosed,

    /// Relaying a negotiation message failed
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

impl From<MediaError> for PeerError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::ScreenCaptureDenied(msg) => Self::ScreenCaptureDenied(msg),
            MediaError::AccessDenied(msg) | MediaError::Device(msg) => Self::MediaAccessDenied(msg),
        }
    }
}

/// Peer manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerManagerConfig {
    /// STUN/TURN server URLs
    pub ice_servers: Vec<String>,
    /// Default capture constraints
    pub media: MediaConstraints,
    /// Quality sampling period while connected
    pub stats_interval: Duration,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            media: MediaConstraints::default(),
            stats_interval: Duration::from_secs(5),
        }
    }
}

/// Events emitted by the peer manager
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A connection changed state
    ConnectionStateChanged {
        /// Remote participant
        participant: ParticipantId,
        /// New state
        state: ConnectionState,
    },
    /// First track of a remote stream arrived
    StreamReceived {
        /// Remote participant
        participant: ParticipantId,
        /// The stream; further tracks appear on the same handle
        stream: RemoteStream,
    },
    /// A remote stream went away
    StreamRemoved {
        /// Remote participant
        participant: ParticipantId,
        /// Stream identifier
        stream_id: String,
    },
    /// Connection quality moved to another level
    QualityChanged {
        /// Remote participant
        participant: ParticipantId,
        /// New level
        quality: QualityLevel,
        /// Sample that triggered the change
        metrics: CallQualityMetrics,
    },
    /// A non-fatal error
    Error {
        /// Participant the error concerns, if any
        participant: Option<ParticipantId>,
        /// The error
        error: PeerError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NegotiationPhase {
    Stable,
    AwaitingAnswer,
}

#[derive(Default)]
struct IceBuffer {
    remote_description_set: bool,
    pending: Vec<IceCandidate>,
}

struct WrapperState {
    connection: ConnectionState,
    remote_stream: Option<RemoteStream>,
    quality: Option<QualityLevel>,
    metrics: Option<CallQualityMetrics>,
    stats_task: Option<JoinHandle<()>>,
}

struct PeerConnectionWrapper {
    participant: ParticipantId,
    generation: u64,
    link: Arc<dyn PeerLink>,
    audio_sender: Option<SenderId>,
    video_sender: Option<SenderId>,
    negotiation: tokio::sync::Mutex<NegotiationPhase>,
    ice: Mutex<IceBuffer>,
    state: Mutex<WrapperState>,
}

impl PeerConnectionWrapper {
    fn stop_stats(&self) {
        if let Some(task) = self.state.lock().stats_task.take() {
            task.abort();
        }
    }

    fn failed(&self, reason: impl ToString) -> PeerError {
        PeerError::PeerConnectionFailed {
            participant: self.participant.clone(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Default)]
struct PeerTable {
    connections: HashMap<ParticipantId, Arc<PeerConnectionWrapper>>,
    orphan_candidates: HashMap<ParticipantId, Vec<IceCandidate>>,
}

/// Manages the peer connections of one call
pub struct PeerConnectionManager {
    call_id: CallId,
    config: PeerManagerConfig,
    backend: Arc<dyn MediaBackend>,
    signaling: Arc<SignalingHandler>,
    peers: RwLock<PeerTable>,
    local_media: RwLock<Option<LocalMedia>>,
    screen_track: RwLock<Option<LocalTrack>>,
    media_lock: tokio::sync::Mutex<()>,
    event_sender: broadcast::Sender<PeerEvent>,
    link_tx: mpsc::UnboundedSender<LinkEnvelope>,
    link_rx: Mutex<Option<mpsc::UnboundedReceiver<LinkEnvelope>>>,
    generation: AtomicU64,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl PeerConnectionManager {
    /// Create a manager for `call_id` speaking through `signaling`
    #[must_use]
    pub fn new(
        call_id: CallId,
        signaling: Arc<SignalingHandler>,
        backend: Arc<dyn MediaBackend>,
        config: PeerManagerConfig,
    ) -> Self {
        let (event_sender, _) = broadcast::channel(256);
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        Self {
            call_id,
            config,
            backend,
            signaling,
            peers: RwLock::new(PeerTable::default()),
            local_media: RwLock::new(None),
            screen_track: RwLock::new(None),
            media_lock: tokio::sync::Mutex::new(()),
            event_sender,
            link_tx,
            link_rx: Mutex::new(Some(link_rx)),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Subscribe to manager events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.event_sender.subscribe()
    }

    /// Local participant id
    #[must_use]
    pub fn local_participant(&self) -> &ParticipantId {
        self.signaling.local_participant()
    }

    /// Manager configuration
    #[must_use]
    pub fn config(&self) -> &PeerManagerConfig {
        &self.config
    }

    /// Whether local media has been acquired
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.local_media.read().is_some()
    }

    /// Whether `cleanup` has run
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The local camera/microphone stream
    #[must_use]
    pub fn local_media(&self) -> Option<LocalMedia> {
        self.local_media.read().clone()
    }

    /// Whether the screen is being shared
    #[must_use]
    pub fn is_screen_sharing(&self) -> bool {
        self.screen_track.read().is_some()
    }

    /// Participants with a connection
    #[must_use]
    pub fn participants(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self.peers.read().connections.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Connection state towards `participant`
    #[must_use]
    pub fn connection_state(&self, participant: &ParticipantId) -> Option<ConnectionState> {
        self.wrapper(participant).map(|w| w.state.lock().connection)
    }

    /// Remote stream received from `participant`
    #[must_use]
    pub fn remote_stream(&self, participant: &ParticipantId) -> Option<RemoteStream> {
        self.wrapper(participant)
            .and_then(|w| w.state.lock().remote_stream.clone())
    }

    /// Latest quality sample for `participant`
    #[must_use]
    pub fn quality(&self, participant: &ParticipantId) -> Option<CallQualityMetrics> {
        self.wrapper(participant).and_then(|w| w.state.lock().metrics.clone())
    }

    /// Outbound senders on the connection to `participant`
    #[must_use]
    pub fn senders(&self, participant: &ParticipantId) -> Option<Vec<(SenderId, Option<LocalTrack>)>> {
        self.wrapper(participant).map(|w| w.link.senders())
    }

    fn wrapper(&self, participant: &ParticipantId) -> Option<Arc<PeerConnectionWrapper>> {
        self.peers.read().connections.get(participant).cloned()
    }

    fn known_wrapper(&self, participant: &ParticipantId) -> Result<Arc<PeerConnectionWrapper>, PeerError> {
        self.ensure_open()?;
        self.wrapper(participant)
            .ok_or_else(|| PeerError::UnknownParticipant(participant.clone()))
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(PeerError::ManagerClosed);
        }
        Ok(())
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.event_sender.send(event);
    }

    /// Acquire the local media stream
    ///
    /// One stream per manager: a second call is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `MediaAccessDenied` if capture is refused
    #[tracing::instrument(skip(self), fields(call_id = %self.call_id))]
    pub async fn initialize(self: &Arc<Self>, constraints: &MediaConstraints) -> Result<(), PeerError> {
        self.ensure_open()?;
        let _guard = self.media_lock.lock().await;
        if self.is_initialized() {
            tracing::debug!("Local media already acquired");
            return Ok(());
        }

        let media = self.backend.acquire_local_media(constraints).await.map_err(|e| {
            tracing::warn!(error = %e, "Local media acquisition failed");
            PeerError::from(e)
        })?;

        if self.is_closed() {
            media.stop_all();
            return Err(PeerError::ManagerClosed);
        }

        tracing::info!(
            stream_id = %media.stream_id(),
            tracks = media.tracks().len(),
            "Local media acquired"
        );
        *self.local_media.write() = Some(media);

        if let Some(rx) = self.link_rx.lock().take() {
            tokio::spawn(run_event_pump(Arc::downgrade(self), rx, self.shutdown.clone()));
        }
        Ok(())
    }

    /// Open a connection to `participant` carrying the local tracks
    ///
    /// # Errors
    ///
    /// - `NotInitialized` before [`initialize`](Self::initialize)
    /// - `ConnectionExists` if one is already open
    /// - `PeerConnectionFailed` if the backend cannot create it
    #[tracing::instrument(skip(self), fields(call_id = %self.call_id, participant = %participant))]
    pub async fn create_connection(&self, participant: &ParticipantId) -> Result<(), PeerError> {
        self.ensure_open()?;
        let media = self.local_media().ok_or(PeerError::NotInitialized)?;
        if self.wrapper(participant).is_some() {
            return Err(PeerError::ConnectionExists(participant.clone()));
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let sink = LinkEventSink::new(participant.clone(), generation, self.link_tx.clone());
        let link_config = LinkConfig {
            ice_servers: self.config.ice_servers.clone(),
        };
        let failed = |reason: String| PeerError::PeerConnectionFailed {
            participant: participant.clone(),
            reason,
        };

        let link = self
            .backend
            .create_connection(&link_config, sink)
            .await
            .map_err(|e| failed(e.to_string()))?;

        let audio_sender = match media.audio_track() {
            Some(track) => Some(link.add_track(track).await.map_err(|e| failed(e.to_string()))?),
            None => None,
        };
        let screen = self.screen_track.read().clone();
        let video_track = screen.or_else(|| media.video_track().cloned());
        let video_sender = match video_track {
            Some(track) => Some(link.add_track(&track).await.map_err(|e| failed(e.to_string()))?),
            None => None,
        };

        let wrapper = Arc::new(PeerConnectionWrapper {
            participant: participant.clone(),
            generation,
            link: Arc::clone(&link),
            audio_sender,
            video_sender,
            negotiation: tokio::sync::Mutex::new(NegotiationPhase::Stable),
            ice: Mutex::new(IceBuffer::default()),
            state: Mutex::new(WrapperState {
                connection: ConnectionState::New,
                remote_stream: None,
                quality: None,
                metrics: None,
                stats_task: None,
            }),
        });

        let inserted = {
            let mut peers = self.peers.write();
            if peers.connections.contains_key(participant) {
                false
            } else {
                if let Some(orphans) = peers.orphan_candidates.remove(participant) {
                    wrapper.ice.lock().pending.extend(orphans);
                }
                peers.connections.insert(participant.clone(), wrapper);
                true
            }
        };

        if !inserted {
            link.close().await;
            return Err(PeerError::ConnectionExists(participant.clone()));
        }
        if self.is_closed() {
            self.peers.write().connections.remove(participant);
            link.close().await;
            return Err(PeerError::ManagerClosed);
        }

        tracing::info!(
            audio = audio_sender.is_some(),
            video = video_sender.is_some(),
            "Peer connection created"
        );
        Ok(())
    }

    async fn wrapper_or_create(&self, participant: &ParticipantId) -> Result<Arc<PeerConnectionWrapper>, PeerError> {
        if let Some(wrapper) = self.wrapper(participant) {
            return Ok(wrapper);
        }
        match self.create_connection(participant).await {
            Ok(()) | Err(PeerError::ConnectionExists(_)) => self
                .wrapper(participant)
                .ok_or_else(|| PeerError::UnknownParticipant(participant.clone())),
            Err(e) => Err(e),
        }
    }

    /// Create and send an offer to `participant`
    ///
    /// # Errors
    ///
    /// - `UnknownParticipant` without a connection
    /// - `NegotiationInProgress` while a previous offer awaits its answer
    /// - `PeerConnectionFailed` or `Signaling` if the offer cannot be made or sent
    #[tracing::instrument(skip(self), fields(call_id = %self.call_id, participant = %participant))]
    pub async fn create_offer(&self, participant: &ParticipantId) -> Result<SessionDescription, PeerError> {
        let wrapper = self.known_wrapper(participant)?;
        let mut phase = wrapper.negotiation.lock().await;
        if *phase == NegotiationPhase::AwaitingAnswer {
            tracing::debug!("Offer already pending");
            return Err(PeerError::NegotiationInProgress(participant.clone()));
        }

        tracing::debug!("Creating SDP offer");
        let offer = wrapper.link.create_offer().await.map_err(|e| wrapper.failed(e))?;
        wrapper
            .link
            .set_local_description(offer.clone())
            .await
            .map_err(|e| wrapper.failed(e))?;
        *phase = NegotiationPhase::AwaitingAnswer;
        self.transition(&wrapper, ConnectionState::Connecting);

        if let Err(e) = self
            .signaling
            .send(&self.call_id, OutboundSignal::description(participant.clone(), &offer))
            .await
        {
            tracing::warn!(error = %e, "Failed to relay offer, rolling back");
            if let Err(rollback) = wrapper.link.rollback().await {
                tracing::debug!(error = %rollback, "Rollback after failed send failed");
            }
            *phase = NegotiationPhase::Stable;
            return Err(e.into());
        }

        tracing::debug!(sdp_len = offer.sdp.len(), "SDP offer sent");
        Ok(offer)
    }

    /// Apply a remote offer and send back an answer
    ///
    /// Creates the connection on demand.
    ///
    /// # Errors
    ///
    /// Returns error if the offer cannot be applied or the answer cannot be sent
    #[tracing::instrument(skip(self, offer), fields(call_id = %self.call_id, participant = %from, sdp_len = offer.sdp.len()))]
    pub async fn handle_offer(&self, from: &ParticipantId, offer: SessionDescription) -> Result<(), PeerError> {
        self.ensure_open()?;
        let wrapper = self.wrapper_or_create(from).await?;
        let mut phase = wrapper.negotiation.lock().await;

        if *phase == NegotiationPhase::AwaitingAnswer {
            let polite = self.local_participant() < from;
            if !polite {
                tracing::debug!("Offer collision, keeping local offer");
                return Ok(());
            }
            tracing::debug!("Offer collision, rolling back local offer");
            wrapper.link.rollback().await.map_err(|e| wrapper.failed(e))?;
            *phase = NegotiationPhase::Stable;
        }

        wrapper
            .link
            .set_remote_description(offer)
            .await
            .map_err(|e| wrapper.failed(e))?;
        self.flush_candidates(&wrapper).await;

        let answer = wrapper.link.create_answer().await.map_err(|e| wrapper.failed(e))?;
        wrapper
            .link
            .set_local_description(answer.clone())
            .await
            .map_err(|e| wrapper.failed(e))?;
        self.transition(&wrapper, ConnectionState::Connecting);

        self.signaling
            .send(&self.call_id, OutboundSignal::description(from.clone(), &answer))
            .await?;
        tracing::debug!("SDP answer sent");
        Ok(())
    }

    /// Apply the answer to our pending offer
    ///
    /// # Errors
    ///
    /// - `UnknownParticipant` without a connection
    /// - `UnexpectedAnswer` if no offer is pending
    #[tracing::instrument(skip(self, answer), fields(call_id = %self.call_id, participant = %from, sdp_len = answer.sdp.len()))]
    pub async fn handle_answer(&self, from: &ParticipantId, answer: SessionDescription) -> Result<(), PeerError> {
        let wrapper = self.known_wrapper(from)?;
        let mut phase = wrapper.negotiation.lock().await;
        if *phase != NegotiationPhase::AwaitingAnswer {
            tracing::warn!("Answer without pending offer");
            return Err(PeerError::UnexpectedAnswer(from.clone()));
        }

        wrapper
            .link
            .set_remote_description(answer)
            .await
            .map_err(|e| wrapper.failed(e))?;
        *phase = NegotiationPhase::Stable;
        self.flush_candidates(&wrapper).await;
        tracing::debug!("SDP answer applied");
        Ok(())
    }

    /// Apply or buffer a remote ICE candidate
    ///
    /// Candidates for a participant without a connection are held until the
    /// connection is created.
    ///
    /// # Errors
    ///
    /// Returns `PeerConnectionFailed` if the backend rejects the candidate
    #[tracing::instrument(skip(self, candidate), fields(call_id = %self.call_id, participant = %from))]
    pub async fn handle_ice_candidate(&self, from: &ParticipantId, candidate: IceCandidate) -> Result<(), PeerError> {
        self.ensure_open()?;
        let wrapper = {
            let mut peers = self.peers.write();
            match peers.connections.get(from) {
                Some(wrapper) => Arc::clone(wrapper),
                None => {
                    let orphans = peers.orphan_candidates.entry(from.clone()).or_default();
                    if orphans.len() < MAX_ORPHAN_CANDIDATES {
                        orphans.push(candidate);
                        tracing::trace!("Buffered candidate for unknown participant");
                    } else {
                        tracing::warn!("Dropping candidate, orphan buffer full");
                    }
                    return Ok(());
                }
            }
        };

        let _phase = wrapper.negotiation.lock().await;
        {
            let mut ice = wrapper.ice.lock();
            if !ice.remote_description_set {
                ice.pending.push(candidate);
                tracing::trace!(pending = ice.pending.len(), "Buffered ICE candidate");
                return Ok(());
            }
        }

        wrapper
            .link
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| wrapper.failed(e))?;
        tracing::trace!("ICE candidate added");
        Ok(())
    }

    async fn flush_candidates(&self, wrapper: &PeerConnectionWrapper) {
        let pending = {
            let mut ice = wrapper.ice.lock();
            ice.remote_description_set = true;
            std::mem::take(&mut ice.pending)
        };
        if pending.is_empty() {
            return;
        }

        tracing::debug!(count = pending.len(), "Applying buffered ICE candidates");
        for candidate in pending {
            if let Err(e) = wrapper.link.add_ice_candidate(candidate).await {
                tracing::warn!(participant = %wrapper.participant, error = %e, "Buffered candidate rejected");
            }
        }
    }

    /// Dispatch a relayed negotiation message
    ///
    /// Join and leave messages are ignored here.
    ///
    /// # Errors
    ///
    /// Returns error if the payload is malformed or handling fails
    pub async fn handle_signal(&self, message: &SignalingMessage) -> Result<(), PeerError> {
        let from = &message.from_participant;
        match message.kind {
            SignalingKind::Offer => self.handle_offer(from, message.session_description()?).await,
            SignalingKind::Answer => self.handle_answer(from, message.session_description()?).await,
            SignalingKind::IceCandidate => self.handle_ice_candidate(from, message.ice_candidate()?).await,
            SignalingKind::Join | SignalingKind::Leave => Ok(()),
        }
    }

    /// Mute or unmute the outbound audio
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` before local media exists
    pub fn toggle_audio(&self, enabled: bool) -> Result<(), PeerError> {
        self.toggle(TrackKind::Audio, enabled)
    }

    /// Mute or unmute the outbound video
    ///
    /// Applies to the camera and, while sharing, to the screen track that
    /// replaced it on the wire.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` before local media exists
    pub fn toggle_video(&self, enabled: bool) -> Result<(), PeerError> {
        self.toggle(TrackKind::Video, enabled)
    }

    fn toggle(&self, kind: TrackKind, enabled: bool) -> Result<(), PeerError> {
        self.ensure_open()?;
        let media = self.local_media.read();
        let media = media.as_ref().ok_or(PeerError::NotInitialized)?;
        let mut changed = media.set_kind_enabled(kind, enabled);
        if kind.is_video() {
            if let Some(screen) = self.screen_track.read().as_ref() {
                screen.set_enabled(enabled);
                changed += 1;
            }
        }
        tracing::debug!(call_id = %self.call_id, ?kind, enabled, tracks = changed, "Toggled local tracks");
        Ok(())
    }

    /// Replace the outbound video with a screen capture on every connection
    ///
    /// # Errors
    ///
    /// Returns `ScreenCaptureDenied` if capture is refused; the camera keeps sending
    #[tracing::instrument(skip(self), fields(call_id = %self.call_id))]
    pub async fn start_screen_share(&self) -> Result<(), PeerError> {
        self.ensure_open()?;
        if !self.is_initialized() {
            return Err(PeerError::NotInitialized);
        }
        let _guard = self.media_lock.lock().await;
        if self.is_screen_sharing() {
            return Ok(());
        }

        let track = self.backend.acquire_screen_capture().await.map_err(|e| {
            tracing::warn!(error = %e, "Screen capture refused");
            PeerError::from(e)
        })?;
        *self.screen_track.write() = Some(track.clone());
        self.replace_video(Some(&track)).await;
        tracing::info!(track_id = %track.id(), "Screen sharing started");
        Ok(())
    }

    /// Put the camera back on every connection and release the screen capture
    ///
    /// # Errors
    ///
    /// Returns `ManagerClosed` after cleanup
    #[tracing::instrument(skip(self), fields(call_id = %self.call_id))]
    pub async fn stop_screen_share(&self) -> Result<(), PeerError> {
        self.ensure_open()?;
        let _guard = self.media_lock.lock().await;
        let Some(screen) = self.screen_track.write().take() else {
            return Ok(());
        };

        let camera = self.local_media().and_then(|m| m.video_track().cloned());
        self.replace_video(camera.as_ref()).await;
        screen.stop();
        tracing::info!("Screen sharing stopped");
        Ok(())
    }

    async fn replace_video(&self, track: Option<&LocalTrack>) {
        let wrappers: Vec<_> = self.peers.read().connections.values().cloned().collect();
        for wrapper in wrappers {
            let Some(sender) = wrapper.video_sender else {
                tracing::warn!(participant = %wrapper.participant, "No video sender, skipping track replacement");
                continue;
            };
            if let Err(e) = wrapper.link.replace_track(sender, track).await {
                tracing::warn!(participant = %wrapper.participant, error = %e, "Video track replacement failed");
                self.emit(PeerEvent::Error {
                    participant: Some(wrapper.participant.clone()),
                    error: wrapper.failed(e),
                });
            }
        }
    }

    /// Close the connection to `participant`
    ///
    /// # Errors
    ///
    /// Returns `UnknownParticipant` if there is no connection
    #[tracing::instrument(skip(self), fields(call_id = %self.call_id, participant = %participant))]
    pub async fn remove_participant(&self, participant: &ParticipantId) -> Result<(), PeerError> {
        self.ensure_open()?;
        let wrapper = {
            let mut peers = self.peers.write();
            peers.orphan_candidates.remove(participant);
            peers.connections.remove(participant)
        }
        .ok_or_else(|| PeerError::UnknownParticipant(participant.clone()))?;

        wrapper.stop_stats();
        wrapper.link.close().await;

        let stream = {
            let mut state = wrapper.state.lock();
            state.connection = ConnectionState::Closed;
            state.remote_stream.take()
        };
        if let Some(stream) = stream {
            self.emit(PeerEvent::StreamRemoved {
                participant: participant.clone(),
                stream_id: stream.id().to_string(),
            });
        }
        self.emit(PeerEvent::ConnectionStateChanged {
            participant: participant.clone(),
            state: ConnectionState::Closed,
        });
        tracing::info!("Peer connection removed");
        Ok(())
    }

    /// Close every connection and stop every local track
    ///
    /// Safe to call more than once and before anything was started.
    #[tracing::instrument(skip(self), fields(call_id = %self.call_id))]
    pub async fn cleanup(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();

        let wrappers: Vec<_> = {
            let mut peers = self.peers.write();
            peers.orphan_candidates.clear();
            peers.connections.drain().map(|(_, w)| w).collect()
        };
        join_all(wrappers.iter().map(|wrapper| async move {
            wrapper.stop_stats();
            wrapper.link.close().await;
            wrapper.state.lock().connection = ConnectionState::Closed;
        }))
        .await;

        // Serialize with an in-flight initialize or screen share.
        let _guard = self.media_lock.lock().await;
        if let Some(screen) = self.screen_track.write().take() {
            screen.stop();
        }
        if let Some(media) = self.local_media.read().as_ref() {
            media.stop_all();
        }

        tracing::info!(connections = wrappers.len(), "Peer manager cleaned up");
    }

    fn transition(&self, wrapper: &Arc<PeerConnectionWrapper>, to: ConnectionState) {
        let from = {
            let mut state = wrapper.state.lock();
            let from = state.connection;
            if from == to {
                return;
            }
            if !from.can_transition_to(to) {
                tracing::warn!(
                    participant = %wrapper.participant,
                    %from,
                    %to,
                    "Ignoring invalid connection state transition"
                );
                return;
            }
            state.connection = to;
            from
        };

        tracing::info!(participant = %wrapper.participant, %from, %to, "Connection state changed");
        match to {
            ConnectionState::Connected => self.start_stats(wrapper),
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed => {
                wrapper.stop_stats();
            }
            ConnectionState::New | ConnectionState::Connecting => {}
        }

        self.emit(PeerEvent::ConnectionStateChanged {
            participant: wrapper.participant.clone(),
            state: to,
        });
        if to == ConnectionState::Failed {
            self.emit(PeerEvent::Error {
                participant: Some(wrapper.participant.clone()),
                error: wrapper.failed("connection failed"),
            });
        }
    }

    fn start_stats(&self, wrapper: &Arc<PeerConnectionWrapper>) {
        let period = self.config.stats_interval;
        let weak = Arc::downgrade(wrapper);
        let events = self.event_sender.clone();
        let token = self.shutdown.child_token();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(wrapper) = weak.upgrade() else { break };
                        sample_quality(&wrapper, &events).await;
                    }
                }
            }
        });

        let mut state = wrapper.state.lock();
        if let Some(previous) = state.stats_task.replace(task) {
            previous.abort();
        }
    }

    async fn handle_link_event(&self, envelope: LinkEnvelope) {
        let Some(wrapper) = self.wrapper(&envelope.participant) else {
            tracing::trace!(participant = %envelope.participant, "Event for removed connection dropped");
            return;
        };
        if wrapper.generation != envelope.generation {
            tracing::trace!(participant = %envelope.participant, "Event from stale connection dropped");
            return;
        }

        match envelope.event {
            LinkEvent::IceCandidate(candidate) => {
                let signal = OutboundSignal::ice_candidate(wrapper.participant.clone(), &candidate);
                if let Err(e) = self.signaling.send(&self.call_id, signal).await {
                    tracing::warn!(participant = %wrapper.participant, error = %e, "Failed to relay ICE candidate");
                    self.emit(PeerEvent::Error {
                        participant: Some(wrapper.participant.clone()),
                        error: e.into(),
                    });
                }
            }
            LinkEvent::RemoteTrack { stream_id, track } => {
                self.on_remote_track(&wrapper, stream_id, track);
            }
            LinkEvent::StateChanged(state) => self.transition(&wrapper, state),
        }
    }

    fn on_remote_track(&self, wrapper: &PeerConnectionWrapper, stream_id: String, track: RemoteTrack) {
        let (stream, removed) = {
            let mut state = wrapper.state.lock();
            if let Some(current) = state.remote_stream.as_ref().filter(|s| s.id() == stream_id) {
                current.add_track(track);
                return;
            }
            let removed = state.remote_stream.take().map(|s| s.id().to_string());
            let stream = RemoteStream::new(stream_id);
            stream.add_track(track);
            state.remote_stream = Some(stream.clone());
            (stream, removed)
        };

        if let Some(stream_id) = removed {
            self.emit(PeerEvent::StreamRemoved {
                participant: wrapper.participant.clone(),
                stream_id,
            });
        }
        tracing::info!(participant = %wrapper.participant, stream_id = %stream.id(), "Remote stream received");
        self.emit(PeerEvent::StreamReceived {
            participant: wrapper.participant.clone(),
            stream,
        });
    }
}

impl Drop for PeerConnectionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn sample_quality(wrapper: &PeerConnectionWrapper, events: &broadcast::Sender<PeerEvent>) {
    let stats = match wrapper.link.stats().await {
        Ok(stats) => stats,
        Err(e) => {
            tracing::debug!(participant = %wrapper.participant, error = %e, "Stats sample failed");
            return;
        }
    };

    let metrics = stats.to_metrics();
    let level = metrics.quality();
    let changed = {
        let mut state = wrapper.state.lock();
        let changed = state.quality != Some(level);
        state.quality = Some(level);
        state.metrics = Some(metrics.clone());
        changed
    };

    tracing::trace!(
        participant = %wrapper.participant,
        loss = metrics.packet_loss_percent,
        jitter_ms = metrics.jitter_ms,
        ?level,
        "Quality sampled"
    );
    if changed {
        let _ = events.send(PeerEvent::QualityChanged {
            participant: wrapper.participant.clone(),
            quality: level,
            metrics,
        });
    }
}

async fn run_event_pump(
    manager: Weak<PeerConnectionManager>,
    mut rx: mpsc::UnboundedReceiver<LinkEnvelope>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            envelope = rx.recv() => {
                let Some(envelope) = envelope else { break };
                let Some(manager) = manager.upgrade() else { break };
                manager.handle_link_event(envelope).await;
            }
        }
    }
    tracing::debug!("Peer event pump stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackBackend;
    use crate::registry::CallRegistry;
    use crate::signaling::LocalRelayChannel;

    fn pid(id: &str) -> ParticipantId {
        ParticipantId::parse(id).unwrap()
    }

    fn manager(name: &str) -> (Arc<PeerConnectionManager>, Arc<LoopbackBackend>) {
        let registry = Arc::new(CallRegistry::default());
        let call_id = CallId::parse("room").unwrap();
        registry.join(&call_id, &pid(name)).unwrap();
        let channel = Arc::new(LocalRelayChannel::new(registry, pid(name)));
        let backend = Arc::new(LoopbackBackend::new());
        let manager = Arc::new(PeerConnectionManager::new(
            call_id,
            Arc::new(SignalingHandler::new(channel)),
            backend.clone(),
            PeerManagerConfig::default(),
        ));
        (manager, backend)
    }

    #[tokio::test]
    async fn test_create_connection_requires_initialize() {
        let (manager, _) = manager("alice");
        let err = manager.create_connection(&pid("bob")).await.unwrap_err();
        assert_eq!(err, PeerError::NotInitialized);
    }

    #[tokio::test]
    async fn test_second_connection_rejected() {
        let (manager, _) = manager("alice");
        manager.initialize(&MediaConstraints::default()).await.unwrap();
        manager.create_connection(&pid("bob")).await.unwrap();
        let err = manager.create_connection(&pid("bob")).await.unwrap_err();
        assert_eq!(err, PeerError::ConnectionExists(pid("bob")));
        assert_eq!(manager.connection_state(&pid("bob")), Some(ConnectionState::New));
    }

    #[tokio::test]
    async fn test_media_denied_is_fatal() {
        let (manager, backend) = manager("alice");
        backend.deny_media(true);
        let err = manager.initialize(&MediaConstraints::default()).await.unwrap_err();
        assert!(matches!(err, PeerError::MediaAccessDenied(_)));
        assert!(!manager.is_initialized());
    }

    #[tokio::test]
    async fn test_answer_without_offer_rejected() {
        let (manager, _) = manager("alice");
        manager.initialize(&MediaConstraints::default()).await.unwrap();
        manager.create_connection(&pid("bob")).await.unwrap();
        let err = manager
            .handle_answer(&pid("bob"), SessionDescription::answer("v=0\r\n"))
            .await
            .unwrap_err();
        assert_eq!(err, PeerError::UnexpectedAnswer(pid("bob")));
    }

    #[tokio::test]
    async fn test_operations_after_cleanup() {
        let (manager, backend) = manager("alice");
        manager.cleanup().await;
        manager.cleanup().await;
        assert!(backend.captured_tracks().is_empty());

        let err = manager.initialize(&MediaConstraints::default()).await.unwrap_err();
        assert_eq!(err, PeerError::ManagerClosed);
    }

    #[tokio::test]
    async fn test_toggle_keeps_connection_state() {
        let (manager, _) = manager("alice");
        manager.initialize(&MediaConstraints::default()).await.unwrap();
        manager.create_connection(&pid("bob")).await.unwrap();

        manager.toggle_audio(false).unwrap();
        manager.toggle_video(false).unwrap();
        let media = manager.local_media().unwrap();
        assert!(!media.audio_track().unwrap().is_enabled());
        assert!(!media.video_track().unwrap().is_enabled());
        assert_eq!(manager.connection_state(&pid("bob")), Some(ConnectionState::New));
    }
}
