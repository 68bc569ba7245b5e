//! Media and peer-connection capability traits
//!
//! The orchestration layer never talks to a WebRTC stack directly. A
//! [`MediaBackend`] captures local media and opens [`PeerLink`]s; a link
//! negotiates one peer connection and reports what happens on it through a
//! [`LinkEventSink`]. Any binding (webrtc-rs, a browser bridge, the in-process
//! [`LoopbackBackend`]) can sit behind these traits.
//!
//! [`LoopbackBackend`]: crate::loopback::LoopbackBackend

use crate::identity::ParticipantId;
use crate::media::{LocalMedia, LocalTrack, MediaError, RemoteTrack};
use crate::types::{
    CallQualityMetrics, ConnectionState, IceCandidate, MediaConstraints, SessionDescription,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Peer link errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Offer/answer or candidate handling failed
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// The link was already closed
    #[error("Link closed")]
    Closed,

    /// Anything else the backend reports
    #[error("Link error: {0}")]
    Other(String),
}

/// Handle to an outbound sender on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SenderId(pub u64);

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sender-{}", self.0)
    }
}

/// Connection parameters handed to the backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// STUN/TURN server URLs
    pub ice_servers: Vec<String>,
}

/// Raw statistics sampled from a link
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkStats {
    /// Inbound packets received
    pub packets_received: u64,
    /// Inbound packets lost
    pub packets_lost: u64,
    /// Inbound jitter in milliseconds
    pub jitter_ms: f64,
    /// Round-trip time in milliseconds, if known
    pub rtt_ms: Option<f64>,
}

impl LinkStats {
    /// Convert to quality metrics
    #[must_use]
    pub fn to_metrics(&self) -> CallQualityMetrics {
        let mut metrics =
            CallQualityMetrics::from_counters(self.packets_received, self.packets_lost, self.jitter_ms);
        metrics.rtt_ms = self.rtt_ms;
        metrics
    }
}

/// Something that happened on a link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A local ICE candidate was gathered and must be signaled
    IceCandidate(IceCandidate),
    /// A remote track arrived
    RemoteTrack {
        /// Stream the track belongs to
        stream_id: String,
        /// The track
        track: RemoteTrack,
    },
    /// The transport-level connection state changed
    StateChanged(ConnectionState),
}

/// Link event tagged with the connection it came from
#[derive(Debug)]
pub(crate) struct LinkEnvelope {
    pub participant: ParticipantId,
    pub generation: u64,
    pub event: LinkEvent,
}

/// Where a link reports its events
///
/// Events emitted after the owning connection was removed are dropped by the
/// manager, so backends may emit freely until `close` returns.
#[derive(Debug, Clone)]
pub struct LinkEventSink {
    participant: ParticipantId,
    generation: u64,
    tx: mpsc::UnboundedSender<LinkEnvelope>,
}

impl LinkEventSink {
    pub(crate) fn new(
        participant: ParticipantId,
        generation: u64,
        tx: mpsc::UnboundedSender<LinkEnvelope>,
    ) -> Self {
        Self {
            participant,
            generation,
            tx,
        }
    }

    /// Remote participant of the link
    #[must_use]
    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    /// Report an event; returns false once the manager has shut down
    pub fn emit(&self, event: LinkEvent) -> bool {
        self.tx
            .send(LinkEnvelope {
                participant: self.participant.clone(),
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Platform media capture and connection factory
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Capture microphone/camera as requested
    ///
    /// # Errors
    ///
    /// Returns `AccessDenied` if the platform refuses
    async fn acquire_local_media(&self, constraints: &MediaConstraints)
        -> Result<LocalMedia, MediaError>;

    /// Capture the screen as a video track
    ///
    /// # Errors
    ///
    /// Returns `ScreenCaptureDenied` if the user or platform refuses
    async fn acquire_screen_capture(&self) -> Result<LocalTrack, MediaError>;

    /// Open a new peer connection reporting through `events`
    ///
    /// # Errors
    ///
    /// Returns error if the connection cannot be created
    async fn create_connection(
        &self,
        config: &LinkConfig,
        events: LinkEventSink,
    ) -> Result<Arc<dyn PeerLink>, LinkError>;
}

/// One negotiated peer connection
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Attach a track on a new sender
    ///
    /// # Errors
    ///
    /// Returns error if the link is closed
    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, LinkError>;

    /// Swap the track on an existing sender without renegotiation
    ///
    /// # Errors
    ///
    /// Returns error if the sender is unknown or the link is closed
    async fn replace_track(&self, sender: SenderId, track: Option<&LocalTrack>)
        -> Result<(), LinkError>;

    /// Senders and the track each currently carries
    fn senders(&self) -> Vec<(SenderId, Option<LocalTrack>)>;

    /// Create an offer
    ///
    /// # Errors
    ///
    /// Returns error if negotiation fails
    async fn create_offer(&self) -> Result<SessionDescription, LinkError>;

    /// Create an answer to the current remote offer
    ///
    /// # Errors
    ///
    /// Returns error if there is no remote offer
    async fn create_answer(&self) -> Result<SessionDescription, LinkError>;

    /// Apply a local description
    ///
    /// # Errors
    ///
    /// Returns error if the description is not valid in the current state
    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), LinkError>;

    /// Apply a remote description
    ///
    /// # Errors
    ///
    /// Returns error if the description is not valid in the current state
    async fn set_remote_description(&self, description: SessionDescription)
        -> Result<(), LinkError>;

    /// Discard a pending local offer
    ///
    /// # Errors
    ///
    /// Returns error if the link is closed
    async fn rollback(&self) -> Result<(), LinkError>;

    /// Apply a remote ICE candidate
    ///
    /// # Errors
    ///
    /// Returns error if no remote description is set or the candidate is bad
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError>;

    /// Sample connection statistics
    ///
    /// # Errors
    ///
    /// Returns error if the link is closed
    async fn stats(&self) -> Result<LinkStats, LinkError>;

    /// Close the connection; idempotent
    async fn close(&self);
}
