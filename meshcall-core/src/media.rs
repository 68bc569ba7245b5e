//! Local and remote media handles
//!
//! Tracks are opaque handles onto whatever the [`MediaBackend`] captured. The
//! crate never touches samples; it only routes tracks onto senders, flips
//! their `enabled` flag for mute, and stops them on teardown.
//!
//! [`MediaBackend`]: crate::backend::MediaBackend

use crate::types::TrackKind;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The platform refused camera/microphone access
    #[error("Media access denied: {0}")]
    AccessDenied(String),

    /// The platform refused screen capture
    #[error("Screen capture denied: {0}")]
    ScreenCaptureDenied(String),

    /// Device missing or failed
    #[error("Device error: {0}")]
    Device(String),
}

#[derive(Debug)]
struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    live: AtomicBool,
}

/// Handle to a locally captured track
///
/// Clones share state: muting one clone mutes all of them. Only this crate can
/// flip the flags, so backends and wrappers observe tracks read-only.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    /// Create a live, enabled track
    #[must_use]
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
            }),
        }
    }

    /// Track identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Track kind
    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    /// Device label
    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Whether the track currently sends media (not muted)
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Whether the track is still capturing
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Whether two handles refer to the same track
    #[must_use]
    pub fn same_track(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    pub(crate) fn stop(&self) {
        if self.inner.live.swap(false, Ordering::AcqRel) {
            tracing::debug!(track_id = %self.inner.id, kind = ?self.inner.kind, "Stopped local track");
        }
    }
}

/// The local camera/microphone stream of a manager
#[derive(Debug, Clone)]
pub struct LocalMedia {
    stream_id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalMedia {
    /// Bundle captured tracks into a stream
    #[must_use]
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            stream_id: uuid::Uuid::new_v4().to_string(),
            tracks,
        }
    }

    /// Stream identifier
    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// All tracks in capture order
    #[must_use]
    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    /// Microphone track, if captured
    #[must_use]
    pub fn audio_track(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    /// Camera track, if captured
    #[must_use]
    pub fn video_track(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    pub(crate) fn set_kind_enabled(&self, kind: TrackKind, enabled: bool) -> usize {
        let mut changed = 0;
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
            changed += 1;
        }
        changed
    }

    pub(crate) fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// A track received from a remote participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    /// Track identifier as announced by the remote side
    pub id: String,
    /// Track kind
    pub kind: TrackKind,
}

/// Media stream received from one remote participant
///
/// Clones share the track list, so a stream handed out in a
/// `StreamReceived` event keeps growing as further tracks arrive.
#[derive(Debug, Clone)]
pub struct RemoteStream {
    id: String,
    tracks: Arc<RwLock<Vec<RemoteTrack>>>,
}

impl RemoteStream {
    /// Create an empty stream
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Stream identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Tracks received so far
    #[must_use]
    pub fn tracks(&self) -> Vec<RemoteTrack> {
        self.tracks.read().clone()
    }

    /// Whether the stream carries a track of `kind`
    #[must_use]
    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.read().iter().any(|t| t.kind == kind)
    }

    /// Add a track, returning false if it was already present
    pub(crate) fn add_track(&self, track: RemoteTrack) -> bool {
        let mut tracks = self.tracks.write();
        if tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        tracks.push(track);
        true
    }
}
