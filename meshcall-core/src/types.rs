//! Shared call types and data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Media constraints for a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Capture microphone audio
    pub audio: bool,
    /// Capture camera video
    pub video: bool,
}

impl MediaConstraints {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Video call with audio
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    /// Check if audio is requested
    pub fn has_audio(&self) -> bool {
        self.audio
    }

    /// Check if video is requested
    pub fn has_video(&self) -> bool {
        self.video
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::video_call()
    }
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone audio
    Audio,
    /// Camera video
    Video,
    /// Screen capture video
    Screen,
}

impl TrackKind {
    /// Whether this track travels on the video sender
    pub fn is_video(self) -> bool {
        matches!(self, Self::Video | Self::Screen)
    }
}

/// Per-participant peer connection state
///
/// ```text
///   New ──► Connecting ──► Connected ──► Disconnected ──► Closed
///    │          │              │   ▲          │
///    │          │              │   └──────────┤
///    │          ▼              ▼              ▼
///    └──────► Failed ◄─────────┴──────────────┘
///               │
///               ▼
///             Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Wrapper created, nothing negotiated yet
    New,
    /// Negotiation or ICE checks in progress
    Connecting,
    /// Media path established
    Connected,
    /// Media path temporarily lost
    Disconnected,
    /// Connection could not be established or recovered
    Failed,
    /// Connection closed locally
    Closed,
}

impl ConnectionState {
    /// Check whether moving from `self` to `to` is a legal transition
    #[must_use]
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::{Closed, Connected, Connecting, Disconnected, Failed, New};
        matches!(
            (self, to),
            (New, Connecting | Connected | Failed | Closed)
                | (Connecting, Connected | Disconnected | Failed | Closed)
                | (Connected, Disconnected | Failed | Closed)
                | (Disconnected, Connected | Connecting | Failed | Closed)
                | (Failed, Closed)
        )
    }

    /// Whether the participant still counts as present for the session
    #[must_use]
    pub fn is_alive(self) -> bool {
        !matches!(self, Self::Failed | Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Call-level status owned by the call controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// No call started
    Idle,
    /// Call started, no participant connected yet
    Connecting,
    /// At least one participant connected
    Connected,
    /// Call torn down
    Ended,
}

/// Connection quality classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    /// Loss < 1% and jitter < 30ms
    Excellent,
    /// Loss < 5% and jitter < 100ms
    Good,
    /// Anything worse
    Poor,
}

/// Call quality metrics sampled from a peer connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallQualityMetrics {
    /// Packet loss percentage
    pub packet_loss_percent: f64,
    /// Jitter in milliseconds
    pub jitter_ms: f64,
    /// Round-trip time in milliseconds, when the transport reports it
    pub rtt_ms: Option<f64>,
    /// Timestamp when metrics were collected
    pub timestamp: DateTime<Utc>,
}

impl CallQualityMetrics {
    /// Build metrics from raw packet counters
    ///
    /// Loss is computed over `packets_lost + packets_received`; an empty sample
    /// counts as lossless.
    pub fn from_counters(packets_received: u64, packets_lost: u64, jitter_ms: f64) -> Self {
        let total = packets_received.saturating_add(packets_lost);
        let packet_loss_percent = if total == 0 {
            0.0
        } else {
            packets_lost as f64 * 100.0 / total as f64
        };
        Self {
            packet_loss_percent,
            jitter_ms,
            rtt_ms: None,
            timestamp: Utc::now(),
        }
    }

    /// Classify into a quality level by fixed thresholds
    pub fn quality(&self) -> QualityLevel {
        if self.packet_loss_percent < 1.0 && self.jitter_ms < 30.0 {
            QualityLevel::Excellent
        } else if self.packet_loss_percent < 5.0 && self.jitter_ms < 100.0 {
            QualityLevel::Good
        } else {
            QualityLevel::Poor
        }
    }
}

/// SDP description kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Session description exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    pub kind: SdpKind,
    /// SDP content
    pub sdp: String,
}

impl SessionDescription {
    /// Create an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Create an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// ICE candidate string
    pub candidate: String,
    /// SDP media ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_media_constraints() {
        let audio = MediaConstraints::audio_only();
        assert!(audio.has_audio());
        assert!(!audio.has_video());

        let video = MediaConstraints::video_call();
        assert!(video.has_audio());
        assert!(video.has_video());
    }

    #[test]
    fn test_quality_thresholds() {
        let metric = |loss: f64, jitter: f64| CallQualityMetrics {
            packet_loss_percent: loss,
            jitter_ms: jitter,
            rtt_ms: None,
            timestamp: Utc::now(),
        };

        assert_eq!(metric(0.5, 10.0).quality(), QualityLevel::Excellent);
        assert_eq!(metric(1.0, 10.0).quality(), QualityLevel::Good);
        assert_eq!(metric(0.5, 30.0).quality(), QualityLevel::Good);
        assert_eq!(metric(4.9, 99.0).quality(), QualityLevel::Good);
        assert_eq!(metric(5.0, 10.0).quality(), QualityLevel::Poor);
        assert_eq!(metric(0.0, 150.0).quality(), QualityLevel::Poor);
    }

    #[test]
    fn test_metrics_from_counters() {
        let m = CallQualityMetrics::from_counters(98, 2, 12.0);
        assert!((m.packet_loss_percent - 2.0).abs() < f64::EPSILON);

        let empty = CallQualityMetrics::from_counters(0, 0, 0.0);
        assert_eq!(empty.packet_loss_percent, 0.0);
        assert_eq!(empty.quality(), QualityLevel::Excellent);
    }

    #[test]
    fn test_connection_transitions() {
        use ConnectionState::*;
        assert!(New.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Connected));
        assert!(Failed.can_transition_to(Closed));

        assert!(!Closed.can_transition_to(Connecting));
        assert!(!Failed.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(New));
    }

    #[test]
    fn test_ice_candidate_wire_names() {
        let c = IceCandidate {
            candidate: "candidate:1 1 udp 1 127.0.0.1 9 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
    }
}
