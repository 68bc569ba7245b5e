//! Call signaling protocol
//!
//! Wire types for the join/leave/offer/answer/ice-candidate exchange, the
//! [`SignalingChannel`] seam the client side talks through, and the
//! [`SignalingHandler`] that adds logging and error backoff on top of it.

use crate::identity::{CallId, IdError, ParticipantId};
use crate::registry::{CallRegistry, RegistryError};
use crate::types::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Maximum serialized payload size (64KB)
pub const MAX_SIGNALING_PAYLOAD_SIZE: usize = 64 * 1024;

/// Maximum SDP string length
pub const MAX_SDP_LENGTH: usize = 32 * 1024;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// The relay does not know the call
    #[error("Call not found: {0}")]
    CallNotFound(String),

    /// The relay could not be reached or refused the request
    #[error("Signaling relay failed: {0}")]
    RelayFailed(String),

    /// A message or payload was malformed
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),
}

impl From<IdError> for SignalingError {
    fn from(err: IdError) -> Self {
        Self::InvalidMessageFormat(err.to_string())
    }
}

/// Signaling message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalingKind {
    /// Participant joined the call
    #[serde(rename = "join")]
    Join,
    /// Participant left the call
    #[serde(rename = "leave")]
    Leave,
    /// SDP offer
    #[serde(rename = "offer")]
    Offer,
    /// SDP answer
    #[serde(rename = "answer")]
    Answer,
    /// Trickled ICE candidate
    #[serde(rename = "ice-candidate")]
    IceCandidate,
}

impl SignalingKind {
    /// Wire name of the kind
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
        }
    }

    /// Whether the relay forwards this kind verbatim (negotiation traffic)
    #[must_use]
    pub fn is_negotiation(self) -> bool {
        matches!(self, Self::Offer | Self::Answer | Self::IceCandidate)
    }
}

impl fmt::Display for SignalingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalingKind {
    type Err = SignalingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "join" => Ok(Self::Join),
            "leave" => Ok(Self::Leave),
            "offer" => Ok(Self::Offer),
            "answer" => Ok(Self::Answer),
            "ice-candidate" => Ok(Self::IceCandidate),
            other => Err(SignalingError::InvalidMessageFormat(format!(
                "unknown message type '{other}'"
            ))),
        }
    }
}

/// A message appended to a call's signaling log
///
/// Immutable once the registry has stamped it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    /// Call the message belongs to
    pub call_id: CallId,
    /// Message type
    #[serde(rename = "type")]
    pub kind: SignalingKind,
    /// Sender
    pub from_participant: ParticipantId,
    /// Recipient; `None` means broadcast to every other participant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_participant: Option<ParticipantId>,
    /// Kind-specific payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Milliseconds since the Unix epoch, strictly increasing within a call
    pub timestamp: i64,
}

impl SignalingMessage {
    /// Whether `viewer` should see this message
    #[must_use]
    pub fn is_visible_to(&self, viewer: &ParticipantId) -> bool {
        if &self.from_participant == viewer {
            return false;
        }
        match &self.to_participant {
            Some(to) => to == viewer,
            None => true,
        }
    }

    /// Decode the SDP carried by an offer or answer
    ///
    /// # Errors
    ///
    /// Returns error if the message is not an offer/answer or the payload is malformed
    pub fn session_description(&self) -> Result<SessionDescription, SignalingError> {
        let kind = match self.kind {
            SignalingKind::Offer => SdpKind::Offer,
            SignalingKind::Answer => SdpKind::Answer,
            other => {
                return Err(SignalingError::InvalidMessageFormat(format!(
                    "{other} does not carry a session description"
                )))
            }
        };
        let payload: SdpPayload = decode_payload(self.payload.as_ref())?;
        Ok(SessionDescription {
            kind,
            sdp: payload.sdp,
        })
    }

    /// Decode the ICE candidate carried by an ice-candidate message
    ///
    /// # Errors
    ///
    /// Returns error if the message is not an ice-candidate or the payload is malformed
    pub fn ice_candidate(&self) -> Result<IceCandidate, SignalingError> {
        if self.kind != SignalingKind::IceCandidate {
            return Err(SignalingError::InvalidMessageFormat(format!(
                "{} does not carry an ICE candidate",
                self.kind
            )));
        }
        decode_payload(self.payload.as_ref())
    }

    /// Display name announced with a join, if any
    #[must_use]
    pub fn display_name(&self) -> Option<String> {
        if self.kind != SignalingKind::Join {
            return None;
        }
        self.payload
            .as_ref()
            .and_then(|p| serde_json::from_value::<JoinPayload>(p.clone()).ok())
            .and_then(|p| p.display_name)
    }
}

/// Offer/answer payload
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SdpPayload {
    sdp: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
}

/// Join payload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    display_name: Option<String>,
}

fn decode_payload<T: serde::de::DeserializeOwned>(
    payload: Option<&Value>,
) -> Result<T, SignalingError> {
    let payload = payload
        .ok_or_else(|| SignalingError::InvalidMessageFormat("missing payload".to_string()))?;
    serde_json::from_value(payload.clone())
        .map_err(|e| SignalingError::InvalidMessageFormat(e.to_string()))
}

/// Validate a payload against its message type
///
/// The relay only checks shape and size; SDP content is opaque to it.
///
/// # Errors
///
/// Returns `InvalidMessageFormat` describing the first problem found
pub fn validate_payload(kind: SignalingKind, payload: Option<&Value>) -> Result<(), SignalingError> {
    if let Some(value) = payload {
        let size = serde_json::to_vec(value)
            .map_err(|e| SignalingError::InvalidMessageFormat(e.to_string()))?
            .len();
        if size > MAX_SIGNALING_PAYLOAD_SIZE {
            return Err(SignalingError::InvalidMessageFormat(format!(
                "payload too large: {size} bytes (max {MAX_SIGNALING_PAYLOAD_SIZE})"
            )));
        }
    }

    match kind {
        SignalingKind::Offer | SignalingKind::Answer => {
            let sdp: SdpPayload = decode_payload(payload)?;
            if sdp.sdp.trim().is_empty() {
                return Err(SignalingError::InvalidMessageFormat(
                    "SDP cannot be empty".to_string(),
                ));
            }
            if sdp.sdp.len() > MAX_SDP_LENGTH {
                return Err(SignalingError::InvalidMessageFormat(format!(
                    "SDP too long: {} bytes (max {MAX_SDP_LENGTH})",
                    sdp.sdp.len()
                )));
            }
            if let Some(declared) = sdp.kind.as_deref() {
                if declared != kind.as_str() {
                    return Err(SignalingError::InvalidMessageFormat(format!(
                        "payload type '{declared}' does not match message type '{kind}'"
                    )));
                }
            }
            Ok(())
        }
        SignalingKind::IceCandidate => {
            let candidate: IceCandidate = decode_payload(payload)?;
            if candidate.candidate.len() > MAX_SDP_LENGTH {
                return Err(SignalingError::InvalidMessageFormat(
                    "ICE candidate too long".to_string(),
                ));
            }
            Ok(())
        }
        SignalingKind::Join => match payload {
            None | Some(Value::Null) => Ok(()),
            Some(value) => serde_json::from_value::<JoinPayload>(value.clone())
                .map(|_| ())
                .map_err(|e| SignalingError::InvalidMessageFormat(e.to_string())),
        },
        SignalingKind::Leave => Ok(()),
    }
}

/// Negotiation message to be relayed, before the relay stamps it
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundSignal {
    /// Message type (offer, answer or ice-candidate)
    pub kind: SignalingKind,
    /// Recipient; `None` broadcasts
    pub to: Option<ParticipantId>,
    /// Kind-specific payload
    pub payload: Option<Value>,
}

impl OutboundSignal {
    /// Offer or answer addressed to `to`
    #[must_use]
    pub fn description(to: ParticipantId, description: &SessionDescription) -> Self {
        let kind = match description.kind {
            SdpKind::Offer => SignalingKind::Offer,
            SdpKind::Answer => SignalingKind::Answer,
        };
        let payload = serde_json::json!({
            "type": kind.as_str(),
            "sdp": description.sdp,
        });
        Self {
            kind,
            to: Some(to),
            payload: Some(payload),
        }
    }

    /// ICE candidate addressed to `to`
    #[must_use]
    pub fn ice_candidate(to: ParticipantId, candidate: &IceCandidate) -> Self {
        Self {
            kind: SignalingKind::IceCandidate,
            to: Some(to),
            payload: serde_json::to_value(candidate).ok(),
        }
    }
}

/// Join payload announcing a display name
#[must_use]
pub fn join_payload(display_name: Option<&str>) -> Option<Value> {
    display_name.map(|name| serde_json::json!({ "displayName": name }))
}

/// Snapshot of a call as returned by a fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    /// Call identifier
    pub call_id: CallId,
    /// Current participants, sorted
    pub participants: Vec<ParticipantId>,
    /// Messages after the requested cursor, in timestamp order
    pub messages: Vec<SignalingMessage>,
    /// Total length of the call's log
    pub total_messages: usize,
}

impl CallSnapshot {
    /// Timestamp of the newest returned message, usable as the next cursor
    #[must_use]
    pub fn cursor(&self) -> Option<i64> {
        self.messages.last().map(|m| m.timestamp)
    }
}

/// Client-side access to a signaling relay
///
/// Implement this for your specific transport (HTTP polling, in-process, ...).
/// A channel is bound to one authenticated participant: the relay resolves the
/// sender from the channel's credentials, not from the message.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Participant this channel speaks for
    fn local_participant(&self) -> &ParticipantId;

    /// Join a call, creating it if needed
    ///
    /// Returns the timestamp of the stamped join message, or `None` when the
    /// participant was already in the call.
    async fn join(&self, call_id: &CallId, display_name: Option<&str>)
        -> Result<Option<i64>, SignalingError>;

    /// Leave a call
    async fn leave(&self, call_id: &CallId) -> Result<(), SignalingError>;

    /// Relay a negotiation message
    async fn send(&self, call_id: &CallId, signal: OutboundSignal) -> Result<(), SignalingError>;

    /// Fetch participants and the messages newer than `since`
    async fn fetch(&self, call_id: &CallId, since: Option<i64>)
        -> Result<CallSnapshot, SignalingError>;
}

/// Backoff step per consecutive failure
const ERROR_BACKOFF_STEP: Duration = Duration::from_millis(100);

/// Cap on the backoff multiplier
const MAX_BACKOFF_STEPS: u32 = 10;

/// Signaling handler with logging and failure backoff
pub struct SignalingHandler {
    channel: Arc<dyn SignalingChannel>,
    error_count: parking_lot::Mutex<u32>,
}

impl SignalingHandler {
    /// Create new signaling handler
    #[must_use]
    pub fn new(channel: Arc<dyn SignalingChannel>) -> Self {
        Self {
            channel,
            error_count: parking_lot::Mutex::new(0),
        }
    }

    /// Participant this handler speaks for
    #[must_use]
    pub fn local_participant(&self) -> &ParticipantId {
        self.channel.local_participant()
    }

    /// Join a call
    ///
    /// # Errors
    ///
    /// Returns error if the relay rejects the join
    #[tracing::instrument(skip(self), fields(participant = %self.local_participant()))]
    pub async fn join(
        &self,
        call_id: &CallId,
        display_name: Option<&str>,
    ) -> Result<Option<i64>, SignalingError> {
        tracing::debug!("Joining call on relay");
        self.channel.join(call_id, display_name).await
    }

    /// Leave a call
    ///
    /// # Errors
    ///
    /// Returns error if the relay could not be reached
    #[tracing::instrument(skip(self), fields(participant = %self.local_participant()))]
    pub async fn leave(&self, call_id: &CallId) -> Result<(), SignalingError> {
        tracing::debug!("Leaving call on relay");
        self.channel.leave(call_id).await
    }

    /// Relay a negotiation message
    ///
    /// # Errors
    ///
    /// Returns error if sending fails
    #[tracing::instrument(skip(self, signal), fields(kind = %signal.kind, to = ?signal.to))]
    pub async fn send(&self, call_id: &CallId, signal: OutboundSignal) -> Result<(), SignalingError> {
        tracing::debug!("Sending signaling message");
        self.channel.send(call_id, signal).await
    }

    /// Fetch without touching the backoff state
    ///
    /// # Errors
    ///
    /// Returns error if the relay rejects the fetch
    pub async fn fetch(&self, call_id: &CallId, since: Option<i64>) -> Result<CallSnapshot, SignalingError> {
        self.channel.fetch(call_id, since).await
    }

    /// Poll for new messages with backoff after failures
    ///
    /// Consecutive failures sleep `100ms × min(failures, 10)` before the error is
    /// returned, so a caller looping on `poll` never hammers a sick relay.
    ///
    /// # Errors
    ///
    /// Returns error if fetching fails
    #[tracing::instrument(skip(self), level = "trace")]
    pub async fn poll(&self, call_id: &CallId, since: Option<i64>) -> Result<CallSnapshot, SignalingError> {
        match self.channel.fetch(call_id, since).await {
            Ok(snapshot) => {
                *self.error_count.lock() = 0;
                if !snapshot.messages.is_empty() {
                    tracing::debug!(count = snapshot.messages.len(), "Received signaling messages");
                }
                Ok(snapshot)
            }
            Err(e) => {
                let count = {
                    let mut error_count = self.error_count.lock();
                    *error_count += 1;
                    *error_count
                };

                let backoff_duration = ERROR_BACKOFF_STEP * count.min(MAX_BACKOFF_STEPS);
                tracing::warn!(
                    error_count = count,
                    backoff_ms = backoff_duration.as_millis(),
                    error = %e,
                    "Error polling relay, backing off"
                );
                sleep(backoff_duration).await;

                Err(e)
            }
        }
    }

    /// Consecutive poll failures so far
    #[must_use]
    pub fn consecutive_errors(&self) -> u32 {
        *self.error_count.lock()
    }
}

impl From<RegistryError> for SignalingError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::CallNotFound(id) => Self::CallNotFound(id),
            RegistryError::InvalidMessageFormat(msg) => Self::InvalidMessageFormat(msg),
            RegistryError::NotInCall { .. } => Self::RelayFailed(err.to_string()),
        }
    }
}

/// In-process channel straight onto a [`CallRegistry`]
///
/// Used when the controller runs in the same process as the relay, and by tests.
pub struct LocalRelayChannel {
    registry: Arc<CallRegistry>,
    participant: ParticipantId,
}

impl LocalRelayChannel {
    /// Bind a channel for `participant`
    #[must_use]
    pub fn new(registry: Arc<CallRegistry>, participant: ParticipantId) -> Self {
        Self {
            registry,
            participant,
        }
    }
}

#[async_trait]
impl SignalingChannel for LocalRelayChannel {
    fn local_participant(&self) -> &ParticipantId {
        &self.participant
    }

    async fn join(
        &self,
        call_id: &CallId,
        display_name: Option<&str>,
    ) -> Result<Option<i64>, SignalingError> {
        let delivery =
            self.registry
                .join_with(call_id, &self.participant, join_payload(display_name))?;
        Ok(delivery.map(|d| d.message.timestamp))
    }

    async fn leave(&self, call_id: &CallId) -> Result<(), SignalingError> {
        self.registry.leave(call_id, &self.participant);
        Ok(())
    }

    async fn send(&self, call_id: &CallId, signal: OutboundSignal) -> Result<(), SignalingError> {
        self.registry.relay(
            call_id,
            &self.participant,
            signal.kind,
            signal.to,
            signal.payload,
        )?;
        Ok(())
    }

    async fn fetch(&self, call_id: &CallId, since: Option<i64>) -> Result<CallSnapshot, SignalingError> {
        Ok(self.registry.fetch_for(call_id, &self.participant, since)?)
    }
}
