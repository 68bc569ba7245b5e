//! In-memory call registry
//!
//! The registry is the relay-side directory of active calls: who is in each
//! call and the ordered log of signaling messages exchanged in it. It knows
//! nothing about transports; the HTTP endpoint and [`LocalRelayChannel`]
//! both sit on top of it.
//!
//! The store is volatile and per-process. Calls do not survive a restart and
//! two relay processes never see each other's calls.
//!
//! [`LocalRelayChannel`]: crate::signaling::LocalRelayChannel

use crate::clock::{Clock, SystemClock};
use crate::identity::{CallId, ParticipantId};
use crate::signaling::{validate_payload, CallSnapshot, SignalingKind, SignalingMessage};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No active call with this id
    #[error("Call not found: {0}")]
    CallNotFound(String),

    /// Message type or payload rejected
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// Sender is not a participant of the call
    #[error("Participant {participant} is not in call {call_id}")]
    NotInCall {
        /// Call the message targeted
        call_id: String,
        /// Offending sender
        participant: String,
    },
}

/// Registry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Age after which a call is purged regardless of activity
    pub session_ttl: Duration,
    /// Period of the background sweep
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// A message appended to a call together with the participants it fanned out to
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// The stamped message as stored in the log
    pub message: SignalingMessage,
    /// Participants the message was addressed to
    pub recipients: Vec<ParticipantId>,
}

#[derive(Debug)]
struct CallSession {
    call_id: CallId,
    participants: BTreeSet<ParticipantId>,
    messages: Vec<SignalingMessage>,
    created_at: DateTime<Utc>,
    last_timestamp: i64,
}

impl CallSession {
    fn new(call_id: CallId, created_at: DateTime<Utc>) -> Self {
        Self {
            call_id,
            participants: BTreeSet::new(),
            messages: Vec::new(),
            created_at,
            last_timestamp: 0,
        }
    }

    fn next_timestamp(&mut self, now: DateTime<Utc>) -> i64 {
        let ts = now.timestamp_millis().max(self.last_timestamp + 1);
        self.last_timestamp = ts;
        ts
    }

    fn others(&self, exclude: &ParticipantId) -> Vec<ParticipantId> {
        self.participants
            .iter()
            .filter(|p| *p != exclude)
            .cloned()
            .collect()
    }

    fn snapshot(&self, viewer: Option<&ParticipantId>, since: Option<i64>) -> CallSnapshot {
        let start = since.map_or(0, |since| {
            self.messages.partition_point(|m| m.timestamp <= since)
        });
        let messages = self.messages[start..]
            .iter()
            .filter(|m| viewer.map_or(true, |v| m.is_visible_to(v)))
            .cloned()
            .collect();

        CallSnapshot {
            call_id: self.call_id.clone(),
            participants: self.participants.iter().cloned().collect(),
            messages,
            total_messages: self.messages.len(),
        }
    }
}

#[derive(Debug)]
struct CallSlot {
    session: CallSession,
    subscribers: HashMap<ParticipantId, mpsc::UnboundedSender<SignalingMessage>>,
    closed: bool,
}

impl CallSlot {
    fn new(call_id: CallId, created_at: DateTime<Utc>) -> Self {
        Self {
            session: CallSession::new(call_id, created_at),
            subscribers: HashMap::new(),
            closed: false,
        }
    }

    fn append(
        &mut self,
        now: DateTime<Utc>,
        kind: SignalingKind,
        from: &ParticipantId,
        to: Option<ParticipantId>,
        payload: Option<Value>,
        recipients: Vec<ParticipantId>,
    ) -> Delivery {
        let message = SignalingMessage {
            call_id: self.session.call_id.clone(),
            kind,
            from_participant: from.clone(),
            to_participant: to,
            payload,
            timestamp: self.session.next_timestamp(now),
        };
        self.session.messages.push(message.clone());

        for recipient in &recipients {
            let gone = self
                .subscribers
                .get(recipient)
                .is_some_and(|tx| tx.send(message.clone()).is_err());
            if gone {
                self.subscribers.remove(recipient);
            }
        }

        Delivery {
            message,
            recipients,
        }
    }
}

type SlotRef = Arc<Mutex<CallSlot>>;

/// Process-wide directory of active calls
///
/// Each call sits behind its own lock: operations on one call are serialized,
/// operations on different calls never wait for each other.
pub struct CallRegistry {
    calls: DashMap<CallId, SlotRef>,
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
}

impl CallRegistry {
    /// Create a registry on the system clock
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a registry reading time from `clock`
    #[must_use]
    pub fn with_clock(config: RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            calls: DashMap::new(),
            config,
            clock,
        }
    }

    /// Registry configuration
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn slot(&self, call_id: &CallId) -> Option<SlotRef> {
        self.calls.get(call_id).map(|entry| Arc::clone(entry.value()))
    }

    fn not_found(call_id: &CallId) -> RegistryError {
        RegistryError::CallNotFound(call_id.to_string())
    }

    /// Add `participant` to a call, creating the call if needed
    ///
    /// Returns `None` when the participant was already present.
    ///
    /// # Errors
    ///
    /// Never fails for a join without payload
    pub fn join(
        &self,
        call_id: &CallId,
        participant: &ParticipantId,
    ) -> Result<Option<Delivery>, RegistryError> {
        self.join_with(call_id, participant, None)
    }

    /// Join carrying a join payload (display name)
    ///
    /// # Errors
    ///
    /// Returns `InvalidMessageFormat` if the payload is malformed
    pub fn join_with(
        &self,
        call_id: &CallId,
        participant: &ParticipantId,
        payload: Option<Value>,
    ) -> Result<Option<Delivery>, RegistryError> {
        validate_payload(SignalingKind::Join, payload.as_ref())
            .map_err(|e| RegistryError::InvalidMessageFormat(e.to_string()))?;

        loop {
            let now = self.clock.now();
            let slot = self
                .calls
                .entry(call_id.clone())
                .or_insert_with(|| {
                    tracing::info!(call_id = %call_id, "Call session created");
                    Arc::new(Mutex::new(CallSlot::new(call_id.clone(), now)))
                })
                .clone();

            let mut guard = slot.lock();
            if guard.closed {
                // Deleted between lookup and lock; a fresh slot replaces it.
                continue;
            }

            if guard.session.participants.contains(participant) {
                tracing::debug!(call_id = %call_id, participant = %participant, "Duplicate join ignored");
                return Ok(None);
            }

            let recipients = guard.session.others(participant);
            guard.session.participants.insert(participant.clone());
            let delivery = guard.append(
                now,
                SignalingKind::Join,
                participant,
                None,
                payload,
                recipients,
            );

            tracing::info!(
                call_id = %call_id,
                participant = %participant,
                participants = guard.session.participants.len(),
                "Participant joined call"
            );
            return Ok(Some(delivery));
        }
    }

    /// Remove `participant` from a call
    ///
    /// Deletes the call when its last participant leaves. Leaving a call one is
    /// not in, or an unknown call, is a no-op returning `None`.
    pub fn leave(&self, call_id: &CallId, participant: &ParticipantId) -> Option<Delivery> {
        let slot = self.slot(call_id)?;
        let mut guard = slot.lock();
        if guard.closed || !guard.session.participants.remove(participant) {
            return None;
        }

        guard.subscribers.remove(participant);
        let recipients = guard.session.others(participant);
        let delivery = guard.append(
            self.clock.now(),
            SignalingKind::Leave,
            participant,
            None,
            None,
            recipients,
        );

        tracing::info!(
            call_id = %call_id,
            participant = %participant,
            remaining = guard.session.participants.len(),
            "Participant left call"
        );

        if guard.session.participants.is_empty() {
            guard.closed = true;
            guard.subscribers.clear();
            self.calls.remove_if(call_id, |_, v| Arc::ptr_eq(v, &slot));
            tracing::info!(call_id = %call_id, "Call session deleted, no participants left");
        }

        Some(delivery)
    }

    /// Append a negotiation message and fan it out
    ///
    /// Targeted messages reach only `to`; untargeted ones reach every other
    /// participant. A target that is not in the call is logged but gets no
    /// delivery.
    ///
    /// # Errors
    ///
    /// - `CallNotFound` if the call does not exist
    /// - `InvalidMessageFormat` for join/leave or a malformed payload
    /// - `NotInCall` if `from` is not a participant
    pub fn relay(
        &self,
        call_id: &CallId,
        from: &ParticipantId,
        kind: SignalingKind,
        to: Option<ParticipantId>,
        payload: Option<Value>,
    ) -> Result<Delivery, RegistryError> {
        if !kind.is_negotiation() {
            return Err(RegistryError::InvalidMessageFormat(format!(
                "cannot relay message of type '{kind}'"
            )));
        }
        validate_payload(kind, payload.as_ref())
            .map_err(|e| RegistryError::InvalidMessageFormat(e.to_string()))?;

        let slot = self.slot(call_id).ok_or_else(|| Self::not_found(call_id))?;
        let mut guard = slot.lock();
        if guard.closed {
            return Err(Self::not_found(call_id));
        }
        if !guard.session.participants.contains(from) {
            return Err(RegistryError::NotInCall {
                call_id: call_id.to_string(),
                participant: from.to_string(),
            });
        }

        let recipients = match &to {
            Some(target) if guard.session.participants.contains(target) => vec![target.clone()],
            Some(target) => {
                tracing::warn!(call_id = %call_id, to = %target, "Relaying to participant not in call");
                Vec::new()
            }
            None => guard.session.others(from),
        };

        let delivery = guard.append(self.clock.now(), kind, from, to, payload, recipients);
        tracing::debug!(
            call_id = %call_id,
            from = %from,
            kind = %kind,
            timestamp = delivery.message.timestamp,
            "Relayed signaling message"
        );
        Ok(delivery)
    }

    /// Participants and every message newer than `since`
    ///
    /// # Errors
    ///
    /// Returns `CallNotFound` if the call does not exist
    pub fn fetch(&self, call_id: &CallId, since: Option<i64>) -> Result<CallSnapshot, RegistryError> {
        self.snapshot(call_id, None, since)
    }

    /// Like [`fetch`](Self::fetch), restricted to messages `viewer` should see
    ///
    /// # Errors
    ///
    /// Returns `CallNotFound` if the call does not exist
    pub fn fetch_for(
        &self,
        call_id: &CallId,
        viewer: &ParticipantId,
        since: Option<i64>,
    ) -> Result<CallSnapshot, RegistryError> {
        self.snapshot(call_id, Some(viewer), since)
    }

    fn snapshot(
        &self,
        call_id: &CallId,
        viewer: Option<&ParticipantId>,
        since: Option<i64>,
    ) -> Result<CallSnapshot, RegistryError> {
        let slot = self.slot(call_id).ok_or_else(|| Self::not_found(call_id))?;
        let guard = slot.lock();
        if guard.closed {
            return Err(Self::not_found(call_id));
        }
        Ok(guard.session.snapshot(viewer, since))
    }

    /// Push every message fanned out to `participant` onto a channel
    ///
    /// The channel closes when the participant leaves or the call is deleted.
    /// Subscribing again replaces the previous subscription.
    ///
    /// # Errors
    ///
    /// - `CallNotFound` if the call does not exist
    /// - `NotInCall` if `participant` has not joined
    pub fn subscribe(
        &self,
        call_id: &CallId,
        participant: &ParticipantId,
    ) -> Result<mpsc::UnboundedReceiver<SignalingMessage>, RegistryError> {
        let slot = self.slot(call_id).ok_or_else(|| Self::not_found(call_id))?;
        let mut guard = slot.lock();
        if guard.closed {
            return Err(Self::not_found(call_id));
        }
        if !guard.session.participants.contains(participant) {
            return Err(RegistryError::NotInCall {
                call_id: call_id.to_string(),
                participant: participant.to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        guard.subscribers.insert(participant.clone(), tx);
        Ok(rx)
    }

    /// Current participants of a call, sorted
    ///
    /// # Errors
    ///
    /// Returns `CallNotFound` if the call does not exist
    pub fn participants(&self, call_id: &CallId) -> Result<Vec<ParticipantId>, RegistryError> {
        let slot = self.slot(call_id).ok_or_else(|| Self::not_found(call_id))?;
        let guard = slot.lock();
        if guard.closed {
            return Err(Self::not_found(call_id));
        }
        Ok(guard.session.participants.iter().cloned().collect())
    }

    /// Number of active calls
    #[must_use]
    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }

    /// Purge calls older than the configured TTL
    ///
    /// Returns the number of calls deleted.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let ttl_ms = i64::try_from(self.config.session_ttl.as_millis()).unwrap_or(i64::MAX);

        let candidates: Vec<(CallId, SlotRef)> = self
            .calls
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut purged = 0;
        for (call_id, slot) in candidates {
            let mut guard = slot.lock();
            if guard.closed {
                continue;
            }
            let age_ms = (now - guard.session.created_at).num_milliseconds();
            if age_ms <= ttl_ms {
                continue;
            }

            guard.closed = true;
            guard.subscribers.clear();
            self.calls.remove_if(&call_id, |_, v| Arc::ptr_eq(v, &slot));
            purged += 1;
            tracing::info!(
                call_id = %call_id,
                age_secs = age_ms / 1000,
                participants = guard.session.participants.len(),
                "Purged stale call session"
            );
        }
        purged
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until `shutdown` fires
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        tracing::debug!("Registry sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let purged = registry.sweep();
                        tracing::debug!(purged, active = registry.active_calls(), "Registry sweep finished");
                    }
                }
            }
        })
    }
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}
