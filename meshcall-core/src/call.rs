//! Call session control
//!
//! [`CallController`] is the façade an application drives: start a call, mute,
//! share the screen, end it. Underneath it joins the call on the relay, polls
//! for signaling, feeds each remote participant's messages to an ordered worker
//! and turns per-connection events into call-level status and [`CallEvent`]s.

use crate::backend::MediaBackend;
use crate::identity::{CallId, ParticipantId};
use crate::media::RemoteStream;
use crate::peer::{PeerConnectionManager, PeerError, PeerEvent, PeerManagerConfig};
use crate::signaling::{
    CallSnapshot, SignalingChannel, SignalingError, SignalingHandler, SignalingKind,
    SignalingMessage,
};
use crate::types::{CallStatus, ConnectionState, MediaConstraints, QualityLevel};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

/// Call session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Camera/microphone access refused; the call did not start
    #[error("Media access denied: {0}")]
    MediaAccessDenied(String),

    /// Operation not valid in the current status
    #[error("Invalid call state: {0:?}")]
    InvalidState(CallStatus),

    /// `end_call` interrupted an in-flight `start_call`
    #[error("Call start cancelled")]
    Cancelled,

    /// Peer connection error
    #[error(transparent)]
    Peer(#[from] PeerError),

    /// Signaling relay error
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

/// Call controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallConfig {
    /// Name announced to the other participants
    pub display_name: Option<String>,
    /// Capture constraints for the local stream
    pub media: MediaConstraints,
    /// Relay polling period
    pub poll_interval: Duration,
    /// Peer connection settings
    pub peer: PeerManagerConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            display_name: None,
            media: MediaConstraints::default(),
            poll_interval: Duration::from_secs(1),
            peer: PeerManagerConfig::default(),
        }
    }
}

/// A remote participant as seen by the local client
#[derive(Debug, Clone)]
pub struct Participant {
    /// Participant id
    pub id: ParticipantId,
    /// Announced display name, the id when none was given
    pub display_name: String,
    /// State of the connection to this participant
    pub connection_state: ConnectionState,
    /// Media received from this participant
    pub stream: Option<RemoteStream>,
    /// Last quality classification
    pub quality: Option<QualityLevel>,
}

impl Participant {
    fn new(id: ParticipantId, display_name: Option<String>) -> Self {
        let display_name = display_name.unwrap_or_else(|| id.to_string());
        Self {
            id,
            display_name,
            connection_state: ConnectionState::New,
            stream: None,
            quality: None,
        }
    }
}

/// Call-level events
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// A participant is in the call
    ParticipantJoined {
        /// The participant
        participant: Participant,
    },
    /// A participant left the call
    ParticipantLeft {
        /// The participant
        participant: ParticipantId,
    },
    /// Media from a participant arrived
    StreamReceived {
        /// The participant
        participant: ParticipantId,
        /// The stream
        stream: RemoteStream,
    },
    /// Media from a participant went away
    StreamRemoved {
        /// The participant
        participant: ParticipantId,
        /// Stream identifier
        stream_id: String,
    },
    /// The call status changed
    StatusChanged {
        /// New status
        status: CallStatus,
    },
    /// Connection quality to a participant changed
    QualityChanged {
        /// The participant
        participant: ParticipantId,
        /// New level
        quality: QualityLevel,
    },
    /// The call ended
    CallEnded,
    /// A non-fatal error
    Error {
        /// Participant the error concerns, if any
        participant: Option<ParticipantId>,
        /// The error
        error: CallError,
    },
}

enum WorkerCommand {
    Offer,
    Signal(SignalingMessage),
}

struct Worker {
    tx: mpsc::UnboundedSender<WorkerCommand>,
    token: CancellationToken,
}

struct ActiveSession {
    epoch: u64,
    initiator: bool,
    manager: Arc<PeerConnectionManager>,
    token: CancellationToken,
}

/// Top-level controller of one call
pub struct CallController {
    call_id: CallId,
    config: CallConfig,
    backend: Arc<dyn MediaBackend>,
    signaling: Arc<SignalingHandler>,
    status: watch::Sender<CallStatus>,
    event_sender: broadcast::Sender<CallEvent>,
    session: Mutex<Option<ActiveSession>>,
    participants: RwLock<HashMap<ParticipantId, Participant>>,
    workers: Mutex<HashMap<ParticipantId, Worker>>,
    epoch: AtomicU64,
    ending: AtomicBool,
    reached_connected: AtomicBool,
}

impl CallController {
    /// Create a controller for `call_id`
    #[must_use]
    pub fn new(
        call_id: CallId,
        channel: Arc<dyn SignalingChannel>,
        backend: Arc<dyn MediaBackend>,
        config: CallConfig,
    ) -> Self {
        let (status, _) = watch::channel(CallStatus::Idle);
        let (event_sender, _) = broadcast::channel(256);
        Self {
            call_id,
            config,
            backend,
            signaling: Arc::new(SignalingHandler::new(channel)),
            status,
            event_sender,
            session: Mutex::new(None),
            participants: RwLock::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            epoch: AtomicU64::new(0),
            ending: AtomicBool::new(false),
            reached_connected: AtomicBool::new(false),
        }
    }

    /// Call identifier
    #[must_use]
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Local participant id
    #[must_use]
    pub fn local_participant(&self) -> &ParticipantId {
        self.signaling.local_participant()
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> CallStatus {
        *self.status.borrow()
    }

    /// Watch status transitions
    #[must_use]
    pub fn status_watch(&self) -> watch::Receiver<CallStatus> {
        self.status.subscribe()
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_sender.subscribe()
    }

    /// Call events as a stream
    ///
    /// Events missed because the consumer fell behind are skipped.
    pub fn events(&self) -> impl Stream<Item = CallEvent> + Send + 'static {
        BroadcastStream::new(self.event_sender.subscribe()).filter_map(|event| match event {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Call event stream lagged");
                None
            }
        })
    }

    /// Remote participants, sorted by id
    #[must_use]
    pub fn participants(&self) -> Vec<Participant> {
        let mut participants: Vec<_> = self.participants.read().values().cloned().collect();
        participants.sort_by(|a, b| a.id.cmp(&b.id));
        participants
    }

    /// Peer manager of the running call
    #[must_use]
    pub fn peer_manager(&self) -> Option<Arc<PeerConnectionManager>> {
        self.session.lock().as_ref().map(|s| Arc::clone(&s.manager))
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.event_sender.send(event);
    }

    fn set_status(&self, status: CallStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            tracing::info!(call_id = %self.call_id, ?status, "Call status changed");
            self.emit(CallEvent::StatusChanged { status });
        }
    }

    fn running(&self) -> Result<Arc<PeerConnectionManager>, CallError> {
        self.peer_manager()
            .ok_or_else(|| CallError::InvalidState(self.status()))
    }

    /// Start the call
    ///
    /// Acquires local media, joins the call on the relay and starts polling.
    /// An initiator offers to every participant already present and to every
    /// later joiner; otherwise the controller waits for offers.
    ///
    /// # Errors
    ///
    /// - `InvalidState` unless the status is idle or ended
    /// - `MediaAccessDenied` if capture is refused (status returns to idle)
    /// - `Signaling` if the relay rejects the join (status returns to idle)
    /// - `Cancelled` if `end_call` ran meanwhile; a join that had already
    ///   reached the relay is undone with a leave
    #[tracing::instrument(skip(self), fields(call_id = %self.call_id, participant = %self.local_participant()))]
    pub async fn start_call(self: &Arc<Self>, is_initiator: bool) -> Result<(), CallError> {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let token = CancellationToken::new();
        let manager = {
            let mut session = self.session.lock();
            let current = self.status();
            if !matches!(current, CallStatus::Idle | CallStatus::Ended) || session.is_some() {
                return Err(CallError::InvalidState(current));
            }

            let manager = Arc::new(PeerConnectionManager::new(
                self.call_id.clone(),
                Arc::clone(&self.signaling),
                Arc::clone(&self.backend),
                self.config.peer.clone(),
            ));
            *session = Some(ActiveSession {
                epoch,
                initiator: is_initiator,
                manager: Arc::clone(&manager),
                token: token.clone(),
            });
            self.ending.store(false, Ordering::Release);
            self.reached_connected.store(false, Ordering::Release);
            self.participants.write().clear();
            self.workers.lock().clear();
            self.set_status(CallStatus::Connecting);
            manager
        };

        tokio::spawn(run_peer_events(
            Arc::downgrade(self),
            manager.subscribe(),
            token.clone(),
        ));

        tracing::info!("Starting call");
        let initialized = tokio::select! {
            biased;
            () = token.cancelled() => return Err(CallError::Cancelled),
            result = manager.initialize(&self.config.media) => result,
        };
        if let Err(e) = initialized {
            let error = match e {
                PeerError::MediaAccessDenied(msg) => CallError::MediaAccessDenied(msg),
                other => CallError::Peer(other),
            };
            self.abort_start(epoch, error.clone(), false).await;
            return Err(error);
        }

        if token.is_cancelled() {
            return Err(CallError::Cancelled);
        }

        // Not raced against the token: a join already on the wire still lands
        // on the relay, so it must complete before it can be undone.
        let joined = self
            .signaling
            .join(&self.call_id, self.config.display_name.as_deref())
            .await;
        let join_timestamp = match joined {
            Ok(ts) => ts,
            Err(e) => {
                let error = CallError::Signaling(e);
                self.abort_start(epoch, error.clone(), false).await;
                return Err(error);
            }
        };
        if token.is_cancelled() {
            self.leave_cancelled(epoch).await;
            return Err(CallError::Cancelled);
        }

        let fetched = tokio::select! {
            biased;
            () = token.cancelled() => {
                self.leave_cancelled(epoch).await;
                return Err(CallError::Cancelled);
            }
            result = self.signaling.fetch(&self.call_id, None) => result,
        };
        let snapshot = match fetched {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let error = CallError::Signaling(e);
                self.abort_start(epoch, error.clone(), true).await;
                return Err(error);
            }
        };

        let cursor = self
            .apply_initial_snapshot(&manager, &token, is_initiator, snapshot, join_timestamp)
            .await;

        tokio::spawn(run_poll_loop(
            Arc::downgrade(self),
            Arc::clone(&self.signaling),
            self.call_id.clone(),
            cursor,
            self.config.poll_interval,
            token.clone(),
        ));

        if token.is_cancelled() {
            self.leave_cancelled(epoch).await;
            return Err(CallError::Cancelled);
        }
        tracing::info!(
            participants = self.participants.read().len(),
            initiator = is_initiator,
            "Call started"
        );
        Ok(())
    }

    async fn abort_start(&self, epoch: u64, error: CallError, joined: bool) {
        let session = {
            let mut session = self.session.lock();
            match session.as_ref() {
                Some(active) if active.epoch == epoch => session.take(),
                _ => None,
            }
        };
        let Some(session) = session else { return };

        tracing::warn!(call_id = %self.call_id, error = %error, "Call start failed");
        session.token.cancel();
        session.manager.cleanup().await;
        if joined {
            if let Err(e) = self.signaling.leave(&self.call_id).await {
                tracing::warn!(error = %e, "Failed to leave call on relay");
            }
        }
        self.set_status(CallStatus::Idle);
        self.emit(CallEvent::Error {
            participant: None,
            error,
        });
    }

    /// Undo a join that completed after `end_call` took the session
    ///
    /// Skipped when a newer `start_call` owns the membership by now.
    async fn leave_cancelled(&self, epoch: u64) {
        if self.epoch.load(Ordering::Acquire) != epoch {
            return;
        }
        tracing::debug!(call_id = %self.call_id, "Start cancelled after join, leaving");
        if let Err(e) = self.signaling.leave(&self.call_id).await {
            tracing::warn!(error = %e, "Failed to leave call on relay");
        }
    }

    async fn apply_initial_snapshot(
        self: &Arc<Self>,
        manager: &Arc<PeerConnectionManager>,
        token: &CancellationToken,
        initiator: bool,
        snapshot: CallSnapshot,
        join_timestamp: Option<i64>,
    ) -> Option<i64> {
        let me = self.local_participant().clone();
        let mut names: HashMap<ParticipantId, String> = HashMap::new();
        for message in &snapshot.messages {
            if let Some(name) = message.display_name() {
                names.insert(message.from_participant.clone(), name);
            }
        }

        for id in snapshot.participants.iter().filter(|p| **p != me) {
            self.add_participant(manager, token, initiator, id, names.get(id).cloned());
        }

        match join_timestamp {
            Some(joined_at) => {
                let backlog: Vec<_> = snapshot
                    .messages
                    .into_iter()
                    .filter(|m| m.timestamp > joined_at)
                    .collect();
                let cursor = backlog.last().map_or(joined_at, |m| m.timestamp);
                self.apply_messages(manager, token, initiator, backlog).await;
                Some(cursor)
            }
            None => snapshot.cursor(),
        }
    }

    fn add_participant(
        self: &Arc<Self>,
        manager: &Arc<PeerConnectionManager>,
        token: &CancellationToken,
        initiator: bool,
        id: &ParticipantId,
        display_name: Option<String>,
    ) {
        let participant = {
            let mut participants = self.participants.write();
            // end_call raises the flag before clearing under this lock
            if self.ending.load(Ordering::Acquire) || participants.contains_key(id) {
                return;
            }
            let participant = Participant::new(id.clone(), display_name);
            participants.insert(id.clone(), participant.clone());
            participant
        };

        tracing::info!(call_id = %self.call_id, participant = %id, "Participant joined");
        self.emit(CallEvent::ParticipantJoined { participant });
        if initiator {
            self.dispatch(manager, token, id, WorkerCommand::Offer);
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        manager: &Arc<PeerConnectionManager>,
        token: &CancellationToken,
        participant: &ParticipantId,
        command: WorkerCommand,
    ) {
        if token.is_cancelled() {
            return;
        }
        let mut workers = self.workers.lock();
        let worker = workers.entry(participant.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let worker_token = token.child_token();
            tokio::spawn(run_participant_worker(
                Arc::downgrade(self),
                Arc::clone(manager),
                participant.clone(),
                rx,
                worker_token.clone(),
            ));
            Worker {
                tx,
                token: worker_token,
            }
        });
        if worker.tx.send(command).is_err() {
            tracing::debug!(participant = %participant, "Worker gone, command dropped");
        }
    }

    async fn apply_messages(
        self: &Arc<Self>,
        manager: &Arc<PeerConnectionManager>,
        token: &CancellationToken,
        initiator: bool,
        messages: Vec<SignalingMessage>,
    ) {
        let me = self.local_participant().clone();
        for message in messages {
            let from = message.from_participant.clone();
            if from == me {
                continue;
            }
            match message.kind {
                SignalingKind::Join => {
                    let name = message.display_name();
                    self.add_participant(manager, token, initiator, &from, name);
                }
                SignalingKind::Leave => self.participant_left(manager, &from).await,
                SignalingKind::Offer | SignalingKind::Answer | SignalingKind::IceCandidate => {
                    if !self.participants.read().contains_key(&from) {
                        self.add_participant(manager, token, false, &from, None);
                    }
                    self.dispatch(manager, token, &from, WorkerCommand::Signal(message));
                }
            }
        }
    }

    async fn apply_snapshot(self: &Arc<Self>, snapshot: CallSnapshot) {
        let Some((manager, token, initiator)) = self
            .session
            .lock()
            .as_ref()
            .map(|s| (Arc::clone(&s.manager), s.token.clone(), s.initiator))
        else {
            return;
        };
        self.apply_messages(&manager, &token, initiator, snapshot.messages)
            .await;
    }

    async fn participant_left(self: &Arc<Self>, manager: &PeerConnectionManager, id: &ParticipantId) {
        let worker = self.workers.lock().remove(id);
        if let Some(worker) = worker {
            worker.token.cancel();
        }
        let removed = self.participants.write().remove(id);
        if removed.is_none() {
            return;
        }

        match manager.remove_participant(id).await {
            Ok(()) | Err(PeerError::UnknownParticipant(_)) | Err(PeerError::ManagerClosed) => {}
            Err(e) => tracing::debug!(participant = %id, error = %e, "Removing connection failed"),
        }
        if self.ending.load(Ordering::Acquire) {
            return;
        }

        tracing::info!(call_id = %self.call_id, participant = %id, "Participant left");
        self.emit(CallEvent::ParticipantLeft {
            participant: id.clone(),
        });
        self.check_all_lost();
    }

    fn on_peer_event(self: &Arc<Self>, event: PeerEvent) {
        if self.ending.load(Ordering::Acquire) {
            return;
        }
        match event {
            PeerEvent::ConnectionStateChanged { participant, state } => {
                if let Some(p) = self.participants.write().get_mut(&participant) {
                    p.connection_state = state;
                }
                if state == ConnectionState::Connected {
                    self.reached_connected.store(true, Ordering::Release);
                    if self.status() == CallStatus::Connecting {
                        self.set_status(CallStatus::Connected);
                    }
                }
                if !state.is_alive() {
                    self.check_all_lost();
                }
            }
            PeerEvent::StreamReceived { participant, stream } => {
                if let Some(p) = self.participants.write().get_mut(&participant) {
                    p.stream = Some(stream.clone());
                }
                self.emit(CallEvent::StreamReceived {
                    participant,
                    stream,
                });
            }
            PeerEvent::StreamRemoved {
                participant,
                stream_id,
            } => {
                if let Some(p) = self.participants.write().get_mut(&participant) {
                    p.stream = None;
                }
                self.emit(CallEvent::StreamRemoved {
                    participant,
                    stream_id,
                });
            }
            PeerEvent::QualityChanged {
                participant,
                quality,
                ..
            } => {
                if let Some(p) = self.participants.write().get_mut(&participant) {
                    p.quality = Some(quality);
                }
                self.emit(CallEvent::QualityChanged {
                    participant,
                    quality,
                });
            }
            PeerEvent::Error { participant, error } => {
                self.emit(CallEvent::Error {
                    participant,
                    error: CallError::Peer(error),
                });
            }
        }
    }

    fn check_all_lost(self: &Arc<Self>) {
        if !self.reached_connected.load(Ordering::Acquire) || self.ending.load(Ordering::Acquire) {
            return;
        }
        let all_lost = self
            .participants
            .read()
            .values()
            .all(|p| !p.connection_state.is_alive());
        if !all_lost {
            return;
        }

        tracing::info!(call_id = %self.call_id, "All participants lost, ending call");
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.end_call().await {
                tracing::warn!(error = %e, "Automatic call end failed");
            }
        });
    }

    fn report(&self, participant: Option<ParticipantId>, error: CallError) {
        if self.ending.load(Ordering::Acquire) {
            return;
        }
        tracing::warn!(call_id = %self.call_id, participant = ?participant, error = %error, "Call error");
        self.emit(CallEvent::Error { participant, error });
    }

    /// End the call
    ///
    /// The first call tears everything down and emits `CallEnded`; later calls,
    /// and calls on a controller that never started, do nothing.
    ///
    /// # Errors
    ///
    /// Never fails; the relay leave is best-effort
    #[tracing::instrument(skip(self), fields(call_id = %self.call_id))]
    pub async fn end_call(&self) -> Result<(), CallError> {
        if self
            .ending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Call already ending");
            return Ok(());
        }
        let Some(session) = self.session.lock().take() else {
            tracing::debug!("No call to end");
            return Ok(());
        };

        session.token.cancel();
        for (_, worker) in self.workers.lock().drain() {
            worker.token.cancel();
        }
        session.manager.cleanup().await;

        if let Err(e) = self.signaling.leave(&self.call_id).await {
            tracing::warn!(error = %e, "Failed to leave call on relay");
        }

        self.participants.write().clear();
        self.set_status(CallStatus::Ended);
        self.emit(CallEvent::CallEnded);
        tracing::info!("Call ended");
        Ok(())
    }

    /// Mute or unmute the microphone
    ///
    /// # Errors
    ///
    /// Returns error if no call is running
    pub fn toggle_audio(&self, enabled: bool) -> Result<(), CallError> {
        self.running()?.toggle_audio(enabled)?;
        Ok(())
    }

    /// Turn the camera on or off
    ///
    /// # Errors
    ///
    /// Returns error if no call is running
    pub fn toggle_video(&self, enabled: bool) -> Result<(), CallError> {
        self.running()?.toggle_video(enabled)?;
        Ok(())
    }

    /// Share the screen in place of the camera
    ///
    /// # Errors
    ///
    /// Returns `ScreenCaptureDenied` (the camera keeps sending) or `InvalidState`
    pub async fn start_screen_share(&self) -> Result<(), CallError> {
        self.running()?.start_screen_share().await?;
        Ok(())
    }

    /// Stop sharing the screen
    ///
    /// # Errors
    ///
    /// Returns error if no call is running
    pub async fn stop_screen_share(&self) -> Result<(), CallError> {
        self.running()?.stop_screen_share().await?;
        Ok(())
    }
}

impl Drop for CallController {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.token.cancel();
        }
    }
}

async fn connect_and_offer(manager: &PeerConnectionManager, participant: &ParticipantId) -> Result<(), PeerError> {
    match manager.create_connection(participant).await {
        Ok(()) | Err(PeerError::ConnectionExists(_)) => {}
        Err(e) => return Err(e),
    }
    manager.create_offer(participant).await.map(|_| ())
}

async fn run_participant_worker(
    controller: Weak<CallController>,
    manager: Arc<PeerConnectionManager>,
    participant: ParticipantId,
    mut rx: mpsc::UnboundedReceiver<WorkerCommand>,
    token: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            () = token.cancelled() => break,
            command = rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        let result = tokio::select! {
            () = token.cancelled() => break,
            result = async {
                match command {
                    WorkerCommand::Offer => connect_and_offer(&manager, &participant).await,
                    WorkerCommand::Signal(message) => manager.handle_signal(&message).await,
                }
            } => result,
        };

        if let Err(e) = result {
            let Some(controller) = controller.upgrade() else { break };
            controller.report(Some(participant.clone()), e.into());
        }
    }
    tracing::trace!(participant = %participant, "Participant worker stopped");
}

async fn run_peer_events(
    controller: Weak<CallController>,
    mut rx: broadcast::Receiver<PeerEvent>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = token.cancelled() => break,
            event = rx.recv() => event,
        };
        match event {
            Ok(event) => {
                let Some(controller) = controller.upgrade() else { break };
                controller.on_peer_event(event);
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Peer events lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn run_poll_loop(
    controller: Weak<CallController>,
    signaling: Arc<SignalingHandler>,
    call_id: CallId,
    mut cursor: Option<i64>,
    period: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let result = tokio::select! {
            () = token.cancelled() => break,
            result = signaling.poll(&call_id, cursor) => result,
        };
        let Some(controller) = controller.upgrade() else { break };

        match result {
            Ok(snapshot) => {
                if let Some(latest) = snapshot.cursor() {
                    cursor = Some(latest);
                }
                controller.apply_snapshot(snapshot).await;
            }
            Err(SignalingError::CallNotFound(id)) => {
                tracing::warn!(call_id = %id, "Call vanished from relay, ending");
                controller.report(None, CallError::Signaling(SignalingError::CallNotFound(id)));
                if let Err(e) = controller.end_call().await {
                    tracing::warn!(error = %e, "Ending vanished call failed");
                }
                break;
            }
            Err(e) => controller.report(None, CallError::Signaling(e)),
        }
    }
    tracing::debug!("Signaling poll loop stopped");
}
