//! Meshcall - group audio/video calls over peer-to-peer connections
//!
//! This library provides the moving parts of a mesh call:
//!
//! - **Call Registry**: relay-side, in-memory directory of calls, their
//!   participants and the signaling log, with per-call serialization
//! - **Peer Connection Manager**: one negotiated connection per remote
//!   participant, screen-share track substitution and quality sampling
//! - **Call Controller**: start/end, mute and screen share on top of both
//!
//! Media capture and the peer-connection stack sit behind the
//! [`MediaBackend`] / [`PeerLink`] traits. [`LoopbackBackend`] is an
//! in-process implementation for tests and demos.
//!
//! # Examples
//!
//! ```rust,no_run
//! use meshcall_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let registry = Arc::new(CallRegistry::default());
//! let call_id = CallId::parse("standup")?;
//! let me = ParticipantId::parse("alice")?;
//!
//! let channel = Arc::new(LocalRelayChannel::new(registry, me));
//! let controller = Arc::new(CallController::new(
//!     call_id,
//!     channel,
//!     Arc::new(LoopbackBackend::new()),
//!     CallConfig::default(),
//! ));
//!
//! controller.start_call(true).await?;
//! controller.toggle_video(false)?;
//! controller.end_call().await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Core call types and data structures
pub mod types;

/// Call and participant identifiers
pub mod identity;

/// Time source for the registry
pub mod clock;

/// Signaling protocol and client channel
pub mod signaling;

/// In-memory call registry
pub mod registry;

/// Local and remote media handles
pub mod media;

/// Media and peer-connection capability traits
pub mod backend;

/// In-process backend
pub mod loopback;

/// Peer connection orchestration
pub mod peer;

/// Call session control
pub mod call;

// Re-export main types at crate root
pub use backend::{
    LinkConfig, LinkError, LinkEvent, LinkEventSink, LinkStats, MediaBackend, PeerLink, SenderId,
};
pub use call::{CallConfig, CallController, CallError, CallEvent, Participant};
pub use clock::{Clock, ManualClock, SystemClock};
pub use identity::{CallId, IdError, ParticipantId, MAX_ID_LENGTH};
pub use loopback::{LoopbackBackend, LoopbackLink};
pub use media::{LocalMedia, LocalTrack, MediaError, RemoteStream, RemoteTrack};
pub use peer::{PeerConnectionManager, PeerError, PeerEvent, PeerManagerConfig};
pub use registry::{CallRegistry, Delivery, RegistryConfig, RegistryError};
pub use signaling::{
    CallSnapshot, LocalRelayChannel, OutboundSignal, SignalingChannel, SignalingError,
    SignalingHandler, SignalingKind, SignalingMessage,
};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::{MediaBackend, PeerLink};
    pub use crate::call::{CallConfig, CallController, CallError, CallEvent};
    pub use crate::identity::{CallId, ParticipantId};
    pub use crate::loopback::LoopbackBackend;
    pub use crate::peer::{PeerConnectionManager, PeerEvent, PeerManagerConfig};
    pub use crate::registry::{CallRegistry, RegistryConfig};
    pub use crate::signaling::{LocalRelayChannel, SignalingChannel, SignalingHandler, SignalingMessage};
    pub use crate::types::{CallStatus, ConnectionState, MediaConstraints, QualityLevel};
}
