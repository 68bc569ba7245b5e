//! Meshcall relay - HTTP signaling endpoint and client
//!
//! The relay exposes a [`CallRegistry`] over HTTP so that clients on different
//! machines can find each other and exchange offers, answers and ICE
//! candidates. [`HttpSignalingChannel`] is the matching client side for a
//! [`CallController`](meshcall_core::CallController).
//!
//! # Examples
//!
//! ```rust,no_run
//! use meshcall_relay::{auth::TrustedHeaderResolver, serve, RelayConfig};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let shutdown = CancellationToken::new();
//! serve(
//!     RelayConfig::default(),
//!     Arc::new(TrustedHeaderResolver::default()),
//!     shutdown,
//! )
//! .await?;
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
#![allow(clippy::module_name_repetitions)]

/// HTTP endpoint
pub mod api;

/// Caller identification
pub mod auth;

/// HTTP signaling client
pub mod client;

/// Relay configuration
pub mod config;

pub use api::{router, ApiError, AppState};
pub use auth::{BearerTokenResolver, IdentityResolver, TrustedHeaderResolver};
pub use client::{ClientAuth, HttpSignalingChannel};
pub use config::RelayConfig;

use meshcall_core::CallRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Relay server errors
#[derive(Error, Debug)]
pub enum RelayError {
    /// Listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: SocketAddr,
        /// Underlying error
        source: std::io::Error,
    },

    /// Server stopped with an I/O error
    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Bind `config.bind_addr` and serve until `shutdown` fires
///
/// Also runs the registry sweeper for the lifetime of the server.
///
/// # Errors
///
/// Returns error if binding or serving fails
pub async fn serve(
    config: RelayConfig,
    resolver: Arc<dyn IdentityResolver>,
    shutdown: CancellationToken,
) -> Result<(), RelayError> {
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .map_err(|source| RelayError::Bind {
            addr: config.bind_addr,
            source,
        })?;
    let registry = Arc::new(CallRegistry::new(config.registry));
    serve_with(listener, registry, resolver, shutdown).await
}

/// Serve on an already bound listener with a caller-provided registry
///
/// # Errors
///
/// Returns error if the server stops with an I/O error
pub async fn serve_with(
    listener: TcpListener,
    registry: Arc<CallRegistry>,
    resolver: Arc<dyn IdentityResolver>,
    shutdown: CancellationToken,
) -> Result<(), RelayError> {
    let local_addr = listener.local_addr()?;
    let sweeper = registry.spawn_sweeper(shutdown.child_token());
    let app = router(AppState::new(registry, resolver));

    tracing::info!(addr = %local_addr, "Signaling relay listening");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "Registry sweeper task failed");
    }
    tracing::info!("Signaling relay stopped");
    served.map_err(RelayError::from)
}
