//! # Warden
//!
//! A bus security manager: it takes ownership of ("claims") remote
//! applications reachable over a message-bus RPC transport, establishes
//! itself as their root of trust, and from then on manages their identity
//! certificates, guild memberships, and permission policies.
//!
//! The crate is the orchestration layer of the workspace:
//!
//! - [`proxy`] - `PermissionProxy`, the typed RPC client for the remote
//!   permission-management interface
//! - [`broker`] - `ProxyObjectManager`, which brokers short-lived secured
//!   sessions per call and enforces the get/release pairing
//! - [`manager`] - `SecurityManager`, the claiming/configuration
//!   orchestrator, persisting through `warden-store` and notifying
//!   registered application listeners
//! - [`codec`] - wire encode/decode for every tagged argument shape
//! - [`config`] - manager configuration
//!
//! The transport itself is behind `warden_bus::BusAttachment`; tests drive
//! the whole stack against an in-process mock peer.

pub mod broker;
pub mod codec;
pub mod config;
pub mod listener;
pub mod manager;
pub mod proxy;
pub mod testing;

pub use broker::ProxyObjectManager;
pub use config::SecurityManagerConfig;
pub use listener::ApplicationListener;
pub use manager::SecurityManager;
pub use proxy::PermissionProxy;

use warden_bus::BusError;

/// Errors surfaced by security-manager operations.
///
/// The taxonomy callers care about:
/// - [`Error::PermissionDenied`] — the peer's policy refused the call;
///   normalized from both wire spellings, distinct from transport failure.
/// - [`Error::Bus`] — transport/protocol failure, propagated unchanged.
///   Connectivity problems surface as `Bus(Connection)` or
///   `Bus(SessionLost)`.
/// - [`Error::AlreadyClaimed`] / [`Error::InvalidState`] — detected locally,
///   before any RPC is issued where possible.
/// - [`Error::ManifestRejected`] /
///   [`Error::ManifestRejectedPeerClaimed`] — the claim asymmetry: the
///   administrator rejected the peer's manifest after the peer already
///   applied the claim. The manager attempts a compensating reset; when even
///   that fails, the second variant tells the caller the peer may still
///   believe it is claimed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The remote peer's policy refused the operation.
    #[error("permission denied by peer")]
    PermissionDenied,

    /// Transport or protocol failure, unchanged from the bus layer.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Model-level failure (state machine, crypto, certificates).
    #[error(transparent)]
    Model(#[from] warden_model::Error),

    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] warden_store::StoreError),

    /// The operation does not apply in the current local state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Claim attempted against an application this manager already claimed.
    #[error("application is already claimed")]
    AlreadyClaimed,

    /// The administrator rejected the peer's manifest; a compensating reset
    /// restored the peer to its unclaimed state. Nothing was persisted.
    #[error("manifest rejected by administrator")]
    ManifestRejected,

    /// The administrator rejected the manifest after the peer applied the
    /// claim, and the compensating reset failed too: the peer may consider
    /// itself claimed while this manager persisted nothing.
    #[error("manifest rejected, and compensating reset failed: {reset_error}")]
    ManifestRejectedPeerClaimed {
        /// Why the compensating reset failed.
        reset_error: String,
    },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
