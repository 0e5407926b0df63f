//! Transport-adapter boundary for the warden security manager.
//!
//! The message bus itself — serialization, routing, discovery — is an
//! external collaborator. This crate defines the seam the rest of the
//! workspace talks through:
//!
//! - [`wire`] - `WireValue`, the typed discriminated union bus arguments are
//!   decoded into exactly once, at the proxy boundary
//! - [`attachment`] - the `BusAttachment` trait: secured sessions, method
//!   calls, property reads, and session-lost events
//! - [`error`] - `BusError` and the permission-denied normalization rules
//! - [`credentials`] - credential types and the pluggable listener traits
//! - [`dispatch`] - `ProtectedListenerDispatch`, the refcounted indirection
//!   that makes listener hot-swap safe while requests are in flight

pub mod attachment;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod wire;

pub use attachment::{AuthMechanism, BusAttachment, SessionEvent, SessionId};
pub use credentials::{
    CompletionToken, CredentialListener, CredentialQuery, CredentialReply, Credentials,
    NotSupported,
};
pub use dispatch::ProtectedListenerDispatch;
pub use error::BusError;
pub use wire::WireValue;
