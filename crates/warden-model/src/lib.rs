//! Data model for the warden bus security manager.
//!
//! This crate defines the types that flow between the security manager, the
//! bus transport adapter, and the persistent store:
//!
//! - [`state`] - Application claim-state machine and claim capabilities
//! - [`key`] - ECC P-256 public keys, key info, and the signing capability
//! - [`application`] - Remote application descriptors
//! - [`identity`] - Identity and guild records
//! - [`policy`] - Permission policies, rules, and manifests
//! - [`certificate`] - Identity and membership certificates
//!
//! The cryptographic primitives themselves (ECDSA, X.509 encode/decode) are
//! consumed from `ring`, `rcgen`, and `x509_parser` — this crate wraps them
//! behind domain types and never reimplements them.

pub mod application;
pub mod certificate;
pub mod identity;
pub mod key;
pub mod policy;
pub mod state;

pub use application::{ApplicationInfo, RunningState};
pub use certificate::{CertificateEncoding, IdentityCertificate, MembershipCertificate};
pub use identity::{GuildInfo, IdentityInfo};
pub use key::{KeyInfo, PublicKey, SigningKey, COORDINATE_LEN};
pub use policy::{Manifest, Member, MemberAction, MemberKind, PermissionPolicy, Rule, SignedManifest};
pub use state::{ApplicationState, ClaimCapabilities, ClaimCapabilityInfo};

/// Errors produced by model-level operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An application-state transition the state machine forbids.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: state::ApplicationState,
        to: state::ApplicationState,
    },

    /// Malformed key material (wrong length, bad point encoding, ...).
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// Certificate generation, parsing, or validation failed.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Manifest or policy signature did not verify.
    #[error("signature verification failed: {0}")]
    VerificationFailed(String),

    /// Signing-key loading or signing failed.
    #[error("signing error: {0}")]
    Signing(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
