//! Persistent store for the warden security manager.
//!
//! The manager's view of the world — which applications it has claimed,
//! their certificates, manifests, and policies, plus the identities and
//! guilds it administers — must survive restarts. This crate provides the
//! [`Store`] seam and its SQLite implementation, [`SqliteStore`].
//!
//! # Durability contract
//!
//! A crash between a successful remote RPC and local persistence must be
//! *detectable*, not assumed away: mutating flows raise the application's
//! `updates_pending` flag before issuing the RPC and clear it when the
//! result is persisted. [`Store::applications_pending_reconciliation`] lists
//! the rows whose flag survived a restart, so the caller can reconcile
//! against the peer.
//!
//! Removing a claimed application cascades to its identity and membership
//! certificates — the schema enforces this with foreign keys, so there is no
//! window where certificates outlive their application row.

mod sqlite;

pub use sqlite::SqliteStore;

use warden_model::{
    GuildInfo, IdentityCertificate, IdentityInfo, Manifest, MembershipCertificate,
    PermissionPolicy, PublicKey,
};

use uuid::Uuid;

/// Errors produced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A row exists and the caller did not ask to overwrite it.
    #[error("record already exists: {0}")]
    AlreadyExists(String),

    /// Persisted blob could not be decoded back into its model type.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// One row of the claimed-applications catalog.
///
/// Presence of a row means the application is claimed by this manager; the
/// claim state machine's unclaimed states never touch the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedApplication {
    /// Durable identity of the application.
    pub public_key: PublicKey,
    /// Name the application announces for itself.
    pub app_name: String,
    /// Name of the device hosting the application.
    pub device_name: String,
    /// Name assigned by the administrator.
    pub user_defined_name: String,
    /// The manifest accepted at claim time.
    pub manifest: Option<Manifest>,
    /// The policy most recently installed on the peer.
    pub policy: Option<PermissionPolicy>,
    /// True while a mutating RPC against this application has not been
    /// reconciled with local state.
    pub updates_pending: bool,
}

/// The persistence seam.
///
/// Implementations must be safe to call from multiple threads; all methods
/// are synchronous read-modify-write operations against local storage.
pub trait Store: Send + Sync {
    /// Persists a guild. With `update` false, an existing (authority, guid)
    /// row is an error.
    fn store_guild(&self, guild: &GuildInfo, update: bool) -> Result<()>;

    /// Fetches one guild.
    fn guild(&self, authority: &PublicKey, guid: Uuid) -> Result<Option<GuildInfo>>;

    /// Lists every guild administered by `authority`.
    fn guilds(&self, authority: &PublicKey) -> Result<Vec<GuildInfo>>;

    /// Removes a guild.
    fn remove_guild(&self, authority: &PublicKey, guid: Uuid) -> Result<()>;

    /// Persists an identity. With `update` false, an existing row is an
    /// error.
    fn store_identity(&self, identity: &IdentityInfo, update: bool) -> Result<()>;

    /// Fetches one identity.
    fn identity(&self, authority: &PublicKey, guid: Uuid) -> Result<Option<IdentityInfo>>;

    /// Lists every identity administered by `authority`.
    fn identities(&self, authority: &PublicKey) -> Result<Vec<IdentityInfo>>;

    /// Removes an identity.
    fn remove_identity(&self, authority: &PublicKey, guid: Uuid) -> Result<()>;

    /// Inserts or replaces a claimed application.
    fn store_application(&self, app: &ClaimedApplication) -> Result<()>;

    /// Fetches a claimed application by public key.
    fn application(&self, public_key: &PublicKey) -> Result<Option<ClaimedApplication>>;

    /// Lists every claimed application.
    fn applications(&self) -> Result<Vec<ClaimedApplication>>;

    /// Removes a claimed application and, transitively, its certificates.
    fn remove_application(&self, public_key: &PublicKey) -> Result<()>;

    /// Raises or clears the reconciliation flag.
    fn set_updates_pending(&self, public_key: &PublicKey, pending: bool) -> Result<()>;

    /// Applications whose `updates_pending` flag is still raised.
    fn applications_pending_reconciliation(&self) -> Result<Vec<ClaimedApplication>>;

    /// Persists the identity certificate of a claimed application
    /// (one per application; replaces any previous one).
    fn store_identity_certificate(&self, cert: &IdentityCertificate) -> Result<()>;

    /// Fetches the identity certificate of a claimed application.
    fn identity_certificate(&self, public_key: &PublicKey)
        -> Result<Option<IdentityCertificate>>;

    /// Persists a membership certificate.
    fn store_membership_certificate(&self, cert: &MembershipCertificate) -> Result<()>;

    /// Lists the membership certificates of a claimed application.
    fn membership_certificates(
        &self,
        public_key: &PublicKey,
    ) -> Result<Vec<MembershipCertificate>>;

    /// Removes one membership certificate by (application, guild).
    fn remove_membership_certificate(&self, public_key: &PublicKey, guild: Uuid) -> Result<()>;

    /// Returns the next value of the monotonic serial-number counter.
    fn next_serial_number(&self) -> Result<u64>;
}
