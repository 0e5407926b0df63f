//! Identity and guild records.
//!
//! Both are GUID-identified rows owned by the security manager's store. An
//! identity names a person or role that applications get bound to through
//! identity certificates; a guild is a named group that applications join
//! through membership certificates. The `authority` on each record is the
//! public key of the security manager that administers it — two managers can
//! use the same GUID without colliding.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::key::PublicKey;

/// A GUID-identified identity administered by a security manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityInfo {
    /// Public key of the administering security manager.
    pub authority: PublicKey,
    /// Stable identifier of this identity.
    pub guid: Uuid,
    /// Human-readable name.
    pub name: String,
}

impl IdentityInfo {
    /// Creates an identity record with a fresh GUID.
    pub fn new(authority: PublicKey, name: impl Into<String>) -> Self {
        Self {
            authority,
            guid: Uuid::new_v4(),
            name: name.into(),
        }
    }
}

/// A named group of applications, identified by (authority, GUID).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildInfo {
    /// Public key of the administering security manager.
    pub authority: PublicKey,
    /// Stable identifier of this guild.
    pub guid: Uuid,
    /// Human-readable name.
    pub name: String,
    /// Free-form description.
    pub description: String,
}

impl GuildInfo {
    /// Creates a guild record with a fresh GUID.
    pub fn new(
        authority: PublicKey,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            authority,
            guid: Uuid::new_v4(),
            name: name.into(),
            description: description.into(),
        }
    }
}
