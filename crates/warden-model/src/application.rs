//! Remote application descriptors.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::key::PublicKey;
use crate::state::ApplicationState;

/// Whether the application's process is currently reachable on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunningState {
    /// The application announced itself and answers on its bus address.
    Running,
    /// The application's process is gone; only persisted state remains.
    NotRunning,
    /// Never observed live (e.g. loaded from the store after a restart).
    Unknown,
}

/// Everything the security manager knows about one remote application.
///
/// The public key is the durable primary key: it survives restarts, renames,
/// and transport reconnects. The bus address is whatever the application
/// most recently announced and is useful only for routing — it must never be
/// used to decide whether two descriptors refer to the same application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationInfo {
    /// Stable identity of the application.
    pub public_key: PublicKey,
    /// Current (ephemeral, untrusted) bus address.
    pub bus_address: String,
    /// Claim lifecycle state.
    pub claim_state: ApplicationState,
    /// Process liveness as last observed.
    pub running_state: RunningState,
    /// Name the application announces for itself.
    pub app_name: String,
    /// Name of the device hosting the application.
    pub device_name: String,
    /// Name assigned by the administrator, if any.
    pub user_defined_name: String,
    /// GUIDs of the identities this manager trusts as roots for the
    /// application (populated once claimed).
    pub trust_anchors: Vec<Uuid>,
}

impl ApplicationInfo {
    /// Creates a descriptor for a newly discovered application.
    pub fn discovered(
        public_key: PublicKey,
        bus_address: impl Into<String>,
        claim_state: ApplicationState,
    ) -> Self {
        Self {
            public_key,
            bus_address: bus_address.into(),
            claim_state,
            running_state: RunningState::Running,
            app_name: String::new(),
            device_name: String::new(),
            user_defined_name: String::new(),
            trust_anchors: Vec::new(),
        }
    }

    /// True when the peer currently accepts claim requests.
    pub fn is_claimable(&self) -> bool {
        self.claim_state == ApplicationState::Claimable
    }

    /// Identity comparison: public key only, by design.
    pub fn same_application(&self, other: &ApplicationInfo) -> bool {
        self.public_key == other.public_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::SigningKey;

    #[test]
    fn test_identity_ignores_bus_address() {
        let key = *SigningKey::generate().unwrap().public_key();
        let a = ApplicationInfo::discovered(key, ":1.7", ApplicationState::Claimable);
        let mut b = a.clone();
        b.bus_address = "totally-different".to_string();
        assert!(a.same_application(&b));

        let other_key = *SigningKey::generate().unwrap().public_key();
        let c = ApplicationInfo::discovered(other_key, ":1.7", ApplicationState::Claimable);
        assert!(!a.same_application(&c));
    }

    #[test]
    fn test_discovered_defaults() {
        let key = *SigningKey::generate().unwrap().public_key();
        let app = ApplicationInfo::discovered(key, ":1.9", ApplicationState::NotClaimable);
        assert_eq!(app.running_state, RunningState::Running);
        assert!(!app.is_claimable());
        assert!(app.trust_anchors.is_empty());
    }
}
