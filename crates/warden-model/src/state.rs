//! The application claim-state machine.
//!
//! Every remote application is in exactly one of four claim states. The two
//! unclaimed states are reported by the peer itself; the claimed states are
//! only ever entered through an authenticated RPC exchange. The one rule the
//! server enforces unconditionally: once an application is CLAIMED it can
//! never be moved back to CLAIMABLE — the only way out is a full reset, which
//! removes the application rather than downgrading it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Claim lifecycle state of a remote application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApplicationState {
    /// Unclaimed, and not accepting claim requests.
    NotClaimable,
    /// Unclaimed, accepting claim requests.
    Claimable,
    /// Claimed; can be configured by its security manager.
    Claimed,
    /// Claimed, but requires a configuration refresh (typically after a
    /// software upgrade on the peer).
    NeedUpdate,
}

impl ApplicationState {
    /// Validates a transition from `self` to `to`.
    ///
    /// The forbidden edges:
    /// - `Claimed -> Claimable` and `NeedUpdate -> Claimable`: a claimed
    ///   application never becomes claimable again.
    /// - `NeedUpdate -> NotClaimable`: the update flow resolves back to
    ///   `Claimed`, never to an unclaimed state.
    /// - `NotClaimable`/`Claimable` -> `NeedUpdate`: only a claimed
    ///   application can be pending an update.
    pub fn transition(self, to: ApplicationState) -> Result<ApplicationState> {
        use ApplicationState::*;
        let allowed = match (self, to) {
            // The peer may toggle its claim window while unclaimed.
            (NotClaimable, NotClaimable | Claimable | Claimed) => true,
            (Claimable, NotClaimable | Claimable | Claimed) => true,
            // Claimed stays claimed, or flags a pending update.
            (Claimed, Claimed | NeedUpdate) => true,
            // An update resolves back to claimed, or stays pending.
            (NeedUpdate, NeedUpdate | Claimed) => true,
            _ => false,
        };
        if allowed {
            Ok(to)
        } else {
            Err(Error::InvalidTransition { from: self, to })
        }
    }

    /// True for the two unclaimed states.
    pub fn is_unclaimed(self) -> bool {
        matches!(
            self,
            ApplicationState::NotClaimable | ApplicationState::Claimable
        )
    }

    /// Decodes the wire byte used by the permission-management interface.
    pub fn from_wire(value: u8) -> Option<ApplicationState> {
        match value {
            0 => Some(ApplicationState::NotClaimable),
            1 => Some(ApplicationState::Claimable),
            2 => Some(ApplicationState::Claimed),
            3 => Some(ApplicationState::NeedUpdate),
            _ => None,
        }
    }

    /// Encodes the wire byte used by the permission-management interface.
    pub fn to_wire(self) -> u8 {
        match self {
            ApplicationState::NotClaimable => 0,
            ApplicationState::Claimable => 1,
            ApplicationState::Claimed => 2,
            ApplicationState::NeedUpdate => 3,
        }
    }
}

impl fmt::Display for ApplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ApplicationState::NotClaimable => "not claimable",
            ApplicationState::Claimable => "claimable",
            ApplicationState::Claimed => "claimed",
            ApplicationState::NeedUpdate => "need update",
        };
        f.write_str(text)
    }
}

/// Key-exchange mechanisms an application accepts during claiming. Bit mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimCapabilities(pub u16);

impl ClaimCapabilities {
    /// Anonymous key exchange; acceptable only while unclaimed.
    pub const ECDHE_NULL: u16 = 0x01;
    /// Pre-shared key exchange. Deprecated; kept for wire compatibility.
    pub const ECDHE_PSK: u16 = 0x02;
    /// Certificate-based key exchange.
    pub const ECDHE_ECDSA: u16 = 0x04;
    /// Password-authenticated key exchange.
    pub const ECDHE_SPEKE: u16 = 0x08;

    /// Default capability set advertised by unconfigured applications.
    pub const DEFAULT: ClaimCapabilities =
        ClaimCapabilities(Self::ECDHE_NULL | Self::ECDHE_PSK | Self::ECDHE_SPEKE);

    /// True when `mask` is fully contained in this set.
    pub fn supports(self, mask: u16) -> bool {
        self.0 & mask == mask
    }

    /// True when no mechanism is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl Default for ClaimCapabilities {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Additional information qualifying the claim capabilities. Bit mask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimCapabilityInfo(pub u16);

impl ClaimCapabilityInfo {
    /// The PSK or password is generated by the security manager.
    pub const PSK_GENERATED_BY_SECURITY_MANAGER: u16 = 0x01;
    /// The PSK or password is generated by the application.
    pub const PSK_GENERATED_BY_APPLICATION: u16 = 0x02;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claimed_never_returns_to_claimable() {
        let err = ApplicationState::Claimed
            .transition(ApplicationState::Claimable)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: ApplicationState::Claimed,
                to: ApplicationState::Claimable,
            }
        ));

        assert!(ApplicationState::NeedUpdate
            .transition(ApplicationState::Claimable)
            .is_err());
    }

    #[test]
    fn test_claim_window_toggles_while_unclaimed() {
        assert!(ApplicationState::NotClaimable
            .transition(ApplicationState::Claimable)
            .is_ok());
        assert!(ApplicationState::Claimable
            .transition(ApplicationState::NotClaimable)
            .is_ok());
    }

    #[test]
    fn test_claim_and_update_cycle() {
        let claimed = ApplicationState::Claimable
            .transition(ApplicationState::Claimed)
            .unwrap();
        let pending = claimed.transition(ApplicationState::NeedUpdate).unwrap();
        assert_eq!(
            pending.transition(ApplicationState::Claimed).unwrap(),
            ApplicationState::Claimed
        );
    }

    #[test]
    fn test_need_update_cannot_unclaim() {
        assert!(ApplicationState::NeedUpdate
            .transition(ApplicationState::NotClaimable)
            .is_err());
    }

    #[test]
    fn test_unclaimed_cannot_be_pending_update() {
        assert!(ApplicationState::Claimable
            .transition(ApplicationState::NeedUpdate)
            .is_err());
        assert!(ApplicationState::NotClaimable
            .transition(ApplicationState::NeedUpdate)
            .is_err());
    }

    #[test]
    fn test_wire_roundtrip() {
        for state in [
            ApplicationState::NotClaimable,
            ApplicationState::Claimable,
            ApplicationState::Claimed,
            ApplicationState::NeedUpdate,
        ] {
            assert_eq!(ApplicationState::from_wire(state.to_wire()), Some(state));
        }
        assert_eq!(ApplicationState::from_wire(17), None);
    }

    #[test]
    fn test_default_claim_capabilities() {
        let caps = ClaimCapabilities::default();
        assert!(caps.supports(ClaimCapabilities::ECDHE_NULL));
        assert!(caps.supports(ClaimCapabilities::ECDHE_SPEKE));
        assert!(!caps.supports(ClaimCapabilities::ECDHE_ECDSA));
    }
}
