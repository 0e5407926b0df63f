//! The `BusAttachment` seam.
//!
//! Everything the security manager needs from the transport: join and leave
//! secured sessions, invoke remote methods, read properties, and hear about
//! sessions dying underneath it. Real deployments back this with the actual
//! message-bus client; tests back it with an in-process mock peer.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::BusError;
use crate::wire::WireValue;

/// Transport-assigned identifier of one secured session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key-exchange mechanism a session is authenticated with.
///
/// Listed in increasing order of prior-trust requirements. `EcdheNull` is
/// only meaningful against an unclaimed peer — there is no trust to build on
/// yet, so the claim window is the one time anonymous key exchange is
/// acceptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMechanism {
    /// Anonymous ECDHE.
    EcdheNull,
    /// Pre-shared key. Deprecated; never selected for new sessions.
    EcdhePsk,
    /// Password-authenticated key exchange.
    EcdheSpeke,
    /// Certificate-based ECDHE.
    EcdheEcdsa,
}

impl AuthMechanism {
    /// The mechanism name as negotiated on the wire.
    pub fn name(self) -> &'static str {
        match self {
            AuthMechanism::EcdheNull => "ECDHE_NULL",
            AuthMechanism::EcdhePsk => "ECDHE_PSK",
            AuthMechanism::EcdheSpeke => "ECDHE_SPEKE",
            AuthMechanism::EcdheEcdsa => "ECDHE_ECDSA",
        }
    }
}

impl std::fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Asynchronous notifications from the transport.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A session died: peer gone, link dropped, or the peer left.
    SessionLost {
        /// The dead session.
        id: SessionId,
        /// Transport-provided reason text.
        reason: String,
    },
}

/// The transport seam.
///
/// Method calls block (await) the caller for the RPC round trip, bounded by
/// the transport's own call timeout. An error reply from the peer surfaces
/// as [`BusError::ErrorReply`] with the wire error name and message intact —
/// classification happens above this seam, not inside it.
#[async_trait]
pub trait BusAttachment: Send + Sync {
    /// Opens a secured session to `bus_address` authenticated with
    /// `mechanism`. Credential negotiation during setup flows through the
    /// attachment's registered credential listener.
    async fn join_session(
        &self,
        bus_address: &str,
        mechanism: AuthMechanism,
    ) -> Result<SessionId, BusError>;

    /// Closes a session. Closing an already-dead session is not an error.
    async fn leave_session(&self, session: SessionId) -> Result<(), BusError>;

    /// Invokes `interface.member` on the peer's object at `object_path`
    /// over `session` and returns the reply arguments.
    async fn method_call(
        &self,
        session: SessionId,
        object_path: &str,
        interface: &str,
        member: &str,
        args: Vec<WireValue>,
    ) -> Result<Vec<WireValue>, BusError>;

    /// Reads a property exposed by the peer.
    async fn get_property(
        &self,
        session: SessionId,
        interface: &str,
        property: &str,
    ) -> Result<WireValue, BusError>;

    /// Subscribes to session events. Every subscriber sees every event.
    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mechanism_names() {
        assert_eq!(AuthMechanism::EcdheNull.name(), "ECDHE_NULL");
        assert_eq!(AuthMechanism::EcdheEcdsa.to_string(), "ECDHE_ECDSA");
    }

    #[test]
    fn test_session_id_display() {
        assert_eq!(SessionId(17).to_string(), "17");
    }
}
