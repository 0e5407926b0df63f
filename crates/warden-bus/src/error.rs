//! Bus error taxonomy and permission-denied normalization.
//!
//! A remote peer refuses an operation in one of two wire shapes, for
//! historical reasons: a reply carrying the dedicated error name, or a reply
//! carrying the generic error name with a well-known message string. Both
//! mean the same thing — the peer's policy refused the call — and callers
//! must be able to treat them as one condition, distinct from transport or
//! protocol failure. [`BusError::is_permission_denied`] is the single place
//! that knows both spellings.

use crate::attachment::SessionId;

/// Dedicated error name a peer uses to refuse an operation.
pub const ERROR_NAME_PERMISSION_DENIED: &str = "net.warden.Bus.PermissionDenied";

/// Generic error name; refusal is then spelled out in the message.
pub const ERROR_NAME_GENERIC: &str = "net.warden.Bus.Error";

/// The message that marks a generic error reply as a refusal.
pub const ERROR_MESSAGE_PERMISSION_DENIED: &str = "permission denied";

/// Errors surfaced by the bus transport.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BusError {
    /// Could not reach the peer: the process is gone, the address is stale,
    /// or session establishment failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The method call exceeded the transport's call timeout.
    #[error("method call timed out")]
    Timeout,

    /// The session carrying the call was torn down.
    #[error("session {0} lost")]
    SessionLost(SessionId),

    /// The peer answered with an error reply.
    #[error("error reply {name}: {message}")]
    ErrorReply {
        /// Wire error name.
        name: String,
        /// Wire error message.
        message: String,
    },

    /// The reply arrived but its arguments did not have the expected shape.
    #[error("malformed reply: {0}")]
    Decode(String),

    /// The peer does not implement the requested member.
    #[error("not implemented: {0}")]
    NotImplemented(String),
}

impl BusError {
    /// True when this error is a peer-policy refusal, in either of the two
    /// wire spellings. Any other name/message combination is not a refusal.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            BusError::ErrorReply { name, message } => {
                name == ERROR_NAME_PERMISSION_DENIED
                    || (name == ERROR_NAME_GENERIC && message == ERROR_MESSAGE_PERMISSION_DENIED)
            }
            _ => false,
        }
    }

    /// Shorthand for constructing an error reply.
    pub fn error_reply(name: impl Into<String>, message: impl Into<String>) -> Self {
        BusError::ErrorReply {
            name: name.into(),
            message: message.into(),
        }
    }

    /// The dedicated permission-denied reply, as a peer would send it.
    pub fn permission_denied_reply() -> Self {
        Self::error_reply(ERROR_NAME_PERMISSION_DENIED, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedicated_name_is_permission_denied() {
        let err = BusError::error_reply(ERROR_NAME_PERMISSION_DENIED, "anything at all");
        assert!(err.is_permission_denied());
    }

    #[test]
    fn test_generic_name_with_known_message_is_permission_denied() {
        let err = BusError::error_reply(ERROR_NAME_GENERIC, ERROR_MESSAGE_PERMISSION_DENIED);
        assert!(err.is_permission_denied());
    }

    #[test]
    fn test_other_combinations_are_not_permission_denied() {
        for (name, message) in [
            (ERROR_NAME_GENERIC, "some other failure"),
            (ERROR_NAME_GENERIC, ""),
            ("net.warden.Bus.Unrelated", ERROR_MESSAGE_PERMISSION_DENIED),
            ("net.warden.Bus.Unrelated", "permission denied, kind of"),
        ] {
            let err = BusError::error_reply(name, message);
            assert!(!err.is_permission_denied(), "{name}/{message}");
        }
    }

    #[test]
    fn test_transport_errors_are_not_permission_denied() {
        assert!(!BusError::Timeout.is_permission_denied());
        assert!(!BusError::Connection("gone".to_string()).is_permission_denied());
        assert!(!BusError::SessionLost(SessionId(3)).is_permission_denied());
    }
}
