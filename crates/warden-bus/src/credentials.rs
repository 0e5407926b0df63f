//! Credential types and the pluggable listener traits.
//!
//! During session setup the transport needs credentials — a password, a
//! pre-shared key, or a certificate chain — and it gets them from an
//! application-supplied listener. A listener answers in one of two styles:
//!
//! - **immediate**: [`CredentialListener::request_credentials`] returns the
//!   reply directly;
//! - **deferred**: [`CredentialListener::request_credentials_deferred`]
//!   accepts a [`CompletionToken`] and resolves it later (e.g. after asking
//!   a human), from any task or thread.
//!
//! The deferred variants default to [`NotSupported`], so simple listeners
//! only implement the immediate ones. The dispatch layer
//! ([`crate::dispatch`]) always tries deferred first and falls back.

use std::sync::Weak;

use crate::attachment::AuthMechanism;
use crate::error::BusError;

/// Marker error: the listener does not implement the deferred variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotSupported;

/// Credential slots a listener can fill. Which ones the mechanism needs is
/// carried in [`CredentialQuery::requested`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Password or passcode (SPEKE).
    pub password: Option<String>,
    /// Pre-shared key bytes (PSK).
    pub pre_shared_key: Option<Vec<u8>>,
    /// PEM certificate chain (ECDSA).
    pub certificate_chain: Option<String>,
    /// PEM private key matching the chain's leaf (ECDSA).
    pub private_key: Option<String>,
}

impl Credentials {
    /// Bit requesting a password.
    pub const PASSWORD: u16 = 0x01;
    /// Bit requesting a pre-shared key.
    pub const PRE_SHARED_KEY: u16 = 0x02;
    /// Bit requesting a certificate chain.
    pub const CERTIFICATE_CHAIN: u16 = 0x04;
    /// Bit requesting a private key.
    pub const PRIVATE_KEY: u16 = 0x08;
}

/// One credential request from the transport.
#[derive(Debug, Clone)]
pub struct CredentialQuery {
    /// Mechanism being negotiated.
    pub mechanism: AuthMechanism,
    /// Bus address of the peer being authenticated.
    pub peer: String,
    /// How many times this authentication has been attempted already.
    pub attempt: u16,
    /// User name hint, when the mechanism carries one.
    pub user_name: Option<String>,
    /// Mask of [`Credentials`] bits the mechanism needs.
    pub requested: u16,
}

/// A listener's answer to a credential request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialReply {
    /// Proceed with these credentials.
    Granted(Credentials),
    /// Refuse the authentication attempt.
    Rejected,
}

impl CredentialReply {
    /// True for [`CredentialReply::Granted`].
    pub fn is_granted(&self) -> bool {
        matches!(self, CredentialReply::Granted(_))
    }
}

/// Application-supplied credential handler.
///
/// Implementations may be swapped or removed while requests are in flight;
/// the dispatch layer guarantees no request ever observes a half-installed
/// listener.
pub trait CredentialListener: Send + Sync {
    /// Immediate variant: answer now.
    fn request_credentials(&self, query: &CredentialQuery) -> CredentialReply {
        let _ = query;
        CredentialReply::Rejected
    }

    /// Deferred variant: stash `token` and resolve it later via
    /// [`CompletionToken::complete`]. Return `Err(NotSupported)` (the
    /// default) to have the dispatch fall back to the immediate variant.
    fn request_credentials_deferred(
        &self,
        query: &CredentialQuery,
        token: CompletionToken,
    ) -> Result<(), NotSupported> {
        let _ = (query, token);
        Err(NotSupported)
    }

    /// Immediate verification of peer-supplied credentials (e.g. the peer's
    /// certificate chain during ECDSA exchange).
    fn verify_credentials(&self, peer: &str, credentials: &Credentials) -> bool {
        let _ = (peer, credentials);
        false
    }

    /// Deferred verification; same contract as
    /// [`Self::request_credentials_deferred`].
    fn verify_credentials_deferred(
        &self,
        peer: &str,
        credentials: &Credentials,
        token: CompletionToken,
    ) -> Result<(), NotSupported> {
        let _ = (peer, credentials, token);
        Err(NotSupported)
    }

    /// Notification: an authentication attempt finished.
    fn authentication_complete(&self, mechanism: AuthMechanism, peer: &str, success: bool) {
        let _ = (mechanism, peer, success);
    }

    /// Notification: the transport observed a security violation.
    fn security_violation(&self, error: &BusError) {
        let _ = error;
    }
}

/// Token identifying one outstanding deferred request.
///
/// The token carries a handle back to the dispatch registry that issued it —
/// there is no process-wide tracker. Completing a token that has already
/// timed out, been completed, or been torn down returns `false`.
#[derive(Debug)]
pub struct CompletionToken {
    pub(crate) id: u64,
    pub(crate) registry: Weak<crate::dispatch::PendingRegistry>,
}

impl CompletionToken {
    /// Resolves the request. Returns `false` when the request is no longer
    /// pending (timed out, already completed, or listener removed).
    pub fn complete(self, reply: CredentialReply) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.complete(self.id, reply),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DefaultListener;
    impl CredentialListener for DefaultListener {}

    #[test]
    fn test_default_listener_rejects() {
        let listener = DefaultListener;
        let query = CredentialQuery {
            mechanism: AuthMechanism::EcdheNull,
            peer: ":1.5".to_string(),
            attempt: 1,
            user_name: None,
            requested: 0,
        };
        assert_eq!(listener.request_credentials(&query), CredentialReply::Rejected);
        assert!(!listener.verify_credentials(":1.5", &Credentials::default()));
    }

    #[test]
    fn test_orphan_token_completion_is_false() {
        let token = CompletionToken {
            id: 1,
            registry: Weak::new(),
        };
        assert!(!token.complete(CredentialReply::Rejected));
    }

    #[test]
    fn test_reply_is_granted() {
        assert!(CredentialReply::Granted(Credentials::default()).is_granted());
        assert!(!CredentialReply::Rejected.is_granted());
    }
}
