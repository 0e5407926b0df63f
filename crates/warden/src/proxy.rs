//! Typed RPC client for the remote permission-management interface.
//!
//! One [`PermissionProxy`] is bound to one secured session obtained from the
//! [`broker`](crate::broker). Every operation follows the same shape:
//! construct the typed wire arguments, invoke the remote member, and on an
//! error reply test whether it denotes a policy refusal — both wire
//! spellings normalize to [`Error::PermissionDenied`], anything else
//! propagates as the raw transport error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::error;
use uuid::Uuid;

use warden_bus::{BusError, SessionId, WireValue};
use warden_model::{
    ApplicationState, CertificateEncoding, IdentityCertificate, KeyInfo, MembershipCertificate,
    PermissionPolicy, PublicKey, Rule,
};

use crate::broker::BrokerCore;
use crate::codec;
use crate::{Error, Result};

/// Member names of the permission-management interface.
pub mod members {
    pub const CLAIM: &str = "Claim";
    pub const INSTALL_POLICY: &str = "InstallPolicy";
    pub const GET_POLICY: &str = "GetPolicy";
    pub const REMOVE_POLICY: &str = "RemovePolicy";
    pub const INSTALL_MEMBERSHIP: &str = "InstallMembership";
    pub const INSTALL_MEMBERSHIP_AUTH_DATA: &str = "InstallMembershipAuthData";
    pub const REMOVE_MEMBERSHIP: &str = "RemoveMembership";
    pub const INSTALL_IDENTITY: &str = "InstallIdentity";
    pub const GET_IDENTITY: &str = "GetIdentity";
    pub const GET_MANIFEST: &str = "GetManifest";
    pub const GET_PUBLIC_KEY: &str = "GetPublicKey";
    pub const RESET: &str = "Reset";
    pub const VERSION_PROPERTY: &str = "Version";
    pub const APPLICATION_STATE_PROPERTY: &str = "ApplicationState";
}

/// A remote-object handle bound to one secured session.
///
/// Obtained from [`crate::ProxyObjectManager::get_proxy_object`] and given
/// back through [`crate::ProxyObjectManager::release_proxy_object`]; that
/// pairing is a hard contract. Dropping an unreleased proxy is a bug in the
/// caller and is logged as such.
pub struct PermissionProxy {
    core: Arc<BrokerCore>,
    session: SessionId,
    released: AtomicBool,
}

impl std::fmt::Debug for PermissionProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionProxy")
            .field("session", &self.session)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl PermissionProxy {
    pub(crate) fn bind(core: Arc<BrokerCore>, session: SessionId) -> Self {
        Self {
            core,
            session,
            released: AtomicBool::new(false),
        }
    }

    /// The session this proxy is bound to.
    pub fn session(&self) -> SessionId {
        self.session
    }

    pub(crate) fn mark_released(&self) {
        self.released.store(true, Ordering::Release);
    }

    fn ensure_alive(&self) -> Result<()> {
        let sessions = self.core.sessions.lock();
        match sessions.get(&self.session.0) {
            Some(entry) if !entry.lost => Ok(()),
            _ => Err(Error::Bus(BusError::SessionLost(self.session))),
        }
    }

    /// Invokes `member` over this proxy's session, normalizing
    /// permission-denied replies. A proxy whose session was lost fails
    /// immediately instead of waiting out the transport timeout.
    pub(crate) async fn raw_call(
        &self,
        member: &str,
        args: Vec<WireValue>,
    ) -> Result<Vec<WireValue>> {
        self.ensure_alive()?;
        match self
            .core
            .bus
            .method_call(
                self.session,
                &self.core.object_path,
                &self.core.interface,
                member,
                args,
            )
            .await
        {
            Ok(reply) => Ok(reply),
            Err(err) if err.is_permission_denied() => Err(Error::PermissionDenied),
            Err(err) => Err(Error::Bus(err)),
        }
    }

    async fn raw_property(&self, property: &str) -> Result<WireValue> {
        self.ensure_alive()?;
        match self
            .core
            .bus
            .get_property(self.session, &self.core.interface, property)
            .await
        {
            Ok(value) => Ok(value),
            Err(err) if err.is_permission_denied() => Err(Error::PermissionDenied),
            Err(err) => Err(Error::Bus(err)),
        }
    }

    /// The first trust-establishing call.
    ///
    /// Installs this manager as the peer's certificate authority, names the
    /// administrative group, delivers the identity certificate chain
    /// (leaf first; an empty chain is legal and encodes as a zero-length
    /// sequence) and the manifest rule set (also legally empty).
    ///
    /// Key ids missing from either key info are generated in place before
    /// encoding.
    pub async fn claim(
        &self,
        certificate_authority: &mut KeyInfo,
        admin_group_guid: Uuid,
        admin_group_key: &mut KeyInfo,
        identity_chain: &[IdentityCertificate],
        manifest_rules: &[Rule],
    ) -> Result<()> {
        certificate_authority.key_id_or_generate();
        admin_group_key.key_id_or_generate();

        let args = vec![
            codec::encode_public_key(certificate_authority),
            codec::encode_key_id(certificate_authority),
            WireValue::Bytes(admin_group_guid.as_bytes().to_vec()),
            codec::encode_public_key(admin_group_key),
            codec::encode_key_id(admin_group_key),
            codec::encode_identity_chain(identity_chain),
            codec::encode_rules(manifest_rules),
        ];
        self.raw_call(members::CLAIM, args).await?;
        Ok(())
    }

    /// Installs a policy on the peer.
    pub async fn install_policy(&self, policy: &PermissionPolicy) -> Result<()> {
        self.raw_call(members::INSTALL_POLICY, vec![codec::encode_policy(policy)])
            .await?;
        Ok(())
    }

    /// Fetches the peer's installed policy.
    pub async fn get_policy(&self) -> Result<PermissionPolicy> {
        let reply = self.raw_call(members::GET_POLICY, vec![]).await?;
        let value = reply
            .first()
            .ok_or_else(|| BusError::Decode("empty GetPolicy reply".to_string()))?;
        Ok(codec::decode_policy(value)?)
    }

    /// Removes the peer's installed policy.
    pub async fn remove_policy(&self) -> Result<()> {
        self.raw_call(members::REMOVE_POLICY, vec![]).await?;
        Ok(())
    }

    /// Installs a membership certificate chain, leaf first.
    pub async fn install_membership(&self, chain: &[MembershipCertificate]) -> Result<()> {
        self.raw_call(
            members::INSTALL_MEMBERSHIP,
            vec![codec::encode_membership_chain(chain)],
        )
        .await?;
        Ok(())
    }

    /// Installs authorization data for a membership, addressed by serial
    /// number and issuer key id — not by certificate content.
    pub async fn install_membership_auth_data(
        &self,
        serial: u64,
        issuer_key_id: &[u8],
        authorization: &PermissionPolicy,
    ) -> Result<()> {
        let args = vec![
            WireValue::Str(serial.to_string()),
            WireValue::Bytes(issuer_key_id.to_vec()),
            codec::encode_policy(authorization),
        ];
        self.raw_call(members::INSTALL_MEMBERSHIP_AUTH_DATA, args)
            .await?;
        Ok(())
    }

    /// Removes a membership, addressed by serial number and issuer key id.
    pub async fn remove_membership(&self, serial: u64, issuer_key_id: &[u8]) -> Result<()> {
        let args = vec![
            WireValue::Str(serial.to_string()),
            WireValue::Bytes(issuer_key_id.to_vec()),
        ];
        self.raw_call(members::REMOVE_MEMBERSHIP, args).await?;
        Ok(())
    }

    /// Installs an identity certificate on the peer.
    pub async fn install_identity(
        &self,
        encoding: CertificateEncoding,
        certificate: &IdentityCertificate,
    ) -> Result<()> {
        self.raw_call(
            members::INSTALL_IDENTITY,
            vec![codec::encode_certificate_blob(
                encoding,
                &certificate.encode(encoding),
            )],
        )
        .await?;
        Ok(())
    }

    /// Fetches the peer's installed identity certificate.
    ///
    /// The reply is tagged with its encoding; an encoding this
    /// implementation does not recognize surfaces as
    /// [`BusError::NotImplemented`] rather than a guess.
    pub async fn get_identity(&self) -> Result<IdentityCertificate> {
        let reply = self.raw_call(members::GET_IDENTITY, vec![]).await?;
        let value = reply
            .first()
            .ok_or_else(|| BusError::Decode("empty GetIdentity reply".to_string()))?;
        let (encoding, bytes) = codec::decode_certificate_blob(value)?;
        Ok(IdentityCertificate::decode(encoding, bytes)?)
    }

    /// Fetches the peer's declared manifest.
    ///
    /// The returned rules are owned by the caller — this getter hands over
    /// a freshly decoded rule set rather than a view into proxy state.
    pub async fn get_manifest(&self) -> Result<Vec<Rule>> {
        let reply = self.raw_call(members::GET_MANIFEST, vec![]).await?;
        let value = reply
            .first()
            .ok_or_else(|| BusError::Decode("empty GetManifest reply".to_string()))?;
        let fields = value.expect_struct(2).map_err(Error::Bus)?;
        let _manifest_type = fields[0].expect_byte().map_err(Error::Bus)?;
        let rules = fields[1].expect_variant().map_err(Error::Bus)?;
        Ok(codec::decode_rules(rules)?)
    }

    /// Fetches and validates the peer's public key. Every tag in the nested
    /// reply is checked; any mismatch fails the decode.
    pub async fn get_public_key(&self) -> Result<PublicKey> {
        let reply = self.raw_call(members::GET_PUBLIC_KEY, vec![]).await?;
        let value = reply
            .first()
            .ok_or_else(|| BusError::Decode("empty GetPublicKey reply".to_string()))?;
        Ok(codec::decode_public_key(value)?)
    }

    /// Clears the peer's manifest, trust anchors, certificates, and policy.
    pub async fn reset(&self) -> Result<()> {
        self.raw_call(members::RESET, vec![]).await?;
        Ok(())
    }

    /// The peer's interface version.
    pub async fn version(&self) -> Result<u16> {
        let value = self.raw_property(members::VERSION_PROPERTY).await?;
        Ok(value.expect_u16().map_err(Error::Bus)?)
    }

    /// The peer's claim state, or `Ok(None)` when the peer does not support
    /// state introspection — distinct from a transport failure.
    pub async fn application_state(&self) -> Result<Option<ApplicationState>> {
        match self.raw_property(members::APPLICATION_STATE_PROPERTY).await {
            Ok(value) => {
                let tag = value.expect_byte().map_err(Error::Bus)?;
                let state = ApplicationState::from_wire(tag).ok_or_else(|| {
                    Error::Bus(BusError::Decode(format!("unknown application state {tag}")))
                })?;
                Ok(Some(state))
            }
            Err(Error::Bus(BusError::NotImplemented(_))) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl Drop for PermissionProxy {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) {
            // The get/release pairing is a hard contract; a leak here means
            // a session stays open at the transport until its own timeout.
            error!(session = %self.session, "proxy dropped without release");
        }
    }
}
