//! Permission policies, rules, and manifests.
//!
//! A [`PermissionPolicy`] is the authoritative, installable rule set that
//! governs which remote callers may touch which interface members. A
//! [`Manifest`] is the application's self-declared template of the rules it
//! is willing to expose; it only becomes meaningful once signed and bound to
//! a specific identity certificate's thumbprint, so a manifest accepted for
//! one identity cannot be replayed against another.

use serde::{Deserialize, Serialize};

use crate::certificate::IdentityCertificate;
use crate::key::{PublicKey, SigningKey};
use crate::{Error, Result};

/// Action bits a rule grants on a member.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberAction(pub u8);

impl MemberAction {
    /// The member may be provided (announced/served) by the application.
    pub const PROVIDE: u8 = 0x01;
    /// The member may be observed (read, subscribed to).
    pub const OBSERVE: u8 = 0x02;
    /// The member may be modified (called, written).
    pub const MODIFY: u8 = 0x04;

    /// All three action bits.
    pub fn full() -> Self {
        Self(Self::PROVIDE | Self::OBSERVE | Self::MODIFY)
    }

    /// True when every bit of `mask` is granted.
    pub fn allows(self, mask: u8) -> bool {
        self.0 & mask == mask
    }
}

/// Kind of interface member a rule entry names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberKind {
    /// Matches any member kind.
    #[default]
    Any,
    /// A callable method.
    Method,
    /// A broadcast signal.
    Signal,
    /// A property.
    Property,
}

impl MemberKind {
    /// Wire byte for this kind.
    pub fn to_wire(self) -> u8 {
        match self {
            MemberKind::Any => 0,
            MemberKind::Method => 1,
            MemberKind::Signal => 2,
            MemberKind::Property => 3,
        }
    }

    /// Decodes a wire byte; unknown values fail closed.
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(MemberKind::Any),
            1 => Some(MemberKind::Method),
            2 => Some(MemberKind::Signal),
            3 => Some(MemberKind::Property),
            _ => None,
        }
    }
}

/// One member entry inside a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Member name; `*` matches all members.
    pub name: String,
    /// Kind of member this entry applies to.
    pub kind: MemberKind,
    /// Granted actions.
    pub action: MemberAction,
}

impl Member {
    /// Shorthand for a member entry of any kind.
    pub fn any(name: impl Into<String>, action: MemberAction) -> Self {
        Self {
            name: name.into(),
            kind: MemberKind::Any,
            action,
        }
    }
}

/// An interface-scoped rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Object path the rule applies to; `*` matches all.
    pub object_path: String,
    /// Interface name the rule applies to.
    pub interface_name: String,
    /// Member entries.
    pub members: Vec<Member>,
}

impl Rule {
    /// A rule covering every object path of `interface_name`.
    pub fn for_interface(interface_name: impl Into<String>, members: Vec<Member>) -> Self {
        Self {
            object_path: "*".to_string(),
            interface_name: interface_name.into(),
            members,
        }
    }
}

/// A versioned, installable permission policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionPolicy {
    /// Monotonically increasing instance number; a peer replaces its policy
    /// only with one carrying a higher serial.
    pub serial: u32,
    /// The rule set.
    pub rules: Vec<Rule>,
}

impl PermissionPolicy {
    /// Export-format version tag carried alongside the policy on the wire.
    pub const SPEC_VERSION: u8 = 1;

    /// Creates a policy with the given serial and rules.
    pub fn new(serial: u32, rules: Vec<Rule>) -> Self {
        Self { serial, rules }
    }
}

/// An application's self-declared rule template. Legally empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Template rules.
    pub rules: Vec<Rule>,
}

impl Manifest {
    /// Creates a manifest from rules.
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Signs this manifest, binding it to the identity certificate whose
    /// thumbprint is given.
    ///
    /// The caller is responsible for ensuring `key` is the signing key that
    /// issued the referenced certificate; this operation does not re-verify
    /// that relationship.
    pub fn sign(&self, subject_thumbprint: &[u8], key: &SigningKey) -> Result<SignedManifest> {
        let payload = signing_payload(subject_thumbprint, &self.rules)?;
        let signature = key.sign(&payload)?;
        Ok(SignedManifest {
            rules: self.rules.clone(),
            subject_thumbprint: subject_thumbprint.to_vec(),
            signature,
        })
    }

    /// Computes the thumbprint of `certificate` and signs this manifest
    /// bound to it. The certificate must already be signed, so its encoding
    /// (and therefore its thumbprint) is final.
    pub fn compute_thumbprint_and_sign(
        &self,
        certificate: &IdentityCertificate,
        key: &SigningKey,
    ) -> Result<SignedManifest> {
        self.sign(&certificate.thumbprint(), key)
    }
}

/// A manifest bound to an identity certificate and signed by its issuer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedManifest {
    /// The template rules.
    pub rules: Vec<Rule>,
    /// Thumbprint of the identity certificate this manifest is bound to.
    pub subject_thumbprint: Vec<u8>,
    /// Issuer signature over (thumbprint, rules).
    pub signature: Vec<u8>,
}

impl SignedManifest {
    /// Verifies this manifest against the certificate it claims to be bound
    /// to and the issuer's public key.
    ///
    /// Fails when the thumbprint does not match `certificate` (the manifest
    /// was bound to a different identity) or the signature does not verify.
    pub fn verify(&self, certificate: &IdentityCertificate, issuer: &PublicKey) -> Result<()> {
        if self.subject_thumbprint != certificate.thumbprint() {
            return Err(Error::VerificationFailed(
                "manifest is bound to a different identity certificate".to_string(),
            ));
        }
        let payload = signing_payload(&self.subject_thumbprint, &self.rules)?;
        issuer.verify(&payload, &self.signature)
    }
}

/// Canonical signing payload: a stable serde encoding of the binding.
fn signing_payload(thumbprint: &[u8], rules: &[Rule]) -> Result<Vec<u8>> {
    #[derive(Serialize)]
    struct Payload<'a> {
        thumbprint: &'a [u8],
        rules: &'a [Rule],
    }
    serde_json::to_vec(&Payload { thumbprint, rules })
        .map_err(|e| Error::Signing(format!("manifest encoding failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::IdentityCertificate;
    use crate::key::SigningKey;
    use uuid::Uuid;

    fn sample_rules() -> Vec<Rule> {
        vec![Rule::for_interface(
            "net.warden.Door",
            vec![
                Member::any("Open", MemberAction(MemberAction::MODIFY)),
                Member::any("State", MemberAction(MemberAction::OBSERVE)),
            ],
        )]
    }

    fn issue_cert(issuer: &SigningKey, subject: &SigningKey) -> IdentityCertificate {
        IdentityCertificate::issue(
            issuer,
            subject.public_key(),
            Uuid::new_v4(),
            1,
            chrono::Utc::now() + chrono::Duration::days(365),
        )
        .unwrap()
    }

    #[test]
    fn test_manifest_binds_to_certificate() {
        let issuer = SigningKey::generate().unwrap();
        let subject = SigningKey::generate().unwrap();
        let cert = issue_cert(&issuer, &subject);

        let manifest = Manifest::new(sample_rules());
        let signed = manifest
            .compute_thumbprint_and_sign(&cert, &issuer)
            .unwrap();
        signed.verify(&cert, issuer.public_key()).unwrap();
    }

    #[test]
    fn test_manifest_rejected_against_other_certificate() {
        let issuer = SigningKey::generate().unwrap();
        let subject = SigningKey::generate().unwrap();
        let cert = issue_cert(&issuer, &subject);
        let other_cert = issue_cert(&issuer, &SigningKey::generate().unwrap());

        let signed = Manifest::new(sample_rules())
            .compute_thumbprint_and_sign(&cert, &issuer)
            .unwrap();
        assert!(signed.verify(&other_cert, issuer.public_key()).is_err());
    }

    #[test]
    fn test_tampered_rules_fail_verification() {
        let issuer = SigningKey::generate().unwrap();
        let subject = SigningKey::generate().unwrap();
        let cert = issue_cert(&issuer, &subject);

        let mut signed = Manifest::new(sample_rules())
            .compute_thumbprint_and_sign(&cert, &issuer)
            .unwrap();
        signed.rules[0].members[0].action = MemberAction::full();
        assert!(signed.verify(&cert, issuer.public_key()).is_err());
    }

    #[test]
    fn test_empty_manifest_signs_and_verifies() {
        let issuer = SigningKey::generate().unwrap();
        let subject = SigningKey::generate().unwrap();
        let cert = issue_cert(&issuer, &subject);

        let signed = Manifest::default()
            .compute_thumbprint_and_sign(&cert, &issuer)
            .unwrap();
        signed.verify(&cert, issuer.public_key()).unwrap();
    }

    #[test]
    fn test_member_action_mask() {
        let action = MemberAction(MemberAction::OBSERVE | MemberAction::MODIFY);
        assert!(action.allows(MemberAction::OBSERVE));
        assert!(!action.allows(MemberAction::PROVIDE));
        assert!(MemberAction::full().allows(MemberAction::PROVIDE));
    }

    #[test]
    fn test_member_kind_wire_roundtrip() {
        for kind in [
            MemberKind::Any,
            MemberKind::Method,
            MemberKind::Signal,
            MemberKind::Property,
        ] {
            assert_eq!(MemberKind::from_wire(kind.to_wire()), Some(kind));
        }
        assert_eq!(MemberKind::from_wire(9), None);
    }
}
