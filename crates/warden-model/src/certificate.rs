//! Identity and membership certificates.
//!
//! Both certificate kinds are ordinary X.509 certificates: the subject's
//! public key is the application's key, the common name carries the bound
//! GUID (identity or guild), and the issuer is a security manager's signing
//! key. Chains are ordered leaf first, root last; the root may be omitted
//! when the peer already trusts it.
//!
//! Generation goes through `rcgen`, parsing through `x509_parser` — the
//! X.509 machinery is consumed, never reimplemented. The certificate
//! thumbprint (SHA-256 over the DER encoding) is what manifests bind to.

use chrono::{DateTime, TimeZone, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyIdMethod,
    SerialNumber,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::key::{PublicKey, SigningKey, UNCOMPRESSED_POINT_LEN};
use crate::{Error, Result};

/// Wire tag describing how a certificate is encoded in a bus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CertificateEncoding {
    /// Raw DER bytes.
    Der,
    /// PEM-wrapped DER.
    Pem,
}

impl CertificateEncoding {
    /// Wire byte for this encoding.
    pub fn to_wire(self) -> u8 {
        match self {
            CertificateEncoding::Der => 0,
            CertificateEncoding::Pem => 1,
        }
    }

    /// Decodes a wire byte. Unknown tags return `None`; callers surface
    /// that as a not-implemented condition rather than guessing.
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(CertificateEncoding::Der),
            1 => Some(CertificateEncoding::Pem),
            _ => None,
        }
    }
}

/// What a certificate binds its subject to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    Identity,
    Membership,
}

impl Binding {
    fn organizational_unit(self) -> &'static str {
        match self {
            Binding::Identity => "identity",
            Binding::Membership => "membership",
        }
    }
}

/// An X.509 certificate binding an application's public key to an identity
/// GUID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityCertificate {
    der: Vec<u8>,
    subject_public_key: PublicKey,
    identity_guid: Uuid,
    serial: u64,
    issuer_key_id: Vec<u8>,
    not_after: DateTime<Utc>,
}

impl IdentityCertificate {
    /// Issues a certificate for `subject`, bound to `identity_guid`, signed
    /// by `issuer`.
    pub fn issue(
        issuer: &SigningKey,
        subject: &PublicKey,
        identity_guid: Uuid,
        serial: u64,
        not_after: DateTime<Utc>,
    ) -> Result<Self> {
        let der = issue_der(
            issuer,
            subject,
            &identity_guid.to_string(),
            Binding::Identity,
            serial,
            not_after,
        )?;
        Ok(Self {
            der,
            subject_public_key: *subject,
            identity_guid,
            serial,
            issuer_key_id: key_identifier(issuer.public_key()),
            not_after,
        })
    }

    /// Parses a received DER certificate.
    pub fn from_der(der: Vec<u8>) -> Result<Self> {
        let parsed = parse_metadata(&der, Binding::Identity)?;
        Ok(Self {
            der,
            subject_public_key: parsed.subject_public_key,
            identity_guid: parsed.guid,
            serial: parsed.serial,
            issuer_key_id: parsed.issuer_key_id,
            not_after: parsed.not_after,
        })
    }

    /// Parses a PEM-wrapped certificate.
    pub fn from_pem(text: &str) -> Result<Self> {
        Self::from_der(pem_to_der(text)?)
    }

    /// Decodes bytes tagged with a wire encoding.
    pub fn decode(encoding: CertificateEncoding, bytes: &[u8]) -> Result<Self> {
        match encoding {
            CertificateEncoding::Der => Self::from_der(bytes.to_vec()),
            CertificateEncoding::Pem => {
                let text = std::str::from_utf8(bytes).map_err(|_| {
                    Error::Certificate("PEM certificate is not valid UTF-8".to_string())
                })?;
                Self::from_pem(text)
            }
        }
    }

    /// The DER encoding.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// The PEM encoding.
    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new("CERTIFICATE", self.der.clone()))
    }

    /// Encodes for the wire under the given tag.
    pub fn encode(&self, encoding: CertificateEncoding) -> Vec<u8> {
        match encoding {
            CertificateEncoding::Der => self.der.clone(),
            CertificateEncoding::Pem => self.to_pem().into_bytes(),
        }
    }

    /// The subject's public key.
    pub fn subject_public_key(&self) -> &PublicKey {
        &self.subject_public_key
    }

    /// The bound identity GUID.
    pub fn identity_guid(&self) -> Uuid {
        self.identity_guid
    }

    /// The certificate serial number.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// The issuer's key identifier.
    pub fn issuer_key_id(&self) -> &[u8] {
        &self.issuer_key_id
    }

    /// Expiry time.
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// SHA-256 thumbprint of the DER encoding. Manifests bind to this.
    pub fn thumbprint(&self) -> Vec<u8> {
        Sha256::digest(&self.der).to_vec()
    }
}

/// An X.509 certificate proving an application's membership in a guild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipCertificate {
    der: Vec<u8>,
    subject_public_key: PublicKey,
    guild_guid: Uuid,
    serial: u64,
    issuer_key_id: Vec<u8>,
    not_after: DateTime<Utc>,
}

impl MembershipCertificate {
    /// Issues a membership certificate for `subject` in `guild_guid`.
    pub fn issue(
        issuer: &SigningKey,
        subject: &PublicKey,
        guild_guid: Uuid,
        serial: u64,
        not_after: DateTime<Utc>,
    ) -> Result<Self> {
        let der = issue_der(
            issuer,
            subject,
            &guild_guid.to_string(),
            Binding::Membership,
            serial,
            not_after,
        )?;
        Ok(Self {
            der,
            subject_public_key: *subject,
            guild_guid,
            serial,
            issuer_key_id: key_identifier(issuer.public_key()),
            not_after,
        })
    }

    /// Parses a received DER certificate.
    pub fn from_der(der: Vec<u8>) -> Result<Self> {
        let parsed = parse_metadata(&der, Binding::Membership)?;
        Ok(Self {
            der,
            subject_public_key: parsed.subject_public_key,
            guild_guid: parsed.guid,
            serial: parsed.serial,
            issuer_key_id: parsed.issuer_key_id,
            not_after: parsed.not_after,
        })
    }

    /// The DER encoding.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// The subject's public key.
    pub fn subject_public_key(&self) -> &PublicKey {
        &self.subject_public_key
    }

    /// The guild this certificate grants membership of.
    pub fn guild_guid(&self) -> Uuid {
        self.guild_guid
    }

    /// The certificate serial number. Together with the issuer key id this
    /// is how a membership is addressed for removal.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// The issuer's key identifier.
    pub fn issuer_key_id(&self) -> &[u8] {
        &self.issuer_key_id
    }

    /// Expiry time.
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// SHA-256 thumbprint of the DER encoding.
    pub fn thumbprint(&self) -> Vec<u8> {
        Sha256::digest(&self.der).to_vec()
    }
}

/// Deterministic key identifier: SHA-256 of the uncompressed point. The same
/// convention [`crate::key::KeyInfo::key_id_or_generate`] uses, so issuer key
/// ids derived locally and from certificate extensions agree.
pub fn key_identifier(key: &PublicKey) -> Vec<u8> {
    Sha256::digest(key.to_uncompressed()).to_vec()
}

/// Subject key material for rcgen when the subject is a foreign public key
/// (we issue for keys we do not hold the private half of).
struct SubjectPublicKey {
    point: [u8; UNCOMPRESSED_POINT_LEN],
}

impl rcgen::PublicKeyData for SubjectPublicKey {
    fn der_bytes(&self) -> &[u8] {
        &self.point
    }

    fn algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        &rcgen::PKCS_ECDSA_P256_SHA256
    }
}

fn rcgen_keypair(key: &SigningKey) -> Result<rcgen::KeyPair> {
    let pem = pem::encode(&pem::Pem::new("PRIVATE KEY", key.pkcs8_der().to_vec()));
    rcgen::KeyPair::from_pkcs8_pem_and_sign_algo(&pem, &rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| Error::Certificate(format!("failed to load issuer key: {e}")))
}

fn issue_der(
    issuer: &SigningKey,
    subject: &PublicKey,
    common_name: &str,
    binding: Binding,
    serial: u64,
    not_after: DateTime<Utc>,
) -> Result<Vec<u8>> {
    let issuer_keypair = rcgen_keypair(issuer)?;

    let mut ca_params = CertificateParams::new(Vec::<String>::new())
        .map_err(|e| Error::Certificate(format!("issuer params: {e}")))?;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_identifier_method =
        KeyIdMethod::PreSpecified(key_identifier(issuer.public_key()));
    let mut issuer_dn = DistinguishedName::new();
    issuer_dn.push(DnType::CommonName, "warden security manager");
    ca_params.distinguished_name = issuer_dn;
    let rc_issuer = rcgen::Issuer::from_params(&ca_params, &issuer_keypair);

    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|e| Error::Certificate(format!("certificate params: {e}")))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationalUnitName, binding.organizational_unit());
    params.distinguished_name = dn;
    params.serial_number = Some(SerialNumber::from(serial));
    params.use_authority_key_identifier_extension = true;
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = time::OffsetDateTime::from_unix_timestamp(not_after.timestamp())
        .map_err(|e| Error::Certificate(format!("invalid expiry: {e}")))?;

    let subject_key = SubjectPublicKey {
        point: subject.to_uncompressed(),
    };
    let cert = params
        .signed_by(&subject_key, &rc_issuer)
        .map_err(|e| Error::Certificate(format!("certificate signing failed: {e}")))?;
    Ok(cert.der().to_vec())
}

struct ParsedMetadata {
    subject_public_key: PublicKey,
    guid: Uuid,
    serial: u64,
    issuer_key_id: Vec<u8>,
    not_after: DateTime<Utc>,
}

fn parse_metadata(der: &[u8], binding: Binding) -> Result<ParsedMetadata> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| Error::Certificate(format!("failed to parse certificate: {e}")))?;

    // Subject public key: must be an uncompressed P-256 point.
    let pk_data = &*cert.tbs_certificate.subject_pki.subject_public_key.data;
    let subject_public_key = PublicKey::from_uncompressed(pk_data)?;

    // The bound GUID travels in the subject common name; the binding kind in
    // the organizational unit.
    let mut guid = None;
    let mut unit = None;
    for rdn in cert.subject().iter_common_name() {
        if let Ok(cn) = rdn.as_str() {
            guid = Uuid::parse_str(cn).ok();
        }
    }
    for rdn in cert.subject().iter_organizational_unit() {
        if let Ok(ou) = rdn.as_str() {
            unit = Some(ou.to_string());
        }
    }
    let guid = guid.ok_or_else(|| {
        Error::Certificate("certificate subject carries no GUID common name".to_string())
    })?;
    if unit.as_deref() != Some(binding.organizational_unit()) {
        return Err(Error::Certificate(format!(
            "certificate is not a {} certificate",
            binding.organizational_unit()
        )));
    }

    let serial = cert
        .tbs_certificate
        .raw_serial()
        .iter()
        .try_fold(0u64, |acc, byte| {
            acc.checked_mul(256)
                .and_then(|acc| acc.checked_add(u64::from(*byte)))
        })
        .ok_or_else(|| Error::Certificate("serial number exceeds 64 bits".to_string()))?;

    let mut issuer_key_id = Vec::new();
    for ext in cert.extensions() {
        if let x509_parser::extensions::ParsedExtension::AuthorityKeyIdentifier(aki) =
            ext.parsed_extension()
        {
            if let Some(key_id) = &aki.key_identifier {
                issuer_key_id = key_id.0.to_vec();
            }
        }
    }
    if issuer_key_id.is_empty() {
        return Err(Error::Certificate(
            "certificate carries no authority key identifier".to_string(),
        ));
    }

    let not_after = Utc
        .timestamp_opt(cert.validity().not_after.timestamp(), 0)
        .single()
        .ok_or_else(|| Error::Certificate("invalid not-after timestamp".to_string()))?;

    Ok(ParsedMetadata {
        subject_public_key,
        guid,
        serial,
        issuer_key_id,
        not_after,
    })
}

fn pem_to_der(text: &str) -> Result<Vec<u8>> {
    let parsed = pem::parse(text)
        .map_err(|e| Error::Certificate(format!("failed to parse PEM: {e}")))?;
    if parsed.tag() != "CERTIFICATE" {
        return Err(Error::Certificate(format!(
            "expected CERTIFICATE PEM, got {}",
            parsed.tag()
        )));
    }
    Ok(parsed.into_contents())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::SigningKey;

    fn issuer_and_subject() -> (SigningKey, PublicKey) {
        let issuer = SigningKey::generate().unwrap();
        let subject = *SigningKey::generate().unwrap().public_key();
        (issuer, subject)
    }

    fn expiry() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::days(365)
    }

    #[test]
    fn test_identity_certificate_roundtrip() {
        let (issuer, subject) = issuer_and_subject();
        let guid = Uuid::new_v4();
        let cert = IdentityCertificate::issue(&issuer, &subject, guid, 7, expiry()).unwrap();

        let parsed = IdentityCertificate::from_der(cert.der().to_vec()).unwrap();
        assert_eq!(parsed.identity_guid(), guid);
        assert_eq!(parsed.serial(), 7);
        assert_eq!(parsed.subject_public_key(), &subject);
        assert_eq!(parsed.issuer_key_id(), cert.issuer_key_id());
        assert_eq!(
            parsed.issuer_key_id(),
            key_identifier(issuer.public_key()).as_slice()
        );
    }

    #[test]
    fn test_pem_roundtrip() {
        let (issuer, subject) = issuer_and_subject();
        let cert =
            IdentityCertificate::issue(&issuer, &subject, Uuid::new_v4(), 1, expiry()).unwrap();

        let pem_text = cert.to_pem();
        let parsed = IdentityCertificate::from_pem(&pem_text).unwrap();
        assert_eq!(parsed.der(), cert.der());
        assert_eq!(parsed.thumbprint(), cert.thumbprint());
    }

    #[test]
    fn test_encoding_tags() {
        let (issuer, subject) = issuer_and_subject();
        let cert =
            IdentityCertificate::issue(&issuer, &subject, Uuid::new_v4(), 1, expiry()).unwrap();

        for encoding in [CertificateEncoding::Der, CertificateEncoding::Pem] {
            let bytes = cert.encode(encoding);
            let parsed = IdentityCertificate::decode(encoding, &bytes).unwrap();
            assert_eq!(parsed.der(), cert.der());
        }
        assert_eq!(CertificateEncoding::from_wire(2), None);
    }

    #[test]
    fn test_membership_certificate_carries_guild() {
        let (issuer, subject) = issuer_and_subject();
        let guild = Uuid::new_v4();
        let cert = MembershipCertificate::issue(&issuer, &subject, guild, 42, expiry()).unwrap();

        let parsed = MembershipCertificate::from_der(cert.der().to_vec()).unwrap();
        assert_eq!(parsed.guild_guid(), guild);
        assert_eq!(parsed.serial(), 42);
    }

    #[test]
    fn test_binding_kinds_do_not_cross_parse() {
        let (issuer, subject) = issuer_and_subject();
        let identity =
            IdentityCertificate::issue(&issuer, &subject, Uuid::new_v4(), 1, expiry()).unwrap();
        assert!(MembershipCertificate::from_der(identity.der().to_vec()).is_err());

        let membership =
            MembershipCertificate::issue(&issuer, &subject, Uuid::new_v4(), 2, expiry()).unwrap();
        assert!(IdentityCertificate::from_der(membership.der().to_vec()).is_err());
    }

    #[test]
    fn test_thumbprints_are_distinct() {
        let (issuer, subject) = issuer_and_subject();
        let a = IdentityCertificate::issue(&issuer, &subject, Uuid::new_v4(), 1, expiry()).unwrap();
        let b = IdentityCertificate::issue(&issuer, &subject, Uuid::new_v4(), 2, expiry()).unwrap();
        assert_ne!(a.thumbprint(), b.thumbprint());
        assert_eq!(a.thumbprint().len(), 32);
    }

    #[test]
    fn test_garbage_der_is_rejected() {
        assert!(IdentityCertificate::from_der(vec![0xDE, 0xAD, 0xBE, 0xEF]).is_err());
    }
}
