//! Wire encode/decode for the permission-management interface.
//!
//! All tagged wire shapes are produced and consumed here, once, at the proxy
//! boundary. Decoding is fail-closed: an unexpected tag at any nesting level
//! aborts the decode with an error instead of a best-effort guess.

use warden_bus::{BusError, WireValue};
use warden_model::key::{wire, UNCOMPRESSED_POINT_LEN};
use warden_model::{
    CertificateEncoding, IdentityCertificate, KeyInfo, Member, MemberAction, MemberKind,
    MembershipCertificate, PermissionPolicy, PublicKey, Rule, COORDINATE_LEN,
};

/// Encodes the nested tagged public-key structure:
///
/// ```text
/// (format, v: (key-id, usage, key-type, v: (algorithm, curve, v: (x, y))))
/// ```
pub fn encode_public_key(info: &KeyInfo) -> WireValue {
    let key = info.public_key();
    let coords = WireValue::Struct(vec![
        WireValue::Bytes(key.x().to_vec()),
        WireValue::Bytes(key.y().to_vec()),
    ]);
    let curve = WireValue::Struct(vec![
        WireValue::Byte(wire::ALGORITHM_ECDSA_SHA256),
        WireValue::Byte(wire::CURVE_NIST_P256),
        WireValue::variant(coords),
    ]);
    let inner = WireValue::Struct(vec![
        WireValue::Bytes(info.key_id().unwrap_or_default().to_vec()),
        WireValue::Byte(wire::USAGE_SIGNING),
        WireValue::Byte(wire::KEY_TYPE_ECC),
        WireValue::variant(curve),
    ]);
    WireValue::Struct(vec![WireValue::Byte(wire::FORMAT_BUS), WireValue::variant(inner)])
}

/// Encodes a key id as a plain byte array.
pub fn encode_key_id(info: &KeyInfo) -> WireValue {
    WireValue::Bytes(info.key_id().unwrap_or_default().to_vec())
}

/// Decodes [`encode_public_key`]'s shape, validating every tag on the way
/// down: the key format, the usage, the key type, the curve, and both
/// coordinate lengths. Any mismatch is a decode error.
pub fn decode_public_key(value: &WireValue) -> Result<PublicKey, BusError> {
    let outer = value.expect_struct(2)?;
    let format = outer[0].expect_byte()?;
    if format != wire::FORMAT_BUS {
        return Err(BusError::Decode(format!("unexpected key format {format}")));
    }

    let inner = outer[1].expect_variant()?.expect_struct(4)?;
    let _key_id = inner[0].expect_bytes()?;
    let usage = inner[1].expect_byte()?;
    if usage != wire::USAGE_SIGNING && usage != wire::USAGE_ENCRYPTION {
        return Err(BusError::Decode(format!("unexpected key usage {usage}")));
    }
    let key_type = inner[2].expect_byte()?;
    if key_type != wire::KEY_TYPE_ECC {
        return Err(BusError::Decode(format!("unexpected key type {key_type}")));
    }

    let curve_struct = inner[3].expect_variant()?.expect_struct(3)?;
    let _algorithm = curve_struct[0].expect_byte()?;
    let curve = curve_struct[1].expect_byte()?;
    if curve != wire::CURVE_NIST_P256 {
        return Err(BusError::Decode(format!("unexpected curve {curve}")));
    }

    let coords = curve_struct[2].expect_variant()?.expect_struct(2)?;
    let x = coords[0].expect_bytes()?;
    let y = coords[1].expect_bytes()?;
    if x.len() != COORDINATE_LEN || y.len() != COORDINATE_LEN {
        return Err(BusError::Decode(format!(
            "coordinate length {}/{} != {COORDINATE_LEN}",
            x.len(),
            y.len()
        )));
    }

    let mut point = [0u8; UNCOMPRESSED_POINT_LEN];
    point[0] = 0x04;
    point[1..1 + COORDINATE_LEN].copy_from_slice(x);
    point[1 + COORDINATE_LEN..].copy_from_slice(y);
    PublicKey::from_uncompressed(&point).map_err(|e| BusError::Decode(e.to_string()))
}

/// Encodes a rule set as `a(ssa(syy))`.
pub fn encode_rules(rules: &[Rule]) -> WireValue {
    WireValue::Array(
        rules
            .iter()
            .map(|rule| {
                WireValue::Struct(vec![
                    WireValue::Str(rule.object_path.clone()),
                    WireValue::Str(rule.interface_name.clone()),
                    WireValue::Array(
                        rule.members
                            .iter()
                            .map(|member| {
                                WireValue::Struct(vec![
                                    WireValue::Str(member.name.clone()),
                                    WireValue::Byte(member.kind.to_wire()),
                                    WireValue::Byte(member.action.0),
                                ])
                            })
                            .collect(),
                    ),
                ])
            })
            .collect(),
    )
}

/// Decodes a rule set. Unknown member kinds fail closed.
pub fn decode_rules(value: &WireValue) -> Result<Vec<Rule>, BusError> {
    value
        .expect_array()?
        .iter()
        .map(|entry| {
            let fields = entry.expect_struct(3)?;
            let members = fields[2]
                .expect_array()?
                .iter()
                .map(|member| {
                    let parts = member.expect_struct(3)?;
                    let kind_tag = parts[1].expect_byte()?;
                    let kind = MemberKind::from_wire(kind_tag).ok_or_else(|| {
                        BusError::Decode(format!("unknown member kind {kind_tag}"))
                    })?;
                    Ok(Member {
                        name: parts[0].expect_str()?.to_string(),
                        kind,
                        action: MemberAction(parts[2].expect_byte()?),
                    })
                })
                .collect::<Result<Vec<_>, BusError>>()?;
            Ok(Rule {
                object_path: fields[0].expect_str()?.to_string(),
                interface_name: fields[1].expect_str()?.to_string(),
                members,
            })
        })
        .collect()
}

/// Encodes a policy as the tagged `(version, v: (serial, rules))` shape.
pub fn encode_policy(policy: &PermissionPolicy) -> WireValue {
    WireValue::Struct(vec![
        WireValue::Byte(PermissionPolicy::SPEC_VERSION),
        WireValue::variant(WireValue::Struct(vec![
            WireValue::U32(policy.serial),
            encode_rules(&policy.rules),
        ])),
    ])
}

/// Decodes [`encode_policy`]'s shape. An unknown version tag fails closed.
pub fn decode_policy(value: &WireValue) -> Result<PermissionPolicy, BusError> {
    let outer = value.expect_struct(2)?;
    let version = outer[0].expect_byte()?;
    if version != PermissionPolicy::SPEC_VERSION {
        return Err(BusError::Decode(format!(
            "unsupported policy version {version}"
        )));
    }
    let body = outer[1].expect_variant()?.expect_struct(2)?;
    Ok(PermissionPolicy {
        serial: body[0].expect_u32()?,
        rules: decode_rules(&body[1])?,
    })
}

/// Encodes an identity certificate chain as `a(yay)`, leaf first. An empty
/// chain encodes as a zero-length array.
pub fn encode_identity_chain(chain: &[IdentityCertificate]) -> WireValue {
    WireValue::Array(
        chain
            .iter()
            .map(|cert| encode_certificate_blob(CertificateEncoding::Der, cert.der()))
            .collect(),
    )
}

/// Encodes a membership certificate chain as `a(yay)`, leaf first.
pub fn encode_membership_chain(chain: &[MembershipCertificate]) -> WireValue {
    WireValue::Array(
        chain
            .iter()
            .map(|cert| encode_certificate_blob(CertificateEncoding::Der, cert.der()))
            .collect(),
    )
}

/// Encodes one `(encoding, bytes)` certificate entry.
pub fn encode_certificate_blob(encoding: CertificateEncoding, bytes: &[u8]) -> WireValue {
    WireValue::Struct(vec![
        WireValue::Byte(encoding.to_wire()),
        WireValue::Bytes(bytes.to_vec()),
    ])
}

/// Decodes one `(encoding, bytes)` certificate entry.
///
/// An encoding tag this implementation does not know is a
/// [`BusError::NotImplemented`], distinct from a malformed reply.
pub fn decode_certificate_blob(value: &WireValue) -> Result<(CertificateEncoding, &[u8]), BusError> {
    let fields = value.expect_struct(2)?;
    let tag = fields[0].expect_byte()?;
    let encoding = CertificateEncoding::from_wire(tag)
        .ok_or_else(|| BusError::NotImplemented(format!("certificate encoding {tag}")))?;
    Ok((encoding, fields[1].expect_bytes()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_model::SigningKey;

    fn key_info() -> KeyInfo {
        let mut info = SigningKey::generate().unwrap().key_info();
        info.key_id_or_generate();
        info
    }

    fn sample_rules() -> Vec<Rule> {
        vec![Rule::for_interface(
            "net.warden.Door",
            vec![Member::any("Open", MemberAction::full())],
        )]
    }

    #[test]
    fn test_public_key_roundtrip() {
        let info = key_info();
        let encoded = encode_public_key(&info);
        let decoded = decode_public_key(&encoded).unwrap();
        assert_eq!(&decoded, info.public_key());
    }

    /// Every single mismatched tag in the nested structure must be rejected.
    #[test]
    fn test_public_key_rejects_each_tag_mismatch() {
        let info = key_info();

        // Wrong key format.
        let mut v = encode_public_key(&info);
        if let WireValue::Struct(fields) = &mut v {
            fields[0] = WireValue::Byte(9);
        }
        assert!(decode_public_key(&v).is_err());

        // Wrong usage.
        let mut v = encode_public_key(&info);
        with_inner(&mut v, |inner| inner[1] = WireValue::Byte(7));
        assert!(decode_public_key(&v).is_err());

        // Wrong key type.
        let mut v = encode_public_key(&info);
        with_inner(&mut v, |inner| inner[2] = WireValue::Byte(5));
        assert!(decode_public_key(&v).is_err());

        // Wrong curve.
        let mut v = encode_public_key(&info);
        with_curve(&mut v, |curve| curve[1] = WireValue::Byte(1));
        assert!(decode_public_key(&v).is_err());

        // Truncated X coordinate.
        let mut v = encode_public_key(&info);
        with_coords(&mut v, |coords| {
            coords[0] = WireValue::Bytes(vec![0u8; COORDINATE_LEN - 1]);
        });
        assert!(decode_public_key(&v).is_err());

        // Oversized Y coordinate.
        let mut v = encode_public_key(&info);
        with_coords(&mut v, |coords| {
            coords[1] = WireValue::Bytes(vec![0u8; COORDINATE_LEN + 1]);
        });
        assert!(decode_public_key(&v).is_err());

        // The untouched encoding still decodes.
        assert!(decode_public_key(&encode_public_key(&info)).is_ok());
    }

    fn with_inner(value: &mut WireValue, f: impl FnOnce(&mut Vec<WireValue>)) {
        if let WireValue::Struct(outer) = value {
            if let WireValue::Variant(inner) = &mut outer[1] {
                if let WireValue::Struct(fields) = inner.as_mut() {
                    f(fields);
                }
            }
        }
    }

    fn with_curve(value: &mut WireValue, f: impl FnOnce(&mut Vec<WireValue>)) {
        with_inner(value, |inner| {
            if let WireValue::Variant(curve) = &mut inner[3] {
                if let WireValue::Struct(fields) = curve.as_mut() {
                    f(fields);
                }
            }
        });
    }

    fn with_coords(value: &mut WireValue, f: impl FnOnce(&mut Vec<WireValue>)) {
        with_curve(value, |curve| {
            if let WireValue::Variant(coords) = &mut curve[2] {
                if let WireValue::Struct(fields) = coords.as_mut() {
                    f(fields);
                }
            }
        });
    }

    #[test]
    fn test_rules_roundtrip() {
        let rules = sample_rules();
        let decoded = decode_rules(&encode_rules(&rules)).unwrap();
        assert_eq!(decoded, rules);

        // Empty rule sets are legal.
        assert_eq!(decode_rules(&encode_rules(&[])).unwrap(), Vec::<Rule>::new());
    }

    #[test]
    fn test_rules_reject_unknown_member_kind() {
        let mut encoded = encode_rules(&sample_rules());
        if let WireValue::Array(rules) = &mut encoded {
            if let WireValue::Struct(fields) = &mut rules[0] {
                if let WireValue::Array(members) = &mut fields[2] {
                    if let WireValue::Struct(parts) = &mut members[0] {
                        parts[1] = WireValue::Byte(200);
                    }
                }
            }
        }
        assert!(decode_rules(&encoded).is_err());
    }

    #[test]
    fn test_policy_roundtrip() {
        let policy = PermissionPolicy::new(3, sample_rules());
        let decoded = decode_policy(&encode_policy(&policy)).unwrap();
        assert_eq!(decoded, policy);
    }

    #[test]
    fn test_policy_rejects_unknown_version() {
        let policy = PermissionPolicy::new(3, sample_rules());
        let mut encoded = encode_policy(&policy);
        if let WireValue::Struct(fields) = &mut encoded {
            fields[0] = WireValue::Byte(99);
        }
        assert!(decode_policy(&encoded).is_err());
    }

    #[test]
    fn test_certificate_blob_unknown_encoding_is_not_implemented() {
        let blob = WireValue::Struct(vec![WireValue::Byte(42), WireValue::Bytes(vec![1, 2])]);
        let err = decode_certificate_blob(&blob).unwrap_err();
        assert!(matches!(err, BusError::NotImplemented(_)));
    }

    #[test]
    fn test_empty_identity_chain_encodes_as_empty_array() {
        let encoded = encode_identity_chain(&[]);
        assert_eq!(encoded, WireValue::Array(vec![]));
    }
}
