//! Self-signature, subkey and revocation checks.
use k256::Secp256k1;
use p256::NistP256;
use tracing::debug;

use crate::compat::{self, CurveKind, PgpCurve};
use crate::sign::FullSignature;

use super::cert::Cert;
use super::key::{PublicKeyPacket, PKALGO_ECDSA};
use super::signature::{key_hash, user_id_hash, RevocationCode, Signature, SignatureType};

fn verify_with<C: PgpCurve>(signer: &PublicKeyPacket, sig: &Signature, digest: &[u8]) -> bool {
    let Some(public_key) = C::decode_point(&signer.point) else {
        return false;
    };
    let (Some(r), Some(s)) = (
        compat::scalar_from_bytes::<C>(&sig.r),
        compat::scalar_from_bytes::<C>(&sig.s),
    ) else {
        return false;
    };
    let Some(m) = compat::digest_to_scalar::<C>(digest) else {
        return false;
    };
    FullSignature::<C> { r, s }.verify(&public_key, &m)
}

/// Verify an ECDSA signature packet over an already computed digest.
pub fn verify_signature(signer: &PublicKeyPacket, sig: &Signature, digest: &[u8]) -> bool {
    if signer.algorithm != PKALGO_ECDSA || sig.pkalgo != PKALGO_ECDSA {
        return false;
    }
    if digest.len() < 2 || sig.left16 != digest[..2] {
        return false;
    }
    match signer.curve() {
        Some(CurveKind::NistP256) => verify_with::<NistP256>(signer, sig, digest),
        Some(CurveKind::Secp256k1) => verify_with::<Secp256k1>(signer, sig, digest),
        None => false,
    }
}

/// What a signature made by the primary key is about.
enum Target<'a> {
    Key,
    Subkey(&'a PublicKeyPacket),
    UserId(&'a [u8]),
}

fn check_by_primary(primary: &PublicKeyPacket, target: Target<'_>, sig: &Signature) -> bool {
    if !sig.issued_by(primary) {
        return false;
    }
    let Some(hash) = sig.hash_algorithm() else {
        debug!("unsupported hash algorithm {}", sig.hash_algo);
        return false;
    };
    let trailer = sig.trailer();
    let digest = match target {
        Target::Key => key_hash(hash, primary, None, &trailer),
        Target::Subkey(subkey) => key_hash(hash, primary, Some(subkey), &trailer),
        Target::UserId(uid) => user_id_hash(hash, primary, uid, &trailer),
    };
    verify_signature(primary, sig, &digest)
}

/// Check user id certifications and key revocations of the primary key.
///
/// Marks every user id with a verifying self certification as valid. The
/// key itself is valid if it is an ECDSA key, some user id is valid, and no
/// revocation verifies. Returns the validity of the key.
pub fn check_self_signatures(cert: &mut Cert) -> bool {
    let primary = cert.primary.clone();
    for uid in &mut cert.user_ids {
        uid.valid = uid.signatures.iter().any(|sig| {
            sig.sigtype.is_certification()
                && check_by_primary(&primary, Target::UserId(&uid.value), sig)
        });
        if !uid.valid {
            debug!(
                "user id {:?} has no valid self certification",
                String::from_utf8_lossy(&uid.value)
            );
        }
    }
    let revoked = cert
        .revocations
        .iter()
        .any(|sig| check_by_primary(&primary, Target::Key, sig));
    if revoked {
        debug!("primary key is revoked");
    }
    cert.valid =
        primary.algorithm == PKALGO_ECDSA && !revoked && cert.user_ids.iter().any(|uid| uid.valid);
    cert.valid
}

/// Mark subkeys with a verifying binding and no verifying revocation as valid.
pub fn check_subkeys(cert: &mut Cert) {
    let primary = cert.primary.clone();
    for subkey in &mut cert.subkeys {
        let bound = subkey
            .bindings
            .iter()
            .any(|sig| check_by_primary(&primary, Target::Subkey(&subkey.key), sig));
        let revoked = subkey
            .revocations
            .iter()
            .any(|sig| check_by_primary(&primary, Target::Subkey(&subkey.key), sig));
        subkey.valid = bound && !revoked;
    }
}

/// Drop user ids and subkeys the checks above did not accept.
pub fn reduce(cert: &mut Cert) {
    let (uids, subkeys) = (cert.user_ids.len(), cert.subkeys.len());
    cert.user_ids.retain(|uid| uid.valid);
    cert.subkeys.retain(|subkey| subkey.valid);
    debug!(
        "reduced key: dropped {} user ids and {} subkeys",
        uids - cert.user_ids.len(),
        subkeys - cert.subkeys.len()
    );
}

fn weak_point(key: &PublicKeyPacket) -> bool {
    match key.curve() {
        Some(CurveKind::NistP256) => NistP256::decode_point(&key.point).is_none(),
        Some(CurveKind::Secp256k1) => Secp256k1::decode_point(&key.point).is_none(),
        None => true,
    }
}

/// True if the primary key or a subkey is on an unknown curve or has a
/// point that is not on its curve.
pub fn weak(cert: &Cert) -> bool {
    weak_point(&cert.primary) || cert.subkeys.iter().any(|subkey| weak_point(&subkey.key))
}

/// Verify a revocation of the primary key, or of the given subkey.
pub fn verify_revocation(cert: &Cert, sig: &Signature, subkey: Option<&PublicKeyPacket>) -> bool {
    match subkey {
        None => {
            sig.sigtype == SignatureType::KeyRevocation
                && check_by_primary(&cert.primary, Target::Key, sig)
        }
        Some(subkey) => {
            sig.sigtype == SignatureType::SubkeyRevocation
                && check_by_primary(&cert.primary, Target::Subkey(subkey), sig)
        }
    }
}

/// One revocation signature found on a key, with the outcome of checking it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationStatus {
    /// The fingerprint of the revoked key or subkey.
    pub fingerprint: [u8; 20],
    pub subkey: bool,
    pub created: Option<u32>,
    pub reason: Option<(RevocationCode, String)>,
    pub valid: bool,
}

/// Check every revocation attached to a key.
///
/// This only reads the key, so running it twice gives the same answer.
pub fn revocations(cert: &Cert) -> Vec<RevocationStatus> {
    let status = |key: &PublicKeyPacket, subkey: Option<&PublicKeyPacket>, sig: &Signature| {
        RevocationStatus {
            fingerprint: key.fingerprint(),
            subkey: subkey.is_some(),
            created: sig.created(),
            reason: sig.revocation_reason(),
            valid: verify_revocation(cert, sig, subkey),
        }
    };
    let mut out: Vec<RevocationStatus> = cert
        .revocations
        .iter()
        .map(|sig| status(&cert.primary, None, sig))
        .collect();
    for subkey in &cert.subkeys {
        out.extend(
            subkey
                .revocations
                .iter()
                .map(|sig| status(&subkey.key, Some(&subkey.key), sig)),
        );
    }
    out
}

#[cfg(test)]
mod test {
    use ecdsa::signature::hazmat::PrehashSigner;
    use p256::ecdsa::SigningKey;
    use rand_core::OsRng;

    use super::*;
    use crate::openpgp::{
        prepare_revocation, prepare_self_signature, HashAlgorithm, Subkey, UserId,
    };

    const CREATED: u32 = 1_600_000_000;

    fn make(sk: &SigningKey, issuer: &PublicKeyPacket, trailer: &[u8], digest: &[u8]) -> Signature {
        let sig: p256::ecdsa::Signature = sk.sign_prehash(digest).unwrap();
        let (r, s) = sig.split_bytes();
        Signature::from_trailer(trailer, &issuer.key_id(), [digest[0], digest[1]], &r, &s).unwrap()
    }

    fn signed_cert() -> (SigningKey, Cert) {
        let sk = SigningKey::random(&mut OsRng);
        let point = sk.verifying_key().to_encoded_point(false);
        let primary = PublicKeyPacket::ecdsa(CREATED, CurveKind::NistP256.oid(), point.as_bytes());
        let sub_point = SigningKey::random(&mut OsRng)
            .verifying_key()
            .to_encoded_point(false);
        let sub = PublicKeyPacket::ecdh(CREATED, CurveKind::NistP256.oid(), sub_point.as_bytes(), 8, 9);
        let mut cert = Cert::new(primary);

        let uid = b"Alice <alice@example.org>".to_vec();
        let trailer = prepare_self_signature(
            SignatureType::PositiveCertification,
            &cert.primary,
            HashAlgorithm::Sha256,
            CREATED,
            0x03,
        );
        let digest = user_id_hash(HashAlgorithm::Sha256, &cert.primary, &uid, &trailer);
        let certification = make(&sk, &cert.primary, &trailer, &digest);
        cert.user_ids.push(UserId {
            value: uid,
            signatures: vec![certification],
            valid: false,
        });

        let trailer = prepare_self_signature(
            SignatureType::SubkeyBinding,
            &cert.primary,
            HashAlgorithm::Sha256,
            CREATED,
            0x0C,
        );
        let digest = key_hash(HashAlgorithm::Sha256, &cert.primary, Some(&sub), &trailer);
        let binding = make(&sk, &cert.primary, &trailer, &digest);
        cert.subkeys.push(Subkey {
            key: sub,
            secret: None,
            bindings: vec![binding],
            revocations: Vec::new(),
            valid: false,
        });
        (sk, cert)
    }

    fn revoke(sk: &SigningKey, cert: &Cert, subkey: Option<&PublicKeyPacket>) -> Signature {
        let sigtype = match subkey {
            None => SignatureType::KeyRevocation,
            Some(_) => SignatureType::SubkeyRevocation,
        };
        let trailer = prepare_revocation(
            sigtype,
            &cert.primary,
            HashAlgorithm::Sha256,
            CREATED + 10,
            RevocationCode::RETIRED,
            "done",
        );
        let digest = key_hash(HashAlgorithm::Sha256, &cert.primary, subkey, &trailer);
        make(sk, &cert.primary, &trailer, &digest)
    }

    #[test]
    fn test_self_signatures_and_subkeys() {
        let (_, mut cert) = signed_cert();
        assert!(check_self_signatures(&mut cert));
        check_subkeys(&mut cert);
        assert!(cert.subkeys[0].valid);
        assert!(!weak(&cert));
    }

    #[test]
    fn test_tampered_user_id_is_dropped() {
        let (_, mut cert) = signed_cert();
        let mut forged = cert.user_ids[0].clone();
        forged.value = b"Mallory <mallory@example.org>".to_vec();
        cert.user_ids.push(forged);
        assert!(check_self_signatures(&mut cert));
        check_subkeys(&mut cert);
        reduce(&mut cert);
        assert_eq!(cert.user_ids.len(), 1);
        assert_eq!(cert.user_ids[0].value, b"Alice <alice@example.org>");
        assert_eq!(cert.subkeys.len(), 1);
    }

    #[test]
    fn test_revocations_verify_and_invalidate() {
        let (sk, mut cert) = signed_cert();
        let sub = cert.subkeys[0].key.clone();
        let key_revocation = revoke(&sk, &cert, None);
        let sub_revocation = revoke(&sk, &cert, Some(&sub));
        assert!(verify_revocation(&cert, &key_revocation, None));
        assert!(verify_revocation(&cert, &sub_revocation, Some(&sub)));
        // A key revocation does not revoke the subkey, and vice versa.
        assert!(!verify_revocation(&cert, &key_revocation, Some(&sub)));
        assert!(!verify_revocation(&cert, &sub_revocation, None));

        cert.revocations.push(key_revocation);
        cert.subkeys[0].revocations.push(sub_revocation);
        assert!(!check_self_signatures(&mut cert));
        check_subkeys(&mut cert);
        assert!(!cert.subkeys[0].valid);

        let report = revocations(&cert);
        assert_eq!(report.len(), 2);
        assert!(report.iter().all(|status| status.valid));
        assert!(!report[0].subkey && report[1].subkey);
        assert_eq!(report[1].fingerprint, sub.fingerprint());
        assert_eq!(report[0].created, Some(CREATED + 10));
        assert_eq!(
            report[0].reason,
            Some((RevocationCode::RETIRED, "done".to_string()))
        );
        assert_eq!(revocations(&cert), report);
    }

    #[test]
    fn test_wrong_digest_fails() {
        let (sk, cert) = signed_cert();
        let sig = revoke(&sk, &cert, None);
        let mut digest = key_hash(HashAlgorithm::Sha256, &cert.primary, None, &sig.trailer());
        assert!(verify_signature(&cert.primary, &sig, &digest));
        digest[31] ^= 1;
        assert!(!verify_signature(&cert.primary, &sig, &digest));
    }

    #[test]
    fn test_off_curve_point_is_weak() {
        let (_, mut cert) = signed_cert();
        let mut point = cert.primary.point.clone();
        point[64] ^= 1;
        cert.primary = PublicKeyPacket::ecdsa(CREATED, CurveKind::NistP256.oid(), &point);
        assert!(weak(&cert));
    }
}
