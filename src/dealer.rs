//! A trusted dealer for threshold keys.
//!
//! Revoking needs existing threshold keys to revoke. This module creates
//! them in one place: it draws the secret, shares it among the peers, makes
//! the self-signatures with the full secret, and hands every peer an armored
//! private key holding only its own share. It is meant for tests and
//! demonstrations; the secret exists on the dealing machine.
use std::io;
use std::path::{Path, PathBuf};

use elliptic_curve::{Field, Group};
use rand_core::CryptoRngCore;
use thiserror::Error;
use tracing::info;
use zeroize::Zeroizing;

use crate::compat::{self, PgpCurve};
use crate::files;
use crate::keyshare;
use crate::openpgp::{
    gnu_dummy, key_hash, prepare_self_signature, seal_secret, user_id_hash, Cert, CodecError,
    HashAlgorithm, PublicKeyPacket, Signature, SignatureType, Subkey, UserId, TAG_SECRET_KEY,
};
use crate::participants::PeerList;
use crate::sign::FullSignature;

/// Symmetric cipher id of AES-256, the ECDH key wrapping cipher.
const SYM_AES256: u8 = 9;
const FLAGS_CERTIFY_SIGN: u8 = 0x03;
const FLAGS_ENCRYPT: u8 = 0x0C;

#[derive(Debug, Error)]
pub enum DealError {
    #[error("threshold {threshold} needs {needed} peers, found {n}", needed = 2 * .threshold + 1)]
    ThresholdTooLarge { threshold: usize, n: usize },
    #[error("no hash algorithm for a {0} bit group order")]
    NoHashAlgorithm(usize),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("bad peer list: {0}")]
    Peers(String),
    #[error("writing key files: {0}")]
    Write(io::Error),
}

/// The key files of one peer.
pub struct DealtKey {
    pub peer: String,
    pub private_armor: String,
    pub public_armor: String,
}

/// Sign a digest with a complete secret key.
pub fn sign_with_secret<C: PgpCurve>(
    rng: &mut impl CryptoRngCore,
    secret: &C::Scalar,
    digest: &[u8],
) -> Option<FullSignature<C>> {
    let m = compat::digest_to_scalar::<C>(digest)?;
    loop {
        let k = Zeroizing::new(C::Scalar::random(&mut *rng));
        let big_r: C::AffinePoint = (C::ProjectivePoint::generator() * *k).into();
        let r = compat::x_coordinate::<C>(&big_r);
        let Some(k_inv) = Option::<C::Scalar>::from(k.invert()) else {
            continue;
        };
        let s = k_inv * (m + *secret * r);
        if bool::from(r.is_zero()) || bool::from(s.is_zero()) {
            continue;
        }
        return Some(FullSignature { r, s });
    }
}

fn self_signature<C: PgpCurve>(
    rng: &mut impl CryptoRngCore,
    secret: &C::Scalar,
    issuer: &PublicKeyPacket,
    trailer: &[u8],
    digest: &[u8],
) -> Result<Signature, CodecError> {
    let sig = sign_with_secret::<C>(rng, secret, digest)
        .ok_or_else(|| CodecError::Malformed("digest too short".to_string()))?;
    Signature::from_trailer(
        trailer,
        &issuer.key_id(),
        [digest[0], digest[1]],
        &compat::scalar_to_bytes::<C>(&sig.r),
        &compat::scalar_to_bytes::<C>(&sig.s),
    )
}

/// Create a threshold key for `peers`, with sharing polynomial degree `threshold`.
///
/// Every private key is protected with the same `passphrase`.
pub fn deal_keys<C: PgpCurve>(
    rng: &mut impl CryptoRngCore,
    peers: &PeerList,
    threshold: usize,
    user_id: &str,
    passphrase: &[u8],
    created: u32,
) -> Result<Vec<DealtKey>, DealError> {
    if 2 * threshold + 1 > peers.len() {
        return Err(DealError::ThresholdTooLarge {
            threshold,
            n: peers.len(),
        });
    }
    let hash = HashAlgorithm::for_order_bits(C::BITS).ok_or(DealError::NoHashAlgorithm(C::BITS))?;
    let (secret, shares) = keyshare::deal::<C>(rng, peers.as_slice(), threshold);

    let public_key: C::AffinePoint = (C::ProjectivePoint::generator() * *secret).into();
    let primary = PublicKeyPacket::ecdsa(created, C::OID, &C::encode_point(&public_key));
    let subkey_secret = Zeroizing::new(C::Scalar::random(&mut *rng));
    let subkey_point: C::AffinePoint = (C::ProjectivePoint::generator() * *subkey_secret).into();
    let subkey = PublicKeyPacket::ecdh(
        created,
        C::OID,
        &C::encode_point(&subkey_point),
        hash.id(),
        SYM_AES256,
    );

    let mut cert = Cert::new(primary);
    let trailer = prepare_self_signature(
        SignatureType::PositiveCertification,
        &cert.primary,
        hash,
        created,
        FLAGS_CERTIFY_SIGN,
    );
    let digest = user_id_hash(hash, &cert.primary, user_id.as_bytes(), &trailer);
    let certification = self_signature::<C>(rng, &secret, &cert.primary, &trailer, &digest)?;
    cert.user_ids.push(UserId {
        value: user_id.as_bytes().to_vec(),
        signatures: vec![certification],
        valid: true,
    });

    let trailer = prepare_self_signature(
        SignatureType::SubkeyBinding,
        &cert.primary,
        hash,
        created,
        FLAGS_ENCRYPT,
    );
    let digest = key_hash(hash, &cert.primary, Some(&subkey), &trailer);
    let binding = self_signature::<C>(rng, &secret, &cert.primary, &trailer, &digest)?;
    cert.subkeys.push(Subkey {
        key: subkey,
        secret: Some(gnu_dummy()),
        bindings: vec![binding],
        revocations: Vec::new(),
        valid: true,
    });

    let public_armor = cert.public_armor();
    let mut out = Vec::with_capacity(peers.len());
    for (peer, share) in peers.as_slice().iter().zip(&shares) {
        let mut mine = cert.clone();
        mine.secret = Some(seal_secret(
            rng,
            TAG_SECRET_KEY,
            mine.primary.body(),
            &share.to_bytes(),
            passphrase,
        )?);
        out.push(DealtKey {
            peer: peer.clone(),
            private_armor: mine.private_armor()?,
            public_armor: public_armor.clone(),
        });
    }
    info!(
        fingerprint = %crate::openpgp::hex(&cert.fingerprint()),
        n = peers.len(),
        threshold,
        curve = C::NAME,
        "dealt threshold key"
    );
    Ok(out)
}

/// Write the dealt keys into `dir`, returning the paths written.
pub fn write_dealt_keys(dir: &Path, keys: &[DealtKey]) -> io::Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for key in keys {
        let secret = files::secret_key_path(dir, &key.peer);
        files::write_atomic(&secret, key.private_armor.as_bytes(), 0o600)?;
        let public = files::public_key_path(dir, &key.peer);
        files::write_atomic(&public, key.public_armor.as_bytes(), 0o644)?;
        written.push(secret);
        written.push(public);
    }
    Ok(written)
}

#[cfg(test)]
mod test {
    use k256::Secp256k1;
    use p256::NistP256;
    use rand_core::OsRng;

    use super::*;
    use crate::keyshare::KeyShare;
    use crate::openpgp::{check_self_signatures, check_subkeys, open_secret, weak, ArmorKind};

    #[test]
    fn test_dealt_keys_are_valid() {
        let peers = PeerList::canonicalize(["c", "a", "b"]).unwrap();
        let keys =
            deal_keys::<NistP256>(&mut OsRng, &peers, 1, "Test <t@example.org>", b"pw", 1_700_000_000)
                .unwrap();
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[0].peer, "a");
        for (i, key) in keys.iter().enumerate() {
            let (kind, mut cert) = Cert::from_armor(&key.private_armor).unwrap();
            assert_eq!(kind, ArmorKind::PrivateKeyBlock);
            assert!(check_self_signatures(&mut cert));
            check_subkeys(&mut cert);
            assert!(cert.subkeys[0].valid);
            assert!(!weak(&cert));

            let secret = cert.secret.as_ref().unwrap();
            let plain = open_secret(TAG_SECRET_KEY, cert.primary.body(), secret, b"pw").unwrap();
            let share = KeyShare::<NistP256>::from_bytes(&plain).unwrap();
            share.check().unwrap();
            assert_eq!(share.id().index(), i);
            assert_eq!(share.capl(), peers.as_slice());
            assert_eq!(
                NistP256::encode_point(share.public_key()),
                cert.primary.point
            );
        }
    }

    #[test]
    fn test_threshold_too_large() {
        let peers = PeerList::canonicalize(["a", "b", "c"]).unwrap();
        assert!(matches!(
            deal_keys::<Secp256k1>(&mut OsRng, &peers, 2, "x", b"", 0),
            Err(DealError::ThresholdTooLarge { threshold: 2, n: 3 })
        ));
    }

    #[test]
    fn test_write_dealt_keys() {
        let dir = tempfile::tempdir().unwrap();
        let peers = PeerList::canonicalize(["a", "b", "c"]).unwrap();
        let keys = deal_keys::<Secp256k1>(&mut OsRng, &peers, 1, "x", b"", 0).unwrap();
        let written = write_dealt_keys(dir.path(), &keys).unwrap();
        assert_eq!(written.len(), 6);
        assert!(files::secret_key_path(dir.path(), "b").exists());
        assert!(files::public_key_path(dir.path(), "c").exists());
    }
}
