//! Shamir shares of a threshold ECDSA key.
//!
//! A share records the canonical peer list the key was created for (the
//! CAPL), the degree of the sharing polynomial, its owner's position in the
//! CAPL, the secret share, and the public verification points `V_j = f(j) G`
//! of every position. The verification points let every holder check its own
//! share and recompute the public key without trusting the key file.
use elliptic_curve::{Field, Group};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::compat::{PgpCurve, SerializablePoint};
use crate::math::Polynomial;
use crate::participants::ParticipantList;
use crate::protocol::Participant;
use crate::serde::{decode, deserialize_scalar, encode, serialize_scalar};

#[derive(Debug, Error)]
pub enum KeyShareError {
    #[error("malformed key share: {0}")]
    Malformed(String),
    #[error("inconsistent key share: {0}")]
    Inconsistent(String),
}

#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
struct KeyShareData<C: PgpCurve> {
    capl: Vec<String>,
    threshold: usize,
    id: Participant,
    #[serde(
        serialize_with = "serialize_scalar::<C, _>",
        deserialize_with = "deserialize_scalar::<C, _>"
    )]
    share: C::Scalar,
    verification: Vec<SerializablePoint<C>>,
    public_key: SerializablePoint<C>,
}

impl<C: PgpCurve> Drop for KeyShareData<C> {
    fn drop(&mut self) {
        self.share = C::Scalar::ZERO;
    }
}

/// One participant's share of a threshold key.
pub struct KeyShare<C: PgpCurve> {
    capl: Vec<String>,
    threshold: usize,
    id: Participant,
    share: Zeroizing<C::Scalar>,
    verification: Vec<C::AffinePoint>,
    public_key: C::AffinePoint,
}

impl<C: PgpCurve> KeyShare<C> {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyShareError> {
        let data: KeyShareData<C> =
            decode(bytes).map_err(|e| KeyShareError::Malformed(e.to_string()))?;
        Ok(Self {
            capl: data.capl.clone(),
            threshold: data.threshold,
            id: data.id,
            share: Zeroizing::new(data.share),
            verification: data.verification.iter().map(|p| p.to_affine()).collect(),
            public_key: data.public_key.to_affine(),
        })
    }

    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let data = KeyShareData::<C> {
            capl: self.capl.clone(),
            threshold: self.threshold,
            id: self.id,
            share: *self.share,
            verification: self
                .verification
                .iter()
                .map(|p| SerializablePoint::from_affine(*p))
                .collect(),
            public_key: SerializablePoint::from_affine(self.public_key),
        };
        Zeroizing::new(encode(&data))
    }

    /// The canonical peer list the key was created for.
    pub fn capl(&self) -> &[String] {
        &self.capl
    }

    /// The degree of the sharing polynomial.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn id(&self) -> Participant {
        self.id
    }

    pub fn public_key(&self) -> &C::AffinePoint {
        &self.public_key
    }

    pub(crate) fn secret(&self) -> &C::Scalar {
        &self.share
    }

    #[cfg(test)]
    pub(crate) fn corrupt(&mut self) {
        *self.share += C::Scalar::ONE;
    }

    /// Check the share against the public values stored with it.
    ///
    /// This confirms `share * G = V_id`, and that the verification points of
    /// the first `threshold + 1` positions interpolate to the public key.
    pub fn check(&self) -> Result<(), KeyShareError> {
        let n = self.capl.len();
        if n == 0 || self.verification.len() != n {
            return Err(KeyShareError::Inconsistent(format!(
                "{} verification points for {} peers",
                self.verification.len(),
                n
            )));
        }
        if self.id.index() >= n {
            return Err(KeyShareError::Inconsistent(format!(
                "share id {} outside of {} peers",
                self.id, n
            )));
        }
        if 2 * self.threshold + 1 > n {
            return Err(KeyShareError::Inconsistent(format!(
                "threshold {} needs {} peers, found {}",
                self.threshold,
                2 * self.threshold + 1,
                n
            )));
        }
        let public_key = C::ProjectivePoint::from(self.public_key);
        if bool::from(public_key.is_identity()) {
            return Err(KeyShareError::Inconsistent("public key is the identity".to_string()));
        }
        let mine = C::ProjectivePoint::generator() * *self.share;
        if mine != C::ProjectivePoint::from(self.verification[self.id.index()]) {
            return Err(KeyShareError::Inconsistent(
                "share does not match its verification point".to_string(),
            ));
        }
        let ids: Vec<Participant> = (0..=self.threshold as u32).map(Participant::from).collect();
        let list = ParticipantList::new(&ids)
            .ok_or_else(|| KeyShareError::Inconsistent("duplicate ids".to_string()))?;
        let mut acc = C::ProjectivePoint::identity();
        for p in list.iter() {
            acc += C::ProjectivePoint::from(self.verification[p.index()]) * list.lagrange::<C>(p);
        }
        if acc != public_key {
            return Err(KeyShareError::Inconsistent(
                "verification points do not interpolate to the public key".to_string(),
            ));
        }
        Ok(())
    }
}

/// Create shares of a fresh key for every peer of `capl`.
///
/// This is a trusted dealer: the full secret exists here, and is returned
/// so the caller can make the self-signatures a new key needs.
pub fn deal<C: PgpCurve>(
    rng: &mut impl CryptoRngCore,
    capl: &[String],
    threshold: usize,
) -> (Zeroizing<C::Scalar>, Vec<KeyShare<C>>) {
    let secret = Zeroizing::new(C::Scalar::random(&mut *rng));
    let f = Polynomial::<C>::extend_random(rng, threshold + 1, &secret);
    let public_key: C::AffinePoint = (C::ProjectivePoint::generator() * *secret).into();
    let points: Vec<C::Scalar> = (0..capl.len() as u32)
        .map(|i| f.evaluate(&Participant::from(i).scalar::<C>()))
        .collect();
    let verification: Vec<C::AffinePoint> = points
        .iter()
        .map(|x| (C::ProjectivePoint::generator() * x).into())
        .collect();
    let shares = points
        .into_iter()
        .enumerate()
        .map(|(i, share)| KeyShare {
            capl: capl.to_vec(),
            threshold,
            id: Participant::from(i as u32),
            share: Zeroizing::new(share),
            verification: verification.clone(),
            public_key,
        })
        .collect();
    (secret, shares)
}

#[cfg(test)]
mod test {
    use super::*;
    use k256::Secp256k1;
    use p256::NistP256;
    use rand_core::OsRng;

    fn capl(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("peer{i}")).collect()
    }

    #[test]
    fn test_dealt_shares_check() {
        let (secret, shares) = deal::<NistP256>(&mut OsRng, &capl(5), 2);
        let public_key: p256::AffinePoint = (p256::ProjectivePoint::GENERATOR * *secret).into();
        for share in &shares {
            share.check().unwrap();
            assert_eq!(share.public_key(), &public_key);
        }
    }

    #[test]
    fn test_serialized_share_checks() {
        let (_, shares) = deal::<Secp256k1>(&mut OsRng, &capl(3), 1);
        let back = KeyShare::<Secp256k1>::from_bytes(&shares[2].to_bytes()).unwrap();
        back.check().unwrap();
        assert_eq!(back.id(), Participant::from(2u32));
        assert_eq!(back.capl(), shares[2].capl());
        assert_eq!(back.secret(), shares[2].secret());
    }

    #[test]
    fn test_corrupted_share_fails_check() {
        let (_, mut shares) = deal::<NistP256>(&mut OsRng, &capl(3), 1);
        shares[0].corrupt();
        assert!(matches!(
            shares[0].check(),
            Err(KeyShareError::Inconsistent(_))
        ));
    }

    #[test]
    fn test_threshold_too_large() {
        let (_, shares) = deal::<NistP256>(&mut OsRng, &capl(3), 2);
        assert!(shares[0].check().is_err());
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            KeyShare::<NistP256>::from_bytes(&[1, 2, 3]),
            Err(KeyShareError::Malformed(_))
        ));
    }
}
