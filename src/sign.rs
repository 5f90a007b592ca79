//! Threshold ECDSA signing over Shamir shared keys.
//!
//! The key `x` is shared with a polynomial of degree `t`. To sign a digest
//! `m`, the participants:
//!
//! 1. jointly share a random nonce `k` and a random mask `a` (degree `t`),
//!    and two sharings of zero `b` and `c` (degree `2t`), each party dealing
//!    a sub-sharing to everybody over the private channels,
//! 2. broadcast `v_i = k_i a_i + b_i` and `A_i = a_i G`; interpolating gives
//!    `mu = k a` from `2t + 1` values and `a G` from `t + 1` values, hence
//!    `R = mu^-1 a G = k^-1 G` and `r = x(R)`,
//! 3. broadcast `s_i = k_i (m + x_i r) + c_i`, a point on a degree `2t`
//!    polynomial whose value at zero is `k (m + x r)`,
//! 4. interpolate `s` from `2t + 1` values, and verify `(r, s)` against the
//!    public key before handing it out.
//!
//! Every party must deal in step 1; after that, the values of `2t + 1`
//! parties suffice. The products are masked by the zero sharings, so the
//! broadcast values reveal nothing beyond the signature.
use std::time::Instant;

use elliptic_curve::{Field, Group};
use rand_core::OsRng;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::compat::{self, PgpCurve, SerializablePoint};
use crate::keyshare::KeyShare;
use crate::lifecycle::Mapping;
use crate::math::Polynomial;
use crate::participants::ParticipantList;
use crate::protocol::internal::{MessageHeader, PrivateChannels};
use crate::protocol::{Participant, ProtocolError};
use crate::rbc::ReliableBroadcast;
use crate::serde::{decode, deserialize_scalar, encode, serialize_scalar};

/// An ECDSA signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FullSignature<C: PgpCurve> {
    pub r: C::Scalar,
    pub s: C::Scalar,
}

impl<C: PgpCurve> FullSignature<C> {
    #[must_use]
    pub fn verify(&self, public_key: &C::AffinePoint, msg_hash: &C::Scalar) -> bool {
        if self.r.is_zero().into() || self.s.is_zero().into() {
            return false;
        }
        let s_inv = match Option::<C::Scalar>::from(self.s.invert()) {
            Some(s_inv) => s_inv,
            None => return false,
        };
        let reproduced = (C::ProjectivePoint::generator() * (*msg_hash * s_inv))
            + (C::ProjectivePoint::from(*public_key) * (self.r * s_inv));
        compat::x_coordinate::<C>(&reproduced.into()) == self.r
    }
}

#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
struct Deal<C: PgpCurve> {
    #[serde(
        serialize_with = "serialize_scalar::<C, _>",
        deserialize_with = "deserialize_scalar::<C, _>"
    )]
    k: C::Scalar,
    #[serde(
        serialize_with = "serialize_scalar::<C, _>",
        deserialize_with = "deserialize_scalar::<C, _>"
    )]
    a: C::Scalar,
    #[serde(
        serialize_with = "serialize_scalar::<C, _>",
        deserialize_with = "deserialize_scalar::<C, _>"
    )]
    b: C::Scalar,
    #[serde(
        serialize_with = "serialize_scalar::<C, _>",
        deserialize_with = "deserialize_scalar::<C, _>"
    )]
    c: C::Scalar,
}

impl<C: PgpCurve> Drop for Deal<C> {
    fn drop(&mut self) {
        self.k = C::Scalar::ZERO;
        self.a = C::Scalar::ZERO;
        self.b = C::Scalar::ZERO;
        self.c = C::Scalar::ZERO;
    }
}

#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
struct Masked<C: PgpCurve> {
    #[serde(
        serialize_with = "serialize_scalar::<C, _>",
        deserialize_with = "deserialize_scalar::<C, _>"
    )]
    v: C::Scalar,
    big_a: SerializablePoint<C>,
}

#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
struct SignatureShare<C: PgpCurve> {
    #[serde(
        serialize_with = "serialize_scalar::<C, _>",
        deserialize_with = "deserialize_scalar::<C, _>"
    )]
    s: C::Scalar,
}

/// Interpolate at zero from the first `degree + 1` of the given values.
fn interpolate<C: PgpCurve, T>(values: &[(Participant, T)], degree: usize) -> Option<T>
where
    T: Copy + std::ops::Mul<C::Scalar, Output = T> + std::ops::Add<Output = T>,
{
    let chosen = values.get(..degree + 1)?;
    let ids: Vec<Participant> = chosen.iter().map(|(p, _)| *p).collect();
    let list = ParticipantList::new(&ids)?;
    chosen
        .iter()
        .map(|(p, v)| *v * list.lagrange::<C>(*p))
        .reduce(|acc, x| acc + x)
}

/// Signs digests with one participant's share of a threshold key.
pub struct ThresholdSigner<'a, C: PgpCurve> {
    share: &'a KeyShare<C>,
    mapping: &'a Mapping,
    me: Participant,
}

impl<'a, C: PgpCurve> ThresholdSigner<'a, C> {
    /// `me` is the canonical index of this participant in the current run.
    pub fn new(share: &'a KeyShare<C>, mapping: &'a Mapping, me: Participant) -> Self {
        Self { share, mapping, me }
    }

    fn others(&self) -> Vec<Participant> {
        (0..self.mapping.len() as u32)
            .map(Participant::from)
            .filter(|p| *p != self.me)
            .collect()
    }

    /// Deliver one value from every other party, keyed by scheme id.
    ///
    /// Parties that fail to deliver are logged and left out.
    async fn collect<T: DeserializeOwned>(
        &self,
        rbc: &mut ReliableBroadcast,
        what: &str,
    ) -> Result<Vec<(Participant, T)>, ProtocolError> {
        let mut out = Vec::new();
        for p in self.others() {
            match rbc.deliver_from(p, rbc.deadline()).await {
                Ok(data) => match decode::<T>(&data) {
                    Ok(value) => out.push((self.mapping.scheme_id(p), value)),
                    Err(e) => warn!(participant = %self.me, peer = %p, "malformed {what}: {e}"),
                },
                Err(e) if e.is_liveness_fault() => {
                    warn!(participant = %self.me, peer = %p, "no {what}: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Jointly sign a digest.
    ///
    /// `sub_channel` must be distinct for every signature made over the same
    /// private channels.
    pub async fn sign_hash(
        &self,
        digest: &[u8],
        unicast: &mut PrivateChannels,
        rbc: &mut ReliableBroadcast,
        sub_channel: u16,
    ) -> Result<FullSignature<C>, ProtocolError> {
        let mut rng = OsRng;
        let t = self.share.threshold();
        let needed = 2 * t + 1;
        if self.mapping.len() < needed {
            return Err(ProtocolError::AssertionFailed(format!(
                "{} participants cannot sign with threshold {t}",
                self.mapping.len()
            )));
        }
        let m = compat::digest_to_scalar::<C>(digest).ok_or_else(|| {
            ProtocolError::AssertionFailed("digest too short for the curve".to_string())
        })?;
        let my_id = self.mapping.scheme_id(self.me);
        let others = self.others();

        // Round 1: joint sharings of k and a, zero sharings b and c.
        let f_k = Polynomial::<C>::random(&mut rng, t + 1);
        let f_a = Polynomial::<C>::random(&mut rng, t + 1);
        let f_b = Polynomial::<C>::random_zero(&mut rng, 2 * t + 1);
        let f_c = Polynomial::<C>::random_zero(&mut rng, 2 * t + 1);
        let mut header = MessageHeader::new(sub_channel);
        let wait0 = header.next_waitpoint();
        for &p in &others {
            let x = self.mapping.scheme_id(p).scalar::<C>();
            let deal = Deal::<C> {
                k: f_k.evaluate(&x),
                a: f_a.evaluate(&x),
                b: f_b.evaluate(&x),
                c: f_c.evaluate(&x),
            };
            unicast.send_private(header.with_waitpoint(wait0), p, &deal);
        }
        let x_me = my_id.scalar::<C>();
        let mut k_i = Zeroizing::new(f_k.evaluate(&x_me));
        let mut a_i = Zeroizing::new(f_a.evaluate(&x_me));
        let mut b_i = Zeroizing::new(f_b.evaluate(&x_me));
        let mut c_i = Zeroizing::new(f_c.evaluate(&x_me));
        for &p in &others {
            let deadline = Instant::now() + rbc.timeout();
            let deal: Deal<C> = unicast
                .recv_from(header.with_waitpoint(wait0), p, deadline)
                .await?;
            *k_i += deal.k;
            *a_i += deal.a;
            *b_i += deal.b;
            *c_i += deal.c;
        }
        debug!(participant = %self.me, sub_channel, "sharings dealt");

        // Round 2: open mu = k a and a G.
        let masked = Masked::<C> {
            v: *k_i * *a_i + *b_i,
            big_a: SerializablePoint::from_projective(&(C::ProjectivePoint::generator() * *a_i)),
        };
        let mut mus = vec![(my_id, masked.v)];
        let mut big_as = vec![(my_id, masked.big_a.to_projective())];
        rbc.broadcast(encode(&masked));
        for (p, theirs) in self.collect::<Masked<C>>(rbc, "masked nonce").await? {
            mus.push((p, theirs.v));
            big_as.push((p, theirs.big_a.to_projective()));
        }
        if mus.len() < needed {
            return Err(ProtocolError::AssertionFailed(format!(
                "only {} of {needed} masked nonces delivered",
                mus.len()
            )));
        }
        mus.sort_by_key(|(p, _)| *p);
        big_as.sort_by_key(|(p, _)| *p);
        let mu = interpolate::<C, C::Scalar>(&mus, 2 * t)
            .ok_or_else(|| ProtocolError::AssertionFailed("duplicate nonce shares".to_string()))?;
        let big_a = interpolate::<C, C::ProjectivePoint>(&big_as, t)
            .ok_or_else(|| ProtocolError::AssertionFailed("duplicate nonce shares".to_string()))?;
        let mu_inv = Option::<C::Scalar>::from(mu.invert())
            .ok_or_else(|| ProtocolError::AssertionFailed("masked nonce is zero".to_string()))?;
        let big_r: C::AffinePoint = (big_a * mu_inv).into();
        let r = compat::x_coordinate::<C>(&big_r);
        if bool::from(r.is_zero()) {
            return Err(ProtocolError::AssertionFailed("r is zero".to_string()));
        }

        // Round 3: open s = k (m + x r).
        let s_i = *k_i * (m + *self.share.secret() * r) + *c_i;
        let mut ss = vec![(my_id, s_i)];
        rbc.broadcast(encode(&SignatureShare::<C> { s: s_i }));
        for (p, theirs) in self
            .collect::<SignatureShare<C>>(rbc, "signature share")
            .await?
        {
            ss.push((p, theirs.s));
        }
        if ss.len() < needed {
            return Err(ProtocolError::AssertionFailed(format!(
                "only {} of {needed} signature shares delivered",
                ss.len()
            )));
        }
        ss.sort_by_key(|(p, _)| *p);
        let s = interpolate::<C, C::Scalar>(&ss, 2 * t)
            .ok_or_else(|| ProtocolError::AssertionFailed("duplicate signature shares".to_string()))?;

        let sig = FullSignature { r, s };
        if !sig.verify(self.share.public_key(), &m) {
            return Err(ProtocolError::AssertionFailed(
                "signature failed to verify".to_string(),
            ));
        }
        debug!(participant = %self.me, sub_channel, "signature combined and verified");
        Ok(sig)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use ecdsa::signature::hazmat::PrehashVerifier;
    use p256::ecdsa::{Signature, VerifyingKey};
    use p256::NistP256;
    use sha2::{Digest, Sha256};

    use super::*;
    use crate::keyshare::deal;
    use crate::participants::PeerList;
    use crate::transport::{pipe, ChannelKeys, ChannelKind, Transport};

    struct Party {
        me: Participant,
        unicast: PrivateChannels,
        rbc: ReliableBroadcast,
    }

    fn parties(peers: &PeerList) -> Vec<Party> {
        let n = peers.len();
        let mut transports = pipe::network(n);
        transports
            .iter_mut()
            .enumerate()
            .map(|(i, transport)| {
                let me = Participant::from(i as u32);
                let keys = ChannelKeys::labels("test", me, n);
                let unicast =
                    smol::block_on(transport.open(ChannelKind::Unicast, &keys)).unwrap();
                let broadcast =
                    smol::block_on(transport.open(ChannelKind::Broadcast, &keys)).unwrap();
                let mut rbc = ReliableBroadcast::new(
                    n,
                    peers.resilience(),
                    me,
                    broadcast,
                    Duration::from_secs(5),
                )
                .unwrap();
                rbc.set_id(&peers.protocol_id("test", "1"));
                Party {
                    me,
                    unicast: PrivateChannels::new(unicast),
                    rbc,
                }
            })
            .collect()
    }

    #[test]
    fn test_sign_verifies_with_p256() {
        let peers = PeerList::canonicalize(["a", "b", "c"]).unwrap();
        let (_, shares) = deal::<NistP256>(&mut OsRng, peers.as_slice(), 1);
        let mapping = Mapping::create(peers.as_slice(), &peers).unwrap();
        let digest = Sha256::digest(b"hello?").to_vec();

        let results = easy_parallel::Parallel::new()
            .each(parties(&peers).into_iter().zip(&shares), |(mut party, share)| {
                let signer = ThresholdSigner::new(share, &mapping, party.me);
                smol::block_on(async {
                    let sig = signer
                        .sign_hash(&digest, &mut party.unicast, &mut party.rbc, 0)
                        .await;
                    party.rbc.sync(Duration::from_millis(20)).await;
                    sig
                })
            })
            .run();

        let public_key = p256::PublicKey::from_affine(*shares[0].public_key()).unwrap();
        let verifying_key = VerifyingKey::from(&public_key);
        let first = results[0].as_ref().unwrap().clone();
        for result in results {
            let sig = result.unwrap();
            assert_eq!(sig, first);
            let sig = Signature::from_scalars(sig.r, sig.s).unwrap();
            verifying_key.verify_prehash(&digest, &sig).unwrap();
        }
    }

    #[test]
    fn test_two_signatures_over_one_channel_set() {
        let peers = PeerList::canonicalize(["a", "b", "c", "d"]).unwrap();
        let (_, shares) = deal::<NistP256>(&mut OsRng, peers.as_slice(), 1);
        let mapping = Mapping::create(peers.as_slice(), &peers).unwrap();
        let digests = [Sha256::digest(b"one").to_vec(), Sha256::digest(b"two").to_vec()];

        let results = easy_parallel::Parallel::new()
            .each(parties(&peers).into_iter().zip(&shares), |(mut party, share)| {
                let signer = ThresholdSigner::new(share, &mapping, party.me);
                smol::block_on(async {
                    let mut out = Vec::new();
                    for (i, digest) in digests.iter().enumerate() {
                        out.push(
                            signer
                                .sign_hash(digest, &mut party.unicast, &mut party.rbc, i as u16)
                                .await?,
                        );
                    }
                    party.rbc.sync(Duration::from_millis(20)).await;
                    Ok::<_, ProtocolError>(out)
                })
            })
            .run();
        for result in results {
            let sigs = result.unwrap();
            for (sig, digest) in sigs.iter().zip(&digests) {
                let m = compat::digest_to_scalar::<NistP256>(digest).unwrap();
                assert!(sig.verify(shares[0].public_key(), &m));
            }
        }
    }

    #[test]
    fn test_corrupted_share_fails() {
        let peers = PeerList::canonicalize(["a", "b", "c"]).unwrap();
        let (_, mut shares) = deal::<NistP256>(&mut OsRng, peers.as_slice(), 1);
        shares[1].corrupt();
        let mapping = Mapping::create(peers.as_slice(), &peers).unwrap();
        let digest = Sha256::digest(b"hello?").to_vec();

        let results = easy_parallel::Parallel::new()
            .each(parties(&peers).into_iter().zip(&shares), |(mut party, share)| {
                let signer = ThresholdSigner::new(share, &mapping, party.me);
                smol::block_on(async {
                    let sig = signer
                        .sign_hash(&digest, &mut party.unicast, &mut party.rbc, 0)
                        .await;
                    party.rbc.sync(Duration::from_millis(20)).await;
                    sig
                })
            })
            .run();
        for result in results {
            assert!(matches!(result, Err(ProtocolError::AssertionFailed(_))));
        }
    }
}
