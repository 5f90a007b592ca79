//! Revoking a threshold key, start to finish, as one participant.
//!
//! A run goes through these steps, failing as a whole at the first error:
//!
//! 1. load and check the key, map the peers onto the key's share holders,
//! 2. open the private and the broadcast channels to every peer,
//! 3. run the exchange test, agree on the signature time, pick the hash,
//! 4. make one signature per [`SigningJob`], strictly in order, checking
//!    each before attaching it to the key,
//! 5. keep serving the broadcast for a while, then release the channels,
//! 6. write both key files.
//!
//! Nothing is written unless every signature was made and verified.
use std::path::Path;

use k256::Secp256k1;
use p256::NistP256;
use tracing::{error, info, warn};

use crate::agreement::{self, AgreedParameters, AgreementError};
use crate::compat::{self, CurveKind, PgpCurve};
use crate::config::RevokeConfig;
use crate::error::{RevokeError, SetupFailure};
use crate::files;
use crate::lifecycle::{self, Channels, KeyError, ParticipantState};
use crate::openpgp::{
    hex, key_hash, prepare_revocation, verify_revocation, Cert, PublicKeyPacket, RevocationCode,
    Signature, SignatureType,
};
use crate::participants::PeerList;
use crate::protocol::Participant;
use crate::sign::FullSignature;
use crate::transport::Transport;

/// The name of this tool, part of every protocol identifier.
pub const TOOL: &str = "threshold-revoke";
/// The version of the revocation protocol.
pub const PROTOCOL_VERSION: &str = "1";

/// Which key a job revokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Primary,
    /// The subkey at this position of the key.
    Subkey(usize),
}

/// One revocation signature to make.
#[derive(Debug, Clone)]
pub struct SigningJob {
    pub kind: JobKind,
    pub trailer: Vec<u8>,
    pub digest: Vec<u8>,
}

impl SigningJob {
    /// Build the signature trailer and the digest to sign.
    ///
    /// This needs no communication: every input is either part of the key or
    /// was agreed on.
    pub fn prepare(
        cert: &Cert,
        kind: JobKind,
        params: &AgreedParameters,
        code: RevocationCode,
        reason: &str,
    ) -> Self {
        let (sigtype, subkey) = match kind {
            JobKind::Primary => (SignatureType::KeyRevocation, None),
            JobKind::Subkey(i) => (SignatureType::SubkeyRevocation, Some(&cert.subkeys[i].key)),
        };
        let trailer = prepare_revocation(
            sigtype,
            &cert.primary,
            params.hash,
            params.common_time,
            code,
            reason,
        );
        let digest = key_hash(params.hash, &cert.primary, subkey, &trailer);
        Self {
            kind,
            trailer,
            digest,
        }
    }

    /// The first two bytes of the digest, stored in the signature packet.
    pub fn left16(&self) -> [u8; 2] {
        [self.digest[0], self.digest[1]]
    }

    fn subkey<'a>(&self, cert: &'a Cert) -> Option<&'a PublicKeyPacket> {
        match self.kind {
            JobKind::Primary => None,
            JobKind::Subkey(i) => Some(&cert.subkeys[i].key),
        }
    }

    /// Wrap a signature into a packet.
    pub fn assemble<C: PgpCurve>(
        &self,
        cert: &Cert,
        sig: &FullSignature<C>,
    ) -> Result<Signature, RevokeError> {
        Signature::from_trailer(
            &self.trailer,
            &cert.primary.key_id(),
            self.left16(),
            &compat::scalar_to_bytes::<C>(&sig.r),
            &compat::scalar_to_bytes::<C>(&sig.s),
        )
        .map_err(|e| RevokeError::SigningFailed(format!("assembling the signature: {e}")))
    }

    /// Attach a revocation to the key, after checking it once more.
    ///
    /// The check recomputes the digest from the packet, so it catches any
    /// disagreement between the trailer signed and the trailer stored.
    fn attach(&self, cert: &mut Cert, packet: Signature) -> Result<(), RevokeError> {
        if !verify_revocation(cert, &packet, self.subkey(cert)) {
            return Err(RevokeError::SigningFailed(
                "revocation packet does not verify".to_string(),
            ));
        }
        match self.kind {
            JobKind::Primary => cert.revocations.push(packet),
            JobKind::Subkey(i) => cert.subkeys[i].revocations.push(packet),
        }
        Ok(())
    }
}

/// The reason code to put into revocations, given the one asked for.
pub fn normalize_reason(code: u32) -> RevocationCode {
    match code {
        0..=3 => RevocationCode(code as u8),
        32 => {
            warn!("reason code 32 only applies to user ids, using 0 instead");
            RevocationCode::NO_REASON
        }
        code if code >= 255 => {
            warn!("reason code {code} out of range, ignored");
            RevocationCode::NO_REASON
        }
        code => {
            let code = RevocationCode(code as u8);
            warn!("unknown reason code {}, used anyway", code.0);
            code
        }
    }
}

/// The key of one participant after a successful run.
pub struct RevocationOutput {
    pub peer: String,
    pub cert: Cert,
    pub private_armor: String,
    pub public_armor: String,
}

impl RevocationOutput {
    fn new(peer: &str, cert: Cert) -> Result<Self, RevokeError> {
        let private_armor = cert
            .private_armor()
            .map_err(|e| RevokeError::ExportFailed(e.to_string()))?;
        let public_armor = cert.public_armor();
        Ok(Self {
            peer: peer.to_string(),
            cert,
            private_armor,
            public_armor,
        })
    }

    /// Write both key files into `dir`, replacing the old ones together.
    pub fn export(&self, dir: &Path) -> Result<(), RevokeError> {
        let secret = files::secret_key_path(dir, &self.peer);
        let public = files::public_key_path(dir, &self.peer);
        files::write_atomic_all(&[
            (secret.as_path(), self.private_armor.as_bytes(), 0o600),
            (public.as_path(), self.public_armor.as_bytes(), 0o644),
        ])
        .map_err(|e| RevokeError::ExportFailed(format!("writing key files: {e}")))?;
        info!(peer = %self.peer, dir = %dir.display(), "exported revoked key");
        Ok(())
    }
}

fn key_error(e: KeyError) -> RevokeError {
    let kind = match &e {
        KeyError::Io { .. } => SetupFailure::Io,
        KeyError::InvalidKeyMaterial(_) => SetupFailure::InvalidKeyMaterial,
        KeyError::UnsupportedAlgorithm(_) => SetupFailure::UnsupportedAlgorithm,
    };
    RevokeError::setup(kind, e)
}

fn agreement_error(e: AgreementError) -> RevokeError {
    RevokeError::AgreementFailed(e.to_string())
}

/// Revoke the key of participant `me`, talking to the others over `transport`.
///
/// On success both key files in the key directory have been replaced.
pub async fn revoke<T: Transport>(
    config: &RevokeConfig,
    peers: &PeerList,
    me: Participant,
    transport: &mut T,
) -> Result<RevocationOutput, RevokeError> {
    let result = revoke_inner(config, peers, me, transport).await;
    if let Err(e) = &result {
        error!(participant = %me, "{e}");
    }
    result
}

async fn revoke_inner<T: Transport>(
    config: &RevokeConfig,
    peers: &PeerList,
    me: Participant,
    transport: &mut T,
) -> Result<RevocationOutput, RevokeError> {
    let peer = peers.name(me);
    let passphrase = lifecycle::initial_passphrase(config.passphrase_env.as_deref());
    let key = lifecycle::load_key(&config.key_dir, peer, &passphrase).map_err(key_error)?;
    let output = match key.curve {
        CurveKind::NistP256 => {
            let state =
                ParticipantState::<NistP256>::new(peers.clone(), me, key).map_err(key_error)?;
            run(config, state, transport).await?
        }
        CurveKind::Secp256k1 => {
            let state =
                ParticipantState::<Secp256k1>::new(peers.clone(), me, key).map_err(key_error)?;
            run(config, state, transport).await?
        }
    };
    output.export(&config.key_dir)?;
    Ok(output)
}

pub(crate) async fn run<C: PgpCurve, T: Transport>(
    config: &RevokeConfig,
    state: ParticipantState<C>,
    transport: &mut T,
) -> Result<RevocationOutput, RevokeError> {
    let me = state.me;
    let peers = &state.peers;
    let subkeys = config
        .subkeys
        .select(&state.cert.subkeys)
        .map_err(|e| RevokeError::setup(SetupFailure::Usage, e))?;
    let code = normalize_reason(config.reason_code);
    let keys = config
        .channel_keys(TOOL, peers, me)
        .map_err(|e| RevokeError::setup(SetupFailure::Usage, e))?;

    let protocol_id = peers.protocol_id(TOOL, PROTOCOL_VERSION);
    let mut channels = lifecycle::establish_channels(
        transport,
        &keys,
        peers,
        me,
        config.timeout,
        &protocol_id,
    )
    .await
    .map_err(|e| RevokeError::setup(SetupFailure::Channels, e))?;

    let result = sign_all(config, &state, &mut channels, &subkeys, code).await;
    if result.is_ok() {
        channels.rbc.sync(config.sync_unit()).await;
    }
    channels.release();
    let cert = result?;
    RevocationOutput::new(peers.name(me), cert)
}

async fn sign_all<C: PgpCurve>(
    config: &RevokeConfig,
    state: &ParticipantState<C>,
    channels: &mut Channels,
    subkeys: &[usize],
    code: RevocationCode,
) -> Result<Cert, RevokeError> {
    let me = state.me;
    agreement::exchange_test(&mut channels.rbc, &state.peers, config.exchange_tests)
        .await
        .map_err(agreement_error)?;
    let common_time = agreement::agree_time(&mut channels.rbc, &state.peers, agreement::local_time())
        .await
        .map_err(agreement_error)?;
    let hash = agreement::select_hash_algorithm(C::BITS).map_err(agreement_error)?;
    let params = AgreedParameters { common_time, hash };
    info!(participant = %me, common_time, %hash, "parameters agreed");

    let mut cert = state.cert.clone();
    let jobs: Vec<SigningJob> = std::iter::once(JobKind::Primary)
        .chain(subkeys.iter().map(|i| JobKind::Subkey(*i)))
        .map(|kind| SigningJob::prepare(&cert, kind, &params, code, &config.reason))
        .collect();
    let signer = state.signer();
    for (i, job) in jobs.iter().enumerate() {
        let sub_channel = u16::try_from(i)
            .map_err(|_| RevokeError::SigningFailed("too many signing jobs".to_string()))?;
        let sig = signer
            .sign_hash(&job.digest, &mut channels.unicast, &mut channels.rbc, sub_channel)
            .await
            .map_err(|e| RevokeError::SigningFailed(format!("job {i} ({:?}): {e}", job.kind)))?;
        let packet = job.assemble(&cert, &sig)?;
        job.attach(&mut cert, packet)?;
        let target = match job.kind {
            JobKind::Primary => hex(&cert.fingerprint()),
            JobKind::Subkey(k) => hex(&cert.subkeys[k].key.fingerprint()),
        };
        info!(participant = %me, job = i, %target, "revocation signed");
    }
    Ok(cert)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::openpgp::HashAlgorithm;

    #[test]
    fn test_reason_codes() {
        assert_eq!(normalize_reason(2), RevocationCode::COMPROMISED);
        assert_eq!(normalize_reason(32), RevocationCode::NO_REASON);
        assert_eq!(normalize_reason(255), RevocationCode::NO_REASON);
        assert_eq!(normalize_reason(1000), RevocationCode::NO_REASON);
        assert_eq!(normalize_reason(100), RevocationCode(100));
    }

    #[test]
    fn test_jobs_hash_different_material() {
        let primary = PublicKeyPacket::ecdsa(1, CurveKind::NistP256.oid(), &[4, 1]);
        let sub = PublicKeyPacket::ecdh(1, CurveKind::NistP256.oid(), &[4, 2], 8, 9);
        let mut cert = Cert::new(primary);
        cert.subkeys.push(crate::openpgp::Subkey {
            key: sub,
            secret: None,
            bindings: Vec::new(),
            revocations: Vec::new(),
            valid: true,
        });
        let params = AgreedParameters {
            common_time: 1_700_000_000,
            hash: HashAlgorithm::Sha256,
        };
        let primary = SigningJob::prepare(&cert, JobKind::Primary, &params, RevocationCode::NO_REASON, "");
        let subkey = SigningJob::prepare(&cert, JobKind::Subkey(0), &params, RevocationCode::NO_REASON, "");
        assert_eq!(primary.trailer[1], 0x20);
        assert_eq!(subkey.trailer[1], 0x28);
        assert_ne!(primary.digest, subkey.digest);
        assert_eq!(primary.left16(), [primary.digest[0], primary.digest[1]]);
        // Preparing is deterministic in the agreed parameters.
        let again = SigningJob::prepare(&cert, JobKind::Primary, &params, RevocationCode::NO_REASON, "");
        assert_eq!(again.digest, primary.digest);
    }
}
