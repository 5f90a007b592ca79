//! Setting a participant up: its key, its place in the run, its channels.
//!
//! Everything here happens before the first protocol message, and every
//! failure is fatal to the participant. A participant never continues with a
//! partial channel set, since the broadcast assumes all `n` parties are
//! connected.
use std::io::IsTerminal;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::compat::{CurveKind, PgpCurve};
use crate::files;
use crate::keyshare::KeyShare;
use crate::openpgp::{
    check_self_signatures, check_subkeys, hex, open_secret, reduce, weak, ArmorKind, Cert,
    CodecError, PKALGO_ECDSA, TAG_SECRET_KEY,
};
use crate::participants::PeerList;
use crate::passphrase;
use crate::protocol::internal::PrivateChannels;
use crate::protocol::{InitializationError, Participant};
use crate::rbc::ReliableBroadcast;
use crate::sign::ThresholdSigner;
use crate::transport::{ChannelKeys, ChannelKind, Transport, TransportError};

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),
    #[error("unsupported key algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

fn invalid(reason: impl ToString) -> KeyError {
    KeyError::InvalidKeyMaterial(reason.to_string())
}

/// A private key read from disk, checked, with its share decrypted.
pub struct LoadedKey {
    pub cert: Cert,
    pub curve: CurveKind,
    share: Zeroizing<Vec<u8>>,
}

impl LoadedKey {
    /// The serialized key share.
    pub fn share_bytes(&self) -> &[u8] {
        &self.share
    }
}

fn decrypt(cert: &Cert, secret: &[u8], passphrase: &[u8]) -> Result<Zeroizing<Vec<u8>>, CodecError> {
    open_secret(TAG_SECRET_KEY, cert.primary.body(), secret, passphrase)
}

/// Read the private key of `peer` from `dir`.
///
/// The key is decrypted with `passphrase`; if that fails and standard input
/// is a terminal, the user is asked for the passphrase.
pub fn load_key(dir: &Path, peer: &str, passphrase: &[u8]) -> Result<LoadedKey, KeyError> {
    let path = files::secret_key_path(dir, peer);
    let io_error = |source: std::io::Error| KeyError::Io {
        path: path.display().to_string(),
        source,
    };
    if !path.exists() {
        return Err(invalid(format!("{} does not exist", path.display())));
    }
    files::restrict_permissions(&path).map_err(io_error)?;
    let text = std::fs::read_to_string(&path).map_err(io_error)?;

    let (kind, mut cert) = Cert::from_armor(&text).map_err(|e| match e {
        CodecError::Unsupported(what) => KeyError::UnsupportedAlgorithm(what),
        e => invalid(e),
    })?;
    if kind != ArmorKind::PrivateKeyBlock {
        return Err(invalid("not a private key block"));
    }
    if cert.primary.algorithm != PKALGO_ECDSA {
        return Err(KeyError::UnsupportedAlgorithm(format!(
            "primary key algorithm {}",
            cert.primary.algorithm
        )));
    }
    let curve = cert.primary.curve().ok_or_else(|| {
        KeyError::UnsupportedAlgorithm(format!("curve OID {}", hex(&cert.primary.oid)))
    })?;
    if weak(&cert) {
        return Err(invalid("weak public key"));
    }
    if !check_self_signatures(&mut cert) {
        return Err(invalid("primary key is revoked or has no valid user id"));
    }
    check_subkeys(&mut cert);
    reduce(&mut cert);

    let secret = cert
        .secret
        .clone()
        .ok_or_else(|| invalid("no secret key material"))?;
    let share = match decrypt(&cert, &secret, passphrase) {
        Ok(share) => share,
        Err(CodecError::BadPassphrase) if std::io::stdin().is_terminal() => {
            let entered = passphrase::prompt(&format!("Passphrase for the key of {peer}"))
                .map_err(io_error)?;
            decrypt(&cert, &secret, entered.as_bytes()).map_err(invalid)?
        }
        Err(e) => return Err(invalid(e)),
    };
    info!(
        peer,
        fingerprint = %hex(&cert.fingerprint()),
        curve = curve.name(),
        subkeys = cert.subkeys.len(),
        "loaded private key"
    );
    Ok(LoadedKey { cert, curve, share })
}

/// Converts between the index of a peer in this run and its position in the
/// peer list recorded with the key share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    scheme_ids: Vec<Participant>,
}

impl Mapping {
    /// Every peer of the run must be part of the key's peer list.
    pub fn create(capl: &[String], peers: &PeerList) -> Result<Self, KeyError> {
        let scheme_ids = peers
            .as_slice()
            .iter()
            .map(|peer| {
                capl.iter()
                    .position(|p| p == peer)
                    .map(|i| Participant::from(i as u32))
                    .ok_or_else(|| invalid(format!("{peer} does not hold a share of this key")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { scheme_ids })
    }

    /// The number of participants in the run.
    pub fn len(&self) -> usize {
        self.scheme_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scheme_ids.is_empty()
    }

    pub fn scheme_id(&self, p: Participant) -> Participant {
        self.scheme_ids[p.index()]
    }
}

/// Everything one participant owns for the length of a run.
pub struct ParticipantState<C: PgpCurve> {
    pub me: Participant,
    pub peers: PeerList,
    pub cert: Cert,
    pub mapping: Mapping,
    share: KeyShare<C>,
}

impl<C: PgpCurve> ParticipantState<C> {
    pub fn new(peers: PeerList, me: Participant, key: LoadedKey) -> Result<Self, KeyError> {
        let share = KeyShare::<C>::from_bytes(key.share_bytes()).map_err(invalid)?;
        share.check().map_err(invalid)?;
        if C::encode_point(share.public_key()) != key.cert.primary.point {
            return Err(invalid("key share does not belong to this key"));
        }
        let mapping = Mapping::create(share.capl(), &peers)?;
        if mapping.scheme_id(me) != share.id() {
            return Err(invalid(format!(
                "share belongs to {}, not to {}",
                share.capl()[share.id().index()],
                peers.name(me)
            )));
        }
        let needed = 2 * share.threshold() + 1;
        if peers.len() < needed {
            return Err(invalid(format!(
                "signing with this key needs {needed} peers, {} given",
                peers.len()
            )));
        }
        debug!(participant = %me, scheme_id = %share.id(), "key share checked");
        Ok(Self {
            me,
            peers,
            cert: key.cert,
            mapping,
            share,
        })
    }

    pub fn share(&self) -> &KeyShare<C> {
        &self.share
    }

    #[cfg(test)]
    pub(crate) fn corrupt_share(&mut self) {
        self.share.corrupt();
    }

    pub fn signer(&self) -> ThresholdSigner<'_, C> {
        ThresholdSigner::new(&self.share, &self.mapping, self.me)
    }
}

#[derive(Debug, Error)]
pub enum ChannelSetupError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Broadcast(#[from] InitializationError),
}

/// The channels of one participant: private unicast, and the broadcast.
pub struct Channels {
    pub unicast: PrivateChannels,
    pub rbc: ReliableBroadcast,
}

impl Channels {
    /// Log the traffic of both channel sets and close them.
    pub fn release(self) {
        self.unicast.channels().log_statistics();
        self.rbc.channels().log_statistics();
        debug!(participant = %self.rbc.me(), "channels released");
    }
}

/// Open both channel sets of participant `me`.
pub async fn establish_channels<T: Transport>(
    transport: &mut T,
    keys: &ChannelKeys,
    peers: &PeerList,
    me: Participant,
    timeout: Duration,
    protocol_id: &str,
) -> Result<Channels, ChannelSetupError> {
    let unicast = transport.open(ChannelKind::Unicast, keys).await?;
    let broadcast = transport.open(ChannelKind::Broadcast, keys).await?;
    let mut rbc = ReliableBroadcast::new(peers.len(), peers.resilience(), me, broadcast, timeout)?;
    rbc.set_id(protocol_id);
    info!(participant = %me, n = peers.len(), t = peers.resilience(), "channels established");
    Ok(Channels {
        unicast: PrivateChannels::new(unicast),
        rbc,
    })
}

/// The passphrase to try first: the value of `var`, or the empty passphrase.
pub fn initial_passphrase(var: Option<&str>) -> Zeroizing<Vec<u8>> {
    match var.map(std::env::var) {
        Some(Ok(value)) => Zeroizing::new(value.into_bytes()),
        Some(Err(e)) => {
            warn!("passphrase variable not usable ({e}), trying the empty passphrase");
            Zeroizing::new(Vec::new())
        }
        None => Zeroizing::new(Vec::new()),
    }
}
