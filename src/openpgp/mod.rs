//! A narrow OpenPGP codec.
//!
//! This covers what revoking a threshold key needs and nothing more: ASCII
//! armor, v4 packet framing, ECDSA and ECDH public key packets, v4 signature
//! packets, the encrypted secret packet holding a key share, and the
//! certificate structure tying these together. Signatures are checked with
//! the same ECDSA verification the threshold primitive uses.
use thiserror::Error;

mod armor;
mod cert;
mod check;
mod key;
mod packet;
mod s2k;
mod signature;

pub use armor::{armor_decode, armor_encode, ArmorKind};
pub use cert::{Cert, Subkey, UserId};
pub use check::{
    check_self_signatures, check_subkeys, reduce, revocations, verify_revocation,
    verify_signature, weak, RevocationStatus,
};
pub use key::{hex, PublicKeyPacket, PKALGO_ECDH, PKALGO_ECDSA};
pub use packet::{
    parse_packets, write_packet, Packet, TAG_SECRET_KEY, TAG_SECRET_SUBKEY,
};
pub use s2k::{gnu_dummy, is_gnu_dummy, open_secret, seal_secret};
pub use signature::{
    key_hash, prepare_revocation, prepare_self_signature, user_id_hash, HashAlgorithm,
    RevocationCode, Signature, SignatureType,
};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("armor: {0}")]
    Armor(String),
    #[error("unexpected end of data")]
    Truncated,
    #[error("malformed packet: {0}")]
    Malformed(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("wrong passphrase or corrupted secret key")]
    BadPassphrase,
    #[error("missing secret key material")]
    NoSecret,
}
