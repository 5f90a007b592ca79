use digest::DynDigest;
use sha2::{Sha256, Sha384, Sha512};

use super::key::PublicKeyPacket;
use super::packet::{write_mpi, Reader};
use super::CodecError;

const SIG_VERSION: u8 = 4;

const SUBPACKET_CREATION_TIME: u8 = 2;
const SUBPACKET_ISSUER: u8 = 16;
const SUBPACKET_KEY_FLAGS: u8 = 27;
const SUBPACKET_REASON_FOR_REVOCATION: u8 = 29;
const SUBPACKET_ISSUER_FINGERPRINT: u8 = 33;

/// The hash algorithms usable with the supported curves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// The digest matching a group order of the given bit length.
    pub fn for_order_bits(bits: usize) -> Option<Self> {
        match bits {
            256 => Some(Self::Sha256),
            384 => Some(Self::Sha384),
            512 => Some(Self::Sha512),
            _ => None,
        }
    }

    pub fn id(&self) -> u8 {
        match self {
            Self::Sha256 => 8,
            Self::Sha384 => 9,
            Self::Sha512 => 10,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            8 => Some(Self::Sha256),
            9 => Some(Self::Sha384),
            10 => Some(Self::Sha512),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "SHA256",
            Self::Sha384 => "SHA384",
            Self::Sha512 => "SHA512",
        }
    }

    fn hasher(&self) -> Box<dyn DynDigest> {
        match self {
            Self::Sha256 => Box::<Sha256>::default(),
            Self::Sha384 => Box::<Sha384>::default(),
            Self::Sha512 => Box::<Sha512>::default(),
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The signature types this tool creates or checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureType {
    PositiveCertification,
    SubkeyBinding,
    KeyRevocation,
    SubkeyRevocation,
    Other(u8),
}

impl SignatureType {
    pub fn from_u8(t: u8) -> Self {
        match t {
            0x13 => Self::PositiveCertification,
            0x18 => Self::SubkeyBinding,
            0x20 => Self::KeyRevocation,
            0x28 => Self::SubkeyRevocation,
            other => Self::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::PositiveCertification => 0x13,
            Self::SubkeyBinding => 0x18,
            Self::KeyRevocation => 0x20,
            Self::SubkeyRevocation => 0x28,
            Self::Other(t) => t,
        }
    }

    /// Any of the four user id certification types.
    pub fn is_certification(self) -> bool {
        (0x10..=0x13).contains(&self.to_u8())
    }
}

/// A reason for revocation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevocationCode(pub u8);

impl RevocationCode {
    pub const NO_REASON: Self = Self(0);
    pub const SUPERSEDED: Self = Self(1);
    pub const COMPROMISED: Self = Self(2);
    pub const RETIRED: Self = Self(3);
    pub const USER_ID_INVALID: Self = Self(32);

    pub fn describe(&self) -> &'static str {
        match self.0 {
            0 => "no reason specified",
            1 => "key is superseded",
            2 => "key material has been compromised",
            3 => "key is retired and no longer used",
            32 => "user id information is no longer valid",
            _ => "unknown reason",
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self.0, 0..=3 | 32)
    }
}

fn push_subpacket(out: &mut Vec<u8>, kind: u8, data: &[u8]) {
    let len = data.len() + 1;
    if len < 192 {
        out.push(len as u8);
    } else if len < 8384 {
        let len = len - 192;
        out.push(((len >> 8) as u8) + 192);
        out.push(len as u8);
    } else {
        out.push(0xFF);
        out.extend_from_slice(&(len as u32).to_be_bytes());
    }
    out.push(kind);
    out.extend_from_slice(data);
}

fn parse_subpackets(area: &[u8]) -> Result<Vec<(u8, &[u8])>, CodecError> {
    let mut reader = Reader::new(area);
    let mut out = Vec::new();
    while !reader.is_empty() {
        let first = reader.u8()? as usize;
        let len = match first {
            0..=191 => first,
            192..=254 => ((first - 192) << 8) + reader.u8()? as usize + 192,
            _ => reader.u32()? as usize,
        };
        if len == 0 {
            return Err(CodecError::Malformed("empty subpacket".to_string()));
        }
        let body = reader.take(len)?;
        out.push((body[0] & 0x7F, &body[1..]));
    }
    Ok(out)
}

/// A v4 signature packet over an elliptic curve key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub sigtype: SignatureType,
    pub pkalgo: u8,
    pub hash_algo: u8,
    pub hashed: Vec<u8>,
    pub unhashed: Vec<u8>,
    pub left16: [u8; 2],
    pub r: Vec<u8>,
    pub s: Vec<u8>,
}

impl Signature {
    pub fn parse(body: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(body);
        let version = reader.u8()?;
        if version != SIG_VERSION {
            return Err(CodecError::Unsupported(format!("signature version {version}")));
        }
        let sigtype = SignatureType::from_u8(reader.u8()?);
        let pkalgo = reader.u8()?;
        let hash_algo = reader.u8()?;
        let len = reader.u16()? as usize;
        let hashed = reader.take(len)?.to_vec();
        let len = reader.u16()? as usize;
        let unhashed = reader.take(len)?.to_vec();
        let left = reader.take(2)?;
        let r = reader.mpi()?.to_vec();
        let s = reader.mpi()?.to_vec();
        parse_subpackets(&hashed)?;
        parse_subpackets(&unhashed)?;
        Ok(Self {
            sigtype,
            pkalgo,
            hash_algo,
            hashed,
            unhashed,
            left16: [left[0], left[1]],
            r,
            s,
        })
    }

    /// Complete a trailer with the signature values.
    ///
    /// The issuer key id goes into the unhashed area.
    pub fn from_trailer(
        trailer: &[u8],
        issuer: &[u8; 8],
        left16: [u8; 2],
        r: &[u8],
        s: &[u8],
    ) -> Result<Self, CodecError> {
        let mut reader = Reader::new(trailer);
        let version = reader.u8()?;
        if version != SIG_VERSION {
            return Err(CodecError::Malformed("trailer is not a v4 signature".to_string()));
        }
        let sigtype = SignatureType::from_u8(reader.u8()?);
        let pkalgo = reader.u8()?;
        let hash_algo = reader.u8()?;
        let len = reader.u16()? as usize;
        let hashed = reader.take(len)?.to_vec();
        let mut unhashed = Vec::new();
        push_subpacket(&mut unhashed, SUBPACKET_ISSUER, issuer);
        Ok(Self {
            sigtype,
            pkalgo,
            hash_algo,
            hashed,
            unhashed,
            left16,
            r: r.to_vec(),
            s: s.to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.trailer();
        out.extend_from_slice(&(self.unhashed.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.unhashed);
        out.extend_from_slice(&self.left16);
        write_mpi(&mut out, &self.r);
        write_mpi(&mut out, &self.s);
        out
    }

    /// The hashed part of the packet, which every signature hash ends with.
    pub fn trailer(&self) -> Vec<u8> {
        let mut out = vec![
            SIG_VERSION,
            self.sigtype.to_u8(),
            self.pkalgo,
            self.hash_algo,
        ];
        out.extend_from_slice(&(self.hashed.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.hashed);
        out
    }

    pub fn hash_algorithm(&self) -> Option<HashAlgorithm> {
        HashAlgorithm::from_id(self.hash_algo)
    }

    fn hashed_subpacket(&self, kind: u8) -> Option<&[u8]> {
        parse_subpackets(&self.hashed)
            .ok()?
            .into_iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, data)| data)
    }

    pub fn created(&self) -> Option<u32> {
        let data = self.hashed_subpacket(SUBPACKET_CREATION_TIME)?;
        Some(u32::from_be_bytes(data.try_into().ok()?))
    }

    pub fn issuer_fingerprint(&self) -> Option<&[u8]> {
        let data = self.hashed_subpacket(SUBPACKET_ISSUER_FINGERPRINT)?;
        data.split_first().map(|(_, fpr)| fpr)
    }

    pub fn issuer_key_id(&self) -> Option<[u8; 8]> {
        let areas = [&self.hashed, &self.unhashed];
        areas.into_iter().find_map(|area| {
            parse_subpackets(area)
                .ok()?
                .into_iter()
                .find(|(k, _)| *k == SUBPACKET_ISSUER)
                .and_then(|(_, data)| data.try_into().ok())
        })
    }

    pub fn revocation_reason(&self) -> Option<(RevocationCode, String)> {
        let data = self.hashed_subpacket(SUBPACKET_REASON_FOR_REVOCATION)?;
        let (code, text) = data.split_first()?;
        Some((
            RevocationCode(*code),
            String::from_utf8_lossy(text).into_owned(),
        ))
    }

    pub fn key_flags(&self) -> Option<u8> {
        self.hashed_subpacket(SUBPACKET_KEY_FLAGS)?.first().copied()
    }

    /// Whether this signature claims to be made by the given key.
    pub fn issued_by(&self, key: &PublicKeyPacket) -> bool {
        if let Some(fpr) = self.issuer_fingerprint() {
            return fpr == key.fingerprint();
        }
        match self.issuer_key_id() {
            Some(id) => id == key.key_id(),
            None => true,
        }
    }
}

fn trailer_prefix(sigtype: SignatureType, pkalgo: u8, hash: HashAlgorithm, hashed: &[u8]) -> Vec<u8> {
    let mut out = vec![SIG_VERSION, sigtype.to_u8(), pkalgo, hash.id()];
    out.extend_from_slice(&(hashed.len() as u16).to_be_bytes());
    out.extend_from_slice(hashed);
    out
}

fn issuer_fingerprint_subpacket(out: &mut Vec<u8>, issuer: &PublicKeyPacket) {
    let mut data = vec![4];
    data.extend_from_slice(&issuer.fingerprint());
    push_subpacket(out, SUBPACKET_ISSUER_FINGERPRINT, &data);
}

/// The trailer of a key or subkey revocation made by `issuer`.
pub fn prepare_revocation(
    sigtype: SignatureType,
    issuer: &PublicKeyPacket,
    hash: HashAlgorithm,
    created: u32,
    code: RevocationCode,
    reason: &str,
) -> Vec<u8> {
    let mut hashed = Vec::new();
    push_subpacket(&mut hashed, SUBPACKET_CREATION_TIME, &created.to_be_bytes());
    let mut data = vec![code.0];
    data.extend_from_slice(reason.as_bytes());
    push_subpacket(&mut hashed, SUBPACKET_REASON_FOR_REVOCATION, &data);
    issuer_fingerprint_subpacket(&mut hashed, issuer);
    trailer_prefix(sigtype, issuer.algorithm, hash, &hashed)
}

/// The trailer of a user id certification or subkey binding by `issuer`.
pub fn prepare_self_signature(
    sigtype: SignatureType,
    issuer: &PublicKeyPacket,
    hash: HashAlgorithm,
    created: u32,
    key_flags: u8,
) -> Vec<u8> {
    let mut hashed = Vec::new();
    push_subpacket(&mut hashed, SUBPACKET_CREATION_TIME, &created.to_be_bytes());
    push_subpacket(&mut hashed, SUBPACKET_KEY_FLAGS, &[key_flags]);
    issuer_fingerprint_subpacket(&mut hashed, issuer);
    trailer_prefix(sigtype, issuer.algorithm, hash, &hashed)
}

fn finish(mut hasher: Box<dyn DynDigest>, trailer: &[u8]) -> Vec<u8> {
    hasher.update(trailer);
    hasher.update(&[SIG_VERSION, 0xFF]);
    hasher.update(&(trailer.len() as u32).to_be_bytes());
    hasher.finalize().into_vec()
}

/// The digest signed by a signature over a key, or a key and one subkey.
///
/// Key revocations hash the primary key only; subkey bindings and subkey
/// revocations hash the primary key followed by the subkey.
pub fn key_hash(
    hash: HashAlgorithm,
    primary: &PublicKeyPacket,
    subkey: Option<&PublicKeyPacket>,
    trailer: &[u8],
) -> Vec<u8> {
    let mut hasher = hash.hasher();
    hasher.update(&primary.hashing_material());
    if let Some(subkey) = subkey {
        hasher.update(&subkey.hashing_material());
    }
    finish(hasher, trailer)
}

/// The digest signed by a certification of a user id.
pub fn user_id_hash(
    hash: HashAlgorithm,
    primary: &PublicKeyPacket,
    user_id: &[u8],
    trailer: &[u8],
) -> Vec<u8> {
    let mut hasher = hash.hasher();
    hasher.update(&primary.hashing_material());
    hasher.update(&[0xB4]);
    hasher.update(&(user_id.len() as u32).to_be_bytes());
    hasher.update(user_id);
    finish(hasher, trailer)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compat::CurveKind;

    fn key() -> PublicKeyPacket {
        PublicKeyPacket::ecdsa(1_600_000_000, CurveKind::NistP256.oid(), &[4, 1, 2])
    }

    #[test]
    fn test_revocation_trailer_subpackets() {
        let key = key();
        let trailer = prepare_revocation(
            SignatureType::KeyRevocation,
            &key,
            HashAlgorithm::Sha256,
            1_700_000_000,
            RevocationCode::COMPROMISED,
            "stolen laptop",
        );
        assert_eq!(&trailer[..4], &[4, 0x20, 19, 8]);
        let sig =
            Signature::from_trailer(&trailer, &key.key_id(), [1, 2], &[0, 7], &[9]).unwrap();
        assert_eq!(sig.trailer(), trailer);
        assert_eq!(sig.created(), Some(1_700_000_000));
        assert_eq!(
            sig.revocation_reason(),
            Some((RevocationCode::COMPROMISED, "stolen laptop".to_string()))
        );
        assert_eq!(sig.issuer_fingerprint(), Some(&key.fingerprint()[..]));
        assert_eq!(sig.issuer_key_id(), Some(key.key_id()));
        assert!(sig.issued_by(&key));

        let parsed = Signature::parse(&sig.encode()).unwrap();
        // Leading zeros are not part of an MPI.
        assert_eq!(parsed.r, vec![7]);
        assert_eq!(parsed.trailer(), trailer);
    }

    #[test]
    fn test_key_hash_depends_on_subkey() {
        let primary = key();
        let subkey = PublicKeyPacket::ecdh(1, CurveKind::NistP256.oid(), &[4, 9], 8, 9);
        let trailer = [4, 0x28, 19, 8, 0, 0];
        let alone = key_hash(HashAlgorithm::Sha256, &primary, None, &trailer);
        let both = key_hash(HashAlgorithm::Sha256, &primary, Some(&subkey), &trailer);
        assert_eq!(alone.len(), 32);
        assert_ne!(alone, both);
        assert_eq!(
            key_hash(HashAlgorithm::Sha512, &primary, None, &trailer).len(),
            64
        );
    }

    #[test]
    fn test_revocation_codes() {
        assert!(RevocationCode(3).is_known());
        assert!(RevocationCode::USER_ID_INVALID.is_known());
        assert!(!RevocationCode(4).is_known());
        assert_eq!(RevocationCode(1).describe(), "key is superseded");
    }
}
