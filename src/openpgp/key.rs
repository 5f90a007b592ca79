use sha1::{Digest, Sha1};

use crate::compat::CurveKind;

use super::packet::{write_mpi, Reader};
use super::CodecError;

pub const PKALGO_ECDH: u8 = 18;
pub const PKALGO_ECDSA: u8 = 19;

const KEY_VERSION: u8 = 4;

/// A v4 public key packet over an elliptic curve.
///
/// The encoded body is kept next to the parsed fields, since fingerprints
/// and signature hashes are computed over the exact bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyPacket {
    pub created: u32,
    pub algorithm: u8,
    pub oid: Vec<u8>,
    pub point: Vec<u8>,
    /// The KDF hash and wrapping cipher of an ECDH key.
    pub kdf: Option<(u8, u8)>,
    body: Vec<u8>,
}

impl PublicKeyPacket {
    pub fn ecdsa(created: u32, oid: &[u8], point: &[u8]) -> Self {
        Self::build(created, PKALGO_ECDSA, oid, point, None)
    }

    pub fn ecdh(created: u32, oid: &[u8], point: &[u8], hash: u8, cipher: u8) -> Self {
        Self::build(created, PKALGO_ECDH, oid, point, Some((hash, cipher)))
    }

    fn build(created: u32, algorithm: u8, oid: &[u8], point: &[u8], kdf: Option<(u8, u8)>) -> Self {
        let mut body = vec![KEY_VERSION];
        body.extend_from_slice(&created.to_be_bytes());
        body.push(algorithm);
        body.push(oid.len() as u8);
        body.extend_from_slice(oid);
        write_mpi(&mut body, point);
        if let Some((hash, cipher)) = kdf {
            body.extend_from_slice(&[3, 1, hash, cipher]);
        }
        Self {
            created,
            algorithm,
            oid: oid.to_vec(),
            point: point.to_vec(),
            kdf,
            body,
        }
    }

    /// Parse the public part at the start of a key packet body.
    ///
    /// Returns the packet and the number of bytes it used; for a secret key
    /// packet, the secret part follows.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), CodecError> {
        let mut reader = Reader::new(data);
        let version = reader.u8()?;
        if version != KEY_VERSION {
            return Err(CodecError::Unsupported(format!("key version {version}")));
        }
        let created = reader.u32()?;
        let algorithm = reader.u8()?;
        if algorithm != PKALGO_ECDSA && algorithm != PKALGO_ECDH {
            return Err(CodecError::Unsupported(format!(
                "public key algorithm {algorithm}"
            )));
        }
        let oid_len = reader.u8()? as usize;
        if oid_len == 0 || oid_len == 0xFF {
            return Err(CodecError::Malformed("reserved curve OID length".to_string()));
        }
        let oid = reader.take(oid_len)?.to_vec();
        let point = reader.mpi()?.to_vec();
        let kdf = if algorithm == PKALGO_ECDH {
            let len = reader.u8()?;
            let params = reader.take(len as usize)?;
            if len != 3 || params[0] != 1 {
                return Err(CodecError::Malformed("bad ECDH KDF parameters".to_string()));
            }
            Some((params[1], params[2]))
        } else {
            None
        };
        let used = reader.position();
        Ok((
            Self {
                created,
                algorithm,
                oid,
                point,
                kdf,
                body: data[..used].to_vec(),
            },
            used,
        ))
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The key as it enters fingerprints and signature hashes.
    pub fn hashing_material(&self) -> Vec<u8> {
        let mut out = vec![0x99];
        out.extend_from_slice(&(self.body.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    pub fn fingerprint(&self) -> [u8; 20] {
        Sha1::digest(self.hashing_material()).into()
    }

    pub fn key_id(&self) -> [u8; 8] {
        let fpr = self.fingerprint();
        let mut out = [0u8; 8];
        out.copy_from_slice(&fpr[12..]);
        out
    }

    pub fn curve(&self) -> Option<CurveKind> {
        CurveKind::from_oid(&self.oid)
    }
}

/// Upper case hex, the way fingerprints are shown to people.
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_leaves_secret_part() {
        let oid = CurveKind::NistP256.oid();
        let key = PublicKeyPacket::ecdh(1_600_000_000, oid, &[4, 1, 2, 3], 8, 9);
        let mut data = key.body().to_vec();
        data.extend_from_slice(&[0xAA, 0xBB]);
        let (parsed, used) = PublicKeyPacket::parse(&data).unwrap();
        assert_eq!(parsed, key);
        assert_eq!(&data[used..], &[0xAA, 0xBB]);
        assert_eq!(parsed.kdf, Some((8, 9)));
        assert_eq!(parsed.curve(), Some(CurveKind::NistP256));
    }

    #[test]
    fn test_fingerprint_shape() {
        let key = PublicKeyPacket::ecdsa(0, CurveKind::Secp256k1.oid(), &[4, 5, 6]);
        let fpr = key.fingerprint();
        assert_eq!(&fpr[12..], &key.key_id());
        assert_eq!(hex(&fpr).len(), 40);
        assert_eq!(key.hashing_material()[0], 0x99);
    }

    #[test]
    fn test_rejects_other_algorithms() {
        // A v4 RSA key header.
        let data = [4, 0, 0, 0, 0, 1, 0, 8, 0xFF];
        assert!(matches!(
            PublicKeyPacket::parse(&data),
            Err(CodecError::Unsupported(_))
        ));
    }
}
