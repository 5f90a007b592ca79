//! Protection of the secret part of a key packet.
//!
//! The key share is stored AEAD protected: an iterated and salted SHA-256
//! string-to-key turns the passphrase into a key-encryption key, HKDF binds
//! it to the packet type, and AES-256-GCM encrypts the share with the public
//! key packet as associated data. Subkeys carry no secret at all, only the
//! GNU dummy marker.
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand_core::CryptoRngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::packet::Reader;
use super::CodecError;

const USAGE_AEAD: u8 = 253;
const USAGE_CFB: u8 = 254;
const SYM_AES256: u8 = 9;
const AEAD_GCM: u8 = 3;
const S2K_ITERATED_SALTED: u8 = 3;
const S2K_GNU: u8 = 101;
const HASH_SHA256: u8 = 8;
const DEFAULT_COUNT: u8 = 0xC0;
const GCM_IV_LEN: usize = 12;
const GNU_DUMMY: [u8; 8] = [USAGE_CFB, 0, S2K_GNU, 2, b'G', b'N', b'U', 1];

fn decode_count(c: u8) -> usize {
    (16 + (c as usize & 15)) << ((c as usize >> 4) + 6)
}

fn iterated_salted(passphrase: &[u8], salt: &[u8], count: u8) -> Zeroizing<[u8; 32]> {
    let mut data = Zeroizing::new(salt.to_vec());
    data.extend_from_slice(passphrase);
    let count = decode_count(count).max(data.len());
    let mut hasher = Sha256::new();
    let mut left = count;
    while left > 0 {
        let n = left.min(data.len());
        hasher.update(&data[..n]);
        left -= n;
    }
    Zeroizing::new(hasher.finalize().into())
}

fn aead_key(kek: &[u8; 32], tag: u8) -> Result<Aes256Gcm, CodecError> {
    let info = [0xC0 | tag, 4, SYM_AES256, AEAD_GCM];
    let mut okm = Zeroizing::new([0u8; 32]);
    Hkdf::<Sha256>::new(None, kek)
        .expand(&info, okm.as_mut())
        .map_err(|_| CodecError::Malformed("key derivation failed".to_string()))?;
    Aes256Gcm::new_from_slice(okm.as_ref())
        .map_err(|_| CodecError::Malformed("key derivation failed".to_string()))
}

fn associated_data(tag: u8, public_body: &[u8]) -> Vec<u8> {
    let mut ad = vec![0xC0 | tag];
    ad.extend_from_slice(public_body);
    ad
}

/// Encrypt secret key material, returning the secret part of the packet.
pub fn seal_secret(
    rng: &mut impl CryptoRngCore,
    tag: u8,
    public_body: &[u8],
    plaintext: &[u8],
    passphrase: &[u8],
) -> Result<Vec<u8>, CodecError> {
    let mut salt = [0u8; 8];
    rng.fill_bytes(&mut salt);
    let mut iv = [0u8; GCM_IV_LEN];
    rng.fill_bytes(&mut iv);

    let kek = iterated_salted(passphrase, &salt, DEFAULT_COUNT);
    let cipher = aead_key(&kek, tag)?;
    let ad = associated_data(tag, public_body);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad: &ad,
            },
        )
        .map_err(|_| CodecError::Malformed("encryption failed".to_string()))?;

    let mut out = vec![USAGE_AEAD, SYM_AES256, AEAD_GCM, S2K_ITERATED_SALTED, HASH_SHA256];
    out.extend_from_slice(&salt);
    out.push(DEFAULT_COUNT);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt the secret part of a key packet.
pub fn open_secret(
    tag: u8,
    public_body: &[u8],
    secret: &[u8],
    passphrase: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CodecError> {
    if is_gnu_dummy(secret) {
        return Err(CodecError::NoSecret);
    }
    let mut reader = Reader::new(secret);
    let usage = reader.u8()?;
    if usage != USAGE_AEAD {
        return Err(CodecError::Unsupported(format!("S2K usage {usage}")));
    }
    let (sym, aead, s2k, hash) = (reader.u8()?, reader.u8()?, reader.u8()?, reader.u8()?);
    if (sym, aead, s2k, hash) != (SYM_AES256, AEAD_GCM, S2K_ITERATED_SALTED, HASH_SHA256) {
        return Err(CodecError::Unsupported(format!(
            "secret key protection {sym}/{aead}/{s2k}/{hash}"
        )));
    }
    let salt = reader.take(8)?;
    let count = reader.u8()?;
    let iv = reader.take(GCM_IV_LEN)?;
    let ciphertext = reader.rest();

    let kek = iterated_salted(passphrase, salt, count);
    let cipher = aead_key(&kek, tag)?;
    let ad = associated_data(tag, public_body);
    cipher
        .decrypt(
            Nonce::from_slice(iv),
            Payload {
                msg: ciphertext,
                aad: &ad,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| CodecError::BadPassphrase)
}

/// The secret part of a key whose secret lives elsewhere.
pub fn gnu_dummy() -> Vec<u8> {
    GNU_DUMMY.to_vec()
}

pub fn is_gnu_dummy(secret: &[u8]) -> bool {
    secret.starts_with(&GNU_DUMMY[..7])
}

#[cfg(test)]
mod test {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn test_count_decoding() {
        assert_eq!(decode_count(0), 1024);
        assert_eq!(decode_count(0xC0), 16 << 18);
        assert_eq!(decode_count(0xFF), 31 << 21);
    }

    #[test]
    fn test_seal_open() {
        let secret = seal_secret(&mut OsRng, 5, b"public", b"share", b"pass").unwrap();
        assert_eq!(secret[0], USAGE_AEAD);
        let opened = open_secret(5, b"public", &secret, b"pass").unwrap();
        assert_eq!(opened.as_slice(), b"share");
        assert!(matches!(
            open_secret(5, b"public", &secret, b"wrong"),
            Err(CodecError::BadPassphrase)
        ));
        // The public key is bound as associated data.
        assert!(open_secret(5, b"other", &secret, b"pass").is_err());
    }

    #[test]
    fn test_gnu_dummy() {
        assert!(is_gnu_dummy(&gnu_dummy()));
        assert!(matches!(
            open_secret(7, b"", &gnu_dummy(), b""),
            Err(CodecError::NoSecret)
        ));
    }
}
