use tracing::debug;

use super::armor::{armor_decode, armor_encode, ArmorKind};
use super::key::PublicKeyPacket;
use super::packet::{
    parse_packets, write_packet, Packet, TAG_PUBLIC_KEY, TAG_PUBLIC_SUBKEY, TAG_SECRET_KEY,
    TAG_SECRET_SUBKEY, TAG_SIGNATURE, TAG_USER_ID,
};
use super::signature::{Signature, SignatureType};
use super::CodecError;

#[derive(Debug, Clone)]
pub struct UserId {
    pub value: Vec<u8>,
    pub signatures: Vec<Signature>,
    /// Set by [`super::check_self_signatures`].
    pub valid: bool,
}

#[derive(Debug, Clone)]
pub struct Subkey {
    pub key: PublicKeyPacket,
    pub secret: Option<Vec<u8>>,
    pub bindings: Vec<Signature>,
    pub revocations: Vec<Signature>,
    /// Set by [`super::check_subkeys`].
    pub valid: bool,
}

/// A transferable key: the primary key with everything attached to it.
#[derive(Debug, Clone)]
pub struct Cert {
    pub primary: PublicKeyPacket,
    /// The secret part of the primary key packet, if this is a private key.
    pub secret: Option<Vec<u8>>,
    pub revocations: Vec<Signature>,
    pub direct: Vec<Signature>,
    pub user_ids: Vec<UserId>,
    pub subkeys: Vec<Subkey>,
    /// Set by [`super::check_self_signatures`].
    pub valid: bool,
}

enum Context {
    Primary,
    UserId,
    Subkey,
    Skip,
}

impl Cert {
    pub fn new(primary: PublicKeyPacket) -> Self {
        Self {
            primary,
            secret: None,
            revocations: Vec::new(),
            direct: Vec::new(),
            user_ids: Vec::new(),
            subkeys: Vec::new(),
            valid: false,
        }
    }

    /// Parse the packets of one transferable public or secret key.
    pub fn from_packets(packets: &[Packet]) -> Result<Self, CodecError> {
        let (first, rest) = packets
            .split_first()
            .ok_or_else(|| CodecError::Malformed("no packets".to_string()))?;
        let (primary, used) = match first.tag {
            TAG_PUBLIC_KEY | TAG_SECRET_KEY => PublicKeyPacket::parse(&first.body)?,
            tag => {
                return Err(CodecError::Malformed(format!(
                    "key block starts with packet {tag}"
                )))
            }
        };
        let mut cert = Cert::new(primary);
        if first.tag == TAG_SECRET_KEY {
            cert.secret = Some(first.body[used..].to_vec());
        }

        let mut context = Context::Primary;
        for packet in rest {
            match packet.tag {
                TAG_SIGNATURE => {
                    let sig = Signature::parse(&packet.body)?;
                    match context {
                        Context::Primary => match sig.sigtype {
                            SignatureType::KeyRevocation => cert.revocations.push(sig),
                            _ => cert.direct.push(sig),
                        },
                        Context::UserId => {
                            if let Some(uid) = cert.user_ids.last_mut() {
                                uid.signatures.push(sig);
                            }
                        }
                        Context::Subkey => {
                            if let Some(subkey) = cert.subkeys.last_mut() {
                                match sig.sigtype {
                                    SignatureType::SubkeyRevocation => subkey.revocations.push(sig),
                                    SignatureType::SubkeyBinding => subkey.bindings.push(sig),
                                    other => debug!("ignoring {other:?} signature on a subkey"),
                                }
                            }
                        }
                        Context::Skip => {}
                    }
                }
                TAG_USER_ID => {
                    cert.user_ids.push(UserId {
                        value: packet.body.clone(),
                        signatures: Vec::new(),
                        valid: false,
                    });
                    context = Context::UserId;
                }
                TAG_PUBLIC_SUBKEY | TAG_SECRET_SUBKEY => match PublicKeyPacket::parse(&packet.body) {
                    Ok((key, used)) => {
                        let secret = (packet.tag == TAG_SECRET_SUBKEY)
                            .then(|| packet.body[used..].to_vec());
                        cert.subkeys.push(Subkey {
                            key,
                            secret,
                            bindings: Vec::new(),
                            revocations: Vec::new(),
                            valid: false,
                        });
                        context = Context::Subkey;
                    }
                    Err(CodecError::Unsupported(what)) => {
                        debug!("skipping subkey: unsupported {what}");
                        context = Context::Skip;
                    }
                    Err(e) => return Err(e),
                },
                TAG_PUBLIC_KEY | TAG_SECRET_KEY => {
                    return Err(CodecError::Malformed(
                        "more than one key in the block".to_string(),
                    ))
                }
                other => {
                    debug!("skipping packet with tag {other}");
                    context = Context::Skip;
                }
            }
        }
        Ok(cert)
    }

    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        Self::from_packets(&parse_packets(data)?)
    }

    /// Parse an armored key, returning which kind of block it was.
    pub fn from_armor(text: &str) -> Result<(ArmorKind, Self), CodecError> {
        let (kind, data) = armor_decode(text)?;
        match kind {
            ArmorKind::PublicKeyBlock | ArmorKind::PrivateKeyBlock => Ok((kind, Self::parse(&data)?)),
            ArmorKind::Signature => Err(CodecError::Malformed(
                "expected a key block, found a signature".to_string(),
            )),
        }
    }

    pub fn fingerprint(&self) -> [u8; 20] {
        self.primary.fingerprint()
    }

    pub fn is_private(&self) -> bool {
        self.secret.is_some()
    }

    fn write(&self, private: bool) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        if private {
            let secret = self.secret.as_ref().ok_or(CodecError::NoSecret)?;
            let mut body = self.primary.body().to_vec();
            body.extend_from_slice(secret);
            write_packet(&mut out, TAG_SECRET_KEY, &body);
        } else {
            write_packet(&mut out, TAG_PUBLIC_KEY, self.primary.body());
        }
        for sig in self.revocations.iter().chain(&self.direct) {
            write_packet(&mut out, TAG_SIGNATURE, &sig.encode());
        }
        for uid in &self.user_ids {
            write_packet(&mut out, TAG_USER_ID, &uid.value);
            for sig in &uid.signatures {
                write_packet(&mut out, TAG_SIGNATURE, &sig.encode());
            }
        }
        for subkey in &self.subkeys {
            match (&subkey.secret, private) {
                (Some(secret), true) => {
                    let mut body = subkey.key.body().to_vec();
                    body.extend_from_slice(secret);
                    write_packet(&mut out, TAG_SECRET_SUBKEY, &body);
                }
                _ => write_packet(&mut out, TAG_PUBLIC_SUBKEY, subkey.key.body()),
            }
            for sig in subkey.revocations.iter().chain(&subkey.bindings) {
                write_packet(&mut out, TAG_SIGNATURE, &sig.encode());
            }
        }
        Ok(out)
    }

    pub fn export_public(&self) -> Vec<u8> {
        // Writing the public parts cannot fail.
        self.write(false).unwrap_or_default()
    }

    pub fn export_private(&self) -> Result<Vec<u8>, CodecError> {
        self.write(true)
    }

    pub fn public_armor(&self) -> String {
        armor_encode(ArmorKind::PublicKeyBlock, &self.export_public())
    }

    pub fn private_armor(&self) -> Result<String, CodecError> {
        Ok(armor_encode(ArmorKind::PrivateKeyBlock, &self.export_private()?))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compat::CurveKind;
    use crate::openpgp::{prepare_revocation, HashAlgorithm, RevocationCode};

    fn cert() -> Cert {
        let primary = PublicKeyPacket::ecdsa(10, CurveKind::NistP256.oid(), &[4, 1]);
        let sub = PublicKeyPacket::ecdh(10, CurveKind::NistP256.oid(), &[4, 2], 8, 9);
        let mut cert = Cert::new(primary);
        cert.secret = Some(vec![1, 2, 3]);
        cert.user_ids.push(UserId {
            value: b"Test <test@example.org>".to_vec(),
            signatures: Vec::new(),
            valid: false,
        });
        cert.subkeys.push(Subkey {
            key: sub,
            secret: Some(vec![9]),
            bindings: Vec::new(),
            revocations: Vec::new(),
            valid: false,
        });
        cert
    }

    #[test]
    fn test_private_and_public_exports() {
        let mut cert = cert();
        let trailer = prepare_revocation(
            SignatureType::KeyRevocation,
            &cert.primary,
            HashAlgorithm::Sha256,
            20,
            RevocationCode::NO_REASON,
            "",
        );
        let sig = Signature::from_trailer(&trailer, &cert.primary.key_id(), [0, 0], &[1], &[2])
            .unwrap();
        cert.revocations.push(sig.clone());

        let private = Cert::from_armor(&cert.private_armor().unwrap()).unwrap();
        assert_eq!(private.0, ArmorKind::PrivateKeyBlock);
        let private = private.1;
        assert_eq!(private.secret, Some(vec![1, 2, 3]));
        assert_eq!(private.subkeys[0].secret, Some(vec![9]));
        assert_eq!(private.revocations, vec![sig]);
        assert_eq!(private.user_ids[0].value, cert.user_ids[0].value);

        let public = Cert::parse(&cert.export_public()).unwrap();
        assert!(!public.is_private());
        assert!(public.subkeys[0].secret.is_none());
        assert_eq!(public.fingerprint(), cert.fingerprint());
    }

    #[test]
    fn test_public_key_cannot_export_private() {
        let mut cert = cert();
        cert.secret = None;
        assert!(matches!(cert.export_private(), Err(CodecError::NoSecret)));
    }

    #[test]
    fn test_rejects_non_key_block() {
        let mut data = Vec::new();
        write_packet(&mut data, TAG_USER_ID, b"x");
        assert!(Cert::parse(&data).is_err());
    }
}
