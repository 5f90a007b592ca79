//! Sealed, length-prefixed frames for network channels.
//!
//! Each direction of a connection has its own key, derived with HKDF-SHA256
//! from the channel password, salted with the session digest. Nonces are a
//! per-direction counter, so a replayed or reordered frame fails to open.
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use smol::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

use crate::protocol::Participant;

use super::{ChannelKind, TransportError};

const FRAME_LABEL: &[u8] = b"threshold-revoke frame v1";

/// The largest frame we accept, which bounds what a peer can make us allocate.
pub(crate) const MAX_FRAME_LEN: usize = 1 << 24;

fn direction_key(
    password: &[u8],
    session: &[u8; 32],
    kind: ChannelKind,
    from: Participant,
    to: Participant,
) -> Result<ChaCha20Poly1305, TransportError> {
    let mut info = FRAME_LABEL.to_vec();
    info.push(kind.tag());
    info.extend_from_slice(&from.bytes());
    info.extend_from_slice(&to.bytes());
    let hk = Hkdf::<Sha256>::new(Some(session), password);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(&info, okm.as_mut()).map_err(|_| TransportError::Seal)?;
    Ok(ChaCha20Poly1305::new(Key::from_slice(okm.as_ref())))
}

fn nonce(counter: u64) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[4..].copy_from_slice(&counter.to_be_bytes());
    out
}

/// Encrypts the frames we send to one peer.
pub(crate) struct Sealer {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl Sealer {
    pub fn new(
        password: &[u8],
        session: &[u8; 32],
        kind: ChannelKind,
        me: Participant,
        peer: Participant,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            cipher: direction_key(password, session, kind, me, peer)?,
            counter: 0,
        })
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, TransportError> {
        let n = nonce(self.counter);
        self.counter += 1;
        self.cipher
            .encrypt(Nonce::from_slice(&n), plaintext)
            .map_err(|_| TransportError::Seal)
    }
}

/// Decrypts the frames one peer sends us.
pub(crate) struct Opener {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl Opener {
    pub fn new(
        password: &[u8],
        session: &[u8; 32],
        kind: ChannelKind,
        me: Participant,
        peer: Participant,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            cipher: direction_key(password, session, kind, peer, me)?,
            counter: 0,
        })
    }

    /// Open the next frame, failing if it was forged, replayed, or reordered.
    pub fn open(&mut self, ciphertext: &[u8]) -> Option<Vec<u8>> {
        let n = nonce(self.counter);
        let out = self.cipher.decrypt(Nonce::from_slice(&n), ciphertext).ok()?;
        self.counter += 1;
        Some(out)
    }
}

pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    data: &[u8],
) -> std::io::Result<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too long"))?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(data).await?;
    w.flush().await
}

pub(crate) async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<Vec<u8>> {
    let mut len = [0u8; 4];
    r.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too long",
        ));
    }
    let mut out = vec![0u8; len];
    r.read_exact(&mut out).await?;
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    const SESSION: [u8; 32] = [7u8; 32];

    #[test]
    fn test_sealed_frames_are_ordered_and_directional() {
        let a = Participant::from(0u32);
        let b = Participant::from(1u32);
        let kind = ChannelKind::Unicast;
        let mut sealer = Sealer::new(b"pw", &SESSION, kind, a, b).unwrap();
        let mut opener = Opener::new(b"pw", &SESSION, kind, b, a).unwrap();
        let first = sealer.seal(b"one").unwrap();
        let second = sealer.seal(b"two").unwrap();
        // Out of order frames do not open.
        assert!(opener.open(&second).is_none());
        assert_eq!(opener.open(&first).unwrap(), b"one");
        assert_eq!(opener.open(&second).unwrap(), b"two");

        // The reverse direction uses another key.
        let mut reverse = Opener::new(b"pw", &SESSION, kind, a, b).unwrap();
        let mut sealer = Sealer::new(b"pw", &SESSION, kind, a, b).unwrap();
        assert!(reverse.open(&sealer.seal(b"one").unwrap()).is_none());
    }

    #[test]
    fn test_wrong_password_fails() {
        let a = Participant::from(0u32);
        let b = Participant::from(1u32);
        let kind = ChannelKind::Broadcast;
        let mut sealer = Sealer::new(b"right", &SESSION, kind, a, b).unwrap();
        let mut opener = Opener::new(b"wrong", &SESSION, kind, b, a).unwrap();
        assert!(opener.open(&sealer.seal(b"hello").unwrap()).is_none());
    }

    #[test]
    fn test_frame_io() {
        smol::block_on(async {
            let mut buf = Vec::new();
            write_frame(&mut buf, b"abc").await.unwrap();
            assert_eq!(&buf[..4], &[0, 0, 0, 3]);
            let mut reader = &buf[..];
            assert_eq!(read_frame(&mut reader).await.unwrap(), b"abc");
        });
    }
}
