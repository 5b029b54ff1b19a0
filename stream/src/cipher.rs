//! Optional packet-level encryption. The 30-byte packet header stays in the clear so the
//!  receive loop can demultiplex by connection id without per-peer state; the payload is
//!  AES-256-GCM encrypted with the header as associated data, which also authenticates the
//!  header fields. The pair key is derived from the X25519 shared secret of the two nodes'
//!  static keys.
//!
//! Wire layout of an encrypted payload: 12-byte random nonce, ciphertext, 16-byte GCM tag.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{anyhow, bail};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

pub trait PacketCipher: Send + Sync + 'static {
    /// Bytes added to every payload by [seal](PacketCipher::seal).
    fn overhead(&self) -> usize;

    fn seal(&self, header: &[u8], payload: &[u8]) -> anyhow::Result<Vec<u8>>;

    fn open(&self, header: &[u8], payload: &[u8]) -> anyhow::Result<Bytes>;
}

pub struct NoCipher;

impl PacketCipher for NoCipher {
    fn overhead(&self) -> usize {
        0
    }

    fn seal(&self, _header: &[u8], payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(payload.to_vec())
    }

    fn open(&self, _header: &[u8], payload: &[u8]) -> anyhow::Result<Bytes> {
        Ok(Bytes::copy_from_slice(payload))
    }
}

pub struct Aes256GcmCipher {
    cipher: Aes256Gcm,
}

impl Aes256GcmCipher {
    /// Pair key for a connection: `SHA-256(x25519(self_secret, remote_static_pk))`. Both ends
    ///  arrive at the same key from their own secret and the peer's public key.
    pub fn from_static_keys(self_secret: &StaticSecret, remote_static_pk: &[u8; 32]) -> Aes256GcmCipher {
        let shared = self_secret.diffie_hellman(&PublicKey::from(*remote_static_pk));
        let key = Sha256::digest(shared.as_bytes());

        Aes256GcmCipher {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice())),
        }
    }
}

impl PacketCipher for Aes256GcmCipher {
    fn overhead(&self) -> usize {
        NONCE_LEN + TAG_LEN
    }

    fn seal(&self, header: &[u8], payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, Payload { msg: payload, aad: header })
            .map_err(|_| anyhow!("encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, header: &[u8], payload: &[u8]) -> anyhow::Result<Bytes> {
        if payload.len() < NONCE_LEN + TAG_LEN {
            bail!("encrypted payload too short: {}", payload.len());
        }

        let nonce = Nonce::from_slice(&payload[..NONCE_LEN]);
        let plaintext = self
            .cipher
            .decrypt(nonce, Payload { msg: &payload[NONCE_LEN..], aad: header })
            .map_err(|_| anyhow!("cryptographically invalid packet"))?;

        Ok(Bytes::from(plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher_pair() -> (Aes256GcmCipher, Aes256GcmCipher) {
        let secret_a = StaticSecret::from([1u8; 32]);
        let secret_b = StaticSecret::from([2u8; 32]);
        let pk_a = PublicKey::from(&secret_a).to_bytes();
        let pk_b = PublicKey::from(&secret_b).to_bytes();

        (
            Aes256GcmCipher::from_static_keys(&secret_a, &pk_b),
            Aes256GcmCipher::from_static_keys(&secret_b, &pk_a),
        )
    }

    #[test]
    fn test_no_cipher_roundtrip() {
        let cipher = NoCipher;
        let sealed = cipher.seal(b"header", b"payload").unwrap();
        assert_eq!(sealed, b"payload");
        assert_eq!(cipher.open(b"header", &sealed).unwrap().as_ref(), b"payload");
        assert_eq!(cipher.overhead(), 0);
    }

    #[test]
    fn test_pair_key_roundtrip() {
        let (a, b) = cipher_pair();

        let sealed = a.seal(b"header", b"hello").unwrap();
        assert_eq!(sealed.len(), 5 + a.overhead());
        assert_eq!(b.open(b"header", &sealed).unwrap().as_ref(), b"hello");
    }

    #[test]
    fn test_tampered_header_rejected() {
        let (a, b) = cipher_pair();

        let sealed = a.seal(b"header", b"hello").unwrap();
        assert!(b.open(b"HEADER", &sealed).is_err());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let (a, b) = cipher_pair();

        let mut sealed = a.seal(b"header", b"hello").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(b.open(b"header", &sealed).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let (a, _) = cipher_pair();
        let stranger = Aes256GcmCipher::from_static_keys(
            &StaticSecret::from([3u8; 32]),
            &PublicKey::from(&StaticSecret::from([4u8; 32])).to_bytes(),
        );

        let sealed = a.seal(b"header", b"hello").unwrap();
        assert!(stranger.open(b"header", &sealed).is_err());
    }

    #[test]
    fn test_short_payload_rejected() {
        let (a, _) = cipher_pair();
        assert!(a.open(b"header", &[0u8; 10]).is_err());
    }
}
