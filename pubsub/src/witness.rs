use crate::wire::MessageHeader;
use bytes::{BufMut, BytesMut};
use x25519_dalek::{PublicKey, StaticSecret};

pub const WITNESS_KEY_LEN: usize = 32;

/// Pluggable witness plugin: produces the self-delimiting witness blob appended to each
///  relayed MESSAGE, recording the nodes it has traversed.
pub trait Witnesser: Send + Sync + 'static {
    /// Size of the witness blob starting at `buf[0]`, for parsing received messages.
    fn parse_size(&self, buf: &[u8]) -> usize;

    fn witness_size(&self, prev_header: &MessageHeader) -> usize;

    fn witness(&self, prev_header: &MessageHeader, out: &mut BytesMut);
}

/// No witnessing: zero-sized blobs.
pub struct EmptyWitnesser;

impl Witnesser for EmptyWitnesser {
    fn parse_size(&self, _buf: &[u8]) -> usize {
        0
    }

    fn witness_size(&self, _prev_header: &MessageHeader) -> usize {
        0
    }

    fn witness(&self, _prev_header: &MessageHeader, _out: &mut BytesMut) {}
}

/// Witness blob as an append-only key list: a u16 BE byte count followed by that many bytes
///  of concatenated 32-byte X25519 public keys. Each hop appends its own key, which is what
///  the relay uses for loop suppression.
pub struct KeyListWitnesser {
    public_key: [u8; 32],
}

impl KeyListWitnesser {
    pub fn new(secret: &StaticSecret) -> KeyListWitnesser {
        KeyListWitnesser {
            public_key: PublicKey::from(secret).to_bytes(),
        }
    }

    fn prev_keys(prev_header: &MessageHeader) -> &[u8] {
        if prev_header.witness.len() < 2 {
            return &[];
        }
        &prev_header.witness[2..]
    }
}

impl Witnesser for KeyListWitnesser {
    fn parse_size(&self, buf: &[u8]) -> usize {
        if buf.len() < 2 {
            return 0;
        }
        2 + u16::from_be_bytes([buf[0], buf[1]]) as usize
    }

    fn witness_size(&self, prev_header: &MessageHeader) -> usize {
        2 + Self::prev_keys(prev_header).len() + WITNESS_KEY_LEN
    }

    fn witness(&self, prev_header: &MessageHeader, out: &mut BytesMut) {
        let prev_keys = Self::prev_keys(prev_header);

        out.put_u16((prev_keys.len() + WITNESS_KEY_LEN) as u16);
        out.put_slice(prev_keys);
        out.put_slice(&self.public_key);
    }
}

/// Scan a witness key list (without the length prefix) for a specific key.
pub fn witness_contains(keys: &[u8], key: &[u8; 32]) -> bool {
    keys.chunks_exact(WITNESS_KEY_LEN).any(|k| k == key)
}
