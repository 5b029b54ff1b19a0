//! The pub/sub wire protocol: one type byte after framing, then a type-specific payload.
//!
//! ```ascii
//! SUBSCRIBE   (0x00): channel (u16)
//! UNSUBSCRIBE (0x01): channel (u16)
//! RESPONSE    (0x02): success (u8, 0/1), utf-8 text
//! MESSAGE     (0x03): msg id (u64), channel (u16), attestation blob, witness blob, payload
//! HEARTBEAT   (0x04): empty
//! ```
//!
//! Attestation and witness blobs are self-delimiting; their sizes come from the pluggable
//!  attester/witnesser `parse_size` hooks.

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const TYPE_SUBSCRIBE: u8 = 0x00;
pub const TYPE_UNSUBSCRIBE: u8 = 0x01;
pub const TYPE_RESPONSE: u8 = 0x02;
pub const TYPE_MESSAGE: u8 = 0x03;
pub const TYPE_HEARTBEAT: u8 = 0x04;

/// Offsets into a framed MESSAGE, used by the cut-through relay path which must find the
///  message id and the witness list inside the first fragment.
pub const MESSAGE_ID_OFFSET: usize = 1;
pub const WITNESS_LEN_OFFSET: usize = 11;
pub const WITNESS_OFFSET: usize = 13;

/// The parsed self-delimiting blobs between the MESSAGE fixed fields and the payload.
#[derive(Clone, Default, Debug)]
pub struct MessageHeader {
    pub attestation: Bytes,
    pub witness: Bytes,
}

pub fn build_subscribe(channel: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(3);
    buf.put_u8(TYPE_SUBSCRIBE);
    buf.put_u16(channel);
    buf.freeze()
}

pub fn build_unsubscribe(channel: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(3);
    buf.put_u8(TYPE_UNSUBSCRIBE);
    buf.put_u16(channel);
    buf.freeze()
}

pub fn build_response(success: bool, text: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + text.len());
    buf.put_u8(TYPE_RESPONSE);
    buf.put_u8(if success { 1 } else { 0 });
    buf.put_slice(text.as_bytes());
    buf.freeze()
}

pub fn build_heartbeat() -> Bytes {
    Bytes::from_static(&[TYPE_HEARTBEAT])
}

/// Channel id payload of SUBSCRIBE / UNSUBSCRIBE (the type byte already consumed).
pub fn parse_channel(buf: &mut Bytes) -> anyhow::Result<u16> {
    if buf.len() < 2 {
        bail!("truncated channel id");
    }
    Ok(buf.get_u16())
}

pub struct Response {
    pub success: bool,
    pub text: String,
}

/// RESPONSE payload (the type byte already consumed).
pub fn parse_response(mut buf: Bytes) -> anyhow::Result<Response> {
    if buf.is_empty() {
        bail!("empty response");
    }
    let success = buf.get_u8() != 0;
    let text = String::from_utf8_lossy(&buf).into_owned();
    Ok(Response { success, text })
}
