use crate::wire::MessageHeader;
use bytes::BytesMut;

/// Pluggable validator binding `(msg id, channel, payload)` to the publisher. The node only
///  relies on this contract: `parse_size` delimits the attestation blob inside a received
///  MESSAGE, `attestation_size`/`attest` produce it on send, `verify` judges it on receipt.
pub trait Attester: Send + Sync + 'static {
    /// Size of the attestation blob starting at `buf[0]`, for parsing received messages.
    fn parse_size(&self, buf: &[u8]) -> usize;

    fn attestation_size(&self, msg_id: u64, channel: u16, payload: &[u8], prev_header: &MessageHeader) -> usize;

    fn attest(&self, msg_id: u64, channel: u16, payload: &[u8], prev_header: &MessageHeader, out: &mut BytesMut);

    fn verify(&self, msg_id: u64, channel: u16, payload: &[u8], header: &MessageHeader) -> bool;
}

/// No attestation: zero-sized blobs, everything verifies.
pub struct EmptyAttester;

impl Attester for EmptyAttester {
    fn parse_size(&self, _buf: &[u8]) -> usize {
        0
    }

    fn attestation_size(&self, _msg_id: u64, _channel: u16, _payload: &[u8], _prev_header: &MessageHeader) -> usize {
        0
    }

    fn attest(&self, _msg_id: u64, _channel: u16, _payload: &[u8], _prev_header: &MessageHeader, _out: &mut BytesMut) {}

    fn verify(&self, _msg_id: u64, _channel: u16, _payload: &[u8], _header: &MessageHeader) -> bool {
        true
    }
}
