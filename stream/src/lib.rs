//! A connection-oriented, multi-stream, ordered and reliable transport layered on top of
//!  unreliable datagrams (UDP).
//!
//! ## Design goals
//!
//! * Peer-to-peer without a dedicated server vs. client role
//!   * each node has a single listening UDP socket that handles all connections
//!   * a connection is identified by a pair of random 32-bit connection ids chosen at handshake,
//!     so it survives a change of the peer's UDP address (e.g. NAT rebinding)
//! * The abstraction is sending byte *streams* of known length: each `send()` opens a fresh
//!   stream, fragments it into MTU-sized packets, and the receiver re-assembles in offset order
//!   * up to 65535 concurrent streams per connection, no ordering across streams
//! * Streams can also be written incrementally (`open_stream` / `send_on_stream`), which is what
//!   the cut-through relay path above this layer builds on: fragments are handed upward as soon
//!   as their offset is contiguous, without ever buffering the whole stream
//! * Packets carry monotonic packet numbers and are acknowledged with range-based ACKs;
//!   retransmissions get a fresh packet number but keep the original `(stream_id, offset)` so
//!   the receiver deduplicates by offset
//! * Congestion control is plain AIMD over a smoothed-RTT RTO
//! * Optional packet-level AES-256-GCM encryption with a pair key derived from X25519 static keys
//!
//! ## Wire format
//!
//! Fixed 30-byte header, big-endian, followed by the payload:
//!
//! ```ascii
//!  0: version (u8)
//!  1: type (u8): 0 DATA, 1 DATA+FIN, 2 ACK, 3 DIAL, 4 DIAL_CONF, 5 CONF, 6 RESET
//!  2: src connection id (u32)
//!  6: dst connection id (u32)
//! 10: stream id (u16) for DATA, ack-block count for ACK, 0 otherwise
//! 12: packet number (u64)
//! 20: data offset in stream (u64)
//! 28: payload length (u16)
//! 30: payload
//! ```
//!
//! ACK payloads are a sequence of `[first, last]` u64 packet-number ranges, 16 bytes per block.
//!
//! ## Handshake
//!
//! ```ascii
//! CLOSED      --dial-->            DIAL_SENT    (send DIAL, retransmit with backoff)
//! LISTEN      --recv DIAL-->       DIAL_RCVD    (reply DIAL_CONF)
//! DIAL_SENT   --recv DIAL_CONF-->  ESTABLISHED  (send CONF, fire did_dial)
//! DIAL_RCVD   --recv CONF/DATA-->  ESTABLISHED
//! ESTABLISHED --recv RESET-->      CLOSED       (fire did_close)
//! *           --close()-->         CLOSING      (send RESET, fire did_close after drain)
//! ```
//!
//! Handshake retransmits use exponential backoff capped at 60s; an unanswered handshake or a
//!  packet that exceeds the retransmit strike limit resets the connection.

pub mod cipher;
pub mod config;
pub mod congestion;
pub mod connection;
pub mod delegate;
pub mod factory;
pub mod packet;
pub mod recv_stream;
pub mod rtt;
pub mod send_stream;
pub mod socket;
pub mod transport;

pub use config::StreamConfig;
pub use delegate::{ListenDelegate, TransportDelegate};
pub use factory::StreamTransportFactory;
pub use transport::{CloseReason, StreamTransport};
