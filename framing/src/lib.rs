//! Length-prefix framing on top of the stream transport.
//!
//! The stream layer below delivers each stream as contiguous byte fragments of arbitrary
//!  sizes; this crate re-assembles discrete *frames* from them:
//!
//! * [splitter::FrameSplitter] - splits a byte stream into frames of externally supplied
//!   lengths, forwarding exact byte ranges and firing a completion per frame
//! * [prefix::LengthPrefixFramer] - reads a 1-8 byte big-endian length prefix and drives the
//!   splitter with it
//! * [transport::FramedTransport] / [factory::FramedTransportFactory] - a message-oriented
//!   transport: small frames are assembled and handed up whole, frames above the cut-through
//!   threshold are handed up fragment by fragment without ever being buffered in full
//!
//! Wire format per message: an 8-byte big-endian length followed by that many payload bytes,
//!  sent on a dedicated stream of the transport below.

pub mod config;
pub mod delegate;
pub mod factory;
pub mod prefix;
pub mod splitter;
pub mod transport;

pub use config::FramingConfig;
pub use delegate::{FramedListenDelegate, FramedTransportDelegate};
pub use factory::FramedTransportFactory;
pub use transport::FramedTransport;
