//! A peer-to-peer publish/subscribe overlay for relaying large messages across untrusted
//!  nodes.
//!
//! Nodes form a mesh: each node dials a bounded number of *solicited* upstream peers to
//!  receive its channels, and optionally accepts *unsolicited* downstream peers that pull
//!  from it. Solicited peers beyond capacity are parked in a standby set for later
//!  promotion; peers dropped from the solicited sets are blacklisted until the periodic
//!  flush. Messages flooding through the mesh are deduplicated by a 64-bit id over a
//!  sliding window (a 256-bucket ring advanced by the dedup tick) and, with relaying
//!  enabled, re-emitted to every other peer.
//!
//! Messages above the cut-through threshold are never buffered whole on the relay path:
//!  each fragment is fanned out downstream as soon as it arrives, with the relay's public
//!  key appended to the message's witness list. A peer whose key is already on the list is
//!  skipped, which is what keeps relay loops from forming.
//!
//! Attestation and witnessing are pluggable ([attestation::Attester] /
//!  [witness::Witnesser]); the empty implementations carry zero-sized blobs and verify
//!  everything.

pub mod attestation;
pub mod config;
pub mod dedup;
pub mod delegate;
pub mod node;
pub mod peer_set;
pub mod wire;
pub mod witness;

pub use attestation::{Attester, EmptyAttester};
pub use config::PubSubConfig;
pub use delegate::PubSubDelegate;
pub use node::PubSubNode;
pub use wire::MessageHeader;
pub use witness::{EmptyWitnesser, KeyListWitnesser, Witnesser};
