use framing::FramedTransport;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// An ordered set of peers, keyed by address. Iteration order is the address order, which
///  keeps fan-out deterministic. Membership is also answerable by transport identity since
///  close paths only hold the transport.
pub struct TransportSet {
    transports: BTreeMap<SocketAddr, Arc<FramedTransport>>,
}

impl TransportSet {
    pub fn new() -> TransportSet {
        TransportSet {
            transports: BTreeMap::new(),
        }
    }

    /// Insert; false if the address is already present.
    pub fn insert(&mut self, addr: SocketAddr, transport: Arc<FramedTransport>) -> bool {
        if self.transports.contains_key(&addr) {
            return false;
        }
        self.transports.insert(addr, transport);
        true
    }

    pub fn contains_addr(&self, addr: &SocketAddr) -> bool {
        self.transports.contains_key(addr)
    }

    pub fn contains_transport(&self, transport: &Arc<FramedTransport>) -> bool {
        self.transports.values().any(|t| Arc::ptr_eq(t, transport))
    }

    /// Remove by transport identity; true if it was present.
    pub fn remove_transport(&mut self, transport: &Arc<FramedTransport>) -> bool {
        let len_before = self.transports.len();
        self.transports.retain(|_, t| !Arc::ptr_eq(t, transport));
        self.transports.len() != len_before
    }

    pub fn remove_addr(&mut self, addr: &SocketAddr) -> Option<Arc<FramedTransport>> {
        self.transports.remove(addr)
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&Arc<FramedTransport>> {
        self.transports.get(addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SocketAddr, &Arc<FramedTransport>)> {
        self.transports.iter()
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.transports.keys().cloned().collect()
    }

    pub fn transports(&self) -> Vec<Arc<FramedTransport>> {
        self.transports.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}

impl Default for TransportSet {
    fn default() -> TransportSet {
        TransportSet::new()
    }
}
