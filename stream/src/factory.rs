use crate::cipher::{Aes256GcmCipher, NoCipher, PacketCipher};
use crate::config::StreamConfig;
use crate::connection::Connection;
use crate::delegate::ListenDelegate;
use crate::packet::{PacketHeader, PacketKind, HEADER_LEN};
use crate::socket::DatagramSocket;
use crate::transport::StreamTransport;
use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;
use x25519_dalek::{PublicKey, StaticSecret};

/// Sole source of truth for `address -> transport`. Transports additionally register under
///  their local connection id, which is what the receive loop routes by - the address entry
///  follows the peer when its address changes.
pub struct TransportManager {
    by_addr: FxHashMap<SocketAddr, Arc<StreamTransport>>,
    by_conn_id: FxHashMap<u32, Arc<StreamTransport>>,
}

impl TransportManager {
    fn new() -> TransportManager {
        TransportManager {
            by_addr: FxHashMap::default(),
            by_conn_id: FxHashMap::default(),
        }
    }

    fn insert(&mut self, addr: SocketAddr, transport: Arc<StreamTransport>) {
        self.by_conn_id.insert(transport.conn_id(), transport.clone());
        self.by_addr.insert(addr, transport);
    }

    fn get_by_addr(&self, addr: &SocketAddr) -> Option<Arc<StreamTransport>> {
        self.by_addr.get(addr).cloned()
    }

    fn get_by_conn_id(&self, conn_id: u32) -> Option<Arc<StreamTransport>> {
        self.by_conn_id.get(&conn_id).cloned()
    }

    fn remove(&mut self, conn_id: u32) {
        self.by_conn_id.remove(&conn_id);
        self.by_addr.retain(|_, t| t.conn_id() != conn_id);
    }

    fn rekey(&mut self, old_addr: SocketAddr, new_addr: SocketAddr, transport: &Arc<StreamTransport>) {
        if let Some(existing) = self.by_addr.get(&old_addr) {
            if Arc::ptr_eq(existing, transport) {
                self.by_addr.remove(&old_addr);
            }
        }
        self.by_addr.insert(new_addr, transport.clone());
    }

    fn len(&self) -> usize {
        self.by_conn_id.len()
    }
}

struct FactoryInner {
    config: Arc<StreamConfig>,
    identity: StaticSecret,
    socket: RwLock<Option<Arc<dyn DatagramSocket>>>,
    manager: Arc<RwLock<TransportManager>>,
    listen_delegate: RwLock<Option<Weak<dyn ListenDelegate>>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

/// Creates and owns [StreamTransport]s over one UDP socket: `bind` / `listen` / `dial` /
///  `get_transport`, plus the receive loop that demultiplexes inbound datagrams onto them.
pub struct StreamTransportFactory {
    inner: Arc<FactoryInner>,
}

impl StreamTransportFactory {
    /// `identity` is the node's static X25519 secret, loaded from an external key provider.
    pub fn new(config: StreamConfig, identity: [u8; 32]) -> anyhow::Result<StreamTransportFactory> {
        config.validate()?;

        Ok(StreamTransportFactory {
            inner: Arc::new(FactoryInner {
                config: Arc::new(config),
                identity: StaticSecret::from(identity),
                socket: RwLock::new(None),
                manager: Arc::new(RwLock::new(TransportManager::new())),
                listen_delegate: RwLock::new(None),
                recv_task: Mutex::new(None),
            }),
        })
    }

    pub async fn bind(&self, addr: SocketAddr) -> anyhow::Result<()> {
        let socket = UdpSocket::bind(addr).await?;
        info!("bound receive socket to {:?}", socket.local_addr()?);

        *self.inner.socket.write().unwrap() = Some(Arc::new(Arc::new(socket)));
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.socket.read().unwrap().as_ref().map(|s| s.local_addr())
    }

    /// The local static public key, i.e. what peers should pass as `remote_static_pk`.
    pub fn public_key(&self) -> [u8; 32] {
        PublicKey::from(&self.inner.identity).to_bytes()
    }

    /// Start accepting inbound connections, spawning the receive loop.
    pub fn listen(&self, delegate: Weak<dyn ListenDelegate>) -> anyhow::Result<()> {
        if self.inner.socket.read().unwrap().is_none() {
            bail!("listen before bind");
        }

        *self.inner.listen_delegate.write().unwrap() = Some(delegate);

        let mut recv_task = self.inner.recv_task.lock().unwrap();
        if recv_task.is_none() {
            let inner = self.inner.clone();
            *recv_task = Some(tokio::spawn(async move {
                FactoryInner::recv_loop(inner).await;
            }));
        }
        Ok(())
    }

    /// Dial a peer. With `remote_static_pk` the connection is encrypted with the pair key
    ///  derived from the two static keys; without it, packets travel in the clear.
    pub async fn dial(
        &self,
        addr: SocketAddr,
        delegate: Weak<dyn ListenDelegate>,
        remote_static_pk: Option<[u8; 32]>,
    ) -> anyhow::Result<Arc<StreamTransport>> {
        self.listen(delegate.clone())?;

        if let Some(existing) = self.get_transport(addr) {
            debug!("dial to {:?}: transport already exists", addr);
            return Ok(existing);
        }

        let (cipher, dial_payload): (Arc<dyn PacketCipher>, Bytes) = match remote_static_pk {
            Some(pk) => (
                Arc::new(Aes256GcmCipher::from_static_keys(&self.inner.identity, &pk)),
                Bytes::copy_from_slice(PublicKey::from(&self.inner.identity).as_bytes()),
            ),
            None => (Arc::new(NoCipher), Bytes::new()),
        };

        let max_payload = self.inner.config.max_payload_len - cipher.overhead();
        let (conn, outcome) = Connection::new_dialer(self.inner.config.clone(), max_payload, dial_payload, Instant::now());

        let transport = self.inner.new_transport(cipher, remote_static_pk, conn, addr);
        self.inner.manager.write().unwrap().insert(addr, transport.clone());
        transport.spawn_tick();

        if let Some(delegate) = self.inner.listen_delegate() {
            delegate.did_create_transport(transport.clone()).await;
        }

        transport.flush(outcome).await;
        Ok(transport)
    }

    pub fn get_transport(&self, addr: SocketAddr) -> Option<Arc<StreamTransport>> {
        self.inner.manager.read().unwrap().get_by_addr(&addr)
    }

    pub fn num_transports(&self) -> usize {
        self.inner.manager.read().unwrap().len()
    }
}

impl Drop for StreamTransportFactory {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.recv_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl FactoryInner {
    fn listen_delegate(&self) -> Option<Arc<dyn ListenDelegate>> {
        self.listen_delegate.read().unwrap().as_ref().and_then(|weak| weak.upgrade())
    }

    fn new_transport(
        self: &Arc<FactoryInner>,
        cipher: Arc<dyn PacketCipher>,
        remote_static_pk: Option<[u8; 32]>,
        conn: Connection,
        peer_addr: SocketAddr,
    ) -> Arc<StreamTransport> {
        let socket = self.socket.read().unwrap().clone().expect("transport created before bind");

        let manager_weak = Arc::downgrade(&self.manager);
        let on_closed = Box::new(move |t: &StreamTransport| {
            if let Some(manager) = manager_weak.upgrade() {
                manager.write().unwrap().remove(t.conn_id());
            }
        });

        Arc::new(StreamTransport::new(
            self.config.clone(),
            socket,
            cipher,
            remote_static_pk,
            conn,
            peer_addr,
            on_closed,
        ))
    }

    async fn recv_loop(inner: Arc<FactoryInner>) {
        info!("starting receive loop");
        let socket = inner.socket.read().unwrap().clone().expect("recv loop without socket");

        let mut buf = vec![0u8; 65536];
        loop {
            let (num_read, from) = match socket.recv_packet(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    warn!("socket error: {}", e);
                    continue;
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "packet_received", ?correlation_id);

            if num_read < HEADER_LEN {
                debug!("incomplete packet header from {:?} - dropping", from);
                continue;
            }

            let raw = Bytes::copy_from_slice(&buf[..num_read]);
            let header = match PacketHeader::deser(&mut &raw[..HEADER_LEN]) {
                Ok(header) => header,
                Err(e) => {
                    debug!("unparsable packet from {:?}: {} - dropping", from, e);
                    continue;
                }
            };

            let inner = inner.clone();
            async {
                trace!("received {:?} from {:?}", header, from);
                match header.kind {
                    PacketKind::Dial => inner.handle_dial(header, raw, from).await,
                    _ => inner.route(header, raw, from).await,
                }
            }
            .instrument(span)
            .await;
        }
    }

    async fn handle_dial(self: &Arc<FactoryInner>, header: PacketHeader, raw: Bytes, from: SocketAddr) {
        // retransmitted DIAL for a transport we already track
        let existing = self.manager.read().unwrap().get_by_addr(&from);
        if let Some(transport) = existing {
            transport.handle_datagram(header, raw, from).await;
            return;
        }

        let Some(delegate) = self.listen_delegate() else {
            debug!("DIAL from {:?} without listen delegate - dropping", from);
            return;
        };
        if !delegate.should_accept(from).await {
            debug!("DIAL from {:?} refused by listen delegate", from);
            return;
        }

        // a 32-byte DIAL payload is the dialer's static public key and requests encryption
        let payload = &raw[HEADER_LEN..];
        let (cipher, remote_static_pk): (Arc<dyn PacketCipher>, Option<[u8; 32]>) = if payload.len() == 32 {
            let mut pk = [0u8; 32];
            pk.copy_from_slice(payload);
            (Arc::new(Aes256GcmCipher::from_static_keys(&self.identity, &pk)), Some(pk))
        }
        else {
            (Arc::new(NoCipher), None)
        };

        let max_payload = self.config.max_payload_len - cipher.overhead();
        let (conn, outcome) = Connection::new_listener(self.config.clone(), max_payload, header.src_conn_id, Instant::now());

        let transport = self.new_transport(cipher, remote_static_pk, conn, from);
        self.manager.write().unwrap().insert(from, transport.clone());
        transport.spawn_tick();

        debug!("created inbound transport for {:?}", from);
        delegate.did_create_transport(transport.clone()).await;

        transport.flush(outcome).await;
    }

    async fn route(&self, header: PacketHeader, raw: Bytes, from: SocketAddr) {
        let transport = {
            let manager = self.manager.read().unwrap();
            manager
                .get_by_conn_id(header.dst_conn_id)
                .or_else(|| manager.get_by_addr(&from))
        };

        let Some(transport) = transport else {
            debug!("no transport for {:?} from {:?} - dropping", header, from);
            return;
        };

        let old_addr = transport.peer_addr().await;
        transport.handle_datagram(header, raw, from).await;

        if old_addr != from {
            debug!("re-keying transport {:?} -> {:?}", old_addr, from);
            self.manager.write().unwrap().rekey(old_addr, from, &transport);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::TransportDelegate;
    use crate::transport::CloseReason;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Test double standing in for the framing layer: reassembles streams and pushes
    ///  completed messages / lifecycle events into a channel.
    struct TestNode {
        accept: bool,
        weak_self: Weak<TestNode>,
        events: mpsc::UnboundedSender<TestEvent>,
        partial: std::sync::Mutex<FxHashMap<u16, Vec<u8>>>,
    }

    #[derive(Debug, PartialEq)]
    enum TestEvent {
        DidDial,
        Message(Vec<u8>),
        Closed(CloseReason),
    }

    impl TestNode {
        fn new(accept: bool) -> (Arc<TestNode>, mpsc::UnboundedReceiver<TestEvent>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let node = Arc::new_cyclic(|weak_self| TestNode {
                accept,
                weak_self: weak_self.clone(),
                events: tx,
                partial: std::sync::Mutex::new(FxHashMap::default()),
            });
            (node, rx)
        }
    }

    #[async_trait]
    impl ListenDelegate for TestNode {
        async fn should_accept(&self, _addr: SocketAddr) -> bool {
            self.accept
        }

        async fn did_create_transport(&self, transport: Arc<StreamTransport>) {
            transport.setup(self.weak_self.clone() as Weak<dyn TransportDelegate>);
        }
    }

    #[async_trait]
    impl TransportDelegate for TestNode {
        async fn did_dial(&self) {
            self.events.send(TestEvent::DidDial).ok();
        }

        async fn did_recv_bytes(&self, stream_id: u16, bytes: Bytes) -> anyhow::Result<()> {
            self.partial.lock().unwrap().entry(stream_id).or_default().extend_from_slice(&bytes);
            Ok(())
        }

        async fn did_recv_stream_end(&self, stream_id: u16) -> anyhow::Result<()> {
            let message = self.partial.lock().unwrap().remove(&stream_id).unwrap_or_default();
            self.events.send(TestEvent::Message(message)).ok();
            Ok(())
        }

        async fn did_send(&self, _stream_id: u16) {}

        async fn did_close(&self, reason: CloseReason) {
            self.events.send(TestEvent::Closed(reason)).ok();
        }
    }

    async fn expect_event(rx: &mut mpsc::UnboundedReceiver<TestEvent>) -> TestEvent {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn bound_factory(identity: [u8; 32]) -> StreamTransportFactory {
        let factory = StreamTransportFactory::new(StreamConfig::default(), identity).unwrap();
        factory.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        factory
    }

    fn as_listen_delegate(node: &Arc<TestNode>) -> Weak<dyn ListenDelegate> {
        Arc::downgrade(node) as Weak<dyn ListenDelegate>
    }

    #[tokio::test]
    async fn test_dial_and_send() {
        let client_factory = bound_factory([1; 32]).await;
        let server_factory = bound_factory([2; 32]).await;

        let (client, mut client_events) = TestNode::new(false);
        let (server, mut server_events) = TestNode::new(true);

        server_factory.listen(as_listen_delegate(&server)).unwrap();

        let server_addr = server_factory.local_addr().unwrap();
        let transport = client_factory
            .dial(server_addr, as_listen_delegate(&client), None)
            .await
            .unwrap();

        assert_eq!(expect_event(&mut client_events).await, TestEvent::DidDial);
        assert!(transport.is_active().await);

        transport.send(Bytes::from_static(b"hello over udp")).await.unwrap();
        assert_eq!(expect_event(&mut server_events).await, TestEvent::Message(b"hello over udp".to_vec()));
    }

    #[tokio::test]
    async fn test_encrypted_dial_and_send() {
        let client_factory = bound_factory([3; 32]).await;
        let server_factory = bound_factory([4; 32]).await;

        let (client, mut client_events) = TestNode::new(false);
        let (server, mut server_events) = TestNode::new(true);

        server_factory.listen(as_listen_delegate(&server)).unwrap();

        let transport = client_factory
            .dial(
                server_factory.local_addr().unwrap(),
                as_listen_delegate(&client),
                Some(server_factory.public_key()),
            )
            .await
            .unwrap();

        assert_eq!(expect_event(&mut client_events).await, TestEvent::DidDial);

        transport.send(Bytes::from_static(b"secret")).await.unwrap();
        assert_eq!(expect_event(&mut server_events).await, TestEvent::Message(b"secret".to_vec()));

        // the server side learned the client's static key from the DIAL
        let server_side = server_factory.get_transport(transport.self_addr()).unwrap();
        assert_eq!(server_side.remote_static_pk(), Some(client_factory.public_key()));
    }

    #[tokio::test]
    async fn test_large_message_roundtrip() {
        let client_factory = bound_factory([5; 32]).await;
        let server_factory = bound_factory([6; 32]).await;

        let (client, mut client_events) = TestNode::new(false);
        let (server, mut server_events) = TestNode::new(true);
        server_factory.listen(as_listen_delegate(&server)).unwrap();

        let transport = client_factory
            .dial(server_factory.local_addr().unwrap(), as_listen_delegate(&client), None)
            .await
            .unwrap();
        expect_event(&mut client_events).await;

        let data: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
        transport.send(Bytes::from(data.clone())).await.unwrap();

        assert_eq!(expect_event(&mut server_events).await, TestEvent::Message(data));
    }

    #[tokio::test]
    async fn test_should_accept_false_refuses() {
        // short handshake budget so the refusal is observed quickly
        let config = StreamConfig {
            initial_rto: Duration::from_millis(10),
            tick_interval: Duration::from_millis(5),
            max_handshake_retries: 3,
            ..StreamConfig::default()
        };
        let client_factory = StreamTransportFactory::new(config, [7; 32]).unwrap();
        client_factory.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server_factory = bound_factory([8; 32]).await;

        let (client, mut client_events) = TestNode::new(false);
        let (server, _server_events) = TestNode::new(false);
        server_factory.listen(as_listen_delegate(&server)).unwrap();

        client_factory
            .dial(server_factory.local_addr().unwrap(), as_listen_delegate(&client), None)
            .await
            .unwrap();

        // the server refuses, so the handshake eventually times out
        let event = tokio::time::timeout(Duration::from_secs(10), client_events.recv()).await;
        match event {
            Ok(Some(TestEvent::Closed(CloseReason::HandshakeTimeout))) => {}
            other => panic!("expected handshake timeout, got {:?}", other),
        }
        assert_eq!(server_factory.num_transports(), 0);
    }

    #[tokio::test]
    async fn test_close_propagates() {
        let client_factory = bound_factory([9; 32]).await;
        let server_factory = bound_factory([10; 32]).await;

        let (client, mut client_events) = TestNode::new(false);
        let (server, mut server_events) = TestNode::new(true);
        server_factory.listen(as_listen_delegate(&server)).unwrap();

        let server_addr = server_factory.local_addr().unwrap();
        let transport = client_factory
            .dial(server_addr, as_listen_delegate(&client), None)
            .await
            .unwrap();
        expect_event(&mut client_events).await;

        // make sure the server side is fully established before closing
        transport.send(Bytes::from_static(b"ping")).await.unwrap();
        expect_event(&mut server_events).await;

        transport.close(CloseReason::Local).await;

        assert_eq!(expect_event(&mut client_events).await, TestEvent::Closed(CloseReason::Local));
        assert_eq!(expect_event(&mut server_events).await, TestEvent::Closed(CloseReason::Reset));

        // the manager forgets closed transports
        assert_eq!(client_factory.num_transports(), 0);
        assert!(client_factory.get_transport(server_addr).is_none());
    }
}
