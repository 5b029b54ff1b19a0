use crate::cipher::PacketCipher;
use crate::config::StreamConfig;
use crate::connection::{Connection, ConnectionEvent, Outcome};
use crate::delegate::TransportDelegate;
use crate::packet::{PacketHeader, PacketKind, HEADER_LEN};
use crate::socket::DatagramSocket;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

pub use crate::connection::CloseReason;

struct TransportInner {
    conn: Connection,
    peer_addr: SocketAddr,
}

/// One reliable connection to one peer, multiplexing up to 65535 concurrent streams.
///
/// The transport owns no thread of its own apart from a maintenance tick task; all inbound
///  work is driven by the factory's receive loop. State lives behind one lock that is never
///  held across a delegate call or a socket send, so delegates are free to call back into
///  `send`/`close` from within their callbacks.
pub struct StreamTransport {
    config: Arc<StreamConfig>,
    socket: Arc<dyn DatagramSocket>,
    cipher: Arc<dyn PacketCipher>,
    remote_static_pk: Option<[u8; 32]>,
    conn_id: u32,
    inner: RwLock<TransportInner>,
    delegate: std::sync::RwLock<Option<Weak<dyn TransportDelegate>>>,
    close_dispatched: AtomicBool,
    tick_task: Mutex<Option<JoinHandle<()>>>,
    on_closed: Box<dyn Fn(&StreamTransport) + Send + Sync>,
}

impl StreamTransport {
    pub(crate) fn new(
        config: Arc<StreamConfig>,
        socket: Arc<dyn DatagramSocket>,
        cipher: Arc<dyn PacketCipher>,
        remote_static_pk: Option<[u8; 32]>,
        conn: Connection,
        peer_addr: SocketAddr,
        on_closed: Box<dyn Fn(&StreamTransport) + Send + Sync>,
    ) -> StreamTransport {
        StreamTransport {
            config,
            socket,
            cipher,
            remote_static_pk,
            conn_id: conn.local_conn_id(),
            inner: RwLock::new(TransportInner { conn, peer_addr }),
            delegate: std::sync::RwLock::new(None),
            close_dispatched: AtomicBool::new(false),
            tick_task: Mutex::new(None),
            on_closed,
        }
    }

    /// Wire up the upper layer. Must happen before any data flows; the factory guarantees
    ///  this by invoking the listen delegate synchronously on transport creation.
    pub fn setup(&self, delegate: Weak<dyn TransportDelegate>) {
        *self.delegate.write().unwrap() = Some(delegate);
    }

    fn delegate(&self) -> Option<Arc<dyn TransportDelegate>> {
        self.delegate.read().unwrap().as_ref().and_then(|weak| weak.upgrade())
    }

    pub async fn peer_addr(&self) -> SocketAddr {
        self.inner.read().await.peer_addr
    }

    pub fn self_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn remote_static_pk(&self) -> Option<[u8; 32]> {
        self.remote_static_pk
    }

    pub async fn is_active(&self) -> bool {
        self.inner.read().await.conn.is_active()
    }

    /// The connection id chosen locally at handshake; stable for the transport's lifetime.
    pub fn conn_id(&self) -> u32 {
        self.conn_id
    }

    /// Spawn the maintenance tick driving retransmission, handshake backoff and the idle
    ///  timeout. The task holds only a weak reference, so dropping the transport stops it.
    pub(crate) fn spawn_tick(self: &Arc<StreamTransport>) {
        let weak = Arc::downgrade(self);
        let interval = self.config.tick_interval;

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                let Some(transport) = weak.upgrade() else {
                    return;
                };

                let outcome = transport.inner.write().await.conn.on_tick(Instant::now());
                transport.flush(outcome).await;

                if transport.close_dispatched.load(Ordering::SeqCst) {
                    return;
                }
            }
        });

        *self.tick_task.lock().unwrap() = Some(handle);
    }

    //---------------- sending ----------------//

    /// Send a complete message on a fresh stream.
    pub async fn send(&self, message: Bytes) -> anyhow::Result<()> {
        let (stream_id, outcome) = {
            let mut inner = self.inner.write().await;
            inner.conn.send_message(message, Instant::now())?
        };
        self.flush(outcome).await;

        if let Some(delegate) = self.delegate() {
            delegate.did_send(stream_id).await;
        }
        Ok(())
    }

    /// Open a stream for incremental writes; this is the cut-through send path.
    pub async fn open_send_stream(&self) -> anyhow::Result<u16> {
        self.inner.write().await.conn.open_stream()
    }

    pub async fn send_on_stream(&self, stream_id: u16, bytes: Bytes, fin: bool) -> anyhow::Result<()> {
        let outcome = {
            let mut inner = self.inner.write().await;
            inner.conn.send_on_stream(stream_id, bytes, fin, Instant::now())?
        };
        self.flush(outcome).await;
        Ok(())
    }

    /// Abandon an outbound stream without finalizing it on the wire.
    pub async fn abandon_send_stream(&self, stream_id: u16) {
        self.inner.write().await.conn.abandon_send_stream(stream_id);
    }

    /// Stop delivering an inbound stream; further fragments are acked and dropped.
    pub async fn skip_recv_stream(&self, stream_id: u16) {
        self.inner.write().await.conn.skip_recv_stream(stream_id);
    }

    pub async fn close(&self, reason: CloseReason) {
        let outcome = self.inner.write().await.conn.close(reason);
        self.flush(outcome).await;
    }

    /// Type-erased close for use inside the event dispatch, where a direct call would make
    ///  `flush` / `dispatch` / `close` mutually recursive futures.
    fn close_boxed(&self, reason: CloseReason) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(self.close(reason))
    }

    //---------------- receiving ----------------//

    /// Feed one datagram addressed to this transport. `raw` is the entire datagram including
    ///  the header; `header` is its parsed form. Handshake packets travel in the clear, data
    ///  packets are opened with the connection's cipher (with the raw header as associated
    ///  data), and the plaintext is handed to the state machine.
    pub(crate) async fn handle_datagram(&self, mut header: PacketHeader, raw: Bytes, from: SocketAddr) {
        let wire_payload = &raw[HEADER_LEN..];
        if wire_payload.len() != header.payload_len as usize {
            debug!("datagram payload length {} does not match header {} - dropping", wire_payload.len(), header.payload_len);
            return;
        }

        let payload = if is_handshake(header.kind) {
            raw.slice(HEADER_LEN..)
        }
        else {
            match self.cipher.open(&raw[..HEADER_LEN], wire_payload) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    debug!("dropping cryptographically invalid packet from {:?}: {}", from, e);
                    return;
                }
            }
        };
        header.payload_len = payload.len() as u16;

        let result = {
            let mut inner = self.inner.write().await;

            // connection ids pin the connection, the address may change under it
            if inner.peer_addr != from {
                debug!("peer address changed {:?} -> {:?}", inner.peer_addr, from);
                inner.peer_addr = from;
            }

            inner.conn.on_packet(&header, payload, Instant::now())
        };

        match result {
            Ok(outcome) => self.flush(outcome).await,
            Err(e) => {
                warn!("protocol violation from {:?}: {} - closing", from, e);
                self.close(CloseReason::ProtocolViolation).await;
            }
        }
    }

    //---------------- plumbing ----------------//

    /// Transmit the packets and dispatch the events of one state machine step. Called
    ///  without the inner lock held.
    pub(crate) async fn flush(&self, outcome: Outcome) {
        if !outcome.packets.is_empty() {
            let peer_addr = self.inner.read().await.peer_addr;

            for packet in outcome.packets {
                let buf = match self.seal_packet(packet.header, &packet.payload) {
                    Ok(buf) => buf,
                    Err(e) => {
                        warn!("failed to seal packet: {}", e);
                        continue;
                    }
                };
                self.socket.send_packet(peer_addr, &buf).await;
            }
        }

        for event in outcome.events {
            self.dispatch(event).await;
        }
    }

    fn seal_packet(&self, mut header: PacketHeader, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        if is_handshake(header.kind) {
            let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
            header.ser(&mut buf);
            buf.extend_from_slice(payload);
            return Ok(buf.to_vec());
        }

        header.payload_len = (payload.len() + self.cipher.overhead()) as u16;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + header.payload_len as usize);
        header.ser(&mut buf);

        let sealed = self.cipher.seal(&buf[..HEADER_LEN], payload)?;
        buf.extend_from_slice(&sealed);
        Ok(buf.to_vec())
    }

    async fn dispatch(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::DialEstablished => {
                if let Some(delegate) = self.delegate() {
                    delegate.did_dial().await;
                }
            }
            ConnectionEvent::PeerEstablished => {
                trace!("inbound connection established");
            }
            ConnectionEvent::RecvBytes { stream_id, bytes } => {
                if let Some(delegate) = self.delegate() {
                    if let Err(e) = delegate.did_recv_bytes(stream_id, bytes).await {
                        warn!("upper layer rejected stream {}: {} - closing", stream_id, e);
                        self.close_boxed(CloseReason::ProtocolViolation).await;
                    }
                }
            }
            ConnectionEvent::StreamEnd { stream_id } => {
                if let Some(delegate) = self.delegate() {
                    if let Err(e) = delegate.did_recv_stream_end(stream_id).await {
                        warn!("upper layer rejected end of stream {}: {} - closing", stream_id, e);
                        self.close_boxed(CloseReason::ProtocolViolation).await;
                    }
                }
            }
            ConnectionEvent::Closed { reason } => {
                if self.close_dispatched.swap(true, Ordering::SeqCst) {
                    return;
                }

                let peer_addr = self.inner.read().await.peer_addr;
                debug!("transport to {:?} closed: {:?}", peer_addr, reason);

                // the tick task observes `close_dispatched` and winds itself down; aborting it
                //  here could cancel this very dispatch when the tick task is the caller
                (self.on_closed)(self);

                if let Some(delegate) = self.delegate() {
                    delegate.did_close(reason).await;
                }
            }
        }
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.tick_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

fn is_handshake(kind: PacketKind) -> bool {
    matches!(kind, PacketKind::Dial | PacketKind::DialConf | PacketKind::Conf)
}
