use crate::config::FramingConfig;
use crate::delegate::FramedTransportDelegate;
use crate::prefix::{FrameHandler, LengthPrefixFramer};
use anyhow::bail;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use stream::transport::CloseReason;
use stream::transport::StreamTransport;
use stream::TransportDelegate;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

enum StreamMode {
    Idle,
    Assembling(BytesMut),
    CutThrough,
}

struct RecvFrameState {
    framer: LengthPrefixFramer,
    mode: StreamMode,
}

struct FramedInner {
    recv: FxHashMap<u16, RecvFrameState>,
}

/// A message-oriented transport over one stream transport. Each outbound message travels on
///  its own stream as `length prefix + payload`; inbound streams are framed back, and frames
///  above the cut-through threshold are forwarded fragment by fragment instead of being
///  assembled.
pub struct FramedTransport {
    weak_self: Weak<FramedTransport>,
    config: Arc<FramingConfig>,
    stream: Arc<StreamTransport>,
    inner: Mutex<FramedInner>,
    delegate: std::sync::RwLock<Option<Weak<dyn FramedTransportDelegate>>>,
    on_closed: Box<dyn Fn(&FramedTransport) + Send + Sync>,
}

impl FramedTransport {
    pub(crate) fn new(
        config: Arc<FramingConfig>,
        stream: Arc<StreamTransport>,
        on_closed: Box<dyn Fn(&FramedTransport) + Send + Sync>,
    ) -> Arc<FramedTransport> {
        Arc::new_cyclic(|weak_self| FramedTransport {
            weak_self: weak_self.clone(),
            config,
            stream,
            inner: Mutex::new(FramedInner { recv: FxHashMap::default() }),
            delegate: std::sync::RwLock::new(None),
            on_closed,
        })
    }

    /// Wire up the pub/sub layer above.
    pub fn setup(&self, delegate: Weak<dyn FramedTransportDelegate>) {
        *self.delegate.write().unwrap() = Some(delegate);
    }

    fn delegate(&self) -> Option<Arc<dyn FramedTransportDelegate>> {
        self.delegate.read().unwrap().as_ref().and_then(|weak| weak.upgrade())
    }

    fn self_arc(&self) -> Option<Arc<FramedTransport>> {
        self.weak_self.upgrade()
    }

    pub async fn peer_addr(&self) -> SocketAddr {
        self.stream.peer_addr().await
    }

    pub fn self_addr(&self) -> SocketAddr {
        self.stream.self_addr()
    }

    pub fn remote_static_pk(&self) -> Option<[u8; 32]> {
        self.stream.remote_static_pk()
    }

    pub async fn is_active(&self) -> bool {
        self.stream.is_active().await
    }

    pub async fn close(&self) {
        self.stream.close(CloseReason::Local).await;
    }

    fn encode_prefix(&self, len: u64) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.config.prefix_length as usize);
        for i in (0..self.config.prefix_length).rev() {
            buf.put_u8((len >> (8 * i)) as u8);
        }
        buf.freeze()
    }

    //---------------- sending ----------------//

    /// Send one message: length prefix plus payload on a fresh stream.
    pub async fn send(&self, message: Bytes) -> anyhow::Result<()> {
        let mut buf = BytesMut::with_capacity(self.config.prefix_length as usize + message.len());
        buf.extend_from_slice(&self.encode_prefix(message.len() as u64));
        buf.extend_from_slice(&message);

        self.stream.send(buf.freeze()).await
    }

    /// Send a complete message through the cut-through machinery, so a relay downstream can
    ///  start forwarding before the message is fully transmitted.
    pub async fn cut_through_send(&self, message: Bytes) -> anyhow::Result<()> {
        let id = self.cut_through_send_start(message.len() as u64).await?;
        self.cut_through_send_bytes(id, message).await?;
        self.cut_through_send_end(id).await
    }

    /// Open a cut-through stream announcing `len` payload bytes; the prefix goes on the wire
    ///  immediately. Returns the stream id for the subsequent `bytes` / `end` calls.
    pub async fn cut_through_send_start(&self, len: u64) -> anyhow::Result<u16> {
        let id = self.stream.open_send_stream().await?;
        self.stream.send_on_stream(id, self.encode_prefix(len), false).await?;
        trace!("cut-through send {} started, {} bytes announced", id, len);
        Ok(id)
    }

    pub async fn cut_through_send_bytes(&self, id: u16, bytes: Bytes) -> anyhow::Result<()> {
        self.stream.send_on_stream(id, bytes, false).await
    }

    pub async fn cut_through_send_end(&self, id: u16) -> anyhow::Result<()> {
        trace!("cut-through send {} ended", id);
        self.stream.send_on_stream(id, Bytes::new(), true).await
    }

    /// Abandon an outbound cut-through stream without completing the frame.
    pub async fn cut_through_send_skip(&self, id: u16) {
        debug!("cut-through send {} skipped", id);
        self.stream.abandon_send_stream(id).await;
    }

    /// Sends are not delayed in this transport, so a flush has nothing left to push out.
    pub async fn cut_through_send_flush(&self, _id: u16) {}

    /// Stop receiving an inbound cut-through stream (e.g. a duplicate message).
    pub async fn cut_through_recv_skip(&self, id: u16) {
        debug!("cut-through recv {} skipped", id);
        self.inner.lock().await.recv.remove(&id);
        self.stream.skip_recv_stream(id).await;
    }
}

enum RecvAction {
    Start(u64),
    Bytes(Bytes),
    End,
    Message(Bytes),
}

/// Sync frame handler run under the inner lock; the produced actions are dispatched to the
///  async delegate after the lock is released.
struct FrameCollector<'a> {
    enable_cut_through: bool,
    cut_through_threshold: u64,
    max_frame_len: u64,
    mode: &'a mut StreamMode,
    actions: &'a mut Vec<RecvAction>,
}

impl FrameHandler for FrameCollector<'_> {
    fn did_start_frame(&mut self, len: u64, _addr: SocketAddr) -> anyhow::Result<()> {
        if len > self.max_frame_len {
            bail!("frame of {} bytes exceeds the limit of {}", len, self.max_frame_len);
        }

        if self.enable_cut_through && len > self.cut_through_threshold {
            *self.mode = StreamMode::CutThrough;
            self.actions.push(RecvAction::Start(len));
        }
        else {
            let initial_capacity = len.min(1024 * 1024) as usize;
            *self.mode = StreamMode::Assembling(BytesMut::with_capacity(initial_capacity));
        }
        Ok(())
    }

    fn did_recv(&mut self, bytes: Bytes, _frame_offset: u64, _addr: SocketAddr) -> anyhow::Result<()> {
        match self.mode {
            StreamMode::Assembling(buf) => buf.extend_from_slice(&bytes),
            StreamMode::CutThrough => self.actions.push(RecvAction::Bytes(bytes)),
            StreamMode::Idle => bail!("frame bytes outside a frame"),
        }
        Ok(())
    }

    fn did_recv_frame(&mut self, _addr: SocketAddr) -> anyhow::Result<()> {
        match std::mem::replace(self.mode, StreamMode::Idle) {
            StreamMode::Assembling(buf) => self.actions.push(RecvAction::Message(buf.freeze())),
            StreamMode::CutThrough => self.actions.push(RecvAction::End),
            StreamMode::Idle => bail!("frame completion outside a frame"),
        }
        Ok(())
    }
}

#[async_trait]
impl TransportDelegate for FramedTransport {
    async fn did_dial(&self) {
        if let (Some(delegate), Some(this)) = (self.delegate(), self.self_arc()) {
            delegate.did_dial(this).await;
        }
    }

    async fn did_recv_bytes(&self, stream_id: u16, mut bytes: Bytes) -> anyhow::Result<()> {
        let addr = self.peer_addr().await;

        let mut actions = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            let prefix_length = self.config.prefix_length;
            let state = match inner.recv.entry(stream_id) {
                std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::hash_map::Entry::Vacant(e) => e.insert(RecvFrameState {
                    framer: LengthPrefixFramer::new(prefix_length)?,
                    mode: StreamMode::Idle,
                }),
            };

            let mut collector = FrameCollector {
                enable_cut_through: self.config.enable_cut_through,
                cut_through_threshold: self.config.cut_through_threshold,
                max_frame_len: self.config.max_frame_len,
                mode: &mut state.mode,
                actions: &mut actions,
            };
            state.framer.did_recv(&mut bytes, addr, &mut collector)?;
        }

        let Some(this) = self.self_arc() else {
            return Ok(());
        };
        let Some(delegate) = self.delegate() else {
            warn!("frames from {:?} with no delegate wired up - dropping", addr);
            return Ok(());
        };

        for action in actions {
            match action {
                RecvAction::Start(len) => delegate.cut_through_recv_start(this.clone(), stream_id, len).await,
                RecvAction::Bytes(bytes) => delegate.cut_through_recv_bytes(this.clone(), stream_id, bytes).await?,
                RecvAction::End => delegate.cut_through_recv_end(this.clone(), stream_id).await,
                RecvAction::Message(message) => delegate.did_recv_message(this.clone(), message).await?,
            }
        }
        Ok(())
    }

    async fn did_recv_stream_end(&self, stream_id: u16) -> anyhow::Result<()> {
        let state = self.inner.lock().await.recv.remove(&stream_id);

        if let Some(state) = state {
            let mid_frame = !state.framer.is_idle() || !matches!(state.mode, StreamMode::Idle);
            if mid_frame {
                bail!("stream {} ended mid-frame", stream_id);
            }
        }
        Ok(())
    }

    async fn did_send(&self, _stream_id: u16) {
        if let (Some(delegate), Some(this)) = (self.delegate(), self.self_arc()) {
            delegate.did_send_message(this).await;
        }
    }

    async fn did_close(&self, reason: CloseReason) {
        debug!("framed transport closed: {:?}", reason);
        (self.on_closed)(self);

        if let (Some(delegate), Some(this)) = (self.delegate(), self.self_arc()) {
            delegate.did_close(this).await;
        }
    }
}
