use crate::transport::FramedTransport;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait FramedListenDelegate: Send + Sync + 'static {
    async fn should_accept(&self, addr: SocketAddr) -> bool;

    async fn did_create_transport(&self, transport: Arc<FramedTransport>);
}

/// Capability set of the layer above a [FramedTransport] - a complete message per
///  `did_recv_message`, or the cut-through sequence `start / bytes / end` for frames above
///  the threshold. An error return is a protocol violation and closes the transport.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FramedTransportDelegate: Send + Sync + 'static {
    async fn did_dial(&self, transport: Arc<FramedTransport>);

    async fn did_recv_message(&self, transport: Arc<FramedTransport>, message: Bytes) -> anyhow::Result<()>;

    async fn did_send_message(&self, transport: Arc<FramedTransport>);

    async fn did_close(&self, transport: Arc<FramedTransport>);

    async fn cut_through_recv_start(&self, transport: Arc<FramedTransport>, id: u16, length: u64);

    async fn cut_through_recv_bytes(&self, transport: Arc<FramedTransport>, id: u16, bytes: Bytes) -> anyhow::Result<()>;

    async fn cut_through_recv_end(&self, transport: Arc<FramedTransport>, id: u16);

    async fn cut_through_recv_flush(&self, transport: Arc<FramedTransport>, id: u16);

    async fn cut_through_recv_skip(&self, transport: Arc<FramedTransport>, id: u16);
}
