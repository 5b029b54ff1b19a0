use crate::connection::CloseReason;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;

/// Capability set a listener exposes to the factory: accept policy plus the notification
///  that a (not yet established) inbound transport exists and wants its delegate wired up.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ListenDelegate: Send + Sync + 'static {
    async fn should_accept(&self, addr: SocketAddr) -> bool;

    async fn did_create_transport(&self, transport: std::sync::Arc<crate::transport::StreamTransport>);
}

/// Capability set the layer above a transport implements. Within one stream, `did_recv_bytes`
///  is invoked in strict offset order and `did_recv_stream_end` after the last byte; across
///  streams there is no ordering. An error return is a protocol violation as judged by the
///  upper layer and closes the transport.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransportDelegate: Send + Sync + 'static {
    async fn did_dial(&self);

    async fn did_recv_bytes(&self, stream_id: u16, bytes: Bytes) -> anyhow::Result<()>;

    async fn did_recv_stream_end(&self, stream_id: u16) -> anyhow::Result<()>;

    async fn did_send(&self, stream_id: u16);

    async fn did_close(&self, reason: CloseReason);
}
