use crate::wire::MessageHeader;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;

/// The application above the node. `channels` is the ordered set of channel ids the node
///  subscribes to on every solicited peer; `manage_subscriptions` runs on the peer-selection
///  tick and after every disconnect so the application can promote standby peers.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PubSubDelegate: Send + Sync + 'static {
    fn channels(&self) -> Vec<u16>;

    async fn did_subscribe(&self, channel: u16);

    async fn did_unsubscribe(&self, channel: u16);

    async fn did_recv_message(&self, message: Bytes, header: MessageHeader, channel: u16, msg_id: u64);

    async fn should_accept(&self, addr: SocketAddr) -> bool;

    async fn manage_subscriptions(&self, max_sol_conns: usize, sol_conns: Vec<SocketAddr>, sol_standby_conns: Vec<SocketAddr>);
}
