//! End-to-end scenarios: real nodes over loopback UDP.

use async_trait::async_trait;
use bytes::Bytes;
use pubsub::wire;
use pubsub::{
    EmptyAttester, EmptyWitnesser, KeyListWitnesser, MessageHeader, PubSubConfig, PubSubDelegate, PubSubNode,
    Witnesser,
};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use x25519_dalek::{PublicKey, StaticSecret};

/// poll a condition until it holds, up to ~10s
macro_rules! wait_until {
    ($what:expr, $cond:expr) => {{
        let mut ok = false;
        for _ in 0..400 {
            if $cond {
                ok = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        if !ok {
            panic!("timed out waiting for {}", $what);
        }
    }};
}

#[derive(Debug)]
struct ReceivedMessage {
    channel: u16,
    msg_id: u64,
    payload: Vec<u8>,
}

struct TestApp {
    channels: Vec<u16>,
    promote_standbys: bool,
    node: OnceLock<Arc<PubSubNode>>,
    messages: mpsc::UnboundedSender<ReceivedMessage>,
}

impl TestApp {
    fn new(channels: Vec<u16>, promote_standbys: bool) -> (Arc<TestApp>, mpsc::UnboundedReceiver<ReceivedMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(TestApp {
                channels,
                promote_standbys,
                node: OnceLock::new(),
                messages: tx,
            }),
            rx,
        )
    }
}

#[async_trait]
impl PubSubDelegate for TestApp {
    fn channels(&self) -> Vec<u16> {
        self.channels.clone()
    }

    async fn did_subscribe(&self, _channel: u16) {}

    async fn did_unsubscribe(&self, _channel: u16) {}

    async fn did_recv_message(&self, message: Bytes, _header: MessageHeader, channel: u16, msg_id: u64) {
        self.messages
            .send(ReceivedMessage {
                channel,
                msg_id,
                payload: message.to_vec(),
            })
            .ok();
    }

    async fn should_accept(&self, _addr: SocketAddr) -> bool {
        true
    }

    async fn manage_subscriptions(&self, max_sol_conns: usize, sol_conns: Vec<SocketAddr>, standby: Vec<SocketAddr>) {
        if !self.promote_standbys {
            return;
        }
        let Some(node) = self.node.get() else {
            return;
        };

        let mut free = max_sol_conns.saturating_sub(sol_conns.len());
        for addr in standby {
            if free == 0 {
                break;
            }
            if node.add_sol_conn_addr(addr).await {
                free -= 1;
            }
        }
    }
}

async fn make_node(
    config: PubSubConfig,
    seed: u8,
    channels: Vec<u16>,
    promote_standbys: bool,
    witnesser: Arc<dyn Witnesser>,
) -> (Arc<PubSubNode>, Arc<TestApp>, mpsc::UnboundedReceiver<ReceivedMessage>) {
    let (app, rx) = TestApp::new(channels, promote_standbys);

    let node = PubSubNode::new(config, [seed; 32], Arc::new(EmptyAttester), witnesser)
        .await
        .unwrap();
    node.set_delegate(Arc::downgrade(&app) as Weak<dyn PubSubDelegate>);
    app.node.set(node.clone()).ok();

    (node, app, rx)
}

fn loopback_config() -> PubSubConfig {
    PubSubConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        ..PubSubConfig::default()
    }
}

async fn recv_message(rx: &mut mpsc::UnboundedReceiver<ReceivedMessage>) -> ReceivedMessage {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("message channel closed")
}

#[tokio::test]
async fn test_single_publisher_three_subscribers() {
    let publisher_config = PubSubConfig {
        accept_unsol_conn: true,
        max_unsol_conns: 8,
        ..loopback_config()
    };
    let (publisher, _pub_app, _pub_rx) =
        make_node(publisher_config, 1, vec![1], false, Arc::new(EmptyWitnesser)).await;
    let publisher_addr = publisher.local_addr().unwrap();

    let mut subscribers = Vec::new();
    for seed in 2..5u8 {
        let (node, app, rx) = make_node(loopback_config(), seed, vec![1], false, Arc::new(EmptyWitnesser)).await;
        node.subscribe(publisher_addr, None).await.unwrap();
        subscribers.push((node, app, rx));
    }

    for (node, _, _) in &subscribers {
        wait_until!("subscriber admission", node.sol_conn_addrs().await.contains(&publisher_addr));
    }
    wait_until!("publisher unsol set", publisher.unsol_conn_addrs().await.len() == 3);

    let msg_id = publisher.send_message_on_channel(1, Bytes::from_static(b"hi"), None).await;

    for (_, _, rx) in subscribers.iter_mut() {
        let received = recv_message(rx).await;
        assert_eq!(received.channel, 1);
        assert_eq!(received.msg_id, msg_id);
        assert_eq!(received.payload, b"hi");
    }

    // exactly once: nothing else shows up
    tokio::time::sleep(Duration::from_millis(300)).await;
    for (_, _, rx) in subscribers.iter_mut() {
        assert!(rx.try_recv().is_err());
    }
}

#[tokio::test]
async fn test_relay_ring_with_loop_prevention() {
    let relay_config = || PubSubConfig {
        accept_unsol_conn: true,
        enable_relay: true,
        max_sol_conns: 2,
        max_unsol_conns: 8,
        ..loopback_config()
    };

    let (r1, _a1, mut rx1) = make_node(relay_config(), 10, vec![7], false, Arc::new(EmptyWitnesser)).await;
    let (r2, _a2, mut rx2) = make_node(relay_config(), 11, vec![7], false, Arc::new(EmptyWitnesser)).await;
    let (r3, _a3, mut rx3) = make_node(relay_config(), 12, vec![7], false, Arc::new(EmptyWitnesser)).await;

    let addr1 = r1.local_addr().unwrap();
    let addr2 = r2.local_addr().unwrap();
    let addr3 = r3.local_addr().unwrap();

    // directed ring: r1 -> r2 -> r3 -> r1
    r1.subscribe(addr2, None).await.unwrap();
    wait_until!("r1 -> r2", r1.sol_conn_addrs().await.contains(&addr2));
    r2.subscribe(addr3, None).await.unwrap();
    wait_until!("r2 -> r3", r2.sol_conn_addrs().await.contains(&addr3));
    r3.subscribe(addr1, None).await.unwrap();
    wait_until!("r3 -> r1", r3.sol_conn_addrs().await.contains(&addr1));

    let msg_id = r1.send_message_on_channel(7, Bytes::from_static(b"ring"), None).await;

    let from_r2 = recv_message(&mut rx2).await;
    assert_eq!((from_r2.channel, from_r2.msg_id), (7, msg_id));
    let from_r3 = recv_message(&mut rx3).await;
    assert_eq!((from_r3.channel, from_r3.msg_id), (7, msg_id));

    // each delivers exactly once, and nothing flows back to the publisher
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(rx1.try_recv().is_err());
    assert!(rx2.try_recv().is_err());
    assert!(rx3.try_recv().is_err());
}

#[tokio::test]
async fn test_capacity_overflow_and_standby_promotion() {
    let publisher_config = || PubSubConfig {
        accept_unsol_conn: true,
        max_unsol_conns: 8,
        ..loopback_config()
    };
    let (p1, _pa1, _pr1) = make_node(publisher_config(), 20, vec![1], false, Arc::new(EmptyWitnesser)).await;
    let (p2, _pa2, _pr2) = make_node(publisher_config(), 21, vec![1], false, Arc::new(EmptyWitnesser)).await;
    let (p3, _pa3, _pr3) = make_node(publisher_config(), 22, vec![1], false, Arc::new(EmptyWitnesser)).await;

    let addr1 = p1.local_addr().unwrap();
    let addr2 = p2.local_addr().unwrap();
    let addr3 = p3.local_addr().unwrap();

    let client_config = PubSubConfig {
        max_sol_conns: 2,
        ..loopback_config()
    };
    let (client, _app, _rx) = make_node(client_config, 23, vec![1], true, Arc::new(EmptyWitnesser)).await;

    client.subscribe(addr1, None).await.unwrap();
    wait_until!("p1 admitted", client.sol_conn_addrs().await.contains(&addr1));
    client.subscribe(addr2, None).await.unwrap();
    wait_until!("p2 admitted", client.sol_conn_addrs().await.contains(&addr2));

    // the third dial lands in standby, and no SUBSCRIBE reaches p3
    client.subscribe(addr3, None).await.unwrap();
    wait_until!("p3 parked", client.sol_standby_addrs().await.contains(&addr3));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.sol_conn_addrs().await.len(), 2);
    assert!(p3.unsol_conn_addrs().await.is_empty());

    // p1 disconnect: blacklist + promotion of p3, which now gets its SUBSCRIBE
    client.close_peer(addr1).await;

    wait_until!("p3 promoted", client.sol_conn_addrs().await.contains(&addr3));
    assert!(client.is_blacklisted(addr1).await);
    assert!(client.sol_standby_addrs().await.is_empty());
    wait_until!("p3 sees the client", p3.unsol_conn_addrs().await.len() == 1);

    // blacklisted addresses are not re-subscribed until the flush
    client.subscribe(addr1, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!client.sol_conn_addrs().await.contains(&addr1));
    assert!(!client.sol_standby_addrs().await.contains(&addr1));

    // the peer sets stay pairwise disjoint throughout
    let sol = client.sol_conn_addrs().await;
    let standby = client.sol_standby_addrs().await;
    let unsol = client.unsol_conn_addrs().await;
    for addr in &sol {
        assert!(!standby.contains(addr) && !unsol.contains(addr));
    }
    for addr in &standby {
        assert!(!unsol.contains(addr));
    }
}

async fn send_with_fixed_id(node: &PubSubNode, msg_id: u64, payload: &'static [u8]) {
    node.send_message_on_channel_with_id(1, msg_id, Bytes::from_static(payload), None, MessageHeader::default())
        .await;
}

#[tokio::test]
async fn test_dedup_window_expiry() {
    let publisher_config = PubSubConfig {
        accept_unsol_conn: true,
        ..loopback_config()
    };
    let (publisher, _pub_app, _pub_rx) =
        make_node(publisher_config, 30, vec![1], false, Arc::new(EmptyWitnesser)).await;
    let publisher_addr = publisher.local_addr().unwrap();

    // 10ms ticks -> a dedup window of ~2.56s
    let subscriber_config = PubSubConfig {
        dedup_tick_interval: Duration::from_millis(10),
        ..loopback_config()
    };
    let (subscriber, _sub_app, mut rx) =
        make_node(subscriber_config, 31, vec![1], false, Arc::new(EmptyWitnesser)).await;

    subscriber.subscribe(publisher_addr, None).await.unwrap();
    wait_until!("subscription", publisher.unsol_conn_addrs().await.len() == 1);

    let msg_id = 0xAAu64;

    send_with_fixed_id(&publisher, msg_id, b"first").await;
    let first = recv_message(&mut rx).await;
    assert_eq!(first.payload, b"first");

    // a resend inside the window is suppressed
    tokio::time::sleep(Duration::from_secs(1)).await;
    send_with_fixed_id(&publisher, msg_id, b"second").await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(rx.try_recv().is_err());

    // and one after the window is delivered again
    tokio::time::sleep(Duration::from_millis(1800)).await;
    send_with_fixed_id(&publisher, msg_id, b"third").await;
    let third = recv_message(&mut rx).await;
    assert_eq!(third.msg_id, msg_id);
    assert_eq!(third.payload, b"third");
}

//---------------- cut-through relay ----------------//

mod raw_subscriber {
    use super::*;
    use framing::{FramedListenDelegate, FramedTransport, FramedTransportDelegate};

    /// A bare framed-transport app standing in for a downstream peer, so the test can watch
    ///  the cut-through byte stream a relay emits.
    pub struct RawSubscriber {
        pub weak_self: Weak<RawSubscriber>,
        pub events: mpsc::UnboundedSender<RawEvent>,
    }

    #[derive(Debug)]
    pub enum RawEvent {
        CtStart { length: u64 },
        CtBytes { bytes: Vec<u8> },
        CtEnd,
    }

    impl RawSubscriber {
        pub fn new() -> (Arc<RawSubscriber>, mpsc::UnboundedReceiver<RawEvent>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let app = Arc::new_cyclic(|weak_self| RawSubscriber {
                weak_self: weak_self.clone(),
                events: tx,
            });
            (app, rx)
        }
    }

    #[async_trait]
    impl FramedListenDelegate for RawSubscriber {
        async fn should_accept(&self, _addr: SocketAddr) -> bool {
            true
        }

        async fn did_create_transport(&self, transport: Arc<FramedTransport>) {
            transport.setup(self.weak_self.clone() as Weak<dyn FramedTransportDelegate>);
        }
    }

    #[async_trait]
    impl FramedTransportDelegate for RawSubscriber {
        async fn did_dial(&self, _transport: Arc<FramedTransport>) {}

        async fn did_recv_message(&self, _transport: Arc<FramedTransport>, _message: Bytes) -> anyhow::Result<()> {
            Ok(())
        }

        async fn did_send_message(&self, _transport: Arc<FramedTransport>) {}

        async fn did_close(&self, _transport: Arc<FramedTransport>) {}

        async fn cut_through_recv_start(&self, _transport: Arc<FramedTransport>, _id: u16, length: u64) {
            self.events.send(RawEvent::CtStart { length }).ok();
        }

        async fn cut_through_recv_bytes(&self, _transport: Arc<FramedTransport>, _id: u16, bytes: Bytes) -> anyhow::Result<()> {
            self.events.send(RawEvent::CtBytes { bytes: bytes.to_vec() }).ok();
            Ok(())
        }

        async fn cut_through_recv_end(&self, _transport: Arc<FramedTransport>, _id: u16) {
            self.events.send(RawEvent::CtEnd).ok();
        }

        async fn cut_through_recv_flush(&self, _transport: Arc<FramedTransport>, _id: u16) {}

        async fn cut_through_recv_skip(&self, _transport: Arc<FramedTransport>, _id: u16) {}
    }
}

#[tokio::test]
async fn test_cut_through_relay_appends_witness() {
    use framing::{FramedListenDelegate, FramedTransportFactory, FramingConfig};
    use raw_subscriber::{RawEvent, RawSubscriber};

    let ct_config = |relay: bool| PubSubConfig {
        accept_unsol_conn: true,
        enable_relay: relay,
        enable_cut_through: true,
        max_unsol_conns: 8,
        ..loopback_config()
    };

    let publisher_secret = StaticSecret::from([40u8; 32]);
    let relay_secret = StaticSecret::from([41u8; 32]);

    let (publisher, _pub_app, _pub_rx) = make_node(
        ct_config(false),
        40,
        vec![9],
        false,
        Arc::new(KeyListWitnesser::new(&publisher_secret)),
    )
    .await;
    let (relay, _relay_app, _relay_rx) = make_node(
        ct_config(true),
        41,
        vec![9],
        false,
        Arc::new(KeyListWitnesser::new(&relay_secret)),
    )
    .await;

    let publisher_addr = publisher.local_addr().unwrap();
    let relay_addr = relay.local_addr().unwrap();

    // relay pulls from the publisher
    relay.subscribe(publisher_addr, Some(publisher.public_key())).await.unwrap();
    wait_until!("relay subscription", publisher.unsol_conn_addrs().await.len() == 1);

    // a bare framed subscriber hangs off the relay and watches the raw byte stream
    let subscriber_factory = FramedTransportFactory::new(
        FramingConfig {
            enable_cut_through: true,
            ..FramingConfig::default()
        },
        [42; 32],
    )
    .unwrap();
    subscriber_factory.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let (raw_app, mut raw_rx) = RawSubscriber::new();
    let transport = subscriber_factory
        .dial(
            relay_addr,
            Arc::downgrade(&raw_app) as Weak<dyn FramedListenDelegate>,
            Some(relay.public_key()),
        )
        .await
        .unwrap();

    wait_until!("raw subscriber active", transport.is_active().await);
    transport.send(wire::build_subscribe(9)).await.unwrap();
    wait_until!("raw subscriber admitted", relay.unsol_conn_addrs().await.len() == 1);

    // publish something comfortably above the cut-through threshold
    let payload: Vec<u8> = (0..300_000).map(|i| (i % 251) as u8).collect();
    publisher.send_message_on_channel(9, Bytes::from(payload.clone()), None).await;

    let RawEvent::CtStart { length } = tokio::time::timeout(Duration::from_secs(30), raw_rx.recv())
        .await
        .expect("timed out waiting for cut-through start")
        .expect("event channel closed")
    else {
        panic!("expected cut-through start");
    };

    // original frame: type + msg id + channel + witness(2 + 32) + payload; the relay adds
    //  its own 32-byte key on the way through
    let original_frame_len = 1 + 8 + 2 + 34 + payload.len() as u64;
    assert_eq!(length, original_frame_len + 32);

    let mut frame = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(30), raw_rx.recv())
            .await
            .expect("timed out waiting for cut-through bytes")
            .expect("event channel closed")
        {
            RawEvent::CtBytes { bytes } => frame.extend(bytes),
            RawEvent::CtEnd => break,
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(frame.len() as u64, length);

    // the relayed message carries both keys on the witness list, publisher first
    assert_eq!(frame[0], wire::TYPE_MESSAGE);
    assert_eq!(u16::from_be_bytes([frame[9], frame[10]]), 9);

    let witness_len = u16::from_be_bytes([frame[11], frame[12]]) as usize;
    assert_eq!(witness_len, 64);

    let keys = &frame[13..13 + witness_len];
    assert_eq!(&keys[..32], PublicKey::from(&publisher_secret).as_bytes());
    assert_eq!(&keys[32..], PublicKey::from(&relay_secret).as_bytes());

    assert_eq!(&frame[13 + witness_len..], &payload[..]);

    // the relay itself knows the message id now, so a loop cannot form
    let msg_id = u64::from_be_bytes(frame[1..9].try_into().unwrap());
    assert!(relay.knows_message(msg_id).await);
}
