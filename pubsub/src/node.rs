use crate::attestation::Attester;
use crate::config::PubSubConfig;
use crate::dedup::MessageIdWindow;
use crate::delegate::PubSubDelegate;
use crate::peer_set::TransportSet;
use crate::wire::{self, MessageHeader, WITNESS_LEN_OFFSET, WITNESS_OFFSET};
use crate::witness::{witness_contains, Witnesser, WITNESS_KEY_LEN};
use anyhow::bail;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use framing::{FramedListenDelegate, FramedTransport, FramedTransportDelegate, FramedTransportFactory};
use rustc_hash::{FxHashMap, FxHashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use x25519_dalek::{PublicKey, StaticSecret};

/// Downstream legs of one inbound cut-through stream, keyed by `(source peer, source
///  stream id)` in [NodeInner::cut_through].
struct CutThroughSession {
    /// total frame length announced by the source
    length: u64,
    /// the first fragment carries the complete message header; set once it was processed
    header_recv: bool,
    legs: Vec<(Arc<FramedTransport>, u16)>,
}

struct NodeInner {
    sol_conns: TransportSet,
    sol_standby_conns: TransportSet,
    unsol_conns: TransportSet,
    blacklist: FxHashSet<SocketAddr>,
    dedup: MessageIdWindow,
    cut_through: FxHashMap<(SocketAddr, u16), CutThroughSession>,
}

impl NodeInner {
    fn new() -> NodeInner {
        NodeInner {
            sol_conns: TransportSet::new(),
            sol_standby_conns: TransportSet::new(),
            unsol_conns: TransportSet::new(),
            blacklist: FxHashSet::default(),
            dedup: MessageIdWindow::new(),
            cut_through: FxHashMap::default(),
        }
    }

    /// Disjointness guard: a transport may live in at most one of the three peer sets.
    fn transport_present(&self, transport: &Arc<FramedTransport>) -> bool {
        self.sol_conns.contains_transport(transport)
            || self.sol_standby_conns.contains_transport(transport)
            || self.unsol_conns.contains_transport(transport)
    }
}

/// The pub/sub overlay node. Dials a bounded set of *solicited* upstream peers to receive
///  its channels, optionally accepts *unsolicited* downstream peers, deduplicates messages
///  by id over a sliding window, relays first-seen messages when enabled, and fans oversized
///  messages out fragment by fragment through the cut-through path.
pub struct PubSubNode {
    weak_self: Weak<PubSubNode>,
    config: Arc<PubSubConfig>,
    factory: FramedTransportFactory,
    attester: Arc<dyn Attester>,
    witnesser: Arc<dyn Witnesser>,
    secret: StaticSecret,
    delegate: std::sync::RwLock<Option<Weak<dyn PubSubDelegate>>>,
    inner: Mutex<NodeInner>,
    timer_tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl PubSubNode {
    /// Bind and listen on `config.listen_addr`. `keys` is the node's static X25519 secret,
    ///  loaded from an external provider; its public key is what ends up in witness lists.
    pub async fn new(
        config: PubSubConfig,
        keys: [u8; 32],
        attester: Arc<dyn Attester>,
        witnesser: Arc<dyn Witnesser>,
    ) -> anyhow::Result<Arc<PubSubNode>> {
        config.validate()?;

        let factory = FramedTransportFactory::new(config.framing(), keys)?;
        factory.bind(config.listen_addr).await?;

        let node = Arc::new_cyclic(|weak_self| PubSubNode {
            weak_self: weak_self.clone(),
            config: Arc::new(config),
            factory,
            attester,
            witnesser,
            secret: StaticSecret::from(keys),
            delegate: std::sync::RwLock::new(None),
            inner: Mutex::new(NodeInner::new()),
            timer_tasks: std::sync::Mutex::new(Vec::new()),
        });

        node.factory.listen(node.weak_self.clone() as Weak<dyn FramedListenDelegate>)?;
        node.spawn_timers();

        info!("pubsub node listening on {:?}", node.local_addr());
        Ok(node)
    }

    pub fn set_delegate(&self, delegate: Weak<dyn PubSubDelegate>) {
        *self.delegate.write().unwrap() = Some(delegate);
    }

    fn delegate(&self) -> Option<Arc<dyn PubSubDelegate>> {
        self.delegate.read().unwrap().as_ref().and_then(|weak| weak.upgrade())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.factory.local_addr()
    }

    pub fn public_key(&self) -> [u8; 32] {
        PublicKey::from(&self.secret).to_bytes()
    }

    fn channels(&self) -> Vec<u16> {
        self.delegate().map(|d| d.channels()).unwrap_or_default()
    }

    //---------------- subscription management ----------------//

    /// Subscribe to a publisher: dial if no transport exists, otherwise admit the existing
    ///  transport into the solicited set. Blacklisted addresses are left alone until the
    ///  next blacklist flush.
    pub async fn subscribe(&self, addr: SocketAddr, remote_static_pk: Option<[u8; 32]>) -> anyhow::Result<()> {
        if self.inner.lock().await.blacklist.contains(&addr) {
            debug!("not subscribing to blacklisted {:?}", addr);
            return Ok(());
        }

        match self.factory.get_transport(addr) {
            None => {
                debug!("subscribing to {:?}: dialing", addr);
                self.factory
                    .dial(addr, self.weak_self.clone() as Weak<dyn FramedListenDelegate>, remote_static_pk)
                    .await?;
                Ok(())
            }
            Some(transport) => {
                if !transport.is_active().await {
                    return Ok(());
                }
                self.add_sol_conn(transport).await;
                Ok(())
            }
        }
    }

    /// Send UNSUBSCRIBE for every configured channel to the peer at `addr`.
    pub async fn unsubscribe(&self, addr: SocketAddr) {
        let Some(transport) = self.factory.get_transport(addr) else {
            return;
        };

        for channel in self.channels() {
            self.send_unsubscribe(&transport, channel).await;
        }
    }

    /// Admit the peer at `addr` into the solicited set. Returns false when no transport
    ///  exists for the address and false when the peer is already present in some set;
    ///  true only when the peer was actually admitted.
    pub async fn add_sol_conn_addr(&self, addr: SocketAddr) -> bool {
        match self.factory.get_transport(addr) {
            None => false,
            Some(transport) => self.add_sol_conn(transport).await,
        }
    }

    async fn add_sol_conn(&self, transport: Arc<FramedTransport>) -> bool {
        let addr = transport.peer_addr().await;

        enum Decision {
            Admitted,
            Parked,
            AlreadyPresent,
        }

        let decision = {
            let mut inner = self.inner.lock().await;

            if inner.sol_conns.len() >= self.config.max_sol_conns {
                if inner.transport_present(&transport) {
                    Decision::AlreadyPresent
                }
                else {
                    debug!("solicited set full - parking {:?} in standby", addr);
                    inner.sol_standby_conns.insert(addr, transport.clone());
                    Decision::Parked
                }
            }
            else {
                inner.sol_standby_conns.remove_transport(&transport);
                inner.unsol_conns.remove_transport(&transport);

                if inner.transport_present(&transport) {
                    Decision::AlreadyPresent
                }
                else {
                    debug!("adding {:?} to sol conn list", addr);
                    inner.sol_conns.insert(addr, transport.clone());
                    Decision::Admitted
                }
            }
        };

        match decision {
            Decision::Admitted => {
                for channel in self.channels() {
                    self.send_subscribe(&transport, channel).await;
                }
                self.send_response(&transport, true, "SUBSCRIBED").await;
                true
            }
            Decision::Parked | Decision::AlreadyPresent => false,
        }
    }

    async fn add_unsol_conn(&self, transport: Arc<FramedTransport>) -> bool {
        let addr = transport.peer_addr().await;

        let admitted = {
            let mut inner = self.inner.lock().await;

            if inner.unsol_conns.len() >= self.config.max_unsol_conns {
                false
            }
            else if inner.transport_present(&transport) {
                false
            }
            else {
                debug!("adding {:?} to unsol conn list", addr);
                inner.unsol_conns.insert(addr, transport.clone());
                true
            }
        };

        if admitted {
            self.send_response(&transport, true, "SUBSCRIBED").await;
        }
        admitted
    }

    async fn send_subscribe(&self, transport: &Arc<FramedTransport>, channel: u16) {
        debug!("sending subscribe on channel {} to {:?}", channel, transport.peer_addr().await);
        if transport.send(wire::build_subscribe(channel)).await.is_err() {
            transport.close().await;
        }
    }

    async fn send_unsubscribe(&self, transport: &Arc<FramedTransport>, channel: u16) {
        debug!("sending unsubscribe on channel {} to {:?}", channel, transport.peer_addr().await);
        if transport.send(wire::build_unsubscribe(channel)).await.is_err() {
            transport.close().await;
        }
    }

    async fn send_response(&self, transport: &Arc<FramedTransport>, success: bool, text: &str) {
        if transport.send(wire::build_response(success, text)).await.is_err() {
            transport.close().await;
        }
    }

    //---------------- wire handlers ----------------//

    async fn did_recv_subscribe(&self, transport: Arc<FramedTransport>, mut buf: Bytes) -> anyhow::Result<()> {
        let channel = wire::parse_channel(&mut buf)?;
        let addr = transport.peer_addr().await;
        debug!("received subscribe on channel {} from {:?}", channel, addr);

        if !self.config.accept_unsol_conn {
            return Ok(());
        }

        let was_blacklisted = self.inner.lock().await.blacklist.remove(&addr);
        if was_blacklisted {
            self.add_sol_conn(transport).await;
            return Ok(());
        }

        self.add_unsol_conn(transport.clone()).await;
        if !self.inner.lock().await.transport_present(&transport) {
            debug!("no capacity for {:?} - closing", addr);
            transport.close().await;
            bail!("no capacity for subscriber");
        }
        Ok(())
    }

    async fn did_recv_unsubscribe(&self, transport: Arc<FramedTransport>, mut buf: Bytes) -> anyhow::Result<()> {
        let channel = wire::parse_channel(&mut buf)?;
        debug!("received unsubscribe on channel {} from {:?}", channel, transport.peer_addr().await);

        // the channel is deliberately not consulted, matching long-standing behavior
        self.inner.lock().await.unsol_conns.remove_transport(&transport);
        Ok(())
    }

    async fn did_recv_response(&self, buf: Bytes) -> anyhow::Result<()> {
        let response = wire::parse_response(buf)?;
        debug!("received {} response: {}", if response.success { "OK" } else { "ERROR" }, response.text);

        let Some(delegate) = self.delegate() else {
            return Ok(());
        };
        let Some(&first_channel) = delegate.channels().first() else {
            return Ok(());
        };

        if response.text.starts_with("UNSUBSCRIBED") {
            delegate.did_unsubscribe(first_channel).await;
        }
        else if response.text.starts_with("SUBSCRIBED") {
            delegate.did_subscribe(first_channel).await;
        }
        Ok(())
    }

    async fn did_recv_message_payload(&self, transport: Arc<FramedTransport>, mut buf: Bytes) -> anyhow::Result<()> {
        if buf.len() < 10 {
            transport.close().await;
            bail!("truncated message header");
        }

        let msg_id = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        let channel = u16::from_be_bytes(buf[8..10].try_into().unwrap());
        trace!("received message {} on channel {}", msg_id, channel);

        if self.inner.lock().await.dedup.contains(msg_id) {
            trace!("duplicate message {} - dropping", msg_id);
            return Ok(());
        }

        buf.advance(10);

        let attestation_size = self.attester.parse_size(&buf);
        if attestation_size > buf.len() {
            transport.close().await;
            bail!("truncated attestation");
        }
        let attestation = buf.split_to(attestation_size);

        let witness_size = self.witnesser.parse_size(&buf);
        if witness_size > buf.len() {
            transport.close().await;
            bail!("truncated witness");
        }
        let witness = buf.split_to(witness_size);

        let header = MessageHeader { attestation, witness };

        if !self.attester.verify(msg_id, channel, &buf, &header) {
            error!("attestation verification failed for message {}", msg_id);
            transport.close().await;
            bail!("attestation verification failed");
        }

        // authoritative insert: a copy racing in from another peer loses here
        if !self.inner.lock().await.dedup.observe(msg_id) {
            return Ok(());
        }

        if self.config.enable_relay {
            let excluded = transport.peer_addr().await;
            self.send_message_on_channel_with_id(channel, msg_id, buf.clone(), Some(excluded), header.clone())
                .await;
        }

        if let Some(delegate) = self.delegate() {
            delegate.did_recv_message(buf, header, channel, msg_id).await;
        }
        Ok(())
    }

    //---------------- send path ----------------//

    /// Publish on `channel` with a fresh random message id; returns the id.
    pub async fn send_message_on_channel(&self, channel: u16, payload: Bytes, excluded: Option<SocketAddr>) -> u64 {
        let msg_id = rand::random();
        self.send_message_on_channel_with_id(channel, msg_id, payload, excluded, MessageHeader::default())
            .await;
        msg_id
    }

    /// Publish with an explicit message id, excluding (usually) the peer the message came
    ///  from. Iterates solicited peers first, then unsolicited ones.
    pub async fn send_message_on_channel_with_id(
        &self,
        channel: u16,
        msg_id: u64,
        payload: Bytes,
        excluded: Option<SocketAddr>,
        prev_header: MessageHeader,
    ) {
        let targets: Vec<Arc<FramedTransport>> = {
            let inner = self.inner.lock().await;
            inner
                .sol_conns
                .iter()
                .chain(inner.unsol_conns.iter())
                .filter(|(addr, _)| Some(**addr) != excluded)
                .map(|(_, t)| t.clone())
                .collect()
        };

        for transport in targets {
            self.send_with_cut_through_check(&transport, channel, msg_id, payload.clone(), &prev_header)
                .await;
        }
    }

    async fn send_with_cut_through_check(
        &self,
        transport: &Arc<FramedTransport>,
        channel: u16,
        msg_id: u64,
        payload: Bytes,
        prev_header: &MessageHeader,
    ) {
        trace!("sending message {} on channel {} to {:?}", msg_id, channel, transport.peer_addr().await);
        let message = self.create_message(channel, msg_id, &payload, prev_header);

        if self.config.enable_cut_through && payload.len() as u64 > self.config.cut_through_threshold {
            if let Err(e) = transport.cut_through_send(message).await {
                error!("cut through send failed: {}", e);
                transport.close().await;
            }
        }
        else if transport.send(message).await.is_err() {
            transport.close().await;
        }
    }

    fn create_message(&self, channel: u16, msg_id: u64, payload: &[u8], prev_header: &MessageHeader) -> Bytes {
        let attestation_size = self.attester.attestation_size(msg_id, channel, payload, prev_header);
        let witness_size = self.witnesser.witness_size(prev_header);

        let mut m = BytesMut::with_capacity(11 + attestation_size + witness_size + payload.len());
        m.put_u8(wire::TYPE_MESSAGE);
        m.put_u64(msg_id);
        m.put_u16(channel);
        self.attester.attest(msg_id, channel, payload, prev_header, &mut m);
        self.witnesser.witness(prev_header, &mut m);
        m.put_slice(payload);
        m.freeze()
    }

    //---------------- cut-through relay ----------------//

    /// Header phase of an inbound cut-through stream: dedup, fan-out setup with witness
    ///  loop suppression, then the rewritten header enters the body phase.
    async fn ct_recv_header(&self, transport: &Arc<FramedTransport>, id: u16, bytes: Bytes) -> anyhow::Result<()> {
        let addr = transport.peer_addr().await;

        if bytes.len() < WITNESS_OFFSET {
            transport.close().await;
            bail!("not enough cut-through header: {}", bytes.len());
        }
        let witness_len =
            u16::from_be_bytes([bytes[WITNESS_LEN_OFFSET], bytes[WITNESS_LEN_OFFSET + 1]]) as usize;
        if bytes.len() < WITNESS_OFFSET + witness_len {
            transport.close().await;
            bail!("not enough cut-through header: {} of {}", bytes.len(), WITNESS_OFFSET + witness_len);
        }

        let msg_id = u64::from_be_bytes(bytes[1..9].try_into().unwrap());
        info!("cut-through message {} from {:?} on stream {}", msg_id, addr, id);

        let witness_keys = bytes.slice(WITNESS_OFFSET..WITNESS_OFFSET + witness_len);

        let (duplicate, total_length, candidates) = {
            let mut inner = self.inner.lock().await;

            let Some(session) = inner.cut_through.get_mut(&(addr, id)) else {
                bail!("cut-through bytes without session");
            };
            session.header_recv = true;
            let total_length = session.length;

            if !inner.dedup.observe(msg_id) {
                (true, total_length, Vec::new())
            }
            else {
                let candidates: Vec<Arc<FramedTransport>> = inner
                    .sol_conns
                    .iter()
                    .chain(inner.unsol_conns.iter())
                    .filter(|(_, p)| !Arc::ptr_eq(p, transport))
                    .filter(|(_, p)| match p.remote_static_pk() {
                        // a peer already on the witness list has seen the message
                        Some(pk) => !witness_contains(&witness_keys, &pk),
                        None => true,
                    })
                    .map(|(_, p)| p.clone())
                    .collect();
                (false, total_length, candidates)
            }
        };

        if duplicate {
            debug!("duplicate cut-through message {} - skipping stream", msg_id);
            transport.cut_through_recv_skip(id).await;
            self.inner.lock().await.cut_through.remove(&(addr, id));
            return Ok(());
        }

        let mut legs = Vec::new();
        for peer in candidates {
            match peer.cut_through_send_start(total_length + WITNESS_KEY_LEN as u64).await {
                Ok(sub_id) => legs.push((peer, sub_id)),
                Err(e) => error!("cannot open cut-through leg: {}", e),
            }
        }

        {
            let mut inner = self.inner.lock().await;
            if let Some(session) = inner.cut_through.get_mut(&(addr, id)) {
                session.legs = legs;
            }
        }

        // prepend our key to the witness list and re-enter through the body phase
        let mut new_header = BytesMut::with_capacity(WITNESS_OFFSET + witness_len + WITNESS_KEY_LEN);
        new_header.extend_from_slice(&bytes[..WITNESS_OFFSET + witness_len]);
        new_header[WITNESS_LEN_OFFSET..WITNESS_OFFSET]
            .copy_from_slice(&((witness_len + WITNESS_KEY_LEN) as u16).to_be_bytes());
        new_header.extend_from_slice(PublicKey::from(&self.secret).as_bytes());

        let rest = bytes.slice(WITNESS_OFFSET + witness_len..);

        self.ct_forward_body(transport, id, new_header.freeze()).await?;
        if !rest.is_empty() {
            self.ct_forward_body(transport, id, rest).await?;
        }
        Ok(())
    }

    /// Body phase: duplicate the fragment to every fan-out leg; a failing leg closes that
    ///  peer and drops out of the fan-out list.
    async fn ct_forward_body(&self, transport: &Arc<FramedTransport>, id: u16, bytes: Bytes) -> anyhow::Result<()> {
        let addr = transport.peer_addr().await;

        let legs = {
            let inner = self.inner.lock().await;
            inner.cut_through.get(&(addr, id)).map(|s| s.legs.clone()).unwrap_or_default()
        };

        let mut failed: Vec<(Arc<FramedTransport>, u16)> = Vec::new();
        for (peer, sub_id) in legs {
            // every leg gets its own copy
            let copy = Bytes::copy_from_slice(&bytes);
            if let Err(e) = peer.cut_through_send_bytes(sub_id, copy).await {
                error!("cut through send failed: {}", e);
                peer.close().await;
                failed.push((peer, sub_id));
            }
        }

        if !failed.is_empty() {
            let mut inner = self.inner.lock().await;
            if let Some(session) = inner.cut_through.get_mut(&(addr, id)) {
                session
                    .legs
                    .retain(|(p, sid)| !failed.iter().any(|(fp, fid)| Arc::ptr_eq(p, fp) && sid == fid));
            }
        }
        Ok(())
    }

    //---------------- timers ----------------//

    fn spawn_timers(self: &Arc<PubSubNode>) {
        let mut tasks = self.timer_tasks.lock().unwrap();

        let weak = self.weak_self.clone();
        let interval = self.config.dedup_tick_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                let Some(node) = weak.upgrade() else { return };
                node.dedup_tick().await;
            }
        }));

        let weak = self.weak_self.clone();
        let interval = self.config.peer_selection_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                let Some(node) = weak.upgrade() else { return };
                node.run_manage_subscriptions().await;
            }
        }));

        let weak = self.weak_self.clone();
        let interval = self.config.blacklist_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                let Some(node) = weak.upgrade() else { return };
                trace!("flushing blacklist");
                node.inner.lock().await.blacklist.clear();
            }
        }));
    }

    async fn dedup_tick(&self) {
        let targets = {
            let mut inner = self.inner.lock().await;
            inner.dedup.tick();

            let mut targets = inner.sol_conns.transports();
            targets.extend(inner.sol_standby_conns.transports());
            targets
        };

        for transport in targets {
            if transport.send(wire::build_heartbeat()).await.is_err() {
                transport.close().await;
            }
        }
    }

    async fn run_manage_subscriptions(&self) {
        let (sol, standby) = {
            let inner = self.inner.lock().await;
            (inner.sol_conns.addrs(), inner.sol_standby_conns.addrs())
        };

        if let Some(delegate) = self.delegate() {
            delegate.manage_subscriptions(self.config.max_sol_conns, sol, standby).await;
        }
    }

    //---------------- introspection ----------------//

    pub async fn sol_conn_addrs(&self) -> Vec<SocketAddr> {
        self.inner.lock().await.sol_conns.addrs()
    }

    pub async fn sol_standby_addrs(&self) -> Vec<SocketAddr> {
        self.inner.lock().await.sol_standby_conns.addrs()
    }

    pub async fn unsol_conn_addrs(&self) -> Vec<SocketAddr> {
        self.inner.lock().await.unsol_conns.addrs()
    }

    pub async fn is_blacklisted(&self, addr: SocketAddr) -> bool {
        self.inner.lock().await.blacklist.contains(&addr)
    }

    pub async fn knows_message(&self, msg_id: u64) -> bool {
        self.inner.lock().await.dedup.contains(msg_id)
    }

    /// Tear down the connection to a peer. Peer-set removal, blacklisting and standby
    ///  promotion all run through the regular close path.
    pub async fn close_peer(&self, addr: SocketAddr) {
        if let Some(transport) = self.factory.get_transport(addr) {
            transport.close().await;
        }
    }
}

impl Drop for PubSubNode {
    fn drop(&mut self) {
        for task in self.timer_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl FramedListenDelegate for PubSubNode {
    async fn should_accept(&self, addr: SocketAddr) -> bool {
        if !self.config.accept_unsol_conn {
            return false;
        }
        match self.delegate() {
            Some(delegate) => delegate.should_accept(addr).await,
            None => true,
        }
    }

    async fn did_create_transport(&self, transport: Arc<FramedTransport>) {
        debug!("did create transport for {:?}", transport.peer_addr().await);
        transport.setup(self.weak_self.clone() as Weak<dyn FramedTransportDelegate>);
    }
}

#[async_trait]
impl FramedTransportDelegate for PubSubNode {
    async fn did_dial(&self, transport: Arc<FramedTransport>) {
        debug!("did dial {:?}", transport.peer_addr().await);
        self.add_sol_conn(transport).await;
    }

    async fn did_recv_message(&self, transport: Arc<FramedTransport>, mut message: Bytes) -> anyhow::Result<()> {
        if message.is_empty() {
            return Ok(());
        }

        let message_type = message[0];
        message.advance(1);

        match message_type {
            wire::TYPE_SUBSCRIBE => self.did_recv_subscribe(transport, message).await,
            wire::TYPE_UNSUBSCRIBE => self.did_recv_unsubscribe(transport, message).await,
            wire::TYPE_RESPONSE => self.did_recv_response(message).await,
            wire::TYPE_MESSAGE => self.did_recv_message_payload(transport, message).await,
            wire::TYPE_HEARTBEAT => Ok(()),
            unknown => {
                trace!("unknown message type {} - ignoring", unknown);
                Ok(())
            }
        }
    }

    async fn did_send_message(&self, _transport: Arc<FramedTransport>) {}

    async fn did_close(&self, transport: Arc<FramedTransport>) {
        let addr = transport.peer_addr().await;
        debug!("transport to {:?} closed", addr);

        let flush_legs = {
            let mut inner = self.inner.lock().await;

            let was_sol = inner.sol_conns.remove_transport(&transport);
            let was_standby = inner.sol_standby_conns.remove_transport(&transport);
            if was_sol || was_standby {
                inner.blacklist.insert(addr);
            }
            inner.unsol_conns.remove_transport(&transport);

            // flush downstream legs of sessions sourced at this peer, then drop the sessions
            let sourced: Vec<(SocketAddr, u16)> = inner
                .cut_through
                .keys()
                .filter(|(session_addr, _)| *session_addr == addr)
                .cloned()
                .collect();
            let mut flush_legs = Vec::new();
            for key in sourced {
                if let Some(session) = inner.cut_through.remove(&key) {
                    flush_legs.extend(session.legs);
                }
            }

            // and remove legs pointing at this peer from every other session
            for session in inner.cut_through.values_mut() {
                session.legs.retain(|(p, _)| !Arc::ptr_eq(p, &transport));
            }

            flush_legs
        };

        for (peer, sub_id) in flush_legs {
            peer.cut_through_send_flush(sub_id).await;
        }

        self.run_manage_subscriptions().await;
    }

    async fn cut_through_recv_start(&self, transport: Arc<FramedTransport>, id: u16, length: u64) {
        let addr = transport.peer_addr().await;
        info!("cut-through start from {:?}: stream {}, {} bytes", addr, id, length);

        self.inner.lock().await.cut_through.insert(
            (addr, id),
            CutThroughSession {
                length,
                header_recv: false,
                legs: Vec::new(),
            },
        );
    }

    async fn cut_through_recv_bytes(&self, transport: Arc<FramedTransport>, id: u16, bytes: Bytes) -> anyhow::Result<()> {
        let addr = transport.peer_addr().await;

        let header_recv = {
            let inner = self.inner.lock().await;
            match inner.cut_through.get(&(addr, id)) {
                Some(session) => session.header_recv,
                None => bail!("cut-through bytes without session"),
            }
        };

        if header_recv {
            self.ct_forward_body(&transport, id, bytes).await
        }
        else {
            self.ct_recv_header(&transport, id, bytes).await
        }
    }

    async fn cut_through_recv_end(&self, transport: Arc<FramedTransport>, id: u16) {
        let addr = transport.peer_addr().await;
        info!("cut-through end from {:?}: stream {}", addr, id);

        let legs = {
            let mut inner = self.inner.lock().await;
            inner.cut_through.remove(&(addr, id)).map(|s| s.legs).unwrap_or_default()
        };

        for (peer, sub_id) in legs {
            if let Err(e) = peer.cut_through_send_end(sub_id).await {
                warn!("closing cut-through leg failed: {}", e);
                peer.close().await;
            }
        }
    }

    async fn cut_through_recv_flush(&self, transport: Arc<FramedTransport>, id: u16) {
        let addr = transport.peer_addr().await;

        let legs = {
            let inner = self.inner.lock().await;
            inner.cut_through.get(&(addr, id)).map(|s| s.legs.clone()).unwrap_or_default()
        };

        for (peer, sub_id) in legs {
            peer.cut_through_send_flush(sub_id).await;
        }
    }

    async fn cut_through_recv_skip(&self, transport: Arc<FramedTransport>, id: u16) {
        debug!("cut-through skip for stream {}", id);

        let mut inner = self.inner.lock().await;
        for session in inner.cut_through.values_mut() {
            session.legs.retain(|(p, sid)| !(Arc::ptr_eq(p, &transport) && *sid == id));
        }
    }
}
