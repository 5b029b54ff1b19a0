use crate::config::StreamConfig;
use crate::congestion::CongestionControl;
use crate::packet::{AckBlock, PacketHeader, PacketKind};
use crate::recv_stream::RecvStream;
use crate::rtt::RttEstimator;
use crate::send_stream::SendStream;
use anyhow::bail;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Newest received packet-number ranges included in each ACK; older ranges have been acked
///  repeatedly already.
const MAX_ACK_BLOCKS: usize = 8;
/// Received ranges tracked before the oldest is dropped.
const MAX_TRACKED_BLOCKS: usize = 32;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ConnState {
    Listen,
    DialSent,
    DialRcvd,
    Established,
    Closing,
    Closed,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum CloseReason {
    /// `close()` was called locally
    Local,
    /// the peer sent RESET
    Reset,
    IdleTimeout,
    HandshakeTimeout,
    TooManyRetransmits,
    ProtocolViolation,
}

#[derive(Debug)]
pub enum ConnectionEvent {
    /// the connection we dialed reached ESTABLISHED
    DialEstablished,
    /// a connection dialed by the peer reached ESTABLISHED
    PeerEstablished,
    RecvBytes { stream_id: u16, bytes: Bytes },
    StreamEnd { stream_id: u16 },
    Closed { reason: CloseReason },
}

/// A packet ready for the send pipeline. `header.payload_len` holds the plaintext length;
///  the pipeline fixes it up for cipher overhead before serializing.
pub struct OutboundPacket {
    pub header: PacketHeader,
    pub payload: Bytes,
}

#[derive(Default)]
pub struct Outcome {
    pub packets: Vec<OutboundPacket>,
    pub events: Vec<ConnectionEvent>,
}

impl Outcome {
    fn packet(header: PacketHeader, payload: Bytes) -> Outcome {
        Outcome {
            packets: vec![OutboundPacket { header, payload }],
            events: Vec::new(),
        }
    }

    fn merge(&mut self, other: Outcome) {
        self.packets.extend(other.packets);
        self.events.extend(other.events);
    }
}

struct InFlight {
    stream_id: u16,
    offset: u64,
    fin: bool,
    payload: Bytes,
    sent_at: Instant,
    retransmitted: bool,
    retries: u32,
}

/// The per-connection protocol state machine. All I/O is pushed to the edges: inputs are
///  parsed packets and the current time, outputs are [Outcome]s holding packets to transmit
///  and events to hand upward. This keeps the hard parts testable without sockets or mocks.
pub struct Connection {
    config: Arc<StreamConfig>,
    state: ConnState,
    local_conn_id: u32,
    remote_conn_id: u32,
    /// usable payload bytes per packet, cipher overhead already subtracted
    max_payload: usize,

    next_packet_number: u64,
    in_flight: BTreeMap<u64, InFlight>,
    rtt: RttEstimator,
    congestion: CongestionControl,

    send_streams: FxHashMap<u16, SendStream>,
    next_stream_id: u16,

    recv_streams: FxHashMap<u16, RecvStream>,
    /// streams that were fully dispatched or skipped; late retransmissions are acked and dropped
    done_recv_streams: FxHashSet<u16>,
    received: Vec<AckBlock>,

    handshake_backoff: Duration,
    handshake_next_at: Instant,
    handshake_retries: u32,
    /// carried in every DIAL: the dialer's static public key when the connection is to be
    ///  encrypted, empty otherwise
    dial_payload: Bytes,

    last_recv_at: Instant,
}

impl Connection {
    fn new(config: Arc<StreamConfig>, max_payload: usize, now: Instant) -> Connection {
        let rtt = RttEstimator::new(config.initial_rto, config.min_rto, config.max_rto);
        let congestion = CongestionControl::new(config.send_window);
        let initial_backoff = config.initial_rto;

        Connection {
            config,
            state: ConnState::Listen,
            local_conn_id: rand::random(),
            remote_conn_id: 0,
            max_payload,
            next_packet_number: 0,
            in_flight: BTreeMap::new(),
            rtt,
            congestion,
            send_streams: FxHashMap::default(),
            next_stream_id: 0,
            recv_streams: FxHashMap::default(),
            done_recv_streams: FxHashSet::default(),
            received: Vec::new(),
            handshake_backoff: initial_backoff,
            handshake_next_at: now,
            handshake_retries: 0,
            dial_payload: Bytes::new(),
            last_recv_at: now,
        }
    }

    /// Active open: transitions straight to DIAL_SENT and emits the DIAL packet.
    pub fn new_dialer(config: Arc<StreamConfig>, max_payload: usize, dial_payload: Bytes, now: Instant) -> (Connection, Outcome) {
        let mut conn = Connection::new(config, max_payload, now);
        conn.state = ConnState::DialSent;
        conn.dial_payload = dial_payload;

        debug!("dialing with connection id {:x}", conn.local_conn_id);
        let outcome = conn.dial_packet();
        conn.arm_handshake_timer(now);
        (conn, outcome)
    }

    fn dial_packet(&mut self) -> Outcome {
        let mut header = self.handshake_header(PacketKind::Dial);
        header.payload_len = self.dial_payload.len() as u16;
        Outcome::packet(header, self.dial_payload.clone())
    }

    /// Passive open on receipt of DIAL: transitions to DIAL_RCVD and replies DIAL_CONF.
    pub fn new_listener(config: Arc<StreamConfig>, max_payload: usize, remote_conn_id: u32, now: Instant) -> (Connection, Outcome) {
        let mut conn = Connection::new(config, max_payload, now);
        conn.state = ConnState::DialRcvd;
        conn.remote_conn_id = remote_conn_id;

        debug!("accepting dial {:x} with connection id {:x}", remote_conn_id, conn.local_conn_id);
        let outcome = Outcome::packet(conn.handshake_header(PacketKind::DialConf), Bytes::new());
        conn.arm_handshake_timer(now);
        (conn, outcome)
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn local_conn_id(&self) -> u32 {
        self.local_conn_id
    }

    pub fn is_active(&self) -> bool {
        self.state == ConnState::Established
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    fn handshake_header(&mut self, kind: PacketKind) -> PacketHeader {
        let pn = self.next_packet_number;
        self.next_packet_number += 1;
        PacketHeader::new(kind, self.local_conn_id, self.remote_conn_id, pn)
    }

    fn arm_handshake_timer(&mut self, now: Instant) {
        self.handshake_next_at = now + self.handshake_backoff;
        self.handshake_backoff = (self.handshake_backoff * 2).min(self.config.max_handshake_backoff);
    }

    //---------------- receiving ----------------//

    pub fn on_packet(&mut self, header: &PacketHeader, payload: Bytes, now: Instant) -> anyhow::Result<Outcome> {
        if self.state == ConnState::Closed {
            return Ok(Outcome::default());
        }

        trace!("received {:?}", header);
        self.last_recv_at = now;

        match header.kind {
            PacketKind::Dial => Ok(self.on_dial(header)),
            PacketKind::DialConf => Ok(self.on_dial_conf(header)),
            PacketKind::Conf => Ok(self.on_conf()),
            PacketKind::Reset => {
                debug!("received RESET from peer {:x}", header.src_conn_id);
                self.state = ConnState::Closed;
                Ok(Outcome {
                    packets: Vec::new(),
                    events: vec![ConnectionEvent::Closed { reason: CloseReason::Reset }],
                })
            }
            PacketKind::Data { stream_id, fin } => self.on_data(header, stream_id, fin, payload, now),
            PacketKind::Ack { num_blocks } => self.on_ack(num_blocks, payload, now),
        }
    }

    fn on_dial(&mut self, header: &PacketHeader) -> Outcome {
        match self.state {
            // retransmitted DIAL, our DIAL_CONF was lost
            ConnState::DialRcvd if header.src_conn_id == self.remote_conn_id => {
                Outcome::packet(self.handshake_header(PacketKind::DialConf), Bytes::new())
            }
            _ => {
                debug!("unexpected DIAL in state {:?} - ignoring", self.state);
                Outcome::default()
            }
        }
    }

    fn on_dial_conf(&mut self, header: &PacketHeader) -> Outcome {
        match self.state {
            ConnState::DialSent => {
                if header.dst_conn_id != self.local_conn_id {
                    debug!("DIAL_CONF for foreign connection id {:x} - ignoring", header.dst_conn_id);
                    return Outcome::default();
                }

                self.remote_conn_id = header.src_conn_id;
                self.state = ConnState::Established;
                debug!("connection {:x}<->{:x} established (dialer)", self.local_conn_id, self.remote_conn_id);

                let mut outcome = Outcome::packet(self.handshake_header(PacketKind::Conf), Bytes::new());
                outcome.events.push(ConnectionEvent::DialEstablished);
                outcome
            }
            // retransmitted DIAL_CONF, our CONF was lost
            ConnState::Established if header.src_conn_id == self.remote_conn_id => {
                Outcome::packet(self.handshake_header(PacketKind::Conf), Bytes::new())
            }
            _ => {
                debug!("unexpected DIAL_CONF in state {:?} - ignoring", self.state);
                Outcome::default()
            }
        }
    }

    fn on_conf(&mut self) -> Outcome {
        match self.state {
            ConnState::DialRcvd => self.promote_listener(),
            _ => Outcome::default(),
        }
    }

    fn promote_listener(&mut self) -> Outcome {
        self.state = ConnState::Established;
        debug!("connection {:x}<->{:x} established (listener)", self.local_conn_id, self.remote_conn_id);
        Outcome {
            packets: Vec::new(),
            events: vec![ConnectionEvent::PeerEstablished],
        }
    }

    fn on_data(&mut self, header: &PacketHeader, stream_id: u16, fin: bool, payload: Bytes, _now: Instant) -> anyhow::Result<Outcome> {
        let mut outcome = Outcome::default();

        // data from the peer implies our CONF (or their DIAL_CONF's CONF) got through
        if self.state == ConnState::DialRcvd {
            outcome.merge(self.promote_listener());
        }
        if self.state != ConnState::Established {
            debug!("DATA in state {:?} - ignoring", self.state);
            return Ok(outcome);
        }

        if payload.len() != header.payload_len as usize {
            bail!("payload length mismatch: header says {}, got {}", header.payload_len, payload.len());
        }

        self.record_received(header.packet_number);

        if !self.done_recv_streams.contains(&stream_id) {
            let max_recv_buffer = self.config.max_recv_buffer;
            let stream = self
                .recv_streams
                .entry(stream_id)
                .or_insert_with(|| RecvStream::new(stream_id, max_recv_buffer));

            let dispatchable = stream.on_data(header.offset, payload, fin)?;
            let finished = stream.is_finished();

            for bytes in dispatchable {
                outcome.events.push(ConnectionEvent::RecvBytes { stream_id, bytes });
            }
            if finished {
                self.recv_streams.remove(&stream_id);
                self.done_recv_streams.insert(stream_id);
                outcome.events.push(ConnectionEvent::StreamEnd { stream_id });
            }
        }

        outcome.merge(self.make_ack());
        Ok(outcome)
    }

    fn record_received(&mut self, pn: u64) {
        if self.received.iter().any(|b| b.contains(pn)) {
            return;
        }

        if let Some(block) = self.received.iter_mut().find(|b| b.first == pn + 1) {
            block.first = pn;
        }
        else if let Some(block) = self.received.iter_mut().find(|b| b.last + 1 == pn) {
            block.last = pn;
        }
        else {
            self.received.push(AckBlock { first: pn, last: pn });
        }

        self.received.sort_by_key(|b| b.first);

        // merge blocks that now touch
        let mut merged: Vec<AckBlock> = Vec::with_capacity(self.received.len());
        for block in self.received.drain(..) {
            match merged.last_mut() {
                Some(prev) if prev.last + 1 >= block.first => prev.last = prev.last.max(block.last),
                _ => merged.push(block),
            }
        }
        self.received = merged;

        if self.received.len() > MAX_TRACKED_BLOCKS {
            self.received.remove(0);
        }
    }

    fn make_ack(&mut self) -> Outcome {
        let blocks: Vec<AckBlock> = self
            .received
            .iter()
            .rev()
            .take(MAX_ACK_BLOCKS)
            .cloned()
            .collect();

        let mut payload = bytes::BytesMut::with_capacity(blocks.len() * AckBlock::SERIALIZED_LEN);
        for block in &blocks {
            block.ser(&mut payload);
        }

        let pn = self.next_packet_number;
        self.next_packet_number += 1;

        let mut header = PacketHeader::new(
            PacketKind::Ack { num_blocks: blocks.len() as u16 },
            self.local_conn_id,
            self.remote_conn_id,
            pn,
        );
        header.payload_len = payload.len() as u16;

        Outcome::packet(header, payload.freeze())
    }

    fn on_ack(&mut self, num_blocks: u16, payload: Bytes, now: Instant) -> anyhow::Result<Outcome> {
        let mut outcome = Outcome::default();

        // an ACK is as good as a CONF
        if self.state == ConnState::DialRcvd {
            outcome.merge(self.promote_listener());
        }

        if payload.len() < num_blocks as usize * AckBlock::SERIALIZED_LEN {
            bail!("truncated ACK payload: {} blocks in {} bytes", num_blocks, payload.len());
        }

        let mut buf: &[u8] = payload.as_ref();
        let mut blocks = Vec::with_capacity(num_blocks as usize);
        for _ in 0..num_blocks {
            blocks.push(AckBlock::deser(&mut buf)?);
        }

        let acked: Vec<u64> = self
            .in_flight
            .keys()
            .filter(|&&pn| blocks.iter().any(|b| b.contains(pn)))
            .cloned()
            .collect();

        if acked.is_empty() {
            return Ok(outcome);
        }

        let mut rtt_sample = None;
        for pn in acked {
            if let Some(entry) = self.in_flight.remove(&pn) {
                if !entry.retransmitted {
                    rtt_sample = Some(now.saturating_duration_since(entry.sent_at));
                }
            }
        }

        if let Some(sample) = rtt_sample {
            self.rtt.on_sample(sample);
        }
        self.congestion.on_ack(self.in_flight.len() as u32);

        trace!("after ACK: {} packets in flight, rto {:?}", self.in_flight.len(), self.rtt.rto());
        Ok(outcome)
    }

    //---------------- sending ----------------//

    fn alloc_stream_id(&mut self) -> anyhow::Result<u16> {
        if self.send_streams.len() >= u16::MAX as usize {
            bail!("no free stream ids");
        }

        loop {
            self.next_stream_id = self.next_stream_id.wrapping_add(1);
            // 0 stays reserved as the 'no stream' marker
            if self.next_stream_id != 0 && !self.send_streams.contains_key(&self.next_stream_id) {
                return Ok(self.next_stream_id);
            }
        }
    }

    /// Send a complete message on a fresh stream; the last fragment carries FIN.
    pub fn send_message(&mut self, data: Bytes, now: Instant) -> anyhow::Result<(u16, Outcome)> {
        let stream_id = self.alloc_stream_id()?;
        let outcome = self.send_fragments(stream_id, 0, data, true, now)?;
        Ok((stream_id, outcome))
    }

    /// Open a stream for incremental writes (the cut-through send path).
    pub fn open_stream(&mut self) -> anyhow::Result<u16> {
        if self.state != ConnState::Established {
            bail!("connection not established");
        }
        let stream_id = self.alloc_stream_id()?;
        self.send_streams.insert(stream_id, SendStream::new(stream_id));
        Ok(stream_id)
    }

    /// Append bytes to an open stream; `fin` finalizes it. Fails on backpressure (send window
    ///  exhausted), which the caller must treat as fatal for the stream.
    pub fn send_on_stream(&mut self, stream_id: u16, data: Bytes, fin: bool, now: Instant) -> anyhow::Result<Outcome> {
        let offset = match self.send_streams.get_mut(&stream_id) {
            None => bail!("stream {} is not open", stream_id),
            Some(stream) if stream.is_finalized() => bail!("stream {} is finalized", stream_id),
            Some(stream) => stream.advance(data.len() as u64),
        };

        let outcome = self.send_fragments(stream_id, offset, data, fin, now)?;

        if fin {
            self.send_streams.remove(&stream_id);
        }
        Ok(outcome)
    }

    /// Abandon an open stream: pending fragments are dropped from the retransmit queue and the
    ///  stream is never finalized on the wire.
    pub fn abandon_send_stream(&mut self, stream_id: u16) {
        self.send_streams.remove(&stream_id);
        self.in_flight.retain(|_, entry| entry.stream_id != stream_id);
    }

    /// Stop delivering an inbound stream; whatever else arrives for it is acked and dropped.
    pub fn skip_recv_stream(&mut self, stream_id: u16) {
        self.recv_streams.remove(&stream_id);
        self.done_recv_streams.insert(stream_id);
    }

    fn send_fragments(&mut self, stream_id: u16, start_offset: u64, mut data: Bytes, fin: bool, now: Instant) -> anyhow::Result<Outcome> {
        if self.state != ConnState::Established {
            bail!("connection not established");
        }

        let num_fragments = data.len().div_ceil(self.max_payload).max(1);
        if self.in_flight.len() + num_fragments > self.config.send_window as usize {
            bail!(
                "send window exhausted: {} in flight, {} more needed",
                self.in_flight.len(),
                num_fragments
            );
        }

        let mut outcome = Outcome::default();
        let mut offset = start_offset;
        loop {
            let fragment = data.split_to(data.len().min(self.max_payload));
            let is_last = data.is_empty();

            let pn = self.next_packet_number;
            self.next_packet_number += 1;

            let mut header = PacketHeader::new(
                PacketKind::Data { stream_id, fin: fin && is_last },
                self.local_conn_id,
                self.remote_conn_id,
                pn,
            );
            header.offset = offset;
            header.payload_len = fragment.len() as u16;

            self.in_flight.insert(pn, InFlight {
                stream_id,
                offset,
                fin: fin && is_last,
                payload: fragment.clone(),
                sent_at: now,
                retransmitted: false,
                retries: 0,
            });

            offset += fragment.len() as u64;
            outcome.packets.push(OutboundPacket { header, payload: fragment });

            if is_last {
                break;
            }
        }

        Ok(outcome)
    }

    //---------------- timers ----------------//

    pub fn on_tick(&mut self, now: Instant) -> Outcome {
        match self.state {
            ConnState::Closed => Outcome::default(),
            ConnState::DialSent | ConnState::DialRcvd => self.handshake_tick(now),
            _ => self.established_tick(now),
        }
    }

    fn handshake_tick(&mut self, now: Instant) -> Outcome {
        if now < self.handshake_next_at {
            return Outcome::default();
        }

        self.handshake_retries += 1;
        if self.handshake_retries > self.config.max_handshake_retries {
            warn!("handshake with {:x} timed out after {} attempts", self.remote_conn_id, self.handshake_retries);
            return self.close(CloseReason::HandshakeTimeout);
        }

        trace!("retransmitting handshake (attempt {})", self.handshake_retries);
        let outcome = match self.state {
            ConnState::DialSent => self.dial_packet(),
            _ => Outcome::packet(self.handshake_header(PacketKind::DialConf), Bytes::new()),
        };
        self.arm_handshake_timer(now);
        outcome
    }

    fn established_tick(&mut self, now: Instant) -> Outcome {
        if now.saturating_duration_since(self.last_recv_at) > self.config.idle_timeout {
            debug!("connection {:x} idle - closing", self.local_conn_id);
            return self.close(CloseReason::IdleTimeout);
        }

        let rto = self.rtt.rto();
        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.sent_at) >= rto)
            .map(|(&pn, _)| pn)
            .take(self.congestion.cwnd() as usize)
            .collect();

        if expired.is_empty() {
            return Outcome::default();
        }

        let mut outcome = Outcome::default();
        for pn in expired {
            let entry = self.in_flight.remove(&pn).unwrap();

            if entry.retries >= self.config.max_packet_retransmits {
                warn!("packet #{} exceeded {} retransmits - resetting connection", pn, entry.retries);
                outcome.merge(self.close(CloseReason::TooManyRetransmits));
                return outcome;
            }

            let new_pn = self.next_packet_number;
            self.next_packet_number += 1;

            // the original (stream_id, offset) is preserved so the receiver dedupes by offset
            let mut header = PacketHeader::new(
                PacketKind::Data { stream_id: entry.stream_id, fin: entry.fin },
                self.local_conn_id,
                self.remote_conn_id,
                new_pn,
            );
            header.offset = entry.offset;
            header.payload_len = entry.payload.len() as u16;

            trace!("retransmitting #{} as #{} (stream {} offset {})", pn, new_pn, entry.stream_id, entry.offset);
            outcome.packets.push(OutboundPacket { header, payload: entry.payload.clone() });

            self.in_flight.insert(new_pn, InFlight {
                sent_at: now,
                retransmitted: true,
                retries: entry.retries + 1,
                ..entry
            });
        }

        self.congestion.on_loss();
        outcome
    }

    //---------------- closing ----------------//

    /// Close the connection: sends RESET and emits the Closed event. Idempotent - a second
    ///  call produces nothing, so `did_close` can fire exactly once.
    pub fn close(&mut self, reason: CloseReason) -> Outcome {
        if self.state == ConnState::Closed {
            return Outcome::default();
        }

        debug!("closing connection {:x}: {:?}", self.local_conn_id, reason);
        self.state = ConnState::Closing;

        let header = self.handshake_header(PacketKind::Reset);
        self.state = ConnState::Closed;
        self.in_flight.clear();
        self.send_streams.clear();
        self.recv_streams.clear();

        Outcome {
            packets: vec![OutboundPacket { header, payload: Bytes::new() }],
            events: vec![ConnectionEvent::Closed { reason }],
        }
    }

    #[cfg(test)]
    fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }
}
