use anyhow::bail;
use bytes::{Buf, BufMut};
use std::fmt::Debug;

pub const PROTOCOL_VERSION: u8 = 0;
pub const HEADER_LEN: usize = 30;

const TYPE_DATA: u8 = 0;
const TYPE_DATA_FIN: u8 = 1;
const TYPE_ACK: u8 = 2;
const TYPE_DIAL: u8 = 3;
const TYPE_DIAL_CONF: u8 = 4;
const TYPE_CONF: u8 = 5;
const TYPE_RESET: u8 = 6;

#[derive(Clone, Copy, Eq, PartialEq)]
pub enum PacketKind {
    Data { stream_id: u16, fin: bool },
    Ack { num_blocks: u16 },
    Dial,
    DialConf,
    Conf,
    Reset,
}
impl Debug for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketKind::Data { stream_id, fin } => {
                write!(f, "DATA({}{})", stream_id, if *fin { "+fin" } else { "" })
            }
            PacketKind::Ack { num_blocks } => write!(f, "ACK({})", num_blocks),
            PacketKind::Dial => write!(f, "DIAL"),
            PacketKind::DialConf => write!(f, "DIAL_CONF"),
            PacketKind::Conf => write!(f, "CONF"),
            PacketKind::Reset => write!(f, "RESET"),
        }
    }
}

/// The fixed 30-byte header preceding every packet on the wire. The `stream_id` slot at
///  offset 10 is reinterpreted as the ack-block count for ACK packets and is zero for
///  handshake packets; both variants live in [PacketKind].
#[derive(Clone, Eq, PartialEq)]
pub struct PacketHeader {
    pub version: u8,
    pub kind: PacketKind,
    pub src_conn_id: u32,
    pub dst_conn_id: u32,
    pub packet_number: u64,
    pub offset: u64,
    pub payload_len: u16,
}
impl Debug for PacketHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PCKT{{V{} {:?} {:x}->{:x} #{}@{}+{}}}",
            self.version,
            self.kind,
            self.src_conn_id,
            self.dst_conn_id,
            self.packet_number,
            self.offset,
            self.payload_len,
        )
    }
}

impl PacketHeader {
    pub fn new(kind: PacketKind, src_conn_id: u32, dst_conn_id: u32, packet_number: u64) -> PacketHeader {
        PacketHeader {
            version: PROTOCOL_VERSION,
            kind,
            src_conn_id,
            dst_conn_id,
            packet_number,
            offset: 0,
            payload_len: 0,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.version);

        let (packet_type, field) = match self.kind {
            PacketKind::Data { stream_id, fin: false } => (TYPE_DATA, stream_id),
            PacketKind::Data { stream_id, fin: true } => (TYPE_DATA_FIN, stream_id),
            PacketKind::Ack { num_blocks } => (TYPE_ACK, num_blocks),
            PacketKind::Dial => (TYPE_DIAL, 0),
            PacketKind::DialConf => (TYPE_DIAL_CONF, 0),
            PacketKind::Conf => (TYPE_CONF, 0),
            PacketKind::Reset => (TYPE_RESET, 0),
        };
        buf.put_u8(packet_type);
        buf.put_u32(self.src_conn_id);
        buf.put_u32(self.dst_conn_id);
        buf.put_u16(field);
        buf.put_u64(self.packet_number);
        buf.put_u64(self.offset);
        buf.put_u16(self.payload_len);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let version = buf.try_get_u8()?;
        if version != PROTOCOL_VERSION {
            bail!("unsupported protocol version {}", version);
        }

        let packet_type = buf.try_get_u8()?;
        let src_conn_id = buf.try_get_u32()?;
        let dst_conn_id = buf.try_get_u32()?;
        let field = buf.try_get_u16()?;
        let packet_number = buf.try_get_u64()?;
        let offset = buf.try_get_u64()?;
        let payload_len = buf.try_get_u16()?;

        let kind = match packet_type {
            TYPE_DATA => PacketKind::Data { stream_id: field, fin: false },
            TYPE_DATA_FIN => PacketKind::Data { stream_id: field, fin: true },
            TYPE_ACK => PacketKind::Ack { num_blocks: field },
            TYPE_DIAL => PacketKind::Dial,
            TYPE_DIAL_CONF => PacketKind::DialConf,
            TYPE_CONF => PacketKind::Conf,
            TYPE_RESET => PacketKind::Reset,
            _ => bail!("unsupported packet type {}", packet_type),
        };

        Ok(PacketHeader {
            version,
            kind,
            src_conn_id,
            dst_conn_id,
            packet_number,
            offset,
            payload_len,
        })
    }
}

/// An inclusive range of received packet numbers, the unit of acknowledgement.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct AckBlock {
    pub first: u64,
    pub last: u64,
}
impl Debug for AckBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}..{}]", self.first, self.last)
    }
}

impl AckBlock {
    pub const SERIALIZED_LEN: usize = 16;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.first);
        buf.put_u64(self.last);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<AckBlock> {
        let first = buf.try_get_u64()?;
        let last = buf.try_get_u64()?;
        if first > last {
            bail!("inverted ack block {}..{}", first, last);
        }
        Ok(AckBlock { first, last })
    }

    pub fn contains(&self, packet_number: u64) -> bool {
        self.first <= packet_number && packet_number <= self.last
    }
}
