use anyhow::bail;
use std::time::Duration;

#[derive(Clone)]
pub struct StreamConfig {
    /// Maximum payload bytes per packet, headers excluded. The transport enforces
    ///  non-fragmentation at the IP level, so this (plus the 30-byte header and the cipher
    ///  overhead) must fit the smallest MTU on all routes between nodes. There is deliberately
    ///  no MTU discovery - optional IP headers and surprising network hardware make discovery
    ///  unreliable, so the application carries the responsibility instead.
    pub max_payload_len: usize,

    /// Granularity of the per-transport maintenance tick that drives retransmission,
    ///  handshake backoff and the idle timeout.
    pub tick_interval: Duration,

    pub initial_rto: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,

    /// Handshake packets (DIAL / DIAL_CONF) are retransmitted with exponential backoff;
    ///  the connection is torn down after this many unanswered sends.
    pub max_handshake_retries: u32,
    /// Backoff for handshake retransmission is capped at this duration.
    pub max_handshake_backoff: Duration,

    /// A data packet that had to be retransmitted this many times resets the connection.
    pub max_packet_retransmits: u32,

    /// Maximum number of *packets* (not bytes) in flight, i.e. the upper bound for the
    ///  congestion window.
    pub send_window: u32,

    /// Receive-side cap on buffered out-of-order bytes per stream; a sender overrunning this
    ///  is a protocol violation and resets the connection.
    pub max_recv_buffer: usize,

    /// A connection that has not received anything for this long is closed.
    pub idle_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> StreamConfig {
        StreamConfig {
            max_payload_len: 1400,
            tick_interval: Duration::from_millis(25),
            initial_rto: Duration::from_millis(200),
            min_rto: Duration::from_millis(50),
            max_rto: Duration::from_secs(10),
            max_handshake_retries: 8,
            max_handshake_backoff: Duration::from_secs(60),
            max_packet_retransmits: 10,
            send_window: 1024,
            max_recv_buffer: 16 * 1024 * 1024,
            idle_timeout: Duration::from_secs(120),
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_payload_len < 100 {
            bail!("max payload length is too small");
        }
        if self.max_payload_len > u16::MAX as usize {
            bail!("max payload length does not fit the 16-bit length field");
        }
        if self.send_window < 2 {
            bail!("send window must allow at least two packets in flight");
        }
        if self.min_rto > self.max_rto {
            bail!("min RTO exceeds max RTO");
        }
        Ok(())
    }
}
