use anyhow::bail;
use framing::FramingConfig;
use std::net::SocketAddr;
use std::time::Duration;
use stream::StreamConfig;

pub struct PubSubConfig {
    pub listen_addr: SocketAddr,

    /// Upper bound for peers we dialed and expect data from.
    pub max_sol_conns: usize,
    /// Upper bound for peers that dialed us.
    pub max_unsol_conns: usize,

    /// Re-emit every first-seen message to all other peers.
    pub enable_relay: bool,
    /// Accept inbound connections at all.
    pub accept_unsol_conn: bool,

    /// Relay messages above this many bytes through the cut-through path instead of
    ///  store-and-forward.
    pub enable_cut_through: bool,
    pub cut_through_threshold: u64,

    /// Advances the dedup ring and heartbeats sol + standby peers.
    pub dedup_tick_interval: Duration,
    /// Lets the application re-balance the peer sets.
    pub peer_selection_interval: Duration,
    /// Clears the blacklist wholesale.
    pub blacklist_interval: Duration,

    pub stream: StreamConfig,
}

impl Default for PubSubConfig {
    fn default() -> PubSubConfig {
        PubSubConfig {
            listen_addr: "0.0.0.0:0".parse().unwrap(),
            max_sol_conns: 2,
            max_unsol_conns: 16,
            enable_relay: false,
            accept_unsol_conn: false,
            enable_cut_through: false,
            cut_through_threshold: 50_000,
            dedup_tick_interval: Duration::from_secs(10),
            peer_selection_interval: Duration::from_secs(60),
            blacklist_interval: Duration::from_secs(600),
            stream: StreamConfig::default(),
        }
    }
}

impl PubSubConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_sol_conns == 0 {
            bail!("at least one solicited connection is required");
        }
        if self.dedup_tick_interval.is_zero() {
            bail!("dedup tick interval must be non-zero");
        }
        self.stream.validate()
    }

    pub(crate) fn framing(&self) -> FramingConfig {
        FramingConfig {
            enable_cut_through: self.enable_cut_through,
            cut_through_threshold: self.cut_through_threshold,
            stream: self.stream.clone(),
            ..FramingConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(PubSubConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_sol_capacity() {
        let config = PubSubConfig {
            max_sol_conns: 0,
            ..PubSubConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_framing_config_carries_cut_through() {
        let config = PubSubConfig {
            enable_cut_through: true,
            cut_through_threshold: 1234,
            ..PubSubConfig::default()
        };

        let framing = config.framing();
        assert!(framing.enable_cut_through);
        assert_eq!(framing.cut_through_threshold, 1234);
    }
}
