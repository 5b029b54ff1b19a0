use anyhow::bail;
use stream::StreamConfig;

pub struct FramingConfig {
    /// Big-endian length prefix in front of every message, 1-8 bytes.
    pub prefix_length: u8,

    /// Frames above this many payload bytes are not assembled; they are handed upward
    ///  fragment by fragment through the cut-through callbacks.
    pub enable_cut_through: bool,
    pub cut_through_threshold: u64,

    /// Upper bound on a single frame; a peer announcing more is violating the protocol.
    pub max_frame_len: u64,

    pub stream: StreamConfig,
}

impl Default for FramingConfig {
    fn default() -> FramingConfig {
        FramingConfig {
            prefix_length: 8,
            enable_cut_through: false,
            cut_through_threshold: 50_000,
            max_frame_len: 64 * 1024 * 1024,
            stream: StreamConfig::default(),
        }
    }
}

impl FramingConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.prefix_length == 0 || self.prefix_length > 8 {
            bail!("prefix length {} is outside 1..=8", self.prefix_length);
        }
        if self.enable_cut_through && self.cut_through_threshold >= self.max_frame_len {
            bail!("cut-through threshold must be below the frame limit");
        }
        self.stream.validate()
    }
}
