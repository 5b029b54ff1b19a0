use crate::splitter::{FrameSink, FrameSplitter};
use anyhow::bail;
use bytes::{Buf, Bytes};
use std::net::SocketAddr;

/// Consumer of a [LengthPrefixFramer]: notified once when a frame's length becomes known,
///  then for every byte range with its in-frame offset, then exactly once on completion.
pub trait FrameHandler {
    fn did_start_frame(&mut self, len: u64, addr: SocketAddr) -> anyhow::Result<()>;

    fn did_recv(&mut self, bytes: Bytes, frame_offset: u64, addr: SocketAddr) -> anyhow::Result<()>;

    fn did_recv_frame(&mut self, addr: SocketAddr) -> anyhow::Result<()>;
}

/// Reads a 1-8 byte big-endian length prefix from the byte stream and feeds the decoded
///  length into a [FrameSplitter] for the payload, looping back to prefix accumulation after
///  each frame. Prefix bytes are never forwarded to the handler.
pub struct LengthPrefixFramer {
    prefix_length: u8,
    prefix_buf: [u8; 8],
    prefix_filled: u8,
    splitter: FrameSplitter,
}

impl LengthPrefixFramer {
    pub fn new(prefix_length: u8) -> anyhow::Result<LengthPrefixFramer> {
        if prefix_length == 0 || prefix_length > 8 {
            bail!("prefix length {} is outside 1..=8", prefix_length);
        }

        Ok(LengthPrefixFramer {
            prefix_length,
            prefix_buf: [0; 8],
            prefix_filled: 0,
            splitter: FrameSplitter::new(),
        })
    }

    /// True between frames: no partial prefix and no partial payload.
    pub fn is_idle(&self) -> bool {
        self.prefix_filled == 0 && !self.splitter.is_armed()
    }

    pub fn did_recv(&mut self, chunk: &mut Bytes, addr: SocketAddr, handler: &mut impl FrameHandler) -> anyhow::Result<()> {
        loop {
            if !self.splitter.is_armed() {
                let missing = (self.prefix_length - self.prefix_filled) as usize;
                let take = missing.min(chunk.len());
                self.prefix_buf[self.prefix_filled as usize..self.prefix_filled as usize + take]
                    .copy_from_slice(&chunk[..take]);
                chunk.advance(take);
                self.prefix_filled += take as u8;

                if self.prefix_filled < self.prefix_length {
                    return Ok(());
                }

                let mut len = 0u64;
                for &b in &self.prefix_buf[..self.prefix_length as usize] {
                    len = (len << 8) | b as u64;
                }
                self.prefix_filled = 0;
                self.splitter.reset(len);

                handler.did_start_frame(len, addr)?;
            }

            let mut sink = HandlerSink { handler };
            self.splitter.did_recv(chunk, addr, &mut sink)?;

            if self.splitter.is_armed() {
                // chunk exhausted mid-frame
                debug_assert!(chunk.is_empty());
                return Ok(());
            }
            if chunk.is_empty() {
                return Ok(());
            }
        }
    }
}

/// Adapts a [FrameHandler] to the splitter's sink: frame completion disarms the splitter so
///  the framer resumes prefix accumulation. This is what keeps the header phase and the body
///  phase two distinct entry points instead of a recursion.
struct HandlerSink<'a, H: FrameHandler> {
    handler: &'a mut H,
}

impl<H: FrameHandler> FrameSink for HandlerSink<'_, H> {
    fn did_recv(&mut self, bytes: Bytes, frame_offset: u64, addr: SocketAddr) -> anyhow::Result<()> {
        self.handler.did_recv(bytes, frame_offset, addr)
    }

    fn did_recv_frame(&mut self, addr: SocketAddr) -> anyhow::Result<Option<u64>> {
        self.handler.did_recv_frame(addr)?;
        Ok(None)
    }
}
