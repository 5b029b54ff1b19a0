use anyhow::bail;
use bytes::Bytes;
use std::net::SocketAddr;

/// Consumer of a [FrameSplitter]. `did_recv` sees every byte range exactly once, paired with
///  its offset inside the current frame; `did_recv_frame` fires exactly once per completed
///  frame and returns the length the splitter should arm itself with for the next frame
///  (`None` leaves it unarmed).
pub trait FrameSink {
    fn did_recv(&mut self, bytes: Bytes, frame_offset: u64, addr: SocketAddr) -> anyhow::Result<()>;

    fn did_recv_frame(&mut self, addr: SocketAddr) -> anyhow::Result<Option<u64>>;
}

/// Splits a logical byte stream into frames of known length. The expected length is armed
///  externally via [reset](FrameSplitter::reset) (or the sink's `did_recv_frame` return
///  value), which is what lets a prefix reader own the length decoding.
///
/// Invariant: per frame, the forwarded byte ranges concatenate to exactly the armed length,
///  and a chunk spanning a frame boundary is split exactly at it.
pub struct FrameSplitter {
    expected: Option<u64>,
    received: u64,
}

impl FrameSplitter {
    pub fn new() -> FrameSplitter {
        FrameSplitter {
            expected: None,
            received: 0,
        }
    }

    /// Arm the splitter for the next frame of `len` bytes.
    pub fn reset(&mut self, len: u64) {
        self.expected = Some(len);
        self.received = 0;
    }

    pub fn is_armed(&self) -> bool {
        self.expected.is_some()
    }

    /// Bytes still missing from the current frame.
    pub fn remaining(&self) -> Option<u64> {
        self.expected.map(|e| e - self.received)
    }

    /// Consume `chunk`, forwarding byte ranges and frame completions to `sink`. Consumes as
    ///  many whole frames as the chunk holds; a zero-length frame completes without any
    ///  `did_recv`. Returns with the chunk fully consumed unless the splitter is disarmed.
    pub fn did_recv(&mut self, chunk: &mut Bytes, addr: SocketAddr, sink: &mut impl FrameSink) -> anyhow::Result<()> {
        loop {
            let Some(expected) = self.expected else {
                if chunk.is_empty() {
                    return Ok(());
                }
                bail!("received {} bytes with no armed frame", chunk.len());
            };

            let missing = expected - self.received;
            if missing == 0 {
                self.finish_frame(addr, sink)?;
                continue;
            }

            if chunk.is_empty() {
                return Ok(());
            }

            let take = (chunk.len() as u64).min(missing) as usize;
            let segment = chunk.split_to(take);
            let frame_offset = self.received;
            self.received += take as u64;

            sink.did_recv(segment, frame_offset, addr)?;

            if self.received == expected {
                self.finish_frame(addr, sink)?;
            }
        }
    }

    fn finish_frame(&mut self, addr: SocketAddr, sink: &mut impl FrameSink) -> anyhow::Result<()> {
        match sink.did_recv_frame(addr)? {
            Some(next) => self.reset(next),
            None => self.expected = None,
        }
        Ok(())
    }
}

impl Default for FrameSplitter {
    fn default() -> FrameSplitter {
        FrameSplitter::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "192.168.0.1:8000".parse().unwrap()
    }

    /// records every did_recv segment and completion; arms the next length from a queue
    struct RecordingSink {
        segments: Vec<(Vec<u8>, u64)>,
        frames: usize,
        next_lengths: Vec<u64>,
    }

    impl RecordingSink {
        fn new(next_lengths: Vec<u64>) -> RecordingSink {
            RecordingSink {
                segments: Vec::new(),
                frames: 0,
                next_lengths,
            }
        }
    }

    impl FrameSink for RecordingSink {
        fn did_recv(&mut self, bytes: Bytes, frame_offset: u64, addr: SocketAddr) -> anyhow::Result<()> {
            assert_eq!(addr.to_string(), "192.168.0.1:8000");
            self.segments.push((bytes.to_vec(), frame_offset));
            Ok(())
        }

        fn did_recv_frame(&mut self, addr: SocketAddr) -> anyhow::Result<Option<u64>> {
            assert_eq!(addr.to_string(), "192.168.0.1:8000");
            self.frames += 1;
            if self.next_lengths.is_empty() {
                Ok(None)
            }
            else {
                Ok(Some(self.next_lengths.remove(0)))
            }
        }
    }

    #[test]
    fn test_single_buffer_with_growing_sizes() {
        // one 15-byte chunk split into frames of size 1,2,3,4,5
        let mut splitter = FrameSplitter::new();
        splitter.reset(1);

        let mut sink = RecordingSink::new(vec![2, 3, 4, 5]);
        let mut chunk = Bytes::from_static(b"abcdefghijklmno");

        splitter.did_recv(&mut chunk, addr(), &mut sink).unwrap();

        assert!(chunk.is_empty());
        assert_eq!(sink.frames, 5);
        assert_eq!(
            sink.segments,
            vec![
                (b"a".to_vec(), 0),
                (b"bc".to_vec(), 0),
                (b"def".to_vec(), 0),
                (b"ghij".to_vec(), 0),
                (b"klmno".to_vec(), 0),
            ]
        );
    }

    #[test]
    fn test_fragmented_frame() {
        let mut splitter = FrameSplitter::new();
        splitter.reset(10);

        let mut sink = RecordingSink::new(vec![]);
        for piece in [&b"abc"[..], &b"defg"[..], &b"hij"[..]] {
            let mut chunk = Bytes::copy_from_slice(piece);
            splitter.did_recv(&mut chunk, addr(), &mut sink).unwrap();
        }

        assert_eq!(sink.frames, 1);
        assert_eq!(
            sink.segments,
            vec![(b"abc".to_vec(), 0), (b"defg".to_vec(), 3), (b"hij".to_vec(), 7)]
        );
        assert!(!splitter.is_armed());
    }

    #[test]
    fn test_chunk_spanning_frame_boundary_is_split_exactly() {
        let mut splitter = FrameSplitter::new();
        splitter.reset(3);

        let mut sink = RecordingSink::new(vec![4]);
        let mut chunk = Bytes::from_static(b"aaabbbb");
        splitter.did_recv(&mut chunk, addr(), &mut sink).unwrap();

        assert_eq!(sink.frames, 2);
        assert_eq!(sink.segments, vec![(b"aaa".to_vec(), 0), (b"bbbb".to_vec(), 0)]);
    }

    #[test]
    fn test_n_whole_frames_in_one_chunk() {
        let mut splitter = FrameSplitter::new();
        splitter.reset(2);

        let mut sink = RecordingSink::new(vec![2, 2, 2]);
        let mut chunk = Bytes::from_static(b"aabbccdd");
        splitter.did_recv(&mut chunk, addr(), &mut sink).unwrap();

        assert_eq!(sink.frames, 4);
    }

    #[test]
    fn test_zero_length_frame_fires_immediately() {
        let mut splitter = FrameSplitter::new();
        splitter.reset(0);

        let mut sink = RecordingSink::new(vec![]);
        let mut chunk = Bytes::new();
        splitter.did_recv(&mut chunk, addr(), &mut sink).unwrap();

        assert_eq!(sink.frames, 1);
        assert!(sink.segments.is_empty());
    }

    #[test]
    fn test_bytes_without_armed_frame_rejected() {
        let mut splitter = FrameSplitter::new();

        let mut sink = RecordingSink::new(vec![]);
        let mut chunk = Bytes::from_static(b"stray");
        assert!(splitter.did_recv(&mut chunk, addr(), &mut sink).is_err());
    }

    #[test]
    fn test_per_frame_byte_sum_invariant() {
        // any partitioning of 4 frames x 64 bytes delivers each frame's bytes exactly once
        let data: Vec<u8> = (0..256).map(|i| i as u8).collect();

        for chunk_size in [1, 3, 7, 63, 64, 65, 256] {
            let mut splitter = FrameSplitter::new();
            splitter.reset(64);
            let mut sink = RecordingSink::new(vec![64, 64, 64]);

            for piece in data.chunks(chunk_size) {
                let mut chunk = Bytes::copy_from_slice(piece);
                splitter.did_recv(&mut chunk, addr(), &mut sink).unwrap();
            }

            assert_eq!(sink.frames, 4, "chunk size {}", chunk_size);
            let total: usize = sink.segments.iter().map(|(s, _)| s.len()).sum();
            assert_eq!(total, 256);

            let rejoined: Vec<u8> = sink.segments.iter().flat_map(|(s, _)| s.clone()).collect();
            assert_eq!(rejoined, data);
        }
    }
}
