use anyhow::bail;
use bytes::{Buf, Bytes};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Receive side of a single stream: dispatches bytes strictly in offset order, buffering
///  out-of-order fragments keyed by their stream offset. Retransmitted packets keep their
///  original `(stream_id, offset)`, so duplicates and overlaps are resolved here by offset
///  arithmetic alone.
pub struct RecvStream {
    stream_id: u16,
    expected_offset: u64,
    /// out-of-order fragments, keyed by stream offset
    buffered: BTreeMap<u64, Bytes>,
    buffered_bytes: usize,
    max_buffered_bytes: usize,
    /// total stream length, known once the FIN-carrying packet arrives
    final_len: Option<u64>,
    finished: bool,
}

impl RecvStream {
    pub fn new(stream_id: u16, max_buffered_bytes: usize) -> RecvStream {
        RecvStream {
            stream_id,
            expected_offset: 0,
            buffered: BTreeMap::new(),
            buffered_bytes: 0,
            max_buffered_bytes,
            final_len: None,
            finished: false,
        }
    }

    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn expected_offset(&self) -> u64 {
        self.expected_offset
    }

    /// Process one arriving fragment. Returns the byte ranges that became dispatchable, in
    ///  offset order. Errors are protocol violations (conflicting FIN, data past the end,
    ///  buffer overrun) and must close the connection.
    pub fn on_data(&mut self, offset: u64, mut bytes: Bytes, fin: bool) -> anyhow::Result<Vec<Bytes>> {
        if self.finished {
            trace!("stream {}: fragment after finish - dropping", self.stream_id);
            return Ok(Vec::new());
        }

        let end = offset + bytes.len() as u64;

        if fin {
            match self.final_len {
                None => self.final_len = Some(end),
                Some(final_len) if final_len != end => {
                    bail!("stream {}: conflicting final lengths {} and {}", self.stream_id, final_len, end);
                }
                Some(_) => {}
            }
        }
        if let Some(final_len) = self.final_len {
            if end > final_len {
                bail!("stream {}: data past the final length {}", self.stream_id, final_len);
            }
        }

        // duplicate of fully dispatched data
        if end <= self.expected_offset {
            trace!("stream {}: stale fragment at offset {} - dropping", self.stream_id, offset);
            self.check_finished();
            return Ok(Vec::new());
        }

        // trim the overlap with already dispatched data
        if offset < self.expected_offset {
            bytes.advance((self.expected_offset - offset) as usize);
        }
        else if offset > self.expected_offset {
            self.buffer_fragment(offset, bytes)?;
            return Ok(Vec::new());
        }

        let mut dispatchable = Vec::new();
        if !bytes.is_empty() {
            self.expected_offset += bytes.len() as u64;
            dispatchable.push(bytes);
        }

        // drain buffered fragments that became contiguous
        while let Some((&buf_offset, _)) = self.buffered.first_key_value() {
            if buf_offset > self.expected_offset {
                break;
            }

            let (_, mut buffered) = self.buffered.pop_first().unwrap();
            self.buffered_bytes -= buffered.len();

            let buf_end = buf_offset + buffered.len() as u64;
            if buf_end <= self.expected_offset {
                continue;
            }
            if buf_offset < self.expected_offset {
                buffered.advance((self.expected_offset - buf_offset) as usize);
            }

            self.expected_offset += buffered.len() as u64;
            dispatchable.push(buffered);
        }

        self.check_finished();
        Ok(dispatchable)
    }

    fn buffer_fragment(&mut self, offset: u64, bytes: Bytes) -> anyhow::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }

        self.buffered_bytes += bytes.len();
        if self.buffered_bytes > self.max_buffered_bytes {
            bail!("stream {}: out-of-order buffer overrun ({} bytes)", self.stream_id, self.buffered_bytes);
        }

        // a retransmission is byte-identical at the same offset, keeping the longer one is safe
        match self.buffered.get(&offset) {
            Some(existing) if existing.len() >= bytes.len() => {
                self.buffered_bytes -= bytes.len();
            }
            Some(existing) => {
                self.buffered_bytes -= existing.len();
                self.buffered.insert(offset, bytes);
            }
            None => {
                self.buffered.insert(offset, bytes);
            }
        }
        Ok(())
    }

    fn check_finished(&mut self) {
        if self.final_len == Some(self.expected_offset) && !self.finished {
            debug!("stream {}: finished after {} bytes", self.stream_id, self.expected_offset);
            self.finished = true;
            self.buffered.clear();
            self.buffered_bytes = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn collect(chunks: Vec<Bytes>) -> Vec<u8> {
        chunks.into_iter().flatten().collect()
    }

    #[test]
    fn test_in_order_delivery() {
        let mut stream = RecvStream::new(1, 1024);

        let out = stream.on_data(0, Bytes::from_static(b"hello"), false).unwrap();
        assert_eq!(collect(out), b"hello");

        let out = stream.on_data(5, Bytes::from_static(b" world"), true).unwrap();
        assert_eq!(collect(out), b" world");
        assert!(stream.is_finished());
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let mut stream = RecvStream::new(1, 1024);

        assert!(stream.on_data(5, Bytes::from_static(b" world"), true).unwrap().is_empty());
        assert!(!stream.is_finished());

        let out = stream.on_data(0, Bytes::from_static(b"hello"), false).unwrap();
        assert_eq!(collect(out), b"hello world");
        assert!(stream.is_finished());
    }

    #[rstest]
    #[case::reverse(vec![2, 1, 0])]
    #[case::middle_first(vec![1, 0, 2])]
    #[case::last_first(vec![2, 0, 1])]
    fn test_arbitrary_arrival_order(#[case] order: Vec<usize>) {
        let fragments: [&[u8]; 3] = [b"aaa", b"bbbb", b"cc"];
        let offsets = [0u64, 3, 7];

        let mut stream = RecvStream::new(1, 1024);
        let mut delivered = Vec::new();
        for &i in &order {
            let fin = i == 2;
            let out = stream.on_data(offsets[i], Bytes::copy_from_slice(fragments[i]), fin).unwrap();
            delivered.extend(collect(out));
        }

        assert_eq!(delivered, b"aaabbbbcc");
        assert!(stream.is_finished());
    }

    #[test]
    fn test_duplicate_dropped() {
        let mut stream = RecvStream::new(1, 1024);

        let out = stream.on_data(0, Bytes::from_static(b"hello"), false).unwrap();
        assert_eq!(collect(out), b"hello");

        let out = stream.on_data(0, Bytes::from_static(b"hello"), false).unwrap();
        assert!(out.is_empty());
        assert_eq!(stream.expected_offset(), 5);
    }

    #[test]
    fn test_overlap_trimmed() {
        let mut stream = RecvStream::new(1, 1024);

        stream.on_data(0, Bytes::from_static(b"hello"), false).unwrap();
        let out = stream.on_data(3, Bytes::from_static(b"lo world"), false).unwrap();
        assert_eq!(collect(out), b" world");
        assert_eq!(stream.expected_offset(), 11);
    }

    #[test]
    fn test_zero_length_stream() {
        let mut stream = RecvStream::new(1, 1024);

        let out = stream.on_data(0, Bytes::new(), true).unwrap();
        assert!(out.is_empty());
        assert!(stream.is_finished());
    }

    #[test]
    fn test_fragment_after_finish_ignored() {
        let mut stream = RecvStream::new(1, 1024);
        stream.on_data(0, Bytes::from_static(b"abc"), true).unwrap();
        assert!(stream.is_finished());

        let out = stream.on_data(0, Bytes::from_static(b"abc"), true).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_conflicting_fin_rejected() {
        let mut stream = RecvStream::new(1, 1024);
        stream.on_data(5, Bytes::from_static(b"x"), true).unwrap();

        assert!(stream.on_data(9, Bytes::from_static(b"y"), true).is_err());
    }

    #[test]
    fn test_data_past_final_length_rejected() {
        let mut stream = RecvStream::new(1, 1024);
        stream.on_data(3, Bytes::from_static(b"x"), true).unwrap();

        assert!(stream.on_data(10, Bytes::from_static(b"zzz"), false).is_err());
    }

    #[test]
    fn test_buffer_overrun_rejected() {
        let mut stream = RecvStream::new(1, 8);

        assert!(stream.on_data(100, Bytes::from_static(b"aaaa"), false).is_ok());
        assert!(stream.on_data(200, Bytes::from_static(b"bbbbbbbb"), false).is_err());
    }

    #[test]
    fn test_retransmitted_buffered_fragment_not_double_counted() {
        let mut stream = RecvStream::new(1, 10);

        assert!(stream.on_data(100, Bytes::from_static(b"aaaa"), false).is_ok());
        assert!(stream.on_data(100, Bytes::from_static(b"aaaa"), false).is_ok());
        assert!(stream.on_data(200, Bytes::from_static(b"bbbb"), false).is_ok());
    }
}
