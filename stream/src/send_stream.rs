/// Send side of a single stream: a write cursor and the finalized flag. Fragmentation and
///  retransmission live in the connection; this only tracks where the next write lands.
pub struct SendStream {
    stream_id: u16,
    next_offset: u64,
    fin_sent: bool,
}

impl SendStream {
    pub fn new(stream_id: u16) -> SendStream {
        SendStream {
            stream_id,
            next_offset: 0,
            fin_sent: false,
        }
    }

    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    pub fn is_finalized(&self) -> bool {
        self.fin_sent
    }

    /// Reserve `len` bytes at the current cursor, returning their start offset.
    pub fn advance(&mut self, len: u64) -> u64 {
        debug_assert!(!self.fin_sent);
        let offset = self.next_offset;
        self.next_offset += len;
        offset
    }

    pub fn finalize(&mut self) {
        self.fin_sent = true;
    }
}
