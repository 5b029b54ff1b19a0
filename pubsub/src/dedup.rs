use rustc_hash::FxHashSet;

const NUM_BUCKETS: usize = 256;

/// Time-windowed message-id deduplication: a ring of 256 buckets plus the set holding their
///  union. Ids are recorded in the bucket that is current at observation time; each tick
///  advances the ring by one and evicts the bucket it lands on, which is the one observed
///  256 ticks ago. The window is therefore ~256 x tick interval.
///
/// Invariant: the set is exactly the union of the buckets - never insert into one without
///  the other.
pub struct MessageIdWindow {
    buckets: Vec<Vec<u64>>,
    idx: u8,
    set: FxHashSet<u64>,
}

impl MessageIdWindow {
    pub fn new() -> MessageIdWindow {
        MessageIdWindow {
            buckets: vec![Vec::new(); NUM_BUCKETS],
            idx: 0,
            set: FxHashSet::default(),
        }
    }

    pub fn contains(&self, msg_id: u64) -> bool {
        self.set.contains(&msg_id)
    }

    /// Record `msg_id` in the current bucket. Returns false when it was already known (and
    ///  records nothing).
    pub fn observe(&mut self, msg_id: u64) -> bool {
        if !self.set.insert(msg_id) {
            return false;
        }
        self.buckets[self.idx as usize].push(msg_id);
        true
    }

    /// Advance the ring and evict the oldest bucket.
    pub fn tick(&mut self) {
        // u8 wrap-around is the ring traversal
        self.idx = self.idx.wrapping_add(1);

        for msg_id in self.buckets[self.idx as usize].drain(..) {
            self.set.remove(&msg_id);
        }
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

impl Default for MessageIdWindow {
    fn default() -> MessageIdWindow {
        MessageIdWindow::new()
    }
}
