use std::cmp::{max, min};
use tracing::debug;

const INITIAL_CWND: u32 = 10;
const MIN_CWND: u32 = 2;

/// AIMD congestion control in packets: exponential growth while below the slow start
///  threshold, one additional packet per fully-used window afterwards, and a halving of the
///  window on loss. The window only grows when it is actually being used - an ACK arriving
///  while the sender is mostly idle says nothing about available bandwidth.
#[derive(Debug)]
pub struct CongestionControl {
    cwnd: u32,
    ssthresh: u32,
    cwnd_cnt: u32,
    send_window_limit: u32,
}

impl CongestionControl {
    pub fn new(send_window_limit: u32) -> CongestionControl {
        assert!(send_window_limit >= MIN_CWND);

        CongestionControl {
            cwnd: min(INITIAL_CWND, send_window_limit),
            ssthresh: send_window_limit,
            cwnd_cnt: 0,
            send_window_limit,
        }
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    fn is_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    pub fn on_ack(&mut self, num_packets_in_flight: u32) {
        if self.cwnd == self.send_window_limit {
            return;
        }

        if self.is_slow_start() {
            // lenient in slow start: grow on 50% utilization
            if self.cwnd > 2 * num_packets_in_flight {
                return;
            }
            self.cwnd += 1;
        }
        else {
            // congestion avoidance: only grow when the window is actually full
            if self.cwnd > num_packets_in_flight {
                return;
            }
            self.cwnd_cnt += 1;
            if self.cwnd_cnt >= self.cwnd {
                self.cwnd_cnt = 0;
                self.cwnd += 1;
            }
        }

        self.cwnd = min(self.cwnd, self.send_window_limit);
        debug!("adjusted cwnd to {} packets", self.cwnd);
    }

    pub fn on_loss(&mut self) {
        self.ssthresh = max(MIN_CWND, self.cwnd / 2);
        self.cwnd = self.ssthresh;
        // without this reset the counter could bump cwnd right back up
        self.cwnd_cnt = 0;

        debug!("loss -> adjusting cwnd downwards to {}", self.cwnd);
    }
}
