//! Congestion control surface.
//!
//! The session does not carry congestion policy of its own: it assumes a
//! controller exists and drives it through the callback surface below,
//! consulting `window` before each outbound packet. A NewReno reference
//! implementation is bundled and installed by default; embedders supply
//! their own through `Session::set_congestion_controller`.

/// Callbacks a session issues toward its congestion controller
pub trait Controller {
    /// A packet left the session; `bytes` is 0 for ack-only packets
    fn on_packet_sent(&mut self, now: u64, number: u64, bytes: u64);
    /// `bytes` of in-flight packet `number` were acknowledged
    fn on_packet_acked(&mut self, number: u64, bytes: u64);
    /// Loss was detected for packets up to `largest_lost`
    fn on_congestion_event(&mut self, now: u64, largest_lost: u64);
    /// A retransmission timeout proved spurious
    fn on_retransmission_timeout_verified(&mut self);
    /// Bytes the session may currently keep in flight
    fn window(&self) -> u64;
}

/// The bundled reference controller: NewReno with slow start and a
/// multiplicative cut per loss epoch
pub struct NewReno {
    mss: u64,
    window: u64,
    /// Floor under any loss response
    minimum_window: u64,
    /// 0.16 fixed point
    loss_reduction_factor: u16,
    /// Below this the window is in slow start and grows by bytes acked
    ssthresh: u64,
    /// Packets up to here belong to the current recovery epoch; their
    /// acknowledgment must not grow the window
    end_of_recovery: u64,
    largest_sent: u64,
}

impl NewReno {
    pub fn new(
        mss: u64,
        initial_window: u64,
        minimum_window: u64,
        loss_reduction_factor: u16,
    ) -> Self {
        NewReno {
            mss,
            window: initial_window,
            minimum_window,
            loss_reduction_factor,
            ssthresh: u64::max_value(),
            end_of_recovery: 0,
            largest_sent: 0,
        }
    }

    fn in_recovery(&self, number: u64) -> bool {
        number <= self.end_of_recovery
    }
}

impl Controller for NewReno {
    fn on_packet_sent(&mut self, _now: u64, number: u64, _bytes: u64) {
        self.largest_sent = self.largest_sent.max(number);
    }

    fn on_packet_acked(&mut self, number: u64, bytes: u64) {
        if bytes == 0 || self.in_recovery(number) {
            return;
        }
        if self.window < self.ssthresh {
            // slow start
            self.window += bytes;
        } else {
            // congestion avoidance
            self.window += self.mss * bytes / self.window;
        }
    }

    fn on_congestion_event(&mut self, _now: u64, largest_lost: u64) {
        // one cut per recovery epoch
        if self.in_recovery(largest_lost) {
            return;
        }
        self.end_of_recovery = self.largest_sent;
        self.window = (self.window * u64::from(self.loss_reduction_factor)) >> 16;
        self.window = self.window.max(self.minimum_window);
        self.ssthresh = self.window;
    }

    fn on_retransmission_timeout_verified(&mut self) {
        self.window = self.minimum_window;
    }

    fn window(&self) -> u64 {
        self.window
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn controller() -> NewReno {
        NewReno::new(1460, 10 * 1460, 2 * 1460, 0x8000)
    }

    #[test]
    fn slow_start_grows_by_bytes_acked() {
        let mut cc = controller();
        let before = cc.window();
        cc.on_packet_sent(0, 1, 1200);
        cc.on_packet_acked(1, 1200);
        assert_eq!(cc.window(), before + 1200);
    }

    #[test]
    fn loss_cut_honors_configured_factor_and_floor() {
        // a quarter cut instead of the usual half
        let mut cc = NewReno::new(1460, 16 * 1460, 2 * 1460, 0x4000);
        cc.on_packet_sent(0, 1, 1200);
        cc.on_congestion_event(0, 1);
        assert_eq!(cc.window(), 4 * 1460);

        // repeated events bottom out at the floor
        for number in 2..8 {
            cc.on_packet_sent(0, number, 1200);
            cc.on_congestion_event(0, number);
        }
        assert_eq!(cc.window(), 2 * 1460);
    }

    #[test]
    fn one_cut_per_recovery_epoch() {
        let mut cc = controller();
        for number in 1..=5 {
            cc.on_packet_sent(0, number, 1200);
        }
        cc.on_congestion_event(0, 2);
        let after_first = cc.window();
        // further losses from the same epoch leave the window alone
        cc.on_congestion_event(0, 4);
        assert_eq!(cc.window(), after_first);

        // acks of packets inside the epoch do not grow the window either
        cc.on_packet_acked(3, 1200);
        assert_eq!(cc.window(), after_first);
        cc.on_packet_sent(0, 6, 1200);
        cc.on_packet_acked(6, 1200);
        assert!(cc.window() > after_first);
    }

    #[test]
    fn spurious_rto_collapses_to_minimum() {
        let mut cc = controller();
        cc.on_retransmission_timeout_verified();
        assert_eq!(cc.window(), 2 * 1460);
    }
}
