// Trigger detection from the frame timestamp stream
//
// A source armed for a synchronized recording keeps receiving frames while the
// sync device pauses its pulse train. The first frame after the pause arrives
// with a large delta, which marks the start of the recording.

/// Trigger latch of one source
#[derive(Debug, Clone)]
pub struct TriggerDetector {
    gap: f64,
    timeout: f64,
    waiting: bool,
    hold: bool,
    remaining: f64,
    timed_out: bool,
}

impl TriggerDetector {
    pub fn new(gap: f64, timeout: f64) -> Self {
        Self {
            gap,
            timeout,
            waiting: false,
            hold: false,
            remaining: timeout,
            timed_out: false,
        }
    }

    /// Arm for a new recording. The hold stays until `release_hold`, and while
    /// held no gap or timeout is evaluated.
    pub fn arm(&mut self, wait_for_trigger: bool) {
        self.waiting = wait_for_trigger;
        self.hold = true;
        self.remaining = self.timeout;
        self.timed_out = false;
    }

    pub fn release_hold(&mut self) {
        self.hold = false;
    }

    /// Start now, without waiting for a gap
    pub fn software_trigger(&mut self) {
        self.hold = false;
        self.waiting = false;
    }

    /// Feed the delta to the previous frame. Returns whether this frame belongs
    /// to the recording.
    pub fn observe(&mut self, dt: f64) -> bool {
        if self.waiting && !self.hold {
            if dt > self.gap {
                log::debug!("[Trigger] Gap of {:.0} ms detected", dt * 1000.0);
                self.waiting = false;
            }
            self.remaining -= dt;
            if self.waiting && self.remaining < 0.0 {
                log::warn!("[Trigger] No sync gap within {:.1} s, recording anyway", self.timeout);
                self.timed_out = true;
                self.waiting = false;
            }
        }
        !self.waiting
    }

    /// Stop waiting, e.g. once recording ends
    pub fn reset(&mut self) {
        self.waiting = false;
        self.hold = false;
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    pub fn is_held(&self) -> bool {
        self.hold
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gap_clears_waiting_on_the_next_sample() {
        let mut trigger = TriggerDetector::new(0.2, 3.0);
        trigger.arm(true);
        trigger.release_hold();

        let n = 7;
        for _ in 0..n {
            assert!(!trigger.observe(0.033));
            assert!(trigger.is_waiting());
        }
        // Sample N+1 arrives after a 250 ms pause
        assert!(trigger.observe(0.25));
        assert!(!trigger.is_waiting());
        assert!(!trigger.timed_out());
        assert!(trigger.observe(0.033));
    }

    #[test]
    fn hold_suspends_detection() {
        let mut trigger = TriggerDetector::new(0.2, 3.0);
        trigger.arm(true);
        assert!(!trigger.observe(0.5));
        assert!(!trigger.observe(10.0));
        assert!(trigger.is_waiting());
        assert!(!trigger.timed_out());

        trigger.release_hold();
        assert!(trigger.observe(0.5));
    }

    #[test]
    fn times_out_after_three_seconds() {
        let mut trigger = TriggerDetector::new(0.2, 3.0);
        trigger.arm(true);
        trigger.release_hold();

        // 125 ms frames: the budget runs out on the 25th
        for _ in 0..24 {
            assert!(!trigger.observe(0.125));
        }
        assert!(trigger.observe(0.125));
        assert!(trigger.timed_out());
        assert!(!trigger.is_waiting());
    }

    #[test]
    fn software_trigger_starts_immediately() {
        let mut trigger = TriggerDetector::new(0.2, 3.0);
        trigger.arm(true);
        trigger.software_trigger();
        assert!(!trigger.is_held());
        assert!(trigger.observe(0.01));
    }

    #[test]
    fn unarmed_wait_records_every_frame() {
        let mut trigger = TriggerDetector::new(0.2, 3.0);
        trigger.arm(false);
        assert!(trigger.is_held());
        assert!(trigger.observe(0.01));
    }

    #[test]
    fn rearming_clears_a_previous_timeout() {
        let mut trigger = TriggerDetector::new(0.2, 0.05);
        trigger.arm(true);
        trigger.release_hold();
        trigger.observe(0.1);
        assert!(trigger.timed_out());

        trigger.arm(true);
        assert!(!trigger.timed_out());
        assert!(trigger.is_waiting());
    }
}
