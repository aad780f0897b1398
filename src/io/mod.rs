pub mod base;
pub mod mpmc;
pub mod ringbuffer;
pub mod step_queue;

use crossbeam::utils::Backoff;
use std::thread;
use std::time::Duration;

/// Escalating idle strategy shared by the blocking transport calls:
/// spin, then yield, then short sleeps.
pub(crate) struct IdleBackoff {
    backoff: Backoff,
    spins: u32,
}

impl IdleBackoff {
    pub(crate) fn new() -> Self {
        Self {
            backoff: Backoff::new(),
            spins: 0,
        }
    }

    #[inline]
    pub(crate) fn idle(&mut self) {
        self.spins = self.spins.saturating_add(1);
        if self.spins < 64 {
            self.backoff.spin();
        } else if self.spins < 256 {
            self.backoff.snooze();
        } else {
            thread::sleep(Duration::from_micros(50));
        }
    }
}
