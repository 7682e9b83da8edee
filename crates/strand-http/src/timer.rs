//! Inactivity timer binding.
//!
//! Connections arm one timer each on the shared wheel, keyed by the packed
//! worker/slot handle. Expiration is two-phase: the wheel invalidates the
//! stored id first, the timeout pass then re-validates the record before
//! acting, tolerating a connection freed in between.

use strand::timer::TimerWheel;

use crate::conn::{pack_timer_handle, HttpConn};

pub(crate) struct HttpTimers {
    wheel: TimerWheel,
}

impl HttpTimers {
    pub fn new(start_secs: u64) -> Self {
        Self { wheel: TimerWheel::new(start_secs) }
    }

    pub fn start(&mut self, hc: &mut HttpConn) {
        let handle = pack_timer_handle(hc.thread_index, hc.hc_index);
        hc.timer = Some(self.wheel.start(handle, hc.timeout as u64));
        hc.pending_timer = false;
    }

    pub fn stop(&mut self, hc: &mut HttpConn) {
        if let Some(id) = hc.timer.take() {
            self.wheel.stop(id);
        }
    }

    /// Refresh after a successful state-machine pass.
    pub fn update(&mut self, hc: &HttpConn) {
        if let Some(id) = hc.timer {
            self.wheel.update(id, hc.timeout as u64);
        }
    }

    /// Tick the wheel; returns expired packed handles.
    pub fn advance(&mut self, now_secs: u64) -> Vec<u32> {
        self.wheel.advance(now_secs)
    }
}
