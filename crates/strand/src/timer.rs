//! Inactivity timer wheel.
//!
//! Single-level wheel with one-second ticks. Each armed timer carries an
//! opaque user handle; `advance` walks the elapsed ticks and returns the
//! handles whose timers expired. Entries whose deadline lies beyond one wheel
//! revolution are re-queued when their bucket comes around.

use thunderdome::{Arena, Index};

const RING_SLOTS: u64 = 512;

/// Stable id of an armed timer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimerId(Index);

struct Timer {
    user_handle: u32,
    expiry: u64,
}

pub struct TimerWheel {
    timers: Arena<Timer>,
    ring: Vec<Vec<Index>>,
    last_tick: u64,
}

impl TimerWheel {
    pub fn new(start_secs: u64) -> Self {
        Self {
            timers: Arena::new(),
            ring: (0..RING_SLOTS).map(|_| Vec::new()).collect(),
            last_tick: start_secs,
        }
    }

    pub fn armed(&self) -> usize {
        self.timers.len()
    }

    /// Arm a timer `interval_secs` from the current tick.
    pub fn start(&mut self, user_handle: u32, interval_secs: u64) -> TimerId {
        let expiry = self.last_tick + interval_secs.max(1);
        let index = self.timers.insert(Timer { user_handle, expiry });
        self.enqueue(index, expiry);
        TimerId(index)
    }

    /// Disarm. Safe to call with an id that already expired; the stale ring
    /// entry is skipped when its bucket is visited.
    pub fn stop(&mut self, id: TimerId) {
        self.timers.remove(id.0);
    }

    /// Push the deadline out to `interval_secs` from the current tick.
    pub fn update(&mut self, id: TimerId, interval_secs: u64) {
        let expiry = self.last_tick + interval_secs.max(1);
        if let Some(timer) = self.timers.get_mut(id.0) {
            timer.expiry = expiry;
            self.enqueue(id.0, expiry);
        }
    }

    /// Advance the wheel to `now_secs`, returning expired user handles in
    /// firing order.
    pub fn advance(&mut self, now_secs: u64) -> Vec<u32> {
        let mut expired = Vec::new();

        while self.last_tick < now_secs {
            self.last_tick += 1;
            let tick = self.last_tick;
            let slot = (tick % RING_SLOTS) as usize;

            let bucket = std::mem::take(&mut self.ring[slot]);
            for index in bucket {
                // Stopped timers and superseded deadlines leave stale entries
                // behind; only a live timer at its current deadline fires.
                let due = match self.timers.get(index) {
                    Some(timer) if timer.expiry > tick => {
                        let slot = (timer.expiry % RING_SLOTS) as usize;
                        self.ring[slot].push(index);
                        false
                    }
                    Some(_) => true,
                    None => false,
                };

                if due {
                    if let Some(timer) = self.timers.remove(index) {
                        expired.push(timer.user_handle);
                    }
                }
            }
        }

        expired
    }

    fn enqueue(&mut self, index: Index, expiry: u64) {
        let slot = (expiry % RING_SLOTS) as usize;
        self.ring[slot].push(index);
    }
}
