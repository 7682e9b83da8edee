use std::cmp;

use anyhow::anyhow;
use thiserror::Error;

/// Single-producer single-consumer byte queue.
///
/// One FIFO per direction per session. Capacity is fixed at allocation; the
/// queue is a ring over a flat buffer, so readable bytes are visible as at
/// most two contiguous slices.
pub struct Fifo {
    buf: Vec<u8>,
    head: usize,
    len: usize,

    has_event: bool,
    deq_thresh: usize,
    deq_notify_armed: bool,
}

impl Fifo {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            head: 0,
            len: 0,

            has_event: false,
            deq_thresh: 0,
            deq_notify_armed: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes available for reading.
    pub fn max_dequeue(&self) -> usize {
        self.len
    }

    /// Free space available for writing.
    pub fn max_enqueue(&self) -> usize {
        self.buf.len() - self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy in as much of `data` as fits, returning the number of bytes
    /// accepted.
    pub fn enqueue(&mut self, data: &[u8]) -> usize {
        let n = cmp::min(data.len(), self.max_enqueue());
        self.copy_in(&data[..n]);
        n
    }

    /// Write multiple segments as one logical record.
    ///
    /// With `allow_partial` unset the write is all-or-nothing, which is what
    /// control-message framing relies on: either the full header plus payload
    /// lands in the queue, or nothing does.
    pub fn enqueue_segments(
        &mut self,
        segs: &[&[u8]],
        allow_partial: bool,
    ) -> Result<usize, SegmentWriteError> {
        let total: usize = segs.iter().map(|s| s.len()).sum();
        if !allow_partial && total > self.max_enqueue() {
            return Err(anyhow!(
                "segment write of {} bytes exceeds {} free",
                total,
                self.max_enqueue()
            )
            .into());
        }

        let mut written = 0;
        for seg in segs {
            let n = self.enqueue(seg);
            written += n;
            if n < seg.len() {
                break;
            }
        }
        Ok(written)
    }

    /// Copy out readable bytes starting at `offset`, without consuming them.
    pub fn peek(&self, offset: usize, dst: &mut [u8]) -> usize {
        if offset >= self.len {
            return 0;
        }
        let n = cmp::min(dst.len(), self.len - offset);
        let cap = self.buf.len();
        let mut pos = (self.head + offset) % cap;
        let mut copied = 0;
        while copied < n {
            let run = cmp::min(n - copied, cap - pos);
            dst[copied..copied + run].copy_from_slice(&self.buf[pos..pos + run]);
            copied += run;
            pos = (pos + run) % cap;
        }
        n
    }

    /// Copy out and consume readable bytes.
    pub fn dequeue(&mut self, dst: &mut [u8]) -> usize {
        let n = self.peek(0, dst);
        self.drop_head(n);
        n
    }

    /// Consume `n` readable bytes without copying them out.
    pub fn dequeue_drop(&mut self, n: usize) -> usize {
        let n = cmp::min(n, self.len);
        self.drop_head(n);
        n
    }

    pub fn dequeue_drop_all(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// View of up to `max` readable bytes as at most two slices (ring wrap).
    pub fn segments(&self, max: usize) -> (&[u8], &[u8]) {
        let n = cmp::min(max, self.len);
        if n == 0 {
            return (&[], &[]);
        }
        let cap = self.buf.len();
        let first_run = cmp::min(n, cap - self.head);
        let first = &self.buf[self.head..self.head + first_run];
        let second = &self.buf[..n - first_run];
        (first, second)
    }

    /// Mark the io-event flag, returning true if it was newly set.
    ///
    /// Producers only program an io event on the transition, so repeated
    /// writes coalesce into one notification.
    pub fn set_event(&mut self) -> bool {
        let was = self.has_event;
        self.has_event = true;
        !was
    }

    pub fn unset_event(&mut self) {
        self.has_event = false;
    }

    pub fn has_event(&self) -> bool {
        self.has_event
    }

    /// Free-space threshold consulted by `deq_notify_due`.
    pub fn set_deq_thresh(&mut self, thresh: usize) {
        self.deq_thresh = thresh;
    }

    pub fn deq_thresh(&self) -> usize {
        self.deq_thresh
    }

    /// Request a notification once the consumer has drained the queue below
    /// the configured threshold.
    pub fn arm_deq_notify(&mut self) {
        self.deq_notify_armed = true;
    }

    pub fn wants_deq_notify(&self) -> bool {
        self.deq_notify_armed
    }

    /// True once a notification is armed and enough free space has opened up.
    pub fn deq_notify_due(&self) -> bool {
        self.deq_notify_armed && self.max_enqueue() >= cmp::max(self.deq_thresh, 1)
    }

    /// Consume the armed notification, if due.
    pub fn take_deq_notify(&mut self) -> bool {
        if self.deq_notify_due() {
            self.deq_notify_armed = false;
            true
        } else {
            false
        }
    }

    fn copy_in(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let cap = self.buf.len();
        let mut pos = (self.head + self.len) % cap;
        let mut copied = 0;
        while copied < data.len() {
            let run = cmp::min(data.len() - copied, cap - pos);
            self.buf[pos..pos + run].copy_from_slice(&data[copied..copied + run]);
            copied += run;
            pos = (pos + run) % cap;
        }
        self.len += data.len();
    }

    fn drop_head(&mut self, n: usize) {
        self.head = (self.head + n) % self.buf.len().max(1);
        self.len -= n;
        if self.len == 0 {
            self.head = 0;
        }
    }
}

/// Error while writing segments to a FIFO.
#[derive(Error, Debug)]
#[error("segment write failed")]
pub struct SegmentWriteError {
    #[from]
    source: anyhow::Error,
}
