//! Outbound body abstraction.
//!
//! A message body of known length, drained to the transport in bounded
//! bursts. Two carriers: the body bytes are either queued inline in the app
//! TX FIFO, or live in an app-owned region resolved from its token at init.
//! Used exclusively while a connection sits in the app-io-more-data state.

use bytes::Bytes;

pub enum HttpBuffer {
    /// Body bytes follow in the app TX FIFO; `remaining` counts what the
    /// app still owes.
    Fifo { remaining: u64 },
    /// App-owned contiguous region, already resolved from its token.
    Region { data: Bytes, offset: usize },
}

impl HttpBuffer {
    pub fn fifo(body_len: u64) -> Self {
        HttpBuffer::Fifo { remaining: body_len }
    }

    pub fn region(data: Bytes, body_len: u64) -> Self {
        let len = (body_len.min(data.len() as u64)) as usize;
        HttpBuffer::Region { data: data.slice(..len), offset: 0 }
    }

    /// Bytes not yet drained.
    pub fn remaining(&self) -> u64 {
        match self {
            HttpBuffer::Fifo { remaining } => *remaining,
            HttpBuffer::Region { data, offset } => (data.len() - offset) as u64,
        }
    }

    /// Next readable run of a region body, at most `max` bytes. Empty for
    /// FIFO-carried bodies, which are peeked straight out of the app FIFO.
    pub fn region_chunk(&self, max: usize) -> &[u8] {
        match self {
            HttpBuffer::Fifo { .. } => &[],
            HttpBuffer::Region { data, offset } => {
                let end = (offset + max).min(data.len());
                &data[*offset..end]
            }
        }
    }

    /// Account `n` bytes as sent, returning them for dequeue bookkeeping.
    pub fn drain(&mut self, n: usize) -> usize {
        match self {
            HttpBuffer::Fifo { remaining } => *remaining = remaining.saturating_sub(n as u64),
            HttpBuffer::Region { data, offset } => *offset = (*offset + n).min(data.len()),
        }
        n
    }

    pub fn is_drained(&self) -> bool {
        self.remaining() == 0
    }
}
