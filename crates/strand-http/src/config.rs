use tracing::{event, Level};

const MIN_SEG_SIZE: u64 = 1 << 20;
const MIN_FIFO_SIZE: usize = 4 << 10;
const MAX_FIFO_SIZE: usize = 2 << 30;

/// Engine configuration knobs. Out-of-range values are clamped with a
/// warning rather than rejected.
#[derive(Clone, Debug)]
pub struct HttpConfig {
    first_segment_size: u64,
    add_segment_size: u64,
    fifo_size: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            first_segment_size: 32 << 20,
            add_segment_size: 256 << 20,
            fifo_size: 512 << 10,
        }
    }
}

impl HttpConfig {
    pub fn first_segment_size(&self) -> u64 {
        self.first_segment_size
    }

    pub fn add_segment_size(&self) -> u64 {
        self.add_segment_size
    }

    /// RX/TX FIFO size for app sessions.
    pub fn fifo_size(&self) -> usize {
        self.fifo_size
    }

    pub fn set_first_segment_size(&mut self, size: u64) {
        self.first_segment_size = size.max(MIN_SEG_SIZE);
        if self.first_segment_size != size {
            event!(Level::WARN, size, "first segment size too small, clamped");
        }
    }

    pub fn set_add_segment_size(&mut self, size: u64) {
        self.add_segment_size = size.max(MIN_SEG_SIZE);
        if self.add_segment_size != size {
            event!(Level::WARN, size, "add segment size too small, clamped");
        }
    }

    pub fn set_fifo_size(&mut self, size: usize) {
        self.fifo_size = size.clamp(MIN_FIFO_SIZE, MAX_FIFO_SIZE);
        if self.fifo_size != size {
            event!(Level::WARN, size, "invalid fifo size, clamped");
        }
    }
}
