//! Session-layer primitives for the strand user-space networking stack.
//!
//! This crate owns the pieces protocol plug-ins build on top of: per-session
//! byte FIFOs, the session table with its app-worker notification queue, the
//! inactivity timer wheel, and the shared wall-clock time base. Protocol
//! crates (such as `strand-http`) register against these primitives and never
//! own a socket themselves.

mod fifo;
mod time;

pub mod session;
pub mod timer;

pub use self::{
    fifo::{Fifo, SegmentWriteError},
    time::Timebase,
};
