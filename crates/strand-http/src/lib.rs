//! Embedded HTTP/1.1 protocol engine.
//!
//! Sits between the strand session layer (raw byte streams and per-session
//! FIFOs) and application workers (structured request/reply messages), in
//! both server and client roles. No pipelining, no chunked transfer coding,
//! no connection reuse across exchanges.

mod buffer;
mod config;
mod conn;
mod message;
mod state;
mod timer;
mod transport;

pub mod parse;
pub mod status;

pub use self::{
    buffer::HttpBuffer,
    config::HttpConfig,
    conn::{ConnState, HttpConn, HttpState, HTTP_CONN_TIMEOUT},
    message::{DataType, HttpMsg, Method, MsgData, MsgDecodeError, MsgType, TargetForm},
    state::SendParams,
    transport::{CleanupKind, HttpEngine},
};
