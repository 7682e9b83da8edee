//! Connection records and per-worker pools.

use std::fmt;

use strand::session::SessionHandle;
use strand::timer::TimerId;
use thunderdome::Arena;
use tracing::{event, Level};

use crate::buffer::HttpBuffer;
use crate::message::{Method, TargetForm};
use crate::parse::MsgCursor;

/// Default inactivity timeout, seconds.
pub const HTTP_CONN_TIMEOUT: u32 = 60;

/// Connection-level state, as seen by the session layer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub enum ConnState {
    #[default]
    Listen,
    Connecting,
    Established,
    TransportClosed,
    AppClosed,
    Closed,
}

/// Protocol state driving request/response framing.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum HttpState {
    #[default]
    Idle,
    WaitAppMethod,
    WaitClientMethod,
    WaitServerReply,
    WaitAppReply,
    ClientIoMoreData,
    AppIoMoreData,
}

impl fmt::Display for HttpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HttpState::Idle => "idle",
            HttpState::WaitAppMethod => "wait app method",
            HttpState::WaitClientMethod => "wait client method",
            HttpState::WaitServerReply => "wait server reply",
            HttpState::WaitAppReply => "wait app reply",
            HttpState::ClientIoMoreData => "client io more data",
            HttpState::AppIoMoreData => "app io more data",
        };
        f.write_str(name)
    }
}

/// One HTTP session: an accepted or connected exchange, a listener, or a
/// half-open connect, depending on which pool holds it.
#[derive(Default)]
pub struct HttpConn {
    pub thread_index: u8,
    /// Own slot in the owning pool; never changes after alloc.
    pub hc_index: u32,
    pub pa_session: Option<SessionHandle>,
    pub tc_session: Option<SessionHandle>,
    pub pa_wrk_index: u32,
    pub pa_app_api_ctx: u32,
    pub is_server: bool,

    pub state: ConnState,
    pub http_state: HttpState,

    /// RX scratch, grown on demand and drained after each parsed message.
    pub rx_buf: Vec<u8>,
    pub cursor: MsgCursor,
    pub method: Method,
    pub target_form: TargetForm,
    pub status_code: u16,

    pub tx_buf: Option<HttpBuffer>,
    /// Body bytes still owed by the transport in client-io-more-data.
    pub to_recv: u64,

    pub timer: Option<TimerId>,
    pub pending_timer: bool,
    /// Inactivity timeout, seconds.
    pub timeout: u32,

    /// Server or User-Agent identity.
    pub app_name: String,
    /// Host authority, clients only.
    pub host: String,
}

impl HttpConn {
    pub fn state_change(&mut self, state: HttpState) {
        event!(
            Level::DEBUG,
            from = %self.http_state,
            to = %state,
            "http state change"
        );
        self.http_state = state;
    }
}

/// Pack a worker thread and 24-bit pool slot into the u32 handle the timer
/// wheel carries. The callback unpacks and re-validates through the pool, so
/// a recycled slot between fire and processing is caught.
pub(crate) fn pack_timer_handle(thread_index: u8, slot: u32) -> u32 {
    ((thread_index as u32) << 24) | (slot & 0x00ff_ffff)
}

pub(crate) fn unpack_timer_handle(handle: u32) -> (u8, u32) {
    ((handle >> 24) as u8, handle & 0x00ff_ffff)
}

/// Per-worker pool of active connections. Only ever touched from the owning
/// worker.
#[derive(Default)]
pub struct HttpWorker {
    conn_pool: Arena<HttpConn>,
}

impl HttpWorker {
    pub fn conn_alloc(&mut self, thread_index: u8) -> u32 {
        let index = self.conn_pool.insert(HttpConn::default());
        let slot = index.slot();

        let hc = &mut self.conn_pool[index];
        hc.thread_index = thread_index;
        hc.hc_index = slot;
        slot
    }

    pub fn conn_by_slot(&self, slot: u32) -> Option<&HttpConn> {
        self.conn_pool.get_by_slot(slot).map(|(_, hc)| hc)
    }

    pub fn conn_by_slot_mut(&mut self, slot: u32) -> Option<&mut HttpConn> {
        self.conn_pool.get_by_slot_mut(slot).map(|(_, hc)| hc)
    }

    pub fn conn_free(&mut self, slot: u32) {
        if self.conn_pool.remove_by_slot(slot).is_none() {
            event!(Level::WARN, slot, "freeing unknown connection");
        }
    }

    pub fn conn_count(&self) -> usize {
        self.conn_pool.len()
    }
}
