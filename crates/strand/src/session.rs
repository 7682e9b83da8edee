//! Session table and app-worker handoff.
//!
//! A session is one endpoint of a byte stream: a transport-side session owned
//! by TCP/TLS, or an app-side session owned by a protocol plug-in. Both carry
//! an RX/TX FIFO pair. The layer also queues the notifications an app worker
//! would be scheduled with, so protocol code never calls into apps directly.

use std::collections::VecDeque;
use std::net::SocketAddr;

use bytes::Bytes;
use thunderdome::{Arena, Index};
use tracing::{event, Level};

use crate::Fifo;

/// Transport protocols a session can be bound to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransportProto {
    Tcp,
    Tls,
    Http,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SessionState {
    Listening,
    Connecting,
    Accepting,
    Ready,
    Closed,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SessionKind {
    Stream,
    Listener,
}

/// Stable typed handle to a session record.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SessionHandle(Index);

impl SessionHandle {
    pub fn slot(&self) -> u32 {
        self.0.slot()
    }
}

pub struct Session {
    pub kind: SessionKind,
    pub proto: TransportProto,
    pub state: SessionState,
    pub thread_index: u8,
    /// Peer protocol's connection index, opaque to the session layer.
    pub opaque: u32,
    pub listener: Option<SessionHandle>,
    pub addr: Option<SocketAddr>,
    pub rx_fifo: Fifo,
    pub tx_fifo: Fifo,
    pub descheduled: bool,
}

/// Notification queued towards an app worker.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Notice {
    AppAccept { session: SessionHandle },
    AppConnected { session: Option<SessionHandle>, api_context: u32, err: bool },
    AppRxNotify { session: SessionHandle },
    TransportClosing { session: SessionHandle },
    TransportClosed { session: SessionHandle },
    TransportReset { session: SessionHandle },
    TransportDelete { session: SessionHandle },
    HalfOpenDelete { session: SessionHandle },
}

/// A TX io event programmed for the transport scheduler.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TxEvent {
    pub session: SessionHandle,
    pub flush: bool,
}

/// Per-endpoint extension block, selected by tag.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExtConfig {
    /// Protocol-specific opaque value; HTTP reads it as a timeout override.
    Http { opaque: u32 },
    /// Crypto context for the underlying transport; presence upgrades a
    /// listener from TCP to TLS.
    Crypto { ckpair_index: u32 },
}

/// Endpoint description handed to connect/listen.
#[derive(Clone, Debug)]
pub struct Endpoint {
    pub addr: SocketAddr,
    pub ext: Vec<ExtConfig>,
}

impl Endpoint {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, ext: Vec::new() }
    }

    pub fn http_ext(&self) -> Option<u32> {
        self.ext.iter().find_map(|e| match e {
            ExtConfig::Http { opaque } => Some(*opaque),
            _ => None,
        })
    }

    pub fn crypto_ext(&self) -> Option<u32> {
        self.ext.iter().find_map(|e| match e {
            ExtConfig::Crypto { ckpair_index } => Some(*ckpair_index),
            _ => None,
        })
    }
}

/// The session table plus the queues that stand in for app-worker and
/// transport-scheduler dispatch.
#[derive(Default)]
pub struct SessionLayer {
    sessions: Arena<Session>,
    notices: VecDeque<Notice>,
    tx_events: VecDeque<TxEvent>,
    rx_events: VecDeque<SessionHandle>,
    regions: Arena<Bytes>,
}

impl SessionLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a stream session with an RX/TX FIFO pair.
    pub fn alloc_session(&mut self, thread_index: u8, fifo_size: usize) -> SessionHandle {
        let session = Session {
            kind: SessionKind::Stream,
            proto: TransportProto::Tcp,
            state: SessionState::Accepting,
            thread_index,
            opaque: 0,
            listener: None,
            addr: None,
            rx_fifo: Fifo::with_capacity(fifo_size),
            tx_fifo: Fifo::with_capacity(fifo_size),
            descheduled: false,
        };
        SessionHandle(self.sessions.insert(session))
    }

    /// Register a listening endpoint.
    pub fn listen(&mut self, addr: SocketAddr, proto: TransportProto) -> SessionHandle {
        event!(Level::DEBUG, ?addr, ?proto, "listening");

        let session = Session {
            kind: SessionKind::Listener,
            proto,
            state: SessionState::Listening,
            thread_index: 0,
            opaque: 0,
            listener: None,
            addr: Some(addr),
            rx_fifo: Fifo::with_capacity(0),
            tx_fifo: Fifo::with_capacity(0),
            descheduled: false,
        };
        SessionHandle(self.sessions.insert(session))
    }

    pub fn unlisten(&mut self, handle: SessionHandle) {
        if self.sessions.remove(handle.0).is_none() {
            event!(Level::WARN, "unlisten on unknown session");
        }
    }

    /// Start an outbound connect, returning the half-open transport session.
    pub fn connect(&mut self, addr: SocketAddr, proto: TransportProto) -> SessionHandle {
        event!(Level::DEBUG, ?addr, ?proto, "connecting");

        let session = Session {
            kind: SessionKind::Stream,
            proto,
            state: SessionState::Connecting,
            thread_index: 0,
            opaque: 0,
            listener: None,
            addr: Some(addr),
            rx_fifo: Fifo::with_capacity(0),
            tx_fifo: Fifo::with_capacity(0),
            descheduled: false,
        };
        SessionHandle(self.sessions.insert(session))
    }

    /// Transport-side disconnect; the record stays allocated until the owning
    /// protocol's cleanup runs.
    pub fn disconnect(&mut self, handle: SessionHandle) {
        match self.sessions.get_mut(handle.0) {
            Some(session) => session.state = SessionState::Closed,
            None => event!(Level::WARN, "disconnect on unknown session"),
        }
    }

    pub fn session(&self, handle: SessionHandle) -> Option<&Session> {
        self.sessions.get(handle.0)
    }

    pub fn session_mut(&mut self, handle: SessionHandle) -> Option<&mut Session> {
        self.sessions.get_mut(handle.0)
    }

    pub fn free_session(&mut self, handle: SessionHandle) {
        self.sessions.remove(handle.0);
    }

    pub fn notify(&mut self, notice: Notice) {
        self.notices.push_back(notice);
    }

    pub fn pop_notice(&mut self) -> Option<Notice> {
        self.notices.pop_front()
    }

    pub fn drain_notices(&mut self) -> Vec<Notice> {
        self.notices.drain(..).collect()
    }

    /// Program a TX io event for the scheduler to pick up.
    pub fn program_tx_event(&mut self, session: SessionHandle, flush: bool) {
        self.tx_events.push_back(TxEvent { session, flush });
    }

    pub fn pop_tx_event(&mut self) -> Option<TxEvent> {
        self.tx_events.pop_front()
    }

    /// Re-queue an RX notification for data left behind in a transport RX
    /// FIFO.
    pub fn program_rx_event(&mut self, session: SessionHandle) {
        self.rx_events.push_back(session);
    }

    pub fn pop_rx_event(&mut self) -> Option<SessionHandle> {
        self.rx_events.pop_front()
    }

    /// Remove the session from the transport pacer until rescheduled.
    pub fn deschedule(&mut self, handle: SessionHandle) {
        if let Some(session) = self.sessions.get_mut(handle.0) {
            session.descheduled = true;
        }
    }

    pub fn reschedule(&mut self, handle: SessionHandle) {
        if let Some(session) = self.sessions.get_mut(handle.0) {
            session.descheduled = false;
        }
    }

    /// Register an app-owned region for pointer-carried payloads.
    ///
    /// The returned token travels through a FIFO in place of a raw address;
    /// the region must stay registered until the peer protocol drains it.
    pub fn register_region(&mut self, data: Bytes) -> u64 {
        self.regions.insert(data).to_bits()
    }

    pub fn region(&self, token: u64) -> Option<Bytes> {
        let index = Index::from_bits(token)?;
        self.regions.get(index).cloned()
    }

    pub fn unregister_region(&mut self, token: u64) -> Option<Bytes> {
        let index = Index::from_bits(token)?;
        self.regions.remove(index)
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    #[test]
    #[traced_test]
    fn session_alloc_and_free() {
        let mut sl = SessionLayer::new();
        let h = sl.alloc_session(1, 64);
        assert_eq!(sl.session(h).unwrap().thread_index, 1);

        sl.free_session(h);
        assert!(sl.session(h).is_none());
    }

    #[test]
    fn endpoint_ext_lookup() {
        let mut ep = Endpoint::new(addr());
        assert_eq!(ep.http_ext(), None);

        ep.ext.push(ExtConfig::Http { opaque: 30 });
        ep.ext.push(ExtConfig::Crypto { ckpair_index: 7 });
        assert_eq!(ep.http_ext(), Some(30));
        assert_eq!(ep.crypto_ext(), Some(7));
    }

    #[test]
    fn region_tokens_roundtrip() {
        let mut sl = SessionLayer::new();
        let token = sl.register_region(Bytes::from_static(b"payload"));

        assert_eq!(sl.region(token).unwrap(), Bytes::from_static(b"payload"));
        assert!(sl.unregister_region(token).is_some());
        assert!(sl.region(token).is_none());
    }

    #[test]
    fn stale_region_token_rejected() {
        let mut sl = SessionLayer::new();
        let token = sl.register_region(Bytes::from_static(b"a"));
        sl.unregister_region(token);

        let other = sl.register_region(Bytes::from_static(b"b"));
        // Token reuses the slot but not the generation.
        assert_ne!(token, other);
        assert!(sl.region(token).is_none());
    }
}
