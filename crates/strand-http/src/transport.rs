//! The protocol face: upward transport operations for apps and the session
//! layer's downward callbacks.

use anyhow::{ensure, Context as _, Error};
use strand::session::{
    Endpoint, Notice, SessionHandle, SessionLayer, SessionState, TransportProto,
};
use strand::Timebase;
use thunderdome::Arena;
use tracing::{event, instrument, Level};

use crate::config::HttpConfig;
use crate::conn::{unpack_timer_handle, ConnState, HttpConn, HttpState, HttpWorker, HTTP_CONN_TIMEOUT};
use crate::state::{
    disconnect_transport, notify_closed, notify_closing, run_state_machine, SendParams,
    HTTP_FIFO_THRESH,
};
use crate::status::ScTable;
use crate::timer::HttpTimers;

const DEFAULT_CLIENT_NAME: &str = "strand http client";
const DEFAULT_SERVER_NAME: &str = "strand server app";

/// Session cleanup phases; only the session phase frees protocol state.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CleanupKind {
    Transport,
    Session,
}

pub(crate) struct EngineShared {
    pub timebase: Timebase,
    pub sc_table: ScTable,
    pub config: HttpConfig,
}

/// The HTTP transport app: per-worker connection pools, process-wide
/// half-open and listener pools, timers and shared lookup state.
pub struct HttpEngine {
    workers: Vec<HttpWorker>,
    ho_pool: Arena<HttpConn>,
    listener_pool: Arena<HttpConn>,
    timers: HttpTimers,
    shared: EngineShared,
    enabled: bool,
}

impl HttpEngine {
    pub fn new(config: HttpConfig) -> Self {
        Self {
            workers: Vec::new(),
            ho_pool: Arena::new(),
            listener_pool: Arena::new(),
            timers: HttpTimers::new(0),
            shared: EngineShared {
                timebase: Timebase::new(),
                sc_table: ScTable::new(),
                config,
            },
            enabled: false,
        }
    }

    /// Attach as a transport app: per-worker pools, time base and timer
    /// wheel. Idempotent after the first success.
    #[instrument("http::enable", skip_all)]
    pub fn enable(&mut self, n_workers: usize, timebase: Timebase) {
        if self.enabled {
            return;
        }

        self.workers = (0..n_workers.max(1)).map(|_| HttpWorker::default()).collect();
        self.shared.timebase = timebase;
        self.timers = HttpTimers::new(0);
        self.enabled = true;

        event!(Level::DEBUG, n_workers, "http transport enabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn config(&self) -> &HttpConfig {
        &self.shared.config
    }

    /// Start an outbound connect; returns the half-open record index.
    #[instrument("http::connect", skip_all)]
    pub fn connect(
        &mut self,
        sl: &mut SessionLayer,
        ep: &Endpoint,
        app_wrk_index: u32,
        api_context: u32,
        app_name: Option<&str>,
    ) -> Result<u32, Error> {
        ensure!(self.enabled, "http transport not enabled");

        let index = self.ho_pool.insert(HttpConn::default());
        let slot = index.slot();

        let hc = &mut self.ho_pool[index];
        hc.hc_index = slot;
        hc.state = ConnState::Connecting;
        hc.is_server = false;
        hc.pa_wrk_index = app_wrk_index;
        hc.pa_app_api_ctx = api_context;
        hc.timeout = HTTP_CONN_TIMEOUT;
        if let Some(timeout) = ep.http_ext() {
            event!(Level::DEBUG, timeout, "app set timeout");
            hc.timeout = timeout;
        }
        hc.app_name = app_name.unwrap_or(DEFAULT_CLIENT_NAME).to_string();
        hc.host = ep.addr.to_string();

        // HTTP always rides plain TCP outbound; TLS upgrade is listen-only.
        let tc = sl.connect(ep.addr, TransportProto::Tcp);
        sl.session_mut(tc).context("lost half-open session")?.opaque = slot;
        self.ho_pool[index].tc_session = Some(tc);

        event!(Level::DEBUG, ho = slot, "half-open allocated");

        Ok(slot)
    }

    /// Bind a listener; a crypto extension upgrades the transport to TLS.
    #[instrument("http::start_listen", skip_all)]
    pub fn start_listen(
        &mut self,
        sl: &mut SessionLayer,
        ep: &Endpoint,
        app_wrk_index: u32,
        app_name: Option<&str>,
    ) -> Result<u32, Error> {
        ensure!(self.enabled, "http transport not enabled");

        let mut proto = TransportProto::Tcp;
        if ep.crypto_ext().is_some() {
            event!(Level::DEBUG, "app set tls");
            proto = TransportProto::Tls;
        }
        let tc = sl.listen(ep.addr, proto);
        let al = sl.listen(ep.addr, TransportProto::Http);

        let index = self.listener_pool.insert(HttpConn::default());
        let slot = index.slot();

        let lhc = &mut self.listener_pool[index];
        lhc.hc_index = slot;
        lhc.state = ConnState::Listen;
        lhc.is_server = true;
        lhc.pa_wrk_index = app_wrk_index;
        lhc.timeout = HTTP_CONN_TIMEOUT;
        if let Some(timeout) = ep.http_ext() {
            event!(Level::DEBUG, timeout, "app set timeout");
            lhc.timeout = timeout;
        }
        lhc.app_name = app_name.unwrap_or(DEFAULT_SERVER_NAME).to_string();
        lhc.tc_session = Some(tc);
        lhc.pa_session = Some(al);

        sl.session_mut(tc).context("lost listener session")?.opaque = slot;

        event!(Level::DEBUG, listener = slot, "listening");

        Ok(slot)
    }

    #[instrument("http::stop_listen", skip_all)]
    pub fn stop_listen(&mut self, sl: &mut SessionLayer, listener_index: u32) -> Result<(), Error> {
        let (index, _) = self
            .listener_pool
            .get_by_slot(listener_index)
            .context("unknown listener")?;
        let lhc = self
            .listener_pool
            .remove(index)
            .context("unknown listener")?;

        if let Some(tc) = lhc.tc_session {
            sl.unlisten(tc);
        }
        if let Some(al) = lhc.pa_session {
            sl.unlisten(al);
        }

        Ok(())
    }

    /// App-side close. Disconnects right away if there is nothing left to
    /// send, otherwise waits for the app TX FIFO to drain.
    #[instrument("http::close", skip_all)]
    pub fn close(&mut self, sl: &mut SessionLayer, hc_index: u32, thread_index: u8) {
        let Self { workers, .. } = self;

        let Some(hc) = workers
            .get_mut(thread_index as usize)
            .and_then(|wrk| wrk.conn_by_slot_mut(hc_index))
        else {
            event!(Level::WARN, conn = hc_index, "close on unknown connection");
            return;
        };

        event!(Level::DEBUG, thread = thread_index, conn = hc_index, "app disconnecting");

        if hc.state == ConnState::Connecting {
            hc.state = ConnState::AppClosed;
            disconnect_transport(hc, sl);
            return;
        }
        if hc.state == ConnState::Closed {
            event!(Level::DEBUG, "nothing to do, already closed");
            return;
        }

        let tx_empty = hc
            .pa_session
            .and_then(|pa| sl.session(pa))
            .map(|app| app.tx_fifo.is_empty())
            .unwrap_or(true);
        if tx_empty {
            // Nothing more to send, confirm close
            notify_closed(hc, sl);
            disconnect_transport(hc, sl);
        } else {
            // Wait for all data to be written to the transport
            hc.state = ConnState::AppClosed;
        }
    }

    /// Scheduler dispatch for app TX: run the state machine against the send
    /// budget. Returns bytes put on the wire.
    #[instrument("http::custom_tx", skip_all)]
    pub fn custom_tx(
        &mut self,
        sl: &mut SessionLayer,
        app_session: SessionHandle,
        sp: &mut SendParams,
    ) -> usize {
        let Self { workers, timers, shared, .. } = self;

        let Some((thread_index, slot)) = sl
            .session(app_session)
            .map(|s| (s.thread_index, s.opaque))
        else {
            return 0;
        };
        let Some(hc) = workers
            .get_mut(thread_index as usize)
            .and_then(|wrk| wrk.conn_by_slot_mut(slot))
        else {
            return 0;
        };

        if !tx_state_valid(hc.http_state) {
            if hc.state != ConnState::Closed {
                event!(
                    Level::WARN,
                    http_state = %hc.http_state,
                    state = ?hc.state,
                    "app tx in invalid state"
                );
            }
            if let Some(app) = sl.session_mut(app_session) {
                app.tx_fifo.dequeue_drop_all();
            }
            return 0;
        }

        let budget = sp.max_burst_size;
        run_state_machine(hc, sl, shared, timers, sp);

        if hc.state == ConnState::AppClosed {
            let tx_empty = sl
                .session(app_session)
                .map(|app| app.tx_fifo.is_empty())
                .unwrap_or(true);
            if tx_empty {
                disconnect_transport(hc, sl);
            }
        }

        budget.saturating_sub(sp.max_burst_size)
    }

    /// Transport accepted a connection on one of our listeners.
    #[instrument("http::ts_accept", skip_all)]
    pub fn ts_accept(&mut self, sl: &mut SessionLayer, ts: SessionHandle) -> Result<(), Error> {
        let Self { workers, listener_pool, timers, shared, .. } = self;

        let (thread_index, listener) = {
            let session = sl.session(ts).context("no transport session")?;
            let listener = session
                .listener
                .context("accepted session has no listener")?;
            (session.thread_index, listener)
        };
        let listener_slot = sl.session(listener).context("no listener session")?.opaque;
        let (_, lhc) = listener_pool
            .get_by_slot(listener_slot)
            .context("unknown http listener")?;
        let (timeout, app_name, pa_wrk_index, pa_listener) =
            (lhc.timeout, lhc.app_name.clone(), lhc.pa_wrk_index, lhc.pa_session);

        let wrk = workers
            .get_mut(thread_index as usize)
            .context("no such worker")?;
        let slot = wrk.conn_alloc(thread_index);

        // app session and its fifos
        let app = sl.alloc_session(thread_index, shared.config.fifo_size());
        {
            let session = sl.session_mut(app).context("lost app session")?;
            session.opaque = slot;
            session.listener = pa_listener;
            session.proto = TransportProto::Http;
            session.state = SessionState::Accepting;
        }
        {
            let session = sl.session_mut(ts).context("lost transport session")?;
            session.state = SessionState::Ready;
            session.opaque = slot;

            // Avoid tiny tx notifications: small fifos notify on empty.
            let thresh = session.tx_fifo.capacity().min(HTTP_FIFO_THRESH);
            session.tx_fifo.set_deq_thresh(thresh);
        }

        let hc = wrk.conn_by_slot_mut(slot).context("lost new connection")?;
        hc.is_server = true;
        hc.timeout = timeout;
        hc.app_name = app_name;
        hc.pa_wrk_index = pa_wrk_index;
        hc.tc_session = Some(ts);
        hc.pa_session = Some(app);
        hc.state = ConnState::Established;
        hc.state_change(HttpState::WaitClientMethod);

        event!(
            Level::DEBUG,
            listener = listener_slot,
            thread = thread_index,
            conn = slot,
            "accepted new connection"
        );

        sl.notify(Notice::AppAccept { session: app });
        timers.start(hc);

        Ok(())
    }

    /// Transport resolved an outbound connect; `None` means it failed.
    #[instrument("http::ts_connected", skip_all)]
    pub fn ts_connected(
        &mut self,
        sl: &mut SessionLayer,
        ho_index: u32,
        ts: Option<SessionHandle>,
    ) -> Result<(), Error> {
        let Self { workers, ho_pool, timers, shared, .. } = self;

        let (_, ho) = ho_pool.get_by_slot(ho_index).context("unknown half-open")?;
        debug_assert_eq!(ho.state, ConnState::Connecting);

        let Some(ts) = ts else {
            event!(Level::WARN, ho = ho_index, "connect failed");
            sl.notify(Notice::AppConnected {
                session: None,
                api_context: ho.pa_app_api_ctx,
                err: true,
            });
            return Ok(());
        };

        let thread_index = sl.session(ts).context("no transport session")?.thread_index;
        let (timeout, app_name, host, pa_wrk_index, api_context) = (
            ho.timeout,
            ho.app_name.clone(),
            ho.host.clone(),
            ho.pa_wrk_index,
            ho.pa_app_api_ctx,
        );

        let wrk = workers
            .get_mut(thread_index as usize)
            .context("no such worker")?;
        let slot = wrk.conn_alloc(thread_index);

        let app = sl.alloc_session(thread_index, shared.config.fifo_size());
        {
            let session = sl.session_mut(app).context("lost app session")?;
            session.opaque = slot;
            session.proto = TransportProto::Http;
            session.state = SessionState::Ready;
        }
        {
            let session = sl.session_mut(ts).context("lost transport session")?;
            session.state = SessionState::Ready;
            session.opaque = slot;
        }

        let hc = wrk.conn_by_slot_mut(slot).context("lost new connection")?;
        hc.is_server = false;
        hc.timeout = timeout;
        hc.app_name = app_name;
        hc.host = host;
        hc.pa_wrk_index = pa_wrk_index;
        hc.pa_app_api_ctx = api_context;
        hc.tc_session = Some(ts);
        hc.pa_session = Some(app);
        hc.state = ConnState::Established;
        hc.state_change(HttpState::WaitAppMethod);

        event!(
            Level::DEBUG,
            ho = ho_index,
            thread = thread_index,
            conn = slot,
            "half-open promoted"
        );

        sl.notify(Notice::AppConnected {
            session: Some(app),
            api_context,
            err: false,
        });
        timers.start(hc);

        Ok(())
    }

    /// Transport-side half close.
    #[instrument("http::ts_disconnect", skip_all)]
    pub fn ts_disconnect(&mut self, sl: &mut SessionLayer, ts: SessionHandle) {
        let Self { workers, .. } = self;

        let Some(hc) = conn_of(workers, sl, ts) else {
            return;
        };

        if hc.state < ConnState::TransportClosed {
            hc.state = ConnState::TransportClosed;
        }

        // Nothing more to rx, propagate to app
        let rx_empty = sl.session(ts).map(|s| s.rx_fifo.is_empty()).unwrap_or(true);
        if rx_empty {
            notify_closing(hc, sl);
        }
    }

    /// Transport reset: abandon the exchange and tell the app.
    #[instrument("http::ts_reset", skip_all)]
    pub fn ts_reset(&mut self, sl: &mut SessionLayer, ts: SessionHandle) {
        let Self { workers, .. } = self;

        let Some(hc) = conn_of(workers, sl, ts) else {
            return;
        };

        hc.state = ConnState::Closed;
        hc.tx_buf = None;
        hc.state_change(HttpState::WaitClientMethod);
        if let Some(pa) = hc.pa_session {
            sl.notify(Notice::TransportReset { session: pa });
        }

        disconnect_transport(hc, sl);
    }

    /// Transport RX: run the state machine over the new bytes.
    #[instrument("http::ts_rx", skip_all)]
    pub fn ts_rx(&mut self, sl: &mut SessionLayer, ts: SessionHandle) {
        let Self { workers, timers, shared, .. } = self;

        let Some(hc) = conn_of(workers, sl, ts) else {
            return;
        };

        if hc.state == ConnState::Closed {
            event!(Level::DEBUG, "conn closed");
            if let Some(session) = sl.session_mut(ts) {
                session.rx_fifo.dequeue_drop_all();
            }
            return;
        }
        if !rx_state_valid(hc.http_state) {
            event!(
                Level::WARN,
                http_state = %hc.http_state,
                state = ?hc.state,
                "transport rx in invalid state"
            );
            if let Some(session) = sl.session_mut(ts) {
                session.rx_fifo.dequeue_drop_all();
            }
            return;
        }

        run_state_machine(hc, sl, shared, timers, &mut SendParams::default());

        if hc.state == ConnState::TransportClosed {
            let rx_empty = sl.session(ts).map(|s| s.rx_fifo.is_empty()).unwrap_or(true);
            if rx_empty {
                notify_closing(hc, sl);
            }
        }
    }

    /// Wire drained below the deq threshold: put the session back on the
    /// pacer.
    #[instrument("http::ts_builtin_tx", skip_all)]
    pub fn ts_builtin_tx(&mut self, sl: &mut SessionLayer, ts: SessionHandle) {
        let Self { workers, .. } = self;

        let Some(hc) = conn_of(workers, sl, ts) else {
            return;
        };
        if let Some(pa) = hc.pa_session {
            sl.reschedule(pa);
        }
    }

    /// The single free path for active connections; every resource acquired
    /// at accept/connect is released here.
    #[instrument("http::ts_cleanup", skip_all)]
    pub fn ts_cleanup(&mut self, sl: &mut SessionLayer, ts: SessionHandle, kind: CleanupKind) {
        if kind == CleanupKind::Transport {
            return;
        }

        let Self { workers, timers, .. } = self;

        let Some((thread_index, slot)) = sl.session(ts).map(|s| (s.thread_index, s.opaque)) else {
            return;
        };
        let Some(wrk) = workers.get_mut(thread_index as usize) else {
            return;
        };
        let pa = {
            let Some(hc) = wrk.conn_by_slot_mut(slot) else {
                event!(Level::WARN, conn = slot, "cleanup on unknown connection");
                return;
            };
            event!(Level::DEBUG, thread = thread_index, conn = slot, "freeing connection");

            hc.rx_buf = Vec::new();
            hc.tx_buf = None;
            if !hc.pending_timer {
                timers.stop(hc);
            }
            hc.pa_session
        };

        if let Some(pa) = pa {
            sl.notify(Notice::TransportDelete { session: pa });
            sl.free_session(pa);
        }
        sl.free_session(ts);
        wrk.conn_free(slot);
    }

    /// Half-open never completed; drop its record.
    #[instrument("http::ts_ho_cleanup", skip_all)]
    pub fn ts_ho_cleanup(&mut self, sl: &mut SessionLayer, ts: SessionHandle) {
        let Some(ho_index) = sl.session(ts).map(|s| s.opaque) else {
            return;
        };
        event!(Level::DEBUG, ho = ho_index, "half-open cleanup");

        sl.notify(Notice::HalfOpenDelete { session: ts });
        if self.ho_pool.remove_by_slot(ho_index).is_none() {
            event!(Level::WARN, ho = ho_index, "unknown half-open");
        }
    }

    /// App-side teardown of a half-open, e.g. after a failed connect.
    #[instrument("http::cleanup_half_open", skip_all)]
    pub fn cleanup_half_open(&mut self, sl: &mut SessionLayer, ho_index: u32) {
        event!(Level::DEBUG, ho = ho_index, "half-open cleanup");

        let Some((_, ho)) = self.ho_pool.remove_by_slot(ho_index) else {
            event!(Level::WARN, ho = ho_index, "unknown half-open");
            return;
        };
        if let Some(tc) = ho.tc_session {
            sl.free_session(tc);
        }
    }

    /// Walk the timer wheel. Expired connections are invalidated first and
    /// acted on second, so a record freed in between is tolerated.
    pub fn expire_timers(&mut self, sl: &mut SessionLayer, now_secs: u64) {
        let Self { workers, timers, .. } = self;

        let expired = timers.advance(now_secs);

        for &handle in &expired {
            let (thread_index, slot) = unpack_timer_handle(handle);
            let Some(hc) = workers
                .get_mut(thread_index as usize)
                .and_then(|wrk| wrk.conn_by_slot_mut(slot))
            else {
                event!(Level::DEBUG, thread = thread_index, conn = slot, "already deleted");
                continue;
            };
            hc.timer = None;
            hc.pending_timer = true;
        }

        for &handle in &expired {
            let (thread_index, slot) = unpack_timer_handle(handle);
            let Some(hc) = workers
                .get_mut(thread_index as usize)
                .and_then(|wrk| wrk.conn_by_slot_mut(slot))
            else {
                continue;
            };
            if !hc.pending_timer {
                event!(Level::DEBUG, conn = slot, "timer not pending");
                continue;
            }

            event!(Level::DEBUG, thread = thread_index, conn = slot, "inactivity timeout");
            notify_closing(hc, sl);
            disconnect_transport(hc, sl);
        }
    }

    pub fn get_connection(&self, hc_index: u32, thread_index: u8) -> Option<&HttpConn> {
        self.workers
            .get(thread_index as usize)
            .and_then(|wrk| wrk.conn_by_slot(hc_index))
    }

    pub fn get_listener(&self, listener_index: u32) -> Option<&HttpConn> {
        self.listener_pool
            .get_by_slot(listener_index)
            .map(|(_, lhc)| lhc)
    }

    pub fn get_half_open(&self, ho_index: u32) -> Option<&HttpConn> {
        self.ho_pool.get_by_slot(ho_index).map(|(_, ho)| ho)
    }

    pub fn worker(&self, thread_index: u8) -> Option<&HttpWorker> {
        self.workers.get(thread_index as usize)
    }

    pub fn format_connection(&self, hc_index: u32, thread_index: u8) -> String {
        match self.get_connection(hc_index, thread_index) {
            Some(hc) => format!(
                "[{}:{}][H] app_wrk {} {:?} {}",
                hc.thread_index, hc.hc_index, hc.pa_wrk_index, hc.state, hc.http_state
            ),
            None => format!("[{}:{}][H] unknown", thread_index, hc_index),
        }
    }

    pub fn format_listener(&self, listener_index: u32) -> String {
        match self.get_listener(listener_index) {
            Some(lhc) => format!(
                "[0:{}][H] app_wrk {} {:?}",
                lhc.hc_index, lhc.pa_wrk_index, lhc.state
            ),
            None => format!("[0:{}][H] unknown", listener_index),
        }
    }

    pub fn format_half_open(&self, ho_index: u32) -> String {
        match self.get_half_open(ho_index) {
            Some(ho) => format!(
                "[0:{}][H] half-open app_wrk {} host {}",
                ho.hc_index, ho.pa_wrk_index, ho.host
            ),
            None => format!("[0:{}][H] unknown", ho_index),
        }
    }
}

fn tx_state_valid(state: HttpState) -> bool {
    matches!(
        state,
        HttpState::AppIoMoreData | HttpState::WaitAppReply | HttpState::WaitAppMethod
    )
}

fn rx_state_valid(state: HttpState) -> bool {
    matches!(
        state,
        HttpState::WaitServerReply | HttpState::ClientIoMoreData | HttpState::WaitClientMethod
    )
}

/// Resolve a transport session back to its connection record.
fn conn_of<'a>(
    workers: &'a mut [HttpWorker],
    sl: &SessionLayer,
    ts: SessionHandle,
) -> Option<&'a mut HttpConn> {
    let session = sl.session(ts)?;
    let hc = workers
        .get_mut(session.thread_index as usize)?
        .conn_by_slot_mut(session.opaque);
    if hc.is_none() {
        event!(Level::WARN, opaque = session.opaque, "no connection for transport session");
    }
    hc
}
