//! Per-connection state machine.
//!
//! Six handlers, one per non-idle protocol state. The driver loops while a
//! handler asks to continue, refreshes the inactivity timer on a clean stop,
//! and skips the refresh when a handler errors out. Handlers run to
//! completion; waiting is expressed by returning `Stop` until the next RX/TX
//! event or timer tick.

use bytes::{BufMut, BytesMut};
use strand::session::{Notice, SessionHandle, SessionLayer};
use tracing::{event, Level};

use crate::buffer::HttpBuffer;
use crate::conn::{ConnState, HttpConn, HttpState};
use crate::message::{DataType, HttpMsg, Method, MsgData, MsgType, TargetForm};
use crate::parse;
use crate::status::StatusCode;
use crate::timer::HttpTimers;
use crate::transport::EngineShared;

/// Deschedule when transport TX free space drops under this.
pub(crate) const HTTP_FIFO_THRESH: usize = 16 << 10;

/// Upper bound on a single send burst.
const MAX_BURST: usize = 64 << 10;

/// Send budget and pacer feedback for one custom-tx dispatch.
pub struct SendParams {
    pub max_burst_size: usize,
    pub bytes_dequeued: usize,
    pub descheduled: bool,
}

impl SendParams {
    pub fn new(max_burst_size: usize) -> Self {
        Self { max_burst_size, bytes_dequeued: 0, descheduled: false }
    }
}

impl Default for SendParams {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum SmResult {
    Stop,
    Continue,
    Error,
}

/// Run handlers until one stops or errors. A clean pass refreshes the
/// inactivity timer; an error leaves it alone.
pub(crate) fn run_state_machine(
    hc: &mut HttpConn,
    sl: &mut SessionLayer,
    shared: &EngineShared,
    timers: &mut HttpTimers,
    sp: &mut SendParams,
) {
    loop {
        let result = match hc.http_state {
            HttpState::Idle => {
                event!(Level::WARN, "state machine dispatched while idle");
                return;
            }
            HttpState::WaitAppMethod => state_wait_app_method(hc, sl, sp),
            HttpState::WaitClientMethod => state_wait_client_method(hc, sl, shared),
            HttpState::WaitServerReply => state_wait_server_reply(hc, sl, shared),
            HttpState::WaitAppReply => state_wait_app_reply(hc, sl, shared, sp),
            HttpState::ClientIoMoreData => state_client_io_more_data(hc, sl),
            HttpState::AppIoMoreData => state_app_io_more_data(hc, sl, sp),
        };

        match result {
            SmResult::Continue => continue,
            SmResult::Stop => break,
            SmResult::Error => {
                event!(Level::DEBUG, "error in state machine");
                return;
            }
        }
    }

    timers.update(hc);
}

/// Server: parse a request off the transport and hand it to the app.
fn state_wait_client_method(
    hc: &mut HttpConn,
    sl: &mut SessionLayer,
    shared: &EngineShared,
) -> SmResult {
    if read_message(hc, sl).is_err() {
        return SmResult::Stop;
    }

    let (method, form) = match parse_request(&hc.rx_buf, &mut hc.cursor) {
        Ok(v) => v,
        Err(e) => return client_error(hc, sl, shared, e.status()),
    };
    hc.method = method;
    hc.target_form = form;

    let Some(pa) = hc.pa_session else {
        event!(Level::WARN, "no app session");
        return client_error(hc, sl, shared, StatusCode::InternalError);
    };

    // Hand over at least the control data; body bytes ride along as far as
    // they fit. Never dequeue past this message, there is no pipelining.
    let cur = hc.cursor;
    let max_deq = (cur.control_data_len as u64 + cur.body_len).min(hc.rx_buf.len() as u64);
    let len = {
        let Some(app) = sl.session_mut(pa) else {
            return client_error(hc, sl, shared, StatusCode::InternalError);
        };
        let max_enq = app.rx_fifo.max_enqueue();
        if max_enq < HttpMsg::SIZE + cur.control_data_len as usize {
            event!(Level::WARN, "not enough room for control data in app rx fifo");
            return client_error(hc, sl, shared, StatusCode::InternalError);
        }
        let len = ((max_enq - HttpMsg::SIZE) as u64).min(max_deq) as usize;

        let msg = HttpMsg::request(
            method,
            MsgData {
                kind: DataType::Inline,
                len: len as u64,
                target_form: form,
                target_path_offset: cur.target_path_offset,
                target_path_len: cur.target_path_len,
                target_query_offset: cur.target_query_offset,
                target_query_len: cur.target_query_len,
                headers_offset: cur.headers_offset,
                headers_len: cur.headers_len,
                body_offset: cur.body_offset,
                body_len: cur.body_len,
            },
        );
        let mut hdr = BytesMut::with_capacity(HttpMsg::SIZE);
        msg.encode(&mut hdr);

        if app.rx_fifo.enqueue_segments(&[&hdr, &hc.rx_buf[..len]], false).is_err() {
            event!(Level::WARN, "control message enqueue failed");
            return client_error(hc, sl, shared, StatusCode::InternalError);
        }
        len
    };

    let body_sent = len as u64 - cur.control_data_len as u64;
    hc.to_recv = cur.body_len - body_sent;
    if hc.to_recv == 0 {
        // drop everything, there is no pipelining
        read_message_drop_all(hc, sl);
        hc.state_change(HttpState::WaitAppReply);
    } else {
        read_message_drop(hc, sl, len);
        // stream the rest of the request body
        hc.state_change(HttpState::ClientIoMoreData);
    }

    sl.notify(Notice::AppRxNotify { session: pa });

    SmResult::Stop
}

/// Client: parse a status line off the transport and hand it to the app.
fn state_wait_server_reply(
    hc: &mut HttpConn,
    sl: &mut SessionLayer,
    shared: &EngineShared,
) -> SmResult {
    if read_message(hc, sl).is_err() {
        return SmResult::Stop;
    }

    let status = match parse_response(&hc.rx_buf, &mut hc.cursor) {
        Ok(v) => v,
        Err(_) => return client_reset(hc, sl),
    };
    hc.status_code = status;

    let Some(pa) = hc.pa_session else {
        event!(Level::WARN, "no app session");
        return client_reset(hc, sl);
    };

    let cur = hc.cursor;
    let max_deq = (cur.control_data_len as u64 + cur.body_len).min(hc.rx_buf.len() as u64);
    let len = {
        let Some(app) = sl.session_mut(pa) else {
            return client_reset(hc, sl);
        };
        let max_enq = app.rx_fifo.max_enqueue();
        if max_enq < HttpMsg::SIZE + cur.control_data_len as usize {
            event!(Level::WARN, "not enough room for control data in app rx fifo");
            return client_reset(hc, sl);
        }
        let len = ((max_enq - HttpMsg::SIZE) as u64).min(max_deq) as usize;

        let msg = HttpMsg::reply(
            shared.sc_table.lookup(status).code(),
            MsgData {
                kind: DataType::Inline,
                len: len as u64,
                headers_offset: cur.headers_offset,
                headers_len: cur.headers_len,
                body_offset: cur.body_offset,
                body_len: cur.body_len,
                ..MsgData::default()
            },
        );
        let mut hdr = BytesMut::with_capacity(HttpMsg::SIZE);
        msg.encode(&mut hdr);

        if app.rx_fifo.enqueue_segments(&[&hdr, &hc.rx_buf[..len]], false).is_err() {
            event!(Level::WARN, "control message enqueue failed");
            return client_reset(hc, sl);
        }
        len
    };

    read_message_drop(hc, sl, len);

    let body_sent = len as u64 - cur.control_data_len as u64;
    let Some(to_recv) = cur.body_len.checked_sub(body_sent) else {
        event!(Level::WARN, "received more data than declared content length");
        return client_reset(hc, sl);
    };
    hc.to_recv = to_recv;
    if hc.to_recv == 0 {
        // all handed over, exchange done
        hc.state_change(HttpState::WaitAppMethod);
    } else {
        // stream the rest of the response body
        hc.state_change(HttpState::ClientIoMoreData);
    }

    sl.notify(Notice::AppRxNotify { session: pa });

    SmResult::Stop
}

/// Server: format the app's reply header and put it on the wire.
fn state_wait_app_reply(
    hc: &mut HttpConn,
    sl: &mut SessionLayer,
    shared: &EngineShared,
    sp: &mut SendParams,
) -> SmResult {
    let Some(pa) = hc.pa_session else {
        event!(Level::WARN, "no app session");
        return SmResult::Error;
    };

    let Some(msg) = dequeue_msg(sl, pa) else {
        return app_reply_error(hc, sl, shared, StatusCode::InternalError);
    };
    if msg.kind != MsgType::Reply {
        event!(Level::WARN, kind = ?msg.kind, "unexpected message type");
        return app_reply_error(hc, sl, shared, StatusCode::InternalError);
    }
    let Some(code) = StatusCode::from_u16(msg.code) else {
        event!(Level::WARN, code = msg.code, "unsupported status code");
        return SmResult::Error;
    };

    // Protocol-layer headers first: status line, date, server identity and
    // body length. App headers, if any, follow verbatim and carry their own
    // terminating CRLF.
    let mut response = BytesMut::new();
    response.put_slice(b"HTTP/1.1 ");
    response.put_slice(code.as_str().as_bytes());
    response.put_slice(b"\r\nDate: ");
    response.put_slice(format_date(shared).as_bytes());
    response.put_slice(b"\r\nServer: ");
    response.put_slice(hc.app_name.as_bytes());
    response.put_slice(b"\r\nContent-Length: ");
    response.put_slice(msg.data.body_len.to_string().as_bytes());
    response.put_slice(b"\r\n");
    if msg.data.headers_len == 0 {
        response.put_slice(b"\r\n");
    } else if append_app_headers(sl, pa, &msg, &mut response).is_err() {
        return app_reply_error(hc, sl, shared, StatusCode::InternalError);
    }

    let sent = send_data(hc, sl, &response);
    if sent != response.len() {
        event!(Level::WARN, "sending status line and headers failed");
        return app_reply_error(hc, sl, shared, StatusCode::InternalError);
    }

    let result = if msg.data.body_len > 0 {
        let Some(buf) = init_tx_buffer(sl, pa, &msg) else {
            return app_reply_error(hc, sl, shared, StatusCode::InternalError);
        };
        hc.tx_buf = Some(buf);
        hc.state_change(HttpState::AppIoMoreData);
        SmResult::Continue
    } else {
        // no response body, exchange done
        hc.state_change(HttpState::WaitClientMethod);
        SmResult::Stop
    };

    sp.max_burst_size = sp.max_burst_size.saturating_sub(sent);
    result
}

/// Client: format the app's request header and put it on the wire.
fn state_wait_app_method(hc: &mut HttpConn, sl: &mut SessionLayer, sp: &mut SendParams) -> SmResult {
    let Some(pa) = hc.pa_session else {
        event!(Level::WARN, "no app session");
        return SmResult::Error;
    };

    let Some(msg) = dequeue_msg(sl, pa) else {
        return app_method_error(hc, sl);
    };
    if msg.kind != MsgType::Request {
        event!(Level::WARN, kind = ?msg.kind, "unexpected message type");
        return app_method_error(hc, sl);
    }

    // request target
    let target = match msg.data.kind {
        DataType::Ptr => {
            let Some(token) = dequeue_u64(sl, pa) else {
                return app_method_error(hc, sl);
            };
            let Some(region) = sl.region(token) else {
                event!(Level::WARN, token, "unknown target region");
                return app_method_error(hc, sl);
            };
            region.to_vec()
        }
        DataType::Inline => {
            let mut target = vec![0u8; msg.data.target_path_len as usize];
            let n = match sl.session_mut(pa) {
                Some(app) => app.tx_fifo.dequeue(&mut target),
                None => 0,
            };
            if n != target.len() {
                event!(Level::WARN, "short read of request target");
                return app_method_error(hc, sl);
            }
            target
        }
    };

    let mut request = BytesMut::new();
    let (next_state, result) = match msg.method {
        Method::Get => {
            if msg.data.body_len > 0 {
                event!(Level::WARN, "get request should not include a body");
                return app_method_error(hc, sl);
            }
            request.put_slice(b"GET ");
            request.put_slice(&target);
            request.put_slice(b" HTTP/1.1\r\nHost: ");
            request.put_slice(hc.host.as_bytes());
            request.put_slice(b"\r\nUser-Agent: ");
            request.put_slice(hc.app_name.as_bytes());
            request.put_slice(b"\r\n");

            (HttpState::WaitServerReply, SmResult::Stop)
        }
        Method::Post => {
            if msg.data.body_len == 0 {
                event!(Level::WARN, "post request should include a body");
                return app_method_error(hc, sl);
            }
            request.put_slice(b"POST ");
            request.put_slice(&target);
            request.put_slice(b" HTTP/1.1\r\nHost: ");
            request.put_slice(hc.host.as_bytes());
            request.put_slice(b"\r\nUser-Agent: ");
            request.put_slice(hc.app_name.as_bytes());
            request.put_slice(b"\r\nContent-Length: ");
            request.put_slice(msg.data.body_len.to_string().as_bytes());
            request.put_slice(b"\r\n");

            let Some(buf) = init_tx_buffer(sl, pa, &msg) else {
                return app_method_error(hc, sl);
            };
            hc.tx_buf = Some(buf);

            (HttpState::AppIoMoreData, SmResult::Continue)
        }
    };

    if msg.data.headers_len == 0 {
        request.put_slice(b"\r\n");
    } else if append_app_headers(sl, pa, &msg, &mut request).is_err() {
        return app_method_error(hc, sl);
    }

    let sent = send_data(hc, sl, &request);
    if sent != request.len() {
        event!(Level::WARN, "sending request line and headers failed");
        return app_method_error(hc, sl);
    }

    hc.state_change(next_state);
    sp.max_burst_size = sp.max_burst_size.saturating_sub(sent);
    result
}

/// Either role: stream remaining body bytes transport to app.
fn state_client_io_more_data(hc: &mut HttpConn, sl: &mut SessionLayer) -> SmResult {
    let (Some(tc), Some(pa)) = (hc.tc_session, hc.pa_session) else {
        event!(Level::WARN, "sessions gone");
        return SmResult::Error;
    };

    let max_deq = match sl.session(tc) {
        Some(ts) => ts.rx_fifo.max_dequeue(),
        None => return SmResult::Error,
    };
    if max_deq == 0 {
        return SmResult::Stop;
    }

    let max_enq = {
        let Some(app) = sl.session_mut(pa) else {
            return SmResult::Error;
        };
        let max_enq = app.rx_fifo.max_enqueue();
        if max_enq == 0 {
            // resume once the app drains
            app.rx_fifo.arm_deq_notify();
            return SmResult::Stop;
        }
        max_enq
    };

    let max_len = max_enq.min(max_deq);
    hc.rx_buf.resize(max_len, 0);
    if let Some(ts) = sl.session(tc) {
        ts.rx_fifo.peek(0, &mut hc.rx_buf);
    }
    let sent = match sl.session_mut(pa) {
        Some(app) => app.rx_fifo.enqueue(&hc.rx_buf[..max_len]),
        None => 0,
    };
    if let Some(ts) = sl.session_mut(tc) {
        ts.rx_fifo.dequeue_drop(sent);
    }
    hc.rx_buf.clear();

    if sent as u64 > hc.to_recv {
        event!(Level::WARN, "received more data than expected");
        notify_closing(hc, sl);
        disconnect_transport(hc, sl);
        hc.state_change(HttpState::WaitAppMethod);
        return SmResult::Error;
    }
    hc.to_recv -= sent as u64;
    event!(Level::DEBUG, drained = sent, remaining = hc.to_recv, "streamed body bytes");

    // Finished exchange: server turns around to reply, client is done.
    if hc.to_recv == 0 {
        hc.state_change(if hc.is_server {
            HttpState::WaitAppReply
        } else {
            HttpState::WaitAppMethod
        });
    }

    sl.notify(Notice::AppRxNotify { session: pa });

    let leftover = sl.session(tc).map(|ts| ts.rx_fifo.max_dequeue()).unwrap_or(0);
    if leftover > 0 {
        sl.program_rx_event(tc);
    }

    SmResult::Stop
}

/// Either role: stream the outbound body app to transport, bounded bursts.
fn state_app_io_more_data(hc: &mut HttpConn, sl: &mut SessionLayer, sp: &mut SendParams) -> SmResult {
    let (Some(tc), Some(pa)) = (hc.tc_session, hc.pa_session) else {
        event!(Level::WARN, "sessions gone");
        return SmResult::Error;
    };
    if hc.tx_buf.is_none() {
        event!(Level::WARN, "no tx buffer");
        return SmResult::Error;
    }

    let max_send = MAX_BURST.min(sp.max_burst_size);
    let sent = match hc.tx_buf.as_ref() {
        Some(HttpBuffer::Fifo { remaining }) => {
            let avail = {
                let Some(app) = sl.session(pa) else { return SmResult::Error };
                (max_send as u64).min(*remaining).min(app.tx_fifo.max_dequeue() as u64) as usize
            };
            if avail == 0 {
                0
            } else {
                let mut chunk = vec![0u8; avail];
                if let Some(app) = sl.session(pa) {
                    app.tx_fifo.peek(0, &mut chunk);
                }
                let sent = match sl.session_mut(tc) {
                    Some(ts) => ts.tx_fifo.enqueue(&chunk),
                    None => 0,
                };
                if let Some(app) = sl.session_mut(pa) {
                    app.tx_fifo.dequeue_drop(sent);
                }
                sent
            }
        }
        Some(HttpBuffer::Region { .. }) => {
            let chunk = match hc.tx_buf.as_ref() {
                Some(buf) => buf.region_chunk(max_send),
                None => &[],
            };
            if chunk.is_empty() {
                0
            } else {
                match sl.session_mut(tc) {
                    Some(ts) => ts.tx_fifo.enqueue(chunk),
                    None => 0,
                }
            }
        }
        None => 0,
    };

    if sent > 0 {
        if let Some(buf) = hc.tx_buf.as_mut() {
            sp.bytes_dequeued += buf.drain(sent);
        }
        sp.max_burst_size = sp.max_burst_size.saturating_sub(sent);
    }

    let drained = hc.tx_buf.as_ref().is_some_and(|buf| buf.is_drained());
    if !drained {
        if sent > 0 && sl.session_mut(tc).is_some_and(|ts| ts.tx_fifo.set_event()) {
            sl.program_tx_event(tc, false);
        }

        // Near-full transport fifo: park until the wire drains.
        let free = sl.session(tc).map(|ts| ts.tx_fifo.max_enqueue()).unwrap_or(0);
        if free < HTTP_FIFO_THRESH {
            if let Some(ts) = sl.session_mut(tc) {
                ts.tx_fifo.arm_deq_notify();
            }
            sl.deschedule(pa);
            sp.descheduled = true;
        }
    } else {
        if sent > 0 && sl.session_mut(tc).is_some_and(|ts| ts.tx_fifo.set_event()) {
            sl.program_tx_event(tc, true);
        }

        // Finished exchange: server waits for the next request, client for
        // the reply.
        hc.state_change(if hc.is_server {
            HttpState::WaitClientMethod
        } else {
            HttpState::WaitServerReply
        });
        hc.tx_buf = None;
    }

    SmResult::Stop
}

fn parse_request(
    buf: &[u8],
    cur: &mut parse::MsgCursor,
) -> Result<(Method, TargetForm), parse::RequestError> {
    if buf.len() < 8 {
        return Err(parse::RequestError::BadRequest);
    }
    let (method, form) = parse::parse_request_line(buf, cur)?;
    parse::identify_headers(buf, cur)?;
    parse::identify_message_body(buf, cur)?;
    Ok((method, form))
}

fn parse_response(buf: &[u8], cur: &mut parse::MsgCursor) -> Result<u16, parse::ResponseError> {
    if buf.len() < 8 {
        return Err(parse::ResponseError);
    }
    let status = parse::parse_status_line(buf, cur)?;
    parse::identify_headers(buf, cur).map_err(|_| parse::ResponseError)?;
    parse::identify_message_body(buf, cur).map_err(|_| parse::ResponseError)?;
    Ok(status)
}

/// Peek everything the transport has into the RX scratch buffer.
fn read_message(hc: &mut HttpConn, sl: &SessionLayer) -> Result<(), ()> {
    let Some(ts) = hc.tc_session.and_then(|h| sl.session(h)) else {
        return Err(());
    };
    let max_deq = ts.rx_fifo.max_dequeue();
    if max_deq == 0 {
        return Err(());
    }

    hc.rx_buf.resize(max_deq, 0);
    let n = ts.rx_fifo.peek(0, &mut hc.rx_buf);
    debug_assert_eq!(n, max_deq);
    event!(Level::TRACE, bytes = n, "read from transport rx fifo");

    Ok(())
}

fn read_message_drop(hc: &mut HttpConn, sl: &mut SessionLayer, len: usize) {
    if let Some(ts) = hc.tc_session.and_then(|h| sl.session_mut(h)) {
        ts.rx_fifo.dequeue_drop(len);
        if ts.rx_fifo.is_empty() {
            ts.rx_fifo.unset_event();
        }
    }
    hc.rx_buf.clear();
}

fn read_message_drop_all(hc: &mut HttpConn, sl: &mut SessionLayer) {
    if let Some(ts) = hc.tc_session.and_then(|h| sl.session_mut(h)) {
        ts.rx_fifo.dequeue_drop_all();
        ts.rx_fifo.unset_event();
    }
    hc.rx_buf.clear();
}

/// Enqueue wire bytes on the transport TX FIFO, one bounded burst.
fn send_data(hc: &HttpConn, sl: &mut SessionLayer, data: &[u8]) -> usize {
    let Some(tc) = hc.tc_session else {
        return 0;
    };

    let (sent, notify) = match sl.session_mut(tc) {
        Some(ts) => {
            let to_send = data.len().min(MAX_BURST);
            let sent = ts.tx_fifo.enqueue(&data[..to_send]);
            if sent == 0 {
                event!(Level::WARN, "transport tx fifo enqueue failed");
                return 0;
            }
            (sent, ts.tx_fifo.set_event())
        }
        None => return 0,
    };

    if notify {
        sl.program_tx_event(tc, false);
    }

    sent
}

/// Canned error response, then the caller closes.
fn send_error(hc: &HttpConn, sl: &mut SessionLayer, shared: &EngineShared, status: StatusCode) {
    let data = format!(
        "HTTP/1.1 {}\r\nDate: {}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
        status.as_str(),
        format_date(shared),
    );
    send_data(hc, sl, data.as_bytes());
}

fn format_date(shared: &EngineShared) -> String {
    format!("{} GMT", shared.timebase.now().format("%a, %d %b %Y %H:%M:%S"))
}

pub(crate) fn notify_closing(hc: &HttpConn, sl: &mut SessionLayer) {
    if let Some(pa) = hc.pa_session {
        sl.notify(Notice::TransportClosing { session: pa });
    }
}

pub(crate) fn notify_closed(hc: &HttpConn, sl: &mut SessionLayer) {
    if let Some(pa) = hc.pa_session {
        sl.notify(Notice::TransportClosed { session: pa });
    }
}

/// Tear down the transport side; the record itself is freed only in the
/// cleanup callback.
pub(crate) fn disconnect_transport(hc: &mut HttpConn, sl: &mut SessionLayer) {
    hc.state = ConnState::Closed;
    if let Some(tc) = hc.tc_session {
        sl.disconnect(tc);
    }
}

/// Server-side request failure: canned wire error, then close.
fn client_error(
    hc: &mut HttpConn,
    sl: &mut SessionLayer,
    shared: &EngineShared,
    status: StatusCode,
) -> SmResult {
    read_message_drop_all(hc, sl);
    send_error(hc, sl, shared, status);
    notify_closing(hc, sl);
    disconnect_transport(hc, sl);
    SmResult::Error
}

/// Client-side response failure: nothing to answer with, reset.
fn client_reset(hc: &mut HttpConn, sl: &mut SessionLayer) -> SmResult {
    read_message_drop_all(hc, sl);
    notify_closing(hc, sl);
    notify_closed(hc, sl);
    disconnect_transport(hc, sl);
    SmResult::Error
}

/// Server-side app violation while replying: answer the peer, then close.
fn app_reply_error(
    hc: &mut HttpConn,
    sl: &mut SessionLayer,
    shared: &EngineShared,
    status: StatusCode,
) -> SmResult {
    send_error(hc, sl, shared, status);
    hc.state_change(HttpState::WaitClientMethod);
    notify_closing(hc, sl);
    disconnect_transport(hc, sl);
    SmResult::Stop
}

/// Client-side app violation: drop the app's queue wholesale and close.
fn app_method_error(hc: &mut HttpConn, sl: &mut SessionLayer) -> SmResult {
    if let Some(app) = hc.pa_session.and_then(|h| sl.session_mut(h)) {
        app.tx_fifo.dequeue_drop_all();
    }
    notify_closing(hc, sl);
    notify_closed(hc, sl);
    disconnect_transport(hc, sl);
    SmResult::Error
}

/// Dequeue and decode one control-message header from the app TX FIFO.
fn dequeue_msg(sl: &mut SessionLayer, pa: SessionHandle) -> Option<HttpMsg> {
    let mut hdr = [0u8; HttpMsg::SIZE];
    let n = sl.session_mut(pa)?.tx_fifo.dequeue(&mut hdr);
    if n != HttpMsg::SIZE {
        event!(Level::WARN, read = n, "short control message");
        return None;
    }

    match HttpMsg::decode(&mut &hdr[..]) {
        Ok(msg) => Some(msg),
        Err(e) => {
            event!(Level::WARN, error = %e, "bad control message");
            None
        }
    }
}

fn dequeue_u64(sl: &mut SessionLayer, pa: SessionHandle) -> Option<u64> {
    let mut bytes = [0u8; 8];
    let n = sl.session_mut(pa)?.tx_fifo.dequeue(&mut bytes);
    if n != bytes.len() {
        event!(Level::WARN, read = n, "short region token");
        return None;
    }
    Some(u64::from_le_bytes(bytes))
}

/// App headers follow the control message, inline or by region token, and
/// carry their own terminating CRLF.
fn append_app_headers(
    sl: &mut SessionLayer,
    pa: SessionHandle,
    msg: &HttpMsg,
    out: &mut BytesMut,
) -> Result<(), ()> {
    let len = msg.data.headers_len as usize;
    event!(Level::DEBUG, len, "headers from app");

    match msg.data.kind {
        DataType::Ptr => {
            let token = dequeue_u64(sl, pa).ok_or(())?;
            let Some(region) = sl.region(token) else {
                event!(Level::WARN, token, "unknown headers region");
                return Err(());
            };
            if region.len() < len {
                event!(Level::WARN, "headers region shorter than declared");
                return Err(());
            }
            out.put_slice(&region[..len]);
        }
        DataType::Inline => {
            let mut headers = vec![0u8; len];
            let n = match sl.session_mut(pa) {
                Some(app) => app.tx_fifo.dequeue(&mut headers),
                None => 0,
            };
            if n != len {
                event!(Level::WARN, read = n, "short read of app headers");
                return Err(());
            }
            out.put_slice(&headers);
        }
    }

    Ok(())
}

/// Set up body streaming for app-io-more-data. A region-carried body means
/// one more token to resolve.
fn init_tx_buffer(sl: &mut SessionLayer, pa: SessionHandle, msg: &HttpMsg) -> Option<HttpBuffer> {
    match msg.data.kind {
        DataType::Inline => Some(HttpBuffer::fifo(msg.data.body_len)),
        DataType::Ptr => {
            let token = dequeue_u64(sl, pa)?;
            let Some(region) = sl.region(token) else {
                event!(Level::WARN, token, "unknown body region");
                return None;
            };
            Some(HttpBuffer::region(region, msg.data.body_len))
        }
    }
}
