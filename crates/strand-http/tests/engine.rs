//! End-to-end exchanges through the engine and session layer: bytes in on
//! the transport side, control messages out on the app side, and back.

use anyhow::{bail, Context as _, Error};
use bytes::{Bytes, BytesMut};
use chrono::{TimeZone, Utc};
use strand::session::{Endpoint, ExtConfig, Notice, SessionHandle, SessionLayer};
use strand::Timebase;
use strand_http::{
    ConnState, DataType, HttpConfig, HttpEngine, HttpMsg, HttpState, Method, MsgData, MsgType,
    SendParams, TargetForm,
};
use tracing_test::traced_test;

const TS_FIFO_SIZE: usize = 16 << 10;

fn given_engine() -> (HttpEngine, SessionLayer) {
    let mut config = HttpConfig::default();
    config.set_fifo_size(8 << 10);

    let mut engine = HttpEngine::new(config);
    let at = Utc.with_ymd_and_hms(2024, 5, 4, 10, 0, 0).unwrap();
    engine.enable(1, Timebase::fixed(at));

    (engine, SessionLayer::new())
}

fn given_listener(engine: &mut HttpEngine, sl: &mut SessionLayer) -> Result<u32, Error> {
    let ep = Endpoint::new("127.0.0.1:8080".parse()?);
    engine.start_listen(sl, &ep, 0, Some("unit server"))
}

/// Accept a fresh transport session against the listener, returning the
/// transport and app session handles.
fn when_accepted(
    engine: &mut HttpEngine,
    sl: &mut SessionLayer,
    listener: u32,
) -> Result<(SessionHandle, SessionHandle), Error> {
    let tc_listener = engine
        .get_listener(listener)
        .context("no listener")?
        .tc_session
        .context("listener has no transport session")?;

    let ts = sl.alloc_session(0, TS_FIFO_SIZE);
    sl.session_mut(ts).context("no session")?.listener = Some(tc_listener);
    engine.ts_accept(sl, ts)?;

    let app = sl
        .drain_notices()
        .iter()
        .find_map(|n| match n {
            Notice::AppAccept { session } => Some(*session),
            _ => None,
        })
        .context("no accept notice")?;

    Ok((ts, app))
}

fn when_rx(engine: &mut HttpEngine, sl: &mut SessionLayer, ts: SessionHandle, data: &[u8]) {
    sl.session_mut(ts).unwrap().rx_fifo.enqueue(data);
    engine.ts_rx(sl, ts);
}

/// Read one control message plus its inline payload off the app RX FIFO.
fn read_app_msg(sl: &mut SessionLayer, app: SessionHandle) -> Result<(HttpMsg, Vec<u8>), Error> {
    let fifo = &mut sl.session_mut(app).context("no app session")?.rx_fifo;

    let mut hdr = [0u8; HttpMsg::SIZE];
    if fifo.dequeue(&mut hdr) != HttpMsg::SIZE {
        bail!("no control message in app rx fifo");
    }
    let msg = HttpMsg::decode(&mut &hdr[..])?;

    let mut payload = vec![0u8; msg.data.len as usize];
    if fifo.dequeue(&mut payload) != payload.len() {
        bail!("inline payload shorter than declared");
    }

    Ok((msg, payload))
}

fn enqueue_reply(sl: &mut SessionLayer, app: SessionHandle, code: u16, headers: &[u8], body: &[u8]) {
    let msg = HttpMsg::reply(
        code,
        MsgData {
            kind: DataType::Inline,
            headers_len: headers.len() as u32,
            body_len: body.len() as u64,
            ..MsgData::default()
        },
    );
    let mut hdr = BytesMut::new();
    msg.encode(&mut hdr);

    let fifo = &mut sl.session_mut(app).unwrap().tx_fifo;
    fifo.enqueue(&hdr);
    fifo.enqueue(headers);
    fifo.enqueue(body);
}

fn wire_out(sl: &mut SessionLayer, ts: SessionHandle) -> Vec<u8> {
    let fifo = &mut sl.session_mut(ts).unwrap().tx_fifo;
    let mut out = vec![0u8; fifo.max_dequeue()];
    fifo.dequeue(&mut out);
    out
}

fn conn_index(sl: &SessionLayer, app: SessionHandle) -> u32 {
    sl.session(app).unwrap().opaque
}

fn http_state(engine: &HttpEngine, sl: &SessionLayer, app: SessionHandle) -> HttpState {
    engine
        .get_connection(conn_index(sl, app), 0)
        .unwrap()
        .http_state
}

/// Connect a client and promote the half-open, returning the transport and
/// app session handles.
fn given_client(
    engine: &mut HttpEngine,
    sl: &mut SessionLayer,
) -> Result<(SessionHandle, SessionHandle), Error> {
    let ep = Endpoint::new("127.0.0.1:9000".parse()?);
    let ho = engine.connect(sl, &ep, 0, 42, Some("unit client"))?;

    let ts = sl.alloc_session(0, TS_FIFO_SIZE);
    engine.ts_connected(sl, ho, Some(ts))?;
    engine.cleanup_half_open(sl, ho);

    let app = sl
        .drain_notices()
        .iter()
        .find_map(|n| match n {
            Notice::AppConnected { session: Some(session), err: false, api_context: 42 } => {
                Some(*session)
            }
            _ => None,
        })
        .context("no connected notice")?;

    Ok((ts, app))
}

fn enqueue_request(
    sl: &mut SessionLayer,
    app: SessionHandle,
    method: Method,
    target: &[u8],
    headers: &[u8],
    body: &[u8],
) {
    let msg = HttpMsg::request(
        method,
        MsgData {
            kind: DataType::Inline,
            target_path_len: target.len() as u32,
            headers_len: headers.len() as u32,
            body_len: body.len() as u64,
            ..MsgData::default()
        },
    );
    let mut hdr = BytesMut::new();
    msg.encode(&mut hdr);

    let fifo = &mut sl.session_mut(app).unwrap().tx_fifo;
    fifo.enqueue(&hdr);
    fifo.enqueue(target);
    fifo.enqueue(headers);
    fifo.enqueue(body);
}

#[test]
#[traced_test]
fn server_get_exchange() -> Result<(), Error> {
    let (mut engine, mut sl) = given_engine();
    let listener = given_listener(&mut engine, &mut sl)?;
    let (ts, app) = when_accepted(&mut engine, &mut sl, listener)?;

    when_rx(&mut engine, &mut sl, ts, b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");

    let (msg, payload) = read_app_msg(&mut sl, app)?;
    assert_eq!(msg.kind, MsgType::Request);
    assert_eq!(msg.method, Method::Get);
    assert_eq!(msg.data.target_form, TargetForm::Origin);
    let path = &payload[msg.data.target_path_offset as usize..][..msg.data.target_path_len as usize];
    assert_eq!(path, b"hello");
    let headers = &payload[msg.data.headers_offset as usize..][..msg.data.headers_len as usize];
    assert_eq!(headers, b"Host: x\r\n");
    assert_eq!(msg.data.body_len, 0);
    assert_eq!(http_state(&engine, &sl, app), HttpState::WaitAppReply);

    enqueue_reply(&mut sl, app, 200, b"", b"OK");
    engine.custom_tx(&mut sl, app, &mut SendParams::default());

    let wire = wire_out(&mut sl, ts);
    assert_eq!(
        wire,
        b"HTTP/1.1 200 OK\r\n\
          Date: Sat, 04 May 2024 10:00:00 GMT\r\n\
          Server: unit server\r\n\
          Content-Length: 2\r\n\r\nOK"
    );
    assert_eq!(http_state(&engine, &sl, app), HttpState::WaitClientMethod);

    Ok(())
}

#[test]
#[traced_test]
fn reply_carries_app_headers_verbatim() -> Result<(), Error> {
    let (mut engine, mut sl) = given_engine();
    let listener = given_listener(&mut engine, &mut sl)?;
    let (ts, app) = when_accepted(&mut engine, &mut sl, listener)?;

    when_rx(&mut engine, &mut sl, ts, b"GET / HTTP/1.1\r\n\r\n");
    read_app_msg(&mut sl, app)?;

    enqueue_reply(&mut sl, app, 200, b"Content-Type: text/plain\r\n\r\n", b"hi");
    engine.custom_tx(&mut sl, app, &mut SendParams::default());

    let wire = wire_out(&mut sl, ts);
    let text = std::str::from_utf8(&wire)?;
    assert!(text.ends_with("Content-Length: 2\r\nContent-Type: text/plain\r\n\r\nhi"));

    Ok(())
}

#[test]
#[traced_test]
fn post_body_in_single_batch() -> Result<(), Error> {
    let (mut engine, mut sl) = given_engine();
    let listener = given_listener(&mut engine, &mut sl)?;
    let (ts, app) = when_accepted(&mut engine, &mut sl, listener)?;

    when_rx(&mut engine, &mut sl, ts, b"POST /u HTTP/1.1\r\nContent-Length: 5\r\n\r\nABCDE");

    let (msg, payload) = read_app_msg(&mut sl, app)?;
    assert_eq!(msg.method, Method::Post);
    assert_eq!(msg.data.body_len, 5);
    let body = &payload[msg.data.body_offset as usize..];
    assert_eq!(body, b"ABCDE");

    // whole body arrived at once, straight to waiting for the app's reply
    assert_eq!(http_state(&engine, &sl, app), HttpState::WaitAppReply);
    assert_eq!(engine.get_connection(conn_index(&sl, app), 0).unwrap().to_recv, 0);

    Ok(())
}

#[test]
#[traced_test]
fn post_body_across_two_batches() -> Result<(), Error> {
    let (mut engine, mut sl) = given_engine();
    let listener = given_listener(&mut engine, &mut sl)?;
    let (ts, app) = when_accepted(&mut engine, &mut sl, listener)?;

    when_rx(&mut engine, &mut sl, ts, b"POST /u HTTP/1.1\r\nContent-Length: 5\r\n\r\nAB");

    let (msg, payload) = read_app_msg(&mut sl, app)?;
    assert_eq!(msg.data.body_len, 5);
    assert_eq!(&payload[msg.data.body_offset as usize..], b"AB");
    assert_eq!(http_state(&engine, &sl, app), HttpState::ClientIoMoreData);
    assert_eq!(engine.get_connection(conn_index(&sl, app), 0).unwrap().to_recv, 3);

    when_rx(&mut engine, &mut sl, ts, b"CDE");

    let fifo = &mut sl.session_mut(app).unwrap().rx_fifo;
    let mut rest = vec![0u8; fifo.max_dequeue()];
    fifo.dequeue(&mut rest);
    assert_eq!(rest, b"CDE");
    assert_eq!(http_state(&engine, &sl, app), HttpState::WaitAppReply);
    assert_eq!(engine.get_connection(conn_index(&sl, app), 0).unwrap().to_recv, 0);

    Ok(())
}

#[test]
#[traced_test]
fn unknown_method_answered_with_501() -> Result<(), Error> {
    let (mut engine, mut sl) = given_engine();
    let listener = given_listener(&mut engine, &mut sl)?;
    let (ts, app) = when_accepted(&mut engine, &mut sl, listener)?;

    when_rx(&mut engine, &mut sl, ts, b"FOO / HTTP/1.1\r\n\r\n");

    let wire = wire_out(&mut sl, ts);
    assert!(wire.starts_with(b"HTTP/1.1 501 Not Implemented\r\n"));
    assert_eq!(
        engine.get_connection(conn_index(&sl, app), 0).unwrap().state,
        ConnState::Closed
    );
    assert!(sl
        .drain_notices()
        .contains(&Notice::TransportClosing { session: app }));

    Ok(())
}

#[test]
#[traced_test]
fn http2_answered_with_505() -> Result<(), Error> {
    let (mut engine, mut sl) = given_engine();
    let listener = given_listener(&mut engine, &mut sl)?;
    let (ts, _app) = when_accepted(&mut engine, &mut sl, listener)?;

    when_rx(&mut engine, &mut sl, ts, b"GET / HTTP/2.0\r\n\r\n");

    let wire = wire_out(&mut sl, ts);
    assert!(wire.starts_with(b"HTTP/1.1 505 HTTP Version Not Supported\r\n"));

    Ok(())
}

#[test]
#[traced_test]
fn no_pipelining_second_request_dropped() -> Result<(), Error> {
    let (mut engine, mut sl) = given_engine();
    let listener = given_listener(&mut engine, &mut sl)?;
    let (ts, app) = when_accepted(&mut engine, &mut sl, listener)?;

    when_rx(
        &mut engine,
        &mut sl,
        ts,
        b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n",
    );

    let (msg, payload) = read_app_msg(&mut sl, app)?;
    let path = &payload[msg.data.target_path_offset as usize..][..msg.data.target_path_len as usize];
    assert_eq!(path, b"a");

    // the second request never reaches the app, and the rx fifo is drained
    assert!(sl.session(app).unwrap().rx_fifo.is_empty());
    assert!(sl.session(ts).unwrap().rx_fifo.is_empty());

    Ok(())
}

#[test]
#[traced_test]
fn client_get_request_formatted() -> Result<(), Error> {
    let (mut engine, mut sl) = given_engine();
    let (ts, app) = given_client(&mut engine, &mut sl)?;

    assert_eq!(http_state(&engine, &sl, app), HttpState::WaitAppMethod);

    enqueue_request(&mut sl, app, Method::Get, b"/x", b"", b"");
    engine.custom_tx(&mut sl, app, &mut SendParams::default());

    let wire = wire_out(&mut sl, ts);
    assert_eq!(
        wire,
        b"GET /x HTTP/1.1\r\n\
          Host: 127.0.0.1:9000\r\n\
          User-Agent: unit client\r\n\r\n"
    );
    assert_eq!(http_state(&engine, &sl, app), HttpState::WaitServerReply);

    Ok(())
}

#[test]
#[traced_test]
fn client_post_streams_body() -> Result<(), Error> {
    let (mut engine, mut sl) = given_engine();
    let (ts, app) = given_client(&mut engine, &mut sl)?;

    enqueue_request(&mut sl, app, Method::Post, b"/upload", b"", b"12345");
    engine.custom_tx(&mut sl, app, &mut SendParams::default());

    let wire = wire_out(&mut sl, ts);
    let text = std::str::from_utf8(&wire)?;
    assert!(text.starts_with("POST /upload HTTP/1.1\r\n"));
    assert!(text.contains("Content-Length: 5\r\n"));
    assert!(text.ends_with("\r\n\r\n12345"));
    assert_eq!(http_state(&engine, &sl, app), HttpState::WaitServerReply);

    Ok(())
}

#[test]
#[traced_test]
fn get_with_body_is_app_violation() -> Result<(), Error> {
    let (mut engine, mut sl) = given_engine();
    let (_ts, app) = given_client(&mut engine, &mut sl)?;

    enqueue_request(&mut sl, app, Method::Get, b"/x", b"", b"oops");
    engine.custom_tx(&mut sl, app, &mut SendParams::default());

    assert_eq!(
        engine.get_connection(conn_index(&sl, app), 0).unwrap().state,
        ConnState::Closed
    );
    // the app's queue is dropped wholesale
    assert!(sl.session(app).unwrap().tx_fifo.is_empty());
    assert!(sl
        .drain_notices()
        .contains(&Notice::TransportClosing { session: app }));

    Ok(())
}

#[test]
#[traced_test]
fn reply_reparsed_by_client_round_trips() -> Result<(), Error> {
    let (mut engine, mut sl) = given_engine();

    // server side formats a reply
    let listener = given_listener(&mut engine, &mut sl)?;
    let (server_ts, server_app) = when_accepted(&mut engine, &mut sl, listener)?;
    when_rx(&mut engine, &mut sl, server_ts, b"GET / HTTP/1.1\r\n\r\n");
    read_app_msg(&mut sl, server_app)?;
    enqueue_reply(&mut sl, server_app, 200, b"", b"OK");
    engine.custom_tx(&mut sl, server_app, &mut SendParams::default());
    let wire = wire_out(&mut sl, server_ts);

    // client side sends a request, then parses that exact reply
    let (client_ts, client_app) = given_client(&mut engine, &mut sl)?;
    enqueue_request(&mut sl, client_app, Method::Get, b"/", b"", b"");
    engine.custom_tx(&mut sl, client_app, &mut SendParams::default());
    wire_out(&mut sl, client_ts);

    when_rx(&mut engine, &mut sl, client_ts, &wire);

    let (msg, payload) = read_app_msg(&mut sl, client_app)?;
    assert_eq!(msg.kind, MsgType::Reply);
    assert_eq!(msg.code, 200);
    assert_eq!(msg.data.body_len, 2);
    assert_eq!(&payload[msg.data.body_offset as usize..], b"OK");
    assert_eq!(http_state(&engine, &sl, client_app), HttpState::WaitAppMethod);

    Ok(())
}

#[test]
#[traced_test]
fn malformed_reply_resets_client() -> Result<(), Error> {
    let (mut engine, mut sl) = given_engine();
    let (ts, app) = given_client(&mut engine, &mut sl)?;

    enqueue_request(&mut sl, app, Method::Get, b"/", b"", b"");
    engine.custom_tx(&mut sl, app, &mut SendParams::default());
    wire_out(&mut sl, ts);

    when_rx(&mut engine, &mut sl, ts, b"HTTP/1.1 600 Nope\r\n\r\n");

    // no wire answer on the client path, the connection just goes down
    assert!(sl.session(ts).unwrap().tx_fifo.is_empty());
    assert_eq!(
        engine.get_connection(conn_index(&sl, app), 0).unwrap().state,
        ConnState::Closed
    );
    let notices = sl.drain_notices();
    assert!(notices.contains(&Notice::TransportClosing { session: app }));
    assert!(notices.contains(&Notice::TransportClosed { session: app }));

    Ok(())
}

#[test]
#[traced_test]
fn overlong_body_is_protocol_error() -> Result<(), Error> {
    let (mut engine, mut sl) = given_engine();
    let listener = given_listener(&mut engine, &mut sl)?;
    let (ts, app) = when_accepted(&mut engine, &mut sl, listener)?;

    when_rx(&mut engine, &mut sl, ts, b"POST /u HTTP/1.1\r\nContent-Length: 3\r\n\r\nA");
    read_app_msg(&mut sl, app)?;
    assert_eq!(engine.get_connection(conn_index(&sl, app), 0).unwrap().to_recv, 2);

    // transport produces more than the declared content length
    when_rx(&mut engine, &mut sl, ts, b"BCDE");

    assert_eq!(
        engine.get_connection(conn_index(&sl, app), 0).unwrap().state,
        ConnState::Closed
    );
    assert!(sl
        .drain_notices()
        .contains(&Notice::TransportClosing { session: app }));

    Ok(())
}

#[test]
#[traced_test]
fn region_carried_reply_body() -> Result<(), Error> {
    let (mut engine, mut sl) = given_engine();
    let listener = given_listener(&mut engine, &mut sl)?;
    let (ts, app) = when_accepted(&mut engine, &mut sl, listener)?;

    when_rx(&mut engine, &mut sl, ts, b"GET /file HTTP/1.1\r\n\r\n");
    read_app_msg(&mut sl, app)?;

    let body = Bytes::from_static(b"region-backed body");
    let token = sl.register_region(body.clone());

    let msg = HttpMsg::reply(
        200,
        MsgData {
            kind: DataType::Ptr,
            body_len: body.len() as u64,
            ..MsgData::default()
        },
    );
    let mut hdr = BytesMut::new();
    msg.encode(&mut hdr);
    {
        let fifo = &mut sl.session_mut(app).unwrap().tx_fifo;
        fifo.enqueue(&hdr);
        fifo.enqueue(&token.to_le_bytes());
    }

    engine.custom_tx(&mut sl, app, &mut SendParams::default());

    let wire = wire_out(&mut sl, ts);
    let text = std::str::from_utf8(&wire)?;
    assert!(text.contains("Content-Length: 18\r\n"));
    assert!(text.ends_with("\r\n\r\nregion-backed body"));
    assert_eq!(http_state(&engine, &sl, app), HttpState::WaitClientMethod);

    Ok(())
}

#[test]
#[traced_test]
fn near_full_transport_fifo_deschedules() -> Result<(), Error> {
    let mut config = HttpConfig::default();
    config.set_fifo_size(64 << 10);
    let mut engine = HttpEngine::new(config);
    engine.enable(1, Timebase::new());
    let mut sl = SessionLayer::new();

    let listener = given_listener(&mut engine, &mut sl)?;
    let (ts, app) = when_accepted(&mut engine, &mut sl, listener)?;

    when_rx(&mut engine, &mut sl, ts, b"GET /big HTTP/1.1\r\n\r\n");
    read_app_msg(&mut sl, app)?;

    // body larger than the 16 KiB transport fifo
    let body = vec![0x61u8; 20 << 10];
    enqueue_reply(&mut sl, app, 200, b"", &body);

    let mut sp = SendParams::default();
    engine.custom_tx(&mut sl, app, &mut sp);

    assert!(sp.descheduled);
    assert!(sl.session(app).unwrap().descheduled);
    assert_eq!(http_state(&engine, &sl, app), HttpState::AppIoMoreData);

    // the wire drains; reschedule and finish the body
    let first = wire_out(&mut sl, ts);
    assert!(sl.session_mut(ts).unwrap().tx_fifo.take_deq_notify());
    engine.ts_builtin_tx(&mut sl, ts);
    assert!(!sl.session(app).unwrap().descheduled);

    engine.custom_tx(&mut sl, app, &mut SendParams::default());
    let second = wire_out(&mut sl, ts);

    let mut wire = first;
    wire.extend_from_slice(&second);
    assert!(wire.ends_with(&body));
    assert_eq!(http_state(&engine, &sl, app), HttpState::WaitClientMethod);

    Ok(())
}

#[test]
#[traced_test]
fn full_app_rx_fifo_arms_deq_notify() -> Result<(), Error> {
    // minimum-size app fifos so the body overwhelms them
    let mut config = HttpConfig::default();
    config.set_fifo_size(1);
    let mut engine = HttpEngine::new(config);
    engine.enable(1, Timebase::new());
    let mut sl = SessionLayer::new();

    let listener = given_listener(&mut engine, &mut sl)?;
    let (ts, app) = when_accepted(&mut engine, &mut sl, listener)?;

    let body = vec![0x62u8; 8 << 10];
    let mut request = b"POST /u HTTP/1.1\r\nContent-Length: 8192\r\n\r\n".to_vec();
    request.extend_from_slice(&body);
    when_rx(&mut engine, &mut sl, ts, &request);

    let to_recv = engine.get_connection(conn_index(&sl, app), 0).unwrap().to_recv;
    assert!(to_recv > 0);
    assert_eq!(
        http_state(&engine, &sl, app),
        HttpState::ClientIoMoreData
    );

    // app has not drained its full rx fifo; the leftover body cannot move
    engine.ts_rx(&mut sl, ts);

    assert!(sl.session(app).unwrap().rx_fifo.wants_deq_notify());
    assert!(!sl.session(ts).unwrap().rx_fifo.is_empty());
    assert_eq!(
        engine.get_connection(conn_index(&sl, app), 0).unwrap().to_recv,
        to_recv
    );

    // once the app drains, streaming resumes and the exchange completes
    read_app_msg(&mut sl, app)?;
    while engine.get_connection(conn_index(&sl, app), 0).unwrap().to_recv > 0 {
        engine.ts_rx(&mut sl, ts);
        let fifo = &mut sl.session_mut(app).unwrap().rx_fifo;
        let mut chunk = vec![0u8; fifo.max_dequeue()];
        fifo.dequeue(&mut chunk);
    }
    assert_eq!(http_state(&engine, &sl, app), HttpState::WaitAppReply);

    Ok(())
}

#[test]
#[traced_test]
fn inactivity_timeout_closes_connection() -> Result<(), Error> {
    let (mut engine, mut sl) = given_engine();
    let listener = given_listener(&mut engine, &mut sl)?;
    let (_ts, app) = when_accepted(&mut engine, &mut sl, listener)?;

    engine.expire_timers(&mut sl, 59);
    assert!(sl.drain_notices().is_empty());

    engine.expire_timers(&mut sl, 60);
    assert!(sl
        .drain_notices()
        .contains(&Notice::TransportClosing { session: app }));

    let hc = engine.get_connection(conn_index(&sl, app), 0).unwrap();
    assert_eq!(hc.state, ConnState::Closed);
    assert!(hc.pending_timer);
    assert!(hc.timer.is_none());

    Ok(())
}

#[test]
#[traced_test]
fn activity_refreshes_inactivity_timer() -> Result<(), Error> {
    let (mut engine, mut sl) = given_engine();
    let listener = given_listener(&mut engine, &mut sl)?;
    let (ts, app) = when_accepted(&mut engine, &mut sl, listener)?;

    engine.expire_timers(&mut sl, 30);
    when_rx(&mut engine, &mut sl, ts, b"GET / HTTP/1.1\r\n\r\n");
    read_app_msg(&mut sl, app)?;
    sl.drain_notices();

    // old deadline passes without firing, the refreshed one holds
    engine.expire_timers(&mut sl, 89);
    assert!(sl.drain_notices().is_empty());

    engine.expire_timers(&mut sl, 90);
    assert!(sl
        .drain_notices()
        .contains(&Notice::TransportClosing { session: app }));

    Ok(())
}

#[test]
#[traced_test]
fn listen_timeout_extension_applies_to_accepted() -> Result<(), Error> {
    let (mut engine, mut sl) = given_engine();

    let mut ep = Endpoint::new("127.0.0.1:8080".parse()?);
    ep.ext.push(ExtConfig::Http { opaque: 5 });
    let listener = engine.start_listen(&mut sl, &ep, 0, None)?;
    let (_ts, app) = when_accepted(&mut engine, &mut sl, listener)?;

    assert_eq!(engine.get_connection(conn_index(&sl, app), 0).unwrap().timeout, 5);

    engine.expire_timers(&mut sl, 5);
    assert!(sl
        .drain_notices()
        .contains(&Notice::TransportClosing { session: app }));

    Ok(())
}

#[test]
#[traced_test]
fn transport_reset_notifies_app() -> Result<(), Error> {
    let (mut engine, mut sl) = given_engine();
    let listener = given_listener(&mut engine, &mut sl)?;
    let (ts, app) = when_accepted(&mut engine, &mut sl, listener)?;

    engine.ts_reset(&mut sl, ts);

    let hc = engine.get_connection(conn_index(&sl, app), 0).unwrap();
    assert_eq!(hc.state, ConnState::Closed);
    assert_eq!(hc.http_state, HttpState::WaitClientMethod);
    assert!(sl
        .drain_notices()
        .contains(&Notice::TransportReset { session: app }));

    Ok(())
}

#[test]
#[traced_test]
fn close_waits_for_app_tx_drain() -> Result<(), Error> {
    let (mut engine, mut sl) = given_engine();
    let listener = given_listener(&mut engine, &mut sl)?;
    let (ts, app) = when_accepted(&mut engine, &mut sl, listener)?;

    when_rx(&mut engine, &mut sl, ts, b"GET / HTTP/1.1\r\n\r\n");
    read_app_msg(&mut sl, app)?;

    // reply is queued but not yet flushed when the app closes
    enqueue_reply(&mut sl, app, 200, b"", b"OK");
    let hc_index = conn_index(&sl, app);
    engine.close(&mut sl, hc_index, 0);
    assert_eq!(engine.get_connection(hc_index, 0).unwrap().state, ConnState::AppClosed);

    engine.custom_tx(&mut sl, app, &mut SendParams::default());

    let wire = wire_out(&mut sl, ts);
    assert!(wire.starts_with(b"HTTP/1.1 200 OK\r\n"));
    assert_eq!(engine.get_connection(hc_index, 0).unwrap().state, ConnState::Closed);

    Ok(())
}

#[test]
#[traced_test]
fn cleanup_frees_the_connection_once() -> Result<(), Error> {
    let (mut engine, mut sl) = given_engine();
    let listener = given_listener(&mut engine, &mut sl)?;
    let (ts, app) = when_accepted(&mut engine, &mut sl, listener)?;
    let hc_index = conn_index(&sl, app);

    engine.close(&mut sl, hc_index, 0);

    // transport phase is ignored, session phase frees everything
    engine.ts_cleanup(&mut sl, ts, strand_http::CleanupKind::Transport);
    assert!(engine.get_connection(hc_index, 0).is_some());

    engine.ts_cleanup(&mut sl, ts, strand_http::CleanupKind::Session);
    assert!(engine.get_connection(hc_index, 0).is_none());
    assert!(sl.session(ts).is_none());
    assert!(sl.session(app).is_none());
    assert_eq!(engine.worker(0).unwrap().conn_count(), 0);
    assert!(sl
        .drain_notices()
        .contains(&Notice::TransportDelete { session: app }));

    Ok(())
}

#[test]
#[traced_test]
fn failed_connect_notifies_and_cleans_up() -> Result<(), Error> {
    let (mut engine, mut sl) = given_engine();

    let ep = Endpoint::new("127.0.0.1:9000".parse()?);
    let ho = engine.connect(&mut sl, &ep, 0, 7, None)?;
    assert!(engine.get_half_open(ho).is_some());

    engine.ts_connected(&mut sl, ho, None)?;
    assert!(sl.drain_notices().contains(&Notice::AppConnected {
        session: None,
        api_context: 7,
        err: true,
    }));

    engine.cleanup_half_open(&mut sl, ho);
    assert!(engine.get_half_open(ho).is_none());

    Ok(())
}

#[test]
#[traced_test]
fn connect_timeout_extension_honored() -> Result<(), Error> {
    let (mut engine, mut sl) = given_engine();

    let mut ep = Endpoint::new("127.0.0.1:9000".parse()?);
    ep.ext.push(ExtConfig::Http { opaque: 120 });
    let ho = engine.connect(&mut sl, &ep, 0, 0, None)?;

    assert_eq!(engine.get_half_open(ho).unwrap().timeout, 120);
    assert_eq!(engine.get_half_open(ho).unwrap().host, "127.0.0.1:9000");

    Ok(())
}
