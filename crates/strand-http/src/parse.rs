//! HTTP/1.1 wire parser.
//!
//! Pure functions over the connection's RX scratch buffer. Nothing here
//! copies message bytes: parsing produces offsets and lengths into the
//! buffer, recorded in a [`MsgCursor`]. Functions are idempotent on the same
//! buffer contents.
//!
//! Request parsing reports failures as the status code the server should
//! answer with; response parsing reports an opaque error, since the only
//! remedy on the client side is a reset.

use thiserror::Error;
use tracing::{event, Level};

use crate::message::{Method, TargetForm};
use crate::status::StatusCode;

/// Offsets and lengths of one parsed message within the RX buffer.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct MsgCursor {
    /// Bytes of request/status line plus header block, including the final
    /// CRLF terminator.
    pub control_data_len: u32,
    /// Scan position, one past the last fully parsed line.
    pub rx_buf_offset: u32,
    pub target_path_offset: u32,
    pub target_path_len: u32,
    pub target_query_offset: u32,
    pub target_query_len: u32,
    pub headers_offset: u32,
    pub headers_len: u32,
    pub body_offset: u32,
    pub body_len: u64,
}

/// Request parse failure, carrying the canned response to emit.
#[derive(Error, Clone, Copy, PartialEq, Eq, Debug)]
pub enum RequestError {
    #[error("malformed request")]
    BadRequest,
    #[error("method not implemented")]
    NotImplemented,
    #[error("http version not supported")]
    VersionNotSupported,
}

impl RequestError {
    pub fn status(&self) -> StatusCode {
        match self {
            RequestError::BadRequest => StatusCode::BadRequest,
            RequestError::NotImplemented => StatusCode::NotImplemented,
            RequestError::VersionNotSupported => StatusCode::HttpVersionNotSupported,
        }
    }
}

/// Response parse failure; the connection gets reset, no code to report.
#[derive(Error, Clone, Copy, PartialEq, Eq, Debug)]
#[error("malformed response")]
pub struct ResponseError;

/// Find `needle` in `buf` starting at `offset`.
///
/// With `num` non-zero the search window is limited to `num` bytes; the
/// needle must lie wholly inside the buffer either way.
fn find(buf: &[u8], offset: usize, num: usize, needle: &[u8]) -> Option<usize> {
    let slen = needle.len();
    if buf.len() <= slen || offset > buf.len() {
        return None;
    }

    let mut end = buf.len();
    if num != 0 {
        if num < slen {
            return None;
        }
        end = end.min(offset + num);
    }

    buf[offset..end]
        .windows(slen)
        .position(|w| w == needle)
        .map(|i| i + offset)
}

/// ASCII-case-insensitive variant, for header field names.
fn find_token(buf: &[u8], offset: usize, num: usize, needle: &[u8]) -> Option<usize> {
    let slen = needle.len();
    if buf.len() <= slen || offset > buf.len() {
        return None;
    }

    let mut end = buf.len();
    if num != 0 {
        if num < slen {
            return None;
        }
        end = end.min(offset + num);
    }

    buf[offset..end]
        .windows(slen)
        .position(|w| w.eq_ignore_ascii_case(needle))
        .map(|i| i + offset)
}

/// Split an optional `?query` off the recorded target range.
fn identify_optional_query(buf: &[u8], cur: &mut MsgCursor) {
    let start = cur.target_path_offset as usize;
    let end = start + cur.target_path_len as usize;
    for i in start..end {
        if buf[i] == b'?' {
            cur.target_query_offset = (i + 1) as u32;
            cur.target_query_len = (end - (i + 1)) as u32;
            cur.target_path_len -= cur.target_query_len + 1;
            break;
        }
    }
}

/// Classify the request-target; RFC 9112 §3.2 forms, checked in order.
fn target_form(buf: &[u8], cur: &mut MsgCursor) -> Option<TargetForm> {
    let start = cur.target_path_offset as usize;
    let len = cur.target_path_len as usize;

    // "*"
    if buf[start] == b'*' && len == 1 {
        return Some(TargetForm::Asterisk);
    }

    // 1*( "/" segment ) [ "?" query ]
    if buf[start] == b'/' {
        // drop leading slash
        cur.target_path_offset += 1;
        cur.target_path_len -= 1;
        identify_optional_query(buf, cur);
        return Some(TargetForm::Origin);
    }

    // scheme "://" host [ ":" port ] *( "/" segment ) [ "?" query ]
    if find(buf, start, len, b"://").is_some() {
        identify_optional_query(buf, cur);
        return Some(TargetForm::Absolute);
    }

    // host ":" port
    for i in start..start + len {
        if buf[i] == b':' && buf.get(i + 1).is_some_and(|b| b.is_ascii_digit()) {
            return Some(TargetForm::Authority);
        }
    }

    None
}

/// Parse `method SP request-target SP HTTP-version CRLF`.
///
/// One leading empty CRLF is tolerated (RFC 9112 §2.2 robustness).
pub fn parse_request_line(buf: &[u8], cur: &mut MsgCursor) -> Result<(Method, TargetForm), RequestError> {
    *cur = MsgCursor::default();

    let Some(i) = find(buf, 8, 0, b"\r\n") else {
        event!(Level::WARN, "request line incomplete");
        return Err(RequestError::BadRequest);
    };
    cur.control_data_len = (i + 2) as u32;
    let next_line_offset = cur.control_data_len as usize;

    // there should be at least one more CRLF
    if buf.len() < next_line_offset + 2 {
        event!(Level::WARN, "malformed message, too short");
        return Err(RequestError::BadRequest);
    }

    let method_offset = if buf[0] == b'\r' && buf[1] == b'\n' { 2 } else { 0 };

    let method = if buf[method_offset..].starts_with(b"GET ") {
        cur.target_path_offset = (method_offset + 4) as u32;
        Method::Get
    } else if buf[method_offset..].starts_with(b"POST ") {
        cur.target_path_offset = (method_offset + 5) as u32;
        Method::Post
    } else if buf[method_offset].is_ascii_uppercase() {
        event!(Level::WARN, "method not implemented");
        return Err(RequestError::NotImplemented);
    } else {
        event!(Level::WARN, "not a method name");
        return Err(RequestError::BadRequest);
    };

    let Some(i) = find(buf, next_line_offset.saturating_sub(11), 11, b" HTTP/") else {
        event!(Level::WARN, "http version not present");
        return Err(RequestError::BadRequest);
    };
    let major = buf[i + 6];
    if major.is_ascii_digit() {
        if major != b'1' {
            event!(Level::WARN, version = major, "http major version not supported");
            return Err(RequestError::VersionNotSupported);
        }
    } else {
        event!(Level::WARN, "http major version is not a digit");
        return Err(RequestError::BadRequest);
    }

    let target_len = i as isize - cur.target_path_offset as isize;
    if target_len < 1 {
        event!(Level::WARN, "request-target not present");
        return Err(RequestError::BadRequest);
    }
    cur.target_path_len = target_len as u32;
    cur.target_query_offset = 0;
    cur.target_query_len = 0;

    let Some(form) = target_form(buf, cur) else {
        event!(Level::WARN, "invalid request-target");
        return Err(RequestError::BadRequest);
    };

    cur.rx_buf_offset = next_line_offset as u32;

    Ok((method, form))
}

/// Parse `HTTP-version SP status-code SP [ reason-phrase ] CRLF`.
///
/// The reason phrase is ignored; status codes outside [100, 599] are
/// rejected. Anything shorter than the minimum viable status-line (12 bytes
/// before the CRLF) is rejected before field extraction.
pub fn parse_status_line(buf: &[u8], cur: &mut MsgCursor) -> Result<u16, ResponseError> {
    *cur = MsgCursor::default();

    let Some(i) = find(buf, 0, 0, b"\r\n") else {
        event!(Level::WARN, "status line incomplete");
        return Err(ResponseError);
    };
    if i < 12 {
        event!(Level::WARN, len = i, "status line too short");
        return Err(ResponseError);
    }
    cur.control_data_len = (i + 2) as u32;
    let next_line_offset = cur.control_data_len as usize;

    if buf.len() < next_line_offset + 2 {
        event!(Level::WARN, "malformed message, too short");
        return Err(ResponseError);
    }

    if !buf.starts_with(b"HTTP/1.") {
        event!(Level::WARN, "unexpected http version");
        return Err(ResponseError);
    }
    if !buf[7].is_ascii_digit() {
        event!(Level::WARN, "invalid http minor version");
        return Err(ResponseError);
    }

    // skip space(s)
    let mut p = 8;
    if buf[p] != b' ' {
        event!(Level::WARN, "no space after http version");
        return Err(ResponseError);
    }
    while buf[p] == b' ' {
        p += 1;
        if p == i {
            event!(Level::WARN, "no status code");
            return Err(ResponseError);
        }
    }

    if i - p < 3 {
        event!(Level::WARN, "not enough characters for status code");
        return Err(ResponseError);
    }
    let mut status_code: u16 = 0;
    for _ in 0..3 {
        if !buf[p].is_ascii_digit() {
            event!(Level::WARN, "status code is not numeric");
            return Err(ResponseError);
        }
        status_code = status_code * 10 + (buf[p] - b'0') as u16;
        p += 1;
    }
    if !(100..=599).contains(&status_code) {
        event!(Level::WARN, status_code, "invalid status code");
        return Err(ResponseError);
    }

    cur.rx_buf_offset = next_line_offset as u32;

    Ok(status_code)
}

/// Locate the header block, ending at the empty line.
pub fn identify_headers(buf: &[u8], cur: &mut MsgCursor) -> Result<(), RequestError> {
    let offset = cur.rx_buf_offset as usize;

    cur.headers_offset = 0;
    cur.headers_len = 0;

    // not just another CRLF -> at least one header line
    if !(buf.get(offset) == Some(&b'\r') && buf.get(offset + 1) == Some(&b'\n')) {
        let Some(i) = find(buf, offset, 0, b"\r\n\r\n") else {
            event!(Level::WARN, "cannot find header section end");
            return Err(RequestError::BadRequest);
        };
        cur.headers_offset = offset as u32;
        cur.headers_len = (i - offset + 2) as u32;
    }

    // control data always absorbs the terminating CRLF
    cur.control_data_len += cur.headers_len + 2;

    Ok(())
}

/// Determine the body length from a `Content-Length` header, if any.
///
/// The field name comparison is ASCII-case-insensitive. Chunked transfer
/// coding is not recognised. Absence means no body; a present but invalid or
/// overflowing value is a client error.
pub fn identify_message_body(buf: &[u8], cur: &mut MsgCursor) -> Result<(), RequestError> {
    cur.body_offset = 0;
    cur.body_len = 0;

    if cur.headers_len == 0 {
        return Ok(());
    }

    let Some(i) = find_token(
        buf,
        cur.headers_offset as usize,
        cur.headers_len as usize,
        b"Content-Length:",
    ) else {
        return Ok(());
    };
    let value_offset = i + 15;

    let Some(i) = find(buf, value_offset, cur.headers_len as usize, b"\r\n") else {
        event!(Level::WARN, "end of line missing");
        return Err(RequestError::BadRequest);
    };
    let value = &buf[value_offset..i];

    // strip surrounding spaces and tabs
    let value = {
        let start = value
            .iter()
            .position(|b| *b != b' ' && *b != b'\t')
            .ok_or_else(|| {
                event!(Level::WARN, "content length value missing");
                RequestError::BadRequest
            })?;
        let end = value.iter().rposition(|b| *b != b' ' && *b != b'\t');
        match end {
            Some(end) => &value[start..=end],
            None => &value[start..],
        }
    };
    if value.is_empty() {
        event!(Level::WARN, "content length value missing");
        return Err(RequestError::BadRequest);
    }

    let mut body_len: u64 = 0;
    for b in value {
        if !b.is_ascii_digit() {
            event!(Level::WARN, "expected digit in content length");
            return Err(RequestError::BadRequest);
        }
        body_len = body_len
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as u64))
            .ok_or_else(|| {
                event!(Level::WARN, "content length overflow");
                RequestError::BadRequest
            })?;
    }

    cur.body_len = body_len;
    cur.body_offset = cur.headers_offset + cur.headers_len + 2;

    Ok(())
}
