//! App-facing control-message framing.
//!
//! A fixed-layout header precedes every payload exchanged with an app over
//! its FIFO pair, in both directions. The layout is a frozen wire contract:
//! field order and widths below never change, all integers little-endian.
//!
//! Payload carriers: `Inline` means the payload bytes follow the header in
//! the same FIFO write; `Ptr` means a single u64 region token follows, naming
//! an app-owned region registered with the session layer. For a `Ptr` request
//! the app enqueues tokens in the order the engine drains them: target, body
//! (POST only), then headers.

use bytes::{Buf, BufMut};
use thiserror::Error;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MsgType {
    Request,
    Reply,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum DataType {
    #[default]
    Inline,
    Ptr,
}

/// Request-target forms of RFC 9112 §3.2.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum TargetForm {
    #[default]
    Origin,
    Absolute,
    Authority,
    Asterisk,
}

/// Payload descriptor: carrier, total inline length, and the offsets of the
/// message parts within the inline payload or pointed-to region.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct MsgData {
    pub kind: DataType,
    pub len: u64,
    pub target_form: TargetForm,
    pub target_path_offset: u32,
    pub target_path_len: u32,
    pub target_query_offset: u32,
    pub target_query_len: u32,
    pub headers_offset: u32,
    pub headers_len: u32,
    pub body_offset: u32,
    pub body_len: u64,
}

/// The control-message header itself.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HttpMsg {
    pub kind: MsgType,
    /// Request only; replies carry `Get`.
    pub method: Method,
    /// Reply only; canonical status enumerator value (see `status`).
    pub code: u16,
    pub data: MsgData,
}

impl HttpMsg {
    /// Exact encoded size in bytes.
    pub const SIZE: usize = 50;

    pub fn request(method: Method, data: MsgData) -> Self {
        Self { kind: MsgType::Request, method, code: 0, data }
    }

    pub fn reply(code: u16, data: MsgData) -> Self {
        Self { kind: MsgType::Reply, method: Method::Get, code, data }
    }

    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_u8(match self.kind {
            MsgType::Request => 0,
            MsgType::Reply => 1,
        });
        out.put_u8(match self.method {
            Method::Get => 0,
            Method::Post => 1,
        });
        out.put_u16_le(self.code);
        out.put_u8(match self.data.kind {
            DataType::Inline => 0,
            DataType::Ptr => 1,
        });
        out.put_u64_le(self.data.len);
        out.put_u8(match self.data.target_form {
            TargetForm::Origin => 0,
            TargetForm::Absolute => 1,
            TargetForm::Authority => 2,
            TargetForm::Asterisk => 3,
        });
        out.put_u32_le(self.data.target_path_offset);
        out.put_u32_le(self.data.target_path_len);
        out.put_u32_le(self.data.target_query_offset);
        out.put_u32_le(self.data.target_query_len);
        out.put_u32_le(self.data.headers_offset);
        out.put_u32_le(self.data.headers_len);
        out.put_u32_le(self.data.body_offset);
        out.put_u64_le(self.data.body_len);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, MsgDecodeError> {
        if buf.remaining() < Self::SIZE {
            return Err(MsgDecodeError::Truncated);
        }

        let kind = match buf.get_u8() {
            0 => MsgType::Request,
            1 => MsgType::Reply,
            v => return Err(MsgDecodeError::BadMsgType(v)),
        };
        let method = match buf.get_u8() {
            0 => Method::Get,
            1 => Method::Post,
            v => return Err(MsgDecodeError::BadMethod(v)),
        };
        let code = buf.get_u16_le();
        let data_kind = match buf.get_u8() {
            0 => DataType::Inline,
            1 => DataType::Ptr,
            v => return Err(MsgDecodeError::BadDataType(v)),
        };
        let len = buf.get_u64_le();
        let target_form = match buf.get_u8() {
            0 => TargetForm::Origin,
            1 => TargetForm::Absolute,
            2 => TargetForm::Authority,
            3 => TargetForm::Asterisk,
            v => return Err(MsgDecodeError::BadTargetForm(v)),
        };

        let data = MsgData {
            kind: data_kind,
            len,
            target_form,
            target_path_offset: buf.get_u32_le(),
            target_path_len: buf.get_u32_le(),
            target_query_offset: buf.get_u32_le(),
            target_query_len: buf.get_u32_le(),
            headers_offset: buf.get_u32_le(),
            headers_len: buf.get_u32_le(),
            body_offset: buf.get_u32_le(),
            body_len: buf.get_u64_le(),
        };

        Ok(Self { kind, method, code, data })
    }
}

/// Malformed control-message header.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum MsgDecodeError {
    #[error("control message truncated")]
    Truncated,
    #[error("unknown message type {0}")]
    BadMsgType(u8),
    #[error("unknown method {0}")]
    BadMethod(u8),
    #[error("unknown data carrier {0}")]
    BadDataType(u8),
    #[error("unknown target form {0}")]
    BadTargetForm(u8),
}
