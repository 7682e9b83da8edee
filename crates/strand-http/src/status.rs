//! Status codes and the canonical u16 lookup table.
//!
//! Apps see status as a canonical enumerator: registered codes round-trip
//! exactly, anything else coalesces to its class representative (1xx -> 100,
//! 2xx -> 200, and so on).

/// Registered status codes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StatusCode {
    Continue,
    SwitchingProtocols,
    Ok,
    Created,
    Accepted,
    NoContent,
    MultipleChoices,
    MovedPermanently,
    Found,
    SeeOther,
    NotModified,
    TemporaryRedirect,
    PermanentRedirect,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    NotAcceptable,
    RequestTimeout,
    Conflict,
    Gone,
    LengthRequired,
    PayloadTooLarge,
    UriTooLong,
    UnsupportedMediaType,
    ExpectationFailed,
    InternalError,
    NotImplemented,
    BadGateway,
    ServiceUnavailable,
    GatewayTimeout,
    HttpVersionNotSupported,
}

impl StatusCode {
    pub fn code(&self) -> u16 {
        match self {
            StatusCode::Continue => 100,
            StatusCode::SwitchingProtocols => 101,
            StatusCode::Ok => 200,
            StatusCode::Created => 201,
            StatusCode::Accepted => 202,
            StatusCode::NoContent => 204,
            StatusCode::MultipleChoices => 300,
            StatusCode::MovedPermanently => 301,
            StatusCode::Found => 302,
            StatusCode::SeeOther => 303,
            StatusCode::NotModified => 304,
            StatusCode::TemporaryRedirect => 307,
            StatusCode::PermanentRedirect => 308,
            StatusCode::BadRequest => 400,
            StatusCode::Unauthorized => 401,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::MethodNotAllowed => 405,
            StatusCode::NotAcceptable => 406,
            StatusCode::RequestTimeout => 408,
            StatusCode::Conflict => 409,
            StatusCode::Gone => 410,
            StatusCode::LengthRequired => 411,
            StatusCode::PayloadTooLarge => 413,
            StatusCode::UriTooLong => 414,
            StatusCode::UnsupportedMediaType => 415,
            StatusCode::ExpectationFailed => 417,
            StatusCode::InternalError => 500,
            StatusCode::NotImplemented => 501,
            StatusCode::BadGateway => 502,
            StatusCode::ServiceUnavailable => 503,
            StatusCode::GatewayTimeout => 504,
            StatusCode::HttpVersionNotSupported => 505,
        }
    }

    /// Status-line text, number and reason phrase together.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Continue => "100 Continue",
            StatusCode::SwitchingProtocols => "101 Switching Protocols",
            StatusCode::Ok => "200 OK",
            StatusCode::Created => "201 Created",
            StatusCode::Accepted => "202 Accepted",
            StatusCode::NoContent => "204 No Content",
            StatusCode::MultipleChoices => "300 Multiple Choices",
            StatusCode::MovedPermanently => "301 Moved Permanently",
            StatusCode::Found => "302 Found",
            StatusCode::SeeOther => "303 See Other",
            StatusCode::NotModified => "304 Not Modified",
            StatusCode::TemporaryRedirect => "307 Temporary Redirect",
            StatusCode::PermanentRedirect => "308 Permanent Redirect",
            StatusCode::BadRequest => "400 Bad Request",
            StatusCode::Unauthorized => "401 Unauthorized",
            StatusCode::Forbidden => "403 Forbidden",
            StatusCode::NotFound => "404 Not Found",
            StatusCode::MethodNotAllowed => "405 Method Not Allowed",
            StatusCode::NotAcceptable => "406 Not Acceptable",
            StatusCode::RequestTimeout => "408 Request Timeout",
            StatusCode::Conflict => "409 Conflict",
            StatusCode::Gone => "410 Gone",
            StatusCode::LengthRequired => "411 Length Required",
            StatusCode::PayloadTooLarge => "413 Payload Too Large",
            StatusCode::UriTooLong => "414 URI Too Long",
            StatusCode::UnsupportedMediaType => "415 Unsupported Media Type",
            StatusCode::ExpectationFailed => "417 Expectation Failed",
            StatusCode::InternalError => "500 Internal Server Error",
            StatusCode::NotImplemented => "501 Not Implemented",
            StatusCode::BadGateway => "502 Bad Gateway",
            StatusCode::ServiceUnavailable => "503 Service Unavailable",
            StatusCode::GatewayTimeout => "504 Gateway Timeout",
            StatusCode::HttpVersionNotSupported => "505 HTTP Version Not Supported",
        }
    }

    /// Exact reverse of `code`; unregistered values yield None.
    pub fn from_u16(code: u16) -> Option<Self> {
        ALL.iter().copied().find(|sc| sc.code() == code)
    }
}

const ALL: [StatusCode; 33] = [
    StatusCode::Continue,
    StatusCode::SwitchingProtocols,
    StatusCode::Ok,
    StatusCode::Created,
    StatusCode::Accepted,
    StatusCode::NoContent,
    StatusCode::MultipleChoices,
    StatusCode::MovedPermanently,
    StatusCode::Found,
    StatusCode::SeeOther,
    StatusCode::NotModified,
    StatusCode::TemporaryRedirect,
    StatusCode::PermanentRedirect,
    StatusCode::BadRequest,
    StatusCode::Unauthorized,
    StatusCode::Forbidden,
    StatusCode::NotFound,
    StatusCode::MethodNotAllowed,
    StatusCode::NotAcceptable,
    StatusCode::RequestTimeout,
    StatusCode::Conflict,
    StatusCode::Gone,
    StatusCode::LengthRequired,
    StatusCode::PayloadTooLarge,
    StatusCode::UriTooLong,
    StatusCode::UnsupportedMediaType,
    StatusCode::ExpectationFailed,
    StatusCode::InternalError,
    StatusCode::NotImplemented,
    StatusCode::BadGateway,
    StatusCode::ServiceUnavailable,
    StatusCode::GatewayTimeout,
    StatusCode::HttpVersionNotSupported,
];

/// Map from any wire status (0-599) to its canonical enumerator.
pub struct ScTable {
    map: Box<[StatusCode; 600]>,
}

impl ScTable {
    pub fn new() -> Self {
        let mut map = Box::new([StatusCode::Continue; 600]);

        for (i, slot) in map.iter_mut().enumerate() {
            *slot = match i {
                0..=199 => StatusCode::Continue,
                200..=299 => StatusCode::Ok,
                300..=399 => StatusCode::MultipleChoices,
                400..=499 => StatusCode::BadRequest,
                _ => StatusCode::InternalError,
            };
        }
        for sc in ALL {
            map[sc.code() as usize] = sc;
        }

        Self { map }
    }

    pub fn lookup(&self, code: u16) -> StatusCode {
        self.map
            .get(code as usize)
            .copied()
            .unwrap_or(StatusCode::InternalError)
    }
}

impl Default for ScTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_codes_are_fixed_points() {
        let table = ScTable::new();
        for sc in ALL {
            assert_eq!(table.lookup(sc.code()), sc);
        }
    }

    #[test]
    fn unregistered_codes_coalesce_to_class() {
        let table = ScTable::new();
        assert_eq!(table.lookup(199), StatusCode::Continue);
        assert_eq!(table.lookup(226), StatusCode::Ok);
        assert_eq!(table.lookup(305), StatusCode::MultipleChoices);
        assert_eq!(table.lookup(418), StatusCode::BadRequest);
        assert_eq!(table.lookup(599), StatusCode::InternalError);
    }

    #[test]
    fn lookup_is_total_over_u16() {
        let table = ScTable::new();
        assert_eq!(table.lookup(0), StatusCode::Continue);
        assert_eq!(table.lookup(600), StatusCode::InternalError);
        assert_eq!(table.lookup(u16::MAX), StatusCode::InternalError);
    }

    #[test]
    fn from_u16_only_accepts_registered() {
        assert_eq!(StatusCode::from_u16(404), Some(StatusCode::NotFound));
        assert_eq!(StatusCode::from_u16(418), None);
    }
}
