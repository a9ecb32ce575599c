//! Core HTTP/1.x protocol types and byte utilities

use std::fmt;

// STATUS CODES

/// Numeric codes the engine emits itself.
pub const CONTINUE: u16 = 100;
pub const SWITCHING_PROTOCOLS: u16 = 101;
pub const OK: u16 = 200;
pub const PARTIAL_CONTENT: u16 = 206;
pub const NOT_MODIFIED: u16 = 304;
pub const BAD_REQUEST: u16 = 400;
pub const NOT_ACCEPTABLE: u16 = 406;
pub const REQUEST_TIMEOUT: u16 = 408;
pub const REQUEST_TOO_LARGE: u16 = 413;
pub const URI_TOO_LARGE: u16 = 414;
pub const RANGE_NOT_SATISFIABLE: u16 = 416;
pub const EXPECTATION_FAILED: u16 = 417;
pub const INTERNAL_SERVER_ERROR: u16 = 500;
pub const SERVICE_UNAVAILABLE: u16 = 503;
/// Internal: connection to the peer was severed mid-request.
pub const COMMS_ERROR: u16 = 550;
/// Internal: general client-side failure.
pub const CLIENT_ERROR: u16 = 551;

macro_rules! status_messages {
    ($( $code:literal => $msg:literal, )+) => {
        /// Map a status code to its reason phrase.
        ///
        /// Unknown codes render as `"Custom error"` so handlers may emit
        /// any numeric status without registering it first.
        pub const fn status_message(code: u16) -> &'static str {
            match code {
                $( $code => $msg, )+
                _ => "Custom error",
            }
        }
    };
}

status_messages! {
    100 => "Continue",
    101 => "Switching Protocols",
    200 => "OK",
    201 => "Created",
    202 => "Accepted",
    204 => "No Content",
    205 => "Reset Content",
    206 => "Partial Content",
    301 => "Moved Permanently",
    302 => "Moved Temporarily",
    304 => "Not Modified",
    305 => "Use Proxy",
    307 => "Temporary Redirect",
    400 => "Bad Request",
    401 => "Unauthorized",
    402 => "Payment Required",
    403 => "Forbidden",
    404 => "Not Found",
    405 => "Method Not Allowed",
    406 => "Not Acceptable",
    408 => "Request Timeout",
    409 => "Conflict",
    410 => "Gone",
    411 => "Length Required",
    412 => "Precondition Failed",
    413 => "Request Entity Too Large",
    414 => "Request-URI Too Large",
    415 => "Unsupported Media Type",
    416 => "Requested Range Not Satisfiable",
    417 => "Expectation Failed",
    500 => "Internal Server Error",
    501 => "Not Implemented",
    502 => "Bad Gateway",
    503 => "Service Unavailable",
    504 => "Gateway Timeout",
    505 => "Http Version Not Supported",
    507 => "Insufficient Storage",
    550 => "Comms Error",
    551 => "General Client Error",
}

// METHOD

/// HTTP request methods the engine recognizes.
///
/// Unrecognized method names are carried through verbatim (the engine is
/// a transport, not a router); they simply get none of the body-handling
/// behavior that POST/PUT trigger.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Trace,
}

impl Method {
    /// Match an already-uppercased method name.
    #[inline]
    pub fn parse(name: &str) -> Option<Self> {
        match name.as_bytes() {
            b"GET" => Some(Method::Get),
            b"HEAD" => Some(Method::Head),
            b"POST" => Some(Method::Post),
            b"PUT" => Some(Method::Put),
            b"DELETE" => Some(Method::Delete),
            b"OPTIONS" => Some(Method::Options),
            b"TRACE" => Some(Method::Trace),
            _ => None,
        }
    }

    /// POST and PUT carry request bodies that need the input pipeline.
    #[inline]
    pub const fn expects_body(&self) -> bool {
        matches!(self, Method::Post | Method::Put)
    }
}

// VERSION

/// HTTP protocol version. The engine speaks HTTP/1.0 and HTTP/1.1 exactly.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    #[inline]
    pub(crate) fn parse(token: &str) -> Option<Self> {
        match token.as_bytes() {
            b"HTTP/1.0" => Some(Version::Http10),
            b"HTTP/1.1" => Some(Version::Http11),
            _ => None,
        }
    }

    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// BYTE UTILS

/// Parse an unsigned decimal with overflow checking. `None` on any
/// non-digit or overflow.
#[inline]
pub(crate) fn parse_dec(bytes: &[u8]) -> Option<i64> {
    if bytes.is_empty() {
        return None;
    }
    let mut result: i64 = 0;
    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }
        result = result.checked_mul(10)?.checked_add((byte - b'0') as i64)?;
    }
    Some(result)
}

/// Parse a hexadecimal chunk-size token. `None` on empty input, any
/// non-hex digit, or overflow.
#[inline]
pub(crate) fn parse_hex(bytes: &[u8]) -> Option<usize> {
    if bytes.is_empty() {
        return None;
    }
    let mut result: usize = 0;
    for &byte in bytes {
        let digit = match byte {
            b'0'..=b'9' => byte - b'0',
            b'a'..=b'f' => byte - b'a' + 10,
            b'A'..=b'F' => byte - b'A' + 10,
            _ => return None,
        };
        result = result.checked_mul(16)?.checked_add(digit as usize)?;
    }
    Some(result)
}

/// Leading-digit scan used by numeric header values that allow prefixes,
/// e.g. `Content-Range: bytes 0-4/10`.
#[inline]
pub(crate) fn skip_to_digit(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| b.is_ascii_digit())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

/// Consume the leading decimal run and return (value, rest).
#[inline]
pub(crate) fn take_dec(bytes: &[u8]) -> (Option<i64>, &[u8]) {
    let end = bytes
        .iter()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(bytes.len());
    (parse_dec(&bytes[..end]), &bytes[end..])
}

#[cfg(test)]
mod proto_self {
    use super::*;

    #[test]
    fn status_table() {
        #[rustfmt::skip]
        let cases = [
            (100, "Continue"),
            (200, "OK"),
            (206, "Partial Content"),
            (302, "Moved Temporarily"),
            (413, "Request Entity Too Large"),
            (414, "Request-URI Too Large"),
            (416, "Requested Range Not Satisfiable"),
            (505, "Http Version Not Supported"),
            (550, "Comms Error"),
            (551, "General Client Error"),
            (418, "Custom error"),
            (299, "Custom error"),
            (0,   "Custom error"),
        ];

        for (code, msg) in cases {
            assert_eq!(status_message(code), msg);
        }
    }

    #[test]
    fn parse_method() {
        #[rustfmt::skip]
        let cases = [
            ("GET",     Some(Method::Get)),
            ("HEAD",    Some(Method::Head)),
            ("POST",    Some(Method::Post)),
            ("PUT",     Some(Method::Put)),
            ("DELETE",  Some(Method::Delete)),
            ("OPTIONS", Some(Method::Options)),
            ("TRACE",   Some(Method::Trace)),

            ("get",     None),
            ("PATCH",   None),
            ("BREW",    None),
            ("",        None),
        ];

        for (name, expected) in cases {
            assert_eq!(Method::parse(name), expected);
        }
        assert!(Method::Post.expects_body());
        assert!(Method::Put.expects_body());
        assert!(!Method::Get.expects_body());
    }

    #[test]
    fn parse_version() {
        assert_eq!(Version::parse("HTTP/1.0"), Some(Version::Http10));
        assert_eq!(Version::parse("HTTP/1.1"), Some(Version::Http11));
        assert_eq!(Version::parse("HTTP/2.0"), None);
        assert_eq!(Version::parse("http/1.1"), None);
        assert_eq!(Version::parse("HTTP/1.1 "), None);
    }

    #[test]
    fn numbers() {
        assert_eq!(parse_dec(b"0"), Some(0));
        assert_eq!(parse_dec(b"1256"), Some(1256));
        assert_eq!(parse_dec(b""), None);
        assert_eq!(parse_dec(b"12a"), None);
        assert_eq!(parse_dec(b"99999999999999999999"), None);

        assert_eq!(parse_hex(b"0"), Some(0));
        assert_eq!(parse_hex(b"5"), Some(5));
        assert_eq!(parse_hex(b"1A"), Some(26));
        assert_eq!(parse_hex(b"ff"), Some(255));
        assert_eq!(parse_hex(b""), None);
        assert_eq!(parse_hex(b"5g"), None);

        let (value, rest) = take_dec(b"100-200");
        assert_eq!(value, Some(100));
        assert_eq!(rest, b"-200");

        assert_eq!(skip_to_digit(b"bytes 0-4"), b"0-4");
        assert_eq!(skip_to_digit(b"no digits"), b"");
    }
}
