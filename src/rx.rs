//! Rx: parsed request/response state and the incoming wire parsers

use crate::{
    chunk::ChunkState,
    conn::{Conn, State},
    errors::HttpError,
    pipeline::Role,
    proto::{self, Method, Version},
    range::{self, ByteRange},
};
use bytes::BytesMut;
use memchr::memmem;
use std::time::SystemTime;
use tracing::{debug, trace};

// HEADERS

/// Case-insensitive header map preserving arrival order.
///
/// Duplicate keys are joined with `", "` per RFC 7230 §3.2.2; lookups use
/// a linear scan, which beats hashing at typical header counts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a header, joining duplicates with `", "`.
    pub fn add(&mut self, key: &str, value: &str) {
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            Some((_, existing)) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => self.entries.push((key.to_string(), value.to_string())),
        }
    }

    /// Set a header, replacing any existing value.
    pub fn set(&mut self, key: &str, value: &str) {
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            Some((_, existing)) => {
                existing.clear();
                existing.push_str(value);
            }
            None => self.entries.push((key.to_string(), value.to_string())),
        }
    }

    /// Case-insensitive lookup.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

// PARSED URI

/// Decomposed request target.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedUri {
    pub scheme: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: String,
    pub query: Option<String>,
    pub ext: Option<String>,
}

impl ParsedUri {
    /// Parse an origin-form (`/path?query`) or absolute-form
    /// (`http://host:port/path?query`) target.
    pub fn parse(uri: &str) -> Option<Self> {
        let mut parsed = ParsedUri {
            scheme: "http".to_string(),
            ..Default::default()
        };
        let rest = if let Some(after) = uri.strip_prefix("http://") {
            parsed.take_authority(after)?
        } else if let Some(after) = uri.strip_prefix("https://") {
            parsed.scheme = "https".to_string();
            parsed.take_authority(after)?
        } else {
            uri
        };

        let (path, query) = match rest.find('?') {
            Some(at) => (&rest[..at], Some(rest[at + 1..].to_string())),
            None => (rest, None),
        };
        let path = if path.is_empty() { "/" } else { path };
        parsed.path = normalize_path(&percent_decode(path)?)?;
        parsed.query = query;
        parsed.ext = path_ext(&parsed.path);
        Some(parsed)
    }

    fn take_authority<'a>(&mut self, after: &'a str) -> Option<&'a str> {
        let end = after.find('/').unwrap_or(after.len());
        let authority = &after[..end];
        match authority.rsplit_once(':') {
            Some((host, port)) => {
                self.host = Some(host.to_string());
                self.port = Some(port.parse().ok()?);
            }
            None => self.host = Some(authority.to_string()),
        }
        if self.host.as_deref().is_some_and(str::is_empty) {
            return None;
        }
        Some(&after[end..])
    }
}

/// Resolve `.` and `..` segments. `None` if the path escapes the root.
fn normalize_path(path: &str) -> Option<String> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }
    let mut normalized = String::with_capacity(path.len());
    for segment in &segments {
        normalized.push('/');
        normalized.push_str(segment);
    }
    if normalized.is_empty() {
        normalized.push('/');
    }
    if path.ends_with('/') && normalized.len() > 1 {
        normalized.push('/');
    }
    Some(normalized)
}

fn percent_decode(path: &str) -> Option<String> {
    if !path.contains('%') {
        return Some(path.to_string());
    }
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            out.push(proto::parse_hex(hex)? as u8);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    simdutf8::basic::from_utf8(&out).ok().map(str::to_string)
}

fn path_ext(path: &str) -> Option<String> {
    let name = path.rsplit('/').next()?;
    let (_, ext) = name.rsplit_once('.')?;
    let ext: String = ext.chars().take_while(|c| c.is_ascii_alphanumeric()).collect();
    (!ext.is_empty()).then_some(ext)
}

// RX

/// Per-request inbound snapshot. Created when a connection enters BEGIN
/// and discarded at COMPLETE.
#[derive(Debug)]
pub struct Rx {
    pub(crate) role: Role,
    /// Uppercased method name; unrecognized names pass through.
    pub method: String,
    pub method_kind: Option<Method>,
    pub uri: String,
    pub original_uri: String,
    pub path_info: String,
    pub script_name: String,
    pub parsed_uri: Option<ParsedUri>,
    pub headers: Headers,

    /// Declared content length; -1 if unknown.
    pub length: i64,
    /// Bytes still to consume; `i64::MAX` while chunked or close-delimited.
    pub remaining_content: i64,
    /// Raw body bytes accepted from the wire.
    pub bytes_read: i64,
    /// Body bytes handed to the application via read().
    pub read_content: i64,
    pub chunk_state: ChunkState,
    pub chunk_size: usize,
    pub eof: bool,

    pub form: bool,
    pub upload: bool,
    pub own_params: bool,
    pub(crate) needs_input_pipeline: bool,
    /// The handler's receive queue saw the END packet.
    pub input_ended: bool,

    /// Parsed request `Content-Range`: the range plus the full entity size.
    pub input_range: Option<(ByteRange, i64)>,
    pub etags: Vec<String>,
    /// Polarity of If-Match vs If-None-Match (and If-Range).
    pub if_match: bool,
    /// Polarity of If-Modified-Since vs If-Unmodified-Since.
    pub if_modified: bool,
    /// Any conditional header was present.
    pub if_condition: bool,
    pub since: Option<SystemTime>,

    /// Response role: parsed status code and message.
    pub status: u16,
    pub status_message: String,
    pub upgrade: Option<String>,
    pub redirect: Option<String>,
    pub(crate) expect_continue: bool,

    pub host_header: Option<String>,
    pub cookie: Option<String>,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
    pub origin: Option<String>,
    pub pragma: Option<String>,
    pub mime_type: Option<String>,
    pub connection: Option<String>,
    pub accept: Option<String>,
    pub accept_charset: Option<String>,
    pub accept_encoding: Option<String>,
    pub accept_language: Option<String>,
    pub auth_type: Option<String>,
    pub auth_details: Option<String>,

    /// The raw header block, retained next to the parsed form so an
    /// error-document re-request can be reconstructed from clean bytes.
    pub(crate) head_bytes: BytesMut,
}

impl Rx {
    pub(crate) fn new(role: Role) -> Self {
        Self {
            role,
            method: String::new(),
            method_kind: None,
            uri: String::new(),
            original_uri: String::new(),
            path_info: "/".to_string(),
            script_name: String::new(),
            parsed_uri: None,
            headers: Headers::new(),
            length: -1,
            remaining_content: 0,
            bytes_read: 0,
            read_content: 0,
            chunk_state: ChunkState::Unchunked,
            chunk_size: 0,
            eof: false,
            form: false,
            upload: false,
            own_params: false,
            needs_input_pipeline: role == Role::Client,
            input_ended: false,
            input_range: None,
            etags: Vec::new(),
            if_match: true,
            if_modified: true,
            if_condition: false,
            since: None,
            status: 0,
            status_message: String::new(),
            upgrade: None,
            redirect: None,
            expect_continue: false,
            host_header: None,
            cookie: None,
            user_agent: None,
            referrer: None,
            origin: None,
            pragma: None,
            mime_type: None,
            connection: None,
            accept: None,
            accept_charset: None,
            accept_encoding: None,
            accept_language: None,
            auth_type: None,
            auth_details: None,
            head_bytes: BytesMut::new(),
        }
    }

    fn reset_for_next_head(&mut self) {
        *self = Rx::new(self.role);
    }

    /// If-Modified-Since / If-Unmodified-Since evaluation against the
    /// entity's modification time.
    pub fn match_modified(&self, time: SystemTime) -> bool {
        let Some(since) = self.since else {
            return true;
        };
        if self.if_modified {
            // True when the entity has not been modified
            !(time > since)
        } else {
            time > since
        }
    }

    /// Match the entity's etag against the client-provided list, honoring
    /// If-Match vs If-None-Match polarity.
    pub fn match_etag(&self, requested: Option<&str>) -> bool {
        if self.etags.is_empty() {
            return true;
        }
        let Some(requested) = requested else {
            return false;
        };
        let found = self.etags.iter().any(|tag| tag == requested);
        if found {
            !self.if_match
        } else {
            self.if_match
        }
    }
}

// INCOMING PARSER

/// Tokenizer over an extracted header block.
struct HeadLines<'a> {
    lines: Vec<&'a [u8]>,
    next: usize,
}

impl<'a> HeadLines<'a> {
    fn new(block: &'a [u8]) -> Self {
        let mut lines = Vec::new();
        let mut start = 0;
        while start < block.len() {
            match memmem::find(&block[start..], b"\r\n") {
                Some(eol) => {
                    lines.push(&block[start..start + eol]);
                    start += eol + 2;
                }
                None => {
                    lines.push(&block[start..]);
                    break;
                }
            }
        }
        Self { lines, next: 0 }
    }

    fn next_line(&mut self) -> Option<&'a [u8]> {
        let line = self.lines.get(self.next).copied();
        self.next += 1;
        line
    }

    /// Obs-fold: continuation lines starting with SP/HT belong to the
    /// previous header's value.
    fn folded(&mut self) -> Option<&'a [u8]> {
        let line = *self.lines.get(self.next)?;
        if line.first().is_some_and(|&b| b == b' ' || b == b'\t') {
            self.next += 1;
            Some(trim_ws(line))
        } else {
            None
        }
    }
}

#[inline]
fn trim_ws(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

fn utf8(bytes: &[u8]) -> Result<&str, HttpError> {
    simdutf8::basic::from_utf8(bytes).map_err(|_| HttpError::bad_request("Bad header encoding"))
}

impl Conn {
    /// Accumulate and parse the incoming message head. Returns true to
    /// keep pumping, false when more bytes are needed.
    pub(crate) fn parse_incoming(&mut self) -> bool {
        if self.input.is_empty() {
            return false;
        }
        // Tolerate blank lines preceding the request line on persistent
        // connections
        let lead = self
            .input
            .iter()
            .take_while(|&&b| b == b'\r' || b == b'\n')
            .count();
        if lead > 0 {
            let _ = self.input.split_to(lead);
            if self.input.is_empty() {
                return false;
            }
        }

        let Some(end) = memmem::find(&self.input, b"\r\n\r\n") else {
            if self.input.len() >= self.limits.header_size {
                self.record_error(
                    HttpError::limit(
                        proto::REQUEST_TOO_LARGE,
                        format!(
                            "Header too big. Length {} vs limit {}",
                            self.input.len(),
                            self.limits.header_size
                        ),
                    )
                    .abort(),
                );
                return true;
            }
            return false;
        };
        if end >= self.limits.header_size {
            self.record_error(
                HttpError::limit(
                    proto::REQUEST_TOO_LARGE,
                    format!(
                        "Header too big. Length {} vs limit {}",
                        end, self.limits.header_size
                    ),
                )
                .abort(),
            );
            return true;
        }

        // Keep the last header's CRLF with the block; the blank line stays
        // in the input for the chunk decoder's benefit
        let head = self.input.split_to(end + 2);
        self.x.rx.head_bytes = head.clone();

        let result = self.parse_head_block(&head);
        if let Err(err) = result {
            self.record_error(err);
            return true;
        }

        if self.role == Role::Client && self.x.rx.status == proto::CONTINUE {
            // Interim response to our Expect; drop it and parse the real
            // status line that follows
            if self.input.starts_with(b"\r\n") {
                let _ = self.input.split_to(2);
            }
            self.x.rx.reset_for_next_head();
            return true;
        }

        if self.x.rx.expect_continue {
            self.send_continue();
            self.x.rx.expect_continue = false;
        }

        // Step over the blank line unless chunked: the chunk decoder
        // wants to see a single `CRLF SIZE CRLF` delimiter
        if self.x.rx.chunk_state == ChunkState::Unchunked && self.input.starts_with(b"\r\n") {
            let _ = self.input.split_to(2);
        }
        self.new_data = self.input.len();
        self.set_state(State::Parsed);
        true
    }

    fn parse_head_block(&mut self, head: &[u8]) -> Result<(), HttpError> {
        let mut lines = HeadLines::new(head);
        let first = lines
            .next_line()
            .ok_or_else(|| HttpError::bad_request("Empty message head").abort())?;

        if self.role == Role::Server {
            self.parse_request_line(first)?;
        } else {
            self.parse_response_line(first)?;
        }
        self.parse_headers(&mut lines)?;

        if self.role == Role::Server {
            self.set_parsed_uri()?;
        }
        Ok(())
    }

    /// `METHOD SP URI SP HTTP/1.x`
    fn parse_request_line(&mut self, line: &[u8]) -> Result<(), HttpError> {
        self.started = std::time::Instant::now();
        if !self.active_request {
            self.active_request = true;
            let active = self.service.monitor_event(crate::service::COUNTER_ACTIVE_REQUESTS, 1);
            if active > self.limits.requests_per_client_max as i64 {
                return Err(
                    HttpError::limit(proto::SERVICE_UNAVAILABLE, "Too many concurrent requests")
                        .abort(),
                );
            }
            self.service.monitor_event(crate::service::COUNTER_REQUESTS, 1);
        }

        let text = utf8(line)?;
        let mut tokens = text.split_ascii_whitespace();
        let method = tokens
            .next()
            .ok_or_else(|| HttpError::bad_request("Bad HTTP request. Empty method").abort())?;
        let uri = tokens
            .next()
            .ok_or_else(|| HttpError::bad_request("Bad HTTP request. Empty URI").abort())?;
        let protocol = tokens.next().unwrap_or("");

        self.x.rx.method = method.to_ascii_uppercase();
        self.x.rx.method_kind = Method::parse(&self.x.rx.method);
        if self.x.rx.method_kind.is_some_and(|m| m.expects_body()) {
            self.x.rx.needs_input_pipeline = true;
        }

        if uri.is_empty() {
            return Err(HttpError::bad_request("Bad HTTP request. Empty URI").abort());
        }
        if uri.len() >= self.limits.uri_size {
            return Err(HttpError::limit(
                proto::URI_TOO_LARGE,
                format!(
                    "Bad request. URI too long. Length {} vs limit {}",
                    uri.len(),
                    self.limits.uri_size
                ),
            )
            .abort());
        }

        match Version::parse(&protocol.to_ascii_uppercase()) {
            Some(Version::Http10) => {
                if self.x.rx.method_kind.is_some_and(|m| m.expects_body()) {
                    self.x.rx.remaining_content = i64::MAX;
                }
                self.http10 = true;
                self.protocol = Version::Http10;
            }
            Some(Version::Http11) => self.protocol = Version::Http11,
            None => {
                return Err(
                    HttpError::protocol(proto::NOT_ACCEPTABLE, "Unsupported HTTP protocol").abort(),
                )
            }
        }
        self.x.tx.version = self.protocol;
        self.x.rx.uri = uri.to_string();
        self.x.rx.original_uri = uri.to_string();
        *self.ticket.uri.lock().unwrap() = uri.to_string();
        self.service.count_request();

        debug!(method = %self.x.rx.method, uri = %self.x.rx.uri, protocol = %self.protocol, "request");
        self.set_state(State::First);
        Ok(())
    }

    /// `HTTP/1.x SP CODE SP MESSAGE`
    fn parse_response_line(&mut self, line: &[u8]) -> Result<(), HttpError> {
        let text = utf8(line)?;
        let mut tokens = text.splitn(3, ' ');
        let protocol = tokens.next().unwrap_or("").to_ascii_uppercase();

        match Version::parse(&protocol) {
            Some(Version::Http10) => {
                self.http10 = true;
                self.protocol = Version::Http10;
                if self.x.tx.method != "HEAD" {
                    self.x.rx.remaining_content = i64::MAX;
                }
            }
            Some(Version::Http11) => self.protocol = Version::Http11,
            None => {
                return Err(
                    HttpError::protocol(proto::NOT_ACCEPTABLE, "Unsupported HTTP protocol").abort(),
                )
            }
        }

        let status = tokens.next().unwrap_or("");
        if status.is_empty() {
            return Err(
                HttpError::protocol(proto::NOT_ACCEPTABLE, "Bad response status code").abort(),
            );
        }
        self.x.rx.status = proto::parse_dec(status.as_bytes())
            .filter(|&code| (100..600).contains(&code))
            .ok_or_else(|| {
                HttpError::protocol(proto::NOT_ACCEPTABLE, "Bad response status code").abort()
            })? as u16;

        let message = tokens.next().unwrap_or("");
        if message.len() >= self.limits.uri_size {
            return Err(HttpError::limit(
                proto::URI_TOO_LARGE,
                format!(
                    "Bad response. Status message too long. Length {} vs limit {}",
                    message.len(),
                    self.limits.uri_size
                ),
            )
            .close());
        }
        self.x.rx.status_message = message.to_string();

        debug!(status = self.x.rx.status, message = %self.x.rx.status_message, "response");
        self.set_state(State::First);
        Ok(())
    }

    fn parse_headers(&mut self, lines: &mut HeadLines<'_>) -> Result<(), HttpError> {
        let mut count = 0;
        let mut keep_alive_header = false;

        while let Some(line) = lines.next_line() {
            if line.is_empty() {
                break;
            }
            if count >= self.limits.header_max {
                return Err(
                    HttpError::limit(proto::BAD_REQUEST, "Too many headers").abort(),
                );
            }
            count += 1;

            let colon = memchr::memchr(b':', line)
                .ok_or_else(|| HttpError::bad_request("Bad header format").abort())?;
            let key = utf8(&line[..colon])?;
            if key.is_empty() {
                return Err(HttpError::bad_request("Bad header format").abort());
            }
            if key.bytes().any(|b| matches!(b, b'%' | b'<' | b'>' | b'/' | b'\\')) {
                return Err(HttpError::bad_request("Bad header key value").abort());
            }
            let mut value = utf8(trim_ws(&line[colon + 1..]))?.to_string();
            while let Some(fold) = lines.folded() {
                value.push(' ');
                value.push_str(utf8(fold)?);
            }
            trace!(key, value, "header");

            self.x.rx.headers.add(key, &value);
            self.dispatch_header(key, &value, &mut keep_alive_header)?;
        }

        let rx = &self.x.rx;
        if rx.form && rx.length >= self.limits.receive_form_size {
            return Err(HttpError::limit(
                proto::REQUEST_TOO_LARGE,
                format!(
                    "Request form of {} bytes is too big. Limit {}",
                    rx.length, self.limits.receive_form_size
                ),
            )
            .close());
        }
        if self.http10 && !keep_alive_header {
            self.keep_alive_count = 0;
        }
        if self.role == Role::Client && self.must_close && self.x.rx.length < 0 {
            // Closing the connection is the peer's only way to mark the
            // end of the body, unless this is a bodyless redirect
            self.x.rx.remaining_content = if self.x.rx.redirect.is_some() {
                0
            } else {
                i64::MAX
            };
        }
        Ok(())
    }

    /// Semantic interpretation of significant headers, dispatched on the
    /// first letter as the wire parser has always done.
    fn dispatch_header(
        &mut self,
        key: &str,
        value: &str,
        keep_alive_header: &mut bool,
    ) -> Result<(), HttpError> {
        let rx = &mut self.x.rx;
        let first = key.as_bytes()[0].to_ascii_lowercase();

        match first {
            b'a' => {
                if key.eq_ignore_ascii_case("authorization") {
                    let mut parts = value.splitn(2, [' ', '\t']);
                    rx.auth_type = parts.next().map(str::to_ascii_lowercase);
                    rx.auth_details = parts.next().map(|d| trim_ws(d.as_bytes()))
                        .and_then(|d| std::str::from_utf8(d).ok())
                        .map(str::to_string);
                } else if key.eq_ignore_ascii_case("accept-charset") {
                    rx.accept_charset = Some(value.to_string());
                } else if key.eq_ignore_ascii_case("accept") {
                    rx.accept = Some(value.to_string());
                } else if key.eq_ignore_ascii_case("accept-encoding") {
                    rx.accept_encoding = Some(value.to_string());
                } else if key.eq_ignore_ascii_case("accept-language") {
                    rx.accept_language = Some(value.to_string());
                }
            }

            b'c' => {
                if key.eq_ignore_ascii_case("connection") {
                    rx.connection = Some(value.to_string());
                    if value.eq_ignore_ascii_case("keep-alive") {
                        *keep_alive_header = true;
                    } else if value.eq_ignore_ascii_case("close") {
                        self.keep_alive_count = 0;
                        self.must_close = true;
                    }
                } else if key.eq_ignore_ascii_case("content-length") {
                    if rx.length >= 0 {
                        return Err(HttpError::conflict("Multiple content length headers").close());
                    }
                    let length = proto::parse_dec(value.as_bytes())
                        .ok_or_else(|| HttpError::bad_request("Bad content length").abort())?;
                    if length >= self.limits.receive_body_size {
                        return Err(HttpError::limit(
                            proto::REQUEST_TOO_LARGE,
                            format!(
                                "Request content length {} bytes is too big. Limit {}",
                                length, self.limits.receive_body_size
                            ),
                        )
                        .abort());
                    }
                    rx.length = length;
                    if self.role == Role::Server || self.x.tx.method != "HEAD" {
                        rx.remaining_content = length;
                        rx.needs_input_pipeline = true;
                    }
                } else if key.eq_ignore_ascii_case("content-range") {
                    match range::parse_content_range(value.as_bytes()) {
                        Some(parsed) => rx.input_range = Some(parsed),
                        None => {
                            return Err(HttpError::new(
                                crate::errors::ErrorKind::Malformed,
                                proto::RANGE_NOT_SATISFIABLE,
                                "Bad content range",
                            )
                            .close())
                        }
                    }
                } else if key.eq_ignore_ascii_case("content-type") {
                    rx.mime_type = Some(value.to_string());
                    if rx.method_kind.is_some_and(|m| m.expects_body()) {
                        if self.role == Role::Server {
                            rx.form = value.contains("application/x-www-form-urlencoded");
                            rx.upload = value.contains("multipart/form-data");
                        }
                    } else {
                        rx.form = false;
                        rx.upload = false;
                    }
                } else if key.eq_ignore_ascii_case("cookie") {
                    match &mut rx.cookie {
                        Some(cookie) if !cookie.is_empty() => {
                            cookie.push_str("; ");
                            cookie.push_str(value);
                        }
                        _ => rx.cookie = Some(value.to_string()),
                    }
                }
            }

            b'e' => {
                if key.eq_ignore_ascii_case("expect") {
                    // 100-continue is the only expectation handled, and
                    // only for HTTP/1.1
                    if !self.http10 {
                        if value.eq_ignore_ascii_case("100-continue") {
                            rx.expect_continue = true;
                        } else {
                            return Err(HttpError::protocol(
                                proto::EXPECTATION_FAILED,
                                format!("Expect header value \"{}\" is unsupported", value),
                            ));
                        }
                    }
                }
            }

            b'h' => {
                if key.eq_ignore_ascii_case("host") {
                    rx.host_header = Some(value.to_string());
                }
            }

            b'i' => {
                if key.eq_ignore_ascii_case("if-modified-since")
                    || key.eq_ignore_ascii_case("if-unmodified-since")
                {
                    let date = value.split(';').next().unwrap_or("");
                    if let Ok(when) = httpdate::parse_http_date(date.trim()) {
                        rx.since = Some(when);
                        rx.if_modified = key.as_bytes()[3].eq_ignore_ascii_case(&b'm');
                        rx.if_condition = true;
                    }
                } else if key.eq_ignore_ascii_case("if-match")
                    || key.eq_ignore_ascii_case("if-none-match")
                {
                    rx.if_match = key.as_bytes()[3].eq_ignore_ascii_case(&b'm');
                    rx.if_condition = true;
                    let list = value.split(';').next().unwrap_or("");
                    for tag in list.split([' ', ',']).filter(|t| !t.is_empty()) {
                        rx.etags.push(tag.to_string());
                    }
                } else if key.eq_ignore_ascii_case("if-range") {
                    rx.if_match = true;
                    rx.if_condition = true;
                    let list = value.split(';').next().unwrap_or("");
                    for tag in list.split([' ', ',']).filter(|t| !t.is_empty()) {
                        rx.etags.push(tag.to_string());
                    }
                }
            }

            b'k' => {
                // Keep-Alive: timeout=N, max=M
                if key.eq_ignore_ascii_case("keep-alive") {
                    if let Some(at) = value.find("max=") {
                        let digits: &[u8] = value[at + 4..].as_bytes();
                        let end = digits
                            .iter()
                            .position(|b| !b.is_ascii_digit())
                            .unwrap_or(digits.len());
                        let max = proto::parse_dec(&digits[..end]).unwrap_or(0);
                        self.keep_alive_count =
                            (max.max(0) as usize).min(self.limits.keep_alive_max);
                        // Deliberately close client connections one
                        // request early: a client-led termination
                        // relieves server-side TIME_WAIT accumulation
                        if self.role == Role::Client && self.keep_alive_count == 1 {
                            self.keep_alive_count = 0;
                        }
                    }
                }
            }

            b'l' => {
                if key.eq_ignore_ascii_case("location") {
                    rx.redirect = Some(value.to_string());
                }
            }

            b'o' => {
                if key.eq_ignore_ascii_case("origin") {
                    rx.origin = Some(value.to_string());
                }
            }

            b'p' => {
                if key.eq_ignore_ascii_case("pragma") {
                    rx.pragma = Some(value.to_string());
                }
            }

            b'r' => {
                if key.eq_ignore_ascii_case("range") {
                    match range::parse_range_header(value.as_bytes()) {
                        Some(ranges) => self.x.tx.output_ranges = ranges,
                        None => {
                            return Err(HttpError::new(
                                crate::errors::ErrorKind::Malformed,
                                proto::RANGE_NOT_SATISFIABLE,
                                "Bad range",
                            )
                            .close())
                        }
                    }
                } else if key.eq_ignore_ascii_case("referer") {
                    // The header name is misspelt in the RFC itself
                    rx.referrer = Some(value.to_string());
                }
            }

            b't' => {
                if key.eq_ignore_ascii_case("transfer-encoding")
                    && value.eq_ignore_ascii_case("chunked")
                {
                    // remaining_content is revised by the chunk decoder
                    // and drops to zero at the final chunk
                    rx.chunk_state = ChunkState::Start;
                    rx.remaining_content = i64::MAX;
                    rx.needs_input_pipeline = true;
                }
            }

            b'u' => {
                if key.eq_ignore_ascii_case("upgrade") {
                    rx.upgrade = Some(value.to_string());
                } else if key.eq_ignore_ascii_case("user-agent") {
                    rx.user_agent = Some(value.to_string());
                }
            }

            b'w' => {
                if key.eq_ignore_ascii_case("www-authenticate") {
                    let mut parts = value.splitn(2, [' ', '\t']);
                    rx.auth_type = parts.next().map(str::to_ascii_lowercase);
                    rx.auth_details = parts.next().map(str::to_string);
                }
            }

            b'x' => {
                if key.eq_ignore_ascii_case("x-http-method-override") {
                    rx.method = value.trim().to_ascii_uppercase();
                    rx.method_kind = Method::parse(&rx.method);
                    if rx.method_kind.is_some_and(|m| m.expects_body()) {
                        rx.needs_input_pipeline = true;
                    }
                } else if key.eq_ignore_ascii_case("x-own-params") {
                    // Embedders with very large forms do their own
                    // parameter handling
                    rx.own_params = true;
                }
            }

            _ => {}
        }
        Ok(())
    }

    fn set_parsed_uri(&mut self) -> Result<(), HttpError> {
        let parsed = ParsedUri::parse(&self.x.rx.uri)
            .ok_or_else(|| HttpError::bad_request("Bad URL").abort())?;
        if !parsed.path.starts_with('/') {
            return Err(HttpError::bad_request("Bad URL").abort());
        }
        self.x.rx.path_info = parsed.path.clone();
        self.x.rx.script_name = String::new();
        self.x.tx.ext = parsed.ext.clone();

        let mut parsed = parsed;
        if parsed.host.is_none() {
            parsed.host = self
                .x
                .rx
                .host_header
                .as_deref()
                .map(|h| h.split(':').next().unwrap_or("").to_string());
        }
        self.x.rx.parsed_uri = Some(parsed);
        Ok(())
    }

    /// Synchronously acknowledge `Expect: 100-continue`, bypassing the
    /// pipeline.
    fn send_continue(&mut self) {
        if !self.x.tx.finalized && self.x.tx.bytes_written == 0 {
            self.x
                .out
                .extend_from_slice(format!("{} 100 Continue\r\n\r\n", self.protocol).as_bytes());
        }
    }
}

#[cfg(test)]
mod rx_self {
    use super::*;
    use crate::{conn::Conn, limits::HttpLimits, pipeline::Exchange, service::Service, stage};
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    struct Nop;

    impl stage::Handler for Nop {
        fn ready(&self, x: &mut Exchange) {
            x.tx.status = 200;
            x.finalize();
        }
    }

    fn parse(request: &str) -> Conn {
        let mut conn = Conn::server(
            Service::new(),
            Arc::new(HttpLimits::server_defaults()),
            Arc::new(Nop),
        );
        conn.feed(request.as_bytes());
        conn.pump();
        conn
    }

    #[test]
    fn request_line() {
        #[rustfmt::skip]
        let cases = [
            ("GET /a HTTP/1.1\r\n\r\n",      Ok(("GET", "/a", false))),
            ("get /a HTTP/1.1\r\n\r\n",      Ok(("GET", "/a", false))),
            ("POST /u/v HTTP/1.0\r\n\r\n",   Ok(("POST", "/u/v", true))),
            ("BREW /pot HTTP/1.1\r\n\r\n",   Ok(("BREW", "/pot", false))),

            ("GET / HTTP/2.0\r\n\r\n",       Err(406u16)),
            ("GET / FTP/1.1\r\n\r\n",        Err(406)),
            ("GET\r\n\r\n",                  Err(400)),
        ];

        for (request, expected) in cases {
            let conn = parse(request);
            match expected {
                Ok((method, uri, http10)) => {
                    assert!(conn.error.is_none(), "{request:?}");
                    assert_eq!(conn.x.rx.method, method);
                    assert_eq!(conn.x.rx.uri, uri);
                    assert_eq!(conn.http10, http10, "{request:?}");
                }
                Err(status) => {
                    let err = conn.error.as_ref().expect(request);
                    assert_eq!(err.status, status, "{request:?}");
                }
            }
        }
    }

    #[test]
    fn leading_blank_lines_are_tolerated() {
        let conn = parse("\r\n\r\nGET /a HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(conn.error.is_none());
        assert_eq!(conn.x.rx.uri, "/a");
    }

    #[test]
    fn header_values_and_duplicates() {
        let conn = parse(
            "GET / HTTP/1.1\r\nHost: x\r\nX-Tag: one\r\nX-TAG: two\r\n\
             Cookie: a=1\r\nCookie: b=2\r\nX-Trim:    padded\r\n\r\n",
        );
        assert!(conn.error.is_none());
        let rx = &conn.x.rx;
        assert_eq!(rx.headers.get("x-tag"), Some("one, two"));
        assert_eq!(rx.headers.get("cookie"), Some("a=1, b=2"));
        assert_eq!(rx.cookie.as_deref(), Some("a=1; b=2"));
        assert_eq!(rx.headers.get("x-trim"), Some("padded"));
    }

    #[test]
    fn folded_header_continuation() {
        let conn = parse("GET / HTTP/1.1\r\nX-Long: first\r\n  second\r\nHost: x\r\n\r\n");
        assert!(conn.error.is_none());
        assert_eq!(conn.x.rx.headers.get("x-long"), Some("first second"));
        assert_eq!(conn.x.rx.host_header.as_deref(), Some("x"));
    }

    #[test]
    fn bad_header_keys_are_rejected() {
        #[rustfmt::skip]
        let cases = [
            "GET / HTTP/1.1\r\nBad%Key: v\r\n\r\n",
            "GET / HTTP/1.1\r\nBad<Key: v\r\n\r\n",
            "GET / HTTP/1.1\r\nBad>Key: v\r\n\r\n",
            "GET / HTTP/1.1\r\nBad/Key: v\r\n\r\n",
            "GET / HTTP/1.1\r\nBad\\Key: v\r\n\r\n",
            "GET / HTTP/1.1\r\n: empty\r\n\r\n",
            "GET / HTTP/1.1\r\nNo-Colon value\r\n\r\n",
        ];

        for request in cases {
            let conn = parse(request);
            let err = conn.error.as_ref().expect(request);
            assert_eq!(err.status, 400, "{request:?}");
        }
    }

    #[test]
    fn too_many_headers_hit_the_limit() {
        let limits = HttpLimits::server_defaults();
        let mut request = String::from("GET / HTTP/1.1\r\n");
        for i in 0..=limits.header_max {
            request.push_str(&format!("X-H{}: v\r\n", i));
        }
        request.push_str("\r\n");

        let conn = parse(&request);
        let err = conn.error.as_ref().unwrap();
        assert_eq!(err.status, 400);
        assert!(err.message().contains("Too many headers"));
    }

    #[test]
    fn semantic_header_dispatch() {
        let conn = parse(
            "POST /p?k=v HTTP/1.1\r\n\
             Host: example.com:8080\r\n\
             Authorization: Basic dXNlcjpwdw==\r\n\
             User-Agent: pump-test/1.0\r\n\
             Referer: http://elsewhere/\r\n\
             Origin: http://example.com\r\n\
             Upgrade: websocket\r\n\
             Accept: text/*\r\n\
             Accept-Encoding: gzip\r\n\
             Content-Type: multipart/form-data; boundary=xyz\r\n\
             Content-Length: 0\r\n\
             X-Own-Params: 1\r\n\r\n",
        );
        assert!(conn.error.is_none());
        let rx = &conn.x.rx;

        assert_eq!(rx.host_header.as_deref(), Some("example.com:8080"));
        assert_eq!(rx.auth_type.as_deref(), Some("basic"));
        assert_eq!(rx.auth_details.as_deref(), Some("dXNlcjpwdw=="));
        assert_eq!(rx.user_agent.as_deref(), Some("pump-test/1.0"));
        assert_eq!(rx.referrer.as_deref(), Some("http://elsewhere/"));
        assert_eq!(rx.origin.as_deref(), Some("http://example.com"));
        assert_eq!(rx.upgrade.as_deref(), Some("websocket"));
        assert_eq!(rx.accept.as_deref(), Some("text/*"));
        assert_eq!(rx.accept_encoding.as_deref(), Some("gzip"));
        assert!(rx.upload);
        assert!(!rx.form);
        assert!(rx.own_params);

        let parsed = rx.parsed_uri.as_ref().unwrap();
        assert_eq!(parsed.path, "/p");
        assert_eq!(parsed.query.as_deref(), Some("k=v"));
        assert_eq!(parsed.host.as_deref(), Some("example.com"));
    }

    #[test]
    fn method_override_header() {
        let conn = parse("POST / HTTP/1.1\r\nHost: x\r\nX-HTTP-Method-Override: DELETE\r\n\r\n");
        assert_eq!(conn.x.rx.method, "DELETE");
        assert_eq!(conn.x.rx.method_kind, Some(crate::proto::Method::Delete));
    }

    #[test]
    fn conditional_headers_set_polarity() {
        let conn = parse(
            "GET / HTTP/1.1\r\nHost: x\r\n\
             If-Modified-Since: Sun, 01 Jan 2023 00:00:00 GMT\r\n\
             If-None-Match: \"abc\", \"def\"\r\n\r\n",
        );
        let rx = &conn.x.rx;
        assert!(rx.if_condition);
        assert!(rx.if_modified);
        assert!(!rx.if_match);
        assert!(rx.since.is_some());
        assert_eq!(rx.etags, vec!["\"abc\"".to_string(), "\"def\"".to_string()]);

        let conn = parse(
            "GET / HTTP/1.1\r\nHost: x\r\n\
             If-Unmodified-Since: Sun, 01 Jan 2023 00:00:00 GMT\r\nIf-Match: \"abc\"\r\n\r\n",
        );
        let rx = &conn.x.rx;
        assert!(!rx.if_modified);
        assert!(rx.if_match);
    }

    #[test]
    fn match_modified_polarity() {
        let since = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let older = since - Duration::from_secs(60);
        let newer = since + Duration::from_secs(60);

        let mut rx = Rx::new(Role::Server);
        assert!(rx.match_modified(newer));

        rx.since = Some(since);
        rx.if_modified = true;
        assert!(rx.match_modified(older));
        assert!(rx.match_modified(since));
        assert!(!rx.match_modified(newer));

        rx.if_modified = false;
        assert!(rx.match_modified(newer));
        assert!(!rx.match_modified(older));
    }

    #[test]
    fn match_etag_polarity() {
        let mut rx = Rx::new(Role::Server);
        assert!(rx.match_etag(Some("\"abc\"")));

        rx.etags.push("\"abc\"".to_string());
        rx.if_match = false; // If-None-Match
        assert!(rx.match_etag(Some("\"abc\"")));
        assert!(!rx.match_etag(Some("\"zzz\"")));
        assert!(!rx.match_etag(None));

        rx.if_match = true; // If-Match
        assert!(!rx.match_etag(Some("\"abc\"")));
        assert!(rx.match_etag(Some("\"zzz\"")));
    }

    #[test]
    fn content_not_modified_invalidates_ranges() {
        let mut conn = parse(
            "GET / HTTP/1.1\r\nHost: x\r\nRange: bytes=0-4\r\n\
             If-None-Match: \"abc\"\r\n\r\n",
        );
        // Simulate the entity the handler would serve
        conn.x.tx.etag = Some("\"zzz\"".to_string());
        conn.x.tx.output_ranges = vec![crate::range::ByteRange { start: 0, end: 5 }];
        assert!(!conn.x.content_not_modified());
        assert!(conn.x.tx.output_ranges.is_empty());

        let mut conn = parse("GET / HTTP/1.1\r\nHost: x\r\nIf-None-Match: \"abc\"\r\n\r\n");
        conn.x.tx.etag = Some("\"abc\"".to_string());
        assert!(conn.x.content_not_modified());
    }

    #[test]
    fn header_round_trip_preserves_semantics() {
        let request = "GET / HTTP/1.1\r\nHost: x\r\nX-A: 1\r\nX-A: 2\r\n\
                       Accept: text/html\r\nX-Empty: \r\n\r\n";
        let first = parse(request);
        assert!(first.error.is_none());

        // Re-serialize the parsed map and parse it again
        let mut reemitted = String::from("GET / HTTP/1.1\r\n");
        for (key, value) in first.x.rx.headers.iter() {
            reemitted.push_str(&format!("{}: {}\r\n", key, value));
        }
        reemitted.push_str("\r\n");

        let second = parse(&reemitted);
        assert!(second.error.is_none());
        assert_eq!(first.x.rx.headers, second.x.rx.headers);
        assert_eq!(second.x.rx.headers.get("x-a"), Some("1, 2"));
    }

    #[test]
    fn parsed_uri_forms() {
        #[rustfmt::skip]
        let cases = [
            ("/a/b?q=1",                 Some(("/a/b", Some("q=1"), None, None))),
            ("/a/./b/../c",              Some(("/a/c", None, None, None))),
            ("/%48%49",                  Some(("/HI", None, None, None))),
            ("http://h/p",               Some(("/p", None, Some("h"), None))),
            ("http://h:81/p?x",          Some(("/p", Some("x"), Some("h"), Some(81)))),
            ("https://h/",               Some(("/", None, Some("h"), None))),
            ("/a/../..",                 None),
            ("http:///p",                None),
            ("/%zz",                     None),
        ];

        for (uri, expected) in cases {
            let parsed = ParsedUri::parse(uri);
            match expected {
                Some((path, query, host, port)) => {
                    let parsed = parsed.expect(uri);
                    assert_eq!(parsed.path, path, "{uri}");
                    assert_eq!(parsed.query.as_deref(), query, "{uri}");
                    assert_eq!(parsed.host.as_deref(), host, "{uri}");
                    assert_eq!(parsed.port, port, "{uri}");
                }
                None => assert!(parsed.is_none(), "{uri}"),
            }
        }
    }

    #[test]
    fn path_normalization_keeps_root() {
        assert_eq!(normalize_path("/"), Some("/".to_string()));
        assert_eq!(normalize_path("//a//b/"), Some("/a/b/".to_string()));
        assert_eq!(normalize_path("/a/b/.."), Some("/a".to_string()));
        assert_eq!(normalize_path("/.."), None);
    }
}
