//! Engine configuration limits and timeouts
//!
//! # Security-First Defaults
//!
//! Default limits are intentionally conservative to prevent:
//! - Resource exhaustion attacks
//! - Memory overflows
//! - Slowloris attacks
//! - Header flooding
//!
//! Every connection carries an `Arc<HttpLimits>`; server endpoints and
//! client connections may use different instances. Limits are read at
//! well-defined points of the request lifecycle (header receipt, body
//! receipt, queue creation), so changing an instance mid-request has no
//! effect on requests already past that point.
//!
//! # Examples
//!
//! ```
//! use pump_web::limits::HttpLimits;
//! use std::time::Duration;
//!
//! let limits = HttpLimits {
//!     header_size: 16 * 1024,
//!     inactivity_timeout: Duration::from_secs(30),
//!     ..HttpLimits::server_defaults()
//! };
//! assert!(limits.header_size > limits.uri_size);
//! ```

use std::time::Duration;

/// Numeric bounds and timeouts applied to a single connection.
///
/// Sizes are enforced while parsing and while pumping the pipeline,
/// timeouts are enforced by the [service timer](crate::service::Service).
#[derive(Debug, Clone)]
pub struct HttpLimits {
    /// Default buffer and high watermark for pipeline queues (default: `32 KB`).
    ///
    /// Every queue created for a stage starts with `max = buffer_size` and
    /// `packet_size = buffer_size`. Producers that would push a queue past
    /// this value are disabled until the queue drains below its low
    /// watermark (5% of `max`).
    pub buffer_size: usize,

    /// Maximum size of a single cachable response item (default: `256 KB`).
    pub cache_item_size: usize,

    /// Maximum chunk size emitted by the chunked-transfer encoder
    /// (default: `64 KB`). A request may lower the effective value per
    /// transmission but never raise it past this bound.
    pub chunk_size: usize,

    /// Maximum simultaneous client IP addresses (default: `32`).
    pub client_max: usize,

    /// Maximum simultaneous connections process-wide (default: `256`).
    pub connections_max: usize,

    /// Maximum number of headers in one message (default: `64`).
    pub header_max: usize,

    /// Maximum total size of the header block in bytes (default: `16 KB`).
    ///
    /// Exceeding this while accumulating the header block aborts the
    /// connection with `413`.
    pub header_size: usize,

    /// Maximum requests served over one keep-alive connection (default: `200`).
    pub keep_alive_max: usize,

    /// Maximum size of an urlencoded form body (default: `64 KB`).
    ///
    /// Forms are fully buffered for parameter processing, so this is
    /// deliberately much lower than [`receive_body_size`](Self::receive_body_size).
    pub receive_form_size: i64,

    /// Maximum size of any request body (default: `128 MB`).
    pub receive_body_size: i64,

    /// Maximum simultaneous external processes (default: `10`).
    pub process_max: usize,

    /// Maximum concurrent requests from one client address (default: `20`).
    pub requests_per_client_max: usize,

    /// Maximum concurrent sessions (default: `100`).
    pub session_max: usize,

    /// Maximum size of a response body (default: `2 GB`).
    pub transmission_body_size: i64,

    /// Maximum size of an uploaded file (default: `unlimited`).
    pub upload_size: i64,

    /// Maximum length of a request URI, and of a response status message
    /// (default: `512 B`).
    pub uri_size: usize,

    /// Close a connection with no socket activity for this long
    /// (default: `30 s`). The primary defence against stalled peers.
    pub inactivity_timeout: Duration,

    /// Hard ceiling on the total duration of one request
    /// (default: `5 min`).
    pub request_timeout: Duration,

    /// Server side only: a request whose headers have not fully arrived
    /// within this window is aborted (default: `5 s`). Defeats slowloris
    /// clients that trickle header bytes.
    pub request_parse_timeout: Duration,

    /// Session state lifetime (default: `30 min`). Consulted by session
    /// stores layered on top of the engine; the core only transports it.
    pub session_timeout: Duration,
}

impl HttpLimits {
    /// Conservative limits for server-side connections.
    pub fn server_defaults() -> Self {
        Self {
            buffer_size: 32 * 1024,
            cache_item_size: 256 * 1024,
            chunk_size: 64 * 1024,
            client_max: 32,
            connections_max: 256,
            header_max: 64,
            header_size: 16 * 1024,
            keep_alive_max: 200,
            receive_form_size: 64 * 1024,
            receive_body_size: 128 * 1024 * 1024,
            process_max: 10,
            requests_per_client_max: 20,
            session_max: 100,
            transmission_body_size: 2 * 1024 * 1024 * 1024,
            upload_size: i64::MAX,
            uri_size: 512,
            inactivity_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5 * 60),
            request_parse_timeout: Duration::from_secs(5),
            session_timeout: Duration::from_secs(30 * 60),
        }
    }

    /// Limits for client-side (outbound) connections: same sizes, but no
    /// tight parse deadline since the peer is a server we chose to talk to.
    pub fn client_defaults() -> Self {
        Self {
            request_parse_timeout: Duration::from_secs(60),
            ..Self::server_defaults()
        }
    }

    /// Raise the four body-size limits to the maximum representable
    /// offset. Used by embedders that do their own quota enforcement.
    pub fn ease_limits(&mut self) {
        self.receive_form_size = i64::MAX;
        self.receive_body_size = i64::MAX;
        self.transmission_body_size = i64::MAX;
        self.upload_size = i64::MAX;
    }
}

impl Default for HttpLimits {
    #[inline]
    fn default() -> Self {
        Self::server_defaults()
    }
}
