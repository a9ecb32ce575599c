//! Tx: outgoing message state and head emission

use crate::{
    pipeline::{Exchange, Role},
    proto::{self, Version},
    range::ByteRange,
    rx::{Headers, ParsedUri},
};
use bytes::BytesMut;
use std::time::SystemTime;

/// Per-request outbound state.
///
/// The three finalization flags are distinct steps: `finalized` means the
/// handler declared no more body, `finalized_output` means the output
/// queue has emitted its END packet, and `finalized_connector` means the
/// connector flushed everything to the socket buffer. `FINALIZED` state
/// requires the first and the last.
#[derive(Debug)]
pub struct Tx {
    pub status: u16,
    /// Headers to emit verbatim. The engine adds its managed headers
    /// (Date, Content-Length, Transfer-Encoding, Connection) only when
    /// they are absent here.
    pub headers: Headers,

    /// Declared body length; -1 until known.
    pub length: i64,
    /// Full entity size when serving ranges out of it.
    pub(crate) entity_length: i64,
    /// Forced maximum chunk size for this transmission.
    pub chunk_size: Option<usize>,

    pub finalized: bool,
    pub finalized_output: bool,
    pub finalized_connector: bool,
    pub bytes_written: i64,
    pub(crate) write_blocked: bool,

    pub filename: Option<String>,
    pub ext: Option<String>,
    pub etag: Option<String>,
    /// Modification time of the entity, for conditional evaluation.
    pub file_modified: Option<SystemTime>,
    /// URI substituted for the request when this response is an error.
    pub error_document: Option<String>,

    pub(crate) version: Version,
    pub(crate) keep_alive: bool,
    pub(crate) started: bool,
    pub(crate) head_written: bool,
    pub(crate) chunked: bool,
    /// HTTP/1.0 streaming: the close marks the end of the body.
    pub(crate) close_delimited: bool,
    pub(crate) chunk_emitted: bool,
    pub(crate) framing_decided: bool,

    pub output_ranges: Vec<ByteRange>,
    pub(crate) content_range: Option<ByteRange>,
    pub(crate) range_boundary: Option<String>,
    pub(crate) range_pos: i64,
    pub(crate) ranges_armed: bool,
    pub(crate) range_emitted: usize,

    /// Client role: the request line to emit.
    pub method: String,
    pub uri: String,
    pub(crate) parsed_uri: Option<ParsedUri>,
}

impl Tx {
    pub(crate) fn new() -> Self {
        Self {
            status: proto::OK,
            headers: Headers::new(),
            length: -1,
            entity_length: -1,
            chunk_size: None,
            finalized: false,
            finalized_output: false,
            finalized_connector: false,
            bytes_written: 0,
            write_blocked: false,
            filename: None,
            ext: None,
            etag: None,
            file_modified: None,
            error_document: None,
            version: Version::Http11,
            keep_alive: true,
            started: false,
            head_written: false,
            chunked: false,
            close_delimited: false,
            chunk_emitted: false,
            framing_decided: false,
            output_ranges: Vec::new(),
            content_range: None,
            range_boundary: None,
            range_pos: 0,
            ranges_armed: false,
            range_emitted: 0,
            method: String::new(),
            uri: String::new(),
            parsed_uri: None,
        }
    }
}

impl Exchange {
    /// Convenience for handlers: set a response header.
    pub fn set_header(&mut self, key: &str, value: &str) {
        self.tx.headers.set(key, value);
    }

    /// Declare the body length up front, pinning Content-Length framing.
    pub fn set_content_length(&mut self, length: i64) {
        self.tx.length = length;
    }

    /// Serialize the message head into the socket buffer. Called by the
    /// connector before the first body byte; a second call is a no-op.
    pub(crate) fn emit_head(&mut self) {
        if self.tx.head_written {
            return;
        }
        self.tx.head_written = true;

        let mut head = BytesMut::with_capacity(256);
        match self.role {
            Role::Server => {
                head.extend_from_slice(self.tx.version.as_str().as_bytes());
                head.extend_from_slice(
                    format!(
                        " {} {}\r\n",
                        self.tx.status,
                        proto::status_message(self.tx.status)
                    )
                    .as_bytes(),
                );
                if self.tx.headers.get("date").is_none() {
                    head.extend_from_slice(
                        format!("date: {}\r\n", self.service.current_date()).as_bytes(),
                    );
                }
            }
            Role::Client => {
                head.extend_from_slice(
                    format!("{} {} {}\r\n", self.tx.method, self.tx.uri, self.tx.version)
                        .as_bytes(),
                );
                if self.tx.headers.get("host").is_none() {
                    if let Some(parsed) = &self.tx.parsed_uri {
                        if let Some(host) = &parsed.host {
                            match parsed.port {
                                Some(port) if port != 80 => head.extend_from_slice(
                                    format!("host: {}:{}\r\n", host, port).as_bytes(),
                                ),
                                _ => head
                                    .extend_from_slice(format!("host: {}\r\n", host).as_bytes()),
                            }
                        }
                    }
                }
            }
        }

        for (key, value) in self.tx.headers.iter() {
            head.extend_from_slice(key.as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }

        if let (Some(range), entity) = (self.tx.content_range, self.tx.entity_length) {
            head.extend_from_slice(
                format!(
                    "content-range: bytes {}-{}/{}\r\n",
                    range.start,
                    range.end - 1,
                    entity
                )
                .as_bytes(),
            );
        }
        if let Some(boundary) = &self.tx.range_boundary {
            head.extend_from_slice(
                format!(
                    "content-type: multipart/byteranges; boundary={}\r\n",
                    boundary
                )
                .as_bytes(),
            );
        }

        if self.tx.chunked {
            head.extend_from_slice(b"transfer-encoding: chunked\r\n");
        } else if self.tx.length >= 0 && self.tx.headers.get("content-length").is_none() {
            head.extend_from_slice(format!("content-length: {}\r\n", self.tx.length).as_bytes());
        }

        if self.tx.status == proto::SWITCHING_PROTOCOLS {
            head.extend_from_slice(b"connection: upgrade\r\n");
        } else if !self.tx.keep_alive || self.tx.close_delimited {
            head.extend_from_slice(b"connection: close\r\n");
        } else if self.tx.version == Version::Http10 {
            head.extend_from_slice(b"connection: keep-alive\r\n");
        }

        head.extend_from_slice(b"\r\n");
        self.tx.bytes_written += head.len() as i64;
        self.out.extend_from_slice(&head);
    }

    /// Combined conditional evaluation: If-(Un)Modified-Since AND
    /// If-(None-)Match, against the entity this transmission describes.
    /// A false result invalidates any pre-computed output ranges.
    pub fn content_not_modified(&mut self) -> bool {
        if !self.rx.if_condition {
            return false;
        }
        let modified = match self.tx.file_modified {
            Some(time) => self.rx.match_modified(time),
            None => true,
        };
        let same = modified && self.rx.match_etag(self.tx.etag.as_deref());
        if !self.tx.output_ranges.is_empty() && !same {
            self.tx.output_ranges.clear();
        }
        same
    }
}
