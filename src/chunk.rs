//! Chunked transfer encoding: decode filter state machine and encoder

use crate::{
    errors::HttpError,
    packet::Packet,
    pipeline::Exchange,
    proto::{self, Version},
    queue::QueueId,
    rx::Rx,
    stage::{Stage, StageKind},
};
use bytes::BytesMut;
use memchr::memmem;

/// Chunk decoder state, kept on [`Rx`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Body is not chunk encoded.
    Unchunked,
    /// Expecting `[CRLF] HEX-SIZE [;extension] CRLF`.
    Start,
    /// Consuming exactly `chunk_size` data bytes.
    Data,
    /// Zero-size chunk seen; consuming trailer lines to the final CRLF.
    Eof,
}

/// A chunk size line never legitimately gets this long.
const MAX_CHUNK_LINE: usize = 80;

/// Advance the decoder over `content`, consuming framing bytes in place.
///
/// Returns how many leading bytes of `content` are body data of the
/// current chunk; 0 means more input is needed (or the stream ended, when
/// `rx.eof` gets set). The caller accounts consumed data against
/// `rx.remaining_content`; this function re-arms the `Start` state when a
/// chunk's data has been fully accounted.
pub(crate) fn filter_chunk_data(rx: &mut Rx, content: &mut BytesMut) -> Result<usize, HttpError> {
    loop {
        match rx.chunk_state {
            ChunkState::Unchunked => return Ok(content.len()),

            ChunkState::Data => {
                if rx.remaining_content > 0 {
                    return Ok((rx.remaining_content as usize).min(content.len()));
                }
                rx.chunk_state = ChunkState::Start;
            }

            ChunkState::Start => {
                // Between chunks the data's trailing CRLF precedes the
                // size line; for the first chunk the header parser left
                // the blank line in the buffer to play that role.
                let skip = if content.starts_with(b"\r\n") { 2 } else { 0 };
                let Some(eol) = memmem::find(&content[skip..], b"\r\n") else {
                    if content.len() > skip + MAX_CHUNK_LINE {
                        return Err(HttpError::bad_request("Bad chunk specification").abort());
                    }
                    return Ok(0);
                };
                let line = &content[skip..skip + eol];
                let size_token = match memchr::memchr(b';', line) {
                    Some(semi) => &line[..semi],
                    None => line,
                };
                let size = proto::parse_hex(size_token)
                    .ok_or_else(|| HttpError::bad_request("Bad chunk specification").abort())?;

                let _ = content.split_to(skip + eol + 2);
                if size == 0 {
                    rx.chunk_state = ChunkState::Eof;
                } else {
                    rx.chunk_size = size;
                    rx.remaining_content = size as i64;
                    rx.chunk_state = ChunkState::Data;
                }
            }

            ChunkState::Eof => {
                // Trailer lines, terminated by a bare CRLF
                let Some(eol) = memmem::find(content, b"\r\n") else {
                    if content.len() > MAX_CHUNK_LINE {
                        return Err(HttpError::bad_request("Bad chunk trailer").abort());
                    }
                    return Ok(0);
                };
                let blank = eol == 0;
                let _ = content.split_to(eol + 2);
                if blank {
                    rx.remaining_content = 0;
                    rx.eof = true;
                    return Ok(0);
                }
            }
        }
    }
}

/// Chunk-encode a byte string at a fixed chunk size. Test and embedder
/// utility; the pipeline encoder below frames packets incrementally.
pub fn encode(body: &[u8], chunk_size: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for chunk in body.chunks(chunk_size.max(1)) {
        out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}

// THE FILTER

/// Outgoing chunked framing. The incoming direction is handled by the
/// connection's content filter via [`filter_chunk_data`], which must see
/// raw bytes before they become packets.
pub(crate) struct ChunkFilter;

impl ChunkFilter {
    /// Attach the chunk prefix to a packet bound for the connector.
    fn frame(tx: &mut crate::tx::Tx, packet: &mut Packet) {
        let first = !tx.chunk_emitted;
        if packet.is_end() {
            packet.prefix = BytesMut::from(if first { &b"0\r\n\r\n"[..] } else { &b"\r\n0\r\n\r\n"[..] });
            tx.chunk_emitted = true;
        } else if packet.len() > 0 {
            let lead = if first { "" } else { "\r\n" };
            packet.prefix = BytesMut::from(format!("{}{:x}\r\n", lead, packet.len()).as_bytes());
            tx.chunk_emitted = true;
        }
    }
}

impl Stage for ChunkFilter {
    fn name(&self) -> &'static str {
        "chunkFilter"
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn outgoing_service(&self, x: &mut Exchange, q: QueueId) {
        // Framing is decided once, before the head is emitted. A fully
        // buffered response gets a computed Content-Length instead of
        // chunking; streaming output chunks on HTTP/1.1 and falls back to
        // close-delimited on HTTP/1.0.
        if !x.tx.head_written && !x.tx.framing_decided && x.tx.length < 0 {
            let ended = x.queue(q).packets.iter().any(|p| p.is_end());
            if ended {
                let total: usize = x
                    .queue(q)
                    .packets
                    .iter()
                    .filter(|p| p.is_data())
                    .map(|p| p.len())
                    .sum();
                x.tx.length = total as i64;
            } else if x.tx.version == Version::Http11 {
                x.tx.chunked = true;
            } else {
                x.tx.close_delimited = true;
            }
            x.tx.framing_decided = true;
        }

        while let Some(mut packet) = x.queue_mut(q).get_packet() {
            if !x.will_next_accept(q, &mut packet) {
                x.queue_mut(q).put_front(packet);
                return;
            }
            if x.tx.chunked {
                Self::frame(&mut x.tx, &mut packet);
            }
            x.put_next(q, packet);
        }
        x.release_backpressure(q);
    }
}
