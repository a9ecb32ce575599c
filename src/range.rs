//! Byte ranges: Range / Content-Range parsing and the output range filter

use crate::{
    packet::{Packet, PacketFlags},
    pipeline::Exchange,
    proto,
    queue::QueueId,
    stage::{Stage, StageKind},
};
use bytes::BytesMut;

/// A half-open byte range `[start, end)`.
///
/// Until [`fix_ranges`] resolves them against the entity length, parsed
/// ranges use the wire conventions: `start == -1` marks a suffix range
/// (`bytes=-N`, with `end == N + 1`) and `end == -1` marks an open range
/// (`bytes=N-`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: i64,
    pub end: i64,
}

impl ByteRange {
    #[inline]
    pub fn len(&self) -> i64 {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() <= 0
    }
}

/// Parse a request `Range` header: `bytes=n1-n2,n3-n4,...`
///
/// Examples:
/// - `bytes=0-49` — first 50 bytes
/// - `bytes=50-99,200-249` — two 50 byte ranges
/// - `bytes=-50` — last 50 bytes
/// - `bytes=1-` — skip the first byte, emit the rest
///
/// Returns `None` for malformed, descending, or overlapping ranges.
pub(crate) fn parse_range_header(value: &[u8]) -> Option<Vec<ByteRange>> {
    let list = match memchr::memchr(b'=', value) {
        Some(eq) => &value[eq + 1..],
        None => value,
    };
    let mut ranges = Vec::new();

    for token in list.split(|&b| b == b',') {
        let token: &[u8] = token.strip_prefix(b" ").unwrap_or(token);
        if token.is_empty() {
            return None;
        }
        let (start, after) = if token[0] == b'-' {
            (-1, token)
        } else {
            let (value, rest) = proto::take_dec(token);
            (value?, rest)
        };
        let mut end = -1;
        if let Some(dash) = memchr::memchr(b'-', after) {
            let tail = &after[dash + 1..];
            if !tail.is_empty() {
                // End is stored one beyond the range to ease the math
                end = proto::parse_dec(tail)? + 1;
            }
        } else {
            return None;
        }
        ranges.push(ByteRange { start, end });
    }
    if ranges.is_empty() {
        return None;
    }

    // Validate: ascending, non-overlapping, suffix/open only at the end
    for (i, range) in ranges.iter().enumerate() {
        if range.end != -1 && range.start >= range.end {
            return None;
        }
        if range.start < 0 && range.end < 0 {
            return None;
        }
        let next = ranges.get(i + 1);
        if range.start < 0 && next.is_some() {
            return None;
        }
        if let Some(next) = next {
            if range.end < 0 {
                return None;
            }
            if next.start >= 0 && range.end > next.start {
                return None;
            }
        }
    }
    Some(ranges)
}

/// Parse a request `Content-Range` header: `bytes start-end/size`.
/// Requires `0 <= start < end <= size`.
pub(crate) fn parse_content_range(value: &[u8]) -> Option<(ByteRange, i64)> {
    let digits = proto::skip_to_digit(value);
    let (start, rest) = proto::take_dec(digits);
    let start = start?;
    let rest = rest.strip_prefix(b"-")?;
    let (end, rest) = proto::take_dec(rest);
    let end = end?;
    let rest = rest.strip_prefix(b"/")?;
    let (size, _) = proto::take_dec(rest);
    let size = size?;

    if start >= end || end > size {
        return None;
    }
    Some((ByteRange { start, end }, size))
}

/// Resolve suffix and open ranges against the entity length. Returns
/// false when the ranges cannot be satisfied (unknown length, start past
/// the end); the caller then serves the full entity instead.
pub(crate) fn fix_ranges(ranges: &mut [ByteRange], length: i64) -> bool {
    if length <= 0 {
        return false;
    }
    for range in ranges.iter_mut() {
        if range.start < 0 {
            // Suffix: end holds the suffix byte count + 1
            range.start = (length - range.end + 1).max(0);
            range.end = length;
        }
        if range.end < 0 || range.end > length {
            range.end = length;
        }
        if range.start >= range.end || range.start >= length {
            return false;
        }
    }
    true
}

// THE FILTER

/// Slices outgoing data packets into the requested byte ranges.
///
/// A single range rewrites the response to `206 Partial Content` with a
/// `Content-Range` header; multiple ranges emit `multipart/byteranges`
/// parts delimited by a per-request boundary.
pub(crate) struct RangeFilter;

impl RangeFilter {
    fn boundary_head(x: &Exchange, range: &ByteRange) -> Packet {
        let boundary = x.tx.range_boundary.as_deref().unwrap_or("");
        let head = format!(
            "\r\n--{}\r\nContent-Range: bytes {}-{}/{}\r\n\r\n",
            boundary,
            range.start,
            range.end - 1,
            x.tx.entity_length
        );
        let mut packet = Packet::from_content(BytesMut::from(head.as_bytes()));
        packet.flags.insert(PacketFlags::RANGE | PacketFlags::SOLO);
        packet
    }

    fn boundary_tail(x: &Exchange) -> Packet {
        let boundary = x.tx.range_boundary.as_deref().unwrap_or("");
        let mut packet =
            Packet::from_content(BytesMut::from(format!("\r\n--{}--\r\n", boundary).as_bytes()));
        packet.flags.insert(PacketFlags::RANGE | PacketFlags::SOLO);
        packet
    }

    /// Decide once, before the head is written, whether ranged output
    /// applies to this response.
    fn arm(x: &mut Exchange) {
        if x.tx.ranges_armed || x.tx.head_written {
            return;
        }
        x.tx.ranges_armed = true;
        if x.tx.output_ranges.is_empty() || x.tx.status != proto::OK {
            x.tx.output_ranges.clear();
            return;
        }
        let mut ranges = std::mem::take(&mut x.tx.output_ranges);
        if !fix_ranges(&mut ranges, x.tx.length) {
            return;
        }
        x.tx.entity_length = x.tx.length;
        x.tx.status = proto::PARTIAL_CONTENT;
        if ranges.len() == 1 {
            x.tx.content_range = Some(ranges[0]);
            x.tx.length = ranges[0].len();
        } else {
            x.tx.range_boundary = Some(x.service.next_boundary());
            // Parts are framed as they stream; length is recomputed by
            // the downstream framing decision
            x.tx.length = -1;
        }
        x.tx.output_ranges = ranges;
    }

    /// Map a data packet at entity offset `offset` onto the ranges,
    /// emitting the intersecting slices downstream.
    fn apply(x: &mut Exchange, q: QueueId, packet: Packet, offset: i64) {
        let span_end = offset + packet.len() as i64;
        let ranges = x.tx.output_ranges.clone();
        let multi = ranges.len() > 1;

        for (i, range) in ranges.iter().enumerate() {
            let start = range.start.max(offset);
            let end = range.end.min(span_end);
            if start >= end {
                continue;
            }
            if multi && x.tx.range_emitted <= i {
                x.tx.range_emitted = i + 1;
                let head = Self::boundary_head(x, range);
                x.put_next(q, head);
            }
            let from = (start - offset) as usize;
            let to = (end - offset) as usize;
            let mut slice = Packet::from_content(BytesMut::from(&packet.content[from..to]));
            slice.flags.insert(PacketFlags::RANGE);
            x.put_next(q, slice);
        }
    }
}

impl Stage for RangeFilter {
    fn name(&self) -> &'static str {
        "rangeFilter"
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn outgoing_service(&self, x: &mut Exchange, q: QueueId) {
        Self::arm(x);

        while let Some(mut packet) = x.queue_mut(q).get_packet() {
            if !x.will_next_accept(q, &mut packet) {
                x.queue_mut(q).put_front(packet);
                return;
            }
            if x.tx.output_ranges.is_empty() {
                x.put_next(q, packet);
                continue;
            }
            if packet.is_end() {
                if x.tx.output_ranges.len() > 1 {
                    let tail = Self::boundary_tail(x);
                    x.put_next(q, tail);
                }
                x.put_next(q, packet);
            } else if packet.is_data() {
                let offset = x.tx.range_pos;
                x.tx.range_pos += packet.len() as i64;
                Self::apply(x, q, packet, offset);
            } else {
                x.put_next(q, packet);
            }
        }
        x.release_backpressure(q);
    }
}
