//! Packets: the unit of data flow through pipeline queues

use bytes::{BufMut, BytesMut};

// FLAGS

/// Packet classification bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// Carries the header-fields snapshot for the message head.
    pub const HEADER: Self = Self(1 << 0);
    /// Carries entity body bytes.
    pub const DATA: Self = Self(1 << 1);
    /// Emitted by the range filter: a slice of the entity.
    pub const RANGE: Self = Self(1 << 2);
    /// Terminates the stream. Always zero-length, never reordered.
    pub const END: Self = Self(1 << 3);
    /// Must travel alone: never coalesced with neighbouring packets.
    pub const SOLO: Self = Self(1 << 4);

    #[inline]
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for PacketFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// PACKET

/// A byte-range carrier flowing through the pipeline.
///
/// A packet owns its content buffer plus an optional framing prefix (the
/// chunk encoder writes size lines there so the body bytes stay intact
/// for downstream stages). `entity_len` pre-accounts body bytes that are
/// produced outside the buffer, e.g. file regions a connector streams
/// directly.
///
/// Invariant: [`len`](Self::len) equals the readable content span plus any
/// pre-accounted entity size; an `END` packet has length 0.
#[derive(Debug, Default)]
pub struct Packet {
    pub(crate) flags: PacketFlags,
    pub(crate) prefix: BytesMut,
    pub(crate) content: BytesMut,
    pub(crate) entity_len: i64,
}

impl Packet {
    /// A packet holding serialized header fields.
    pub fn header(capacity: usize) -> Self {
        Self {
            flags: PacketFlags::HEADER,
            prefix: BytesMut::new(),
            content: BytesMut::with_capacity(capacity),
            entity_len: 0,
        }
    }

    /// An empty body packet with room for `capacity` bytes.
    pub fn data(capacity: usize) -> Self {
        Self {
            flags: PacketFlags::DATA,
            prefix: BytesMut::new(),
            content: BytesMut::with_capacity(capacity),
            entity_len: 0,
        }
    }

    /// A body packet owning `content` outright.
    pub fn from_content(content: BytesMut) -> Self {
        Self {
            flags: PacketFlags::DATA,
            prefix: BytesMut::new(),
            content,
            entity_len: 0,
        }
    }

    /// The end-of-stream marker.
    pub fn end() -> Self {
        Self {
            flags: PacketFlags::END,
            prefix: BytesMut::new(),
            content: BytesMut::new(),
            entity_len: 0,
        }
    }

    /// A body packet whose bytes live outside the buffer (pre-accounted
    /// entity data of `len` bytes).
    pub fn entity(len: i64) -> Self {
        Self {
            flags: PacketFlags::DATA,
            prefix: BytesMut::new(),
            content: BytesMut::new(),
            entity_len: len,
        }
    }

    /// Readable span plus pre-accounted entity size.
    #[inline]
    pub fn len(&self) -> usize {
        self.content.len() + self.entity_len.max(0) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_end(&self) -> bool {
        self.flags.contains(PacketFlags::END)
    }

    #[inline]
    pub fn is_data(&self) -> bool {
        self.flags.contains(PacketFlags::DATA)
    }

    #[inline]
    pub fn is_header(&self) -> bool {
        self.flags.contains(PacketFlags::HEADER)
    }

    /// Remaining buffer capacity before a fresh allocation is needed.
    #[inline]
    pub(crate) fn room(&self) -> usize {
        self.content.capacity() - self.content.len()
    }

    /// Append as many of `buf`'s bytes as fit in the current capacity.
    /// Returns the number appended.
    pub(crate) fn fill(&mut self, buf: &[u8]) -> usize {
        let take = self.room().min(buf.len());
        self.content.put_slice(&buf[..take]);
        take
    }

    /// Split so that this packet keeps the first `at` bytes and the
    /// returned packet carries the remainder with the same flags. O(1) on
    /// the content buffer.
    pub(crate) fn split_at(&mut self, at: usize) -> Packet {
        debug_assert!(at <= self.content.len());
        Packet {
            flags: self.flags,
            prefix: BytesMut::new(),
            content: self.content.split_off(at),
            entity_len: 0,
        }
    }

    /// Bytes the connector must put on the wire: framing prefix first,
    /// then content.
    #[inline]
    pub(crate) fn wire_len(&self) -> usize {
        self.prefix.len() + self.content.len()
    }
}

#[cfg(test)]
mod packet_self {
    use super::*;

    #[test]
    fn lengths() {
        let mut p = Packet::data(16);
        assert_eq!(p.len(), 0);
        assert!(p.is_empty());

        assert_eq!(p.fill(b"hello"), 5);
        assert_eq!(p.len(), 5);

        let end = Packet::end();
        assert_eq!(end.len(), 0);
        assert!(end.is_end());

        let entity = Packet::entity(1024);
        assert_eq!(entity.len(), 1024);
    }

    #[test]
    fn fill_respects_capacity() {
        let mut p = Packet::data(4);
        assert_eq!(p.fill(b"abcdef"), 4);
        assert_eq!(p.fill(b"ef"), 0);
        assert_eq!(&p.content[..], b"abcd");
    }

    #[test]
    fn split_keeps_flags() {
        let mut p = Packet::from_content(BytesMut::from(&b"0123456789"[..]));
        let rest = p.split_at(4);

        assert_eq!(&p.content[..], b"0123");
        assert_eq!(&rest.content[..], b"456789");
        assert!(rest.is_data());
    }

    #[test]
    fn flag_set() {
        let mut flags = PacketFlags::DATA;
        flags.insert(PacketFlags::RANGE);

        assert!(flags.contains(PacketFlags::DATA));
        assert!(flags.contains(PacketFlags::RANGE));
        assert!(flags.contains(PacketFlags::DATA | PacketFlags::END));
        assert!(!flags.contains(PacketFlags::END));
    }
}
