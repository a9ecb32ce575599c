//! Queues: per-direction packet buffers linking pipeline stages

use crate::packet::{Packet, PacketFlags};
use std::collections::VecDeque;

/// Index of a queue in its connection's queue arena.
///
/// Queues are arena-allocated per request; ids are never reused within a
/// request, so a stale id is a logic error rather than a use-after-free.
pub type QueueId = usize;

/// Data flow direction relative to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    /// Network toward the handler.
    Incoming,
    /// Handler toward the network.
    Outgoing,
}

/// A stage's buffer in one direction.
///
/// Invariants:
/// - `count` is the byte total of queued packets and never goes negative.
/// - A producer facing `count >= max` must split packets or disable
///   itself; it may momentarily overshoot by at most one `packet_size`.
/// - `low` is the resume watermark: 5% of `max`.
#[derive(Debug)]
pub struct Queue {
    pub name: &'static str,
    pub(crate) stage: usize,
    pub dir: Dir,
    pub(crate) packets: VecDeque<Packet>,
    pub count: usize,
    pub packet_size: usize,
    pub max: usize,
    pub low: usize,

    /// Downstream neighbour in this queue's chain; `id == next` marks the
    /// chain tail.
    pub(crate) next: QueueId,
    pub(crate) prev: QueueId,

    pub(crate) disabled: bool,
    pub(crate) suspended: bool,
    pub(crate) full: bool,
    pub(crate) serviced: bool,
    pub(crate) reservice: bool,
    pub(crate) opened: bool,
    pub(crate) servicing: bool,
    pub(crate) scheduled: bool,
}

impl Queue {
    pub(crate) fn new(name: &'static str, stage: usize, dir: Dir, buffer_size: usize) -> Self {
        Self {
            name,
            stage,
            dir,
            packets: VecDeque::new(),
            count: 0,
            packet_size: buffer_size,
            max: buffer_size,
            low: buffer_size / 100 * 5,
            next: 0,
            prev: 0,
            disabled: false,
            suspended: false,
            full: false,
            serviced: false,
            reservice: false,
            opened: false,
            servicing: false,
            scheduled: false,
        }
    }

    /// Append a packet for later servicing.
    pub fn put_back(&mut self, packet: Packet) {
        self.count += packet.len();
        self.packets.push_back(packet);
    }

    /// Put a packet back at the head, e.g. after a partial service pass.
    pub fn put_front(&mut self, packet: Packet) {
        self.count += packet.len();
        self.packets.push_front(packet);
    }

    /// Take the head packet.
    pub fn get_packet(&mut self) -> Option<Packet> {
        let packet = self.packets.pop_front()?;
        self.count -= packet.len();
        debug_assert!(self.packets.is_empty() || self.count > 0 || self.all_zero_len());
        Some(packet)
    }

    fn all_zero_len(&self) -> bool {
        self.packets.iter().all(|p| p.len() == 0)
    }

    #[inline]
    pub fn first(&self) -> Option<&Packet> {
        self.packets.front()
    }

    #[inline]
    pub fn first_mut(&mut self) -> Option<&mut Packet> {
        self.packets.front_mut()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Bytes this queue will still accept. Always non-negative.
    #[inline]
    pub fn room(&self) -> usize {
        self.max.saturating_sub(self.count)
    }

    /// Append bytes to the trailing data packet, as many as fit its
    /// current capacity. Returns the number absorbed.
    pub(crate) fn fill_last(&mut self, buf: &[u8]) -> usize {
        match self.packets.back_mut() {
            Some(last) if last.is_data() && !last.flags.contains(PacketFlags::SOLO) => {
                let n = last.fill(buf);
                self.count += n;
                n
            }
            _ => 0,
        }
    }

    /// Remove body data from the queue. Header and END packets survive.
    /// With `remove_packets`, drained packets are dropped entirely;
    /// otherwise they stay as empty husks preserving order. Returns the
    /// number of bytes discarded.
    pub(crate) fn discard_data(&mut self, remove_packets: bool) -> usize {
        let mut discarded = 0;
        if remove_packets {
            self.packets.retain(|p| {
                if p.flags.contains(PacketFlags::DATA | PacketFlags::RANGE) {
                    discarded += p.len();
                    false
                } else {
                    true
                }
            });
        } else {
            for p in self.packets.iter_mut() {
                if p.flags.contains(PacketFlags::DATA | PacketFlags::RANGE) {
                    discarded += p.content.len();
                    p.content.clear();
                }
            }
        }
        self.count -= discarded;
        discarded
    }
}

#[cfg(test)]
mod queue_self {
    use super::*;
    use bytes::BytesMut;

    fn data(bytes: &[u8]) -> Packet {
        Packet::from_content(BytesMut::from(bytes))
    }

    #[test]
    fn counts_follow_packets() {
        let mut q = Queue::new("test", 0, Dir::Incoming, 100);

        q.put_back(data(b"hello"));
        q.put_back(data(b"world!"));
        assert_eq!(q.count, 11);
        assert_eq!(q.room(), 89);

        let first = q.get_packet().unwrap();
        assert_eq!(&first.content[..], b"hello");
        assert_eq!(q.count, 6);

        q.put_front(first);
        assert_eq!(q.count, 11);
        assert_eq!(&q.first().unwrap().content[..], b"hello");
    }

    #[test]
    fn low_watermark_is_five_percent() {
        let q = Queue::new("test", 0, Dir::Outgoing, 32 * 1024);
        assert_eq!(q.low, 32 * 1024 / 100 * 5);
        assert_eq!(q.max, 32 * 1024);
    }

    #[test]
    fn fill_last_only_touches_trailing_data() {
        let mut q = Queue::new("test", 0, Dir::Outgoing, 100);
        assert_eq!(q.fill_last(b"x"), 0);

        let mut p = Packet::data(8);
        p.fill(b"abc");
        q.put_back(p);
        assert_eq!(q.fill_last(b"defgh"), 5);
        assert_eq!(q.count, 8);
        assert_eq!(q.fill_last(b"zz"), 0);

        q.put_back(Packet::end());
        assert_eq!(q.fill_last(b"zz"), 0);
    }

    #[test]
    fn discard_keeps_framing() {
        let mut q = Queue::new("test", 0, Dir::Outgoing, 100);
        q.put_back(Packet::header(16));
        q.put_back(data(b"body bytes"));
        q.put_back(Packet::end());

        let discarded = q.discard_data(false);
        assert_eq!(discarded, 10);
        assert_eq!(q.packets.len(), 3);
        assert_eq!(q.count, 0);

        q.put_back(data(b"more"));
        let discarded = q.discard_data(true);
        assert_eq!(discarded, 4);
        // Only header and END survive; data husks are removed too
        assert_eq!(q.packets.len(), 2);
    }
}
