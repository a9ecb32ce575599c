//! The pipeline: paired queue chains joining stages end-to-end
//!
//! Each request gets an [`Exchange`]: the received-state [`Rx`], the
//! transmit-state [`Tx`], an arena of [`Queue`]s forming the incoming and
//! outgoing chains, and the schedule ring that drives stage service
//! callbacks. All socket-bound bytes accumulate in [`Exchange::out`]; the
//! connection driver flushes that buffer to the socket.

use crate::{
    chunk::ChunkFilter,
    connector::NetConnector,
    errors::HttpError,
    limits::HttpLimits,
    packet::Packet,
    queue::{Dir, Queue, QueueId},
    range::RangeFilter,
    rx::Rx,
    service::Service,
    stage::{self, Handler, HandlerStage, Stage},
    tx::Tx,
};
use bytes::BytesMut;
use std::{collections::VecDeque, sync::Arc};
use tracing::trace;

/// Which role this exchange plays on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted by an endpoint; parses requests, emits responses.
    Server,
    /// Initiated by this process; emits requests, parses responses.
    Client,
}

/// Write-mode for [`Exchange::write_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Buffer everything, return the residual if the queue stays full.
    NonBlocking,
    /// Keep flushing until the queue drains below its high watermark.
    /// Only for embedders writing from outside the dispatcher.
    Blocking,
}

/// Per-request engine state: Rx, Tx, and the bidirectional queue chains.
pub struct Exchange {
    pub rx: Rx,
    pub tx: Tx,
    pub(crate) role: Role,
    pub(crate) limits: Arc<HttpLimits>,
    pub(crate) service: Arc<Service>,

    pub(crate) queues: Vec<Queue>,
    pub(crate) stages: Vec<Arc<dyn Stage>>,
    pub(crate) handler: Arc<dyn Handler>,
    /// Schedule ring: queues whose service slot is ready to run. A FIFO
    /// with a per-queue `scheduled` flag; order is not part of the
    /// contract.
    pub(crate) ring: VecDeque<QueueId>,
    pub(crate) built: bool,
    pub(crate) started: bool,

    /// Head of the incoming chain: where the connection delivers body
    /// packets from the socket.
    pub(crate) rx_head: QueueId,
    /// Tail of the incoming chain: the handler's receive queue.
    pub(crate) readq: QueueId,
    /// Head of the outgoing chain: the handler's transmit queue.
    pub(crate) writeq: QueueId,
    /// Tail of the outgoing chain: the connector's queue.
    pub(crate) connq: QueueId,
    /// Queue currently being serviced, for diagnostics.
    pub(crate) currentq: QueueId,

    /// Socket-bound bytes; the driver owns the actual write.
    pub(crate) out: BytesMut,
    /// Raised by stages mid-service; the connection absorbs it after the
    /// service pass.
    pub(crate) pending_error: Option<HttpError>,
    /// Set once the connection reaches COMPLETE; writes are rejected.
    pub(crate) retired: bool,
}

impl Exchange {
    pub(crate) fn new(role: Role, limits: Arc<HttpLimits>, service: Arc<Service>) -> Self {
        Self {
            rx: Rx::new(role),
            tx: Tx::new(),
            role,
            limits,
            service,
            queues: Vec::new(),
            stages: Vec::new(),
            handler: Arc::new(stage::SinkHandler),
            ring: VecDeque::new(),
            built: false,
            started: false,
            rx_head: 0,
            readq: 0,
            writeq: 0,
            connq: 0,
            currentq: 0,
            out: BytesMut::new(),
            pending_error: None,
            retired: false,
        }
    }

    #[inline]
    pub fn queue(&self, q: QueueId) -> &Queue {
        &self.queues[q]
    }

    #[inline]
    pub fn queue_mut(&mut self, q: QueueId) -> &mut Queue {
        &mut self.queues[q]
    }

    #[inline]
    fn stage_of(&self, q: QueueId) -> Arc<dyn Stage> {
        self.stages[self.queues[q].stage].clone()
    }
}

// Pipeline construction

impl Exchange {
    /// Build the two queue chains through the selected stages. Called
    /// exactly once per request: at PARSED on the server side, at connect
    /// on the client side.
    pub(crate) fn build_pipeline(&mut self, handler: Arc<dyn Handler>) {
        debug_assert!(!self.built);
        self.handler = handler;

        let chunk: Arc<dyn Stage> = Arc::new(ChunkFilter);
        let range: Arc<dyn Stage> = Arc::new(RangeFilter);
        let connector: Arc<dyn Stage> = Arc::new(NetConnector);
        let handler_stage: Arc<dyn Stage> = Arc::new(HandlerStage {
            handler: self.handler.clone(),
        });

        self.stages = vec![chunk, range, handler_stage, connector];
        let (chunk_s, range_s, handler_s, connector_s) = (0, 1, 2, 3);

        // Incoming: network -> chunk -> range -> handler
        let incoming = self.link_chain(Dir::Incoming, &[chunk_s, range_s, handler_s]);
        self.rx_head = incoming[0];
        self.readq = *incoming.last().expect("incoming chain");

        // Outgoing: handler -> range -> chunk -> connector. The range
        // filter slices the entity before the chunk filter frames it.
        let outgoing = self.link_chain(Dir::Outgoing, &[handler_s, range_s, chunk_s, connector_s]);
        self.writeq = outgoing[0];
        self.connq = *outgoing.last().expect("outgoing chain");

        self.built = true;

        for q in incoming.into_iter().chain(outgoing) {
            self.open_queue(q);
        }
    }

    fn link_chain(&mut self, dir: Dir, stages: &[usize]) -> Vec<QueueId> {
        let base = self.queues.len();
        let ids: Vec<QueueId> = (base..base + stages.len()).collect();

        for (i, &stage) in stages.iter().enumerate() {
            let name = self.stages[stage].name();
            let mut q = Queue::new(name, stage, dir, self.limits.buffer_size);
            q.next = if i + 1 < stages.len() { ids[i + 1] } else { ids[i] };
            q.prev = if i > 0 { ids[i - 1] } else { ids[i] };
            self.queues.push(q);
        }
        ids
    }

    fn open_queue(&mut self, q: QueueId) {
        if let Some(chunk_size) = self.tx.chunk_size {
            let queue = self.queue_mut(q);
            queue.packet_size = queue.packet_size.min(chunk_size);
        }
        self.queue_mut(q).opened = true;
        self.stage_of(q).open(self, q);
    }

    /// Run every stage's start slot, the handler last.
    pub(crate) fn start_pipeline(&mut self) {
        if self.started || !self.built {
            return;
        }
        self.started = true;
        self.tx.started = true;

        let order: Vec<QueueId> = (0..self.queues.len())
            .filter(|&q| self.queue(q).stage != self.handler_stage_index())
            .chain(
                (0..self.queues.len()).filter(|&q| self.queue(q).stage == self.handler_stage_index()),
            )
            .collect();
        for q in order {
            self.stage_of(q).start(self, q);
        }
    }

    #[inline]
    fn handler_stage_index(&self) -> usize {
        2
    }

    /// Run every stage's close slot and drop the chains.
    pub(crate) fn destroy_pipeline(&mut self) {
        if !self.built {
            return;
        }
        for q in 0..self.queues.len() {
            if self.queue(q).opened {
                self.queue_mut(q).opened = false;
                self.stage_of(q).close(self, q);
            }
        }
        for q in self.queues.iter_mut() {
            q.packets.clear();
            q.count = 0;
            q.scheduled = false;
        }
        self.ring.clear();
        self.built = false;
    }
}

// Packet movement

impl Exchange {
    /// Deliver a packet to a queue's data slot.
    pub fn put(&mut self, q: QueueId, packet: Packet) {
        let stage = self.stage_of(q);
        stage::put_slot(&stage, self, q, packet);
    }

    /// Deliver a packet to the next queue downstream.
    pub fn put_next(&mut self, q: QueueId, packet: Packet) {
        let next = self.queue(q).next;
        debug_assert_ne!(next, q, "put_next past the chain tail");
        self.put(next, packet);
    }

    /// Deliver a packet to the head of the incoming chain.
    pub fn put_to_pipeline(&mut self, packet: Packet) {
        let head = self.rx_head;
        self.put(head, packet);
    }

    /// Buffer a packet on `q`, optionally scheduling its service slot.
    pub fn put_for_service(&mut self, q: QueueId, packet: Packet, schedule: bool) {
        self.queue_mut(q).put_back(packet);
        if schedule {
            self.schedule(q);
        }
    }

    /// Splice a queue into the service ring unless already queued or
    /// disabled.
    pub fn schedule(&mut self, q: QueueId) {
        let queue = self.queue_mut(q);
        if !queue.scheduled && !queue.disabled {
            queue.scheduled = true;
            self.ring.push_back(q);
        }
    }

    /// Run scheduled service slots until the ring is empty. Returns true
    /// if any queue was serviced.
    pub fn service_queues(&mut self) -> bool {
        let mut work_done = false;
        while let Some(q) = self.ring.pop_front() {
            self.queue_mut(q).scheduled = false;
            self.service_queue(q);
            work_done = true;
        }
        work_done
    }

    fn service_queue(&mut self, q: QueueId) {
        self.currentq = q;
        if self.queue(q).servicing {
            self.queue_mut(q).reservice = true;
            return;
        }
        if self.queue(q).disabled {
            return;
        }
        {
            let queue = self.queue_mut(q);
            queue.servicing = true;
        }
        let stage = self.stage_of(q);
        stage::service_slot(&stage, self, q);
        let queue = self.queue_mut(q);
        queue.servicing = false;
        queue.serviced = true;
        if queue.reservice {
            queue.reservice = false;
            self.schedule(q);
        }
    }

    /// Stop scheduling a queue's service slot.
    pub fn disable_queue(&mut self, q: QueueId) {
        trace!(queue = self.queue(q).name, "disable queue");
        self.queue_mut(q).disabled = true;
    }

    /// Re-enable a disabled queue and schedule it.
    pub fn enable_queue(&mut self, q: QueueId) {
        trace!(queue = self.queue(q).name, "enable queue");
        self.queue_mut(q).disabled = false;
        self.schedule(q);
    }

    pub fn suspend_queue(&mut self, q: QueueId) {
        self.queue_mut(q).suspended = true;
    }

    pub fn resume_queue(&mut self, q: QueueId) {
        let queue = self.queue_mut(q);
        queue.suspended = false;
        self.schedule(q);
        // Producer may have been disabled by back-pressure from us
        let prev = self.queue(q).prev;
        if prev != q && self.queue(prev).disabled {
            self.enable_queue(prev);
        }
    }

    /// True if the downstream queue will take this packet. May split the
    /// packet (remainder goes back to the head of `q`). On refusal the
    /// producer `q` is disabled, the downstream queue is flagged full and
    /// scheduled to drain.
    pub fn will_next_accept(&mut self, q: QueueId, packet: &mut Packet) -> bool {
        let next = self.queue(q).next;
        if next == q {
            return true;
        }
        let (packet_size, room) = {
            let n = self.queue(next);
            (n.packet_size, n.room())
        };
        let size = packet.len();
        if size == 0 || (size <= packet_size && size <= room) {
            return true;
        }
        // Split so the first part fits the downstream bounds
        let fit = packet_size.min(room).min(packet.content.len());
        if fit > 0 && packet.content.len() > fit {
            let rest = packet.split_at(fit);
            self.queue_mut(q).put_front(rest);
            if packet.len() <= packet_size && packet.len() <= room {
                return true;
            }
        }
        self.disable_queue(q);
        self.queue_mut(next).full = true;
        if !self.queue(next).disabled {
            self.schedule(next);
        }
        false
    }

    /// Default service slot: forward queued packets downstream, honoring
    /// downstream capacity, and resume the upstream producer once below
    /// the low watermark.
    pub fn forward_all(&mut self, q: QueueId) {
        while let Some(mut packet) = self.queue_mut(q).get_packet() {
            if !self.will_next_accept(q, &mut packet) {
                self.queue_mut(q).put_front(packet);
                return;
            }
            self.put_next(q, packet);
        }
        self.release_backpressure(q);
    }

    /// If this queue drained below its low watermark, clear the full flag
    /// and wake the disabled producer.
    pub fn release_backpressure(&mut self, q: QueueId) {
        let queue = self.queue(q);
        if queue.full && queue.count < queue.low {
            self.queue_mut(q).full = false;
            let prev = self.queue(q).prev;
            if prev != q && self.queue(prev).disabled {
                self.enable_queue(prev);
            }
        }
    }
}

// Writing and reading (handler side)

impl Exchange {
    /// Write response (server) or request (client) body bytes through the
    /// outgoing chain. Convenience wrapper over [`Self::write_block`].
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, HttpError> {
        self.write_block(buf, WriteMode::NonBlocking)
    }

    /// The lowest level write routine: buffers into the handler's
    /// transmit queue, allocating packets at the transmission chunk size,
    /// and flushes whenever the queue reaches its high watermark.
    pub fn write_block(&mut self, buf: &[u8], mode: WriteMode) -> Result<usize, HttpError> {
        if self.tx.finalized || self.retired {
            return Err(HttpError::refused("write on finalized transmission"));
        }
        let q = self.writeq;
        let mut remaining = buf;
        let mut written = 0;

        while !remaining.is_empty() {
            if self.queue(q).count >= self.queue(q).max {
                let drained = self.flush_queue(q, mode == WriteMode::Blocking);
                if !drained
                    && (mode == WriteMode::NonBlocking
                        || self.queue(q).disabled
                        || self.pending_error.is_some())
                {
                    break;
                }
            }
            let n = self.queue_mut(q).fill_last(remaining);
            if n == 0 {
                let size = match self.tx.chunk_size {
                    Some(chunk) => chunk,
                    None => self.queue(q).packet_size,
                };
                let packet = Packet::data(size.max(1));
                self.put_for_service(q, packet, false);
                continue;
            }
            written += n;
            remaining = &remaining[n..];
        }
        if self.queue(q).count >= self.queue(q).max {
            self.flush_queue(q, false);
        }
        if let Some(err) = self.pending_error.clone() {
            return Err(err);
        }
        Ok(written)
    }

    /// Schedule the queue and its downstream neighbour and run the
    /// service ring. Returns true when the queue is below its high
    /// watermark afterwards.
    pub(crate) fn flush_queue(&mut self, q: QueueId, blocking: bool) -> bool {
        if self.queue(q).disabled {
            return false;
        }
        loop {
            self.schedule(q);
            let next = self.queue(q).next;
            if next != q && self.queue(next).count >= self.queue(next).max {
                self.schedule(next);
            }
            self.service_queues();
            if !(blocking && self.queue(q).count >= self.queue(q).max) {
                break;
            }
            if self.pending_error.is_some() {
                break;
            }
        }
        self.queue(q).count < self.queue(q).max
    }

    /// Flush everything buffered in the outgoing chain.
    pub fn flush(&mut self) {
        let q = self.writeq;
        self.flush_queue(q, false);
    }

    /// Declare the transmission complete: no more body will be written.
    pub fn finalize(&mut self) {
        if self.tx.finalized {
            return;
        }
        self.tx.finalized = true;
        self.finalize_output();
    }

    /// End the output stream: queues an END packet after any buffered
    /// body.
    pub(crate) fn finalize_output(&mut self) {
        if self.tx.finalized_output || !self.built {
            return;
        }
        self.tx.finalized_output = true;
        let q = self.writeq;
        self.put_for_service(q, Packet::end(), true);
        self.service_queues();
    }

    /// Read received body bytes into `buf`. Services the pipeline first,
    /// then drains the handler's receive queue. Returns the byte count;
    /// 0 means no data is currently buffered.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        self.service_queues();
        let q = self.readq;
        let mut nbytes = 0;

        while nbytes < buf.len() && self.queue(q).count > 0 {
            let Some(packet) = self.queue_mut(q).first_mut() else {
                break;
            };
            let want = buf.len() - nbytes;
            let take = want.min(packet.content.len());
            buf[nbytes..nbytes + take].copy_from_slice(&packet.content.split_to(take));
            nbytes += take;
            self.queue_mut(q).count -= take;
            self.rx.read_content += take as i64;

            if self
                .queue(q)
                .first()
                .map(|p| p.content.is_empty())
                .unwrap_or(false)
            {
                self.queue_mut(q).get_packet();
            }
        }
        nbytes
    }

    /// Drain the entire buffered body. Convenience for tests and small
    /// clients; streaming consumers should loop [`Self::read`].
    pub fn take_content(&mut self) -> BytesMut {
        self.service_queues();
        let q = self.readq;
        let mut content = BytesMut::new();
        while let Some(packet) = self.queue_mut(q).get_packet() {
            content.extend_from_slice(&packet.content);
        }
        content
    }

    /// Discard buffered output body data, e.g. when a conditional request
    /// short-circuits the response.
    pub(crate) fn discard_output(&mut self, remove_packets: bool) {
        let q = self.writeq;
        let discarded = self.queue_mut(q).discard_data(remove_packets);
        if self.tx.length > 0 {
            self.tx.length = (self.tx.length - discarded as i64).max(0);
        }
    }

    /// Record an error raised inside a stage callback.
    pub fn raise(&mut self, err: HttpError) {
        if self.pending_error.is_none() {
            self.pending_error = Some(err);
        }
    }
}

#[cfg(test)]
mod pipeline_self {
    use super::*;
    use crate::queue::Dir;

    fn exchange() -> Exchange {
        let service = Service::new();
        let limits = Arc::new(HttpLimits::server_defaults());
        let mut x = Exchange::new(Role::Server, limits, service);
        x.build_pipeline(Arc::new(crate::stage::SinkHandler));
        x
    }

    #[test]
    fn chains_are_linked() {
        let x = exchange();

        // Incoming: chunk -> range -> handler
        assert_eq!(x.queue(x.rx_head).dir, Dir::Incoming);
        let mut q = x.rx_head;
        let mut hops = 0;
        while x.queue(q).next != q {
            q = x.queue(q).next;
            hops += 1;
        }
        assert_eq!(q, x.readq);
        assert_eq!(hops, 2);

        // Outgoing: handler -> range -> chunk -> connector
        let mut q = x.writeq;
        let mut hops = 0;
        while x.queue(q).next != q {
            q = x.queue(q).next;
            hops += 1;
        }
        assert_eq!(q, x.connq);
        assert_eq!(hops, 3);
        assert_eq!(x.queue(x.connq).dir, Dir::Outgoing);
    }

    #[test]
    fn schedule_is_idempotent() {
        let mut x = exchange();
        let q = x.writeq;

        x.schedule(q);
        x.schedule(q);
        assert_eq!(x.ring.len(), 1);

        assert!(!x.queue(q).serviced);
        x.service_queues();
        assert!(x.queue(q).serviced);
        assert!(!x.queue(q).scheduled);
        assert_eq!(x.currentq, q);

        x.disable_queue(q);
        x.ring.clear();
        x.queue_mut(q).scheduled = false;
        x.schedule(q);
        assert!(x.ring.is_empty());
    }

    #[test]
    fn write_rejected_after_finalize() {
        let mut x = exchange();
        x.finalize();
        assert!(x.write(b"late").is_err());
    }

    #[test]
    fn split_respects_downstream_packet_size() {
        let mut x = exchange();
        let q = x.writeq;
        let next = x.queue(q).next;
        x.queue_mut(next).packet_size = 4;
        x.queue_mut(next).max = 100;

        let mut packet = Packet::from_content(bytes::BytesMut::from(&b"0123456789"[..]));
        x.queue_mut(q).count = 10;
        assert!(x.will_next_accept(q, &mut packet));
        assert_eq!(packet.len(), 4);
        // Remainder went back to the producer's head
        assert_eq!(x.queue(q).first().unwrap().len(), 6);
    }

    #[test]
    fn full_downstream_disables_producer() {
        let mut x = exchange();
        let q = x.writeq;
        let next = x.queue(q).next;
        x.queue_mut(next).packet_size = 8;
        x.queue_mut(next).max = 8;
        x.queue_mut(next).count = 8; // already full

        let mut packet = Packet::from_content(bytes::BytesMut::from(&b"abcdef"[..]));
        assert!(!x.will_next_accept(q, &mut packet));
        assert!(x.queue(q).disabled);
        assert!(x.queue(next).full);
    }
}
