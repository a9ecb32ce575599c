//! Stages: named processing units composed into per-request pipelines

use crate::{
    packet::Packet,
    pipeline::Exchange,
    queue::{Dir, QueueId},
};
use std::sync::Arc;

/// What a stage is for. Decides its position when a pipeline is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Transforms packets in one or both directions.
    Filter,
    /// Terminal stage generating the response body.
    Handler,
    /// Writes outgoing bytes to the socket buffer.
    Connector,
}

/// A pipeline processing unit.
///
/// Stages are immutable after registration and shared between
/// connections; per-request state lives in the [`Exchange`] (usually on
/// `Rx`/`Tx`). Every callback receives the exchange and the id of the
/// queue being serviced, and must not block: a service slot yields by
/// returning after draining its input or disabling itself.
///
/// The default data slots buffer the packet on the stage's own queue and
/// schedule it; the default service slots forward queued packets
/// downstream, honoring downstream capacity.
pub trait Stage: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    /// Queue brought into existence for this request.
    fn open(&self, x: &mut Exchange, q: QueueId) {
        let _ = (x, q);
    }

    /// Request is being retired; release per-request resources.
    fn close(&self, x: &mut Exchange, q: QueueId) {
        let _ = (x, q);
    }

    /// Pipeline is assembled and about to run.
    fn start(&self, x: &mut Exchange, q: QueueId) {
        let _ = (x, q);
    }

    /// A packet arriving from the network side.
    fn incoming(&self, x: &mut Exchange, q: QueueId, packet: Packet) {
        x.put_for_service(q, packet, true);
    }

    /// Drain the incoming queue toward the handler.
    fn incoming_service(&self, x: &mut Exchange, q: QueueId) {
        x.forward_all(q);
    }

    /// A packet headed for the network.
    fn outgoing(&self, x: &mut Exchange, q: QueueId, packet: Packet) {
        x.put_for_service(q, packet, true);
    }

    /// Drain the outgoing queue toward the connector.
    fn outgoing_service(&self, x: &mut Exchange, q: QueueId) {
        x.forward_all(q);
    }

    /// The downstream side has drained; the stage may produce more output.
    fn writable(&self, x: &mut Exchange, q: QueueId) {
        let _ = (x, q);
    }
}

/// Dispatch a data packet to the right directional slot.
#[inline]
pub(crate) fn put_slot(stage: &Arc<dyn Stage>, x: &mut Exchange, q: QueueId, packet: Packet) {
    match x.queue(q).dir {
        Dir::Incoming => stage.incoming(x, q, packet),
        Dir::Outgoing => stage.outgoing(x, q, packet),
    }
}

/// Dispatch a service pass to the right directional slot.
#[inline]
pub(crate) fn service_slot(stage: &Arc<dyn Stage>, x: &mut Exchange, q: QueueId) {
    match x.queue(q).dir {
        Dir::Incoming => stage.incoming_service(x, q),
        Dir::Outgoing => stage.outgoing_service(x, q),
    }
}

// HANDLER

/// The application-facing terminal stage.
///
/// Implementations generate the response (server role) or consume it
/// (client role) through the exchange: [`Exchange::read`] drains the
/// received body, [`Exchange::write`] and [`Exchange::finalize`] produce
/// output.
///
/// # Examples
///
/// ```
/// use pump_web::{Exchange, Handler};
///
/// struct Hello;
///
/// impl Handler for Hello {
///     fn ready(&self, x: &mut Exchange) {
///         x.tx.status = 200;
///         x.set_header("content-type", "text/plain");
///         let _ = x.write(b"Hello World!");
///         x.finalize();
///     }
/// }
/// ```
pub trait Handler: Send + Sync + 'static {
    /// The request body has been fully received; produce the response.
    fn ready(&self, x: &mut Exchange);

    /// The output queue drained below its low watermark; more body may be
    /// written. Only needed by handlers streaming large responses.
    fn writable(&self, x: &mut Exchange) {
        let _ = x;
    }

    /// A body packet arrived. The default buffers it for
    /// [`Exchange::read`]; streaming handlers may override to consume
    /// packets as they arrive.
    fn incoming(&self, x: &mut Exchange, packet: Packet) {
        let q = x.readq;
        x.put_for_service(q, packet, false);
    }
}

/// Adapter placing a [`Handler`] at the end of the incoming chain and the
/// head of the outgoing chain.
pub(crate) struct HandlerStage {
    pub(crate) handler: Arc<dyn Handler>,
}

impl Stage for HandlerStage {
    fn name(&self) -> &'static str {
        "handler"
    }

    fn kind(&self) -> StageKind {
        StageKind::Handler
    }

    fn incoming(&self, x: &mut Exchange, _q: QueueId, packet: Packet) {
        if packet.is_end() {
            x.rx.input_ended = true;
        }
        self.handler.incoming(x, packet);
    }

    fn incoming_service(&self, _x: &mut Exchange, _q: QueueId) {
        // Terminal: packets wait here for Exchange::read
    }

    fn writable(&self, x: &mut Exchange, _q: QueueId) {
        self.handler.writable(x);
    }
}

/// Pass-through handler used when a connection has no application stage,
/// e.g. the client role, where the "response" is consumed by the caller.
pub(crate) struct SinkHandler;

impl Handler for SinkHandler {
    fn ready(&self, _x: &mut Exchange) {}
}
