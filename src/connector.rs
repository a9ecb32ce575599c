//! The net connector: tail of the outgoing chain, feeding the socket

use crate::{
    errors::HttpError,
    pipeline::Exchange,
    proto,
    queue::QueueId,
    stage::{Stage, StageKind},
};

/// Serializes the message head and drains outgoing packets into the
/// connection's socket buffer. The async driver owns the actual socket
/// write; back-pressure from a slow peer shows up as an unflushed buffer,
/// not as blocking here.
pub(crate) struct NetConnector;

impl Stage for NetConnector {
    fn name(&self) -> &'static str {
        "netConnector"
    }

    fn kind(&self) -> StageKind {
        StageKind::Connector
    }

    fn outgoing_service(&self, x: &mut Exchange, q: QueueId) {
        if x.queue(q).is_empty() {
            return;
        }
        x.emit_head();

        while let Some(packet) = x.queue_mut(q).get_packet() {
            let is_end = packet.is_end();
            let wire = packet.wire_len() as i64;
            if wire > 0 {
                x.out.extend_from_slice(&packet.prefix);
                x.out.extend_from_slice(&packet.content);
                x.tx.bytes_written += wire;
                if x.tx.bytes_written >= x.limits.transmission_body_size {
                    x.raise(
                        HttpError::limit(
                            proto::REQUEST_TOO_LARGE,
                            format!(
                                "Transmission body of {} bytes is too big. Limit {}",
                                x.tx.bytes_written, x.limits.transmission_body_size
                            ),
                        )
                        .close(),
                    );
                }
            }
            if is_end {
                x.tx.finalized_connector = true;
            }
        }
        x.release_backpressure(q);
    }
}
