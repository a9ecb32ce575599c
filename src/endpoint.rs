//! Endpoints: listening sockets feeding a worker pool

use crate::{
    conn::Conn,
    limits::HttpLimits,
    proto::{self, Version},
    service::Service,
    stage::Handler,
};
use crossbeam::queue::SegQueue;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    time::sleep,
};
use tracing::{debug, warn};

type TcpQueue = Arc<SegQueue<(TcpStream, SocketAddr)>>;

/// How long an idle worker naps between admission-queue polls.
const WORKER_NAP: Duration = Duration::from_micros(50);

/// A listening endpoint accepting server-side connections.
///
/// Accepted sockets go into an admission queue drained by a fixed pool of
/// workers (sized by [`HttpLimits::connections_max`]); each worker serves
/// one [`Conn`] at a time. When the queue is full, a dedicated alarmist
/// task answers with an immediate `503` so overload never silently drops
/// the TCP handshake.
///
/// # Examples
///
/// ```no_run
/// use pump_web::{Endpoint, Exchange, Handler, Service};
/// use std::sync::Arc;
///
/// struct Hello;
///
/// impl Handler for Hello {
///     fn ready(&self, x: &mut Exchange) {
///         x.tx.status = 200;
///         let _ = x.write(b"Hello World!");
///         x.finalize();
///     }
/// }
///
/// #[tokio::main]
/// async fn main() -> std::io::Result<()> {
///     let service = Service::new();
///     let endpoint = Endpoint::bind(&service, "127.0.0.1:8080", Arc::new(Hello)).await?;
///     endpoint.launch().await
/// }
/// ```
pub struct Endpoint {
    listener: TcpListener,
    service: Arc<Service>,
    limits: Arc<HttpLimits>,
    stream_queue: TcpQueue,
    error_queue: TcpQueue,
    max_pending: usize,
    addr: SocketAddr,
}

impl Endpoint {
    /// Bind `addr` and spawn the worker pool with default server limits.
    pub async fn bind(
        service: &Arc<Service>,
        addr: &str,
        handler: Arc<dyn Handler>,
    ) -> std::io::Result<Self> {
        Self::bind_with_limits(
            service,
            addr,
            handler,
            Arc::new(HttpLimits::server_defaults()),
        )
        .await
    }

    pub async fn bind_with_limits(
        service: &Arc<Service>,
        addr: &str,
        handler: Arc<dyn Handler>,
        limits: Arc<HttpLimits>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        service.add_endpoint(addr);

        let stream_queue: TcpQueue = Arc::new(SegQueue::new());
        let error_queue: TcpQueue = Arc::new(SegQueue::new());

        for _ in 0..limits.connections_max {
            Self::spawn_worker(&stream_queue, service, &limits, &handler);
        }
        Self::spawn_alarmist(&error_queue, &limits);

        let max_pending = 2 * limits.connections_max;
        Ok(Self {
            listener,
            service: service.clone(),
            limits,
            stream_queue,
            error_queue,
            max_pending,
            addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The limits applied to connections this endpoint accepts.
    pub fn limits(&self) -> &HttpLimits {
        &self.limits
    }

    /// Accept connections until the service shuts down or the task is
    /// cancelled.
    pub async fn launch(self) -> std::io::Result<()> {
        debug!(addr = %self.addr, "endpoint listening");
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = self.service.wait_shutdown() => {
                    self.stop();
                    return Ok(());
                }
            };
            let Ok((stream, peer)) = accepted else {
                continue;
            };
            // Long-lived keep-alive connections should not linger as
            // half-open sockets
            let _ = socket2::SockRef::from(&stream).set_keepalive(true);
            let _ = stream.set_nodelay(true);

            if self.stream_queue.len() < self.max_pending {
                self.stream_queue.push((stream, peer));
            } else {
                self.error_queue.push((stream, peer));
            }
        }
    }

    /// Stop advertising this endpoint.
    pub fn stop(&self) {
        self.service.remove_endpoint(self.addr);
    }

    async fn next_stream(queue: &TcpQueue) -> (TcpStream, SocketAddr) {
        loop {
            if let Some(value) = queue.pop() {
                return value;
            }
            sleep(WORKER_NAP).await;
        }
    }

    fn spawn_worker(
        queue: &TcpQueue,
        service: &Arc<Service>,
        limits: &Arc<HttpLimits>,
        handler: &Arc<dyn Handler>,
    ) {
        let queue = queue.clone();
        let service = service.clone();
        let limits = limits.clone();
        let handler = handler.clone();

        tokio::spawn(async move {
            loop {
                let (mut stream, peer) = Self::next_stream(&queue).await;
                debug!(%peer, "connection accepted");

                let mut conn = Conn::server(service.clone(), limits.clone(), handler.clone());
                if let Err(err) = conn.run(&mut stream).await {
                    warn!(%peer, error = %err, "connection failed");
                }
            }
        });
    }

    /// Answers queue overflow with an immediate 503.
    fn spawn_alarmist(queue: &TcpQueue, limits: &Arc<HttpLimits>) {
        let queue = queue.clone();
        let limits = limits.clone();

        tokio::spawn(async move {
            let status = proto::SERVICE_UNAVAILABLE;
            let body = format!("{} {}\r\n", status, proto::status_message(status));
            let response = format!(
                "{} {} {}\r\nconnection: close\r\ncontent-length: {}\r\n\r\n{}",
                Version::Http11,
                status,
                proto::status_message(status),
                body.len(),
                body
            );
            loop {
                let (mut stream, peer) = Self::next_stream(&queue).await;
                warn!(%peer, "admission queue full, rejecting");
                tokio::select! {
                    biased;
                    _ = stream.write_all(response.as_bytes()) => {}
                    _ = sleep(limits.inactivity_timeout) => {}
                }
            }
        });
    }
}
