//! Conn: the per-connection state machine and its pump

use crate::{
    chunk::{self, ChunkState},
    errors::{HttpError, Severity},
    limits::HttpLimits,
    packet::Packet,
    pipeline::{Exchange, Role},
    proto::{self, Version},
    service::{ConnTicket, Service, COUNTER_ACTIVE_REQUESTS, COUNTER_NETWORK_IO},
    stage::Handler,
};
use bytes::BytesMut;
use memchr::memmem;
use std::{io, sync::Arc, time::Instant};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::sleep,
};
use tracing::{debug, trace, warn};

/// Connection lifecycle states. Monotonically non-decreasing within one
/// request; keep-alive re-arms a fresh cycle at COMPLETE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum State {
    /// Accepted or created; no bytes seen.
    Begin = 0,
    /// Client side: TCP established, no response yet.
    Connected = 1,
    /// Request or status line parsed.
    First = 2,
    /// Headers parsed and frozen; pipeline built.
    Parsed = 3,
    /// Reading the (possibly empty) body.
    Content = 4,
    /// Body fully received.
    Ready = 5,
    /// Handler executing; output draining.
    Running = 6,
    /// Handler and connector both finalized.
    Finalized = 7,
    /// Request retired, counters updated.
    Complete = 8,
}

impl State {
    pub(crate) fn from_u8(value: u8) -> State {
        match value {
            0 => State::Begin,
            1 => State::Connected,
            2 => State::First,
            3 => State::Parsed,
            4 => State::Content,
            5 => State::Ready,
            6 => State::Running,
            7 => State::Finalized,
            _ => State::Complete,
        }
    }
}

/// A single HTTP exchange context. On keep-alive one Conn hosts a
/// sequence of request/response pairs over one socket.
pub struct Conn {
    pub(crate) service: Arc<Service>,
    pub(crate) limits: Arc<HttpLimits>,
    pub(crate) role: Role,
    pub(crate) state: State,
    pub(crate) error: Option<HttpError>,
    /// Headers were unrecoverable or the transport failed; the connection
    /// cannot be reused.
    pub(crate) conn_error: bool,
    /// Requests remaining on this socket.
    pub(crate) keep_alive_count: usize,
    pub(crate) must_close: bool,
    pub(crate) http10: bool,
    pub(crate) upgraded: bool,
    /// Re-entry guard: a dispatcher may deliver a write completion while
    /// still inside the read handler.
    pub(crate) pumping: bool,
    pub(crate) started: Instant,
    pub(crate) last_activity: Instant,
    /// Accumulating raw input bytes not yet consumed by the parser or
    /// content filter.
    pub(crate) input: BytesMut,
    pub(crate) new_data: usize,
    pub(crate) sock_eof: bool,
    pub(crate) protocol: Version,
    /// The per-request engine: Rx, Tx and the pipeline queues.
    pub(crate) x: Exchange,
    pub(crate) seqno: u64,
    pub(crate) active_request: bool,
    pub(crate) ticket: Arc<ConnTicket>,
    pub(crate) handler: Arc<dyn Handler>,
    /// URI substituted for requests that end in an engine error.
    error_document: Option<String>,
}

impl Conn {
    fn new(
        role: Role,
        service: Arc<Service>,
        limits: Arc<HttpLimits>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        let ticket = service.add_conn(role == Role::Server, limits.clone());
        let x = Exchange::new(role, limits.clone(), service.clone());
        Self {
            seqno: ticket.seqno,
            keep_alive_count: limits.keep_alive_max,
            service,
            limits,
            role,
            state: State::Begin,
            error: None,
            conn_error: false,
            must_close: false,
            http10: false,
            upgraded: false,
            pumping: false,
            started: Instant::now(),
            last_activity: Instant::now(),
            input: BytesMut::new(),
            new_data: 0,
            sock_eof: false,
            protocol: Version::Http11,
            x,
            active_request: false,
            ticket,
            handler,
            error_document: None,
        }
    }

    /// A server-side connection serving requests with `handler`.
    pub fn server(
        service: Arc<Service>,
        limits: Arc<HttpLimits>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        Self::new(Role::Server, service, limits, handler)
    }

    /// A client-side connection; the response body is consumed through
    /// the exchange.
    pub fn client(service: Arc<Service>, limits: Arc<HttpLimits>) -> Self {
        let mut conn = Self::new(
            Role::Client,
            service,
            limits,
            Arc::new(crate::stage::SinkHandler),
        );
        conn.state = State::Connected;
        conn.ticket.set_state(State::Connected);
        conn
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    /// Serve this URI in place of an engine-generated error response.
    /// The synthetic request preserves the failing request's headers and
    /// the error status.
    pub fn set_error_document(&mut self, uri: impl Into<String>) {
        self.error_document = Some(uri.into());
    }

    #[inline]
    pub fn rx(&self) -> &crate::rx::Rx {
        &self.x.rx
    }

    #[inline]
    pub fn tx(&self) -> &crate::tx::Tx {
        &self.x.tx
    }

    #[inline]
    pub fn exchange(&mut self) -> &mut Exchange {
        &mut self.x
    }

    pub(crate) fn set_state(&mut self, state: State) {
        debug_assert!(state >= self.state, "state may never rewind");
        trace!(from = ?self.state, to = ?state, seqno = self.seqno, "state");
        self.state = state;
        self.ticket.set_state(state);
    }

    /// Append received bytes to the connection input.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.input.extend_from_slice(bytes);
        self.new_data = self.input.len();
        self.touch();
    }

    /// Mark the transport as closed by the peer.
    pub fn feed_eof(&mut self) {
        self.sock_eof = true;
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.ticket.touch();
    }

    /// Take the socket-bound bytes accumulated by the connector.
    pub fn take_output(&mut self) -> BytesMut {
        self.x.out.split()
    }

    /// Record a failure. Errors never rewind the state machine: they
    /// cancel keep-alive and let the machine advance through the
    /// remaining states to emit the mapped response.
    pub(crate) fn record_error(&mut self, err: HttpError) {
        warn!(status = err.status, kind = ?err.kind, seqno = self.seqno, "{}", err.message());
        self.keep_alive_count = 0;
        match err.severity {
            Severity::Abort => {
                self.conn_error = true;
                self.must_close = true;
            }
            Severity::Close => self.must_close = true,
            Severity::Respond => {}
        }
        if self.error.is_none() {
            self.x.tx.status = err.status;
            self.error = Some(err);
        }
        // No further body will be consumed
        self.x.rx.eof = true;
        self.x.rx.remaining_content = 0;
        if self.state < State::Parsed {
            self.set_state(State::Parsed);
        } else if self.state >= State::Ready && self.state < State::Finalized {
            // The handler owns the response past READY; finalize the
            // error on its behalf so the machine can retire
            self.emit_error_response();
        }
    }

    /// A timeout event fired for this connection.
    pub(crate) fn on_timeout(&mut self, reason: &str) {
        debug!(
            seqno = self.seqno,
            idle_ms = self.last_activity.elapsed().as_millis() as u64,
            reason,
            "timeout"
        );
        self.keep_alive_count = 0;
        self.must_close = true;
        if self.state <= State::Connected {
            // Nothing was received; close without a response
            self.conn_error = true;
            self.x.retired = true;
            self.set_state(State::Complete);
        } else if self.state < State::Finalized {
            self.record_error(HttpError::timeout(format!(
                "{} in state {:?}",
                reason, self.state
            )));
            self.pump();
        }
    }
}

// The pump

impl Conn {
    /// Drive the state machine. Re-entered on every I/O event; processes
    /// at most one request. Returns true when the request completed
    /// without a connection error.
    pub fn pump(&mut self) -> bool {
        if self.pumping {
            return false;
        }
        self.pumping = true;
        let mut can_proceed = true;
        let mut complete = false;

        while can_proceed {
            trace!(
                state = ?self.state,
                new_data = self.new_data,
                error = self.error.is_some(),
                "pump"
            );
            // Keep-alive accounting feeds the emitted Connection header
            self.x.tx.keep_alive =
                self.keep_alive_count > 0 && !self.must_close && !self.conn_error;

            can_proceed = match self.state {
                State::Begin | State::Connected | State::First => self.parse_incoming(),
                State::Parsed => self.process_parsed(),
                State::Content => self.process_content(),
                State::Ready => self.process_ready(),
                State::Running => self.process_running(),
                State::Finalized => self.process_finalized(),
                State::Complete => {
                    complete = !self.conn_error;
                    self.process_completion()
                }
            };
        }
        self.pumping = false;
        complete
    }

    /// Headers are frozen; build the pipeline exactly once and move to
    /// the content phase.
    fn process_parsed(&mut self) -> bool {
        if !self.x.built {
            self.x.build_pipeline(self.handler.clone());
        }
        self.x.start_pipeline();
        if self.x.tx.error_document.is_none() {
            self.x.tx.error_document = self.error_document.clone();
        }

        self.set_state(State::Content);
        if self.x.rx.remaining_content == 0 && self.x.rx.chunk_state == ChunkState::Unchunked {
            self.x.rx.eof = true;
        }
        if self.x.rx.eof && self.x.tx.started {
            self.x.put_to_pipeline(Packet::end());
            self.x.service_queues();
            self.set_state(State::Ready);
        }
        true
    }

    /// Determine how many of the buffered input bytes are useful body
    /// data, decoding chunk framing and enforcing body limits. Returns
    /// (usable bytes, more-to-process).
    fn filter_packet(&mut self) -> (usize, bool) {
        let mut more = false;
        if self.sock_eof {
            self.x.rx.eof = true;
        }

        let nbytes;
        if self.x.rx.chunk_state != ChunkState::Unchunked {
            match chunk::filter_chunk_data(&mut self.x.rx, &mut self.input) {
                Ok(n) => nbytes = n,
                Err(err) => {
                    self.record_error(err);
                    return (0, false);
                }
            }
            if self.x.rx.chunk_state == ChunkState::Eof {
                self.x.rx.eof = true;
                debug_assert_eq!(self.x.rx.remaining_content, 0);
            }
        } else {
            nbytes = (self.x.rx.remaining_content.max(0) as usize).min(self.input.len());
            if !self.upgraded && self.x.rx.remaining_content - (nbytes as i64) <= 0 {
                self.x.rx.eof = true;
            }
        }
        self.new_data = 0;

        self.x.rx.bytes_read += nbytes as i64;
        if !self.upgraded && self.x.rx.remaining_content != i64::MAX {
            self.x.rx.remaining_content -= nbytes as i64;
        }

        // Sandbox limits apply to the running total, not just the
        // declared length
        let size = self.x.rx.bytes_read;
        if size >= self.limits.receive_body_size {
            self.record_error(
                HttpError::limit(
                    proto::REQUEST_TOO_LARGE,
                    format!(
                        "Request body of {} bytes (sofar) is too big. Limit {}",
                        size, self.limits.receive_body_size
                    ),
                )
                .close(),
            );
        } else if self.x.rx.form && size >= self.limits.receive_form_size {
            self.record_error(
                HttpError::limit(
                    proto::REQUEST_TOO_LARGE,
                    format!(
                        "Request form of {} bytes (sofar) is too big. Limit {}",
                        size, self.limits.receive_form_size
                    ),
                )
                .close(),
            );
        }

        if self.x.rx.eof {
            if self.x.rx.remaining_content > 0
                && self.x.rx.remaining_content != i64::MAX
                && !self.must_close
            {
                // Closing is the only way for HTTP/1.0 to signify the
                // end of data
                self.record_error(HttpError::comms_lost("Connection lost"));
                return (0, false);
            }
            if nbytes > 0 && self.input.len() > nbytes {
                more = true;
            }
        } else if self.x.rx.chunk_state != ChunkState::Unchunked
            && nbytes > 0
            && self.input.len() > nbytes
        {
            // The data for the next chunk is already buffered
            more = true;
        }
        trace!(
            nbytes,
            remaining = self.x.rx.remaining_content,
            eof = self.x.rx.eof,
            more,
            "filter packet"
        );
        (nbytes, more)
    }

    fn process_content(&mut self) -> bool {
        let (nbytes, more) = self.filter_packet();
        if nbytes > 0 && self.state < State::Complete {
            let content = self.input.split_to(nbytes);
            self.x.put_to_pipeline(Packet::from_content(content));
        }

        if self.x.rx.eof {
            if self.state < State::Finalized {
                self.x.put_to_pipeline(Packet::end());
                if self.role == Role::Server && !self.x.tx.started {
                    self.x.start_pipeline();
                }
                self.x.service_queues();
                self.set_state(State::Ready);
            }
            return true;
        }
        if self.x.tx.started {
            // Upgraded protocols generate output while still in the
            // content state
            self.get_output();
        }
        self.x.service_queues();
        self.conn_error || more
    }

    /// All content received: run the handler (or the error response).
    fn process_ready(&mut self) -> bool {
        self.x.service_queues();
        if self.error.is_some() {
            // Substitute the configured error document while no response
            // bytes have been emitted: the synthetic request reuses the
            // original header bytes so Host, Cookie and Authorization
            // survive
            if let Some(doc) = self.x.tx.error_document.clone() {
                if !self.conn_error && !self.x.tx.head_written && doc != self.x.rx.uri {
                    self.create_error_request(&doc);
                    return true;
                }
            }
            self.emit_error_response();
        } else if self.role == Role::Server {
            let handler = self.handler.clone();
            handler.ready(&mut self.x);
        }
        if self.x.tx.status == proto::SWITCHING_PROTOCOLS && self.x.rx.upgrade.is_some() {
            self.upgraded = true;
        }
        self.absorb_pending();
        self.set_state(State::Running);
        true
    }

    /// May be called multiple times in response to output I/O events.
    fn process_running(&mut self) -> bool {
        self.x.service_queues();
        self.absorb_pending();

        match self.role {
            Role::Server => {
                if self.x.tx.finalized {
                    if self.x.tx.finalized_connector {
                        self.set_state(State::Finalized);
                        return true;
                    }
                    // Output is still buffered in the chains; push it at
                    // the connector before waiting on I/O
                    let connq = self.x.connq;
                    self.x.schedule(connq);
                    self.x.service_queues();
                    if self.x.tx.finalized_connector {
                        self.set_state(State::Finalized);
                        return true;
                    }
                    self.x.tx.write_blocked = true;
                    return false;
                }
                if self.get_output() {
                    return true;
                }
                let q = self.x.writeq;
                if self.x.queue(q).count < self.x.queue(q).low {
                    if self.x.queue(q).suspended {
                        self.x.resume_queue(q);
                    }
                    // Give events a chance to run; avoids suspend/resume
                    // ping-pong
                    false
                } else {
                    self.x.tx.write_blocked = true;
                    self.x.suspend_queue(q);
                    false
                }
            }
            Role::Client => {
                if self.upgraded {
                    return false;
                }
                self.x.finalize();
                if self.x.tx.finalized && self.x.rx.eof {
                    self.set_state(State::Finalized);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Invoke the handler's writable slot to generate more output.
    /// Returns true if output was produced.
    fn get_output(&mut self) -> bool {
        if !self.x.tx.started || self.x.tx.write_blocked {
            return false;
        }
        let q = self.x.writeq;
        let count = self.x.queue(q).count;
        if !self.x.tx.finalized_output {
            let handler = self.handler.clone();
            handler.writable(&mut self.x);
        }
        if count != self.x.queue(q).count {
            self.x.schedule(q);
            self.x.service_queues();
            return true;
        }
        false
    }

    fn emit_error_response(&mut self) {
        let Some(err) = self.error.clone() else {
            return;
        };
        self.x.tx.status = err.status;
        if !self.x.tx.head_written && !self.x.tx.finalized {
            // Drop whatever body the handler had queued before it failed
            self.x.discard_output(true);
            let body = format!("{} {}\r\n", err.status, proto::status_message(err.status));
            self.x.tx.headers.set("content-type", "text/plain");
            self.x.tx.length = body.len() as i64;
            let _ = self.x.write(body.as_bytes());
        }
        self.x.finalize();
    }

    fn process_finalized(&mut self) -> bool {
        debug_assert!(self.x.tx.finalized);
        debug_assert!(self.x.tx.finalized_output);

        self.x.destroy_pipeline();
        let elapsed = self.started.elapsed();
        debug!(
            status = self.x.tx.status,
            bytes = self.x.tx.bytes_written,
            elapsed_ms = elapsed.as_millis() as u64,
            uri = %self.x.rx.uri,
            "request finished"
        );
        if self.role == Role::Server {
            self.service
                .monitor_event(COUNTER_NETWORK_IO, self.x.tx.bytes_written);
        }
        self.set_state(State::Complete);
        true
    }

    fn process_completion(&mut self) -> bool {
        if self.role == Role::Server && self.active_request {
            self.service.monitor_event(COUNTER_ACTIVE_REQUESTS, -1);
            self.active_request = false;
        }
        self.x.retired = true;
        false
    }

    /// Synthesize a follow-up request for the configured error document,
    /// reusing the retained header bytes so Host, Cookie and
    /// Authorization survive.
    fn create_error_request(&mut self, doc: &str) {
        debug!(error_document = %doc, status = self.x.tx.status, "error document re-request");
        let head = self.x.rx.head_bytes.clone();
        let Some(eol) = memmem::find(&head, b"\r\n") else {
            return;
        };
        let mut input = BytesMut::with_capacity(head.len() + doc.len() + 16);
        input.extend_from_slice(
            format!("{} {} {}\r\n", self.x.rx.method, doc, self.protocol).as_bytes(),
        );
        input.extend_from_slice(&head[eol + 2..]);
        input.extend_from_slice(b"\r\n");

        let status = self.x.tx.status;
        self.x = Exchange::new(self.role, self.limits.clone(), self.service.clone());
        self.x.tx.status = status;
        self.error = None;
        self.upgraded = false;
        self.input = input;
        self.active_request = false;
        // A fresh request cycle; the state machine re-arms like keep-alive
        self.state = State::Connected;
        self.ticket.set_state(State::Connected);
    }

    /// Re-arm for the next request on this keep-alive connection.
    pub(crate) fn prep_for_next(&mut self) {
        debug_assert_eq!(self.state, State::Complete);
        self.keep_alive_count = self.keep_alive_count.saturating_sub(1);
        self.x = Exchange::new(self.role, self.limits.clone(), self.service.clone());
        self.error = None;
        self.upgraded = false;
        self.http10 = false;
        self.active_request = false;
        self.started = Instant::now();
        self.state = if self.role == Role::Server {
            State::Begin
        } else {
            State::Connected
        };
        self.ticket.set_state(self.state);
        self.ticket.restart();
    }

    fn absorb_pending(&mut self) {
        if let Some(err) = self.x.pending_error.take() {
            self.record_error(err);
        }
    }
}

// The async socket driver

impl Conn {
    /// Serve this connection over `stream` until it closes. Reads with
    /// the inactivity timeout, pumps, and flushes the connector output.
    pub async fn run<S>(&mut self, stream: &mut S) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            self.pump();
            self.flush_to(stream).await?;

            if self.state == State::Complete {
                if self.keep_alive_count > 0
                    && !self.must_close
                    && !self.conn_error
                    && !self.sock_eof
                {
                    self.prep_for_next();
                    if !self.input.is_empty() {
                        // Pipelined request already buffered
                        continue;
                    }
                } else {
                    break;
                }
            }
            if self.sock_eof {
                // The pump above already observed the EOF
                break;
            }
            self.fill_input(stream).await?;
        }
        self.retire();
        Ok(())
    }

    /// One read slice: socket bytes, a service-timer timeout event, or
    /// the inactivity deadline, whichever comes first.
    pub(crate) async fn fill_input<S>(&mut self, stream: &mut S) -> io::Result<()>
    where
        S: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 16 * 1024];
        let ticket = self.ticket.clone();

        tokio::select! {
            biased;

            result = stream.read(&mut buf) => {
                let n = result?;
                if n == 0 {
                    self.sock_eof = true;
                } else {
                    self.feed(&buf[..n]);
                }
            }
            _ = ticket.timeout.notified() => {
                self.on_timeout("Service timer timeout");
            }
            _ = sleep(self.limits.inactivity_timeout) => {
                self.on_timeout("Inactivity timeout");
            }
        }
        Ok(())
    }

    /// Flush connector output to the socket, bounded by the inactivity
    /// timeout.
    pub(crate) async fn flush_to<S>(&mut self, stream: &mut S) -> io::Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        if self.x.out.is_empty() {
            return Ok(());
        }
        let out = self.x.out.split();
        tokio::select! {
            biased;

            result = stream.write_all(&out) => {
                result?;
                stream.flush().await?;
                self.touch();
                Ok(())
            }
            _ = sleep(self.limits.inactivity_timeout) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "write timeout"))
            }
        }
    }

    pub(crate) fn retire(&mut self) {
        self.service.remove_conn(&self.ticket);
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.retire();
    }
}

#[cfg(test)]
mod conn_self {
    use super::*;
    use crate::{limits::HttpLimits, pipeline::Exchange, service::Service};
    use std::{sync::Mutex, time::Duration};

    struct Hello;

    impl Handler for Hello {
        fn ready(&self, x: &mut Exchange) {
            x.tx.status = 200;
            x.set_header("content-type", "text/plain");
            let _ = x.write(b"Hello World!");
            x.finalize();
        }
    }

    /// Buffers the request body for later inspection.
    struct CaptureBody {
        body: Mutex<Vec<u8>>,
    }

    impl CaptureBody {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                body: Mutex::new(Vec::new()),
            })
        }
    }

    impl Handler for CaptureBody {
        fn ready(&self, x: &mut Exchange) {
            let content = x.take_content();
            self.body.lock().unwrap().extend_from_slice(&content);
            x.tx.status = 200;
            x.finalize();
        }
    }

    /// Echoes the request URI without touching the preset status.
    struct UriEcho;

    impl Handler for UriEcho {
        fn ready(&self, x: &mut Exchange) {
            let body = format!("uri={}", x.rx.uri);
            let _ = x.write(body.as_bytes());
            x.finalize();
        }
    }

    fn server_with(handler: Arc<dyn Handler>) -> Conn {
        Conn::server(
            Service::new(),
            Arc::new(HttpLimits::server_defaults()),
            handler,
        )
    }

    fn server() -> Conn {
        server_with(Arc::new(Hello))
    }

    fn output(conn: &mut Conn) -> String {
        String::from_utf8_lossy(&conn.take_output()).into_owned()
    }

    #[test]
    fn simple_get_keeps_alive() {
        let mut conn = server();
        conn.feed(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n");

        assert!(conn.pump());
        assert_eq!(conn.state, State::Complete);
        assert_eq!(conn.x.rx.method, "GET");
        assert_eq!(conn.x.rx.uri, "/a");
        assert_eq!(conn.x.rx.headers.get("host"), Some("x"));

        let out = output(&mut conn);
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{out}");
        assert!(out.contains("content-length: 12"), "{out}");
        assert!(out.ends_with("Hello World!"), "{out}");
        assert!(!out.contains("connection: close"), "{out}");
        assert!(conn.keep_alive_count > 0);
    }

    #[test]
    fn form_post_delivers_body() {
        let capture = CaptureBody::new();
        let mut conn = server_with(capture.clone());
        conn.feed(
            b"POST /f HTTP/1.1\r\nHost:x\r\nContent-Length: 5\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\r\nk=val",
        );

        assert!(conn.pump());
        assert!(conn.x.rx.form);
        assert!(!conn.x.rx.upload);
        assert_eq!(conn.x.rx.remaining_content, 0);
        assert_eq!(conn.x.rx.bytes_read, 5);
        assert_eq!(&*capture.body.lock().unwrap(), b"k=val");
    }

    #[test]
    fn expect_continue_precedes_body() {
        let capture = CaptureBody::new();
        let mut conn = server_with(capture.clone());
        conn.feed(b"GET / HTTP/1.1\r\nHost:x\r\nExpect: 100-continue\r\nContent-Length: 4\r\n\r\n");

        conn.pump();
        let early = output(&mut conn);
        assert!(early.starts_with("HTTP/1.1 100 Continue\r\n\r\n"), "{early}");
        assert!(!early.contains("200"), "{early}");
        assert_eq!(conn.state, State::Content);

        conn.feed(b"abcd");
        assert!(conn.pump());
        let out = output(&mut conn);
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{out}");
        assert_eq!(&*capture.body.lock().unwrap(), b"abcd");
    }

    #[test]
    fn chunked_body_reassembles() {
        let capture = CaptureBody::new();
        let mut conn = server_with(capture.clone());
        conn.feed(
            b"POST / HTTP/1.1\r\nHost:x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
        );

        assert!(conn.pump());
        assert!(conn.x.rx.eof);
        assert_eq!(conn.x.rx.remaining_content, 0);
        assert_eq!(&*capture.body.lock().unwrap(), b"hello");
    }

    #[test]
    fn duplicate_content_length_is_rejected() {
        let mut conn = server();
        conn.feed(b"GET / HTTP/1.1\r\nHost:x\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n");

        conn.pump();
        assert_eq!(conn.state, State::Complete);
        assert_eq!(conn.keep_alive_count, 0);
        assert!(conn.must_close);
        assert!(!conn.conn_error);

        let out = output(&mut conn);
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{out}");
        assert!(out.contains("connection: close"), "{out}");
    }

    #[test]
    fn oversized_headers_abort() {
        let mut conn = server();
        let huge = "a".repeat(conn.limits.header_size);
        conn.feed(format!("GET / HTTP/1.1\r\nX-One: {huge}\r\nX-Two: {huge}\r\n").as_bytes());

        assert!(!conn.pump());
        assert_eq!(conn.state, State::Complete);
        assert!(conn.conn_error);

        let out = output(&mut conn);
        assert!(
            out.starts_with("HTTP/1.1 413 Request Entity Too Large\r\n"),
            "{out}"
        );
        assert!(out.contains("connection: close"), "{out}");
    }

    #[test]
    fn bad_protocol_yields_406() {
        let mut conn = server();
        conn.feed(b"GET / SPDY/9.9\r\nHost: x\r\n\r\n");

        conn.pump();
        let out = output(&mut conn);
        assert!(out.starts_with("HTTP/1.1 406 Not Acceptable\r\n"), "{out}");
        assert_eq!(conn.keep_alive_count, 0);
    }

    #[test]
    fn uri_too_long_yields_414() {
        let mut conn = server();
        let uri = format!("/{}", "u".repeat(conn.limits.uri_size));
        conn.feed(format!("GET {uri} HTTP/1.1\r\nHost: x\r\n\r\n").as_bytes());

        conn.pump();
        let out = output(&mut conn);
        assert!(
            out.starts_with("HTTP/1.1 414 Request-URI Too Large\r\n"),
            "{out}"
        );
    }

    #[test]
    fn state_is_monotonic_within_a_request() {
        let request: &[u8] = b"POST /m HTTP/1.1\r\nHost: x\r\nContent-Length: 6\r\n\r\nabcdef";
        let mut conn = server_with(CaptureBody::new());
        let mut observed = vec![conn.state];

        for chunk in request.chunks(7) {
            conn.feed(chunk);
            conn.pump();
            observed.push(conn.state);
        }
        assert_eq!(*observed.last().unwrap(), State::Complete);
        for pair in observed.windows(2) {
            assert!(pair[0] <= pair[1], "state rewound: {:?}", observed);
        }
    }

    #[test]
    fn http11_keep_alive_serves_multiple_requests() {
        let mut conn = server();
        let initial = conn.keep_alive_count;

        conn.feed(b"GET /one HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(conn.pump());
        assert!(output(&mut conn).starts_with("HTTP/1.1 200"));

        conn.prep_for_next();
        assert_eq!(conn.keep_alive_count, initial - 1);
        assert_eq!(conn.state, State::Begin);

        conn.feed(b"GET /two HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(conn.pump());
        assert_eq!(conn.x.rx.uri, "/two");
        assert!(output(&mut conn).starts_with("HTTP/1.1 200"));
    }

    #[test]
    fn pipelined_requests_parse_back_to_back() {
        let mut conn = server();
        conn.feed(b"GET /p1 HTTP/1.1\r\nHost: x\r\n\r\nGET /p2 HTTP/1.1\r\nHost: x\r\n\r\n");

        assert!(conn.pump());
        assert_eq!(conn.x.rx.uri, "/p1");
        conn.prep_for_next();

        assert!(conn.pump());
        assert_eq!(conn.x.rx.uri, "/p2");
        let out = output(&mut conn);
        assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 2);
    }

    #[test]
    fn http10_closes_without_keep_alive() {
        let mut conn = server();
        conn.feed(b"GET / HTTP/1.0\r\nHost: x\r\n\r\n");

        assert!(conn.pump());
        assert_eq!(conn.keep_alive_count, 0);
        let out = output(&mut conn);
        assert!(out.starts_with("HTTP/1.0 200 OK\r\n"), "{out}");
        assert!(out.contains("connection: close"), "{out}");
    }

    #[test]
    fn http10_keep_alive_is_honored_when_requested() {
        let mut conn = server();
        conn.feed(b"GET / HTTP/1.0\r\nHost: x\r\nConnection: keep-alive\r\n\r\n");

        assert!(conn.pump());
        assert!(conn.keep_alive_count > 0);
        let out = output(&mut conn);
        assert!(out.contains("connection: keep-alive"), "{out}");
    }

    #[test]
    fn client_drops_keep_alive_when_server_declares_max_one() {
        let service = Service::new();
        let mut conn = Conn::client(service, Arc::new(HttpLimits::client_defaults()));
        conn.x.tx.method = "GET".to_string();
        conn.x.tx.uri = "/".to_string();

        conn.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nKeep-Alive: timeout=5, max=1\r\n\r\n");
        conn.pump();

        assert_eq!(conn.x.rx.status, 200);
        assert_eq!(conn.keep_alive_count, 0);
    }

    #[test]
    fn client_parses_status_line_and_body() {
        let service = Service::new();
        let mut conn = Conn::client(service, Arc::new(HttpLimits::client_defaults()));
        conn.x.tx.method = "GET".to_string();
        conn.x.tx.uri = "/".to_string();

        conn.feed(b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nnot found");
        assert!(conn.pump());

        assert_eq!(conn.x.rx.status, 404);
        assert_eq!(conn.x.rx.status_message, "Not Found");
        assert!(conn.x.rx.eof);
        assert_eq!(&conn.x.take_content()[..], b"not found");
    }

    #[test]
    fn client_reads_close_delimited_http10_body() {
        let service = Service::new();
        let mut conn = Conn::client(service, Arc::new(HttpLimits::client_defaults()));
        conn.x.tx.method = "GET".to_string();
        conn.x.tx.uri = "/".to_string();

        conn.feed(b"HTTP/1.0 200 OK\r\nConnection: close\r\n\r\npartial");
        conn.pump();
        assert!(!conn.x.rx.eof);

        conn.feed(b" and the rest");
        conn.feed_eof();
        conn.pump();

        assert!(conn.x.rx.eof);
        assert_eq!(&conn.x.take_content()[..], b"partial and the rest");
        assert_eq!(conn.state, State::Complete);
    }

    #[test]
    fn premature_close_is_a_comms_error() {
        let capture = CaptureBody::new();
        let mut conn = server_with(capture);
        conn.feed(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\n\r\nabc");
        conn.pump();

        conn.feed_eof();
        conn.pump();
        assert!(conn.conn_error);
        assert_eq!(conn.state, State::Complete);
    }

    #[test]
    fn error_document_rebuilds_the_request() {
        let mut conn = server_with(Arc::new(UriEcho));
        conn.set_error_document("/friendly");
        conn.feed(b"GET /x HTTP/1.1\r\nHost: x\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n");

        conn.pump();
        assert_eq!(conn.state, State::Complete);
        assert_eq!(conn.x.rx.uri, "/friendly");
        assert_eq!(conn.x.rx.headers.get("host"), Some("x"));

        let out = output(&mut conn);
        // Original error status is preserved; the document supplies the body
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{out}");
        assert!(out.contains("uri=/friendly"), "{out}");
    }

    #[test]
    fn timeout_mid_request_emits_408() {
        let mut conn = server();
        conn.feed(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\n");
        conn.pump();
        assert_eq!(conn.state, State::Content);

        conn.on_timeout("Inactivity timeout");
        assert_eq!(conn.state, State::Complete);
        let out = output(&mut conn);
        assert!(out.starts_with("HTTP/1.1 408 Request Timeout\r\n"), "{out}");
    }

    #[test]
    fn timeout_on_idle_connection_closes_silently() {
        let mut conn = server();
        conn.on_timeout("Inactivity timeout");

        assert_eq!(conn.state, State::Complete);
        assert!(conn.conn_error);
        assert!(conn.take_output().is_empty());
    }

    #[test]
    fn write_backpressure_bounds_queue_growth() {
        let mut conn = server();
        conn.feed(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        // Stop before RUNNING so the transmission is still open
        conn.x.build_pipeline(Arc::new(crate::stage::SinkHandler));

        let q = conn.x.writeq;
        let next = conn.x.queue(q).next;
        conn.x.queue_mut(q).max = 128;
        conn.x.queue_mut(q).packet_size = 64;
        conn.x.queue_mut(next).max = 64;
        conn.x.queue_mut(next).packet_size = 64;
        conn.x.disable_queue(next);

        let written = conn
            .x
            .write_block(&[0u8; 1024], crate::pipeline::WriteMode::NonBlocking)
            .unwrap();
        assert!(written < 1024);

        let queue = conn.x.queue(q);
        assert!(
            queue.count <= queue.max + queue.packet_size,
            "count {} exceeded max {} + packet_size {}",
            queue.count,
            queue.max,
            queue.packet_size
        );
        assert!(conn.x.queue(next).count <= 64 + 64);
    }

    #[test]
    fn single_range_yields_partial_content() {
        struct Entity;

        impl Handler for Entity {
            fn ready(&self, x: &mut Exchange) {
                let body: Vec<u8> = (0..100u8).map(|i| b'a' + (i % 26)).collect();
                x.set_content_length(body.len() as i64);
                let _ = x.write(&body);
                x.finalize();
            }
        }

        let mut conn = server_with(Arc::new(Entity));
        conn.feed(b"GET /e HTTP/1.1\r\nHost: x\r\nRange: bytes=10-19\r\n\r\n");

        assert!(conn.pump());
        let out = output(&mut conn);
        assert!(out.starts_with("HTTP/1.1 206 Partial Content\r\n"), "{out}");
        assert!(out.contains("content-range: bytes 10-19/100"), "{out}");
        assert!(out.contains("content-length: 10"), "{out}");

        let expected: Vec<u8> = (10..20u8).map(|i| b'a' + (i % 26)).collect();
        assert!(out.ends_with(std::str::from_utf8(&expected).unwrap()), "{out}");
    }

    #[test]
    fn multiple_ranges_yield_multipart_byteranges() {
        struct Entity;

        impl Handler for Entity {
            fn ready(&self, x: &mut Exchange) {
                let body: Vec<u8> = (0..100u8).map(|i| b'a' + (i % 26)).collect();
                x.set_content_length(body.len() as i64);
                let _ = x.write(&body);
                x.finalize();
            }
        }

        let mut conn = server_with(Arc::new(Entity));
        conn.feed(b"GET /e HTTP/1.0\r\nHost: x\r\nRange: bytes=0-9,90-99\r\n\r\n");

        conn.pump();
        let out = output(&mut conn);
        assert!(out.starts_with("HTTP/1.0 206 Partial Content\r\n"), "{out}");
        assert!(
            out.contains("content-type: multipart/byteranges; boundary="),
            "{out}"
        );
        assert_eq!(out.matches("Content-Range: bytes").count(), 2, "{out}");
        assert!(out.contains("Content-Range: bytes 0-9/100"), "{out}");
        assert!(out.contains("Content-Range: bytes 90-99/100"), "{out}");
        assert!(out.trim_end().ends_with("--"), "{out}");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_completes_within_inactivity_timeout() {
        let service = Service::new();
        let limits = Arc::new(HttpLimits {
            inactivity_timeout: Duration::from_millis(200),
            ..HttpLimits::server_defaults()
        });
        let mut conn = Conn::server(service, limits, Arc::new(Hello));

        let (_client, mut server_io) = tokio::io::duplex(1024);
        let driven = tokio::time::timeout(Duration::from_secs(10), conn.run(&mut server_io)).await;

        assert!(driven.is_ok(), "driver did not observe the timeout");
        assert_eq!(conn.state, State::Complete);
    }

    #[tokio::test]
    async fn request_over_duplex_transport() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let service = Service::new();
        let mut conn = Conn::server(
            service,
            Arc::new(HttpLimits::server_defaults()),
            Arc::new(Hello),
        );
        let (mut client, mut server_io) = tokio::io::duplex(64 * 1024);

        let driver = tokio::spawn(async move {
            let _ = conn.run(&mut server_io).await;
        });

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        driver.await.unwrap();

        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.ends_with("Hello World!"), "{response}");
    }
}
