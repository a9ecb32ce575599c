//! Client role: initiate connections and drive request/response pairs

use crate::{
    conn::{Conn, State},
    errors::HttpError,
    limits::HttpLimits,
    rx::ParsedUri,
    service::Service,
    stage::SinkHandler,
};
use bytes::BytesMut;
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpStream, time::Instant};
use tracing::debug;

/// An outbound HTTP/1.x connection.
///
/// One `ClientConn` issues a sequence of requests over a single socket,
/// honoring the server's keep-alive allowance. The response body is
/// buffered through the pipeline and drained with [`Self::content`].
///
/// # Examples
///
/// ```no_run
/// use pump_web::{ClientConn, Service};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let service = Service::new();
///     let mut client = ClientConn::connect(&service, "http://127.0.0.1:8080/index.html").await?;
///     let status = client.fetch("GET").await?;
///     assert_eq!(status, 200);
///     println!("{}", String::from_utf8_lossy(&client.content()));
///     Ok(())
/// }
/// ```
pub struct ClientConn {
    conn: Conn,
    stream: TcpStream,
    target: ParsedUri,
}

impl ClientConn {
    /// Open a TCP connection to the host in `url`.
    pub async fn connect(service: &Arc<Service>, url: &str) -> Result<Self, HttpError> {
        let target = ParsedUri::parse(url)
            .filter(|parsed| parsed.host.is_some())
            .ok_or_else(|| {
                HttpError::new(
                    crate::errors::ErrorKind::Malformed,
                    crate::proto::CLIENT_ERROR,
                    format!("Bad URL {}", url),
                )
            })?;
        let host = target.host.clone().unwrap_or_default();
        let port = target.port.unwrap_or(80);

        debug!(%host, port, "connecting");
        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(HttpError::from)?;
        let conn = Conn::client(service.clone(), Arc::new(HttpLimits::client_defaults()));

        Ok(Self {
            conn,
            stream,
            target,
        })
    }

    /// Issue a request for the connect-time URL and wait for the full
    /// response.
    pub async fn fetch(&mut self, method: &str) -> Result<u16, HttpError> {
        let path = self.origin_form();
        self.request(method, &path, &[], b"").await?;
        let timeout = self.conn.limits.request_timeout;
        self.wait_for(State::Complete, timeout).await?;
        Ok(self.status())
    }

    /// Emit a request head, optional headers and body, and finalize the
    /// transmission. Use [`Self::wait_for`] to drive the response.
    pub async fn request(
        &mut self,
        method: &str,
        path: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<(), HttpError> {
        match self.conn.state {
            State::Connected => {}
            State::Complete => {
                if self.conn.must_close || self.conn.keep_alive_count == 0 {
                    return Err(HttpError::comms_lost("Connection is not reusable"));
                }
                self.conn.prep_for_next();
            }
            other => {
                return Err(HttpError::comms_lost(format!(
                    "Connection is mid-request, state {:?}",
                    other
                )))
            }
        }

        // Client pipelines exist from connect time, one per request
        if !self.conn.x.built {
            self.conn.x.build_pipeline(Arc::new(SinkHandler));
            self.conn.x.start_pipeline();
        }
        self.conn.x.tx.method = method.to_ascii_uppercase();
        self.conn.x.tx.uri = path.to_string();
        self.conn.x.tx.parsed_uri = Some(self.target.clone());
        for (key, value) in headers {
            self.conn.x.tx.headers.set(key, value);
        }
        if !body.is_empty() {
            self.conn.x.tx.length = body.len() as i64;
            self.conn.x.write(body)?;
        }
        self.conn.x.finalize();
        self.conn.flush_to(&mut self.stream).await?;
        Ok(())
    }

    /// Pump the connection until it reaches `target`, the peer closes,
    /// or the deadline expires. The wait advances in slices of
    /// min(inactivity timeout, remaining time).
    pub async fn wait_for(&mut self, target: State, timeout: Duration) -> Result<(), HttpError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.conn.pump();
            self.conn.flush_to(&mut self.stream).await?;
            if self.conn.state >= target {
                return Ok(());
            }
            if self.conn.sock_eof {
                return Err(HttpError::comms_lost("Peer closed the connection"));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(HttpError::timeout("Timeout waiting for response"));
            }
            let slice = self
                .conn
                .limits
                .inactivity_timeout
                .min(deadline.duration_since(now));
            match tokio::time::timeout(slice, self.conn.fill_input(&mut self.stream)).await {
                Ok(result) => result?,
                // Slice expired; the deadline check above decides
                Err(_elapsed) => {}
            }
        }
    }

    /// The response status code; 0 before a status line has arrived.
    pub fn status(&self) -> u16 {
        self.conn.x.rx.status
    }

    pub fn status_message(&self) -> &str {
        &self.conn.x.rx.status_message
    }

    /// A response header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.conn.x.rx.headers.get(name)
    }

    /// Drain the buffered response body.
    pub fn content(&mut self) -> BytesMut {
        self.conn.x.take_content()
    }

    pub fn conn(&mut self) -> &mut Conn {
        &mut self.conn
    }

    fn origin_form(&self) -> String {
        match &self.target.query {
            Some(query) => format!("{}?{}", self.target.path, query),
            None => self.target.path.clone(),
        }
    }
}
