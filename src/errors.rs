use std::{error, fmt, io};

/// Classification of engine failures.
///
/// The kind decides logging and retry behavior; the HTTP status carried by
/// [`HttpError`] decides what the peer sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A configured limit was exceeded (body, header, URI or form size).
    LimitExceeded,
    /// The message violated the HTTP/1.x grammar.
    Malformed,
    /// Unsupported protocol version or expectation.
    ProtocolMismatch,
    /// Inactivity, parse, or request-duration timeout fired.
    Timeout,
    /// The socket closed mid-request.
    CommsLost,
    /// A downstream queue was full and the write could not be retried.
    UpstreamRefused,
    /// 500-class failure generated by the application handler.
    HandlerFailure,
    /// Contradictory message content, e.g. duplicate Content-Length.
    Conflict,
    /// Transport-level I/O failure.
    Io,
}

/// How hard to slam the door after emitting the error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Respond and keep the connection alive.
    Respond,
    /// Respond, then drop keep-alive: this request's framing is suspect
    /// but the response itself is deliverable.
    Close,
    /// Headers are unrecoverable; respond if possible and sever the
    /// connection.
    Abort,
}

/// An engine error bound for the peer as an HTTP status.
///
/// Errors never rewind the connection state machine. They are recorded on
/// the connection, keep-alive is cancelled, and the machine still advances
/// through its remaining states to emit the mapped response.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpError {
    pub kind: ErrorKind,
    pub status: u16,
    pub severity: Severity,
    message: String,
}

impl HttpError {
    pub(crate) fn new(kind: ErrorKind, status: u16, message: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            severity: Severity::Respond,
            message: message.into(),
        }
    }

    /// A limit breach: 413/414-class.
    pub(crate) fn limit(status: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LimitExceeded, status, message)
    }

    /// A grammar violation: 400-class.
    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Malformed, crate::proto::BAD_REQUEST, message)
    }

    pub(crate) fn protocol(status: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolMismatch, status, message)
    }

    pub(crate) fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, crate::proto::REQUEST_TIMEOUT, message).abort()
    }

    pub(crate) fn comms_lost(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CommsLost, crate::proto::COMMS_ERROR, message).abort()
    }

    pub(crate) fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, crate::proto::BAD_REQUEST, message)
    }

    pub(crate) fn refused(message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::UpstreamRefused,
            crate::proto::SERVICE_UNAVAILABLE,
            message,
        )
    }

    /// Escalate: sever the connection after the response.
    pub(crate) fn abort(mut self) -> Self {
        self.severity = Severity::Abort;
        self
    }

    /// Escalate: drop keep-alive after the response.
    pub(crate) fn close(mut self) -> Self {
        if self.severity < Severity::Close {
            self.severity = Severity::Close;
        }
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl error::Error for HttpError {}
impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}): {}", self.status, self.kind, self.message)
    }
}

impl From<io::Error> for HttpError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe => ErrorKind::CommsLost,
            _ => ErrorKind::Io,
        };
        Self::new(kind, crate::proto::COMMS_ERROR, err.to_string()).abort()
    }
}

#[cfg(test)]
mod errors_self {
    use super::*;

    #[test]
    fn severity_escalates_but_never_relaxes() {
        let err = HttpError::bad_request("x").abort().close();
        assert_eq!(err.severity, Severity::Abort);

        let err = HttpError::bad_request("x").close();
        assert_eq!(err.severity, Severity::Close);
    }

    #[test]
    fn io_mapping() {
        let err: HttpError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert_eq!(err.kind, ErrorKind::CommsLost);
        assert_eq!(err.severity, Severity::Abort);

        let err: HttpError = io::Error::new(io::ErrorKind::TimedOut, "slow").into();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }
}
