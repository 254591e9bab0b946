//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;
use std::io;

use http::StatusCode;

/// Result type often returned from methods that can have ember `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur while serving clients.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// A malformed request. Recovered within the same work cycle by the
    /// configured error handler; the client stays connected.
    Parse(Parse),
    /// An `io::Error` while reading or writing a client socket.
    Io,
    /// Error creating or binding a listening socket.
    Listen,
    /// The peer closed, or the protocol called for closing the connection.
    Closed,
    /// A WebSocket close frame was sent with this status code.
    Ws(u16),
    /// An operation that requires a WebSocket client found an HTTP one.
    NotWebsocket,
    /// `select_clients` could not take the client-list mutex within two
    /// dispatch periods.
    SelectTimedOut,
    /// A response or frame did not fit in the send buffer.
    BufferFull,
    /// A blob source could not produce the requested blob.
    Blob,
}

#[derive(Debug)]
pub(crate) enum Parse {
    Verb,
    UriTooLong,
    Version,
    Header,
    Body,
    TooLarge,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Parse(parse))
    }

    pub(crate) fn new_io(cause: io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_listen(cause: io::Error) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(crate) fn new_closed() -> Error {
        Error::new(Kind::Closed)
    }

    pub(crate) fn new_ws(status: u16) -> Error {
        Error::new(Kind::Ws(status))
    }

    pub(crate) fn new_not_websocket() -> Error {
        Error::new(Kind::NotWebsocket)
    }

    pub(crate) fn new_select_timeout() -> Error {
        Error::new(Kind::SelectTimedOut)
    }

    pub(crate) fn new_buffer_full() -> Error {
        Error::new(Kind::BufferFull)
    }

    pub(crate) fn new_blob(cause: io::Error) -> Error {
        Error::new(Kind::Blob).with(cause)
    }

    /// Returns true if this was caused by a malformed request.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this error signals a deliberately closed connection.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::Closed)
    }

    /// Returns true if this was an `io::Error` on a client socket.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Returns true if a WebSocket close frame was sent for this error.
    pub fn is_ws_close(&self) -> bool {
        matches!(self.inner.kind, Kind::Ws(_))
    }

    /// Returns true if this came from a blob source miss.
    pub fn is_blob(&self) -> bool {
        matches!(self.inner.kind, Kind::Blob)
    }

    /// Returns true if `select_clients` timed out taking the list mutex.
    pub fn is_select_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::SelectTimedOut)
    }

    /// The HTTP status the configured error handler should send for this
    /// error, if it is a per-request error.
    pub(crate) fn status(&self) -> Option<StatusCode> {
        match self.inner.kind {
            Kind::Parse(_) => Some(StatusCode::BAD_REQUEST),
            _ => None,
        }
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Verb) => "invalid HTTP verb",
            Kind::Parse(Parse::UriTooLong) => "request URL too long",
            Kind::Parse(Parse::Version) => "unsupported HTTP version",
            Kind::Parse(Parse::Header) => "invalid request headers",
            Kind::Parse(Parse::Body) => "invalid request body",
            Kind::Parse(Parse::TooLarge) => "request too large",
            Kind::Io => "socket error",
            Kind::Listen => "error creating listener",
            Kind::Closed => "connection closed",
            Kind::Ws(_) => "websocket connection closed",
            Kind::NotWebsocket => "client is not a websocket connection",
            Kind::SelectTimedOut => "timed out waiting for the client list",
            Kind::BufferFull => "send buffer too small for message",
            Kind::Blob => "blob source error",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("ember::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Kind::Ws(status) = self.inner.kind {
            write!(f, "websocket connection closed ({})", status)
        } else if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<io::Error> for Error {
    fn from(cause: io::Error) -> Error {
        Error::new_io(cause)
    }
}
