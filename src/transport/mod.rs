//! The network transport seam.
//!
//! The dispatcher never touches a concrete TCP/IP stack; it drives sockets
//! through these three object-safe traits. [`TcpTransport`] is the default
//! implementation over the host's sockets. An embedded port supplies its
//! own transport and the rest of the server is unchanged.
//!
//! All operations are non-blocking. `Ok(0)` from [`Connection::recv`] means
//! "no data available right now"; `Ok(0)` from [`Connection::send`] means
//! backpressure. Neither is an error, and neither ends the connection.

use std::time::Duration;

mod tcp;

pub use self::tcp::TcpTransport;

/// A socket factory plus the readiness wait that paces the dispatcher.
pub trait Transport: Send {
    /// Create a listening socket bound to `port` on the local interface,
    /// non-blocking, registered for readiness events.
    fn listen(&mut self, port: u16, backlog: u32) -> crate::Result<Box<dyn Listener>>;

    /// Wait up to `timeout` for readiness anywhere in the socket set.
    /// Returns `false` on timeout with nothing ready.
    fn poll(&mut self, timeout: Duration) -> crate::Result<bool>;
}

/// A listening socket.
pub trait Listener: Send {
    /// Attempt one non-blocking accept. `None` when no connection is
    /// pending. Accepted sockets are non-blocking and registered for
    /// readiness events.
    fn accept(&mut self) -> crate::Result<Option<Box<dyn Connection>>>;

    /// The port this listener is bound to.
    fn local_port(&self) -> crate::Result<u16>;
}

/// One accepted client socket.
pub trait Connection: Send {
    /// One non-blocking read. `Ok(0)` = no data available.
    fn recv(&mut self, buf: &mut [u8]) -> crate::Result<usize>;

    /// One non-blocking write. `Ok(0)` = backpressure, nothing consumed.
    fn send(&mut self, buf: &[u8]) -> crate::Result<usize>;

    /// Socket-alive query, polled by the dispatcher at the top of each
    /// client's work turn.
    fn is_open(&self) -> bool;

    /// Close the socket immediately. After this, `is_open` is false.
    fn close(&mut self);

    /// Hint that the owner wants to be woken when the socket is writable
    /// (a file stream hit backpressure). Transports that pace purely by
    /// period may ignore it.
    fn want_write(&mut self, _enabled: bool) {}
}
