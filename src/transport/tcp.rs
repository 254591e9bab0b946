//! Default transport over the host's TCP sockets.
//!
//! Readiness comes from a `mio` poll shared by every socket the transport
//! creates; `socket2` builds the listener so the configured backlog is
//! honored. Events are used only as a wake-up hint: the dispatcher already
//! retries every client each period, so a missed edge costs at most one
//! period of latency.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::{TcpListener as MioTcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::trace;

use super::{Connection, Listener, Transport};
use crate::error::Error;

/// [`Transport`] implementation over the operating system's TCP stack.
pub struct TcpTransport {
    poll: Poll,
    events: Events,
    next_token: Arc<AtomicUsize>,
}

impl TcpTransport {
    /// Create a transport with an empty socket set.
    pub fn new() -> crate::Result<TcpTransport> {
        let poll = Poll::new().map_err(Error::new_listen)?;
        Ok(TcpTransport {
            poll,
            events: Events::with_capacity(256),
            next_token: Arc::new(AtomicUsize::new(0)),
        })
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport").finish()
    }
}

impl Transport for TcpTransport {
    fn listen(&mut self, port: u16, backlog: u32) -> crate::Result<Box<dyn Listener>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
            .map_err(Error::new_listen)?;
        socket.set_reuse_address(true).map_err(Error::new_listen)?;
        socket.bind(&addr.into()).map_err(Error::new_listen)?;
        socket.listen(backlog as i32).map_err(Error::new_listen)?;
        socket.set_nonblocking(true).map_err(Error::new_listen)?;
        let mut inner = MioTcpListener::from_std(socket.into());
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.poll
            .registry()
            .register(&mut inner, token, Interest::READABLE)
            .map_err(Error::new_listen)?;
        let registry = self.poll.registry().try_clone().map_err(Error::new_listen)?;
        Ok(Box::new(TcpListener {
            inner,
            registry,
            next_token: Arc::clone(&self.next_token),
        }))
    }

    fn poll(&mut self, timeout: Duration) -> crate::Result<bool> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => Ok(!self.events.is_empty()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(false),
            Err(e) => Err(Error::new_io(e)),
        }
    }
}

struct TcpListener {
    inner: MioTcpListener,
    registry: Registry,
    next_token: Arc<AtomicUsize>,
}

impl Listener for TcpListener {
    fn accept(&mut self) -> crate::Result<Option<Box<dyn Connection>>> {
        match self.inner.accept() {
            Ok((mut stream, peer)) => {
                let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
                self.registry
                    .register(&mut stream, token, Interest::READABLE)
                    .map_err(Error::new_io)?;
                trace!(%peer, "accepted tcp connection");
                let registry = self.registry.try_clone().map_err(Error::new_io)?;
                Ok(Some(Box::new(TcpConnection {
                    inner: stream,
                    registry,
                    token,
                    open: true,
                })))
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(Error::new_io(e)),
        }
    }

    fn local_port(&self) -> crate::Result<u16> {
        let addr = self.inner.local_addr().map_err(Error::new_io)?;
        Ok(addr.port())
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        let _ = self.registry.deregister(&mut self.inner);
    }
}

struct TcpConnection {
    inner: TcpStream,
    registry: Registry,
    token: Token,
    open: bool,
}

impl Connection for TcpConnection {
    fn recv(&mut self, buf: &mut [u8]) -> crate::Result<usize> {
        match self.inner.read(buf) {
            // A zero-length read on a readable stream is the peer's FIN.
            Ok(0) => {
                self.open = false;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => {
                self.open = false;
                Err(Error::new_io(e))
            }
        }
    }

    fn send(&mut self, buf: &[u8]) -> crate::Result<usize> {
        match self.inner.write(buf) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => {
                self.open = false;
                Err(Error::new_io(e))
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        if self.open {
            let _ = self.inner.shutdown(Shutdown::Both);
            self.open = false;
        }
    }

    fn want_write(&mut self, enabled: bool) {
        let interest = if enabled {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if let Err(e) = self
            .registry
            .reregister(&mut self.inner, self.token, interest)
        {
            trace!("reregister failed: {}", e);
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        let _ = self.registry.deregister(&mut self.inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_accept_roundtrip() {
        let mut transport = TcpTransport::new().unwrap();
        let mut listener = transport.listen(0, 4).unwrap();
        let port = listener.local_port().unwrap();
        assert_ne!(port, 0);
        assert!(listener.accept().unwrap().is_none());

        let mut peer = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        // Wait for the connection to become acceptable.
        let mut conn = None;
        for _ in 0..100 {
            let _ = transport.poll(Duration::from_millis(10)).unwrap();
            if let Some(c) = listener.accept().unwrap() {
                conn = Some(c);
                break;
            }
        }
        let mut conn = conn.expect("no connection accepted");
        assert!(conn.is_open());

        peer.write_all(b"ping").unwrap();
        let mut buf = [0u8; 16];
        let mut got = 0;
        for _ in 0..100 {
            let _ = transport.poll(Duration::from_millis(10)).unwrap();
            got = conn.recv(&mut buf).unwrap();
            if got > 0 {
                break;
            }
        }
        assert_eq!(&buf[..got], b"ping");

        assert_eq!(conn.send(b"pong").unwrap(), 4);
        let mut echo = [0u8; 4];
        peer.read_exact(&mut echo).unwrap();
        assert_eq!(&echo, b"pong");

        conn.close();
        assert!(!conn.is_open());
    }
}
