//! The WebSocket state machine.
//!
//! One frame is decoded per work cycle from a single receive. Text and
//! binary messages go to the handlers installed at upgrade time; control
//! frames are answered by the engine itself.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::config::MAX_FILENAME;
use crate::error::Error;
use crate::proto::WorkContext;
use crate::transport::Connection;

pub(crate) mod frame;

use self::frame::FrameError;

/// A WebSocket message handler, installed at upgrade time and invoked for
/// each inbound text or binary message. Runs on the dispatcher task and
/// must not block. `Err` drops the client.
pub type WsHandler = Arc<dyn Fn(&mut WsContext<'_>) -> crate::Result<usize> + Send + Sync>;

/// Per-client WebSocket state. Overwrites the HTTP state in the client
/// record when the upgrade completes.
pub(crate) struct WsClient {
    pub(crate) txt: Option<WsHandler>,
    pub(crate) bin: Option<WsHandler>,
    pub(crate) route: [u8; MAX_FILENAME],
    pub(crate) route_len: usize,
}

impl WsClient {
    pub(crate) fn route(&self) -> &str {
        std::str::from_utf8(&self.route[..self.route_len]).unwrap_or("")
    }
}

/// One WebSocket work cycle: receive, decode one frame, dispatch on its
/// opcode.
pub(crate) fn work(
    client: &mut WsClient,
    conn: &mut dyn Connection,
    cx: &mut WorkContext<'_>,
) -> crate::Result<usize> {
    let n = conn.recv(cx.rcv)?;
    if n == 0 {
        return Ok(0);
    }
    let parsed = match frame::parse(cx.rcv, n) {
        Ok(frame) => frame,
        Err(FrameError::TooBig) => {
            debug!("oversized frame; closing");
            let _ = frame::send_close(conn, frame::CLOSE_MESSAGE_TOO_BIG);
            return Err(Error::new_ws(frame::CLOSE_MESSAGE_TOO_BIG));
        }
        Err(FrameError::Truncated) => {
            debug!("truncated frame; closing");
            let _ = frame::send_close(conn, frame::CLOSE_PROTOCOL_ERROR);
            return Err(Error::new_ws(frame::CLOSE_PROTOCOL_ERROR));
        }
    };
    trace!(opcode = parsed.opcode, len = parsed.payload.len(), "frame");
    let payload = parsed.payload;

    match parsed.opcode {
        frame::OP_CONTINUE | frame::OP_PONG => Ok(0),
        frame::OP_TEXT => match client.txt.clone() {
            Some(handler) => {
                let mut ctx = WsContext {
                    conn,
                    payload: payload.slice(cx.rcv),
                    fin: parsed.fin,
                    binary: false,
                    route: client.route(),
                };
                handler(&mut ctx)
            }
            None => {
                let _ = frame::send_close(conn, frame::CLOSE_UNSUPPORTED_DATA);
                Err(Error::new_ws(frame::CLOSE_UNSUPPORTED_DATA))
            }
        },
        frame::OP_BINARY => match client.bin.clone() {
            Some(handler) => {
                let mut ctx = WsContext {
                    conn,
                    payload: payload.slice(cx.rcv),
                    fin: parsed.fin,
                    binary: true,
                    route: client.route(),
                };
                handler(&mut ctx)
            }
            None => {
                let _ = frame::send_close(conn, frame::CLOSE_UNSUPPORTED_DATA);
                Err(Error::new_ws(frame::CLOSE_UNSUPPORTED_DATA))
            }
        },
        frame::OP_CLOSE => {
            // Echo the close, fin set, then drop the client.
            let _ = frame::send_message(conn, frame::OP_CLOSE, payload.slice(cx.rcv));
            Err(Error::new_closed())
        }
        frame::OP_PING => frame::send_message(conn, frame::OP_PONG, payload.slice(cx.rcv)),
        _ => {
            debug!(opcode = parsed.opcode, "unknown opcode; closing");
            let _ = frame::send_close(conn, frame::CLOSE_PROTOCOL_ERROR);
            Err(Error::new_ws(frame::CLOSE_PROTOCOL_ERROR))
        }
    }
}

/// A message handler's view of its client: the unmasked payload and the
/// framed send API.
pub struct WsContext<'a> {
    pub(crate) conn: &'a mut dyn Connection,
    pub(crate) payload: &'a [u8],
    pub(crate) fin: bool,
    pub(crate) binary: bool,
    pub(crate) route: &'a str,
}

impl std::fmt::Debug for WsContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsContext")
            .field("payload_len", &self.payload.len())
            .field("binary", &self.binary)
            .field("route", &self.route)
            .finish()
    }
}

impl WsContext<'_> {
    /// The unmasked message payload.
    pub fn payload(&self) -> &[u8] {
        self.payload
    }

    /// The payload as text, when it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(self.payload).ok()
    }

    /// Whether this message arrived on a binary frame.
    pub fn is_binary(&self) -> bool {
        self.binary
    }

    /// Whether the frame had the fin bit set.
    pub fn is_fin(&self) -> bool {
        self.fin
    }

    /// The route string given at upgrade time.
    pub fn route(&self) -> &str {
        self.route
    }

    /// Send a text message to this client.
    pub fn send_text(&mut self, text: &str) -> crate::Result<usize> {
        frame::send_message(self.conn, frame::OP_TEXT, text.as_bytes())
    }

    /// Send a binary message to this client.
    pub fn send_binary(&mut self, payload: &[u8]) -> crate::Result<usize> {
        frame::send_message(self.conn, frame::OP_BINARY, payload)
    }
}
