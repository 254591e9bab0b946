//! The HTTP to WebSocket upgrade bridge.
//!
//! Invoked synchronously by an HTTP route handler; on success the 101
//! response has gone out on the same socket and the client record is
//! marked so the next dispatcher work cycle runs the WebSocket engine.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::{Method, StatusCode};
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::config::MAX_FILENAME;
use crate::error::Error;
use crate::proto::h1::encode::Cursor;
use crate::proto::h1::{HttpContext, PendingUpgrade};
use crate::proto::send_all;
use crate::proto::ws::WsHandler;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const SWITCHING_PROTOCOLS: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\n\
      Connection: Upgrade\r\n\
      Upgrade: websocket\r\n\
      Sec-WebSocket-Accept: ";

/// Validate the handshake, send the 101 response, and record the pending
/// protocol swap on the client.
pub(crate) fn upgrade(
    ctx: &mut HttpContext<'_>,
    txt: Option<WsHandler>,
    bin: Option<WsHandler>,
    route: &str,
) -> crate::Result<usize> {
    if ctx.method() != &Method::GET {
        return ctx.error(StatusCode::BAD_REQUEST);
    }
    // All five upgrade headers must have been received.
    let (Some(_host), Some(connection), Some(upgrade), Some(version), Some(key)) = (
        ctx.header_value("Host"),
        ctx.header_value("Connection"),
        ctx.header_value("Upgrade"),
        ctx.header_value("Sec-WebSocket-Version"),
        ctx.header_value("Sec-WebSocket-Key"),
    ) else {
        return ctx.error(StatusCode::BAD_REQUEST);
    };
    if !contains_ignore_ascii_case(connection, "upgrade")
        || !contains_ignore_ascii_case(upgrade, "websocket")
        || !contains_ignore_ascii_case(version, "13")
    {
        return ctx.error(StatusCode::BAD_REQUEST);
    }

    let mut accept = [0u8; 32];
    let accept_len = accept_key(key, &mut accept)?;

    let response_len = {
        let mut cur = Cursor::new(ctx.snd);
        cur.put(SWITCHING_PROTOCOLS);
        cur.put(&accept[..accept_len]);
        cur.put(b"\r\n\r\n");
        cur.finish()?
    };
    let sent = send_all(ctx.conn, &ctx.snd[..response_len])?;

    let mut route_buf = [0u8; MAX_FILENAME];
    let route_len = route.len().min(MAX_FILENAME);
    route_buf[..route_len].copy_from_slice(&route.as_bytes()[..route_len]);
    ctx.client.pending_upgrade = Some(PendingUpgrade {
        txt,
        bin,
        route: route_buf,
        route_len,
    });
    debug!(route, "upgraded connection to websocket");
    Ok(sent)
}

/// Compute the `Sec-WebSocket-Accept` value for a client key:
/// base64(SHA-1(key + GUID)). Returns the encoded length in `out`.
pub(crate) fn accept_key(key: &str, out: &mut [u8; 32]) -> crate::Result<usize> {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WEBSOCKET_GUID.as_bytes());
    let digest = sha.finalize();
    STANDARD
        .encode_slice(digest, &mut out[..])
        .map_err(|_| Error::new_buffer_full())
}

fn contains_ignore_ascii_case(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack
        .as_bytes()
        .windows(needle.len())
        .any(|window| window.eq_ignore_ascii_case(needle.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_vector() {
        // The RFC 6455 sample handshake.
        let mut out = [0u8; 32];
        let n = accept_key("dGhlIHNhbXBsZSBub25jZQ==", &mut out).unwrap();
        assert_eq!(&out[..n], b"s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn substring_search_is_case_insensitive() {
        assert!(contains_ignore_ascii_case("keep-alive, Upgrade", "upgrade"));
        assert!(contains_ignore_ascii_case("WebSocket", "websocket"));
        assert!(contains_ignore_ascii_case("13", "13"));
        assert!(!contains_ignore_ascii_case("keep-alive", "upgrade"));
        assert!(!contains_ignore_ascii_case("", "x"));
    }
}
