//! The HTTP/1.1 state machine.
//!
//! Each work cycle does exactly one of two things: continue a file stream
//! that is already in flight, or receive and service one new request.
//! Handlers see the request and the response API through [`HttpContext`];
//! they run on the dispatcher task and must not block.

use std::sync::Arc;

use http::{Method, StatusCode};
use tracing::{debug, trace};

use crate::blob::{Blob, BlobSource};
use crate::config::{MAX_FILENAME, ROUTE_PARTS};
use crate::error::Error;
use crate::proto::ws::WsHandler;
use crate::proto::{send_all, WorkContext};
use crate::transport::Connection;

pub(crate) mod encode;
pub(crate) mod glob;
pub(crate) mod parse;
pub(crate) mod route;

pub use self::encode::ResponseLength;
pub use self::route::{
    print_params, print_route, ErrorHandler, Handler, Route, RouteOptions, Routes,
    RoutesBuilder,
};

use self::encode::FileStream;
use self::parse::{HeaderId, Request, UrlBuf};
use self::route::Handler as RouteHandler;

/// Per-client HTTP state. Lives in the client record between work cycles;
/// everything request-scoped stays in the shared receive buffer.
pub(crate) struct HttpClient {
    pub(crate) root_dir: Arc<str>,
    pub(crate) url: UrlBuf,
    pub(crate) verb: Method,
    pub(crate) file: FileStream,
    pub(crate) pending_upgrade: Option<PendingUpgrade>,
}

/// Recorded by a successful WebSocket handshake; the work cycle swaps the
/// client's protocol state once the handler returns.
pub(crate) struct PendingUpgrade {
    pub(crate) txt: Option<WsHandler>,
    pub(crate) bin: Option<WsHandler>,
    pub(crate) route: [u8; MAX_FILENAME],
    pub(crate) route_len: usize,
}

impl HttpClient {
    pub(crate) fn new(root_dir: Arc<str>) -> HttpClient {
        HttpClient {
            root_dir,
            url: UrlBuf::new(),
            verb: Method::GET,
            file: FileStream::idle(),
            pending_upgrade: None,
        }
    }

    /// The delete hook: closes the file handle if one is open.
    pub(crate) fn delete(&mut self) {
        self.file.clear();
    }
}

/// One HTTP work cycle.
pub(crate) fn work(
    client: &mut HttpClient,
    conn: &mut dyn Connection,
    cx: &mut WorkContext<'_>,
) -> crate::Result<usize> {
    if client.file.in_progress {
        encode::continue_file(&mut client.file, conn, cx.snd, cx.file_chunk_size)
    } else {
        service_request(client, conn, cx)
    }
}

fn service_request(
    client: &mut HttpClient,
    conn: &mut dyn Connection,
    cx: &mut WorkContext<'_>,
) -> crate::Result<usize> {
    let n = conn.recv(cx.rcv)?;
    if n == 0 {
        return Ok(0);
    }
    trace!(bytes = n, "servicing request");
    let routes = cx.routes;
    let blobs = cx.blobs;
    let file_chunk_size = cx.file_chunk_size;

    let parsed = match parse::parse_request(cx.rcv, n, &mut client.url, routes.delimiters()) {
        Ok(parsed) => parsed,
        Err(e) if e.is_parse() => {
            debug!("malformed request: {}", e);
            client.verb = Method::GET;
            let status = e.status().unwrap_or(StatusCode::BAD_REQUEST);
            let error_handler = routes.error_handler();
            let mut ctx = HttpContext {
                client,
                conn,
                req: Request::empty(),
                rcv: &*cx.rcv,
                snd: &mut *cx.snd,
                blobs,
                routes,
                file_chunk_size,
            };
            return error_handler(&mut ctx, status);
        }
        Err(e) => return Err(e),
    };
    client.verb = parsed.verb.clone();

    let handler: Option<RouteHandler> = {
        let mut parts: [&str; ROUTE_PARTS] = [""; ROUTE_PARTS];
        let n_parts = client.url.collect_route(&mut parts);
        routes.find(&parts[..n_parts]).cloned()
    };

    let mut ctx = HttpContext {
        client,
        conn,
        req: parsed,
        rcv: &*cx.rcv,
        snd: &mut *cx.snd,
        blobs,
        routes,
        file_chunk_size,
    };
    match handler {
        Some(handler) => handler(&mut ctx),
        None => {
            debug!("no matching route");
            let error_handler = routes.error_handler();
            error_handler(&mut ctx, StatusCode::NOT_FOUND)
        }
    }
}

/// A handler's view of the client being serviced: the parsed request, and
/// the response API over the shared send buffer.
pub struct HttpContext<'a> {
    pub(crate) client: &'a mut HttpClient,
    pub(crate) conn: &'a mut dyn Connection,
    pub(crate) req: Request,
    pub(crate) rcv: &'a [u8],
    pub(crate) snd: &'a mut [u8],
    pub(crate) blobs: &'a dyn BlobSource,
    pub(crate) routes: &'a Routes,
    pub(crate) file_chunk_size: usize,
}

impl std::fmt::Debug for HttpContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpContext")
            .field("method", &self.req.verb)
            .field("url", &self.client.url)
            .finish()
    }
}

impl<'a> HttpContext<'a> {
    /// The request's HTTP method.
    pub fn method(&self) -> &Method {
        &self.client.verb
    }

    /// The split request route, leading slash stripped. The root URL `/`
    /// yields a single empty part.
    pub fn route_parts<'b>(&'b self) -> impl Iterator<Item = &'b str> + 'b {
        let url = &self.client.url;
        (0..url.n_route).map(move |i| url.route_part(i))
    }

    /// The split, URL-decoded query parameters.
    pub fn params<'b>(&'b self) -> impl Iterator<Item = &'b str> + 'b {
        let url = &self.client.url;
        (0..url.n_params).map(move |i| url.param_part(i))
    }

    /// The request body. Empty unless the request carried a
    /// `Content-Length` or chunked body.
    pub fn body(&self) -> &[u8] {
        self.req.body.slice(self.rcv)
    }

    /// The value of a recognized request header, if it was present.
    /// Lookup is case-insensitive; unrecognized names return `None`.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        let id = HeaderId::from_name(name)?;
        self.req.header_value(id, self.rcv)
    }

    /// Construct a response header block in the send buffer and transmit
    /// it. Returns the bytes sent.
    pub fn send_response_headers(
        &mut self,
        status: StatusCode,
        length: ResponseLength,
        content_type: Option<&str>,
        extra: Option<&str>,
    ) -> crate::Result<usize> {
        let n = encode::construct_headers(self.snd, status, length, content_type, extra)?;
        send_all(self.conn, &self.snd[..n])
    }

    /// Transmit a block of the response body.
    pub fn send_response_content(&mut self, content: &[u8]) -> crate::Result<usize> {
        send_all(self.conn, content)
    }

    /// Transmit one chunk of a chunked response; `None` sends the
    /// terminating zero-length chunk.
    pub fn send_response_chunk(&mut self, content: Option<&[u8]>) -> crate::Result<usize> {
        encode::send_chunk(self.conn, content)
    }

    /// Open a blob, resolving `path` under this protocol's root directory.
    pub fn open_blob(&self, path: &str) -> crate::Result<Box<dyn Blob>> {
        let mut buf = [0u8; MAX_FILENAME * 2];
        let root = self.client.root_dir.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        let full_len = root.len() + 1 + path.len();
        if full_len > buf.len() {
            return Err(Error::new_buffer_full());
        }
        buf[..root.len()].copy_from_slice(root.as_bytes());
        buf[root.len()] = b'/';
        buf[root.len() + 1..full_len].copy_from_slice(path.as_bytes());
        let full = std::str::from_utf8(&buf[..full_len]).unwrap_or("");
        self.blobs.open(full)
    }

    /// Start streaming `blob` as the response body. Runs the first bounded
    /// pass immediately; later work cycles continue it until it drains.
    /// Send the headers first, with `ResponseLength::Length(blob.len())`.
    pub fn send_response_file(&mut self, blob: Box<dyn Blob>) -> crate::Result<usize> {
        encode::start_file(
            &mut self.client.file,
            blob,
            self.conn,
            self.snd,
            self.file_chunk_size,
        )
    }

    /// Answer this request through the configured error handler.
    pub fn error(&mut self, status: StatusCode) -> crate::Result<usize> {
        let error_handler = self.routes.error_handler();
        error_handler(self, status)
    }

    /// Complete a WebSocket handshake on this client. On success the 101
    /// response has been sent and the next work cycle runs the WebSocket
    /// engine on this socket, dispatching text and binary messages to the
    /// given handlers. `route` tags the client for
    /// [`select_clients`](crate::Ember::select_clients) fan-outs.
    pub fn upgrade_to_websocket(
        &mut self,
        txt: Option<WsHandler>,
        bin: Option<WsHandler>,
        route: &str,
    ) -> crate::Result<usize> {
        crate::upgrade::upgrade(self, txt, bin, route)
    }
}

/// The default error handler: headers plus the status's reason phrase as
/// the body.
pub(crate) fn default_error_handler(
    ctx: &mut HttpContext<'_>,
    status: StatusCode,
) -> crate::Result<usize> {
    ctx.client.file.clear();
    let reason = status.canonical_reason().unwrap_or("unknown");
    let mut sent = ctx.send_response_headers(
        status,
        ResponseLength::Length(reason.len()),
        Some("text/html"),
        None,
    )?;
    sent += ctx.send_response_content(reason.as_bytes())?;
    Ok(sent)
}

static TYPE_COUPLES: &[(&str, &str)] = &[
    ("html", "text/html"),
    ("css", "text/css"),
    ("js", "text/javascript"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("gif", "image/gif"),
    ("json", "application/json"),
    ("txt", "text/plain"),
    ("mp3", "audio/mpeg3"),
    ("wav", "audio/wav"),
    ("flac", "audio/ogg"),
    ("pdf", "application/pdf"),
    ("ttf", "application/x-font-ttf"),
    ("ttc", "application/x-font-ttf"),
];

/// Infer a `Content-Type` from the extension after the last `.` in the
/// last path component. Unknown or missing extensions fall back to
/// `text/html`.
pub fn content_type(path: &str) -> &'static str {
    const DEFAULT: &str = "text/html";
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((_, ext)) => TYPE_COUPLES
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(ext))
            .map(|&(_, mime)| mime)
            .unwrap_or(DEFAULT),
        None => DEFAULT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_inference() {
        assert_eq!(content_type("foo/bar.JSON"), "application/json");
        assert_eq!(content_type("/static/a/b.css"), "text/css");
        assert_eq!(content_type("song.mp3"), "audio/mpeg3");
        assert_eq!(content_type("font.ttc"), "application/x-font-ttf");
        assert_eq!(content_type("README"), "text/html");
        assert_eq!(content_type("dotted.dir/plain"), "text/html");
        assert_eq!(content_type("x.unknown"), "text/html");
    }
}
