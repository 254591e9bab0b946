#![deny(rust_2018_idioms)]

//! End-to-end tests: a real server on a loopback ephemeral port, spoken to
//! in raw bytes.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ember::blob::MemoryBlobs;
use ember::transport::TcpTransport;
use ember::{
    content_type, print_route, Ember, HttpContext, Method, ProtocolConfig, ResponseLength,
    RouteOptions, Routes, StatusCode, WsContext, WsHandler,
};

struct Server {
    ember: Ember,
    port: u16,
}

impl Drop for Server {
    fn drop(&mut self) {
        self.ember.stop();
    }
}

fn serve(routes: Routes, blobs: MemoryBlobs, root_dir: &str) -> Server {
    let ember = Ember::builder()
        .protocol(ProtocolConfig::http(0).backlog(12).root_dir(root_dir))
        .routes(routes)
        .blobs(blobs)
        .startup_delay(Duration::ZERO)
        .period(Duration::from_millis(5))
        .serve(TcpTransport::new().expect("transport"))
        .expect("serve");
    let port = ember.local_port(0).expect("bound port");
    Server { ember, port }
}

fn connect(server: &Server) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", server.port)).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_millis(150)))
        .expect("read timeout");
    stream
}

/// Read until the stream goes quiet (one read timeout after data arrived)
/// or closes.
fn read_response(stream: &mut TcpStream) -> Vec<u8> {
    let mut collected = Vec::new();
    let mut buf = [0u8; 4096];
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => collected.extend_from_slice(&buf[..n]),
            Err(_) => {
                if !collected.is_empty() {
                    break;
                }
            }
        }
    }
    collected
}

/// Wait for the peer to close the connection.
fn read_until_eof(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 1024];
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        match stream.read(&mut buf) {
            Ok(0) => return true,
            Ok(_) => {}
            Err(_) => {}
        }
    }
    false
}

fn response_text(stream: &mut TcpStream) -> String {
    String::from_utf8_lossy(&read_response(stream)).into_owned()
}

fn mask_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let key = [0x11, 0x22, 0x33, 0x44];
    let mut frame = vec![0x80 | opcode];
    if payload.len() < 126 {
        frame.push(0x80 | payload.len() as u8);
    } else {
        frame.push(0x80 | 126);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    }
    frame.extend_from_slice(&key);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i & 3]));
    frame
}

fn root(ctx: &mut HttpContext<'_>) -> ember::Result<usize> {
    if ctx.method() != &Method::GET {
        return ctx.error(StatusCode::METHOD_NOT_ALLOWED);
    }
    let blob = match ctx.open_blob("static/index.htm") {
        Ok(blob) => blob,
        Err(_) => return ctx.error(StatusCode::NOT_FOUND),
    };
    let mut sent = ctx.send_response_headers(
        StatusCode::OK,
        ResponseLength::Length(blob.len() as usize),
        Some("text/html"),
        None,
    )?;
    sent += ctx.send_response_file(blob)?;
    Ok(sent)
}

fn count(ctx: &mut HttpContext<'_>) -> ember::Result<usize> {
    let body = b"counted";
    let mut sent = ctx.send_response_headers(
        StatusCode::OK,
        ResponseLength::Length(body.len()),
        Some("text/plain"),
        None,
    )?;
    sent += ctx.send_response_content(body)?;
    Ok(sent)
}

fn routes_with_root() -> Routes {
    Routes::builder()
        .route(&[""], RouteOptions::default(), root)
        .route(
            &["count"],
            RouteOptions {
                ignore_trailing_slash: true,
                ..Default::default()
            },
            count,
        )
        .build()
}

#[test]
fn get_index_from_blob_source() {
    let mut blobs = MemoryBlobs::new();
    blobs.insert("web/static/index.htm", &b"<html>welcome</html>"[..]);
    let server = serve(routes_with_root(), blobs, "/web");

    let mut stream = connect(&server);
    stream
        .write_all(b"GET / HTTP/1.1\r\n\r\n")
        .expect("write request");
    let response = response_text(&mut stream);
    assert!(
        response.starts_with("HTTP/1.1 200 OK\r\n"),
        "response: {:?}",
        response
    );
    assert!(response.contains("Connection: close\r\n"));
    assert!(response.contains("Content-Length: 20\r\n"));
    assert!(response.ends_with("<html>welcome</html>"));
}

#[test]
fn get_index_without_blob_is_404() {
    let server = serve(routes_with_root(), MemoryBlobs::new(), "/web");

    let mut stream = connect(&server);
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").expect("write");
    let response = response_text(&mut stream);
    assert!(
        response.starts_with("HTTP/1.1 404 Not Found\r\n"),
        "response: {:?}",
        response
    );
}

#[test]
fn unmatched_route_is_404() {
    let server = serve(routes_with_root(), MemoryBlobs::new(), "/web");

    let mut stream = connect(&server);
    stream
        .write_all(b"GET /nowhere HTTP/1.1\r\n\r\n")
        .expect("write");
    let response = response_text(&mut stream);
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
}

#[test]
fn method_not_allowed_via_error_handler() {
    let mut blobs = MemoryBlobs::new();
    blobs.insert("web/static/index.htm", &b"x"[..]);
    let server = serve(routes_with_root(), blobs, "/web");

    let mut stream = connect(&server);
    stream
        .write_all(b"POST / HTTP/1.1\r\nContent-Length: 0\r\n\r\n")
        .expect("write");
    let response = response_text(&mut stream);
    assert!(
        response.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"),
        "response: {:?}",
        response
    );
}

#[test]
fn malformed_request_is_400() {
    let server = serve(routes_with_root(), MemoryBlobs::new(), "/web");

    let mut stream = connect(&server);
    stream
        .write_all(b"BREW /pot HTTP/1.1\r\n\r\n")
        .expect("write");
    let response = response_text(&mut stream);
    assert!(
        response.starts_with("HTTP/1.1 400 Bad Request\r\n"),
        "response: {:?}",
        response
    );
}

#[test]
fn trailing_slash_reaches_same_handler() {
    for target in ["/count", "/count/"] {
        let server = serve(routes_with_root(), MemoryBlobs::new(), "/web");
        let mut stream = connect(&server);
        let request = format!("GET {} HTTP/1.1\r\n\r\n", target);
        stream.write_all(request.as_bytes()).expect("write");
        let response = response_text(&mut stream);
        assert!(
            response.starts_with("HTTP/1.1 200 OK\r\n"),
            "target {}: {:?}",
            target,
            response
        );
        assert!(response.ends_with("counted"));
    }
}

fn static_echo(ctx: &mut HttpContext<'_>) -> ember::Result<usize> {
    let mut full = [0u8; 256];
    let full_len = print_route(ctx.route_parts(), &mut full);
    let mut name = [0u8; 128];
    let name_len = print_route(ctx.route_parts().skip(1), &mut name);
    let inferred = content_type(std::str::from_utf8(&name[..name_len]).unwrap());

    let mut body = Vec::new();
    body.extend_from_slice(&full[..full_len]);
    body.push(b'|');
    body.extend_from_slice(inferred.as_bytes());

    let mut sent = ctx.send_response_headers(
        StatusCode::OK,
        ResponseLength::Length(body.len()),
        Some(inferred),
        None,
    )?;
    sent += ctx.send_response_content(&body)?;
    Ok(sent)
}

#[test]
fn wildcard_route_parts_and_content_type() {
    let routes = Routes::builder()
        .route(
            &["static", "%"],
            RouteOptions {
                ignore_trailing_slash: true,
                allow_wildcards: true,
            },
            static_echo,
        )
        .build();
    let server = serve(routes, MemoryBlobs::new(), "/web");

    let mut stream = connect(&server);
    stream
        .write_all(b"GET /static/a/b.css HTTP/1.1\r\n\r\n")
        .expect("write");
    let response = response_text(&mut stream);
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Content-Type: text/css\r\n"));
    assert!(
        response.ends_with("/static/a/b.css|text/css"),
        "response: {:?}",
        response
    );
}

fn echo_body(ctx: &mut HttpContext<'_>) -> ember::Result<usize> {
    let body = ctx.body().to_vec();
    let mut sent = ctx.send_response_headers(
        StatusCode::OK,
        ResponseLength::Length(body.len()),
        Some("text/plain"),
        None,
    )?;
    sent += ctx.send_response_content(&body)?;
    Ok(sent)
}

fn body_routes() -> Routes {
    Routes::builder()
        .route(&["x"], RouteOptions::default(), echo_body)
        .build()
}

#[test]
fn post_with_content_length() {
    let server = serve(body_routes(), MemoryBlobs::new(), "/");
    let mut stream = connect(&server);
    stream
        .write_all(b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello")
        .expect("write");
    let response = response_text(&mut stream);
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("hello"), "response: {:?}", response);
}

#[test]
fn post_with_chunked_body() {
    let server = serve(body_routes(), MemoryBlobs::new(), "/");
    let mut stream = connect(&server);
    stream
        .write_all(
            b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
        )
        .expect("write");
    let response = response_text(&mut stream);
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("hello"), "response: {:?}", response);
}

fn chunked_reply(ctx: &mut HttpContext<'_>) -> ember::Result<usize> {
    let mut sent = ctx.send_response_headers(
        StatusCode::OK,
        ResponseLength::Chunked,
        Some("text/plain"),
        None,
    )?;
    sent += ctx.send_response_chunk(Some(b"hel"))?;
    sent += ctx.send_response_chunk(Some(b"lo"))?;
    sent += ctx.send_response_chunk(None)?;
    Ok(sent)
}

#[test]
fn chunked_response_framing() {
    let routes = Routes::builder()
        .route(&["stream"], RouteOptions::default(), chunked_reply)
        .build();
    let server = serve(routes, MemoryBlobs::new(), "/");
    let mut stream = connect(&server);
    stream
        .write_all(b"GET /stream HTTP/1.1\r\n\r\n")
        .expect("write");
    let response = response_text(&mut stream);
    assert!(response.contains("Transfer-Encoding: chunked\r\n"));
    assert!(
        response.ends_with("3\r\nhel\r\n2\r\nlo\r\n0\r\n\r\n"),
        "response: {:?}",
        response
    );
}

fn ws_echo(ctx: &mut WsContext<'_>) -> ember::Result<usize> {
    let text = ctx.text().unwrap_or("").to_owned();
    ctx.send_text(&text)
}

fn ws_upgrade(ctx: &mut HttpContext<'_>) -> ember::Result<usize> {
    let txt: WsHandler = Arc::new(ws_echo);
    ctx.upgrade_to_websocket(Some(txt), None, "/ws")
}

fn ws_routes() -> Routes {
    Routes::builder()
        .route(&["ws"], RouteOptions::default(), ws_upgrade)
        .build()
}

const UPGRADE_REQUEST: &[u8] = b"GET /ws HTTP/1.1\r\n\
      Host: localhost\r\n\
      Connection: Upgrade\r\n\
      Upgrade: websocket\r\n\
      Sec-WebSocket-Version: 13\r\n\
      Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
      \r\n";

fn handshake(server: &Server) -> TcpStream {
    let mut stream = connect(server);
    stream.write_all(UPGRADE_REQUEST).expect("write handshake");
    let response = response_text(&mut stream);
    assert!(
        response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"),
        "response: {:?}",
        response
    );
    assert!(
        response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"),
        "response: {:?}",
        response
    );
    stream
}

#[test]
fn websocket_upgrade_computes_accept_key() {
    let server = serve(ws_routes(), MemoryBlobs::new(), "/");
    handshake(&server);
}

#[test]
fn websocket_upgrade_without_key_is_400() {
    let server = serve(ws_routes(), MemoryBlobs::new(), "/");
    let mut stream = connect(&server);
    stream
        .write_all(b"GET /ws HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .expect("write");
    let response = response_text(&mut stream);
    assert!(
        response.starts_with("HTTP/1.1 400 Bad Request\r\n"),
        "response: {:?}",
        response
    );
}

#[test]
fn websocket_text_echo_after_upgrade() {
    let server = serve(ws_routes(), MemoryBlobs::new(), "/");
    let mut stream = handshake(&server);

    stream
        .write_all(&mask_frame(0x1, b"ping over ws"))
        .expect("write frame");
    let reply = read_response(&mut stream);
    assert_eq!(reply[0], 0x81);
    assert_eq!(reply[1] as usize, 12);
    assert_eq!(&reply[2..], b"ping over ws");
}

#[test]
fn oversized_frame_gets_1009_close_and_drop() {
    let server = serve(ws_routes(), MemoryBlobs::new(), "/");
    let mut stream = handshake(&server);

    // 64-bit length form: always refused.
    let mut frame = vec![0x81u8, 0x80 | 127];
    frame.extend_from_slice(&1_000_000u64.to_be_bytes());
    frame.extend_from_slice(&[1, 2, 3, 4]);
    stream.write_all(&frame).expect("write frame");

    let reply = read_response(&mut stream);
    assert_eq!(reply[0], 0x88, "expected close frame, got {:?}", reply);
    assert_eq!(&reply[2..4], &1009u16.to_be_bytes());
    assert_eq!(&reply[4..], b"Message too big");
    // The dispatcher drops the client after the close frame.
    assert!(read_until_eof(&mut stream), "connection not closed");
}

#[test]
fn select_clients_broadcasts_to_route() {
    let server = serve(ws_routes(), MemoryBlobs::new(), "/");
    let mut stream = handshake(&server);

    // The upgrade completes on the dispatcher thread; wait until the
    // websocket client is observable.
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut seen = false;
    while Instant::now() < deadline && !seen {
        server
            .ember
            .select_clients(|client| {
                if client.is_websocket() && client.ws_route() == Some("/ws") {
                    seen = true;
                    client.send_ws_text("{\"count\":41}")
                } else {
                    Ok(0)
                }
            })
            .expect("select_clients");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(seen, "websocket client never appeared");

    let reply = read_response(&mut stream);
    assert_eq!(reply[0], 0x81);
    assert_eq!(&reply[2..], b"{\"count\":41}");
}

#[test]
fn http_clients_are_invisible_to_ws_broadcast() {
    let server = serve(ws_routes(), MemoryBlobs::new(), "/");
    let _stream = connect(&server);

    // Give the dispatcher a moment to accept.
    std::thread::sleep(Duration::from_millis(50));
    let mut websockets = 0;
    let mut total = 0;
    server
        .ember
        .select_clients(|client| {
            total += 1;
            if client.is_websocket() {
                websockets += 1;
            }
            Ok(0)
        })
        .expect("select_clients");
    assert_eq!(websockets, 0);
    assert!(total >= 1);
}
