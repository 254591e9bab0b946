#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # ember
//!
//! A small multi-protocol TCP server built for embedded targets: a single
//! cooperative dispatcher thread owns every socket and drives HTTP/1.1 and
//! WebSocket state machines over one shared receive buffer and one shared
//! send buffer. No per-request allocation; a fixed route table with
//! wildcards; in-place upgrade of an HTTP client into a WebSocket client
//! on the same socket.
//!
//! The concrete socket API and the filesystem are both behind seams: the
//! [`transport`] traits (with a TCP default) and the [`blob`] traits (with
//! disk and in-memory sources), so the core runs unchanged against other
//! stacks.
//!
//! ## Example
//!
//! ```no_run
//! use ember::{
//!     Ember, HttpContext, ProtocolConfig, ResponseLength, RouteOptions, Routes,
//!     StatusCode,
//! };
//! use ember::blob::DiskBlobs;
//! use ember::transport::TcpTransport;
//!
//! fn hello(ctx: &mut HttpContext<'_>) -> ember::Result<usize> {
//!     let body = b"hello";
//!     let mut sent = ctx.send_response_headers(
//!         StatusCode::OK,
//!         ResponseLength::Length(body.len()),
//!         Some("text/plain"),
//!         None,
//!     )?;
//!     sent += ctx.send_response_content(body)?;
//!     Ok(sent)
//! }
//!
//! fn main() -> ember::Result<()> {
//!     let routes = Routes::builder()
//!         .route(&[""], RouteOptions::default(), hello)
//!         .build();
//!     let mut server = Ember::builder()
//!         .protocol(ProtocolConfig::http(8080))
//!         .routes(routes)
//!         .blobs(DiskBlobs::new("/srv/www"))
//!         .serve(TcpTransport::new()?)?;
//!     std::thread::park();
//!     server.stop();
//!     Ok(())
//! }
//! ```
//!
//! Handlers run on the dispatcher thread and must not block. Other tasks
//! interact with connected clients only through
//! [`Ember::select_clients`], which is how a background producer pushes
//! WebSocket messages to every client on a route.

pub mod blob;
pub mod transport;

mod config;
mod error;
#[cfg(test)]
mod mock;
mod proto;
mod server;
mod upgrade;

pub use http::{Method, StatusCode};

pub use crate::config::{
    ProtocolConfig, ProtocolKind, HEADER_PARTS, MAX_FILENAME, PARAM_PARTS, ROUTE_PARTS,
};
pub use crate::error::{Error, Result};
pub use crate::proto::h1::{
    content_type, print_params, print_route, ErrorHandler, Handler, HttpContext,
    ResponseLength, Route, RouteOptions, Routes, RoutesBuilder,
};
pub use crate::proto::ws::{WsContext, WsHandler};
pub use crate::server::clients::Client;
pub use crate::server::{Builder, Ember};
