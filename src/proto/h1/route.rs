//! The route table and matcher.
//!
//! A route is an ordered list of path parts compared against the split
//! request URL. The first table entry that matches wins, so table order
//! defines priority. A request that matches nothing is answered by the
//! configured error handler with 404.

use std::fmt;
use std::sync::Arc;

use http::StatusCode;

use super::glob::fnmatch;
use super::HttpContext;

/// An HTTP route handler.
///
/// Handlers run on the dispatcher task and must not block. The return value
/// is the bytes-transferred signal: `Ok(n)` keeps the client, `Err` drops
/// it.
pub type Handler =
    Arc<dyn Fn(&mut HttpContext<'_>) -> crate::Result<usize> + Send + Sync>;

/// The handler invoked for per-request errors (malformed request, no
/// matching route, handler-reported statuses).
pub type ErrorHandler =
    Arc<dyn Fn(&mut HttpContext<'_>, StatusCode) -> crate::Result<usize> + Send + Sync>;

/// Matching options for one route.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouteOptions {
    /// Tolerate a single trailing `/` on either the request or the route.
    pub ignore_trailing_slash: bool,
    /// Enable `%` (rest-of-path) and shell-glob matching in route parts.
    pub allow_wildcards: bool,
}

/// One entry of the route table.
pub struct Route {
    options: RouteOptions,
    parts: Vec<Box<str>>,
    handler: Handler,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("options", &self.options)
            .field("parts", &self.parts)
            .finish()
    }
}

/// The route table: delimiters, ordered routes, error handler.
pub struct Routes {
    delimiters: Box<str>,
    items: Vec<Route>,
    error_handler: ErrorHandler,
}

impl fmt::Debug for Routes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Routes")
            .field("delimiters", &self.delimiters)
            .field("items", &self.items)
            .finish()
    }
}

impl Routes {
    /// Start building a route table.
    pub fn builder() -> RoutesBuilder {
        RoutesBuilder {
            delimiters: Box::from("/\\"),
            items: Vec::new(),
            error_handler: Arc::new(super::default_error_handler),
        }
    }

    pub(crate) fn delimiters(&self) -> &str {
        &self.delimiters
    }

    pub(crate) fn error_handler(&self) -> ErrorHandler {
        Arc::clone(&self.error_handler)
    }

    /// Find the handler for the split request URL, if any.
    pub(crate) fn find(&self, request_parts: &[&str]) -> Option<&Handler> {
        self.items
            .iter()
            .find(|route| matches(route, request_parts))
            .map(|route| &route.handler)
    }
}

fn matches(route: &Route, req: &[&str]) -> bool {
    let opts = route.options;
    let mut j = 0;
    loop {
        let r = req.get(j).copied();
        let p = route.parts.get(j).map(|part| &**part);
        match (r, p) {
            (None, None) => return true,
            _ => {}
        }
        if opts.ignore_trailing_slash {
            // A single extra zero-length part on one side is a trailing '/'.
            let extra_on_request =
                r == Some("") && req.get(j + 1).is_none() && p.is_none();
            let extra_on_route =
                p == Some("") && route.parts.get(j + 1).is_none() && r.is_none();
            if extra_on_request || extra_on_route {
                return true;
            }
        }
        let (Some(r), Some(p)) = (r, p) else {
            return false;
        };
        if opts.allow_wildcards && p == "%" {
            // '%' consumes the remainder of the request.
            return true;
        }
        if opts.allow_wildcards && fnmatch(p, r) {
            j += 1;
            continue;
        }
        if r.eq_ignore_ascii_case(p) {
            j += 1;
            continue;
        }
        return false;
    }
}

/// Builds a [`Routes`] table.
pub struct RoutesBuilder {
    delimiters: Box<str>,
    items: Vec<Route>,
    error_handler: ErrorHandler,
}

impl fmt::Debug for RoutesBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutesBuilder")
            .field("delimiters", &self.delimiters)
            .field("items", &self.items)
            .finish()
    }
}

impl RoutesBuilder {
    /// Set the characters the request URL is split on (default `/\`).
    /// The same set splits the query-parameter section.
    pub fn delimiters(mut self, delimiters: &str) -> Self {
        self.delimiters = Box::from(delimiters);
        self
    }

    /// Append a route. `parts` are the already-split path parts; the root
    /// route is the single empty part `&[""]`.
    pub fn route<H>(mut self, parts: &[&str], options: RouteOptions, handler: H) -> Self
    where
        H: Fn(&mut HttpContext<'_>) -> crate::Result<usize> + Send + Sync + 'static,
    {
        self.items.push(Route {
            options,
            parts: parts.iter().map(|p| Box::from(*p)).collect(),
            handler: Arc::new(handler),
        });
        self
    }

    /// Replace the default error handler.
    pub fn error_handler<H>(mut self, handler: H) -> Self
    where
        H: Fn(&mut HttpContext<'_>, StatusCode) -> crate::Result<usize> + Send + Sync + 'static,
    {
        self.error_handler = Arc::new(handler);
        self
    }

    /// Finish the table.
    pub fn build(self) -> Routes {
        Routes {
            delimiters: self.delimiters,
            items: self.items,
            error_handler: self.error_handler,
        }
    }
}

/// Format route parts as `/a/b/c` into `dst`, truncating if it does not
/// fit. Returns the number of bytes written.
pub fn print_route<'a>(parts: impl Iterator<Item = &'a str>, dst: &mut [u8]) -> usize {
    let mut n = 0;
    for part in parts {
        n += put(dst, n, b"/");
        n += put(dst, n, part.as_bytes());
    }
    n
}

/// Format query parameters as `?a=1&b=2` into `dst`, truncating if they do
/// not fit. Writes nothing at all when there are no parameters. Returns the
/// number of bytes written.
pub fn print_params<'a>(params: impl Iterator<Item = &'a str>, dst: &mut [u8]) -> usize {
    let mut n = 0;
    for (i, param) in params.enumerate() {
        n += put(dst, n, if i == 0 { b"?" } else { b"&" });
        n += put(dst, n, param.as_bytes());
    }
    n
}

fn put(dst: &mut [u8], at: usize, bytes: &[u8]) -> usize {
    let n = bytes.len().min(dst.len().saturating_sub(at));
    dst[at..at + n].copy_from_slice(&bytes[..n]);
    n
}
