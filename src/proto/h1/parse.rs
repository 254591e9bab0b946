//! Request parsing over the shared receive buffer.
//!
//! httparse scans the request line and headers; everything interesting is
//! recorded as index ranges into the buffer rather than borrowed slices, so
//! the body region can then be rewritten in place for chunked decoding.
//! The request URL is copied into the per-client working buffer and split
//! there; query parameters are URL-decoded in place. Nothing in this module
//! allocates.

use http::Method;
use tracing::trace;

use crate::config::{HEADER_PARTS, MAX_FILENAME, PARAM_PARTS, ROUTE_PARTS};
use crate::error::{Error, Parse};
use crate::proto::Span;

/// httparse scratch; recognized headers are filtered out of this afterwards.
const MAX_RAW_HEADERS: usize = 64;

/// The headers the server cares about. Anything else in a request is
/// skipped during parsing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HeaderId {
    Accept,
    ContentLength,
    ContentType,
    Host,
    Connection,
    TransferEncoding,
    Upgrade,
    SecWebSocketVersion,
    SecWebSocketKey,
}

static RECOGNIZED_HEADERS: &[(&str, HeaderId)] = &[
    ("Accept", HeaderId::Accept),
    ("Content-Length", HeaderId::ContentLength),
    ("Content-Type", HeaderId::ContentType),
    ("Host", HeaderId::Host),
    ("Connection", HeaderId::Connection),
    ("Transfer-Encoding", HeaderId::TransferEncoding),
    ("Upgrade", HeaderId::Upgrade),
    ("Sec-WebSocket-Version", HeaderId::SecWebSocketVersion),
    ("Sec-WebSocket-Key", HeaderId::SecWebSocketKey),
];

impl HeaderId {
    pub(crate) fn from_name(name: &str) -> Option<HeaderId> {
        RECOGNIZED_HEADERS
            .iter()
            .find(|(text, _)| text.eq_ignore_ascii_case(name))
            .map(|&(_, id)| id)
    }
}

static VERBS: &[(&str, Method)] = &[
    ("GET", Method::GET),
    ("HEAD", Method::HEAD),
    ("POST", Method::POST),
    ("PUT", Method::PUT),
    ("DELETE", Method::DELETE),
    ("TRACE", Method::TRACE),
    ("OPTIONS", Method::OPTIONS),
    ("CONNECT", Method::CONNECT),
    ("PATCH", Method::PATCH),
];

fn verb_for(token: &str) -> crate::Result<Method> {
    VERBS
        .iter()
        .find(|(text, _)| *text == token)
        .map(|(_, verb)| verb.clone())
        .ok_or_else(|| Error::new_parse(Parse::Verb))
}

/// One parsed request: the verb, the recognized headers and the body, all
/// as spans into the receive buffer. The URL lives in the client's
/// [`UrlBuf`], which outlives the buffer contents.
#[derive(Clone, Debug)]
pub(crate) struct Request {
    pub(crate) verb: Method,
    pub(crate) headers: [(HeaderId, Span); HEADER_PARTS],
    pub(crate) n_headers: usize,
    pub(crate) body: Span,
}

impl Request {
    /// A request with nothing parsed, used while reporting errors found
    /// before parsing finished.
    pub(crate) fn empty() -> Request {
        Request {
            verb: Method::GET,
            headers: [(HeaderId::Accept, Span::default()); HEADER_PARTS],
            n_headers: 0,
            body: Span::default(),
        }
    }

    pub(crate) fn header_value<'b>(&self, id: HeaderId, rcv: &'b [u8]) -> Option<&'b str> {
        self.headers[..self.n_headers]
            .iter()
            .find(|(hid, _)| *hid == id)
            .map(|(_, span)| span.as_str(rcv))
    }
}

/// The per-client working copy of the request URL and its split points.
///
/// Spans index into `buf`, so the parts survive until the next request on
/// this client even though the receive buffer is shared.
pub(crate) struct UrlBuf {
    buf: [u8; MAX_FILENAME],
    route: [Span; ROUTE_PARTS],
    pub(crate) n_route: usize,
    params: [Span; PARAM_PARTS],
    pub(crate) n_params: usize,
}

impl UrlBuf {
    pub(crate) fn new() -> UrlBuf {
        UrlBuf {
            buf: [0; MAX_FILENAME],
            route: [Span::default(); ROUTE_PARTS],
            n_route: 0,
            params: [Span::default(); PARAM_PARTS],
            n_params: 0,
        }
    }

    pub(crate) fn route_part(&self, i: usize) -> &str {
        self.route[i].as_str(&self.buf)
    }

    pub(crate) fn param_part(&self, i: usize) -> &str {
        self.params[i].as_str(&self.buf)
    }

    /// Fill `out` with the route parts; returns how many there are.
    pub(crate) fn collect_route<'a>(&'a self, out: &mut [&'a str; ROUTE_PARTS]) -> usize {
        for i in 0..self.n_route {
            out[i] = self.route_part(i);
        }
        self.n_route
    }
}

impl std::fmt::Debug for UrlBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlBuf")
            .field("n_route", &self.n_route)
            .field("n_params", &self.n_params)
            .finish()
    }
}

/// Parse one complete request out of `rcv[..len]`.
///
/// The URL lands split and decoded in `url`; the returned [`Request`] spans
/// index into `rcv`, whose body region may have been compacted in place.
pub(crate) fn parse_request(
    rcv: &mut [u8],
    len: usize,
    url: &mut UrlBuf,
    delimiters: &str,
) -> crate::Result<Request> {
    let (head_len, verb, headers, n_headers, te_chunked, content_length) = {
        let mut raw = [httparse::EMPTY_HEADER; MAX_RAW_HEADERS];
        let mut req = httparse::Request::new(&mut raw);
        let status = req.parse(&rcv[..len]).map_err(|e| match e {
            httparse::Error::TooManyHeaders => Error::new_parse(Parse::TooLarge),
            _ => Error::new_parse(Parse::Header),
        })?;
        let head_len = match status {
            httparse::Status::Complete(n) => n,
            // The whole head must arrive in one receive; no reassembly.
            httparse::Status::Partial => return Err(Error::new_parse(Parse::Header)),
        };
        trace!(head_len, "request head parsed");
        let verb = verb_for(req.method.unwrap_or(""))?;
        if req.version != Some(1) {
            return Err(Error::new_parse(Parse::Version));
        }
        resolve_url_parts(req.path.unwrap_or(""), url, delimiters)?;

        // Record recognized headers as spans; hyper-style index recovery
        // from the borrowed slices.
        let base = rcv.as_ptr() as usize;
        let mut headers = [(HeaderId::Accept, Span::default()); HEADER_PARTS];
        let mut n_headers = 0;
        let mut te_chunked = false;
        let mut content_length: Option<Span> = None;
        for header in req.headers.iter() {
            let Some(id) = HeaderId::from_name(header.name) else {
                continue;
            };
            if n_headers == HEADER_PARTS - 1 {
                break;
            }
            let start = header.value.as_ptr() as usize - base;
            let span = trim_span(rcv, Span::new(start, start + header.value.len()));
            headers[n_headers] = (id, span);
            n_headers += 1;
            match id {
                HeaderId::TransferEncoding => {
                    if span.as_str(rcv).contains("chunked") {
                        te_chunked = true;
                    }
                }
                HeaderId::ContentLength => content_length = Some(span),
                _ => {}
            }
        }
        (head_len, verb, headers, n_headers, te_chunked, content_length)
    };

    let body = resolve_body(rcv, len, head_len, te_chunked, content_length)?;

    Ok(Request {
        verb,
        headers,
        n_headers,
        body,
    })
}

fn trim_span(buf: &[u8], mut span: Span) -> Span {
    while span.start < span.end
        && (buf[span.start] == b' ' || buf[span.start] == b'\t')
    {
        span.start += 1;
    }
    while span.end > span.start
        && (buf[span.end - 1] == b' ' || buf[span.end - 1] == b'\t')
    {
        span.end -= 1;
    }
    span
}

/// Work out where the body is and how long it is.
///
/// Transfer-Encoding containing `chunked` wins over Content-Length; a
/// Content-Length must match the received byte count exactly; with
/// neither, any bytes past the head are an error.
fn resolve_body(
    rcv: &mut [u8],
    len: usize,
    head_len: usize,
    te_chunked: bool,
    content_length: Option<Span>,
) -> crate::Result<Span> {
    if te_chunked {
        let n = decode_chunked(&mut rcv[head_len..len])?;
        return Ok(Span::new(head_len, head_len + n));
    }
    if let Some(span) = content_length {
        let expected: usize = span
            .as_str(rcv)
            .trim()
            .parse()
            .map_err(|_| Error::new_parse(Parse::Body))?;
        if len - head_len != expected {
            return Err(Error::new_parse(Parse::Body));
        }
        return Ok(Span::new(head_len, len));
    }
    if len == head_len {
        Ok(Span::new(head_len, head_len))
    } else {
        Err(Error::new_parse(Parse::Body))
    }
}

/// Decode chunked framing in place: each chunk's data is compacted to the
/// front of `region`, and the decoded length is returned.
fn decode_chunked(region: &mut [u8]) -> crate::Result<usize> {
    let mut read = 0;
    let mut write = 0;
    loop {
        let size_end = find_crlf(&region[read..])
            .map(|at| read + at)
            .ok_or_else(|| Error::new_parse(Parse::Body))?;
        let size_str = std::str::from_utf8(&region[read..size_end])
            .map_err(|_| Error::new_parse(Parse::Body))?;
        let chunk = usize::from_str_radix(size_str.trim(), 16)
            .map_err(|_| Error::new_parse(Parse::Body))?;
        let data = size_end + 2;
        if chunk == 0 {
            if region.len() < data + 2 || &region[data..data + 2] != b"\r\n" {
                return Err(Error::new_parse(Parse::Body));
            }
            return Ok(write);
        }
        if data + chunk + 2 > region.len() {
            return Err(Error::new_parse(Parse::Body));
        }
        if &region[data + chunk..data + chunk + 2] != b"\r\n" {
            return Err(Error::new_parse(Parse::Body));
        }
        region.copy_within(data..data + chunk, write);
        write += chunk;
        read = data + chunk + 2;
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\r\n")
}

/// Copy the request URL into the working buffer, strip one leading `/`,
/// split on `?` into route and parameters, split both on the delimiter
/// set, and URL-decode the parameters in place.
pub(crate) fn resolve_url_parts(
    path: &str,
    url: &mut UrlBuf,
    delimiters: &str,
) -> crate::Result<()> {
    let bytes = path.as_bytes();
    if bytes.len() > MAX_FILENAME {
        return Err(Error::new_parse(Parse::UriTooLong));
    }
    url.buf[..bytes.len()].copy_from_slice(bytes);
    let mut start = 0;
    let len = bytes.len();
    if len > start && url.buf[start] == b'/' {
        start += 1;
    }
    let query_at = url.buf[start..len].iter().position(|&b| b == b'?');
    let (route_end, params_start) = match query_at {
        Some(at) => (start + at, Some(start + at + 1)),
        None => (len, None),
    };

    url.n_route = split_parts(
        &url.buf,
        start,
        route_end,
        delimiters.as_bytes(),
        &mut url.route,
        ROUTE_PARTS - 1,
    );

    url.n_params = match params_start {
        Some(params_start) => split_parts(
            &url.buf,
            params_start,
            len,
            delimiters.as_bytes(),
            &mut url.params,
            PARAM_PARTS - 1,
        ),
        None => 0,
    };

    // Parameters are URL-decoded in place; route parts are not decoded.
    for i in 0..url.n_params {
        let span = url.params[i];
        let decoded = url_decode(&mut url.buf[span.start..span.end]);
        url.params[i] = Span::new(span.start, span.start + decoded);
    }
    Ok(())
}

/// Split `buf[start..end]` on any byte in `delimiters` into at most `max`
/// spans; the final span keeps any unsplit remainder. There is always at
/// least one (possibly empty) part.
fn split_parts(
    buf: &[u8],
    start: usize,
    end: usize,
    delimiters: &[u8],
    out: &mut [Span],
    max: usize,
) -> usize {
    let mut n = 0;
    let mut part_start = start;
    while n < max - 1 {
        let next = buf[part_start..end]
            .iter()
            .position(|b| delimiters.contains(b));
        match next {
            Some(at) => {
                out[n] = Span::new(part_start, part_start + at);
                n += 1;
                part_start += at + 1;
            }
            None => break,
        }
    }
    out[n] = Span::new(part_start, end);
    n + 1
}

/// Decode `%HH` escapes and `+` in place; returns the decoded length.
/// A `%` without two following characters ends decoding; the remainder is
/// kept verbatim, as is any `%` followed by non-hex characters.
pub(crate) fn url_decode(bytes: &mut [u8]) -> usize {
    let len = bytes.len();
    let mut read = 0;
    let mut write = 0;
    while read < len {
        match bytes[read] {
            b'%' if read + 2 < len => {
                match (hex_val(bytes[read + 1]), hex_val(bytes[read + 2])) {
                    (Some(hi), Some(lo)) => {
                        bytes[write] = hi * 16 + lo;
                        read += 3;
                    }
                    _ => {
                        bytes[write] = b'%';
                        read += 1;
                    }
                }
                write += 1;
            }
            b'%' => {
                // Not enough characters left to decode; keep the tail.
                while read < len {
                    bytes[write] = bytes[read];
                    read += 1;
                    write += 1;
                }
            }
            b'+' => {
                bytes[write] = b' ';
                read += 1;
                write += 1;
            }
            c => {
                bytes[write] = c;
                read += 1;
                write += 1;
            }
        }
    }
    write
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &[u8]) -> (Vec<u8>, crate::Result<Request>, UrlBuf) {
        let mut rcv = vec![0u8; 2048];
        rcv[..input.len()].copy_from_slice(input);
        let mut url = UrlBuf::new();
        let parsed = parse_request(&mut rcv, input.len(), &mut url, "/\\");
        (rcv, parsed, url)
    }

    fn route_parts(url: &UrlBuf) -> Vec<String> {
        (0..url.n_route).map(|i| url.route_part(i).to_owned()).collect()
    }

    fn param_parts(url: &UrlBuf) -> Vec<String> {
        (0..url.n_params)
            .map(|i| url.param_part(i).to_owned())
            .collect()
    }

    #[test]
    fn simple_get() {
        let (rcv, parsed, url) = parse(b"GET /static/a/b.css HTTP/1.1\r\nHost: x\r\n\r\n");
        let req = parsed.unwrap();
        assert_eq!(req.verb, http::Method::GET);
        assert_eq!(route_parts(&url), ["static", "a", "b.css"]);
        assert_eq!(url.n_params, 0);
        assert_eq!(req.header_value(HeaderId::Host, &rcv), Some("x"));
        assert_eq!(req.body.len(), 0);
    }

    #[test]
    fn root_url_is_one_empty_part() {
        let (_rcv, parsed, url) = parse(b"GET / HTTP/1.1\r\n\r\n");
        parsed.unwrap();
        assert_eq!(route_parts(&url), [""]);
    }

    #[test]
    fn trailing_slash_keeps_empty_part() {
        let (_rcv, parsed, url) = parse(b"GET /count/ HTTP/1.1\r\n\r\n");
        parsed.unwrap();
        assert_eq!(route_parts(&url), ["count", ""]);
    }

    #[test]
    fn unknown_verb_is_rejected() {
        let (_rcv, parsed, _url) = parse(b"BREW /pot HTTP/1.1\r\n\r\n");
        assert!(parsed.unwrap_err().is_parse());
    }

    #[test]
    fn http_10_is_rejected() {
        let (_rcv, parsed, _url) = parse(b"GET / HTTP/1.0\r\n\r\n");
        assert!(parsed.unwrap_err().is_parse());
    }

    #[test]
    fn missing_head_terminator_is_rejected() {
        let (_rcv, parsed, _url) = parse(b"GET / HTTP/1.1\r\nHost: x\r\n");
        assert!(parsed.unwrap_err().is_parse());
    }

    #[test]
    fn content_length_body() {
        let (rcv, parsed, _url) =
            parse(b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello");
        let req = parsed.unwrap();
        assert_eq!(req.body.slice(&rcv), b"hello");
    }

    #[test]
    fn content_length_mismatch_is_rejected() {
        let (_rcv, parsed, _url) =
            parse(b"POST /x HTTP/1.1\r\nContent-Length: 9\r\n\r\nhello");
        assert!(parsed.unwrap_err().is_parse());
    }

    #[test]
    fn body_without_length_is_rejected() {
        let (_rcv, parsed, _url) = parse(b"POST /x HTTP/1.1\r\n\r\nhello");
        assert!(parsed.unwrap_err().is_parse());
    }

    #[test]
    fn chunked_body_is_compacted_in_place() {
        let (rcv, parsed, _url) = parse(
            b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
        );
        let req = parsed.unwrap();
        assert_eq!(req.body.slice(&rcv), b"hello");
        assert_eq!(req.body.len(), 5);
    }

    #[test]
    fn chunked_body_multiple_chunks() {
        let (rcv, parsed, _url) = parse(
            b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
        );
        let req = parsed.unwrap();
        assert_eq!(req.body.slice(&rcv), b"Wikipedia");
    }

    #[test]
    fn chunked_without_terminator_is_rejected() {
        let (_rcv, parsed, _url) = parse(
            b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n",
        );
        assert!(parsed.unwrap_err().is_parse());
    }

    #[test]
    fn params_are_split_and_decoded() {
        let (_rcv, parsed, url) = parse(b"GET /search?q=hello%20there+friend HTTP/1.1\r\n\r\n");
        parsed.unwrap();
        assert_eq!(route_parts(&url), ["search"]);
        assert_eq!(param_parts(&url), ["q=hello there friend"]);
    }

    #[test]
    fn route_parts_are_not_decoded() {
        let (_rcv, parsed, url) = parse(b"GET /a%20b HTTP/1.1\r\n\r\n");
        parsed.unwrap();
        assert_eq!(route_parts(&url), ["a%20b"]);
    }

    #[test]
    fn split_caps_at_route_parts_and_keeps_remainder() {
        let (_rcv, parsed, url) =
            parse(b"GET /a/b/c/d/e/f/g/h/i/j HTTP/1.1\r\n\r\n");
        parsed.unwrap();
        assert_eq!(url.n_route, ROUTE_PARTS - 1);
        assert_eq!(url.route_part(ROUTE_PARTS - 2), "h/i/j");
    }

    #[test]
    fn recognized_headers_only() {
        let (rcv, parsed, _url) = parse(
            b"GET / HTTP/1.1\r\nHost: here\r\nX-Custom: skipped\r\nUpgrade:  websocket \r\n\r\n",
        );
        let req = parsed.unwrap();
        assert_eq!(req.n_headers, 2);
        assert_eq!(req.header_value(HeaderId::Host, &rcv), Some("here"));
        // Values are whitespace-trimmed.
        assert_eq!(req.header_value(HeaderId::Upgrade, &rcv), Some("websocket"));
        assert_eq!(req.header_value(HeaderId::Accept, &rcv), None);
    }

    #[test]
    fn printed_route_parses_back_to_the_same_parts() {
        let parts = ["static", "a", "b.css"];
        let mut printed = [0u8; 64];
        let n = crate::proto::h1::route::print_route(parts.iter().copied(), &mut printed);
        let printed = std::str::from_utf8(&printed[..n]).unwrap();

        let mut url = UrlBuf::new();
        resolve_url_parts(printed, &mut url, "/\\").unwrap();
        assert_eq!(route_parts(&url), parts);
    }

    #[test]
    fn url_decode_round_trip() {
        let mut buf = *b"%48ello+world%21";
        let n = url_decode(&mut buf);
        assert_eq!(&buf[..n], b"Hello world!");
    }

    #[test]
    fn url_decode_keeps_invalid_escapes() {
        let mut buf = *b"a%zzb";
        let n = url_decode(&mut buf);
        assert_eq!(&buf[..n], b"a%zzb");

        let mut buf = *b"tail%2";
        let n = url_decode(&mut buf);
        assert_eq!(&buf[..n], b"tail%2");
    }

    #[test]
    fn over_long_url_is_rejected() {
        let mut raw = b"GET /".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_FILENAME + 8));
        raw.extend_from_slice(b" HTTP/1.1\r\n\r\n");
        let (_rcv, parsed, _url) = parse(&raw);
        assert!(parsed.unwrap_err().is_parse());
    }
}
