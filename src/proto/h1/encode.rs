//! Response construction into the shared send buffer, chunked reply
//! framing, and the bounded file-streaming loop.

use http::StatusCode;
use tracing::trace;

use crate::blob::Blob;
use crate::error::Error;
use crate::proto::send_all;
use crate::transport::Connection;

/// How a response announces its body length.
///
/// Every constructed header block carries exactly one of
/// `Content-Length` or `Transfer-Encoding: chunked`; the enum makes any
/// other combination unrepresentable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseLength {
    /// `Content-Length: n`.
    Length(usize),
    /// `Transfer-Encoding: chunked`; send the body with
    /// [`HttpContext::send_response_chunk`](super::HttpContext::send_response_chunk).
    Chunked,
}

/// Bounded writer over the send buffer. Overflow is remembered and
/// reported once at the end instead of panicking mid-header.
pub(crate) struct Cursor<'a> {
    dst: &'a mut [u8],
    pos: usize,
    overflow: bool,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(dst: &'a mut [u8]) -> Cursor<'a> {
        Cursor {
            dst,
            pos: 0,
            overflow: false,
        }
    }

    pub(crate) fn put(&mut self, bytes: &[u8]) {
        let space = self.dst.len() - self.pos;
        if bytes.len() > space {
            self.overflow = true;
            return;
        }
        self.dst[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn put_itoa(&mut self, value: usize) {
        let mut buf = itoa::Buffer::new();
        self.put(buf.format(value).as_bytes());
    }

    fn last_two(&self) -> Option<&[u8]> {
        self.pos.checked_sub(2).map(|at| &self.dst[at..self.pos])
    }

    pub(crate) fn finish(self) -> crate::Result<usize> {
        if self.overflow {
            Err(Error::new_buffer_full())
        } else {
            Ok(self.pos)
        }
    }
}

/// Build a full response header block into `dst` and return its length.
///
/// Layout: status line, fixed `Accept-Encoding: identity` and
/// `Connection: close`, optional `Content-Type`, the length header per
/// `length`, an optional caller-supplied extra block (terminated with CRLF
/// if the caller forgot), and the final empty line.
pub(crate) fn construct_headers(
    dst: &mut [u8],
    status: StatusCode,
    length: ResponseLength,
    content_type: Option<&str>,
    extra: Option<&str>,
) -> crate::Result<usize> {
    let mut cur = Cursor::new(dst);
    cur.put(b"HTTP/1.1 ");
    cur.put(status.as_str().as_bytes());
    cur.put(b" ");
    cur.put(status.canonical_reason().unwrap_or("unknown").as_bytes());
    cur.put(b"\r\n");
    cur.put(b"Accept-Encoding: identity\r\nConnection: close\r\n");
    if let Some(content_type) = content_type {
        cur.put(b"Content-Type: ");
        cur.put(content_type.as_bytes());
        cur.put(b"\r\n");
    }
    match length {
        ResponseLength::Length(n) => {
            cur.put(b"Content-Length: ");
            cur.put_itoa(n);
            cur.put(b"\r\n");
        }
        ResponseLength::Chunked => {
            cur.put(b"Transfer-Encoding: chunked\r\n");
        }
    }
    if let Some(extra) = extra {
        cur.put(extra.as_bytes());
        if cur.last_two() != Some(&b"\r\n"[..]) {
            cur.put(b"\r\n");
        }
    }
    cur.put(b"\r\n");
    cur.finish()
}

/// Send one chunk of a chunked response: `HEX\r\n<bytes>\r\n`. `None`
/// emits the terminating `0\r\n\r\n`.
pub(crate) fn send_chunk(
    conn: &mut dyn Connection,
    content: Option<&[u8]>,
) -> crate::Result<usize> {
    let Some(content) = content else {
        return send_all(conn, b"0\r\n\r\n");
    };
    let mut head = [0u8; 18];
    let n = write_hex(content.len(), &mut head);
    head[n] = b'\r';
    head[n + 1] = b'\n';
    let mut sent = send_all(conn, &head[..n + 2])?;
    sent += send_all(conn, content)?;
    sent += send_all(conn, b"\r\n")?;
    Ok(sent)
}

fn write_hex(mut value: usize, dst: &mut [u8]) -> usize {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut tmp = [0u8; 16];
    let mut i = 0;
    loop {
        tmp[i] = DIGITS[value & 0xf];
        value >>= 4;
        i += 1;
        if value == 0 {
            break;
        }
    }
    for (at, digit) in tmp[..i].iter().rev().enumerate() {
        dst[at] = *digit;
    }
    i
}

/// Streaming state for a file transfer in flight on an HTTP client.
pub(crate) struct FileStream {
    pub(crate) blob: Option<Box<dyn Blob>>,
    pub(crate) bytes_left: u64,
    pub(crate) offset: u64,
    pub(crate) in_progress: bool,
}

impl FileStream {
    pub(crate) fn idle() -> FileStream {
        FileStream {
            blob: None,
            bytes_left: 0,
            offset: 0,
            in_progress: false,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.blob = None;
        self.bytes_left = 0;
        self.offset = 0;
        self.in_progress = false;
    }
}

/// Begin streaming `blob` and run the first continuation pass.
pub(crate) fn start_file(
    stream: &mut FileStream,
    blob: Box<dyn Blob>,
    conn: &mut dyn Connection,
    snd: &mut [u8],
    chunk_cap: usize,
) -> crate::Result<usize> {
    stream.bytes_left = blob.len();
    stream.offset = 0;
    stream.blob = Some(blob);
    stream.in_progress = true;
    continue_file(stream, conn, snd, chunk_cap)
}

/// One continuation pass of a file transfer.
///
/// Sends at most one send-buffer-full per block until the file drains, the
/// socket errors, the socket stalls (backpressure), or more than
/// `chunk_cap` bytes went out this cycle (fairness toward other clients).
pub(crate) fn continue_file(
    stream: &mut FileStream,
    conn: &mut dyn Connection,
    snd: &mut [u8],
    chunk_cap: usize,
) -> crate::Result<usize> {
    if stream.blob.is_none() {
        return Ok(0);
    }
    let mut sent = 0usize;
    while stream.bytes_left > 0 && sent < chunk_cap {
        let want = (stream.bytes_left as usize).min(snd.len());
        let read = match stream.blob.as_mut() {
            Some(blob) => match blob.read_at(stream.offset, &mut snd[..want]) {
                // A short blob is as fatal as a read error mid-stream.
                Ok(0) => Err(Error::new_blob(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "blob ended before its declared length",
                ))),
                other => other,
            },
            None => return Ok(sent),
        };
        let got = match read {
            Ok(n) => n,
            Err(e) => {
                conn.want_write(false);
                stream.clear();
                return Err(e);
            }
        };
        match conn.send(&snd[..got]) {
            Ok(0) => {
                // Backpressure: resume from the same offset next cycle.
                conn.want_write(true);
                return Ok(sent);
            }
            Ok(n) => {
                stream.offset += n as u64;
                stream.bytes_left -= n as u64;
                sent += n;
            }
            Err(e) => {
                conn.want_write(false);
                stream.clear();
                return Err(e);
            }
        }
    }
    if stream.bytes_left == 0 {
        trace!(sent, "file stream complete");
        conn.want_write(false);
        stream.clear();
    } else {
        // Fairness cap hit; keep the stream alive for the next cycle.
        conn.want_write(true);
    }
    Ok(sent)
}
