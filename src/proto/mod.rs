//! Per-protocol state machines and the plumbing shared between them.

use std::io;

use crate::blob::BlobSource;
use crate::error::Error;
use crate::proto::h1::route::Routes;
use crate::transport::Connection;

pub(crate) mod h1;
pub(crate) mod ws;

/// Everything a client work function borrows for one work cycle: the shared
/// receive and send buffers, the route table and the blob source.
pub(crate) struct WorkContext<'a> {
    pub(crate) rcv: &'a mut [u8],
    pub(crate) snd: &'a mut [u8],
    pub(crate) routes: &'a Routes,
    pub(crate) blobs: &'a dyn BlobSource,
    pub(crate) file_chunk_size: usize,
}

/// A half-open range into one of the shared buffers.
///
/// The parsers store spans instead of borrowed slices so a later stage can
/// mutate the buffer (in-place chunked decoding, unmasking) without
/// fighting earlier borrows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Span {
    pub(crate) start: usize,
    pub(crate) end: usize,
}

impl Span {
    pub(crate) fn new(start: usize, end: usize) -> Span {
        Span { start, end }
    }

    pub(crate) fn len(&self) -> usize {
        self.end - self.start
    }

    pub(crate) fn slice<'b>(&self, buf: &'b [u8]) -> &'b [u8] {
        &buf[self.start..self.end]
    }

    pub(crate) fn as_str<'b>(&self, buf: &'b [u8]) -> &'b str {
        std::str::from_utf8(self.slice(buf)).unwrap_or("")
    }
}

/// Send the whole of `buf`, looping over short writes. `Ok(0)` from the
/// connection mid-message would leave the peer with a torn message, so it
/// is reported as an error.
pub(crate) fn send_all(conn: &mut dyn Connection, buf: &[u8]) -> crate::Result<usize> {
    let mut sent = 0;
    while sent < buf.len() {
        let n = conn.send(&buf[sent..])?;
        if n == 0 {
            return Err(Error::new_io(io::Error::new(
                io::ErrorKind::WriteZero,
                "send stalled mid-message",
            )));
        }
        sent += n;
    }
    Ok(sent)
}
