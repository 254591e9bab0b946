//! Test-only in-memory connection.

use std::collections::VecDeque;

use crate::transport::Connection;

/// A scripted [`Connection`]: queued inbound reads, captured outbound
/// writes, and an optional cap on how much each `send` accepts.
pub(crate) struct MockConn {
    reads: VecDeque<Vec<u8>>,
    pub(crate) written: Vec<u8>,
    pub(crate) send_limit: Option<usize>,
    pub(crate) open: bool,
    pub(crate) want_write: bool,
}

impl MockConn {
    pub(crate) fn new() -> MockConn {
        MockConn {
            reads: VecDeque::new(),
            written: Vec::new(),
            send_limit: None,
            open: true,
            want_write: false,
        }
    }

    pub(crate) fn push_read(&mut self, data: &[u8]) {
        self.reads.push_back(data.to_vec());
    }
}

impl Connection for MockConn {
    fn recv(&mut self, buf: &mut [u8]) -> crate::Result<usize> {
        match self.reads.pop_front() {
            Some(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    fn send(&mut self, buf: &[u8]) -> crate::Result<usize> {
        let n = match self.send_limit {
            Some(limit) => buf.len().min(limit),
            None => buf.len(),
        };
        self.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn want_write(&mut self, enabled: bool) {
        self.want_write = enabled;
    }
}
