//! The blob-source seam used by static-file responses.
//!
//! Handlers never touch a filesystem directly; they open blobs by path
//! through a [`BlobSource`]. Reads are offset-based so a block that the
//! socket only partially accepted is re-read from where it stalled on the
//! next work cycle.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Error;

/// Opens blobs by path.
pub trait BlobSource: Send + Sync {
    /// Open the blob at `path`. A miss is an error; HTTP handlers usually
    /// turn it into a 404.
    fn open(&self, path: &str) -> crate::Result<Box<dyn Blob>>;
}

/// An open blob with a known size.
pub trait Blob: Send {
    /// Total size in bytes.
    fn len(&self) -> u64;

    /// Whether the blob is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read up to `buf.len()` bytes starting at `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> crate::Result<usize>;
}

impl fmt::Debug for dyn Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob").field("len", &self.len()).finish()
    }
}

/// Blob source over a directory on the host filesystem.
pub struct DiskBlobs {
    root: PathBuf,
}

impl DiskBlobs {
    /// A source that resolves blob paths under `root`.
    pub fn new(root: impl Into<PathBuf>) -> DiskBlobs {
        DiskBlobs { root: root.into() }
    }
}

impl fmt::Debug for DiskBlobs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskBlobs").field("root", &self.root).finish()
    }
}

impl BlobSource for DiskBlobs {
    fn open(&self, path: &str) -> crate::Result<Box<dyn Blob>> {
        let full = self.root.join(path.trim_start_matches('/'));
        let file = File::open(&full).map_err(Error::new_blob)?;
        let len = file.metadata().map_err(Error::new_blob)?.len();
        Ok(Box::new(DiskBlob { file, len }))
    }
}

struct DiskBlob {
    file: File,
    len: u64,
}

impl Blob for DiskBlob {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> crate::Result<usize> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(Error::new_blob)?;
        self.file.read(buf).map_err(Error::new_blob)
    }
}

/// In-memory blob source, for tests and embedded images.
#[derive(Default)]
pub struct MemoryBlobs {
    blobs: HashMap<String, Arc<[u8]>>,
}

impl MemoryBlobs {
    /// An empty source.
    pub fn new() -> MemoryBlobs {
        MemoryBlobs::default()
    }

    /// Add a blob under `path`. Leading slashes are ignored on lookup, so
    /// `insert("a/b", ..)` serves both `a/b` and `/a/b`.
    pub fn insert(&mut self, path: &str, contents: impl Into<Vec<u8>>) {
        self.blobs.insert(
            path.trim_start_matches('/').to_owned(),
            contents.into().into(),
        );
    }
}

impl fmt::Debug for MemoryBlobs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlobs")
            .field("blobs", &self.blobs.len())
            .finish()
    }
}

impl BlobSource for MemoryBlobs {
    fn open(&self, path: &str) -> crate::Result<Box<dyn Blob>> {
        let data = self
            .blobs
            .get(path.trim_start_matches('/'))
            .cloned()
            .ok_or_else(|| {
                Error::new_blob(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no such blob",
                ))
            })?;
        Ok(Box::new(MemoryBlob { data }))
    }
}

struct MemoryBlob {
    data: Arc<[u8]>,
}

impl Blob for MemoryBlob {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> crate::Result<usize> {
        let offset = offset.min(self.data.len() as u64) as usize;
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_blob_read_at() {
        let mut blobs = MemoryBlobs::new();
        blobs.insert("/web/index.htm", &b"<html>hi</html>"[..]);
        let mut blob = blobs.open("web/index.htm").unwrap();
        assert_eq!(blob.len(), 15);

        let mut buf = [0u8; 6];
        assert_eq!(blob.read_at(0, &mut buf).unwrap(), 6);
        assert_eq!(&buf, b"<html>");
        assert_eq!(blob.read_at(6, &mut buf).unwrap(), 6);
        assert_eq!(&buf, b"hi</ht");
        assert_eq!(blob.read_at(12, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"ml>");
        assert_eq!(blob.read_at(15, &mut buf).unwrap(), 0);
    }

    #[test]
    fn memory_blob_miss() {
        let blobs = MemoryBlobs::new();
        let err = blobs.open("nope").unwrap_err();
        assert!(err.is_blob());
    }
}
