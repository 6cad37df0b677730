//! Byte sources the decoder reads tracks from.
//!
//! An [`AudioFile`] gives the decoder one interface over both ways a track
//! reaches the engine:
//! * a network download in progress, backed by temporary storage
//! * a prefetched resource held in memory
//!
//! Network reads go through a 32 KiB buffer. In-memory resources are read
//! directly.

use std::io::{BufReader, Cursor, Read, Seek};

use bytes::Bytes;
use stream_download::{storage::StorageProvider, StreamDownload};
use symphonia::core::io::MediaSource;

/// Combines Read and Seek traits for audio stream handling.
pub trait ReadSeek: Read + Seek + Send + Sync {}

impl<T: Read + Seek + Send + Sync> ReadSeek for T {}

/// Buffer size for network reads (32 KiB).
///
/// Matches Symphonia's read pattern, which reads sequentially in increasing
/// chunks up to 32 KiB.
pub const BUFFER_LEN: usize = 32 * 1024;

pub struct AudioFile {
    inner: Box<dyn ReadSeek>,

    /// Total size in bytes, if known.
    byte_len: Option<u64>,
}

impl AudioFile {
    /// Wraps a network download. `byte_len` is the announced content
    /// length, if any.
    pub fn from_download<P>(download: StreamDownload<P>, byte_len: Option<u64>) -> Self
    where
        P: StorageProvider + Sync + 'static,
        P::Reader: Sync,
    {
        Self {
            inner: Box::new(BufReader::with_capacity(BUFFER_LEN, download)),
            byte_len,
        }
    }

    /// Wraps a fully materialized resource.
    #[must_use]
    pub fn from_bytes(data: Bytes) -> Self {
        let byte_len = u64::try_from(data.len()).ok();
        Self {
            inner: Box::new(Cursor::new(data)),
            byte_len,
        }
    }
}

impl Read for AudioFile {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Seek for AudioFile {
    #[inline]
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl MediaSource for AudioFile {
    /// Both downloads and resources support seeking.
    #[inline]
    fn is_seekable(&self) -> bool {
        true
    }

    #[inline]
    fn byte_len(&self) -> Option<u64> {
        self.byte_len
    }
}
