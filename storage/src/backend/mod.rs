// Copyright 2024 Zran Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Positioned-read access to a finite blob of known size.
//!
//! A [`RangeReader`] answers "read `n` bytes at absolute offset `o`" and must
//! tolerate concurrent positioned reads. Sequential consumers wrap one in a
//! [`SectionReader`], which carves out a bounded `Read + Seek` view.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

pub mod http;
pub mod localfs;

pub use http::HttpReader;
pub use localfs::FileReader;

/// Error codes related to blob access backends.
#[derive(Debug)]
pub enum BackendError {
    Unsupported(String),
    UnexpectedEof(u64),
    LocalFs(io::Error),
    Http(http::HttpError),
    /// The blob is itself a decoded view (e.g. the uncompressed space of a
    /// gzip blob) and decoding failed.
    Decode(io::Error),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Unsupported(s) => write!(f, "unsupported operation, {}", s),
            BackendError::UnexpectedEof(o) => {
                write!(f, "unexpected end of blob at offset {}", o)
            }
            BackendError::LocalFs(e) => write!(f, "failed to access local blob, {}", e),
            BackendError::Http(e) => write!(f, "failed to access remote blob, {}", e),
            BackendError::Decode(e) => write!(f, "failed to decode blob data, {}", e),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<BackendError> for io::Error {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::UnexpectedEof(_) => {
                io::Error::new(io::ErrorKind::UnexpectedEof, e.to_string())
            }
            BackendError::LocalFs(e) | BackendError::Decode(e) => e,
            e => io::Error::new(io::ErrorKind::Other, e.to_string()),
        }
    }
}

/// Specialized `Result` for backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Read access to a blob of known total size.
pub trait RangeReader: Send + Sync {
    /// Total size of the blob in bytes.
    fn size(&self) -> BackendResult<u64>;

    /// Read up to `buf.len()` bytes at absolute `offset`. Short reads are
    /// allowed; `Ok(0)` means end of blob.
    fn try_read_at(&self, buf: &mut [u8], offset: u64) -> BackendResult<usize>;

    fn retry_limit(&self) -> u8 {
        0
    }

    /// Read with retries on transient failures.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> BackendResult<usize> {
        let mut retry_count = self.retry_limit();
        loop {
            match self.try_read_at(buf, offset) {
                Ok(n) => return Ok(n),
                Err(err) => {
                    if retry_count > 0 {
                        warn!(
                            "read from backend failed: {}, retry count {}",
                            err, retry_count
                        );
                        retry_count -= 1;
                    } else {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Fill `buf` completely at `offset` or fail.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> BackendResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                return Err(BackendError::UnexpectedEof(offset + filled as u64));
            }
            filled += n;
        }
        Ok(())
    }
}

/// A bounded sequential view over a [`RangeReader`], the glue between
/// positioned transports and stream consumers (decoders, tar scanning,
/// file handles).
pub struct SectionReader {
    ra: Arc<dyn RangeReader>,
    base: u64,
    size: u64,
    pos: u64,
}

impl SectionReader {
    /// A view covering `size` bytes of `ra` starting at absolute `base`.
    pub fn new(ra: Arc<dyn RangeReader>, base: u64, size: u64) -> Self {
        SectionReader {
            ra,
            base,
            size,
            pos: 0,
        }
    }

    /// Length of the section in bytes.
    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Positioned read relative to the section start, independent of the
    /// sequential cursor.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        let max = buf.len().min((self.size - offset) as usize);
        self.ra
            .read_at(&mut buf[..max], self.base + offset)
            .map_err(io::Error::from)
    }
}

impl Read for SectionReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for SectionReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(o) => o as i64,
            SeekFrom::Current(d) => self.pos as i64 + d,
            SeekFrom::End(d) => self.size as i64 + d,
        };
        if target < 0 {
            return Err(einval!("seek to a negative position"));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}
