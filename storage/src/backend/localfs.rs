// Copyright 2024 Zran Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Blob access backed by a local file.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::backend::{BackendError, BackendResult, RangeReader};

/// A [`RangeReader`] over a local file, using positioned reads so concurrent
/// callers never contend on a shared cursor.
pub struct FileReader {
    file: File,
}

impl FileReader {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        Ok(Self { file })
    }

    pub fn from_file(file: File) -> Self {
        Self { file }
    }
}

impl RangeReader for FileReader {
    fn size(&self) -> BackendResult<u64> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(BackendError::LocalFs)
    }

    fn try_read_at(&self, buf: &mut [u8], offset: u64) -> BackendResult<usize> {
        debug!(
            "local blob read: offset={} size={}",
            offset,
            buf.len()
        );
        nix::sys::uio::pread(self.file.as_raw_fd(), buf, offset as i64)
            .map_err(|e| BackendError::LocalFs(io::Error::from_raw_os_error(e as i32)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_file_reader() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"hello positioned world").unwrap();
        let ra = FileReader::open(tmp.path()).unwrap();

        assert_eq!(ra.size().unwrap(), 22);

        let mut buf = [0u8; 10];
        assert_eq!(ra.try_read_at(&mut buf, 6).unwrap(), 10);
        assert_eq!(&buf, b"positioned");

        // Reads at the end of the file report EOF.
        assert_eq!(ra.try_read_at(&mut buf, 22).unwrap(), 0);
    }
}
