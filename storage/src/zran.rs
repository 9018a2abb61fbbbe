// Copyright 2024 Zran Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Random access into the uncompressed space of a gzip blob.
//!
//! On construction a *frontier* decoder is started over the whole blob. It
//! publishes a checkpoint roughly every [`DEFAULT_SPAN`] bytes of
//! uncompressed output through a bounded channel, drained by a background
//! consumer into an append-only, ordered checkpoint set.
//!
//! `read_at` serves a target offset by picking the cheapest available path:
//! an idle pooled decoder already standing at the offset, else a fresh
//! decoder resumed from the highest checkpoint at or below it, else any
//! idle decoder behind it (the frontier qualifies before the first
//! checkpoint lands). The chosen decoder discards up to the target and
//! reads; it returns to the pool on success and is dropped on failure.

use std::fmt;
use std::io::{self, BufReader, Read, Write};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use zran_utils::compress::{Checkpoint, GzipReader};

use crate::backend::{BackendError, BackendResult, RangeReader, SectionReader};
use crate::meta::{MetaError, ZranIndex};

/// Default minimum uncompressed distance between checkpoints (1 MiB).
pub const DEFAULT_SPAN: u64 = 1 << 20;

/// Buffer size of the frontier decoder, sized to coalesce index-pass reads
/// into large transport requests.
const FRONTIER_BUF_SIZE: usize = 1 << 20;
/// Buffer size of decoders resumed from a checkpoint.
const RESUME_BUF_SIZE: usize = 256 * 1024;
/// Capacity of the checkpoint channel; a full queue throttles the frontier
/// to the consumer's rate.
const CHECKPOINT_QUEUE_DEPTH: usize = 10;
/// Idle decoders kept for reuse. The frontier is never evicted.
const MAX_POOLED_READERS: usize = 8;

#[derive(Debug)]
pub enum ZranError {
    /// No checkpoint or idle decoder can serve the requested offset yet.
    NoCheckpoint(u64),
    Backend(BackendError),
    Meta(MetaError),
    Io(io::Error),
}

impl fmt::Display for ZranError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZranError::NoCheckpoint(off) => write!(
                f,
                "could not find any checkpoints or readers for offset {}",
                off
            ),
            ZranError::Backend(e) => write!(f, "{}", e),
            ZranError::Meta(e) => write!(f, "{}", e),
            ZranError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ZranError {}

impl From<ZranError> for io::Error {
    fn from(e: ZranError) -> Self {
        match e {
            ZranError::Io(e) => e,
            e => io::Error::new(io::ErrorKind::Other, e.to_string()),
        }
    }
}

pub type ZranResult<T> = std::result::Result<T, ZranError>;

type PooledReader = GzipReader<BufReader<SectionReader>>;

/// Reader exposing the uncompressed byte space of a gzip blob.
pub struct ZranReader {
    ra: Arc<dyn RangeReader>,
    size: u64,
    /// Ordered checkpoint set: strictly increasing in `out_offset`, weakly
    /// increasing in `in_offset`. Single producer, append only.
    checkpoints: Arc<RwLock<Vec<Arc<Checkpoint>>>>,
    /// Idle decoders. A busy decoder is simply absent from the pool.
    pool: Mutex<Vec<PooledReader>>,
    consumer: Option<JoinHandle<()>>,
}

impl ZranReader {
    /// Open `ra` (the whole gzip blob, `size` bytes) and start the frontier
    /// pass with the default checkpoint span.
    pub fn new(ra: Arc<dyn RangeReader>, size: u64) -> ZranResult<Self> {
        Self::with_span(ra, size, DEFAULT_SPAN)
    }

    pub fn with_span(ra: Arc<dyn RangeReader>, size: u64, span: u64) -> ZranResult<Self> {
        let (tx, rx) = sync_channel::<Checkpoint>(CHECKPOINT_QUEUE_DEPTH);

        let checkpoints: Arc<RwLock<Vec<Arc<Checkpoint>>>> = Arc::new(RwLock::new(Vec::new()));
        let consumer = {
            let checkpoints = checkpoints.clone();
            thread::Builder::new()
                .name("zran-index".to_string())
                .spawn(move || {
                    for checkpoint in rx {
                        checkpoints.write().unwrap().push(Arc::new(checkpoint));
                    }
                })
                .map_err(ZranError::Io)?
        };

        let frontier = Self::frontier(ra.clone(), size, span, tx)?;

        Ok(ZranReader {
            ra,
            size,
            checkpoints,
            pool: Mutex::new(vec![frontier]),
            consumer: Some(consumer),
        })
    }

    fn frontier(
        ra: Arc<dyn RangeReader>,
        size: u64,
        span: u64,
        tx: SyncSender<Checkpoint>,
    ) -> ZranResult<PooledReader> {
        let section = SectionReader::new(ra, 0, size);
        let br = BufReader::with_capacity(FRONTIER_BUF_SIZE, section);
        GzipReader::new_with_spans(br, 0, span, tx).map_err(ZranError::Io)
    }

    /// Persist the checkpoint set to a sidecar.
    pub fn encode<W: Write>(&self, w: W) -> ZranResult<()> {
        let snapshot: Vec<Checkpoint> = {
            let checkpoints = self.checkpoints.read().unwrap();
            checkpoints.iter().map(|ck| (**ck).clone()).collect()
        };
        ZranIndex::new(snapshot).save(w).map_err(ZranError::Meta)
    }

    /// Reconstruct a reader from a sidecar produced by [`encode`], without
    /// re-scanning the blob. The restored reader serves reads purely from
    /// resumed decoders; it has no frontier and emits no new checkpoints.
    ///
    /// [`encode`]: ZranReader::encode
    pub fn decode<R: Read>(ra: Arc<dyn RangeReader>, size: u64, r: R) -> ZranResult<Self> {
        let index = ZranIndex::load(r).map_err(ZranError::Meta)?;
        let checkpoints = index.checkpoints.into_iter().map(Arc::new).collect();
        Ok(ZranReader {
            ra,
            size,
            checkpoints: Arc::new(RwLock::new(checkpoints)),
            pool: Mutex::new(Vec::new()),
            consumer: None,
        })
    }

    /// Number of checkpoints collected so far.
    pub fn checkpoint_count(&self) -> usize {
        self.checkpoints.read().unwrap().len()
    }

    fn discard(zr: &mut PooledReader, count: u64) -> ZranResult<()> {
        if count == 0 {
            return Ok(());
        }
        let copied =
            io::copy(&mut zr.by_ref().take(count), &mut io::sink()).map_err(ZranError::Io)?;
        if copied < count {
            return Err(ZranError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended {} bytes short of target", count - copied),
            )));
        }
        Ok(())
    }

    /// Acquire a decoder positioned exactly at `off`. The decoder is
    /// removed from the pool while in use; callers must hand it back with
    /// `release` (or drop it on failure).
    fn acquire_reader(&self, off: u64) -> ZranResult<PooledReader> {
        // Best case: an idle decoder already stands at the offset.
        {
            let mut pool = self.pool.lock().unwrap();
            if let Some(i) = pool.iter().position(|zr| zr.offset() == off) {
                return Ok(pool.swap_remove(i));
            }
        }

        // Highest checkpoint at or below the target.
        let highest: Option<Arc<Checkpoint>> = {
            let checkpoints = self.checkpoints.read().unwrap();
            let i = checkpoints.partition_point(|ck| ck.out_offset <= off);
            if i == 0 {
                None
            } else {
                Some(checkpoints[i - 1].clone())
            }
        };

        let Some(checkpoint) = highest else {
            // No checkpoints yet, probably a read before the index pass got
            // anywhere. Any idle decoder at or before the target will do,
            // typically the frontier.
            let candidate = {
                let mut pool = self.pool.lock().unwrap();
                pool.iter()
                    .position(|zr| zr.offset() <= off)
                    .map(|i| pool.swap_remove(i))
            };
            let Some(mut zr) = candidate else {
                return Err(ZranError::NoCheckpoint(off));
            };
            let behind = off - zr.offset();
            Self::discard(&mut zr, behind)?;
            return Ok(zr);
        };

        debug!(
            "resuming decoder from checkpoint out={} in={} for offset {}",
            checkpoint.out_offset, checkpoint.in_offset, off
        );
        let section = SectionReader::new(
            self.ra.clone(),
            checkpoint.in_offset,
            self.size.saturating_sub(checkpoint.in_offset),
        );
        let br = BufReader::with_capacity(RESUME_BUF_SIZE, section);
        let mut zr = GzipReader::resume(br, &checkpoint, None);
        Self::discard(&mut zr, off - checkpoint.out_offset)?;
        Ok(zr)
    }

    fn release(&self, zr: PooledReader) {
        let mut pool = self.pool.lock().unwrap();
        if pool.len() >= MAX_POOLED_READERS && !zr.emits_checkpoints() {
            // Bounded pool; resumed decoders are cheap to rebuild from
            // their checkpoint, the frontier is not.
            return;
        }
        pool.push(zr);
    }

    /// Fill `buf` exactly from uncompressed offset `off`.
    pub fn read_at(&self, buf: &mut [u8], off: u64) -> ZranResult<()> {
        let mut zr = self.acquire_reader(off)?;
        match zr.read_exact(buf) {
            Ok(()) => {
                self.release(zr);
                Ok(())
            }
            // The decoder state is indeterminate after a failure; drop it
            // instead of returning it to the pool.
            Err(e) => Err(ZranError::Io(e)),
        }
    }
}

impl RangeReader for ZranReader {
    fn size(&self) -> BackendResult<u64> {
        // The uncompressed size is only known once the frontier finishes;
        // consumers of the tar stream detect its end marker instead.
        Err(BackendError::Unsupported(
            "uncompressed size of a gzip blob is not known up front".to_string(),
        ))
    }

    fn try_read_at(&self, buf: &mut [u8], offset: u64) -> BackendResult<usize> {
        let mut zr = match self.acquire_reader(offset) {
            Ok(zr) => zr,
            // Offsets at or past the end of the stream read as EOF.
            Err(ZranError::Io(ref e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(0)
            }
            Err(e) => return Err(BackendError::Decode(e.into())),
        };
        let mut filled = 0;
        while filled < buf.len() {
            match zr.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => return Err(BackendError::Decode(e)),
            }
        }
        self.release(zr);
        Ok(filled)
    }
}

impl Drop for ZranReader {
    fn drop(&mut self) {
        // Dropping the pooled decoders drops every channel sender, which
        // ends the consumer loop.
        self.pool.lock().unwrap().clear();
        if let Some(consumer) = self.consumer.take() {
            let _ = consumer.join();
        }
    }
}
