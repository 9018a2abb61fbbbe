// Copyright 2024 Zran Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The DEFLATE output history, a 32 KiB circular buffer.
//!
//! Decoded output accumulates between `rd_pos` and `wr_pos`; back-references
//! reach into the most recent `hist_size()` bytes. Callers drain pending
//! output through `read_flush`, which also rotates the buffer when the write
//! cursor hits the end.

use std::io::Read;

/// Largest back-reference distance, RFC 1951 section 3.2.5.
pub const WINDOW_SIZE: usize = 1 << 15;

pub struct Window {
    hist: Box<[u8; WINDOW_SIZE]>,
    /// Write cursor, next byte of decoded output lands here.
    wr_pos: usize,
    /// Read cursor, start of output not yet flushed to the caller.
    rd_pos: usize,
    /// Whether the buffer has wrapped at least once.
    full: bool,
}

impl Default for Window {
    fn default() -> Self {
        Window {
            hist: Box::new([0u8; WINDOW_SIZE]),
            wr_pos: 0,
            rd_pos: 0,
            full: false,
        }
    }
}

impl Window {
    pub fn reset(&mut self) {
        self.wr_pos = 0;
        self.rd_pos = 0;
        self.full = false;
    }

    /// Restore the window to a previously captured state. `hist` may be
    /// shorter than the window (empty for checkpoints without history).
    pub fn restore(&mut self, hist: &[u8], wr_pos: usize, rd_pos: usize, full: bool) {
        let n = hist.len().min(WINDOW_SIZE);
        self.hist[..n].copy_from_slice(&hist[..n]);
        self.wr_pos = wr_pos.min(WINDOW_SIZE);
        self.rd_pos = rd_pos.min(self.wr_pos);
        self.full = full;
    }

    pub fn hist(&self) -> &[u8] {
        &self.hist[..]
    }

    pub fn wr_pos(&self) -> usize {
        self.wr_pos
    }

    pub fn rd_pos(&self) -> usize {
        self.rd_pos
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Number of bytes of history reachable by back-references.
    pub fn hist_size(&self) -> usize {
        if self.full {
            WINDOW_SIZE
        } else {
            self.wr_pos
        }
    }

    /// Pending decoded bytes not yet flushed.
    pub fn avail_read(&self) -> usize {
        self.wr_pos - self.rd_pos
    }

    /// Free space before the buffer must be flushed.
    pub fn avail_write(&self) -> usize {
        WINDOW_SIZE - self.wr_pos
    }

    pub fn write_byte(&mut self, c: u8) {
        self.hist[self.wr_pos] = c;
        self.wr_pos += 1;
    }

    /// Fill the writable region from `r`, up to `limit` bytes, with a single
    /// read call. Returns the number of bytes written.
    pub fn write_from<R: Read>(&mut self, r: &mut R, limit: usize) -> std::io::Result<usize> {
        let end = WINDOW_SIZE.min(self.wr_pos + limit);
        let n = r.read(&mut self.hist[self.wr_pos..end])?;
        self.wr_pos += n;
        Ok(n)
    }

    /// Copy a back-reference of `length` bytes from `dist` bytes back,
    /// handling wrap-around and overlapping copies. Stops at the end of the
    /// buffer; returns the number of bytes copied.
    pub fn write_copy(&mut self, dist: usize, length: usize) -> usize {
        let dst_base = self.wr_pos;
        let mut dst_pos = dst_base;
        let end_pos = (dst_pos + length).min(WINDOW_SIZE);

        if dst_pos < dist {
            // The source wraps around to the end of the buffer. That region
            // lies ahead of the write cursor, so a plain move suffices.
            let mut src_pos = dst_pos + WINDOW_SIZE - dist;
            let n = (end_pos - dst_pos).min(WINDOW_SIZE - src_pos);
            self.hist.copy_within(src_pos..src_pos + n, dst_pos);
            dst_pos += n;
            src_pos = 0;
            // Continue from the start of the buffer.
            dst_pos = self.replicate(src_pos, dst_pos, end_pos);
        } else {
            let src_pos = dst_pos - dist;
            dst_pos = self.replicate(src_pos, dst_pos, end_pos);
        }

        self.wr_pos = dst_pos;
        dst_pos - dst_base
    }

    /// Fast path for back-references that neither wrap nor hit the end of
    /// the buffer. Returns 0 when the precondition does not hold.
    pub fn try_write_copy(&mut self, dist: usize, length: usize) -> usize {
        let dst_pos = self.wr_pos;
        let end_pos = dst_pos + length;
        if dst_pos < dist || end_pos > WINDOW_SIZE {
            return 0;
        }
        let dst_base = dst_pos;
        let src_pos = dst_pos - dist;
        let dst_pos = self.replicate(src_pos, dst_pos, end_pos);
        self.wr_pos = dst_pos;
        dst_pos - dst_base
    }

    /// Grow the region [dst_pos, end_pos) from the bytes starting at
    /// src_pos, doubling the copied span each round so overlapping
    /// back-references replicate their pattern.
    fn replicate(&mut self, src_pos: usize, mut dst_pos: usize, end_pos: usize) -> usize {
        while dst_pos < end_pos {
            let (src, dst) = self.hist.split_at_mut(dst_pos);
            let n = (dst_pos - src_pos).min(end_pos - dst_pos);
            dst[..n].copy_from_slice(&src[src_pos..src_pos + n]);
            dst_pos += n;
        }
        dst_pos
    }

    /// Hand out the pending output as a (start, end) range into `hist` and
    /// mark it read, rotating the buffer when the write cursor reached the
    /// end.
    pub fn read_flush(&mut self) -> (usize, usize) {
        let range = (self.rd_pos, self.wr_pos);
        self.rd_pos = self.wr_pos;
        if self.wr_pos == WINDOW_SIZE {
            self.wr_pos = 0;
            self.rd_pos = 0;
            self.full = true;
        }
        range
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_flush() {
        let mut w = Window::default();
        for &c in b"abcdef" {
            w.write_byte(c);
        }
        assert_eq!(w.avail_read(), 6);
        let (s, e) = w.read_flush();
        assert_eq!(&w.hist()[s..e], b"abcdef");
        assert_eq!(w.avail_read(), 0);
        assert_eq!(w.hist_size(), 6);
    }

    #[test]
    fn test_overlapping_copy_replicates() {
        let mut w = Window::default();
        w.write_byte(b'a');
        w.write_byte(b'b');
        // dist 2, length 6 -> "ababab" appended
        let n = w.write_copy(2, 6);
        assert_eq!(n, 6);
        let (s, e) = w.read_flush();
        assert_eq!(&w.hist()[s..e], b"abababab");
    }

    #[test]
    fn test_copy_wraps_around() {
        let mut w = Window::default();
        // Fill the window completely so it rotates.
        for i in 0..WINDOW_SIZE {
            w.write_byte((i % 251) as u8);
        }
        let (_, e) = w.read_flush();
        assert_eq!(e, WINDOW_SIZE);
        assert!(w.is_full());
        assert_eq!(w.wr_pos(), 0);

        // A back-reference at the rotation point must read from the tail of
        // the previous lap.
        let n = w.write_copy(3, 5);
        assert_eq!(n, 5);
        let tail = [
            ((WINDOW_SIZE - 3) % 251) as u8,
            ((WINDOW_SIZE - 2) % 251) as u8,
            ((WINDOW_SIZE - 1) % 251) as u8,
        ];
        let (s, e) = w.read_flush();
        assert_eq!(
            &w.hist()[s..e],
            &[tail[0], tail[1], tail[2], tail[0], tail[1]]
        );
    }

    #[test]
    fn test_try_write_copy_preconditions() {
        let mut w = Window::default();
        w.write_byte(b'x');
        // dist reaches before the start: fast path refuses.
        assert_eq!(w.try_write_copy(2, 3), 0);
        assert_eq!(w.try_write_copy(1, 3), 3);
        let (s, e) = w.read_flush();
        assert_eq!(&w.hist()[s..e], b"xxxx");
    }

    #[test]
    fn test_restore_round_trip() {
        let mut w = Window::default();
        for &c in b"hello" {
            w.write_byte(c);
        }
        let snapshot = w.hist().to_vec();
        let (wr, rd, full) = (w.wr_pos(), w.rd_pos(), w.is_full());

        let mut w2 = Window::default();
        w2.restore(&snapshot, wr, rd, full);
        assert_eq!(w2.avail_read(), 5);
        let (s, e) = w2.read_flush();
        assert_eq!(&w2.hist()[s..e], b"hello");
    }
}
