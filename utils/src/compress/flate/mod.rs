// Copyright 2024 Zran Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Streaming DEFLATE (RFC 1951) decoder with resumable checkpoints.
//!
//! Besides plain decompression, the decoder can capture its complete state
//! at the boundary between two DEFLATE blocks: compressed and uncompressed
//! offsets, the residual bit buffer, and a deep copy of the 32 KiB history
//! window. A [`Checkpoint`] is sufficient to construct a fresh decoder that
//! produces the exact uncompressed suffix starting at the captured offset,
//! which is what makes random access into gzip streams possible.
//!
//! The decoder is a step machine so that `read` can pause in the middle of a
//! block whenever the history window fills up, hand the pending output to
//! the caller, and pick up where it left off on the next call.

use std::io::{self, BufRead, Read};
use std::sync::mpsc::SyncSender;

use serde::{Deserialize, Serialize};

use crate::compress::gzip::GzipHeader;

mod huffman;
mod window;

use huffman::{HuffmanDecoder, CHUNK_COUNT_MASK, CHUNK_VALUE_SHIFT, FIXED_LITLEN_DECODER};
use window::Window;

pub use window::WINDOW_SIZE;

/// Maximum number of literal/length codes, RFC 1951 section 3.2.7 with the
/// proviso of section 3.2.5.
const MAX_NUM_LIT: usize = 286;
/// Maximum number of distance codes.
const MAX_NUM_DIST: usize = 30;
/// Number of codes in the Huffman meta-code.
const NUM_CODES: usize = 19;
/// The symbol marking the end of a block.
const END_BLOCK_MARKER: usize = 256;

/// Order in which code lengths of the meta-code are stored, RFC 1951
/// section 3.2.7.
const CODE_ORDER: [usize; NUM_CODES] = [
    16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15,
];

/// Decoder error taxonomy. All errors latch: once a decoder fails, every
/// subsequent read reports the same error.
#[derive(Clone, Debug, thiserror::Error)]
pub enum FlateError {
    #[error("corrupt deflate stream before compressed offset {0}")]
    Corrupt(u64),
    #[error("unexpected end of stream at compressed offset {0}")]
    UnexpectedEof(u64),
    #[error("read error at compressed offset {offset}: {msg}")]
    Read { offset: u64, msg: String },
    /// Internal end-of-stream marker, surfaced to callers as `Ok(0)`.
    #[error("end of stream")]
    Eos,
}

impl From<FlateError> for io::Error {
    fn from(e: FlateError) -> Self {
        match e {
            FlateError::Corrupt(_) => io::Error::new(io::ErrorKind::InvalidData, e),
            FlateError::UnexpectedEof(_) => io::Error::new(io::ErrorKind::UnexpectedEof, e),
            _ => io::Error::new(io::ErrorKind::Other, e),
        }
    }
}

/// A snapshot of decoder state at a DEFLATE block boundary.
///
/// `in_offset`/`out_offset` address the next unread compressed byte and the
/// next uncompressed byte to be produced. `bit_buf` holds the residual bits
/// of the partially consumed byte preceding `in_offset`. `hist` is a deep
/// copy of the history window; checkpoints flagged `empty` carry none and
/// resume with a fresh window (gzip member boundaries).
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub in_offset: u64,
    pub out_offset: u64,
    pub bit_buf: u32,
    pub bit_count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hist: Vec<u8>,
    pub wr_pos: usize,
    pub rd_pos: usize,
    pub full: bool,
    pub empty: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gzip_header: Option<GzipHeader>,
}

impl std::fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpoint")
            .field("in_offset", &self.in_offset)
            .field("out_offset", &self.out_offset)
            .field("bit_buf", &self.bit_buf)
            .field("bit_count", &self.bit_count)
            .field("hist_len", &self.hist.len())
            .field("wr_pos", &self.wr_pos)
            .field("rd_pos", &self.rd_pos)
            .field("full", &self.full)
            .field("empty", &self.empty)
            .field("gzip_header", &self.gzip_header)
            .finish()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Step {
    NextBlock,
    HuffmanBlock,
    CopyData,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum StepState {
    Init,
    Dict,
}

#[derive(Clone, Copy)]
enum TableKind {
    Lit,
    Dist,
}

/// Streaming DEFLATE decoder.
pub struct Decompressor<R> {
    /// Input source.
    r: R,
    /// Compressed bytes consumed so far (absolute offset).
    roffset: u64,
    /// Uncompressed bytes produced so far.
    woffset: u64,

    /// Input bits, in the low end of `b`.
    b: u32,
    nb: u32,

    /// Huffman decoders for literal/length and distance codes of the
    /// current dynamic block.
    h1: HuffmanDecoder,
    h2: HuffmanDecoder,
    /// Whether the current block uses the fixed tables (then distances are
    /// plain 5-bit codes and `h2` is unused).
    fixed_tables: bool,

    /// Scratch code length arrays for dynamic blocks.
    bits: Box<[u32; MAX_NUM_LIT + MAX_NUM_DIST]>,
    codebits: [u32; NUM_CODES],

    /// Output history window.
    dict: Window,
    /// Pending flushed output as a range into the window.
    to_read: (usize, usize),

    step: Step,
    step_state: StepState,
    final_block: bool,
    err: Option<FlateError>,
    copy_len: usize,
    copy_dist: usize,

    /// Checkpoint emission: minimum uncompressed distance between emitted
    /// checkpoints, offset of the last emission, and the outbound channel.
    span: u64,
    last: u64,
    updates: Option<SyncSender<Checkpoint>>,
}

impl<R: BufRead> Decompressor<R> {
    /// Plain streaming decoder without checkpoint emission.
    pub fn new(r: R) -> Self {
        Self::construct(r, 0, 0, None)
    }

    /// Plain decoder whose input starts at absolute compressed offset
    /// `start_in` (the gzip framer strips the member header first).
    pub(crate) fn new_at(r: R, start_in: u64) -> Self {
        Self::construct(r, start_in, 0, None)
    }

    /// Decoder that emits a checkpoint to `updates` at every inter-block
    /// boundary whose uncompressed position advanced at least `span` bytes
    /// since the previous emission. `start_in` is the absolute compressed
    /// offset of the first byte `r` yields.
    pub fn new_with_spans(r: R, start_in: u64, span: u64, updates: SyncSender<Checkpoint>) -> Self {
        Self::construct(r, start_in, span, Some(updates))
    }

    fn construct(r: R, start_in: u64, span: u64, updates: Option<SyncSender<Checkpoint>>) -> Self {
        Decompressor {
            r,
            roffset: start_in,
            woffset: 0,
            b: 0,
            nb: 0,
            h1: HuffmanDecoder::default(),
            h2: HuffmanDecoder::default(),
            fixed_tables: false,
            bits: Box::new([0u32; MAX_NUM_LIT + MAX_NUM_DIST]),
            codebits: [0u32; NUM_CODES],
            dict: Window::default(),
            to_read: (0, 0),
            step: Step::NextBlock,
            step_state: StepState::Init,
            final_block: false,
            err: None,
            copy_len: 0,
            copy_dist: 0,
            span,
            last: 0,
            updates,
        }
    }

    /// Reconstruct a decoder from a checkpoint. `r` must be positioned at
    /// the checkpoint's `in_offset` in compressed space.
    pub fn resume(
        r: R,
        from: &Checkpoint,
        span: u64,
        updates: Option<SyncSender<Checkpoint>>,
    ) -> Self {
        let mut d = Self::construct(r, from.in_offset, span, updates);
        d.dict
            .restore(&from.hist, from.wr_pos, from.rd_pos, from.full);
        d.b = from.bit_buf;
        d.nb = from.bit_count;
        d.woffset = from.out_offset;
        d.last = from.out_offset;
        d
    }

    /// Reset for the next gzip member at compressed offset `roffset`,
    /// keeping the uncompressed position. The caller is expected to have
    /// published a checkpoint for the member boundary first.
    pub fn reset(&mut self, roffset: u64) {
        self.b = 0;
        self.nb = 0;
        self.h1 = HuffmanDecoder::default();
        self.h2 = HuffmanDecoder::default();
        self.fixed_tables = false;
        self.dict.reset();
        self.to_read = (0, 0);
        self.step = Step::NextBlock;
        self.step_state = StepState::Init;
        self.final_block = false;
        self.err = None;
        self.copy_len = 0;
        self.copy_dist = 0;
        self.roffset = roffset;
        self.last = self.woffset;
    }

    /// Uncompressed bytes produced so far, including bytes staged for the
    /// caller but not yet copied out.
    pub fn uncompressed_offset(&self) -> u64 {
        self.woffset
    }

    /// Compressed bytes consumed so far (absolute offset).
    pub fn compressed_offset(&self) -> u64 {
        self.roffset
    }

    /// Whether the final block has been fully decoded.
    pub fn is_eos(&self) -> bool {
        matches!(self.err, Some(FlateError::Eos))
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.r
    }

    fn step(&mut self) {
        match self.step {
            Step::NextBlock => self.next_block(),
            Step::HuffmanBlock => self.huffman_block(),
            Step::CopyData => self.copy_data(),
        }
    }

    fn next_block(&mut self) {
        while self.nb < 1 + 2 {
            if let Err(e) = self.more_bits() {
                self.err = Some(e);
                return;
            }
        }
        self.final_block = self.b & 1 == 1;
        self.b >>= 1;
        let typ = self.b & 3;
        self.b >>= 2;
        self.nb -= 1 + 2;
        match typ {
            0 => self.data_block(),
            1 => {
                // compressed, fixed Huffman tables
                self.fixed_tables = true;
                self.huffman_block();
            }
            2 => {
                // compressed, dynamic Huffman tables
                if let Err(e) = self.read_huffman() {
                    self.err = Some(e);
                    return;
                }
                self.fixed_tables = false;
                self.huffman_block();
            }
            _ => {
                // 3 is reserved.
                self.err = Some(FlateError::Corrupt(self.roffset));
            }
        }
    }

    /// RFC 1951 section 3.2.7: read the dynamic Huffman tables.
    fn read_huffman(&mut self) -> Result<(), FlateError> {
        // HLIT[5], HDIST[5], HCLEN[4].
        while self.nb < 5 + 5 + 4 {
            self.more_bits()?;
        }
        let nlit = (self.b & 0x1f) as usize + 257;
        if nlit > MAX_NUM_LIT {
            return Err(FlateError::Corrupt(self.roffset));
        }
        self.b >>= 5;
        let ndist = (self.b & 0x1f) as usize + 1;
        if ndist > MAX_NUM_DIST {
            return Err(FlateError::Corrupt(self.roffset));
        }
        self.b >>= 5;
        // NUM_CODES is 19, so nclen is always valid.
        let nclen = (self.b & 0xf) as usize + 4;
        self.b >>= 4;
        self.nb -= 5 + 5 + 4;

        // (HCLEN+4)*3 bits: code lengths in the magic CODE_ORDER order.
        for i in 0..nclen {
            while self.nb < 3 {
                self.more_bits()?;
            }
            self.codebits[CODE_ORDER[i]] = self.b & 0x7;
            self.b >>= 3;
            self.nb -= 3;
        }
        for i in nclen..CODE_ORDER.len() {
            self.codebits[CODE_ORDER[i]] = 0;
        }
        self.fixed_tables = false;
        if !self.h1.init(&self.codebits[..]) {
            return Err(FlateError::Corrupt(self.roffset));
        }

        // HLIT + 257 code lengths and HDIST + 1 code lengths, themselves
        // encoded with the meta-code.
        let total = nlit + ndist;
        let mut i = 0;
        while i < total {
            let x = self.huff_sym(TableKind::Lit)? as usize;
            if x < 16 {
                // Actual length.
                self.bits[i] = x as u32;
                i += 1;
                continue;
            }
            // Repeat previous length or zero.
            let (mut rep, nb, b) = match x {
                16 => {
                    if i == 0 {
                        return Err(FlateError::Corrupt(self.roffset));
                    }
                    (3usize, 2u32, self.bits[i - 1])
                }
                17 => (3, 3, 0),
                18 => (11, 7, 0),
                _ => return Err(FlateError::Corrupt(self.roffset)),
            };
            while self.nb < nb {
                self.more_bits()?;
            }
            rep += (self.b & ((1 << nb) - 1)) as usize;
            self.b >>= nb;
            self.nb -= nb;
            if i + rep > total {
                return Err(FlateError::Corrupt(self.roffset));
            }
            for _ in 0..rep {
                self.bits[i] = b;
                i += 1;
            }
        }

        let lit_ok = self.h1.init(&self.bits[..nlit]);
        let dist_ok = self.h2.init(&self.bits[nlit..nlit + ndist]);
        if !lit_ok || !dist_ok {
            return Err(FlateError::Corrupt(self.roffset));
        }

        // Every block terminates with the end-of-block marker, so raising
        // the minimum bits to read per symbol to its code length preserves
        // the property that we never read past the end of the stream.
        if self.h1.min < self.bits[END_BLOCK_MARKER] {
            self.h1.min = self.bits[END_BLOCK_MARKER];
        }

        Ok(())
    }

    /// Decode a single Huffman block, pausing whenever the window fills.
    fn huffman_block(&mut self) {
        if self.step_state == StepState::Dict {
            // Finish the back-reference that filled the window last time.
            if !self.copy_history() {
                return;
            }
        }

        loop {
            // Read a literal or a (length, distance) pair, RFC section 3.2.3.
            let v = match self.huff_sym(TableKind::Lit) {
                Ok(v) => v as usize,
                Err(e) => {
                    self.err = Some(e);
                    return;
                }
            };

            if v < 256 {
                self.dict.write_byte(v as u8);
                if self.dict.avail_write() == 0 {
                    self.to_read = self.dict.read_flush();
                    self.step = Step::HuffmanBlock;
                    self.step_state = StepState::Init;
                    return;
                }
                continue;
            }
            if v == END_BLOCK_MARKER {
                self.finish_block();
                return;
            }

            // Otherwise a reference to older data.
            let mut length;
            let n: u32;
            match v {
                257..=264 => {
                    length = v - (257 - 3);
                    n = 0;
                }
                265..=268 => {
                    length = v * 2 - (265 * 2 - 11);
                    n = 1;
                }
                269..=272 => {
                    length = v * 4 - (269 * 4 - 19);
                    n = 2;
                }
                273..=276 => {
                    length = v * 8 - (273 * 8 - 35);
                    n = 3;
                }
                277..=280 => {
                    length = v * 16 - (277 * 16 - 67);
                    n = 4;
                }
                281..=284 => {
                    length = v * 32 - (281 * 32 - 131);
                    n = 5;
                }
                285 => {
                    length = 258;
                    n = 0;
                }
                _ => {
                    self.err = Some(FlateError::Corrupt(self.roffset));
                    return;
                }
            }
            if n > 0 {
                while self.nb < n {
                    if let Err(e) = self.more_bits() {
                        self.err = Some(e);
                        return;
                    }
                }
                length += (self.b & ((1 << n) - 1)) as usize;
                self.b >>= n;
                self.nb -= n;
            }

            let mut dist;
            if self.fixed_tables {
                // Fixed blocks encode distances as plain 5-bit codes,
                // most significant bit first.
                while self.nb < 5 {
                    if let Err(e) = self.more_bits() {
                        self.err = Some(e);
                        return;
                    }
                }
                dist = (((self.b & 0x1f) << 3) as u8).reverse_bits() as usize;
                self.b >>= 5;
                self.nb -= 5;
            } else {
                dist = match self.huff_sym(TableKind::Dist) {
                    Ok(d) => d as usize,
                    Err(e) => {
                        self.err = Some(e);
                        return;
                    }
                };
            }

            match dist {
                0..=3 => dist += 1,
                4..=29 => {
                    let nb = ((dist - 2) >> 1) as u32;
                    // Have 1 bit in the bottom of dist, need nb more.
                    let mut extra = (dist & 1) << nb;
                    while self.nb < nb {
                        if let Err(e) = self.more_bits() {
                            self.err = Some(e);
                            return;
                        }
                    }
                    extra |= (self.b & ((1 << nb) - 1)) as usize;
                    self.b >>= nb;
                    self.nb -= nb;
                    dist = (1 << (nb + 1)) + 1 + extra;
                }
                _ => {
                    self.err = Some(FlateError::Corrupt(self.roffset));
                    return;
                }
            }

            // No check on length; the encoding can be prescient.
            if dist > self.dict.hist_size() {
                self.err = Some(FlateError::Corrupt(self.roffset));
                return;
            }

            self.copy_len = length;
            self.copy_dist = dist;
            if !self.copy_history() {
                return;
            }
        }
    }

    /// Perform a backwards copy. Returns false when the window filled and
    /// the step machine must pause.
    fn copy_history(&mut self) -> bool {
        let mut cnt = self.dict.try_write_copy(self.copy_dist, self.copy_len);
        if cnt == 0 {
            cnt = self.dict.write_copy(self.copy_dist, self.copy_len);
        }
        self.copy_len -= cnt;

        if self.dict.avail_write() == 0 || self.copy_len > 0 {
            self.to_read = self.dict.read_flush();
            self.step = Step::HuffmanBlock;
            self.step_state = StepState::Dict;
            return false;
        }
        self.step_state = StepState::Init;
        true
    }

    /// Copy a single stored block from input to output.
    fn data_block(&mut self) {
        // Discard the bits of the current partially processed byte.
        self.nb = 0;
        self.b = 0;

        // Length then ones-complement of length.
        let mut header = [0u8; 4];
        if let Err(e) = self.read_full(&mut header) {
            self.err = Some(e);
            return;
        }
        let n = u16::from_le_bytes([header[0], header[1]]);
        let nn = u16::from_le_bytes([header[2], header[3]]);
        if nn != !n {
            self.err = Some(FlateError::Corrupt(self.roffset));
            return;
        }

        if n == 0 {
            self.to_read = self.dict.read_flush();
            self.finish_block();
            return;
        }

        self.copy_len = n as usize;
        self.copy_data();
    }

    /// Copy `copy_len` stored bytes into the window, pausing when it fills.
    fn copy_data(&mut self) {
        let take = self.dict.avail_write().min(self.copy_len);
        let mut copied = 0;
        while copied < take {
            let Decompressor {
                ref mut r,
                ref mut dict,
                ..
            } = *self;
            match dict.write_from(r, take - copied) {
                Ok(0) => {
                    self.err = Some(FlateError::UnexpectedEof(self.roffset));
                    return;
                }
                Ok(cnt) => {
                    self.roffset += cnt as u64;
                    copied += cnt;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.err = Some(FlateError::Read {
                        offset: self.roffset,
                        msg: e.to_string(),
                    });
                    return;
                }
            }
        }
        self.copy_len -= take;

        if self.dict.avail_write() == 0 || self.copy_len > 0 {
            self.to_read = self.dict.read_flush();
            self.step = Step::CopyData;
            return;
        }
        self.finish_block();
    }

    /// Close out the current block: flush on the final block, publish a
    /// checkpoint when the span condition holds, and arm the next block.
    fn finish_block(&mut self) {
        let mut woffset = self.woffset;

        if self.final_block {
            if self.dict.avail_read() > 0 {
                self.to_read = self.dict.read_flush();
                woffset += (self.to_read.1 - self.to_read.0) as u64;
            }
            self.err = Some(FlateError::Eos);
        }

        if let Some(updates) = self.updates.clone() {
            if woffset - self.last > self.span {
                let checkpoint = Checkpoint {
                    in_offset: self.roffset,
                    out_offset: woffset,
                    bit_buf: self.b,
                    bit_count: self.nb,
                    hist: self.dict.hist().to_vec(),
                    wr_pos: self.dict.wr_pos(),
                    rd_pos: self.dict.rd_pos(),
                    full: self.dict.is_full(),
                    empty: false,
                    gzip_header: None,
                };
                if updates.send(checkpoint).is_ok() {
                    self.last = woffset;
                } else {
                    // Receiver is gone; stop capturing state.
                    self.updates = None;
                }
            }
        }

        self.step = Step::NextBlock;
    }

    fn more_bits(&mut self) -> Result<(), FlateError> {
        let c = self.read_byte()?;
        self.roffset += 1;
        self.b |= (c as u32) << self.nb;
        self.nb += 8;
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8, FlateError> {
        loop {
            let c = match self.r.fill_buf() {
                Ok(buf) if buf.is_empty() => {
                    return Err(FlateError::UnexpectedEof(self.roffset))
                }
                Ok(buf) => buf[0],
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(FlateError::Read {
                        offset: self.roffset,
                        msg: e.to_string(),
                    })
                }
            };
            self.r.consume(1);
            return Ok(c);
        }
    }

    fn read_full(&mut self, buf: &mut [u8]) -> Result<(), FlateError> {
        let mut n = 0;
        while n < buf.len() {
            match self.r.read(&mut buf[n..]) {
                Ok(0) => return Err(FlateError::UnexpectedEof(self.roffset)),
                Ok(cnt) => {
                    n += cnt;
                    self.roffset += cnt as u64;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(FlateError::Read {
                        offset: self.roffset,
                        msg: e.to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Read the next Huffman-encoded symbol according to the selected table.
    fn huff_sym(&mut self, kind: TableKind) -> Result<u32, FlateError> {
        // The chunk lookup is valid with fewer bits loaded than the actual
        // code length, and the length it reports is a lower bound, so start
        // from the table's minimum and refine.
        let mut n = match kind {
            TableKind::Lit => {
                if self.fixed_tables {
                    FIXED_LITLEN_DECODER.min
                } else {
                    self.h1.min
                }
            }
            TableKind::Dist => self.h2.min,
        };
        let mut nb = self.nb;
        let mut b = self.b;
        loop {
            while nb < n {
                let c = match self.read_byte() {
                    Ok(c) => c,
                    Err(e) => {
                        self.b = b;
                        self.nb = nb;
                        return Err(e);
                    }
                };
                self.roffset += 1;
                b |= (c as u32) << (nb & 31);
                nb += 8;
            }
            let chunk = match kind {
                TableKind::Lit => {
                    if self.fixed_tables {
                        FIXED_LITLEN_DECODER.lookup(b)
                    } else {
                        self.h1.lookup(b)
                    }
                }
                TableKind::Dist => self.h2.lookup(b),
            };
            n = chunk & CHUNK_COUNT_MASK;
            if n <= nb {
                if n == 0 {
                    // An empty or degenerate table was used on an invalid
                    // sequence.
                    self.b = b;
                    self.nb = nb;
                    return Err(FlateError::Corrupt(self.roffset));
                }
                self.b = b >> n;
                self.nb = nb - n;
                return Ok(chunk >> CHUNK_VALUE_SHIFT);
            }
        }
    }
}

impl<R: BufRead> Read for Decompressor<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.to_read.0 < self.to_read.1 {
                let (s, e) = self.to_read;
                let n = buf.len().min(e - s);
                buf[..n].copy_from_slice(&self.dict.hist()[s..s + n]);
                self.to_read.0 += n;
                return Ok(n);
            }
            if let Some(err) = &self.err {
                return match err {
                    FlateError::Eos => Ok(0),
                    e => Err(e.clone().into()),
                };
            }

            self.step();
            self.woffset += (self.to_read.1 - self.to_read.0) as u64;
            if self.err.is_some() && self.to_read.0 == self.to_read.1 {
                // Flush what's left of the window in case of error.
                self.to_read = self.dict.read_flush();
                self.woffset += (self.to_read.1 - self.to_read.0) as u64;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    use std::io::{BufReader, Cursor, Write};
    use std::sync::mpsc::sync_channel;

    fn deflate(data: &[u8], level: Compression) -> Vec<u8> {
        let mut enc = DeflateEncoder::new(Vec::new(), level);
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn sample_data(len: usize) -> Vec<u8> {
        // Compressible but non-repetitive text.
        let mut out = Vec::with_capacity(len);
        let mut i = 0usize;
        while out.len() < len {
            out.extend_from_slice(
                format!("line {:08} of the sample corpus used by flate tests\n", i).as_bytes(),
            );
            i += 1;
        }
        out.truncate(len);
        out
    }

    fn read_all<R: BufRead>(d: &mut Decompressor<R>) -> Vec<u8> {
        let mut out = Vec::new();
        d.read_to_end(&mut out).unwrap();
        out
    }

    /// Tiny MSB-first-code bit writer for hand-crafted fixed blocks.
    struct BitWriter {
        out: Vec<u8>,
        bit: u8,
    }

    impl BitWriter {
        fn new() -> Self {
            BitWriter { out: Vec::new(), bit: 0 }
        }

        fn push_bit(&mut self, v: u32) {
            if self.bit == 0 {
                self.out.push(0);
            }
            if v != 0 {
                *self.out.last_mut().unwrap() |= 1 << self.bit;
            }
            self.bit = (self.bit + 1) % 8;
        }

        // Header fields and extra bits go out LSB first.
        fn write_bits(&mut self, v: u32, n: u32) {
            for i in 0..n {
                self.push_bit((v >> i) & 1);
            }
        }

        // Huffman codes go out MSB first.
        fn write_code(&mut self, code: u32, n: u32) {
            for i in (0..n).rev() {
                self.push_bit((code >> i) & 1);
            }
        }
    }

    #[test]
    fn test_empty_fixed_block() {
        // BFINAL=1, BTYPE=01, then the 7-bit end-of-block code.
        let data = [0x03u8, 0x00];
        let mut d = Decompressor::new(Cursor::new(&data[..]));
        assert_eq!(read_all(&mut d), b"");
        assert!(d.is_eos());
        assert_eq!(d.compressed_offset(), 2);
    }

    #[test]
    fn test_hand_crafted_fixed_block_with_backref() {
        // "abcabc": literals a, b, c then a match of length 3 at distance 3.
        let mut w = BitWriter::new();
        w.write_bits(1, 1); // BFINAL
        w.write_bits(1, 2); // BTYPE=01
        for &lit in b"abc" {
            w.write_code(0x30 + lit as u32, 8);
        }
        w.write_code(0b0000001, 7); // length code 257 (len 3)
        w.write_code(2, 5); // distance code 2 (dist 3)
        w.write_code(0, 7); // end of block
        let mut d = Decompressor::new(Cursor::new(w.out));
        assert_eq!(read_all(&mut d), b"abcabc");
    }

    #[test]
    fn test_reserved_block_type_is_corrupt() {
        // BFINAL=1, BTYPE=11.
        let data = [0x07u8, 0x00];
        let mut d = Decompressor::new(Cursor::new(&data[..]));
        let err = d.read_to_end(&mut Vec::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        // The error latches.
        let err = d.read(&mut [0u8; 1]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_stream() {
        let plain = sample_data(4096);
        let mut compressed = deflate(&plain, Compression::default());
        compressed.truncate(compressed.len() / 2);
        let mut d = Decompressor::new(Cursor::new(compressed));
        let err = d.read_to_end(&mut Vec::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_round_trip_dynamic_blocks() {
        let plain = sample_data(256 * 1024);
        let compressed = deflate(&plain, Compression::default());
        let mut d = Decompressor::new(BufReader::new(Cursor::new(compressed)));
        assert_eq!(read_all(&mut d), plain);
        assert_eq!(d.uncompressed_offset(), plain.len() as u64);
    }

    #[test]
    fn test_round_trip_stored_blocks() {
        let plain = sample_data(200 * 1024);
        let compressed = deflate(&plain, Compression::none());
        let mut d = Decompressor::new(BufReader::new(Cursor::new(compressed)));
        assert_eq!(read_all(&mut d), plain);
    }

    #[test]
    fn test_checkpoints_resume_to_same_suffix() {
        let plain = sample_data(1024 * 1024);
        let compressed = deflate(&plain, Compression::default());

        let (tx, rx) = sync_channel(4096);
        let mut d = Decompressor::new_with_spans(
            BufReader::new(Cursor::new(compressed.clone())),
            0,
            64 * 1024,
            tx,
        );
        assert_eq!(read_all(&mut d), plain);
        drop(d);

        let checkpoints: Vec<Checkpoint> = rx.into_iter().collect();
        assert!(checkpoints.len() >= 4, "span too coarse: {}", checkpoints.len());

        let mut prev_out = 0;
        let mut prev_in = 0;
        for ck in &checkpoints {
            assert!(ck.out_offset > prev_out);
            assert!(ck.in_offset >= prev_in);
            prev_out = ck.out_offset;
            prev_in = ck.in_offset;

            if ck.out_offset as usize == plain.len() {
                // Checkpoint at the final block boundary; nothing to resume.
                continue;
            }

            let section = Cursor::new(compressed[ck.in_offset as usize..].to_vec());
            let mut resumed = Decompressor::resume(BufReader::new(section), ck, 0, None);
            assert_eq!(resumed.uncompressed_offset(), ck.out_offset);
            let suffix = read_all(&mut resumed);
            assert_eq!(&suffix[..], &plain[ck.out_offset as usize..]);
        }
    }
}
