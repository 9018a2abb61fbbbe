// Copyright 2024 Zran Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Gzip (RFC 1952) member framing over the DEFLATE decoder.
//!
//! The framer parses member headers and trailers, verifies the payload CRC32
//! and ISIZE, and handles concatenated members transparently. When a
//! checkpoint channel is attached, an `empty` checkpoint annotated with the
//! parsed header is published at the start of every member, so resumption at
//! a member boundary needs no history bytes.

use std::io::{self, BufRead, Read};
use std::sync::mpsc::SyncSender;

use serde::{Deserialize, Serialize};

use crate::compress::flate::{Checkpoint, Decompressor, FlateError};
use crate::crc32::{crc32_from_buf, Crc32};

const GZIP_ID1: u8 = 0x1f;
const GZIP_ID2: u8 = 0x8b;
const GZIP_DEFLATE: u8 = 8;

const FLG_HCRC: u8 = 1 << 1;
const FLG_EXTRA: u8 = 1 << 2;
const FLG_NAME: u8 = 1 << 3;
const FLG_COMMENT: u8 = 1 << 4;
const FLG_RESERVED: u8 = 0xe0;

/// Parsed gzip member header, carried on member-boundary checkpoints.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GzipHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Vec<u8>>,
    pub mtime: u32,
    pub os: u8,
}

fn read_exact_from<R: Read>(r: &mut R, buf: &mut [u8], pos: &mut u64) -> Result<(), FlateError> {
    let mut n = 0;
    while n < buf.len() {
        match r.read(&mut buf[n..]) {
            Ok(0) => return Err(FlateError::UnexpectedEof(*pos + n as u64)),
            Ok(cnt) => n += cnt,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(FlateError::Read {
                    offset: *pos + n as u64,
                    msg: e.to_string(),
                })
            }
        }
    }
    *pos += n as u64;
    Ok(())
}

fn read_cstring<R: Read>(
    r: &mut R,
    pos: &mut u64,
    raw: &mut Vec<u8>,
) -> Result<String, FlateError> {
    let mut out = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        read_exact_from(r, &mut byte, pos)?;
        raw.push(byte[0]);
        if byte[0] == 0 {
            return Ok(String::from_utf8_lossy(&out).into_owned());
        }
        out.push(byte[0]);
    }
}

/// Parse a gzip member header starting at compressed offset `*pos`,
/// advancing `*pos` past it.
fn parse_header<R: Read>(r: &mut R, pos: &mut u64) -> Result<GzipHeader, FlateError> {
    let mut fixed = [0u8; 10];
    read_exact_from(r, &mut fixed, pos)?;
    if fixed[0] != GZIP_ID1 || fixed[1] != GZIP_ID2 {
        return Err(FlateError::Corrupt(*pos));
    }
    if fixed[2] != GZIP_DEFLATE {
        return Err(FlateError::Corrupt(*pos));
    }
    let flg = fixed[3];
    if flg & FLG_RESERVED != 0 {
        return Err(FlateError::Corrupt(*pos));
    }

    let mut header = GzipHeader {
        mtime: u32::from_le_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]),
        os: fixed[9],
        ..Default::default()
    };

    // Header bytes participate in the optional FHCRC digest.
    let mut raw = fixed.to_vec();

    if flg & FLG_EXTRA != 0 {
        let mut len = [0u8; 2];
        read_exact_from(r, &mut len, pos)?;
        raw.extend_from_slice(&len);
        let mut extra = vec![0u8; u16::from_le_bytes(len) as usize];
        read_exact_from(r, &mut extra, pos)?;
        raw.extend_from_slice(&extra);
        header.extra = Some(extra);
    }
    if flg & FLG_NAME != 0 {
        header.name = Some(read_cstring(r, pos, &mut raw)?);
    }
    if flg & FLG_COMMENT != 0 {
        header.comment = Some(read_cstring(r, pos, &mut raw)?);
    }
    if flg & FLG_HCRC != 0 {
        let mut sum = [0u8; 2];
        read_exact_from(r, &mut sum, pos)?;
        let want = u16::from_le_bytes(sum);
        let got = (crc32_from_buf(&raw) & 0xffff) as u16;
        if want != got {
            return Err(FlateError::Corrupt(*pos));
        }
    }

    Ok(header)
}

/// Reader over one or more concatenated gzip members.
pub struct GzipReader<R> {
    inner: Decompressor<R>,
    header: GzipHeader,
    /// Running CRC32 of the current member's payload.
    digest: Crc32,
    /// ISIZE accumulator for the current member (modulo 2^32).
    member_out: u32,
    /// Uncompressed bytes handed to the caller so far.
    offset: u64,
    updates: Option<SyncSender<Checkpoint>>,
    /// Whether the current member was observed from its first payload byte,
    /// making trailer verification possible.
    verify: bool,
    done: bool,
    err: Option<FlateError>,
}

impl<R: BufRead> GzipReader<R> {
    /// Plain gzip reader without checkpoint emission.
    pub fn new(r: R) -> io::Result<Self> {
        Self::construct(r, 0, 0, None)
    }

    /// Gzip reader that publishes checkpoints from the underlying DEFLATE
    /// decoder, plus an empty checkpoint at the start of every member.
    /// `start_in` is the absolute compressed offset of `r`'s first byte.
    pub fn new_with_spans(
        r: R,
        start_in: u64,
        span: u64,
        updates: SyncSender<Checkpoint>,
    ) -> io::Result<Self> {
        Self::construct(r, start_in, span, Some(updates))
    }

    fn construct(
        mut r: R,
        start_in: u64,
        span: u64,
        updates: Option<SyncSender<Checkpoint>>,
    ) -> io::Result<Self> {
        let mut pos = start_in;
        let header = parse_header(&mut r, &mut pos)?;
        if let Some(tx) = &updates {
            let checkpoint = Checkpoint {
                in_offset: pos,
                out_offset: 0,
                empty: true,
                gzip_header: Some(header.clone()),
                ..Default::default()
            };
            let _ = tx.send(checkpoint);
        }
        let inner = match &updates {
            Some(tx) => Decompressor::new_with_spans(r, pos, span, tx.clone()),
            None => Decompressor::new_at(r, pos),
        };
        Ok(GzipReader {
            inner,
            header,
            digest: Crc32::new(),
            member_out: 0,
            offset: 0,
            updates,
            verify: true,
            done: false,
            err: None,
        })
    }

    /// Reconstruct a reader from a checkpoint. `r` must be positioned at the
    /// checkpoint's `in_offset` in compressed space. Trailer verification is
    /// only possible when resuming at a member boundary.
    pub fn resume(r: R, from: &Checkpoint, updates: Option<SyncSender<Checkpoint>>) -> Self {
        let inner = Decompressor::resume(r, from, 0, updates.clone());
        GzipReader {
            inner,
            header: from.gzip_header.clone().unwrap_or_default(),
            digest: Crc32::new(),
            member_out: 0,
            offset: from.out_offset,
            updates,
            verify: from.empty,
            done: false,
            err: None,
        }
    }

    /// Uncompressed position of this reader: the offset of the next byte it
    /// will return.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Header of the gzip member currently being decoded.
    pub fn header(&self) -> &GzipHeader {
        &self.header
    }

    /// Whether this reader feeds a checkpoint channel (the frontier).
    pub fn emits_checkpoints(&self) -> bool {
        self.updates.is_some()
    }

    /// Consume the member trailer, verify it when possible, and either
    /// latch end-of-stream or start the next concatenated member.
    fn finish_member(&mut self) -> io::Result<()> {
        let mut pos = self.inner.compressed_offset();
        let mut trailer = [0u8; 8];
        read_exact_from(self.inner.get_mut(), &mut trailer, &mut pos).map_err(|e| {
            self.err = Some(e.clone());
            io::Error::from(e)
        })?;
        let crc = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let size = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]);

        if self.verify {
            let sum = self.digest.finalize_reset();
            if sum != crc || size != self.member_out {
                let e = FlateError::Corrupt(pos);
                self.err = Some(e.clone());
                return Err(e.into());
            }
        } else {
            self.digest.reset();
        }
        self.member_out = 0;

        // Concatenated members: if bytes remain, the next member starts here.
        let at_eof = loop {
            match self.inner.get_mut().fill_buf() {
                Ok(buf) => break buf.is_empty(),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        if at_eof {
            self.done = true;
            return Ok(());
        }

        let header = parse_header(self.inner.get_mut(), &mut pos).map_err(|e| {
            self.err = Some(e.clone());
            io::Error::from(e)
        })?;
        debug!(
            "gzip: member boundary at compressed offset {}, uncompressed offset {}",
            pos, self.offset
        );
        if let Some(tx) = &self.updates {
            let checkpoint = Checkpoint {
                in_offset: pos,
                out_offset: self.offset,
                empty: true,
                gzip_header: Some(header.clone()),
                ..Default::default()
            };
            let _ = tx.send(checkpoint);
        }
        self.header = header;
        self.verify = true;
        self.inner.reset(pos);
        Ok(())
    }
}

impl<R: BufRead> Read for GzipReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if let Some(e) = &self.err {
            return Err(e.clone().into());
        }
        loop {
            if self.done {
                return Ok(0);
            }
            match self.inner.read(buf) {
                Ok(0) => self.finish_member()?,
                Ok(n) => {
                    self.digest.update(&buf[..n]);
                    self.member_out = self.member_out.wrapping_add(n as u32);
                    self.offset += n as u64;
                    return Ok(n);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
