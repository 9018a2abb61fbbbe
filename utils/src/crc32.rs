// Copyright 2024 Zran Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! CRC32 helpers for gzip framing.
//!
//! Gzip trailers carry a CRC-32/ISO-HDLC digest of the uncompressed member
//! payload, and headers with the FHCRC flag carry the low 16 bits of the same
//! digest over the header bytes.

use crc::{Crc, Digest, Table};

lazy_static! {
    static ref CRC32_ISO_HDLC: Crc<u32, Table<16>> =
        Crc::<u32, Table<16>>::new(&crc::CRC_32_ISO_HDLC);
}

/// Compute the CRC32 digest of a byte slice in one shot.
pub fn crc32_from_buf(bytes: &[u8]) -> u32 {
    CRC32_ISO_HDLC.checksum(bytes)
}

/// Streaming CRC32 state, resettable between gzip members.
pub struct Crc32 {
    digest: Option<Digest<'static, u32, Table<16>>>,
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc32 {
    pub fn new() -> Self {
        Self {
            digest: Some(CRC32_ISO_HDLC.digest()),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        if let Some(digest) = self.digest.as_mut() {
            digest.update(bytes);
        }
    }

    /// Finalize the running digest and reset the state for the next stream.
    pub fn finalize_reset(&mut self) -> u32 {
        let sum = match self.digest.take() {
            Some(digest) => digest.finalize(),
            None => 0,
        };
        self.digest = Some(CRC32_ISO_HDLC.digest());
        sum
    }

    pub fn reset(&mut self) {
        self.digest = Some(CRC32_ISO_HDLC.digest());
    }
}
