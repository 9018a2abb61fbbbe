// Copyright 2024 Zran Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Sidecar serialization of the checkpoint index and the tar table of
//! contents.
//!
//! Both artifacts are self-describing JSON with an explicit schema version.
//! The layout is not stable across versions; a mismatch is rejected on load
//! and the caller is expected to rebuild the sidecar with a frontier pass.

use std::fmt;
use std::io::{Read, Write};

use zran_utils::compress::Checkpoint;

use crate::tarfs::TarEntry;

/// Current schema version of the checkpoint index sidecar.
pub const ZRAN_INDEX_VERSION: u32 = 1;
/// Current schema version of the tar TOC sidecar.
pub const TAR_TOC_VERSION: u32 = 1;

#[derive(Debug)]
pub enum MetaError {
    Serde(serde_json::Error),
    Version { expected: u32, got: u32 },
}

impl fmt::Display for MetaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaError::Serde(e) => write!(f, "failed to serialize sidecar, {}", e),
            MetaError::Version { expected, got } => write!(
                f,
                "incompatible sidecar version {}, want {}, rebuild the index",
                got, expected
            ),
        }
    }
}

impl std::error::Error for MetaError {}

impl From<serde_json::Error> for MetaError {
    fn from(e: serde_json::Error) -> Self {
        MetaError::Serde(e)
    }
}

pub type MetaResult<T> = std::result::Result<T, MetaError>;

/// The ordered checkpoint list of a gzip blob.
#[derive(Serialize, Deserialize)]
pub struct ZranIndex {
    pub version: u32,
    pub checkpoints: Vec<Checkpoint>,
}

impl ZranIndex {
    pub fn new(checkpoints: Vec<Checkpoint>) -> Self {
        ZranIndex {
            version: ZRAN_INDEX_VERSION,
            checkpoints,
        }
    }

    pub fn save<W: Write>(&self, w: W) -> MetaResult<()> {
        serde_json::to_writer(w, self).map_err(MetaError::from)
    }

    pub fn load<R: Read>(r: R) -> MetaResult<Self> {
        let index: ZranIndex = serde_json::from_reader(r)?;
        if index.version != ZRAN_INDEX_VERSION {
            return Err(MetaError::Version {
                expected: ZRAN_INDEX_VERSION,
                got: index.version,
            });
        }
        Ok(index)
    }
}

/// The entry table of a tar stream.
#[derive(Serialize, Deserialize)]
pub struct TarToc {
    pub version: u32,
    pub entries: Vec<TarEntry>,
}

impl TarToc {
    pub fn new(entries: Vec<TarEntry>) -> Self {
        TarToc {
            version: TAR_TOC_VERSION,
            entries,
        }
    }

    pub fn save<W: Write>(&self, w: W) -> MetaResult<()> {
        serde_json::to_writer(w, self).map_err(MetaError::from)
    }

    pub fn load<R: Read>(r: R) -> MetaResult<Self> {
        let toc: TarToc = serde_json::from_reader(r)?;
        if toc.version != TAR_TOC_VERSION {
            return Err(MetaError::Version {
                expected: TAR_TOC_VERSION,
                got: toc.version,
            });
        }
        Ok(toc)
    }
}
