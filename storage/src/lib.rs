// Copyright 2024 Zran Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Random access to gzip-compressed tar archives.
//!
//! The crate composes four pieces:
//! - [`backend`]: positioned-read access to a finite blob (local file, HTTP
//!   range requests), the transport everything else sits on;
//! - [`zran`]: a reader exposing the *uncompressed* byte space of a gzip
//!   blob, built from decoder checkpoints captured on a frontier pass;
//! - [`tarfs`]: a read-only filesystem view over a tar stream;
//! - [`meta`]: sidecar serialization of the checkpoint index and the tar
//!   table of contents, so later opens skip the frontier scan.

#[macro_use]
extern crate log;
#[macro_use]
extern crate serde;
#[macro_use]
extern crate zran_utils;

pub mod backend;
pub mod meta;
pub mod tarfs;
pub mod zran;

pub use backend::{BackendError, BackendResult, RangeReader, SectionReader};
pub use tarfs::{EntryKind, TarEntry, TarFile, TarFs};
pub use zran::ZranReader;
