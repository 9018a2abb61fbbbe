// Copyright 2024 Zran Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Checkpointed decompression of DEFLATE and gzip streams.

pub mod flate;
pub mod gzip;

pub use flate::{Checkpoint, Decompressor, FlateError, WINDOW_SIZE};
pub use gzip::{GzipHeader, GzipReader};
