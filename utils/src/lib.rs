// Copyright 2024 Zran Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Utilities and bit-level machinery for random access to gzip streams:
//! - the checkpointed DEFLATE decoder and gzip framer under [`compress`],
//! - CRC32 helpers for gzip framing,
//! - error macros and logging bootstrap shared by the higher-level crates.

#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

use std::io::{Error, ErrorKind, Result};
use std::path::Path;

use flexi_logger::{colored_opt_format, opt_format, Logger};

#[macro_use]
pub mod error;
pub use error::*;

pub mod compress;
pub mod crc32;

pub fn log_level_to_verbosity(level: log::LevelFilter) -> usize {
    level as usize - 1
}

/// Setup logging with the `log` facade backed by flexi_logger.
///
/// Writes to `path` when given, otherwise to stderr with colored output.
/// We rely on the `log` macros to limit the current log level rather than
/// flexi_logger, so flexi_logger itself is pinned to "trace".
pub fn setup_logging(path: Option<&Path>, level: log::LevelFilter) -> Result<()> {
    if let Some(path) = path {
        let mut dir = path
            .parent()
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "failed to get log directory"))?
            .to_str()
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "to_str() failed"))?;

        // parent() returns an empty string when only a file name is given.
        let cwd = std::env::current_dir()?;
        if dir.is_empty() {
            dir = cwd
                .to_str()
                .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "to_str() failed"))?;
        }

        let basename = path
            .file_stem()
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "failed to get log file basename"))?
            .to_str()
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "to_str() failed"))?;

        // The log file must have a suffix, see flexi_logger issue #74.
        let suffix = path
            .extension()
            .ok_or_else(|| {
                Error::new(ErrorKind::InvalidInput, "failed to get log file extension")
            })?
            .to_str()
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "to_str() failed"))?;

        Logger::with_env_or_str("trace")
            .log_to_file()
            .directory(dir)
            .basename(basename)
            .suffix(suffix)
            .suppress_timestamp()
            .append()
            .format(opt_format)
            .start()
            .map_err(|e| Error::new(ErrorKind::Other, e))?;
    } else {
        Logger::with_env_or_str("trace")
            .format(colored_opt_format)
            .start()
            .map_err(|e| Error::new(ErrorKind::Other, e))?;
    }

    log::set_max_level(level);

    Ok(())
}
