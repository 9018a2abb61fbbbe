// Copyright 2024 Zran Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::fmt::Debug;

use backtrace::Backtrace;

/// Define an error macro like `x!()` or `x!(err)` which attaches the source
/// location to the generated `std::io::Error` and logs the raw cause.
macro_rules! define_libc_error_macro {
    ($fn:ident, $code:ident) => {
        /// Display line number, file path and backtrace when an error occurs
        pub fn $fn(raw: impl Debug, file: &str, line: u32) -> std::io::Error {
            let err = std::io::Error::from_raw_os_error(libc::$code);
            if cfg!(debug_assertions) {
                if let Ok(val) = env::var("RUST_BACKTRACE") {
                    if val.trim() != "0" {
                        error!("Stack:\n{:?}", Backtrace::new());
                        error!("Error:\n\t{:?}\n\tat {}:{}", raw, file, line);
                        return err;
                    }
                }
            }
            error!("Error:\n\t{:?}\n\tat {}:{}\n\tnote: enable `RUST_BACKTRACE=1` env to display a backtrace", raw, file, line);
            err
        }

        #[macro_export]
        macro_rules! $fn {
            () => {
                $crate::error::$fn(&"", file!(), line!())
            };
            ($raw:expr) => {
                $crate::error::$fn(&$raw, file!(), line!())
            };
        }
    };
}

// Add more libc error macro here if necessary
define_libc_error_macro!(einval, EINVAL);
define_libc_error_macro!(enoent, ENOENT);
define_libc_error_macro!(eio, EIO);
define_libc_error_macro!(eother, ENOTSUP);
