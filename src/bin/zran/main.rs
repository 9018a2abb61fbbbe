// Copyright 2024 Zran Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Command line front-end: list, stat and stream members of a (possibly
//! remote) gzip-compressed tar archive without downloading or decompressing
//! the whole thing.

#[macro_use]
extern crate log;

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Arg, ArgMatches, Command};

use zran_storage::backend::http::{HttpReader, HttpReaderConfig};
use zran_storage::backend::FileReader;
use zran_storage::{RangeReader, TarFs, ZranReader};
use zran_utils::setup_logging;

fn main() -> Result<()> {
    let app = Command::new("zran")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Random access to gzip-compressed tar archives")
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .default_value("warn")
                .help("Log level: off, error, warn, info, debug or trace")
                .global(true),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .default_value("30")
                .help("HTTP timeout in seconds for remote archives")
                .global(true),
        )
        .subcommand(
            Command::new("index")
                .about("Build the checkpoint and TOC sidecars next to a local archive")
                .arg(Arg::new("archive").required(true)),
        )
        .subcommand(
            Command::new("ls")
                .about("List a directory of the archive")
                .arg(Arg::new("archive").required(true))
                .arg(Arg::new("path").default_value(".")),
        )
        .subcommand(
            Command::new("cat")
                .about("Write a member's contents to stdout")
                .arg(Arg::new("archive").required(true))
                .arg(Arg::new("path").required(true)),
        )
        .subcommand(
            Command::new("stat")
                .about("Show a member's metadata")
                .arg(Arg::new("archive").required(true))
                .arg(Arg::new("path").required(true)),
        )
        .subcommand(
            Command::new("readlink")
                .about("Print the raw target of a link member")
                .arg(Arg::new("archive").required(true))
                .arg(Arg::new("path").required(true)),
        );

    let matches = app.get_matches();
    let (cmd, m) = match matches.subcommand() {
        Some(sub) => sub,
        None => bail!("no command given, try --help"),
    };

    let level = m
        .get_one::<String>("log-level")
        .unwrap()
        .parse()
        .unwrap_or(log::LevelFilter::Warn);
    setup_logging(None, level).context("failed to set up logging")?;

    match cmd {
        "index" => cmd_index(m),
        "ls" => cmd_ls(m),
        "cat" => cmd_cat(m),
        "stat" => cmd_stat(m),
        "readlink" => cmd_readlink(m),
        _ => unreachable!(),
    }
}

fn archive_arg(m: &ArgMatches) -> &str {
    m.get_one::<String>("archive").unwrap()
}

fn timeout_arg(m: &ArgMatches) -> Result<u64> {
    m.get_one::<String>("timeout")
        .unwrap()
        .parse()
        .context("invalid --timeout value")
}

/// Same weak normalization the index applies to member names, so users can
/// pass `/usr/bin/foo` or `./foo` interchangeably.
fn normalize_arg(name: &str) -> &str {
    if name == "." {
        return name;
    }
    let name = name.strip_suffix('/').unwrap_or(name);
    let name = name.strip_prefix('/').unwrap_or(name);
    name.strip_prefix("./").unwrap_or(name)
}

fn is_url(archive: &str) -> bool {
    archive.starts_with("http://") || archive.starts_with("https://")
}

fn is_gzip(archive: &str) -> bool {
    archive.ends_with(".gz") || archive.ends_with(".tgz")
}

fn open_blob(archive: &str, timeout: u64) -> Result<Arc<dyn RangeReader>> {
    if is_url(archive) {
        let config = HttpReaderConfig {
            timeout,
            connect_timeout: timeout,
            retry_limit: 2,
        };
        let reader = HttpReader::new(archive, &config).map_err(|e| anyhow!("{}", e))?;
        Ok(Arc::new(reader))
    } else {
        let reader = FileReader::open(archive)
            .with_context(|| format!("failed to open archive {:?}", archive))?;
        Ok(Arc::new(reader))
    }
}

fn sidecar_paths(archive: &str) -> (String, String) {
    (format!("{}.zran", archive), format!("{}.toc", archive))
}

/// Open the archive as a filesystem. Plain `.tar` archives are served
/// straight from the blob; gzip archives go through the checkpoint index,
/// reusing sidecars from a previous `zran index` run when present.
fn open_fs(archive: &str, timeout: u64) -> Result<TarFs> {
    let blob = open_blob(archive, timeout)?;
    let size = blob.size().map_err(|e| anyhow!("{}", e))?;

    if !is_gzip(archive) {
        return Ok(TarFs::new(blob, Some(size))?);
    }

    let (zran_path, toc_path) = sidecar_paths(archive);
    if !is_url(archive) && Path::new(&zran_path).exists() && Path::new(&toc_path).exists() {
        info!("reusing sidecars {:?} and {:?}", zran_path, toc_path);
        let zr = ZranReader::decode(blob, size, File::open(&zran_path)?)?;
        return Ok(TarFs::decode(Arc::new(zr), File::open(&toc_path)?)?);
    }

    let zr = ZranReader::new(blob, size)?;
    Ok(TarFs::new(Arc::new(zr), None)?)
}

fn cmd_index(m: &ArgMatches) -> Result<()> {
    let archive = archive_arg(m);
    if is_url(archive) {
        bail!("sidecars can only be written next to a local archive");
    }
    if !is_gzip(archive) {
        bail!("{:?} is not a gzip archive, nothing to index", archive);
    }

    let blob = open_blob(archive, timeout_arg(m)?)?;
    let size = blob.size().map_err(|e| anyhow!("{}", e))?;
    let zr = Arc::new(ZranReader::new(blob, size)?);

    // The tar scan pulls the frontier decoder across the whole stream,
    // which is what populates the checkpoint set.
    let fs = TarFs::new(zr.clone(), None)?;

    // Give the index consumer a moment to drain the channel tail.
    let mut count = zr.checkpoint_count();
    loop {
        thread::sleep(Duration::from_millis(20));
        let now = zr.checkpoint_count();
        if now == count {
            break;
        }
        count = now;
    }

    let (zran_path, toc_path) = sidecar_paths(archive);
    zr.encode(File::create(&zran_path)?)?;
    fs.encode(File::create(&toc_path)?)?;
    println!("wrote {} ({} checkpoints) and {}", zran_path, count, toc_path);
    Ok(())
}

fn cmd_ls(m: &ArgMatches) -> Result<()> {
    let fs = open_fs(archive_arg(m), timeout_arg(m)?)?;
    let path = normalize_arg(m.get_one::<String>("path").unwrap());

    let entry = fs.stat(path)?;
    if !entry.is_dir() {
        println!("{}", format_entry(&entry));
        return Ok(());
    }
    for child in fs.read_dir(path) {
        println!("{}", format_entry(&child));
    }
    Ok(())
}

fn format_entry(e: &zran_storage::TarEntry) -> String {
    let kind = match e.kind {
        zran_storage::tarfs::EntryKind::Directory => 'd',
        zran_storage::tarfs::EntryKind::Symlink => 'l',
        zran_storage::tarfs::EntryKind::HardLink => 'h',
        _ => '-',
    };
    let target = e
        .link_target
        .as_deref()
        .map(|t| format!(" -> {}", t))
        .unwrap_or_default();
    format!("{}{:04o} {:>10} {}{}", kind, e.mode & 0o7777, e.size, e.name, target)
}

fn cmd_cat(m: &ArgMatches) -> Result<()> {
    let fs = open_fs(archive_arg(m), timeout_arg(m)?)?;
    let path = normalize_arg(m.get_one::<String>("path").unwrap());

    let mut file = fs.open(path)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    io::copy(&mut file, &mut out).context("failed to stream member contents")?;
    out.flush()?;
    Ok(())
}

fn cmd_stat(m: &ArgMatches) -> Result<()> {
    let fs = open_fs(archive_arg(m), timeout_arg(m)?)?;
    let path = normalize_arg(m.get_one::<String>("path").unwrap());

    let e = fs.stat(path)?;
    println!("name:   {}", e.name);
    println!("kind:   {:?}", e.kind);
    println!("size:   {}", e.size);
    println!("mode:   {:04o}", e.mode & 0o7777);
    println!("uid:    {}", e.uid);
    println!("gid:    {}", e.gid);
    println!("mtime:  {}", e.mtime);
    println!("offset: {}", e.offset);
    if let Some(target) = &e.link_target {
        println!("target: {}", target);
    }
    Ok(())
}

fn cmd_readlink(m: &ArgMatches) -> Result<()> {
    let fs = open_fs(archive_arg(m), timeout_arg(m)?)?;
    let path = normalize_arg(m.get_one::<String>("path").unwrap());
    println!("{}", fs.read_link(path)?);
    Ok(())
}
