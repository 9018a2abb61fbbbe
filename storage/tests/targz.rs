// Copyright 2024 Zran Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios: a gzip-compressed tar archive served over an
//! in-process HTTP server with range support, read through the checkpoint
//! index and compared byte for byte against the same tar opened directly.

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Builder, EntryType, Header};

use zran_storage::backend::http::{HttpReader, HttpReaderConfig};
use zran_storage::backend::FileReader;
use zran_storage::{RangeReader, TarFs, ZranReader};

// A tiny HTTP/1.1 server that serves one blob at `/archive` with range
// support, and redirects `/moved/archive` to it.

fn parse_range(v: &str, len: u64) -> Option<(u64, u64)> {
    let v = v.trim().strip_prefix("bytes=")?;
    let (a, b) = v.split_once('-')?;
    let start: u64 = a.parse().ok()?;
    let end = match b {
        "" => len.saturating_sub(1),
        s => s.parse().ok()?,
    };
    Some((start, end.min(len.saturating_sub(1))))
}

fn handle_conn(stream: TcpStream, data: Arc<Vec<u8>>) -> io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let mut parts = line.split_whitespace();
        let method = parts.next().unwrap_or("").to_string();
        let path = parts.next().unwrap_or("").to_string();

        let mut range = None;
        loop {
            let mut header = String::new();
            if reader.read_line(&mut header)? == 0 {
                return Ok(());
            }
            let header = header.trim();
            if header.is_empty() {
                break;
            }
            let lower = header.to_ascii_lowercase();
            if let Some(v) = lower.strip_prefix("range:") {
                range = parse_range(v, data.len() as u64);
            }
        }

        match (method.as_str(), path.as_str()) {
            ("GET", "/moved/archive") | ("HEAD", "/moved/archive") => {
                write!(
                    writer,
                    "HTTP/1.1 302 Found\r\nLocation: /archive\r\nContent-Length: 0\r\n\r\n"
                )?;
            }
            ("HEAD", "/archive") => {
                write!(
                    writer,
                    "HTTP/1.1 200 OK\r\nAccept-Ranges: bytes\r\nContent-Length: {}\r\n\r\n",
                    data.len()
                )?;
            }
            ("GET", "/archive") => match range {
                Some((start, end)) if start < data.len() as u64 => {
                    let body = &data[start as usize..=end as usize];
                    write!(
                        writer,
                        "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes {}-{}/{}\r\nContent-Length: {}\r\n\r\n",
                        start,
                        end,
                        data.len(),
                        body.len()
                    )?;
                    writer.write_all(body)?;
                }
                Some(_) => {
                    write!(
                        writer,
                        "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Length: 0\r\n\r\n"
                    )?;
                }
                None => {
                    write!(
                        writer,
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
                        data.len()
                    )?;
                    writer.write_all(&data)?;
                }
            },
            _ => {
                write!(
                    writer,
                    "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n"
                )?;
            }
        }
        writer.flush()?;
    }
}

fn serve(data: Arc<Vec<u8>>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(_) => break,
            };
            let data = data.clone();
            thread::spawn(move || {
                let _ = handle_conn(stream, data);
            });
        }
    });
    format!("http://{}", addr)
}

// Fixture: a tar archive with nested directories, compressible file
// contents and the symlink shapes that exercise resolution.

fn file_content(index: usize, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut line = 0usize;
    while out.len() < len {
        out.extend_from_slice(
            format!("file {:03} line {:06}: some moderately compressible text\n", index, line)
                .as_bytes(),
        );
        line += 1;
    }
    out.truncate(len);
    out
}

fn build_fixture() -> (Vec<u8>, Vec<u8>) {
    let mut builder = Builder::new(Vec::new());

    let add_dir = |builder: &mut Builder<Vec<u8>>, name: &str| {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        header.set_uid(0);
        header.set_gid(0);
        builder
            .append_data(&mut header, format!("{}/", name), io::empty())
            .unwrap();
    };
    let add_file = |builder: &mut Builder<Vec<u8>>, name: &str, content: &[u8]| {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(content.len() as u64);
        header.set_uid(0);
        header.set_gid(0);
        builder.append_data(&mut header, name, content).unwrap();
    };
    let add_symlink = |builder: &mut Builder<Vec<u8>>, name: &str, target: &str| {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_mode(0o777);
        header.set_size(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_link_name(target).unwrap();
        builder.append_data(&mut header, name, io::empty()).unwrap();
    };

    add_dir(&mut builder, "usr");
    add_dir(&mut builder, "usr/bin");
    add_file(&mut builder, "usr/bin/binary", b"pretend this is a binary");
    add_symlink(&mut builder, "weird/linked", "/usr/bin");
    add_symlink(&mut builder, "weird/absolute/binary", "/weird/linked/binary");
    add_symlink(&mut builder, "weird/relative/binary", "../linked/binary");

    add_dir(&mut builder, "data");
    for d in 0..4 {
        let dir = format!("data/part{}", d);
        add_dir(&mut builder, &dir);
        for f in 0..8 {
            let name = format!("{}/chunk{:02}.txt", dir, f);
            add_file(&mut builder, &name, &file_content(d * 8 + f, 100 * 1024));
        }
    }

    let tar_bytes = builder.into_inner().unwrap();

    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(&tar_bytes).unwrap();
    let gz_bytes = enc.finish().unwrap();

    (tar_bytes, gz_bytes)
}

fn http_config() -> HttpReaderConfig {
    HttpReaderConfig {
        timeout: 30,
        connect_timeout: 30,
        retry_limit: 0,
    }
}

fn walk(fs: &TarFs, dir: &str, out: &mut Vec<String>) {
    for e in fs.read_dir(dir) {
        out.push(e.name.clone());
        if e.is_dir() {
            walk(fs, &e.name, out);
        }
    }
}

fn read_file(fs: &TarFs, name: &str) -> Vec<u8> {
    let mut f = fs.open(name).unwrap();
    let mut out = Vec::new();
    f.read_to_end(&mut out).unwrap();
    out
}

fn settle(zr: &ZranReader) {
    let mut last = zr.checkpoint_count();
    for _ in 0..100 {
        thread::sleep(Duration::from_millis(10));
        let now = zr.checkpoint_count();
        if now == last && now > 0 {
            return;
        }
        last = now;
    }
}

fn assert_same_view(hfs: &TarFs, ffs: &TarFs) {
    let mut want = Vec::new();
    walk(ffs, ".", &mut want);
    let mut got = Vec::new();
    walk(hfs, ".", &mut got);
    assert_eq!(got, want);
    assert!(!want.is_empty());

    for name in &want {
        let entry = ffs.entry(name).unwrap();
        if entry.is_dir() || entry.is_link() {
            continue;
        }
        assert_eq!(
            read_file(hfs, name),
            read_file(ffs, name),
            "mismatched contents: {:?}",
            name
        );
    }
}

struct Rng(u64);

impl Rng {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0 % bound
    }
}

#[test]
fn test_walk_over_http_matches_local_tar() {
    let (tar_bytes, gz_bytes) = build_fixture();
    let url = serve(Arc::new(gz_bytes.clone()));

    let http: Arc<dyn RangeReader> =
        Arc::new(HttpReader::new(&format!("{}/archive", url), &http_config()).unwrap());
    assert_eq!(http.size().unwrap(), gz_bytes.len() as u64);
    let zr = Arc::new(ZranReader::new(http, gz_bytes.len() as u64).unwrap());
    let hfs = TarFs::new(zr.clone(), None).unwrap();

    let tmp = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(tmp.path(), &tar_bytes).unwrap();
    let file: Arc<dyn RangeReader> = Arc::new(FileReader::open(tmp.path()).unwrap());
    let ffs = TarFs::new(file, Some(tar_bytes.len() as u64)).unwrap();

    assert_same_view(&hfs, &ffs);

    // Symlink chains resolve over the indexed view too.
    for name in [
        "weird/linked/binary",
        "weird/absolute/binary",
        "weird/relative/binary",
    ] {
        assert_eq!(read_file(&hfs, name), b"pretend this is a binary");
    }
}

#[test]
fn test_random_range_reads_over_http() {
    let (tar_bytes, _) = build_fixture();
    let url = serve(Arc::new(tar_bytes.clone()));

    let http = HttpReader::new(&format!("{}/archive", url), &http_config()).unwrap();
    let len = tar_bytes.len() as u64;
    assert_eq!(http.size().unwrap(), len);

    let mut rng = Rng(0xa4093822299f31d0);
    for _ in 0..100 {
        let start = rng.next(len);
        let want_len = (rng.next(32 * 1024) + 1).min(len - start);
        let mut buf = vec![0u8; want_len as usize];
        http.read_exact_at(&mut buf, start).unwrap();
        assert_eq!(
            &buf[..],
            &tar_bytes[start as usize..(start + want_len) as usize]
        );
    }
}

#[test]
fn test_one_shot_redirect_updates_cached_uri() {
    let (tar_bytes, _) = build_fixture();
    let url = serve(Arc::new(tar_bytes.clone()));

    let http = HttpReader::new(&format!("{}/moved/archive", url), &http_config()).unwrap();
    assert_eq!(http.size().unwrap(), tar_bytes.len() as u64);

    let mut buf = [0u8; 512];
    http.read_exact_at(&mut buf, 0).unwrap();
    assert_eq!(&buf[..], &tar_bytes[..512]);
}

#[test]
fn test_sidecar_round_trip_over_http() {
    let (tar_bytes, gz_bytes) = build_fixture();
    let url = serve(Arc::new(gz_bytes.clone()));
    let uri = format!("{}/archive", url);

    // First open: frontier pass builds the index while the view is walked.
    let http: Arc<dyn RangeReader> = Arc::new(HttpReader::new(&uri, &http_config()).unwrap());
    let zr = Arc::new(ZranReader::new(http, gz_bytes.len() as u64).unwrap());
    let fs = TarFs::new(zr.clone(), None).unwrap();
    let mut names = Vec::new();
    walk(&fs, ".", &mut names);
    for name in &names {
        let e = fs.entry(name).unwrap();
        if !e.is_dir() && !e.is_link() {
            read_file(&fs, name);
        }
    }
    settle(&zr);

    let mut zran_sidecar = Vec::new();
    zr.encode(&mut zran_sidecar).unwrap();
    let mut toc_sidecar = Vec::new();
    fs.encode(&mut toc_sidecar).unwrap();
    drop(fs);
    drop(zr);

    // Second open: both sidecars restore a working reader with no frontier
    // pass and no tar scan.
    let http: Arc<dyn RangeReader> = Arc::new(HttpReader::new(&uri, &http_config()).unwrap());
    let zr = ZranReader::decode(http, gz_bytes.len() as u64, &zran_sidecar[..]).unwrap();
    let hfs = TarFs::decode(Arc::new(zr), &toc_sidecar[..]).unwrap();

    let tmp = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(tmp.path(), &tar_bytes).unwrap();
    let file: Arc<dyn RangeReader> = Arc::new(FileReader::open(tmp.path()).unwrap());
    let ffs = TarFs::new(file, Some(tar_bytes.len() as u64)).unwrap();

    assert_same_view(&hfs, &ffs);
}
