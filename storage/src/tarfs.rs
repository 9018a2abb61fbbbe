// Copyright 2024 Zran Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Read-only filesystem view over a tar stream.
//!
//! The stream is scanned once at open time to learn where each member's
//! payload starts in the (uncompressed) blob; afterwards every read is
//! offset arithmetic against that table. The backing [`RangeReader`] is
//! typically a [`crate::zran::ZranReader`], but any positioned source of the
//! tar bytes works, which is also how the view is tested against plain
//! files.
//!
//! All tables are immutable once constructed, so the view is safe to share
//! across threads without locking.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use tar::{Archive, EntryType};

use crate::backend::{RangeReader, SectionReader};
use crate::meta::{MetaError, TarToc};

/// Maximum number of symlink hops followed by `open`, same bound as
/// `filepath.EvalSymlinks` (the kernel's MAXSYMLINKS of 40 would arguably
/// be more reasonable).
const MAX_SYMLINK_HOPS: u32 = 255;

/// Buffer size for the single indexing scan.
const SCAN_BUF_SIZE: usize = 1 << 20;

#[derive(Debug)]
pub enum TarFsError {
    NotFound(String),
    TooManySymlinks(String),
    NotLink(String),
    Meta(MetaError),
    Io(io::Error),
    /// Cursor-paginated `read_dir` is exhausted.
    Eof,
}

impl fmt::Display for TarFsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TarFsError::NotFound(name) => write!(f, "{:?}: no such file or directory", name),
            TarFsError::TooManySymlinks(name) => {
                write!(
                    f,
                    "opening {:?}: chased too many ({}) symlinks",
                    name, MAX_SYMLINK_HOPS
                )
            }
            TarFsError::NotLink(name) => write!(f, "{:?}: file is not a link", name),
            TarFsError::Meta(e) => write!(f, "{}", e),
            TarFsError::Io(e) => write!(f, "failed to read tar stream, {}", e),
            TarFsError::Eof => write!(f, "directory listing exhausted"),
        }
    }
}

impl std::error::Error for TarFsError {}

impl From<io::Error> for TarFsError {
    fn from(e: io::Error) -> Self {
        TarFsError::Io(e)
    }
}

pub type TarFsResult<T> = std::result::Result<T, TarFsError>;

/// Member kind, collapsed from the tar type flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    HardLink,
    Fifo,
    Char,
    Block,
    Other,
}

impl From<EntryType> for EntryKind {
    fn from(t: EntryType) -> Self {
        match t {
            EntryType::Regular | EntryType::Continuous => EntryKind::Regular,
            EntryType::Directory => EntryKind::Directory,
            EntryType::Symlink => EntryKind::Symlink,
            EntryType::Link => EntryKind::HardLink,
            EntryType::Fifo => EntryKind::Fifo,
            EntryType::Char => EntryKind::Char,
            EntryType::Block => EntryKind::Block,
            _ => EntryKind::Other,
        }
    }
}

/// One archive member and where its payload lives in the blob.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TarEntry {
    /// Normalized member path.
    pub name: String,
    /// Parent directory of `name`, `.` for top-level members.
    pub dir: String,
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
    /// First byte of the payload in the blob's byte space.
    pub offset: u64,
    /// Payload length in bytes.
    pub size: u64,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub mtime: u64,
}

impl TarEntry {
    /// Final path component.
    pub fn file_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_link(&self) -> bool {
        matches!(self.kind, EntryKind::Symlink | EntryKind::HardLink)
    }
}

/// Strip one leading `/`, one leading `./` and one trailing `/`.
///
/// Deliberately weak: `..` segments inside names are indexed verbatim and
/// reachable only by exact match.
fn normalize(name: &str) -> String {
    let name = name.strip_suffix('/').unwrap_or(name);
    let name = name.strip_prefix('/').unwrap_or(name);
    let name = name.strip_prefix("./").unwrap_or(name);
    name.to_string()
}

/// Parent directory of a normalized name, `.` for top-level names.
fn parent_dir(name: &str) -> String {
    match name.rfind('/') {
        Some(i) => name[..i].to_string(),
        None => ".".to_string(),
    }
}

/// Lexically simplify a slash-separated path: collapse duplicate slashes,
/// drop `.` elements, resolve `..` against preceding elements.
fn clean(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let bytes = path.as_bytes();
    let n = bytes.len();
    let rooted = bytes[0] == b'/';
    let mut out: Vec<u8> = Vec::with_capacity(n);
    let mut r = 0;
    let mut dotdot = 0;
    if rooted {
        out.push(b'/');
        r = 1;
        dotdot = 1;
    }

    while r < n {
        if bytes[r] == b'/' {
            // empty path element
            r += 1;
        } else if bytes[r] == b'.' && (r + 1 == n || bytes[r + 1] == b'/') {
            // . element
            r += 1;
        } else if bytes[r] == b'.'
            && r + 1 < n
            && bytes[r + 1] == b'.'
            && (r + 2 == n || bytes[r + 2] == b'/')
        {
            // .. element: backtrack one element if possible
            r += 2;
            if out.len() > dotdot {
                let mut w = out.len() - 1;
                while w > dotdot && out[w] != b'/' {
                    w -= 1;
                }
                out.truncate(w);
            } else if !rooted {
                // cannot backtrack, keep the .. element
                if !out.is_empty() {
                    out.push(b'/');
                }
                out.extend_from_slice(b"..");
                dotdot = out.len();
            }
        } else {
            // real path element
            if (rooted && out.len() != 1) || (!rooted && !out.is_empty()) {
                out.push(b'/');
            }
            while r < n && bytes[r] != b'/' {
                out.push(bytes[r]);
                r += 1;
            }
        }
    }

    if out.is_empty() {
        return ".".to_string();
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Join non-empty elements with a slash and clean the result.
fn join(parts: &[&str]) -> String {
    let joined = parts
        .iter()
        .filter(|p| !p.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("/");
    if joined.is_empty() {
        return String::new();
    }
    clean(&joined)
}

fn is_abs(path: &str) -> bool {
    path.starts_with('/')
}

/// Proper ancestor prefixes of `name`, shortest first.
fn ancestors(name: &str) -> impl Iterator<Item = &str> {
    name.match_indices('/').map(move |(i, _)| &name[..i])
}

fn synthetic_root() -> Arc<TarEntry> {
    Arc::new(TarEntry {
        name: ".".to_string(),
        dir: ".".to_string(),
        kind: EntryKind::Directory,
        link_target: None,
        offset: 0,
        size: 0,
        mode: 0o755,
        uid: 0,
        gid: 0,
        mtime: 0,
    })
}

/// Read-only filesystem view over a tar stream served by a [`RangeReader`].
pub struct TarFs {
    ra: Arc<dyn RangeReader>,
    files: Vec<Arc<TarEntry>>,
    index: HashMap<String, usize>,
    /// Children of each directory, sorted by final path component.
    dirs: HashMap<String, Vec<usize>>,
}

impl TarFs {
    /// Scan the tar stream once and build the member and directory tables.
    /// Pass `size: None` when the total size of the stream is unknown (the
    /// scan stops at the tar end-of-archive marker either way).
    pub fn new(ra: Arc<dyn RangeReader>, size: Option<u64>) -> TarFsResult<Self> {
        let limit = size.unwrap_or(u64::MAX);
        let section = SectionReader::new(ra.clone(), 0, limit);
        let reader = BufReader::with_capacity(SCAN_BUF_SIZE, section);
        let mut archive = Archive::new(reader);

        let mut files: Vec<Arc<TarEntry>> = Vec::new();
        for entry in archive.entries().map_err(TarFsError::Io)? {
            let entry = entry.map_err(TarFsError::Io)?;
            let entry_type = entry.header().entry_type();
            if matches!(
                entry_type,
                EntryType::XHeader
                    | EntryType::XGlobalHeader
                    | EntryType::GNULongName
                    | EntryType::GNULongLink
            ) {
                // Metadata pseudo-entries already folded into their
                // successors by the tar parser.
                continue;
            }

            let name = normalize(&String::from_utf8_lossy(&entry.path_bytes()));
            let dir = parent_dir(&name);
            let link_target = entry
                .link_name_bytes()
                .map(|b| String::from_utf8_lossy(&b).into_owned());
            let header = entry.header();
            files.push(Arc::new(TarEntry {
                dir,
                kind: EntryKind::from(entry_type),
                link_target,
                offset: entry.raw_file_position(),
                size: entry.size(),
                mode: header.mode().map_err(TarFsError::Io)?,
                uid: header.uid().map_err(TarFsError::Io)?,
                gid: header.gid().map_err(TarFsError::Io)?,
                mtime: header.mtime().map_err(TarFsError::Io)?,
                name,
            }));
        }
        info!("tarfs: indexed {} entries", files.len());

        let (index, dirs) = Self::build_tables(&files);
        Ok(TarFs {
            ra,
            files,
            index,
            dirs,
        })
    }

    /// Name and directory tables from the entry list. Name collisions are
    /// last-write-wins; shadowed entries do not appear in listings.
    fn build_tables(
        files: &[Arc<TarEntry>],
    ) -> (HashMap<String, usize>, HashMap<String, Vec<usize>>) {
        let mut index = HashMap::with_capacity(files.len());
        let mut shadowed = vec![false; files.len()];
        for (i, f) in files.iter().enumerate() {
            if let Some(old) = index.insert(f.name.clone(), i) {
                shadowed[old] = true;
            }
        }

        // Count children per directory so each list is allocated once.
        let mut dir_count: HashMap<&str, usize> = HashMap::new();
        for (i, f) in files.iter().enumerate() {
            if !shadowed[i] {
                *dir_count.entry(f.dir.as_str()).or_insert(0) += 1;
            }
        }
        let mut dirs: HashMap<String, Vec<usize>> = HashMap::with_capacity(dir_count.len());
        for (dir, count) in dir_count {
            dirs.insert(dir.to_string(), Vec::with_capacity(count));
        }
        for (i, f) in files.iter().enumerate() {
            if !shadowed[i] {
                dirs.get_mut(f.dir.as_str()).unwrap().push(i);
            }
        }
        for children in dirs.values_mut() {
            children.sort_by(|&a, &b| files[a].file_name().cmp(files[b].file_name()));
        }

        (index, dirs)
    }

    fn entry_opt(&self, name: &str) -> Option<&Arc<TarEntry>> {
        self.index.get(name).map(|&i| &self.files[i])
    }

    /// Look up a member by exact normalized name, without following links.
    pub fn entry(&self, name: &str) -> TarFsResult<Arc<TarEntry>> {
        self.entry_opt(name)
            .cloned()
            .ok_or_else(|| TarFsError::NotFound(name.to_string()))
    }

    /// Stat a member without following links. The root `.` is synthesized
    /// when absent from the archive.
    pub fn stat(&self, name: &str) -> TarFsResult<Arc<TarEntry>> {
        if let Some(e) = self.entry_opt(name) {
            return Ok(e.clone());
        }
        if name == "." {
            return Ok(synthetic_root());
        }
        Err(TarFsError::NotFound(name.to_string()))
    }

    /// Sorted listing of a directory. Unknown directories list as empty.
    pub fn read_dir(&self, name: &str) -> Vec<Arc<TarEntry>> {
        match self.dirs.get(name) {
            Some(children) => children.iter().map(|&i| self.files[i].clone()).collect(),
            None => Vec::new(),
        }
    }

    /// Raw target of a symlink or hard link.
    pub fn read_link(&self, name: &str) -> TarFsResult<String> {
        let e = self.entry(name)?;
        match (&e.kind, &e.link_target) {
            (EntryKind::Symlink, Some(t)) | (EntryKind::HardLink, Some(t)) => Ok(t.clone()),
            _ => Err(TarFsError::NotLink(name.to_string())),
        }
    }

    /// Open a member, transparently following symlinks and hard links.
    /// The root `.` is always openable as a directory.
    pub fn open(&self, name: &str) -> TarFsResult<TarFile> {
        if name == "." {
            return Ok(self.make_file(synthetic_root()));
        }
        self.open_inner(name, 0)
    }

    fn open_inner(&self, name: &str, hops: u32) -> TarFsResult<TarFile> {
        if hops > MAX_SYMLINK_HOPS {
            return Err(TarFsError::TooManySymlinks(name.to_string()));
        }

        let entry = match self.entry_opt(name) {
            Some(e) => e.clone(),
            None => {
                // Maybe a prefix directory is itself a symlink. Walk every
                // ancestor, shortest first, and rewrite what follows it.
                for dir in ancestors(name) {
                    let a = match self.entry_opt(dir) {
                        Some(a) => a,
                        None => continue,
                    };
                    if a.kind != EntryKind::Symlink {
                        continue;
                    }
                    let rest = &name[dir.len()..];
                    let link = a.link_target.as_deref().unwrap_or("");
                    if is_abs(link) {
                        return self.open_inner(&normalize(&join(&[link, rest])), hops + 1);
                    }
                    return self.open_inner(&join(&[a.dir.as_str(), link, rest]), hops + 1);
                }
                return Err(TarFsError::NotFound(name.to_string()));
            }
        };

        if entry.is_link() {
            let link = entry.link_target.as_deref().unwrap_or("");
            // Hard link targets are archive paths, so they re-resolve from
            // the root just like absolute symlinks.
            if is_abs(link) || entry.kind == EntryKind::HardLink {
                return self.open_inner(&normalize(link), hops + 1);
            }
            return self.open_inner(&join(&[entry.dir.as_str(), link]), hops + 1);
        }

        Ok(self.make_file(entry))
    }

    fn make_file(&self, entry: Arc<TarEntry>) -> TarFile {
        let children = if entry.is_dir() {
            self.read_dir(&entry.name)
        } else {
            Vec::new()
        };
        let section = SectionReader::new(self.ra.clone(), entry.offset, entry.size);
        TarFile {
            entry,
            section,
            children,
            cursor: 0,
        }
    }

    /// Persist the entry table to a sidecar.
    pub fn encode<W: Write>(&self, w: W) -> TarFsResult<()> {
        let entries = self.files.iter().map(|e| (**e).clone()).collect();
        TarToc::new(entries).save(w).map_err(TarFsError::Meta)
    }

    /// Reconstruct the view from a sidecar produced by [`encode`], without
    /// re-scanning the tar stream. Rebuilds both the name index and the
    /// directory lists.
    ///
    /// [`encode`]: TarFs::encode
    pub fn decode<R: Read>(ra: Arc<dyn RangeReader>, r: R) -> TarFsResult<Self> {
        let toc = TarToc::load(r).map_err(TarFsError::Meta)?;
        let files: Vec<Arc<TarEntry>> = toc.entries.into_iter().map(Arc::new).collect();
        let (index, dirs) = Self::build_tables(&files);
        Ok(TarFs {
            ra,
            files,
            index,
            dirs,
        })
    }
}

/// An opened member: a bounded section of the backing blob plus, for
/// directories, a cursor over the sorted child list.
pub struct TarFile {
    entry: Arc<TarEntry>,
    section: SectionReader,
    children: Vec<Arc<TarEntry>>,
    cursor: usize,
}

impl TarFile {
    pub fn entry(&self) -> &Arc<TarEntry> {
        &self.entry
    }

    /// Positioned read relative to the start of the member payload,
    /// independent of the sequential cursor.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.section.read_at(buf, offset)
    }

    /// Cursor-paginated directory listing. `n > 0` returns up to `n`
    /// entries and [`TarFsError::Eof`] once exhausted; `n <= 0` returns all
    /// remaining entries.
    pub fn read_dir(&mut self, n: i64) -> TarFsResult<Vec<Arc<TarEntry>>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        if self.cursor >= self.children.len() {
            if n < 0 {
                return Ok(Vec::new());
            }
            return Err(TarFsError::Eof);
        }
        if n > 0 && self.children.len() - self.cursor > n as usize {
            let out = self.children[self.cursor..self.cursor + n as usize].to_vec();
            self.cursor += n as usize;
            return Ok(out);
        }
        let out = self.children[self.cursor..].to_vec();
        self.cursor = self.children.len();
        Ok(out)
    }
}

impl Read for TarFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.section.read(buf)
    }
}

impl Seek for TarFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.section.seek(pos)
    }
}
