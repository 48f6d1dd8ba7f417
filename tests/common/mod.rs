#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};

use bupview::cache::{IdentityLookup, NameCache};
use bupview::protocol::Response;
use bupview::store::ObjectId;
use bupview::{Slave, SlaveConfig};
use chrono::{Local, TimeZone};
use flate2::Compression;
use flate2::write::ZlibEncoder;
use tempfile::TempDir;

pub const MODE_TREE: u32 = 0o40000;
pub const MODE_FILE: u32 = 0o100644;
pub const MODE_LINK: u32 = 0o120000;

#[derive(Debug, Clone, Copy)]
pub enum Layout {
    Bare,
    Dotted,
}

/// A bup-style archive written object by object into a temp directory.
pub struct Archive {
    tmp: TempDir,
    pub root: PathBuf,
    pub git_dir: PathBuf,
    next_id: u32,
}

impl Archive {
    /// Create an archive at `<tmp>/<relative_root>`.
    pub fn new(relative_root: &str, layout: Layout) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        Self::create(tmp, relative_root, layout)
    }

    /// Create another archive inside the same temp directory tree.
    pub fn create(tmp: TempDir, relative_root: &str, layout: Layout) -> Self {
        let root = tmp.path().join(relative_root);
        let git_dir = match layout {
            Layout::Bare => root.clone(),
            Layout::Dotted => root.join(".git"),
        };
        std::fs::create_dir_all(git_dir.join("objects")).unwrap();
        std::fs::create_dir_all(git_dir.join("refs/heads")).unwrap();
        Archive {
            tmp,
            root,
            git_dir,
            next_id: 1,
        }
    }

    pub fn tmp(&self) -> &Path {
        self.tmp.path()
    }

    /// URL of a path below the archive root.
    pub fn url(&self, inner: &str) -> String {
        format!("bup://{}/{}", self.root.display(), inner)
    }

    fn allocate_id(&mut self) -> ObjectId {
        let mut bytes = [0x5a; 20];
        bytes[16..].copy_from_slice(&self.next_id.to_be_bytes());
        self.next_id += 1;
        ObjectId::from_bytes(bytes)
    }

    pub fn write_object(&mut self, kind: &str, data: &[u8]) -> ObjectId {
        let id = self.allocate_id();
        let hex = id.to_hex();
        let dir = self.git_dir.join("objects").join(&hex[..2]);
        std::fs::create_dir_all(&dir).unwrap();

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        write!(encoder, "{} {}\0", kind, data.len()).unwrap();
        encoder.write_all(data).unwrap();
        std::fs::write(dir.join(&hex[2..]), encoder.finish().unwrap()).unwrap();
        id
    }

    /// Overwrite an object with one whose header claims `claimed` bytes
    /// but whose body is `body`.
    pub fn damage(&self, id: ObjectId, kind: &str, claimed: usize, body: &[u8]) {
        let hex = id.to_hex();
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        write!(encoder, "{} {}\0", kind, claimed).unwrap();
        encoder.write_all(body).unwrap();
        let path = self.git_dir.join("objects").join(&hex[..2]).join(&hex[2..]);
        std::fs::write(path, encoder.finish().unwrap()).unwrap();
    }

    pub fn blob(&mut self, data: &[u8]) -> ObjectId {
        self.write_object("blob", data)
    }

    pub fn tree(&mut self, entries: &[(u32, &str, ObjectId)]) -> ObjectId {
        let mut data = Vec::new();
        for (mode, name, id) in entries {
            write!(data, "{:o} {}\0", mode, name).unwrap();
            data.extend_from_slice(id.as_bytes());
        }
        self.write_object("tree", &data)
    }

    pub fn commit(&mut self, tree: ObjectId, parent: Option<ObjectId>, time: i64) -> ObjectId {
        let mut text = format!("tree {}\n", tree.to_hex());
        if let Some(parent) = parent {
            text.push_str(&format!("parent {}\n", parent.to_hex()));
        }
        text.push_str(&format!(
            "author Backup <backup@example.com> {time} +0000\n\
             committer Backup <backup@example.com> {time} +0000\n\nbup save\n"
        ));
        self.write_object("commit", text.as_bytes())
    }

    pub fn set_branch(&self, name: &str, commit: ObjectId) {
        std::fs::write(
            self.git_dir.join("refs/heads").join(name),
            format!("{}\n", commit.to_hex()),
        )
        .unwrap();
    }

    /// Write a `.bupm` stream with one entry per record.
    pub fn bupm(&mut self, records: &[Meta]) -> ObjectId {
        let mut data = Vec::new();
        for record in records {
            data.extend(record.encode());
        }
        self.blob(&data)
    }
}

/// One `.bupm` entry.
#[derive(Debug, Clone)]
pub struct Meta {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub size: Option<u64>,
    pub symlink: Option<String>,
}

impl Meta {
    pub fn new(mode: u32, mtime: i64) -> Self {
        Meta {
            mode,
            uid: 1000,
            gid: 100,
            atime: mtime + 5,
            mtime,
            size: None,
            symlink: None,
        }
    }

    pub fn size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn link(mut self, target: &str) -> Self {
        self.symlink = Some(target.to_string());
        self
    }

    fn encode(&self) -> Vec<u8> {
        let mut common = Vec::new();
        write_vuint(&mut common, self.mode as u64);
        write_vuint(&mut common, self.uid as u64);
        write_bvec(&mut common, b"");
        write_vuint(&mut common, self.gid as u64);
        write_bvec(&mut common, b"");
        write_vuint(&mut common, 0);
        for (secs, nanos) in [(self.atime, 0), (self.mtime, 0), (self.mtime, 0)] {
            write_vint(&mut common, secs);
            write_vuint(&mut common, nanos);
        }
        write_vint(&mut common, self.size.map(|s| s as i64).unwrap_or(-1));

        let mut out = Vec::new();
        write_vuint(&mut out, 10);
        write_bvec(&mut out, &common);
        if let Some(target) = &self.symlink {
            write_vuint(&mut out, 3);
            write_bvec(&mut out, target.as_bytes());
        }
        write_vuint(&mut out, 0);
        out
    }
}

fn write_vuint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn write_vint(out: &mut Vec<u8>, value: i64) {
    let mut magnitude = value.unsigned_abs();
    let mut first = (magnitude & 0x3f) as u8;
    if value < 0 {
        first |= 0x40;
    }
    magnitude >>= 6;
    if magnitude != 0 {
        first |= 0x80;
    }
    out.push(first);
    if magnitude != 0 {
        write_vuint(out, magnitude);
    }
}

fn write_bvec(out: &mut Vec<u8>, bytes: &[u8]) {
    write_vuint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

/// Directory name the archive view gives a snapshot taken at `time`.
pub fn snapshot_name(time: i64) -> String {
    Local
        .timestamp_opt(time, 0)
        .single()
        .unwrap()
        .format("%Y-%m-%d %H:%M")
        .to_string()
}

/// Deterministic file content.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ seed).collect()
}

/// Names resolve to `user<uid>` / `group<gid>`.
pub struct FixedNames;

impl IdentityLookup for FixedNames {
    fn user_name(&self, uid: u32) -> Option<String> {
        Some(format!("user{uid}"))
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        Some(format!("group{gid}"))
    }
}

pub fn slave(config: SlaveConfig) -> Slave<FixedNames> {
    Slave::with_names(config, NameCache::with_lookup(FixedNames))
}

/// Concatenated payload of all data responses.
pub fn data_of(responses: &[Response]) -> Vec<u8> {
    responses
        .iter()
        .filter_map(|r| match r {
            Response::Data(bytes) => Some(bytes.to_vec()),
            _ => None,
        })
        .flatten()
        .collect()
}

pub const T1: i64 = 1_700_000_000;
pub const T2: i64 = T1 + 86_400;

/// Sizes of the chunks making up `bigfile`.
pub const CHUNKS: [usize; 3] = [3000, 3000, 1500];

/// The standard two-snapshot archive on branch `main`.
///
/// Snapshot 1 (`T1`):
/// ```text
/// abs -> /docs/readme.txt
/// bigfile            chunked, 7500 bytes, mode 0600
/// dangling -> missing.txt
/// docs/              mode 0700
///   notes -> readme.txt
///   readme.txt       10000 bytes
/// empty/
/// ```
/// Snapshot 2 (`T2`) holds `docs/` (no metadata) and `new.txt`.
pub struct Standard {
    pub archive: Archive,
    pub readme: Vec<u8>,
    pub big: Vec<u8>,
    pub snap1: String,
    pub snap2: String,
    pub commit2: ObjectId,
    /// Last leaf of `bigfile`.
    pub big_tail: ObjectId,
    /// Tree of `docs/` in snapshot 1.
    pub docs_tree: ObjectId,
}

impl Standard {
    pub fn build(layout: Layout) -> Self {
        let mut archive = Archive::new("backups/home", layout);
        let readme = pattern(10_000, 0);

        // docs/
        let readme_id = archive.blob(&readme);
        let notes_id = archive.blob(b"readme.txt");
        let docs_bupm = archive.bupm(&[
            Meta::new(0o40700, T1 - 50),
            Meta::new(0o100640, T1 - 100).size(10_000),
            Meta::new(0o120777, T1 - 90).link("readme.txt"),
        ]);
        let docs = archive.tree(&[
            (MODE_FILE, ".bupm", docs_bupm),
            (MODE_FILE, "readme.txt", readme_id),
            (MODE_LINK, "notes", notes_id),
        ]);

        // bigfile as a hashsplit tree: two leaves, then a subtree.
        let big = pattern(CHUNKS.iter().sum(), 7);
        let c0 = archive.blob(&big[..3000]);
        let c1 = archive.blob(&big[3000..6000]);
        let c2 = archive.blob(&big[6000..]);
        let inner = archive.tree(&[(MODE_FILE, "0", c2)]);
        let chunked = archive.tree(&[
            (MODE_TREE, "1770", inner),
            (MODE_FILE, "0", c0),
            (MODE_FILE, "bb8", c1),
        ]);

        let abs_id = archive.blob(b"/docs/readme.txt");
        let dangling_id = archive.blob(b"missing.txt");
        let empty = archive.tree(&[]);
        let root_bupm = archive.bupm(&[
            Meta::new(0o40755, T1 - 10),
            Meta::new(0o120777, T1 - 20).link("/docs/readme.txt"),
            Meta::new(0o100600, T1 - 30).size(big.len() as u64),
            Meta::new(0o120777, T1 - 40).link("missing.txt"),
        ]);
        let snap1_tree = archive.tree(&[
            (MODE_FILE, ".bupm", root_bupm),
            (MODE_LINK, "abs", abs_id),
            (MODE_TREE, "bigfile.bup", chunked),
            (MODE_LINK, "dangling", dangling_id),
            (MODE_TREE, "docs", docs),
            (MODE_TREE, "empty", empty),
        ]);
        let commit1 = archive.commit(snap1_tree, None, T1);

        let plain_docs = archive.tree(&[(MODE_FILE, "readme.txt", readme_id)]);
        let new_id = archive.blob(b"fresh\n");
        let snap2_tree = archive.tree(&[
            (MODE_TREE, "docs", plain_docs),
            (MODE_FILE, "new.txt", new_id),
        ]);
        let commit2 = archive.commit(snap2_tree, Some(commit1), T2);
        archive.set_branch("main", commit2);

        Standard {
            archive,
            readme,
            big,
            snap1: snapshot_name(T1),
            snap2: snapshot_name(T2),
            commit2,
            big_tail: c2,
            docs_tree: docs,
        }
    }

    /// URL of a path inside snapshot 1.
    pub fn snap1_url(&self, inner: &str) -> String {
        self.archive.url(&format!("main/{}/{}", self.snap1, inner))
    }

    /// In-archive path of a path inside snapshot 1.
    pub fn snap1_path(&self, inner: &str) -> String {
        format!("main/{}/{}", self.snap1, inner)
    }
}
