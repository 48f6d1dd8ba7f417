use bytes::Bytes;
use std::collections::BTreeMap;

use crate::store::ObjectId;

/// Index of a node in its repository's arena.
pub type NodeId = usize;

/// File type mask and values, as in `st_mode`.
pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

pub const MIME_DIRECTORY: &str = "inode/directory";
pub const MIME_SYMLINK: &str = "inode/symlink";

/// Attributes shared by every node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAttrs {
    pub name: String,
    /// Type and permission bits.
    pub mode: u32,
    pub mtime: i64,
    pub atime: i64,
    pub uid: u32,
    pub gid: u32,
    pub mime_type: String,
    /// Non-empty when the node is a symbolic link.
    pub symlink_target: Option<String>,
}

impl NodeAttrs {
    pub fn file_type(&self) -> u32 {
        self.mode & S_IFMT
    }

    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    pub fn is_symlink(&self) -> bool {
        self.symlink_target.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// Where a file's bytes come from.
#[derive(Debug, Clone)]
pub enum FileContent {
    /// Synthesised content (e.g. the target text of a generated link).
    Inline(Bytes),
    /// A single blob.
    Blob(ObjectId),
    /// A hashsplit tree of blobs, concatenated in offset order.
    Chunked(ObjectId),
}

/// One leaf of a hashsplit tree, positioned in the reconstructed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub start: u64,
    pub len: u64,
    pub id: ObjectId,
}

/// File payload: content source plus a read cursor.
#[derive(Debug)]
pub struct File {
    pub(crate) content: FileContent,
    pub(crate) size: Option<u64>,
    pub(crate) offset: u64,
    pub(crate) chunks: Option<Vec<Chunk>>,
    /// Most recently loaded piece of content and its starting offset.
    pub(crate) window: Option<(u64, Bytes)>,
}

impl File {
    pub fn new(content: FileContent, size: Option<u64>) -> Self {
        File {
            content,
            size,
            offset: 0,
            chunks: None,
            window: None,
        }
    }
}

/// What a directory's children are derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectorySource {
    /// The archive root: one child per branch.
    ArchiveRoot,
    /// A branch: one child per commit, plus `latest`.
    Branch { name: String, tip: Option<ObjectId> },
    /// A git tree; `snapshot_root` marks the top tree of a commit.
    Tree { id: ObjectId, snapshot_root: bool },
}

/// Directory payload: content source plus the memoized child map.
#[derive(Debug)]
pub struct Directory {
    pub(crate) source: DirectorySource,
    pub(crate) children: Option<BTreeMap<String, NodeId>>,
}

impl Directory {
    pub fn new(source: DirectorySource) -> Self {
        Directory {
            source,
            children: None,
        }
    }

    pub fn is_snapshot_root(&self) -> bool {
        matches!(
            self.source,
            DirectorySource::Tree {
                snapshot_root: true,
                ..
            }
        )
    }
}

#[derive(Debug)]
pub enum NodeKind {
    File(File),
    Directory(Directory),
}

/// An entry in the archive's logical tree.
#[derive(Debug)]
pub struct Node {
    pub attrs: NodeAttrs,
    pub parent: Option<NodeId>,
    pub kind: NodeKind,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.attrs.name
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory(_))
    }

    pub fn as_directory(&self) -> Option<&Directory> {
        match &self.kind {
            NodeKind::Directory(dir) => Some(dir),
            NodeKind::File(_) => None,
        }
    }

    /// Guess a MIME type for a regular file from its name.
    pub fn guess_mime(name: &str) -> String {
        mime_guess::from_path(name)
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    }
}
