use bytes::Bytes;

use super::ObjectId;
use crate::error::{StoreError, StoreResult};

/// The four git object types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Commit,
    Tree,
    Blob,
    Tag,
}

impl ObjectKind {
    /// Parse the type word used in loose object headers.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "commit" => Some(ObjectKind::Commit),
            "tree" => Some(ObjectKind::Tree),
            "blob" => Some(ObjectKind::Blob),
            "tag" => Some(ObjectKind::Tag),
            _ => None,
        }
    }

    /// Map a pack entry type number (1-4) to a kind.
    pub fn from_pack_type(code: u8) -> Option<Self> {
        match code {
            1 => Some(ObjectKind::Commit),
            2 => Some(ObjectKind::Tree),
            3 => Some(ObjectKind::Blob),
            4 => Some(ObjectKind::Tag),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ObjectKind::Commit => "commit",
            ObjectKind::Tree => "tree",
            ObjectKind::Blob => "blob",
            ObjectKind::Tag => "tag",
        }
    }
}

/// A fully inflated object.
#[derive(Debug, Clone)]
pub struct RawObject {
    pub kind: ObjectKind,
    pub data: Bytes,
}

impl RawObject {
    pub fn new(kind: ObjectKind, data: impl Into<Bytes>) -> Self {
        RawObject {
            kind,
            data: data.into(),
        }
    }

    /// Fail unless this object is of the expected kind.
    pub fn expect_kind(self, id: &ObjectId, expected: ObjectKind) -> StoreResult<Self> {
        if self.kind != expected {
            return Err(StoreError::UnexpectedKind {
                id: *id,
                expected: expected.name(),
                actual: self.kind.name(),
            });
        }
        Ok(self)
    }
}

/// The fields of a commit the archive view cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    /// Committer timestamp, seconds since the epoch.
    pub commit_time: i64,
}

impl Commit {
    pub fn parse(id: &ObjectId, data: &[u8]) -> StoreResult<Self> {
        let corrupt = |reason: &str| StoreError::CorruptObject {
            id: *id,
            reason: reason.to_string(),
        };

        let text = String::from_utf8_lossy(data);
        let mut tree = None;
        let mut parents = Vec::new();
        let mut author_time = None;
        let mut commit_time = None;

        for line in text.lines() {
            if line.is_empty() {
                break;
            }
            let (key, value) = line.split_once(' ').unwrap_or((line, ""));
            match key {
                "tree" => tree = Some(ObjectId::from_hex(value)?),
                "parent" => parents.push(ObjectId::from_hex(value)?),
                "author" => author_time = parse_signature_time(value),
                "committer" => commit_time = parse_signature_time(value),
                _ => {}
            }
        }

        Ok(Commit {
            tree: tree.ok_or_else(|| corrupt("commit has no tree"))?,
            parents,
            commit_time: commit_time.or(author_time).unwrap_or(0),
        })
    }
}

/// Extract the timestamp from `Name <email> 1700000000 +0100`.
fn parse_signature_time(signature: &str) -> Option<i64> {
    let after_email = &signature[signature.rfind('>')? + 1..];
    after_email.split_whitespace().next()?.parse().ok()
}

/// Git mode of a subtree entry.
pub const GIT_MODE_TREE: u32 = 0o040000;
/// Git mode of a symlink entry.
pub const GIT_MODE_SYMLINK: u32 = 0o120000;
/// Git mode of a submodule entry.
pub const GIT_MODE_GITLINK: u32 = 0o160000;

/// One line of a tree object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: u32,
    pub name: String,
    pub id: ObjectId,
}

impl TreeEntry {
    pub fn is_tree(&self) -> bool {
        self.mode & 0o170000 == GIT_MODE_TREE
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & 0o170000 == GIT_MODE_SYMLINK
    }

    pub fn is_gitlink(&self) -> bool {
        self.mode & 0o170000 == GIT_MODE_GITLINK
    }
}

/// Parse the binary body of a tree: `<octal mode> <name>\0<20 byte id>` repeated.
pub fn parse_tree(id: &ObjectId, data: &[u8]) -> StoreResult<Vec<TreeEntry>> {
    let corrupt = |reason: String| StoreError::CorruptObject { id: *id, reason };

    let mut entries = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let space = data[pos..]
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| corrupt(format!("missing mode separator at {pos}")))?;
        let mode_text = std::str::from_utf8(&data[pos..pos + space])
            .map_err(|_| corrupt(format!("non-ascii mode at {pos}")))?;
        let mode = u32::from_str_radix(mode_text, 8)
            .map_err(|_| corrupt(format!("bad mode {mode_text:?}")))?;
        pos += space + 1;

        let nul = data[pos..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| corrupt(format!("unterminated name at {pos}")))?;
        let name = String::from_utf8_lossy(&data[pos..pos + nul]).into_owned();
        pos += nul + 1;

        if pos + super::OID_LEN > data.len() {
            return Err(corrupt(format!("truncated entry {name:?}")));
        }
        let entry_id = ObjectId::from_slice(&data[pos..pos + super::OID_LEN])?;
        pos += super::OID_LEN;

        entries.push(TreeEntry {
            mode,
            name,
            id: entry_id,
        });
    }
    Ok(entries)
}

/// Split a loose object's `<type> <size>\0` header from its body.
pub fn parse_loose_header(id: &ObjectId, inflated: &[u8]) -> StoreResult<(ObjectKind, usize, usize)> {
    let corrupt = |reason: &str| StoreError::CorruptObject {
        id: *id,
        reason: reason.to_string(),
    };

    let nul = inflated
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| corrupt("missing header terminator"))?;
    let header = std::str::from_utf8(&inflated[..nul]).map_err(|_| corrupt("bad header"))?;
    let (kind, size) = header.split_once(' ').ok_or_else(|| corrupt("bad header"))?;
    let kind = ObjectKind::from_name(kind).ok_or_else(|| corrupt("unknown object type"))?;
    let size = size.parse().map_err(|_| corrupt("bad object size"))?;
    Ok((kind, size, nul + 1))
}
