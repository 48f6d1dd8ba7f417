//! The logical view of one bup archive.
//!
//! Nodes are materialized lazily into an arena: the root lists branches, a
//! branch lists its commits (plus `latest`), and a commit is its git tree
//! with bup's name mangling and `.bupm` metadata applied.

use std::collections::{BTreeMap, HashSet};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{Local, TimeZone};
use tracing::{debug, info, warn};

use super::metadata::{Metadata, MetadataReader};
use super::node::{
    Directory, DirectorySource, File, FileContent, MIME_DIRECTORY, MIME_SYMLINK, Node, NodeAttrs, NodeId,
    NodeKind, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG,
};
use crate::config::SlaveConfig;
use crate::error::{StoreError, StoreResult};
use crate::store::{ObjectId, ObjectStore, TreeEntry};

/// The archive root is always the first node.
pub const ROOT_NODE: NodeId = 0;

/// Name of the per-branch link to the newest snapshot.
pub const LATEST: &str = "latest";

const BUPM: &str = ".bupm";

/// Locate the git directory of an archive rooted at `root`, accepting the
/// bare layout (`objects` + `refs`) and the dot layout (`.git/...`).
pub fn git_dir_for(root: &Path) -> Option<PathBuf> {
    let has_markers = |dir: &Path| dir.join("objects").is_dir() && dir.join("refs").is_dir();
    if has_markers(root) {
        return Some(root.to_path_buf());
    }
    let dotted = root.join(".git");
    has_markers(&dotted).then_some(dotted)
}

/// How a tree entry presents itself once bup's mangling is undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryShape {
    Directory,
    Chunked,
    Blob,
}

fn demangle(entry: &TreeEntry) -> (String, EntryShape) {
    if let Some(name) = entry.name.strip_suffix(".bupl") {
        let shape = if entry.is_tree() {
            EntryShape::Directory
        } else {
            EntryShape::Blob
        };
        return (name.to_string(), shape);
    }
    if entry.is_tree() {
        return match entry.name.strip_suffix(".bup") {
            Some(name) => (name.to_string(), EntryShape::Chunked),
            None => (entry.name.clone(), EntryShape::Directory),
        };
    }
    (entry.name.clone(), EntryShape::Blob)
}

/// Display name of a snapshot, unique among `taken`.
fn commit_name(time: i64, taken: &BTreeMap<String, NodeId>) -> String {
    let (minute, second) = match Local.timestamp_opt(time, 0).single() {
        Some(at) => (
            at.format("%Y-%m-%d %H:%M").to_string(),
            at.format("%Y-%m-%d %H:%M:%S").to_string(),
        ),
        None => (time.to_string(), time.to_string()),
    };
    if !taken.contains_key(&minute) {
        return minute;
    }
    if !taken.contains_key(&second) {
        return second;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{second} ({n})");
        if !taken.contains_key(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

pub struct Repository {
    /// Filesystem path of the archive root, always ending in `/`.
    root: String,
    store: ObjectStore,
    nodes: Vec<Node>,
    pub(crate) max_symlink_depth: usize,
}

impl Repository {
    /// Open the archive rooted at `root`.
    pub fn open(root: &str, config: &SlaveConfig) -> StoreResult<Self> {
        let root = if root.ends_with('/') {
            root.to_string()
        } else {
            format!("{root}/")
        };
        let root_path = Path::new(&root);
        let git_dir = git_dir_for(root_path)
            .ok_or_else(|| StoreError::InvalidRepository(format!("no object store under {root}")))?;
        let store = ObjectStore::open(&git_dir, config.object_cache_capacity)?;

        let stat = std::fs::metadata(root_path)?;
        let name = root
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        let attrs = NodeAttrs {
            name,
            mode: S_IFDIR | 0o755,
            mtime: stat.mtime(),
            atime: stat.atime(),
            uid: stat.uid(),
            gid: stat.gid(),
            mime_type: MIME_DIRECTORY.to_string(),
            symlink_target: None,
        };
        let root_node = Node {
            attrs,
            parent: None,
            kind: NodeKind::Directory(Directory::new(DirectorySource::ArchiveRoot)),
        };

        info!(root = %root, git_dir = %git_dir.display(), packs = store.pack_count(), "opened repository");
        Ok(Repository {
            root,
            store,
            nodes: vec![root_node],
            max_symlink_depth: config.max_symlink_depth,
        })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Whether the archive is still present on disk.
    pub fn is_valid(&self) -> bool {
        self.store.is_present()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Children of a directory in name order; empty for files.
    pub fn children(&mut self, id: NodeId) -> StoreResult<Vec<NodeId>> {
        self.materialize(id)?;
        Ok(match &self.nodes[id].kind {
            NodeKind::Directory(dir) => dir
                .children
                .as_ref()
                .map(|c| c.values().copied().collect())
                .unwrap_or_default(),
            NodeKind::File(_) => Vec::new(),
        })
    }

    /// Look up one child by name.
    pub fn child(&mut self, id: NodeId, name: &str) -> StoreResult<Option<NodeId>> {
        self.materialize(id)?;
        Ok(match &self.nodes[id].kind {
            NodeKind::Directory(dir) => dir.children.as_ref().and_then(|c| c.get(name).copied()),
            NodeKind::File(_) => None,
        })
    }

    /// Path of a node below the archive root, joined by `/`.
    pub fn complete_path(&self, id: NodeId) -> String {
        let mut names = Vec::new();
        let mut current = id;
        while let Some(parent) = self.nodes[current].parent {
            names.push(self.nodes[current].name());
            current = parent;
        }
        names.reverse();
        names.join("/")
    }

    /// Top tree of the snapshot containing `id`, or the archive root.
    pub fn snapshot_root_of(&self, id: NodeId) -> NodeId {
        let mut current = id;
        loop {
            let node = &self.nodes[current];
            if node.as_directory().is_some_and(|d| d.is_snapshot_root()) {
                return current;
            }
            match node.parent {
                Some(parent) => current = parent,
                None => return ROOT_NODE,
            }
        }
    }

    /// Re-derive a directory's children if its backing refs moved.
    ///
    /// Old children stay allocated, so open file handles remain usable.
    pub fn reload(&mut self, id: NodeId) -> StoreResult<()> {
        let NodeKind::Directory(dir) = &self.nodes[id].kind else {
            return Ok(());
        };
        let Some(children) = &dir.children else {
            return Ok(());
        };

        let stale = match &dir.source {
            DirectorySource::ArchiveRoot => {
                let branches = self.store.branches()?;
                !children.keys().eq(branches.keys())
            }
            DirectorySource::Branch { name, tip } => self.store.branch(name)? != *tip,
            DirectorySource::Tree { .. } => false,
        };

        if stale {
            let added = self.store.refresh_packs()?;
            debug!(node = id, new_packs = added, "directory changed, re-deriving children");
            if let NodeKind::Directory(dir) = &mut self.nodes[id].kind {
                dir.children = None;
            }
        }
        Ok(())
    }

    /// Size of a file's content; directories report zero.
    pub fn file_size(&mut self, id: NodeId) -> StoreResult<u64> {
        let store = &self.store;
        match &mut self.nodes[id].kind {
            NodeKind::File(file) => file.size(store),
            NodeKind::Directory(_) => Ok(0),
        }
    }

    pub fn seek(&mut self, id: NodeId, offset: u64) -> StoreResult<()> {
        let (store, file) = self.file_mut(id)?;
        file.seek(store, offset)
    }

    /// Next piece of content, at most `max` bytes; `None` at the end.
    pub fn read(&mut self, id: NodeId, max: usize) -> StoreResult<Option<Bytes>> {
        let (store, file) = self.file_mut(id)?;
        file.read(store, max)
    }

    fn file_mut(&mut self, id: NodeId) -> StoreResult<(&ObjectStore, &mut File)> {
        let store = &self.store;
        let node = &mut self.nodes[id];
        match &mut node.kind {
            NodeKind::File(file) => Ok((store, file)),
            NodeKind::Directory(_) => Err(StoreError::NotAFile(node.attrs.name.clone())),
        }
    }

    fn alloc(&mut self, parent: NodeId, attrs: NodeAttrs, kind: NodeKind) -> NodeId {
        self.nodes.push(Node {
            attrs,
            parent: Some(parent),
            kind,
        });
        self.nodes.len() - 1
    }

    fn materialize(&mut self, id: NodeId) -> StoreResult<()> {
        let source = match &self.nodes[id].kind {
            NodeKind::Directory(dir) if dir.children.is_none() => dir.source.clone(),
            _ => return Ok(()),
        };

        let (source, children) = match source {
            DirectorySource::ArchiveRoot => (DirectorySource::ArchiveRoot, self.branch_nodes(id)?),
            DirectorySource::Branch { name, .. } => {
                let (tip, children) = self.snapshot_nodes(id, &name)?;
                (DirectorySource::Branch { name, tip }, children)
            }
            DirectorySource::Tree { id: tree, snapshot_root } => (
                DirectorySource::Tree { id: tree, snapshot_root },
                self.tree_nodes(id, &tree)?,
            ),
        };

        if let NodeKind::Directory(dir) = &mut self.nodes[id].kind {
            dir.source = source;
            dir.children = Some(children);
        }
        Ok(())
    }

    fn branch_nodes(&mut self, parent: NodeId) -> StoreResult<BTreeMap<String, NodeId>> {
        let owner = self.nodes[parent].attrs.clone();
        let mut children = BTreeMap::new();

        for (name, tip) in self.store.branches()? {
            let mtime = match self.store.read_commit(&tip) {
                Ok(commit) => commit.commit_time,
                Err(e) => {
                    warn!(branch = %name, "cannot read branch tip {}: {}", tip, e);
                    owner.mtime
                }
            };
            let attrs = NodeAttrs {
                name: name.clone(),
                mode: S_IFDIR | 0o755,
                mtime,
                atime: mtime,
                uid: owner.uid,
                gid: owner.gid,
                mime_type: MIME_DIRECTORY.to_string(),
                symlink_target: None,
            };
            let source = DirectorySource::Branch {
                name: name.clone(),
                tip: None,
            };
            let id = self.alloc(parent, attrs, NodeKind::Directory(Directory::new(source)));
            children.insert(name, id);
        }
        Ok(children)
    }

    /// One directory per commit along the first-parent chain, newest first.
    fn snapshot_nodes(
        &mut self,
        parent: NodeId,
        branch: &str,
    ) -> StoreResult<(Option<ObjectId>, BTreeMap<String, NodeId>)> {
        let owner = self.nodes[parent].attrs.clone();
        let mut children = BTreeMap::new();
        let Some(tip) = self.store.branch(branch)? else {
            return Ok((None, children));
        };

        let mut seen = HashSet::new();
        let mut next = Some(tip);
        let mut newest: Option<(String, i64)> = None;
        while let Some(commit_id) = next {
            if !seen.insert(commit_id) {
                warn!(branch, "commit {} repeats in history", commit_id);
                break;
            }
            let commit = self.store.read_commit(&commit_id)?;
            next = commit.parents.first().copied();

            let name = commit_name(commit.commit_time, &children);
            let attrs = NodeAttrs {
                name: name.clone(),
                mode: S_IFDIR | 0o755,
                mtime: commit.commit_time,
                atime: commit.commit_time,
                uid: owner.uid,
                gid: owner.gid,
                mime_type: MIME_DIRECTORY.to_string(),
                symlink_target: None,
            };
            let source = DirectorySource::Tree {
                id: commit.tree,
                snapshot_root: true,
            };
            let id = self.alloc(parent, attrs, NodeKind::Directory(Directory::new(source)));
            if newest.is_none() {
                newest = Some((name.clone(), commit.commit_time));
            }
            children.insert(name, id);
        }

        if let Some((target, time)) = newest {
            let attrs = NodeAttrs {
                name: LATEST.to_string(),
                mode: S_IFLNK | 0o777,
                mtime: time,
                atime: time,
                uid: owner.uid,
                gid: owner.gid,
                mime_type: MIME_SYMLINK.to_string(),
                symlink_target: Some(target.clone()),
            };
            let file = File::new(FileContent::Inline(Bytes::from(target)), None);
            let id = self.alloc(parent, attrs, NodeKind::File(file));
            children.insert(LATEST.to_string(), id);
        }

        debug!(branch, tip = %tip.short_hex(), snapshots = seen.len(), "listed branch");
        Ok((Some(tip), children))
    }

    fn tree_nodes(&mut self, parent: NodeId, tree: &ObjectId) -> StoreResult<BTreeMap<String, NodeId>> {
        let entries = self.store.read_tree(tree)?;
        let inherited = self.nodes[parent].attrs.clone();

        let mut records = match entries.iter().find(|e| e.name == BUPM) {
            Some(bupm) => self.read_metadata(bupm)?,
            None => Vec::new(),
        }
        .into_iter();
        // The first record describes the directory itself.
        records.next();

        let mut children = BTreeMap::new();
        for entry in &entries {
            if entry.name == BUPM || entry.is_gitlink() {
                continue;
            }
            let (name, shape) = demangle(entry);
            let (meta, kind) = match shape {
                EntryShape::Directory => {
                    let meta = match self.subtree_metadata(&entry.id) {
                        Ok(meta) => meta,
                        Err(e) => {
                            warn!("no metadata for directory {}: {}", name, e);
                            None
                        }
                    };
                    let source = DirectorySource::Tree {
                        id: entry.id,
                        snapshot_root: false,
                    };
                    (meta, NodeKind::Directory(Directory::new(source)))
                }
                EntryShape::Chunked => {
                    // Recorded size saves walking the whole chunk tree.
                    let meta = records.next();
                    let size = meta.as_ref().and_then(|m| m.size);
                    (meta, NodeKind::File(File::new(FileContent::Chunked(entry.id), size)))
                }
                EntryShape::Blob => (
                    records.next(),
                    NodeKind::File(File::new(FileContent::Blob(entry.id), None)),
                ),
            };

            let attrs = self.entry_attrs(name.clone(), entry, shape, meta, &inherited)?;
            let id = self.alloc(parent, attrs, kind);
            children.insert(name, id);
        }
        Ok(children)
    }

    fn entry_attrs(
        &self,
        name: String,
        entry: &TreeEntry,
        shape: EntryShape,
        meta: Option<Metadata>,
        inherited: &NodeAttrs,
    ) -> StoreResult<NodeAttrs> {
        let is_dir = shape == EntryShape::Directory;
        let fallback_mode = match shape {
            EntryShape::Directory => S_IFDIR | 0o755,
            EntryShape::Chunked => S_IFREG | 0o644,
            EntryShape::Blob if entry.is_symlink() => S_IFLNK | 0o777,
            EntryShape::Blob => entry.mode,
        };
        let mode = match &meta {
            Some(m) if m.mode != 0 && ((m.mode & S_IFMT == S_IFDIR) == is_dir) => m.mode,
            _ => fallback_mode,
        };

        let symlink_target = if entry.is_symlink() {
            match meta.as_ref().and_then(|m| m.symlink_target.clone()) {
                Some(target) => Some(target),
                None => Some(String::from_utf8_lossy(&self.store.read_blob(&entry.id)?.data).into_owned()),
            }
        } else {
            None
        };

        let mime_type = if is_dir {
            MIME_DIRECTORY.to_string()
        } else if symlink_target.is_some() {
            MIME_SYMLINK.to_string()
        } else {
            Node::guess_mime(&name)
        };

        let (uid, gid, mtime, atime) = match &meta {
            Some(m) => (m.uid, m.gid, m.mtime, m.atime),
            None => (inherited.uid, inherited.gid, inherited.mtime, inherited.atime),
        };

        Ok(NodeAttrs {
            name,
            mode,
            mtime,
            atime,
            uid,
            gid,
            mime_type,
            symlink_target,
        })
    }

    /// The record a subdirectory's own `.bupm` holds for itself.
    fn subtree_metadata(&self, tree: &ObjectId) -> StoreResult<Option<Metadata>> {
        let entries = self.store.read_tree(tree)?;
        match entries.iter().find(|e| e.name == BUPM) {
            Some(bupm) => Ok(self.read_metadata(bupm)?.into_iter().next()),
            None => Ok(None),
        }
    }

    fn read_metadata(&self, bupm: &TreeEntry) -> StoreResult<Vec<Metadata>> {
        let content = if bupm.is_tree() {
            FileContent::Chunked(bupm.id)
        } else {
            FileContent::Blob(bupm.id)
        };
        let data = File::new(content, None).read_all(&self.store)?;
        Ok(MetadataReader::new(&data).collect())
    }
}
