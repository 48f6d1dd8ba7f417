//! Read-only access to a git-format object store, as written by bup.
//!
//! Objects are looked up in the memory-mapped pack files first (bup writes
//! everything into packs) and then as loose objects. Inflated objects pass
//! through a bounded LRU cache.

pub mod loose;
pub mod object;
pub mod oid;
pub mod pack;
pub mod refs;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::cache::ObjectCache;
use crate::error::{StoreError, StoreResult};

pub use object::{Commit, ObjectKind, RawObject, TreeEntry};
pub use oid::{OID_LEN, ObjectId};
pub use pack::PackFile;

/// Objects larger than this bypass the cache.
const MAX_CACHED_OBJECT: usize = 1024 * 1024;

pub struct ObjectStore {
    git_dir: PathBuf,
    objects_dir: PathBuf,
    packs: Vec<PackFile>,
    pack_paths: HashSet<PathBuf>,
    cache: ObjectCache,
}

impl ObjectStore {
    /// Open the store in `git_dir`, which must contain `objects/` and `refs/`.
    pub fn open(git_dir: &Path, cache_capacity: usize) -> StoreResult<Self> {
        let objects_dir = git_dir.join("objects");
        if !objects_dir.is_dir() || !git_dir.join("refs").is_dir() {
            return Err(StoreError::InvalidRepository(format!(
                "{} has no objects/ and refs/ directories",
                git_dir.display()
            )));
        }

        let mut store = ObjectStore {
            git_dir: git_dir.to_path_buf(),
            objects_dir,
            packs: Vec::new(),
            pack_paths: HashSet::new(),
            cache: ObjectCache::new(cache_capacity),
        };
        let loaded = store.refresh_packs()?;
        debug!(git_dir = %git_dir.display(), packs = loaded, "opened object store");
        Ok(store)
    }

    /// Whether the store is still present on disk.
    pub fn is_present(&self) -> bool {
        self.objects_dir.is_dir() && self.git_dir.join("refs").is_dir()
    }

    pub fn pack_count(&self) -> usize {
        self.packs.len()
    }

    /// Map any pack files that appeared since the last scan. Unreadable
    /// packs are skipped with a warning. Returns the number of new packs.
    pub fn refresh_packs(&mut self) -> StoreResult<usize> {
        let pack_dir = self.objects_dir.join("pack");
        let entries = match std::fs::read_dir(&pack_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut added = 0;
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "pack") || self.pack_paths.contains(&path) {
                continue;
            }
            match PackFile::open(&path) {
                Ok(pack) => {
                    debug!(pack = pack.name(), objects = pack.object_count(), "mapped pack");
                    self.packs.push(pack);
                    self.pack_paths.insert(path);
                    added += 1;
                }
                Err(e) => warn!("skipping unreadable pack {:?}: {}", path, e),
            }
        }
        Ok(added)
    }

    /// Read an object, failing with `MissingObject` if no source has it.
    pub fn read(&self, id: &ObjectId) -> StoreResult<RawObject> {
        if let Some(object) = self.cache.get(id) {
            return Ok(object);
        }

        let mut found = None;
        for pack in &self.packs {
            if let Some(object) = pack.read(id)? {
                found = Some(object);
                break;
            }
        }
        let object = match found {
            Some(object) => object,
            None => loose::read_loose(&self.objects_dir, id)?.ok_or(StoreError::MissingObject(*id))?,
        };

        if object.data.len() <= MAX_CACHED_OBJECT {
            self.cache.put(*id, object.clone());
        }
        Ok(object)
    }

    /// Inflated size of an object without reading its whole body.
    pub fn object_size(&self, id: &ObjectId) -> StoreResult<u64> {
        if let Some(object) = self.cache.get(id) {
            return Ok(object.data.len() as u64);
        }
        for pack in &self.packs {
            if let Some((_, size)) = pack.header(id)? {
                return Ok(size);
            }
        }
        loose::loose_header(&self.objects_dir, id)?
            .map(|(_, size)| size)
            .ok_or(StoreError::MissingObject(*id))
    }

    pub fn read_blob(&self, id: &ObjectId) -> StoreResult<RawObject> {
        self.read(id)?.expect_kind(id, ObjectKind::Blob)
    }

    pub fn read_commit(&self, id: &ObjectId) -> StoreResult<Commit> {
        let object = self.read(id)?.expect_kind(id, ObjectKind::Commit)?;
        Commit::parse(id, &object.data)
    }

    pub fn read_tree(&self, id: &ObjectId) -> StoreResult<Vec<TreeEntry>> {
        let object = self.read(id)?.expect_kind(id, ObjectKind::Tree)?;
        object::parse_tree(id, &object.data)
    }

    /// All branch heads, keyed by short branch name.
    pub fn branches(&self) -> StoreResult<BTreeMap<String, ObjectId>> {
        refs::read_branches(&self.git_dir)
    }

    pub fn branch(&self, name: &str) -> StoreResult<Option<ObjectId>> {
        refs::read_branch(&self.git_dir, name)
    }
}
