//! Seek/read over reconstructed file content.

use bytes::{Bytes, BytesMut};

use super::node::{Chunk, File, FileContent};
use crate::error::{StoreError, StoreResult};
use crate::store::{ObjectId, ObjectStore};

/// Deepest hashsplit fan-out we expect; guards against cyclic trees.
const MAX_CHUNK_TREE_DEPTH: usize = 32;

/// Flatten a hashsplit tree into positioned leaves.
///
/// Entries are named by their hexadecimal offset relative to the enclosing
/// subtree. Positions are recomputed from actual leaf sizes so that a
/// misnamed entry cannot produce overlapping chunks.
pub fn chunk_table(store: &ObjectStore, tree: &ObjectId) -> StoreResult<Vec<Chunk>> {
    let mut chunks = Vec::new();
    let mut position = 0u64;
    collect_chunks(store, tree, &mut position, &mut chunks, 0)?;
    Ok(chunks)
}

fn collect_chunks(
    store: &ObjectStore,
    tree: &ObjectId,
    position: &mut u64,
    out: &mut Vec<Chunk>,
    depth: usize,
) -> StoreResult<()> {
    if depth > MAX_CHUNK_TREE_DEPTH {
        return Err(StoreError::CorruptObject {
            id: *tree,
            reason: "chunk tree nested too deeply".into(),
        });
    }

    let mut entries = store.read_tree(tree)?;
    entries.sort_by_key(|e| u64::from_str_radix(&e.name, 16).unwrap_or(u64::MAX));

    for entry in entries {
        if entry.is_tree() {
            collect_chunks(store, &entry.id, position, out, depth + 1)?;
        } else {
            let len = store.object_size(&entry.id)?;
            out.push(Chunk {
                start: *position,
                len,
                id: entry.id,
            });
            *position += len;
        }
    }
    Ok(())
}

impl File {
    /// Total length of the reconstructed content.
    pub fn size(&mut self, store: &ObjectStore) -> StoreResult<u64> {
        if let Some(size) = self.size {
            return Ok(size);
        }
        let size = match &self.content {
            FileContent::Inline(bytes) => bytes.len() as u64,
            FileContent::Blob(id) => store.object_size(id)?,
            FileContent::Chunked(_) => self
                .chunks(store)?
                .last()
                .map(|c| c.start + c.len)
                .unwrap_or(0),
        };
        self.size = Some(size);
        Ok(size)
    }

    fn chunks(&mut self, store: &ObjectStore) -> StoreResult<&[Chunk]> {
        if self.chunks.is_none() {
            let table = match &self.content {
                FileContent::Chunked(tree) => chunk_table(store, tree)?,
                _ => Vec::new(),
            };
            self.chunks = Some(table);
        }
        Ok(self.chunks.as_deref().unwrap_or(&[]))
    }

    /// Move the cursor. Positions past the end of content are rejected;
    /// seeking exactly to the end is allowed.
    pub fn seek(&mut self, store: &ObjectStore, offset: u64) -> StoreResult<()> {
        let size = self.size(store)?;
        if offset > size {
            return Err(StoreError::SeekOutOfRange { offset, size });
        }
        self.offset = offset;
        Ok(())
    }

    /// Read up to `max` bytes at the cursor and advance it.
    ///
    /// Returns `Ok(None)` once there is no more content; a successful read
    /// never returns an empty chunk.
    pub fn read(&mut self, store: &ObjectStore, max: usize) -> StoreResult<Option<Bytes>> {
        if max == 0 || self.offset >= self.size(store)? {
            return Ok(None);
        }

        let (start, piece) = self.load_window(store)?;
        let within = (self.offset - start) as usize;
        if within >= piece.len() {
            // Zero-length or inconsistent chunk; treat as end of content.
            return Ok(None);
        }
        let end = within + max.min(piece.len() - within);
        let out = piece.slice(within..end);
        self.offset += out.len() as u64;
        Ok(Some(out))
    }

    /// Read everything from the start, leaving the cursor at the end.
    pub fn read_all(&mut self, store: &ObjectStore) -> StoreResult<Bytes> {
        self.seek(store, 0)?;
        let mut out = BytesMut::new();
        while let Some(piece) = self.read(store, usize::MAX)? {
            out.extend_from_slice(&piece);
        }
        Ok(out.freeze())
    }

    /// The loaded piece of content covering the cursor.
    fn load_window(&mut self, store: &ObjectStore) -> StoreResult<(u64, Bytes)> {
        if let Some((start, piece)) = &self.window {
            if self.offset >= *start && self.offset < *start + piece.len() as u64 {
                return Ok((*start, piece.clone()));
            }
        }

        let offset = self.offset;
        let loaded = match &self.content {
            FileContent::Inline(bytes) => (0, bytes.clone()),
            FileContent::Blob(id) => {
                let id = *id;
                (0, store.read_blob(&id)?.data)
            }
            FileContent::Chunked(_) => {
                let chunks = self.chunks(store)?;
                let index = chunks.partition_point(|c| c.start + c.len <= offset);
                let chunk = chunks.get(index).cloned().ok_or(StoreError::SeekOutOfRange {
                    offset,
                    size: chunks.last().map(|c| c.start + c.len).unwrap_or(0),
                })?;
                let data = store.read_blob(&chunk.id)?.data;
                if data.len() as u64 != chunk.len {
                    return Err(StoreError::CorruptObject {
                        id: chunk.id,
                        reason: format!("chunk is {} bytes, expected {}", data.len(), chunk.len),
                    });
                }
                (chunk.start, data)
            }
        };

        self.window = Some(loaded.clone());
        Ok(loaded)
    }
}
