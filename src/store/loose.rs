use flate2::read::ZlibDecoder;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use super::object::{ObjectKind, RawObject, parse_loose_header};
use super::ObjectId;
use crate::error::{StoreError, StoreResult};

/// Headers are `<type> <decimal size>\0`, well under this many bytes.
const HEADER_PEEK: u64 = 64;

/// Location of a loose object: `objects/ab/cdef...`.
pub fn loose_path(objects_dir: &Path, id: &ObjectId) -> PathBuf {
    let hex = id.to_hex();
    objects_dir.join(&hex[..2]).join(&hex[2..])
}

fn open_loose(objects_dir: &Path, id: &ObjectId) -> StoreResult<Option<File>> {
    match File::open(loose_path(objects_dir, id)) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Read and inflate a loose object. `Ok(None)` if there is no such file.
pub fn read_loose(objects_dir: &Path, id: &ObjectId) -> StoreResult<Option<RawObject>> {
    let Some(file) = open_loose(objects_dir, id)? else {
        return Ok(None);
    };

    let mut inflated = Vec::new();
    ZlibDecoder::new(file)
        .read_to_end(&mut inflated)
        .map_err(|e| StoreError::CorruptObject {
            id: *id,
            reason: format!("inflate failed: {e}"),
        })?;

    let (kind, size, body_start) = parse_loose_header(id, &inflated)?;
    if inflated.len() - body_start != size {
        return Err(StoreError::CorruptObject {
            id: *id,
            reason: format!(
                "size mismatch: header says {size}, body has {}",
                inflated.len() - body_start
            ),
        });
    }
    inflated.drain(..body_start);
    Ok(Some(RawObject::new(kind, inflated)))
}

/// Type and size of a loose object, inflating only its header.
pub fn loose_header(objects_dir: &Path, id: &ObjectId) -> StoreResult<Option<(ObjectKind, u64)>> {
    let Some(file) = open_loose(objects_dir, id)? else {
        return Ok(None);
    };

    let mut head = Vec::new();
    ZlibDecoder::new(file)
        .take(HEADER_PEEK)
        .read_to_end(&mut head)
        .map_err(|e| StoreError::CorruptObject {
            id: *id,
            reason: format!("inflate failed: {e}"),
        })?;
    let (kind, size, _) = parse_loose_header(id, &head)?;
    Ok(Some((kind, size as u64)))
}
