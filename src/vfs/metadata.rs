//! Decoder for bup's per-directory `.bupm` metadata stream.
//!
//! The stream is a sequence of entries. Each entry is a list of records,
//! `vuint tag` followed by a `vuint`-length-prefixed payload, terminated by
//! tag 0. The first entry describes the directory itself, the following
//! ones describe the non-directory members in tree order.

use tracing::debug;

const TAG_END: u64 = 0;
const TAG_PATH: u64 = 1;
const TAG_COMMON_V1: u64 = 2;
const TAG_SYMLINK_TARGET: u64 = 3;
const TAG_COMMON_V2: u64 = 9;
const TAG_COMMON_V3: u64 = 10;

/// Attributes recovered from one metadata entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub user: String,
    pub group: String,
    pub atime: i64,
    pub mtime: i64,
    pub size: Option<u64>,
    pub symlink_target: Option<String>,
}

/// Read an unsigned little-endian base-128 integer.
pub fn read_vuint(data: &[u8], pos: &mut usize) -> Option<u64> {
    let mut value = 0u64;
    let mut shift = 0;
    loop {
        let byte = *data.get(*pos)?;
        *pos += 1;
        if shift > 63 {
            return None;
        }
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
    }
}

/// Read a signed integer: the first byte carries a continuation bit, a
/// sign bit and six magnitude bits; later bytes carry seven bits each.
pub fn read_vint(data: &[u8], pos: &mut usize) -> Option<i64> {
    let first = *data.get(*pos)?;
    *pos += 1;
    let negative = first & 0x40 != 0;
    let mut magnitude = (first & 0x3f) as u64;
    if first & 0x80 != 0 {
        let rest = read_vuint(data, pos)?;
        magnitude |= rest.checked_shl(6)?;
    }
    let magnitude = i64::try_from(magnitude).ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

fn read_bvec<'a>(data: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let len = usize::try_from(read_vuint(data, pos)?).ok()?;
    let end = pos.checked_add(len).filter(|&end| end <= data.len())?;
    let bytes = &data[*pos..end];
    *pos = end;
    Some(bytes)
}

/// Decode the "common" record: mode, owner, times and (v3) size.
fn parse_common(payload: &[u8], version: u64, meta: &mut Metadata) -> Option<()> {
    let mut pos = 0;
    let signed_ids = version == TAG_COMMON_V1;

    let unsigned_or_signed = |p: &mut usize| -> Option<u64> {
        if signed_ids {
            read_vint(payload, p).map(|v| v as u64)
        } else {
            read_vuint(payload, p)
        }
    };

    meta.mode = unsigned_or_signed(&mut pos)? as u32;
    meta.uid = unsigned_or_signed(&mut pos)? as u32;
    meta.user = String::from_utf8_lossy(read_bvec(payload, &mut pos)?).into_owned();
    meta.gid = unsigned_or_signed(&mut pos)? as u32;
    meta.group = String::from_utf8_lossy(read_bvec(payload, &mut pos)?).into_owned();
    let _rdev = unsigned_or_signed(&mut pos)?;
    meta.atime = read_vint(payload, &mut pos)?;
    let _atime_ns = read_vuint(payload, &mut pos)?;
    meta.mtime = read_vint(payload, &mut pos)?;
    let _mtime_ns = read_vuint(payload, &mut pos)?;
    let _ctime = read_vint(payload, &mut pos)?;
    let _ctime_ns = read_vuint(payload, &mut pos)?;
    if version == TAG_COMMON_V3 {
        let size = read_vint(payload, &mut pos)?;
        meta.size = u64::try_from(size).ok();
    }
    Some(())
}

/// Sequential reader over a `.bupm` stream.
pub struct MetadataReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> MetadataReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        MetadataReader { data, pos: 0 }
    }
}

impl Iterator for MetadataReader<'_> {
    type Item = Metadata;

    /// Yields entries until the stream ends or stops making sense.
    fn next(&mut self) -> Option<Metadata> {
        if self.pos >= self.data.len() {
            return None;
        }

        let mut meta = Metadata::default();
        loop {
            let tag = read_vuint(self.data, &mut self.pos)?;
            if tag == TAG_END {
                return Some(meta);
            }
            let payload = read_bvec(self.data, &mut self.pos)?;
            match tag {
                TAG_COMMON_V1 | TAG_COMMON_V2 | TAG_COMMON_V3 => {
                    if parse_common(payload, tag, &mut meta).is_none() {
                        debug!(tag, "undecodable common metadata record");
                    }
                }
                TAG_SYMLINK_TARGET => {
                    meta.symlink_target = Some(String::from_utf8_lossy(payload).into_owned());
                }
                TAG_PATH => {}
                // ACLs, attributes, xattrs and hardlink targets are not projected.
                _ => {}
            }
        }
    }
}
