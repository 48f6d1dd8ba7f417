use flate2::read::ZlibDecoder;
use memmap2::Mmap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use super::object::{ObjectKind, RawObject};
use super::{OID_LEN, ObjectId};
use crate::error::{StoreError, StoreResult};

/// Magic bytes of a version 2 pack index.
const IDX_MAGIC: [u8; 4] = [0xff, b't', b'O', b'c'];
const IDX_HEADER: usize = 8;
const FAN_OUT_LEN: usize = 256 * 4;
const PACK_HEADER: usize = 12;

/// Pack entry type codes for deltified objects.
const OFS_DELTA: u8 = 6;
const REF_DELTA: u8 = 7;

/// Longest delta chain we are willing to walk.
const MAX_DELTA_DEPTH: usize = 4096;
/// Upper bound on zlib expansion used to size inflate buffers.
const MAX_INFLATE_RATIO: u64 = 16;

/// A memory-mapped git pack index, version 2.
///
/// Layout: magic, version, 256-entry fan-out table, sorted object names,
/// CRC32s, 31-bit offsets (MSB set means "index into the 64-bit table"),
/// 64-bit offsets, pack checksum, index checksum.
pub struct PackIndex {
    map: Mmap,
    count: usize,
    path: PathBuf,
}

impl PackIndex {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let file = File::open(path)?;
        // SAFETY: pack indexes are immutable once written; bup and git only
        // ever create new files and rename them into place.
        let map = unsafe { Mmap::map(&file)? };

        let corrupt = |reason: &str| StoreError::IndexCorrupted {
            path: path.display().to_string(),
            reason: reason.to_string(),
        };

        if map.len() < IDX_HEADER + FAN_OUT_LEN {
            return Err(corrupt("too short"));
        }
        if map[0..4] != IDX_MAGIC {
            return Err(corrupt("bad magic (only version 2 indexes are supported)"));
        }
        let version = read_u32(&map, 4);
        if version != 2 {
            return Err(corrupt(&format!("unsupported version {version}")));
        }

        let count = read_u32(&map, IDX_HEADER + 255 * 4) as usize;
        let minimum = IDX_HEADER + FAN_OUT_LEN + count * (OID_LEN + 4 + 4) + 2 * OID_LEN;
        if map.len() < minimum {
            return Err(corrupt("truncated object tables"));
        }

        Ok(PackIndex {
            map,
            count,
            path: path.to_path_buf(),
        })
    }

    pub fn object_count(&self) -> usize {
        self.count
    }

    fn fan_out(&self, slot: usize) -> usize {
        read_u32(&self.map, IDX_HEADER + slot * 4) as usize
    }

    fn name_at(&self, i: usize) -> &[u8] {
        let start = IDX_HEADER + FAN_OUT_LEN + i * OID_LEN;
        &self.map[start..start + OID_LEN]
    }

    fn offset_at(&self, i: usize) -> StoreResult<u64> {
        let offsets = IDX_HEADER + FAN_OUT_LEN + self.count * (OID_LEN + 4);
        let small = read_u32(&self.map, offsets + i * 4);
        if small & 0x8000_0000 == 0 {
            return Ok(small as u64);
        }

        let large = offsets + self.count * 4 + (small & 0x7fff_ffff) as usize * 8;
        if large + 8 > self.map.len() {
            return Err(StoreError::IndexCorrupted {
                path: self.path.display().to_string(),
                reason: format!("64-bit offset slot {} out of range", small & 0x7fff_ffff),
            });
        }
        Ok(u64::from_be_bytes(
            self.map[large..large + 8].try_into().unwrap_or([0; 8]),
        ))
    }

    /// Pack offset of `id`, if this index knows it.
    pub fn lookup(&self, id: &ObjectId) -> StoreResult<Option<u64>> {
        let first = id.as_bytes()[0] as usize;
        let start = if first == 0 { 0 } else { self.fan_out(first - 1) };
        let end = self.fan_out(first).min(self.count);

        let (mut lo, mut hi) = (start, end);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.name_at(mid).cmp(id.as_bytes().as_slice()) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return self.offset_at(mid).map(Some),
            }
        }
        Ok(None)
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// Where a deltified entry finds its base.
#[derive(Debug, Clone, Copy)]
enum DeltaBase {
    None,
    Offset(u64),
    Ref(ObjectId),
}

/// Decoded entry header.
#[derive(Debug)]
struct EntryHeader {
    type_code: u8,
    size: u64,
    data_start: usize,
    base: DeltaBase,
}

/// A memory-mapped pack file with its index.
pub struct PackFile {
    map: Mmap,
    index: PackIndex,
    name: String,
}

impl PackFile {
    /// Open `pack-*.pack` together with the `.idx` next to it.
    pub fn open(pack_path: &Path) -> StoreResult<Self> {
        let index = PackIndex::open(&pack_path.with_extension("idx"))?;
        let file = File::open(pack_path)?;
        // SAFETY: see PackIndex::open.
        let map = unsafe { Mmap::map(&file)? };
        let name = pack_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if map.len() < PACK_HEADER || &map[0..4] != b"PACK" {
            return Err(StoreError::CorruptPack {
                pack: name,
                offset: 0,
                reason: "bad magic".into(),
            });
        }
        let version = read_u32(&map, 4);
        if version != 2 && version != 3 {
            return Err(StoreError::CorruptPack {
                pack: name,
                offset: 4,
                reason: format!("unsupported version {version}"),
            });
        }

        Ok(PackFile { map, index, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn object_count(&self) -> usize {
        self.index.object_count()
    }

    pub fn contains(&self, id: &ObjectId) -> StoreResult<bool> {
        Ok(self.index.lookup(id)?.is_some())
    }

    /// Read and fully resolve an object. `Ok(None)` if it is not in this pack.
    pub fn read(&self, id: &ObjectId) -> StoreResult<Option<RawObject>> {
        match self.index.lookup(id)? {
            Some(offset) => self.read_at(offset).map(Some),
            None => Ok(None),
        }
    }

    /// Type and inflated size of an object without reconstructing its body.
    pub fn header(&self, id: &ObjectId) -> StoreResult<Option<(ObjectKind, u64)>> {
        let Some(offset) = self.index.lookup(id)? else {
            return Ok(None);
        };

        let first = self.entry_header(offset)?;
        let size = if first.type_code == OFS_DELTA || first.type_code == REF_DELTA {
            let head = self.inflate_prefix(offset, &first, 32)?;
            let mut pos = 0;
            let _base_size = delta_varint(&head, &mut pos)?;
            delta_varint(&head, &mut pos)?
        } else {
            first.size
        };

        let mut current = first;
        let mut at = offset;
        for _ in 0..MAX_DELTA_DEPTH {
            match current.base {
                DeltaBase::None => {
                    let kind = self.kind_of(at, current.type_code)?;
                    return Ok(Some((kind, size)));
                }
                _ => {
                    at = self.base_offset(at, &current)?;
                    current = self.entry_header(at)?;
                }
            }
        }
        Err(self.corrupt(offset, "delta chain too deep"))
    }

    fn read_at(&self, offset: u64) -> StoreResult<RawObject> {
        let mut deltas = Vec::new();
        let mut at = offset;

        let base = loop {
            if deltas.len() > MAX_DELTA_DEPTH {
                return Err(self.corrupt(offset, "delta chain too deep"));
            }
            let header = self.entry_header(at)?;
            let body = self.inflate(at, &header)?;
            match header.base {
                DeltaBase::None => {
                    let kind = self.kind_of(at, header.type_code)?;
                    break RawObject::new(kind, body);
                }
                _ => {
                    deltas.push(body);
                    at = self.base_offset(at, &header)?;
                }
            }
        };

        let mut data = base.data.to_vec();
        while let Some(delta) = deltas.pop() {
            data = apply_delta(&data, &delta)?;
        }
        Ok(RawObject::new(base.kind, data))
    }

    fn kind_of(&self, offset: u64, type_code: u8) -> StoreResult<ObjectKind> {
        ObjectKind::from_pack_type(type_code)
            .ok_or_else(|| self.corrupt(offset, &format!("unknown entry type {type_code}")))
    }

    fn base_offset(&self, offset: u64, header: &EntryHeader) -> StoreResult<u64> {
        match header.base {
            DeltaBase::Offset(base) => Ok(base),
            DeltaBase::Ref(base_id) => self
                .index
                .lookup(&base_id)?
                .ok_or(StoreError::MissingObject(base_id)),
            DeltaBase::None => Err(self.corrupt(offset, "entry is not a delta")),
        }
    }

    fn entry_header(&self, offset: u64) -> StoreResult<EntryHeader> {
        let data = &self.map[..];
        let mut pos = offset as usize;
        let next = |pos: &mut usize| -> StoreResult<u8> {
            let byte = *data
                .get(*pos)
                .ok_or_else(|| self.corrupt(offset, "entry header past end of pack"))?;
            *pos += 1;
            Ok(byte)
        };

        if pos < PACK_HEADER {
            return Err(self.corrupt(offset, "offset inside pack header"));
        }

        let mut byte = next(&mut pos)?;
        let type_code = (byte >> 4) & 0x07;
        let mut size = (byte & 0x0f) as u64;
        let mut shift = 4;
        while byte & 0x80 != 0 {
            byte = next(&mut pos)?;
            if shift > 57 {
                return Err(self.corrupt(offset, "entry size overflow"));
            }
            size |= ((byte & 0x7f) as u64) << shift;
            shift += 7;
        }

        let base = match type_code {
            OFS_DELTA => {
                let mut byte = next(&mut pos)?;
                let mut distance = (byte & 0x7f) as u64;
                while byte & 0x80 != 0 {
                    byte = next(&mut pos)?;
                    distance = ((distance + 1) << 7) | (byte & 0x7f) as u64;
                }
                if distance == 0 || distance > offset {
                    return Err(self.corrupt(offset, "delta base offset out of range"));
                }
                DeltaBase::Offset(offset - distance)
            }
            REF_DELTA => {
                if pos + OID_LEN > data.len() {
                    return Err(self.corrupt(offset, "truncated delta base name"));
                }
                let base_id = ObjectId::from_slice(&data[pos..pos + OID_LEN])?;
                pos += OID_LEN;
                DeltaBase::Ref(base_id)
            }
            _ => DeltaBase::None,
        };

        Ok(EntryHeader {
            type_code,
            size,
            data_start: pos,
            base,
        })
    }

    fn inflate(&self, offset: u64, header: &EntryHeader) -> StoreResult<Vec<u8>> {
        // The declared size is untrusted until inflation confirms it.
        let compressed = self.map.len().saturating_sub(header.data_start) as u64;
        let hint = header.size.min(compressed.saturating_mul(MAX_INFLATE_RATIO));
        let mut out = Vec::with_capacity(hint as usize);
        ZlibDecoder::new(&self.map[header.data_start..])
            .take(header.size)
            .read_to_end(&mut out)
            .map_err(|e| self.corrupt(offset, &format!("inflate failed: {e}")))?;
        if out.len() as u64 != header.size {
            return Err(self.corrupt(
                offset,
                &format!("inflated {} bytes, expected {}", out.len(), header.size),
            ));
        }
        Ok(out)
    }

    fn inflate_prefix(&self, offset: u64, header: &EntryHeader, limit: u64) -> StoreResult<Vec<u8>> {
        let mut out = Vec::new();
        ZlibDecoder::new(&self.map[header.data_start..])
            .take(limit.min(header.size))
            .read_to_end(&mut out)
            .map_err(|e| self.corrupt(offset, &format!("inflate failed: {e}")))?;
        Ok(out)
    }

    fn corrupt(&self, offset: u64, reason: &str) -> StoreError {
        StoreError::CorruptPack {
            pack: self.name.clone(),
            offset,
            reason: reason.to_string(),
        }
    }
}

/// Little-endian base-128 size used inside delta payloads.
fn delta_varint(data: &[u8], pos: &mut usize) -> StoreResult<u64> {
    let mut value = 0u64;
    let mut shift = 0;
    loop {
        let byte = *data
            .get(*pos)
            .ok_or_else(|| StoreError::InvalidDelta("truncated size".into()))?;
        *pos += 1;
        if shift > 63 {
            return Err(StoreError::InvalidDelta("size overflow".into()));
        }
        value |= ((byte & 0x7f) as u64) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
}

/// Apply a git delta (copy/insert instruction stream) to `base`.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> StoreResult<Vec<u8>> {
    let mut pos = 0;
    let base_size = delta_varint(delta, &mut pos)?;
    if base_size != base.len() as u64 {
        return Err(StoreError::InvalidDelta(format!(
            "base is {} bytes, delta expects {base_size}",
            base.len()
        )));
    }
    let result_size = delta_varint(delta, &mut pos)? as usize;
    // A copy op emits at most 64 KiB per delta byte, which bounds the result.
    let mut out = Vec::with_capacity(result_size.min(delta.len().saturating_mul(0x10000)));

    while pos < delta.len() {
        let op = delta[pos];
        pos += 1;

        if op & 0x80 != 0 {
            let mut fields = [0u64; 7];
            for (bit, field) in fields.iter_mut().enumerate() {
                if op & (1 << bit) != 0 {
                    *field = *delta
                        .get(pos)
                        .ok_or_else(|| StoreError::InvalidDelta("truncated copy".into()))?
                        as u64;
                    pos += 1;
                }
            }
            let copy_offset = (fields[0] | fields[1] << 8 | fields[2] << 16 | fields[3] << 24) as usize;
            let mut copy_len = (fields[4] | fields[5] << 8 | fields[6] << 16) as usize;
            if copy_len == 0 {
                copy_len = 0x10000;
            }
            let end = copy_offset
                .checked_add(copy_len)
                .filter(|&end| end <= base.len())
                .ok_or_else(|| StoreError::InvalidDelta("copy outside base".into()))?;
            out.extend_from_slice(&base[copy_offset..end]);
        } else if op != 0 {
            let end = pos + op as usize;
            if end > delta.len() {
                return Err(StoreError::InvalidDelta("truncated insert".into()));
            }
            out.extend_from_slice(&delta[pos..end]);
            pos = end;
        } else {
            return Err(StoreError::InvalidDelta("reserved opcode 0".into()));
        }
    }

    if out.len() != result_size {
        return Err(StoreError::InvalidDelta(format!(
            "produced {} bytes, expected {result_size}",
            out.len()
        )));
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::ZlibEncoder;
    use std::io::Write;

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn entry_header(type_code: u8, size: u64) -> Vec<u8> {
        let mut out = Vec::new();
        let mut byte = (type_code << 4) | (size & 0x0f) as u8;
        let mut rest = size >> 4;
        while rest != 0 {
            out.push(byte | 0x80);
            byte = (rest & 0x7f) as u8;
            rest >>= 7;
        }
        out.push(byte);
        out
    }

    fn ofs_distance(mut distance: u64) -> Vec<u8> {
        let mut out = vec![(distance & 0x7f) as u8];
        distance >>= 7;
        while distance != 0 {
            distance -= 1;
            out.insert(0, 0x80 | (distance & 0x7f) as u8);
            distance >>= 7;
        }
        out
    }

    pub(crate) enum TestEntry<'a> {
        Full(ObjectKind, &'a [u8]),
        /// Delta against the entry at the given position in the list.
        OfsDelta(usize, Vec<u8>),
    }

    /// Write `pack-test.pack` / `.idx` into `dir` and return the pack path.
    pub(crate) fn write_pack(dir: &Path, entries: &[(ObjectId, TestEntry<'_>)]) -> PathBuf {
        let mut pack = Vec::new();
        pack.extend_from_slice(b"PACK");
        pack.extend_from_slice(&2u32.to_be_bytes());
        pack.extend_from_slice(&(entries.len() as u32).to_be_bytes());

        let mut offsets = Vec::new();
        for (_, entry) in entries {
            let offset = pack.len() as u64;
            offsets.push(offset);
            match entry {
                TestEntry::Full(kind, body) => {
                    let code = match kind {
                        ObjectKind::Commit => 1,
                        ObjectKind::Tree => 2,
                        ObjectKind::Blob => 3,
                        ObjectKind::Tag => 4,
                    };
                    pack.extend(entry_header(code, body.len() as u64));
                    pack.extend(deflate(body));
                }
                TestEntry::OfsDelta(base, delta) => {
                    pack.extend(entry_header(OFS_DELTA, delta.len() as u64));
                    pack.extend(ofs_distance(offset - offsets[*base]));
                    pack.extend(deflate(delta));
                }
            }
        }
        pack.extend_from_slice(&[0u8; 20]);

        let mut sorted: Vec<(ObjectId, u64)> = entries
            .iter()
            .zip(&offsets)
            .map(|((id, _), offset)| (*id, *offset))
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));

        let mut idx = Vec::new();
        idx.extend_from_slice(&IDX_MAGIC);
        idx.extend_from_slice(&2u32.to_be_bytes());
        for slot in 0..256usize {
            let count = sorted
                .iter()
                .filter(|(id, _)| (id.as_bytes()[0] as usize) <= slot)
                .count() as u32;
            idx.extend_from_slice(&count.to_be_bytes());
        }
        for (id, _) in &sorted {
            idx.extend_from_slice(id.as_bytes());
        }
        for _ in &sorted {
            idx.extend_from_slice(&0u32.to_be_bytes());
        }
        for (_, offset) in &sorted {
            idx.extend_from_slice(&(*offset as u32).to_be_bytes());
        }
        idx.extend_from_slice(&[0u8; 40]);

        let pack_path = dir.join("pack-test.pack");
        std::fs::write(&pack_path, pack).unwrap();
        std::fs::write(dir.join("pack-test.idx"), idx).unwrap();
        pack_path
    }

    fn oid(byte: u8) -> ObjectId {
        ObjectId::from_bytes([byte; 20])
    }

    /// Delta that keeps the first `keep` bytes of the base and appends `tail`.
    fn prefix_delta(base_len: usize, keep: usize, tail: &[u8]) -> Vec<u8> {
        fn push_varint(mut v: usize, out: &mut Vec<u8>) {
            loop {
                let byte = (v & 0x7f) as u8;
                v >>= 7;
                if v == 0 {
                    out.push(byte);
                    return;
                }
                out.push(byte | 0x80);
            }
        }

        let mut delta = Vec::new();
        push_varint(base_len, &mut delta);
        push_varint(keep + tail.len(), &mut delta);
        delta.push(0x80 | 0x10);
        delta.push(keep as u8);
        delta.push(tail.len() as u8);
        delta.extend_from_slice(tail);
        delta
    }

    #[test]
    fn test_read_full_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_pack(
            dir.path(),
            &[
                (oid(0x10), TestEntry::Full(ObjectKind::Blob, b"first blob")),
                (oid(0x80), TestEntry::Full(ObjectKind::Blob, &[7u8; 300])),
            ],
        );
        let pack = PackFile::open(&path).unwrap();
        assert_eq!(pack.object_count(), 2);

        let first = pack.read(&oid(0x10)).unwrap().unwrap();
        assert_eq!(first.kind, ObjectKind::Blob);
        assert_eq!(&first.data[..], b"first blob");

        let second = pack.read(&oid(0x80)).unwrap().unwrap();
        assert_eq!(second.data.len(), 300);
        assert_eq!(pack.header(&oid(0x80)).unwrap(), Some((ObjectKind::Blob, 300)));

        assert!(pack.read(&oid(0x55)).unwrap().is_none());
        assert!(!pack.contains(&oid(0x55)).unwrap());
    }

    #[test]
    fn test_read_ofs_delta_chain() {
        let dir = tempfile::tempdir().unwrap();
        let base = b"hello, world";
        let path = write_pack(
            dir.path(),
            &[
                (oid(0x20), TestEntry::Full(ObjectKind::Blob, base)),
                (oid(0x30), TestEntry::OfsDelta(0, prefix_delta(12, 5, b" there"))),
                (oid(0x40), TestEntry::OfsDelta(1, prefix_delta(11, 11, b"!"))),
            ],
        );
        let pack = PackFile::open(&path).unwrap();

        let once = pack.read(&oid(0x30)).unwrap().unwrap();
        assert_eq!(&once.data[..], b"hello there");

        let twice = pack.read(&oid(0x40)).unwrap().unwrap();
        assert_eq!(twice.kind, ObjectKind::Blob);
        assert_eq!(&twice.data[..], b"hello there!");
        assert_eq!(pack.header(&oid(0x40)).unwrap(), Some((ObjectKind::Blob, 12)));
    }

    #[test]
    fn test_apply_delta_rejects_wrong_base() {
        let delta = prefix_delta(10, 5, b"x");
        assert!(apply_delta(b"short", &delta).is_err());
    }

    #[test]
    fn test_apply_delta_rejects_oversized_result() {
        let delta = [0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x3f];
        assert!(matches!(apply_delta(&[], &delta), Err(StoreError::InvalidDelta(_))));
    }

    #[test]
    fn test_open_rejects_bad_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pack-bad.idx"), b"garbage").unwrap();
        std::fs::write(dir.path().join("pack-bad.pack"), b"PACK").unwrap();
        assert!(PackFile::open(&dir.path().join("pack-bad.pack")).is_err());
    }
}
