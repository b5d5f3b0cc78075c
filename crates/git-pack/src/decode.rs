//! Decoding an incoming packfile stream.
//!
//! Unlike [`crate::pack::PackFile`], which opens an already-installed pack
//! alongside its `.idx`, this module decodes a pack that has just arrived
//! over the wire and has no index yet. It walks every entry once, resolves
//! deltas in a fixed-point pass (since `ref_delta` bases may appear later in
//! the pack, or not at all for a thin pack), verifies the trailer checksum,
//! and hands back enough information to install the pack into an object
//! store.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::bufread::ZlibDecoder;
use git_hash::hasher::Hasher;
use git_hash::{HashAlgorithm, ObjectId};
use git_object::ObjectType;
use git_utils::cancel::CancellationToken;

use crate::entry::parse_entry_header;
use crate::write::build_pack_index;
use crate::{PackEntryType, PackError, PACK_HEADER_SIZE, PACK_SIGNATURE, PACK_VERSION};

/// A single object produced by decoding a pack.
#[derive(Debug, Clone)]
pub struct ResolvedEntry {
    pub oid: ObjectId,
    pub obj_type: ObjectType,
    /// Byte offset of this entry's header within the pack.
    pub offset: u64,
    /// CRC32 of the entry's header and (still-deltified) compressed bytes.
    pub crc32: u32,
    pub data: Vec<u8>,
}

/// Everything needed to install a decoded pack.
pub struct DecodedPack {
    /// Every object physically stored in the pack, in offset order.
    pub entries: Vec<ResolvedEntry>,
    pub pack_checksum: ObjectId,
}

impl DecodedPack {
    /// Look up a resolved entry by OID.
    pub fn find(&self, oid: &ObjectId) -> Option<&ResolvedEntry> {
        self.entries.iter().find(|e| &e.oid == oid)
    }
}

struct RawEntry {
    offset: u64,
    crc32: u32,
    entry_type: PackEntryType,
    decompressed: Vec<u8>,
}

/// Decode every object in `data`, a complete in-memory pack (header through
/// trailer checksum).
///
/// `external_base` is consulted when a `ref_delta` entry's base is not found
/// inside this pack, to support thin packs whose bases live in the
/// surrounding object store. It should return `None` if the base is
/// genuinely unknown.
///
/// `token`, if given, is checked between entries during the initial walk and
/// between passes of delta resolution, so a large incoming pack can be
/// aborted without decompressing the rest of it.
pub fn decode_pack(
    data: &[u8],
    hash_algo: HashAlgorithm,
    external_base: impl Fn(&ObjectId) -> Option<(ObjectType, Vec<u8>)>,
    token: Option<&CancellationToken>,
) -> Result<DecodedPack, PackError> {
    let num_objects = validate_header(data)?;

    let digest_len = hash_algo.digest_len();
    if data.len() < PACK_HEADER_SIZE + digest_len {
        return Err(PackError::InvalidHeader("pack missing trailer".into()));
    }
    let trailer_start = data.len() - digest_len;
    let expected_checksum =
        ObjectId::from_bytes(&data[trailer_start..], hash_algo).map_err(PackError::Hash)?;

    let mut hasher = Hasher::new(hash_algo);
    hasher.update(&data[..trailer_start]);
    let actual_checksum = hasher.finalize().map_err(PackError::Hash)?;
    if actual_checksum != expected_checksum {
        return Err(PackError::ChecksumMismatch {
            expected: expected_checksum,
            actual: actual_checksum,
        });
    }

    let raw_entries = walk_entries(data, trailer_start as u64, num_objects, token)?;
    let entries = resolve_deltas(raw_entries, hash_algo, external_base, token)?;

    Ok(DecodedPack {
        entries,
        pack_checksum: actual_checksum,
    })
}

fn validate_header(data: &[u8]) -> Result<usize, PackError> {
    if data.len() < PACK_HEADER_SIZE {
        return Err(PackError::InvalidHeader("pack shorter than header".into()));
    }
    if &data[0..4] != PACK_SIGNATURE {
        return Err(PackError::InvalidHeader("bad PACK signature".into()));
    }
    let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if version != 2 && version != 3 {
        return Err(PackError::UnsupportedVersion(version));
    }
    let num_objects = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
    Ok(num_objects as usize)
}

/// Sequential walk: decompress each entry exactly once. Deltas are left
/// undecoded here — their base may not be known yet.
fn walk_entries(
    data: &[u8],
    trailer_start: u64,
    num_objects: usize,
    token: Option<&CancellationToken>,
) -> Result<Vec<RawEntry>, PackError> {
    let mut entries = Vec::with_capacity(num_objects);
    let mut offset = PACK_HEADER_SIZE as u64;

    for _ in 0..num_objects {
        if let Some(t) = token {
            t.check()?;
        }
        if offset >= trailer_start {
            return Err(PackError::InvalidHeader(
                "pack ended before declared object count".into(),
            ));
        }

        let header = parse_entry_header(&data[offset as usize..], offset)?;
        let compressed = &data[header.data_offset as usize..trailer_start as usize];

        let mut decoder = ZlibDecoder::new(compressed);
        let mut decompressed = Vec::with_capacity(header.uncompressed_size);
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|_| PackError::CorruptEntry(offset))?;
        if decompressed.len() != header.uncompressed_size {
            return Err(PackError::CorruptEntry(offset));
        }
        let consumed = decoder.total_in() as usize;

        let mut crc = crc32fast::Hasher::new();
        crc.update(&data[offset as usize..header.data_offset as usize]);
        crc.update(&compressed[..consumed]);

        entries.push(RawEntry {
            offset,
            crc32: crc.finalize(),
            entry_type: header.entry_type,
            decompressed,
        });

        offset = header.data_offset + consumed as u64;
    }

    if offset != trailer_start {
        return Err(PackError::InvalidHeader(
            "trailing garbage between last entry and checksum".into(),
        ));
    }

    Ok(entries)
}

/// Fixed-point delta resolution: repeatedly scan the still-undecoded
/// entries, applying any whose base has become available, until a full pass
/// makes no progress.
fn resolve_deltas(
    raw_entries: Vec<RawEntry>,
    hash_algo: HashAlgorithm,
    external_base: impl Fn(&ObjectId) -> Option<(ObjectType, Vec<u8>)>,
    token: Option<&CancellationToken>,
) -> Result<Vec<ResolvedEntry>, PackError> {
    let mut resolved: HashMap<u64, (ObjectType, Vec<u8>)> = HashMap::new();
    let mut oid_by_offset: HashMap<u64, ObjectId> = HashMap::new();
    let mut offset_by_oid: HashMap<ObjectId, u64> = HashMap::new();
    let mut pending: Vec<usize> = Vec::new();

    for (i, e) in raw_entries.iter().enumerate() {
        match e.entry_type {
            PackEntryType::Commit | PackEntryType::Tree | PackEntryType::Blob | PackEntryType::Tag => {
                let obj_type = e.entry_type.to_object_type().expect("non-delta type");
                let oid = hash_object(hash_algo, obj_type, &e.decompressed)?;
                oid_by_offset.insert(e.offset, oid);
                offset_by_oid.insert(oid, e.offset);
                resolved.insert(e.offset, (obj_type, e.decompressed.clone()));
            }
            PackEntryType::OfsDelta { .. } | PackEntryType::RefDelta { .. } => {
                pending.push(i);
            }
        }
    }

    loop {
        if let Some(t) = token {
            t.check()?;
        }
        let mut progressed = false;
        let mut still_pending = Vec::new();

        for i in pending {
            let e = &raw_entries[i];
            let base = match e.entry_type {
                PackEntryType::OfsDelta { base_offset } => {
                    resolved.get(&base_offset).cloned()
                }
                PackEntryType::RefDelta { base_oid } => {
                    if let Some(base_offset) = offset_by_oid.get(&base_oid) {
                        resolved.get(base_offset).cloned()
                    } else {
                        external_base(&base_oid)
                    }
                }
                _ => unreachable!("non-delta entries are never queued as pending"),
            };

            match base {
                Some((obj_type, base_data)) => {
                    let target_data = crate::delta::apply::apply_delta(&base_data, &e.decompressed)?;
                    let oid = hash_object(hash_algo, obj_type, &target_data)?;
                    oid_by_offset.insert(e.offset, oid);
                    offset_by_oid.insert(oid, e.offset);
                    resolved.insert(e.offset, (obj_type, target_data));
                    progressed = true;
                }
                None => still_pending.push(i),
            }
        }

        if still_pending.is_empty() {
            break;
        }
        if !progressed {
            let e = &raw_entries[still_pending[0]];
            return Err(match e.entry_type {
                PackEntryType::RefDelta { base_oid } => PackError::MissingBase(base_oid),
                PackEntryType::OfsDelta { base_offset } => PackError::InvalidDelta {
                    offset: e.offset,
                    reason: format!("ofs_delta base at {base_offset} never resolved"),
                },
                _ => unreachable!(),
            });
        }
        pending = still_pending;
    }

    raw_entries
        .into_iter()
        .map(|e| {
            let (obj_type, data) = resolved
                .remove(&e.offset)
                .expect("every entry resolved or the loop above returned an error");
            Ok(ResolvedEntry {
                oid: oid_by_offset[&e.offset],
                obj_type,
                offset: e.offset,
                crc32: e.crc32,
                data,
            })
        })
        .collect()
}

fn hash_object(
    hash_algo: HashAlgorithm,
    obj_type: ObjectType,
    data: &[u8],
) -> Result<ObjectId, PackError> {
    let type_name = std::str::from_utf8(obj_type.as_bytes()).expect("ascii object type name");
    Hasher::hash_object(hash_algo, type_name, data).map_err(PackError::Hash)
}

/// Write a decoded pack's raw bytes to `<objects_dir>/pack/pack-<checksum>.pack`
/// and build its `.idx` alongside it.
///
/// Returns the path to the installed `.pack` file. Callers should refresh
/// their object database's pack list afterwards.
pub fn install_pack(
    objects_dir: &Path,
    pack_data: &[u8],
    decoded: &DecodedPack,
) -> Result<PathBuf, PackError> {
    let pack_dir = objects_dir.join("pack");
    fs::create_dir_all(&pack_dir)?;

    let name = format!("pack-{}", decoded.pack_checksum.to_hex());
    let pack_path = pack_dir.join(format!("{name}.pack"));
    let idx_path = pack_dir.join(format!("{name}.idx"));

    fs::write(&pack_path, pack_data)?;

    let mut index_entries: Vec<(ObjectId, u64, u32)> = decoded
        .entries
        .iter()
        .map(|e| (e.oid, e.offset, e.crc32))
        .collect();
    build_pack_index(&idx_path, &mut index_entries, &decoded.pack_checksum)?;

    Ok(pack_path)
}
