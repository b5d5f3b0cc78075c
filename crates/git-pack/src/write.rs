//! Minimal pack serialization: a single-object pack and `.idx` index builder.
//!
//! Full pack creation (multi-object, delta-compressed) is out of scope here;
//! this module only covers what's needed to hand a single object to a peer
//! that requires a packfile, and to build a `.idx` for a pack installed from
//! the wire (see [`crate::decode::install_pack`]).

use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::ZlibEncoder;
use flate2::Compression;
use git_hash::hasher::Hasher;
use git_hash::{HashAlgorithm, ObjectId};
use git_object::ObjectType;

use crate::entry::encode_entry_header;
use crate::{IDX_SIGNATURE, IDX_VERSION, PACK_HEADER_SIZE, PACK_SIGNATURE, PACK_VERSION, PackError};

/// Serialize a single non-delta object into a complete, checksummed pack.
///
/// Returns the raw pack bytes and the object's id.
pub fn write_single_object_pack(
    obj_type: ObjectType,
    data: &[u8],
) -> Result<(Vec<u8>, ObjectId), PackError> {
    let type_num = match obj_type {
        ObjectType::Commit => 1,
        ObjectType::Tree => 2,
        ObjectType::Blob => 3,
        ObjectType::Tag => 4,
    };

    let oid = Hasher::hash_object(
        HashAlgorithm::Sha1,
        std::str::from_utf8(obj_type.as_bytes()).unwrap(),
        data,
    )
    .map_err(PackError::Hash)?;

    let mut buf = Vec::with_capacity(PACK_HEADER_SIZE + data.len());
    buf.extend_from_slice(PACK_SIGNATURE);
    buf.extend_from_slice(&PACK_VERSION.to_be_bytes());
    buf.extend_from_slice(&1u32.to_be_bytes());

    buf.extend_from_slice(&encode_entry_header(type_num, data.len() as u64));

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    buf.extend_from_slice(&encoder.finish()?);

    let mut hasher = Hasher::new(HashAlgorithm::Sha1);
    hasher.update(&buf);
    let checksum = hasher.finalize().map_err(PackError::Hash)?;
    buf.extend_from_slice(checksum.as_bytes());

    Ok((buf, oid))
}

/// Build a v2 pack index (.idx) from a list of (OID, offset, CRC32) entries
/// and a pack checksum. Writes the index to the given path.
pub fn build_pack_index(
    idx_path: &Path,
    entries: &mut [(ObjectId, u64, u32)],
    pack_checksum: &ObjectId,
) -> Result<PathBuf, PackError> {
    // Sort by OID
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut buf = Vec::new();

    // Header
    buf.extend_from_slice(&IDX_SIGNATURE);
    buf.extend_from_slice(&IDX_VERSION.to_be_bytes());

    // Fanout table
    let mut fanout = [0u32; 256];
    for (oid, _, _) in entries.iter() {
        fanout[oid.first_byte() as usize] += 1;
    }
    for i in 1..256 {
        fanout[i] += fanout[i - 1];
    }
    for count in fanout {
        buf.extend_from_slice(&count.to_be_bytes());
    }

    // OIDs
    for (oid, _, _) in entries.iter() {
        buf.extend_from_slice(oid.as_bytes());
    }

    // CRC32
    for (_, _, crc) in entries.iter() {
        buf.extend_from_slice(&crc.to_be_bytes());
    }

    // Offsets — check if we need 64-bit table
    let mut large_offsets: Vec<u64> = Vec::new();
    for (_, offset, _) in entries.iter() {
        if *offset >= 0x8000_0000 {
            let idx = large_offsets.len() as u32;
            buf.extend_from_slice(&(0x8000_0000u32 | idx).to_be_bytes());
            large_offsets.push(*offset);
        } else {
            buf.extend_from_slice(&(*offset as u32).to_be_bytes());
        }
    }

    // 64-bit offset table
    for offset in &large_offsets {
        buf.extend_from_slice(&offset.to_be_bytes());
    }

    // Pack checksum
    buf.extend_from_slice(pack_checksum.as_bytes());

    // Index checksum
    let mut hasher = Hasher::new(HashAlgorithm::Sha1);
    hasher.update(&buf);
    let idx_checksum = hasher.finalize().map_err(PackError::Hash)?;
    buf.extend_from_slice(idx_checksum.as_bytes());

    let idx_path = idx_path.to_path_buf();
    std::fs::write(&idx_path, &buf)?;

    Ok(idx_path)
}
