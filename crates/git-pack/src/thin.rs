//! `ThinPackCompleter`: turns a thin pack (one whose delta bases may live
//! outside it) into a self-contained one, per §4.4.
//!
//! A thin pack arrives whenever a sender knows the receiver already has the
//! delta bases (e.g. a push against a branch the remote already holds most
//! of). Before the pack can be indexed on its own, any REF_DELTA whose base
//! isn't present in the pack must be fetched from the receiving store and
//! appended as a full object, and the pack's object count and trailing hash
//! rewritten to match.

use std::collections::{HashMap, HashSet};
use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use git_hash::hasher::Hasher;
use git_hash::{HashAlgorithm, ObjectId};
use git_object::ObjectType;

use crate::entry::{encode_entry_header, parse_entry_header};
use crate::{ObjectSource, PackEntryType, PackError, PACK_HEADER_SIZE, PACK_SIGNATURE, PACK_VERSION};

struct RawEntry {
    offset: u64,
    header_size: usize,
    compressed_len: usize,
    uncompressed_size: usize,
    kind: PackEntryType,
}

pub struct ThinPackCompleter;

impl ThinPackCompleter {
    /// Append any externally-held delta bases this pack's REF_DELTA entries
    /// need, then fix up the header count and trailing checksum in place.
    ///
    /// Returns the new pack bytes and its checksum. Rejects a pack whose
    /// received trailer doesn't match the hash of the bytes preceding it —
    /// without this check, a truncated or corrupted input pack would be
    /// silently "completed" into a self-consistent but wrong one.
    pub fn complete(data: &[u8], source: &dyn ObjectSource) -> Result<(Vec<u8>, ObjectId), PackError> {
        verify_trailer(data)?;

        let (raw, num_objects) = parse_raw_entries(data)?;
        let missing = find_missing_bases(data, &raw, source)?;

        let hash_len = HashAlgorithm::Sha1.digest_len();
        let mut out = data[..data.len() - hash_len].to_vec();

        for id in &missing {
            let (obj_type, bytes) = source
                .read(id)?
                .ok_or(PackError::MissingBase(*id))?;
            append_object(&mut out, obj_type, &bytes)?;
        }

        if !missing.is_empty() {
            let new_count = num_objects + missing.len() as u32;
            out[8..12].copy_from_slice(&new_count.to_be_bytes());
        }

        let checksum = append_checksum(&mut out)?;
        Ok((out, checksum))
    }
}

/// Verify the trailing hash against the bytes that precede it, before any
/// truncation or rewriting happens.
fn verify_trailer(data: &[u8]) -> Result<(), PackError> {
    let hash_len = HashAlgorithm::Sha1.digest_len();
    if data.len() < PACK_HEADER_SIZE + hash_len {
        return Err(PackError::InvalidHeader("file too small".into()));
    }
    let body_end = data.len() - hash_len;
    let mut hasher = Hasher::new(HashAlgorithm::Sha1);
    hasher.update(&data[..body_end]);
    let computed = hasher.finalize()?;
    let trailer = ObjectId::from_bytes(&data[body_end..], HashAlgorithm::Sha1)?;
    if computed != trailer {
        return Err(PackError::ChecksumMismatch { expected: computed, actual: trailer });
    }
    Ok(())
}

fn append_object(out: &mut Vec<u8>, obj_type: ObjectType, data: &[u8]) -> Result<(), PackError> {
    let type_num = match obj_type {
        ObjectType::Commit => 1,
        ObjectType::Tree => 2,
        ObjectType::Blob => 3,
        ObjectType::Tag => 4,
    };
    let header = encode_entry_header(type_num, data.len() as u64);

    let mut compressed = Vec::new();
    {
        let mut encoder = ZlibEncoder::new(&mut compressed, Compression::default());
        encoder.write_all(data)?;
        encoder.finish()?;
    }

    out.extend_from_slice(&header);
    out.extend_from_slice(&compressed);
    Ok(())
}

fn append_checksum(out: &mut Vec<u8>) -> Result<ObjectId, PackError> {
    let mut hasher = Hasher::new(HashAlgorithm::Sha1);
    hasher.update(out);
    let checksum = hasher.finalize()?;
    out.extend_from_slice(checksum.as_bytes());
    Ok(checksum)
}

fn parse_raw_entries(data: &[u8]) -> Result<(Vec<RawEntry>, u32), PackError> {
    if data.len() < PACK_HEADER_SIZE {
        return Err(PackError::InvalidHeader("file too small".into()));
    }
    if &data[0..4] != PACK_SIGNATURE {
        return Err(PackError::InvalidHeader("bad PACK signature".into()));
    }
    let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if version != PACK_VERSION {
        return Err(PackError::UnsupportedVersion(version));
    }
    let num_objects = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

    let mut offset = PACK_HEADER_SIZE as u64;
    let mut entries = Vec::with_capacity(num_objects as usize);

    for _ in 0..num_objects {
        let entry = parse_entry_header(&data[offset as usize..], offset)?;
        let compressed_start = entry.data_offset as usize;
        let compressed_len = zlib_stream_len(&data[compressed_start..], offset)?;

        entries.push(RawEntry {
            offset,
            header_size: entry.header_size,
            compressed_len,
            uncompressed_size: entry.uncompressed_size,
            kind: entry.entry_type,
        });

        offset = compressed_start as u64 + compressed_len as u64;
    }

    Ok((entries, num_objects))
}

fn zlib_stream_len(compressed: &[u8], offset: u64) -> Result<usize, PackError> {
    use std::io::Read;
    let mut decoder = flate2::bufread::ZlibDecoder::new(compressed);
    let mut sink = Vec::new();
    decoder
        .read_to_end(&mut sink)
        .map_err(|_| PackError::CorruptEntry(offset))?;
    Ok(decoder.total_in() as usize)
}

fn inflate(data: &[u8], compressed_start: usize, compressed_len: usize, expected: usize, offset: u64) -> Result<Vec<u8>, PackError> {
    use std::io::Read;
    let mut decoder =
        flate2::bufread::ZlibDecoder::new(&data[compressed_start..compressed_start + compressed_len]);
    let mut buf = Vec::with_capacity(expected);
    decoder
        .read_to_end(&mut buf)
        .map_err(|_| PackError::CorruptEntry(offset))?;
    Ok(buf)
}

/// Resolve as much of the pack internally as possible, the same way
/// [`crate::indexer::PackIndexer`] does, and return the set of REF_DELTA
/// base ids that no in-pack object satisfies.
fn find_missing_bases(
    data: &[u8],
    raw: &[RawEntry],
    source: &dyn ObjectSource,
) -> Result<Vec<ObjectId>, PackError> {
    let offset_index: HashMap<u64, usize> =
        raw.iter().enumerate().map(|(i, e)| (e.offset, i)).collect();

    let mut resolved: Vec<Option<(ObjectType, Vec<u8>)>> = vec![None; raw.len()];
    let mut remaining: Vec<usize> = (0..raw.len()).collect();
    let mut missing: HashSet<ObjectId> = HashSet::new();

    loop {
        let mut progressed = false;
        let mut still_blocked = Vec::new();

        for i in remaining {
            let entry = &raw[i];
            let base = match entry.kind {
                PackEntryType::Commit
                | PackEntryType::Tree
                | PackEntryType::Blob
                | PackEntryType::Tag => None,
                PackEntryType::OfsDelta { base_offset } => {
                    match offset_index.get(&base_offset).and_then(|&bi| resolved[bi].clone()) {
                        Some(b) => Some(b),
                        None => {
                            still_blocked.push(i);
                            continue;
                        }
                    }
                }
                PackEntryType::RefDelta { base_oid } => {
                    if let Some(found) = find_by_id(&resolved, &base_oid) {
                        Some(found)
                    } else if source.contains(&base_oid) {
                        // Resolved externally; no need to wait on it again.
                        match source.read(&base_oid)? {
                            Some(b) => Some(b),
                            None => {
                                still_blocked.push(i);
                                continue;
                            }
                        }
                    } else {
                        missing.insert(base_oid);
                        continue; // drop this entry; it can't progress further
                    }
                }
            };

            let inflated = inflate(
                data,
                entry.offset as usize + entry.header_size,
                entry.compressed_len,
                entry.uncompressed_size,
                entry.offset,
            )?;

            let (obj_type, bytes) = match base {
                None => (
                    entry.kind.to_object_type().expect("non-delta entry"),
                    inflated,
                ),
                Some((base_type, base_data)) => {
                    (base_type, crate::delta::apply::apply_delta(&base_data, &inflated)?)
                }
            };

            resolved[i] = Some((obj_type, bytes));
            progressed = true;
        }

        remaining = still_blocked;
        if !progressed || remaining.is_empty() {
            break;
        }
    }

    Ok(missing.into_iter().collect())
}

fn find_by_id(
    resolved: &[Option<(ObjectType, Vec<u8>)>],
    id: &ObjectId,
) -> Option<(ObjectType, Vec<u8>)> {
    for r in resolved {
        let Some((obj_type, data)) = r else { continue };
        let type_str = match obj_type {
            ObjectType::Commit => "commit",
            ObjectType::Tree => "tree",
            ObjectType::Blob => "blob",
            ObjectType::Tag => "tag",
        };
        if let Ok(candidate) = Hasher::hash_object(HashAlgorithm::Sha1, type_str, data) {
            if candidate == *id {
                return Some((*obj_type, data.clone()));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{encode_entry_header as header, encode_ofs_delta_offset};
    use crate::{EmptyObjectSource, PACK_HEADER_SIZE};
    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut encoder = ZlibEncoder::new(&mut out, Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap();
        out
    }

    fn append_trailer(pack: &mut Vec<u8>) {
        let mut hasher = Hasher::new(HashAlgorithm::Sha1);
        hasher.update(pack);
        let checksum = hasher.finalize().unwrap();
        pack.extend_from_slice(checksum.as_bytes());
    }

    struct FakeSource(HashMap<ObjectId, (ObjectType, Vec<u8>)>);

    impl ObjectSource for FakeSource {
        fn contains(&self, id: &ObjectId) -> bool {
            self.0.contains_key(id)
        }
        fn read(&self, id: &ObjectId) -> Result<Option<(ObjectType, Vec<u8>)>, PackError> {
            Ok(self.0.get(id).cloned())
        }
    }

    #[test]
    fn appends_missing_ref_delta_base() {
        let base_content = b"the quick brown fox jumps over the lazy dog, again and again";
        let target_content = b"the quick brown fox leaps over the lazy dog, again and again";
        let delta = crate::delta::compute::compute_delta(base_content, target_content);

        let base_oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", base_content).unwrap();
        let target_oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", target_content).unwrap();

        let mut pack = Vec::new();
        pack.extend_from_slice(PACK_SIGNATURE);
        pack.extend_from_slice(&PACK_VERSION.to_be_bytes());
        pack.extend_from_slice(&1u32.to_be_bytes()); // thin: only the delta is present

        let delta_header = header(7, delta.len() as u64); // REF_DELTA
        let delta_compressed = zlib(&delta);
        pack.extend_from_slice(&delta_header);
        pack.extend_from_slice(base_oid.as_bytes());
        pack.extend_from_slice(&delta_compressed);
        append_trailer(&mut pack);

        let mut bases = HashMap::new();
        bases.insert(base_oid, (ObjectType::Blob, base_content.to_vec()));
        let source = FakeSource(bases);

        let (completed, checksum) = ThinPackCompleter::complete(&pack, &source).unwrap();

        let count = u32::from_be_bytes([completed[8], completed[9], completed[10], completed[11]]);
        assert_eq!(count, 2);
        assert_eq!(&completed[completed.len() - 20..], checksum.as_bytes());

        // The appended base must itself be readable back out.
        let indexer = crate::indexer::PackIndexer::new(&completed);
        let entries = indexer.index(&EmptyObjectSource).unwrap();
        assert!(entries.iter().any(|e| e.id == target_oid));
        assert!(entries.iter().any(|e| e.id == base_oid));
    }

    #[test]
    fn self_contained_pack_only_rehashes() {
        let content = b"already self-contained";
        let h = header(3, content.len() as u64);
        let compressed = zlib(content);

        let mut pack = Vec::new();
        pack.extend_from_slice(PACK_SIGNATURE);
        pack.extend_from_slice(&PACK_VERSION.to_be_bytes());
        pack.extend_from_slice(&1u32.to_be_bytes());
        pack.extend_from_slice(&h);
        pack.extend_from_slice(&compressed);
        append_trailer(&mut pack);

        let (completed, checksum) = ThinPackCompleter::complete(&pack, &EmptyObjectSource).unwrap();
        let count = u32::from_be_bytes([completed[8], completed[9], completed[10], completed[11]]);
        assert_eq!(count, 1);
        assert_eq!(&completed[completed.len() - 20..], checksum.as_bytes());
        assert_eq!(completed.len(), pack.len());
    }

    #[test]
    fn missing_base_with_no_source_entry_errors() {
        let base_oid = ObjectId::from_hex("0000000000000000000000000000000000000001").unwrap();
        let delta = vec![5, 5, b'h', b'e', b'l', b'l', b'o'];

        let mut pack = Vec::new();
        pack.extend_from_slice(PACK_SIGNATURE);
        pack.extend_from_slice(&PACK_VERSION.to_be_bytes());
        pack.extend_from_slice(&1u32.to_be_bytes());
        pack.extend_from_slice(&header(7, delta.len() as u64));
        pack.extend_from_slice(base_oid.as_bytes());
        pack.extend_from_slice(&zlib(&delta));
        append_trailer(&mut pack);

        let result = ThinPackCompleter::complete(&pack, &EmptyObjectSource);
        assert!(matches!(result, Err(PackError::MissingBase(_))));
    }

    #[test]
    fn corrupted_incoming_trailer_is_rejected_before_completion() {
        let content = b"already self-contained";
        let h = header(3, content.len() as u64);
        let compressed = zlib(content);

        let mut pack = Vec::new();
        pack.extend_from_slice(PACK_SIGNATURE);
        pack.extend_from_slice(&PACK_VERSION.to_be_bytes());
        pack.extend_from_slice(&1u32.to_be_bytes());
        pack.extend_from_slice(&h);
        pack.extend_from_slice(&compressed);
        append_trailer(&mut pack);
        let last = pack.len() - 1;
        pack[last] ^= 0xFF;

        let result = ThinPackCompleter::complete(&pack, &EmptyObjectSource);
        assert!(matches!(result, Err(PackError::ChecksumMismatch { .. })));
    }

    #[test]
    fn encode_ofs_delta_offset_is_available_for_offset_chains() {
        // Sanity check the re-exported helper used by other thin-pack tests
        // elsewhere in this crate; not itself exercised by ThinPackCompleter
        // (thin packs reference external bases by id, not pack offset).
        assert!(!encode_ofs_delta_offset(128).is_empty());
    }
}
