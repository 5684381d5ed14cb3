//! `PackIndexer`: builds a `.idx` for a pack whose objects arrive without
//! their own index (the transport never sends one) — two passes over the
//! pack bytes, per §4.3.
//!
//! Pass 1 walks every entry once, recording its header and (for deltas) its
//! base reference, without resolving any delta chains. Pass 2 resolves
//! bases bottom-up: once a base's final type/content is known, every entry
//! delta-encoded against it can be resolved too. Entries at the same
//! dependency depth have no data dependency on each other and are resolved
//! across worker threads.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use git_hash::hasher::Hasher;
use git_hash::{HashAlgorithm, ObjectId};
use git_object::ObjectType;
use lru::LruCache;

use crate::entry::parse_entry_header;
use crate::{ObjectSource, PackEntryType, PackError, PACK_HEADER_SIZE, PACK_SIGNATURE, PACK_VERSION};

/// A resolved entry: its id, type, pack offset and CRC32 — everything
/// [`crate::write::build_pack_index`] needs.
#[derive(Debug, Clone)]
pub struct IndexedEntry {
    pub id: ObjectId,
    pub obj_type: ObjectType,
    pub offset: u64,
    pub crc32: u32,
}

/// An entry recorded in pass 1, before delta resolution.
struct RawEntry {
    offset: u64,
    header_size: usize,
    compressed_len: usize,
    uncompressed_size: usize,
    kind: PackEntryType,
    crc32: u32,
}

/// How many other entries, directly or through a chain, wait on this one.
enum Dependency {
    /// No delta — already resolved.
    None(ObjectType),
    /// Depends on the entry at this pack offset.
    OffsetBase(u64),
    /// Depends on an object by id — either another entry in this pack (not
    /// yet known at pass 1 time) or an object outside it (thin pack).
    IdBase(ObjectId),
}

/// Default size of the inflated-base LRU cache used during pass 2.
pub const DEFAULT_BASE_CACHE: usize = 256;

pub struct PackIndexer<'a> {
    data: &'a [u8],
    base_cache_size: usize,
}

impl<'a> PackIndexer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            base_cache_size: DEFAULT_BASE_CACHE,
        }
    }

    pub fn with_base_cache_size(mut self, size: usize) -> Self {
        self.base_cache_size = size;
        self
    }

    /// Run both passes. `source` resolves REF_DELTA bases not found in this
    /// pack (thin packs) and is consulted to reject collisions — an object
    /// already present under the same id with different bytes.
    pub fn index(&self, source: &dyn ObjectSource) -> Result<Vec<IndexedEntry>, PackError> {
        let raw = self.pass1()?;
        self.pass2(raw, source)
    }

    fn pass1(&self) -> Result<Vec<RawEntry>, PackError> {
        let hash_len = ObjectId::NULL_SHA1.as_bytes().len();
        if self.data.len() < PACK_HEADER_SIZE + hash_len {
            return Err(PackError::InvalidHeader("file too small".into()));
        }
        if &self.data[0..4] != PACK_SIGNATURE {
            return Err(PackError::InvalidHeader("bad PACK signature".into()));
        }
        let version = u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]]);
        if version != PACK_VERSION {
            return Err(PackError::UnsupportedVersion(version));
        }
        let num_objects =
            u32::from_be_bytes([self.data[8], self.data[9], self.data[10], self.data[11]]);

        let mut offset = PACK_HEADER_SIZE as u64;
        let mut entries = Vec::with_capacity(num_objects as usize);

        for _ in 0..num_objects {
            let entry = parse_entry_header(&self.data[offset as usize..], offset)?;
            let compressed_start = entry.data_offset as usize;
            let compressed_len = compressed_zlib_len(&self.data[compressed_start..], offset)?;

            let mut crc = crc32fast::Hasher::new();
            crc.update(&self.data[offset as usize..offset as usize + entry.header_size]);
            crc.update(&self.data[compressed_start..compressed_start + compressed_len]);
            let crc32 = crc.finalize();

            entries.push(RawEntry {
                offset,
                header_size: entry.header_size,
                compressed_len,
                uncompressed_size: entry.uncompressed_size,
                kind: entry.entry_type,
                crc32,
            });

            offset = compressed_start as u64 + compressed_len as u64;
        }

        let body_end = offset as usize;
        if self.data.len() != body_end + hash_len {
            return Err(PackError::CorruptEntry(offset));
        }
        let mut hasher = Hasher::new(HashAlgorithm::Sha1);
        hasher.update(&self.data[..body_end]);
        let computed = hasher.finalize()?;
        let trailer = ObjectId::from_bytes(&self.data[body_end..], HashAlgorithm::Sha1)?;
        if computed != trailer {
            return Err(PackError::ChecksumMismatch { expected: computed, actual: trailer });
        }

        Ok(entries)
    }

    fn pass2(
        &self,
        raw: Vec<RawEntry>,
        source: &dyn ObjectSource,
    ) -> Result<Vec<IndexedEntry>, PackError> {
        let offset_index: HashMap<u64, usize> =
            raw.iter().enumerate().map(|(i, e)| (e.offset, i)).collect();

        let dependency = |e: &RawEntry| -> Dependency {
            match e.kind {
                PackEntryType::Commit => Dependency::None(ObjectType::Commit),
                PackEntryType::Tree => Dependency::None(ObjectType::Tree),
                PackEntryType::Blob => Dependency::None(ObjectType::Blob),
                PackEntryType::Tag => Dependency::None(ObjectType::Tag),
                PackEntryType::OfsDelta { base_offset } => Dependency::OffsetBase(base_offset),
                PackEntryType::RefDelta { base_oid } => Dependency::IdBase(base_oid),
            }
        };

        // resolved[i] = Some((type, data)) once known.
        let mut resolved: Vec<Option<(ObjectType, Vec<u8>)>> = vec![None; raw.len()];
        let cache: Mutex<LruCache<u64, (ObjectType, Vec<u8>)>> = Mutex::new(LruCache::new(
            NonZeroUsize::new(self.base_cache_size.max(1)).unwrap(),
        ));

        // Bases (no dependency within the pack) resolve first; everything
        // else waits for its base's pass. Loop until nothing new resolves —
        // bounds iterations by the longest chain, same as MAX_DELTA_CHAIN_DEPTH.
        let mut remaining: Vec<usize> = (0..raw.len()).collect();
        let mut rounds = 0;
        while !remaining.is_empty() {
            rounds += 1;
            if rounds > crate::MAX_DELTA_CHAIN_DEPTH {
                return Err(PackError::DeltaChainTooDeep {
                    offset: raw[remaining[0]].offset,
                    max_depth: crate::MAX_DELTA_CHAIN_DEPTH,
                });
            }

            let mut ready = Vec::new();
            let mut blocked = Vec::new();
            for &i in &remaining {
                let dep = dependency(&raw[i]);
                let base_bytes = match dep {
                    Dependency::None(_) => Some(None),
                    Dependency::OffsetBase(off) => match offset_index.get(&off) {
                        Some(&bi) => {
                            let cached = cache.lock().expect("lru cache mutex poisoned").get(&off).cloned();
                            cached.or_else(|| resolved[bi].clone()).map(Some)
                        }
                        None => return Err(PackError::MissingBase(ObjectId::NULL_SHA1)),
                    },
                    Dependency::IdBase(ref id) => self
                        .find_resolved_by_id(&raw, &resolved, id)
                        .map(Some),
                };

                match base_bytes {
                    Some(Some(base)) => ready.push((i, Some(base))),
                    Some(None) => ready.push((i, None)),
                    None => blocked.push(i),
                }
            }

            if ready.is_empty() {
                // Nothing resolved this round: any remaining RefDelta bases
                // must come from outside this pack.
                for i in blocked.drain(..) {
                    if let Dependency::IdBase(id) = dependency(&raw[i]) {
                        if let Some((obj_type, data)) = source.read(&id)? {
                            ready.push((i, Some((obj_type, data))));
                            continue;
                        }
                    }
                    return Err(PackError::MissingBase(match dependency(&raw[i]) {
                        Dependency::IdBase(id) => id,
                        _ => ObjectId::NULL_SHA1,
                    }));
                }
                if ready.is_empty() {
                    break;
                }
            }

            // Entries in `ready` have no data dependency on each other (each
            // only needed its own base, already resolved above), so this
            // round's work is split across worker threads.
            let worker_count = std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1)
                .min(ready.len().max(1));
            let chunk_size = ready.len().div_ceil(worker_count).max(1);

            let resolved_chunk: Vec<Result<(usize, ObjectType, Vec<u8>), PackError>> =
                crossbeam::thread::scope(|scope| {
                    let handles: Vec<_> = ready
                        .chunks(chunk_size)
                        .map(|chunk| {
                            let raw = &raw;
                            let data = self.data;
                            scope.spawn(move |_| {
                                chunk
                                    .iter()
                                    .map(|(i, base)| resolve_one(raw, data, *i, base))
                                    .collect::<Vec<_>>()
                            })
                        })
                        .collect();
                    handles
                        .into_iter()
                        .flat_map(|h| h.join().expect("worker thread panicked"))
                        .collect()
                })
                .expect("worker scope panicked");

            for item in resolved_chunk {
                let (i, obj_type, data) = item?;
                let offset = raw[i].offset;
                {
                    let mut cache = cache.lock().expect("lru cache mutex poisoned");
                    cache.put(offset, (obj_type, data.clone()));
                }
                resolved[i] = Some((obj_type, data));
            }

            remaining = blocked;
        }

        let mut out = Vec::with_capacity(raw.len());
        for (i, entry) in raw.iter().enumerate() {
            let (obj_type, data) = resolved[i]
                .clone()
                .ok_or(PackError::MissingBase(ObjectId::NULL_SHA1))?;
            let type_str = match obj_type {
                ObjectType::Commit => "commit",
                ObjectType::Tree => "tree",
                ObjectType::Blob => "blob",
                ObjectType::Tag => "tag",
            };
            let id = Hasher::hash_object(HashAlgorithm::Sha1, type_str, &data)?;

            if let Some((_, existing)) = source.read(&id)? {
                if existing != data {
                    return Err(PackError::Collision { id });
                }
            }

            out.push(IndexedEntry {
                id,
                obj_type,
                offset: entry.offset,
                crc32: entry.crc32,
            });
        }

        Ok(out)
    }

    fn find_resolved_by_id(
        &self,
        _raw: &[RawEntry],
        resolved: &[Option<(ObjectType, Vec<u8>)>],
        id: &ObjectId,
    ) -> Option<(ObjectType, Vec<u8>)> {
        for r in resolved.iter() {
            let Some((obj_type, data)) = r else {
                continue;
            };
            let type_str = match obj_type {
                ObjectType::Commit => "commit",
                ObjectType::Tree => "tree",
                ObjectType::Blob => "blob",
                ObjectType::Tag => "tag",
            };
            if let Ok(candidate_id) = Hasher::hash_object(HashAlgorithm::Sha1, type_str, data) {
                if candidate_id == *id {
                    return Some((*obj_type, data.clone()));
                }
            }
        }
        None
    }
}

/// Decompress and, if this entry is a delta, apply it against the already-
/// resolved `base` — run from a worker thread, touching only its own
/// chunk's `self.data` slice and no shared mutable state.
fn resolve_one(
    raw: &[RawEntry],
    data: &[u8],
    i: usize,
    base: &Option<(ObjectType, Vec<u8>)>,
) -> Result<(usize, ObjectType, Vec<u8>), PackError> {
    let entry = &raw[i];
    let compressed_start = entry.offset as usize + entry.header_size;
    let compressed = &data[compressed_start..compressed_start + entry.compressed_len];
    let inflated = inflate(compressed, entry.uncompressed_size, entry.offset)?;

    let (obj_type, data) = match entry.kind {
        PackEntryType::Commit => (ObjectType::Commit, inflated),
        PackEntryType::Tree => (ObjectType::Tree, inflated),
        PackEntryType::Blob => (ObjectType::Blob, inflated),
        PackEntryType::Tag => (ObjectType::Tag, inflated),
        PackEntryType::OfsDelta { .. } | PackEntryType::RefDelta { .. } => {
            let (base_type, base_data) = base.as_ref().expect("dependency satisfied");
            let data = crate::delta::apply::apply_delta(base_data, &inflated)?;
            (*base_type, data)
        }
    };

    Ok((i, obj_type, data))
}

/// Determine how many compressed bytes a zlib stream at `compressed`
/// occupies, by running the inflater and counting consumed input.
fn compressed_zlib_len(compressed: &[u8], offset: u64) -> Result<usize, PackError> {
    use std::io::Read;
    let mut decoder = flate2::bufread::ZlibDecoder::new(compressed);
    let mut sink = Vec::new();
    decoder
        .read_to_end(&mut sink)
        .map_err(|_| PackError::CorruptEntry(offset))?;
    Ok(decoder.total_in() as usize)
}

fn inflate(compressed: &[u8], expected_size: usize, offset: u64) -> Result<Vec<u8>, PackError> {
    use std::io::Read;
    let mut decoder = flate2::bufread::ZlibDecoder::new(compressed);
    let mut buf = Vec::with_capacity(expected_size);
    decoder
        .read_to_end(&mut buf)
        .map_err(|_| PackError::CorruptEntry(offset))?;
    Ok(buf)
}
