//! Pack generation: create .pack and .idx files.
//!
//! Provides `PackWriter` for creating new packfiles and
//! `build_pack_index` for generating .idx files from .pack files.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::ZlibEncoder;
use flate2::Compression;
use git_hash::hasher::Hasher;
use git_hash::{HashAlgorithm, ObjectId};
use git_object::ObjectType;

use crate::entry::{encode_entry_header, encode_ofs_delta_offset};
use crate::select::{self, CandidateEntry, ReuseDelta, SelectedDelta};
use crate::{
    IDX_SIGNATURE, IDX_VERSION, PACK_HEADER_SIZE, PACK_SIGNATURE, PACK_VERSION, ObjectSource,
    PackError,
};

/// A written pack entry, used for index construction.
struct PackWriterEntry {
    oid: ObjectId,
    offset: u64,
    crc32: u32,
}

/// Builder for creating new packfiles.
pub struct PackWriter {
    file: std::fs::File,
    hasher: Hasher,
    num_objects: u32,
    entries: Vec<PackWriterEntry>,
    path: PathBuf,
    /// When true, allow delta bases that reference objects not in this pack.
    thin: bool,
    /// Current write position (byte offset).
    position: u64,
}

impl PackWriter {
    /// Create a new pack writer at the given path.
    ///
    /// Writes the pack header immediately; call `add_object` / `add_delta`
    /// to append entries, then `finish` to write the trailer.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, PackError> {
        let path = path.as_ref().to_path_buf();
        let mut file = std::fs::File::create(&path)?;
        let mut hasher = Hasher::new(HashAlgorithm::Sha1);

        // Write placeholder header (num_objects will be fixed in finish)
        let mut header = [0u8; PACK_HEADER_SIZE];
        header[0..4].copy_from_slice(PACK_SIGNATURE);
        header[4..8].copy_from_slice(&PACK_VERSION.to_be_bytes());
        header[8..12].copy_from_slice(&0u32.to_be_bytes()); // placeholder

        file.write_all(&header)?;
        hasher.update(&header);

        Ok(Self {
            file,
            hasher,
            num_objects: 0,
            entries: Vec::new(),
            path,
            thin: false,
            position: PACK_HEADER_SIZE as u64,
        })
    }

    /// Enable or disable thin pack mode.
    ///
    /// In thin pack mode, delta bases may reference objects not included
    /// in the pack. The receiver is expected to already have those objects.
    pub fn set_thin(&mut self, thin: bool) {
        self.thin = thin;
    }

    /// Add a full (non-delta) object to the pack.
    pub fn add_object(
        &mut self,
        obj_type: ObjectType,
        data: &[u8],
    ) -> Result<(), PackError> {
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

        let offset = self.position;
        let header = encode_entry_header(type_num, data.len() as u64);

        // Compress data
        let mut compressed = Vec::new();
        {
            let mut encoder = ZlibEncoder::new(&mut compressed, Compression::default());
            encoder.write_all(data)?;
            encoder.finish()?;
        }

        // CRC32 of header + compressed data
        let mut crc = crc32fast::Hasher::new();
        crc.update(&header);
        crc.update(&compressed);
        let crc_val = crc.finalize();

        // Write to file and hasher
        self.write_bytes(&header)?;
        self.write_bytes(&compressed)?;

        self.entries.push(PackWriterEntry {
            oid,
            offset,
            crc32: crc_val,
        });
        self.num_objects += 1;

        Ok(())
    }

    /// Add a REF_DELTA entry referencing a base object by OID.
    pub fn add_delta(
        &mut self,
        base_oid: ObjectId,
        target_oid: ObjectId,
        delta_data: &[u8],
    ) -> Result<(), PackError> {
        let offset = self.position;
        let header = encode_entry_header(7, delta_data.len() as u64); // REF_DELTA

        // Compress delta data
        let mut compressed = Vec::new();
        {
            let mut encoder = ZlibEncoder::new(&mut compressed, Compression::default());
            encoder.write_all(delta_data)?;
            encoder.finish()?;
        }

        // CRC32 of header + base_oid + compressed
        let mut crc = crc32fast::Hasher::new();
        crc.update(&header);
        crc.update(base_oid.as_bytes());
        crc.update(&compressed);
        let crc_val = crc.finalize();

        // Write to file and hasher
        self.write_bytes(&header)?;
        self.write_bytes(base_oid.as_bytes())?;
        self.write_bytes(&compressed)?;

        self.entries.push(PackWriterEntry {
            oid: target_oid,
            offset,
            crc32: crc_val,
        });
        self.num_objects += 1;

        Ok(())
    }

    /// Add an OFS_DELTA entry referencing a base object by its offset
    /// earlier in this same pack.
    pub fn add_ofs_delta(
        &mut self,
        base_offset: u64,
        target_oid: ObjectId,
        delta_data: &[u8],
    ) -> Result<(), PackError> {
        let offset = self.position;
        let header = encode_entry_header(6, delta_data.len() as u64); // OFS_DELTA
        let ofs_bytes = encode_ofs_delta_offset(offset - base_offset);

        let mut compressed = Vec::new();
        {
            let mut encoder = ZlibEncoder::new(&mut compressed, Compression::default());
            encoder.write_all(delta_data)?;
            encoder.finish()?;
        }

        let mut crc = crc32fast::Hasher::new();
        crc.update(&header);
        crc.update(&ofs_bytes);
        crc.update(&compressed);
        let crc_val = crc.finalize();

        self.write_bytes(&header)?;
        self.write_bytes(&ofs_bytes)?;
        self.write_bytes(&compressed)?;

        self.entries.push(PackWriterEntry {
            oid: target_oid,
            offset,
            crc32: crc_val,
        });
        self.num_objects += 1;

        Ok(())
    }

    /// Current write position — the offset the next entry would start at.
    /// Used by [`PackBuilder`] to compute OFS_DELTA base offsets.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Finish writing the pack: fix header, write checksum trailer.
    ///
    /// Returns the path to the .pack file and its checksum.
    pub fn finish(mut self) -> Result<(PathBuf, ObjectId), PackError> {
        // Fix the object count in the header
        use std::io::Seek;
        self.file.seek(std::io::SeekFrom::Start(0))?;

        let mut header = [0u8; PACK_HEADER_SIZE];
        header[0..4].copy_from_slice(PACK_SIGNATURE);
        header[4..8].copy_from_slice(&PACK_VERSION.to_be_bytes());
        header[8..12].copy_from_slice(&self.num_objects.to_be_bytes());

        self.file.write_all(&header)?;
        self.file.seek(std::io::SeekFrom::End(0))?;

        // Recompute hasher from scratch (since we modified the header)
        // Actually, let's fix the hasher — we stored the placeholder header
        // We need to recompute the hash. The simplest approach: re-read and hash.
        drop(self.file);

        // Read the pack file and compute proper checksum
        let pack_content = std::fs::read(&self.path)?;
        let mut hasher = Hasher::new(HashAlgorithm::Sha1);
        hasher.update(&pack_content);
        let checksum = hasher.finalize().map_err(PackError::Hash)?;

        // Append checksum to the file
        let mut file = std::fs::OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(checksum.as_bytes())?;

        Ok((self.path.clone(), checksum))
    }

    /// Get the entries written so far (for index building).
    pub fn entries(&self) -> impl Iterator<Item = (&ObjectId, u64, u32)> {
        self.entries
            .iter()
            .map(|e| (&e.oid, e.offset, e.crc32))
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<(), PackError> {
        self.file.write_all(data)?;
        self.hasher.update(data);
        self.position += data.len() as u64;
        Ok(())
    }
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

    for pair in entries.windows(2) {
        if pair[0].0 == pair[1].0 {
            return Err(PackError::DuplicateId(pair[0].0));
        }
    }

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

/// Convenience function: create a pack and its index from a set of objects.
///
/// Returns `(pack_path, idx_path, checksum)`.
pub fn create_pack(
    dir: &Path,
    name: &str,
    objects: &[(ObjectType, Vec<u8>)],
) -> Result<(PathBuf, PathBuf, ObjectId), PackError> {
    let pack_path = dir.join(format!("{name}.pack"));
    let idx_path = dir.join(format!("{name}.idx"));

    let mut writer = PackWriter::new(&pack_path)?;
    for (obj_type, data) in objects {
        writer.add_object(*obj_type, data)?;
    }

    // Collect entries before finishing
    let mut entries: Vec<(ObjectId, u64, u32)> = writer
        .entries()
        .map(|(oid, off, crc)| (*oid, off, crc))
        .collect();

    let (pack_path, checksum) = writer.finish()?;

    build_pack_index(&idx_path, &mut entries, &checksum)?;

    Ok((pack_path, idx_path, checksum))
}

/// One object queued for inclusion (or for use only as a delta base) in a
/// pack built by [`PackBuilder`].
struct PendingEntry {
    id: ObjectId,
    obj_type: ObjectType,
    data: Vec<u8>,
    name_hint: Vec<u8>,
    preferred_base: bool,
    /// A delta edge against another pending entry, carried over from an
    /// existing pack instead of recomputed by `select::select_deltas`
    /// (§4.2 phase 1, "Detail").
    reuse: Option<ReuseDelta>,
}

/// The full writer pipeline (§4.2): collect candidate objects, search for
/// delta bases across a sliding window, order the pack so bases precede
/// their deltas, then serialize and emit the `.idx`.
///
/// This sits above the low-level [`PackWriter`] primitives (`add_object`,
/// `add_delta`, `add_ofs_delta`), which still do the actual header/zlib/CRC
/// work; `PackBuilder` only decides *what* to write and *in what order*.
pub struct PackBuilder {
    pending: Vec<PendingEntry>,
    seen: HashSet<ObjectId>,
    thin: bool,
}

impl Default for PackBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PackBuilder {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            seen: HashSet::new(),
            thin: false,
        }
    }

    /// Allow delta bases to reference objects outside the pack (resolved by
    /// the caller through an [`ObjectSource`] on the receiving end).
    pub fn set_thin(&mut self, thin: bool) {
        self.thin = thin;
    }

    /// Has `id` already been queued, either for inclusion or as a preferred
    /// base?
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.seen.contains(id)
    }

    /// Number of objects that will actually be written into the pack by
    /// [`Self::finalize`] (preferred bases don't count — they never appear
    /// in the output).
    pub fn object_count(&self) -> usize {
        self.pending.iter().filter(|p| !p.preferred_base).count()
    }

    /// Queue an object for inclusion in the pack. Idempotent under `id`:
    /// an id already queued (whether for inclusion or as a preferred base)
    /// is left untouched. Returns whether the object was newly added.
    pub fn add(&mut self, id: ObjectId, obj_type: ObjectType, data: Vec<u8>, name_hint: &[u8]) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.pending.push(PendingEntry {
            id,
            obj_type,
            data,
            name_hint: name_hint.to_vec(),
            preferred_base: false,
            reuse: None,
        });
        true
    }

    /// Like [`Self::add`], but the object is already known to exist as a
    /// delta against `reuse.base_id` in some other pack (a repack source).
    /// If that base also ends up queued in this pack, `select_deltas` reuses
    /// the edge verbatim instead of searching for a new base; otherwise the
    /// object falls back through normal delta search.
    pub fn add_with_reuse(
        &mut self,
        id: ObjectId,
        obj_type: ObjectType,
        data: Vec<u8>,
        name_hint: &[u8],
        reuse: Option<ReuseDelta>,
    ) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.pending.push(PendingEntry {
            id,
            obj_type,
            data,
            name_hint: name_hint.to_vec(),
            preferred_base: false,
            reuse,
        });
        true
    }

    /// Queue an object that may be used as a delta base during search but
    /// is never itself written into the pack — typically a tree or blob the
    /// receiver is already known to have (§3 `PreferredBase`). Idempotent
    /// under `id`, same as `add`. Returns whether the object was newly
    /// added.
    pub fn add_preferred_base(
        &mut self,
        id: ObjectId,
        obj_type: ObjectType,
        data: Vec<u8>,
        name_hint: &[u8],
    ) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.pending.push(PendingEntry {
            id,
            obj_type,
            data,
            name_hint: name_hint.to_vec(),
            preferred_base: true,
            reuse: None,
        });
        true
    }

    /// Queue a commit's root tree, and every subtree it reaches, as
    /// preferred bases (§4.2): delta search can then match new blobs/trees
    /// against whatever this commit already has, without those objects
    /// being emitted into the pack themselves. Each tree is added with its
    /// path as its name hint, so locality sort groups it with new entries
    /// at the same path.
    ///
    /// `commit_id` must resolve through `source` to a commit; trees already
    /// queued (by this call or an earlier `add`/`add_preferred_base`) are
    /// not revisited.
    pub fn add_preferred_tree(
        &mut self,
        commit_id: ObjectId,
        source: &dyn ObjectSource,
    ) -> Result<(), PackError> {
        let (obj_type, data) = source
            .read(&commit_id)?
            .ok_or(PackError::MissingBase(commit_id))?;
        if obj_type != ObjectType::Commit {
            return Err(PackError::InvalidHeader(format!(
                "{} is not a commit",
                commit_id.to_hex()
            )));
        }
        let commit = git_object::Commit::parse(&data)?;
        self.add_preferred_tree_node(commit.tree, Vec::new(), source)
    }

    fn add_preferred_tree_node(
        &mut self,
        tree_id: ObjectId,
        path: Vec<u8>,
        source: &dyn ObjectSource,
    ) -> Result<(), PackError> {
        if self.seen.contains(&tree_id) {
            return Ok(());
        }
        let Some((obj_type, data)) = source.read(&tree_id)? else {
            return Ok(());
        };
        if obj_type != ObjectType::Tree {
            return Ok(());
        }
        let tree = git_object::Tree::parse(&data)?;
        self.add_preferred_base(tree_id, ObjectType::Tree, data, &path);
        for entry in &tree.entries {
            if entry.mode.is_tree() {
                let mut child_path = path.clone();
                if !child_path.is_empty() {
                    child_path.push(b'/');
                }
                child_path.extend_from_slice(&entry.name);
                self.add_preferred_tree_node(entry.oid, child_path, source)?;
            }
        }
        Ok(())
    }

    /// Run delta search and write the pack and its index.
    ///
    /// `window` and `max_depth` are forwarded to [`select::select_deltas`].
    /// `allow_ofs_delta` chooses OFS_DELTA (compact, pack-relative) over
    /// REF_DELTA (20-byte OID, works across pack boundaries — required for
    /// thin packs, since the base offset isn't known until the receiver
    /// completes it).
    pub fn finalize(
        self,
        pack_path: impl AsRef<Path>,
        idx_path: impl AsRef<Path>,
        window: usize,
        max_depth: usize,
        allow_ofs_delta: bool,
    ) -> Result<(PathBuf, PathBuf, ObjectId, ObjectId), PackError> {
        let candidates: Vec<CandidateEntry> = self
            .pending
            .iter()
            .map(|p| CandidateEntry {
                id: p.id,
                obj_type: p.obj_type,
                data: p.data.clone(),
                name_hint: p.name_hint.clone(),
                preferred_base: p.preferred_base,
                reuse: p.reuse.clone(),
            })
            .collect();

        let order = select::sort_for_delta_search(&candidates);
        let deltas = select::select_deltas(&candidates, &order, window, max_depth);

        let emission_order = emission_order(&candidates, &deltas);

        let mut writer = PackWriter::new(pack_path.as_ref())?;
        writer.set_thin(self.thin);

        // OFS_DELTA bases must already be in this pack at a known offset;
        // REF_DELTA bases may be emitted later, or not at all (thin pack).
        let mut written_offset: Vec<Option<u64>> = vec![None; candidates.len()];

        for idx in emission_order {
            let entry = &self.pending[idx];
            if entry.preferred_base {
                continue;
            }
            match deltas[idx].as_ref() {
                Some(SelectedDelta {
                    base_index, delta, ..
                }) => {
                    let base = &self.pending[*base_index];
                    if allow_ofs_delta && written_offset[*base_index].is_some() {
                        let base_offset = written_offset[*base_index].unwrap();
                        written_offset[idx] = Some(writer.position());
                        writer.add_ofs_delta(base_offset, entry.id, delta)?;
                    } else {
                        written_offset[idx] = Some(writer.position());
                        writer.add_delta(base.id, entry.id, delta)?;
                    }
                }
                None => {
                    written_offset[idx] = Some(writer.position());
                    writer.add_object(entry.obj_type, &entry.data)?;
                }
            }
        }

        let mut entries: Vec<(ObjectId, u64, u32)> = writer
            .entries()
            .map(|(oid, off, crc)| (*oid, off, crc))
            .collect();

        let (pack_path, pack_checksum) = writer.finish()?;
        let idx_path = build_pack_index(idx_path.as_ref(), &mut entries, &pack_checksum)?;

        // The index checksum is the trailing 20 bytes of the file just written.
        let idx_bytes = std::fs::read(&idx_path)?;
        let hash_len = pack_checksum.as_bytes().len();
        let idx_checksum =
            ObjectId::from_bytes(&idx_bytes[idx_bytes.len() - hash_len..], HashAlgorithm::Sha1)?;

        Ok((pack_path, idx_path, pack_checksum, idx_checksum))
    }
}

/// Order candidates so that every delta base is emitted before its
/// dependent (each candidate has at most one outgoing base edge, so this is
/// a forest — a DFS postorder over non-preferred entries suffices).
fn emission_order(candidates: &[CandidateEntry], deltas: &[Option<SelectedDelta>]) -> Vec<usize> {
    let mut visited = vec![false; candidates.len()];
    let mut order = Vec::with_capacity(candidates.len());

    fn visit(
        idx: usize,
        candidates: &[CandidateEntry],
        deltas: &[Option<SelectedDelta>],
        visited: &mut [bool],
        order: &mut Vec<usize>,
    ) {
        if visited[idx] {
            return;
        }
        visited[idx] = true;
        if let Some(d) = &deltas[idx] {
            visit(d.base_index, candidates, deltas, visited, order);
        }
        order.push(idx);
    }

    for idx in 0..candidates.len() {
        visit(idx, candidates, deltas, &mut visited, &mut order);
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::PackFile;

    #[test]
    fn write_and_read_single_blob() {
        let dir = tempfile::tempdir().unwrap();
        let content = b"test blob content";

        let (pack_path, _, _) =
            create_pack(dir.path(), "test", &[(ObjectType::Blob, content.to_vec())]).unwrap();

        // Read it back
        let pack = PackFile::open(&pack_path).unwrap();
        assert_eq!(pack.num_objects(), 1);

        let oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", content).unwrap();
        let obj = pack.read_object(&oid).unwrap().unwrap();
        assert_eq!(obj.obj_type, ObjectType::Blob);
        assert_eq!(obj.data, content);
    }

    #[test]
    fn write_multiple_object_types() {
        let dir = tempfile::tempdir().unwrap();
        let objects = vec![
            (ObjectType::Blob, b"blob data".to_vec()),
            (ObjectType::Blob, b"another blob".to_vec()),
        ];

        let (pack_path, _, _) = create_pack(dir.path(), "multi", &objects).unwrap();
        let pack = PackFile::open(&pack_path).unwrap();
        assert_eq!(pack.num_objects(), 2);

        for (obj_type, data) in &objects {
            let oid = Hasher::hash_object(
                HashAlgorithm::Sha1,
                std::str::from_utf8(obj_type.as_bytes()).unwrap(),
                data,
            )
            .unwrap();
            let obj = pack.read_object(&oid).unwrap().unwrap();
            assert_eq!(obj.data, *data);
        }
    }

    #[test]
    fn roundtrip_with_delta() {
        let dir = tempfile::tempdir().unwrap();
        let pack_path = dir.path().join("delta.pack");
        let idx_path = dir.path().join("delta.idx");

        let base_content = b"Hello, this is the base content for our delta test!";
        let target_content = b"Hello, this is the modified content for our delta test!";

        let mut writer = PackWriter::new(&pack_path).unwrap();

        // Add base object
        writer.add_object(ObjectType::Blob, base_content).unwrap();

        // Compute and add delta
        let base_oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", base_content).unwrap();
        let target_oid =
            Hasher::hash_object(HashAlgorithm::Sha1, "blob", target_content).unwrap();
        let delta = crate::delta::compute::compute_delta(base_content, target_content);
        writer
            .add_delta(base_oid, target_oid, &delta)
            .unwrap();

        let mut entries: Vec<(ObjectId, u64, u32)> = writer
            .entries()
            .map(|(oid, off, crc)| (*oid, off, crc))
            .collect();
        let (_, checksum) = writer.finish().unwrap();
        build_pack_index(&idx_path, &mut entries, &checksum).unwrap();

        // Read back
        let pack = PackFile::open(&pack_path).unwrap();
        let base_obj = pack.read_object(&base_oid).unwrap().unwrap();
        assert_eq!(base_obj.data, base_content.as_slice());

        let target_obj = pack.read_object(&target_oid).unwrap().unwrap();
        assert_eq!(target_obj.data, target_content.as_slice());
    }

    #[test]
    fn verify_with_c_git() {
        let dir = tempfile::tempdir().unwrap();
        let objects = vec![
            (ObjectType::Blob, b"test content for verify".to_vec()),
            (ObjectType::Blob, b"another test object".to_vec()),
        ];

        let (pack_path, _, _) = create_pack(dir.path(), "verify", &objects).unwrap();

        // Run git verify-pack on our generated pack
        let output = std::process::Command::new("git")
            .args(["verify-pack", "-v"])
            .arg(&pack_path)
            .output()
            .expect("failed to run git verify-pack");

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        assert!(
            output.status.success(),
            "git verify-pack failed:\nstdout: {stdout}\nstderr: {stderr}"
        );
    }

    #[test]
    fn pack_builder_selects_delta_and_orders_base_first() {
        let dir = tempfile::tempdir().unwrap();
        let pack_path = dir.path().join("built.pack");
        let idx_path = dir.path().join("built.idx");

        let base_content: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let mut target_content = base_content.clone();
        target_content[100] = 0xAA;

        let base_oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", &base_content).unwrap();
        let target_oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", &target_content).unwrap();

        let mut builder = PackBuilder::new();
        // Queue the target before the base; the builder must still order the
        // base first in the emitted pack.
        builder.add(target_oid, ObjectType::Blob, target_content.clone(), b"a.bin");
        builder.add(base_oid, ObjectType::Blob, base_content.clone(), b"a.bin");

        let (pack_path, _idx_path, pack_checksum, _idx_checksum) = builder
            .finalize(&pack_path, &idx_path, select::DEFAULT_WINDOW, select::DEFAULT_MAX_DEPTH, true)
            .unwrap();

        let pack = PackFile::open(&pack_path).unwrap();
        assert_eq!(pack.num_objects(), 2);

        let base_obj = pack.read_object(&base_oid).unwrap().unwrap();
        assert_eq!(base_obj.data, base_content);
        let target_obj = pack.read_object(&target_oid).unwrap().unwrap();
        assert_eq!(target_obj.data, target_content);

        // Pack checksum is the trailing hash of the file itself.
        let pack_bytes = std::fs::read(&pack_path).unwrap();
        assert_eq!(&pack_bytes[pack_bytes.len() - 20..], pack_checksum.as_bytes());
    }

    #[test]
    fn pack_builder_preferred_base_is_not_emitted() {
        let dir = tempfile::tempdir().unwrap();
        let pack_path = dir.path().join("thin.pack");
        let idx_path = dir.path().join("thin.idx");

        let base_content: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let mut target_content = base_content.clone();
        target_content[50] = 0x01;

        let base_oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", &base_content).unwrap();
        let target_oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", &target_content).unwrap();

        let mut builder = PackBuilder::new();
        builder.set_thin(true);
        builder.add_preferred_base(base_oid, ObjectType::Blob, base_content.clone(), b"a.bin");
        builder.add(target_oid, ObjectType::Blob, target_content.clone(), b"a.bin");

        let (pack_path, _, _, _) = builder
            .finalize(&pack_path, &idx_path, select::DEFAULT_WINDOW, select::DEFAULT_MAX_DEPTH, false)
            .unwrap();

        let pack = PackFile::open(&pack_path).unwrap();
        assert_eq!(pack.num_objects(), 1);
        assert!(!pack.contains(&base_oid));

        // The target is stored as a REF_DELTA against a base not in this
        // pack; resolving it needs an external resolver.
        let resolved = pack
            .read_object_with_resolver(&target_oid, |id| {
                if *id == base_oid {
                    Some((ObjectType::Blob, base_content.clone()))
                } else {
                    None
                }
            })
            .unwrap()
            .unwrap();
        assert_eq!(resolved.data, target_content);
    }

    #[test]
    fn pack_builder_add_is_idempotent_under_id() {
        let dir = tempfile::tempdir().unwrap();
        let pack_path = dir.path().join("idem.pack");
        let idx_path = dir.path().join("idem.idx");

        let content = b"same object, queued twice".to_vec();
        let oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", &content).unwrap();

        let mut builder = PackBuilder::new();
        assert!(builder.add(oid, ObjectType::Blob, content.clone(), b""));
        assert!(!builder.add(oid, ObjectType::Blob, content.clone(), b""));
        assert!(builder.contains(&oid));

        let (pack_path, _, _, _) = builder
            .finalize(&pack_path, &idx_path, select::DEFAULT_WINDOW, select::DEFAULT_MAX_DEPTH, true)
            .unwrap();
        let pack = PackFile::open(&pack_path).unwrap();
        assert_eq!(pack.num_objects(), 1);
    }

    #[test]
    fn add_with_reuse_carries_a_reused_edge_through_to_the_written_pack() {
        let dir = tempfile::tempdir().unwrap();
        let pack_path = dir.path().join("reuse.pack");
        let idx_path = dir.path().join("reuse.idx");

        let base_content: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let mut target_content = base_content.clone();
        target_content[0] = 0xFF;

        let base_oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", &base_content).unwrap();
        let target_oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", &target_content).unwrap();
        let reuse_delta = crate::delta::compute::compute_delta(&base_content, &target_content);

        let mut builder = PackBuilder::new();
        builder.add(base_oid, ObjectType::Blob, base_content.clone(), b"a.bin");
        builder.add_with_reuse(
            target_oid,
            ObjectType::Blob,
            target_content.clone(),
            b"a.bin",
            Some(ReuseDelta {
                base_id: base_oid,
                depth: 1,
                delta_limit: select::DEFAULT_MAX_DEPTH,
                delta_bytes: reuse_delta,
            }),
        );

        let (pack_path, _, _, _) = builder
            .finalize(&pack_path, &idx_path, select::DEFAULT_WINDOW, select::DEFAULT_MAX_DEPTH, true)
            .unwrap();

        let pack = PackFile::open(&pack_path).unwrap();
        let target_obj = pack.read_object(&target_oid).unwrap().unwrap();
        assert_eq!(target_obj.data, target_content);
    }

    #[test]
    fn add_preferred_base_does_not_reclaim_an_id_already_queued_for_inclusion() {
        let content = b"x".to_vec();
        let oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", &content).unwrap();

        let mut builder = PackBuilder::new();
        assert!(builder.add(oid, ObjectType::Blob, content.clone(), b""));
        assert!(!builder.add_preferred_base(oid, ObjectType::Blob, content, b""));
    }

    struct MapSource(std::collections::HashMap<ObjectId, (ObjectType, Vec<u8>)>);

    impl ObjectSource for MapSource {
        fn contains(&self, id: &ObjectId) -> bool {
            self.0.contains_key(id)
        }

        fn read(&self, id: &ObjectId) -> Result<Option<(ObjectType, Vec<u8>)>, PackError> {
            Ok(self.0.get(id).cloned())
        }
    }

    #[test]
    fn add_preferred_tree_walks_commit_root_and_subtrees() {
        use git_object::{FileMode, Tree, TreeEntry};

        let blob_content = b"leaf blob".to_vec();
        let blob_oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", &blob_content).unwrap();

        let subtree = Tree {
            entries: vec![TreeEntry {
                mode: FileMode::Regular,
                name: "leaf.txt".into(),
                oid: blob_oid,
            }],
        };
        let subtree_data = subtree.serialize_content();
        let subtree_oid = Hasher::hash_object(HashAlgorithm::Sha1, "tree", &subtree_data).unwrap();

        let root = Tree {
            entries: vec![TreeEntry {
                mode: FileMode::Tree,
                name: "sub".into(),
                oid: subtree_oid,
            }],
        };
        let root_data = root.serialize_content();
        let root_oid = Hasher::hash_object(HashAlgorithm::Sha1, "tree", &root_data).unwrap();

        let mut commit_bytes = Vec::new();
        commit_bytes.extend_from_slice(format!("tree {}\n", root_oid.to_hex()).as_bytes());
        commit_bytes.extend_from_slice(
            b"author Jane Doe <jane@example.com> 1234567890 +0000\n\
committer Jane Doe <jane@example.com> 1234567890 +0000\n\n\
preferred-tree test\n",
        );
        let commit_oid = Hasher::hash_object(HashAlgorithm::Sha1, "commit", &commit_bytes).unwrap();

        let mut objects = std::collections::HashMap::new();
        objects.insert(commit_oid, (ObjectType::Commit, commit_bytes));
        objects.insert(root_oid, (ObjectType::Tree, root_data));
        objects.insert(subtree_oid, (ObjectType::Tree, subtree_data));
        let source = MapSource(objects);

        let mut builder = PackBuilder::new();
        builder.add_preferred_tree(commit_oid, &source).unwrap();

        assert!(builder.contains(&root_oid));
        assert!(builder.contains(&subtree_oid));
        // The leaf blob is never walked into — only trees are recursed.
        assert!(!builder.contains(&blob_oid));
        // The commit itself is never a preferred base, only its trees.
        assert!(!builder.contains(&commit_oid));
    }
}
