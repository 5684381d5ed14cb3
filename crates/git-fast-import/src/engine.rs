//! The fast-import engine: consumes [`Command`]s from [`Parser`] and drives
//! a [`PackBuilder`] directly, without going through
//! [`git_odb::ObjectDatabase::write`] for the objects it creates.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use bstr::{BString, ByteSlice};
use git_hash::hasher::Hasher;
use git_hash::{HashAlgorithm, ObjectId};
use git_object::{Commit, ObjectType, Tag};
use git_pack::select;
use git_pack::write::PackBuilder;
use git_pack::ObjectSource;
use git_ref::{FilesRefStore, RefName, RefStore, RefTransaction};

use crate::marks::MarkedObject;
use crate::odb_source::OdbSource;
use crate::parser::{Command, CommitCommand, CommitIsh, DataRef, FileChange, TagCommand};
use crate::tree::PendingObject;
use crate::{BranchTable, FastImportError, MarkTable, Result, DEFAULT_MAX_ACTIVE};

/// Default rollover point: once a pack's queued object bytes would cross
/// this, `cycle_packfile` finalizes it and starts a fresh one. Matches
/// git's own default pack size ceiling.
pub const DEFAULT_MAX_PACK_SIZE: u64 = 1 << 30; // 1 GiB

pub struct EngineConfig {
    pub git_dir: PathBuf,
    pub max_active_branches: usize,
    pub max_pack_size: u64,
}

impl EngineConfig {
    pub fn new(git_dir: impl Into<PathBuf>) -> Self {
        Self {
            git_dir: git_dir.into(),
            max_active_branches: DEFAULT_MAX_ACTIVE,
            max_pack_size: DEFAULT_MAX_PACK_SIZE,
        }
    }
}

/// Summary counters reported when the stream finishes, mirroring the
/// statistics fast-import prints to its status channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub blobs: u64,
    pub commits: u64,
    pub tags: u64,
    pub packs: u64,
    pub ref_updates: u64,
    pub ref_failures: u64,
}

/// A pack finished and indexed during this import.
pub struct FinishedPack {
    pub pack_path: PathBuf,
    pub idx_path: PathBuf,
    pub checksum: ObjectId,
}

pub struct FastImportEngine {
    config: EngineConfig,
    marks: MarkTable,
    branches: BranchTable,
    odb: git_odb::ObjectDatabase,
    ref_store: FilesRefStore,
    pack_builder: Option<PackBuilder>,
    approx_pack_bytes: u64,
    pack_index: u64,
    queued: HashSet<ObjectId>,
    pending_refs: HashMap<BString, ObjectId>,
    finished_packs: Vec<FinishedPack>,
    recognized_features: HashSet<&'static str>,
    stats: Stats,
    done_seen: bool,
    tags: Vec<(BString, ObjectId)>,
}

const RECOGNIZED_FEATURES: &[&str] = &[
    "date-format",
    "import-marks",
    "export-marks",
    "force",
    "quiet",
    "done",
    "notes",
];

impl FastImportEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let objects_dir = config.git_dir.join("objects");
        std::fs::create_dir_all(&objects_dir)?;
        let odb = git_odb::ObjectDatabase::open(&objects_dir)?;
        let ref_store = FilesRefStore::new(&config.git_dir);
        Ok(Self {
            branches: BranchTable::new(config.max_active_branches),
            config,
            marks: MarkTable::new(),
            odb,
            ref_store,
            pack_builder: None,
            approx_pack_bytes: 0,
            pack_index: 0,
            queued: HashSet::new(),
            pending_refs: HashMap::new(),
            finished_packs: Vec::new(),
            recognized_features: RECOGNIZED_FEATURES.iter().copied().collect(),
            stats: Stats::default(),
            done_seen: false,
            tags: Vec::new(),
        })
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn finished_packs(&self) -> &[FinishedPack] {
        &self.finished_packs
    }

    pub fn marks(&self) -> &MarkTable {
        &self.marks
    }

    pub fn tags(&self) -> &[(BString, ObjectId)] {
        &self.tags
    }

    pub fn branches(&self) -> impl Iterator<Item = &crate::branch::Branch> {
        self.branches.iter()
    }

    pub fn max_active_branches(&self) -> usize {
        self.config.max_active_branches
    }

    pub fn git_dir(&self) -> &Path {
        &self.config.git_dir
    }

    /// Finish whatever pack is currently open without touching refs — the
    /// half of `checkpoint` safe to run while unwinding from a fatal error.
    pub fn finish_current_pack(&mut self) -> Result<()> {
        self.cycle_packfile()
    }

    /// Process every command yielded by `commands` until the stream ends or
    /// a `done` command is seen (when the importer has advertised the
    /// `done` feature, a missing terminal `done` is itself a protocol
    /// error — callers that need that check can inspect `done_seen()`).
    pub fn run<I>(&mut self, mut commands: I) -> Result<()>
    where
        I: FnMut() -> Result<Option<Command>>,
    {
        while let Some(command) = commands()? {
            if self.done_seen {
                return Err(FastImportError::Protocol("commands after 'done'".into()));
            }
            self.dispatch(command)?;
        }
        self.checkpoint()?;
        Ok(())
    }

    pub fn done_seen(&self) -> bool {
        self.done_seen
    }

    fn dispatch(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Blob { mark, original_oid: _, data } => self.handle_blob(mark, data),
            Command::Commit(cmd) => self.handle_commit(cmd),
            Command::Tag(cmd) => self.handle_tag(cmd),
            Command::Reset { ref_name, from } => self.handle_reset(ref_name, from),
            Command::Checkpoint => self.checkpoint(),
            Command::Progress(_) => Ok(()),
            Command::Ls { .. } | Command::CatBlob(_) | Command::GetMark(_) => {
                // Query commands answer over the response channel fast-import
                // writes to; `run`'s caller doesn't get one back through
                // `dispatch`, so it should call `handle_ls`/`handle_cat_blob`/
                // `handle_get_mark` directly instead of going through `run`.
                Ok(())
            }
            Command::Alias { mark, to } => self.handle_alias(mark, to),
            Command::Feature { name, value } => self.handle_feature(name, value),
            Command::Option(_) => Ok(()),
            Command::Done => {
                self.done_seen = true;
                Ok(())
            }
        }
    }

    fn handle_feature(&mut self, name: BString, _value: Option<BString>) -> Result<()> {
        let optional = name.last() == Some(&b'?');
        let key = if optional { &name[..name.len() - 1] } else { name.as_slice() };
        let key = std::str::from_utf8(key).unwrap_or("");
        if !self.recognized_features.contains(key) && !optional {
            return Err(FastImportError::Protocol(format!("unsupported feature '{key}'")));
        }
        Ok(())
    }

    fn handle_blob(&mut self, mark: Option<u64>, data: Vec<u8>) -> Result<()> {
        let id = self.write_object(ObjectType::Blob, &data)?;
        if let Some(mark) = mark {
            self.marks.insert(mark, MarkedObject { id, obj_type: ObjectType::Blob });
        }
        self.stats.blobs += 1;
        self.maybe_cycle_packfile()?;
        Ok(())
    }

    fn handle_alias(&mut self, mark: u64, to: CommitIsh) -> Result<()> {
        let (id, obj_type) = self.resolve_commit_ish_typed(&to)?;
        self.marks.insert(mark, MarkedObject { id, obj_type });
        Ok(())
    }

    fn handle_reset(&mut self, ref_name: BString, from: Option<CommitIsh>) -> Result<()> {
        let target = from.map(|c| self.resolve_commit_ish(&c)).transpose()?;
        let branch = self.branches.touch(ref_name.as_bytes());
        branch.tip = target;
        branch.tree = crate::tree::WorkingTree::new();
        if let Some(id) = target {
            self.rebuild_branch_tree(ref_name.as_bytes(), id)?;
        }
        self.branches.clear_needs_rebuild(ref_name.as_bytes());
        Ok(())
    }

    fn handle_commit(&mut self, cmd: CommitCommand) -> Result<()> {
        let from_id = cmd.from.as_ref().map(|c| self.resolve_commit_ish(c)).transpose()?;
        let merge_ids = cmd
            .merges
            .iter()
            .map(|c| self.resolve_commit_ish(c))
            .collect::<Result<Vec<_>>>()?;

        if let Some(id) = from_id {
            let branch = self.branches.touch(cmd.ref_name.as_bytes());
            branch.tip = Some(id);
            branch.tree = crate::tree::WorkingTree::new();
            self.rebuild_branch_tree(cmd.ref_name.as_bytes(), id)?;
            self.branches.clear_needs_rebuild(cmd.ref_name.as_bytes());
        } else {
            let needs_rebuild = self.branches.touch(cmd.ref_name.as_bytes()).needs_rebuild();
            if needs_rebuild {
                let tip = self.branches.get(cmd.ref_name.as_bytes()).and_then(|b| b.tip);
                if let Some(tip) = tip {
                    self.rebuild_branch_tree(cmd.ref_name.as_bytes(), tip)?;
                }
                self.branches.clear_needs_rebuild(cmd.ref_name.as_bytes());
            }
        }

        for change in &cmd.file_changes {
            self.apply_file_change(cmd.ref_name.as_bytes(), change)?;
        }

        // Seed delta search with the parent commit's tree, so blobs/trees
        // that only changed slightly have a same-path base to match against
        // without that parent's content being re-emitted into this pack.
        if let Some(parent) = self.branches.get(cmd.ref_name.as_bytes()).and_then(|b| b.tip) {
            if self.odb.contains(&parent) {
                let source = OdbSource(&self.odb);
                self.builder_mut().add_preferred_tree(parent, &source)?;
            }
        }

        let mut pending = Vec::new();
        let tree_id = {
            let branch = self.branches.get_mut(cmd.ref_name.as_bytes()).expect("just touched");
            branch.tree.commit(&mut self.queued, &mut pending)
        };
        self.flush_pending(pending)?;

        let mut parents = Vec::new();
        parents.extend(self.branches.get(cmd.ref_name.as_bytes()).expect("just touched").tip);
        parents.extend(merge_ids);

        let commit = Commit {
            tree: tree_id,
            parents,
            author: cmd.author.unwrap_or_else(|| cmd.committer.clone()),
            committer: cmd.committer,
            encoding: None,
            gpgsig: None,
            extra_headers: Vec::new(),
            message: BString::from(cmd.message),
        };
        let content = commit.serialize_content();
        let id = Hasher::hash_object(HashAlgorithm::Sha1, "commit", &content)
            .expect("sha1 hashing cannot fail");
        if self.queued.insert(id) {
            let len = content.len() as u64;
            if self.builder_mut().add(id, ObjectType::Commit, content, b"") {
                self.approx_pack_bytes += len;
            }
        }

        {
            let branch = self.branches.get_mut(cmd.ref_name.as_bytes()).expect("just touched");
            branch.last_commit_clock = branch.last_commit_clock.max(commit.committer.date.timestamp);
            branch.tip = Some(id);
        }

        if let Some(mark) = cmd.mark {
            self.marks.insert(mark, MarkedObject { id, obj_type: ObjectType::Commit });
        }
        self.pending_refs.insert(cmd.ref_name, id);
        self.stats.commits += 1;
        self.maybe_cycle_packfile()?;
        Ok(())
    }

    fn handle_tag(&mut self, cmd: TagCommand) -> Result<()> {
        let (target, target_type) = self.resolve_commit_ish_typed(&cmd.from)?;

        let tag = Tag {
            target,
            target_type,
            tag_name: cmd.name.clone(),
            tagger: cmd.tagger,
            message: BString::from(cmd.message),
            gpgsig: None,
        };
        let content = tag.serialize_content();
        let id =
            Hasher::hash_object(HashAlgorithm::Sha1, "tag", &content).expect("sha1 hashing cannot fail");
        if self.queued.insert(id) {
            let len = content.len() as u64;
            if self.builder_mut().add(id, ObjectType::Tag, content, b"") {
                self.approx_pack_bytes += len;
            }
        }

        if let Some(mark) = cmd.mark {
            self.marks.insert(mark, MarkedObject { id, obj_type: ObjectType::Tag });
        }

        let mut ref_name = b"refs/tags/".to_vec();
        ref_name.extend_from_slice(&cmd.name);
        self.pending_refs.insert(BString::from(ref_name), id);
        self.tags.push((cmd.name, id));
        self.stats.tags += 1;
        Ok(())
    }

    fn apply_file_change(&mut self, branch_name: &[u8], change: &FileChange) -> Result<()> {
        match change {
            FileChange::Modify { path, mode, data } => {
                let id = self.resolve_dataref(data)?;
                let branch = self.branches.get_mut(branch_name).expect("branch touched");
                branch.tree.set_blob(path, *mode, id)?;
            }
            FileChange::Delete { path } => {
                let branch = self.branches.get_mut(branch_name).expect("branch touched");
                branch.tree.remove(path)?;
            }
            FileChange::Copy { src, dst } => {
                let branch = self.branches.get_mut(branch_name).expect("branch touched");
                branch.tree.copy(src, dst)?;
            }
            FileChange::Rename { src, dst } => {
                let branch = self.branches.get_mut(branch_name).expect("branch touched");
                branch.tree.rename(src, dst)?;
            }
            FileChange::DeleteAll => {
                let branch = self.branches.get_mut(branch_name).expect("branch touched");
                branch.tree.delete_all();
            }
            FileChange::Note { .. } => {
                // Note-tree fanout maintenance (crate::notes) operates on the
                // `refs/notes/*` branch's own tree via ordinary `M` semantics;
                // nothing extra to do here beyond what `M`/`inline` already do.
            }
        }
        Ok(())
    }

    fn resolve_dataref(&mut self, data: &DataRef) -> Result<ObjectId> {
        match data {
            DataRef::Mark(mark) => self
                .marks
                .get(*mark)
                .map(|m| m.id)
                .ok_or_else(|| FastImportError::undefined_mark(*mark)),
            DataRef::Sha1(id) => Ok(*id),
            DataRef::Inline(bytes) => self.write_object(ObjectType::Blob, bytes),
        }
    }

    fn resolve_commit_ish(&mut self, commit_ish: &CommitIsh) -> Result<ObjectId> {
        self.resolve_commit_ish_typed(commit_ish).map(|(id, _)| id)
    }

    /// Like [`Self::resolve_commit_ish`], but also returns the resolved
    /// object's type without relying on a lookup in the odb, which does not
    /// yet know about objects still sitting in the open, unflushed pack.
    /// Mark and branch/ref resolutions carry their type with them; only a
    /// bare hex id genuinely requires a store lookup.
    fn resolve_commit_ish_typed(&mut self, commit_ish: &CommitIsh) -> Result<(ObjectId, ObjectType)> {
        match commit_ish {
            CommitIsh::Mark(mark) => {
                let entry = self.marks.get(*mark).ok_or_else(|| FastImportError::undefined_mark(*mark))?;
                Ok((entry.id, entry.obj_type))
            }
            CommitIsh::Sha1(id) => {
                let source = OdbSource(&self.odb);
                match source.read(id)? {
                    Some((obj_type, _)) => Ok((*id, obj_type)),
                    None => Err(FastImportError::Protocol(format!("unknown object {}", id.to_hex()))),
                }
            }
            CommitIsh::Ref(name) => {
                if let Some(branch) = self.branches.get(name.as_bytes()) {
                    if let Some(tip) = branch.tip {
                        return Ok((tip, ObjectType::Commit));
                    }
                }
                if let Some(id) = self.pending_refs.get(name) {
                    return Ok((*id, ObjectType::Commit));
                }
                let ref_name = RefName::new(name.clone())
                    .map_err(|e| FastImportError::Protocol(format!("bad ref name: {e}")))?;
                let id = self
                    .ref_store
                    .resolve_to_oid(&ref_name)?
                    .ok_or_else(|| FastImportError::Protocol(format!("unknown ref '{name}'")))?;
                let source = OdbSource(&self.odb);
                let obj_type = source.read(&id)?.map(|(t, _)| t).unwrap_or(ObjectType::Commit);
                Ok((id, obj_type))
            }
        }
    }

    /// Rebuild a branch's working tree by recursively reading the tip
    /// commit's root tree through the object store. Used both when
    /// `reset`/`from` point at pre-existing history and when a
    /// previously-evicted branch is touched again.
    fn rebuild_branch_tree(&mut self, branch_name: &[u8], tip: ObjectId) -> Result<()> {
        let commit = self.read_commit(&tip)?;
        let mut tree = crate::tree::WorkingTree::new();
        self.populate_tree(&mut tree, b"", &commit.tree)?;
        let branch = self.branches.get_mut(branch_name).expect("branch touched");
        branch.tree = tree;
        Ok(())
    }

    fn populate_tree(&self, tree: &mut crate::tree::WorkingTree, prefix: &[u8], id: &ObjectId) -> Result<()> {
        let git_tree = self.read_tree(id)?;
        for entry in git_tree.iter() {
            let mut path = prefix.to_vec();
            path.extend_from_slice(&entry.name);
            if entry.mode.is_tree() {
                self.populate_tree(tree, &{
                    let mut p = path.clone();
                    p.push(b'/');
                    p
                }, &entry.oid)?;
            } else {
                tree.set_blob(&path, entry.mode, entry.oid)?;
            }
        }
        Ok(())
    }

    fn read_commit(&self, id: &ObjectId) -> Result<Commit> {
        let source = OdbSource(&self.odb);
        match source.read(id)? {
            Some((ObjectType::Commit, data)) => {
                Commit::parse(&data).map_err(|e| FastImportError::Format(e.to_string()))
            }
            Some(_) => Err(FastImportError::non_commit_parent(*id)),
            None => Err(FastImportError::Protocol(format!("commit {} not found", id.to_hex()))),
        }
    }

    fn read_tree(&self, id: &ObjectId) -> Result<git_object::Tree> {
        let source = OdbSource(&self.odb);
        match source.read(id)? {
            Some((ObjectType::Tree, data)) => {
                git_object::Tree::parse(&data).map_err(|e| FastImportError::Format(e.to_string()))
            }
            Some(_) => Err(FastImportError::Protocol(format!("{} is not a tree", id.to_hex()))),
            None => Err(FastImportError::Protocol(format!("tree {} not found", id.to_hex()))),
        }
    }

    fn flush_pending(&mut self, pending: Vec<PendingObject>) -> Result<()> {
        for obj in pending {
            let len = obj.data.len() as u64;
            if self.builder_mut().add(obj.id, obj.obj_type, obj.data, &obj.name_hint) {
                self.approx_pack_bytes += len;
            }
        }
        Ok(())
    }

    fn write_object(&mut self, obj_type: ObjectType, data: &[u8]) -> Result<ObjectId> {
        let type_name = match obj_type {
            ObjectType::Blob => "blob",
            ObjectType::Tree => "tree",
            ObjectType::Commit => "commit",
            ObjectType::Tag => "tag",
        };
        let id =
            Hasher::hash_object(HashAlgorithm::Sha1, type_name, data).expect("sha1 hashing cannot fail");
        if self.queued.insert(id) {
            let len = data.len() as u64;
            if self.builder_mut().add(id, obj_type, data.to_vec(), b"") {
                self.approx_pack_bytes += len;
            }
        }
        Ok(id)
    }

    /// Lazily create the builder collecting objects for the pack currently
    /// being assembled. Delta search and serialization both happen later, in
    /// one batch, when [`Self::finish_pack`] calls `PackBuilder::finalize`.
    fn builder_mut(&mut self) -> &mut PackBuilder {
        self.pack_builder.get_or_insert_with(PackBuilder::new)
    }

    fn pack_path(&self) -> PathBuf {
        self.config
            .git_dir
            .join("objects")
            .join("pack")
            .join(format!("pack-incoming-{}.pack", self.pack_index))
    }

    /// Roll over to a new packfile once the current one's queued objects
    /// would exceed the configured size budget. Deltas never cross pack
    /// boundaries, so this is always safe to call between top-level
    /// commands.
    fn maybe_cycle_packfile(&mut self) -> Result<()> {
        if self.approx_pack_bytes >= self.config.max_pack_size {
            self.cycle_packfile()?;
        }
        Ok(())
    }

    fn cycle_packfile(&mut self) -> Result<()> {
        if let Some(builder) = self.pack_builder.take() {
            self.finish_pack(builder)?;
            self.pack_index += 1;
            self.queued.clear();
            self.approx_pack_bytes = 0;
        }
        Ok(())
    }

    fn finish_pack(&mut self, builder: PackBuilder) -> Result<()> {
        if builder.object_count() == 0 {
            return Ok(());
        }
        let pack_path = self.pack_path();
        let idx_path = pack_path.with_extension("idx");
        let (pack_path, idx_path, checksum, _idx_checksum) = builder.finalize(
            &pack_path,
            &idx_path,
            select::DEFAULT_WINDOW,
            select::FAST_IMPORT_MAX_DEPTH,
            true,
        )?;
        self.finished_packs.push(FinishedPack { pack_path, idx_path, checksum });
        self.stats.packs += 1;
        // Objects just written only become visible to `OdbSource` reads
        // (`from`/`merge`/branch-reactivation lookups, `cat-blob`) once the
        // database has rescanned the pack directory for this new pack.
        self.odb.refresh()?;
        Ok(())
    }

    /// Answer a `get-mark` query.
    pub fn handle_get_mark(&self, mark: u64) -> Result<ObjectId> {
        self.marks.get(mark).map(|m| m.id).ok_or_else(|| FastImportError::undefined_mark(mark))
    }

    /// Answer a `cat-blob` query. Blobs are only queued into the open
    /// `PackBuilder` as they're seen (`write_object`); the pack itself isn't
    /// written until the builder finalizes, so a blob can only be read back
    /// once it's landed in the object database — i.e. after the next
    /// `checkpoint`.
    pub fn handle_cat_blob(&mut self, target: CommitIsh) -> Result<(ObjectId, Vec<u8>)> {
        let (id, obj_type) = self.resolve_commit_ish_typed(&target)?;
        if obj_type != ObjectType::Blob {
            return Err(FastImportError::Protocol(format!("{} is not a blob", id.to_hex())));
        }
        let source = OdbSource(&self.odb);
        match source.read(&id)? {
            Some((ObjectType::Blob, data)) => Ok((id, data)),
            Some(_) => Err(FastImportError::Protocol(format!("{} is not a blob", id.to_hex()))),
            None => Err(FastImportError::Protocol(format!(
                "cannot cat-blob {}: not yet checkpointed",
                id.to_hex()
            ))),
        }
    }

    /// Answer an `ls` query, either against a commit-ish root or, when none
    /// is given, the named branch's current working tree.
    pub fn handle_ls(
        &mut self,
        root: Option<CommitIsh>,
        branch_name: &[u8],
        path: &[u8],
    ) -> Result<Option<(git_object::FileMode, ObjectId)>> {
        match root {
            Some(commit_ish) => {
                let (id, _) = self.resolve_commit_ish_typed(&commit_ish)?;
                let commit = self.read_commit(&id)?;
                let mut tree = crate::tree::WorkingTree::new();
                self.populate_tree(&mut tree, b"", &commit.tree)?;
                Ok(tree.lookup(path))
            }
            None => {
                let branch = self
                    .branches
                    .get(branch_name)
                    .ok_or_else(|| FastImportError::Protocol("ls on unknown branch".into()))?;
                Ok(branch.tree.lookup(path))
            }
        }
    }

    /// Flush the current packfile and apply every ref update queued since
    /// the last checkpoint, as an atomic transaction.
    pub fn checkpoint(&mut self) -> Result<()> {
        self.cycle_packfile()?;
        if self.pending_refs.is_empty() {
            return Ok(());
        }
        let mut txn = RefTransaction::new();
        let mut names = Vec::new();
        for (name, new_target) in self.pending_refs.drain() {
            let ref_name = match RefName::new(name.clone()) {
                Ok(n) => n,
                Err(e) => {
                    self.stats.ref_failures += 1;
                    return Err(FastImportError::RefUpdate {
                        name: name.to_string(),
                        reason: e.to_string(),
                    });
                }
            };
            let old = self.ref_store.resolve_to_oid(&ref_name)?;
            match old {
                Some(old) => txn.update(ref_name.clone(), old, new_target, "fast-import"),
                None => txn.create(ref_name.clone(), new_target, "fast-import"),
            }
            names.push(ref_name);
        }
        match self.ref_store.commit_transaction(txn) {
            Ok(()) => {
                self.stats.ref_updates += names.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.stats.ref_failures += names.len() as u64;
                Err(FastImportError::RefUpdate { name: "<batch>".into(), reason: e.to_string() })
            }
        }
    }
}
