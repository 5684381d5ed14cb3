//! In-memory working tree for a branch under import (§3 `TreeEntry` /
//! `TreeContent`, §4.6's two-version commit algorithm).
//!
//! Each directory is a node that tracks whether it has been touched since
//! it was last serialized into a tree object. Serializing only walks dirty
//! subtrees, so an unmodified directory is neither re-hashed nor re-queued
//! as a pack candidate across commits — it keeps pointing at its existing
//! tree object, the "prior serialization as delta base" behavior for
//! directories that *did* change (their sibling/ancestor entries still
//! carry the same id and land in the delta search window by name).

use std::collections::HashMap;

use bstr::{BStr, BString};
use git_hash::{HashAlgorithm, ObjectId};
use git_hash::hasher::Hasher;
use git_object::{FileMode, ObjectType, Tree, TreeEntry as GitTreeEntry};

use crate::FastImportError;

/// An object queued for inclusion in the pack currently being built.
#[derive(Debug, Clone)]
pub struct PendingObject {
    pub id: ObjectId,
    pub obj_type: ObjectType,
    pub data: Vec<u8>,
    pub name_hint: Vec<u8>,
}

#[derive(Debug, Clone)]
enum Node {
    Blob { mode: FileMode, id: ObjectId },
    Dir(DirNode),
}

#[derive(Debug, Clone, Default)]
struct DirNode {
    children: HashMap<BString, Node>,
    dirty: bool,
    cached_id: Option<ObjectId>,
}

impl DirNode {
    fn new() -> Self {
        Self {
            children: HashMap::new(),
            dirty: true,
            cached_id: None,
        }
    }
}

/// The working tree of one branch: a root directory plus the machinery to
/// apply file-change commands and serialize the result into tree objects.
#[derive(Debug, Clone, Default)]
pub struct WorkingTree {
    root: DirNode,
}

fn split_path(path: &[u8]) -> Result<Vec<&BStr>, FastImportError> {
    if path.is_empty() {
        return Err(FastImportError::Protocol("empty path component".into()));
    }
    Ok(path.split(|&b| b == b'/').map(BStr::new).collect())
}

impl WorkingTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_blob(&mut self, path: &[u8], mode: FileMode, id: ObjectId) -> Result<(), FastImportError> {
        let components = split_path(path)?;
        Self::insert(&mut self.root, &components, Node::Blob { mode, id })
    }

    fn insert(dir: &mut DirNode, components: &[&BStr], leaf: Node) -> Result<(), FastImportError> {
        let (head, rest) = components.split_first().expect("non-empty path");
        if head.is_empty() {
            return Err(FastImportError::Protocol("empty path component".into()));
        }
        dir.dirty = true;
        dir.cached_id = None;

        if rest.is_empty() {
            dir.children.insert(BString::from(*head), leaf);
            return Ok(());
        }

        let child = dir
            .children
            .entry(BString::from(*head))
            .or_insert_with(|| Node::Dir(DirNode::new()));
        match child {
            Node::Dir(child_dir) => Self::insert(child_dir, rest, leaf),
            Node::Blob { .. } => Err(FastImportError::Protocol(format!(
                "path '{}' treats a file as a directory",
                String::from_utf8_lossy(head)
            ))),
        }
    }

    pub fn remove(&mut self, path: &[u8]) -> Result<(), FastImportError> {
        let components = split_path(path)?;
        Self::remove_inner(&mut self.root, &components);
        Ok(())
    }

    fn remove_inner(dir: &mut DirNode, components: &[&BStr]) {
        let (head, rest) = match components.split_first() {
            Some(v) => v,
            None => return,
        };
        if rest.is_empty() {
            if dir.children.remove(*head).is_some() {
                dir.dirty = true;
                dir.cached_id = None;
            }
            return;
        }
        if let Some(Node::Dir(child)) = dir.children.get_mut(*head) {
            Self::remove_inner(child, rest);
            dir.dirty = true;
            dir.cached_id = None;
        }
    }

    pub fn delete_all(&mut self) {
        self.root = DirNode::new();
    }

    /// `R <src> <dst>`: move a path (file or subtree).
    pub fn rename(&mut self, src: &[u8], dst: &[u8]) -> Result<(), FastImportError> {
        let node = Self::take(&mut self.root, &split_path(src)?)
            .ok_or_else(|| FastImportError::Protocol(format!("rename: no such path '{}'", BStr::new(src))))?;
        let components = split_path(dst)?;
        Self::insert(&mut self.root, &components, node)
    }

    /// `C <src> <dst>`: copy a path (file or subtree).
    pub fn copy(&mut self, src: &[u8], dst: &[u8]) -> Result<(), FastImportError> {
        let node = Self::find(&self.root, &split_path(src)?)
            .cloned()
            .ok_or_else(|| FastImportError::Protocol(format!("copy: no such path '{}'", BStr::new(src))))?;
        let components = split_path(dst)?;
        Self::insert(&mut self.root, &components, node)
    }

    fn find<'a>(dir: &'a DirNode, components: &[&BStr]) -> Option<&'a Node> {
        let (head, rest) = components.split_first()?;
        let child = dir.children.get(*head)?;
        if rest.is_empty() {
            return Some(child);
        }
        match child {
            Node::Dir(child_dir) => Self::find(child_dir, rest),
            Node::Blob { .. } => None,
        }
    }

    fn take(dir: &mut DirNode, components: &[&BStr]) -> Option<Node> {
        let (head, rest) = components.split_first()?;
        if rest.is_empty() {
            dir.dirty = true;
            dir.cached_id = None;
            return dir.children.remove(*head);
        }
        match dir.children.get_mut(*head)? {
            Node::Dir(child_dir) => {
                let result = Self::take(child_dir, rest);
                if result.is_some() {
                    dir.dirty = true;
                    dir.cached_id = None;
                }
                result
            }
            Node::Blob { .. } => None,
        }
    }

    /// Serialize every dirty subtree into a tree object, queuing newly-seen
    /// ids as pending pack candidates, and return the root tree's id.
    pub fn commit(&mut self, queued: &mut std::collections::HashSet<ObjectId>, pending: &mut Vec<PendingObject>) -> ObjectId {
        serialize(&mut self.root, b"", queued, pending)
    }

    /// `ls`: look up a path without touching dirty/cached state. Only blob
    /// entries resolve; a directory entry would need serializing to get an
    /// id, which `ls` must not do as a side effect, so it reports as absent.
    pub fn lookup(&self, path: &[u8]) -> Option<(FileMode, ObjectId)> {
        let components = split_path(path).ok()?;
        match Self::find(&self.root, &components)? {
            Node::Blob { mode, id } => Some((*mode, *id)),
            Node::Dir(_) => None,
        }
    }
}

fn serialize(
    dir: &mut DirNode,
    path_prefix: &[u8],
    queued: &mut std::collections::HashSet<ObjectId>,
    pending: &mut Vec<PendingObject>,
) -> ObjectId {
    if !dir.dirty {
        return dir.cached_id.expect("clean directory must have a cached id");
    }

    let mut entries = Vec::with_capacity(dir.children.len());
    for (name, child) in dir.children.iter_mut() {
        let mut child_path = path_prefix.to_vec();
        child_path.extend_from_slice(name);
        let (mode, id) = match child {
            Node::Blob { mode, id } => (*mode, *id),
            Node::Dir(child_dir) => {
                child_path.push(b'/');
                let id = serialize(child_dir, &child_path, queued, pending);
                (FileMode::Tree, id)
            }
        };
        entries.push(GitTreeEntry {
            mode,
            name: name.clone(),
            oid: id,
        });
    }

    let tree = Tree { entries };
    let content = tree.serialize_content();
    let id = Hasher::hash_object(HashAlgorithm::Sha1, "tree", &content)
        .expect("sha1 hashing cannot fail");

    if queued.insert(id) {
        pending.push(PendingObject {
            id,
            obj_type: ObjectType::Tree,
            data: content,
            name_hint: path_prefix.to_vec(),
        });
    }

    dir.dirty = false;
    dir.cached_id = Some(id);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn blob_id(byte: u8) -> ObjectId {
        let mut bytes = [0u8; 20];
        bytes[0] = byte;
        ObjectId::Sha1(bytes)
    }

    #[test]
    fn single_file_commit_produces_one_tree() {
        let mut tree = WorkingTree::new();
        tree.set_blob(b"README.md", FileMode::Regular, blob_id(1)).unwrap();

        let mut queued = HashSet::new();
        let mut pending = Vec::new();
        let root_id = tree.commit(&mut queued, &mut pending);

        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, root_id);
        assert_eq!(pending[0].obj_type, ObjectType::Tree);
    }

    #[test]
    fn nested_path_creates_subtree() {
        let mut tree = WorkingTree::new();
        tree.set_blob(b"src/lib.rs", FileMode::Regular, blob_id(2)).unwrap();

        let mut queued = HashSet::new();
        let mut pending = Vec::new();
        tree.commit(&mut queued, &mut pending);

        // root tree + "src" subtree
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().any(|p| p.name_hint == b"src/".to_vec()));
    }

    #[test]
    fn unmodified_subtree_is_not_requeued() {
        let mut tree = WorkingTree::new();
        tree.set_blob(b"src/lib.rs", FileMode::Regular, blob_id(3)).unwrap();
        tree.set_blob(b"top.txt", FileMode::Regular, blob_id(4)).unwrap();

        let mut queued = HashSet::new();
        let mut pending = Vec::new();
        tree.commit(&mut queued, &mut pending);
        let first_count = pending.len();

        // Touch only the top-level file; "src" subtree must stay clean.
        tree.set_blob(b"top.txt", FileMode::Regular, blob_id(5)).unwrap();
        tree.commit(&mut queued, &mut pending);

        assert_eq!(pending.len(), first_count + 1); // only the new root tree
    }

    fn contains_path(tree: &WorkingTree, path: &[u8]) -> bool {
        WorkingTree::find(&tree.root, &split_path(path).unwrap()).is_some()
    }

    #[test]
    fn rename_moves_a_file() {
        let mut tree = WorkingTree::new();
        tree.set_blob(b"a.txt", FileMode::Regular, blob_id(6)).unwrap();
        tree.rename(b"a.txt", b"b.txt").unwrap();

        let mut queued = HashSet::new();
        let mut pending = Vec::new();
        tree.commit(&mut queued, &mut pending);
        assert!(contains_path(&tree, b"b.txt"));
        assert!(!contains_path(&tree, b"a.txt"));
    }

    #[test]
    fn delete_all_clears_tree() {
        let mut tree = WorkingTree::new();
        tree.set_blob(b"a.txt", FileMode::Regular, blob_id(7)).unwrap();
        tree.delete_all();
        assert!(!contains_path(&tree, b"a.txt"));
    }

    #[test]
    fn path_conflict_is_protocol_error() {
        let mut tree = WorkingTree::new();
        tree.set_blob(b"a", FileMode::Regular, blob_id(8)).unwrap();
        let result = tree.set_blob(b"a/b", FileMode::Regular, blob_id(9));
        assert!(result.is_err());
    }
}
