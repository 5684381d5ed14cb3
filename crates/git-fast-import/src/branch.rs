//! Branch table: the set of refs being built by an import, each with its
//! own working tree (§3 `Branch`). Branches are kept on an LRU list; once
//! more than `max_active` are live, the least-recently-touched branch's
//! working tree is dropped (its tip id is all that's needed to resume it
//! later from a `from` reference).

use std::collections::HashMap;

use bstr::BString;
use git_hash::ObjectId;

use crate::tree::WorkingTree;

/// Default cap on branches kept fully materialized in memory at once,
/// mirroring fast-import's own default.
pub const DEFAULT_MAX_ACTIVE: usize = 5;

pub struct Branch {
    pub name: BString,
    pub tip: Option<ObjectId>,
    pub tree: WorkingTree,
    /// Monotonic commit clock recorded so committer timestamps never move
    /// backwards within a branch when the stream omits explicit dates.
    pub last_commit_clock: i64,
    active: bool,
    /// Set when eviction drops a non-empty tree; cleared once the caller
    /// has rebuilt `tree` from `tip` after a reactivating `touch`.
    needs_rebuild: bool,
}

impl Branch {
    fn new(name: BString) -> Self {
        Self {
            name,
            tip: None,
            tree: WorkingTree::new(),
            last_commit_clock: 0,
            active: true,
            needs_rebuild: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }
}

/// All branches known to the current import, with LRU-bounded active sets.
pub struct BranchTable {
    branches: HashMap<BString, Branch>,
    recency: Vec<BString>,
    max_active: usize,
}

impl BranchTable {
    pub fn new(max_active: usize) -> Self {
        Self {
            branches: HashMap::new(),
            recency: Vec::new(),
            max_active,
        }
    }

    /// Get or create the branch, marking it as most-recently-used. If this
    /// reactivates a branch whose tree was dropped by a prior eviction,
    /// the returned branch's [`Branch::needs_rebuild`] is set; the caller
    /// is responsible for repopulating `tree` from `tip` and clearing it
    /// via [`Self::clear_needs_rebuild`].
    pub fn touch(&mut self, name: &[u8]) -> &mut Branch {
        let key = BString::from(name);
        if !self.branches.contains_key(&key) {
            self.branches.insert(key.clone(), Branch::new(key.clone()));
        }
        self.recency.retain(|n| n != &key);
        self.recency.push(key.clone());
        self.branches.get_mut(&key).unwrap().active = true;
        self.evict_if_needed();
        self.branches.get_mut(&key).unwrap()
    }

    pub fn clear_needs_rebuild(&mut self, name: &[u8]) {
        if let Some(branch) = self.branches.get_mut(&BString::from(name)) {
            branch.needs_rebuild = false;
        }
    }

    pub fn get(&self, name: &[u8]) -> Option<&Branch> {
        self.branches.get(&BString::from(name))
    }

    pub fn get_mut(&mut self, name: &[u8]) -> Option<&mut Branch> {
        self.branches.get_mut(&BString::from(name))
    }

    fn evict_if_needed(&mut self) {
        let active_count = self
            .recency
            .iter()
            .filter(|n| self.branches.get(*n).map(|b| b.active).unwrap_or(false))
            .count();
        if active_count <= self.max_active {
            return;
        }
        for name in &self.recency {
            if let Some(branch) = self.branches.get_mut(name) {
                if branch.active {
                    branch.active = false;
                    branch.needs_rebuild = branch.tip.is_some();
                    branch.tree = WorkingTree::new();
                    break;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Branch> {
        self.branches.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bstr::ByteSlice;

    #[test]
    fn touch_creates_branch_on_first_use() {
        let mut table = BranchTable::new(DEFAULT_MAX_ACTIVE);
        let branch = table.touch(b"refs/heads/main");
        assert_eq!(branch.name.as_bytes(), b"refs/heads/main");
        assert!(branch.tip.is_none());
    }

    #[test]
    fn evicts_least_recently_touched_past_max_active() {
        let mut table = BranchTable::new(2);
        table.touch(b"a");
        table.touch(b"b");
        table.touch(b"c"); // should evict "a"

        assert!(!table.get(b"a").unwrap().is_active());
        assert!(table.get(b"b").unwrap().is_active());
        assert!(table.get(b"c").unwrap().is_active());
    }

    #[test]
    fn touching_again_keeps_branch_active() {
        let mut table = BranchTable::new(2);
        table.touch(b"a");
        table.touch(b"b");
        table.touch(b"a"); // refresh recency
        table.touch(b"c"); // should evict "b", not "a"

        assert!(table.get(b"a").unwrap().is_active());
        assert!(!table.get(b"b").unwrap().is_active());
    }
}
