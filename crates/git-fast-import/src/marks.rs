//! The mark table: a sparse radix tree mapping small integers to object
//! entries, used by fast-import streams to reference objects by mark
//! (`:123`) instead of by hex id before the id is known.
//!
//! Marks are looked up and inserted far more often than the table is grown,
//! so the tree favors an allocate-on-demand layout: each level holds 1024
//! slots (10 bits of the mark id) and only the path down to marks actually
//! used is ever allocated.

use git_hash::ObjectId;
use git_object::ObjectType;

const BITS_PER_LEVEL: u32 = 10;
const WIDTH: usize = 1 << BITS_PER_LEVEL;
const MASK: u64 = (WIDTH as u64) - 1;

/// What a mark resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkedObject {
    pub id: ObjectId,
    pub obj_type: ObjectType,
}

enum Node {
    Leaf(Vec<Option<MarkedObject>>),
    Inner(Vec<Option<Box<Node>>>),
}

impl Node {
    fn new_leaf() -> Self {
        Node::Leaf(vec![None; WIDTH])
    }

    fn new_inner() -> Self {
        Node::Inner((0..WIDTH).map(|_| None).collect())
    }
}

/// Sparse 1024-fanout mark table (§3 `Mark`).
pub struct MarkTable {
    top: Option<Box<Node>>,
    /// Number of `Inner` levels above the leaf; top spans ids
    /// `< WIDTH^(depth + 1)`.
    depth: u32,
}

impl Default for MarkTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkTable {
    pub fn new() -> Self {
        Self { top: None, depth: 0 }
    }

    /// Grow the tree by one level, wrapping the existing top as child 0 of a
    /// new inner node, so ids up to `WIDTH` times larger can be addressed.
    fn grow(&mut self) {
        let mut new_top = Node::new_inner();
        if let Node::Inner(children) = &mut new_top {
            children[0] = self.top.take();
        }
        self.top = Some(Box::new(new_top));
        self.depth += 1;
    }

    fn ensure_capacity(&mut self, mark: u64) {
        if self.top.is_none() {
            self.top = Some(Box::new(if self.depth == 0 {
                Node::new_leaf()
            } else {
                Node::new_inner()
            }));
        }
        while mark >> (BITS_PER_LEVEL * (self.depth + 1)) != 0 {
            self.grow();
        }
    }

    /// Assign `mark` to `entry`, overwriting any previous assignment
    /// (supports `alias`, which repoints an existing mark).
    pub fn insert(&mut self, mark: u64, entry: MarkedObject) {
        self.ensure_capacity(mark);
        let mut node = self.top.as_mut().unwrap().as_mut();
        let mut level = self.depth;
        loop {
            let shift = BITS_PER_LEVEL * level;
            let index = ((mark >> shift) & MASK) as usize;
            match node {
                Node::Inner(children) => {
                    if level == 1 {
                        let child = children[index].get_or_insert_with(|| Box::new(Node::new_leaf()));
                        node = child.as_mut();
                    } else {
                        let child =
                            children[index].get_or_insert_with(|| Box::new(Node::new_inner()));
                        node = child.as_mut();
                    }
                    level -= 1;
                }
                Node::Leaf(slots) => {
                    slots[index] = Some(entry);
                    return;
                }
            }
        }
    }

    pub fn get(&self, mark: u64) -> Option<MarkedObject> {
        let mut node = self.top.as_deref()?;
        let mut level = self.depth;
        loop {
            let shift = BITS_PER_LEVEL * level;
            let index = ((mark >> shift) & MASK) as usize;
            match node {
                Node::Inner(children) => {
                    node = children[index].as_deref()?;
                    level -= 1;
                }
                Node::Leaf(slots) => return slots[index],
            }
        }
    }

    /// All assigned marks in ascending id order, as `(mark, entry)` pairs —
    /// used for `export-marks` and checkpoint writes.
    pub fn iter_sorted(&self) -> Vec<(u64, MarkedObject)> {
        let mut out = Vec::new();
        if let Some(top) = &self.top {
            walk(top, self.depth, 0, &mut out);
        }
        out
    }
}

fn walk(node: &Node, level: u32, prefix: u64, out: &mut Vec<(u64, MarkedObject)>) {
    match node {
        Node::Inner(children) => {
            for (index, child) in children.iter().enumerate() {
                if let Some(child) = child {
                    let mark = (prefix << BITS_PER_LEVEL) | index as u64;
                    walk(child, level - 1, mark, out);
                }
            }
        }
        Node::Leaf(slots) => {
            for (index, slot) in slots.iter().enumerate() {
                if let Some(entry) = slot {
                    let mark = (prefix << BITS_PER_LEVEL) | index as u64;
                    out.push((mark, *entry));
                }
            }
        }
    }
}

/// Render the table to the `:<mark> <hex-id>` text format `export-marks`
/// and checkpoint writes use, one line per mark in ascending order.
pub fn render_marks_file(table: &MarkTable) -> String {
    let mut out = String::new();
    for (mark, entry) in table.iter_sorted() {
        out.push_str(&format!(":{} {}\n", mark, entry.id.to_hex()));
    }
    out
}
