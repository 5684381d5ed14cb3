//! Delta-base selection heuristics for [`crate::write::PackWriter`] (§4.1,
//! §4.2 phase 2): name-hint locality hashing, type/size ordering, and the
//! backwards sliding-window search over [`crate::delta::index::DeltaIndex`].

use git_hash::ObjectId;
use git_object::ObjectType;

use crate::delta::index::DeltaIndex;

/// Hash length subtracted from the delta size budget, mirroring the
/// allowance the legacy writer reserves for the trailer/header overhead a
/// delta-selected object still needs room for.
const HASH_LEN: usize = 20;

/// Default sliding-window size (number of recently-seen objects considered
/// as delta-base candidates for each new entry).
pub const DEFAULT_WINDOW: usize = 10;

/// Default maximum delta chain depth for the pack writer.
pub const DEFAULT_MAX_DEPTH: usize = 10;

/// Default maximum delta chain depth used by the fast-import engine, which
/// favors longer chains since it never re-packs afterwards.
pub const FAST_IMPORT_MAX_DEPTH: usize = 50;

/// An object under consideration for inclusion in a pack, as understood by
/// the delta-selection pass. This is a narrowed view of the writer's
/// `ObjectEntry` (§3): just what the search needs to pick bases.
#[derive(Debug, Clone)]
pub struct CandidateEntry {
    pub id: ObjectId,
    pub obj_type: ObjectType,
    pub data: Vec<u8>,
    /// Locality key material — the path the object was reached at, if any.
    /// The trailing non-whitespace characters feed [`name_hint_hash`].
    pub name_hint: Vec<u8>,
    /// A preferred base participates in selection but is never itself
    /// emitted into the pack (§3 `PreferredBase`).
    pub preferred_base: bool,
    /// If this object already exists as a delta against a base also present
    /// in this candidate set, this is the reusable edge (writer phase 1,
    /// "Detail"). Reuse bypasses delta search entirely.
    pub reuse: Option<ReuseDelta>,
}

/// A delta edge carried over from an existing pack, not recomputed.
#[derive(Debug, Clone)]
pub struct ReuseDelta {
    pub base_id: ObjectId,
    pub depth: usize,
    /// The delta's own remaining budget from its source pack, propagated so
    /// a reused chain cannot silently exceed `max_depth` end to end.
    pub delta_limit: usize,
    pub delta_bytes: Vec<u8>,
}

/// The outcome of delta search for one candidate: which earlier-indexed
/// candidate it should be encoded against, and the resulting bytes.
#[derive(Debug, Clone)]
pub struct SelectedDelta {
    pub base_index: usize,
    pub delta: Vec<u8>,
    pub depth: usize,
}

/// Derive a locality key from the trailing non-whitespace characters of a
/// path, so objects with similar extensions/suffixes (e.g. `*.c` files)
/// sort near each other before delta search.
pub fn name_hint_hash(name_hint: &[u8]) -> u32 {
    let trailing: Vec<u8> = name_hint
        .iter()
        .rev()
        .take_while(|&&b| !b.is_ascii_whitespace())
        .copied()
        .collect();

    let mut hash: u32 = 0;
    // Walk front-to-back of the trailing run (i.e. reverse the reversal)
    // so hash depends on character identity and position consistently.
    for &b in trailing.iter().rev() {
        hash = (hash << 8).wrapping_add(hash >> 24).wrapping_add(b as u32);
    }
    hash
}

/// Produce the search order: group by type, then by `name_hint_hash`, then
/// by size descending within a type. Returns indices into `entries`.
pub fn sort_for_delta_search(entries: &[CandidateEntry]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..entries.len()).collect();
    order.sort_by(|&a, &b| {
        let ea = &entries[a];
        let eb = &entries[b];
        type_rank(ea.obj_type)
            .cmp(&type_rank(eb.obj_type))
            .then_with(|| name_hint_hash(&ea.name_hint).cmp(&name_hint_hash(&eb.name_hint)))
            .then_with(|| eb.data.len().cmp(&ea.data.len()))
    });
    order
}

fn type_rank(t: ObjectType) -> u8 {
    match t {
        ObjectType::Commit => 0,
        ObjectType::Tree => 1,
        ObjectType::Blob => 2,
        ObjectType::Tag => 3,
    }
}

struct WindowSlot {
    entry_index: usize,
    depth: usize,
    delta_limit: usize,
}

/// Walk `order` backwards with a sliding window of `window` recently-seen
/// objects, trying each window slot as a delta base for the current
/// candidate. Returns, per position in `order`, the selected delta (if
/// any) against an earlier-or-later candidate in the same set.
///
/// `max_depth` bounds chain length; objects already carrying a [`ReuseDelta`]
/// are returned verbatim (phase 1 already validated them) and also seed the
/// window with their reuse depth so dependents of a reused chain still
/// respect the cap.
pub fn select_deltas(
    entries: &[CandidateEntry],
    order: &[usize],
    window: usize,
    max_depth: usize,
) -> Vec<Option<SelectedDelta>> {
    let mut result: Vec<Option<SelectedDelta>> = vec![None; entries.len()];
    let mut slots: std::collections::VecDeque<WindowSlot> = std::collections::VecDeque::new();

    for &idx in order.iter().rev() {
        let entry = &entries[idx];

        if let Some(reuse) = &entry.reuse {
            if let Some(base_idx) = entries.iter().position(|e| e.id == reuse.base_id) {
                result[idx] = Some(SelectedDelta {
                    base_index: base_idx,
                    delta: reuse.delta_bytes.clone(),
                    depth: reuse.depth,
                });
                slots.push_front(WindowSlot {
                    entry_index: idx,
                    depth: reuse.depth,
                    delta_limit: reuse.delta_limit,
                });
                if slots.len() > window {
                    slots.pop_back();
                }
                continue;
            }
        }

        let target_budget = entry.data.len() / 2;
        let mut best: Option<(usize, Vec<u8>, usize)> = None;

        for slot in slots.iter() {
            let base = &entries[slot.entry_index];
            if base.obj_type != entry.obj_type {
                continue;
            }
            let depth = slot.depth + 1;
            if depth > max_depth || depth > slot.delta_limit {
                continue;
            }
            let max_size = target_budget
                .saturating_sub(HASH_LEN)
                .saturating_mul(max_depth.saturating_sub(depth) + 1)
                / max_depth.max(1);
            let max_size = max_size.max(HASH_LEN + 1);

            let Some(index) = DeltaIndex::build(&base.data) else {
                continue;
            };
            let Some(delta) = index.emit(&entry.data, max_size) else {
                continue;
            };

            let better = match &best {
                None => true,
                Some((_, best_delta, _)) => {
                    // Tie-break: prefer a smaller delta; among equal sizes,
                    // prefer a base larger than the target (delete-biased).
                    delta.len() < best_delta.len()
                        || (delta.len() == best_delta.len()
                            && base.data.len() > entry.data.len())
                }
            };
            if better {
                best = Some((slot.entry_index, delta, depth));
            }
        }

        if let Some((base_index, delta, depth)) = best {
            result[idx] = Some(SelectedDelta {
                base_index,
                delta,
                depth,
            });
            slots.push_front(WindowSlot {
                entry_index: idx,
                depth,
                delta_limit: max_depth,
            });
        } else {
            slots.push_front(WindowSlot {
                entry_index: idx,
                depth: 0,
                delta_limit: max_depth,
            });
        }
        if slots.len() > window {
            slots.pop_back();
        }
    }

    result
}
