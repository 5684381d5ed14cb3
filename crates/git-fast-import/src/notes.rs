//! Note-tree fanout rewriting (§2a, §4.6): `refs/notes/*` trees store one
//! entry per annotated object, keyed by the object's hex id split into
//! directory components so a single flat tree never grows unreasonably
//! large. The split point (the "fanout") grows with the number of notes.

use git_hash::ObjectId;

/// Fanout for `count` notes: `ceil(log_256(count))` directory levels of hex
/// pairs prefixed onto the final path component, mirroring
/// `construct_path_with_fanout`'s recompute trigger.
pub fn fanout_for_count(count: usize) -> usize {
    let mut fanout = 0;
    let mut capacity: u64 = 256;
    while (count as u64) > capacity && fanout < 19 {
        fanout += 1;
        capacity = capacity.saturating_mul(256);
    }
    fanout
}

/// Render the note path for `id` at the given fanout, e.g. fanout 1 turns
/// `abcdef01...` into `ab/cdef01...`.
pub fn note_path(id: &ObjectId, fanout: usize) -> String {
    let hex = id.to_hex();
    let fanout = fanout.min(hex.len() / 2);
    let mut path = String::with_capacity(hex.len() + fanout);
    let mut rest = hex.as_str();
    for _ in 0..fanout {
        let (prefix, tail) = rest.split_at(2);
        path.push_str(prefix);
        path.push('/');
        rest = tail;
    }
    path.push_str(rest);
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fanout_zero_below_256_notes() {
        assert_eq!(fanout_for_count(0), 0);
        assert_eq!(fanout_for_count(255), 0);
        assert_eq!(fanout_for_count(256), 0);
    }

    #[test]
    fn fanout_grows_past_256() {
        assert_eq!(fanout_for_count(257), 1);
        assert_eq!(fanout_for_count(65536), 1);
        assert_eq!(fanout_for_count(65537), 2);
    }

    #[test]
    fn note_path_with_fanout_one() {
        let id = ObjectId::from_hex("abcdef0123456789abcdef0123456789abcdef01").unwrap();
        assert_eq!(note_path(&id, 1), "ab/cdef0123456789abcdef0123456789abcdef01");
    }

    #[test]
    fn note_path_with_no_fanout() {
        let id = ObjectId::from_hex("abcdef0123456789abcdef0123456789abcdef01").unwrap();
        assert_eq!(note_path(&id, 0), "abcdef0123456789abcdef0123456789abcdef01");
    }
}
