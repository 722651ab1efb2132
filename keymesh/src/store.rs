//! Sorted `(key, rank)` usage records.
//!
//! The per-rank record store is a flat vector sorted lexicographically by
//! key then rank, with no duplicate pairs. A key used by several ranks
//! appears once per rank; that is how sharing is represented. Bulk erase
//! marks doomed entries with a rank sentinel and compacts in one sweep so
//! the vector stays sorted without a re-sort.

use crate::{Key, Rank};

/// Rank sentinel marking an entry for removal.
const TOMBSTONE_RANK: Rank = -1;

/// One usage record: `rank` uses `key`.
///
/// The derived ordering is lexicographic with the key as the primary
/// field, which is what every merge walk in the index relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyRank {
    pub key: Key,
    pub rank: Rank,
}

impl KeyRank {
    /// Create a new record.
    #[inline]
    pub fn new(key: Key, rank: Rank) -> Self {
        Self { key, rank }
    }
}

/// Sort the records and drop exact duplicates.
///
/// Called exactly once at the end of every mutating collective to restore
/// the store invariant.
pub fn sort_unique(records: &mut Vec<KeyRank>) {
    records.sort_unstable();
    records.dedup();
}

/// Index of the first record with `record.key >= key`.
#[inline]
pub fn lower_bound_key(records: &[KeyRank], key: Key) -> usize {
    records.partition_point(|kr| kr.key < key)
}

/// Mark `target` for removal if present.
///
/// Binary-searches the key, then scans the run of records with that key.
/// The key fields stay intact, so later searches by key remain valid even
/// with marks outstanding. Absent targets are ignored.
pub fn mark_removed(records: &mut [KeyRank], target: KeyRank) {
    let mut i = lower_bound_key(records, target.key);
    while i < records.len() && records[i].key == target.key {
        if records[i] == target {
            records[i].rank = TOMBSTONE_RANK;
            return;
        }
        i += 1;
    }
}

/// Drop every record marked by [`mark_removed`], preserving order.
pub fn sweep_removed(records: &mut Vec<KeyRank>) {
    records.retain(|kr| kr.rank != TOMBSTONE_RANK);
}

/// Count distinct keys with `key <= last_key`, starting at `*cursor`.
///
/// Advances the cursor past every counted run so consecutive calls with
/// increasing bounds walk the store once in total.
pub fn count_distinct_through(records: &[KeyRank], cursor: &mut usize, last_key: Key) -> u64 {
    let mut count = 0;
    while *cursor < records.len() && records[*cursor].key <= last_key {
        let key = records[*cursor].key;
        while *cursor < records.len() && records[*cursor].key == key {
            *cursor += 1;
        }
        count += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::Rng;
    use std::collections::BTreeSet;

    #[test]
    fn test_ordering_is_key_major() {
        assert!(KeyRank::new(1, 5) < KeyRank::new(2, 0));
        assert!(KeyRank::new(2, 0) < KeyRank::new(2, 1));
        assert_eq!(KeyRank::new(3, 3), KeyRank::new(3, 3));
    }

    #[test]
    fn test_sort_unique() {
        let mut records = vec![
            KeyRank::new(5, 1),
            KeyRank::new(1, 0),
            KeyRank::new(5, 1),
            KeyRank::new(5, 0),
            KeyRank::new(1, 0),
        ];
        sort_unique(&mut records);
        assert_eq!(
            records,
            vec![KeyRank::new(1, 0), KeyRank::new(5, 0), KeyRank::new(5, 1)]
        );
    }

    #[test]
    fn test_lower_bound_key() {
        let records = vec![
            KeyRank::new(2, 0),
            KeyRank::new(4, 0),
            KeyRank::new(4, 1),
            KeyRank::new(9, 2),
        ];
        assert_eq!(lower_bound_key(&records, 0), 0);
        assert_eq!(lower_bound_key(&records, 2), 0);
        assert_eq!(lower_bound_key(&records, 3), 1);
        assert_eq!(lower_bound_key(&records, 4), 1);
        assert_eq!(lower_bound_key(&records, 5), 3);
        assert_eq!(lower_bound_key(&records, 10), 4);
    }

    #[test]
    fn test_mark_and_sweep() {
        let mut records = vec![
            KeyRank::new(2, 0),
            KeyRank::new(4, 0),
            KeyRank::new(4, 1),
            KeyRank::new(4, 3),
            KeyRank::new(9, 2),
        ];
        mark_removed(&mut records, KeyRank::new(4, 1));
        mark_removed(&mut records, KeyRank::new(9, 2));
        // Absent pairs are ignored.
        mark_removed(&mut records, KeyRank::new(4, 2));
        mark_removed(&mut records, KeyRank::new(100, 0));

        sweep_removed(&mut records);
        assert_eq!(
            records,
            vec![KeyRank::new(2, 0), KeyRank::new(4, 0), KeyRank::new(4, 3)]
        );
    }

    #[test]
    fn test_mark_same_key_twice() {
        let mut records = vec![KeyRank::new(4, 0), KeyRank::new(4, 1), KeyRank::new(4, 2)];
        mark_removed(&mut records, KeyRank::new(4, 2));
        mark_removed(&mut records, KeyRank::new(4, 0));
        sweep_removed(&mut records);
        assert_eq!(records, vec![KeyRank::new(4, 1)]);
    }

    #[test]
    fn test_count_distinct_through() {
        let records = vec![
            KeyRank::new(1, 0),
            KeyRank::new(1, 2),
            KeyRank::new(3, 0),
            KeyRank::new(7, 1),
            KeyRank::new(7, 2),
            KeyRank::new(20, 0),
        ];
        let mut cursor = 0;
        assert_eq!(count_distinct_through(&records, &mut cursor, 9), 3);
        assert_eq!(cursor, 5);
        assert_eq!(count_distinct_through(&records, &mut cursor, 30), 1);
        assert_eq!(cursor, 6);
        assert_eq!(count_distinct_through(&records, &mut cursor, u64::MAX), 0);
    }

    #[test]
    fn test_sort_unique_matches_set_semantics() {
        let mut rng = rand::thread_rng();
        let mut records = Vec::new();
        let mut reference = BTreeSet::new();
        for _ in 0..1000 {
            let kr = KeyRank::new(rng.gen_range(0..64), rng.gen_range(0..8));
            records.push(kr);
            reference.insert(kr);
        }
        records.shuffle(&mut rng);
        sort_unique(&mut records);
        assert_eq!(records, reference.into_iter().collect::<Vec<_>>());
    }
}
