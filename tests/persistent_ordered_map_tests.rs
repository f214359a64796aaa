//! Unit tests for `PersistentOrderedMap`.

use std::collections::BTreeMap;

use perdure::persistent::PersistentOrderedMap;
use rstest::rstest;

// =============================================================================
// Basic Construction Tests
// =============================================================================

#[rstest]
fn test_new_creates_empty_map() {
    let map: PersistentOrderedMap<i32, String> = PersistentOrderedMap::new();
    assert!(map.is_empty());
    assert_eq!(map.len(), 0);
    assert!(map.check_invariants().is_ok());
}

#[rstest]
fn test_default_creates_empty_map() {
    let map: PersistentOrderedMap<i32, String> = PersistentOrderedMap::default();
    assert!(map.is_empty());
}

#[rstest]
fn test_singleton_creates_map_with_one_entry() {
    let map = PersistentOrderedMap::singleton(42, "answer");
    assert_eq!(map.len(), 1);
    assert_eq!(map.get(&42), Some(&"answer"));
}

// =============================================================================
// Insert / Get / Remove Tests
// =============================================================================

#[rstest]
fn test_set_get_and_delete() {
    let map: PersistentOrderedMap<&str, &str> = PersistentOrderedMap::new();
    assert!(map.is_empty());
    assert!(map.check_invariants().is_ok());

    let map = map.insert("foo", "bar");
    assert!(!map.is_empty());
    assert_eq!(map.len(), 1);
    assert!(map.check_invariants().is_ok());

    assert_eq!(map.get(&"foo"), Some(&"bar"));
    // Neighbors of the stored key are absent.
    assert_eq!(map.get(&"fom"), None);
    assert_eq!(map.get(&"fop"), None);

    let map = map.insert("qux", "quux");
    assert_eq!(map.len(), 2);
    assert!(map.check_invariants().is_ok());
    assert_eq!(map.get(&"foo"), Some(&"bar"));

    let map = map.remove(&"foo");
    assert_eq!(map.len(), 1);
    assert_eq!(map.get(&"foo"), None);
    assert_eq!(map.get(&"qux"), Some(&"quux"));
}

#[rstest]
fn test_insert_overwrites_existing_key() {
    let map1 = PersistentOrderedMap::new().insert(1, "one");
    let map2 = map1.insert(1, "ONE");

    assert_eq!(map1.get(&1), Some(&"one"));
    assert_eq!(map2.get(&1), Some(&"ONE"));
    assert_eq!(map1.len(), 1);
    assert_eq!(map2.len(), 1);
}

#[rstest]
fn test_remove_nonexistent_key_returns_equal_map() {
    let map = PersistentOrderedMap::new().insert(1, "one");
    let removed = map.remove(&99);

    assert_eq!(removed.len(), 1);
    assert_eq!(removed.get(&1), Some(&"one"));
}

#[rstest]
fn test_remove_last_entry_yields_empty_map() {
    let map = PersistentOrderedMap::new().insert(1, "one");
    let removed = map.remove(&1);

    assert!(removed.is_empty());
    assert_eq!(removed.len(), 0);
    assert!(removed.check_invariants().is_ok());
}

#[rstest]
fn test_borrowed_key_lookup() {
    let map = PersistentOrderedMap::new().insert("hello".to_string(), 42);
    assert_eq!(map.get("hello"), Some(&42));
    assert!(map.contains_key("hello"));
    assert!(!map.contains_key("world"));
}

/// Every prefix of ascending insertions stays a valid tree, and deleting
/// any single key from it leaves the remaining keys intact and balanced.
#[rstest]
fn test_delete_sweep_preserves_invariants_and_order() {
    let mut map: PersistentOrderedMap<i32, i32> = PersistentOrderedMap::new();
    for i in 0..50 {
        map = map.insert(i, i);
        map.check_invariants()
            .unwrap_or_else(|violation| panic!("after insert {i}: {violation}"));

        for j in 0..=i {
            let reduced = map.remove(&j);
            reduced
                .check_invariants()
                .unwrap_or_else(|violation| panic!("i={i}, j={j}: {violation}"));

            let mut expected = 0;
            let mut cursor = reduced.min();
            while let Some(entry) = cursor {
                if expected == j {
                    expected += 1;
                }
                assert_eq!(*entry.key(), expected, "i={i}, j={j}");
                assert_eq!(*entry.value(), expected, "i={i}, j={j}");
                expected += 1;
                cursor = entry.next();
            }
        }
    }
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[rstest]
fn test_insert_preserves_original() {
    let map1 = PersistentOrderedMap::new().insert(1, "one");
    let map2 = map1.insert(2, "two");

    assert_eq!(map1.len(), 1);
    assert_eq!(map2.len(), 2);
    assert_eq!(map1.get(&2), None);
    assert_eq!(map2.get(&2), Some(&"two"));
}

#[rstest]
fn test_remove_preserves_original() {
    let map = PersistentOrderedMap::new()
        .insert(1, "one")
        .insert(2, "two")
        .insert(3, "three");
    let removed = map.remove(&2);

    assert_eq!(map.len(), 3);
    assert_eq!(map.get(&2), Some(&"two"));
    assert_eq!(removed.len(), 2);
    assert_eq!(removed.get(&2), None);
}

#[rstest]
fn test_old_version_iterates_unchanged_after_updates() {
    let original: PersistentOrderedMap<i32, i32> = (0..100).map(|i| (i, i)).collect();
    let mut mutated = original.clone();
    for i in 0..50 {
        mutated = mutated.remove(&(i * 2)).insert(1000 + i, i);
    }

    let keys: Vec<i32> = original.keys().copied().collect();
    assert_eq!(keys, (0..100).collect::<Vec<i32>>());
    assert_eq!(original.len(), 100);
}

// =============================================================================
// Iteration and Rank Tests
// =============================================================================

#[rstest]
fn test_iteration_with_ranks_over_thousand_entries() {
    let mut map: PersistentOrderedMap<i32, i32> = PersistentOrderedMap::new();
    assert!(map.min().is_none());
    assert!(map.max().is_none());

    for i in 0..1000 {
        map = map.insert(i, i * 2);
    }

    let mut cursor = map.min();
    for i in 0..1000 {
        let entry = cursor.expect("cursor ended early");
        assert_eq!(*entry.key(), i);
        assert_eq!(*entry.value(), i * 2);
        assert_eq!(entry.count_less(), usize::try_from(i).unwrap());
        assert_eq!(entry.count_greater(), usize::try_from(1000 - i - 1).unwrap());
        cursor = entry.next();
    }
    assert!(cursor.is_none());

    let mut cursor = map.max();
    for i in (0..1000).rev() {
        let entry = cursor.expect("cursor ended early");
        assert_eq!(*entry.key(), i);
        assert_eq!(*entry.value(), i * 2);
        cursor = entry.prev();
    }
    assert!(cursor.is_none());
}

#[rstest]
fn test_iter_yields_sorted_entries() {
    let map = PersistentOrderedMap::new()
        .insert(3, "three")
        .insert(1, "one")
        .insert(2, "two");

    let keys: Vec<&i32> = map.keys().collect();
    assert_eq!(keys, vec![&1, &2, &3]);

    let values: Vec<&&str> = map.values().collect();
    assert_eq!(values, vec![&"one", &"two", &"three"]);
}

// =============================================================================
// Neighbor Query Tests
// =============================================================================

/// With even keys 0, 2, ..., the strict successor of any query j is the
/// least even number greater than j.
#[rstest]
fn test_min_after_on_even_keys() {
    let mut map: PersistentOrderedMap<i32, i32> = PersistentOrderedMap::new();
    for i in (0..40).step_by(2) {
        map = map.insert(i, i);
        assert!(map.min_after(&i).is_none());

        for j in -1..i {
            let entry = map
                .min_after(&j)
                .unwrap_or_else(|| panic!("i={i}, j={j}: expected a successor"));
            let expected = (j + 1) + ((j + 1) % 2);
            assert_eq!(*entry.key(), expected, "i={i}, j={j}");
            if expected + 2 <= i {
                assert_eq!(*entry.next().unwrap().key(), expected + 2);
            }
        }
    }
}

/// Mirror image: the strict predecessor of j among even keys.
#[rstest]
fn test_max_before_on_even_keys() {
    let mut map: PersistentOrderedMap<i32, i32> = PersistentOrderedMap::new();
    for i in (0..40).step_by(2) {
        map = map.insert(i, i);
        assert!(map.max_before(&0).is_none());

        for j in 1..=(i + 1) {
            let entry = map
                .max_before(&j)
                .unwrap_or_else(|| panic!("i={i}, j={j}: expected a predecessor"));
            let expected = (j - 1) - ((j + 1) % 2);
            assert_eq!(*entry.key(), expected, "i={i}, j={j}");
            if expected + 2 <= i {
                assert_eq!(*entry.next().unwrap().key(), expected + 2);
            }
        }
    }
}

#[rstest]
fn test_neighbor_queries_on_empty_map() {
    let map: PersistentOrderedMap<i32, i32> = PersistentOrderedMap::new();
    assert!(map.min_after(&0).is_none());
    assert!(map.max_before(&0).is_none());
}

// =============================================================================
// Fuzz Test
// =============================================================================

/// Minimal xorshift generator so the fuzz workload is deterministic.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut state = self.0;
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        self.0 = state;
        state
    }
}

/// 100 000 mixed operations (about one third deletions) over a small key
/// space, validating the invariants and the reference length at every step.
#[test]
fn test_fuzz_against_reference_map() {
    let mut random = XorShift(0x9e37_79b9_7f4a_7c15);
    let mut reference: BTreeMap<i64, i64> = BTreeMap::new();
    let mut map: PersistentOrderedMap<i64, i64> = PersistentOrderedMap::new();
    assert!(map.is_empty());

    for step in 0..100_000 {
        let key = i64::try_from(random.next() % 500).unwrap();
        if random.next() % 3 == 0 {
            reference.remove(&key);
            map = map.remove(&key);
        } else {
            let value = i64::try_from(random.next() % 1_000_000).unwrap();
            reference.insert(key, value);
            map = map.insert(key, value);
        }

        assert_eq!(map.len(), reference.len(), "length diverged at step {step}");
        map.check_invariants()
            .unwrap_or_else(|violation| panic!("step {step}: {violation}"));
    }

    for (key, expected) in &reference {
        assert_eq!(map.get(key), Some(expected));
    }
    let entries: Vec<(i64, i64)> = map.iter().map(|(k, v)| (*k, *v)).collect();
    let expected: Vec<(i64, i64)> = reference.iter().map(|(k, v)| (*k, *v)).collect();
    assert_eq!(entries, expected);
}

// =============================================================================
// Trait Tests
// =============================================================================

#[rstest]
fn test_from_iterator_and_equality() {
    let map: PersistentOrderedMap<i32, i32> = vec![(2, 20), (1, 10), (3, 30)].into_iter().collect();
    let same: PersistentOrderedMap<i32, i32> = vec![(1, 10), (2, 20), (3, 30)].into_iter().collect();
    let different = same.insert(3, 31);

    assert_eq!(map, same);
    assert_ne!(map, different);
}

#[rstest]
fn test_into_iterator_yields_sorted_owned_entries() {
    let map: PersistentOrderedMap<i32, i32> = vec![(2, 20), (1, 10)].into_iter().collect();
    let entries: Vec<(i32, i32)> = map.into_iter().collect();
    assert_eq!(entries, vec![(1, 10), (2, 20)]);
}

#[rstest]
fn test_debug_renders_sorted_map() {
    let map = PersistentOrderedMap::new().insert(2, "b").insert(1, "a");
    assert_eq!(format!("{map:?}"), r#"{1: "a", 2: "b"}"#);
}
