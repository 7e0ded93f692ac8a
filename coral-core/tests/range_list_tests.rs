use rstest::rstest;

use coral_core::{DeferredReclaim, RangeList};

fn live_intervals(list: &RangeList<DeferredReclaim>) -> Vec<(u64, u64)> {
    list.iter()
        .filter(|r| !r.deleted())
        .map(|r| (r.key(), r.size()))
        .collect()
}

#[test]
fn test_empty_collection() {
    let list: RangeList<DeferredReclaim> = RangeList::new(8);

    assert!(list.search(10, 5).is_none());

    let window = list.search_lock(10, 5);
    assert!(window.is_empty());
    assert_eq!(window.iter().count(), 0);
    assert_eq!(window.base(), 10);
    assert_eq!(window.size(), 5);
    drop(window);

    list.check_invariants();
}

#[test]
fn test_single_insert() {
    let list: RangeList<DeferredReclaim> = RangeList::new(8);

    let window = list.search_lock(10, 5);
    window.replace(vec![list.new_range(10, 5)]);
    drop(window);

    let found = list.search(12, 1).expect("inserted range not found");
    assert_eq!(found.key(), 10);
    assert_eq!(found.size(), 5);
    assert!(!found.deleted());

    // Off-range queries miss.
    assert!(list.search(15, 1).is_none());
    assert!(list.search(3, 7).is_none());
    // A query straddling the start hits.
    assert!(list.search(8, 3).is_some());

    list.check_invariants();
}

#[test]
fn test_split() {
    let list: RangeList<DeferredReclaim> = RangeList::new(8);

    list.search_lock(10, 5).replace(vec![list.new_range(10, 5)]);

    // Split [10, 15) into [10, 12) and [14, 15), leaving a gap at 12..14.
    let window = list.search_lock(10, 5);
    assert_eq!(window.iter().count(), 1);
    window.replace(vec![list.new_range(10, 2), list.new_range(14, 1)]);
    drop(window);

    assert!(list.search(12, 1).is_none());
    let found = list.search(14, 1).expect("second fragment not found");
    assert_eq!(found.key(), 14);

    assert_eq!(live_intervals(&list), vec![(10, 2), (14, 1)]);
    list.check_invariants();
}

#[test]
fn test_merge() {
    let list: RangeList<DeferredReclaim> = RangeList::new(8);

    list.search_lock(10, 2).replace(vec![list.new_range(10, 2)]);
    list.search_lock(14, 1).replace(vec![list.new_range(14, 1)]);

    // A window over [8, 18) captures both fragments.
    let window = list.search_lock(8, 10);
    assert_eq!(window.iter().count(), 2);
    window.replace(vec![list.new_range(8, 10)]);
    drop(window);

    let found = list.search(12, 1).expect("merged range not found");
    assert_eq!((found.key(), found.size()), (8, 10));

    assert_eq!(live_intervals(&list), vec![(8, 10)]);
    list.check_invariants();
}

#[test]
fn test_delete_via_empty_replace() {
    let list: RangeList<DeferredReclaim> = RangeList::new(8);

    list.search_lock(10, 5).replace(vec![list.new_range(10, 5)]);
    assert!(list.search(10, 5).is_some());

    list.search_lock(10, 5).replace(vec![]);
    assert!(list.search(10, 5).is_none());
    assert!(live_intervals(&list).is_empty());

    // Deleting an already empty window is a no-op.
    list.search_lock(10, 5).replace(vec![]);

    list.check_invariants();
}

#[test]
fn test_replace_with_equal_intervals() {
    let list: RangeList<DeferredReclaim> = RangeList::new(8);

    list.search_lock(10, 5).replace(vec![list.new_range(10, 5)]);
    let before = live_intervals(&list);

    // Replacing a window with the same intervals yields an equal window.
    let window = list.search_lock(10, 5);
    window.replace(vec![list.new_range(10, 5)]);
    drop(window);

    assert_eq!(live_intervals(&list), before);
    list.check_invariants();
}

#[test]
fn test_replace_one() {
    let list: RangeList<DeferredReclaim> = RangeList::new(8);

    list.search_lock(10, 2).replace(vec![list.new_range(10, 2)]);
    list.search_lock(14, 1).replace(vec![list.new_range(14, 1)]);

    let window = list.search_lock(10, 10);
    let old = window.iter().next().expect("window should hold [10, 12)");
    assert_eq!(old.key(), 10);
    window.replace_one(old, list.new_range(10, 2));
    assert_eq!(window.iter().count(), 2);
    drop(window);

    assert_eq!(live_intervals(&list), vec![(10, 2), (14, 1)]);
    list.check_invariants();
}

#[test]
fn test_window_drop_releases_locks() {
    let list: RangeList<DeferredReclaim> = RangeList::new(8);

    list.search_lock(0, 100).replace(vec![
        list.new_range(10, 5),
        list.new_range(20, 5),
        list.new_range(30, 5),
    ]);

    // Re-locking the same window would spin forever if any lock leaked.
    for _ in 0..3 {
        let window = list.search_lock(0, 100);
        assert_eq!(window.iter().count(), 3);
    }

    // Same for a window that was mutated before dropping.
    let window = list.search_lock(0, 100);
    window.replace(vec![list.new_range(40, 5)]);
    drop(window);
    let window = list.search_lock(0, 100);
    assert_eq!(window.iter().count(), 1);
    drop(window);

    list.check_invariants();
}

#[test]
fn test_adjacent_windows_do_not_capture() {
    let list: RangeList<DeferredReclaim> = RangeList::new(8);

    list.search_lock(10, 5).replace(vec![list.new_range(10, 5)]);

    // [15, 20) touches [10, 15) only at the boundary: empty window.
    let window = list.search_lock(15, 5);
    assert!(window.is_empty());
    drop(window);

    // Same on the left side.
    let window = list.search_lock(5, 5);
    assert!(window.is_empty());
    drop(window);

    list.check_invariants();
}

#[test]
fn test_iteration_is_sorted() {
    let list: RangeList<DeferredReclaim> = RangeList::new(8);

    for key in [50u64, 10, 90, 30, 70] {
        list.search_lock(key, 5).replace(vec![list.new_range(key, 5)]);
    }

    let keys: Vec<u64> = (&list).into_iter().map(|r| r.key()).collect();
    assert_eq!(keys, vec![10, 30, 50, 70, 90]);

    let window = list.search_lock(0, 100);
    let window_keys: Vec<u64> = (&window).into_iter().map(|r| r.key()).collect();
    assert_eq!(window_keys, keys);
    drop(window);

    list.check_invariants();
}

#[test]
fn test_key_zero() {
    let list: RangeList<DeferredReclaim> = RangeList::new(4);

    list.search_lock(0, 5).replace(vec![list.new_range(0, 5)]);
    let found = list.search(0, 1).expect("range at key 0 not found");
    assert_eq!(found.key(), 0);

    list.search_lock(0, 5).replace(vec![]);
    assert!(list.search(0, 1).is_none());
    list.check_invariants();
}

#[test]
fn test_many_windows_churn() {
    let list: RangeList<DeferredReclaim> = RangeList::new(8);

    for round in 0..20u64 {
        for slot in 0..16u64 {
            let base = slot * 100;
            let window = list.search_lock(base, 100);
            if (round + slot) % 3 == 0 {
                window.replace(vec![]);
            } else if (round + slot) % 3 == 1 {
                window.replace(vec![list.new_range(base + 10, 30)]);
            } else {
                window.replace(vec![
                    list.new_range(base + 10, 10),
                    list.new_range(base + 40, 10),
                    list.new_range(base + 70, 10),
                ]);
            }
        }
        list.check_invariants();
    }
}

#[rstest]
#[case::single_level(1)]
#[case::few_levels(4)]
#[case::max_levels(32)]
fn test_insert_delete_across_level_counts(#[case] nlevel: usize) {
    let list: RangeList<DeferredReclaim> = RangeList::new(nlevel);

    for slot in 0..64u64 {
        let base = slot * 10;
        list.search_lock(base, 10)
            .replace(vec![list.new_range(base, 8)]);
    }
    assert_eq!(live_intervals(&list).len(), 64);
    list.check_invariants();

    for slot in (0..64u64).step_by(2) {
        list.search_lock(slot * 10, 10).replace(vec![]);
    }
    assert_eq!(live_intervals(&list).len(), 32);
    assert!(list.search(20, 1).is_none());
    assert!(list.search(10, 1).is_some());
    list.check_invariants();
}

#[test]
#[should_panic(expected = "escapes the window")]
fn test_replace_escaping_interval_panics() {
    let list: RangeList<DeferredReclaim> = RangeList::new(8);
    let window = list.search_lock(10, 5);
    window.replace(vec![list.new_range(10, 6)]);
}

#[test]
#[should_panic(expected = "escapes the window")]
fn test_replace_overlapping_chain_panics() {
    let list: RangeList<DeferredReclaim> = RangeList::new(8);
    let window = list.search_lock(10, 10);
    window.replace(vec![list.new_range(10, 5), list.new_range(12, 2)]);
}

#[test]
#[should_panic(expected = "must keep the interval")]
fn test_replace_one_interval_change_panics() {
    let list: RangeList<DeferredReclaim> = RangeList::new(8);
    list.search_lock(10, 5).replace(vec![list.new_range(10, 5)]);

    let window = list.search_lock(10, 5);
    let old = window.iter().next().unwrap();
    window.replace_one(old, list.new_range(10, 4));
}
