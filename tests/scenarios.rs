// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use rma_index::{Config, Index};
use test_log::test;

#[test]
fn insert_unsorted_then_scan_and_find() {
    let index = Index::new(Config::new().segment_size(4).initial_segments(2)).unwrap();
    for k in [1, 3, 2, 4, 5, 6, 10, 11, 9] {
        index.insert(k, k * 10);
    }

    assert_eq!(index.size(), 9);
    assert_eq!(index.find(7), None);
    assert_eq!(index.find(10), Some(100));

    let mut seen = Vec::new();
    index.range_scan(i64::MIN, i64::MAX, |k, v| {
        seen.push((k, v));
        true
    });
    assert_eq!(seen.iter().map(|&(k, _)| k).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5, 6, 9, 10, 11]);
}

#[test]
fn bulk_ascending_insert_resizes_and_stays_sorted() {
    let index = Index::new(Config::new().segment_size(64).initial_segments(1)).unwrap();
    for k in 1..=1024i64 {
        index.insert(k, k);
    }

    assert_eq!(index.size(), 1024);
    let mut seen = Vec::new();
    index.range_scan(i64::MIN, i64::MAX, |k, _| {
        seen.push(k);
        true
    });
    assert_eq!(seen, (1..=1024).collect::<Vec<_>>());
}

#[test]
fn descending_removal_drains_to_empty() {
    let index = Index::new(Config::new().segment_size(64).initial_segments(1)).unwrap();
    for k in 1..=1024i64 {
        index.insert(k, k);
    }

    for k in (1..=1024i64).rev() {
        assert_eq!(index.remove(k), Some(k));
        assert_eq!(index.size(), (k - 1) as u64);
    }

    let mut seen = Vec::new();
    index.range_scan(i64::MIN, i64::MAX, |k, _| {
        seen.push(k);
        true
    });
    assert!(seen.is_empty());
}

#[test]
fn presorted_bulk_insert_forms_one_dense_run() {
    let index = Index::new(Config::new().segment_size(16).initial_segments(1)).unwrap();
    for k in 1..=16i64 {
        index.insert(k, k);
    }

    assert_eq!(index.size(), 16);
    let mut seen = Vec::new();
    index.range_scan(i64::MIN, i64::MAX, |k, v| {
        seen.push((k, v));
        true
    });
    assert_eq!(seen, (1..=16).map(|k| (k, k)).collect::<Vec<_>>());
}

#[test]
fn range_sum_matches_closed_form() {
    let index = Index::new(Config::new().segment_size(32).initial_segments(1)).unwrap();
    // A permutation that is not already sorted.
    let mut keys: Vec<i64> = (1..=1033).collect();
    for chunk in keys.chunks_mut(7) {
        chunk.reverse();
    }
    for &k in &keys {
        index.insert(k, k);
    }

    for (a, b) in [(1, 1033), (1, 1), (500, 500), (200, 800), (1033, 1033)] {
        let mut sum = 0i64;
        index.range_scan(a, b, |k, _| {
            sum += k;
            true
        });
        let expected = b * (b + 1) / 2 - (a - 1) * a / 2;
        assert_eq!(sum, expected, "range [{a}, {b}]");
    }
}
