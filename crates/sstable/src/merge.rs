//! Merge primitives for compaction.
//!
//! - [`merge_sort`]: balanced k-way merge of sorted runs (one run per input
//!   file), ordered by key ascending and timestamp descending.
//! - [`merge_intervals`]: coalesces overlapping key ranges so that each
//!   resulting interval can be compacted independently.

use std::cmp::Ordering;

use codec::{Entry, KeyRange};

/// Merges sorted runs into one run ordered by [`Entry::cmp_newest_first`].
///
/// The runs are split into two halves, each half is merged recursively and
/// the two results are merged last. Every version of a key is kept; only
/// exact `(key, ts)` duplicates collapse to one entry (the one from the
/// earlier run).
pub fn merge_sort(mut runs: Vec<Vec<Entry>>) -> Vec<Entry> {
    match runs.len() {
        0 => Vec::new(),
        1 => runs.pop().unwrap_or_default(),
        n => {
            let right = runs.split_off(n / 2);
            merge_two(merge_sort(runs), merge_sort(right))
        }
    }
}

fn merge_two(left: Vec<Entry>, right: Vec<Entry>) -> Vec<Entry> {
    let mut out = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();

    loop {
        let next = match (left.peek(), right.peek()) {
            (Some(l), Some(r)) => match l.cmp_newest_first(r) {
                Ordering::Less => left.next(),
                Ordering::Greater => right.next(),
                Ordering::Equal => {
                    right.next();
                    left.next()
                }
            },
            (Some(_), None) => left.next(),
            (None, Some(_)) => right.next(),
            (None, None) => break,
        };
        if let Some(e) = next {
            out.push(e);
        }
    }
    out
}

/// A key range and the files whose ranges it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    pub range: KeyRange,
    pub files: Vec<u64>,
}

impl Interval {
    pub fn new(range: KeyRange, file: u64) -> Self {
        Self {
            range,
            files: vec![file],
        }
    }
}

/// Coalesces overlapping intervals.
///
/// Intervals are sorted by start key; an interval whose start falls within
/// the current one's end extends it and contributes its files. The result is
/// pairwise disjoint and sorted.
pub fn merge_intervals(mut intervals: Vec<Interval>) -> Vec<Interval> {
    intervals.sort_by(|a, b| {
        a.range
            .start
            .cmp(&b.range.start)
            .then_with(|| a.range.end.cmp(&b.range.end))
    });

    let mut out: Vec<Interval> = Vec::with_capacity(intervals.len());
    for interval in intervals {
        match out.last_mut() {
            Some(cur) if interval.range.start <= cur.range.end => {
                cur.range.extend(&interval.range);
                cur.files.extend(interval.files);
            }
            _ => out.push(interval),
        }
    }
    out
}
