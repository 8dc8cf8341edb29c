//! Sorted, deduplicated, size-bounded event sequences.
//!
//! Order is newest first; events sharing a `created_at` are ordered by
//! ascending id so that positions never depend on arrival order.
//! Every function here is pure: inputs are borrowed, a new `Vec` is
//! returned. Items are expected to be cheap to clone (`Arc<Note>`).
//!
//! Callers must pass `set`/`existing` already sorted, deduplicated and
//! no longer than `limit`.

use enostr::{Note, NoteId};
use hashbrown::HashSet;
use std::cmp::Ordering;
use std::sync::Arc;

/// Batches at most this large are inserted one binary search at a time
/// instead of being sorted and merged.
const SMALL_BATCH: usize = 5;

pub trait TimelineItem {
    fn created_at(&self) -> u64;
    fn id(&self) -> &NoteId;
}

impl TimelineItem for Note {
    fn created_at(&self) -> u64 {
        self.created_at
    }

    fn id(&self) -> &NoteId {
        &self.id
    }
}

impl<T: TimelineItem + ?Sized> TimelineItem for Arc<T> {
    fn created_at(&self) -> u64 {
        (**self).created_at()
    }

    fn id(&self) -> &NoteId {
        (**self).id()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MergeKind {
    /// Everything new went in front of what was already there.
    FrontInsert,
    Spliced,
}

/// `Less` means `a` sorts before `b`.
pub fn compare<T: TimelineItem>(a: &T, b: &T) -> Ordering {
    b.created_at()
        .cmp(&a.created_at())
        .then_with(|| a.id().cmp(b.id()))
}

/// Index at which `item` keeps `set` sorted. O(log n).
pub fn find_insertion_index<T: TimelineItem>(set: &[T], item: &T) -> usize {
    set.partition_point(|probe| compare(item, probe) != Ordering::Less)
}

fn bounded<T: Clone>(items: &[T], limit: Option<usize>) -> Vec<T> {
    match limit {
        Some(limit) if items.len() > limit => items[..limit].to_vec(),
        _ => items.to_vec(),
    }
}

fn truncate<T>(mut items: Vec<T>, limit: Option<usize>) -> Vec<T> {
    if let Some(limit) = limit {
        items.truncate(limit);
    }
    items
}

pub fn insert_one<T: TimelineItem + Clone>(set: &[T], item: &T, limit: Option<usize>) -> Vec<T> {
    if set.iter().any(|e| e.id() == item.id()) {
        return bounded(set, limit);
    }

    let idx = find_insertion_index(set, item);
    if limit.is_some_and(|limit| idx >= limit) {
        // older than everything we keep
        return bounded(set, limit);
    }

    let mut out = Vec::with_capacity(set.len() + 1);
    out.extend_from_slice(&set[..idx]);
    out.push(item.clone());
    out.extend_from_slice(&set[idx..]);

    truncate(out, limit)
}

pub fn insert_many<T: TimelineItem + Clone>(
    set: &[T],
    items: &[T],
    limit: Option<usize>,
) -> Vec<T> {
    let existing: HashSet<&NoteId> = set.iter().map(|e| e.id()).collect();
    let mut fresh: Vec<T> = items
        .iter()
        .filter(|e| !existing.contains(e.id()))
        .cloned()
        .collect();

    if fresh.is_empty() {
        return bounded(set, limit);
    }

    if fresh.len() <= SMALL_BATCH {
        return fresh.iter().fold(bounded(set, limit), |acc, item| {
            insert_one(&acc, item, limit)
        });
    }

    fresh.sort_by(compare);
    merge_sorted(set, &fresh, limit)
}

/// Two-pointer merge of two sorted sequences. An id is emitted at most
/// once even when it appears in both inputs.
pub fn merge_sorted<T: TimelineItem + Clone>(a: &[T], b: &[T], limit: Option<usize>) -> Vec<T> {
    let max = limit.unwrap_or(a.len() + b.len());
    let mut out = Vec::with_capacity(max.min(a.len() + b.len()));
    let mut seen: HashSet<&NoteId> = HashSet::with_capacity(out.capacity());
    let (mut i, mut j) = (0, 0);

    while out.len() < max && (i < a.len() || j < b.len()) {
        let next = if i >= a.len() {
            j += 1;
            &b[j - 1]
        } else if j >= b.len() {
            i += 1;
            &a[i - 1]
        } else if compare(&a[i], &b[j]) != Ordering::Greater {
            i += 1;
            &a[i - 1]
        } else {
            j += 1;
            &b[j - 1]
        };

        if seen.insert(next.id()) {
            out.push(next.clone());
        }
    }

    out
}

/// Apply an update to a sorted sequence.
///
/// `incoming` may be unsorted and may contain duplicates or events
/// already in `existing`. When every new event is newer than the head of
/// `existing` (the usual live-arrival case) the result is a plain
/// concatenation, reported as [`MergeKind::FrontInsert`].
pub fn reconcile<T: TimelineItem + Clone>(
    existing: &[T],
    incoming: &[T],
    limit: Option<usize>,
) -> (Vec<T>, MergeKind) {
    let mut seen: HashSet<&NoteId> = existing.iter().map(|e| e.id()).collect();
    let mut fresh: Vec<T> = incoming
        .iter()
        .filter(|e| seen.insert(e.id()))
        .cloned()
        .collect();

    if fresh.is_empty() {
        return (bounded(existing, limit), MergeKind::FrontInsert);
    }

    fresh.sort_by(compare);

    let all_newer = match (fresh.last(), existing.first()) {
        (Some(oldest_new), Some(newest_old)) => compare(oldest_new, newest_old) == Ordering::Less,
        _ => true,
    };

    if all_newer {
        fresh.extend_from_slice(existing);
        return (truncate(fresh, limit), MergeKind::FrontInsert);
    }

    (merge_sorted(existing, &fresh, limit), MergeKind::Spliced)
}
