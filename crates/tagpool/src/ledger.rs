//! Slot ledger - per-tag admission accounting.
//!
//! The ledger is the only shared state on the admission path. Counts live
//! under a single mutex so admit, release, and resize each mutate atomically;
//! capacity waiters park on a `Notify` that release and resize signal.
//!
//! Per tag the ledger tracks:
//! - `reserved`: slots dedicated to the tag
//! - `in_use`: running tasks admitted under the tag
//! - `borrowed`: the subset of `in_use` charged against the generic pool
//!
//! The generic pool is never oversubscribed: its own usage plus every tag's
//! borrows stays within its reservation. Shrinking a reservation below its
//! current usage is deferred - the surplus keeps running and admissions
//! against that reserve stay blocked until releases bring usage back under
//! the new bound.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::sync::futures::Notified;

use crate::error::PoolError;
use crate::tag::Tag;

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct TagCounts {
    pub(crate) reserved: usize,
    pub(crate) in_use: usize,
    pub(crate) borrowed: usize,
}

/// Outcome of a granted admission.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Admission {
    /// The slot was charged against the generic pool, not the tag's own
    /// reservation.
    pub(crate) borrowed: bool,
}

/// Result of a successful `resize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResizeReport {
    pub tag: Tag,
    pub previous: usize,
    pub reserved: usize,
    /// Generic reservation after the resize.
    pub generic_reserved: usize,
}

#[derive(Debug, Default)]
struct LedgerState {
    slots: HashMap<Tag, TagCounts>,
    /// Running sum of `borrowed` across named tags, so the generic capacity
    /// test is O(1).
    borrowed_total: usize,
}

impl LedgerState {
    fn entry(&mut self, tag: &Tag) -> &mut TagCounts {
        self.slots.entry(tag.clone()).or_default()
    }

    fn generic(&self) -> TagCounts {
        self.slots.get(&Tag::Generic).copied().unwrap_or_default()
    }

    fn generic_has_room(&self) -> bool {
        let generic = self.generic();
        generic.in_use + self.borrowed_total < generic.reserved
    }

    fn admit(&mut self, tag: &Tag) -> Option<Admission> {
        if tag.is_generic() {
            if !self.generic_has_room() {
                return None;
            }
            self.entry(tag).in_use += 1;
            return Some(Admission { borrowed: false });
        }

        // Own reservation first, so the generic pool stays free for tags
        // that have nowhere else to go. An undeclared tag gets an entry with
        // reserved = 0 and can only borrow.
        {
            let own = self.entry(tag);
            if own.in_use - own.borrowed < own.reserved {
                own.in_use += 1;
                return Some(Admission { borrowed: false });
            }
        }

        if self.generic_has_room() {
            let own = self.entry(tag);
            own.in_use += 1;
            own.borrowed += 1;
            self.borrowed_total += 1;
            return Some(Admission { borrowed: true });
        }

        None
    }

    #[cfg(debug_assertions)]
    fn assert_consistent(&self) {
        let mut borrowed_sum = 0;
        for (tag, counts) in &self.slots {
            debug_assert!(
                counts.borrowed <= counts.in_use,
                "tag {tag}: borrowed {} exceeds in_use {}",
                counts.borrowed,
                counts.in_use,
            );
            if tag.is_generic() {
                debug_assert_eq!(counts.borrowed, 0, "generic pool cannot borrow");
            } else {
                borrowed_sum += counts.borrowed;
            }
        }
        debug_assert_eq!(borrowed_sum, self.borrowed_total);
    }

    #[cfg(not(debug_assertions))]
    fn assert_consistent(&self) {}
}

pub(crate) struct SlotLedger {
    state: Mutex<LedgerState>,
    capacity: Notify,
}

impl SlotLedger {
    pub(crate) fn new(tags: impl IntoIterator<Item = (Tag, usize)>) -> Self {
        let mut slots: HashMap<Tag, TagCounts> = HashMap::new();
        for (tag, reserved) in tags {
            slots.insert(
                tag,
                TagCounts {
                    reserved,
                    ..TagCounts::default()
                },
            );
        }
        slots.entry(Tag::Generic).or_default();
        Self {
            state: Mutex::new(LedgerState {
                slots,
                borrowed_total: 0,
            }),
            capacity: Notify::new(),
        }
    }

    // No user code ever runs under this lock, so poisoning means a bug in
    // the ledger itself; recovering beats wedging every admission.
    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One admission attempt. Mutates the counts and returns how the slot
    /// was charged, or `None` when neither the tag's reservation nor the
    /// generic pool has room.
    pub(crate) fn try_admit(&self, tag: &Tag) -> Option<Admission> {
        let mut state = self.lock();
        let admission = state.admit(tag)?;
        state.assert_consistent();
        Some(admission)
    }

    /// Return a slot. Signals every capacity waiter, since freeing either an
    /// own-reservation slot or a generic slot can unblock any tag.
    pub(crate) fn release(&self, tag: &Tag, was_borrowed: bool) {
        {
            let mut state = self.lock();
            {
                let counts = state.entry(tag);
                debug_assert!(counts.in_use > 0, "release without admission for {tag}");
                counts.in_use = counts.in_use.saturating_sub(1);
                if was_borrowed {
                    counts.borrowed = counts.borrowed.saturating_sub(1);
                }
            }
            if was_borrowed {
                state.borrowed_total = state.borrowed_total.saturating_sub(1);
            }
            state.assert_consistent();
        }
        self.capacity.notify_waiters();
    }

    /// Change a tag's reservation while work is in flight.
    ///
    /// Plain mode changes total pool capacity by the delta. With
    /// `use_generic_slots` the delta is moved between the tag and the
    /// generic pool instead, conserving total capacity; that mode fails
    /// without mutating anything when the generic pool cannot cover the
    /// move. Shrinking never cancels running work.
    pub(crate) fn resize(
        &self,
        tag: &Tag,
        new_size: usize,
        use_generic_slots: bool,
    ) -> Result<ResizeReport, PoolError> {
        let report = {
            let mut state = self.lock();
            let previous = state.entry(tag).reserved;

            if use_generic_slots && !tag.is_generic() {
                let generic = state.generic();
                let committed = generic.in_use + state.borrowed_total;
                let delta = new_size as i64 - previous as i64;
                let adjusted = generic.reserved as i64 - delta;
                if adjusted < committed as i64 {
                    return Err(PoolError::InsufficientGeneric {
                        needed: delta.max(0) as usize,
                        available: generic.reserved.saturating_sub(committed),
                    });
                }
                state.entry(&Tag::Generic).reserved = adjusted as usize;
            }

            state.entry(tag).reserved = new_size;
            state.assert_consistent();
            ResizeReport {
                tag: tag.clone(),
                previous,
                reserved: new_size,
                generic_reserved: state.generic().reserved,
            }
        };
        tracing::info!(
            tag = %report.tag,
            previous = report.previous,
            reserved = report.reserved,
            generic = report.generic_reserved,
            "reservation resized"
        );
        self.capacity.notify_waiters();
        Ok(report)
    }

    /// Future that resolves on the next release or resize. Create and enable
    /// it before re-checking `try_admit` so no signal is lost.
    pub(crate) fn capacity_changed(&self) -> Notified<'_> {
        self.capacity.notified()
    }

    pub(crate) fn snapshot(&self) -> BTreeMap<Tag, TagCounts> {
        let state = self.lock();
        state
            .slots
            .iter()
            .map(|(tag, counts)| (tag.clone(), *counts))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(tags: &[(&str, usize)], generic: usize) -> SlotLedger {
        let mut all: Vec<(Tag, usize)> =
            tags.iter().map(|(n, r)| (Tag::from(*n), *r)).collect();
        all.push((Tag::Generic, generic));
        SlotLedger::new(all)
    }

    fn counts(ledger: &SlotLedger, tag: &Tag) -> TagCounts {
        ledger.snapshot().get(tag).copied().unwrap_or_default()
    }

    #[test]
    fn own_reservation_before_borrow() {
        let ledger = ledger(&[("a", 1)], 1);
        let a = Tag::from("a");

        let first = ledger.try_admit(&a).unwrap();
        assert!(!first.borrowed);

        let second = ledger.try_admit(&a).unwrap();
        assert!(second.borrowed);

        assert!(ledger.try_admit(&a).is_none());

        let c = counts(&ledger, &a);
        assert_eq!((c.in_use, c.borrowed), (2, 1));
    }

    #[test]
    fn release_of_own_slot_readmits_without_borrow() {
        let ledger = ledger(&[("a", 1)], 1);
        let a = Tag::from("a");
        ledger.try_admit(&a).unwrap();
        ledger.try_admit(&a).unwrap();

        ledger.release(&a, false);
        let third = ledger.try_admit(&a).unwrap();
        assert!(!third.borrowed);
        assert_eq!(counts(&ledger, &a).borrowed, 1);
    }

    #[test]
    fn generic_pool_never_oversubscribed() {
        let ledger = ledger(&[("a", 0), ("b", 0)], 1);
        let a = Tag::from("a");
        let b = Tag::from("b");

        assert!(ledger.try_admit(&a).unwrap().borrowed);
        assert!(ledger.try_admit(&b).is_none());
        assert!(ledger.try_admit(&Tag::Generic).is_none());

        ledger.release(&a, true);
        assert!(ledger.try_admit(&b).unwrap().borrowed);
    }

    #[test]
    fn generic_tag_admissions_count_against_generic() {
        let ledger = ledger(&[], 2);
        ledger.try_admit(&Tag::Generic).unwrap();
        ledger.try_admit(&Tag::Generic).unwrap();
        assert!(ledger.try_admit(&Tag::Generic).is_none());
        assert!(ledger.try_admit(&Tag::from("a")).is_none());
    }

    #[test]
    fn undeclared_tag_is_created_borrow_only() {
        let ledger = ledger(&[], 1);
        let new = Tag::from("surprise");
        assert!(ledger.try_admit(&new).unwrap().borrowed);
        assert_eq!(counts(&ledger, &new).reserved, 0);
    }

    #[test]
    fn plain_resize_changes_total_capacity() {
        let ledger = ledger(&[("a", 2)], 1);
        let report = ledger.resize(&Tag::from("a"), 5, false).unwrap();
        assert_eq!(report.previous, 2);
        assert_eq!(report.reserved, 5);
        assert_eq!(report.generic_reserved, 1);
    }

    #[test]
    fn generic_slot_resize_conserves_capacity() {
        let ledger = ledger(&[("a", 5)], 5);
        let a = Tag::from("a");

        let report = ledger.resize(&a, 2, true).unwrap();
        assert_eq!(report.reserved, 2);
        assert_eq!(report.generic_reserved, 8);

        let err = ledger.resize(&a, 100, true).unwrap_err();
        assert_eq!(
            err,
            PoolError::InsufficientGeneric {
                needed: 98,
                available: 8
            }
        );
        // Nothing mutated on failure.
        assert_eq!(counts(&ledger, &a).reserved, 2);
        assert_eq!(counts(&ledger, &Tag::Generic).reserved, 8);
    }

    #[test]
    fn generic_slot_resize_respects_commitments() {
        let ledger = ledger(&[("a", 0)], 2);
        let a = Tag::from("a");
        ledger.try_admit(&a).unwrap();
        ledger.try_admit(&Tag::Generic).unwrap();

        // Both generic slots are committed; none can move to `a`.
        let err = ledger.resize(&a, 1, true).unwrap_err();
        assert_eq!(
            err,
            PoolError::InsufficientGeneric {
                needed: 1,
                available: 0
            }
        );
    }

    #[test]
    fn shrink_defers_until_surplus_drains() {
        let ledger = ledger(&[("a", 3)], 0);
        let a = Tag::from("a");
        for _ in 0..3 {
            assert!(!ledger.try_admit(&a).unwrap().borrowed);
        }

        ledger.resize(&a, 1, false).unwrap();
        assert_eq!(counts(&ledger, &a).in_use, 3);
        assert!(ledger.try_admit(&a).is_none());

        ledger.release(&a, false);
        ledger.release(&a, false);
        // Still at the new bound: one in use, one reserved.
        assert!(ledger.try_admit(&a).is_none());

        ledger.release(&a, false);
        assert!(!ledger.try_admit(&a).unwrap().borrowed);
    }

    #[test]
    fn resizing_generic_changes_overflow_capacity() {
        let ledger = ledger(&[("a", 0)], 0);
        assert!(ledger.try_admit(&Tag::from("a")).is_none());
        ledger.resize(&Tag::Generic, 1, false).unwrap();
        assert!(ledger.try_admit(&Tag::from("a")).unwrap().borrowed);
    }

    #[test]
    fn resize_can_create_a_tag() {
        let ledger = ledger(&[], 4);
        let report = ledger.resize(&Tag::from("new"), 2, true).unwrap();
        assert_eq!(report.previous, 0);
        assert_eq!(report.generic_reserved, 2);
        assert!(!ledger.try_admit(&Tag::from("new")).unwrap().borrowed);
    }
}
