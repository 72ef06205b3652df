#![deny(
    // The following are allowed by default lints according to
    // https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
    anonymous_parameters,
    bare_trait_objects,
    elided_lifetimes_in_paths,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    single_use_lifetimes,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unsafe_code,
    unstable_features,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results,
    variant_size_differences,

    clippy::all,
    clippy::pedantic,
    clippy::cargo,
)]
#![allow(
    // Some explicitly allowed Clippy lints, must have clear reason to allow
    clippy::blanket_clippy_restriction_lints, // allow clippy::restriction
    clippy::implicit_return, // actually omitting the return keyword is idiomatic Rust code
    clippy::module_name_repetitions, // repeation of module name in a struct name is not big deal
    clippy::multiple_crate_versions, // multi-version dependency crates is not able to fix
    clippy::exhaustive_enums,
    clippy::exhaustive_structs,
    clippy::indexing_slicing,
    clippy::separated_literal_suffix, // conflicts with clippy::unseparated_literal_suffix
    clippy::single_char_lifetime_names,
)]

//! Deadline-ordered batches over a `VecDeque`, keyed by a monotonic
//! nanosecond clock. Batches preserve insertion order, so entries that share
//! a deadline fire in submission order.

use once_cell::sync::Lazy;
use std::collections::vec_deque::{Iter, IterMut};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Get the current monotonic clock in ns, relative to the process epoch.
#[must_use]
pub fn now() -> u64 {
    u64::try_from(Instant::now().duration_since(*EPOCH).as_nanos()).unwrap_or(u64::MAX)
}

/// Current monotonic ns time add `dur`, saturating.
#[must_use]
pub fn deadline_after(dur: Duration) -> u64 {
    u64::try_from(dur.as_nanos())
        .map(|d| d.saturating_add(now()))
        .unwrap_or(u64::MAX)
}

/// All entries sharing one deadline, in submission order.
#[derive(Debug, Eq, PartialEq)]
pub struct TimerBatch<T> {
    deadline: u64,
    inner: VecDeque<T>,
}

impl<T> TimerBatch<T> {
    /// Creates an empty batch for `deadline`.
    #[must_use]
    pub fn new(deadline: u64) -> Self {
        TimerBatch {
            deadline,
            inner: VecDeque::new(),
        }
    }

    /// Returns the number of entries in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Get the deadline in monotonic ns.
    #[must_use]
    pub fn deadline(&self) -> u64 {
        self.deadline
    }

    /// Removes the earliest-submitted entry and returns it, or `None` if the
    /// batch is empty.
    pub fn pop_front(&mut self) -> Option<T> {
        self.inner.pop_front()
    }

    /// Appends an entry to the back of the batch.
    pub fn push_back(&mut self, t: T) {
        self.inner.push_back(t);
    }

    /// Removes and returns the first entry matching `pred`, preserving the
    /// submission order of the rest. Returns `None` if nothing matches.
    pub fn remove_if(&mut self, pred: impl Fn(&T) -> bool) -> Option<T> {
        let index = self.inner.iter().position(pred)?;
        self.inner.remove(index)
    }

    /// Returns a front-to-back iterator that returns mutable references.
    pub fn iter_mut(&mut self) -> IterMut<'_, T> {
        self.inner.iter_mut()
    }

    /// Returns a front-to-back iterator.
    #[must_use]
    pub fn iter(&self) -> Iter<'_, T> {
        self.inner.iter()
    }
}

/// Batches ordered by ascending deadline.
#[derive(Debug, PartialEq, Eq)]
pub struct TimerList<T>(VecDeque<TimerBatch<T>>);

impl<T> Default for TimerList<T> {
    fn default() -> Self {
        TimerList(VecDeque::new())
    }
}

impl<T> TimerList<T> {
    /// Returns the number of non-empty batches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Inserts an entry under `deadline`, appending to an existing batch when
    /// one is already scheduled there.
    pub fn insert(&mut self, deadline: u64, t: T) {
        let index = self
            .0
            .binary_search_by(|x| x.deadline.cmp(&deadline))
            .unwrap_or_else(|x| x);
        if let Some(batch) = self.0.get_mut(index) {
            if batch.deadline == deadline {
                batch.push_back(t);
                return;
            }
        }
        let mut batch = TimerBatch::new(deadline);
        batch.push_back(t);
        self.0.insert(index, batch);
    }

    /// Provides a reference to the earliest batch, or `None` if the list is
    /// empty.
    #[must_use]
    pub fn front(&self) -> Option<&TimerBatch<T>> {
        self.0.front()
    }

    /// The earliest scheduled deadline, or `None` if the list is empty.
    #[must_use]
    pub fn earliest_deadline(&self) -> Option<u64> {
        self.0.front().map(TimerBatch::deadline)
    }

    /// Removes the earliest batch and returns it, or `None` if the list is
    /// empty.
    pub fn pop_front(&mut self) -> Option<TimerBatch<T>> {
        self.0.pop_front()
    }

    /// Returns `true` if no batch holds an entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        for batch in &self.0 {
            if !batch.is_empty() {
                return false;
            }
        }
        true
    }

    /// Removes and returns the first entry under `deadline` matching `pred`.
    /// The batch is dropped when this empties it. Returns `None` if the
    /// deadline is not scheduled or nothing matches.
    pub fn remove_if(&mut self, deadline: u64, pred: impl Fn(&T) -> bool) -> Option<T> {
        let index = self
            .0
            .binary_search_by(|x| x.deadline.cmp(&deadline))
            .ok()?;
        let batch = self.0.get_mut(index)?;
        let removed = batch.remove_if(pred);
        if batch.is_empty() {
            _ = self.0.remove(index);
        }
        removed
    }

    /// Returns a front-to-back iterator that returns mutable references.
    pub fn iter_mut(&mut self) -> IterMut<'_, TimerBatch<T>> {
        self.0.iter_mut()
    }

    /// Returns a front-to-back iterator.
    #[must_use]
    pub fn iter(&self) -> Iter<'_, TimerBatch<T>> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock() {
        let before = now();
        std::thread::sleep(Duration::from_millis(1));
        assert!(now() > before);
        assert!(deadline_after(Duration::from_secs(1)) > now());
    }

    #[test]
    fn ascending_deadlines() {
        let mut list = TimerList::default();
        list.insert(300, "c");
        list.insert(100, "a");
        list.insert(200, "b");
        assert_eq!(list.len(), 3);
        assert_eq!(list.earliest_deadline(), Some(100));

        let order: Vec<&str> = std::iter::from_fn(|| list.pop_front())
            .flat_map(|mut batch| std::iter::from_fn(move || batch.pop_front()))
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn equal_deadlines_keep_submission_order() {
        let mut list = TimerList::default();
        list.insert(42, 1);
        list.insert(42, 2);
        list.insert(42, 3);
        assert_eq!(list.len(), 1);

        let mut batch = list.pop_front().unwrap();
        assert_eq!(batch.deadline(), 42);
        assert_eq!(batch.pop_front(), Some(1));
        assert_eq!(batch.pop_front(), Some(2));
        assert_eq!(batch.pop_front(), Some(3));
        assert!(list.is_empty());
    }

    #[test]
    fn remove_if_drops_empty_batches() {
        let mut list = TimerList::default();
        list.insert(7, 10);
        list.insert(7, 11);
        list.insert(9, 12);

        assert_eq!(list.remove_if(7, |t| *t == 11), Some(11));
        assert_eq!(list.remove_if(7, |t| *t == 11), None);
        assert_eq!(list.remove_if(8, |_| true), None);
        assert_eq!(list.remove_if(7, |t| *t == 10), Some(10));
        // the 7-batch is gone, 9 is now the front
        assert_eq!(list.earliest_deadline(), Some(9));
    }
}
