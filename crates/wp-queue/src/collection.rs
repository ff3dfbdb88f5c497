//! ConcurrentSortedCollection - the synchronization primitive every queue is built on
//!
//! A multiset ordered by an injected comparer. `try_take` always removes the
//! element that is minimal *at the time of extraction*. Comparers may depend
//! on the wall clock (deadline escalation), so the order of held elements can
//! change while they wait; the minimum is therefore found by a scan under the
//! lock rather than cached in a tree whose invariants would silently break.

use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use wp_common::Comparer;

pub struct ConcurrentSortedCollection<T> {
    items: Mutex<Vec<T>>,
    comparer: Arc<dyn Comparer<T>>,
}

impl<T> ConcurrentSortedCollection<T> {
    pub fn new(comparer: Arc<dyn Comparer<T>>) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            comparer,
        }
    }

    pub fn comparer(&self) -> &Arc<dyn Comparer<T>> {
        &self.comparer
    }

    /// Add `item` unless an element comparing `Equal` is already held.
    pub fn try_add(&self, item: T) -> bool {
        let mut items = self.items.lock();
        if items
            .iter()
            .any(|held| self.comparer.compare(held, &item) == Ordering::Equal)
        {
            return false;
        }
        items.push(item);
        true
    }

    /// Remove and return the current minimum.
    pub fn try_take(&self) -> Option<T> {
        let mut items = self.items.lock();
        let index = self.min_index(&items)?;
        Some(items.swap_remove(index))
    }

    /// Remove every element for which `predicate` holds.
    pub fn remove_where<F>(&self, mut predicate: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut items = self.items.lock();
        let mut removed = Vec::new();
        let mut index = 0;
        while index < items.len() {
            if predicate(&items[index]) {
                removed.push(items.swap_remove(index));
            } else {
                index += 1;
            }
        }
        removed
    }

    /// Remove everything, returned in comparer order.
    pub fn drain(&self) -> Vec<T> {
        let mut drained = std::mem::take(&mut *self.items.lock());
        drained.sort_by(|a, b| self.comparer.compare(a, b));
        drained
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    fn min_index(&self, items: &[T]) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (index, item) in items.iter().enumerate() {
            match best {
                Some(current) if self.comparer.compare(item, &items[current]) != Ordering::Less => {}
                _ => best = Some(index),
            }
        }
        best
    }
}

impl<T: Clone> ConcurrentSortedCollection<T> {
    /// Sorted snapshot taken under the lock.
    pub fn to_vec(&self) -> Vec<T> {
        let mut snapshot = self.items.lock().clone();
        snapshot.sort_by(|a, b| self.comparer.compare(a, b));
        snapshot
    }

    /// Enumerate a snapshot; later mutation never invalidates the iterator.
    pub fn iter(&self) -> std::vec::IntoIter<T> {
        self.to_vec().into_iter()
    }
}

impl<'a, T: Clone> IntoIterator for &'a ConcurrentSortedCollection<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    fn ascending() -> Arc<dyn Comparer<i64>> {
        Arc::new(|a: &i64, b: &i64| a.cmp(b))
    }

    #[test]
    fn test_take_returns_minimum() {
        let collection = ConcurrentSortedCollection::new(ascending());
        for value in [5, 1, 9, 3] {
            assert!(collection.try_add(value));
        }
        assert_eq!(collection.try_take(), Some(1));
        assert!(collection.try_add(0));
        assert_eq!(collection.try_take(), Some(0));
        assert_eq!(collection.try_take(), Some(3));
        assert_eq!(collection.len(), 2);
    }

    #[test]
    fn test_duplicate_by_comparer_is_rejected() {
        // Compares only the key, so ("a", 1) and ("a", 2) are duplicates.
        let by_key: Arc<dyn Comparer<(&str, i32)>> =
            Arc::new(|a: &(&str, i32), b: &(&str, i32)| a.0.cmp(b.0));
        let collection = ConcurrentSortedCollection::new(by_key);
        assert!(collection.try_add(("a", 1)));
        assert!(!collection.try_add(("a", 2)));
        assert!(collection.try_add(("b", 2)));
        assert_eq!(collection.len(), 2);
    }

    #[test]
    fn test_empty_take() {
        let collection = ConcurrentSortedCollection::new(ascending());
        assert!(collection.is_empty());
        assert_eq!(collection.try_take(), None);
    }

    #[test]
    fn test_snapshot_is_sorted_and_detached() {
        let collection = ConcurrentSortedCollection::new(ascending());
        for value in [4, 2, 8] {
            collection.try_add(value);
        }
        let iter = collection.iter();
        collection.try_add(1);
        assert_eq!(iter.collect::<Vec<_>>(), vec![2, 4, 8]);
        assert_eq!(collection.to_vec(), vec![1, 2, 4, 8]);
    }

    #[test]
    fn test_drain_and_remove_where() {
        let collection = ConcurrentSortedCollection::new(ascending());
        for value in 0..10 {
            collection.try_add(value);
        }
        let evens = collection.remove_where(|v| v % 2 == 0);
        assert_eq!(evens.len(), 5);
        assert_eq!(collection.drain(), vec![1, 3, 5, 7, 9]);
        assert!(collection.is_empty());
    }

    #[test]
    fn test_concurrent_producers_consumers() {
        let collection = Arc::new(ConcurrentSortedCollection::new(ascending()));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let collection = collection.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        assert!(collection.try_add(p * 1000 + i));
                    }
                })
            })
            .collect();
        for handle in producers {
            handle.join().unwrap();
        }

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let collection = collection.clone();
                thread::spawn(move || {
                    let mut taken = Vec::new();
                    while let Some(value) = collection.try_take() {
                        taken.push(value);
                    }
                    taken
                })
            })
            .collect();

        let mut all: Vec<i64> = Vec::new();
        for handle in consumers {
            let taken = handle.join().unwrap();
            assert!(taken.windows(2).all(|w| w[0] < w[1]));
            all.extend(taken);
        }
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1000);
    }

    proptest! {
        #[test]
        fn prop_takes_come_out_sorted(values in proptest::collection::hash_set(-10_000i64..10_000, 0..200)) {
            let collection = ConcurrentSortedCollection::new(ascending());
            for value in &values {
                prop_assert!(collection.try_add(*value));
            }
            let mut taken = Vec::new();
            while let Some(value) = collection.try_take() {
                taken.push(value);
            }
            let mut expected: Vec<i64> = values.into_iter().collect();
            expected.sort_unstable();
            prop_assert_eq!(taken, expected);
        }

        #[test]
        fn prop_interleaved_take_is_current_minimum(ops in proptest::collection::vec(proptest::option::of(-500i64..500), 1..300)) {
            let collection = ConcurrentSortedCollection::new(ascending());
            let mut model = std::collections::BTreeSet::new();
            for op in ops {
                match op {
                    Some(value) => {
                        prop_assert_eq!(collection.try_add(value), model.insert(value));
                    }
                    None => {
                        let expected = model.iter().next().copied();
                        if let Some(min) = expected {
                            model.remove(&min);
                        }
                        prop_assert_eq!(collection.try_take(), expected);
                    }
                }
            }
        }
    }
}
