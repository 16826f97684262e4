// Copyright (c) 2024-present, vinyl-scheduler
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};

/// Position of an entry that is in no heap.
pub(crate) const HEAP_POS_NONE: usize = usize::MAX;

/// A binary heap that tracks each entry's position inside the entry itself,
/// so entries can be updated or removed in place when their ordering key
/// changes (an LSM tree lives in the dump heap and the compaction heap at
/// the same time; a range lives in its tree's range heap).
///
/// `less` decides which entry is closer to the top; `pos_of` returns the
/// entry's position cell for *this* heap.
pub(crate) struct IndexedHeap<T> {
    entries: Vec<T>,
    less: fn(&T, &T) -> bool,
    pos_of: fn(&T) -> &AtomicUsize,
}

impl<T: Clone> IndexedHeap<T> {
    pub fn new(less: fn(&T, &T) -> bool, pos_of: fn(&T) -> &AtomicUsize) -> Self {
        Self {
            entries: Vec::new(),
            less,
            pos_of,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn top(&self) -> Option<&T> {
        self.entries.first()
    }

    pub fn contains(&self, entry: &T) -> bool {
        (self.pos_of)(entry).load(Relaxed) != HEAP_POS_NONE
    }

    pub fn insert(&mut self, entry: T) {
        debug_assert!(!self.contains(&entry), "entry is already in the heap");

        let i = self.entries.len();
        (self.pos_of)(&entry).store(i, Relaxed);
        self.entries.push(entry);
        self.sift_up(i);
    }

    pub fn remove(&mut self, entry: &T) {
        let i = (self.pos_of)(entry).load(Relaxed);
        debug_assert!(i != HEAP_POS_NONE, "entry is not in the heap");

        (self.pos_of)(entry).store(HEAP_POS_NONE, Relaxed);

        let last = self.entries.len() - 1;
        self.entries.swap_remove(i);

        if i < last {
            (self.pos_of)(&self.entries[i]).store(i, Relaxed);
            self.sift_up(i);
            self.sift_down(i);
        }
    }

    /// Restores heap order after the entry's key changed.
    pub fn update(&mut self, entry: &T) {
        let i = (self.pos_of)(entry).load(Relaxed);
        debug_assert!(i != HEAP_POS_NONE, "entry is not in the heap");

        self.sift_up(i);
        self.sift_down(i);
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        (self.pos_of)(&self.entries[a]).store(a, Relaxed);
        (self.pos_of)(&self.entries[b]).store(b, Relaxed);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;

            if !(self.less)(&self.entries[i], &self.entries[parent]) {
                break;
            }

            self.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let mut best = i;

            for child in [2 * i + 1, 2 * i + 2] {
                if child < self.entries.len()
                    && (self.less)(&self.entries[child], &self.entries[best])
                {
                    best = child;
                }
            }

            if best == i {
                break;
            }

            self.swap(i, best);
            i = best;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{IndexedHeap, HEAP_POS_NONE};
    use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
    use std::sync::Arc;
    use test_log::test;

    struct Item {
        weight: AtomicUsize,
        pos: AtomicUsize,
    }

    fn item(weight: usize) -> Arc<Item> {
        Arc::new(Item {
            weight: AtomicUsize::new(weight),
            pos: AtomicUsize::new(HEAP_POS_NONE),
        })
    }

    fn min_heap() -> IndexedHeap<Arc<Item>> {
        IndexedHeap::new(
            |a, b| a.weight.load(Relaxed) < b.weight.load(Relaxed),
            |x| &x.pos,
        )
    }

    fn drain(heap: &mut IndexedHeap<Arc<Item>>) -> Vec<usize> {
        let mut out = vec![];

        while let Some(top) = heap.top().cloned() {
            out.push(top.weight.load(Relaxed));
            heap.remove(&top);
        }

        out
    }

    #[test]
    fn orders_by_less() {
        let mut heap = min_heap();

        for w in [5, 1, 4, 2, 3] {
            heap.insert(item(w));
        }

        assert_eq!(vec![1, 2, 3, 4, 5], drain(&mut heap));
    }

    #[test]
    fn remove_clears_position() {
        let mut heap = min_heap();

        let a = item(1);
        let b = item(2);
        heap.insert(a.clone());
        heap.insert(b.clone());

        heap.remove(&a);
        assert_eq!(HEAP_POS_NONE, a.pos.load(Relaxed));
        assert!(!heap.contains(&a));
        assert!(heap.contains(&b));
        assert_eq!(1, heap.len());
    }

    #[test]
    fn update_resifts_entry() {
        let mut heap = min_heap();

        let a = item(1);
        let b = item(2);
        let c = item(3);
        heap.insert(a.clone());
        heap.insert(b.clone());
        heap.insert(c.clone());

        a.weight.store(10, Relaxed);
        heap.update(&a);

        assert_eq!(vec![2, 3, 10], drain(&mut heap));
    }

    #[test]
    fn positions_track_swaps() {
        let mut heap = min_heap();
        let items: Vec<_> = [9, 7, 5, 3, 1].iter().map(|&w| item(w)).collect();

        for it in &items {
            heap.insert(it.clone());
        }

        for it in &items {
            let pos = it.pos.load(Relaxed);
            assert!(heap
                .entries
                .get(pos)
                .is_some_and(|e| Arc::ptr_eq(e, it)));
        }
    }
}
