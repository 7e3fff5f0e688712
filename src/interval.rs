use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included};

/// One tracked address range, inclusive on both ends, carrying the records
/// registered against it.
#[derive(Debug)]
pub struct IntervalNode<T> {
    pub start: u64,
    pub last: u64,
    pub items: Vec<T>,
}

/// Range-indexed container mapping address intervals to lists of records.
///
/// Nodes are keyed by their start address. Two insertion flavors exist:
/// [`insert_merged`](Self::insert_merged) coalesces every overlapping node
/// into one spanning the union of ranges (the notifier object index), while
/// [`insert`](Self::insert) places each range in its own node (the
/// per-process buffer directory, where allocations never overlap).
///
/// Overlap queries follow a successor protocol: [`first_overlap`] and
/// [`next_overlap`] return node keys, so a caller may fetch the next key
/// before mutating the node it currently holds.
///
/// [`first_overlap`]: Self::first_overlap
/// [`next_overlap`]: Self::next_overlap
#[derive(Debug)]
pub struct IntervalIndex<T> {
    nodes: BTreeMap<u64, IntervalNode<T>>,
}

impl<T> Default for IntervalIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IntervalIndex<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert `[start, last]` as its own node.
    ///
    /// Starts are unique; the caller guarantees no other node begins at
    /// `start` (allocations hand out disjoint ranges).
    pub fn insert(&mut self, start: u64, last: u64, item: T) {
        debug_assert!(start <= last);
        debug_assert!(!self.nodes.contains_key(&start));
        self.nodes.insert(
            start,
            IntervalNode {
                start,
                last,
                items: vec![item],
            },
        );
    }

    /// Insert `[start, last]`, coalescing all overlapping nodes into a
    /// single node spanning the union of their ranges. The payload lists of
    /// the absorbed nodes are spliced into the new node, then `item` is
    /// appended.
    pub fn insert_merged(&mut self, start: u64, last: u64, item: T) {
        debug_assert!(start <= last);

        let mut start = start;
        let mut last = last;
        let mut items = Vec::new();

        while let Some(key) = self.first_overlap(start, last) {
            let node = self.nodes.remove(&key).expect("overlap key just found");
            start = start.min(node.start);
            last = last.max(node.last);
            items.extend(node.items);
        }

        items.push(item);
        self.nodes.insert(start, IntervalNode { start, last, items });
    }

    /// Remove and return the node keyed at `start`.
    pub fn remove(&mut self, start: u64) -> Option<IntervalNode<T>> {
        self.nodes.remove(&start)
    }

    #[must_use]
    pub fn get(&self, start: u64) -> Option<&IntervalNode<T>> {
        self.nodes.get(&start)
    }

    pub fn get_mut(&mut self, start: u64) -> Option<&mut IntervalNode<T>> {
        self.nodes.get_mut(&start)
    }

    /// Key of the lowest-starting node overlapping `[start, last]`.
    #[must_use]
    pub fn first_overlap(&self, start: u64, last: u64) -> Option<u64> {
        // The predecessor node is the only candidate that can begin before
        // `start` and still reach into the queried range.
        if let Some((&key, node)) = self.nodes.range(..=start).next_back() {
            if node.last >= start {
                return Some(key);
            }
        }
        self.nodes
            .range((Excluded(start), Included(last)))
            .next()
            .map(|(&key, _)| key)
    }

    /// Key of the next node after `after` overlapping `[start, last]`.
    ///
    /// `after` is a key previously produced by [`first_overlap`] or this
    /// function for the same query range; the node it names may already have
    /// been removed.
    ///
    /// [`first_overlap`]: Self::first_overlap
    #[must_use]
    pub fn next_overlap(&self, after: u64, start: u64, last: u64) -> Option<u64> {
        self.nodes
            .range((Excluded(after), Included(last)))
            .find(|(_, node)| node.last >= start)
            .map(|(&key, _)| key)
    }

    /// Iterate all nodes in ascending start order.
    pub fn iter(&self) -> impl Iterator<Item = &IntervalNode<T>> {
        self.nodes.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut IntervalNode<T>> {
        self.nodes.values_mut()
    }

    /// Remove every node, yielding them for teardown walks.
    pub fn drain(&mut self) -> impl Iterator<Item = IntervalNode<T>> + use<T> {
        let nodes = std::mem::take(&mut self.nodes);
        nodes.into_values()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }
}
