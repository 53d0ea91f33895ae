//! Order-statistics tree: a concurrent ordered multiset keyed by an
//! integer `order`, augmented with subtree sizes so that `rank` is
//! O(log N) instead of a linear scan.
//!
//! Items with equal `order` are grouped into a bucket at the same node
//! so the tree stays a valid BST under possibly-repeated keys; rank
//! ties are broken by insertion order within the bucket. Tree mutations
//! never fail, so there is no `Result` in this module's public surface.

use std::cmp::Ordering;
use std::collections::HashMap;

use parking_lot::RwLock;

/// An item stored in the tree, keyed by `order`.
pub trait OrderedItem: Clone + Send + Sync {
    /// The ordering key. Items with the same key share a bucket.
    fn order(&self) -> i64;

    /// Stable identity used to remove a specific item from a bucket of
    /// equal-order items (two items can share an `order` but never an
    /// `id`).
    fn id(&self) -> i64;
}

struct Node<T> {
    order: i64,
    items: Vec<T>,
    count: usize,
    left: Option<Box<Node<T>>>,
    right: Option<Box<Node<T>>>,
}

impl<T: OrderedItem> Node<T> {
    fn new(item: T) -> Self {
        Self {
            order: item.order(),
            items: vec![item],
            count: 1,
            left: None,
            right: None,
        }
    }

    fn left_count(&self) -> usize {
        self.left.as_ref().map_or(0, |n| n.count)
    }

    fn recompute_count(&mut self) {
        let right_count = self.right.as_ref().map_or(0, |n| n.count);
        self.count = self.left_count() + self.items.len() + right_count;
    }
}

/// A plain (non-thread-safe) order-statistics tree. `insert`/`delete`/
/// `rank` are the three primitives; everything else builds on them.
pub struct OrderStatTree<T> {
    root: Option<Box<Node<T>>>,
}

impl<T: OrderedItem> Default for OrderStatTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: OrderedItem> OrderStatTree<T> {
    pub fn new() -> Self {
        Self { root: None }
    }

    pub fn len(&self) -> usize {
        self.root.as_ref().map_or(0, |n| n.count)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&mut self, item: T) {
        Self::insert_node(&mut self.root, item);
    }

    fn insert_node(node: &mut Option<Box<Node<T>>>, item: T) {
        match node {
            None => *node = Some(Box::new(Node::new(item))),
            Some(n) => {
                match item.order().cmp(&n.order) {
                    Ordering::Equal => n.items.push(item),
                    Ordering::Less => Self::insert_node(&mut n.left, item),
                    Ordering::Greater => Self::insert_node(&mut n.right, item),
                }
                n.recompute_count();
            }
        }
    }

    /// Remove a single item, matched by `order()` and `id()`.
    pub fn delete(&mut self, order: i64, id: i64) {
        Self::delete_node(&mut self.root, order, id);
    }

    fn delete_node(node: &mut Option<Box<Node<T>>>, order: i64, id: i64) {
        let Some(n) = node else { return };
        match order.cmp(&n.order) {
            Ordering::Less => {
                Self::delete_node(&mut n.left, order, id);
                n.recompute_count();
            }
            Ordering::Greater => {
                Self::delete_node(&mut n.right, order, id);
                n.recompute_count();
            }
            Ordering::Equal => {
                n.items.retain(|it| it.id() != id);
                if n.items.is_empty() {
                    *node = Self::remove_node_take(node.take().unwrap());
                } else {
                    n.recompute_count();
                }
            }
        }
    }

    /// Standard BST node removal: splice out a now-empty bucket.
    fn remove_node_take(mut n: Box<Node<T>>) -> Option<Box<Node<T>>> {
        match (n.left.take(), n.right.take()) {
            (None, None) => None,
            (Some(l), None) => Some(l),
            (None, Some(r)) => Some(r),
            (Some(l), Some(r)) => {
                // Replace with the in-order successor (leftmost of right subtree).
                let mut right = r;
                let (succ_order, succ_items) = Self::take_leftmost(&mut right);
                let mut replacement = Node {
                    order: succ_order,
                    items: succ_items,
                    count: 0,
                    left: Some(l),
                    right: Some(right),
                };
                replacement.recompute_count();
                Some(Box::new(replacement))
            }
        }
    }

    fn take_leftmost(node: &mut Box<Node<T>>) -> (i64, Vec<T>) {
        if node.left.is_some() {
            let mut left = node.left.take().unwrap();
            if left.left.is_none() {
                let taken = (left.order, std::mem::take(&mut left.items));
                node.left = left.right.take();
                node.recompute_count();
                taken
            } else {
                let result = Self::take_leftmost(&mut left);
                node.left = Some(left);
                node.recompute_count();
                result
            }
        } else {
            let taken = (node.order, std::mem::take(&mut node.items));
            taken
        }
    }

    /// 1-based rank (insertion-order position) of the first live item
    /// with the given `order`.
    pub fn rank(&self, order: i64, id: i64) -> i64 {
        let mut rank = 0i64;
        let mut cur = self.root.as_deref();
        while let Some(n) = cur {
            match order.cmp(&n.order) {
                Ordering::Less => cur = n.left.as_deref(),
                Ordering::Greater => {
                    rank += n.left_count() as i64 + n.items.len() as i64;
                    cur = n.right.as_deref();
                }
                Ordering::Equal => {
                    rank += n.left_count() as i64;
                    let pos = n.items.iter().position(|it| it.id() == id).unwrap_or(0);
                    rank += pos as i64 + 1;
                    return rank;
                }
            }
        }
        0
    }

    /// Bulk rank: sorts inputs by key and walks the tree once,
    /// accumulating rank as it descends. Produces identical results to
    /// calling `rank` for each input, in O(N + log T) instead of
    /// O(N log T).
    pub fn rank_many(&self, items: &[(i64, i64)]) -> Vec<i64> {
        let mut indexed: Vec<(usize, i64, i64)> = items
            .iter()
            .enumerate()
            .map(|(i, &(order, id))| (i, order, id))
            .collect();
        indexed.sort_by_key(|&(_, order, _)| order);

        let mut ranks = vec![0i64; items.len()];
        self.rank_many_node(self.root.as_deref(), &indexed, 0, 0, &mut ranks);
        ranks
    }

    fn rank_many_node(
        &self,
        node: Option<&Node<T>>,
        indexed: &[(usize, i64, i64)],
        base_rank: i64,
        start: usize,
        ranks: &mut [i64],
    ) -> i64 {
        let Some(n) = node else { return base_rank };
        if start >= indexed.len() {
            return base_rank;
        }

        // Binary-search the slice for the span whose order is < n.order.
        let mut lo = start;
        while lo < indexed.len() && indexed[lo].1 < n.order {
            lo += 1;
        }
        let mut rank = base_rank;
        if lo > start {
            rank = self.rank_many_node(n.left.as_deref(), indexed, rank, start, ranks);
        }

        let node_rank_base = rank + n.left_count() as i64;
        let mut hi = lo;
        while hi < indexed.len() && indexed[hi].1 == n.order {
            let (orig_idx, _, id) = indexed[hi];
            let pos = n.items.iter().position(|it| it.id() == id).unwrap_or(0);
            ranks[orig_idx] = node_rank_base + pos as i64 + 1;
            hi += 1;
        }

        let subtotal = n.left_count() as i64 + n.items.len() as i64;
        let rank_after_node = rank + subtotal;
        self.rank_many_node(n.right.as_deref(), indexed, rank_after_node, hi, ranks)
    }
}

/// Thread-safe wrapper: writer lock for mutation, reader lock for rank
/// queries.
pub struct ConcurrentOrderStatTree<T> {
    inner: RwLock<OrderStatTree<T>>,
}

impl<T: OrderedItem> Default for ConcurrentOrderStatTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: OrderedItem> ConcurrentOrderStatTree<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(OrderStatTree::new()),
        }
    }

    pub fn insert(&self, item: T) {
        self.inner.write().insert(item);
    }

    pub fn delete(&self, order: i64, id: i64) {
        self.inner.write().delete(order, id);
    }

    pub fn rank(&self, order: i64, id: i64) -> i64 {
        self.inner.read().rank(order, id)
    }

    pub fn rank_many(&self, items: &[(i64, i64)]) -> Vec<i64> {
        self.inner.read().rank_many(items)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// A lightweight node kept alongside the tree for O(1) deletion by id:
/// a concurrent `queue_id -> (order, id)` map avoids having to search
/// the tree to find what to delete. See `CachedStore`.
pub struct RankIndex {
    by_id: RwLock<HashMap<i64, (i64, i64)>>,
}

impl Default for RankIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl RankIndex {
    pub fn new() -> Self {
        Self {
            by_id: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, queue_id: i64, order: i64) {
        self.by_id.write().insert(queue_id, (order, queue_id));
    }

    pub fn remove(&self, queue_id: i64) -> Option<(i64, i64)> {
        self.by_id.write().remove(&queue_id)
    }

    pub fn get(&self, queue_id: i64) -> Option<(i64, i64)> {
        self.by_id.read().get(&queue_id).copied()
    }
}
