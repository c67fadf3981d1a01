//! B+ Tree Index for QuarryDB
//!
//! This module implements the ordered map every table uses as its primary
//! index. Nodes live in an arena and are addressed by index, which lets leaves
//! carry a `next` link so a full scan is a walk along the leaf level.
//! Searches, insertions and deletions run in O(log n); deletions rebalance by
//! borrowing from or merging with a sibling.

/// Maximum number of keys per node unless configured otherwise
const DEFAULT_ORDER: usize = 64;

/// Smallest order that keeps split and merge arithmetic sound
const MIN_ORDER: usize = 3;

type NodeId = usize;

/// B+ Tree Node
#[derive(Debug, Clone)]
enum Node<K, V> {
    /// Internal node; `children.len() == keys.len() + 1`
    Internal { keys: Vec<K>, children: Vec<NodeId> },
    /// Leaf node with keys, values and the next leaf for range scans
    Leaf {
        keys: Vec<K>,
        values: Vec<V>,
        next: Option<NodeId>,
    },
}

impl<K, V> Node<K, V> {
    fn empty_leaf() -> Self {
        Node::Leaf {
            keys: Vec::new(),
            values: Vec::new(),
            next: None,
        }
    }

    fn key_count(&self) -> usize {
        match self {
            Node::Internal { keys, .. } | Node::Leaf { keys, .. } => keys.len(),
        }
    }
}

/// B+ Tree mapping ordered keys to values
#[derive(Debug, Clone)]
pub struct BPlusTree<K, V> {
    nodes: Vec<Node<K, V>>,
    /// Arena slots released by merges
    free: Vec<NodeId>,
    root: NodeId,
    /// Maximum keys per node
    order: usize,
    /// Number of entries
    size: usize,
}

impl<K: Ord + Clone, V> Default for BPlusTree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone, V> BPlusTree<K, V> {
    /// Create a new empty B+ tree
    pub fn new() -> Self {
        Self::with_order(DEFAULT_ORDER)
    }

    /// Create a new empty B+ tree holding at most `order` keys per node
    pub fn with_order(order: usize) -> Self {
        Self {
            nodes: vec![Node::empty_leaf()],
            free: Vec::new(),
            root: 0,
            order: order.max(MIN_ORDER),
            size: 0,
        }
    }

    /// Number of entries in the tree
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn min_keys(&self) -> usize {
        self.order / 2
    }

    fn alloc(&mut self, node: Node<K, V>) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn take(&mut self, id: NodeId) -> Node<K, V> {
        std::mem::replace(&mut self.nodes[id], Node::empty_leaf())
    }

    fn release(&mut self, id: NodeId) {
        self.nodes[id] = Node::empty_leaf();
        self.free.push(id);
    }

    /// Index of the child that may contain `key`
    fn child_slot(keys: &[K], key: &K) -> usize {
        match keys.binary_search(key) {
            Ok(p) => p + 1, // Exact match: go to right child
            Err(p) => p,
        }
    }

    fn find_leaf(&self, key: &K) -> NodeId {
        let mut id = self.root;
        while let Node::Internal { keys, children } = &self.nodes[id] {
            id = children[Self::child_slot(keys, key)];
        }
        id
    }

    fn leftmost_leaf(&self) -> NodeId {
        let mut id = self.root;
        while let Node::Internal { children, .. } = &self.nodes[id] {
            id = children[0];
        }
        id
    }

    /// Search for a key in the tree
    pub fn get(&self, key: &K) -> Option<&V> {
        match &self.nodes[self.find_leaf(key)] {
            Node::Leaf { keys, values, .. } => keys.binary_search(key).ok().map(|p| &values[p]),
            Node::Internal { .. } => None,
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Insert a key-value pair, returning the previous value for the key
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let (old, split) = self.insert_at(self.root, key, value);
        if let Some((mid_key, right)) = split {
            // Root split, create new root
            let left = self.root;
            self.root = self.alloc(Node::Internal {
                keys: vec![mid_key],
                children: vec![left, right],
            });
        }
        if old.is_none() {
            self.size += 1;
        }
        old
    }

    fn insert_at(&mut self, id: NodeId, key: K, value: V) -> (Option<V>, Option<(K, NodeId)>) {
        let order = self.order;
        match &mut self.nodes[id] {
            Node::Leaf { keys, values, next } => {
                match keys.binary_search(&key) {
                    Ok(pos) => return (Some(std::mem::replace(&mut values[pos], value)), None),
                    Err(pos) => {
                        keys.insert(pos, key);
                        values.insert(pos, value);
                    }
                }
                if keys.len() <= order {
                    return (None, None);
                }

                let mid = keys.len() / 2;
                let right_keys = keys.split_off(mid);
                let right_values = values.split_off(mid);
                let right_next = next.take();
                let mid_key = right_keys[0].clone();
                let right = self.alloc(Node::Leaf {
                    keys: right_keys,
                    values: right_values,
                    next: right_next,
                });
                if let Node::Leaf { next, .. } = &mut self.nodes[id] {
                    *next = Some(right);
                }
                (None, Some((mid_key, right)))
            }
            Node::Internal { keys, children } => {
                let slot = Self::child_slot(keys, &key);
                let child = children[slot];
                let (old, split) = self.insert_at(child, key, value);
                let Some((mid_key, new_child)) = split else {
                    return (old, None);
                };

                let overflow = match &mut self.nodes[id] {
                    Node::Internal { keys, children } => {
                        keys.insert(slot, mid_key);
                        children.insert(slot + 1, new_child);
                        if keys.len() > order {
                            let mid = keys.len() / 2;
                            let right_keys = keys.split_off(mid + 1);
                            let right_children = children.split_off(mid + 1);
                            // keys[mid] moves up into the parent
                            keys.pop().map(|up| (up, right_keys, right_children))
                        } else {
                            None
                        }
                    }
                    Node::Leaf { .. } => None,
                };

                match overflow {
                    Some((up, keys, children)) => {
                        let right = self.alloc(Node::Internal { keys, children });
                        (old, Some((up, right)))
                    }
                    None => (old, None),
                }
            }
        }
    }

    /// Delete a key from the tree, returning its value
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let removed = self.remove_at(self.root, key)?;
        self.size -= 1;

        let collapse = match &self.nodes[self.root] {
            Node::Internal { keys, children } if keys.is_empty() => Some(children[0]),
            _ => None,
        };
        if let Some(child) = collapse {
            let old_root = self.root;
            self.root = child;
            self.release(old_root);
        }
        Some(removed)
    }

    fn remove_at(&mut self, id: NodeId, key: &K) -> Option<V> {
        let (slot, child) = match &mut self.nodes[id] {
            Node::Leaf { keys, values, .. } => {
                let pos = keys.binary_search(key).ok()?;
                keys.remove(pos);
                return Some(values.remove(pos));
            }
            Node::Internal { keys, children } => {
                let slot = Self::child_slot(keys, key);
                (slot, children[slot])
            }
        };

        let removed = self.remove_at(child, key)?;
        if self.nodes[child].key_count() < self.min_keys() {
            self.rebalance(id, slot);
        }
        Some(removed)
    }

    /// Restore the minimum occupancy of `children[slot]` of `parent`
    fn rebalance(&mut self, parent: NodeId, slot: usize) {
        let min = self.min_keys();
        let (left, right) = match &self.nodes[parent] {
            Node::Internal { children, .. } => (
                slot.checked_sub(1).map(|i| children[i]),
                children.get(slot + 1).copied(),
            ),
            Node::Leaf { .. } => return,
        };

        if left.map_or(false, |l| self.nodes[l].key_count() > min) {
            self.borrow_from_left(parent, slot);
        } else if right.map_or(false, |r| self.nodes[r].key_count() > min) {
            self.borrow_from_right(parent, slot);
        } else if left.is_some() {
            self.merge(parent, slot - 1);
        } else if right.is_some() {
            self.merge(parent, slot);
        }
    }

    fn borrow_from_left(&mut self, parent: NodeId, slot: usize) {
        let mut parent_node = self.take(parent);
        if let Node::Internal { keys: seps, children } = &mut parent_node {
            let (left, child) = (children[slot - 1], children[slot]);
            let mut left_node = self.take(left);
            let mut child_node = self.take(child);
            match (&mut left_node, &mut child_node) {
                (
                    Node::Leaf { keys: lk, values: lv, .. },
                    Node::Leaf { keys: ck, values: cv, .. },
                ) => {
                    if let (Some(k), Some(v)) = (lk.pop(), lv.pop()) {
                        ck.insert(0, k);
                        cv.insert(0, v);
                    }
                    seps[slot - 1] = ck[0].clone();
                }
                (
                    Node::Internal { keys: lk, children: lc },
                    Node::Internal { keys: ck, children: cc },
                ) => {
                    if let (Some(k), Some(c)) = (lk.pop(), lc.pop()) {
                        let sep = std::mem::replace(&mut seps[slot - 1], k);
                        ck.insert(0, sep);
                        cc.insert(0, c);
                    }
                }
                _ => {}
            }
            self.nodes[left] = left_node;
            self.nodes[child] = child_node;
        }
        self.nodes[parent] = parent_node;
    }

    fn borrow_from_right(&mut self, parent: NodeId, slot: usize) {
        let mut parent_node = self.take(parent);
        if let Node::Internal { keys: seps, children } = &mut parent_node {
            let (child, right) = (children[slot], children[slot + 1]);
            let mut child_node = self.take(child);
            let mut right_node = self.take(right);
            match (&mut child_node, &mut right_node) {
                (
                    Node::Leaf { keys: ck, values: cv, .. },
                    Node::Leaf { keys: rk, values: rv, .. },
                ) => {
                    ck.push(rk.remove(0));
                    cv.push(rv.remove(0));
                    seps[slot] = rk[0].clone();
                }
                (
                    Node::Internal { keys: ck, children: cc },
                    Node::Internal { keys: rk, children: rc },
                ) => {
                    let sep = std::mem::replace(&mut seps[slot], rk.remove(0));
                    ck.push(sep);
                    cc.push(rc.remove(0));
                }
                _ => {}
            }
            self.nodes[child] = child_node;
            self.nodes[right] = right_node;
        }
        self.nodes[parent] = parent_node;
    }

    /// Fold `children[left_slot + 1]` into `children[left_slot]`
    fn merge(&mut self, parent: NodeId, left_slot: usize) {
        let mut parent_node = self.take(parent);
        if let Node::Internal { keys: seps, children } = &mut parent_node {
            let sep = seps.remove(left_slot);
            let right = children.remove(left_slot + 1);
            let left = children[left_slot];
            let right_node = self.take(right);
            match (&mut self.nodes[left], right_node) {
                (
                    Node::Leaf { keys, values, next },
                    Node::Leaf {
                        keys: rk,
                        values: rv,
                        next: rn,
                    },
                ) => {
                    keys.extend(rk);
                    values.extend(rv);
                    *next = rn;
                }
                (
                    Node::Internal { keys, children },
                    Node::Internal {
                        keys: rk,
                        children: rc,
                    },
                ) => {
                    keys.push(sep);
                    keys.extend(rk);
                    children.extend(rc);
                }
                _ => {}
            }
            self.release(right);
        }
        self.nodes[parent] = parent_node;
    }

    /// Iterate over all entries in key order
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            tree: self,
            leaf: Some(self.leftmost_leaf()),
            pos: 0,
        }
    }

    /// Iterate in key order starting at the first key `>= start`
    pub fn iter_from(&self, start: &K) -> Iter<'_, K, V> {
        let leaf = self.find_leaf(start);
        let pos = match &self.nodes[leaf] {
            Node::Leaf { keys, .. } => keys.binary_search(start).unwrap_or_else(|p| p),
            Node::Internal { .. } => 0,
        };
        Iter {
            tree: self,
            leaf: Some(leaf),
            pos,
        }
    }

    /// Range scan over `[start, end]`; `None` leaves a side unbounded
    pub fn range_scan<'a>(
        &'a self,
        start: Option<&K>,
        end: Option<&'a K>,
    ) -> impl Iterator<Item = (&'a K, &'a V)> + 'a {
        let iter = match start {
            Some(s) => self.iter_from(s),
            None => self.iter(),
        };
        iter.take_while(move |(k, _)| end.map_or(true, |e| *k <= e))
    }

    /// Iterate over the values in key order
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, v)| v)
    }
}

/// In-order iterator following the leaf links
pub struct Iter<'a, K, V> {
    tree: &'a BPlusTree<K, V>,
    leaf: Option<NodeId>,
    pos: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let tree: &'a BPlusTree<K, V> = self.tree;
        loop {
            match &tree.nodes[self.leaf?] {
                Node::Leaf { keys, values, next } => {
                    if self.pos < keys.len() {
                        let i = self.pos;
                        self.pos += 1;
                        return Some((&keys[i], &values[i]));
                    }
                    self.leaf = *next;
                    self.pos = 0;
                }
                Node::Internal { .. } => return None,
            }
        }
    }
}

impl<'a, K: Ord + Clone, V> IntoIterator for &'a BPlusTree<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use std::fmt::Debug;

    /// Walk the tree checking ordering, occupancy and uniform leaf depth
    fn check_invariants<K: Ord + Clone + Debug, V>(tree: &BPlusTree<K, V>) {
        fn walk<K: Ord + Clone + Debug, V>(
            tree: &BPlusTree<K, V>,
            id: NodeId,
            depth: usize,
            is_root: bool,
            leaf_depth: &mut Option<usize>,
        ) {
            let node = &tree.nodes[id];
            if !is_root {
                assert!(node.key_count() >= tree.min_keys(), "underfull node {}", id);
            }
            assert!(node.key_count() <= tree.order, "overfull node {}", id);
            match node {
                Node::Leaf { keys, values, .. } => {
                    assert_eq!(keys.len(), values.len());
                    assert!(keys.windows(2).all(|w| w[0] < w[1]));
                    match leaf_depth {
                        Some(d) => assert_eq!(*d, depth, "leaves at different depths"),
                        None => *leaf_depth = Some(depth),
                    }
                }
                Node::Internal { keys, children } => {
                    assert_eq!(children.len(), keys.len() + 1);
                    assert!(keys.windows(2).all(|w| w[0] < w[1]));
                    for &c in children {
                        walk(tree, c, depth + 1, false, leaf_depth);
                    }
                }
            }
        }
        let mut leaf_depth = None;
        walk(tree, tree.root, 0, true, &mut leaf_depth);

        let keys: Vec<&K> = tree.iter().map(|(k, _)| k).collect();
        assert_eq!(keys.len(), tree.len());
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(u16, u32),
        Remove(u16),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0u16..512, any::<u32>()).prop_map(|(k, v)| Op::Insert(k, v)),
            2 => (0u16..512).prop_map(Op::Remove),
        ]
    }

    #[test]
    fn test_btree_insert_and_search() {
        let mut tree = BPlusTree::with_order(4);

        tree.insert(5, "five");
        tree.insert(3, "three");
        tree.insert(7, "seven");
        tree.insert(1, "one");

        assert_eq!(tree.get(&5), Some(&"five"));
        assert_eq!(tree.get(&3), Some(&"three"));
        assert_eq!(tree.get(&7), Some(&"seven"));
        assert_eq!(tree.get(&1), Some(&"one"));
        assert_eq!(tree.get(&99), None);
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn test_btree_insert_replaces() {
        let mut tree = BPlusTree::with_order(4);
        assert_eq!(tree.insert(1, 10), None);
        assert_eq!(tree.insert(1, 11), Some(10));
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.get(&1), Some(&11));
    }

    #[test]
    fn test_btree_delete() {
        let mut tree = BPlusTree::with_order(4);

        for i in 1..=5 {
            tree.insert(i, i * 10);
        }

        assert_eq!(tree.remove(&3), Some(30));
        assert_eq!(tree.get(&3), None);
        assert_eq!(tree.remove(&3), None);
        assert_eq!(tree.len(), 4);
        check_invariants(&tree);
    }

    #[test]
    fn test_btree_range_scan() {
        let mut tree = BPlusTree::with_order(3);

        for i in [1, 3, 5, 7, 9, 11, 13, 15] {
            tree.insert(i, ());
        }

        let results: Vec<i32> = tree.range_scan(Some(&5), Some(&11)).map(|(k, _)| *k).collect();
        assert_eq!(results, vec![5, 7, 9, 11]);

        let results: Vec<i32> = tree.range_scan(Some(&6), None).map(|(k, _)| *k).collect();
        assert_eq!(results, vec![7, 9, 11, 13, 15]);
    }

    #[test]
    fn test_btree_scan_all_sorted() {
        let mut tree = BPlusTree::with_order(3);

        for i in [5, 2, 8, 1, 9, 3] {
            tree.insert(i, i);
        }

        let keys: Vec<i32> = tree.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![1, 2, 3, 5, 8, 9]);
        check_invariants(&tree);
    }

    proptest! {
        #[test]
        fn prop_btree_matches_btreemap(
            order in 3usize..17,
            ops in prop::collection::vec(op(), 1..800),
        ) {
            let mut tree = BPlusTree::with_order(order);
            let mut model = BTreeMap::new();
            for op in ops {
                match op {
                    Op::Insert(k, v) => {
                        prop_assert_eq!(tree.insert(k, v), model.insert(k, v));
                    }
                    Op::Remove(k) => {
                        prop_assert_eq!(tree.remove(&k), model.remove(&k));
                    }
                }
            }
            check_invariants(&tree);
            prop_assert_eq!(tree.len(), model.len());
            let entries: Vec<(u16, u32)> = tree.iter().map(|(k, v)| (*k, *v)).collect();
            let expected: Vec<(u16, u32)> = model.into_iter().collect();
            prop_assert_eq!(entries, expected);
        }

        #[test]
        fn prop_btree_drains_to_empty(
            order in 3usize..17,
            (inserts, removals) in prop::collection::btree_set(any::<i32>(), 0..400)
                .prop_flat_map(|keys| {
                    let keys: Vec<i32> = keys.into_iter().collect();
                    (Just(keys.clone()).prop_shuffle(), Just(keys).prop_shuffle())
                }),
        ) {
            let mut tree = BPlusTree::with_order(order);
            for &k in &inserts {
                tree.insert(k, k);
            }
            check_invariants(&tree);

            for k in removals {
                prop_assert_eq!(tree.remove(&k), Some(k));
            }
            check_invariants(&tree);
            prop_assert!(tree.is_empty());
            prop_assert_eq!(tree.iter().count(), 0);
        }

        #[test]
        fn prop_range_scan_matches_model(
            keys in prop::collection::btree_set(0i32..1000, 0..300),
            a in 0i32..1000,
            b in 0i32..1000,
        ) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let mut tree = BPlusTree::with_order(4);
            for &k in &keys {
                tree.insert(k, ());
            }
            let found: Vec<i32> = tree.range_scan(Some(&lo), Some(&hi)).map(|(k, _)| *k).collect();
            let expected: Vec<i32> = keys.range(lo..=hi).copied().collect();
            prop_assert_eq!(found, expected);
        }
    }

    #[test]
    fn test_btree_reuses_freed_nodes() {
        let mut tree = BPlusTree::with_order(3);
        for k in 0..100 {
            tree.insert(k, ());
        }
        for k in 0..100 {
            tree.remove(&k);
        }
        let arena = tree.nodes.len();
        for k in 0..100 {
            tree.insert(k, ());
        }
        assert!(tree.nodes.len() <= arena + 1);
        check_invariants(&tree);
    }
}
