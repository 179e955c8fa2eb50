//! # Disjoint Set Union
//!
//! Union-find over dense indices `0..n`, with path halving and union by rank.
//! Dissolve uses it to track connected components as overlaps are discovered.

use rustc_hash::FxHashMap;

/// Disjoint set over the indices `0..len`
#[derive(Debug, Clone)]
pub struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u32>,
    component_count: usize,
}

impl DisjointSet {
    /// Create `len` singleton sets
    pub fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            rank: vec![0; len],
            component_count: len,
        }
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    /// Number of disjoint components
    pub fn component_count(&self) -> usize {
        self.component_count
    }

    /// Find the root of `index`, pointing every other node on the path at its grandparent
    #[inline]
    pub fn find(&mut self, index: usize) -> usize {
        let mut current = index;
        while self.parent[current] != current {
            let grandparent = self.parent[self.parent[current]];
            self.parent[current] = grandparent;
            current = grandparent;
        }
        current
    }

    pub fn same_component(&mut self, a: usize, b: usize) -> bool {
        self.find(a) == self.find(b)
    }

    /// Merge the components of `a` and `b`; returns false if they were already joined
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a == root_b {
            return false;
        }

        let rank_a = self.rank[root_a];
        let rank_b = self.rank[root_b];
        if rank_a < rank_b {
            self.parent[root_a] = root_b;
        } else if rank_a > rank_b {
            self.parent[root_b] = root_a;
        } else {
            self.parent[root_a] = root_b;
            self.rank[root_b] = rank_b + 1;
        }
        self.component_count -= 1;
        true
    }

    /// Group every index by component
    ///
    /// Groups are ordered by their smallest member and members are ascending,
    /// so the result depends only on the partition, not on union order.
    pub fn components(&mut self) -> Vec<Vec<usize>> {
        let mut slot_of_root: FxHashMap<usize, usize> = FxHashMap::default();
        let mut groups: Vec<Vec<usize>> = Vec::with_capacity(self.component_count);
        for index in 0..self.parent.len() {
            let root = self.find(index);
            let slot = *slot_of_root.entry(root).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[slot].push(index);
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singletons() {
        let mut dsu = DisjointSet::new(4);
        assert_eq!(dsu.component_count(), 4);
        assert_eq!(dsu.components(), vec![vec![0], vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn test_union_and_find() {
        let mut dsu = DisjointSet::new(5);
        assert!(dsu.union(0, 1));
        assert!(dsu.union(3, 4));
        assert!(!dsu.union(1, 0));
        assert!(dsu.same_component(0, 1));
        assert!(!dsu.same_component(1, 3));
        assert_eq!(dsu.component_count(), 3);

        assert!(dsu.union(1, 4));
        assert!(dsu.same_component(0, 3));
        assert_eq!(dsu.component_count(), 2);
    }

    #[test]
    fn test_components_are_order_independent() {
        let mut forward = DisjointSet::new(6);
        forward.union(0, 2);
        forward.union(2, 5);
        forward.union(1, 3);

        let mut backward = DisjointSet::new(6);
        backward.union(3, 1);
        backward.union(5, 2);
        backward.union(2, 0);

        assert_eq!(forward.components(), backward.components());
        assert_eq!(
            forward.components(),
            vec![vec![0, 2, 5], vec![1, 3], vec![4]]
        );
    }

    #[test]
    fn test_long_chain() {
        let mut dsu = DisjointSet::new(10_000);
        for i in 1..10_000 {
            dsu.union(i - 1, i);
        }
        assert_eq!(dsu.component_count(), 1);
        assert_eq!(dsu.find(9_999), dsu.find(0));
    }
}
