//! Hierarchical quiescent-state tree.
//!
//! Each node holds a `qsmask` of children (leaf: cores, interior: nodes) that
//! still owe a quiescent state for the current grace period. A 1 bit is an
//! outstanding report. Reports clear bits with a single `fetch_and`; the one
//! reporter that takes a node to zero carries the report into the parent, so a
//! report touches at most one node per level and the root empties exactly once
//! per GP.
//!
//! Geometry follows the classic tree-RCU layout: leaves hold up to
//! `fanout_leaf` cores, interior nodes up to [`INTERIOR_FANOUT`] children, and
//! the tree is at most [`MAX_LEVELS`] deep. Nodes are stored breadth-first,
//! root at index 0.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering, fence};

use serde::Serialize;

use crate::error::RcuError;

/// Children per interior node (width of the `qsmask` word).
pub const INTERIOR_FANOUT: usize = 64;
pub const MIN_LEAF_FANOUT: usize = 2;
pub const MAX_LEAF_FANOUT: usize = 64;
pub const MAX_LEVELS: usize = 4;

/// Most cores a tree with the given leaf fan-out can cover.
#[must_use]
pub const fn tree_capacity(fanout_leaf: usize) -> usize {
    let mut cap = fanout_leaf;
    let mut i = 1;
    while i < MAX_LEVELS {
        cap = cap.saturating_mul(INTERIOR_FANOUT);
        i += 1;
    }
    cap
}

/// One node of the tree.
#[derive(Debug)]
pub struct RcuNode {
    qsmask: AtomicU64,
    qsmaskinit: u64,
    parent: Option<usize>,
    /// Our bit in the parent's mask (0 for the root).
    grpmask: u64,
    grpnum: usize,
    /// Lowest and highest core covered, inclusive.
    grplo: usize,
    grphi: usize,
    level: usize,
}

impl RcuNode {
    #[must_use]
    pub fn qsmask(&self) -> u64 {
        self.qsmask.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn qsmaskinit(&self) -> u64 {
        self.qsmaskinit
    }

    #[must_use]
    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    #[must_use]
    pub fn grpmask(&self) -> u64 {
        self.grpmask
    }

    #[must_use]
    pub fn grplo(&self) -> usize {
        self.grplo
    }

    #[must_use]
    pub fn grphi(&self) -> usize {
        self.grphi
    }

    #[must_use]
    pub fn level(&self) -> usize {
        self.level
    }
}

/// Serializable view of one node, as produced by [`RcuTree::layout`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeLayout {
    pub index: usize,
    pub level: usize,
    pub grplo: usize,
    pub grphi: usize,
    pub grpnum: usize,
    pub qsmaskinit: u64,
}

#[derive(Debug)]
pub struct RcuTree {
    nodes: Box<[RcuNode]>,
    /// Index of the first node of each level.
    level_start: Vec<usize>,
    /// Leaf node index for every covered core.
    leaf_of: Box<[usize]>,
    num_cores: usize,
    fanout_leaf: usize,
}

impl RcuTree {
    /// Build a tree covering `num_cores` cores.
    pub fn build(num_cores: usize, fanout_leaf: usize) -> Result<Self, RcuError> {
        if num_cores == 0 {
            return Err(RcuError::NoCores);
        }
        if !(MIN_LEAF_FANOUT..=MAX_LEAF_FANOUT).contains(&fanout_leaf) {
            return Err(RcuError::FanoutOutOfRange {
                fanout: fanout_leaf,
            });
        }
        let capacity = tree_capacity(fanout_leaf);
        if num_cores > capacity {
            return Err(RcuError::TooManyCores {
                cores: num_cores,
                capacity,
            });
        }

        // Cores coverable by a tree of i+1 levels.
        let mut level_capacity = [0usize; MAX_LEVELS];
        level_capacity[0] = fanout_leaf;
        for i in 1..MAX_LEVELS {
            level_capacity[i] = level_capacity[i - 1].saturating_mul(INTERIOR_FANOUT);
        }
        let num_levels = level_capacity
            .iter()
            .position(|&cap| num_cores <= cap)
            .map_or(MAX_LEVELS, |i| i + 1);

        let per_level: Vec<usize> = (0..num_levels)
            .map(|i| num_cores.div_ceil(level_capacity[num_levels - 1 - i]))
            .collect();
        let mut level_start = Vec::with_capacity(num_levels);
        let mut total = 0;
        for &count in &per_level {
            level_start.push(total);
            total += count;
        }

        // Balanced spread: children per node at each level.
        let mut spread = vec![0usize; num_levels];
        let mut below = num_cores;
        for i in (0..num_levels).rev() {
            spread[i] = below.div_ceil(per_level[i]);
            below = per_level[i];
        }

        let mut shape = Vec::with_capacity(total);
        shape.resize(total, (0usize, 0usize, None::<usize>, 0usize, 0usize));
        let mut stride = 1usize;
        for i in (0..num_levels).rev() {
            stride = stride.saturating_mul(spread[i]);
            for j in 0..per_level[i] {
                let grplo = j * stride;
                let grphi = ((j + 1) * stride - 1).min(num_cores - 1);
                let (parent, grpnum) = if i == 0 {
                    (None, 0)
                } else {
                    (Some(level_start[i - 1] + j / spread[i - 1]), j % spread[i - 1])
                };
                shape[level_start[i] + j] = (grplo, grphi, parent, grpnum, i);
            }
        }

        let leaf_base = level_start[num_levels - 1];
        let mut qsmaskinit = vec![0u64; total];
        let mut leaf_of = Vec::with_capacity(num_cores);
        let mut leaf = leaf_base;
        for core in 0..num_cores {
            while core > shape[leaf].1 {
                leaf += 1;
            }
            qsmaskinit[leaf] |= 1u64 << (core - shape[leaf].0);
            leaf_of.push(leaf);
        }
        // Children come after parents breadth-first, so walk bottom-up to let
        // populated interior nodes propagate further.
        for idx in (1..total).rev() {
            let (_, _, parent, grpnum, _) = shape[idx];
            if let Some(parent) = parent
                && qsmaskinit[idx] != 0
            {
                qsmaskinit[parent] |= 1u64 << grpnum;
            }
        }

        let nodes: Vec<RcuNode> = shape
            .iter()
            .zip(&qsmaskinit)
            .map(|(&(grplo, grphi, parent, grpnum, level), &init)| RcuNode {
                qsmask: AtomicU64::new(0),
                qsmaskinit: init,
                parent,
                grpmask: if parent.is_some() { 1u64 << grpnum } else { 0 },
                grpnum,
                grplo,
                grphi,
                level,
            })
            .collect();

        Ok(Self {
            nodes: nodes.into_boxed_slice(),
            level_start,
            leaf_of: leaf_of.into_boxed_slice(),
            num_cores,
            fanout_leaf,
        })
    }

    /// Arm every node for a new grace period.
    ///
    /// Must finish before the new `gpnum` is published: a core that sees the
    /// new number may report immediately, and it must clear a freshly armed
    /// mask rather than a stale one.
    pub fn reset_for_new_gp(&self) {
        for node in self.nodes.iter() {
            node.qsmask.store(node.qsmaskinit, Ordering::Relaxed);
        }
        fence(Ordering::Release);
    }

    /// Clear `mask` in `node` and carry the report upward.
    ///
    /// Returns `true` only for the single call that empties the root.
    pub fn mark_quiescent(&self, mut node: usize, mut mask: u64) -> bool {
        loop {
            let rnp = &self.nodes[node];
            let old = rnp.qsmask.fetch_and(!mask, Ordering::AcqRel);
            // Reports on different nodes must be ordered across the whole
            // tree, not only per word.
            fence(Ordering::SeqCst);
            if old == 0 || old & !mask != 0 {
                return false;
            }
            match rnp.parent {
                Some(parent) => {
                    mask = rnp.grpmask;
                    node = parent;
                }
                None => return true,
            }
        }
    }

    /// Leaf node and bit for `core`.
    #[must_use]
    pub fn leaf_for(&self, core: usize) -> (usize, u64) {
        let leaf = self.leaf_of[core];
        (leaf, 1u64 << (core - self.nodes[leaf].grplo))
    }

    #[must_use]
    pub fn root_qsmask(&self) -> u64 {
        self.nodes[0].qsmask()
    }

    #[must_use]
    pub fn root_empty(&self) -> bool {
        self.root_qsmask() == 0
    }

    #[must_use]
    pub fn node(&self, index: usize) -> &RcuNode {
        &self.nodes[index]
    }

    /// All nodes, breadth-first.
    #[must_use]
    pub fn nodes(&self) -> &[RcuNode] {
        &self.nodes
    }

    /// Indices of the leaf level.
    #[must_use]
    pub fn leaves(&self) -> core::ops::Range<usize> {
        self.level_start[self.level_start.len() - 1]..self.nodes.len()
    }

    #[must_use]
    pub fn num_levels(&self) -> usize {
        self.level_start.len()
    }

    #[must_use]
    pub fn num_cores(&self) -> usize {
        self.num_cores
    }

    #[must_use]
    pub fn fanout_leaf(&self) -> usize {
        self.fanout_leaf
    }

    #[must_use]
    pub fn layout(&self) -> Vec<NodeLayout> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(index, n)| NodeLayout {
                index,
                level: n.level,
                grplo: n.grplo,
                grphi: n.grphi,
                grpnum: n.grpnum,
                qsmaskinit: n.qsmaskinit,
            })
            .collect()
    }
}

/// One line per level, `grplo:grphi ^grpnum` per node.
impl fmt::Display for RcuTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut level = 0;
        write!(f, " ")?;
        for n in self.nodes.iter() {
            if n.level != level {
                write!(f, "\n ")?;
                level = n.level;
            }
            write!(f, "{}:{} ^{} ", n.grplo, n.grphi, n.grpnum)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_subset_invariant(tree: &RcuTree) {
        for n in tree.nodes() {
            assert_eq!(n.qsmask() & !n.qsmaskinit(), 0);
        }
    }

    #[test]
    fn single_core_root_is_leaf() {
        let tree = RcuTree::build(1, 16).unwrap();
        assert_eq!(tree.num_levels(), 1);
        assert_eq!(tree.nodes().len(), 1);
        assert_eq!(tree.node(0).qsmaskinit(), 1);
        assert_eq!(tree.leaf_for(0), (0, 1));
        assert_eq!(tree.leaves(), 0..1);
    }

    #[test]
    fn two_hundred_cores_fanout_sixteen() {
        let tree = RcuTree::build(200, 16).unwrap();
        assert_eq!(tree.num_levels(), 2);
        assert_eq!(tree.nodes().len(), 14);
        assert_eq!(tree.leaves(), 1..14);
        // 13 leaves hang off the root.
        assert_eq!(tree.node(0).qsmaskinit(), (1u64 << 13) - 1);
        let last = tree.node(13);
        assert_eq!((last.grplo(), last.grphi()), (192, 199));
        assert_eq!(last.qsmaskinit(), 0xff);
        assert_eq!(last.grpmask(), 1 << 12);
        assert_eq!(tree.leaf_for(17), (2, 1 << 1));
        assert_eq!(tree.node(0).grphi(), 199);
    }

    #[test]
    fn full_leaf_stays_single_level() {
        let tree = RcuTree::build(64, 64).unwrap();
        assert_eq!(tree.num_levels(), 1);
        assert_eq!(tree.node(0).qsmaskinit(), u64::MAX);
        let tree = RcuTree::build(65, 64).unwrap();
        assert_eq!(tree.num_levels(), 2);
    }

    #[test]
    fn every_core_maps_into_its_leaf_range() {
        for (cores, fanout) in [(1, 2), (5, 2), (10, 3), (97, 4), (1000, 16), (4097, 64)] {
            let tree = RcuTree::build(cores, fanout).unwrap();
            for core in 0..cores {
                let (leaf, bit) = tree.leaf_for(core);
                let n = tree.node(leaf);
                assert!(n.grplo() <= core && core <= n.grphi());
                assert_ne!(n.qsmaskinit() & bit, 0);
            }
        }
    }

    #[test]
    fn build_rejects_bad_geometry() {
        assert!(matches!(RcuTree::build(0, 16), Err(RcuError::NoCores)));
        assert!(matches!(
            RcuTree::build(4, 1),
            Err(RcuError::FanoutOutOfRange { .. })
        ));
        assert!(matches!(
            RcuTree::build(tree_capacity(2) + 1, 2),
            Err(RcuError::TooManyCores { .. })
        ));
    }

    #[test]
    fn reset_arms_every_node() {
        let tree = RcuTree::build(40, 4).unwrap();
        for n in tree.nodes() {
            assert_eq!(n.qsmask(), 0);
        }
        tree.reset_for_new_gp();
        for n in tree.nodes() {
            assert_eq!(n.qsmask(), n.qsmaskinit());
        }
        assert_subset_invariant(&tree);
    }

    #[test]
    fn last_reporter_empties_root_once() {
        let tree = RcuTree::build(40, 4).unwrap();
        tree.reset_for_new_gp();
        let mut emptied = 0;
        for core in (0..40).rev() {
            let (leaf, bit) = tree.leaf_for(core);
            if tree.mark_quiescent(leaf, bit) {
                emptied += 1;
                assert_eq!(core, 0, "root emptied before the last report");
            }
            assert_subset_invariant(&tree);
        }
        assert_eq!(emptied, 1);
        assert!(tree.root_empty());
    }

    #[test]
    fn duplicate_report_does_not_propagate() {
        let tree = RcuTree::build(2, 2).unwrap();
        tree.reset_for_new_gp();
        let (leaf, bit0) = tree.leaf_for(0);
        assert!(!tree.mark_quiescent(leaf, bit0));
        assert!(!tree.mark_quiescent(leaf, bit0));
        let (leaf, bit1) = tree.leaf_for(1);
        assert!(tree.mark_quiescent(leaf, bit1));
        // Already empty: a late duplicate must not wake anyone again.
        assert!(!tree.mark_quiescent(leaf, bit1));
    }

    #[test]
    fn layout_dump_lists_levels() {
        let tree = RcuTree::build(200, 16).unwrap();
        let dump = tree.to_string();
        let mut lines = dump.lines();
        assert_eq!(lines.next().map(str::trim), Some("0:199 ^0"));
        let leaves = lines.next().unwrap();
        assert!(leaves.contains("0:15 ^0"));
        assert!(leaves.contains("192:199 ^12"));
        assert_eq!(tree.layout().len(), 14);
        assert_eq!(tree.layout()[13].qsmaskinit, 0xff);
    }
}
