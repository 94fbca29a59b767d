//! Cascading internal splits.
//!
//! A full internal page splits by sweeping the endpoints of its child
//! covers along every axis for the separation maximizing the fairness
//! score N²/2 / (n_lo² + n_hi²); children straddling the chosen zone
//! are pushed to whichever side they overlap less, topping up a side
//! that would otherwise fall under the minimum occupancy. When no
//! sweep reaches the fairness threshold, the page is halved instead:
//! children are sorted along each axis and cut in the middle, keeping
//! the cut whose two halves overlap least.
//!
//! Splitting renumbers every moved child's subtree. Callers that are
//! themselves relocating a descendant (a deeper split waiting on its
//! leaf, say) pass the chain of pending ids in `inception`, deepest at
//! the front; the chain is rewritten as the split reseats the ancestor
//! it hangs from, and again wholesale when root growth pushes the whole
//! tree one level down.

use std::collections::VecDeque;

use log::info;

use crate::error::Result;
use crate::geometry::Cover;
use crate::types::PageId;

use super::Tree;

/// Old child slots of a split page, in their new order on each side
struct Partition {
    lo: Vec<u32>,
    hi: Vec<u32>,
}

impl Tree {
    /// Split the full internal page at `position`. Returns the id under
    /// which the page's lower half (or upper half, when the pending
    /// descendant moved there) continues, with `inception` rewritten to
    /// the renumbered pending chain.
    pub(crate) fn split_internal(
        &self,
        position: PageId,
        inception: &mut VecDeque<PageId>,
    ) -> Result<PageId> {
        info!("splitting internal block {}", position);
        let position = self.ensure_parent_has_room(position, inception)?;

        let (fairness, axis, zone) = self.fairness_sweep(position)?;
        let partition = if fairness >= self.fairness() {
            info!(
                "split zone ({:.3}, {:.3}) along axis {} achieves fairness {:.3}",
                zone.0, zone.1, axis, fairness
            );
            self.partition_by_zone(position, axis, zone)?
        } else {
            info!(
                "best fairness {:.3} under threshold {:.3}; halving block {}",
                fairness,
                self.fairness(),
                position
            );
            self.partition_by_halving(position)?
        };
        self.distribute(position, partition, inception)
    }

    /// Make room in the parent of `position`: cascade the split upward
    /// when the parent is full, or grow a new root when `position` is
    /// the root itself. Returns the (possibly renumbered) position.
    fn ensure_parent_has_room(
        &self,
        mut position: PageId,
        inception: &mut VecDeque<PageId>,
    ) -> Result<PageId> {
        let m = self.internal_entries();
        if position.is_root() {
            self.grow_root()?;
            // the whole tree moved one level down; rewrite every
            // pending id through its level anchor
            inception.push_back(PageId::NONE);
            while let Some(pending) = inception.pop_front() {
                if pending == PageId::NONE {
                    break;
                }
                let anchorage = pending.anchor(m);
                let shifted =
                    anchorage.child(m, (pending.value() - anchorage.value()) as u32);
                info!("pending block {} transposes to {}", pending, shifted);
                inception.push_back(shifted);
            }
            return Ok(PageId::ROOT.child(m, 0));
        }

        let parent_id = position.parent(m);
        if self.page_records(parent_id)? >= m {
            inception.push_back(position);
            let new_parent = self.split_internal(parent_id, inception)?;
            position = inception.pop_back().expect("pending split position lost");
            assert_eq!(
                position.parent(m),
                new_parent,
                "pending split position detached from its parent"
            );
        }
        Ok(position)
    }

    /// Push the entire tree one level down and put a fresh internal
    /// root above it, covering everything the old root covered.
    pub(crate) fn grow_root(&self) -> Result<()> {
        info!("growing a new internal root");
        let m = self.internal_entries();
        let changes = self.transpose_subtree(PageId::ROOT, PageId::ROOT.child(m, 0))?;
        self.dump_changes(changes)?;

        let mut new_root = self.new_internal_page();
        new_root.push_slot_cover(&self.root_cover());
        self.install_page(PageId::ROOT, new_root)?;

        let mut st = self.state.write();
        st.page_count += 1;
        st.dirty = true;
        Ok(())
    }

    /// Endpoint sweep over every axis. Returns the best fairness score
    /// with its axis and separation zone.
    fn fairness_sweep(&self, position: PageId) -> Result<(f64, u16, (f64, f64))> {
        let d = self.dimensions();
        let minocc = self.min_internal_occupancy() as usize;
        let frame = self.load_page(position)?;
        let page = frame.read();
        let n = page.records(d) as usize;
        let axes = page.split_axes(d);

        let mut best = (0.0f64, 0u16, (0.0f64, 0.0f64));
        for axis in 0..axes {
            // (value, is_start, slot); at equal values ends sweep first
            let mut events: Vec<(f64, bool)> = Vec::with_capacity(2 * n);
            for slot in 0..n as u32 {
                let (start, end) = page.slot_axis(slot, d, axis);
                events.push((start, true));
                events.push((end, false));
            }
            events.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

            let mut axis_best = (0.0f64, (0.0f64, 0.0f64));
            let mut lo = 0usize;
            let mut last_end = f64::NEG_INFINITY;
            for (value, is_start) in events {
                if is_start {
                    let hi = n - lo;
                    if lo >= minocc && hi >= minocc {
                        let fairness =
                            (n as f64 * n as f64 / 2.0) / ((lo * lo + hi * hi) as f64);
                        if fairness > axis_best.0 {
                            axis_best = (fairness, (last_end, value));
                        }
                    }
                } else {
                    lo += 1;
                    last_end = value;
                }
            }
            if axis_best.0 > best.0 {
                best = (axis_best.0, axis, axis_best.1);
            }
        }
        Ok(best)
    }

    /// Assign children to the two sides of a separation zone; children
    /// straddling the zone go to the side they protrude into less, and
    /// an undersized side steals the deepest stragglers of the other.
    fn partition_by_zone(
        &self,
        position: PageId,
        axis: u16,
        zone: (f64, f64),
    ) -> Result<Partition> {
        let d = self.dimensions();
        let minocc = self.min_internal_occupancy() as usize;
        let frame = self.load_page(position)?;
        let page = frame.read();
        let n = page.records(d);

        let mut lo = Vec::new();
        let mut hi = Vec::new();
        // stragglers keyed by how far they protrude into the zone;
        // sorted ascending so pop() yields the deepest
        let mut lo_overlap: Vec<(f64, u32)> = Vec::new();
        let mut hi_overlap: Vec<(f64, u32)> = Vec::new();

        for slot in 0..n {
            let (start, end) = page.slot_axis(slot, d, axis);
            if end <= zone.0 {
                lo.push(slot);
            } else if start >= zone.1 {
                hi.push(slot);
            } else if end - zone.0 <= zone.1 - start {
                lo_overlap.push((end - zone.0, slot));
            } else {
                hi_overlap.push((zone.1 - start, slot));
            }
        }
        lo_overlap.sort_by(|a, b| a.0.total_cmp(&b.0));
        hi_overlap.sort_by(|a, b| a.0.total_cmp(&b.0));

        while hi.len() + hi_overlap.len() < minocc {
            let (_, slot) = lo_overlap
                .pop()
                .or_else(|| hi_overlap.pop())
                .expect("split cannot satisfy minimum occupancy");
            hi.push(slot);
        }
        while lo.len() + lo_overlap.len() < minocc {
            let (_, slot) = hi_overlap
                .pop()
                .or_else(|| lo_overlap.pop())
                .expect("split cannot satisfy minimum occupancy");
            lo.push(slot);
        }
        while let Some((_, slot)) = lo_overlap.pop() {
            lo.push(slot);
        }
        while let Some((_, slot)) = hi_overlap.pop() {
            hi.push(slot);
        }
        Ok(Partition { lo, hi })
    }

    /// 50/50 cardinality split: sort children along each axis by either
    /// endpoint, cut in the middle, and keep the cut whose halves
    /// overlap least along the sorting axis.
    fn partition_by_halving(&self, position: PageId) -> Result<Partition> {
        let d = self.dimensions();
        let frame = self.load_page(position)?;
        let page = frame.read();
        let n = page.records(d);
        let axes = page.split_axes(d);

        let mut best_overlap = f64::INFINITY;
        let mut best: Option<Partition> = None;
        for axis in 0..axes {
            for by_end in [false, true] {
                let mut order: Vec<u32> = (0..n).collect();
                order.sort_by(|&a, &b| {
                    let ka = page.slot_axis(a, d, axis);
                    let kb = page.slot_axis(b, d, axis);
                    if by_end {
                        ka.1.total_cmp(&kb.1)
                    } else {
                        ka.0.total_cmp(&kb.0)
                    }
                });
                let cut = (n - n / 2) as usize;
                let (first, second) = order.split_at(cut);

                let first_max_end = first
                    .iter()
                    .map(|&s| page.slot_axis(s, d, axis).1)
                    .fold(f64::NEG_INFINITY, f64::max);
                let second_min_start = second
                    .iter()
                    .map(|&s| page.slot_axis(s, d, axis).0)
                    .fold(f64::INFINITY, f64::min);
                let overlap = (first_max_end - second_min_start).max(0.0);

                if overlap < best_overlap {
                    best_overlap = overlap;
                    best = Some(Partition {
                        lo: first.to_vec(),
                        hi: second.to_vec(),
                    });
                }
            }
        }
        Ok(best.expect("halving an internal page with no children"))
    }

    /// Carry out a partition: transpose every moved child subtree to
    /// its new id, rewrite the pending chain when it hangs from a moved
    /// child, reseat the two halves, and re-cover the parent slots.
    /// The freshly written parent and halves are flushed out, matching
    /// the dump policy of the transposition drain.
    fn distribute(
        &self,
        position: PageId,
        partition: Partition,
        inception: &mut VecDeque<PageId>,
    ) -> Result<PageId> {
        let d = self.dimensions();
        let m = self.internal_entries();
        let minocc = self.min_internal_occupancy() as usize;

        let parent_id = position.parent(m);
        let lo_slot = position.slot(m);
        let parent_records = self.page_records(parent_id)?;
        assert!(parent_records < m, "internal split under a full parent");
        let lo_id = position;
        let hi_id = parent_id.child(m, parent_records);

        assert!(
            partition.lo.len() >= minocc && partition.hi.len() >= minocc,
            "split of block {} violates minimum occupancy ({}/{})",
            position,
            partition.lo.len(),
            partition.hi.len()
        );

        // nearest pending descendant: a direct child of the split page
        inception.push_front(PageId::NONE);
        let pending = inception.pop_back().expect("pending chain underflow");
        assert!(
            pending != PageId::NONE,
            "internal split without a pending descendant"
        );

        let covers: Vec<Cover> = {
            let frame = self.load_page(position)?;
            let page = frame.read();
            (0..page.records(d))
                .map(|slot| page.slot_cover(slot, d))
                .collect()
        };

        let mut lo_page = self.new_internal_page();
        let mut hi_page = self.new_internal_page();
        let mut changes = Vec::new();
        let mut new_position = lo_id;
        let mut matched = false;

        for (new_slot, &old_slot) in partition.lo.iter().enumerate() {
            let old_child = position.child(m, old_slot);
            let new_child = lo_id.child(m, new_slot as u32);
            lo_page.push_slot_cover(&covers[old_slot as usize]);
            if !matched && old_child == pending {
                self.remap_pending_chain(inception, new_child);
                matched = true;
            }
            changes.extend(self.transpose_subtree(old_child, new_child)?);
        }
        for (new_slot, &old_slot) in partition.hi.iter().enumerate() {
            let old_child = position.child(m, old_slot);
            let new_child = hi_id.child(m, new_slot as u32);
            hi_page.push_slot_cover(&covers[old_slot as usize]);
            if !matched && old_child == pending {
                self.remap_pending_chain(inception, new_child);
                matched = true;
                new_position = hi_id;
            }
            changes.extend(self.transpose_subtree(old_child, new_child)?);
        }
        assert!(matched, "pending descendant was not reassigned by the split");

        self.discard_page(position);
        self.dump_changes(changes)?;

        let lo_cover = lo_page.contents_cover(d);
        let hi_cover = hi_page.contents_cover(d);
        {
            let parent = self.load_page(parent_id)?;
            let mut page = parent.write();
            page.set_slot_cover(lo_slot, d, &lo_cover);
            page.push_slot_cover(&hi_cover);
            page.dirty = true;
        }

        self.install_page(lo_id, lo_page)?;
        self.install_page(hi_id, hi_page)?;
        {
            let mut st = self.state.write();
            st.page_count += 1;
            st.dirty = true;
        }

        self.flush_page(parent_id)?;
        self.flush_page(lo_id)?;
        self.flush_page(hi_id)?;

        info!(
            "internal block {} split into {} ({} children) and {} ({} children)",
            position,
            lo_id,
            partition.lo.len(),
            hi_id,
            partition.hi.len()
        );
        Ok(new_position)
    }

    /// The pending ancestor just moved to `new_id`; rewrite the rest of
    /// the chain (deeper pendings, front of the queue) underneath it,
    /// preserving each one's slot offsets.
    fn remap_pending_chain(&self, inception: &mut VecDeque<PageId>, new_id: PageId) {
        let m = self.internal_entries();
        let mut new_id = new_id;
        inception.push_front(new_id);
        loop {
            let pending = inception.pop_back().expect("pending chain underflow");
            if pending == PageId::NONE {
                break;
            }
            new_id = new_id.child(m, pending.slot(m));
            inception.push_front(new_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::geometry::{box_in_box, Cover};
    use crate::types::{Config, PageId};
    use crate::Tree;
    use tempfile::tempdir;

    // page size 136 at 2-D: leaf and internal fan-outs of 8,
    // minimum occupancy ⌈0.5·8/2⌉ = 2
    fn deep_tree(dir: &tempfile::TempDir) -> Tree {
        Tree::create(Config::spatial(dir.path().join("test.db"), 2).page_size(136)).unwrap()
    }

    fn tree_height(tree: &Tree) -> usize {
        let m = tree.internal_entries();
        let mut height = 1;
        let mut id = PageId::ROOT;
        loop {
            let frame = tree.load_page(id).unwrap();
            let is_leaf = frame.read().is_leaf();
            if is_leaf {
                return height;
            }
            height += 1;
            id = id.child(m, 0);
        }
    }

    /// Walk the whole tree checking containment (P-III), occupancy
    /// (P-IV), and parent/slot agreement (P-V).
    fn check_structure(tree: &Tree) {
        let d = tree.dimensions();
        let m = tree.internal_entries();
        let mut stack = vec![PageId::ROOT];
        while let Some(id) = stack.pop() {
            let frame = tree.load_page(id).unwrap();
            let page = frame.read();
            let records = page.records(d);

            if !id.is_root() {
                let min = if page.is_leaf() {
                    tree.min_leaf_occupancy()
                } else {
                    tree.min_internal_occupancy()
                };
                assert!(
                    records >= min,
                    "block {} has {} records, minimum is {}",
                    id,
                    records,
                    min
                );

                let parent = tree.load_page(id.parent(m)).unwrap();
                let slot_cover = parent.read().slot_cover(id.slot(m), d);
                let contents = page.contents_cover(d);
                match (&slot_cover, &contents) {
                    (Cover::Box(outer), Cover::Box(inner)) => assert!(
                        box_in_box(inner, outer),
                        "block {} escapes its parent slot",
                        id
                    ),
                    (Cover::Range(outer), Cover::Range(inner)) => {
                        assert!(outer.covers(inner), "block {} escapes its parent slot", id)
                    }
                    _ => panic!("cover variant mismatch"),
                }
            } else if !page.is_leaf() {
                assert!(records >= 2, "internal root holds {} children", records);
            }

            if !page.is_leaf() {
                for slot in 0..records {
                    stack.push(id.child(m, slot));
                }
            }
        }
    }

    #[test]
    fn test_cascading_split_grows_a_new_root() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempdir().unwrap();
        let tree = deep_tree(&dir);

        // diagonal keys keep splitting the rightmost leaf until the
        // root internal page itself fills and the tree grows
        let n = 120u64;
        for i in 0..n {
            tree.insert(&[i as f32, i as f32], i).unwrap();
        }

        assert_eq!(tree_height(&tree), 3);
        check_structure(&tree);

        for i in 0..n {
            assert_eq!(
                tree.find_any(&[i as f32, i as f32]).unwrap(),
                i,
                "record {} lost after cascading splits",
                i
            );
        }
        tree.assert_cache_parity();
    }

    #[test]
    fn test_clustered_inserts_split_fairly() {
        let dir = tempdir().unwrap();
        let tree = deep_tree(&dir);

        // two tight clusters force zone splits, interleaved inserts
        // keep both sides active
        let n = 160u64;
        for i in 0..n {
            let (x, y) = if i % 2 == 0 {
                ((i % 13) as f32 * 0.1, (i % 7) as f32 * 0.1)
            } else {
                (1000.0 + (i % 11) as f32, 1000.0 + (i % 5) as f32)
            };
            tree.insert(&[x, y], i).unwrap();
        }

        check_structure(&tree);
        for i in 0..n {
            let (x, y) = if i % 2 == 0 {
                ((i % 13) as f32 * 0.1, (i % 7) as f32 * 0.1)
            } else {
                (1000.0 + (i % 11) as f32, 1000.0 + (i % 5) as f32)
            };
            assert!(tree.find_all(&[x, y]).unwrap().contains(&i));
        }
    }

    #[test]
    fn test_survives_reopen_after_deep_splits() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let n = 120u64;
        {
            let tree =
                Tree::create(Config::spatial(&path, 2).page_size(136)).unwrap();
            for i in 0..n {
                tree.insert(&[i as f32, (n - i) as f32], i).unwrap();
            }
            tree.close().unwrap();
        }
        let tree = Tree::open(Config::spatial(&path, 2)).unwrap();
        for i in 0..n {
            assert_eq!(tree.find_any(&[i as f32, (n - i) as f32]).unwrap(), i);
        }
        check_structure(&tree);
    }
}
