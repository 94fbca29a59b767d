//! Spatial insertion: leaf location, leaf splits, bounding maintenance.
//!
//! An insert first searches every subtree whose box contains the key,
//! remembering the least-loaded containing leaf. If no subtree
//! contains the key, the fallback walk descends along the child slots
//! whose boxes need the least volume expansion, widening each slot on
//! the way back up. A full leaf splits along the widest dimension of
//! its bounding box; a full parent cascades into the internal split
//! machinery first.

use std::collections::VecDeque;

use log::{debug, info};

use crate::error::Result;
use crate::geometry::{expansion_volume, key_in_box, Cover, Interval};
use crate::types::{Coord, ObjectId, PageId, TreeVariant};

use super::Tree;

impl Tree {
    /// Add a point record. Duplicate keys are permitted.
    pub fn insert(&self, key: &[Coord], object: ObjectId) -> Result<()> {
        assert_eq!(self.variant(), TreeVariant::Spatial, "point insert on a graph tree");
        assert_eq!(key.len(), self.dimensions() as usize, "key dimensionality mismatch");

        {
            let mut st = self.state.write();
            st.dirty = true;
            st.indexed_records += 1;
        }

        match self.least_loaded_containing_leaf(key)? {
            Some((mut position, records)) => {
                if records >= self.leaf_entries() {
                    position = self.split_leaf(position)?;
                    position = match self.choose_leaf_after_split(position, key)? {
                        Some(chosen) => chosen,
                        // the split separated both halves away from the
                        // key; fall back to the expansion walk
                        None => return self.insert_by_expansion(key, object),
                    };
                }
                let frame = self.load_page(position)?;
                frame.write().push_point(key, object);
                self.update_upwards(position)
            }
            None => self.insert_by_expansion(key, object),
        }
    }

    /// Search every subtree whose box contains `key`; return the
    /// containing leaf with the fewest records, if any.
    fn least_loaded_containing_leaf(&self, key: &[Coord]) -> Result<Option<(PageId, u32)>> {
        let d = self.dimensions();
        let m = self.internal_entries();
        let mut best: Option<(PageId, u32)> = None;
        let mut stack = vec![PageId::ROOT];

        while let Some(id) = stack.pop() {
            let frame = self.load_page(id)?;
            let page = frame.read();
            if page.is_leaf() {
                let records = page.records(d);
                if best.map_or(true, |(_, load)| records < load) {
                    best = Some((id, records));
                }
            } else {
                for slot in 0..page.records(d) {
                    if let Cover::Box(bbox) = page.slot_cover(slot, d) {
                        if key_in_box(key, &bbox) {
                            stack.push(id.child(m, slot));
                        }
                    }
                }
            }
        }
        Ok(best)
    }

    /// After splitting the leaf that was meant to take `key`, pick
    /// between the two resulting leaves: a containing one (the less
    /// loaded when both contain), or neither.
    fn choose_leaf_after_split(&self, position: PageId, key: &[Coord]) -> Result<Option<PageId>> {
        let m = self.internal_entries();
        let parent_id = position.parent(m);
        let parent_records = self.page_records(parent_id)?;
        let sibling = parent_id.child(m, parent_records - 1);

        let former = self.slot_contains_key(position, key)?;
        let latter = self.slot_contains_key(sibling, key)?;
        if former && latter {
            let position_load = self.page_records(position)?;
            let sibling_load = self.page_records(sibling)?;
            Ok(Some(if sibling_load < position_load {
                sibling
            } else {
                position
            }))
        } else if latter {
            Ok(Some(sibling))
        } else if former {
            Ok(Some(position))
        } else {
            Ok(None)
        }
    }

    /// Whether the bounding box recorded for page `id` (its parent's
    /// slot, or the root cover) contains `key`
    fn slot_contains_key(&self, id: PageId, key: &[Coord]) -> Result<bool> {
        let cover = if id.is_root() {
            self.root_cover()
        } else {
            let m = self.internal_entries();
            let parent = self.load_page(id.parent(m))?;
            let cover = parent.read().slot_cover(id.slot(m), self.dimensions());
            cover
        };
        match cover {
            Cover::Box(bbox) => Ok(key_in_box(key, &bbox)),
            Cover::Range(_) => unreachable!("range cover in a spatial tree"),
        }
    }

    /// Descend along minimum-expansion slots, split the arrival leaf if
    /// full, insert, and widen the ancestor slots to cover the key.
    fn insert_by_expansion(&self, key: &[Coord], object: ObjectId) -> Result<()> {
        let d = self.dimensions();
        let m = self.internal_entries();

        let mut position = PageId::ROOT;
        loop {
            let frame = self.load_page(position)?;
            let (is_leaf, records) = {
                let page = frame.read();
                (page.is_leaf(), page.records(d))
            };
            if is_leaf {
                if records >= self.leaf_entries() {
                    position = self.split_leaf(position)?;
                    if let Some(chosen) = self.choose_leaf_after_split(position, key)? {
                        position = chosen;
                    }
                    // neither half contains the key: keep the lower
                    // half, whose slot the walk below will widen
                }
                break;
            }
            let slot = {
                let page = frame.read();
                let mut best_slot = 0u32;
                let mut best_volume = f64::INFINITY;
                for slot in 0..records {
                    if let Cover::Box(bbox) = page.slot_cover(slot, d) {
                        if key_in_box(key, &bbox) {
                            best_slot = slot;
                            break;
                        }
                        let volume = expansion_volume(key, &bbox);
                        if volume < best_volume {
                            best_volume = volume;
                            best_slot = slot;
                        }
                    }
                }
                best_slot
            };
            position = position.child(m, slot);
        }

        debug!("expansion insert lands in leaf {}", position);
        let frame = self.load_page(position)?;
        frame.write().push_point(key, object);

        // widen ancestors until one already covers the key
        let mut walk = position;
        while !walk.is_root() {
            let parent_id = walk.parent(m);
            let slot = walk.slot(m);
            let parent = self.load_page(parent_id)?;
            let covered = {
                let mut page = parent.write();
                match page.slot_cover(slot, d) {
                    Cover::Box(bbox) if key_in_box(key, &bbox) => true,
                    _ => {
                        let point =
                            Cover::Box(key.iter().map(|k| Interval::point(*k)).collect());
                        page.expand_slot(slot, d, &point);
                        page.dirty = true;
                        false
                    }
                }
            };
            if covered {
                return Ok(());
            }
            walk = parent_id;
        }

        // reached the root without cover: widen the cached root cover
        let mut st = self.state.write();
        let point = Cover::Box(key.iter().map(|k| Interval::point(*k)).collect());
        st.root_cover.expand(&point);
        st.dirty = true;
        Ok(())
    }

    /// Split the full leaf at `position` along the widest dimension of
    /// its bounding box; the lower half keeps the id, the upper half
    /// lands in the next free slot of the parent. Splits the parent
    /// first when it has no free slot (which may renumber `position`),
    /// or grows a new root when the leaf is the root. Returns the
    /// (possibly renumbered) id of the lower half.
    pub(crate) fn split_leaf(&self, position: PageId) -> Result<PageId> {
        let d = self.dimensions();
        let m = self.internal_entries();
        info!("splitting leaf {}", position);

        let position = self.make_room_for_leaf_split(position)?;
        let parent_id = position.parent(m);
        let lo_slot = position.slot(m);
        let parent_records = self.page_records(parent_id)?;
        assert!(parent_records < m, "leaf split under a full parent");
        let hi_id = parent_id.child(m, parent_records);

        // widest dimension of the leaf's bounding box
        let splitdim = {
            let parent = self.load_page(parent_id)?;
            let page = parent.read();
            let mut best = 0usize;
            let mut spread = f64::NEG_INFINITY;
            for j in 0..d {
                let (start, end) = page.slot_axis(lo_slot, d, j);
                if end - start > spread {
                    spread = end - start;
                    best = j as usize;
                }
            }
            best
        };

        let mut records: Vec<(Vec<Coord>, ObjectId)> = {
            let frame = self.load_page(position)?;
            let page = frame.read();
            assert!(page.is_leaf(), "leaf split on an internal page");
            (0..page.records(d))
                .map(|i| (page.point_key(i, d).to_vec(), page.point_object(i)))
                .collect()
        };
        records.sort_by(|a, b| a.0[splitdim].total_cmp(&b.0[splitdim]));

        let total = records.len();
        let half = total / 2;
        let mut lo_page = self.new_leaf_page();
        let mut hi_page = self.new_leaf_page();
        for (key, object) in records.drain(..half) {
            lo_page.push_point(&key, object);
        }
        for (key, object) in records.drain(..) {
            hi_page.push_point(&key, object);
        }

        let lo_cover = lo_page.contents_cover(d);
        let hi_cover = hi_page.contents_cover(d);
        {
            let parent = self.load_page(parent_id)?;
            let mut page = parent.write();
            page.set_slot_cover(lo_slot, d, &lo_cover);
            page.push_slot_cover(&hi_cover);
            page.dirty = true;
        }

        info!(
            "split leaf {} by dimension {} into {} and {} records (sibling {})",
            position,
            splitdim,
            half,
            total - half,
            hi_id
        );

        self.install_page(position, lo_page)?;
        self.install_page(hi_id, hi_page)?;
        {
            let mut st = self.state.write();
            st.page_count += 1;
            st.dirty = true;
        }
        Ok(position)
    }

    /// Guarantee the parent of a leaf about to split has a free child
    /// slot: grow the tree over a root leaf, or cascade a split into a
    /// full parent (renumbering `position` in the process).
    pub(super) fn make_room_for_leaf_split(&self, mut position: PageId) -> Result<PageId> {
        let m = self.internal_entries();
        if position.is_root() {
            return self.grow_root_over_leaf();
        }
        let parent_id = position.parent(m);
        if self.page_records(parent_id)? >= m {
            let mut inception = VecDeque::new();
            inception.push_back(position);
            let new_parent = self.split_internal(parent_id, &mut inception)?;
            position = inception.pop_back().expect("pending split position lost");
            assert_eq!(
                position.parent(m),
                new_parent,
                "pending split position detached from its parent"
            );
        }
        Ok(position)
    }

    /// Replace a full root leaf with a fresh internal root whose single
    /// child is the old root reseated at id 1. A leaf has no
    /// descendants, so the transposition is a bare cache re-key.
    fn grow_root_over_leaf(&self) -> Result<PageId> {
        info!("growing a new root over the root leaf");
        let old_root = PageId::ROOT.child(self.internal_entries(), 0);

        let frame = self.rekey_resident(PageId::ROOT, old_root)?;
        let cover = {
            let mut page = frame.write();
            page.dirty = true;
            page.contents_cover(self.dimensions())
        };

        let mut new_root = self.new_internal_page();
        new_root.push_slot_cover(&cover);
        self.install_page(PageId::ROOT, new_root)?;
        {
            let mut st = self.state.write();
            st.page_count += 1;
            st.dirty = true;
        }
        Ok(old_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::box_in_box;
    use crate::types::Config;
    use tempfile::tempdir;

    // page size 104 at 2-D: leaf and internal fan-outs of 6,
    // minimum occupancy ⌈0.5·6/2⌉ = 2
    fn small_tree(dir: &tempfile::TempDir) -> Tree {
        Tree::create(Config::spatial(dir.path().join("test.db"), 2).page_size(104)).unwrap()
    }

    #[test]
    fn test_insert_and_find() {
        let dir = tempdir().unwrap();
        let tree = small_tree(&dir);

        tree.insert(&[1.0, 2.0], 10).unwrap();
        tree.insert(&[3.0, 4.0], 11).unwrap();
        tree.insert(&[-1.0, 0.5], 12).unwrap();

        assert_eq!(tree.find_any(&[3.0, 4.0]).unwrap(), 11);
        assert_eq!(tree.find_any(&[-1.0, 0.5]).unwrap(), 12);
        assert!(tree.find_any(&[9.0, 9.0]).is_err());
        assert_eq!(tree.stats().indexed_records, 3);

        match tree.root_cover() {
            Cover::Box(bbox) => {
                assert_eq!(bbox[0], Interval { start: -1.0, end: 3.0 });
                assert_eq!(bbox[1], Interval { start: 0.5, end: 4.0 });
            }
            _ => panic!("expected a box cover"),
        }
    }

    #[test]
    fn test_duplicate_keys() {
        let dir = tempdir().unwrap();
        let tree = small_tree(&dir);
        for _ in 0..3 {
            tree.insert(&[2.0, 2.0], 7).unwrap();
        }
        assert_eq!(tree.find_all(&[2.0, 2.0]).unwrap(), vec![7, 7, 7]);
        assert_eq!(tree.stats().indexed_records, 3);
    }

    #[test]
    fn test_leaf_split_builds_two_level_tree() {
        let dir = tempdir().unwrap();
        let tree = small_tree(&dir);
        let m = tree.internal_entries();

        // seven records overflow the six-record root leaf
        for i in 0..7u64 {
            tree.insert(&[i as f32, i as f32], i).unwrap();
        }

        let root = tree.load_page(PageId::ROOT).unwrap();
        let root_page = root.read();
        assert!(!root_page.is_leaf());
        assert_eq!(root_page.records(2), 2);

        let mut leaf_records = Vec::new();
        for slot in 0..2 {
            let child = tree.load_page(PageId::ROOT.child(m, slot)).unwrap();
            let leaf = child.read();
            assert!(leaf.is_leaf());
            leaf_records.push(leaf.records(2));

            // every leaf's contents stay inside its parent slot (P-III)
            let slot_cover = root_page.slot_cover(slot, 2);
            let contents = leaf.contents_cover(2);
            match (&slot_cover, &contents) {
                (Cover::Box(outer), Cover::Box(inner)) => {
                    assert!(box_in_box(inner, outer));
                }
                _ => panic!("expected box covers"),
            }
        }
        drop(root_page);
        assert_eq!(leaf_records.iter().sum::<u32>(), 7);
        assert!(leaf_records.iter().all(|&r| r >= 3));

        for i in 0..7u64 {
            assert_eq!(tree.find_any(&[i as f32, i as f32]).unwrap(), i);
        }
    }

    #[test]
    fn test_outside_key_takes_expansion_path() {
        let dir = tempdir().unwrap();
        let tree = small_tree(&dir);
        for i in 0..7u64 {
            tree.insert(&[i as f32, i as f32], i).unwrap();
        }
        // far outside every box
        tree.insert(&[100.0, -100.0], 99).unwrap();
        assert_eq!(tree.find_any(&[100.0, -100.0]).unwrap(), 99);

        match tree.root_cover() {
            Cover::Box(bbox) => {
                assert!(bbox[0].covers_value(100.0));
                assert!(bbox[1].covers_value(-100.0));
            }
            _ => panic!("expected a box cover"),
        }
    }

    #[test]
    fn test_many_inserts_stay_findable() {
        let dir = tempdir().unwrap();
        let tree = small_tree(&dir);
        let n = 200u64;
        for i in 0..n {
            tree.insert(&[(i % 23) as f32, (i % 7) as f32], i).unwrap();
        }
        assert_eq!(tree.stats().indexed_records, n);
        for i in 0..n {
            let found = tree.find_all(&[(i % 23) as f32, (i % 7) as f32]).unwrap();
            assert!(found.contains(&i), "record {} went missing", i);
        }
        tree.assert_cache_parity();
    }
}
