//! Point deletion and the upward deletion cascade.
//!
//! Removing a record compacts the leaf by sliding its last record into
//! the hole. A leaf left under its minimum occupancy dies instead: its
//! survivors are harvested, the vacancy cascades into the parent, and
//! the harvested records reinsert from the top (they may land in
//! different leaves). The cascade has three shapes: slide the last
//! sibling subtree into the vacated slot (case 0), dissolve an
//! under-full internal page the same way the leaf dissolved (case I),
//! or crown the root's one surviving child (case II).

use log::{info, warn};

use crate::error::{Result, StorageError};
use crate::geometry::{equal_keys, key_in_box, Cover};
use crate::types::{ArcWeight, Coord, ObjectId, PageId, TreeVariant};

use super::{Frame, Tree};

impl Tree {
    /// Remove one record matching `key` and return its object id.
    /// Duplicate keys require repeated calls.
    pub fn delete(&self, key: &[Coord]) -> Result<ObjectId> {
        assert_eq!(self.variant(), TreeVariant::Spatial, "point delete on a graph tree");
        assert_eq!(key.len(), self.dimensions() as usize, "key dimensionality mismatch");
        let d = self.dimensions();
        let m = self.internal_entries();

        let mut stack = vec![PageId::ROOT];
        while let Some(id) = stack.pop() {
            let frame = self.load_page(id)?;
            let hit = {
                let page = frame.read();
                if page.is_leaf() {
                    (0..page.records(d)).find(|&i| equal_keys(page.point_key(i, d), key))
                } else {
                    for slot in 0..page.records(d) {
                        if let Cover::Box(bbox) = page.slot_cover(slot, d) {
                            if key_in_box(key, &bbox) {
                                stack.push(id.child(m, slot));
                            }
                        }
                    }
                    None
                }
            };
            if let Some(i) = hit {
                return self.remove_from_leaf(id, frame, i);
            }
        }

        warn!("attempted to delete a non-existent record");
        Err(StorageError::KeyNotFound)
    }

    /// Remove record `i` from the leaf at `id`, cascading when the leaf
    /// would fall under its minimum occupancy.
    fn remove_from_leaf(&self, id: PageId, frame: Frame, i: u32) -> Result<ObjectId> {
        let d = self.dimensions();
        let m = self.internal_entries();
        let (object, records) = {
            let page = frame.read();
            (page.point_object(i), page.records(d))
        };

        if !id.is_root() && records - 1 < self.min_leaf_occupancy() {
            // the leaf dies; everything else it held reinserts later
            info!("leaf {} falls under minimum occupancy; cascading", id);
            self.discard_page(id);
            {
                let mut st = self.state.write();
                st.dirty = true;
                st.indexed_records -= records as u64; // survivors come back via reinsertion
                st.page_count -= 1;
            }

            self.cascade_deletion(id.parent(m), id.slot(m))?;

            let survivors: Vec<(Vec<Coord>, ObjectId)> = {
                let page = frame.read();
                (0..records)
                    .filter(|&j| j != i)
                    .map(|j| (page.point_key(j, d).to_vec(), page.point_object(j)))
                    .collect()
            };
            for (key, object) in survivors {
                self.insert(&key, object)?;
            }
            Ok(object)
        } else {
            {
                let mut page = frame.write();
                page.remove_point_swap(i, d);
            }
            let mut st = self.state.write();
            st.indexed_records -= 1;
            st.dirty = true;
            Ok(object)
        }
    }

    /// A child of the internal page at `page_id` vanished from `slot`.
    ///
    /// The three cases of the cascade:
    /// - case 0: the page keeps enough children; the last child
    ///   subtree transposes into the vacated slot;
    /// - case I: the page itself falls under minimum occupancy; its
    ///   surviving records are harvested for reinsertion and the
    ///   vacancy cascades upward;
    /// - case II: the page is the root with exactly two children; the
    ///   survivor is transposed onto id 0 and crowned.
    ///
    /// Any other state is a corrupt hierarchy and panics.
    pub(crate) fn cascade_deletion(&self, page_id: PageId, slot: u32) -> Result<()> {
        info!("cascaded deletion reaches block {} slot {}", page_id, slot);
        let d = self.dimensions();
        let m = self.internal_entries();

        let frame = self.load_page(page_id)?;
        self.state.write().dirty = true;
        let records = {
            let page = frame.read();
            assert!(!page.is_leaf(), "deletion cascaded into a leaf");
            page.records(d)
        };
        assert!(slot < records, "cascade from a slot that does not exist");
        let remaining = records - 1;

        if remaining >= self.min_internal_occupancy() || (page_id.is_root() && remaining >= 2) {
            // case 0: the last child takes over the vacated slot
            let deleted_id = page_id.child(m, slot);
            let replacement_id = page_id.child(m, records - 1);
            if deleted_id < replacement_id {
                let last_cover = frame.read().slot_cover(records - 1, d);
                {
                    let mut page = frame.write();
                    page.set_slot_cover(slot, d, &last_cover);
                    page.pop_slot_cover(d);
                    page.dirty = true;
                }
                let changes = self.transpose_subtree(replacement_id, deleted_id)?;
                self.dump_changes(changes)?;
            } else {
                // the vacated slot was the last one
                let mut page = frame.write();
                page.pop_slot_cover(d);
                page.dirty = true;
            }
            self.update_upwards(page_id)
        } else if !page_id.is_root() {
            // case I: this page dissolves as well
            info!("block {} falls under minimum occupancy; cascading further", page_id);
            self.discard_page(page_id);

            let mut points: Vec<(Vec<Coord>, ObjectId)> = Vec::new();
            let mut arcs: Vec<(ObjectId, ObjectId, ArcWeight)> = Vec::new();
            let mut browse: Vec<PageId> = (0..records)
                .filter(|&i| i != slot)
                .map(|i| page_id.child(m, i))
                .collect();
            let mut dropped = 1u64;

            while let Some(sub_id) = browse.pop() {
                let sub = self.load_page(sub_id)?;
                self.discard_page(sub_id);
                dropped += 1;
                let page = sub.read();
                if page.is_leaf() {
                    match self.variant() {
                        TreeVariant::Spatial => {
                            for i in 0..page.records(d) {
                                points.push((page.point_key(i, d).to_vec(), page.point_object(i)));
                            }
                        }
                        TreeVariant::Graph => {
                            for i in 0..page.records(d) as usize {
                                arcs.extend(page.arcs_of(i));
                            }
                        }
                    }
                } else {
                    for i in 0..page.records(d) {
                        browse.push(sub_id.child(m, i));
                    }
                }
            }

            {
                let mut st = self.state.write();
                st.indexed_records -= (points.len() + arcs.len()) as u64;
                st.page_count -= dropped;
                st.dirty = true;
            }

            self.cascade_deletion(page_id.parent(m), page_id.slot(m))?;

            for (key, object) in points {
                self.insert(&key, object)?;
            }
            for (from, to, weight) in arcs {
                self.insert_arc(from, to, weight)?;
            }
            Ok(())
        } else {
            // case II: the root holds exactly two children and loses one
            assert_eq!(
                records, 2,
                "root collapse invoked with {} children",
                records
            );
            let surviving_slot = 1 - slot;
            let surviving_id = page_id.child(m, surviving_slot);
            let survivor_cover = frame.read().slot_cover(surviving_slot, d);

            self.discard_page(page_id);
            let changes = self.transpose_subtree(surviving_id, PageId::ROOT)?;
            self.dump_changes(changes)?;
            self.replace_root_cover(survivor_cover);
            {
                let mut st = self.state.write();
                st.page_count -= 1;
            }
            info!("root collapsed onto its surviving child");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Interval;
    use crate::types::Config;
    use tempfile::tempdir;

    // page size 104 at 2-D: fan-outs of 6, minimum occupancy 2
    fn small_tree(dir: &tempfile::TempDir) -> Tree {
        Tree::create(Config::spatial(dir.path().join("test.db"), 2).page_size(104)).unwrap()
    }

    fn is_leaf_root(tree: &Tree) -> bool {
        let frame = tree.load_page(PageId::ROOT).unwrap();
        let leaf = frame.read().is_leaf();
        leaf
    }

    #[test]
    fn test_delete_missing_key() {
        let dir = tempdir().unwrap();
        let tree = small_tree(&dir);
        tree.insert(&[1.0, 1.0], 1).unwrap();
        assert!(matches!(
            tree.delete(&[5.0, 5.0]),
            Err(StorageError::KeyNotFound)
        ));
        assert_eq!(tree.stats().indexed_records, 1);
    }

    #[test]
    fn test_delete_reduces_count_by_one() {
        let dir = tempdir().unwrap();
        let tree = small_tree(&dir);
        for i in 0..5u64 {
            tree.insert(&[i as f32, i as f32], i).unwrap();
        }

        let object = tree.delete(&[2.0, 2.0]).unwrap();
        assert_eq!(object, 2);
        assert_eq!(tree.stats().indexed_records, 4);
        assert!(tree.find_all(&[2.0, 2.0]).unwrap().is_empty());
        assert_eq!(tree.find_any(&[3.0, 3.0]).unwrap(), 3);
    }

    #[test]
    fn test_duplicate_keys_delete_one_at_a_time() {
        let dir = tempdir().unwrap();
        let tree = small_tree(&dir);
        for _ in 0..3 {
            tree.insert(&[2.0, 2.0], 7).unwrap();
        }
        assert_eq!(tree.find_all(&[2.0, 2.0]).unwrap(), vec![7, 7, 7]);

        tree.delete(&[2.0, 2.0]).unwrap();
        tree.delete(&[2.0, 2.0]).unwrap();
        assert_eq!(tree.find_all(&[2.0, 2.0]).unwrap(), vec![7]);
        assert_eq!(tree.stats().indexed_records, 1);
    }

    #[test]
    fn test_deletion_collapses_root() {
        let dir = tempdir().unwrap();
        let tree = small_tree(&dir);

        // seven diagonal records split the root leaf: internal root
        // with a three-record and a four-record leaf
        for i in 0..7u64 {
            tree.insert(&[i as f32, i as f32], i).unwrap();
        }
        assert!(!is_leaf_root(&tree));

        // draining the lower leaf below two records collapses the root
        tree.delete(&[0.0, 0.0]).unwrap();
        tree.delete(&[1.0, 1.0]).unwrap();

        assert!(is_leaf_root(&tree));
        assert_eq!(tree.stats().indexed_records, 5);
        for i in 2..7u64 {
            assert_eq!(tree.find_any(&[i as f32, i as f32]).unwrap(), i);
        }

        // the root cover matches the surviving subtree's spread
        match tree.root_cover() {
            Cover::Box(bbox) => {
                assert!(bbox[0].covers(&Interval { start: 2.0, end: 6.0 }));
                assert!(bbox[1].covers(&Interval { start: 2.0, end: 6.0 }));
            }
            _ => panic!("expected a box cover"),
        }
        tree.assert_cache_parity();
    }

    #[test]
    fn test_drain_to_empty_and_refill() {
        let dir = tempdir().unwrap();
        let tree = small_tree(&dir);
        let n = 60u64;
        for i in 0..n {
            tree.insert(&[(i % 11) as f32, (i % 5) as f32], i).unwrap();
        }
        for i in 0..n {
            tree.delete(&[(i % 11) as f32, (i % 5) as f32]).unwrap();
        }
        assert_eq!(tree.stats().indexed_records, 0);

        // the emptied tree takes new records again
        tree.insert(&[9.0, 9.0], 1).unwrap();
        assert_eq!(tree.find_any(&[9.0, 9.0]).unwrap(), 1);
        tree.assert_cache_parity();
    }
}
