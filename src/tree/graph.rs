//! Graph variant: weighted directed arcs keyed by source object.
//!
//! Graph leaves keep one record per arc source (parallel `from` and
//! out-degree arrays over concatenated target and weight arrays) and
//! internal pages cover their children with source-id ranges. The
//! cache, splits, transposition, and deletion cascade are the shared
//! machinery; only leaf layout and the insertion heuristics differ. A
//! graph leaf is full when either its source slots run out or one more
//! arc would overflow the serialized page.

use log::info;

use crate::error::{Result, StorageError};
use crate::geometry::{Cover, ObjectRange};
use crate::types::{ArcCount, ArcWeight, ObjectId, PageId, TreeVariant};

use super::{Frame, Tree};

impl Tree {
    /// Add the arc `from → to` with the given weight
    pub fn insert_arc(&self, from: ObjectId, to: ObjectId, weight: ArcWeight) -> Result<()> {
        assert_eq!(self.variant(), TreeVariant::Graph, "arc insert on a spatial tree");
        {
            let mut st = self.state.write();
            st.dirty = true;
            st.indexed_records += 1;
        }

        match self.containing_graph_leaf(from)? {
            Some(mut position) => {
                if !self.graph_leaf_can_take(position, from)? {
                    position = self.split_graph_leaf(position)?;
                    position = match self.choose_graph_leaf_after_split(position, from)? {
                        Some(chosen) => chosen,
                        None => return self.insert_arc_by_expansion(from, to, weight),
                    };
                }
                let frame = self.load_page(position)?;
                frame.write().push_arc(from, to, weight);
                self.update_upwards(position)
            }
            None => self.insert_arc_by_expansion(from, to, weight),
        }
    }

    /// All arcs leaving `from`, as (target, weight) pairs
    pub fn find_arcs(&self, from: ObjectId) -> Result<Vec<(ObjectId, ArcWeight)>> {
        assert_eq!(self.variant(), TreeVariant::Graph, "arc lookup on a spatial tree");
        let mut results = Vec::new();
        self.visit_source_leaves(from, |page, i| {
            let (start, end) = page.arc_bounds(i);
            if let crate::page::PageNode::GraphLeaf { targets, weights, .. } = &page.node {
                for j in start..end {
                    results.push((targets[j], weights[j]));
                }
            }
            false
        })?;
        Ok(results)
    }

    /// Weight of the arc `from → to`, or `KeyNotFound`
    pub fn find_arc(&self, from: ObjectId, to: ObjectId) -> Result<ArcWeight> {
        assert_eq!(self.variant(), TreeVariant::Graph, "arc lookup on a spatial tree");
        let mut weight = None;
        self.visit_source_leaves(from, |page, i| {
            let (start, end) = page.arc_bounds(i);
            if let crate::page::PageNode::GraphLeaf { targets, weights, .. } = &page.node {
                for j in start..end {
                    if targets[j] == to {
                        weight = Some(weights[j]);
                        return true;
                    }
                }
            }
            false
        })?;
        weight.ok_or(StorageError::KeyNotFound)
    }

    /// Remove one arc `from → to` and return its weight; may cascade
    /// when the leaf falls under its minimum occupancy.
    pub fn delete_arc(&self, from: ObjectId, to: ObjectId) -> Result<ArcWeight> {
        assert_eq!(self.variant(), TreeVariant::Graph, "arc delete on a spatial tree");
        let m = self.internal_entries();

        let mut stack = vec![PageId::ROOT];
        while let Some(id) = stack.pop() {
            let frame = self.load_page(id)?;
            let hit = {
                let page = frame.read();
                if page.is_leaf() {
                    match page.source_index(from) {
                        Some(i) => {
                            let (start, end) = page.arc_bounds(i);
                            let mut found = None;
                            if let crate::page::PageNode::GraphLeaf { targets, .. } = &page.node {
                                for j in start..end {
                                    if targets[j] == to {
                                        found = Some((i, j));
                                        break;
                                    }
                                }
                            }
                            found
                        }
                        None => None,
                    }
                } else {
                    for slot in 0..page.records(1) {
                        if let Cover::Range(range) = page.slot_cover(slot, 1) {
                            if range.covers_value(from) {
                                stack.push(id.child(m, slot));
                            }
                        }
                    }
                    None
                }
            };
            if let Some((i, j)) = hit {
                return self.remove_arc_from_leaf(id, frame, i, j);
            }
        }
        Err(StorageError::KeyNotFound)
    }

    /// Remove the arc at source record `i`, absolute position `j`,
    /// cascading if the leaf would lose too many source records.
    fn remove_arc_from_leaf(
        &self,
        id: PageId,
        frame: Frame,
        i: usize,
        j: usize,
    ) -> Result<ArcWeight> {
        let m = self.internal_entries();
        let (records, drops_source, weight, total_arcs) = {
            let page = frame.read();
            let (start, end) = page.arc_bounds(i);
            debug_assert!((start..end).contains(&j));
            let weight = match &page.node {
                crate::page::PageNode::GraphLeaf { weights, .. } => weights[j],
                _ => unreachable!("arc removal on a non-graph leaf"),
            };
            (
                page.records(1),
                end - start == 1,
                weight,
                page.total_arcs(),
            )
        };

        if drops_source && !id.is_root() && records - 1 < self.min_leaf_occupancy() {
            info!("graph leaf {} falls under minimum occupancy; cascading", id);
            self.discard_page(id);
            {
                let mut st = self.state.write();
                st.dirty = true;
                st.indexed_records -= total_arcs as u64;
                st.page_count -= 1;
            }

            self.cascade_deletion(id.parent(m), id.slot(m))?;

            let survivors: Vec<(ObjectId, ObjectId, ArcWeight)> = {
                let page = frame.read();
                let mut arcs = Vec::with_capacity(total_arcs - 1);
                for s in 0..records as usize {
                    let (start, _) = page.arc_bounds(s);
                    for (offset, arc) in page.arcs_of(s).into_iter().enumerate() {
                        if !(s == i && start + offset == j) {
                            arcs.push(arc);
                        }
                    }
                }
                arcs
            };
            for (from, to, weight) in survivors {
                self.insert_arc(from, to, weight)?;
            }
            Ok(weight)
        } else {
            frame.write().remove_arc(i, j);
            let mut st = self.state.write();
            st.indexed_records -= 1;
            st.dirty = true;
            Ok(weight)
        }
    }

    /// Visit every leaf whose range covers `from` and holds the source;
    /// the visitor returns true to stop early.
    fn visit_source_leaves(
        &self,
        from: ObjectId,
        mut visit: impl FnMut(&crate::page::Page, usize) -> bool,
    ) -> Result<()> {
        let m = self.internal_entries();
        let mut stack = vec![PageId::ROOT];
        while let Some(id) = stack.pop() {
            let frame = self.load_page(id)?;
            let page = frame.read();
            if page.is_leaf() {
                if let Some(i) = page.source_index(from) {
                    if visit(&page, i) {
                        return Ok(());
                    }
                }
            } else {
                for slot in 0..page.records(1) {
                    if let Cover::Range(range) = page.slot_cover(slot, 1) {
                        if range.covers_value(from) {
                            stack.push(id.child(m, slot));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Containing leaf for a new arc: prefer a leaf already holding the
    /// source (keeping its adjacency in one slice), else the least
    /// loaded containing leaf.
    fn containing_graph_leaf(&self, from: ObjectId) -> Result<Option<PageId>> {
        let m = self.internal_entries();
        let mut holder: Option<PageId> = None;
        let mut least: Option<(PageId, u32)> = None;
        let mut stack = vec![PageId::ROOT];

        while let Some(id) = stack.pop() {
            let frame = self.load_page(id)?;
            let page = frame.read();
            if page.is_leaf() {
                if page.source_index(from).is_some() && holder.is_none() {
                    holder = Some(id);
                }
                let records = page.records(1);
                if least.map_or(true, |(_, load)| records < load) {
                    least = Some((id, records));
                }
            } else {
                for slot in 0..page.records(1) {
                    if let Cover::Range(range) = page.slot_cover(slot, 1) {
                        if range.covers_value(from) {
                            stack.push(id.child(m, slot));
                        }
                    }
                }
            }
        }
        Ok(holder.or(least.map(|(id, _)| id)))
    }

    /// Whether the leaf can absorb one more arc of `from` without
    /// overflowing its source slots or its serialized size
    fn graph_leaf_can_take(&self, position: PageId, from: ObjectId) -> Result<bool> {
        let frame = self.load_page(position)?;
        let page = frame.read();
        let new_source = page.source_index(from).is_none();
        if new_source && page.records(1) >= self.leaf_entries() {
            return Ok(false);
        }
        let arc_bytes =
            std::mem::size_of::<ObjectId>() + std::mem::size_of::<ArcWeight>();
        let source_bytes = if new_source {
            std::mem::size_of::<ObjectId>() + std::mem::size_of::<ArcCount>()
        } else {
            0
        };
        Ok(page.byte_size() + arc_bytes + source_bytes <= self.page_size() as usize)
    }

    /// After a graph leaf split, pick the side whose range covers the
    /// source (the leaf that kept it when it was already present).
    fn choose_graph_leaf_after_split(
        &self,
        position: PageId,
        from: ObjectId,
    ) -> Result<Option<PageId>> {
        let m = self.internal_entries();
        let parent_id = position.parent(m);
        let parent_records = self.page_records(parent_id)?;
        let sibling = parent_id.child(m, parent_records - 1);

        let covers = |id: PageId| -> Result<bool> {
            let parent = self.load_page(id.parent(m))?;
            let cover = parent.read().slot_cover(id.slot(m), 1);
            match cover {
                Cover::Range(range) => Ok(range.covers_value(from)),
                Cover::Box(_) => unreachable!("box cover in a graph tree"),
            }
        };
        let former = covers(position)?;
        let latter = covers(sibling)?;
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

    /// Split a full graph leaf by source id: the lower half of its
    /// sources keeps the page id, the upper half lands in the next free
    /// slot of the parent.
    pub(crate) fn split_graph_leaf(&self, position: PageId) -> Result<PageId> {
        let m = self.internal_entries();
        info!("splitting graph leaf {}", position);

        let position = self.make_room_for_leaf_split(position)?;
        let parent_id = position.parent(m);
        let lo_slot = position.slot(m);
        let parent_records = self.page_records(parent_id)?;
        assert!(parent_records < m, "leaf split under a full parent");
        let hi_id = parent_id.child(m, parent_records);

        let mut entries: Vec<(ObjectId, Vec<(ObjectId, ArcWeight)>)> = {
            let frame = self.load_page(position)?;
            let page = frame.read();
            assert!(page.is_leaf(), "leaf split on an internal page");
            (0..page.records(1) as usize)
                .map(|i| {
                    let arcs = page
                        .arcs_of(i)
                        .into_iter()
                        .map(|(_, to, weight)| (to, weight))
                        .collect();
                    let source = match &page.node {
                        crate::page::PageNode::GraphLeaf { sources, .. } => sources[i],
                        _ => unreachable!(),
                    };
                    (source, arcs)
                })
                .collect()
        };
        assert!(
            entries.len() >= 2,
            "a single adjacency list exceeds the page capacity"
        );
        entries.sort_by_key(|(source, _)| *source);

        let total = entries.len();
        let half = total / 2;
        let mut lo_page = self.new_leaf_page();
        let mut hi_page = self.new_leaf_page();
        for (source, arcs) in entries.drain(..half) {
            for (to, weight) in arcs {
                lo_page.push_arc(source, to, weight);
            }
        }
        for (source, arcs) in entries.drain(..) {
            for (to, weight) in arcs {
                hi_page.push_arc(source, to, weight);
            }
        }

        let lo_cover = lo_page.contents_cover(1);
        let hi_cover = hi_page.contents_cover(1);
        {
            let parent = self.load_page(parent_id)?;
            let mut page = parent.write();
            page.set_slot_cover(lo_slot, 1, &lo_cover);
            page.push_slot_cover(&hi_cover);
            page.dirty = true;
        }

        info!(
            "split graph leaf {} into {} and {} sources (sibling {})",
            position,
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

    /// No range covers `from`: descend along the slots nearest to it,
    /// widening them on the way back up.
    fn insert_arc_by_expansion(
        &self,
        from: ObjectId,
        to: ObjectId,
        weight: ArcWeight,
    ) -> Result<()> {
        let m = self.internal_entries();

        let mut position = PageId::ROOT;
        loop {
            let frame = self.load_page(position)?;
            let is_leaf = frame.read().is_leaf();
            if is_leaf {
                if !self.graph_leaf_can_take(position, from)? {
                    position = self.split_graph_leaf(position)?;
                    if let Some(chosen) = self.choose_graph_leaf_after_split(position, from)? {
                        position = chosen;
                    }
                }
                break;
            }
            let slot = {
                let page = frame.read();
                let mut best_slot = 0u32;
                let mut best_distance = u64::MAX;
                for slot in 0..page.records(1) {
                    if let Cover::Range(range) = page.slot_cover(slot, 1) {
                        let distance = range.distance_to(from);
                        if distance == 0 {
                            best_slot = slot;
                            break;
                        }
                        if distance < best_distance {
                            best_distance = distance;
                            best_slot = slot;
                        }
                    }
                }
                best_slot
            };
            position = position.child(m, slot);
        }

        let frame = self.load_page(position)?;
        frame.write().push_arc(from, to, weight);

        // widen ancestor ranges until one already covers the source
        let point = Cover::Range(ObjectRange::point(from));
        let mut walk = position;
        while !walk.is_root() {
            let parent_id = walk.parent(m);
            let slot = walk.slot(m);
            let parent = self.load_page(parent_id)?;
            let covered = {
                let mut page = parent.write();
                match page.slot_cover(slot, 1) {
                    Cover::Range(range) if range.covers_value(from) => true,
                    _ => {
                        page.expand_slot(slot, 1, &point);
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

        let mut st = self.state.write();
        st.root_cover.expand(&point);
        st.dirty = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Config;
    use tempfile::tempdir;

    // page size 168 for graph trees: 16 source slots, 10 internal
    // slots, and room for roughly 13 arcs per leaf
    fn graph_tree(dir: &tempfile::TempDir) -> Tree {
        Tree::create(Config::graph(dir.path().join("graph.db")).page_size(168)).unwrap()
    }

    #[test]
    fn test_insert_and_find_arcs() {
        let dir = tempdir().unwrap();
        let tree = graph_tree(&dir);

        tree.insert_arc(5, 7, 1.5).unwrap();
        tree.insert_arc(5, 9, 2.5).unwrap();
        tree.insert_arc(3, 5, 0.5).unwrap();

        assert_eq!(tree.find_arcs(5).unwrap(), vec![(7, 1.5), (9, 2.5)]);
        assert_eq!(tree.find_arc(3, 5).unwrap(), 0.5);
        assert!(matches!(
            tree.find_arc(3, 9),
            Err(StorageError::KeyNotFound)
        ));
        assert!(tree.find_arcs(42).unwrap().is_empty());
        assert_eq!(tree.stats().indexed_records, 3);

        match tree.root_cover() {
            Cover::Range(range) => assert_eq!(range, ObjectRange { start: 3, end: 5 }),
            _ => panic!("expected a range cover"),
        }
    }

    #[test]
    fn test_delete_arc() {
        let dir = tempdir().unwrap();
        let tree = graph_tree(&dir);
        tree.insert_arc(1, 2, 0.25).unwrap();
        tree.insert_arc(1, 3, 0.5).unwrap();

        assert_eq!(tree.delete_arc(1, 2).unwrap(), 0.25);
        assert_eq!(tree.find_arcs(1).unwrap(), vec![(3, 0.5)]);
        assert_eq!(tree.stats().indexed_records, 1);
        assert!(matches!(
            tree.delete_arc(1, 2),
            Err(StorageError::KeyNotFound)
        ));
    }

    #[test]
    fn test_graph_leaf_split_by_source() {
        let dir = tempdir().unwrap();
        let tree = graph_tree(&dir);

        // enough distinct sources to overflow the root leaf
        let n = 40u64;
        for source in 0..n {
            tree.insert_arc(source, source + 100, source as f32).unwrap();
        }

        let root = tree.load_page(PageId::ROOT).unwrap();
        assert!(!root.read().is_leaf());
        drop(root);

        for source in 0..n {
            assert_eq!(
                tree.find_arcs(source).unwrap(),
                vec![(source + 100, source as f32)],
                "source {} lost its adjacency",
                source
            );
        }
        tree.assert_cache_parity();
    }

    #[test]
    fn test_arc_byte_capacity_forces_split() {
        let dir = tempdir().unwrap();
        let tree = graph_tree(&dir);

        // two sources with fat adjacency lists overflow the page by
        // bytes long before the source slots run out
        for to in 0..8u64 {
            tree.insert_arc(1, to, to as f32).unwrap();
            tree.insert_arc(1000, to, to as f32).unwrap();
        }

        assert_eq!(tree.find_arcs(1).unwrap().len(), 8);
        assert_eq!(tree.find_arcs(1000).unwrap().len(), 8);
        assert_eq!(tree.stats().indexed_records, 16);
    }

    #[test]
    fn test_graph_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("graph.db");
        {
            let tree = Tree::create(Config::graph(&path).page_size(168)).unwrap();
            for source in 0..30u64 {
                tree.insert_arc(source, (source * 7) % 30, 1.0).unwrap();
                tree.insert_arc(source, (source * 11) % 30, 2.0).unwrap();
            }
            tree.close().unwrap();
        }
        let tree = Tree::open(Config::graph(&path)).unwrap();
        assert_eq!(tree.stats().indexed_records, 60);
        for source in 0..30u64 {
            let arcs = tree.find_arcs(source).unwrap();
            assert_eq!(arcs.len(), 2, "source {} lost arcs", source);
        }
    }
}
