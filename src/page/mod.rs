//! In-memory page model.
//!
//! A page is a node of the tree and the unit of cache residency. Its
//! body is one of four shapes (spatial leaf, spatial internal, graph
//! leaf, graph internal) represented as a tagged sum so that the cache,
//! codec, and structural machinery dispatch per access while sharing
//! everything else.

mod codec;

pub use codec::{
    deserialize_page, serialize_page, HeapfileHeader, Layout, HEAPFILE_HEADER_SIZE,
};

use crate::geometry::{Cover, Interval, ObjectRange};
use crate::types::{ArcCount, ArcWeight, Coord, ObjectId, PAGE_HEADER_SIZE};

/// Body of a page
#[derive(Debug, Clone, PartialEq)]
pub enum PageNode {
    /// Parallel key/object arrays; keys are flattened d-per-record
    SpatialLeaf {
        keys: Vec<Coord>,
        objects: Vec<ObjectId>,
    },
    /// One bounding box per child, flattened d-per-child
    SpatialInternal { boxes: Vec<Interval> },
    /// Parallel source/out-degree arrays plus the concatenated target
    /// and weight arrays; the arcs of source i occupy the contiguous
    /// slice `Σcounts[..i] .. Σcounts[..=i]`
    GraphLeaf {
        sources: Vec<ObjectId>,
        counts: Vec<ArcCount>,
        targets: Vec<ObjectId>,
        weights: Vec<ArcWeight>,
    },
    /// One source-id range per child
    GraphInternal { ranges: Vec<ObjectRange> },
}

/// A resident page
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    /// Whether the in-memory state differs from disk
    pub dirty: bool,
    pub node: PageNode,
}

impl Page {
    /// New empty spatial leaf; pages are born dirty
    pub fn spatial_leaf() -> Self {
        Self {
            dirty: true,
            node: PageNode::SpatialLeaf {
                keys: Vec::new(),
                objects: Vec::new(),
            },
        }
    }

    /// New empty spatial internal page
    pub fn spatial_internal() -> Self {
        Self {
            dirty: true,
            node: PageNode::SpatialInternal { boxes: Vec::new() },
        }
    }

    /// New empty graph leaf
    pub fn graph_leaf() -> Self {
        Self {
            dirty: true,
            node: PageNode::GraphLeaf {
                sources: Vec::new(),
                counts: Vec::new(),
                targets: Vec::new(),
                weights: Vec::new(),
            },
        }
    }

    /// New empty graph internal page
    pub fn graph_internal() -> Self {
        Self {
            dirty: true,
            node: PageNode::GraphInternal { ranges: Vec::new() },
        }
    }

    /// Whether this is a leaf page
    pub fn is_leaf(&self) -> bool {
        matches!(
            self.node,
            PageNode::SpatialLeaf { .. } | PageNode::GraphLeaf { .. }
        )
    }

    /// Record count: points or arc sources for leaves, children for
    /// internal pages
    pub fn records(&self, dimensions: u16) -> u32 {
        match &self.node {
            PageNode::SpatialLeaf { objects, .. } => objects.len() as u32,
            PageNode::SpatialInternal { boxes } => (boxes.len() / dimensions as usize) as u32,
            PageNode::GraphLeaf { sources, .. } => sources.len() as u32,
            PageNode::GraphInternal { ranges } => ranges.len() as u32,
        }
    }

    /// Serialized size of this page in bytes
    pub fn byte_size(&self) -> usize {
        let header = PAGE_HEADER_SIZE as usize;
        match &self.node {
            PageNode::SpatialLeaf { keys, objects } => {
                header + keys.len() * std::mem::size_of::<Coord>()
                    + objects.len() * std::mem::size_of::<ObjectId>()
            }
            PageNode::SpatialInternal { boxes } => {
                header + boxes.len() * 2 * std::mem::size_of::<Coord>()
            }
            PageNode::GraphLeaf {
                sources,
                counts,
                targets,
                weights,
            } => {
                header
                    + sources.len() * std::mem::size_of::<ObjectId>()
                    + counts.len() * std::mem::size_of::<ArcCount>()
                    + targets.len() * std::mem::size_of::<ObjectId>()
                    + weights.len() * std::mem::size_of::<ArcWeight>()
            }
            PageNode::GraphInternal { ranges } => {
                header + ranges.len() * 2 * std::mem::size_of::<ObjectId>()
            }
        }
    }

    /// Tight cover of everything stored on this page
    pub fn contents_cover(&self, dimensions: u16) -> Cover {
        match &self.node {
            PageNode::SpatialLeaf { keys, .. } => {
                let d = dimensions as usize;
                let mut bbox = vec![Interval::EMPTY; d];
                for key in keys.chunks_exact(d) {
                    for (interval, k) in bbox.iter_mut().zip(key) {
                        interval.expand_to(*k);
                    }
                }
                Cover::Box(bbox)
            }
            PageNode::SpatialInternal { boxes } => {
                let d = dimensions as usize;
                let mut bbox = vec![Interval::EMPTY; d];
                for child in boxes.chunks_exact(d) {
                    for (interval, c) in bbox.iter_mut().zip(child) {
                        interval.expand(c);
                    }
                }
                Cover::Box(bbox)
            }
            PageNode::GraphLeaf { sources, .. } => {
                let mut range = ObjectRange::EMPTY;
                for source in sources {
                    range.expand_to(*source);
                }
                Cover::Range(range)
            }
            PageNode::GraphInternal { ranges } => {
                let mut cover = ObjectRange::EMPTY;
                for range in ranges {
                    cover.expand(range);
                }
                Cover::Range(cover)
            }
        }
    }

    /// Cover stored in a child slot of an internal page
    pub fn slot_cover(&self, slot: u32, dimensions: u16) -> Cover {
        match &self.node {
            PageNode::SpatialInternal { boxes } => {
                let d = dimensions as usize;
                let at = slot as usize * d;
                Cover::Box(boxes[at..at + d].to_vec())
            }
            PageNode::GraphInternal { ranges } => Cover::Range(ranges[slot as usize]),
            _ => panic!("slot_cover on a leaf page"),
        }
    }

    /// Overwrite a child slot's cover
    pub fn set_slot_cover(&mut self, slot: u32, dimensions: u16, cover: &Cover) {
        match (&mut self.node, cover) {
            (PageNode::SpatialInternal { boxes }, Cover::Box(bbox)) => {
                let d = dimensions as usize;
                let at = slot as usize * d;
                boxes[at..at + d].copy_from_slice(bbox);
            }
            (PageNode::GraphInternal { ranges }, Cover::Range(range)) => {
                ranges[slot as usize] = *range;
            }
            _ => panic!("slot/cover variant mismatch"),
        }
    }

    /// Append a child slot holding `cover`
    pub fn push_slot_cover(&mut self, cover: &Cover) {
        match (&mut self.node, cover) {
            (PageNode::SpatialInternal { boxes }, Cover::Box(bbox)) => {
                boxes.extend_from_slice(bbox);
            }
            (PageNode::GraphInternal { ranges }, Cover::Range(range)) => {
                ranges.push(*range);
            }
            _ => panic!("slot/cover variant mismatch"),
        }
    }

    /// Drop the last child slot
    pub fn pop_slot_cover(&mut self, dimensions: u16) {
        match &mut self.node {
            PageNode::SpatialInternal { boxes } => {
                boxes.truncate(boxes.len() - dimensions as usize);
            }
            PageNode::GraphInternal { ranges } => {
                ranges.pop();
            }
            _ => panic!("pop_slot_cover on a leaf page"),
        }
    }

    /// Expand a child slot's cover to include `cover`; returns whether
    /// anything changed
    pub fn expand_slot(&mut self, slot: u32, dimensions: u16, cover: &Cover) -> bool {
        match (&mut self.node, cover) {
            (PageNode::SpatialInternal { boxes }, Cover::Box(bbox)) => {
                let d = dimensions as usize;
                let at = slot as usize * d;
                let mut changed = false;
                for (interval, inner) in boxes[at..at + d].iter_mut().zip(bbox) {
                    changed |= interval.expand(inner);
                }
                changed
            }
            (PageNode::GraphInternal { ranges }, Cover::Range(range)) => {
                ranges[slot as usize].expand(range)
            }
            _ => panic!("slot/cover variant mismatch"),
        }
    }

    /// Number of axes the split machinery sweeps: d for spatial
    /// internal pages, one for graph internal pages
    pub fn split_axes(&self, dimensions: u16) -> u16 {
        match self.node {
            PageNode::SpatialInternal { .. } => dimensions,
            PageNode::GraphInternal { .. } => 1,
            _ => panic!("split_axes on a leaf page"),
        }
    }

    /// A child slot's cover projected onto one axis, as an ordered pair
    pub fn slot_axis(&self, slot: u32, dimensions: u16, axis: u16) -> (f64, f64) {
        match &self.node {
            PageNode::SpatialInternal { boxes } => {
                let interval = boxes[slot as usize * dimensions as usize + axis as usize];
                (interval.start as f64, interval.end as f64)
            }
            PageNode::GraphInternal { ranges } => {
                let range = ranges[slot as usize];
                (range.start as f64, range.end as f64)
            }
            _ => panic!("slot_axis on a leaf page"),
        }
    }

    // --- spatial leaf records ---

    /// Key of record `i`
    pub fn point_key(&self, i: u32, dimensions: u16) -> &[Coord] {
        match &self.node {
            PageNode::SpatialLeaf { keys, .. } => {
                let d = dimensions as usize;
                &keys[i as usize * d..(i as usize + 1) * d]
            }
            _ => panic!("point_key on a non-spatial-leaf page"),
        }
    }

    /// Object id of record `i`
    pub fn point_object(&self, i: u32) -> ObjectId {
        match &self.node {
            PageNode::SpatialLeaf { objects, .. } => objects[i as usize],
            _ => panic!("point_object on a non-spatial-leaf page"),
        }
    }

    /// Append a point record
    pub fn push_point(&mut self, key: &[Coord], object: ObjectId) {
        match &mut self.node {
            PageNode::SpatialLeaf { keys, objects } => {
                keys.extend_from_slice(key);
                objects.push(object);
            }
            _ => panic!("push_point on a non-spatial-leaf page"),
        }
        self.dirty = true;
    }

    /// Remove record `i` by moving the last record into its place
    pub fn remove_point_swap(&mut self, i: u32, dimensions: u16) {
        match &mut self.node {
            PageNode::SpatialLeaf { keys, objects } => {
                let d = dimensions as usize;
                let last = objects.len() - 1;
                let i = i as usize;
                if i < last {
                    objects.swap(i, last);
                    for j in 0..d {
                        keys.swap(i * d + j, last * d + j);
                    }
                }
                objects.truncate(last);
                keys.truncate(last * d);
            }
            _ => panic!("remove_point_swap on a non-spatial-leaf page"),
        }
        self.dirty = true;
    }

    // --- graph leaf records ---

    /// Total number of arcs stored on a graph leaf
    pub fn total_arcs(&self) -> usize {
        match &self.node {
            PageNode::GraphLeaf { targets, .. } => targets.len(),
            _ => panic!("total_arcs on a non-graph-leaf page"),
        }
    }

    /// Index of the record holding arcs of `from`, if present
    pub fn source_index(&self, from: ObjectId) -> Option<usize> {
        match &self.node {
            PageNode::GraphLeaf { sources, .. } => sources.iter().position(|s| *s == from),
            _ => panic!("source_index on a non-graph-leaf page"),
        }
    }

    /// Bounds of record `i`'s arc slice within the target/weight arrays
    pub fn arc_bounds(&self, i: usize) -> (usize, usize) {
        match &self.node {
            PageNode::GraphLeaf { counts, .. } => {
                let start: usize = counts[..i].iter().map(|c| *c as usize).sum();
                (start, start + counts[i] as usize)
            }
            _ => panic!("arc_bounds on a non-graph-leaf page"),
        }
    }

    /// Append an arc to source `from`, creating the source record if it
    /// does not exist yet
    pub fn push_arc(&mut self, from: ObjectId, to: ObjectId, weight: ArcWeight) {
        let i = match self.source_index(from) {
            Some(i) => i,
            None => match &mut self.node {
                PageNode::GraphLeaf {
                    sources, counts, ..
                } => {
                    sources.push(from);
                    counts.push(0);
                    sources.len() - 1
                }
                _ => unreachable!(),
            },
        };
        let (_, end) = self.arc_bounds(i);
        match &mut self.node {
            PageNode::GraphLeaf {
                counts,
                targets,
                weights,
                ..
            } => {
                targets.insert(end, to);
                weights.insert(end, weight);
                counts[i] += 1;
            }
            _ => unreachable!(),
        }
        self.dirty = true;
    }

    /// Remove the arc at absolute position `j` of source record `i`;
    /// drops the source record when its last arc goes. Returns the
    /// removed target and weight.
    pub fn remove_arc(&mut self, i: usize, j: usize) -> (ObjectId, ArcWeight) {
        match &mut self.node {
            PageNode::GraphLeaf {
                sources,
                counts,
                targets,
                weights,
            } => {
                let to = targets.remove(j);
                let weight = weights.remove(j);
                counts[i] -= 1;
                if counts[i] == 0 {
                    sources.remove(i);
                    counts.remove(i);
                }
                self.dirty = true;
                (to, weight)
            }
            _ => panic!("remove_arc on a non-graph-leaf page"),
        }
    }

    /// All arcs of record `i` as (from, to, weight) triples
    pub fn arcs_of(&self, i: usize) -> Vec<(ObjectId, ObjectId, ArcWeight)> {
        let (start, end) = self.arc_bounds(i);
        match &self.node {
            PageNode::GraphLeaf {
                sources,
                targets,
                weights,
                ..
            } => (start..end)
                .map(|j| (sources[i], targets[j], weights[j]))
                .collect(),
            _ => panic!("arcs_of on a non-graph-leaf page"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spatial_leaf_records() {
        let mut page = Page::spatial_leaf();
        page.push_point(&[1.0, 2.0], 10);
        page.push_point(&[3.0, 4.0], 11);
        page.push_point(&[-1.0, 0.5], 12);

        assert!(page.is_leaf());
        assert_eq!(page.records(2), 3);
        assert_eq!(page.point_key(1, 2), &[3.0, 4.0]);
        assert_eq!(page.point_object(2), 12);

        match page.contents_cover(2) {
            Cover::Box(bbox) => {
                assert_eq!(bbox[0], Interval { start: -1.0, end: 3.0 });
                assert_eq!(bbox[1], Interval { start: 0.5, end: 4.0 });
            }
            _ => panic!("expected a box cover"),
        }

        // swap-last compaction
        page.remove_point_swap(0, 2);
        assert_eq!(page.records(2), 2);
        assert_eq!(page.point_object(0), 12);
        assert_eq!(page.point_key(0, 2), &[-1.0, 0.5]);
    }

    #[test]
    fn test_internal_slots() {
        let mut page = Page::spatial_internal();
        let a = Cover::Box(vec![
            Interval { start: 0.0, end: 1.0 },
            Interval { start: 0.0, end: 1.0 },
        ]);
        let b = Cover::Box(vec![
            Interval { start: 2.0, end: 3.0 },
            Interval { start: 2.0, end: 3.0 },
        ]);
        page.push_slot_cover(&a);
        page.push_slot_cover(&b);

        assert!(!page.is_leaf());
        assert_eq!(page.records(2), 2);
        assert_eq!(page.slot_cover(0, 2), a);
        assert_eq!(page.slot_axis(1, 2, 0), (2.0, 3.0));

        assert!(page.expand_slot(0, 2, &Cover::Box(vec![
            Interval::point(-1.0),
            Interval::point(0.5),
        ])));
        assert!(!page.expand_slot(0, 2, &Cover::Box(vec![
            Interval::point(0.0),
            Interval::point(1.0),
        ])));

        page.pop_slot_cover(2);
        assert_eq!(page.records(2), 1);
    }

    #[test]
    fn test_graph_leaf_arcs() {
        let mut page = Page::graph_leaf();
        page.push_arc(5, 7, 1.5);
        page.push_arc(5, 9, 2.5);
        page.push_arc(3, 4, 0.5);

        assert_eq!(page.records(1), 2);
        assert_eq!(page.total_arcs(), 3);

        let i = page.source_index(5).unwrap();
        assert_eq!(page.arc_bounds(i), (0, 2));
        assert_eq!(page.arcs_of(i), vec![(5, 7, 1.5), (5, 9, 2.5)]);

        match page.contents_cover(1) {
            Cover::Range(range) => assert_eq!(range, ObjectRange { start: 3, end: 5 }),
            _ => panic!("expected a range cover"),
        }

        // removing the last arc of a source drops the record
        let j = page.source_index(3).unwrap();
        let (start, _) = page.arc_bounds(j);
        assert_eq!(page.remove_arc(j, start), (4, 0.5));
        assert_eq!(page.records(1), 1);
        assert!(page.source_index(3).is_none());
    }

    #[test]
    fn test_byte_size() {
        let mut page = Page::spatial_leaf();
        assert_eq!(page.byte_size(), 8);
        page.push_point(&[1.0, 2.0], 10);
        // 8 header + 2*4 key + 8 object
        assert_eq!(page.byte_size(), 24);

        let mut graph = Page::graph_leaf();
        graph.push_arc(1, 2, 1.0);
        // 8 header + 8 source + 2 count + 8 target + 4 weight
        assert_eq!(graph.byte_size(), 30);
    }
}
