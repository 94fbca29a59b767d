//! Page and heapfile-header serialization.
//!
//! Every page serializes to exactly one fixed-size block. All multi-byte
//! integers and floats are little-endian on disk. The per-page header is
//! the record count (u32) and a flag byte (bit 0: leaf, bit 1: dirty),
//! padded to 8 bytes; the dirty bit is always written cleared, since
//! writing a page is what cleans it.
//!
//! Block layouts:
//!
//! ```text
//! spatial leaf      [header][keys: records·d × f32][objects: records × u64]
//! spatial internal  [header][boxes: records·d × (f32, f32)]
//! graph leaf        [header][from: records × u64][counts: records × u16]
//!                           [to: Σcounts × u64][weights: Σcounts × f32]
//! graph internal    [header][ranges: records × (u64, u64)]
//! ```
//!
//! Serialization refuses any page whose fields overflow the block, and
//! deserialization validates record counts against the fan-outs, so a
//! damaged block surfaces as `CorruptPage` instead of a bad tree.

use crate::error::{Result, StorageError};
use crate::geometry::{Interval, ObjectRange};
use crate::page::{Page, PageNode};
use crate::types::{PageId, TreeVariant, PAGE_HEADER_SIZE};

/// Serialized size of the tree header at heapfile offset 0
pub const HEAPFILE_HEADER_SIZE: usize = 22;

const FLAG_LEAF: u8 = 0b01;
const FLAG_DIRTY: u8 = 0b10;

/// Fixed per-tree geometry the codec needs on both paths
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub variant: TreeVariant,
    pub dimensions: u16,
    pub page_size: u32,
    pub leaf_entries: u32,
    pub internal_entries: u32,
}

impl Layout {
    fn fanout(&self, is_leaf: bool) -> u32 {
        if is_leaf {
            self.leaf_entries
        } else {
            self.internal_entries
        }
    }
}

/// Tree header persisted in the first block of the heapfile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapfileHeader {
    pub dimensions: u16,
    pub page_size: u32,
    pub page_count: u64,
    pub indexed_records: u64,
}

impl HeapfileHeader {
    /// Serialize into the first `page_size` bytes, zero-padded
    pub fn write(&self, buf: &mut [u8]) {
        buf.fill(0);
        buf[0..2].copy_from_slice(&self.dimensions.to_le_bytes());
        buf[2..6].copy_from_slice(&self.page_size.to_le_bytes());
        buf[6..14].copy_from_slice(&self.page_count.to_le_bytes());
        buf[14..22].copy_from_slice(&self.indexed_records.to_le_bytes());
    }

    /// Parse and validate a tree header
    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEAPFILE_HEADER_SIZE {
            return Err(StorageError::invalid_heapfile("header block too short"));
        }
        let dimensions = u16::from_le_bytes([buf[0], buf[1]]);
        let page_size = u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]);
        let page_count = u64::from_le_bytes(buf[6..14].try_into().unwrap());
        let indexed_records = u64::from_le_bytes(buf[14..22].try_into().unwrap());

        if dimensions == 0 {
            return Err(StorageError::invalid_heapfile("zero dimensionality"));
        }
        if page_size <= PAGE_HEADER_SIZE + HEAPFILE_HEADER_SIZE as u32 {
            return Err(StorageError::invalid_heapfile(format!(
                "page size {} is too small",
                page_size
            )));
        }

        Ok(Self {
            dimensions,
            page_size,
            page_count,
            indexed_records,
        })
    }
}

/// Serialize a page into a fresh `page_size` block
pub fn serialize_page(page: &Page, layout: &Layout, id: PageId) -> Result<Vec<u8>> {
    let records = page.records(layout.dimensions);
    if records > layout.fanout(page.is_leaf()) {
        return Err(StorageError::corrupt(
            id,
            format!(
                "{} records exceed the fan-out of {}",
                records,
                layout.fanout(page.is_leaf())
            ),
        ));
    }
    let needed = page.byte_size();
    if needed > layout.page_size as usize {
        return Err(StorageError::corrupt(
            id,
            format!(
                "serialized form takes {} bytes, page size is {}",
                needed, layout.page_size
            ),
        ));
    }

    let mut buf = vec![0u8; layout.page_size as usize];
    buf[0..4].copy_from_slice(&records.to_le_bytes());
    buf[4] = if page.is_leaf() { FLAG_LEAF } else { 0 };

    let mut at = PAGE_HEADER_SIZE as usize;
    match &page.node {
        PageNode::SpatialLeaf { keys, objects } => {
            for k in keys {
                buf[at..at + 4].copy_from_slice(&k.to_le_bytes());
                at += 4;
            }
            for o in objects {
                buf[at..at + 8].copy_from_slice(&o.to_le_bytes());
                at += 8;
            }
        }
        PageNode::SpatialInternal { boxes } => {
            for interval in boxes {
                buf[at..at + 4].copy_from_slice(&interval.start.to_le_bytes());
                buf[at + 4..at + 8].copy_from_slice(&interval.end.to_le_bytes());
                at += 8;
            }
        }
        PageNode::GraphLeaf {
            sources,
            counts,
            targets,
            weights,
        } => {
            for s in sources {
                buf[at..at + 8].copy_from_slice(&s.to_le_bytes());
                at += 8;
            }
            for c in counts {
                buf[at..at + 2].copy_from_slice(&c.to_le_bytes());
                at += 2;
            }
            for t in targets {
                buf[at..at + 8].copy_from_slice(&t.to_le_bytes());
                at += 8;
            }
            for w in weights {
                buf[at..at + 4].copy_from_slice(&w.to_le_bytes());
                at += 4;
            }
        }
        PageNode::GraphInternal { ranges } => {
            for range in ranges {
                buf[at..at + 8].copy_from_slice(&range.start.to_le_bytes());
                buf[at + 8..at + 16].copy_from_slice(&range.end.to_le_bytes());
                at += 16;
            }
        }
    }

    Ok(buf)
}

/// Deserialize a page from its fixed-size block
pub fn deserialize_page(buf: &[u8], layout: &Layout, id: PageId) -> Result<Page> {
    if buf.len() != layout.page_size as usize {
        return Err(StorageError::corrupt(
            id,
            format!("block is {} bytes, page size is {}", buf.len(), layout.page_size),
        ));
    }

    let records = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let flags = buf[4];
    let is_leaf = flags & FLAG_LEAF != 0;
    if flags & !(FLAG_LEAF | FLAG_DIRTY) != 0 {
        return Err(StorageError::corrupt(id, "unknown page flags"));
    }
    if records as u32 > layout.fanout(is_leaf) {
        return Err(StorageError::corrupt(
            id,
            format!(
                "{} records exceed the fan-out of {}",
                records,
                layout.fanout(is_leaf)
            ),
        ));
    }

    let mut at = PAGE_HEADER_SIZE as usize;
    let d = layout.dimensions as usize;
    let node = match (layout.variant, is_leaf) {
        (TreeVariant::Spatial, true) => {
            let mut keys = Vec::with_capacity(records * d);
            for _ in 0..records * d {
                keys.push(f32::from_le_bytes(buf[at..at + 4].try_into().unwrap()));
                at += 4;
            }
            let mut objects = Vec::with_capacity(records);
            for _ in 0..records {
                objects.push(u64::from_le_bytes(buf[at..at + 8].try_into().unwrap()));
                at += 8;
            }
            PageNode::SpatialLeaf { keys, objects }
        }
        (TreeVariant::Spatial, false) => {
            let mut boxes = Vec::with_capacity(records * d);
            for _ in 0..records * d {
                let start = f32::from_le_bytes(buf[at..at + 4].try_into().unwrap());
                let end = f32::from_le_bytes(buf[at + 4..at + 8].try_into().unwrap());
                boxes.push(Interval { start, end });
                at += 8;
            }
            PageNode::SpatialInternal { boxes }
        }
        (TreeVariant::Graph, true) => {
            let mut sources = Vec::with_capacity(records);
            for _ in 0..records {
                sources.push(u64::from_le_bytes(buf[at..at + 8].try_into().unwrap()));
                at += 8;
            }
            let mut counts = Vec::with_capacity(records);
            for _ in 0..records {
                counts.push(u16::from_le_bytes([buf[at], buf[at + 1]]));
                at += 2;
            }
            let total: usize = counts.iter().map(|c| *c as usize).sum();
            if at + total * 12 > buf.len() {
                return Err(StorageError::corrupt(
                    id,
                    format!("{} arcs overflow the block", total),
                ));
            }
            let mut targets = Vec::with_capacity(total);
            for _ in 0..total {
                targets.push(u64::from_le_bytes(buf[at..at + 8].try_into().unwrap()));
                at += 8;
            }
            let mut weights = Vec::with_capacity(total);
            for _ in 0..total {
                weights.push(f32::from_le_bytes(buf[at..at + 4].try_into().unwrap()));
                at += 4;
            }
            PageNode::GraphLeaf {
                sources,
                counts,
                targets,
                weights,
            }
        }
        (TreeVariant::Graph, false) => {
            let mut ranges = Vec::with_capacity(records);
            for _ in 0..records {
                let start = u64::from_le_bytes(buf[at..at + 8].try_into().unwrap());
                let end = u64::from_le_bytes(buf[at + 8..at + 16].try_into().unwrap());
                ranges.push(ObjectRange { start, end });
                at += 16;
            }
            PageNode::GraphInternal { ranges }
        }
    };

    Ok(Page { dirty: false, node })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spatial_layout(page_size: u32, dimensions: u16) -> Layout {
        Layout {
            variant: TreeVariant::Spatial,
            dimensions,
            page_size,
            leaf_entries: crate::types::leaf_fanout(TreeVariant::Spatial, page_size, dimensions),
            internal_entries: crate::types::internal_fanout(
                TreeVariant::Spatial,
                page_size,
                dimensions,
            ),
        }
    }

    fn graph_layout(page_size: u32) -> Layout {
        Layout {
            variant: TreeVariant::Graph,
            dimensions: 1,
            page_size,
            leaf_entries: crate::types::leaf_fanout(TreeVariant::Graph, page_size, 1),
            internal_entries: crate::types::internal_fanout(TreeVariant::Graph, page_size, 1),
        }
    }

    #[test]
    fn test_spatial_leaf_roundtrip() {
        let layout = spatial_layout(4096, 2);
        let mut page = Page::spatial_leaf();
        page.push_point(&[1.0, 2.0], 10);
        page.push_point(&[-3.5, 0.25], 11);

        let buf = serialize_page(&page, &layout, PageId::ROOT).unwrap();
        assert_eq!(buf.len(), 4096);
        let restored = deserialize_page(&buf, &layout, PageId::ROOT).unwrap();

        assert!(!restored.dirty);
        assert_eq!(restored.node, page.node);
    }

    #[test]
    fn test_spatial_internal_roundtrip() {
        let layout = spatial_layout(4096, 3);
        let mut page = Page::spatial_internal();
        page.push_slot_cover(&crate::geometry::Cover::Box(vec![
            Interval { start: 0.0, end: 1.0 },
            Interval { start: -1.0, end: 2.0 },
            Interval { start: 5.0, end: 9.0 },
        ]));

        let buf = serialize_page(&page, &layout, PageId::new(3)).unwrap();
        let restored = deserialize_page(&buf, &layout, PageId::new(3)).unwrap();
        assert_eq!(restored.node, page.node);
        assert!(!restored.is_leaf());
    }

    #[test]
    fn test_graph_pages_roundtrip() {
        let layout = graph_layout(4096);

        let mut leaf = Page::graph_leaf();
        leaf.push_arc(5, 7, 1.5);
        leaf.push_arc(5, 9, 2.5);
        leaf.push_arc(8, 1, 0.25);
        let buf = serialize_page(&leaf, &layout, PageId::new(1)).unwrap();
        let restored = deserialize_page(&buf, &layout, PageId::new(1)).unwrap();
        assert_eq!(restored.node, leaf.node);

        let mut internal = Page::graph_internal();
        internal.push_slot_cover(&crate::geometry::Cover::Range(ObjectRange {
            start: 3,
            end: 17,
        }));
        let buf = serialize_page(&internal, &layout, PageId::ROOT).unwrap();
        let restored = deserialize_page(&buf, &layout, PageId::ROOT).unwrap();
        assert_eq!(restored.node, internal.node);
    }

    #[test]
    fn test_serialize_rejects_overflow() {
        // page size 104 holds 6 2-D leaf records
        let layout = spatial_layout(104, 2);
        let mut page = Page::spatial_leaf();
        for i in 0..7 {
            page.push_point(&[i as f32, i as f32], i);
        }
        assert!(matches!(
            serialize_page(&page, &layout, PageId::ROOT),
            Err(StorageError::CorruptPage { .. })
        ));
    }

    #[test]
    fn test_deserialize_rejects_bad_record_count() {
        let layout = spatial_layout(104, 2);
        let page = Page::spatial_leaf();
        let mut buf = serialize_page(&page, &layout, PageId::ROOT).unwrap();
        // claim more records than the fan-out allows
        buf[0..4].copy_from_slice(&100u32.to_le_bytes());
        assert!(matches!(
            deserialize_page(&buf, &layout, PageId::ROOT),
            Err(StorageError::CorruptPage { .. })
        ));
    }

    #[test]
    fn test_dirty_bit_not_persisted() {
        let layout = spatial_layout(104, 2);
        let mut page = Page::spatial_leaf();
        page.push_point(&[1.0, 1.0], 1);
        assert!(page.dirty);
        let buf = serialize_page(&page, &layout, PageId::ROOT).unwrap();
        let restored = deserialize_page(&buf, &layout, PageId::ROOT).unwrap();
        assert!(!restored.dirty);
    }

    #[test]
    fn test_flush_is_deterministic() {
        let layout = spatial_layout(104, 2);
        let mut page = Page::spatial_leaf();
        page.push_point(&[1.0, 2.0], 42);
        let a = serialize_page(&page, &layout, PageId::ROOT).unwrap();
        let b = serialize_page(&page, &layout, PageId::ROOT).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_heapfile_header_roundtrip() {
        let header = HeapfileHeader {
            dimensions: 2,
            page_size: 4096,
            page_count: 9,
            indexed_records: 1000,
        };
        let mut buf = vec![0u8; 4096];
        header.write(&mut buf);
        assert_eq!(HeapfileHeader::read(&buf).unwrap(), header);
    }

    #[test]
    fn test_heapfile_header_rejects_garbage() {
        let buf = vec![0u8; 4096];
        // zero dimensionality
        assert!(HeapfileHeader::read(&buf).is_err());
        assert!(HeapfileHeader::read(&buf[..4]).is_err());
    }
}
