//! Common types used throughout the storage engine.

mod page_id;

pub use page_id::PageId;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Coordinate type of spatial keys
pub type Coord = f32;

/// Object identifier stored at the leaf level
pub type ObjectId = u64;

/// Weight of a directed arc (graph variant)
pub type ArcWeight = f32;

/// Out-degree counter of an arc source (graph variant)
pub type ArcCount = u16;

/// Per-page header bytes within each fixed-size block:
/// record count (u32 LE) plus a flag byte, padded to 8
pub const PAGE_HEADER_SIZE: u32 = 8;

/// Default page size in bytes (4KB)
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Default capacity of the resident-set priority table
pub const DEFAULT_SWAP_CAPACITY: usize = 64;

/// Default fairness threshold α, bounding split balance and
/// minimum page occupancy
pub const DEFAULT_FAIRNESS_THRESHOLD: f64 = 0.5;

/// The two tree variants.
///
/// The choice is made at creation and is a permanent property of the
/// heapfile; the on-disk header does not record it, so `open` must be
/// told which kind of tree it is reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TreeVariant {
    /// d-dimensional point records under bounding-box internal entries
    Spatial,
    /// per-source adjacency lists under object-id-range internal entries
    Graph,
}

/// Maximum number of records a leaf page can hold
pub fn leaf_fanout(variant: TreeVariant, page_size: u32, dimensions: u16) -> u32 {
    let body = page_size - PAGE_HEADER_SIZE;
    match variant {
        TreeVariant::Spatial => {
            body / (dimensions as u32 * std::mem::size_of::<Coord>() as u32
                + std::mem::size_of::<ObjectId>() as u32)
        }
        TreeVariant::Graph => {
            body / (std::mem::size_of::<ObjectId>() as u32
                + std::mem::size_of::<ArcCount>() as u32)
        }
    }
}

/// Maximum number of children an internal page can hold
pub fn internal_fanout(variant: TreeVariant, page_size: u32, dimensions: u16) -> u32 {
    let body = page_size - PAGE_HEADER_SIZE;
    match variant {
        // an interval is a (start, end) coordinate pair per dimension
        TreeVariant::Spatial => body / (dimensions as u32 * 2 * std::mem::size_of::<Coord>() as u32),
        // a range is a (start, end) object-id pair
        TreeVariant::Graph => body / (2 * std::mem::size_of::<ObjectId>() as u32),
    }
}

/// Tree configuration.
///
/// `dimensions` and `page_size` are frozen into the heapfile header at
/// creation; `fairness_threshold` and `swap_capacity` are runtime
/// parameters supplied on every open.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Path to the heapfile
    pub path: PathBuf,
    /// Spatial or graph tree
    pub variant: TreeVariant,
    /// Dimensionality of spatial keys (1 for graph trees)
    pub dimensions: u16,
    /// Page size in bytes, constant for the life of the file
    pub page_size: u32,
    /// Fairness threshold α in (0, 1]
    pub fairness_threshold: f64,
    /// Capacity of the resident-set priority table
    pub swap_capacity: usize,
}

impl Config {
    /// Configuration for a spatial tree over `dimensions`-dimensional keys
    pub fn spatial<P: Into<PathBuf>>(path: P, dimensions: u16) -> Self {
        Self {
            path: path.into(),
            variant: TreeVariant::Spatial,
            dimensions,
            page_size: DEFAULT_PAGE_SIZE,
            fairness_threshold: DEFAULT_FAIRNESS_THRESHOLD,
            swap_capacity: DEFAULT_SWAP_CAPACITY,
        }
    }

    /// Configuration for a graph tree
    pub fn graph<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            variant: TreeVariant::Graph,
            dimensions: 1,
            page_size: DEFAULT_PAGE_SIZE,
            fairness_threshold: DEFAULT_FAIRNESS_THRESHOLD,
            swap_capacity: DEFAULT_SWAP_CAPACITY,
        }
    }

    /// Set the page size
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the fairness threshold α
    pub fn fairness_threshold(mut self, alpha: f64) -> Self {
        self.fairness_threshold = alpha;
        self
    }

    /// Set the swap capacity
    pub fn swap_capacity(mut self, capacity: usize) -> Self {
        self.swap_capacity = capacity;
        self
    }
}

/// Statistics about a tree
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeStats {
    /// Total number of pages in the tree
    pub page_count: u64,
    /// Number of indexed records (points or arcs)
    pub indexed_records: u64,
    /// Pages currently resident in the cache
    pub resident_pages: usize,
    /// Disk page reads since the tree was opened
    pub io_reads: u64,
}
