//! # R-Tree Storage Engine
//!
//! A disk-resident, page-structured multidimensional index for spatial
//! and graph-indexed workloads.
//!
//! ## Architecture
//!
//! The engine is composed of bottom-up layers:
//!
//! - **Types** (`types`): scalar types, configuration, and the
//!   implicit-heap id algebra relating every page to its parent and
//!   children
//! - **Geometry** (`geometry`): intervals, bounding boxes, and
//!   object-id ranges with their containment and expansion predicates
//! - **Swap** (`swap`): fixed-capacity priority table deciding which
//!   pages stay resident
//! - **Page layer** (`page`): the four page shapes and their
//!   fixed-size little-endian codec
//! - **Storage layer** (`storage`): heapfile block I/O
//! - **Tree layer** (`tree`): the page cache with per-page locks,
//!   insertion with cascading splits, deletion with cascades, and the
//!   subtree transposition that renumbers whole subtrees atomically
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rtree_storage::{Config, Tree};
//!
//! let tree = Tree::create(Config::spatial("points.db", 2))?;
//! tree.insert(&[1.0, 2.0], 42)?;
//! assert_eq!(tree.find_any(&[1.0, 2.0])?, 42);
//! tree.delete(&[1.0, 2.0])?;
//! tree.close()?;
//! ```
//!
//! Exactly one variant, spatial points or weighted directed arcs,
//! lives behind a given heapfile; the choice is frozen at creation.

pub mod error;
pub mod geometry;
pub mod page;
pub mod storage;
pub mod swap;
pub mod tree;
pub mod types;

pub use error::{Result, StorageError};
pub use geometry::{Cover, Interval, ObjectRange};
pub use page::{Page, PageNode};
pub use swap::Swap;
pub use tree::{PageGuard, SubtreeIter, Tree};
pub use types::{
    ArcCount, ArcWeight, Config, Coord, ObjectId, PageId, TreeStats, TreeVariant,
};
