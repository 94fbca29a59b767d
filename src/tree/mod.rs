//! The tree handle: cache residency, structure maintenance, lifecycle.
//!
//! One `RwLock` per tree, the tree-lock, guards the resident frame
//! map, the swap, the LRU tick, the cached root cover, and the header
//! scalars. One `RwLock` per resident page guards that page's contents.
//! The engine never acquires a page lock while holding the tree-lock,
//! and never holds a page guard across a call that may load or flush
//! pages; this keeps the two-level hierarchy free of cycles even when
//! an eviction flushes a page mid-operation.

mod delete;
mod graph;
mod insert;
mod iter;
mod split;
mod transpose;

pub use iter::{PageGuard, SubtreeIter};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::RwLock;

use crate::error::{Result, StorageError};
use crate::geometry::{key_in_box, Cover};
use crate::page::{self, HeapfileHeader, Layout, Page, PageNode};
use crate::storage::Heapfile;
use crate::swap::Swap;
use crate::types::{
    internal_fanout, leaf_fanout, Config, Coord, ObjectId, PageId, TreeStats, TreeVariant,
};

/// A resident page and its per-page lock
pub(crate) type Frame = Arc<RwLock<Page>>;

/// State guarded by the tree-lock
pub(crate) struct TreeState {
    /// Resident pages keyed by id; ascending iteration gives the flush
    /// order
    pub(crate) frames: BTreeMap<PageId, Frame>,
    /// Resident-set priority table; tracks exactly the frame keys
    pub(crate) swap: Swap,
    /// Monotone touch counter feeding LRU priorities
    tick: u64,
    /// Cached cover of the whole tree (box or range)
    pub(crate) root_cover: Cover,
    pub(crate) page_count: u64,
    pub(crate) indexed_records: u64,
    /// Whether the header scalars changed since the last flush
    pub(crate) dirty: bool,
    pub(crate) io_reads: u64,
}

impl TreeState {
    /// Raise `id`'s swap priority, admitting it if untracked; returns
    /// the eviction victim on overflow. Callers flush the victim after
    /// releasing the tree-lock.
    pub(crate) fn touch(&mut self, id: PageId) -> Option<PageId> {
        self.tick += 1;
        self.swap.set_priority(id, self.tick)
    }
}

/// Disk-resident page-structured multidimensional index.
///
/// Exactly one of the two variants is behind a given tree: spatial
/// (d-dimensional point records) or graph (weighted directed arcs).
pub struct Tree {
    variant: TreeVariant,
    dimensions: u16,
    page_size: u32,
    leaf_entries: u32,
    internal_entries: u32,
    fairness: f64,
    heapfile: Heapfile,
    state: RwLock<TreeState>,
    closed: AtomicBool,
}

impl Tree {
    /// Create a fresh heapfile and a tree with an empty root leaf.
    ///
    /// `dimensions` and `page_size` are frozen for the life of the
    /// file. Rejects configurations whose minimum internal occupancy
    /// ⌈α·m/2⌉ falls below two records.
    pub fn create(config: Config) -> Result<Tree> {
        let dimensions = match config.variant {
            TreeVariant::Spatial => config.dimensions,
            TreeVariant::Graph => 1,
        };
        let tree = Self::build(&config, dimensions, config.page_size, 1, 0)?;

        let header = HeapfileHeader {
            dimensions,
            page_size: config.page_size,
            page_count: 1,
            indexed_records: 0,
        };
        tree.heapfile.create(&header)?;

        // empty root leaf at id 0, born dirty
        {
            let mut st = tree.state.write();
            st.frames
                .insert(PageId::ROOT, Arc::new(RwLock::new(tree.new_leaf_page())));
            st.touch(PageId::ROOT);
            st.dirty = true;
        }
        info!(
            "created {}-d {:?} tree at {} (page size {}, fan-outs {}/{})",
            dimensions,
            config.variant,
            tree.heapfile.path().display(),
            config.page_size,
            tree.leaf_entries,
            tree.internal_entries,
        );
        Ok(tree)
    }

    /// Open an existing heapfile.
    ///
    /// The header does not record the variant, so the configuration
    /// must name the kind of tree being opened; dimensionality and page
    /// size come from the header. The root page is loaded lazily.
    pub fn open(config: Config) -> Result<Tree> {
        let header = Heapfile::read_header(&config.path)?;
        let tree = Self::build(
            &config,
            header.dimensions,
            header.page_size,
            header.page_count,
            header.indexed_records,
        )?;
        info!(
            "opened {} with {} pages, {} records",
            tree.heapfile.path().display(),
            header.page_count,
            header.indexed_records,
        );
        Ok(tree)
    }

    fn build(
        config: &Config,
        dimensions: u16,
        page_size: u32,
        page_count: u64,
        indexed_records: u64,
    ) -> Result<Tree> {
        if dimensions == 0 {
            return Err(StorageError::config_rejected("dimensionality must be at least 1"));
        }
        if !(config.fairness_threshold > 0.0 && config.fairness_threshold <= 1.0) {
            return Err(StorageError::config_rejected(
                "fairness threshold must lie in (0, 1]",
            ));
        }
        if config.swap_capacity == 0 {
            return Err(StorageError::config_rejected("swap capacity must be positive"));
        }

        let leaf_entries = leaf_fanout(config.variant, page_size, dimensions);
        let internal_entries = internal_fanout(config.variant, page_size, dimensions);
        if leaf_entries < 2 || internal_entries < 2 {
            return Err(StorageError::config_rejected(format!(
                "page size {} is too small for {}-d pages",
                page_size, dimensions
            )));
        }
        let min_internal = (config.fairness_threshold * internal_entries as f64 / 2.0).ceil() as u32;
        let min_leaf = (config.fairness_threshold * leaf_entries as f64 / 2.0).ceil() as u32;
        if min_internal < 2 {
            return Err(StorageError::config_rejected(
                "fairness threshold admits underflows of fewer than two records per page",
            ));
        }
        // a split must be able to give both halves their minimum
        if 2 * min_internal > internal_entries || 2 * min_leaf > leaf_entries {
            return Err(StorageError::config_rejected(format!(
                "fairness threshold {} demands more occupancy than a split of {}/{} entries can give",
                config.fairness_threshold, leaf_entries, internal_entries
            )));
        }

        Ok(Tree {
            variant: config.variant,
            dimensions,
            page_size,
            leaf_entries,
            internal_entries,
            fairness: config.fairness_threshold,
            heapfile: Heapfile::new(&config.path, page_size),
            state: RwLock::new(TreeState {
                frames: BTreeMap::new(),
                swap: Swap::new(config.swap_capacity),
                tick: 0,
                root_cover: match config.variant {
                    TreeVariant::Spatial => Cover::empty_box(dimensions),
                    TreeVariant::Graph => Cover::empty_range(),
                },
                page_count,
                indexed_records,
                dirty: false,
                io_reads: 0,
            }),
            closed: AtomicBool::new(false),
        })
    }

    // --- geometry accessors ---

    /// Spatial or graph
    pub fn variant(&self) -> TreeVariant {
        self.variant
    }

    /// Dimensionality of keys
    pub fn dimensions(&self) -> u16 {
        self.dimensions
    }

    /// Page size in bytes
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Maximum records per leaf
    pub fn leaf_entries(&self) -> u32 {
        self.leaf_entries
    }

    /// Maximum children per internal page
    pub fn internal_entries(&self) -> u32 {
        self.internal_entries
    }

    /// Cover of the whole tree: the root bounding box (spatial) or the
    /// root source-id range (graph)
    pub fn root_cover(&self) -> Cover {
        self.state.read().root_cover.clone()
    }

    /// Counters describing the tree
    pub fn stats(&self) -> TreeStats {
        let st = self.state.read();
        TreeStats {
            page_count: st.page_count,
            indexed_records: st.indexed_records,
            resident_pages: st.frames.len(),
            io_reads: st.io_reads,
        }
    }

    pub(crate) fn layout(&self) -> Layout {
        Layout {
            variant: self.variant,
            dimensions: self.dimensions,
            page_size: self.page_size,
            leaf_entries: self.leaf_entries,
            internal_entries: self.internal_entries,
        }
    }

    /// ⌈α·L/2⌉: fewest records a non-root leaf may keep
    pub(crate) fn min_leaf_occupancy(&self) -> u32 {
        (self.fairness * self.leaf_entries as f64 / 2.0).ceil() as u32
    }

    /// ⌈α·m/2⌉: fewest children a non-root internal page may keep
    pub(crate) fn min_internal_occupancy(&self) -> u32 {
        (self.fairness * self.internal_entries as f64 / 2.0).ceil() as u32
    }

    pub(crate) fn fairness(&self) -> f64 {
        self.fairness
    }

    pub(crate) fn new_leaf_page(&self) -> Page {
        match self.variant {
            TreeVariant::Spatial => Page::spatial_leaf(),
            TreeVariant::Graph => Page::graph_leaf(),
        }
    }

    pub(crate) fn new_internal_page(&self) -> Page {
        match self.variant {
            TreeVariant::Spatial => Page::spatial_internal(),
            TreeVariant::Graph => Page::graph_internal(),
        }
    }

    // --- page cache ---

    /// Fetch a page, reading it from disk if it is not resident.
    ///
    /// Touching the swap may evict some other page, which is flushed
    /// after the tree-lock is released. Loading the root also refreshes
    /// the tree's cached root cover.
    pub(crate) fn load_page(&self, id: PageId) -> Result<Frame> {
        // fast path: already resident
        let resident = self.state.read().frames.get(&id).cloned();
        if let Some(frame) = resident {
            let evicted = {
                let mut st = self.state.write();
                if st.frames.contains_key(&id) {
                    st.touch(id)
                } else {
                    None
                }
            };
            if let Some(victim) = evicted {
                self.flush_page(victim)?;
            }
            return Ok(frame);
        }

        // cold path: read and deserialize outside any lock
        let block = self.heapfile.read_block(id)?;
        let loaded = page::deserialize_page(&block, &self.layout(), id)?;
        debug!("loaded block {} with {} records", id, loaded.records(self.dimensions));

        let (frame, evicted) = {
            let mut st = self.state.write();
            st.io_reads += 1;
            let frame = match st.frames.get(&id) {
                // lost an install race; the other copy wins
                Some(existing) => existing.clone(),
                None => {
                    let frame: Frame = Arc::new(RwLock::new(loaded));
                    st.frames.insert(id, frame.clone());
                    frame
                }
            };
            let evicted = st.touch(id);
            (frame, evicted)
        };
        if let Some(victim) = evicted {
            self.flush_page(victim)?;
        }
        if id.is_root() {
            self.refresh_root_cover()?;
        }
        Ok(frame)
    }

    /// Write a page out if dirty and drop it from residency.
    pub(crate) fn flush_page(&self, id: PageId) -> Result<()> {
        let frame = self.state.read().frames.get(&id).cloned();
        let frame = match frame {
            Some(frame) => frame,
            None => {
                warn!("block {} has already been flushed", id);
                return Ok(());
            }
        };

        // hold the page write lock across the disk write and the
        // de-registration so no reader can observe half a flush
        let mut page = frame.write();
        if page.dirty {
            let block = page::serialize_page(&page, &self.layout(), id)?;
            self.heapfile.write_block(id, &block)?;
            page.dirty = false;
        }
        let mut st = self.state.write();
        st.frames.remove(&id);
        st.swap.unset_priority(id);
        Ok(())
    }

    /// Install a freshly built page at `id`, replacing any resident
    /// frame there, and give it a fresh swap entry.
    pub(crate) fn install_page(&self, id: PageId, page: Page) -> Result<Frame> {
        let (frame, evicted) = {
            let mut st = self.state.write();
            let frame: Frame = Arc::new(RwLock::new(page));
            st.frames.insert(id, frame.clone());
            let evicted = st.touch(id);
            (frame, evicted)
        };
        if let Some(victim) = evicted {
            self.flush_page(victim)?;
        }
        Ok(frame)
    }

    /// Drop a page from residency without writing it (used when its
    /// contents move elsewhere or die with a cascade).
    pub(crate) fn discard_page(&self, id: PageId) -> Option<Frame> {
        let mut st = self.state.write();
        let frame = st.frames.remove(&id);
        st.swap.unset_priority(id);
        frame
    }

    /// Move a resident frame from one id to another without touching
    /// its contents (a one-page transposition).
    pub(crate) fn rekey_resident(&self, from: PageId, to: PageId) -> Result<Frame> {
        let (frame, evicted) = {
            let mut st = self.state.write();
            let frame = st
                .frames
                .remove(&from)
                .unwrap_or_else(|| panic!("re-key of non-resident block {}", from));
            st.swap.unset_priority(from);
            st.frames.insert(to, frame.clone());
            let evicted = st.touch(to);
            (frame, evicted)
        };
        if let Some(victim) = evicted {
            self.flush_page(victim)?;
        }
        Ok(frame)
    }

    /// Record count of the page at `id`
    pub(crate) fn page_records(&self, id: PageId) -> Result<u32> {
        let frame = self.load_page(id)?;
        let records = frame.read().records(self.dimensions);
        Ok(records)
    }

    // --- structure maintenance ---

    /// Walk from `id` toward the root expanding each parent slot to
    /// cover its child's contents, stopping at the first ancestor that
    /// already covers; refreshes the cached root cover when the walk
    /// reaches the top.
    pub(crate) fn update_upwards(&self, mut id: PageId) -> Result<()> {
        while !id.is_root() {
            let parent_id = id.parent(self.internal_entries);
            let slot = id.slot(self.internal_entries);

            let child = self.load_page(id)?;
            let cover = child.read().contents_cover(self.dimensions);

            let parent = self.load_page(parent_id)?;
            let changed = {
                let mut p = parent.write();
                let changed = p.expand_slot(slot, self.dimensions, &cover);
                if changed {
                    p.dirty = true;
                }
                changed
            };
            if !changed {
                return Ok(());
            }
            self.state.write().dirty = true;
            id = parent_id;
        }
        self.refresh_root_cover()
    }

    /// Expand the cached root cover to the root page's contents
    pub(crate) fn refresh_root_cover(&self) -> Result<()> {
        let root = self.load_page(PageId::ROOT)?;
        let cover = root.read().contents_cover(self.dimensions);
        let mut st = self.state.write();
        if st.root_cover.expand(&cover) {
            st.dirty = true;
        }
        Ok(())
    }

    /// Replace the cached root cover outright (root collapse)
    pub(crate) fn replace_root_cover(&self, cover: Cover) {
        let mut st = self.state.write();
        st.root_cover = cover;
        st.dirty = true;
    }

    // --- point lookups (spatial) ---

    /// Any object stored under `key`, or `KeyNotFound`
    pub fn find_any(&self, key: &[Coord]) -> Result<ObjectId> {
        self.lookup(key, true)?
            .into_iter()
            .next()
            .ok_or(StorageError::KeyNotFound)
    }

    /// Every object stored under `key` (duplicates included)
    pub fn find_all(&self, key: &[Coord]) -> Result<Vec<ObjectId>> {
        self.lookup(key, false)
    }

    fn lookup(&self, key: &[Coord], first_only: bool) -> Result<Vec<ObjectId>> {
        assert_eq!(self.variant, TreeVariant::Spatial, "point lookup on a graph tree");
        assert_eq!(key.len(), self.dimensions as usize, "key dimensionality mismatch");

        let mut results = Vec::new();
        let mut stack = vec![PageId::ROOT];
        while let Some(id) = stack.pop() {
            let frame = self.load_page(id)?;
            let page = frame.read();
            match &page.node {
                PageNode::SpatialLeaf { .. } => {
                    for i in 0..page.records(self.dimensions) {
                        if crate::geometry::equal_keys(self.page_key(&page, i), key) {
                            results.push(page.point_object(i));
                            if first_only {
                                return Ok(results);
                            }
                        }
                    }
                }
                PageNode::SpatialInternal { .. } => {
                    for slot in 0..page.records(self.dimensions) {
                        if let Cover::Box(bbox) = page.slot_cover(slot, self.dimensions) {
                            if key_in_box(key, &bbox) {
                                stack.push(id.child(self.internal_entries, slot));
                            }
                        }
                    }
                }
                _ => unreachable!("graph page in a spatial tree"),
            }
        }
        Ok(results)
    }

    fn page_key<'p>(&self, page: &'p Page, i: u32) -> &'p [Coord] {
        page.point_key(i, self.dimensions)
    }

    // --- lifecycle ---

    /// Write every dirty page in ascending id order, then the tree
    /// header if its scalars changed. Idempotent: a second flush with
    /// no intervening writes touches nothing.
    pub fn flush(&self) -> Result<()> {
        let ids: Vec<PageId> = self.state.read().frames.keys().copied().collect();
        for id in ids {
            let frame = self.state.read().frames.get(&id).cloned();
            if let Some(frame) = frame {
                let mut page = frame.write();
                if page.dirty {
                    let block = page::serialize_page(&page, &self.layout(), id)?;
                    self.heapfile.write_block(id, &block)?;
                    page.dirty = false;
                }
            }
        }

        let header = {
            let st = self.state.read();
            if !st.dirty {
                return Ok(());
            }
            HeapfileHeader {
                dimensions: self.dimensions,
                page_size: self.page_size,
                page_count: st.page_count,
                indexed_records: st.indexed_records,
            }
        };
        self.heapfile.write_header(&header)?;
        self.state.write().dirty = false;
        Ok(())
    }

    /// Flush, tear down all residency, and delete the heapfile if the
    /// tree indexes nothing.
    pub fn close(self) -> Result<()> {
        self.flush()?;
        let empty = {
            let mut st = self.state.write();
            st.frames.clear();
            st.swap.clear();
            st.indexed_records == 0
        };
        self.closed.store(true, Ordering::Relaxed);
        if empty {
            info!(
                "deleting heapfile {}: it indexes no data",
                self.heapfile.path().display()
            );
            self.heapfile.remove()?;
        }
        Ok(())
    }

    /// Breadth-first iterator over the pages of the subtree rooted at
    /// `id`; see [`SubtreeIter`] for the lock discipline.
    pub fn iter_subtree(&self, id: PageId) -> SubtreeIter<'_> {
        SubtreeIter::new(self, id)
    }

    // --- test support ---

    #[cfg(test)]
    pub(crate) fn resident_ids(&self) -> Vec<PageId> {
        self.state.read().frames.keys().copied().collect()
    }

    /// Frame map and swap must track the same id set whenever the
    /// tree-lock is free
    #[cfg(test)]
    pub(crate) fn assert_cache_parity(&self) {
        let st = self.state.read();
        let mut frames: Vec<PageId> = st.frames.keys().copied().collect();
        let mut swapped: Vec<PageId> = st.swap.active_ids().collect();
        frames.sort_unstable();
        swapped.sort_unstable();
        assert_eq!(frames, swapped, "frame map and swap diverged");
    }
}

impl Drop for Tree {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Relaxed) {
            if let Err(err) = self.flush() {
                warn!("flush on drop failed: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spatial_config(dir: &tempfile::TempDir, page_size: u32, dims: u16) -> Config {
        Config::spatial(dir.path().join("test.db"), dims).page_size(page_size)
    }

    #[test]
    fn test_create_rejects_degenerate_configs() {
        let dir = tempdir().unwrap();

        // α so small the minimum occupancy drops below two records
        let config = spatial_config(&dir, 4096, 2).fairness_threshold(0.01);
        assert!(matches!(
            Tree::create(config),
            Err(StorageError::ConfigRejected(_))
        ));

        // page too small to hold two entries
        let config = spatial_config(&dir, 40, 2);
        assert!(matches!(
            Tree::create(config),
            Err(StorageError::ConfigRejected(_))
        ));

        // α out of range
        let config = spatial_config(&dir, 4096, 2).fairness_threshold(1.5);
        assert!(matches!(
            Tree::create(config),
            Err(StorageError::ConfigRejected(_))
        ));
    }

    #[test]
    fn test_create_close_deletes_empty_heapfile() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let tree = Tree::create(Config::spatial(&path, 2)).unwrap();
        assert!(path.exists());
        tree.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_create_reopen_preserves_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let tree = Tree::create(Config::spatial(&path, 3).page_size(256)).unwrap();
            tree.insert(&[1.0, 2.0, 3.0], 42).unwrap();
            tree.close().unwrap();
        }

        let tree = Tree::open(Config::spatial(&path, 3)).unwrap();
        assert_eq!(tree.dimensions(), 3);
        assert_eq!(tree.page_size(), 256);
        assert_eq!(tree.stats().indexed_records, 1);
        assert_eq!(tree.find_any(&[1.0, 2.0, 3.0]).unwrap(), 42);
    }

    #[test]
    fn test_open_missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        let config = Config::spatial(dir.path().join("absent.db"), 2);
        assert!(matches!(Tree::open(config), Err(StorageError::Io(_))));
    }

    #[test]
    fn test_flush_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let tree = Tree::create(Config::spatial(&path, 2).page_size(104)).unwrap();
        for i in 0..4 {
            tree.insert(&[i as f32, i as f32], i).unwrap();
        }

        tree.flush().unwrap();
        let first = std::fs::read(&path).unwrap();
        tree.flush().unwrap();
        let second = std::fs::read(&path).unwrap();
        assert_eq!(first, second);

        // nothing stays dirty after a flush
        let st = tree.state.read();
        for (id, frame) in st.frames.iter() {
            assert!(!frame.read().dirty, "page {} still dirty after flush", id);
        }
        assert!(!st.dirty);
    }

    #[test]
    fn test_eviction_is_transparent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        // tiny swap so the workload thrashes residency
        let config = Config::spatial(&path, 2).page_size(104).swap_capacity(4);
        let tree = Tree::create(config).unwrap();

        let n = 40u64;
        for i in 0..n {
            tree.insert(&[i as f32, (i * 3 % 17) as f32], i).unwrap();
        }
        let reads_before = tree.stats().io_reads;
        for i in 0..n {
            assert_eq!(tree.find_any(&[i as f32, (i * 3 % 17) as f32]).unwrap(), i);
        }
        let reads_after = tree.stats().io_reads;
        assert!(reads_after >= reads_before);
        assert!(tree.stats().resident_pages <= 4);
        tree.assert_cache_parity();
    }

    #[test]
    fn test_cache_parity_through_workload() {
        let dir = tempdir().unwrap();
        let config = spatial_config(&dir, 104, 2).swap_capacity(3);
        let tree = Tree::create(config).unwrap();
        for i in 0..30 {
            tree.insert(&[i as f32, -(i as f32)], i).unwrap();
            tree.assert_cache_parity();
        }
        for i in 0..30 {
            tree.delete(&[i as f32, -(i as f32)]).unwrap();
            tree.assert_cache_parity();
        }
    }
}
