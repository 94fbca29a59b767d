//! Breadth-first iteration over a subtree's pages.

use std::collections::VecDeque;

use parking_lot::RwLockReadGuard;

use crate::error::Result;
use crate::page::Page;
use crate::types::PageId;

use super::{Frame, Tree};

/// A loaded page handed out by [`SubtreeIter`].
///
/// The guard keeps the frame alive; `read()` takes the per-page lock
/// for shared access. Drop the guard before advancing the iterator:
/// the next page load may evict and flush this one, which must wait for
/// its lock to clear. A `for` loop drops each item before the next
/// `next()` call, which is exactly the required discipline.
pub struct PageGuard {
    id: PageId,
    frame: Frame,
}

impl PageGuard {
    /// Id of the page this guard holds
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Shared access to the page contents
    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.frame.read()
    }
}

/// Breadth-first page iterator rooted at an arbitrary page id
pub struct SubtreeIter<'t> {
    tree: &'t Tree,
    queue: VecDeque<PageId>,
}

impl<'t> SubtreeIter<'t> {
    pub(crate) fn new(tree: &'t Tree, root: PageId) -> Self {
        let mut queue = VecDeque::new();
        queue.push_back(root);
        Self { tree, queue }
    }
}

impl Iterator for SubtreeIter<'_> {
    type Item = Result<PageGuard>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.queue.pop_front()?;
        let frame = match self.tree.load_page(id) {
            Ok(frame) => frame,
            Err(err) => return Some(Err(err)),
        };
        {
            let page = frame.read();
            if !page.is_leaf() {
                let m = self.tree.internal_entries();
                for slot in 0..page.records(self.tree.dimensions()) {
                    self.queue.push_back(id.child(m, slot));
                }
            }
        }
        Some(Ok(PageGuard { id, frame }))
    }
}
