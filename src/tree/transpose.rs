//! Subtree transposition: atomic renumber of a subtree from one id to
//! another.
//!
//! Page ids encode position in the implicit heap, so reseating a
//! subtree under a new parent slot renumbers every descendant. The
//! walk de-registers each source page from the cache and swap under
//! the tree-lock write mode before anything observes the new ids; a
//! reader that held the old id fails its next lookup and restarts from
//! the root. The collected (destination, page) changes are drained by
//! [`Tree::dump_changes`] only after the whole walk finishes: every
//! source page is in memory by then, so ascending-order overwrites of
//! reused disk blocks cannot clobber unread content.

use std::collections::VecDeque;

use log::info;

use crate::error::Result;
use crate::page::{self, Page};
use crate::types::PageId;

use super::Tree;

impl Tree {
    /// Renumber the subtree rooted at `from` so that every descendant
    /// acquires the id it would have had if `from` had been `to` from
    /// the start. Returns the dislodged pages keyed by their new ids,
    /// each marked dirty; the subtree is no longer resident when this
    /// returns.
    pub(crate) fn transpose_subtree(
        &self,
        from: PageId,
        to: PageId,
    ) -> Result<Vec<(PageId, Page)>> {
        let m = self.internal_entries();
        let mut changes: Vec<(PageId, Page)> = Vec::new();
        let mut original: VecDeque<PageId> = VecDeque::new();
        let mut transposed: VecDeque<PageId> = VecDeque::new();
        original.push_back(from);
        transposed.push_back(to);

        while let Some(source) = original.pop_front() {
            let dest = transposed
                .pop_front()
                .expect("transposition queues diverged");
            if source == dest {
                continue;
            }
            info!("block {} will be transposed to {}", source, dest);

            let frame = self.load_page(source)?;
            let removed = self.discard_page(source);
            assert!(
                removed.is_some(),
                "block {} vanished during transposition",
                source
            );

            let mut page = frame.write();
            page.dirty = true;
            if !page.is_leaf() {
                for slot in 0..page.records(self.dimensions()) {
                    original.push_back(source.child(m, slot));
                    transposed.push_back(dest.child(m, slot));
                }
            }
            changes.push((dest, page.clone()));
        }
        assert!(transposed.is_empty(), "transposition queues diverged");

        Ok(changes)
    }

    /// Drain transposition changes in ascending destination order,
    /// writing each page to disk at its new offset and dropping it.
    ///
    /// This is the dump-transposed-pages policy; reinstalling the pages
    /// in the cache under their new ids would be equally correct, but
    /// every structural-change site wants the flush-ordered dump.
    pub(crate) fn dump_changes(&self, mut changes: Vec<(PageId, Page)>) -> Result<()> {
        changes.sort_by_key(|(id, _)| *id);
        for (id, mut page) in changes {
            {
                let st = self.state.read();
                assert!(
                    !st.frames.contains_key(&id) && !st.swap.is_active(id),
                    "transposed block {} is still registered under its destination",
                    id
                );
            }
            page.dirty = false;
            let block = page::serialize_page(&page, &self.layout(), id)?;
            self.heapfile.write_block(id, &block)?;
        }
        Ok(())
    }
}
