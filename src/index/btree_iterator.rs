use std::sync::Arc;

use crate::buffer::{BufferPoolManager, PageGuard};
use crate::common::{PageId, RecordId, Result, INVALID_PAGE_ID};

use super::btree_page::BTreeNodeRef;

/// Forward iterator over the leaf chain. Holds a basic (pin-only) guard
/// on the current leaf plus an index into it; advancing past the last
/// entry releases the guard and follows `next_page_id`. The iterator is
/// exhausted once its page id is `INVALID_PAGE_ID`.
pub struct BTreeIterator {
    bpm: Arc<BufferPoolManager>,
    guard: Option<PageGuard>,
    index: usize,
}

impl BTreeIterator {
    pub(crate) fn new(bpm: Arc<BufferPoolManager>, guard: PageGuard, index: usize) -> Self {
        Self {
            bpm,
            guard: Some(guard),
            index,
        }
    }

    /// The exhausted iterator.
    pub(crate) fn end(bpm: Arc<BufferPoolManager>) -> Self {
        Self {
            bpm,
            guard: None,
            index: 0,
        }
    }

    pub fn is_end(&self) -> bool {
        self.guard.is_none()
    }

    pub fn page_id(&self) -> PageId {
        self.guard
            .as_ref()
            .map(|g| g.page_id())
            .unwrap_or(INVALID_PAGE_ID)
    }

    /// Yields the entry at the current position and advances, following
    /// the leaf chain as pages run out.
    pub fn next_entry(&mut self) -> Result<Option<(u32, RecordId)>> {
        loop {
            let Some(guard) = &self.guard else {
                return Ok(None);
            };

            let index = self.index;
            let (entry, next_page_id) = guard.with_data(|data| {
                let node = BTreeNodeRef::new(data);
                if index < node.size() {
                    (Some((node.key_at(index), node.rid_at(index))), INVALID_PAGE_ID)
                } else {
                    (None, node.next_page_id())
                }
            });

            if let Some(entry) = entry {
                self.index += 1;
                return Ok(Some(entry));
            }

            // Old guard goes first; the next leaf is pinned fresh
            self.guard = None;
            self.index = 0;
            if next_page_id == INVALID_PAGE_ID {
                return Ok(None);
            }
            self.guard = Some(self.bpm.fetch_page_basic(next_page_id)?);
        }
    }
}

impl Iterator for BTreeIterator {
    type Item = Result<(u32, RecordId)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
